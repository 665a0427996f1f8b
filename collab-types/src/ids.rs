//! Identifiers for documents, clients and server instances.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

const MAX_DOCUMENT_ID_LEN: usize = 100;
const FALLBACK_DOCUMENT_ID: &str = "default";

/// Validated document identifier.
///
/// Raw input is accepted from a URL path segment; anything that isn't a
/// non-empty run of `[A-Za-z0-9_-]` of at most 100 chars is coerced to the
/// literal `default` rather than rejected, so a malformed path always lands
/// clients on a deterministic, shared document instead of failing to connect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(Box<str>);

impl DocumentId {
	pub fn parse(raw: &str) -> Self {
		let valid = !raw.is_empty()
			&& raw.len() <= MAX_DOCUMENT_ID_LEN
			&& raw.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');

		if valid {
			Self(raw.into())
		} else {
			Self(FALLBACK_DOCUMENT_ID.into())
		}
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for DocumentId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Client identifier, unique within a single Document Hub.
///
/// Issued by the Hub on registration from a per-hub monotonic counter;
/// never reused for the lifetime of that hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u32);

impl fmt::Display for ClientId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Per-hub counter handing out fresh, never-reused `ClientId`s.
#[derive(Debug, Default)]
pub struct ClientIdAllocator(AtomicU32);

impl ClientIdAllocator {
	pub fn next(&self) -> ClientId {
		ClientId(self.0.fetch_add(1, Ordering::Relaxed))
	}
}

/// Stable per-process identifier, used to drop a server's own Bus echoes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceId(Box<str>);

impl InstanceId {
	pub fn new(raw: impl Into<Box<str>>) -> Self {
		Self(raw.into())
	}

	pub fn random() -> Self {
		Self(uuid::Uuid::new_v4().to_string().into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for InstanceId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn valid_document_id_is_kept() {
		assert_eq!(DocumentId::parse("doc-1_A").as_str(), "doc-1_A");
	}

	#[test]
	fn invalid_document_id_falls_back() {
		assert_eq!(DocumentId::parse("bad@id").as_str(), "default");
		assert_eq!(DocumentId::parse("").as_str(), "default");
		assert_eq!(DocumentId::parse(&"x".repeat(101)).as_str(), "default");
	}

	#[test]
	fn client_ids_never_repeat() {
		let allocator = ClientIdAllocator::default();
		let a = allocator.next();
		let b = allocator.next();
		assert_ne!(a, b);
		assert!(b.0 > a.0);
	}
}

// vim: ts=4
