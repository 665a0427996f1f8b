//! Opaque byte wrappers exchanged across the Sync and Awareness protocols.

/// Encoded CRDT operations (Yjs v1 update format). Composable and
/// commutative at the CRDT semantic level; never inspected outside this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateBlob(pub(crate) Box<[u8]>);

impl UpdateBlob {
	pub fn from_bytes(bytes: impl Into<Box<[u8]>>) -> Self {
		Self(bytes.into())
	}

	pub fn as_bytes(&self) -> &[u8] {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn into_bytes(self) -> Box<[u8]> {
		self.0
	}
}

/// Encoded summary of "what I already have", used to compute diffs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateVector(pub(crate) Box<[u8]>);

impl StateVector {
	pub fn from_bytes(bytes: impl Into<Box<[u8]>>) -> Self {
		Self(bytes.into())
	}

	pub fn as_bytes(&self) -> &[u8] {
		&self.0
	}
}

/// Encoded awareness delta (JSON array of per-client entries).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessBlob(pub(crate) Box<[u8]>);

impl AwarenessBlob {
	pub fn from_bytes(bytes: impl Into<Box<[u8]>>) -> Self {
		Self(bytes.into())
	}

	pub fn as_bytes(&self) -> &[u8] {
		&self.0
	}
}

// vim: ts=4
