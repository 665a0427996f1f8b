//! Authenticated identity produced by the Auth Gate.

use serde::{Deserialize, Serialize};

/// An authenticated caller, extracted from a validated JWT.
///
/// Opaque to everything downstream of the Auth Gate except for
/// `may_open`, which inspects `permissions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
	pub user_id: Box<str>,
	pub username: Box<str>,
	#[serde(default)]
	pub permissions: Box<[Box<str>]>,
	pub exp: i64,
}

impl Principal {
	/// Whether this principal carries a blanket permission or one scoped to `document_id`.
	pub fn may_open(&self, document_id: &str, default_open: bool) -> bool {
		if self.permissions.is_empty() {
			return default_open;
		}
		self.permissions.iter().any(|p| {
			p.as_ref() == "*" || p.as_ref() == document_id || p.as_ref() == format!("doc:{document_id}")
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn principal(permissions: &[&str]) -> Principal {
		Principal {
			user_id: "u1".into(),
			username: "alice".into(),
			permissions: permissions.iter().map(|p| (*p).into()).collect(),
			exp: 0,
		}
	}

	#[test]
	fn empty_permissions_defer_to_default_policy() {
		let p = principal(&[]);
		assert!(p.may_open("doc1", true));
		assert!(!p.may_open("doc1", false));
	}

	#[test]
	fn wildcard_permission_opens_any_document() {
		let p = principal(&["*"]);
		assert!(p.may_open("doc1", false));
	}

	#[test]
	fn scoped_permission_only_opens_named_document() {
		let p = principal(&["doc:doc1"]);
		assert!(p.may_open("doc1", false));
		assert!(!p.may_open("doc2", false));
	}
}

// vim: ts=4
