//! A single document's CRDT state: one `yrs::Doc` behind a narrow interface.

use collab_types::{ClResult, Error};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, Transact, Update};

use crate::blob::{StateVector, UpdateBlob};

/// An in-memory CRDT replica for one document.
///
/// Not `Clone`: a Hub owns exactly one `Replica` for the lifetime of the
/// document; concurrent access is serialized by the Hub's own lock, not by
/// this type.
#[derive(Debug)]
pub struct Replica {
	doc: Doc,
}

impl Default for Replica {
	fn default() -> Self {
		Self::new()
	}
}

impl Replica {
	pub fn new() -> Self {
		Self { doc: Doc::new() }
	}

	/// Rebuild a replica from a sequence of previously-applied updates,
	/// e.g. when reattaching to a document that peer instances already hold.
	pub fn from_updates(updates: impl IntoIterator<Item = UpdateBlob>) -> ClResult<Self> {
		let replica = Self::new();
		for blob in updates {
			replica.apply(&blob)?;
		}
		Ok(replica)
	}

	pub fn state_vector(&self) -> StateVector {
		let txn = self.doc.transact();
		StateVector::from_bytes(txn.state_vector().encode_v1())
	}

	/// All operations the peer (described by `peer_vector`) is missing.
	pub fn encode_diff(&self, peer_vector: &StateVector) -> ClResult<UpdateBlob> {
		let sv = yrs::StateVector::decode_v1(peer_vector.as_bytes()).map_err(|_| Error::CorruptUpdate)?;
		let txn = self.doc.transact();
		Ok(UpdateBlob::from_bytes(txn.encode_state_as_update_v1(&sv)))
	}

	/// Apply an update blob to this replica. Idempotent: re-applying an
	/// already-known update is a no-op at the CRDT level.
	pub fn apply(&self, blob: &UpdateBlob) -> ClResult<()> {
		let update = Update::decode_v1(blob.as_bytes()).map_err(|_| Error::CorruptUpdate)?;
		let mut txn = self.doc.transact_mut();
		txn.apply_update(update).map_err(|_| Error::CorruptUpdate)?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use yrs::{Text, WriteTxn};

	fn write_text(replica: &Replica, value: &str) -> UpdateBlob {
		let before = replica.state_vector();
		{
			let mut txn = replica.doc.transact_mut();
			let text = txn.get_or_insert_text("body");
			text.push(&mut txn, value);
		}
		replica.encode_diff(&before).unwrap_or_else(|_| UpdateBlob::from_bytes(Vec::new()))
	}

	#[test]
	fn diff_against_empty_vector_contains_full_state() {
		let replica = Replica::new();
		let update = write_text(&replica, "hello");
		assert!(!update.is_empty());
	}

	#[test]
	fn applying_a_diff_converges_two_replicas() {
		let a = Replica::new();
		let update = write_text(&a, "hello");

		let b = Replica::new();
		b.apply(&update).expect("update applies cleanly");

		assert_eq!(a.state_vector(), b.state_vector());
		assert!(b.encode_diff(&a.state_vector()).unwrap().is_empty());
	}

	#[test]
	fn catch_up_via_step1_step2() {
		let server = Replica::new();
		write_text(&server, "a");
		write_text(&server, "b");

		let joining = Replica::new();
		let joining_vector = joining.state_vector();
		let diff = server.encode_diff(&joining_vector).expect("diff computes");
		joining.apply(&diff).expect("catch-up update applies");

		assert_eq!(server.state_vector(), joining.state_vector());
	}

	#[test]
	fn corrupt_update_is_rejected_without_poisoning_the_replica() {
		let replica = Replica::new();
		let bogus = UpdateBlob::from_bytes(vec![0xff, 0x00, 0x01]);
		assert!(replica.apply(&bogus).is_err());

		// replica is still usable afterwards
		let update = write_text(&replica, "still works");
		assert!(!update.is_empty());
	}
}

// vim: ts=4
