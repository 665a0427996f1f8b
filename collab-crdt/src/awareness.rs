//! Presence ("awareness") table: `ClientId -> (clock, state)`.
//!
//! Not CRDT state in the `yrs` sense — just a last-writer-wins map keyed by
//! a per-client monotonic clock, matching the semantics `y-protocols`
//! awareness uses, encoded here as JSON rather than the Yjs binary wire
//! format (see DESIGN.md).

use std::collections::HashMap;

use collab_types::{ClResult, ClientId, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::blob::AwarenessBlob;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessEntry {
	pub clock: u32,
	/// `None` means "logged off" / removed.
	pub state: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct AwarenessMerge {
	/// ClientIds that were added, updated, or removed by this merge.
	pub changed: Vec<ClientId>,
}

impl AwarenessMerge {
	pub fn is_empty(&self) -> bool {
		self.changed.is_empty()
	}
}

#[derive(Debug, Default)]
pub struct AwarenessTable {
	entries: HashMap<ClientId, AwarenessEntry>,
}

impl AwarenessTable {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn snapshot(&self) -> Vec<(ClientId, AwarenessEntry)> {
		self.entries.iter().map(|(id, entry)| (*id, entry.clone())).collect()
	}

	/// Merge incoming entries, accepting only strictly newer clocks (or
	/// brand-new client ids). Entries whose state is `None` at an accepted
	/// clock are removed rather than stored.
	pub fn merge(&mut self, updates: impl IntoIterator<Item = (ClientId, AwarenessEntry)>) -> AwarenessMerge {
		let mut changed = Vec::new();
		for (id, incoming) in updates {
			let accept = match self.entries.get(&id) {
				Some(existing) => incoming.clock > existing.clock,
				None => true,
			};
			if !accept {
				continue;
			}
			if incoming.state.is_none() {
				self.entries.remove(&id);
			} else {
				self.entries.insert(id, incoming);
			}
			changed.push(id);
		}
		AwarenessMerge { changed }
	}

	/// Remove the given client ids unconditionally (used when a socket
	/// disconnects and its awareness entries must be retracted).
	pub fn remove_all(&mut self, ids: &[ClientId]) -> AwarenessMerge {
		let mut changed = Vec::new();
		for id in ids {
			if self.entries.remove(id).is_some() {
				changed.push(*id);
			}
		}
		AwarenessMerge { changed }
	}

	pub fn encode(entries: &[(ClientId, AwarenessEntry)]) -> AwarenessBlob {
		let wire: Vec<WireEntry> = entries
			.iter()
			.map(|(id, entry)| WireEntry { client_id: id.0, clock: entry.clock, state: entry.state.clone() })
			.collect();
		let bytes = serde_json::to_vec(&wire).unwrap_or_default();
		AwarenessBlob::from_bytes(bytes)
	}

	pub fn encode_removal(ids: &[ClientId]) -> AwarenessBlob {
		let entries: Vec<_> = ids.iter().map(|id| (*id, AwarenessEntry { clock: u32::MAX, state: None })).collect();
		Self::encode(&entries)
	}

	pub fn decode(blob: &AwarenessBlob) -> ClResult<Vec<(ClientId, AwarenessEntry)>> {
		let wire: Vec<WireEntry> = serde_json::from_slice(blob.as_bytes())
			.map_err(|e| Error::Protocol(format!("malformed awareness frame: {e}")))?;
		Ok(wire
			.into_iter()
			.map(|w| (ClientId(w.client_id), AwarenessEntry { clock: w.clock, state: w.state }))
			.collect())
	}
}

#[derive(Debug, Serialize, Deserialize)]
struct WireEntry {
	client_id: u32,
	clock: u32,
	state: Option<Value>,
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn entry(clock: u32, state: Option<Value>) -> AwarenessEntry {
		AwarenessEntry { clock, state }
	}

	#[test]
	fn newer_clock_overwrites_older() {
		let mut table = AwarenessTable::new();
		let id = ClientId(1);
		table.merge([(id, entry(1, Some(json!({"cursor": 1}))))]);
		let merge = table.merge([(id, entry(2, Some(json!({"cursor": 2}))))]);
		assert_eq!(merge.changed, vec![id]);
		assert_eq!(table.snapshot()[0].1.clock, 2);
	}

	#[test]
	fn stale_clock_is_ignored() {
		let mut table = AwarenessTable::new();
		let id = ClientId(1);
		table.merge([(id, entry(5, Some(json!({}))))]);
		let merge = table.merge([(id, entry(3, Some(json!({}))))]);
		assert!(merge.is_empty());
		assert_eq!(table.snapshot()[0].1.clock, 5);
	}

	#[test]
	fn null_state_removes_entry() {
		let mut table = AwarenessTable::new();
		let id = ClientId(1);
		table.merge([(id, entry(1, Some(json!({}))))]);
		table.merge([(id, entry(2, None))]);
		assert!(table.is_empty());
	}

	#[test]
	fn round_trips_through_wire_encoding() {
		let id = ClientId(7);
		let entries = vec![(id, entry(4, Some(json!({"color": "red"}))))];
		let blob = AwarenessTable::encode(&entries);
		let decoded = AwarenessTable::decode(&blob).expect("decodes");
		assert_eq!(decoded, entries);
	}
}

// vim: ts=4
