//! Document Hub (C5): the in-memory authority for one document on this instance.
//!
//! All mutation of `replica`, `awareness` and `clients` happens under one
//! `tokio::sync::Mutex`, acquired only for bookkeeping — never across
//! client or Bus I/O, per the concurrency model. Outbound frames are
//! enqueued non-blockingly to each client's own channel; a client that
//! cannot keep up is closed, never the Hub.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use collab_bus::{Bus, BusEnvelope, EnvelopeKind};
use collab_crdt::{AwarenessEntry, AwarenessMerge, AwarenessTable, Replica, UpdateBlob};
use collab_types::prelude::*;
use collab_types::ids::ClientIdAllocator;
use tokio::sync::{mpsc, watch, Mutex};
use uuid::Uuid;

use crate::frame::{Frame, SyncMessage};
use crate::metrics::BusMetrics;

/// A close code/reason pair the writer task is asked to send verbatim, per
/// the standard WebSocket close codes of §7 (1001/1002/1003/1008).
pub type CloseReason = (u16, &'static str);
pub type CloseSignal = watch::Sender<Option<CloseReason>>;

/// Tag attached to a change so the Hub can tell "this came from one of my
/// own clients" from "this came off the Bus" without relying on CRDT-level
/// transaction origins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
	Client(ClientId),
	Bus,
}

pub struct Hub {
	pub doc_id: DocumentId,
	inner: Mutex<Inner>,
	bus: Arc<dyn Bus>,
	bus_metrics: Arc<BusMetrics>,
	instance_id: InstanceId,
	max_clients: usize,
	client_ids: ClientIdAllocator,
	last_active_ms: AtomicU64,
	created_at: Instant,
}

struct Inner {
	replica: Replica,
	awareness: AwarenessTable,
	clients: HashMap<ClientId, ClientHandle>,
}

struct ClientHandle {
	sender: mpsc::Sender<Vec<u8>>,
	close: CloseSignal,
	controlled: Vec<ClientId>,
}

#[derive(Debug, Clone)]
pub struct HubStats {
	pub clients: usize,
	pub awareness_entries: usize,
	pub size_bytes: usize,
}

impl Hub {
	pub fn new(doc_id: DocumentId, bus: Arc<dyn Bus>, bus_metrics: Arc<BusMetrics>, instance_id: InstanceId, max_clients: usize) -> Self {
		Self {
			doc_id,
			inner: Mutex::new(Inner { replica: Replica::new(), awareness: AwarenessTable::new(), clients: HashMap::new() }),
			bus,
			bus_metrics,
			instance_id,
			max_clients,
			client_ids: ClientIdAllocator::default(),
			last_active_ms: AtomicU64::new(now_ms()),
			created_at: Instant::now(),
		}
	}

	/// Register a new client. Returns its id plus the initial frames the
	/// Session Orchestrator must send: a Sync/Step1 with this replica's
	/// state vector, and, if any presence already exists, an Awareness frame.
	/// `close` is the Session Orchestrator's close-request channel: the Hub
	/// uses it to ask the client's writer to close the socket (slow
	/// consumer, shutdown drain) without itself touching the transport.
	pub async fn register(&self, sender: mpsc::Sender<Vec<u8>>, close: CloseSignal) -> ClResult<(ClientId, Vec<u8>, Option<Vec<u8>>)> {
		let mut inner = self.inner.lock().await;
		if inner.clients.len() >= self.max_clients {
			return Err(Error::HubFull);
		}

		let id = self.client_ids.next();
		inner.clients.insert(id, ClientHandle { sender, close, controlled: Vec::new() });
		self.touch();

		let step1 = Frame::Sync(SyncMessage::Step1(inner.replica.state_vector())).encode();
		let awareness = if inner.awareness.is_empty() {
			None
		} else {
			Some(Frame::Awareness(AwarenessTable::encode(&inner.awareness.snapshot())).encode())
		};
		Ok((id, step1, awareness))
	}

	/// Remove a client, retract any awareness it owned, and report whether
	/// the Hub is now empty (the caller arms the idle timer on `true`).
	pub async fn unregister(&self, id: ClientId) -> bool {
		let (removal_changed, remaining, overflowed) = {
			let mut inner = self.inner.lock().await;
			let controlled = inner.clients.remove(&id).map(|h| h.controlled).unwrap_or_default();
			let merge = if controlled.is_empty() { AwarenessMerge::default() } else { inner.awareness.remove_all(&controlled) };
			let overflowed = if merge.is_empty() {
				Vec::new()
			} else {
				let bytes = Frame::Awareness(AwarenessTable::encode_removal(&merge.changed)).encode();
				fanout_locked(&inner.clients, None, &bytes)
			};
			(merge.changed, inner.clients.len(), overflowed)
		};
		self.touch();
		self.close_overflowed(&overflowed);

		if !removal_changed.is_empty() {
			let envelope = self.build_envelope(EnvelopeKind::Awareness, AwarenessTable::encode_removal(&removal_changed).as_bytes().into(), None);
			match self.bus.publish(&envelope).await {
				Ok(()) => self.bus_metrics.record_sent(),
				Err(e) => {
					self.bus_metrics.record_error();
					warn!("failed to publish awareness removal for {}: {}", self.doc_id, e);
				}
			}
		}

		remaining == 0
	}

	/// Signals every connected client to close with `ErrShutdown` (§5, §7);
	/// actual socket teardown happens on each client's own writer task.
	pub async fn drain(&self) {
		let inner = self.inner.lock().await;
		for handle in inner.clients.values() {
			let _ = handle.close.send(Some((1001, "server shutting down")));
		}
	}

	fn close_overflowed(&self, overflowed: &[ClientId]) {
		for id in overflowed {
			warn!("client {id} outbound queue overflow in {}, closing (ErrSlowConsumer)", self.doc_id);
		}
	}

	/// Handle a Sync frame from a local client. Returns a frame to send
	/// back to that same client only (the Step2 answer to its Step1), if any.
	pub async fn handle_sync(&self, from: ClientId, msg: SyncMessage) -> ClResult<Option<Vec<u8>>> {
		match msg {
			SyncMessage::Step1(peer_vector) => {
				let inner = self.inner.lock().await;
				let diff = inner.replica.encode_diff(&peer_vector)?;
				self.touch();
				if diff.is_empty() {
					Ok(None)
				} else {
					Ok(Some(Frame::Sync(SyncMessage::Step2(diff)).encode()))
				}
			}
			SyncMessage::Step2(blob) | SyncMessage::Update(blob) => {
				self.apply_and_propagate(blob, Origin::Client(from)).await?;
				Ok(None)
			}
		}
	}

	/// Handle an Awareness frame from a local client `from`; its entries
	/// are added to `from`'s `controlled` set.
	pub async fn handle_awareness(&self, from: ClientId, blob: collab_crdt::AwarenessBlob) -> ClResult<()> {
		let entries = AwarenessTable::decode(&blob)?;
		let ids: Vec<ClientId> = entries.iter().map(|(id, _)| *id).collect();
		let by_id: HashMap<ClientId, AwarenessEntry> = entries.iter().cloned().collect();

		let (fanout_bytes, overflowed) = {
			let mut inner = self.inner.lock().await;
			let merge = inner.awareness.merge(entries);
			if merge.is_empty() {
				(None, Vec::new())
			} else {
				if let Some(handle) = inner.clients.get_mut(&from) {
					for id in &ids {
						if !handle.controlled.contains(id) {
							handle.controlled.push(*id);
						}
					}
				}
				let changed_entries: Vec<_> =
					merge.changed.iter().filter_map(|id| by_id.get(id).map(|e| (*id, e.clone()))).collect();
				let bytes = Frame::Awareness(AwarenessTable::encode(&changed_entries)).encode();
				let overflowed = fanout_locked(&inner.clients, Some(from), &bytes);
				(Some(bytes), overflowed)
			}
		};
		self.touch();
		self.close_overflowed(&overflowed);

		if let Some(bytes) = fanout_bytes {
			let envelope = self.build_envelope(EnvelopeKind::Awareness, bytes.into(), None);
			match self.bus.publish(&envelope).await {
				Ok(()) => self.bus_metrics.record_sent(),
				Err(e) => {
					self.bus_metrics.record_error();
					warn!("failed to publish awareness for {}: {}", self.doc_id, e);
				}
			}
		}
		Ok(())
	}

	/// Handle a delivery from the Bus: never republished, fanned out to
	/// every local client unconditionally (the instance that originated it
	/// already fanned out locally before publishing).
	pub async fn handle_bus(&self, envelope: BusEnvelope) -> ClResult<()> {
		if envelope.instance_id.as_str() == self.instance_id.as_str() {
			return Ok(()); // our own echo
		}
		self.bus_metrics.record_received();

		match envelope.kind {
			EnvelopeKind::Update => {
				// apply error on a Bus frame: drop the frame, count it, no cascade (§4.5).
				if let Err(e) = self.apply_and_propagate(UpdateBlob::from_bytes(envelope.payload), Origin::Bus).await {
					self.bus_metrics.record_error();
					warn!("dropping bus update for {}: {}", self.doc_id, e);
				}
			}
			EnvelopeKind::Awareness => {
				let blob = collab_crdt::AwarenessBlob::from_bytes(envelope.payload);
				let entries = AwarenessTable::decode(&blob)?;
				let overflowed = {
					let mut inner = self.inner.lock().await;
					let merge = inner.awareness.merge(entries);
					if merge.is_empty() {
						Vec::new()
					} else {
						let bytes = Frame::Awareness(blob).encode();
						fanout_locked(&inner.clients, None, &bytes)
					}
				};
				self.close_overflowed(&overflowed);
			}
		}
		self.touch();
		Ok(())
	}

	async fn apply_and_propagate(&self, blob: UpdateBlob, origin: Origin) -> ClResult<()> {
		let from_client = match origin {
			Origin::Client(id) => Some(id),
			Origin::Bus => None,
		};

		let overflowed = {
			let inner = self.inner.lock().await;
			inner.replica.apply(&blob)?;
			let frame_bytes = Frame::Sync(SyncMessage::Update(blob.clone())).encode();
			fanout_locked(&inner.clients, from_client, &frame_bytes)
		};
		self.close_overflowed(&overflowed);

		if matches!(origin, Origin::Client(_)) {
			let envelope = self.build_envelope(EnvelopeKind::Update, blob.into_bytes(), from_client.map(|c| c.to_string().into_boxed_str()));
			match self.bus.publish(&envelope).await {
				Ok(()) => self.bus_metrics.record_sent(),
				Err(e) => {
					self.bus_metrics.record_error();
					warn!("failed to publish update for {}: {}", self.doc_id, e);
				}
			}
		}
		Ok(())
	}

	fn build_envelope(&self, kind: EnvelopeKind, payload: Box<[u8]>, origin: Option<Box<str>>) -> BusEnvelope {
		BusEnvelope {
			document_id: self.doc_id.clone(),
			kind,
			payload,
			origin,
			instance_id: self.instance_id.clone(),
			message_id: Uuid::new_v4(),
			timestamp_ms: now_ms(),
			chunk: None,
		}
	}

	pub async fn stats(&self) -> HubStats {
		let inner = self.inner.lock().await;
		HubStats {
			clients: inner.clients.len(),
			awareness_entries: inner.awareness.snapshot().len(),
			size_bytes: inner.replica.state_vector().as_bytes().len(),
		}
	}

	pub async fn client_count(&self) -> usize {
		self.inner.lock().await.clients.len()
	}

	pub fn idle_for(&self) -> Duration {
		let last = self.last_active_ms.load(Ordering::Relaxed);
		let elapsed_ms = now_ms().saturating_sub(last);
		Duration::from_millis(elapsed_ms)
	}

	pub fn age(&self) -> Duration {
		self.created_at.elapsed()
	}

	fn touch(&self) {
		self.last_active_ms.store(now_ms(), Ordering::Relaxed);
	}
}

/// Send `bytes` to every registered client except `skip` (if any),
/// non-blocking. A client whose queue is full (`TrySendError::Full`) is
/// `ErrSlowConsumer`: its close signal is raised right here, under the same
/// lock that observed the overflow, and its id is returned so the caller can
/// log it. A client whose receiver is already gone is left alone — its
/// session is tearing down on its own.
fn fanout_locked(clients: &HashMap<ClientId, ClientHandle>, skip: Option<ClientId>, bytes: &[u8]) -> Vec<ClientId> {
	let mut overflowed = Vec::new();
	for (id, handle) in clients {
		if Some(*id) == skip {
			continue;
		}
		if let Err(mpsc::error::TrySendError::Full(_)) = handle.sender.try_send(bytes.to_vec()) {
			let _ = handle.close.send(Some((1008, "outbound queue overflow")));
			overflowed.push(*id);
		}
	}
	overflowed
}

fn now_ms() -> u64 {
	#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
	{
		std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_millis() as u64
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use collab_bus::LocalBus;

	fn hub() -> Hub {
		Hub::new(DocumentId::parse("doc1"), Arc::new(LocalBus::new()), Arc::new(BusMetrics::default()), InstanceId::new("inst-a"), 50)
	}

	fn close_signal() -> CloseSignal {
		watch::channel(None).0
	}

	#[tokio::test]
	async fn register_assigns_unique_client_ids() {
		let hub = hub();
		let (tx1, _rx1) = mpsc::channel(8);
		let (tx2, _rx2) = mpsc::channel(8);
		let (id1, _, _) = hub.register(tx1, close_signal()).await.expect("registers");
		let (id2, _, _) = hub.register(tx2, close_signal()).await.expect("registers");
		assert_ne!(id1, id2);
		assert_eq!(hub.client_count().await, 2);
	}

	#[tokio::test]
	async fn hub_full_rejects_registration_past_capacity() {
		let hub = Hub::new(DocumentId::parse("doc1"), Arc::new(LocalBus::new()), Arc::new(BusMetrics::default()), InstanceId::new("inst-a"), 1);
		let (tx1, _rx1) = mpsc::channel(8);
		hub.register(tx1, close_signal()).await.expect("first registers");
		let (tx2, _rx2) = mpsc::channel(8);
		assert!(matches!(hub.register(tx2, close_signal()).await, Err(Error::HubFull)));
	}

	#[tokio::test]
	async fn local_update_is_not_echoed_to_its_own_sender() {
		let hub = hub();
		let (tx1, mut rx1) = mpsc::channel(8);
		let (tx2, mut rx2) = mpsc::channel(8);
		let (id1, _, _) = hub.register(tx1, close_signal()).await.expect("registers");
		let (_id2, _, _) = hub.register(tx2, close_signal()).await.expect("registers");

		let update = UpdateBlob::from_bytes(vec![1, 2, 3]);
		hub.handle_sync(id1, SyncMessage::Update(update)).await.expect("applies");

		assert!(rx1.try_recv().is_err(), "originating client must not receive its own update");
		assert!(rx2.try_recv().is_ok(), "peer client must receive the update");
	}

	#[tokio::test]
	async fn unregister_retracts_awareness_and_reports_emptiness() {
		let hub = hub();
		let (tx1, _rx1) = mpsc::channel(8);
		let (id1, _, _) = hub.register(tx1, close_signal()).await.expect("registers");

		let entries = vec![(id1, AwarenessEntry { clock: 1, state: Some(serde_json::json!({"x": 1})) })];
		let blob = AwarenessTable::encode(&entries);
		hub.handle_awareness(id1, blob).await.expect("merges");

		let now_empty = hub.unregister(id1).await;
		assert!(now_empty);
		let stats = hub.stats().await;
		assert_eq!(stats.awareness_entries, 0);
	}

	#[tokio::test]
	async fn bus_delivery_with_own_instance_id_is_dropped() {
		let hub = hub();
		let (tx1, mut rx1) = mpsc::channel(8);
		hub.register(tx1, close_signal()).await.expect("registers");

		let envelope = BusEnvelope {
			document_id: DocumentId::parse("doc1"),
			kind: EnvelopeKind::Update,
			payload: vec![1].into_boxed_slice(),
			origin: None,
			instance_id: InstanceId::new("inst-a"),
			message_id: Uuid::new_v4(),
			timestamp_ms: 0,
			chunk: None,
		};
		hub.handle_bus(envelope).await.expect("handles");
		assert!(rx1.try_recv().is_err());
	}

	#[tokio::test]
	async fn bus_apply_failure_counts_as_update_error_and_does_not_cascade() {
		let hub = hub();
		let (tx1, _rx1) = mpsc::channel(8);
		hub.register(tx1, close_signal()).await.expect("registers");

		let envelope = BusEnvelope {
			document_id: DocumentId::parse("doc1"),
			kind: EnvelopeKind::Update,
			payload: vec![0xff, 0x00, 0x01].into_boxed_slice(),
			origin: None,
			instance_id: InstanceId::new("inst-b"),
			message_id: Uuid::new_v4(),
			timestamp_ms: 0,
			chunk: None,
		};
		hub.handle_bus(envelope).await.expect("a corrupt bus update is dropped, not propagated");
		assert_eq!(hub.bus_metrics.snapshot().errors, 1);
	}

	#[tokio::test]
	async fn slow_consumer_is_signaled_to_close_instead_of_silently_dropped() {
		let hub = hub();
		// client A never drains its queue and has room for exactly one frame
		let (tx_a, _rx_a) = mpsc::channel(1);
		let (close_tx, mut close_rx) = watch::channel(None);
		hub.register(tx_a, close_tx).await.expect("registers");
		// client B is the one sending updates, so fan-out targets A
		let (tx_b, _rx_b) = mpsc::channel(8);
		let (id_b, _, _) = hub.register(tx_b, close_signal()).await.expect("registers");

		hub.handle_sync(id_b, SyncMessage::Update(UpdateBlob::from_bytes(vec![1, 2, 3]))).await.expect("applies");
		hub.handle_sync(id_b, SyncMessage::Update(UpdateBlob::from_bytes(vec![4, 5, 6]))).await.expect("applies");

		assert_eq!(*close_rx.borrow_and_update(), Some((1008u16, "outbound queue overflow")));
	}

	#[tokio::test]
	async fn drain_signals_every_client_to_close() {
		let hub = hub();
		let (tx1, _rx1) = mpsc::channel(8);
		let (close_tx, mut close_rx) = watch::channel(None);
		hub.register(tx1, close_tx).await.expect("registers");

		hub.drain().await;

		assert_eq!(*close_rx.borrow_and_update(), Some((1001u16, "server shutting down")));
	}
}

// vim: ts=4
