//! Document Registry (C6): process-wide `DocumentId -> Hub` map with
//! single-flight creation and idle-driven garbage collection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use collab_bus::Bus;
use collab_types::prelude::*;
use rand::RngExt;
use tokio::sync::{watch, Mutex};

use crate::hub::{Hub, HubStats};
use crate::metrics::{BusMetrics, BusMetricsSnapshot};

struct RegistryInner {
	hubs: HashMap<DocumentId, Arc<Hub>>,
	/// In-flight creations: concurrent `get()` calls for the same id await
	/// the same watch channel rather than each building their own Hub.
	in_flight: HashMap<DocumentId, watch::Receiver<Option<Arc<Hub>>>>,
}

pub struct Registry {
	inner: Mutex<RegistryInner>,
	bus: Arc<dyn Bus>,
	bus_metrics: Arc<BusMetrics>,
	instance_id: InstanceId,
	max_hubs: Option<usize>,
	max_clients_per_hub: usize,
	idle_grace: Duration,
	drain_deadline: Duration,
}

impl Registry {
	pub fn new(
		bus: Arc<dyn Bus>,
		instance_id: InstanceId,
		max_hubs: Option<usize>,
		max_clients_per_hub: usize,
		idle_grace: Duration,
		drain_deadline: Duration,
	) -> Self {
		Self {
			inner: Mutex::new(RegistryInner { hubs: HashMap::new(), in_flight: HashMap::new() }),
			bus,
			bus_metrics: Arc::new(BusMetrics::default()),
			instance_id,
			max_hubs,
			max_clients_per_hub,
			idle_grace,
			drain_deadline,
		}
	}

	/// Process-wide Bus traffic counters (§5, §6.4), aggregated across
	/// every Hub this Registry has ever created.
	pub fn bus_stats(&self) -> BusMetricsSnapshot {
		self.bus_metrics.snapshot()
	}

	/// Get or create the Hub for `doc_id`. Concurrent callers for the same
	/// id share one creation: the first caller becomes the "leader" and
	/// builds the Hub (including subscribing it to the Bus); the rest await
	/// the leader's result.
	pub async fn get(&self, doc_id: &DocumentId) -> ClResult<Arc<Hub>> {
		loop {
			let mut guard = self.inner.lock().await;
			if let Some(hub) = guard.hubs.get(doc_id) {
				return Ok(hub.clone());
			}
			if let Some(mut rx) = guard.in_flight.get(doc_id).cloned() {
				drop(guard);
				if rx.changed().await.is_ok() {
					if let Some(hub) = rx.borrow().clone() {
						return Ok(hub);
					}
				}
				// leader failed; retry, we might become the new leader
				continue;
			}

			if let Some(max) = self.max_hubs {
				if guard.hubs.len() >= max {
					return Err(Error::Capacity);
				}
			}

			let (tx, rx) = watch::channel(None);
			guard.in_flight.insert(doc_id.clone(), rx);
			drop(guard);

			let result = self.create_hub(doc_id).await;
			let mut guard = self.inner.lock().await;
			guard.in_flight.remove(doc_id);
			match result {
				Ok(hub) => {
					guard.hubs.insert(doc_id.clone(), hub.clone());
					let _ = tx.send(Some(hub.clone()));
					return Ok(hub);
				}
				Err(e) => {
					let _ = tx.send(None);
					return Err(e);
				}
			}
		}
	}

	async fn create_hub(&self, doc_id: &DocumentId) -> ClResult<Arc<Hub>> {
		// Subscribing happens outside any lock; a failure here fails the
		// whole creation and every waiter observes the same error.
		let mut subscription = self.bus.subscribe(doc_id).await?;
		let hub = Arc::new(Hub::new(
			doc_id.clone(),
			self.bus.clone(),
			self.bus_metrics.clone(),
			self.instance_id.clone(),
			self.max_clients_per_hub,
		));

		// The forwarding task only ever holds a Weak handle: if it held an
		// Arc, a Hub with no more clients and no more Bus traffic would
		// never become unreachable and `gc_if_idle` would remove it from
		// the map while this task kept it alive forever. The liveness tick
		// lets an idle Hub's subscription be torn down even with no
		// incoming messages to notice the drop on.
		let weak = Arc::downgrade(&hub);
		let bus_metrics = self.bus_metrics.clone();
		tokio::spawn(async move {
			let mut liveness = tokio::time::interval(Duration::from_secs(5));
			loop {
				tokio::select! {
					envelope = subscription.receiver.recv() => {
						let Some(envelope) = envelope else { break };
						let Some(hub) = weak.upgrade() else { break };
						if let Err(e) = hub.handle_bus(envelope).await {
							bus_metrics.record_error();
							warn!("bus delivery error: {e}");
						}
					}
					_ = liveness.tick() => {
						if weak.upgrade().is_none() {
							break;
						}
					}
				}
			}
		});

		Ok(hub)
	}

	/// Called by the Session Orchestrator when a client detaches. Arms an
	/// idle timer (with jitter) if the Hub is now empty.
	pub async fn release(self: &Arc<Self>, doc_id: DocumentId, hub: Arc<Hub>) {
		if hub.client_count().await != 0 {
			return;
		}

		let registry = self.clone();
		let grace = self.idle_grace;
		tokio::spawn(async move {
			let jitter_secs: u64 = rand::rng().random_range(0..60);
			tokio::time::sleep(grace + Duration::from_secs(jitter_secs)).await;
			registry.gc_if_idle(&doc_id).await;
		});
	}

	async fn gc_if_idle(&self, doc_id: &DocumentId) {
		let guard = self.inner.lock().await;
		let Some(hub) = guard.hubs.get(doc_id).cloned() else { return };
		drop(guard);

		if hub.client_count().await != 0 {
			return;
		}
		if hub.idle_for() < self.idle_grace {
			return;
		}

		let mut guard = self.inner.lock().await;
		// re-check under lock: a client may have registered between the
		// drop above and re-acquiring the lock here
		if guard.hubs.get(doc_id).map(|h| Arc::ptr_eq(h, &hub)).unwrap_or(false) {
			guard.hubs.remove(doc_id);
			debug!("gc'd idle hub {doc_id}");
		}
	}

	pub async fn force_remove(&self, doc_id: &DocumentId) -> ClResult<()> {
		let mut guard = self.inner.lock().await;
		let Some(hub) = guard.hubs.get(doc_id) else { return Err(Error::NotFound) };
		if hub.client_count().await != 0 {
			return Err(Error::ActiveClients);
		}
		guard.hubs.remove(doc_id);
		Ok(())
	}

	pub async fn list(&self) -> Vec<(DocumentId, HubStats)> {
		let hubs: Vec<_> = {
			let guard = self.inner.lock().await;
			guard.hubs.iter().map(|(id, hub)| (id.clone(), hub.clone())).collect()
		};
		let mut out = Vec::with_capacity(hubs.len());
		for (id, hub) in hubs {
			out.push((id, hub.stats().await));
		}
		out
	}

	pub async fn hub_count(&self) -> usize {
		self.inner.lock().await.hubs.len()
	}

	/// `Registry.Drain` (§5, §7 `ErrShutdown`): tell every connected client
	/// on every open Hub to close, then give writers `drainDeadline` to
	/// flush the close frame before the caller proceeds with shutdown.
	pub async fn drain(&self) {
		let hubs: Vec<Arc<Hub>> = {
			let guard = self.inner.lock().await;
			guard.hubs.values().cloned().collect()
		};
		for hub in &hubs {
			hub.drain().await;
		}
		tokio::time::sleep(self.drain_deadline).await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use collab_bus::LocalBus;

	fn registry() -> Arc<Registry> {
		Arc::new(Registry::new(Arc::new(LocalBus::new()), InstanceId::new("inst-a"), None, 50, Duration::from_secs(1800), Duration::from_secs(5)))
	}

	#[tokio::test]
	async fn get_creates_exactly_one_hub_for_concurrent_callers() {
		let registry = registry();
		let doc_id = DocumentId::parse("doc1");

		let (a, b) = tokio::join!(registry.get(&doc_id), registry.get(&doc_id));
		let a = a.expect("creates");
		let b = b.expect("reuses");
		assert!(Arc::ptr_eq(&a, &b));
		assert_eq!(registry.hub_count().await, 1);
	}

	#[tokio::test]
	async fn force_remove_rejects_active_documents() {
		let registry = registry();
		let doc_id = DocumentId::parse("doc1");
		let hub = registry.get(&doc_id).await.expect("creates");
		let (tx, _rx) = tokio::sync::mpsc::channel(8);
		let (close_tx, _close_rx) = watch::channel(None);
		hub.register(tx, close_tx).await.expect("registers a client");

		assert!(matches!(registry.force_remove(&doc_id).await, Err(Error::ActiveClients)));
	}

	#[tokio::test]
	async fn force_remove_succeeds_on_empty_document() {
		let registry = registry();
		let doc_id = DocumentId::parse("doc1");
		registry.get(&doc_id).await.expect("creates");

		registry.force_remove(&doc_id).await.expect("removes");
		assert_eq!(registry.hub_count().await, 0);
	}

	#[tokio::test]
	async fn capacity_limit_rejects_new_hubs() {
		let registry =
			Arc::new(Registry::new(Arc::new(LocalBus::new()), InstanceId::new("inst-a"), Some(1), 50, Duration::from_secs(1800), Duration::from_secs(5)));
		registry.get(&DocumentId::parse("doc1")).await.expect("first hub creates");
		assert!(matches!(registry.get(&DocumentId::parse("doc2")).await, Err(Error::Capacity)));
	}

	#[tokio::test]
	async fn drain_asks_every_connected_client_to_close() {
		let registry = Arc::new(Registry::new(
			Arc::new(LocalBus::new()),
			InstanceId::new("inst-a"),
			None,
			50,
			Duration::from_secs(1800),
			Duration::from_millis(20),
		));
		let hub = registry.get(&DocumentId::parse("doc1")).await.expect("creates");
		let (tx, _rx) = tokio::sync::mpsc::channel(8);
		let (close_tx, mut close_rx) = watch::channel(None);
		hub.register(tx, close_tx).await.expect("registers a client");

		let started = tokio::time::Instant::now();
		registry.drain().await;

		assert_eq!(*close_rx.borrow_and_update(), Some((1001u16, "server shutting down")));
		assert!(started.elapsed() >= Duration::from_millis(20));
	}
}

// vim: ts=4
