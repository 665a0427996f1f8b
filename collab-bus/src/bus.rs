//! Publish/subscribe abstraction over Redis, one topic per document.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use collab_types::prelude::*;
use futures::StreamExt;
use redis::AsyncCommands;
use tokio::sync::mpsc;

use crate::envelope::BusEnvelope;

#[async_trait]
pub trait Bus: Send + Sync + std::fmt::Debug {
	async fn publish(&self, envelope: &BusEnvelope) -> ClResult<()>;

	/// Subscribe to a document's topic. Dropping the returned
	/// `BusSubscription` unsubscribes.
	async fn subscribe(&self, document_id: &DocumentId) -> ClResult<BusSubscription>;
}

pub struct BusSubscription {
	pub receiver: mpsc::Receiver<BusEnvelope>,
	_task: tokio::task::JoinHandle<()>,
}

impl Drop for BusSubscription {
	fn drop(&mut self) {
		self._task.abort();
	}
}

#[derive(Debug, Clone)]
pub struct BusConfig {
	pub prefix: Box<str>,
	pub chunk_threshold: usize,
	pub chunk_reassembly_timeout: Duration,
}

pub struct RedisBus {
	client: redis::Client,
	manager: redis::aio::ConnectionManager,
	config: BusConfig,
}

impl std::fmt::Debug for RedisBus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RedisBus")
			.field("client", &self.client)
			.field("config", &self.config)
			.finish_non_exhaustive()
	}
}

impl RedisBus {
	pub async fn connect(url: &str, config: BusConfig) -> ClResult<Self> {
		let client = redis::Client::open(url).map_err(|e| Error::ConfigError(format!("invalid redis url: {e}")))?;
		let manager = client
			.get_connection_manager()
			.await
			.map_err(|e| Error::BusPublish(format!("redis connect failed: {e}")))?;
		Ok(Self { client, manager, config })
	}

	fn topic(&self, document_id: &DocumentId) -> String {
		format!("{}doc:{}:updates", self.config.prefix, document_id.as_str())
	}
}

/// Split a payload larger than `chunk_threshold` into several envelopes
/// sharing one `message_id`, so Redis's own message-size limits and
/// slow-consumer behaviour on peer instances stay predictable.
fn chunk_payload(config: &BusConfig, envelope: BusEnvelope) -> Vec<BusEnvelope> {
	if envelope.payload.len() <= config.chunk_threshold || config.chunk_threshold == 0 {
		return vec![envelope];
	}

	let chunks: Vec<Box<[u8]>> = envelope.payload.chunks(config.chunk_threshold).map(Box::from).collect();
	#[allow(clippy::cast_possible_truncation)]
	let total = chunks.len() as u32;

	chunks
		.into_iter()
		.enumerate()
		.map(|(i, piece)| BusEnvelope {
			document_id: envelope.document_id.clone(),
			kind: envelope.kind,
			payload: piece,
			origin: envelope.origin.clone(),
			instance_id: envelope.instance_id.clone(),
			message_id: envelope.message_id,
			timestamp_ms: envelope.timestamp_ms,
			#[allow(clippy::cast_possible_truncation)]
			chunk: Some(crate::envelope::ChunkInfo { index: i as u32, total }),
		})
		.collect()
}

#[async_trait]
impl Bus for RedisBus {
	async fn publish(&self, envelope: &BusEnvelope) -> ClResult<()> {
		let topic = self.topic(&envelope.document_id);
		let mut manager = self.manager.clone();

		for piece in chunk_payload(&self.config, envelope.clone()) {
			let bytes = piece.encode();
			let mut attempt = 0;
			loop {
				match manager.publish::<_, _, ()>(&topic, bytes.as_slice()).await {
					Ok(()) => break,
					Err(e) if attempt < 2 => {
						attempt += 1;
						warn!("bus publish retry {attempt} for {topic}: {e}");
						tokio::time::sleep(Duration::from_millis(50 * attempt)).await;
					}
					Err(e) => return Err(Error::BusPublish(e.to_string())),
				}
			}
		}
		Ok(())
	}

	async fn subscribe(&self, document_id: &DocumentId) -> ClResult<BusSubscription> {
		let topic = self.topic(document_id);
		let (tx, rx) = mpsc::channel(256);

		let mut pubsub = self
			.client
			.get_async_pubsub()
			.await
			.map_err(|e| Error::BusPublish(format!("redis subscribe failed: {e}")))?;
		pubsub
			.subscribe(&topic)
			.await
			.map_err(|e| Error::BusPublish(format!("redis subscribe failed: {e}")))?;

		let reassembly_timeout = self.config.chunk_reassembly_timeout;
		let topic_for_task = topic.clone();
		let task = tokio::spawn(async move {
			let mut reassembly: HashMap<uuid::Uuid, PendingChunks> = HashMap::new();
			let mut gc = tokio::time::interval(Duration::from_secs(5));
			let mut stream = pubsub.on_message();
			loop {
				tokio::select! {
					msg = stream.next() => {
						let Some(msg) = msg else { break };
						let payload: Vec<u8> = match msg.get_payload() {
							Ok(p) => p,
							Err(e) => {
								warn!("bus payload decode error on {topic_for_task}: {e}");
								continue;
							}
						};
						let envelope = match BusEnvelope::decode(&payload) {
							Ok(e) => e,
							Err(e) => {
								warn!("bus envelope decode error on {topic_for_task}: {e}");
								continue;
							}
						};
						match assemble(&mut reassembly, envelope) {
							Some(full) => {
								if tx.send(full).await.is_err() {
									break;
								}
							}
							None => continue,
						}
					}
					_ = gc.tick() => {
						let now = Instant::now();
						reassembly.retain(|_, pending| {
							let keep = now.duration_since(pending.first_seen) < reassembly_timeout;
							if !keep {
								debug!("dropping incomplete chunked bus message on {topic_for_task}");
							}
							keep
						});
					}
				}
			}
		});

		Ok(BusSubscription { receiver: rx, _task: task })
	}
}

struct PendingChunks {
	pieces: Vec<Option<Box<[u8]>>>,
	received: usize,
	first_seen: Instant,
	template: BusEnvelope,
}

fn assemble(reassembly: &mut HashMap<uuid::Uuid, PendingChunks>, envelope: BusEnvelope) -> Option<BusEnvelope> {
	let Some(chunk) = envelope.chunk else {
		return Some(envelope);
	};

	let entry = reassembly.entry(envelope.message_id).or_insert_with(|| PendingChunks {
		pieces: vec![None; chunk.total as usize],
		received: 0,
		first_seen: Instant::now(),
		template: envelope.clone(),
	});

	if let Some(slot) = entry.pieces.get_mut(chunk.index as usize) {
		if slot.is_none() {
			*slot = Some(envelope.payload.clone());
			entry.received += 1;
		}
	}

	if entry.received == entry.pieces.len() {
		let pending = reassembly.remove(&envelope.message_id)?;
		let mut full_payload = Vec::new();
		for piece in pending.pieces.into_iter().flatten() {
			full_payload.extend_from_slice(&piece);
		}
		let mut assembled = pending.template;
		assembled.payload = full_payload.into_boxed_slice();
		assembled.chunk = None;
		Some(assembled)
	} else {
		None
	}
}

/// In-process `Bus` used by unit and integration tests: no network, just a
/// broadcast to every locally-registered subscriber for the same topic.
#[derive(Debug, Default)]
pub struct LocalBus {
	topics: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::broadcast::Sender<Vec<u8>>>>>,
}

impl LocalBus {
	pub fn new() -> Self {
		Self::default()
	}

	fn sender(&self, topic: &str) -> Arc<tokio::sync::broadcast::Sender<Vec<u8>>> {
		let mut topics = self.topics.lock();
		topics
			.entry(topic.to_string())
			.or_insert_with(|| {
				let (tx, _rx) = tokio::sync::broadcast::channel(256);
				Arc::new(tx)
			})
			.clone()
	}
}

#[async_trait]
impl Bus for LocalBus {
	async fn publish(&self, envelope: &BusEnvelope) -> ClResult<()> {
		let topic = format!("doc:{}:updates", envelope.document_id.as_str());
		let _ = self.sender(&topic).send(envelope.encode());
		Ok(())
	}

	async fn subscribe(&self, document_id: &DocumentId) -> ClResult<BusSubscription> {
		let topic = format!("doc:{}:updates", document_id.as_str());
		let mut local_rx = self.sender(&topic).subscribe();
		let (tx, rx) = mpsc::channel(256);

		let task = tokio::spawn(async move {
			loop {
				match local_rx.recv().await {
					Ok(bytes) => match BusEnvelope::decode(&bytes) {
						Ok(envelope) => {
							if tx.send(envelope).await.is_err() {
								break;
							}
						}
						Err(e) => warn!("local bus decode error: {e}"),
					},
					Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
					Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
				}
			}
		});

		Ok(BusSubscription { receiver: rx, _task: task })
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::envelope::EnvelopeKind;
	use uuid::Uuid;

	fn envelope(doc: &str, payload: Vec<u8>) -> BusEnvelope {
		BusEnvelope {
			document_id: DocumentId::parse(doc),
			kind: EnvelopeKind::Update,
			payload: payload.into_boxed_slice(),
			origin: None,
			instance_id: InstanceId::new("test-instance"),
			message_id: Uuid::new_v4(),
			timestamp_ms: 0,
			chunk: None,
		}
	}

	#[tokio::test]
	async fn local_bus_delivers_published_messages() {
		let bus = LocalBus::new();
		let doc = DocumentId::parse("doc1");
		let mut sub = bus.subscribe(&doc).await.expect("subscribes");

		bus.publish(&envelope("doc1", vec![1, 2, 3])).await.expect("publishes");

		let received = sub.receiver.recv().await.expect("receives");
		assert_eq!(received.payload.as_ref(), &[1, 2, 3]);
	}

	#[tokio::test]
	async fn local_bus_isolates_topics_per_document() {
		let bus = LocalBus::new();
		let mut sub_a = bus.subscribe(&DocumentId::parse("doc-a")).await.expect("subscribes");
		let mut sub_b = bus.subscribe(&DocumentId::parse("doc-b")).await.expect("subscribes");

		bus.publish(&envelope("doc-a", vec![9])).await.expect("publishes");

		let received = sub_a.receiver.recv().await.expect("receives");
		assert_eq!(received.document_id.as_str(), "doc-a");
		assert!(sub_b.receiver.try_recv().is_err());
	}

	#[test]
	fn chunking_splits_above_threshold() {
		let config =
			BusConfig { prefix: "collab:".into(), chunk_threshold: 4, chunk_reassembly_timeout: Duration::from_secs(1) };
		let pieces = chunk_payload(&config, envelope("doc1", vec![0; 10]));
		assert_eq!(pieces.len(), 3);
		assert_eq!(pieces[0].chunk, Some(crate::envelope::ChunkInfo { index: 0, total: 3 }));
	}
}

// vim: ts=4
