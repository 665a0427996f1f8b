//! Cross-instance document fan-out over Redis pub/sub.

pub mod bus;
pub mod envelope;

pub use bus::{Bus, BusConfig, BusSubscription, LocalBus, RedisBus};
pub use envelope::{BusEnvelope, ChunkInfo, EnvelopeKind};

// vim: ts=4
