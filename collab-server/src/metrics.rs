//! Process-wide counters (§5 shared resources): updated with atomic
//! operations, no locks, and shared by every Hub the Registry creates.

use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregate Bus traffic counters for this instance, surfaced whole by the
/// Admin Surface's `Stats` operation.
#[derive(Debug, Default)]
pub struct BusMetrics {
	sent: AtomicU64,
	received: AtomicU64,
	errors: AtomicU64,
}

impl BusMetrics {
	pub fn record_sent(&self) {
		self.sent.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_received(&self) {
		self.received.fetch_add(1, Ordering::Relaxed);
	}

	/// Counts both `ErrBusPublish` (outbound) and `busUpdateErrors` (an
	/// apply failure on a frame delivered from the Bus) under one
	/// process-wide total.
	pub fn record_error(&self) {
		self.errors.fetch_add(1, Ordering::Relaxed);
	}

	pub fn snapshot(&self) -> BusMetricsSnapshot {
		BusMetricsSnapshot {
			sent: self.sent.load(Ordering::Relaxed),
			received: self.received.load(Ordering::Relaxed),
			errors: self.errors.load(Ordering::Relaxed),
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusMetricsSnapshot {
	pub sent: u64,
	pub received: u64,
	pub errors: u64,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn counters_start_at_zero_and_accumulate() {
		let metrics = BusMetrics::default();
		metrics.record_sent();
		metrics.record_sent();
		metrics.record_received();
		metrics.record_error();
		let snapshot = metrics.snapshot();
		assert_eq!(snapshot, BusMetricsSnapshot { sent: 2, received: 1, errors: 1 });
	}
}

// vim: ts=4
