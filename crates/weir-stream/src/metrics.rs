//! Per-stream and engine-level counters.
//!
//! Plain atomics, sampled via snapshots — enough for an operator to see
//! whether batches move, how many offered hashes are actually wanted, and
//! whether retrieves time out.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters kept per stream instance (per peer, per direction).
#[derive(Debug, Default)]
pub struct StreamCounters {
    pub batches_offered: AtomicU64,
    pub hashes_offered: AtomicU64,
    pub hashes_wanted: AtomicU64,
    pub hashes_delivered: AtomicU64,
    pub delivery_timeouts: AtomicU64,
    pub takeovers_signed: AtomicU64,
}

impl StreamCounters {
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            batches_offered: self.batches_offered.load(Ordering::Relaxed),
            hashes_offered: self.hashes_offered.load(Ordering::Relaxed),
            hashes_wanted: self.hashes_wanted.load(Ordering::Relaxed),
            hashes_delivered: self.hashes_delivered.load(Ordering::Relaxed),
            delivery_timeouts: self.delivery_timeouts.load(Ordering::Relaxed),
            takeovers_signed: self.takeovers_signed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`StreamCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CountersSnapshot {
    pub batches_offered: u64,
    pub hashes_offered: u64,
    pub hashes_wanted: u64,
    pub hashes_delivered: u64,
    pub delivery_timeouts: u64,
    pub takeovers_signed: u64,
}

/// Engine-wide counters, one set per [`Streamer`](crate::Streamer).
#[derive(Debug, Default)]
pub struct EngineCounters {
    pub chunks_received: AtomicU64,
    pub duplicate_deliveries: AtomicU64,
    pub unsolicited_deliveries: AtomicU64,
}

impl EngineCounters {
    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            duplicate_deliveries: self.duplicate_deliveries.load(Ordering::Relaxed),
            unsolicited_deliveries: self.unsolicited_deliveries.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`EngineCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineSnapshot {
    pub chunks_received: u64,
    pub duplicate_deliveries: u64,
    pub unsolicited_deliveries: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let counters = StreamCounters::default();
        counters.batches_offered.fetch_add(2, Ordering::Relaxed);
        counters.hashes_wanted.fetch_add(5, Ordering::Relaxed);

        let snap = counters.snapshot();
        assert_eq!(snap.batches_offered, 2);
        assert_eq!(snap.hashes_wanted, 5);
        assert_eq!(snap.takeovers_signed, 0);
    }
}
