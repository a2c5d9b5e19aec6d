//! Counters for the cache facade and the event queue.
//!
//! All counters are atomic and monotonic; snapshots are plain structs so
//! callers can poll them for monitoring without holding references into
//! the cache.

use std::sync::atomic::{AtomicU64, Ordering};

/// Facade-level counters. One increment per accepted operation.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Accepted `update` submissions.
    pub update_count: AtomicU64,
    /// `get` calls made while the cache was alive.
    pub get_count: AtomicU64,
    /// Reads satisfied from the staging map (cancelled writes).
    pub purgatory_hits: AtomicU64,
    /// Reads satisfied by the backend.
    pub backend_hits: AtomicU64,
    /// Reads the backend could not satisfy.
    pub backend_misses: AtomicU64,
    /// `remove` calls made while the cache was alive.
    pub remove_count: AtomicU64,
}

impl CacheStats {
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            update_count: self.update_count.load(Ordering::Relaxed),
            get_count: self.get_count.load(Ordering::Relaxed),
            purgatory_hits: self.purgatory_hits.load(Ordering::Relaxed),
            backend_hits: self.backend_hits.load(Ordering::Relaxed),
            backend_misses: self.backend_misses.load(Ordering::Relaxed),
            remove_count: self.remove_count.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub update_count: u64,
    pub get_count: u64,
    pub purgatory_hits: u64,
    pub backend_hits: u64,
    pub backend_misses: u64,
    pub remove_count: u64,
}

/// Queue-side counters, shared between the facade and the writer thread.
#[derive(Debug, Default)]
pub struct QueueMetrics {
    /// Events accepted into the channel.
    pub events_enqueued: AtomicU64,
    /// Events dropped under backpressure after the blocking grace.
    pub events_dropped: AtomicU64,
    /// Events the writer finished with, including no-ops.
    pub events_processed: AtomicU64,
    /// Put events that reached the backend successfully.
    pub puts_written: AtomicU64,
    /// Put events skipped because a read rescued the item first.
    pub puts_cancelled: AtomicU64,
    /// Backend failures observed by the writer.
    pub backend_errors: AtomicU64,
}

impl QueueMetrics {
    pub fn snapshot(&self) -> QueueMetricsSnapshot {
        QueueMetricsSnapshot {
            events_enqueued: self.events_enqueued.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            events_processed: self.events_processed.load(Ordering::Relaxed),
            puts_written: self.puts_written.load(Ordering::Relaxed),
            puts_cancelled: self.puts_cancelled.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`QueueMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueMetricsSnapshot {
    pub events_enqueued: u64,
    pub events_dropped: u64,
    pub events_processed: u64,
    pub puts_written: u64,
    pub puts_cancelled: u64,
    pub backend_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_increments() {
        let stats = CacheStats::default();
        stats.update_count.fetch_add(1, Ordering::Relaxed);
        stats.update_count.fetch_add(1, Ordering::Relaxed);
        stats.purgatory_hits.fetch_add(1, Ordering::Relaxed);
        let snap = stats.snapshot();
        assert_eq!(snap.update_count, 2);
        assert_eq!(snap.purgatory_hits, 1);
        assert_eq!(snap.get_count, 0);
    }
}
