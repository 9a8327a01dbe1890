//! Metrics module
//!
//! Lock-free counters for the throttled file and the cache store. Counters are
//! updated with relaxed atomics on the I/O path; `snapshot()` copies them into
//! plain serializable structs for reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Counter metric
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Increment by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by n
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Traffic direction of a throttled call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Read,
    Write,
}

// =============================================================================
// Throttled File Statistics
// =============================================================================

#[derive(Debug, Default)]
struct DirectionStats {
    ops: Counter,
    bytes: Counter,
    throttled_us: Counter,
    short_transfers: Counter,
    errors: Counter,
}

impl DirectionStats {
    fn snapshot(&self) -> DirectionSnapshot {
        DirectionSnapshot {
            ops: self.ops.get(),
            bytes: self.bytes.get(),
            throttled_us: self.throttled_us.get(),
            short_transfers: self.short_transfers.get(),
            errors: self.errors.get(),
        }
    }
}

/// Per-direction counters of a [`ThrottledFile`](crate::throttle::ThrottledFile).
#[derive(Debug, Default)]
pub struct IoStats {
    read: DirectionStats,
    write: DirectionStats,
}

impl IoStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn direction(&self, dir: Direction) -> &DirectionStats {
        match dir {
            Direction::Read => &self.read,
            Direction::Write => &self.write,
        }
    }

    /// Record one completed call that moved `bytes`.
    pub fn record_transfer(&self, dir: Direction, bytes: usize, short: bool) {
        let stats = self.direction(dir);
        stats.ops.inc();
        stats.bytes.add(bytes as u64);
        if short {
            stats.short_transfers.inc();
        }
    }

    pub fn record_error(&self, dir: Direction) {
        self.direction(dir).errors.inc();
    }

    /// Record time spent sleeping for rate-limit compliance.
    pub fn record_throttled(&self, dir: Direction, slept: Duration) {
        if !slept.is_zero() {
            self.direction(dir)
                .throttled_us
                .add(slept.as_micros() as u64);
        }
    }

    pub fn snapshot(&self) -> IoStatsSnapshot {
        IoStatsSnapshot {
            read: self.read.snapshot(),
            write: self.write.snapshot(),
        }
    }
}

/// Counters for one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DirectionSnapshot {
    pub ops: u64,
    pub bytes: u64,
    /// Microseconds spent in compliance sleeps
    pub throttled_us: u64,
    pub short_transfers: u64,
    pub errors: u64,
}

/// Point-in-time copy of [`IoStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IoStatsSnapshot {
    pub read: DirectionSnapshot,
    pub write: DirectionSnapshot,
}

// =============================================================================
// Cache Store Statistics
// =============================================================================

/// Counters of a [`CacheStore`](crate::cache::CacheStore).
#[derive(Debug, Default)]
pub struct StoreStats {
    reads: Counter,
    read_bytes: Counter,
    writes: Counter,
    write_bytes: Counter,
    rejected_full: Counter,
    forced_recycles: Counter,
    refill_queries: Counter,
    refill_hits: Counter,
    refill_misses: Counter,
    slow_ops: Counter,
}

impl StoreStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self, bytes: usize) {
        self.reads.inc();
        self.read_bytes.add(bytes as u64);
    }

    pub fn record_write(&self, bytes: usize) {
        self.writes.inc();
        self.write_bytes.add(bytes as u64);
    }

    pub fn record_rejected_full(&self) {
        self.rejected_full.inc();
    }

    pub fn record_forced_recycle(&self) {
        self.forced_recycles.inc();
    }

    /// Record a refill query; `cached` when nothing needs fetching.
    pub fn record_refill(&self, cached: bool) {
        self.refill_queries.inc();
        if cached {
            self.refill_hits.inc();
        } else {
            self.refill_misses.inc();
        }
    }

    pub fn record_slow_op(&self) {
        self.slow_ops.inc();
    }

    pub fn snapshot(&self) -> StoreStatsSnapshot {
        StoreStatsSnapshot {
            reads: self.reads.get(),
            read_bytes: self.read_bytes.get(),
            writes: self.writes.get(),
            write_bytes: self.write_bytes.get(),
            rejected_full: self.rejected_full.get(),
            forced_recycles: self.forced_recycles.get(),
            refill_queries: self.refill_queries.get(),
            refill_hits: self.refill_hits.get(),
            refill_misses: self.refill_misses.get(),
            slow_ops: self.slow_ops.get(),
        }
    }
}

/// Point-in-time copy of [`StoreStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStatsSnapshot {
    pub reads: u64,
    pub read_bytes: u64,
    pub writes: u64,
    pub write_bytes: u64,
    pub rejected_full: u64,
    pub forced_recycles: u64,
    pub refill_queries: u64,
    pub refill_hits: u64,
    pub refill_misses: u64,
    pub slow_ops: u64,
}
