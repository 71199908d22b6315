//! Statistics of a cache instance.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// A monotonic counter.
#[derive(Debug, Default)]
pub(crate) struct Counter(AtomicU64);

impl Counter {
    /// Increases the counter by one.
    pub(crate) fn inc(&self) {
        self.add(1);
    }

    /// Increases the counter by `n`.
    pub(crate) fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// The current value.
    pub(crate) fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// The counters of a cache instance.
#[derive(Debug, Default)]
pub(crate) struct ArcStats {
    /// Reads served from cached data, including reads joining one in flight
    pub(crate) hits: Counter,
    /// Reads that had to go to the backend
    pub(crate) misses: Counter,
    /// Accesses of MRU headers
    pub(crate) mru_hits: Counter,
    /// Accesses of MFU headers
    pub(crate) mfu_hits: Counter,
    /// Re-reads of headers in the MRU ghost list
    pub(crate) mru_ghost_hits: Counter,
    /// Re-reads of headers in the MFU ghost list
    pub(crate) mfu_ghost_hits: Counter,
    /// Headers the evictor skipped because of I/O or prefetch protection
    pub(crate) evict_skip: Counter,
    /// Headers or buffers the evictor could not lock
    pub(crate) mutex_miss: Counter,
    /// Allocations that could not reuse an evicted region
    pub(crate) recycle_miss: Counter,
    /// Evicted regions reused by an allocation
    pub(crate) stolen: Counter,
    /// Ghost headers destroyed
    pub(crate) deleted: Counter,
    /// Bytes of data evicted
    pub(crate) evicted_bytes: Counter,
    /// Reads that joined a read in flight
    pub(crate) duplicate_reads: Counter,
    /// Buffers cloned for additional readers
    pub(crate) duplicate_buffers: Counter,
    /// Reservations refused because of memory pressure
    pub(crate) memory_throttle: Counter,
}

/// A point-in-time copy of the counters of a cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Reads served from cached data, including reads joining one in flight
    pub hits: u64,
    /// Reads that had to go to the backend
    pub misses: u64,
    /// Accesses of MRU headers
    pub mru_hits: u64,
    /// Accesses of MFU headers
    pub mfu_hits: u64,
    /// Re-reads of headers in the MRU ghost list
    pub mru_ghost_hits: u64,
    /// Re-reads of headers in the MFU ghost list
    pub mfu_ghost_hits: u64,
    /// Headers the evictor skipped because of I/O or prefetch protection
    pub evict_skip: u64,
    /// Headers or buffers the evictor could not lock
    pub mutex_miss: u64,
    /// Allocations that could not reuse an evicted region
    pub recycle_miss: u64,
    /// Evicted regions reused by an allocation
    pub stolen: u64,
    /// Ghost headers destroyed
    pub deleted: u64,
    /// Bytes of data evicted
    pub evicted_bytes: u64,
    /// Reads that joined a read in flight
    pub duplicate_reads: u64,
    /// Buffers cloned for additional readers
    pub duplicate_buffers: u64,
    /// Reservations refused because of memory pressure
    pub memory_throttle: u64,
    /// Inserts into a non-empty shard of the hash index
    pub hash_collisions: u64,
}

impl ArcStats {
    /// Copies the counters.
    pub(crate) fn snapshot(&self, hash_collisions: u64) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.get(),
            misses: self.misses.get(),
            mru_hits: self.mru_hits.get(),
            mfu_hits: self.mfu_hits.get(),
            mru_ghost_hits: self.mru_ghost_hits.get(),
            mfu_ghost_hits: self.mfu_ghost_hits.get(),
            evict_skip: self.evict_skip.get(),
            mutex_miss: self.mutex_miss.get(),
            recycle_miss: self.recycle_miss.get(),
            stolen: self.stolen.get(),
            deleted: self.deleted.get(),
            evicted_bytes: self.evicted_bytes.get(),
            duplicate_reads: self.duplicate_reads.get(),
            duplicate_buffers: self.duplicate_buffers.get(),
            memory_throttle: self.memory_throttle.get(),
            hash_collisions,
        }
    }
}
