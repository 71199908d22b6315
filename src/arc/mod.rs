//! An adaptive replacement cache of storage blocks.
//!
//! The cache keeps blocks in four lists: blocks used once recently (MRU),
//! blocks used more than once (MFU), and the ghost lists remembering the
//! identities of blocks recently evicted from either of them. A hit in a ghost
//! list tells the cache which of the live lists deserves more space, and the
//! target share of the MRU list moves accordingly.
//!
//! Blocks not cached yet, or released for mutation, are anonymous. A written
//! block becomes cached once the storage assigns its identity.

mod adapt;
mod block;
mod buffer;
mod builder;
mod error;
mod evict;
mod hash;
mod header;
mod lifecycle;
mod read;
mod reclaim;
mod refcount;
mod state;
mod stats;
#[cfg(test)]
mod tests;
mod write;

use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use self::block::{BlockId, BlockPointer, ContentType};
pub use self::buffer::{Buffer, EvictionCallback};
pub use self::builder::BlockCacheBuilder;
pub use self::error::{CacheError, CacheResult};
pub use self::header::StateKind;
pub use self::read::{ReadDone, ReadFlags, ReadStatus};
pub use self::reclaim::{ManualMonitor, MemoryMonitor, NoPressure, ReclaimStrategy};
pub use self::refcount::RefTag;
pub use self::stats::StatsSnapshot;
pub use self::write::{WriteDone, WriteHandle, WriteReady};
use self::adapt::Targets;
use self::buffer::BufferInner;
use self::hash::HashIndex;
use self::reclaim::ReclaimState;
use self::state::ArcState;
use self::stats::ArcStats;
use crate::backend::BlockStorage;
use crate::config::CacheParams;
use crate::metrics::ARC_METRICS;

/// The cache context. Every list, counter and target of a cache instance
/// lives here.
///
/// A cache is shared as `Arc<BlockCache>` and built by
/// [`BlockCacheBuilder`].
pub struct BlockCache {
    /// The name of the cache, the label of its metrics
    name: String,
    /// The tunables
    params: CacheParams,
    /// The storage blocks are read from and written to
    storage: Arc<dyn BlockStorage>,
    /// The source of memory pressure
    monitor: Arc<dyn MemoryMonitor>,
    /// The identity to header index
    index: HashIndex,
    /// The five states, indexed by `StateKind::index`
    states: [ArcState; 5],
    /// The targets
    targets: Targets,
    /// The evicted buffers whose callbacks wait to be invoked
    evicted: Mutex<Vec<Arc<BufferInner>>>,
    /// The counters
    stats: ArcStats,
    /// The state of the reclaim worker
    reclaim: Mutex<ReclaimState>,
    /// Wakes up the reclaim worker
    wakeup: Arc<Notify>,
    /// Stops the reclaim worker
    shutdown: CancellationToken,
    /// The next header serial
    next_serial: AtomicU64,
}

impl Debug for BlockCache {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockCache")
            .field("name", &self.name)
            .field("target_total", &self.target_total())
            .field("target_mru", &self.target_mru())
            .field("size", &self.size())
            .field("index", &self.index)
            .field("states", &self.states)
            .finish()
    }
}

impl BlockCache {
    /// Creates the cache context. The reclaim worker is started by the
    /// builder.
    fn new(
        name: String,
        params: CacheParams,
        storage: Arc<dyn BlockStorage>,
        monitor: Arc<dyn MemoryMonitor>,
    ) -> Self {
        let targets = Targets::new(params.min_size, params.max_size, params.meta_limit);
        let reclaim = ReclaimState::new(params.grow_retry);
        Self {
            index: HashIndex::new(params.shard_num),
            states: StateKind::ALL.map(ArcState::new),
            targets,
            evicted: Mutex::new(Vec::new()),
            stats: ArcStats::default(),
            reclaim: Mutex::new(reclaim),
            wakeup: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
            next_serial: AtomicU64::new(1),
            name,
            params,
            storage,
            monitor,
        }
    }

    /// The name of the cache.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The tunables of the cache.
    #[must_use]
    pub fn params(&self) -> &CacheParams {
        &self.params
    }

    /// Allocates a header serial.
    fn next_serial(&self) -> u64 {
        self.next_serial.fetch_add(1, Ordering::Relaxed)
    }

    /// The total bytes of the state `kind`.
    #[must_use]
    pub fn state_size(&self, kind: StateKind) -> usize {
        self.state(kind).size()
    }

    /// The evictable bytes of the state `kind`.
    #[must_use]
    pub fn evictable_size(&self, kind: StateKind) -> usize {
        self.state(kind).evictable_total()
    }

    /// The number of headers in the state `kind`.
    #[must_use]
    pub fn state_len(&self, kind: StateKind) -> usize {
        self.state(kind).len()
    }

    /// The number of indexed blocks.
    #[must_use]
    pub fn indexed_blocks(&self) -> usize {
        self.index.len()
    }

    /// The state the block `id` is cached in, `None` if it is unknown.
    #[must_use]
    pub fn state_of(&self, id: &BlockId) -> Option<StateKind> {
        self.index.find(id).map(|header| header.kind())
    }

    /// Copies the counters of the cache.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(self.index.collisions())
    }

    /// Stops the reclaim worker. The cache keeps serving requests.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!(name = %self.name, "cache shuts down");
            self.shutdown.cancel();
        }
    }

    /// Records a hit in the metrics.
    fn record_hit(&self) {
        self.stats.hits.inc();
        ARC_METRICS.hit(&self.name);
    }

    /// Records a miss in the metrics.
    fn record_miss(&self) {
        self.stats.misses.inc();
        ARC_METRICS.miss(&self.name);
    }

    /// Checks every state counter against its list.
    ///
    /// Locks every header, only used when the cache is quiescent.
    #[cfg(test)]
    pub(crate) fn check_accounting(&self) {
        for state in &self.states {
            let (size, evictable) = state.recount();
            assert_eq!(size, state.size(), "size of {:?}", state.kind());
            assert_eq!(
                evictable,
                state.evictable_total(),
                "evictable size of {:?}",
                state.kind()
            );
        }
    }
}

impl Drop for BlockCache {
    #[inline]
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
