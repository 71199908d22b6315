//! The target sizes of the cache and how they adapt to the workload.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use clippy_utilities::OverflowArithmetic;
use tracing::{debug, info};

use super::block::ContentType;
use super::error::{CacheError, CacheResult};
use super::header::StateKind;
use super::BlockCache;

/// The cap of the weight of a ghost hit.
const MAX_GHOST_WEIGHT: usize = 10;

/// The global targets of the cache.
#[derive(Debug)]
pub(crate) struct Targets {
    /// The size the cache aims at, `c`
    total: AtomicUsize,
    /// The share of `total` for the MRU side, `p`
    mru: AtomicUsize,
    /// The floor of `total`
    min: usize,
    /// The ceiling of `total`
    max: usize,
    /// The bytes of all allocated data regions
    size: AtomicUsize,
    /// The bytes of allocated metadata regions
    meta_used: AtomicUsize,
    /// The ceiling of `meta_used` before metadata is evicted first
    meta_limit: usize,
    /// Growth is suppressed after memory pressure
    no_grow: AtomicBool,
    /// The bytes writers reserved for data about to be dirtied
    tempreserve: AtomicUsize,
    /// The bytes of anonymous buffers on loan to consumers
    loaned: AtomicUsize,
}

impl Targets {
    /// Creates the targets. The cache starts at its maximum size, split
    /// evenly between the MRU and MFU sides.
    pub(crate) fn new(min: usize, max: usize, meta_limit: usize) -> Self {
        Self {
            total: AtomicUsize::new(max),
            mru: AtomicUsize::new(max / 2),
            min,
            max,
            size: AtomicUsize::new(0),
            meta_used: AtomicUsize::new(0),
            meta_limit,
            no_grow: AtomicBool::new(false),
            tempreserve: AtomicUsize::new(0),
            loaned: AtomicUsize::new(0),
        }
    }
}

impl BlockCache {
    /// The size the cache aims at.
    #[must_use]
    pub fn target_total(&self) -> usize {
        self.targets.total.load(Ordering::Acquire)
    }

    /// The share of the target size for recently used blocks.
    #[must_use]
    pub fn target_mru(&self) -> usize {
        self.targets.mru.load(Ordering::Acquire)
    }

    /// The floor of the target size.
    #[must_use]
    pub fn min_total(&self) -> usize {
        self.targets.min
    }

    /// The ceiling of the target size.
    #[must_use]
    pub fn max_total(&self) -> usize {
        self.targets.max
    }

    /// The bytes of data held by the cache.
    #[must_use]
    pub fn size(&self) -> usize {
        self.targets.size.load(Ordering::Acquire)
    }

    /// The bytes of metadata held by the cache.
    #[must_use]
    pub fn meta_used(&self) -> usize {
        self.targets.meta_used.load(Ordering::Acquire)
    }

    /// The ceiling of metadata before it is evicted first.
    #[must_use]
    pub fn meta_limit(&self) -> usize {
        self.targets.meta_limit
    }

    /// Whether growth of the target size is suppressed.
    #[must_use]
    pub fn is_growth_suppressed(&self) -> bool {
        self.targets.no_grow.load(Ordering::Acquire)
    }

    /// Suppresses or allows growth of the target size.
    pub(crate) fn set_no_grow(&self, no_grow: bool) {
        self.targets.no_grow.store(no_grow, Ordering::Release);
    }

    /// Sets the target size.
    fn set_target_total(&self, total: usize) {
        self.targets.total.store(total, Ordering::Release);
    }

    /// Sets the share of recently used blocks.
    fn set_target_mru(&self, mru: usize) {
        self.targets.mru.store(mru, Ordering::Release);
    }

    /// Accounts a newly allocated data region.
    pub(crate) fn space_consume(&self, bytes: usize, content: ContentType) {
        self.targets.size.fetch_add(bytes, Ordering::AcqRel);
        if content == ContentType::Metadata {
            self.targets.meta_used.fetch_add(bytes, Ordering::AcqRel);
        }
    }

    /// Accounts a freed data region.
    pub(crate) fn space_return(&self, bytes: usize, content: ContentType) {
        let prev = self.targets.size.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes, "the size of the cache underflows");
        if content == ContentType::Metadata {
            self.targets.meta_used.fetch_sub(bytes, Ordering::AcqRel);
        }
    }

    /// Whether the system asks for memory back.
    pub(crate) fn reclaim_needed(&self) -> bool {
        self.monitor.available_memory() < 0
    }

    /// Whether `bytes` more of `content` cannot be allocated without
    /// evicting first.
    pub(crate) fn evict_needed(&self, content: ContentType, bytes: usize) -> bool {
        if content == ContentType::Metadata && self.meta_used() >= self.meta_limit() {
            return true;
        }
        if self.reclaim_needed() {
            return true;
        }
        self.size().saturating_add(bytes) > self.target_total()
    }

    /// The bytes reserved with [`BlockCache::tempreserve_space`].
    #[must_use]
    pub fn tempreserve(&self) -> usize {
        self.targets.tempreserve.load(Ordering::Acquire)
    }

    /// The bytes of buffers on loan, see [`BlockCache::loan_buffer`].
    #[must_use]
    pub fn loaned_bytes(&self) -> usize {
        self.targets.loaned.load(Ordering::Acquire)
    }

    /// Accounts `bytes` more or less on loan.
    pub(crate) fn add_loaned(&self, bytes: usize) {
        self.targets.loaned.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Accounts `bytes` back from loan.
    pub(crate) fn sub_loaned(&self, bytes: usize) {
        let prev = self.targets.loaned.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes, "the loaned bytes underflow");
    }

    /// Reserves `reserve` bytes for data a writer is about to dirty.
    ///
    /// A reservation larger than a quarter of the target lets the target
    /// grow to four times the reservation, unless growth is suppressed. The
    /// reservation must be given back with [`BlockCache::tempreserve_clear`].
    ///
    /// # Errors
    /// Returns [`CacheError::OutOfMemory`] if the reservation can never fit
    /// the target, and [`CacheError::Throttled`] if it cannot fit now: the
    /// system asks for memory back, or anonymous data already fills a
    /// quarter of the target and the reservation would overcommit half of it.
    pub fn tempreserve_space(&self, reserve: usize) -> CacheResult<()> {
        if reserve > self.target_total() / 4 && !self.is_growth_suppressed() {
            let total = reserve.saturating_mul(4).min(self.targets.max);
            self.set_target_total(total.max(self.target_total()));
        }
        let total = self.target_total();
        if reserve > total {
            return Err(CacheError::OutOfMemory { size: reserve });
        }

        // Loaned buffers are already accounted by their holders.
        let anon = self
            .state(StateKind::Anon)
            .size()
            .saturating_sub(self.loaned_bytes());

        self.memory_throttle(reserve)?;

        let tempreserve = self.tempreserve();
        if reserve.saturating_add(tempreserve).saturating_add(anon) > total / 2
            && anon > total / 4
        {
            debug!(
                reserve,
                tempreserve,
                anon,
                target_total = total,
                "reservation throttled by dirty data"
            );
            return Err(CacheError::Throttled { reserve });
        }
        self.targets.tempreserve.fetch_add(reserve, Ordering::AcqRel);
        Ok(())
    }

    /// Gives back a reservation made with [`BlockCache::tempreserve_space`].
    pub fn tempreserve_clear(&self, reserve: usize) {
        let prev = self.targets.tempreserve.fetch_sub(reserve, Ordering::AcqRel);
        debug_assert!(prev >= reserve, "the reserved bytes underflow");
    }

    /// Refuses a reservation while the system asks for memory back, and
    /// wakes the reclaim worker so that the pressure goes away.
    fn memory_throttle(&self, reserve: usize) -> CacheResult<()> {
        if !self.reclaim_needed() {
            return Ok(());
        }
        self.stats.memory_throttle.inc();
        self.signal_reclaim();
        debug!(reserve, "reservation throttled by memory pressure");
        Err(CacheError::Throttled { reserve })
    }

    /// Adapts the targets to an insert of `bytes` coming from `origin`.
    ///
    /// A hit in a ghost list moves the MRU share towards the list the ghost
    /// was evicted from. The weight of the move grows with the size of the
    /// other ghost list.
    pub(crate) fn adapt(&self, bytes: usize, origin: StateKind) {
        let total = self.target_total();
        let p_min = total >> self.params.p_min_shift;
        let mru_ghost = self.state(StateKind::MruGhost).size();
        let mfu_ghost = self.state(StateKind::MfuGhost).size();

        match origin {
            StateKind::MruGhost if mru_ghost > 0 => {
                let weight = if mru_ghost >= mfu_ghost {
                    1
                } else {
                    (mfu_ghost / mru_ghost).min(MAX_GHOST_WEIGHT)
                };
                let mru = self
                    .target_mru()
                    .saturating_add(bytes.saturating_mul(weight))
                    .min(total.saturating_sub(p_min));
                self.set_target_mru(mru);
            }
            StateKind::MfuGhost if mfu_ghost > 0 => {
                let weight = if mfu_ghost >= mru_ghost {
                    1
                } else {
                    (mru_ghost / mfu_ghost).min(MAX_GHOST_WEIGHT)
                };
                let mru = self.target_mru();
                let delta = bytes.saturating_mul(weight).min(mru);
                self.set_target_mru(mru.overflow_sub(delta).max(p_min));
            }
            // A ghost list without size cannot weigh the hit, leave the share
            // as it is.
            StateKind::Anon
            | StateKind::Mru
            | StateKind::Mfu
            | StateKind::MruGhost
            | StateKind::MfuGhost => {}
        }

        if self.reclaim_needed() {
            self.signal_reclaim();
            return;
        }
        if self.is_growth_suppressed() || total >= self.targets.max {
            return;
        }

        // Grow the target if the cache is about to be full.
        let grow_threshold = total.saturating_sub(self.params.max_block_size.saturating_mul(2));
        if self.size() > grow_threshold {
            let total = total.saturating_add(bytes).min(self.targets.max);
            self.set_target_total(total);
            if origin == StateKind::Anon {
                self.set_target_mru(self.target_mru().saturating_add(bytes));
            }
            debug!(target_total = total, "cache target grows");
        }

        let total = self.target_total();
        if self.target_mru() > total {
            self.set_target_mru(total);
        }
    }

    /// Allocates a data region of `size` bytes for a header coming from
    /// `origin`, evicting if the cache is full.
    ///
    /// The evictor is asked for a region of the same size to recycle. Only
    /// when none is found is a new region allocated.
    pub(crate) fn get_data_buf(
        &self,
        origin: StateKind,
        prefetch: bool,
        size: usize,
        content: ContentType,
    ) -> CacheResult<Vec<u8>> {
        self.adapt(size, origin);

        let mut region = None;
        if self.evict_needed(content, size) {
            let side = match origin {
                // A prefetch from the MFU ghost list ends up on the MRU side.
                StateKind::MfuGhost if !prefetch => StateKind::Mfu,
                StateKind::MfuGhost | StateKind::MruGhost => StateKind::Mru,
                StateKind::Anon | StateKind::Mru | StateKind::Mfu => origin,
            };
            let victim = if side == StateKind::Mfu {
                let mfu_space = self.target_total().saturating_sub(self.target_mru());
                let mru = self.state(StateKind::Mru);
                if mru.evictable(content) >= size
                    && mfu_space > self.state(StateKind::Mfu).size()
                {
                    StateKind::Mru
                } else {
                    StateKind::Mfu
                }
            } else {
                let mru_used = self
                    .state(StateKind::Anon)
                    .size()
                    .saturating_add(self.state(StateKind::Mru).size());
                if self.state(StateKind::Mfu).evictable(content) >= size
                    && self.target_mru() > mru_used
                {
                    StateKind::Mfu
                } else {
                    StateKind::Mru
                }
            };
            region = self.evict(victim, size, true, content);
            if region.is_none() {
                self.stats.recycle_miss.inc();
            }
        }

        let region = match region {
            Some(region) => region,
            None => {
                let region = allocate(size)?;
                self.space_consume(size, content);
                region
            }
        };

        // Growing with anonymous data past the MRU share moves the share.
        if origin == StateKind::Anon && self.size() < self.target_total() {
            let mru_used = self
                .state(StateKind::Anon)
                .size()
                .saturating_add(self.state(StateKind::Mru).size())
                .saturating_add(size);
            if mru_used > self.target_mru() {
                self.set_target_mru(
                    self.target_mru()
                        .saturating_add(size)
                        .min(self.target_total()),
                );
            }
        }
        Ok(region)
    }

    /// Shrinks the target size by `to_free` bytes under memory pressure, and
    /// evicts if the cache is over the new target.
    pub fn shrink(&self, to_free: usize) {
        let total = self.target_total();
        let min = self.targets.min;
        if total > min {
            let total = if total > min.saturating_add(to_free) {
                total.overflow_sub(to_free)
            } else {
                min
            };
            let mru = self.target_mru();
            let mru = mru.overflow_sub(mru >> self.params.shrink_shift);
            let size = self.size();
            let total = if total > size { size.max(min) } else { total };
            let mru = if mru > total { total / 2 } else { mru };
            self.set_target_total(total);
            self.set_target_mru(mru);
            info!(
                target_total = total,
                target_mru = mru,
                "cache target shrinks"
            );
        }

        if self.size() > self.target_total() {
            self.adjust();
        }
    }

    /// Evicts until the lists fit the targets again.
    ///
    /// The MRU side is trimmed to its share, then the MFU side to the
    /// remaining target, then the ghost lists to the target size.
    pub fn adjust(&self) {
        let total = self.target_total();
        let mru = self.state(StateKind::Mru);
        let mru_used = self.state(StateKind::Anon).size().saturating_add(mru.size());
        let adjustment = self
            .size()
            .saturating_sub(total)
            .min(mru_used.saturating_sub(self.target_mru()));
        self.evict_by_type(StateKind::Mru, adjustment);

        let adjustment = self.size().saturating_sub(self.target_total());
        self.evict_by_type(StateKind::Mfu, adjustment);

        let mru_ghost = self.state(StateKind::MruGhost);
        let mfu_ghost = self.state(StateKind::MfuGhost);
        let adjustment = mru.size().saturating_add(mru_ghost.size()).saturating_sub(total);
        if adjustment > 0 && mru_ghost.size() > 0 {
            self.evict_ghost(StateKind::MruGhost, adjustment.min(mru_ghost.size()));
        }

        let adjustment = mru_ghost
            .size()
            .saturating_add(mfu_ghost.size())
            .saturating_sub(total);
        if adjustment > 0 && mfu_ghost.size() > 0 {
            self.evict_ghost(StateKind::MfuGhost, adjustment.min(mfu_ghost.size()));
        }
    }

    /// Evicts `adjustment` bytes from `kind`, data first.
    fn evict_by_type(&self, kind: StateKind, mut adjustment: usize) {
        for content in [ContentType::Data, ContentType::Metadata] {
            let evictable = self.state(kind).evictable(content);
            if adjustment == 0 {
                return;
            }
            if evictable > 0 {
                let delta = evictable.min(adjustment);
                let _: Option<Vec<u8>> = self.evict(kind, delta, false, content);
                adjustment = adjustment.overflow_sub(delta);
            }
        }
    }
}

/// Allocates a zeroed region, reporting failure instead of aborting.
pub(crate) fn allocate(size: usize) -> CacheResult<Vec<u8>> {
    let mut region = Vec::new();
    region
        .try_reserve_exact(size)
        .map_err(|_| CacheError::OutOfMemory { size })?;
    region.resize(size, 0);
    Ok(region)
}
