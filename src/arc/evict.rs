//! The eviction engine.
//!
//! The evictor walks a state list from its oldest entry while holding the
//! list lock. It never blocks on a header or a buffer: a header or buffer
//! that cannot be locked at once is skipped and counted as a miss.

use std::sync::{Arc, Weak};
use std::time::Instant;

use clippy_utilities::{Cast, OverflowArithmetic};
use tracing::debug;

use super::block::ContentType;
use super::buffer::BufferInner;
use super::header::{HeaderGuard, StateKind};
use super::state::ListEntry;
use super::BlockCache;

/// What a pass of the evictor achieved.
#[derive(Debug, Default)]
pub(crate) struct EvictOutcome {
    /// The recycled region
    pub(crate) stolen: Option<Vec<u8>>,
    /// The bytes evicted
    pub(crate) evicted: usize,
    /// The headers skipped because of I/O or prefetch protection
    pub(crate) skipped: usize,
    /// The headers or buffers that could not be locked
    pub(crate) missed: usize,
}

impl BlockCache {
    /// Evicts `bytes` of `content` from the live state `kind` into its ghost
    /// state.
    ///
    /// With `recycle`, a region of exactly `bytes` is taken from an evicted
    /// buffer and returned instead of being freed.
    pub(crate) fn evict(
        &self,
        kind: StateKind,
        bytes: usize,
        recycle: bool,
        content: ContentType,
    ) -> Option<Vec<u8>> {
        self.evict_inner(kind, bytes, recycle, content, true).stolen
    }

    /// Picks the content type to evict when recycling a region.
    fn recycle_content(&self, kind: StateKind, content: ContentType) -> ContentType {
        let state = self.state(kind);
        if state.evictable(ContentType::Data) == 0 {
            ContentType::Metadata
        } else if state.evictable(ContentType::Metadata) == 0 {
            ContentType::Data
        } else if self.meta_used() >= self.meta_limit() {
            ContentType::Metadata
        } else {
            content
        }
    }

    /// Evicts from `kind`. Without `honor_lifespan`, young prefetched blocks
    /// are evicted as well.
    pub(crate) fn evict_inner(
        &self,
        kind: StateKind,
        bytes: usize,
        mut recycle: bool,
        mut content: ContentType,
        honor_lifespan: bool,
    ) -> EvictOutcome {
        debug_assert!(
            matches!(kind, StateKind::Mru | StateKind::Mfu),
            "only live states are evicted"
        );
        if recycle {
            let actual = self.recycle_content(kind, content);
            if actual != content {
                recycle = false;
                content = actual;
            }
        }

        let now = Instant::now();
        let lifespan = self.params.min_prefetch_lifespan;
        let state = self.state(kind);
        let ghost = self.state(kind.ghost());
        let mut outcome = EvictOutcome::default();
        let mut deferred: Vec<Arc<BufferInner>> = Vec::new();

        {
            let mut ghost_list = ghost.lock();
            let mut list = state.lock();
            let mut victims: Vec<HeaderGuard> = Vec::new();

            let mut entries = list.values().peekable();
            while let Some(entry) = entries.next() {
                if outcome.evicted >= bytes {
                    break;
                }
                if entry.content != content {
                    continue;
                }
                // Leave this one for a candidate of the exact size.
                if recycle
                    && entry.size != bytes
                    && entries
                        .peek()
                        .is_some_and(|next| next.size == bytes && next.content == content)
                {
                    continue;
                }
                let Some(mut header) = entry.header.try_lock_arc() else {
                    outcome.missed = outcome.missed.overflow_add(1);
                    continue;
                };
                if !header.refs.is_zero() {
                    continue;
                }
                let protected = (header.flags.prefetch || header.flags.indirect)
                    && honor_lifespan
                    && now.saturating_duration_since(header.last_access) < lifespan;
                if header.flags.io_in_progress || protected {
                    outcome.skipped = outcome.skipped.overflow_add(1);
                    continue;
                }

                while let Some(buffer) = header.buffers().last().cloned() {
                    let Some(mut slot) = buffer.slot.try_lock() else {
                        outcome.missed = outcome.missed.overflow_add(1);
                        break;
                    };
                    let Some(mut data) = buffer.data.try_write() else {
                        outcome.missed = outcome.missed.overflow_add(1);
                        break;
                    };
                    let _: Option<Arc<BufferInner>> = header.pop_buffer();
                    state.sub_size(&header, header.size);
                    slot.header = Weak::new();
                    if slot.on_evict.is_some() {
                        deferred.push(Arc::clone(&buffer));
                    }
                    if let Some(region) = data.take() {
                        if recycle && outcome.stolen.is_none() && region.len() == bytes {
                            outcome.stolen = Some(region);
                            self.stats.stolen.inc();
                        } else {
                            self.space_return(buffer.size, header.content);
                        }
                    }
                    outcome.evicted = outcome.evicted.overflow_add(buffer.size);
                }

                if header.datacnt() == 0 {
                    victims.push(header);
                }
            }

            for mut header in victims {
                let _: Option<ListEntry> = state.unlink(&mut list, &header);
                header.set_kind(kind.ghost());
                header.flags.buf_available = false;
                header.frozen_checksum = None;
                ghost.link(&mut ghost_list, &header);
                debug!(
                    identity = ?header.identity,
                    from = ?kind,
                    "block evicted to ghost list"
                );
            }
        }

        self.stats.evicted_bytes.add(outcome.evicted.cast());
        self.stats.evict_skip.add(outcome.skipped.cast());
        self.stats.mutex_miss.add(outcome.missed.cast());
        if !deferred.is_empty() {
            self.evicted.lock().append(&mut deferred);
            self.signal_reclaim();
        }

        if self.is_growth_suppressed() {
            let mru_ghost = self.state(StateKind::MruGhost);
            let ghost_sum = mru_ghost
                .size()
                .saturating_add(self.state(StateKind::MfuGhost).size());
            let total = self.target_total();
            if ghost_sum > total {
                let to_delete = mru_ghost.evictable_total().min(ghost_sum.overflow_sub(total));
                if to_delete > 0 {
                    let _: (usize, usize) = self.evict_ghost(StateKind::MruGhost, to_delete);
                }
            }
        }
        outcome
    }

    /// Destroys `bytes` worth of ghost headers of `kind`, oldest first.
    ///
    /// Returns the bytes destroyed and the number of headers that could not
    /// be locked.
    pub(crate) fn evict_ghost(&self, kind: StateKind, bytes: usize) -> (usize, usize) {
        debug_assert!(kind.is_ghost(), "only ghost states are trimmed");
        let state = self.state(kind);
        let mut deleted = 0_usize;
        let mut missed = 0_usize;

        let mut list = state.lock();
        let mut victims: Vec<HeaderGuard> = Vec::new();
        for entry in list.values() {
            if deleted >= bytes {
                break;
            }
            let Some(header) = entry.header.try_lock_arc() else {
                missed = missed.overflow_add(1);
                continue;
            };
            if !header.refs.is_zero() || header.flags.io_in_progress {
                continue;
            }
            deleted = deleted.overflow_add(header.size);
            victims.push(header);
        }
        for mut header in victims {
            let _: Option<ListEntry> = state.unlink(&mut list, &header);
            self.index.remove(&mut header);
            header.identity = None;
            self.stats.deleted.inc();
        }
        drop(list);

        self.stats.mutex_miss.add(missed.cast());
        (deleted, missed)
    }

    /// Evicts everything evictable, including the ghost lists.
    ///
    /// Unlike the evictor used on insert, this keeps retrying the headers it
    /// could not lock until nothing evictable remains.
    pub fn flush_all(&self) {
        loop {
            let mut missed = 0;
            for kind in [StateKind::Mru, StateKind::Mfu] {
                for content in ContentType::ALL {
                    while self.state(kind).evictable(content) > 0 {
                        let outcome = self.evict_inner(kind, usize::MAX, false, content, false);
                        missed = missed.overflow_add(outcome.missed);
                        if outcome.evicted == 0 {
                            break;
                        }
                    }
                }
            }
            for kind in [StateKind::MruGhost, StateKind::MfuGhost] {
                let (_, ghost_missed) = self.evict_ghost(kind, usize::MAX);
                missed = missed.overflow_add(ghost_missed);
            }
            if missed == 0 {
                break;
            }
            std::thread::yield_now();
        }
        self.do_user_evicts();
    }
}
