//! The state lists, reference counting and the state machine of headers.

use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hashlink::LinkedHashMap;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, MutexGuard};
use tracing::trace;

use super::block::ContentType;
use super::header::{Header, HeaderGuard, HeaderRef, StateKind};
use super::refcount::RefTag;
use super::BlockCache;

/// An entry of a state list.
///
/// The size and the content type never change during the life of a header,
/// so the evictor reads them here without locking the header.
#[derive(Debug)]
pub(crate) struct ListEntry {
    /// The header
    pub(crate) header: HeaderRef,
    /// The size of the block
    pub(crate) size: usize,
    /// The content type of the block
    pub(crate) content: ContentType,
}

/// A state list, keyed by header serial. The front is the oldest entry.
pub(crate) type StateList = LinkedHashMap<u64, ListEntry>;

/// One of the five states of the cache.
pub(crate) struct ArcState {
    /// The kind of the state
    kind: StateKind,
    /// The headers in the state
    list: Mutex<StateList>,
    /// The bytes of all headers in the state
    size: AtomicUsize,
    /// The bytes of unreferenced headers, per content type
    evictable: [AtomicUsize; 2],
}

impl Debug for ArcState {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArcState")
            .field("kind", &self.kind)
            .field("len", &self.len())
            .field("size", &self.size())
            .field("evictable", &self.evictable_total())
            .finish()
    }
}

impl ArcState {
    /// Creates an empty state.
    pub(crate) fn new(kind: StateKind) -> Self {
        Self {
            kind,
            list: Mutex::new(LinkedHashMap::new()),
            size: AtomicUsize::new(0),
            evictable: [AtomicUsize::new(0), AtomicUsize::new(0)],
        }
    }

    /// The kind of the state.
    pub(crate) fn kind(&self) -> StateKind {
        self.kind
    }

    /// The total bytes.
    pub(crate) fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// The evictable bytes of `content`.
    pub(crate) fn evictable(&self, content: ContentType) -> usize {
        self.evictable
            .get(content.index())
            .map_or(0, |bytes| bytes.load(Ordering::Acquire))
    }

    /// The evictable bytes of all content types.
    pub(crate) fn evictable_total(&self) -> usize {
        ContentType::ALL
            .iter()
            .map(|&content| self.evictable(content))
            .sum()
    }

    /// The number of headers.
    pub(crate) fn len(&self) -> usize {
        self.list.lock().len()
    }

    /// Locks the list.
    pub(crate) fn lock(&self) -> MutexGuard<'_, StateList> {
        self.list.lock()
    }

    /// The evictable counter of `content`.
    fn evictable_counter(&self, content: ContentType) -> &AtomicUsize {
        self.evictable
            .get(content.index())
            .unwrap_or_else(|| unreachable!("There are only two content types."))
    }

    /// Adds evictable bytes.
    pub(crate) fn add_evictable(&self, content: ContentType, bytes: usize) {
        self.evictable_counter(content)
            .fetch_add(bytes, Ordering::AcqRel);
    }

    /// Subtracts evictable bytes.
    pub(crate) fn sub_evictable(&self, content: ContentType, bytes: usize) {
        let prev = self
            .evictable_counter(content)
            .fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes, "evictable size of {:?} underflows", self.kind);
    }

    /// Accounts `bytes` more for `header`, which is in this state.
    pub(crate) fn add_size(&self, header: &Header, bytes: usize) {
        self.size.fetch_add(bytes, Ordering::AcqRel);
        if header.is_evictable() {
            self.add_evictable(header.content, bytes);
        }
    }

    /// Accounts `bytes` less for `header`, which is in this state.
    pub(crate) fn sub_size(&self, header: &Header, bytes: usize) {
        let prev = self.size.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes, "size of {:?} underflows", self.kind);
        if header.is_evictable() {
            self.sub_evictable(header.content, bytes);
        }
    }

    /// Links `header` into the locked list as the newest entry.
    pub(crate) fn link(&self, list: &mut StateList, header: &HeaderGuard) {
        debug_assert_eq!(header.kind(), self.kind);
        let entry = ListEntry {
            header: Arc::clone(ArcMutexGuard::mutex(header)),
            size: header.size,
            content: header.content,
        };
        list.insert(header.serial, entry);
        self.add_size(header, header.accounted_size());
    }

    /// Unlinks `header` from the locked list.
    pub(crate) fn unlink(&self, list: &mut StateList, header: &Header) -> Option<ListEntry> {
        debug_assert_eq!(header.kind(), self.kind);
        let entry = list.remove(&header.serial)?;
        self.sub_size(header, header.accounted_size());
        Some(entry)
    }

    /// Links `header` as the newest entry.
    pub(crate) fn insert(&self, header: &HeaderGuard) {
        let mut list = self.lock();
        self.link(&mut list, header);
    }

    /// Unlinks `header`.
    pub(crate) fn remove(&self, header: &Header) -> Option<ListEntry> {
        let mut list = self.lock();
        self.unlink(&mut list, header)
    }

    /// Makes the header with `serial` the newest entry.
    pub(crate) fn touch(&self, serial: u64) {
        let mut list = self.lock();
        let _: Option<&mut ListEntry> = list.to_back(&serial);
    }

    /// Checks the counters against the list, returns `(size, evictable)`
    /// summed over the headers.
    ///
    /// Locks every header, only used when the cache is quiescent.
    #[cfg(test)]
    pub(crate) fn recount(&self) -> (usize, usize) {
        let list = self.lock();
        list.values().fold((0, 0), |(size, evictable), entry| {
            let header = entry.header.lock();
            let bytes = header.accounted_size();
            let evictable_bytes = if header.is_evictable() { bytes } else { 0 };
            (size + bytes, evictable + evictable_bytes)
        })
    }
}

impl BlockCache {
    /// The state of `kind`.
    pub(crate) fn state(&self, kind: StateKind) -> &ArcState {
        self.states
            .get(kind.index())
            .unwrap_or_else(|| unreachable!("There are only five states."))
    }

    /// Adds a reference held by `tag`. The first reference makes a cached
    /// header unevictable.
    pub(crate) fn add_reference(&self, header: &mut Header, tag: RefTag) -> usize {
        let kind = header.kind();
        let count = header.refs.add(tag);
        if count == 1 && kind != StateKind::Anon {
            self.state(kind)
                .sub_evictable(header.content, header.accounted_size());
        }
        header.flags.prefetch = false;
        count
    }

    /// Removes a reference held by `tag`. Dropping the last reference makes a
    /// cached header evictable again, as the newest entry of its list.
    ///
    /// # Panics
    /// Panics if `tag` holds no reference on the header.
    pub(crate) fn remove_reference(&self, header: &mut Header, tag: RefTag) -> usize {
        let count = header.refs.remove(tag);
        let kind = header.kind();
        if count == 0 && kind != StateKind::Anon {
            let state = self.state(kind);
            state.add_evictable(header.content, header.accounted_size());
            state.touch(header.serial);
        }
        count
    }

    /// Moves the header to the state `new`.
    ///
    /// Moving to `Anon` takes the header out of the hash index and discards
    /// its identity.
    pub(crate) fn change_state(&self, header: &mut HeaderGuard, new: StateKind) {
        let old = header.kind();
        if new == StateKind::Anon {
            if header.flags.in_hash {
                self.index.remove(header);
            }
            header.identity = None;
        } else {
            debug_assert!(
                header.flags.in_hash,
                "a cached header must be in the hash index"
            );
        }
        if old == new {
            return;
        }

        let _: Option<ListEntry> = self.state(old).remove(header);
        header.set_kind(new);
        self.state(new).insert(header);
        trace!(
            serial = header.serial,
            identity = ?header.identity,
            ?old,
            ?new,
            "header changed state"
        );
    }

    /// Records an access of the header and moves it between states.
    pub(crate) fn access(&self, header: &mut HeaderGuard) {
        let now = Instant::now();
        match header.kind() {
            StateKind::Anon => {
                // Not cached and not remembered by a ghost list.
                header.last_access = now;
                self.change_state(header, StateKind::Mru);
            }
            StateKind::Mru => {
                if header.flags.prefetch {
                    // A prefetched block is promoted by its first real use.
                    if !header.refs.is_zero() {
                        header.flags.prefetch = false;
                        self.stats.mru_hits.inc();
                    }
                    header.last_access = now;
                    return;
                }
                if now.saturating_duration_since(header.last_access)
                    > self.params.mru_promote_delay
                {
                    header.last_access = now;
                    self.change_state(header, StateKind::Mfu);
                }
                self.stats.mru_hits.inc();
            }
            StateKind::MruGhost => {
                let new = if header.flags.prefetch {
                    StateKind::Mru
                } else {
                    StateKind::Mfu
                };
                header.last_access = now;
                self.change_state(header, new);
                self.stats.mru_ghost_hits.inc();
            }
            StateKind::Mfu => {
                header.last_access = now;
                self.stats.mfu_hits.inc();
            }
            StateKind::MfuGhost => {
                let new = if header.flags.prefetch {
                    StateKind::Mru
                } else {
                    StateKind::Mfu
                };
                header.last_access = now;
                self.change_state(header, new);
                self.stats.mfu_ghost_hits.inc();
            }
        }

        if header.refs.is_zero() {
            self.state(header.kind()).touch(header.serial);
        }
    }
}
