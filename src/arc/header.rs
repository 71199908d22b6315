//! The per-block bookkeeping of the cache.

use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use serde::Serialize;
use smallvec::SmallVec;
use tokio_util::sync::CancellationToken;

use super::block::{BlockId, ContentType};
use super::buffer::BufferInner;
use super::read::ReadDone;
use super::refcount::{RefCount, RefTag};

/// A shared handle of a header. The mutex is the per-block lock.
pub(crate) type HeaderRef = Arc<Mutex<Header>>;

/// A locked header, which keeps the header alive while locked.
pub(crate) type HeaderGuard = ArcMutexGuard<RawMutex, Header>;

/// The buffers owned by a header.
pub(crate) type Buffers = SmallVec<[Arc<BufferInner>; 1]>;

/// The state a header is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StateKind {
    /// Not cached yet, or released for mutation
    Anon,
    /// Recently used once
    Mru,
    /// Evicted from `Mru`, only the identity is remembered
    MruGhost,
    /// Used more than once
    Mfu,
    /// Evicted from `Mfu`, only the identity is remembered
    MfuGhost,
}

impl StateKind {
    /// All the states.
    pub const ALL: [StateKind; 5] = [
        StateKind::Anon,
        StateKind::Mru,
        StateKind::MruGhost,
        StateKind::Mfu,
        StateKind::MfuGhost,
    ];

    /// Whether the state only remembers identities.
    #[must_use]
    pub const fn is_ghost(self) -> bool {
        matches!(self, StateKind::MruGhost | StateKind::MfuGhost)
    }

    /// The index of the state in the state table.
    pub(crate) const fn index(self) -> usize {
        match self {
            StateKind::Anon => 0,
            StateKind::Mru => 1,
            StateKind::MruGhost => 2,
            StateKind::Mfu => 3,
            StateKind::MfuGhost => 4,
        }
    }

    /// The ghost state evicted headers of a live state go to.
    pub(crate) fn ghost(self) -> StateKind {
        match self {
            StateKind::Mru => StateKind::MruGhost,
            StateKind::Mfu => StateKind::MfuGhost,
            StateKind::Anon | StateKind::MruGhost | StateKind::MfuGhost => {
                unreachable!("{self:?} has no ghost state")
            }
        }
    }
}

/// The state of a header, together with the buffers it owns.
///
/// Ghost headers own no buffer.
#[derive(Debug)]
pub(crate) enum HeaderState {
    /// Anonymous
    Anon(Buffers),
    /// In the MRU list
    Mru(Buffers),
    /// In the MFU list
    Mfu(Buffers),
    /// In the MRU ghost list
    MruGhost,
    /// In the MFU ghost list
    MfuGhost,
}

impl HeaderState {
    /// The kind of the state.
    fn kind(&self) -> StateKind {
        match *self {
            HeaderState::Anon(_) => StateKind::Anon,
            HeaderState::Mru(_) => StateKind::Mru,
            HeaderState::Mfu(_) => StateKind::Mfu,
            HeaderState::MruGhost => StateKind::MruGhost,
            HeaderState::MfuGhost => StateKind::MfuGhost,
        }
    }

    /// Moves to the state `kind`, keeping the buffers.
    ///
    /// # Panics
    /// Panics if a header with buffers moves to a ghost state.
    fn moved_to(self, kind: StateKind) -> Self {
        let buffers = match self {
            HeaderState::Anon(buffers) | HeaderState::Mru(buffers) | HeaderState::Mfu(buffers) => {
                buffers
            }
            HeaderState::MruGhost | HeaderState::MfuGhost => Buffers::new(),
        };
        match kind {
            StateKind::Anon => HeaderState::Anon(buffers),
            StateKind::Mru => HeaderState::Mru(buffers),
            StateKind::Mfu => HeaderState::Mfu(buffers),
            StateKind::MruGhost | StateKind::MfuGhost => {
                assert!(buffers.is_empty(), "a ghost header cannot own buffers");
                if kind == StateKind::MruGhost {
                    HeaderState::MruGhost
                } else {
                    HeaderState::MfuGhost
                }
            }
        }
    }
}

/// The flags of a header.
#[derive(Debug, Default, Clone, Copy)]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct HeaderFlags {
    /// A read or write of the block is in flight
    pub(crate) io_in_progress: bool,
    /// The last read of the block failed
    pub(crate) io_error: bool,
    /// The block was freed while being read
    pub(crate) freed_in_read: bool,
    /// The block was read speculatively and nobody referenced it yet
    pub(crate) prefetch: bool,
    /// The first buffer is not handed to any consumer
    pub(crate) buf_available: bool,
    /// The block is an indirect block
    pub(crate) indirect: bool,
    /// The header is in the hash index
    pub(crate) in_hash: bool,
}

/// A caller waiting for a read in flight.
pub(crate) struct PendingRead {
    /// The tag of the reference the caller holds
    pub(crate) tag: RefTag,
    /// The completion callback
    pub(crate) done: ReadDone,
}

/// The bookkeeping of a block.
pub(crate) struct Header {
    /// The unique serial number, the key in the state lists
    pub(crate) serial: u64,
    /// The identity, `None` while anonymous
    pub(crate) identity: Option<BlockId>,
    /// The size of the block
    pub(crate) size: usize,
    /// The content type of the block
    pub(crate) content: ContentType,
    /// The state and the buffers
    state: HeaderState,
    /// The references held by consumers
    pub(crate) refs: RefCount,
    /// The flags
    pub(crate) flags: HeaderFlags,
    /// The callers waiting for the read in flight
    pub(crate) pending: Vec<PendingRead>,
    /// The checksum of the data, computed when the data is frozen
    pub(crate) frozen_checksum: Option<u64>,
    /// The last time the block was accessed
    pub(crate) last_access: Instant,
    /// Cancelled once the I/O in flight completes, replaced when an I/O starts
    pub(crate) io_done: CancellationToken,
}

impl Debug for Header {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("serial", &self.serial)
            .field("identity", &self.identity)
            .field("size", &self.size)
            .field("content", &self.content)
            .field("state", &self.kind())
            .field("datacnt", &self.datacnt())
            .field("refs", &self.refs.count())
            .field("flags", &self.flags)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Header {
    /// Creates an anonymous header without buffers.
    pub(crate) fn new(
        serial: u64,
        identity: Option<BlockId>,
        size: usize,
        content: ContentType,
    ) -> Self {
        Self {
            serial,
            identity,
            size,
            content,
            state: HeaderState::Anon(Buffers::new()),
            refs: RefCount::default(),
            flags: HeaderFlags::default(),
            pending: Vec::new(),
            frozen_checksum: None,
            last_access: Instant::now(),
            io_done: CancellationToken::new(),
        }
    }

    /// The kind of the current state.
    pub(crate) fn kind(&self) -> StateKind {
        self.state.kind()
    }

    /// Moves the header to another state. Only the state machine in
    /// `BlockCache::change_state` calls this.
    pub(crate) fn set_kind(&mut self, kind: StateKind) {
        let state = std::mem::replace(&mut self.state, HeaderState::MruGhost);
        self.state = state.moved_to(kind);
    }

    /// The buffers owned by the header.
    pub(crate) fn buffers(&self) -> &[Arc<BufferInner>] {
        match self.state {
            HeaderState::Anon(ref buffers)
            | HeaderState::Mru(ref buffers)
            | HeaderState::Mfu(ref buffers) => buffers,
            HeaderState::MruGhost | HeaderState::MfuGhost => &[],
        }
    }

    /// The mutable buffers, `None` in ghost states.
    fn buffers_mut(&mut self) -> Option<&mut Buffers> {
        match self.state {
            HeaderState::Anon(ref mut buffers)
            | HeaderState::Mru(ref mut buffers)
            | HeaderState::Mfu(ref mut buffers) => Some(buffers),
            HeaderState::MruGhost | HeaderState::MfuGhost => None,
        }
    }

    /// The number of buffers.
    pub(crate) fn datacnt(&self) -> usize {
        self.buffers().len()
    }

    /// The bytes this header contributes to the size of its state. Ghost
    /// headers contribute their nominal size.
    pub(crate) fn accounted_size(&self) -> usize {
        if self.kind().is_ghost() {
            self.size
        } else {
            self.size.saturating_mul(self.datacnt())
        }
    }

    /// Whether the header is a candidate of eviction.
    pub(crate) fn is_evictable(&self) -> bool {
        self.kind() != StateKind::Anon && self.refs.is_zero()
    }

    /// Whether `buffer` belongs to this header.
    pub(crate) fn owns(&self, buffer: &Arc<BufferInner>) -> bool {
        self.buffers().iter().any(|b| Arc::ptr_eq(b, buffer))
    }

    /// Adds a buffer.
    ///
    /// # Panics
    /// Panics if the header is a ghost.
    pub(crate) fn push_buffer(&mut self, buffer: Arc<BufferInner>) {
        self.buffers_mut()
            .unwrap_or_else(|| panic!("a ghost header cannot own buffers"))
            .push(buffer);
    }

    /// Removes `buffer` from the header.
    pub(crate) fn remove_buffer(&mut self, buffer: &Arc<BufferInner>) -> Option<Arc<BufferInner>> {
        let buffers = self.buffers_mut()?;
        let pos = buffers.iter().position(|b| Arc::ptr_eq(b, buffer))?;
        Some(buffers.remove(pos))
    }

    /// Removes the last buffer.
    pub(crate) fn pop_buffer(&mut self) -> Option<Arc<BufferInner>> {
        self.buffers_mut().and_then(SmallVec::pop)
    }

    /// Marks an I/O of the block in flight.
    pub(crate) fn start_io(&mut self) {
        self.flags.io_in_progress = true;
        self.io_done = CancellationToken::new();
    }

    /// Marks the I/O in flight complete and wakes up its waiters.
    pub(crate) fn finish_io(&mut self) {
        self.flags.io_in_progress = false;
        self.io_done.cancel();
    }

    /// Removes all the buffers.
    pub(crate) fn take_buffers(&mut self) -> Buffers {
        self.buffers_mut().map(std::mem::take).unwrap_or_default()
    }
}
