//! The consumer handle of cached data.

use std::fmt::{self, Debug};
use std::sync::{Arc, Weak};

use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, Mutex, RwLock, RwLockReadGuard,
    RwLockWriteGuard,
};

use super::error::{CacheError, CacheResult};
use super::header::{Header, HeaderRef, StateKind};

/// The callback invoked after the data of a buffer is evicted.
///
/// It is never invoked with any lock of the cache held.
pub type EvictionCallback = Box<dyn FnOnce() + Send>;

/// The link between a buffer and its header.
///
/// The lock of the slot is the eviction lock of the buffer. The evictor only
/// ever tries it.
pub(crate) struct BufferSlot {
    /// The owning header, dangling once the buffer is evicted or destroyed
    pub(crate) header: Weak<Mutex<Header>>,
    /// The eviction callback
    pub(crate) on_evict: Option<EvictionCallback>,
}

/// The shared part of a buffer.
pub(crate) struct BufferInner {
    /// The size of the data region
    pub(crate) size: usize,
    /// The owning header and eviction callback
    pub(crate) slot: Mutex<BufferSlot>,
    /// The data region, `None` after eviction or while a read fills it
    pub(crate) data: RwLock<Option<Vec<u8>>>,
}

impl Debug for BufferInner {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferInner")
            .field("size", &self.size)
            .field("resident", &self.data.read().is_some())
            .finish()
    }
}

impl BufferInner {
    /// Creates a buffer owned by `header`.
    pub(crate) fn new(size: usize, header: &HeaderRef, data: Option<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            size,
            slot: Mutex::new(BufferSlot {
                header: Arc::downgrade(header),
                on_evict: None,
            }),
            data: RwLock::new(data),
        })
    }

    /// The header owning this buffer.
    pub(crate) fn header(&self) -> Option<HeaderRef> {
        self.slot.lock().header.upgrade()
    }

    /// Detaches the buffer from its header, returns its data region.
    pub(crate) fn detach(&self) -> Option<Vec<u8>> {
        let mut slot = self.slot.lock();
        slot.header = Weak::new();
        slot.on_evict = None;
        drop(slot);
        self.data.write().take()
    }
}

/// A handle to the data of a cached block.
///
/// A buffer owns its data region exclusively. Every reader of a block gets
/// its own buffer, the cache copies the data when a block is read by more than
/// one consumer.
pub struct Buffer {
    /// The shared part
    pub(crate) inner: Arc<BufferInner>,
}

impl Debug for Buffer {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.inner.size)
            .field("evicted", &self.is_evicted())
            .finish()
    }
}

impl Buffer {
    /// Wraps the shared part of a buffer.
    pub(crate) fn from_inner(inner: Arc<BufferInner>) -> Self {
        Self { inner }
    }

    /// The size of the buffer.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Whether the data of the buffer is gone.
    #[must_use]
    pub fn is_evicted(&self) -> bool {
        self.inner.header().is_none()
    }

    /// The data of the buffer, `None` if it was evicted.
    #[must_use]
    pub fn data(&self) -> Option<MappedRwLockReadGuard<'_, [u8]>> {
        RwLockReadGuard::try_map(self.inner.data.read(), |data| data.as_deref()).ok()
    }

    /// Copies the data out of the buffer.
    #[must_use]
    pub fn to_vec(&self) -> Option<Vec<u8>> {
        self.data().map(|data| data.to_vec())
    }

    /// The mutable data of the buffer.
    ///
    /// Only an anonymous buffer, which is not known by any other consumer,
    /// can be mutated. Release a cached buffer with
    /// [`BlockCache::release_for_mutation`](super::BlockCache::release_for_mutation)
    /// first.
    pub fn data_mut(&self) -> CacheResult<MappedRwLockWriteGuard<'_, [u8]>> {
        let header = self.inner.header().ok_or(CacheError::Evicted)?;
        {
            let header = header.lock();
            if header.kind() != StateKind::Anon || header.flags.io_in_progress {
                return Err(CacheError::Frozen);
            }
        }
        RwLockWriteGuard::try_map(self.inner.data.write(), |data| data.as_deref_mut())
            .map_err(|_| CacheError::Evicted)
    }

    /// Whether two handles refer to the same buffer.
    #[must_use]
    pub fn same_buffer(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
