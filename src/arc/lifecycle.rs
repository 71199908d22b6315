//! The life cycle of buffers: allocation, cloning, references held by
//! consumers, release for mutation and destruction.

use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::Mutex;
use tracing::debug;

use super::block::{BlockId, ContentType};
use super::buffer::{Buffer, BufferInner, EvictionCallback};
use super::error::{CacheError, CacheResult};
use super::header::{Header, HeaderGuard, StateKind};
use super::refcount::RefTag;
use super::state::ListEntry;
use super::BlockCache;

impl BlockCache {
    /// Locks the header owning `buffer`, `None` if the buffer was evicted or
    /// destroyed.
    pub(crate) fn lock_header_of(&self, buffer: &Arc<BufferInner>) -> Option<HeaderGuard> {
        loop {
            let header = buffer.header()?;
            let guard = header.lock_arc();
            if guard.owns(buffer) {
                return Some(guard);
            }
            // The buffer moved to another header before we locked this one.
        }
    }

    /// Adds `buffer` to the header.
    pub(crate) fn attach_buffer(&self, header: &mut Header, buffer: Arc<BufferInner>) {
        let size = header.size;
        header.push_buffer(buffer);
        self.state(header.kind()).add_size(header, size);
    }

    /// Removes `buffer` from the header and frees its data.
    pub(crate) fn destroy_buffer(&self, header: &mut Header, buffer: &Arc<BufferInner>) {
        if header.remove_buffer(buffer).is_none() {
            return;
        }
        self.state(header.kind()).sub_size(header, header.size);
        if buffer.detach().is_some() {
            self.space_return(buffer.size, header.content);
        }
    }

    /// Takes an unreferenced header out of the cache and frees its buffers.
    pub(crate) fn destroy_header(&self, header: &mut HeaderGuard) {
        debug_assert!(
            header.refs.is_zero(),
            "a referenced header cannot be destroyed"
        );
        self.change_state(header, StateKind::Anon);
        let _: Option<ListEntry> = self.state(StateKind::Anon).remove(header);
        for buffer in header.take_buffers() {
            if buffer.detach().is_some() {
                self.space_return(buffer.size, header.content);
            }
        }
        header.pending.clear();
        debug!(serial = header.serial, "header destroyed");
    }

    /// Copies the first buffer of the header into a new buffer of the same
    /// header.
    pub(crate) fn clone_buffer(&self, header: &mut HeaderGuard) -> CacheResult<Arc<BufferInner>> {
        let source = header
            .buffers()
            .first()
            .map(Arc::clone)
            .unwrap_or_else(|| unreachable!("A cached header owns at least one buffer."));
        let mut region = self.get_data_buf(header.kind(), false, header.size, header.content)?;
        if let Some(data) = source.data.read().as_deref() {
            region.copy_from_slice(data);
        }
        let buffer = BufferInner::new(header.size, ArcMutexGuard::mutex(header), Some(region));
        self.attach_buffer(header, Arc::clone(&buffer));
        self.stats.duplicate_buffers.inc();
        Ok(buffer)
    }

    /// Allocates an anonymous buffer of `size` bytes, referenced by `tag`.
    ///
    /// The buffer can be mutated, and gets cached once written with
    /// [`BlockCache::cache_write`].
    pub fn alloc_buffer(&self, size: usize, content: ContentType, tag: RefTag) -> CacheResult<Buffer> {
        let region = self.get_data_buf(StateKind::Anon, false, size, content)?;
        let header = Arc::new(Mutex::new(Header::new(
            self.next_serial(),
            None,
            size,
            content,
        )));
        let mut guard = header.lock_arc();
        let _: usize = self.add_reference(&mut guard, tag);
        self.state(StateKind::Anon).insert(&guard);
        let buffer = BufferInner::new(size, &header, Some(region));
        self.attach_buffer(&mut guard, Arc::clone(&buffer));
        Ok(Buffer::from_inner(buffer))
    }

    /// Lends an anonymous data buffer of `size` bytes.
    ///
    /// The cache holds the reference of the buffer until it is given back
    /// with [`BlockCache::return_buffer`]. Its bytes are not counted as dirty
    /// data by [`BlockCache::tempreserve_space`] while on loan.
    pub fn loan_buffer(&self, size: usize) -> CacheResult<Buffer> {
        let buffer = self.alloc_buffer(size, ContentType::Data, RefTag::LOAN)?;
        self.add_loaned(size);
        Ok(buffer)
    }

    /// Takes back a loaned `buffer`, `tag` holds its reference from now on.
    ///
    /// # Errors
    /// Returns [`CacheError::Frozen`] if the buffer is no longer anonymous,
    /// and [`CacheError::Evicted`] if it was destroyed.
    ///
    /// # Panics
    /// Panics if the buffer is not on loan.
    pub fn return_buffer(&self, buffer: &Buffer, tag: RefTag) -> CacheResult<()> {
        let mut header = self
            .lock_header_of(&buffer.inner)
            .ok_or(CacheError::Evicted)?;
        if header.kind() != StateKind::Anon {
            return Err(CacheError::Frozen);
        }
        let _: usize = self.add_reference(&mut header, tag);
        let _: usize = self.remove_reference(&mut header, RefTag::LOAN);
        self.sub_loaned(header.size);
        Ok(())
    }

    /// Lends out a private `buffer` referenced by `tag`, the counterpart of
    /// [`BlockCache::return_buffer`] for a buffer already in use.
    ///
    /// The eviction callback of the buffer is dropped without being invoked.
    ///
    /// # Errors
    /// Returns [`CacheError::Frozen`] if the buffer is cached, it must be
    /// released for mutation first. Returns [`CacheError::Evicted`] if it was
    /// destroyed.
    ///
    /// # Panics
    /// Panics if `tag` holds no reference on the buffer.
    pub fn loan_inuse_buffer(&self, buffer: &Buffer, tag: RefTag) -> CacheResult<()> {
        let mut header = self
            .lock_header_of(&buffer.inner)
            .ok_or(CacheError::Evicted)?;
        if header.kind() != StateKind::Anon {
            return Err(CacheError::Frozen);
        }
        assert!(
            header.refs.holds(tag),
            "{tag:?} does not hold a reference on {buffer:?}"
        );
        let _: usize = self.add_reference(&mut header, RefTag::LOAN);
        let _: usize = self.remove_reference(&mut header, tag);
        buffer.inner.slot.lock().on_evict = None;
        self.add_loaned(header.size);
        Ok(())
    }

    /// Adds a reference held by `tag` to the block of `buffer`, and records
    /// an access of the block.
    pub fn acquire_reference(&self, buffer: &Buffer, tag: RefTag) -> CacheResult<()> {
        let mut header = self
            .lock_header_of(&buffer.inner)
            .ok_or(CacheError::Evicted)?;
        let _: usize = self.add_reference(&mut header, tag);
        if header
            .buffers()
            .first()
            .is_some_and(|first| Arc::ptr_eq(first, &buffer.inner))
        {
            header.flags.buf_available = false;
        }
        if header.kind() != StateKind::Anon {
            self.access(&mut header);
            self.record_hit();
        }
        Ok(())
    }

    /// Releases the reference held by `tag` on the block of `buffer`.
    ///
    /// Returns whether it was the last reference. Without an eviction
    /// callback, the buffer goes back to the cache: a clone is destroyed, the
    /// sole buffer becomes available to the next reader. An anonymous block
    /// is destroyed with its last reference.
    ///
    /// # Panics
    /// Panics if `tag` holds no reference on the block.
    pub fn release_reference(&self, buffer: &Buffer, tag: RefTag) -> bool {
        let mut header = self
            .lock_header_of(&buffer.inner)
            .unwrap_or_else(|| panic!("released {buffer:?}, which is not cached"));
        let count = self.remove_reference(&mut header, tag);

        if header.kind() == StateKind::Anon {
            if count == 0 && !header.flags.io_in_progress {
                self.destroy_header(&mut header);
            }
            return count == 0;
        }

        let no_callback = buffer.inner.slot.lock().on_evict.is_none();
        if no_callback {
            if header.datacnt() > 1 {
                self.destroy_buffer(&mut header, &buffer.inner);
            } else {
                header.flags.buf_available = true;
            }
        }
        count == 0
    }

    /// Makes `buffer`, referenced by `tag`, private to its holder so that it
    /// can be mutated.
    ///
    /// An anonymous buffer is only thawed. A buffer shared with other readers
    /// moves to a new anonymous block. The sole buffer of a block takes the
    /// block out of the cache.
    pub fn release_for_mutation(&self, buffer: &Buffer, tag: RefTag) -> CacheResult<()> {
        let mut header = self
            .lock_header_of(&buffer.inner)
            .ok_or(CacheError::Evicted)?;
        assert!(
            header.refs.holds(tag),
            "{tag:?} does not hold a reference on {buffer:?}"
        );
        buffer.inner.slot.lock().on_evict = None;

        if header.kind() == StateKind::Anon {
            if header.flags.io_in_progress {
                return Err(CacheError::Frozen);
            }
            header.frozen_checksum = None;
            return Ok(());
        }

        if header.datacnt() > 1 {
            let size = header.size;
            let content = header.content;
            let _: Option<Arc<BufferInner>> = header.remove_buffer(&buffer.inner);
            self.state(header.kind()).sub_size(&header, size);
            let _: usize = self.remove_reference(&mut header, tag);

            let private = Arc::new(Mutex::new(Header::new(
                self.next_serial(),
                None,
                size,
                content,
            )));
            let mut private_guard = private.lock_arc();
            let _: usize = self.add_reference(&mut private_guard, tag);
            self.state(StateKind::Anon).insert(&private_guard);
            buffer.inner.slot.lock().header = Arc::downgrade(&private);
            self.attach_buffer(&mut private_guard, Arc::clone(&buffer.inner));
            debug!(
                identity = ?header.identity,
                "shared buffer split off for mutation"
            );
        } else {
            self.change_state(&mut header, StateKind::Anon);
            header.frozen_checksum = None;
            header.flags.buf_available = false;
        }
        Ok(())
    }

    /// Registers the callback invoked after the data of `buffer` is evicted.
    ///
    /// The callback replaces the one registered before, if any.
    pub fn register_eviction_callback(
        &self,
        buffer: &Buffer,
        callback: EvictionCallback,
    ) -> CacheResult<()> {
        let header = self
            .lock_header_of(&buffer.inner)
            .ok_or(CacheError::Evicted)?;
        buffer.inner.slot.lock().on_evict = Some(callback);
        drop(header);
        Ok(())
    }

    /// Clears the eviction callback of `buffer` and invokes it.
    ///
    /// The data stays cached: an idle copy of a block read by several
    /// consumers is destroyed, the last buffer of a block only becomes
    /// available to the next reader. A buffer whose eviction is under way
    /// gets its callback invoked now instead of by
    /// [`BlockCache::do_user_evicts`].
    ///
    /// Returns whether a callback was invoked; `false` means none was
    /// registered, or it ran already.
    pub fn clear_eviction_callback(&self, buffer: &Buffer) -> bool {
        let Some(mut header) = self.lock_header_of(&buffer.inner) else {
            let callback = buffer.inner.slot.lock().on_evict.take();
            return callback.map_or(false, |callback| {
                callback();
                true
            });
        };
        let Some(callback) = buffer.inner.slot.lock().on_evict.take() else {
            return false;
        };

        let live = matches!(header.kind(), StateKind::Mru | StateKind::Mfu);
        if live && header.refs.count() < header.datacnt() {
            if header.datacnt() > 1 {
                self.destroy_buffer(&mut header, &buffer.inner);
            } else {
                header.flags.buf_available = true;
            }
        }
        drop(header);

        callback();
        true
    }

    /// Whether the holder of `buffer` had better let it go.
    ///
    /// True while the data of the buffer is evicted and its callback is
    /// pending, and for a copy of user data read by several consumers. False
    /// once the callback was taken, as the eviction is then complete.
    #[must_use]
    pub fn buffer_eviction_needed(&self, buffer: &Buffer) -> bool {
        let Some(header) = self.lock_header_of(&buffer.inner) else {
            return buffer.inner.slot.lock().on_evict.is_some();
        };
        header.datacnt() > 1 && header.content == ContentType::Data
    }

    /// Forgets the block `id`, which was freed on the storage.
    ///
    /// An unreferenced block is destroyed. A block being read is flagged, and
    /// its read completes with [`CacheError::FreedInRead`].
    pub fn freed(&self, id: &BlockId) {
        let Some(mut header) = self.index.find(id) else {
            return;
        };
        if header.flags.io_in_progress {
            header.flags.freed_in_read = true;
            return;
        }
        if header.refs.is_zero() {
            self.destroy_header(&mut header);
        } else {
            self.change_state(&mut header, StateKind::Anon);
        }
        debug!(%id, "block freed");
    }

    /// Whether `buffer` was released for mutation, or was never cached.
    #[must_use]
    pub fn is_released(&self, buffer: &Buffer) -> bool {
        self.lock_header_of(&buffer.inner)
            .is_some_and(|header| header.kind() == StateKind::Anon)
    }

    /// Whether the block of `buffer` is referenced by any consumer.
    #[must_use]
    pub fn is_referenced(&self, buffer: &Buffer) -> bool {
        self.lock_header_of(&buffer.inner)
            .is_some_and(|header| !header.refs.is_zero())
    }
}
