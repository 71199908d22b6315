//! The write path. An anonymous buffer is written to the storage and gets
//! cached under the identity the storage assigns.

use std::fmt::{self, Debug};
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::lock_api::ArcMutexGuard;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::block::{checksum, BlockId};
use super::buffer::{Buffer, BufferInner};
use super::error::{CacheError, CacheResult};
use super::header::{HeaderRef, StateKind};
use super::refcount::RefTag;
use super::BlockCache;

/// Invoked with the buffer right before it is written. The data is frozen
/// once it returns.
pub type WriteReady = Box<dyn FnOnce(&Buffer) + Send>;

/// Invoked when the write completes, with the identity assigned by the
/// storage.
pub type WriteDone = Box<dyn FnOnce(CacheResult<BlockId>) + Send>;

/// A write in flight.
pub struct WriteHandle(JoinHandle<CacheResult<BlockId>>);

impl Debug for WriteHandle {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WriteHandle")
            .field(&self.0.is_finished())
            .finish()
    }
}

impl WriteHandle {
    /// Waits for the write to complete.
    pub async fn join(self) -> CacheResult<BlockId> {
        self.0.await?
    }
}

impl BlockCache {
    /// Writes the anonymous `buffer` to the storage.
    ///
    /// The buffer can no longer be mutated once `ready` returns. When the
    /// write completes, the block is cached under its new identity and
    /// `done` is invoked. The caller keeps its reference on the buffer.
    ///
    /// # Errors
    /// Returns [`CacheError::Frozen`] if the buffer is cached, being written
    /// already or on loan, and [`CacheError::Evicted`] if it was destroyed.
    pub fn cache_write(
        self: &Arc<Self>,
        buffer: &Buffer,
        ready: Option<WriteReady>,
        done: Option<WriteDone>,
    ) -> CacheResult<WriteHandle> {
        {
            let header = self
                .lock_header_of(&buffer.inner)
                .ok_or(CacheError::Evicted)?;
            if header.kind() != StateKind::Anon
                || header.flags.io_in_progress
                || header.identity.is_some()
                || header.refs.holds(RefTag::LOAN)
            {
                return Err(CacheError::Frozen);
            }
        }
        if let Some(ready) = ready {
            ready(buffer);
        }

        let mut header = self
            .lock_header_of(&buffer.inner)
            .ok_or(CacheError::Evicted)?;
        if header.flags.io_in_progress {
            return Err(CacheError::Frozen);
        }
        let data = {
            let data = buffer.data().ok_or(CacheError::Evicted)?;
            if self.params.debug_checksums {
                header.frozen_checksum = Some(checksum(&data));
            }
            Bytes::copy_from_slice(&data)
        };
        header.start_io();
        let header_ref = Arc::clone(ArcMutexGuard::mutex(&header));
        drop(header);

        let cache = Arc::clone(self);
        let inner = Arc::clone(&buffer.inner);
        let handle = tokio::spawn(async move {
            let result = cache.storage.write(data).await;
            cache.write_done(&header_ref, &inner, result, done)
        });
        Ok(WriteHandle(handle))
    }

    /// Completes a write: indexes the block under its identity, replacing a
    /// block cached with the same identity.
    fn write_done(
        &self,
        header_ref: &HeaderRef,
        buffer: &Arc<BufferInner>,
        result: io::Result<BlockId>,
        done: Option<WriteDone>,
    ) -> CacheResult<BlockId> {
        let result = match result {
            Ok(id) => {
                self.index_written(header_ref, id);
                Ok(id)
            }
            Err(err) => {
                let err = CacheError::io(None, err);
                warn!(error = %err, "write failed");
                let mut header = header_ref.lock_arc();
                header.frozen_checksum = None;
                header.finish_io();
                // The writer let go while the write was in flight.
                if header.refs.is_zero() {
                    self.destroy_header(&mut header);
                }
                Err(err)
            }
        };
        debug!(?result, size = buffer.size, "write completed");
        if let Some(done) = done {
            done(result.clone());
        }
        result
    }

    /// Inserts the written header into the index under `id`.
    fn index_written(&self, header_ref: &HeaderRef, id: BlockId) {
        loop {
            let mut header = header_ref.lock_arc();
            header.identity = Some(id);
            let Some(existing) = self.index.insert(&mut header) else {
                self.access(&mut header);
                header.flags.buf_available = header.refs.is_zero();
                header.finish_io();
                return;
            };
            header.identity = None;
            drop(header);
            self.retire(&existing, id);
        }
    }

    /// Takes the block cached as `id` out of the index, to make room for a
    /// rewrite of the same identity.
    fn retire(&self, existing: &HeaderRef, id: BlockId) {
        let mut old = existing.lock_arc();
        if !old.flags.in_hash || old.identity != Some(id) {
            return;
        }
        if old.flags.io_in_progress {
            old.flags.freed_in_read = true;
            self.index.remove(&mut old);
        } else if old.refs.is_zero() {
            self.destroy_header(&mut old);
        } else {
            self.change_state(&mut old, StateKind::Anon);
        }
        debug!(%id, "cached block replaced by a rewrite");
    }
}
