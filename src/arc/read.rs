//! The read path.
//!
//! A read looks the block up in the index. A cached block is handed out at
//! once, a block being read makes the caller wait or queue its callback, and
//! a miss allocates a header and reads the block from the storage. Every
//! caller queued on a read is called back exactly once when it completes.

use std::fmt::{self, Debug};
use std::io;
use std::ops::BitOr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::block::{checksum, BlockId, BlockPointer, ContentType};
use super::buffer::{Buffer, BufferInner};
use super::error::{CacheError, CacheResult};
use super::header::{Header, HeaderGuard, HeaderRef, PendingRead, StateKind};
use super::refcount::RefTag;
use super::BlockCache;
use crate::metrics::ARC_METRICS;

/// The completion callback of a read.
///
/// It receives a buffer referenced by the tag of the read, or the error of
/// the read. It is never invoked with any lock of the cache held.
pub type ReadDone = Box<dyn FnOnce(CacheResult<Buffer>) + Send>;

/// The flags of a read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadFlags(u8);

impl ReadFlags {
    /// No flag
    pub const NONE: Self = Self(0);
    /// The read is speculative, the caller holds no reference
    pub const PREFETCH: Self = Self(1);
    /// The caller waits for the read to complete
    pub const WAIT: Self = Self(1 << 1);
    /// The caller only wants cached data, no read is issued
    pub const CACHED_ONLY: Self = Self(1 << 2);

    /// Whether all of `other` are set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ReadFlags {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// How a read was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The block was cached, the callback has been invoked
    Hit,
    /// The block was read from the storage while the caller waited, the
    /// callback has been invoked
    Miss,
    /// The callback will be invoked when the read in flight completes
    Pending,
}

/// A read of the storage about to be issued.
struct ReadIo {
    /// The header being read
    header: HeaderRef,
    /// The buffer to fill
    buffer: Arc<BufferInner>,
    /// The block to read
    id: BlockId,
    /// The region to read into
    region: Vec<u8>,
}

impl Debug for ReadIo {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadIo")
            .field("id", &self.id)
            .field("size", &self.region.len())
            .finish()
    }
}

/// The next step of a read after looking the block up.
#[derive(Debug)]
enum Lookup {
    /// The read is served
    Done(ReadStatus),
    /// A read of the block is in flight, wait for it and look again
    Wait(CancellationToken),
    /// Another reader inserted the block first, look again
    Retry,
    /// The block must be read from the storage
    Issue(ReadIo),
}

/// An addressed block to read.
#[derive(Debug, Clone, Copy)]
struct ReadTarget {
    /// The identity
    id: BlockId,
    /// The size
    size: usize,
    /// The content type
    content: ContentType,
    /// Whether the block is an indirect block
    indirect: bool,
}

impl BlockCache {
    /// Reads the block `bp` points to.
    ///
    /// With a callback, the caller gets a buffer referenced by `tag`. Without
    /// one, the read only brings the block into the cache. `flags` decides
    /// whether the caller waits for a read in flight, and whether a miss reads
    /// the storage at all.
    ///
    /// # Errors
    /// Returns [`CacheError::NotCached`] for a miss with
    /// [`ReadFlags::CACHED_ONLY`], or an error allocating memory. The callback
    /// is not invoked then. Errors of the storage are passed to the callback.
    pub async fn cache_read(
        self: &Arc<Self>,
        bp: &BlockPointer,
        tag: RefTag,
        flags: ReadFlags,
        done: Option<ReadDone>,
    ) -> CacheResult<ReadStatus> {
        let target = match *bp {
            BlockPointer::Embedded {
                ref payload,
                content,
            } => return self.read_embedded(payload, content, tag, done),
            BlockPointer::Addressed {
                id,
                size,
                content,
                indirect,
            } => ReadTarget {
                id,
                size,
                content,
                indirect,
            },
        };

        let mut done = done;
        loop {
            match self.lookup(target, tag, flags, &mut done)? {
                Lookup::Done(status) => return Ok(status),
                Lookup::Wait(io_done) => io_done.cancelled().await,
                Lookup::Retry => {}
                Lookup::Issue(io) => {
                    // The read completes even if the caller goes away.
                    let cache = Arc::clone(self);
                    let read: JoinHandle<()> = tokio::spawn(async move { cache.run_read(io).await });
                    if !flags.contains(ReadFlags::WAIT) {
                        return Ok(ReadStatus::Pending);
                    }
                    read.await?;
                    return Ok(ReadStatus::Miss);
                }
            }
        }
    }

    /// Reads the block `bp` points to, and waits for its buffer.
    ///
    /// If the returned future is dropped before the read completes, the
    /// buffer it would have returned is released.
    pub async fn read_buffer(self: &Arc<Self>, bp: &BlockPointer, tag: RefTag) -> CacheResult<Buffer> {
        let (tx, rx) = oneshot::channel();
        let cache = Arc::clone(self);
        let done: ReadDone = Box::new(move |result| {
            if let Err(Ok(buffer)) = tx.send(result) {
                debug!("the reader went away, its buffer is released");
                let _: bool = cache.release_reference(&buffer, tag);
            }
        });
        let _: ReadStatus = self
            .cache_read(bp, tag, ReadFlags::WAIT, Some(done))
            .await?;
        rx.await
            .map_err(|e| CacheError::Internal(Arc::new(anyhow::Error::new(e))))?
    }

    /// Looks the block up, and serves the read if it can be served without
    /// waiting.
    fn lookup(
        &self,
        target: ReadTarget,
        tag: RefTag,
        flags: ReadFlags,
        done: &mut Option<ReadDone>,
    ) -> CacheResult<Lookup> {
        let prefetch = flags.contains(ReadFlags::PREFETCH) && done.is_none();
        let Some(mut header) = self.index.find(&target.id) else {
            if flags.contains(ReadFlags::CACHED_ONLY) {
                return Err(CacheError::NotCached(target.id));
            }
            return self.read_new(target, tag, prefetch, done);
        };

        if header.flags.io_in_progress {
            if flags.contains(ReadFlags::WAIT) {
                return Ok(Lookup::Wait(header.io_done.clone()));
            }
            if let Some(done) = done.take() {
                let _: usize = self.add_reference(&mut header, tag);
                header.pending.push(PendingRead { tag, done });
                self.stats.duplicate_reads.inc();
                self.record_hit();
            }
            return Ok(Lookup::Done(ReadStatus::Pending));
        }

        if header.kind().is_ghost() {
            if flags.contains(ReadFlags::CACHED_ONLY) {
                return Err(CacheError::NotCached(target.id));
            }
            return self.read_ghost(header, target, tag, prefetch, done);
        }

        self.verify_checksum(&header);
        let buffer = if done.is_some() {
            let _: usize = self.add_reference(&mut header, tag);
            if header.flags.buf_available {
                header.flags.buf_available = false;
                header.buffers().first().map(Arc::clone)
            } else {
                match self.clone_buffer(&mut header) {
                    Ok(buffer) => Some(buffer),
                    Err(err) => {
                        let _: usize = self.remove_reference(&mut header, tag);
                        return Err(err);
                    }
                }
            }
        } else {
            if prefetch && header.refs.is_zero() {
                header.flags.prefetch = true;
            }
            None
        };
        self.access(&mut header);
        self.record_hit();
        drop(header);

        if let (Some(done), Some(buffer)) = (done.take(), buffer) {
            done(Ok(Buffer::from_inner(buffer)));
        }
        Ok(Lookup::Done(ReadStatus::Hit))
    }

    /// Starts the read of a block the cache knows nothing about.
    fn read_new(
        &self,
        target: ReadTarget,
        tag: RefTag,
        prefetch: bool,
        done: &mut Option<ReadDone>,
    ) -> CacheResult<Lookup> {
        let region = self.get_data_buf(StateKind::Anon, prefetch, target.size, target.content)?;
        let header = Arc::new(Mutex::new(Header::new(
            self.next_serial(),
            Some(target.id),
            target.size,
            target.content,
        )));
        let mut guard = header.lock_arc();
        guard.flags.indirect = target.indirect;
        if self.index.insert(&mut guard).is_some() {
            // Lost the race against another reader of the same block.
            self.space_return(target.size, target.content);
            return Ok(Lookup::Retry);
        }
        self.state(StateKind::Anon).insert(&guard);

        let buffer = BufferInner::new(target.size, &header, None);
        self.attach_buffer(&mut guard, Arc::clone(&buffer));
        self.queue_reader(&mut guard, tag, prefetch, done);
        guard.start_io();
        self.record_miss();
        drop(guard);

        Ok(Lookup::Issue(ReadIo {
            header,
            buffer,
            id: target.id,
            region,
        }))
    }

    /// Starts the read of a block remembered by a ghost list.
    fn read_ghost(
        &self,
        mut header: HeaderGuard,
        target: ReadTarget,
        tag: RefTag,
        prefetch: bool,
        done: &mut Option<ReadDone>,
    ) -> CacheResult<Lookup> {
        debug_assert!(header.refs.is_zero(), "a ghost header is never referenced");
        let origin = header.kind();
        let region = self.get_data_buf(origin, prefetch, header.size, header.content)?;
        self.queue_reader(&mut header, tag, prefetch, done);
        self.access(&mut header);
        ARC_METRICS.ghost_hit(&self.name);

        let buffer = BufferInner::new(header.size, ArcMutexGuard::mutex(&header), None);
        self.attach_buffer(&mut header, Arc::clone(&buffer));
        header.flags.indirect = target.indirect;
        header.start_io();
        self.record_miss();
        debug!(id = %target.id, ?origin, "ghost hit");

        Ok(Lookup::Issue(ReadIo {
            header: Arc::clone(ArcMutexGuard::mutex(&header)),
            buffer,
            id: target.id,
            region,
        }))
    }

    /// Queues the caller on the read about to be issued. A caller with a
    /// callback holds a reference, a prefetch holds none.
    fn queue_reader(
        &self,
        header: &mut Header,
        tag: RefTag,
        prefetch: bool,
        done: &mut Option<ReadDone>,
    ) {
        if let Some(done) = done.take() {
            let _: usize = self.add_reference(header, tag);
            header.pending.push(PendingRead { tag, done });
        } else if prefetch {
            header.flags.prefetch = true;
        } else {
            // A plain read without callback only brings the block in.
        }
    }

    /// Reads the block from the storage, and completes the read.
    async fn run_read(&self, io: ReadIo) {
        let ReadIo {
            header,
            buffer,
            id,
            mut region,
        } = io;
        let result = if self.storage.try_read_without_io(&id, &mut region) {
            Ok(())
        } else {
            self.storage.read(&id, &mut region).await
        };
        self.read_done(&header, &buffer, region, result);
    }

    /// Completes a read: fills the buffer, fans it out to every queued
    /// caller and wakes up the waiting ones.
    fn read_done(
        &self,
        header: &HeaderRef,
        buffer: &Arc<BufferInner>,
        region: Vec<u8>,
        result: io::Result<()>,
    ) {
        let mut header = header.lock_arc();
        let id = header
            .identity
            .unwrap_or_else(|| unreachable!("A header being read has an identity."));
        let freed = header.flags.freed_in_read || !header.flags.in_hash;
        let result = match result {
            Ok(()) if freed => Err(CacheError::FreedInRead(id)),
            Ok(()) => Ok(()),
            Err(err) => Err(CacheError::io(Some(id), err)),
        };

        let mut callbacks: Vec<(ReadDone, CacheResult<Buffer>)> = Vec::new();
        match result {
            Ok(()) => {
                if self.params.debug_checksums {
                    header.frozen_checksum = Some(checksum(&region));
                }
                *buffer.data.write() = Some(region);
                if header.kind() == StateKind::Anon {
                    self.access(&mut header);
                }
                header.flags.io_error = false;

                let pending = std::mem::take(&mut header.pending);
                let mut first_taken = false;
                for PendingRead { tag, done } in pending {
                    if !first_taken {
                        first_taken = true;
                        callbacks.push((done, Ok(Buffer::from_inner(Arc::clone(buffer)))));
                        continue;
                    }
                    match self.clone_buffer(&mut header) {
                        Ok(clone) => callbacks.push((done, Ok(Buffer::from_inner(clone)))),
                        Err(err) => {
                            let _: usize = self.remove_reference(&mut header, tag);
                            callbacks.push((done, Err(err)));
                        }
                    }
                }
                header.flags.buf_available = !first_taken;
                header.finish_io();
            }
            Err(err) => {
                warn!(%id, error = %err, "read failed");
                header.flags.io_error = true;
                let pending = std::mem::take(&mut header.pending);
                for PendingRead { tag, done } in pending {
                    let _: usize = self.remove_reference(&mut header, tag);
                    callbacks.push((done, Err(err.clone())));
                }
                self.change_state(&mut header, StateKind::Anon);
                if header.refs.is_zero() {
                    self.space_return(region.len(), header.content);
                    self.destroy_header(&mut header);
                } else {
                    *buffer.data.write() = Some(region);
                }
                header.finish_io();
            }
        }
        drop(header);

        for (done, result) in callbacks {
            done(result);
        }
    }

    /// Serves a block embedded in its pointer with an anonymous buffer.
    fn read_embedded(
        &self,
        payload: &Bytes,
        content: ContentType,
        tag: RefTag,
        done: Option<ReadDone>,
    ) -> CacheResult<ReadStatus> {
        let buffer = self.alloc_buffer(payload.len(), content, tag)?;
        buffer.data_mut()?.copy_from_slice(payload);
        match done {
            Some(done) => done(Ok(buffer)),
            None => {
                let _: bool = self.release_reference(&buffer, tag);
            }
        }
        Ok(ReadStatus::Hit)
    }

    /// Checks that the data of a cached block did not change since it was
    /// read.
    ///
    /// # Panics
    /// Panics if the data changed.
    fn verify_checksum(&self, header: &Header) {
        if !self.params.debug_checksums {
            return;
        }
        let (Some(expected), Some(buffer)) = (header.frozen_checksum, header.buffers().first())
        else {
            return;
        };
        if let Some(data) = buffer.data.read().as_deref() {
            assert_eq!(
                checksum(data),
                expected,
                "the data of {:?} changed while cached",
                header.identity
            );
        }
    }
}
