//! The memory storage implementation

use std::collections::hash_map::DefaultHasher;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use itertools::Itertools;

use super::BlockStorage;
use crate::arc::BlockId;

/// A memory storage for testing and simulation purposes.
///
/// Written blocks are addressed by the hash of their content, so writing the
/// same data twice in an epoch yields the same identity.
pub struct MemoryStorage {
    /// The stored blocks
    blocks: DashMap<BlockId, Vec<u8>>,
    /// The mock latency
    latency: Duration,
    /// The epoch written blocks are born in
    epoch: AtomicU64,
    /// The blocks whose reads fail
    failing: DashSet<BlockId>,
    /// Whether writes fail
    fail_writes: AtomicBool,
    /// Whether reads are served without I/O
    fast_path: AtomicBool,
    /// The number of reads issued
    reads: AtomicU64,
    /// The number of reads served without I/O
    fast_reads: AtomicU64,
    /// The number of writes issued
    writes: AtomicU64,
}

impl Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids = self.blocks.iter().map(|b| *b.key()).sorted().collect_vec();
        f.debug_struct("MemoryStorage")
            .field("blocks", &ids)
            .field("latency", &self.latency)
            .field("reads", &self.reads())
            .field("writes", &self.writes())
            .finish()
    }
}

#[async_trait]
impl BlockStorage for MemoryStorage {
    #[inline]
    async fn read(&self, id: &BlockId, buf: &mut [u8]) -> io::Result<()> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        // mock latency
        tokio::time::sleep(self.latency).await;

        if self.failing.contains(id) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("injected read failure of {id}"),
            ));
        }
        let Some(data) = self.blocks.get(id) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("block {id} is not stored"),
            ));
        };
        copy_block(&data, buf);
        Ok(())
    }

    #[inline]
    async fn write(&self, data: Bytes) -> io::Result<BlockId> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        // mock latency
        tokio::time::sleep(self.latency).await;

        if self.fail_writes.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "injected write failure",
            ));
        }
        let mut hasher = DefaultHasher::new();
        data.hash(&mut hasher);
        let id = BlockId::new(hasher.finish(), self.epoch.load(Ordering::Acquire));
        self.blocks.insert(id, data.to_vec());
        Ok(id)
    }

    #[inline]
    fn try_read_without_io(&self, id: &BlockId, buf: &mut [u8]) -> bool {
        if !self.fast_path.load(Ordering::Acquire) || self.failing.contains(id) {
            return false;
        }
        let Some(data) = self.blocks.get(id) else {
            return false;
        };
        copy_block(&data, buf);
        self.fast_reads.fetch_add(1, Ordering::Relaxed);
        true
    }
}

/// Copies a stored block into a buffer, zero-filling the tail of a short
/// block.
fn copy_block(data: &[u8], buf: &mut [u8]) {
    let len = data.len().min(buf.len());
    let (head, tail) = buf.split_at_mut(len);
    let data = data
        .get(..len)
        .unwrap_or_else(|| unreachable!("The length is checked to be enough."));
    head.copy_from_slice(data);
    tail.fill(0);
}

impl MemoryStorage {
    /// Creates a new `MemoryStorage` instance with the given latency.
    #[inline]
    #[must_use]
    pub fn new(latency: Duration) -> Self {
        MemoryStorage {
            blocks: DashMap::new(),
            latency,
            epoch: AtomicU64::new(1),
            failing: DashSet::new(),
            fail_writes: AtomicBool::new(false),
            fast_path: AtomicBool::new(false),
            reads: AtomicU64::new(0),
            fast_reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Stores a block under `id` directly.
    pub fn insert(&self, id: BlockId, data: Vec<u8>) {
        self.blocks.insert(id, data);
    }

    /// Stores `count` blocks of `size` bytes at addresses `0..count`, each
    /// filled with the low byte of its address.
    pub fn populate(&self, count: u64, size: usize) -> Vec<BlockId> {
        let birth = self.epoch.load(Ordering::Acquire);
        (0..count)
            .map(|address| {
                let id = BlockId::new(address, birth);
                self.insert(id, vec![address.to_le_bytes()[0]; size]);
                id
            })
            .collect()
    }

    /// Whether the block `id` is stored.
    #[must_use]
    pub fn contains(&self, id: &BlockId) -> bool {
        self.blocks.contains_key(id)
    }

    /// Starts a new epoch of writes.
    pub fn advance_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    /// Makes reads of `id` fail, or succeed again.
    pub fn set_failing(&self, id: BlockId, failing: bool) {
        if failing {
            self.failing.insert(id);
        } else {
            self.failing.remove(&id);
        }
    }

    /// Makes writes fail, or succeed again.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    /// Serves reads without I/O, or stops doing so.
    pub fn set_fast_path(&self, enabled: bool) {
        self.fast_path.store(enabled, Ordering::Release);
    }

    /// The number of reads issued.
    #[must_use]
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// The number of reads served without I/O.
    #[must_use]
    pub fn fast_reads(&self) -> u64 {
        self.fast_reads.load(Ordering::Relaxed)
    }

    /// The number of writes issued.
    #[must_use]
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}
