//! The storage blocks are read from and written to.

pub mod memory_backend;

use std::fmt::Debug;
use std::io;

use async_trait::async_trait;
use bytes::Bytes;
pub use memory_backend::MemoryStorage;

use crate::arc::BlockId;

/// The `BlockStorage` trait represents the storage engine under the cache.
#[async_trait]
pub trait BlockStorage: Debug + Send + Sync {
    /// Reads the block `id` into the given buffer, which has the size of the
    /// block.
    async fn read(&self, id: &BlockId, buf: &mut [u8]) -> io::Result<()>;
    /// Writes a block, and returns the identity the storage assigns to it.
    async fn write(&self, data: Bytes) -> io::Result<BlockId>;
    /// Reads the block `id` if it can be done without I/O, e.g. from a
    /// secondary cache. Returns whether the buffer was filled.
    fn try_read_without_io(&self, _id: &BlockId, _buf: &mut [u8]) -> bool {
        false
    }
}

/// Test storage.
#[cfg(test)]
#[allow(clippy::unwrap_used)]
async fn test_storage(storage: impl BlockStorage) {
    let data = Bytes::from_static(b"hello world");
    let id = storage.write(data.clone()).await.unwrap();
    let mut buf = vec![0_u8; data.len()];
    storage.read(&id, &mut buf).await.unwrap();
    assert_eq!(buf, data);

    let missing = BlockId::new(id.address.wrapping_add(1), id.birth);
    let err = storage.read(&missing, &mut buf).await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::NotFound);
}
