//! The identities of blocks and the pointers consumers read them through.

use std::fmt::{self, Display};
use std::hash::{Hash, Hasher};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// The identity of a block on the storage.
///
/// A block is identified by the address it is stored at and the epoch it was
/// born in. The identity never changes once assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId {
    /// The storage address of the block
    pub address: u64,
    /// The epoch in which the block was written
    pub birth: u64,
}

impl BlockId {
    /// Creates a new `BlockId`.
    #[must_use]
    pub const fn new(address: u64, birth: u64) -> Self {
        Self { address, birth }
    }
}

impl Display for BlockId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{:#x}@{}>", self.address, self.birth)
    }
}

/// The content type of a block.
///
/// Metadata and data are accounted separately, so that the eviction can
/// prefer one over the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentType {
    /// Metadata blocks
    Metadata,
    /// User data blocks
    Data,
}

impl ContentType {
    /// All the content types.
    pub const ALL: [ContentType; 2] = [ContentType::Metadata, ContentType::Data];

    /// The index of the content type in per-type counters.
    #[must_use]
    pub(crate) const fn index(self) -> usize {
        match self {
            ContentType::Metadata => 0,
            ContentType::Data => 1,
        }
    }
}

/// A pointer to a block, as the consumer knows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockPointer {
    /// A block stored on the backend.
    Addressed {
        /// The identity of the block
        id: BlockId,
        /// The logical size of the block
        size: usize,
        /// The content type of the block
        content: ContentType,
        /// Whether the block is an indirect block. Indirect blocks get the
        /// same eviction protection as prefetched ones.
        indirect: bool,
    },
    /// A block small enough to be carried inside the pointer itself. Reading
    /// it never reaches the backend.
    Embedded {
        /// The payload
        payload: Bytes,
        /// The content type of the block
        content: ContentType,
    },
}

impl BlockPointer {
    /// Creates a pointer to a data or metadata block stored on the backend.
    #[must_use]
    pub const fn new(id: BlockId, size: usize, content: ContentType) -> Self {
        Self::Addressed {
            id,
            size,
            content,
            indirect: false,
        }
    }

    /// Creates a pointer to an indirect block.
    #[must_use]
    pub const fn indirect(id: BlockId, size: usize) -> Self {
        Self::Addressed {
            id,
            size,
            content: ContentType::Metadata,
            indirect: true,
        }
    }

    /// Creates an embedded pointer.
    #[must_use]
    pub fn embedded(payload: Bytes, content: ContentType) -> Self {
        Self::Embedded { payload, content }
    }

    /// The logical size of the block.
    #[must_use]
    pub fn size(&self) -> usize {
        match *self {
            Self::Addressed { size, .. } => size,
            Self::Embedded { ref payload, .. } => payload.len(),
        }
    }

    /// The content type of the block.
    #[must_use]
    pub fn content(&self) -> ContentType {
        match *self {
            Self::Addressed { content, .. } | Self::Embedded { content, .. } => content,
        }
    }

    /// The identity of the block, `None` for embedded blocks.
    #[must_use]
    pub fn id(&self) -> Option<BlockId> {
        match *self {
            Self::Addressed { id, .. } => Some(id),
            Self::Embedded { .. } => None,
        }
    }
}

/// Computes the checksum used to detect modification of frozen buffers.
#[must_use]
pub(crate) fn checksum(data: &[u8]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    data.hash(&mut hasher);
    hasher.finish()
}
