//! Tagged reference counting of headers.

use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;

/// The source of unique reference tags.
static NEXT_TAG: AtomicU64 = AtomicU64::new(1);

/// The tag a holder of a reference identifies itself with.
///
/// A reference acquired with a tag must be released with the same tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RefTag(u64);

impl RefTag {
    /// The holder of buffers on loan. Never handed out by [`RefTag::new`].
    pub(crate) const LOAN: Self = Self(0);

    /// Creates a new unique tag.
    #[must_use]
    pub fn new() -> Self {
        Self(NEXT_TAG.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RefTag {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/// A reference count remembering who holds the references.
#[derive(Debug, Default)]
pub(crate) struct RefCount {
    /// The holders, one entry per reference
    holders: SmallVec<[RefTag; 2]>,
}

impl RefCount {
    /// The number of references.
    pub(crate) fn count(&self) -> usize {
        self.holders.len()
    }

    /// Whether no reference is held.
    pub(crate) fn is_zero(&self) -> bool {
        self.holders.is_empty()
    }

    /// Whether `tag` holds at least one reference.
    pub(crate) fn holds(&self, tag: RefTag) -> bool {
        self.holders.contains(&tag)
    }

    /// Adds a reference held by `tag`, returns the new count.
    pub(crate) fn add(&mut self, tag: RefTag) -> usize {
        self.holders.push(tag);
        self.holders.len()
    }

    /// Removes a reference held by `tag`, returns the new count.
    ///
    /// # Panics
    /// Panics if `tag` holds no reference.
    pub(crate) fn remove(&mut self, tag: RefTag) -> usize {
        let pos = self
            .holders
            .iter()
            .position(|&holder| holder == tag)
            .unwrap_or_else(|| panic!("{tag:?} does not hold a reference"));
        self.holders.swap_remove(pos);
        self.holders.len()
    }
}
