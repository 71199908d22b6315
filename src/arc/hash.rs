//! The sharded hash index from block identities to headers.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use clippy_utilities::Cast;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::Mutex;

use super::block::BlockId;
use super::header::{HeaderGuard, HeaderRef};

/// A shard of the index. Its lock guards the chain of the shard only, each
/// header carries its own lock.
type Shard = Mutex<HashMap<BlockId, HeaderRef>>;

/// The identity to header index.
///
/// Lock order: a header lock may be held while locking a shard, never the
/// reverse. `find` releases the shard before it locks the header found.
pub(crate) struct HashIndex {
    /// The shards
    shards: Vec<Shard>,
    /// The number of inserts into a non-empty shard
    collisions: AtomicU64,
}

impl Debug for HashIndex {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashIndex")
            .field("shards", &self.shards.len())
            .field("len", &self.len())
            .finish()
    }
}

impl HashIndex {
    /// Creates an index with `shard_num` shards.
    pub(crate) fn new(shard_num: usize) -> Self {
        let shard_num = shard_num.max(1);
        Self {
            shards: (0..shard_num).map(|_| Mutex::new(HashMap::new())).collect(),
            collisions: AtomicU64::new(0),
        }
    }

    /// The shard `id` lives in.
    fn shard(&self, id: &BlockId) -> &Shard {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let idx = (hasher.finish() % self.shards.len().cast::<u64>()).cast::<usize>();
        self.shards
            .get(idx)
            .unwrap_or_else(|| unreachable!("The index is less than the shard number."))
    }

    /// Finds the header of `id`, and returns it locked.
    pub(crate) fn find(&self, id: &BlockId) -> Option<HeaderGuard> {
        loop {
            let header = {
                let shard = self.shard(id).lock();
                Arc::clone(shard.get(id)?)
            };
            let guard = header.lock_arc();
            if guard.flags.in_hash && guard.identity.as_ref() == Some(id) {
                return Some(guard);
            }
            // The header left the index before we locked it, look again.
        }
    }

    /// Inserts the locked header by its identity.
    ///
    /// Returns the header already indexed with the same identity instead of
    /// inserting, if there is one.
    pub(crate) fn insert(&self, header: &mut HeaderGuard) -> Option<HeaderRef> {
        let id = header
            .identity
            .unwrap_or_else(|| panic!("an anonymous header cannot be indexed"));
        let mut shard = self.shard(&id).lock();
        if let Some(existing) = shard.get(&id) {
            return Some(Arc::clone(existing));
        }
        if !shard.is_empty() {
            self.collisions.fetch_add(1, Ordering::Relaxed);
        }
        let _: Option<HeaderRef> = shard.insert(id, Arc::clone(ArcMutexGuard::mutex(header)));
        header.flags.in_hash = true;
        None
    }

    /// Removes the locked header from the index.
    pub(crate) fn remove(&self, header: &mut HeaderGuard) {
        header.flags.in_hash = false;
        let Some(id) = header.identity else {
            return;
        };
        let mut shard = self.shard(&id).lock();
        let indexed = shard
            .get(&id)
            .is_some_and(|existing| Arc::ptr_eq(existing, ArcMutexGuard::mutex(header)));
        if indexed {
            let _: Option<HeaderRef> = shard.remove(&id);
        }
    }

    /// The number of indexed headers.
    pub(crate) fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    /// The number of inserts into a non-empty shard.
    pub(crate) fn collisions(&self) -> u64 {
        self.collisions.load(Ordering::Relaxed)
    }

    /// All the indexed headers.
    #[cfg(test)]
    pub(crate) fn headers(&self) -> Vec<HeaderRef> {
        self.shards
            .iter()
            .flat_map(|shard| shard.lock().values().map(Arc::clone).collect::<Vec<_>>())
            .collect()
    }
}
