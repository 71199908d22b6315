//! End to end tests of the cache over a memory storage.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::oneshot;

use super::*;
use crate::backend::MemoryStorage;

const BLOCK_SIZE: usize = 512;

fn params(max_size: usize) -> CacheParams {
    CacheParams {
        min_size: max_size / 2,
        max_size,
        meta_limit: max_size,
        shard_num: 4,
        max_block_size: BLOCK_SIZE,
        reclaim_interval: Duration::from_secs(3600),
        ..CacheParams::default()
    }
}

/// Builds a cache whose reclaim worker is stopped, so that only the test
/// drives eviction.
async fn prepare_cache(
    storage: &Arc<MemoryStorage>,
    params: CacheParams,
    monitor: Arc<dyn MemoryMonitor>,
) -> Arc<BlockCache> {
    let backend: Arc<MemoryStorage> = Arc::clone(storage);
    let cache = BlockCacheBuilder::new(backend)
        .params(params)
        .monitor(monitor)
        .name("test")
        .build();
    cache.shutdown();
    // Let the worker observe the shutdown before the test goes on.
    tokio::task::yield_now().await;
    cache
}

async fn prepare(
    latency: Duration,
    blocks: u64,
    max_size: usize,
) -> (Arc<MemoryStorage>, Vec<BlockId>, Arc<BlockCache>) {
    let storage = Arc::new(MemoryStorage::new(latency));
    let ids = storage.populate(blocks, BLOCK_SIZE);
    let cache = prepare_cache(&storage, params(max_size), Arc::new(NoPressure)).await;
    (storage, ids, cache)
}

fn pointer(id: BlockId) -> BlockPointer {
    BlockPointer::new(id, BLOCK_SIZE, ContentType::Data)
}

/// Reads the block and releases it at once.
async fn touch(cache: &Arc<BlockCache>, id: BlockId) {
    let tag = RefTag::new();
    let buffer = cache.read_buffer(&pointer(id), tag).await.unwrap();
    assert_eq!(buffer.to_vec().unwrap(), vec![id.address.to_le_bytes()[0]; BLOCK_SIZE]);
    let _: bool = cache.release_reference(&buffer, tag);
}

/// A read callback forwarding the result to a channel.
fn channel_callback() -> (ReadDone, oneshot::Receiver<CacheResult<Buffer>>) {
    let (tx, rx) = oneshot::channel();
    let done: ReadDone = Box::new(move |result| {
        tx.send(result).unwrap();
    });
    (done, rx)
}

#[tokio::test]
async fn test_miss_inserts_into_mru() {
    let (storage, ids, cache) = prepare(Duration::ZERO, 1, 1024).await;
    let tag = RefTag::new();

    let buffer = cache.read_buffer(&pointer(ids[0]), tag).await.unwrap();
    assert_eq!(cache.state_of(&ids[0]), Some(StateKind::Mru));
    assert!(cache.is_referenced(&buffer));
    // A referenced block is not evictable.
    assert_eq!(cache.evictable_size(StateKind::Mru), 0);

    assert!(cache.release_reference(&buffer, tag));
    assert!(!cache.is_referenced(&buffer));
    assert_eq!(cache.state_size(StateKind::Mru), BLOCK_SIZE);
    assert_eq!(cache.evictable_size(StateKind::Mru), BLOCK_SIZE);
    assert_eq!(cache.size(), BLOCK_SIZE);
    assert_eq!(cache.stats().misses, 1);
    assert_eq!(storage.reads(), 1);
    cache.check_accounting();
}

#[tokio::test]
async fn test_insert_evicts_exactly_one() {
    let (storage, ids, cache) = prepare(Duration::ZERO, 3, 1024).await;
    assert_eq!(cache.target_total(), 1024);

    touch(&cache, ids[0]).await;
    touch(&cache, ids[1]).await;
    assert_eq!(cache.state_len(StateKind::Mru), 2);
    assert_eq!(cache.size(), 1024);

    touch(&cache, ids[2]).await;
    assert_eq!(cache.state_of(&ids[0]), Some(StateKind::MruGhost));
    assert_eq!(cache.state_of(&ids[1]), Some(StateKind::Mru));
    assert_eq!(cache.state_of(&ids[2]), Some(StateKind::Mru));
    assert_eq!(cache.state_len(StateKind::Mru), 2);
    assert_eq!(cache.state_len(StateKind::MruGhost), 1);
    assert_eq!(cache.state_size(StateKind::MruGhost), BLOCK_SIZE);
    assert_eq!(cache.size(), 1024);

    let stats = cache.stats();
    assert_eq!(stats.stolen, 1);
    assert_eq!(stats.evicted_bytes, BLOCK_SIZE as u64);
    assert_eq!(storage.reads(), 3);
    cache.check_accounting();
}

#[tokio::test]
async fn test_concurrent_cold_reads() {
    let (storage, ids, cache) = prepare(Duration::from_millis(20), 1, 1024).await;
    let (tag_a, tag_b) = (RefTag::new(), RefTag::new());
    let bp = pointer(ids[0]);

    let (a, b) = tokio::join!(cache.read_buffer(&bp, tag_a), cache.read_buffer(&bp, tag_b));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(storage.reads(), 1);
    assert!(!a.same_buffer(&b));
    assert_eq!(a.to_vec(), b.to_vec());
    assert_eq!(cache.stats().duplicate_buffers, 1);
    assert_eq!(cache.state_size(StateKind::Mru), 2 * BLOCK_SIZE);

    let _: bool = cache.release_reference(&a, tag_a);
    let _: bool = cache.release_reference(&b, tag_b);
    // The clone is gone, one copy stays cached.
    assert_eq!(cache.state_size(StateKind::Mru), BLOCK_SIZE);
    assert_eq!(cache.size(), BLOCK_SIZE);
    cache.check_accounting();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_cold_readers_share_one_read() {
    const READERS: usize = 16;
    let (storage, ids, cache) = prepare(Duration::from_millis(20), 1, 16 * 1024).await;
    let barrier = Arc::new(tokio::sync::Barrier::new(READERS));

    let readers = (0..READERS).map(|_| {
        let cache = Arc::clone(&cache);
        let barrier = Arc::clone(&barrier);
        let bp = pointer(ids[0]);
        tokio::spawn(async move {
            let tag = RefTag::new();
            let _: tokio::sync::BarrierWaitResult = barrier.wait().await;
            let buffer = cache.read_buffer(&bp, tag).await.unwrap();
            (tag, buffer)
        })
    });
    let results = futures::future::try_join_all(readers).await.unwrap();

    assert_eq!(storage.reads(), 1);
    assert_eq!(cache.stats().misses, 1);
    assert_eq!(cache.indexed_blocks(), 1);
    let expected = vec![ids[0].address.to_le_bytes()[0]; BLOCK_SIZE];
    for (_, buffer) in &results {
        assert_eq!(buffer.to_vec().unwrap(), expected);
    }
    cache.check_accounting();

    for (tag, buffer) in &results {
        let _: bool = cache.release_reference(buffer, *tag);
    }
    assert_eq!(cache.size(), BLOCK_SIZE);
    cache.check_accounting();
}

#[tokio::test]
async fn test_abandoned_read_still_completes() {
    let (storage, ids, cache) = prepare(Duration::from_millis(100), 1, 1024).await;
    let bp = pointer(ids[0]);
    let (tag_a, tag_b) = (RefTag::new(), RefTag::new());

    let res = tokio::time::timeout(Duration::from_millis(10), cache.read_buffer(&bp, tag_a)).await;
    assert!(res.is_err());

    // The read goes on without its first reader.
    let buffer = tokio::time::timeout(Duration::from_secs(2), cache.read_buffer(&bp, tag_b))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(storage.reads(), 1);
    assert_eq!(buffer.to_vec().unwrap(), vec![0; BLOCK_SIZE]);
    // Only the second reader holds a reference.
    assert!(cache.release_reference(&buffer, tag_b));
    assert!(!cache.is_referenced(&buffer));
    assert_eq!(cache.size(), BLOCK_SIZE);
    cache.check_accounting();
}

#[tokio::test]
async fn test_pending_callbacks_fan_out() {
    let (storage, ids, cache) = prepare(Duration::from_millis(20), 1, 1024).await;
    let bp = pointer(ids[0]);
    let (tag_a, tag_b) = (RefTag::new(), RefTag::new());

    let (done_a, rx_a) = channel_callback();
    let status = cache
        .cache_read(&bp, tag_a, ReadFlags::NONE, Some(done_a))
        .await
        .unwrap();
    assert_eq!(status, ReadStatus::Pending);
    let (done_b, rx_b) = channel_callback();
    let status = cache
        .cache_read(&bp, tag_b, ReadFlags::NONE, Some(done_b))
        .await
        .unwrap();
    assert_eq!(status, ReadStatus::Pending);

    let a = rx_a.await.unwrap().unwrap();
    let b = rx_b.await.unwrap().unwrap();
    assert_eq!(a.to_vec(), b.to_vec());
    assert_eq!(storage.reads(), 1);
    assert_eq!(cache.stats().duplicate_reads, 1);

    let _: bool = cache.release_reference(&a, tag_a);
    let _: bool = cache.release_reference(&b, tag_b);
    cache.check_accounting();
}

#[tokio::test]
async fn test_ghost_hits_move_target_mru() {
    let (storage, ids, cache) = prepare(Duration::ZERO, 4, 1024).await;
    touch(&cache, ids[0]).await;
    touch(&cache, ids[1]).await;
    touch(&cache, ids[2]).await;
    assert_eq!(cache.state_of(&ids[0]), Some(StateKind::MruGhost));

    // A hit in the MRU ghost list grows the MRU share.
    let before = cache.target_mru();
    touch(&cache, ids[0]).await;
    assert!(cache.target_mru() > before);
    assert_eq!(cache.target_mru(), 1024 - (1024 >> cache.params().p_min_shift));
    assert_eq!(cache.state_of(&ids[0]), Some(StateKind::Mfu));
    assert_eq!(cache.state_of(&ids[1]), Some(StateKind::MruGhost));
    assert_eq!(cache.stats().mru_ghost_hits, 1);
    assert_eq!(storage.reads(), 4);

    // The MRU side is below its share now, a new block evicts from the MFU side.
    touch(&cache, ids[3]).await;
    assert_eq!(cache.state_of(&ids[0]), Some(StateKind::MfuGhost));

    // A hit in the MFU ghost list shrinks the MRU share.
    let before = cache.target_mru();
    touch(&cache, ids[0]).await;
    assert!(cache.target_mru() < before);
    assert_eq!(cache.state_of(&ids[0]), Some(StateKind::Mfu));
    assert_eq!(cache.stats().mfu_ghost_hits, 1);
    assert_eq!(cache.size(), 1024);
    cache.check_accounting();
}

#[tokio::test]
async fn test_referenced_blocks_are_not_evicted() {
    let (_storage, ids, cache) = prepare(Duration::ZERO, 3, 1024).await;
    let tag = RefTag::new();
    let a = cache.read_buffer(&pointer(ids[0]), tag).await.unwrap();
    let b = cache.read_buffer(&pointer(ids[1]), tag).await.unwrap();

    // Nothing can be evicted, the cache goes over its target.
    touch(&cache, ids[2]).await;
    assert_eq!(cache.state_len(StateKind::Mru), 3);
    assert_eq!(cache.state_len(StateKind::MruGhost), 0);
    assert_eq!(cache.size(), 3 * BLOCK_SIZE);
    assert_eq!(cache.stats().recycle_miss, 1);
    assert!(!a.is_evicted());
    assert!(!b.is_evicted());

    let _: bool = cache.release_reference(&a, tag);
    let _: bool = cache.release_reference(&b, tag);
    // Released blocks are the newest, the third block is the oldest now.
    cache.reclaim_now();
    assert_eq!(cache.size(), 1024);
    assert!(!a.is_evicted());
    assert!(!b.is_evicted());
    // The ghost is trimmed as well, the MRU side already fills the cache.
    assert_eq!(cache.state_of(&ids[2]), None);
    assert_eq!(cache.stats().deleted, 1);
    cache.check_accounting();
}

#[tokio::test]
async fn test_young_prefetch_is_protected() {
    let (_storage, ids, cache) = prepare(Duration::ZERO, 3, 1024).await;
    let tag = RefTag::new();

    let status = cache
        .cache_read(
            &pointer(ids[0]),
            tag,
            ReadFlags::PREFETCH | ReadFlags::WAIT,
            None,
        )
        .await
        .unwrap();
    assert_eq!(status, ReadStatus::Miss);
    assert_eq!(cache.state_of(&ids[0]), Some(StateKind::Mru));
    touch(&cache, ids[1]).await;
    touch(&cache, ids[2]).await;

    // The older prefetched block is skipped.
    assert_eq!(cache.state_of(&ids[0]), Some(StateKind::Mru));
    assert_eq!(cache.state_of(&ids[1]), Some(StateKind::MruGhost));
    assert!(cache.stats().evict_skip >= 1);

    // A flush ignores the protection.
    cache.flush_all();
    assert_eq!(cache.size(), 0);
    assert_eq!(cache.indexed_blocks(), 0);
}

#[tokio::test]
async fn test_io_error_reaches_all_waiters() {
    let (storage, ids, cache) = prepare(Duration::from_millis(10), 1, 1024).await;
    storage.set_failing(ids[0], true);
    let bp = pointer(ids[0]);

    let (done_a, rx_a) = channel_callback();
    let (done_b, rx_b) = channel_callback();
    let _: ReadStatus = cache
        .cache_read(&bp, RefTag::new(), ReadFlags::NONE, Some(done_a))
        .await
        .unwrap();
    let _: ReadStatus = cache
        .cache_read(&bp, RefTag::new(), ReadFlags::NONE, Some(done_b))
        .await
        .unwrap();
    assert!(matches!(rx_a.await.unwrap(), Err(CacheError::Io { .. })));
    assert!(matches!(rx_b.await.unwrap(), Err(CacheError::Io { .. })));
    assert_eq!(storage.reads(), 1);
    assert_eq!(cache.state_of(&ids[0]), None);
    assert_eq!(cache.indexed_blocks(), 0);
    assert_eq!(cache.size(), 0);
    cache.check_accounting();

    // The failure is not remembered.
    storage.set_failing(ids[0], false);
    touch(&cache, ids[0]).await;
    assert_eq!(cache.state_of(&ids[0]), Some(StateKind::Mru));
}

#[tokio::test]
async fn test_write_caches_block() {
    let (storage, _ids, cache) = prepare(Duration::ZERO, 0, 1024).await;
    let tag = RefTag::new();
    let buffer = cache
        .alloc_buffer(BLOCK_SIZE, ContentType::Data, tag)
        .unwrap();
    assert!(cache.is_released(&buffer));

    let ready_called = Arc::new(AtomicBool::new(false));
    let ready_flag = Arc::clone(&ready_called);
    let ready: WriteReady = Box::new(move |buffer: &Buffer| {
        buffer.data_mut().unwrap().fill(7);
        ready_flag.store(true, Ordering::Release);
    });
    let (tx, rx) = oneshot::channel();
    let done: WriteDone = Box::new(move |result| tx.send(result).unwrap());
    let id = cache
        .cache_write(&buffer, Some(ready), Some(done))
        .unwrap()
        .join()
        .await
        .unwrap();
    assert!(ready_called.load(Ordering::Acquire));
    assert_eq!(rx.await.unwrap().unwrap(), id);
    assert!(storage.contains(&id));
    assert_eq!(cache.state_of(&id), Some(StateKind::Mru));
    // A cached buffer is frozen.
    assert!(matches!(buffer.data_mut(), Err(CacheError::Frozen)));
    assert!(matches!(
        cache.cache_write(&buffer, None, None),
        Err(CacheError::Frozen)
    ));

    let _: bool = cache.release_reference(&buffer, tag);
    let read = cache
        .read_buffer(&pointer(id), tag)
        .await
        .unwrap();
    assert_eq!(read.to_vec().unwrap(), vec![7; BLOCK_SIZE]);
    assert_eq!(storage.reads(), 0);
    let _: bool = cache.release_reference(&read, tag);
    cache.check_accounting();
}

#[tokio::test]
async fn test_rewrite_replaces_cached_block() {
    let (storage, _ids, cache) = prepare(Duration::ZERO, 0, 4096).await;
    let tag = RefTag::new();

    let mut buffers = Vec::new();
    let mut written = Vec::new();
    for _ in 0..2 {
        let buffer = cache
            .alloc_buffer(BLOCK_SIZE, ContentType::Data, tag)
            .unwrap();
        buffer.data_mut().unwrap().fill(3);
        let id = cache
            .cache_write(&buffer, None, None)
            .unwrap()
            .join()
            .await
            .unwrap();
        buffers.push(buffer);
        written.push(id);
    }
    assert_eq!(written[0], written[1]);
    assert_eq!(storage.writes(), 2);
    assert_eq!(cache.indexed_blocks(), 1);
    assert_eq!(cache.state_of(&written[0]), Some(StateKind::Mru));
    // The first copy is still referenced, it lives on as an anonymous block.
    assert!(cache.is_released(&buffers[0]));
    assert!(!cache.is_released(&buffers[1]));

    for buffer in &buffers {
        let _: bool = cache.release_reference(buffer, tag);
    }
    assert_eq!(cache.size(), BLOCK_SIZE);
    cache.check_accounting();
}

#[tokio::test]
async fn test_failed_write_keeps_buffer_anonymous() {
    let (storage, _ids, cache) = prepare(Duration::ZERO, 0, 1024).await;
    storage.set_fail_writes(true);
    let tag = RefTag::new();
    let buffer = cache
        .alloc_buffer(BLOCK_SIZE, ContentType::Data, tag)
        .unwrap();

    let res = cache.cache_write(&buffer, None, None).unwrap().join().await;
    assert!(matches!(res, Err(CacheError::Io { id: None, .. })));
    assert!(cache.is_released(&buffer));
    assert_eq!(cache.indexed_blocks(), 0);
    // The buffer can be mutated and written again.
    buffer.data_mut().unwrap().fill(1);

    assert!(cache.release_reference(&buffer, tag));
    assert_eq!(cache.size(), 0);
}

#[tokio::test]
async fn test_buffer_released_during_write() {
    let (storage, _ids, cache) = prepare(Duration::from_millis(30), 0, 1024).await;
    let tag = RefTag::new();

    // A failed write frees a buffer nobody holds any more.
    storage.set_fail_writes(true);
    let buffer = cache
        .alloc_buffer(BLOCK_SIZE, ContentType::Data, tag)
        .unwrap();
    let handle = cache.cache_write(&buffer, None, None).unwrap();
    assert!(cache.release_reference(&buffer, tag));
    assert_eq!(cache.size(), BLOCK_SIZE);
    assert!(handle.join().await.is_err());
    assert_eq!(cache.size(), 0);
    assert_eq!(cache.state_len(StateKind::Anon), 0);
    assert_eq!(cache.state_size(StateKind::Anon), 0);
    assert!(buffer.is_evicted());
    cache.check_accounting();

    // A successful one caches it, ready for the next reader.
    storage.set_fail_writes(false);
    let buffer = cache
        .alloc_buffer(BLOCK_SIZE, ContentType::Data, tag)
        .unwrap();
    buffer.data_mut().unwrap().fill(7);
    let handle = cache.cache_write(&buffer, None, None).unwrap();
    assert!(cache.release_reference(&buffer, tag));
    let id = handle.join().await.unwrap();
    assert_eq!(cache.state_of(&id), Some(StateKind::Mru));
    assert_eq!(cache.evictable_size(StateKind::Mru), BLOCK_SIZE);

    let bp = BlockPointer::new(id, BLOCK_SIZE, ContentType::Data);
    let again = cache.read_buffer(&bp, tag).await.unwrap();
    assert!(again.same_buffer(&buffer));
    assert_eq!(again.to_vec().unwrap(), vec![7; BLOCK_SIZE]);
    assert_eq!(storage.reads(), 0);
    let _: bool = cache.release_reference(&again, tag);
    cache.check_accounting();
}

#[tokio::test]
async fn test_release_for_mutation() {
    let (_storage, ids, cache) = prepare(Duration::ZERO, 1, 4096).await;
    let (tag_a, tag_b) = (RefTag::new(), RefTag::new());
    let a = cache.read_buffer(&pointer(ids[0]), tag_a).await.unwrap();
    let b = cache.read_buffer(&pointer(ids[0]), tag_b).await.unwrap();
    assert!(matches!(b.data_mut(), Err(CacheError::Frozen)));

    // A shared buffer is split off.
    cache.release_for_mutation(&b, tag_b).unwrap();
    assert!(cache.is_released(&b));
    b.data_mut().unwrap().fill(0xff);
    assert_eq!(cache.state_of(&ids[0]), Some(StateKind::Mru));
    assert_eq!(cache.state_size(StateKind::Mru), BLOCK_SIZE);
    assert_eq!(a.to_vec().unwrap(), vec![0; BLOCK_SIZE]);
    assert!(cache.release_reference(&b, tag_b));
    assert_eq!(cache.size(), BLOCK_SIZE);

    // The sole buffer takes the block out of the cache.
    cache.release_for_mutation(&a, tag_a).unwrap();
    assert_eq!(cache.state_of(&ids[0]), None);
    a.data_mut().unwrap().fill(1);
    assert!(cache.release_reference(&a, tag_a));
    assert_eq!(cache.size(), 0);
    cache.check_accounting();
}

#[tokio::test]
async fn test_freed_in_read() {
    let (_storage, ids, cache) = prepare(Duration::from_millis(20), 1, 1024).await;
    let (done, rx) = channel_callback();
    let status = cache
        .cache_read(&pointer(ids[0]), RefTag::new(), ReadFlags::NONE, Some(done))
        .await
        .unwrap();
    assert_eq!(status, ReadStatus::Pending);

    cache.freed(&ids[0]);
    let res = rx.await.unwrap();
    assert!(matches!(res, Err(CacheError::FreedInRead(id)) if id == ids[0]));
    assert_eq!(cache.state_of(&ids[0]), None);
    assert_eq!(cache.size(), 0);
    cache.check_accounting();
}

#[tokio::test]
async fn test_freed_block_is_forgotten() {
    let (storage, ids, cache) = prepare(Duration::ZERO, 1, 1024).await;
    touch(&cache, ids[0]).await;
    cache.freed(&ids[0]);
    assert_eq!(cache.state_of(&ids[0]), None);
    assert_eq!(cache.size(), 0);

    touch(&cache, ids[0]).await;
    assert_eq!(storage.reads(), 2);
}

#[tokio::test]
async fn test_eviction_callback() {
    let (_storage, ids, cache) = prepare(Duration::ZERO, 3, 1024).await;
    let tag = RefTag::new();
    let evicted = Arc::new(AtomicUsize::new(0));

    let buffer = cache.read_buffer(&pointer(ids[0]), tag).await.unwrap();
    let counter = Arc::clone(&evicted);
    cache
        .register_eviction_callback(
            &buffer,
            Box::new(move || {
                counter.fetch_add(1, Ordering::AcqRel);
            }),
        )
        .unwrap();
    let _: bool = cache.release_reference(&buffer, tag);
    // The data stays readable until it is evicted.
    assert!(!buffer.is_evicted());

    touch(&cache, ids[1]).await;
    touch(&cache, ids[2]).await;
    assert!(buffer.is_evicted());
    assert!(buffer.data().is_none());
    // Callbacks are deferred to the reclaim worker.
    assert_eq!(evicted.load(Ordering::Acquire), 0);
    cache.do_user_evicts();
    assert_eq!(evicted.load(Ordering::Acquire), 1);
    cache.do_user_evicts();
    assert_eq!(evicted.load(Ordering::Acquire), 1);
}

/// Registers a callback counting its invocations.
fn counting_callback(cache: &BlockCache, buffer: &Buffer) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    cache
        .register_eviction_callback(
            buffer,
            Box::new(move || {
                counter.fetch_add(1, Ordering::AcqRel);
            }),
        )
        .unwrap();
    count
}

#[tokio::test]
async fn test_clear_eviction_callback() {
    let (storage, ids, cache) = prepare(Duration::ZERO, 1, 1024).await;
    let tag = RefTag::new();
    let buffer = cache.read_buffer(&pointer(ids[0]), tag).await.unwrap();
    let count = counting_callback(&cache, &buffer);
    let _: bool = cache.release_reference(&buffer, tag);

    // The callback runs at once, the data stays cached.
    assert!(cache.clear_eviction_callback(&buffer));
    assert_eq!(count.load(Ordering::Acquire), 1);
    assert!(!buffer.is_evicted());
    assert_eq!(cache.state_of(&ids[0]), Some(StateKind::Mru));
    assert_eq!(cache.size(), 512);

    // The buffer is handed to the next reader without a copy.
    let again = cache.read_buffer(&pointer(ids[0]), tag).await.unwrap();
    assert!(again.same_buffer(&buffer));
    assert_eq!(storage.reads(), 1);
    assert_eq!(cache.stats().duplicate_buffers, 0);
    let _: bool = cache.release_reference(&again, tag);

    assert!(!cache.clear_eviction_callback(&buffer));
    assert_eq!(count.load(Ordering::Acquire), 1);
    cache.check_accounting();
}

#[tokio::test]
async fn test_clear_callback_of_evicted_buffer() {
    let (_storage, ids, cache) = prepare(Duration::ZERO, 3, 1024).await;
    let tag = RefTag::new();
    let buffer = cache.read_buffer(&pointer(ids[0]), tag).await.unwrap();
    let count = counting_callback(&cache, &buffer);
    let _: bool = cache.release_reference(&buffer, tag);

    touch(&cache, ids[1]).await;
    touch(&cache, ids[2]).await;
    assert!(buffer.is_evicted());
    assert_eq!(count.load(Ordering::Acquire), 0);

    // Evicted but not reaped yet: the callback runs now, and only once.
    assert!(cache.clear_eviction_callback(&buffer));
    assert_eq!(count.load(Ordering::Acquire), 1);
    cache.do_user_evicts();
    assert_eq!(count.load(Ordering::Acquire), 1);
    assert!(!cache.clear_eviction_callback(&buffer));
    cache.check_accounting();
}

#[tokio::test]
async fn test_buffer_eviction_needed() {
    let (_storage, ids, cache) = prepare(Duration::ZERO, 3, 1024).await;
    let (tag_a, tag_b) = (RefTag::new(), RefTag::new());
    let a = cache.read_buffer(&pointer(ids[0]), tag_a).await.unwrap();
    assert!(!cache.buffer_eviction_needed(&a));

    // Two copies of user data, either holder should let go.
    let b = cache.read_buffer(&pointer(ids[0]), tag_b).await.unwrap();
    assert!(cache.buffer_eviction_needed(&a));
    assert!(cache.buffer_eviction_needed(&b));
    let _: bool = cache.release_reference(&b, tag_b);
    assert!(!cache.buffer_eviction_needed(&a));
    assert!(!cache.buffer_eviction_needed(&b));

    let count = counting_callback(&cache, &a);
    let _: bool = cache.release_reference(&a, tag_a);
    touch(&cache, ids[1]).await;
    touch(&cache, ids[2]).await;
    assert!(a.is_evicted());
    // Evicted, the callback is pending.
    assert!(cache.buffer_eviction_needed(&a));
    cache.do_user_evicts();
    assert_eq!(count.load(Ordering::Acquire), 1);
    assert!(!cache.buffer_eviction_needed(&a));
}

#[tokio::test]
async fn test_tempreserve_throttles_dirty_data() {
    let (_storage, _ids, cache) = prepare(Duration::ZERO, 0, 4096).await;
    let tag = RefTag::new();
    let dirty: Vec<Buffer> = (0..3)
        .map(|_| cache.alloc_buffer(BLOCK_SIZE, ContentType::Data, tag).unwrap())
        .collect();
    assert_eq!(cache.state_size(StateKind::Anon), 3 * BLOCK_SIZE);

    cache.tempreserve_space(256).unwrap();
    assert_eq!(cache.tempreserve(), 256);
    // Dirty data fills more than a quarter of the target, and the reservation
    // would overcommit half of it.
    assert!(matches!(
        cache.tempreserve_space(512),
        Err(CacheError::Throttled { reserve: 512 })
    ));
    assert_eq!(cache.tempreserve(), 256);
    assert_eq!(cache.stats().memory_throttle, 0);

    // A buffer on loan no longer counts as dirty data.
    cache.loan_inuse_buffer(&dirty[2], tag).unwrap();
    assert_eq!(cache.loaned_bytes(), BLOCK_SIZE);
    cache.tempreserve_space(512).unwrap();
    assert_eq!(cache.tempreserve(), 768);

    cache.tempreserve_clear(768);
    assert_eq!(cache.tempreserve(), 0);
    cache.return_buffer(&dirty[2], tag).unwrap();
    assert_eq!(cache.loaned_bytes(), 0);
    for buffer in &dirty {
        assert!(cache.release_reference(buffer, tag));
    }
    assert_eq!(cache.size(), 0);
    cache.check_accounting();
}

#[tokio::test]
async fn test_tempreserve_resizes_target() {
    let (_storage, _ids, cache) = prepare(Duration::ZERO, 0, 4096).await;
    assert!(matches!(
        cache.tempreserve_space(5000),
        Err(CacheError::OutOfMemory { size: 5000 })
    ));
    assert_eq!(cache.tempreserve(), 0);

    cache.shrink(1024);
    assert_eq!(cache.target_total(), 2048);
    // A large reservation lets the target grow to four times its size.
    cache.tempreserve_space(1024).unwrap();
    assert_eq!(cache.target_total(), 4096);
    cache.tempreserve_clear(1024);

    cache.shrink(1024);
    cache.set_no_grow(true);
    cache.tempreserve_space(1024).unwrap();
    assert_eq!(cache.target_total(), 2048);
    cache.tempreserve_clear(1024);
    assert_eq!(cache.tempreserve(), 0);
}

#[tokio::test]
async fn test_tempreserve_under_memory_pressure() {
    let storage = Arc::new(MemoryStorage::new(Duration::ZERO));
    let monitor = Arc::new(ManualMonitor::new(-1));
    let shared: Arc<ManualMonitor> = Arc::clone(&monitor);
    let cache = prepare_cache(&storage, params(4096), shared).await;

    assert!(matches!(
        cache.tempreserve_space(128),
        Err(CacheError::Throttled { reserve: 128 })
    ));
    assert_eq!(cache.stats().memory_throttle, 1);
    assert_eq!(cache.tempreserve(), 0);

    monitor.set(i64::MAX);
    cache.tempreserve_space(128).unwrap();
    assert_eq!(cache.tempreserve(), 128);
    cache.tempreserve_clear(128);
}

#[tokio::test]
async fn test_loan_buffer() {
    let (storage, _ids, cache) = prepare(Duration::ZERO, 0, 1024).await;
    let buffer = cache.loan_buffer(BLOCK_SIZE).unwrap();
    assert_eq!(cache.loaned_bytes(), BLOCK_SIZE);
    assert_eq!(cache.state_size(StateKind::Anon), BLOCK_SIZE);
    assert!(cache.is_referenced(&buffer));
    buffer.data_mut().unwrap().fill(3);
    // A buffer on loan cannot be written.
    assert!(matches!(
        cache.cache_write(&buffer, None, None),
        Err(CacheError::Frozen)
    ));

    let tag = RefTag::new();
    cache.return_buffer(&buffer, tag).unwrap();
    assert_eq!(cache.loaned_bytes(), 0);
    let id = cache
        .cache_write(&buffer, None, None)
        .unwrap()
        .join()
        .await
        .unwrap();
    assert!(storage.contains(&id));
    assert_eq!(cache.state_of(&id), Some(StateKind::Mru));

    // Only a private buffer can be lent out again.
    assert!(matches!(
        cache.loan_inuse_buffer(&buffer, tag),
        Err(CacheError::Frozen)
    ));
    assert!(cache.release_reference(&buffer, tag));
    assert_eq!(cache.loaned_bytes(), 0);
    cache.check_accounting();
}

#[tokio::test]
async fn test_loan_inuse_buffer_drops_callback() {
    let (_storage, _ids, cache) = prepare(Duration::ZERO, 0, 1024).await;
    let (tag, next) = (RefTag::new(), RefTag::new());
    let buffer = cache
        .alloc_buffer(BLOCK_SIZE, ContentType::Data, tag)
        .unwrap();
    let count = counting_callback(&cache, &buffer);

    cache.loan_inuse_buffer(&buffer, tag).unwrap();
    assert_eq!(cache.loaned_bytes(), BLOCK_SIZE);
    assert!(cache.is_referenced(&buffer));
    assert!(!cache.clear_eviction_callback(&buffer));

    cache.return_buffer(&buffer, next).unwrap();
    assert!(cache.release_reference(&buffer, next));
    assert!(buffer.is_evicted());
    assert_eq!(cache.size(), 0);
    assert_eq!(count.load(Ordering::Acquire), 0);
}

#[tokio::test]
async fn test_cached_only() {
    let (storage, ids, cache) = prepare(Duration::ZERO, 1, 1024).await;
    let bp = pointer(ids[0]);
    let res = cache
        .cache_read(&bp, RefTag::new(), ReadFlags::CACHED_ONLY, None)
        .await;
    assert!(matches!(res, Err(CacheError::NotCached(id)) if id == ids[0]));
    assert_eq!(storage.reads(), 0);

    touch(&cache, ids[0]).await;
    let tag = RefTag::new();
    let (done, rx) = channel_callback();
    let status = cache
        .cache_read(&bp, tag, ReadFlags::CACHED_ONLY, Some(done))
        .await
        .unwrap();
    assert_eq!(status, ReadStatus::Hit);
    let buffer = rx.await.unwrap().unwrap();
    let _: bool = cache.release_reference(&buffer, tag);
    assert_eq!(storage.reads(), 1);
    assert_eq!(cache.stats().hits, 1);
}

#[tokio::test]
async fn test_embedded_pointer() {
    let (storage, _ids, cache) = prepare(Duration::ZERO, 0, 1024).await;
    let tag = RefTag::new();
    let bp = BlockPointer::embedded(Bytes::from_static(b"tiny"), ContentType::Metadata);

    let buffer = cache.read_buffer(&bp, tag).await.unwrap();
    assert_eq!(buffer.to_vec().unwrap(), b"tiny".to_vec());
    assert_eq!(storage.reads(), 0);
    assert_eq!(cache.indexed_blocks(), 0);
    assert_eq!(cache.meta_used(), 4);

    assert!(cache.release_reference(&buffer, tag));
    assert_eq!(cache.size(), 0);
    assert_eq!(cache.meta_used(), 0);
}

#[tokio::test]
async fn test_read_without_io() {
    let (storage, ids, cache) = prepare(Duration::from_millis(50), 1, 1024).await;
    storage.set_fast_path(true);
    let status = cache
        .cache_read(&pointer(ids[0]), RefTag::new(), ReadFlags::WAIT, None)
        .await
        .unwrap();
    assert_eq!(status, ReadStatus::Miss);
    assert_eq!(storage.reads(), 0);
    assert_eq!(storage.fast_reads(), 1);
    assert_eq!(cache.state_of(&ids[0]), Some(StateKind::Mru));
}

#[tokio::test]
async fn test_reclaim_under_pressure() {
    let storage = Arc::new(MemoryStorage::new(Duration::ZERO));
    let ids = storage.populate(8, BLOCK_SIZE);
    let monitor = Arc::new(ManualMonitor::new(i64::MAX));
    let params = CacheParams {
        min_size: 1024,
        grow_retry: Duration::from_millis(50),
        ..params(4096)
    };
    let shared: Arc<ManualMonitor> = Arc::clone(&monitor);
    let cache = prepare_cache(&storage, params, shared).await;
    for &id in &ids {
        touch(&cache, id).await;
    }
    assert_eq!(cache.size(), 4096);

    monitor.set(-1024);
    cache.reclaim_now();
    assert_eq!(cache.last_reclaim_strategy(), Some(ReclaimStrategy::Aggressive));
    assert!(cache.is_growth_suppressed());
    assert_eq!(cache.target_total(), 4096 - ((4096 >> 7) + 1024));
    assert!(cache.size() <= cache.target_total());
    assert!(cache.target_mru() <= cache.target_total());
    cache.check_accounting();

    // Repeated pressure alternates the strategies.
    cache.reclaim_now();
    assert_eq!(cache.last_reclaim_strategy(), Some(ReclaimStrategy::Conservative));
    cache.reclaim_now();
    assert_eq!(cache.last_reclaim_strategy(), Some(ReclaimStrategy::Aggressive));
    assert!(cache.target_total() >= cache.min_total());

    // Growth resumes once the pressure has been gone long enough.
    monitor.set(i64::MAX);
    cache.reclaim_now();
    assert!(cache.is_growth_suppressed());
    tokio::time::sleep(Duration::from_millis(60)).await;
    cache.reclaim_now();
    assert!(!cache.is_growth_suppressed());
}

#[tokio::test]
async fn test_low_memory_suppresses_growth() {
    let storage = Arc::new(MemoryStorage::new(Duration::ZERO));
    let monitor = Arc::new(ManualMonitor::new(16));
    let shared: Arc<ManualMonitor> = Arc::clone(&monitor);
    let cache = prepare_cache(&storage, params(4096), shared).await;

    cache.reclaim_now();
    assert!(cache.is_growth_suppressed());
    assert_eq!(cache.last_reclaim_strategy(), None);
    assert_eq!(cache.target_total(), 4096);
}

#[tokio::test]
async fn test_shrink_respects_minimum() {
    let (_storage, ids, cache) = prepare(Duration::ZERO, 4, 2048).await;
    for &id in &ids {
        touch(&cache, id).await;
    }
    cache.shrink(usize::MAX / 2);
    assert_eq!(cache.target_total(), cache.min_total());
    assert!(cache.size() <= cache.target_total());
    cache.check_accounting();
}

#[tokio::test]
async fn test_reclaim_worker() {
    let storage = Arc::new(MemoryStorage::new(Duration::ZERO));
    let ids = storage.populate(4, BLOCK_SIZE);
    let monitor = Arc::new(ManualMonitor::new(i64::MAX));
    let params = CacheParams {
        reclaim_interval: Duration::from_millis(10),
        ..params(4096)
    };
    let backend: Arc<MemoryStorage> = Arc::clone(&storage);
    let shared: Arc<ManualMonitor> = Arc::clone(&monitor);
    let cache = BlockCacheBuilder::new(backend)
        .params(params)
        .monitor(shared)
        .build();
    for &id in &ids {
        touch(&cache, id).await;
    }

    monitor.set(-512);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(cache.target_total() < cache.max_total());
    assert!(cache.is_growth_suppressed());
    assert!(cache.last_reclaim_strategy().is_some());
    cache.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_workload() {
    let (storage, ids, cache) = prepare(Duration::from_millis(1), 32, 8 * BLOCK_SIZE).await;
    let ids = Arc::new(ids);

    let tasks = (0..4_u64).map(|seed| {
        let cache = Arc::clone(&cache);
        let ids = Arc::clone(&ids);
        tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(seed);
            let tag = RefTag::new();
            for _ in 0..200 {
                let id = ids[rng.gen_range(0..ids.len())];
                if rng.gen_bool(0.2) {
                    let _: ReadStatus = cache
                        .cache_read(
                            &pointer(id),
                            tag,
                            ReadFlags::PREFETCH | ReadFlags::WAIT,
                            None,
                        )
                        .await
                        .unwrap();
                } else {
                    touch(&cache, id).await;
                }
            }
        })
    });
    for task in futures::future::join_all(tasks).await {
        task.unwrap();
    }

    cache.check_accounting();
    let stats = cache.stats();
    assert_eq!(stats.misses, storage.reads());
    assert!(stats.hits > 0);
    assert_eq!(cache.evictable_size(StateKind::Mru), cache.state_size(StateKind::Mru));
    assert_eq!(cache.evictable_size(StateKind::Mfu), cache.state_size(StateKind::Mfu));

    cache.flush_all();
    assert_eq!(cache.size(), 0);
    assert_eq!(cache.indexed_blocks(), 0);
    for kind in StateKind::ALL {
        assert_eq!(cache.state_len(kind), 0, "{kind:?} is not empty");
    }
}
