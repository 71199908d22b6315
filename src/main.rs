//! A simulation driving a block cache with a skewed concurrent workload over a
//! memory storage, to observe how the cache adapts.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{ensure, Context};
use clap::Parser;
use datenlord_arc::arc::{BlockCache, StatsSnapshot};
use datenlord_arc::common::logger::init_logger;
use datenlord_arc::config::{Config, InnerConfig, WorkloadParams};
use datenlord_arc::metrics::ARC_REGISTRY;
use datenlord_arc::{
    BlockCacheBuilder, BlockId, BlockPointer, ContentType, MemoryStorage, ReadFlags,
    ReadStatus, RefTag,
};
use futures::future::try_join_all;
use prometheus::{Encoder, TextEncoder};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, error, info};

/// The share of reads going to the hot blocks.
const HOT_READ_SHARE: f64 = 0.8;

/// The summary of a simulation run.
#[derive(Debug, Serialize)]
struct Summary {
    /// The name of the cache
    name: String,
    /// The wall time of the run
    elapsed_ms: u128,
    /// The target size at the end of the run
    target_total: usize,
    /// The MRU share at the end of the run
    target_mru: usize,
    /// The bytes of data cached at the end of the run
    size: usize,
    /// The reads issued to the storage
    storage_reads: u64,
    /// The writes issued to the storage
    storage_writes: u64,
    /// The hit ratio of reads
    hit_ratio: f64,
    /// The counters of the cache
    stats: StatsSnapshot,
}

/// Picks a block, most reads going to the hot ones.
fn pick_block(rng: &mut StdRng, ids: &[BlockId], hot_ratio: f64) -> BlockId {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    let hot = ((ids.len() as f64 * hot_ratio) as usize).clamp(1, ids.len());
    let range = if rng.gen_bool(HOT_READ_SHARE) {
        0..hot
    } else {
        0..ids.len()
    };
    let index = rng.gen_range(range);
    *ids.get(index)
        .unwrap_or_else(|| unreachable!("The index is in the range of the blocks."))
}

/// Runs the operations of one reader.
async fn run_reader(
    cache: Arc<BlockCache>,
    ids: Arc<Vec<BlockId>>,
    workload: WorkloadParams,
    seed: u64,
) -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    let tag = RefTag::new();
    for _ in 0..workload.ops {
        let dice: f64 = rng.gen();
        if dice < workload.write_ratio {
            let buffer = cache.alloc_buffer(workload.block_size, ContentType::Data, tag)?;
            rng.fill(&mut *buffer.data_mut()?);
            let id = cache.cache_write(&buffer, None, None)?.join().await?;
            debug!(%id, "written");
            let _: bool = cache.release_reference(&buffer, tag);
        } else if dice < workload.write_ratio + workload.prefetch_ratio {
            let id = pick_block(&mut rng, &ids, 1.0);
            let bp = BlockPointer::new(id, workload.block_size, ContentType::Data);
            let _: ReadStatus = cache
                .cache_read(&bp, tag, ReadFlags::PREFETCH, None)
                .await?;
        } else {
            let id = pick_block(&mut rng, &ids, workload.hot_ratio);
            let bp = BlockPointer::new(id, workload.block_size, ContentType::Data);
            let buffer = cache.read_buffer(&bp, tag).await?;
            {
                let data = buffer.data().context("a referenced buffer is never evicted")?;
                ensure!(
                    data.first() == Some(&id.address.to_le_bytes()[0]),
                    "block {id} read back wrong data"
                );
            }
            let _: bool = cache.release_reference(&buffer, tag);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = InnerConfig::try_from(Config::parse())?;
    init_logger(&config.cache_name, config.log_level, config.log_dir.as_deref())
        .context("failed to open the log file")?;

    let workload = config.workload.clone();
    let storage = Arc::new(MemoryStorage::new(workload.latency));
    let ids = Arc::new(storage.populate(workload.blocks, workload.block_size));
    let backend: Arc<MemoryStorage> = Arc::clone(&storage);
    let cache = BlockCacheBuilder::new(backend)
        .params(config.cache.clone())
        .name(config.cache_name.clone())
        .build();
    info!(?workload, "simulation starts");

    let start = Instant::now();
    let readers = (0..workload.readers).map(|reader| {
        let cache = Arc::clone(&cache);
        let ids = Arc::clone(&ids);
        let workload = workload.clone();
        let seed = u64::try_from(reader).unwrap_or_default();
        tokio::spawn(run_reader(cache, ids, workload, seed))
    });
    for (reader, result) in try_join_all(readers).await?.into_iter().enumerate() {
        if let Err(err) = result {
            error!(reader, error = %err, "reader failed");
            return Err(err);
        }
    }
    let elapsed = start.elapsed();
    cache.reclaim_now();

    let stats = cache.stats();
    let reads = stats.hits + stats.misses;
    #[allow(clippy::cast_precision_loss)]
    let hit_ratio = if reads == 0 {
        0.0
    } else {
        stats.hits as f64 / reads as f64
    };
    let summary = Summary {
        name: cache.name().to_owned(),
        elapsed_ms: elapsed.as_millis(),
        target_total: cache.target_total(),
        target_mru: cache.target_mru(),
        size: cache.size(),
        storage_reads: storage.reads(),
        storage_writes: storage.writes(),
        hit_ratio,
        stats,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&ARC_REGISTRY.gather(), &mut buffer)?;
    println!("{}", String::from_utf8(buffer)?);

    cache.shutdown();
    Ok(())
}
