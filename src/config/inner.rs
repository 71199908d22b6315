use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::arc::{CacheError, CacheResult};
use crate::config::config::{
    CacheConfig as SuperCacheConfig, Config as SuperConfig,
    WorkloadConfig as SuperWorkloadConfig,
};

/// The default ceiling of the target size.
const DEFAULT_MAX_SIZE: usize = 256 * 1024 * 1024;
/// The default size of the largest block.
const DEFAULT_MAX_BLOCK_SIZE: usize = 128 * 1024;

/// Inner config struct
/// This struct is used to store the parsed config
/// and will be used to initialize the cache and the workload
#[derive(Clone, Debug)]
pub struct InnerConfig {
    /// Log level
    pub log_level: LevelFilter,
    /// The directory of the log file
    pub log_dir: Option<PathBuf>,
    /// The name of the cache
    pub cache_name: String,
    /// The tunables of the cache
    pub cache: CacheParams,
    /// The simulated workload
    pub workload: WorkloadParams,
}

impl TryFrom<SuperConfig> for InnerConfig {
    type Error = CacheError;

    #[inline]
    fn try_from(value: SuperConfig) -> Result<Self, Self::Error> {
        let log_level =
            LevelFilter::from_str(value.log_level.as_str()).map_err(|e| {
                CacheError::ArgumentInvalid {
                    context: vec![format!("log level {} is invalid: {}", value.log_level, e)],
                }
            })?;
        let cache_name = value.cache.name.clone();
        let cache: CacheParams = value.cache.try_into()?;
        let workload: WorkloadParams = value.workload.try_into()?;
        if workload.block_size > cache.max_block_size {
            return Err(CacheError::ArgumentInvalid {
                context: vec![format!(
                    "block size {} is larger than the max block size {}",
                    workload.block_size, cache.max_block_size
                )],
            });
        }
        Ok(InnerConfig {
            log_level,
            log_dir: value.log_dir,
            cache_name,
            cache,
            workload,
        })
    }
}

/// The tunables of a cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheParams {
    /// The floor of the target size
    pub min_size: usize,
    /// The ceiling of the target size
    pub max_size: usize,
    /// The ceiling of metadata before it is evicted first
    pub meta_limit: usize,
    /// The number of shards of the hash index
    pub shard_num: usize,
    /// The size of the largest block
    pub max_block_size: usize,
    /// How long growth stays suppressed after memory pressure
    pub grow_retry: Duration,
    /// The floor of the MRU share is the target size shifted right by this
    pub p_min_shift: u32,
    /// A shrink reduces the MRU share by itself shifted right by this
    pub shrink_shift: u32,
    /// Growth is suppressed when free memory is below the target size
    /// shifted right by this
    pub no_grow_shift: u32,
    /// How long prefetched and indirect blocks are protected from eviction
    pub min_prefetch_lifespan: Duration,
    /// How long after its first access a block can be promoted to MFU
    pub mru_promote_delay: Duration,
    /// The period of the reclaim worker
    pub reclaim_interval: Duration,
    /// Verify the checksum of cached data on every access
    pub debug_checksums: bool,
}

impl Default for CacheParams {
    #[inline]
    fn default() -> Self {
        Self {
            min_size: DEFAULT_MAX_SIZE / 8,
            max_size: DEFAULT_MAX_SIZE,
            meta_limit: DEFAULT_MAX_SIZE / 4,
            shard_num: 256,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            grow_retry: Duration::from_secs(60),
            p_min_shift: 4,
            shrink_shift: 7,
            no_grow_shift: 5,
            min_prefetch_lifespan: Duration::from_secs(1),
            mru_promote_delay: Duration::from_millis(62),
            reclaim_interval: Duration::from_secs(1),
            debug_checksums: false,
        }
    }
}

impl CacheParams {
    /// Creates the tunables of a cache between `min_size` and `max_size`,
    /// others take their default.
    #[must_use]
    pub fn with_size(min_size: usize, max_size: usize) -> Self {
        Self {
            min_size,
            max_size,
            meta_limit: max_size / 4,
            ..Self::default()
        }
    }

    /// Checks the tunables against each other.
    pub fn validate(&self) -> CacheResult<()> {
        let mut context = Vec::new();
        if self.min_size > self.max_size {
            context.push(format!(
                "min size {} is larger than max size {}",
                self.min_size, self.max_size
            ));
        }
        if self.shard_num == 0 {
            context.push("the number of shards is zero".to_owned());
        }
        if self.max_block_size == 0 {
            context.push("the max block size is zero".to_owned());
        }
        for (name, shift) in [
            ("p_min_shift", self.p_min_shift),
            ("shrink_shift", self.shrink_shift),
            ("no_grow_shift", self.no_grow_shift),
        ] {
            if shift >= usize::BITS {
                context.push(format!("{name} {shift} is too large"));
            }
        }
        if self.no_grow_shift >= self.shrink_shift {
            context.push(format!(
                "no_grow_shift {} must be less than shrink_shift {}",
                self.no_grow_shift, self.shrink_shift
            ));
        }
        if self.reclaim_interval.is_zero() {
            context.push("the reclaim interval is zero".to_owned());
        }

        if context.is_empty() {
            Ok(())
        } else {
            Err(CacheError::ArgumentInvalid { context })
        }
    }
}

impl TryFrom<SuperCacheConfig> for CacheParams {
    type Error = CacheError;

    #[inline]
    fn try_from(value: SuperCacheConfig) -> Result<Self, Self::Error> {
        let meta_limit = if value.meta_limit == 0 {
            value.max_size / 4
        } else {
            value.meta_limit
        };
        let params = CacheParams {
            min_size: value.min_size,
            max_size: value.max_size,
            meta_limit,
            shard_num: value.shard_num,
            max_block_size: value.max_block_size,
            grow_retry: Duration::from_secs(value.grow_retry_secs),
            p_min_shift: value.p_min_shift,
            shrink_shift: value.shrink_shift,
            no_grow_shift: value.no_grow_shift,
            min_prefetch_lifespan: Duration::from_millis(value.prefetch_lifespan_ms),
            mru_promote_delay: Duration::from_millis(value.promote_delay_ms),
            reclaim_interval: Duration::from_millis(value.reclaim_interval_ms),
            debug_checksums: value.debug_checksums,
        };
        params.validate()?;
        Ok(params)
    }
}

/// The simulated workload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkloadParams {
    /// The number of distinct blocks
    pub blocks: u64,
    /// The size of blocks
    pub block_size: usize,
    /// The number of concurrent readers
    pub readers: usize,
    /// The number of operations per reader
    pub ops: usize,
    /// The share of blocks that get most of the reads
    pub hot_ratio: f64,
    /// The share of operations that are prefetches
    pub prefetch_ratio: f64,
    /// The share of operations that are writes
    pub write_ratio: f64,
    /// The mock latency of the storage
    pub latency: Duration,
}

impl TryFrom<SuperWorkloadConfig> for WorkloadParams {
    type Error = CacheError;

    #[inline]
    fn try_from(value: SuperWorkloadConfig) -> Result<Self, Self::Error> {
        let mut context = Vec::new();
        if value.blocks == 0 || value.block_size == 0 || value.readers == 0 {
            context.push("blocks, block size and readers must be positive".to_owned());
        }
        for (name, ratio) in [
            ("hot ratio", value.hot_ratio),
            ("prefetch ratio", value.prefetch_ratio),
            ("write ratio", value.write_ratio),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                context.push(format!("{name} {ratio} is not in [0, 1]"));
            }
        }
        if value.prefetch_ratio + value.write_ratio > 1.0 {
            context.push("prefetch and write ratios exceed 1 together".to_owned());
        }
        if !context.is_empty() {
            return Err(CacheError::ArgumentInvalid { context });
        }
        Ok(WorkloadParams {
            blocks: value.blocks,
            block_size: value.block_size,
            readers: value.readers,
            ops: value.ops,
            hot_ratio: value.hot_ratio,
            prefetch_ratio: value.prefetch_ratio,
            write_ratio: value.write_ratio,
            latency: Duration::from_millis(value.latency_ms),
        })
    }
}
