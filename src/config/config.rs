use clap::Parser;

#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
/// A config
pub struct Config {
    #[clap(long = "log-level", value_name = "VALUE", default_value = "info")]
    /// Log level: error, warn, info, debug, trace
    pub log_level: String,
    #[clap(long = "log-dir", value_name = "DIR")]
    /// The directory of the log file, log to stderr if not set
    pub log_dir: Option<std::path::PathBuf>,
    #[clap(flatten)]
    /// Cache related config
    pub cache: CacheConfig,
    #[clap(flatten)]
    /// Simulated workload related config
    pub workload: WorkloadConfig,
}

#[derive(Debug, Parser)]
/// Cache config
pub struct CacheConfig {
    #[clap(long = "cache-name", value_name = "VALUE", default_value = "arc")]
    /// The name of the cache, used as the label of its metrics
    pub name: String,
    #[clap(long = "cache-min-size", value_name = "VALUE", default_value = "33554432")]
    /// The floor of the target size, default 32MB
    pub min_size: usize,
    #[clap(long = "cache-max-size", value_name = "VALUE", default_value = "268435456")]
    /// The ceiling of the target size, default 256MB
    pub max_size: usize,
    #[clap(long = "cache-meta-limit", value_name = "VALUE", default_value = "0")]
    /// The ceiling of metadata, 0 for a quarter of the max size
    pub meta_limit: usize,
    #[clap(long = "cache-shards", value_name = "VALUE", default_value = "256")]
    /// The number of shards of the hash index
    pub shard_num: usize,
    #[clap(
        long = "cache-max-block-size",
        value_name = "VALUE",
        default_value = "131072"
    )]
    /// The size of the largest block, default 128KB
    pub max_block_size: usize,
    #[clap(
        long = "cache-grow-retry-secs",
        value_name = "VALUE",
        default_value = "60"
    )]
    /// How long growth stays suppressed after memory pressure
    pub grow_retry_secs: u64,
    #[clap(long = "cache-p-min-shift", value_name = "VALUE", default_value = "4")]
    /// The floor of the MRU share is the target size shifted right by this
    pub p_min_shift: u32,
    #[clap(long = "cache-shrink-shift", value_name = "VALUE", default_value = "7")]
    /// A shrink reduces the MRU share by itself shifted right by this
    pub shrink_shift: u32,
    #[clap(long = "cache-no-grow-shift", value_name = "VALUE", default_value = "5")]
    /// Growth is suppressed when free memory is below the target size shifted
    /// right by this
    pub no_grow_shift: u32,
    #[clap(
        long = "cache-prefetch-lifespan-ms",
        value_name = "VALUE",
        default_value = "1000"
    )]
    /// How long prefetched blocks are protected from eviction
    pub prefetch_lifespan_ms: u64,
    #[clap(
        long = "cache-promote-delay-ms",
        value_name = "VALUE",
        default_value = "62"
    )]
    /// How long after its first access a block can be promoted to MFU
    pub promote_delay_ms: u64,
    #[clap(
        long = "cache-reclaim-interval-ms",
        value_name = "VALUE",
        default_value = "1000"
    )]
    /// The period of the reclaim worker
    pub reclaim_interval_ms: u64,
    #[clap(long = "cache-debug-checksums")]
    /// Verify the checksum of cached data on every access
    pub debug_checksums: bool,
}

#[derive(Debug, Parser)]
/// Simulated workload config
pub struct WorkloadConfig {
    #[clap(long = "workload-blocks", value_name = "VALUE", default_value = "4096")]
    /// The number of distinct blocks
    pub blocks: u64,
    #[clap(
        long = "workload-block-size",
        value_name = "VALUE",
        default_value = "16384"
    )]
    /// The size of blocks
    pub block_size: usize,
    #[clap(long = "workload-readers", value_name = "VALUE", default_value = "8")]
    /// The number of concurrent readers
    pub readers: usize,
    #[clap(long = "workload-ops", value_name = "VALUE", default_value = "10000")]
    /// The number of operations per reader
    pub ops: usize,
    #[clap(
        long = "workload-hot-ratio",
        value_name = "VALUE",
        default_value = "0.2"
    )]
    /// The share of blocks that get most of the reads
    pub hot_ratio: f64,
    #[clap(
        long = "workload-prefetch-ratio",
        value_name = "VALUE",
        default_value = "0.1"
    )]
    /// The share of operations that are prefetches
    pub prefetch_ratio: f64,
    #[clap(
        long = "workload-write-ratio",
        value_name = "VALUE",
        default_value = "0.05"
    )]
    /// The share of operations that are writes
    pub write_ratio: f64,
    #[clap(long = "workload-latency-ms", value_name = "VALUE", default_value = "1")]
    /// The mock latency of the storage
    pub latency_ms: u64,
}
