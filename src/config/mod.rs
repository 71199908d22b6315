/// Configuration module. This module is used to parse configuration from command line arguments
#[allow(clippy::module_inception)]
mod config;
/// Inner configuration module. This module is used to store the parsed configuration
/// and will be used to initialize the cache
mod inner;

pub use config::{CacheConfig, Config, WorkloadConfig};
pub use inner::{CacheParams, InnerConfig, WorkloadParams};
