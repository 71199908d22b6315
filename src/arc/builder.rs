//! The builder of `BlockCache`.

use std::sync::Arc;

use tracing::info;

use super::reclaim::{run_reclaim_task, MemoryMonitor, NoPressure};
use super::BlockCache;
use crate::backend::BlockStorage;
use crate::config::CacheParams;

/// The default name of a cache.
const DEFAULT_NAME: &str = "arc";

/// A builder to configure and build a `BlockCache`.
#[derive(Debug)]
pub struct BlockCacheBuilder {
    /// The storage of the built `BlockCache`
    storage: Arc<dyn BlockStorage>,
    /// The tunables
    params: CacheParams,
    /// The source of memory pressure
    monitor: Arc<dyn MemoryMonitor>,
    /// The name, the label of the metrics
    name: String,
}

impl BlockCacheBuilder {
    /// Create a builder.
    pub fn new(storage: Arc<dyn BlockStorage>) -> Self {
        Self {
            storage,
            params: CacheParams::default(),
            monitor: Arc::new(NoPressure),
            name: DEFAULT_NAME.to_owned(),
        }
    }

    /// Set the tunables.
    #[must_use]
    pub fn params(mut self, params: CacheParams) -> Self {
        self.params = params;
        self
    }

    /// Set the source of memory pressure. No pressure is reported by default.
    #[must_use]
    pub fn monitor(mut self, monitor: Arc<dyn MemoryMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Set the name of the cache.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Builds a `BlockCache`, and starts its reclaim worker. Make sure that
    /// this method is called in `tokio` runtime.
    ///
    /// # Panic
    /// This method will panic if it's not called in a context of `tokio`
    /// runtime.
    #[must_use]
    pub fn build(self) -> Arc<BlockCache> {
        let BlockCacheBuilder {
            storage,
            params,
            monitor,
            name,
        } = self;
        let interval = params.reclaim_interval;

        info!(
            %name,
            min_size = params.min_size,
            max_size = params.max_size,
            "cache starts"
        );
        let cache = Arc::new(BlockCache::new(name, params, storage, monitor));

        let weak = Arc::downgrade(&cache);
        tokio::spawn(run_reclaim_task(
            weak,
            Arc::clone(&cache.wakeup),
            cache.shutdown.clone(),
            interval,
        ));

        cache
    }
}
