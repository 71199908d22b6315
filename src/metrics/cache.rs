//! Metrics for block caches.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec_with_registry, register_gauge_vec_with_registry, CounterVec, GaugeVec,
    Registry,
};

use super::ARC_REGISTRY;

/// The block caches related metrics.
pub static ARC_METRICS: Lazy<ArcMetrics> = Lazy::new(|| ArcMetrics::new(&ARC_REGISTRY));

/// The block caches related metrics.
#[derive(Debug)]
pub struct ArcMetrics {
    /// The counters of total of cache hits. With label: `[name]`.
    cache_hit_count: CounterVec,
    /// The counters of total of cache misses. With label: `[name]`
    cache_miss_count: CounterVec,
    /// The counters of total of hits in the ghost lists. With label: `[name]`
    ghost_hit_count: CounterVec,
    /// The target sizes of caches. With labels: `[name, target]`
    target_bytes: GaugeVec,
}

impl ArcMetrics {
    /// Creates an instance of `ArcMetrics`, which will create the metric
    /// vectors and register them into the specified registry.
    ///
    /// # Panics
    /// This method panics if it called multiple times on the same registry.
    #[allow(clippy::expect_used)] // We can ensure that this method won't panic if we followed the hints above
    #[allow(clippy::ignored_unit_patterns)] // Raised by `register_counter_vec_with_registry`
    fn new(registry: &Registry) -> Self {
        let cache_hit_count = register_counter_vec_with_registry!(
            "arc_hit_count",
            "The total of cache hits",
            &["name"],
            registry,
        )
        .expect("Metrics name must be unique.");

        let cache_miss_count = register_counter_vec_with_registry!(
            "arc_miss_count",
            "The total of cache misses",
            &["name"],
            registry,
        )
        .expect("Metrics name must be unique.");

        let ghost_hit_count = register_counter_vec_with_registry!(
            "arc_ghost_hit_count",
            "The total of hits in the ghost lists",
            &["name"],
            registry,
        )
        .expect("Metrics name must be unique.");

        let target_bytes = register_gauge_vec_with_registry!(
            "arc_target_bytes",
            "The target sizes of the cache",
            &["name", "target"],
            registry,
        )
        .expect("Metrics name must be unique.");

        Self {
            cache_hit_count,
            cache_miss_count,
            ghost_hit_count,
            target_bytes,
        }
    }

    /// Increase the hit count with `name`.
    pub fn hit(&self, name: &str) {
        self.cache_hit_count.with_label_values(&[name]).inc();
    }

    /// Increase the miss count with `name`.
    pub fn miss(&self, name: &str) {
        self.cache_miss_count.with_label_values(&[name]).inc();
    }

    /// Increase the ghost hit count with `name`.
    pub fn ghost_hit(&self, name: &str) {
        self.ghost_hit_count.with_label_values(&[name]).inc();
    }

    /// Set the target sizes of the cache `name`.
    pub fn set_targets(&self, name: &str, total: usize, mru: usize) {
        self.target_bytes
            .with_label_values(&[name, "total"])
            .set(gauge_value(total));
        self.target_bytes
            .with_label_values(&[name, "mru"])
            .set(gauge_value(mru));
    }
}

/// A byte count as a gauge value, rounded above 2^53.
#[allow(clippy::as_conversions, clippy::cast_precision_loss)]
fn gauge_value(bytes: usize) -> f64 {
    bytes as f64
}
