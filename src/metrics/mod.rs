//! Cache metrics.

mod cache;

use once_cell::sync::Lazy;
use prometheus::Registry;

pub use self::cache::ARC_METRICS;

/// The global metrics registry of the caches.
pub static ARC_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);
