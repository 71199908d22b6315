//! The reclaim worker, which ties the memory pressure of the system to the
//! targets of the cache.

use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use clippy_utilities::Cast;
use tokio::select;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::buffer::BufferInner;
use super::BlockCache;
use crate::metrics::ARC_METRICS;

/// The source of memory pressure.
pub trait MemoryMonitor: Debug + Send + Sync {
    /// The bytes of memory the system can spare. A negative value is the
    /// bytes the system asks back.
    fn available_memory(&self) -> i64;
}

/// A monitor that never reports pressure.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPressure;

impl MemoryMonitor for NoPressure {
    #[inline]
    fn available_memory(&self) -> i64 {
        i64::MAX
    }
}

/// A monitor reporting whatever it was last told.
#[derive(Debug)]
pub struct ManualMonitor {
    /// The available memory
    available: AtomicI64,
}

impl ManualMonitor {
    /// Creates a monitor reporting `available` bytes.
    #[must_use]
    pub fn new(available: i64) -> Self {
        Self {
            available: AtomicI64::new(available),
        }
    }

    /// Sets the available memory.
    pub fn set(&self, available: i64) {
        self.available.store(available, Ordering::Release);
    }
}

impl MemoryMonitor for ManualMonitor {
    #[inline]
    fn available_memory(&self) -> i64 {
        self.available.load(Ordering::Acquire)
    }
}

/// How hard the worker reclaims memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimStrategy {
    /// Shrink the target size of the cache
    Aggressive,
    /// Only evict down to the current targets
    Conservative,
}

/// The state the worker keeps between passes.
#[derive(Debug)]
pub(crate) struct ReclaimState {
    /// The strategy of the last pass under pressure
    last: Option<ReclaimStrategy>,
    /// Growth stays suppressed until then
    grow_time: Instant,
    /// How long growth is suppressed after pressure
    grow_retry: Duration,
}

impl ReclaimState {
    /// Creates the state.
    pub(crate) fn new(grow_retry: Duration) -> Self {
        Self {
            last: None,
            grow_time: Instant::now(),
            grow_retry,
        }
    }
}

impl BlockCache {
    /// Wakes up the reclaim worker.
    pub fn signal_reclaim(&self) {
        self.wakeup.notify_one();
    }

    /// The strategy of the last reclaim pass under memory pressure.
    #[must_use]
    pub fn last_reclaim_strategy(&self) -> Option<ReclaimStrategy> {
        self.reclaim.lock().last
    }

    /// Runs a pass of the reclaim worker.
    #[instrument(level = "debug", skip(self), fields(name = %self.name))]
    pub fn reclaim_now(&self) {
        let available = self.monitor.available_memory();
        let now = Instant::now();
        let mut to_free = None;
        {
            let mut reclaim = self.reclaim.lock();
            if available < 0 {
                let strategy = if self.is_growth_suppressed() {
                    match reclaim.last {
                        Some(ReclaimStrategy::Conservative) | None => ReclaimStrategy::Aggressive,
                        Some(ReclaimStrategy::Aggressive) => ReclaimStrategy::Conservative,
                    }
                } else {
                    self.set_no_grow(true);
                    ReclaimStrategy::Aggressive
                };
                reclaim.last = Some(strategy);
                reclaim.grow_time = now.checked_add(reclaim.grow_retry).unwrap_or(now);
                if strategy == ReclaimStrategy::Aggressive {
                    let wanted: usize = available.unsigned_abs().cast();
                    to_free = Some(
                        (self.target_total() >> self.params.shrink_shift).saturating_add(wanted),
                    );
                }
                debug!(available, ?strategy, "memory pressure");
            } else if available.unsigned_abs()
                < (self.target_total() >> self.params.no_grow_shift).cast::<u64>()
            {
                self.set_no_grow(true);
            } else if self.is_growth_suppressed() && now >= reclaim.grow_time {
                self.set_no_grow(false);
                info!("cache target may grow again");
            } else {
                // Neither pressure nor a change of the growth suppression.
            }
        }

        if let Some(to_free) = to_free {
            self.shrink(to_free);
        }
        self.adjust();
        self.do_user_evicts();
        ARC_METRICS.set_targets(&self.name, self.target_total(), self.target_mru());
    }

    /// Invokes the callbacks of evicted buffers.
    ///
    /// A callback already claimed by
    /// [`BlockCache::clear_eviction_callback`] is skipped.
    pub fn do_user_evicts(&self) {
        let buffers: Vec<Arc<BufferInner>> = std::mem::take(&mut *self.evicted.lock());
        for buffer in buffers {
            let callback = buffer.slot.lock().on_evict.take();
            if let Some(callback) = callback {
                callback();
            }
        }
    }
}

/// Runs the reclaim worker until the cache is dropped or shut down.
#[allow(clippy::pattern_type_mismatch)] // Raised by `tokio::select!`
pub(super) async fn run_reclaim_task(
    cache: Weak<BlockCache>,
    wakeup: Arc<Notify>,
    shutdown: CancellationToken,
    interval: Duration,
) {
    let mut interval = tokio::time::interval(interval);
    loop {
        select! {
            () = shutdown.cancelled() => {
                info!("Reclaim task exits.");
                return;
            }
            () = wakeup.notified() => {}
            _ = interval.tick() => {}
        }

        let Some(cache) = cache.upgrade() else {
            info!("Reclaim task exits.");
            return;
        };
        cache.reclaim_now();
    }
}
