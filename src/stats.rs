//! Timing statistics switch
//!
//! Per-batch solve/dispatch timings are only measured when enabled, either
//! through [`set_stats_enabled`] or the `DTIO_STATS` environment variable.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::constants::is_env_truthy;

/// Environment variable that enables statistics at startup
pub const STATS_ENV: &str = "DTIO_STATS";

static STATS_ENABLED: AtomicBool = AtomicBool::new(false);

/// Enable or disable statistics collection globally
pub fn set_stats_enabled(enabled: bool) {
    STATS_ENABLED.store(enabled, Ordering::SeqCst);
}

/// Enable statistics when `DTIO_STATS` is set to a truthy value
pub fn init_from_env() {
    if is_env_truthy(STATS_ENV) {
        set_stats_enabled(true);
    }
}

#[inline]
pub fn is_stats_enabled() -> bool {
    STATS_ENABLED.load(Ordering::Relaxed)
}

/// Measure elapsed time only when stats are enabled
/// Returns Option<Duration>
#[macro_export]
macro_rules! measure_if_stats {
    ($start:expr) => {
        if $crate::stats::is_stats_enabled() {
            Some($start.elapsed())
        } else {
            None
        }
    };
}

/// Counters kept by a running scheduler
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Tasks received from the client queue
    pub received: u64,
    /// Tasks dropped as duplicate deliveries within a batch
    pub duplicates: u64,
    pub batches: u64,
    /// Tasks published to a worker queue
    pub dispatched: u64,
    /// Tasks the solver refused
    pub rejected: u64,
    /// Messages that did not decode as a task
    pub malformed: u64,
}
