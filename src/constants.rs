//! Global constants for DTIO
//!
//! Values shared by the builders, the solvers and the metadata manager.
//! Anything tunable per deployment lives in [`crate::config`] and only
//! defaults to the values here.

/// Chunk size: 2MiB
///
/// Granularity of scheduling and placement. Every task that enters a
/// queue covers at most one chunk.
pub const CHUNK_SIZE: u64 = 2 * 1024 * 1024;

/// Smallest write that is sent without aggregation (8KiB)
pub const MIN_IO_UNIT: u64 = 8 * 1024;

/// Largest single value stored in the backing map (32MiB)
///
/// Also bounds the aggregation buffer of the aggregating builder.
pub const MAX_IO_UNIT: u64 = 32 * 1024 * 1024;

/// Maximum filename length accepted by the metadata manager
pub const DTIO_FILENAME_MAX: usize = 75;

/// Separator between components of composite map keys (`filename#offset`)
pub const KEY_SEPARATOR: &str = "#";

/// Counter key used to allocate dataspace ids
pub const DATASPACE_ID: &str = "DATASPACE_ID";

/// Counter key handing out task id process fields to processes without a rank
pub const PROCESS_ID: &str = "PROCESS_ID";

/// Counter key holding the global round-robin cursor
pub const ROUND_ROBIN_INDEX: &str = "ROUND_ROBIN_INDEX";

/// Subject name of the client submission queue
pub const CLIENT_TASK_SUBJECT: &str = "TASK";

/// Default worker speed attribute (1..=5)
pub const WORKER_SPEED: u32 = 2;

/// Default worker energy attribute (1..=5, lower is better)
pub const WORKER_ENERGY: u32 = 2;

/// Scale of the speed and energy attributes
pub const WORKER_ATTRIBUTE_MAX: u32 = 5;

/// Default worker capacity: 128GiB
pub const WORKER_CAPACITY_MAX: u64 = 137_438_953_472;

/// Number of attributes combined into a worker fit score
pub const WORKER_ATTRIBUTES_COUNT: usize = 5;

/// Weights of speed, energy, capacity, load and score, in that order
pub const POLICY_WEIGHT: [f32; WORKER_ATTRIBUTES_COUNT] = [0.3, 0.2, 0.3, 0.1, 0.1];

/// Task count at which a worker is considered fully loaded
pub const MAX_WORKER_TASK_COUNT: u32 = 50;

/// Upper bound of worker scores
pub const MAX_SCORE: u32 = 100;

/// Capacity discretization used by the DP solver
pub const CAPACITY_BUCKETS: usize = 256;

/// Batch size that triggers a schedule
pub const MAX_NUM_TASKS_IN_QUEUE: usize = 1;

/// Time after which a partial batch is scheduled anyway (ms)
pub const MAX_SCHEDULE_TIMER_MS: u64 = 1000;

/// Bound of a single timed receive (ms)
pub const MAX_TASK_TIMER_MS: u64 = 1000;

/// How long a client waits for its tasks to complete (ms)
pub const MAX_COMPLETION_WAIT_MS: u64 = 30_000;

/// Environment variable pointing at the TOML configuration
pub const CONFIG_ENV: &str = "DTIO_CONFIG";

pub(crate) fn is_env_truthy(key: &str) -> bool {
    use std::env;

    match env::var(key) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
