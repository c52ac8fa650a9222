//! DTIO configuration

use crate::task::MAX_PROCESS_ID;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default configuration constants
///
/// Collects every default used by [`DtioConfig`] so deployments only have to
/// spell out what they change.
pub mod defaults {
    use crate::constants;

    // System defaults
    pub const NUM_WORKERS: u32 = 4;
    pub const NUM_SCHEDULERS: u32 = 1;
    /// 1 = schedule on the receiving thread
    pub const TS_NUM_WORKER_THREADS: usize = 1;
    /// Clients wait for write completion unless this is set
    pub const ASYNC_WRITES: bool = false;

    pub const fn default_log_level() -> &'static str {
        "info"
    }

    // I/O defaults
    pub const CHUNK_SIZE: u64 = constants::CHUNK_SIZE;
    pub const MIN_IO_UNIT: u64 = constants::MIN_IO_UNIT;
    pub const MAX_IO_UNIT: u64 = constants::MAX_IO_UNIT;

    // Scheduler defaults
    pub const MAX_TASKS_IN_BATCH: usize = constants::MAX_NUM_TASKS_IN_QUEUE;
    pub const SCHEDULE_TIMER_MS: u64 = constants::MAX_SCHEDULE_TIMER_MS;
    pub const TASK_TIMER_MS: u64 = constants::MAX_TASK_TIMER_MS;

    // DP solver defaults
    pub const POLICY_WEIGHTS: [f32; constants::WORKER_ATTRIBUTES_COUNT] = constants::POLICY_WEIGHT;
    pub const CAPACITY_BUCKETS: usize = constants::CAPACITY_BUCKETS;
    pub const WORKER_CAPACITY_MAX: u64 = constants::WORKER_CAPACITY_MAX;

    // Backend defaults
    /// Virtual servers the in-process map shards across
    pub const MAP_SERVERS: u32 = 4;
    /// Tasks buffered per in-process queue before publishers block
    pub const QUEUE_CAPACITY: usize = 4096;
}

/// Worker assignment policy (`ASSIGNMENT_POLICY`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignmentPolicy {
    RoundRobin,
    Random,
    Dp,
    Default,
}

impl std::str::FromStr for AssignmentPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ROUND_ROBIN" => Ok(Self::RoundRobin),
            "RANDOM" => Ok(Self::Random),
            "DP" => Ok(Self::Dp),
            "DEFAULT" => Ok(Self::Default),
            other => Err(ConfigError::ValidationError(format!(
                "Unknown assignment policy: {}",
                other
            ))),
        }
    }
}

/// Task builder variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuilderPolicy {
    Default,
    Aggregating,
}

/// Backing map implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MapBackend {
    InProcess,
    RocksDb,
    Memcached,
    IoWarp,
}

/// Task transport implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueBackend {
    InProcess,
    Nats,
}

/// DTIO configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DtioConfig {
    #[serde(default)]
    pub system: SystemConfig,

    #[serde(default)]
    pub io: IoConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub dp: DpConfig,

    #[serde(default)]
    pub backend: BackendConfig,
}

/// Process layout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Number of workers; worker ids are `1..=num_workers`
    #[serde(default = "default_num_workers")]
    pub num_workers: u32,

    #[serde(default = "default_num_schedulers")]
    pub num_schedulers: u32,

    /// Threads the scheduler solves disjoint batches on
    #[serde(default = "default_ts_num_worker_threads")]
    pub ts_num_worker_threads: usize,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Return from writes before the workers report completion
    #[serde(default = "default_async_writes")]
    pub async_writes: bool,

    /// Rank of this process in task ids (0..=1023); drawn from a shared
    /// counter in the backing map when absent
    #[serde(default)]
    pub process_id: Option<u64>,
}

fn default_num_workers() -> u32 {
    defaults::NUM_WORKERS
}

fn default_num_schedulers() -> u32 {
    defaults::NUM_SCHEDULERS
}

fn default_ts_num_worker_threads() -> usize {
    defaults::TS_NUM_WORKER_THREADS
}

fn default_log_level() -> String {
    defaults::default_log_level().to_string()
}

fn default_async_writes() -> bool {
    defaults::ASYNC_WRITES
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            num_schedulers: default_num_schedulers(),
            ts_num_worker_threads: default_ts_num_worker_threads(),
            log_level: default_log_level(),
            async_writes: default_async_writes(),
            process_id: None,
        }
    }
}

/// Chunking and aggregation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoConfig {
    /// Chunk size in bytes (default: 2MiB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Writes below this size are aggregated by the aggregating builder
    #[serde(default = "default_min_io_unit")]
    pub min_io_unit: u64,

    /// Largest value stored in the map; bounds the aggregation buffer
    #[serde(default = "default_max_io_unit")]
    pub max_io_unit: u64,

    #[serde(default = "default_builder")]
    pub builder: BuilderPolicy,
}

fn default_chunk_size() -> u64 {
    defaults::CHUNK_SIZE
}

fn default_min_io_unit() -> u64 {
    defaults::MIN_IO_UNIT
}

fn default_max_io_unit() -> u64 {
    defaults::MAX_IO_UNIT
}

fn default_builder() -> BuilderPolicy {
    BuilderPolicy::Default
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            min_io_unit: default_min_io_unit(),
            max_io_unit: default_max_io_unit(),
            builder: default_builder(),
        }
    }
}

/// Scheduling loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_assignment_policy")]
    pub assignment_policy: AssignmentPolicy,

    /// Batch size that triggers a schedule
    #[serde(default = "default_max_tasks_in_batch")]
    pub max_tasks_in_batch: usize,

    /// A partial batch is scheduled once it is this old
    #[serde(default = "default_schedule_timer_ms")]
    pub schedule_timer_ms: u64,

    /// Bound of one timed receive
    #[serde(default = "default_task_timer_ms")]
    pub task_timer_ms: u64,

    /// Seed for the random solver; entropy when absent
    #[serde(default)]
    pub random_seed: Option<u64>,
}

fn default_assignment_policy() -> AssignmentPolicy {
    AssignmentPolicy::RoundRobin
}

fn default_max_tasks_in_batch() -> usize {
    defaults::MAX_TASKS_IN_BATCH
}

fn default_schedule_timer_ms() -> u64 {
    defaults::SCHEDULE_TIMER_MS
}

fn default_task_timer_ms() -> u64 {
    defaults::TASK_TIMER_MS
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            assignment_policy: default_assignment_policy(),
            max_tasks_in_batch: default_max_tasks_in_batch(),
            schedule_timer_ms: default_schedule_timer_ms(),
            task_timer_ms: default_task_timer_ms(),
            random_seed: None,
        }
    }
}

/// DP solver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DpConfig {
    /// Weights of speed, energy, capacity, load and score
    #[serde(default = "default_policy_weights")]
    pub policy_weights: [f32; 5],

    /// Number of buckets a worker's capacity is discretized into
    #[serde(default = "default_capacity_buckets")]
    pub capacity_buckets: usize,

    /// Capacity assumed for workers that never reported one
    #[serde(default = "default_worker_capacity_max")]
    pub worker_capacity_max: u64,
}

fn default_policy_weights() -> [f32; 5] {
    defaults::POLICY_WEIGHTS
}

fn default_capacity_buckets() -> usize {
    defaults::CAPACITY_BUCKETS
}

fn default_worker_capacity_max() -> u64 {
    defaults::WORKER_CAPACITY_MAX
}

impl Default for DpConfig {
    fn default() -> Self {
        Self {
            policy_weights: default_policy_weights(),
            capacity_buckets: default_capacity_buckets(),
            worker_capacity_max: default_worker_capacity_max(),
        }
    }
}

/// Map and queue backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_map_backend")]
    pub map: MapBackend,

    #[serde(default = "default_map_servers")]
    pub map_servers: u32,

    #[serde(default = "default_queue_backend")]
    pub queue: QueueBackend,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_map_backend() -> MapBackend {
    MapBackend::InProcess
}

fn default_map_servers() -> u32 {
    defaults::MAP_SERVERS
}

fn default_queue_backend() -> QueueBackend {
    QueueBackend::InProcess
}

fn default_queue_capacity() -> usize {
    defaults::QUEUE_CAPACITY
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            map: default_map_backend(),
            map_servers: default_map_servers(),
            queue: default_queue_backend(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl DtioConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&contents)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: DtioConfig = toml::from_str(contents)
            .map_err(|e| ConfigError::ParseError(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Load from the file named by `DTIO_CONFIG`, or fall back to defaults
    ///
    /// `DTIO_ASYNC_WRITES` set to a truthy value overrides `system.async_writes`.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(crate::constants::CONFIG_ENV) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };

        if crate::constants::is_env_truthy("DTIO_ASYNC_WRITES") {
            config.system.async_writes = true;
        }

        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self).map_err(|e| {
            ConfigError::SerializeError(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path.as_ref(), contents)
            .map_err(|e| ConfigError::WriteError(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.system.num_workers == 0 {
            return Err(ConfigError::ValidationError(
                "num_workers must be at least 1".to_string(),
            ));
        }

        if let Some(process_id) = self.system.process_id {
            if process_id > MAX_PROCESS_ID {
                return Err(ConfigError::ValidationError(format!(
                    "process_id must be between 0 and {}: {}",
                    MAX_PROCESS_ID, process_id
                )));
            }
        }

        if self.system.ts_num_worker_threads == 0 {
            return Err(ConfigError::ValidationError(
                "ts_num_worker_threads must be at least 1".to_string(),
            ));
        }

        // Chunks must fit in a single map value
        if self.io.chunk_size == 0 || self.io.chunk_size > self.io.max_io_unit {
            return Err(ConfigError::ValidationError(format!(
                "Chunk size must be between 1 and max_io_unit ({})",
                self.io.max_io_unit
            )));
        }

        if self.io.min_io_unit == 0 || self.io.min_io_unit > self.io.max_io_unit {
            return Err(ConfigError::ValidationError(
                "min_io_unit must be between 1 and max_io_unit".to_string(),
            ));
        }

        if self.scheduler.max_tasks_in_batch == 0 {
            return Err(ConfigError::ValidationError(
                "max_tasks_in_batch must be at least 1".to_string(),
            ));
        }

        if self
            .dp
            .policy_weights
            .iter()
            .any(|w| !w.is_finite() || *w < 0.0)
        {
            return Err(ConfigError::ValidationError(format!(
                "Policy weights must be finite and non-negative: {:?}",
                self.dp.policy_weights
            )));
        }

        if self.dp.capacity_buckets == 0 {
            return Err(ConfigError::ValidationError(
                "capacity_buckets must be at least 1".to_string(),
            ));
        }

        if self.backend.map_servers == 0 || self.backend.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "map_servers and queue_capacity must be at least 1".to_string(),
            ));
        }

        match self.system.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.system.log_level
                )));
            }
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config: {0}")]
    WriteError(String),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}
