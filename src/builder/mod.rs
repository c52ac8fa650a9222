//! Task builders
//!
//! A builder turns one application-level I/O request into chunk-sized tasks.
//! The input task is a template carrying the file range (`Task::write`,
//! `Task::read`, ...); the builder returns the tasks to publish, in order.

pub mod aggregating;
pub mod chunking;
pub mod default;

pub use aggregating::AggregatingBuilder;
pub use chunking::{ChunkGrid, ChunkSpan};
pub use default::DefaultBuilder;

use crate::config::{BuilderPolicy, DtioConfig};
use crate::map::MapError;
use crate::metadata::{MetadataError, MetadataManager};
use crate::task::{Task, TaskError, TaskIdGenerator};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum BuilderError {
    #[error("Invalid range: offset={offset}, size={size}")]
    InvalidRange { offset: u64, size: u64 },

    #[error("Payload of {len} bytes does not match task size {size}")]
    PayloadMismatch { len: usize, size: u64 },

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Map(#[from] MapError),

    #[error(transparent)]
    Task(#[from] TaskError),
}

pub type BuilderResult<T> = Result<T, BuilderError>;

/// Decomposition of I/O requests into tasks
pub trait TaskBuilder: Send {
    /// One write task per chunk touched by `task`'s range, carrying `data`
    fn build_write_task(&mut self, task: Task, data: &[u8]) -> BuilderResult<Vec<Task>>;

    /// One read task per chunk overlapping `task`'s range
    fn build_read_task(&mut self, task: Task) -> BuilderResult<Vec<Task>>;

    /// One delete task per known chunk of the file
    fn build_delete_task(&mut self, task: Task) -> BuilderResult<Vec<Task>>;

    /// One flush task per chunk held by a worker
    fn build_flush_task(&mut self, task: Task) -> BuilderResult<Vec<Task>>;

    /// Close any buffered writes of `filename`
    fn flush_file(&mut self, _filename: &str) -> BuilderResult<Vec<Task>> {
        Ok(Vec::new())
    }

    /// Close every buffered write
    fn flush(&mut self) -> BuilderResult<Vec<Task>> {
        Ok(Vec::new())
    }
}

/// What every builder needs from the process
#[derive(Clone)]
pub struct BuilderContext {
    pub metadata: Arc<MetadataManager>,
    pub ids: Arc<TaskIdGenerator>,
    pub grid: ChunkGrid,
}

impl BuilderContext {
    pub fn new(metadata: Arc<MetadataManager>, ids: Arc<TaskIdGenerator>) -> Self {
        let grid = ChunkGrid::new(metadata.chunk_size());
        Self { metadata, ids, grid }
    }
}

/// Build the builder selected by `io.builder`
pub fn from_policy(config: &DtioConfig, ctx: BuilderContext) -> Box<dyn TaskBuilder> {
    match config.io.builder {
        BuilderPolicy::Default => Box::new(DefaultBuilder::new(ctx)),
        BuilderPolicy::Aggregating => Box::new(AggregatingBuilder::new(
            DefaultBuilder::new(ctx),
            config.io.min_io_unit,
            config.io.max_io_unit,
        )),
    }
}
