//! In-process worker
//!
//! Executes tasks from one worker queue against the backing map. Chunk
//! contents live in the STAGING table under `filename#chunk_base`; read
//! results are handed back through the DATASPACE table under
//! [`read_result_key`]. Every executed task is reported to the metadata
//! manager so that waiting clients can proceed.
//!
//! The worker also publishes its [`WorkerProfile`] for the DP solver: the
//! remaining capacity whenever staged bytes change, and the full profile
//! (including queue load) on a timer while serving.

use crate::constants::{KEY_SEPARATOR, WORKER_CAPACITY_MAX};
use crate::map::{GroupKey, MapError, Table};
use crate::metadata::{chunk_key, MetadataError, MetadataManager};
use crate::queue::{DistributedQueue, QueueError};
use crate::solver::WorkerProfile;
use crate::task::{Task, TaskId, TaskType, WorkerId};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::instrument;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const PROFILE_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Map(#[from] MapError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("No staged payload for write task {0}")]
    MissingPayload(TaskId),
}

pub type WorkerResult<T> = Result<T, WorkerError>;

/// Key under which the result of read task `task_id` is published
pub fn read_result_key(task_id: TaskId) -> String {
    format!("READ{}{}", KEY_SEPARATOR, task_id)
}

pub struct LocalWorker {
    id: WorkerId,
    queue: Arc<dyn DistributedQueue>,
    metadata: Arc<MetadataManager>,
    processed: AtomicU64,
    /// Total staging capacity in bytes
    capacity: u64,
    /// Bytes currently held in STAGING by this worker
    staged: AtomicU64,
}

impl LocalWorker {
    pub fn new(id: WorkerId, queue: Arc<dyn DistributedQueue>, metadata: Arc<MetadataManager>) -> Self {
        Self {
            id,
            queue,
            metadata,
            processed: AtomicU64::new(0),
            capacity: WORKER_CAPACITY_MAX,
            staged: AtomicU64::new(0),
        }
    }

    pub fn with_capacity(mut self, capacity_bytes: u64) -> Self {
        self.capacity = capacity_bytes;
        self
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Tasks executed so far
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Staging bytes still free
    pub fn remaining_capacity(&self) -> u64 {
        self.capacity.saturating_sub(self.staged.load(Ordering::Relaxed))
    }

    /// Stored profile with this worker's capacity and queue load filled in
    ///
    /// Speed, energy and score are kept as stored.
    pub fn profile(&self) -> WorkerResult<WorkerProfile> {
        let mut profile = WorkerProfile::load(self.map().as_ref(), self.id, self.capacity)?;
        profile.capacity_bytes = self.remaining_capacity();
        profile.task_count = u32::try_from(self.queue.queue_count()).unwrap_or(u32::MAX);
        Ok(profile)
    }

    pub fn publish_profile(&self) -> WorkerResult<()> {
        self.profile()?.store(self.map().as_ref())?;
        Ok(())
    }

    fn publish_capacity(&self) -> WorkerResult<()> {
        WorkerProfile::store_capacity(self.map().as_ref(), self.id, self.remaining_capacity())?;
        Ok(())
    }

    fn release(&self, bytes: u64) {
        // クロージャは常に Some を返すので失敗しない
        let _ = self
            .staged
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |staged| {
                Some(staged.saturating_sub(bytes))
            });
    }

    fn publish_or_warn(&self) {
        if let Err(e) = self.publish_profile() {
            tracing::warn!("Worker {} failed to publish its profile: {}", self.id, e);
        }
    }

    /// Serve the queue until `shutdown` is set
    ///
    /// A task that fails is logged and skipped; only a transport failure
    /// ends the loop early.
    pub fn run(&self, shutdown: &AtomicBool) -> WorkerResult<()> {
        tracing::info!("Worker {} serving {}", self.id, self.queue.subject());
        self.publish_or_warn();
        let mut last_publish = Instant::now();
        while !shutdown.load(Ordering::Acquire) {
            if last_publish.elapsed() >= PROFILE_INTERVAL {
                self.publish_or_warn();
                last_publish = Instant::now();
            }
            let task = match self.queue.subscribe_task_with_timeout(POLL_INTERVAL) {
                Ok(Some(task)) => task,
                Ok(None) => continue,
                Err(QueueError::Codec(e)) => {
                    tracing::warn!("Worker {} skipping malformed message: {}", self.id, e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let task_id = task.task_id;
            if let Err(e) = self.process(task) {
                tracing::error!("Worker {} failed task {}: {}", self.id, task_id, e);
            }
        }
        tracing::info!("Worker {} stopped after {} tasks", self.id, self.processed());
        Ok(())
    }

    #[instrument(level = "trace", name = "worker_process", skip(self, task), fields(worker = self.id, task_id = task.task_id, t_type = ?task.t_type()))]
    pub fn process(&self, task: Task) -> WorkerResult<()> {
        match task.t_type() {
            TaskType::Write => self.write(&task)?,
            TaskType::Read => self.read(&task)?,
            TaskType::Delete => self.delete(&task)?,
            TaskType::Flush | TaskType::Staging => {
                tracing::debug!("Worker {}: {:?} of {} is a no-op", self.id, task.t_type(), task.filename());
            }
            TaskType::Dummy => return Ok(()),
        }

        self.metadata.record_completion(&task)?;
        self.processed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn map(&self) -> &Arc<dyn crate::map::DistributedMap> {
        self.metadata.map()
    }

    fn chunk_base(&self, task: &Task) -> u64 {
        task.offset() - task.offset() % self.metadata.chunk_size()
    }

    fn chunk_key(&self, task: &Task) -> String {
        chunk_key(task.filename(), self.chunk_base(task))
    }

    fn write(&self, task: &Task) -> WorkerResult<()> {
        let dataspace = task
            .dataspace_id
            .ok_or(WorkerError::MissingPayload(task.task_id))?
            .to_string();
        let payload = self
            .map()
            .get(Table::DataspaceDb, &dataspace, GroupKey::Hashed)?
            .ok_or(WorkerError::MissingPayload(task.task_id))?;

        let key = self.chunk_key(task);
        let mut chunk = self
            .map()
            .get(Table::StagingDb, &key, GroupKey::Hashed)?
            .unwrap_or_default();
        let start = (task.offset() - self.chunk_base(task)) as usize;
        let end = start + payload.len();
        let grown = end.saturating_sub(chunk.len()) as u64;
        if grown > 0 {
            chunk.resize(end, 0);
        }
        chunk[start..end].copy_from_slice(&payload);

        self.map().put(Table::StagingDb, &key, &chunk, GroupKey::Hashed)?;
        self.map()
            .remove(Table::DataspaceDb, &dataspace, GroupKey::Hashed)?;

        if grown > 0 {
            self.staged.fetch_add(grown, Ordering::Relaxed);
            self.publish_capacity()?;
        }
        Ok(())
    }

    fn delete(&self, task: &Task) -> WorkerResult<()> {
        let key = self.chunk_key(task);
        let Some(chunk) = self.map().get(Table::StagingDb, &key, GroupKey::Hashed)? else {
            return Ok(());
        };
        self.map().remove(Table::StagingDb, &key, GroupKey::Hashed)?;
        self.release(chunk.len() as u64);
        self.publish_capacity()
    }

    fn read(&self, task: &Task) -> WorkerResult<()> {
        let chunk = self
            .map()
            .get(Table::StagingDb, &self.chunk_key(task), GroupKey::Hashed)?
            .unwrap_or_default();

        // 未書き込みの範囲はゼロ埋め
        let start = (task.offset() - self.chunk_base(task)) as usize;
        let mut data = vec![0u8; task.size() as usize];
        if start < chunk.len() {
            let available = (chunk.len() - start).min(data.len());
            data[..available].copy_from_slice(&chunk[start..start + available]);
        }

        self.map().put(
            Table::DataspaceDb,
            &read_result_key(task.task_id),
            &data,
            GroupKey::Hashed,
        )?;
        Ok(())
    }
}
