//! Task transport between clients, the scheduler and workers
//!
//! Delivery is at-least-once and FIFO order is not part of the contract.
//! A timed receive that expires returns `Ok(None)`; only a broken transport
//! is an error.

pub mod local;

pub use local::InProcessQueue;

use crate::codec::CodecError;
use crate::config::{DtioConfig, QueueBackend};
use crate::constants::CLIENT_TASK_SUBJECT;
use crate::task::{Task, WorkerId};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue backend not implemented: {0}")]
    NotImplemented(&'static str),

    /// Connection to the transport is gone; fatal for the owning process
    #[error("Transport failure on {subject}: {reason}")]
    Transport { subject: String, reason: String },

    #[error("No queue for worker {0}")]
    UnknownWorker(WorkerId),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Capability set of a task transport
pub trait DistributedQueue: Send + Sync {
    /// Subject (queue name) this handle publishes to and subscribes from
    fn subject(&self) -> &str;

    /// Serialize and enqueue the task, blocking while the queue is full
    fn publish_task(&self, task: Task) -> QueueResult<()>;

    /// Block until a task arrives
    fn subscribe_task(&self) -> QueueResult<Task>;

    /// Wait at most `timeout`; `Ok(None)` when nothing arrived
    fn subscribe_task_with_timeout(&self, timeout: Duration) -> QueueResult<Option<Task>>;

    /// Bytes of serialized tasks waiting in the queue
    fn queue_size(&self) -> u64;

    /// Tasks waiting in the queue
    fn queue_count(&self) -> usize;

    /// Tasks the queue holds before publishers block
    fn queue_count_limit(&self) -> usize;

    /// Drop every pending task, returning how many were dropped
    fn clear(&self) -> QueueResult<usize>;
}

/// Client submission queue plus one queue per worker
#[derive(Clone)]
pub struct QueueSet {
    client: Arc<dyn DistributedQueue>,
    workers: Vec<Arc<dyn DistributedQueue>>,
}

impl QueueSet {
    pub fn new(client: Arc<dyn DistributedQueue>, workers: Vec<Arc<dyn DistributedQueue>>) -> Self {
        Self { client, workers }
    }

    /// In-process queues for `num_workers` workers
    pub fn in_process(num_workers: u32, capacity: usize) -> Self {
        let client: Arc<dyn DistributedQueue> =
            Arc::new(InProcessQueue::new(CLIENT_TASK_SUBJECT, capacity));
        let workers = (1..=num_workers)
            .map(|worker| {
                Arc::new(InProcessQueue::new(worker_subject(worker as WorkerId), capacity))
                    as Arc<dyn DistributedQueue>
            })
            .collect();
        Self { client, workers }
    }

    pub fn client(&self) -> &Arc<dyn DistributedQueue> {
        &self.client
    }

    /// Queue of worker `worker` (ids start at 1)
    pub fn worker_queue(&self, worker: WorkerId) -> QueueResult<&Arc<dyn DistributedQueue>> {
        usize::try_from(worker)
            .ok()
            .and_then(|w| w.checked_sub(1))
            .and_then(|index| self.workers.get(index))
            .ok_or(QueueError::UnknownWorker(worker))
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }
}

/// Subject of a worker's queue
pub fn worker_subject(worker: WorkerId) -> String {
    format!("{}_{}", CLIENT_TASK_SUBJECT, worker)
}

/// Build the queues selected by `backend.queue`
pub fn connect(config: &DtioConfig) -> QueueResult<QueueSet> {
    match config.backend.queue {
        QueueBackend::InProcess => Ok(QueueSet::in_process(
            config.system.num_workers,
            config.backend.queue_capacity,
        )),
        QueueBackend::Nats => Err(QueueError::NotImplemented("NATS")),
    }
}
