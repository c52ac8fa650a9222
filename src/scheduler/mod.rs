//! Task scheduler
//!
//! Drains the client queue into batches, asks the solver for a placement,
//! records where writes went, and republishes each task on its worker's
//! queue. Assignment failures only drop the affected tasks; a broken
//! transport stops the scheduler.

pub mod batch;

pub use batch::Batch;

use crate::config::DtioConfig;
use crate::metadata::MetadataManager;
use crate::queue::{DistributedQueue, QueueError, QueueSet};
use crate::solver::{Solver, SolverInput};
use crate::stats::SchedulerStats;
use crate::task::{Task, TaskType, WorkerId};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::instrument;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Scheduling thread panicked")]
    WorkerPanicked,

    #[error("Failed to spawn scheduling thread: {0}")]
    Spawn(#[from] std::io::Error),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// What one `schedule_tasks` call did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub dispatched: usize,
    pub rejected: usize,
    /// Write tasks whose placement was newly recorded
    pub recorded: usize,
}

pub struct TaskScheduler {
    queues: QueueSet,
    solver: Arc<dyn Solver>,
    metadata: Arc<MetadataManager>,
    max_tasks_in_batch: usize,
    schedule_timer: Duration,
    task_timer: Duration,
    threads: usize,
    stats: Mutex<SchedulerStats>,
}

impl TaskScheduler {
    pub fn new(
        config: &DtioConfig,
        queues: QueueSet,
        solver: Arc<dyn Solver>,
        metadata: Arc<MetadataManager>,
    ) -> Self {
        Self {
            queues,
            solver,
            metadata,
            max_tasks_in_batch: config.scheduler.max_tasks_in_batch.max(1),
            schedule_timer: Duration::from_millis(config.scheduler.schedule_timer_ms),
            task_timer: Duration::from_millis(config.scheduler.task_timer_ms.max(1)),
            threads: config.system.ts_num_worker_threads.max(1),
            stats: Mutex::new(SchedulerStats::default()),
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.lock().clone()
    }

    /// Run until `shutdown` is set or the transport fails
    ///
    /// A partial batch still pending at shutdown is scheduled before returning.
    pub fn run(&self, shutdown: &AtomicBool) -> SchedulerResult<()> {
        tracing::info!(
            "Scheduler started (solver={}, batch={}, timer={:?}, threads={})",
            self.solver.name(),
            self.max_tasks_in_batch,
            self.schedule_timer,
            self.threads
        );

        let result = if self.threads <= 1 {
            let stopped = || shutdown.load(Ordering::Acquire);
            self.collect(&stopped, |tasks| self.schedule_tasks(tasks).map(|_| ()))
        } else {
            self.run_threaded(shutdown)
        };

        match &result {
            Ok(()) => tracing::info!("Scheduler stopped: {:?}", self.stats()),
            Err(e) => tracing::error!("Scheduler failed: {}", e),
        }
        result
    }

    /// Schedule everything currently waiting in the client queue
    ///
    /// Returns the number of tasks received.
    pub fn schedule_pending(&self) -> SchedulerResult<usize> {
        let client = self.queues.client();
        let mut batch = Batch::new(self.max_tasks_in_batch, Duration::MAX);
        let mut received = 0;
        while client.queue_count() > 0 {
            let Some(task) = self.receive(client.as_ref(), Duration::ZERO)? else {
                continue;
            };
            received += 1;
            self.accept(&mut batch, task);
            if batch.is_ready() {
                self.schedule_tasks(batch.take())?;
            }
        }
        if !batch.is_empty() {
            self.schedule_tasks(batch.take())?;
        }
        Ok(received)
    }

    /// Timed receive that skips undecodable messages
    ///
    /// Only a transport failure is returned as an error.
    fn receive(&self, queue: &dyn DistributedQueue, wait: Duration) -> SchedulerResult<Option<Task>> {
        match queue.subscribe_task_with_timeout(wait) {
            Ok(task) => Ok(task),
            Err(QueueError::Codec(e)) => {
                self.stats.lock().malformed += 1;
                tracing::warn!("Skipping malformed message on {}: {}", queue.subject(), e);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn accept(&self, batch: &mut Batch, task: Task) {
        let mut stats = self.stats.lock();
        stats.received += 1;
        let task_id = task.task_id;
        if !batch.push(task) {
            stats.duplicates += 1;
            tracing::debug!("Dropping duplicate delivery of task {}", task_id);
        }
    }

    /// Receive loop shared by the inline and threaded modes
    fn collect<F>(&self, stopped: &dyn Fn() -> bool, mut dispatch: F) -> SchedulerResult<()>
    where
        F: FnMut(Vec<Task>) -> SchedulerResult<()>,
    {
        let client = self.queues.client();
        let mut batch = Batch::new(self.max_tasks_in_batch, self.schedule_timer);

        while !stopped() {
            let wait = batch.time_left(self.task_timer);
            if let Some(task) = self.receive(client.as_ref(), wait)? {
                self.accept(&mut batch, task);
            }
            if batch.is_ready() {
                dispatch(batch.take())?;
            }
        }

        if !batch.is_empty() {
            dispatch(batch.take())?;
        }
        Ok(())
    }

    /// Disjoint batches solved and dispatched by a pool of scoped threads
    fn run_threaded(&self, shutdown: &AtomicBool) -> SchedulerResult<()> {
        let failed = AtomicBool::new(false);
        let failure: Mutex<Option<SchedulerError>> = Mutex::new(None);

        std::thread::scope(|s| {
            let (tx, rx) = crossbeam_channel::bounded::<Vec<Task>>(self.threads * 2);

            let handles = (0..self.threads)
                .map(|i| {
                    let rx = rx.clone();
                    let failed = &failed;
                    let failure = &failure;
                    std::thread::Builder::new()
                        .name(format!("ts-solve-{}", i))
                        .spawn_scoped(s, move || {
                            for tasks in rx {
                                if let Err(e) = self.schedule_tasks(tasks) {
                                    tracing::error!("Scheduling thread {} failed: {}", i, e);
                                    failure.lock().get_or_insert(e);
                                    failed.store(true, Ordering::Release);
                                    break;
                                }
                            }
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            drop(rx);

            // shutdown もしくはスレッドの失敗で止める
            let stopped = || shutdown.load(Ordering::Acquire) || failed.load(Ordering::Acquire);
            let collected = self.collect(&stopped, |tasks| {
                tx.send(tasks).map_err(|_| SchedulerError::WorkerPanicked)
            });
            drop(tx);

            let mut panicked = false;
            for handle in handles {
                panicked |= handle.join().is_err();
            }

            if let Some(e) = failure.lock().take() {
                return Err(e);
            }
            collected?;
            if panicked {
                return Err(SchedulerError::WorkerPanicked);
            }
            Ok(())
        })
    }

    /// Solve one batch, record write placement, publish per worker
    #[instrument(level = "trace", name = "schedule_tasks", skip(self, tasks), fields(count = tasks.len()))]
    pub fn schedule_tasks(&self, tasks: Vec<Task>) -> SchedulerResult<DispatchSummary> {
        let start = Instant::now();
        let output = self.solver.solve(SolverInput::new(tasks));
        let mut summary = DispatchSummary {
            rejected: output.errors.len(),
            ..DispatchSummary::default()
        };

        for (worker, mut tasks) in output.worker_task_map {
            summary.recorded += self.record_placement(&mut tasks);
            summary.dispatched += self.publish(worker, tasks)?;
        }

        {
            let mut stats = self.stats.lock();
            stats.batches += 1;
            stats.dispatched += summary.dispatched as u64;
            stats.rejected += summary.rejected as u64;
        }

        if let Some(elapsed) = crate::measure_if_stats!(start) {
            tracing::info!(
                "schedule_tasks: {} dispatched, {} rejected in {:?}",
                summary.dispatched,
                summary.rejected,
                elapsed
            );
        }
        Ok(summary)
    }

    /// Record the chosen worker of every write task, one file at a time
    fn record_placement(&self, tasks: &mut [Task]) -> usize {
        let files: BTreeSet<String> = tasks
            .iter()
            .filter(|t| t.t_type() == TaskType::Write)
            .map(|t| t.filename().to_string())
            .collect();

        let mut recorded = 0;
        for filename in files {
            match self.metadata.update_write_task_info(tasks, &filename) {
                Ok(n) => recorded += n,
                Err(e) => tracing::error!("Failed to record placement for {}: {}", filename, e),
            }
        }
        recorded
    }

    fn publish(&self, worker: WorkerId, tasks: Vec<Task>) -> SchedulerResult<usize> {
        let queue = match self.queues.worker_queue(worker) {
            Ok(queue) => queue,
            Err(e) => {
                tracing::error!("Dropping {} tasks: {}", tasks.len(), e);
                return Ok(0);
            }
        };

        let mut published = 0;
        for task in tasks {
            let task_id = task.task_id;
            match queue.publish_task(task) {
                Ok(()) => published += 1,
                Err(e @ QueueError::Transport { .. }) => return Err(e.into()),
                Err(e) => tracing::error!("Failed to publish task {}: {}", task_id, e),
            }
        }
        tracing::trace!("Published {} tasks to worker {}", published, worker);
        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{DistributedMap, InMemoryMap};
    use crate::metadata::OpenMode;
    use crate::queue::{DistributedQueue, InProcessQueue};
    use crate::solver::RoundRobinSolver;

    struct Fixture {
        scheduler: TaskScheduler,
        client: Arc<InProcessQueue>,
        workers: Vec<Arc<InProcessQueue>>,
        metadata: Arc<MetadataManager>,
    }

    fn fixture(num_workers: u32, batch: usize, threads: usize) -> Fixture {
        let mut config = DtioConfig::default();
        config.system.num_workers = num_workers;
        config.system.ts_num_worker_threads = threads;
        config.scheduler.max_tasks_in_batch = batch;
        config.scheduler.schedule_timer_ms = 20;
        config.scheduler.task_timer_ms = 5;

        let map: Arc<dyn DistributedMap> = Arc::new(InMemoryMap::new(2, 1 << 20));
        let metadata = Arc::new(MetadataManager::new(Arc::clone(&map), 1024));
        let client = Arc::new(InProcessQueue::new("TASK", 1024));
        let workers: Vec<Arc<InProcessQueue>> = (1..=num_workers)
            .map(|w| Arc::new(InProcessQueue::new(format!("TASK_{}", w), 1024)))
            .collect();
        let queues = QueueSet::new(
            client.clone(),
            workers
                .iter()
                .map(|q| q.clone() as Arc<dyn DistributedQueue>)
                .collect(),
        );
        let solver = Arc::new(RoundRobinSolver::new(map, num_workers).unwrap());

        Fixture {
            scheduler: TaskScheduler::new(&config, queues, solver, Arc::clone(&metadata)),
            client,
            workers,
            metadata,
        }
    }

    #[test]
    fn test_schedule_tasks_records_and_publishes() {
        let fx = fixture(2, 8, 1);
        fx.metadata.create("f", OpenMode::Write).unwrap();

        let tasks = vec![
            Task::write("f", 0, 1024).with_id(1),
            Task::write("f", 1024, 512).with_id(2),
            Task::delete("f", 0, 1024).with_id(3),
        ];
        let summary = fx.scheduler.schedule_tasks(tasks).unwrap();
        assert_eq!(
            summary,
            DispatchSummary {
                dispatched: 2,
                rejected: 1,
                recorded: 2
            }
        );

        assert_eq!(fx.workers[0].queue_count(), 1);
        assert_eq!(fx.workers[1].queue_count(), 1);
        let chunks = fx.metadata.chunks("f").unwrap();
        assert_eq!(chunks.iter().map(|c| c.worker).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(fx.metadata.get_filesize("f").unwrap(), 1536);

        // ワーカーが受け取るタスクには割り当て先が入っている
        let received = fx.workers[1].subscribe_task().unwrap();
        assert_eq!(received.task_id, 2);
        assert_eq!(received.destination.worker, 2);
        assert!(received.meta_updated);
    }

    #[test]
    fn test_schedule_pending_drops_duplicates() {
        let fx = fixture(2, 4, 1);
        let task = Task::read("f", 0, 10).with_id(11);
        fx.client.publish_task(task.clone()).unwrap();
        fx.client.publish_task(task).unwrap();
        fx.client.publish_task(Task::read("f", 10, 10).with_id(12)).unwrap();

        assert_eq!(fx.scheduler.schedule_pending().unwrap(), 3);
        let stats = fx.scheduler.stats();
        assert_eq!(stats.received, 3);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.dispatched, 2);
        assert_eq!(stats.batches, 1);
    }

    #[test]
    fn test_run_flushes_on_timer_and_shutdown() {
        for threads in [1, 3] {
            let fx = fixture(3, 1000, threads);
            let shutdown = AtomicBool::new(false);

            std::thread::scope(|s| {
                let runner = s.spawn(|| fx.scheduler.run(&shutdown));
                for i in 0..9u64 {
                    fx.client
                        .publish_task(Task::read("f", i * 10, 10).with_id(i + 1))
                        .unwrap();
                }

                let deadline = Instant::now() + Duration::from_secs(5);
                while fx.scheduler.stats().dispatched < 9 && Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(5));
                }
                shutdown.store(true, Ordering::Release);
                runner.join().unwrap().unwrap();
            });

            assert_eq!(fx.scheduler.stats().dispatched, 9);
            let per_worker: Vec<usize> = fx.workers.iter().map(|q| q.queue_count()).collect();
            assert_eq!(per_worker, vec![3, 3, 3]);
        }
    }

    #[test]
    fn test_malformed_message_is_skipped() {
        for threads in [1, 2] {
            let fx = fixture(2, 1, threads);
            fx.client.publish_raw(b"not a task".to_vec()).unwrap();
            fx.client
                .publish_task(Task::read("f", 0, 10).with_id(21))
                .unwrap();

            let shutdown = AtomicBool::new(false);
            std::thread::scope(|s| {
                let runner = s.spawn(|| fx.scheduler.run(&shutdown));
                let deadline = Instant::now() + Duration::from_secs(5);
                while fx.scheduler.stats().dispatched < 1 && Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(5));
                }
                shutdown.store(true, Ordering::Release);
                runner.join().unwrap().unwrap();
            });

            let stats = fx.scheduler.stats();
            assert_eq!(stats.malformed, 1);
            assert_eq!(stats.dispatched, 1);
        }

        let fx = fixture(1, 4, 1);
        fx.client.publish_raw(vec![0xff, 0x00]).unwrap();
        fx.client
            .publish_task(Task::read("f", 0, 10).with_id(22))
            .unwrap();
        assert_eq!(fx.scheduler.schedule_pending().unwrap(), 1);
        assert_eq!(fx.scheduler.stats().malformed, 1);
    }

    #[test]
    fn test_transport_failure_stops_scheduler() {
        let fx = fixture(1, 1, 1);
        fx.client.close();
        let shutdown = AtomicBool::new(false);
        assert!(matches!(
            fx.scheduler.run(&shutdown),
            Err(SchedulerError::Queue(QueueError::Transport { .. }))
        ));
    }
}
