//! Worker assignment solvers
//!
//! A solver maps a batch of pending tasks to worker ids in `1..=num_workers`
//! and partitions the batch by worker. Tasks that cannot be assigned are
//! reported in [`SolverOutput::errors`] and left out of the partition; the
//! rest of the batch is always assigned.

pub mod default;
pub mod dp;
pub mod profile;
pub mod random;
pub mod round_robin;

pub use default::DefaultSolver;
pub use dp::DpSolver;
pub use profile::WorkerProfile;
pub use random::RandomSolver;
pub use round_robin::RoundRobinSolver;

use crate::config::{AssignmentPolicy, DtioConfig};
use crate::map::{DistributedMap, MapError, MapResult};
use crate::task::{Task, TaskError, TaskId, TaskType, WorkerId};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A task the solver refused to assign
#[derive(Debug, thiserror::Error)]
pub enum AssignmentError {
    #[error("{t_type:?} task {task_id} (index {index}) has no source worker")]
    MissingSource {
        index: usize,
        task_id: TaskId,
        t_type: TaskType,
    },

    #[error("Task {task_id} (index {index}) hints worker {worker} outside 1..={num_workers}")]
    InvalidHint {
        index: usize,
        task_id: TaskId,
        worker: WorkerId,
        num_workers: u32,
    },

    #[error("Task {task_id} (index {index}) has unsupported type {t_type:?}")]
    UnsupportedType {
        index: usize,
        task_id: TaskId,
        t_type: TaskType,
    },

    #[error("Task {task_id} (index {index}) carries no worker hint")]
    NoHint { index: usize, task_id: TaskId },

    #[error("Round-robin counter failed for task {task_id}: {source}")]
    Counter { task_id: TaskId, source: MapError },

    #[error(transparent)]
    Task(#[from] TaskError),
}

/// Batch handed to a solver
#[derive(Debug, Clone, Default)]
pub struct SolverInput {
    pub tasks: Vec<Task>,
}

impl SolverInput {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self { tasks }
    }

    pub fn num_tasks(&self) -> usize {
        self.tasks.len()
    }
}

/// Result of one solve
#[derive(Debug, Default)]
pub struct SolverOutput {
    /// task index -> worker
    pub solution: BTreeMap<usize, WorkerId>,
    /// worker -> tasks assigned to it, in input order
    pub worker_task_map: BTreeMap<WorkerId, Vec<Task>>,
    pub errors: Vec<AssignmentError>,
}

impl SolverOutput {
    /// Record `worker` for task `index`, filling in the task's worker field
    /// unless it already carries that worker as a hint
    pub(crate) fn assign(&mut self, index: usize, mut task: Task, worker: WorkerId) {
        if task.hinted_worker() != Some(worker) {
            if let Err(e) = task.assign_worker(worker) {
                self.reject(e.into());
                return;
            }
        }
        self.solution.insert(index, worker);
        self.worker_task_map.entry(worker).or_default().push(task);
    }

    pub(crate) fn reject(&mut self, error: AssignmentError) {
        tracing::warn!("Assignment failed: {}", error);
        self.errors.push(error);
    }

    pub fn assigned_count(&self) -> usize {
        self.solution.len()
    }

    /// Tasks per worker, for load summaries
    pub fn counts(&self) -> BTreeMap<WorkerId, usize> {
        self.worker_task_map
            .iter()
            .map(|(worker, tasks)| (*worker, tasks.len()))
            .collect()
    }
}

/// How a task enters a solve
pub(crate) enum Admission {
    /// Carries a valid hint that must be kept
    Hinted(WorkerId),
    /// Free for the solver to place
    Free,
    Rejected(AssignmentError),
}

/// Hint and type checks shared by every solver
///
/// DELETE/FLUSH need an existing source worker; DUMMY is never scheduled.
pub(crate) fn admit(index: usize, task: &Task, num_workers: u32) -> Admission {
    if task.t_type() == TaskType::Dummy {
        return Admission::Rejected(AssignmentError::UnsupportedType {
            index,
            task_id: task.task_id,
            t_type: task.t_type(),
        });
    }

    match task.hinted_worker() {
        Some(worker) if worker >= 1 && worker as u32 <= num_workers => Admission::Hinted(worker),
        Some(worker) => Admission::Rejected(AssignmentError::InvalidHint {
            index,
            task_id: task.task_id,
            worker,
            num_workers,
        }),
        None if task.t_type().requires_source_worker() => {
            Admission::Rejected(AssignmentError::MissingSource {
                index,
                task_id: task.task_id,
                t_type: task.t_type(),
            })
        }
        None => Admission::Free,
    }
}

/// Capability set of an assignment algorithm
pub trait Solver: Send + Sync {
    fn name(&self) -> &'static str;

    fn solve(&self, input: SolverInput) -> SolverOutput;
}

/// Build the solver selected by `scheduler.assignment_policy`
pub fn from_policy(
    config: &DtioConfig,
    map: Arc<dyn DistributedMap>,
) -> MapResult<Arc<dyn Solver>> {
    let num_workers = config.system.num_workers;
    let solver: Arc<dyn Solver> = match config.scheduler.assignment_policy {
        AssignmentPolicy::RoundRobin => Arc::new(RoundRobinSolver::new(map, num_workers)?),
        AssignmentPolicy::Random => {
            Arc::new(RandomSolver::new(num_workers, config.scheduler.random_seed))
        }
        AssignmentPolicy::Dp => Arc::new(DpSolver::new(map, num_workers, &config.dp)),
        AssignmentPolicy::Default => Arc::new(DefaultSolver::new(num_workers)),
    };
    tracing::info!("Using {} solver for {} workers", solver.name(), num_workers);
    Ok(solver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::InMemoryMap;

    #[test]
    fn test_admit() {
        let mut read = Task::read("f", 0, 1).with_id(1);
        assert!(matches!(admit(0, &read, 4), Admission::Free));

        read.source.worker = 4;
        assert!(matches!(admit(0, &read, 4), Admission::Hinted(4)));

        read.source.worker = 0;
        assert!(matches!(
            admit(0, &read, 4),
            Admission::Rejected(AssignmentError::InvalidHint { worker: 0, .. })
        ));

        let delete = Task::delete("f", 0, 1).with_id(2);
        assert!(matches!(
            admit(3, &delete, 4),
            Admission::Rejected(AssignmentError::MissingSource { index: 3, task_id: 2, .. })
        ));

        let dummy = Task::new(
            TaskType::Dummy,
            read.source.clone(),
            read.destination.clone(),
        );
        assert!(matches!(
            admit(0, &dummy, 4),
            Admission::Rejected(AssignmentError::UnsupportedType { .. })
        ));
    }

    #[test]
    fn test_from_policy() {
        let map: Arc<dyn DistributedMap> = Arc::new(InMemoryMap::new(1, 1024));
        let mut config = DtioConfig::default();

        for (policy, name) in [
            (AssignmentPolicy::RoundRobin, "round_robin"),
            (AssignmentPolicy::Random, "random"),
            (AssignmentPolicy::Dp, "dp"),
            (AssignmentPolicy::Default, "default"),
        ] {
            config.scheduler.assignment_policy = policy;
            let solver = from_policy(&config, Arc::clone(&map)).unwrap();
            assert_eq!(solver.name(), name);
        }
    }
}
