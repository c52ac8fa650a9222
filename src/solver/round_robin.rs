use super::{admit, Admission, AssignmentError, Solver, SolverInput, SolverOutput};
use crate::constants::ROUND_ROBIN_INDEX;
use crate::map::{DistributedMap, GroupKey, MapResult, Table};
use crate::task::WorkerId;
use std::sync::Arc;
use tracing::instrument;

/// Round-robin over a cursor shared by every scheduler of the map
///
/// Only unhinted tasks advance `ROUND_ROBIN_INDEX`, so data-affine reads and
/// rewrites do not skew the rotation.
pub struct RoundRobinSolver {
    map: Arc<dyn DistributedMap>,
    num_workers: u32,
}

impl RoundRobinSolver {
    pub fn new(map: Arc<dyn DistributedMap>, num_workers: u32) -> MapResult<Self> {
        map.counter_init(Table::CounterDb, ROUND_ROBIN_INDEX, GroupKey::Hashed)?;
        Ok(Self {
            map,
            num_workers: num_workers.max(1),
        })
    }

    fn next_worker(&self) -> MapResult<WorkerId> {
        let index = self
            .map
            .counter_inc(Table::CounterDb, ROUND_ROBIN_INDEX, GroupKey::Hashed)?;
        Ok((index % self.num_workers as u64) as WorkerId + 1)
    }
}

impl Solver for RoundRobinSolver {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    #[instrument(level = "trace", name = "solve_round_robin", skip(self, input), fields(tasks = input.num_tasks()))]
    fn solve(&self, input: SolverInput) -> SolverOutput {
        let mut output = SolverOutput::default();

        for (index, task) in input.tasks.into_iter().enumerate() {
            match admit(index, &task, self.num_workers) {
                Admission::Hinted(worker) => output.assign(index, task, worker),
                Admission::Rejected(error) => output.reject(error),
                Admission::Free => match self.next_worker() {
                    Ok(worker) => output.assign(index, task, worker),
                    Err(source) => output.reject(AssignmentError::Counter {
                        task_id: task.task_id,
                        source,
                    }),
                },
            }
        }

        output
    }
}
