use super::{admit, Admission, AssignmentError, Solver, SolverInput, SolverOutput};

/// Follows worker hints and nothing else
pub struct DefaultSolver {
    num_workers: u32,
}

impl DefaultSolver {
    pub fn new(num_workers: u32) -> Self {
        Self {
            num_workers: num_workers.max(1),
        }
    }
}

impl Solver for DefaultSolver {
    fn name(&self) -> &'static str {
        "default"
    }

    fn solve(&self, input: SolverInput) -> SolverOutput {
        let mut output = SolverOutput::default();

        for (index, task) in input.tasks.into_iter().enumerate() {
            match admit(index, &task, self.num_workers) {
                Admission::Hinted(worker) => output.assign(index, task, worker),
                Admission::Rejected(error) => output.reject(error),
                Admission::Free => output.reject(AssignmentError::NoHint {
                    index,
                    task_id: task.task_id,
                }),
            }
        }

        output
    }
}
