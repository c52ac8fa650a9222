use super::{admit, Admission, Solver, SolverInput, SolverOutput};
use crate::task::WorkerId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};

/// Uniform random placement
///
/// Each solve draws from its own RNG. With a seed, the n-th solve of this
/// solver always sees the same sequence.
pub struct RandomSolver {
    num_workers: u32,
    seed: Option<u64>,
    solves: AtomicU64,
}

impl RandomSolver {
    pub fn new(num_workers: u32, seed: Option<u64>) -> Self {
        Self {
            num_workers: num_workers.max(1),
            seed,
            solves: AtomicU64::new(0),
        }
    }

    fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => {
                let round = self.solves.fetch_add(1, Ordering::Relaxed);
                StdRng::seed_from_u64(seed.wrapping_add(round))
            }
            None => StdRng::from_entropy(),
        }
    }
}

impl Solver for RandomSolver {
    fn name(&self) -> &'static str {
        "random"
    }

    fn solve(&self, input: SolverInput) -> SolverOutput {
        let mut rng = self.rng();
        let mut output = SolverOutput::default();

        for (index, task) in input.tasks.into_iter().enumerate() {
            match admit(index, &task, self.num_workers) {
                Admission::Hinted(worker) => output.assign(index, task, worker),
                Admission::Rejected(error) => output.reject(error),
                Admission::Free => {
                    let worker = rng.gen_range(1..=self.num_workers) as WorkerId;
                    output.assign(index, task, worker);
                }
            }
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    fn batch() -> Vec<Task> {
        (0..64).map(|i| Task::write("f", i * 8, 8).with_id(i + 1)).collect()
    }

    #[test]
    fn test_workers_in_range() {
        let solver = RandomSolver::new(3, None);
        let output = solver.solve(SolverInput::new(batch()));
        assert_eq!(output.assigned_count(), 64);
        assert!(output.solution.values().all(|w| (1..=3).contains(w)));
        assert!(output
            .worker_task_map
            .iter()
            .all(|(w, tasks)| tasks.iter().all(|t| t.destination.worker == *w)));
    }

    #[test]
    fn test_seeded_is_reproducible() {
        let a = RandomSolver::new(8, Some(42)).solve(SolverInput::new(batch()));
        let b = RandomSolver::new(8, Some(42)).solve(SolverInput::new(batch()));
        assert_eq!(a.solution, b.solution);
    }

    #[test]
    fn test_hint_wins() {
        let solver = RandomSolver::new(8, Some(1));
        let mut tasks = batch();
        for task in &mut tasks {
            task.destination.worker = 5;
        }
        let output = solver.solve(SolverInput::new(tasks));
        assert!(output.solution.values().all(|&w| w == 5));
    }
}
