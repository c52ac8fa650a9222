//! Capacity-aware placement
//!
//! Workers are ranked by a weighted fit score. In rank order, each worker
//! takes the subset of still-unassigned tasks that best fills its remaining
//! capacity (0/1 knapsack on a discretized capacity). Whatever no worker can
//! hold goes to the worker with the most capacity left.

use super::{admit, Admission, Solver, SolverInput, SolverOutput, WorkerProfile};
use crate::config::DpConfig;
use crate::constants::{MAX_SCORE, MAX_WORKER_TASK_COUNT, WORKER_ATTRIBUTES_COUNT, WORKER_ATTRIBUTE_MAX};
use crate::map::DistributedMap;
use crate::task::{Task, WorkerId};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::instrument;

pub struct DpSolver {
    map: Arc<dyn DistributedMap>,
    num_workers: u32,
    weights: [f32; WORKER_ATTRIBUTES_COUNT],
    capacity_buckets: usize,
    worker_capacity_max: u64,
}

impl DpSolver {
    pub fn new(map: Arc<dyn DistributedMap>, num_workers: u32, config: &DpConfig) -> Self {
        Self {
            map,
            num_workers: num_workers.max(1),
            weights: config.policy_weights,
            capacity_buckets: config.capacity_buckets.max(1),
            worker_capacity_max: config.worker_capacity_max.max(1),
        }
    }

    /// Stored profiles of every worker; unreadable entries fall back to defaults
    fn profiles(&self) -> Vec<WorkerProfile> {
        (1..=self.num_workers as WorkerId)
            .map(|worker| {
                WorkerProfile::load(self.map.as_ref(), worker, self.worker_capacity_max)
                    .unwrap_or_else(|e| {
                        tracing::warn!("Using default profile for worker {}: {}", worker, e);
                        WorkerProfile::new(worker).with_capacity(self.worker_capacity_max)
                    })
            })
            .collect()
    }

    /// Weighted fit in `0..=MAX_SCORE`
    pub fn fit(&self, profile: &WorkerProfile) -> u32 {
        let attr_max = WORKER_ATTRIBUTE_MAX as f32;
        let attributes = [
            profile.speed.min(WORKER_ATTRIBUTE_MAX) as f32 / attr_max,
            1.0 - profile.energy.min(WORKER_ATTRIBUTE_MAX) as f32 / attr_max,
            (profile.capacity_bytes as f64 / self.worker_capacity_max as f64).min(1.0) as f32,
            1.0 - profile.task_count.min(MAX_WORKER_TASK_COUNT) as f32
                / MAX_WORKER_TASK_COUNT as f32,
            profile.score.min(MAX_SCORE) as f32 / MAX_SCORE as f32,
        ];

        let total_weight: f32 = self.weights.iter().sum();
        if total_weight <= 0.0 {
            return 0;
        }
        let weighted: f32 = self
            .weights
            .iter()
            .zip(attributes.iter())
            .map(|(w, a)| w * a)
            .sum();
        ((weighted / total_weight) * MAX_SCORE as f32)
            .round()
            .clamp(0.0, MAX_SCORE as f32) as u32
    }

    /// Workers in descending fit, ties by ascending id
    fn rank(&self, profiles: &[WorkerProfile]) -> Vec<(WorkerId, u32)> {
        let mut ranked: Vec<(WorkerId, u32)> = profiles
            .iter()
            .map(|p| (p.worker_id, self.fit(p)))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked
    }
}

/// 0/1 knapsack over byte sizes on a capacity split into `buckets` units
///
/// Returns which items are taken. Item weights round up, so a selection
/// never exceeds `capacity` bytes.
pub fn knapsack(sizes: &[u64], capacity: u64, buckets: usize, fit: u32) -> Vec<bool> {
    let total: u64 = sizes.iter().fold(0u64, |acc, s| acc.saturating_add(*s));
    if total <= capacity {
        return vec![true; sizes.len()];
    }
    if capacity == 0 {
        return vec![false; sizes.len()];
    }

    let buckets = buckets.max(1) as u64;
    let unit = capacity.div_ceil(buckets).max(1);
    let cap = (capacity / unit) as usize;
    let weights: Vec<usize> = sizes
        .iter()
        .map(|s| s.div_ceil(unit).max(1) as usize)
        .collect();
    let value = |w: usize| (fit as u64 + 1) * w as u64;

    let mut best = vec![0u64; cap + 1];
    let mut keep = vec![vec![false; cap + 1]; sizes.len()];
    for (i, &w) in weights.iter().enumerate() {
        if w > cap {
            continue;
        }
        for c in (w..=cap).rev() {
            let candidate = best[c - w] + value(w);
            if candidate > best[c] {
                best[c] = candidate;
                keep[i][c] = true;
            }
        }
    }

    let mut taken = vec![false; sizes.len()];
    let mut c = cap;
    for i in (0..sizes.len()).rev() {
        if keep[i][c] {
            taken[i] = true;
            c -= weights[i];
        }
    }
    taken
}

impl Solver for DpSolver {
    fn name(&self) -> &'static str {
        "dp"
    }

    #[instrument(level = "trace", name = "solve_dp", skip(self, input), fields(tasks = input.num_tasks()))]
    fn solve(&self, input: SolverInput) -> SolverOutput {
        let mut output = SolverOutput::default();
        let profiles = self.profiles();
        let mut remaining: BTreeMap<WorkerId, u64> = profiles
            .iter()
            .map(|p| (p.worker_id, p.capacity_bytes))
            .collect();

        // ヒント付きは固定配置し、その分の容量を差し引く
        let mut free: Vec<(usize, Task)> = Vec::new();
        for (index, task) in input.tasks.into_iter().enumerate() {
            match admit(index, &task, self.num_workers) {
                Admission::Hinted(worker) => {
                    if let Some(cap) = remaining.get_mut(&worker) {
                        *cap = cap.saturating_sub(task.size());
                    }
                    output.assign(index, task, worker);
                }
                Admission::Rejected(error) => output.reject(error),
                Admission::Free => free.push((index, task)),
            }
        }

        for (worker, fit) in self.rank(&profiles) {
            if free.is_empty() {
                break;
            }
            let capacity = remaining.get(&worker).copied().unwrap_or(0);
            let sizes: Vec<u64> = free.iter().map(|(_, t)| t.size()).collect();
            let taken = knapsack(&sizes, capacity, self.capacity_buckets, fit);

            let mut rest = Vec::with_capacity(free.len());
            for ((index, task), take) in free.into_iter().zip(taken) {
                if take {
                    if let Some(cap) = remaining.get_mut(&worker) {
                        *cap = cap.saturating_sub(task.size());
                    }
                    output.assign(index, task, worker);
                } else {
                    rest.push((index, task));
                }
            }
            free = rest;
        }

        for (index, task) in free {
            // 容量最大のワーカー（同率は小さい id）
            let Some((&worker, _)) = remaining
                .iter()
                .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            else {
                break;
            };
            tracing::debug!(
                "Task {} ({} bytes) exceeds remaining capacity, placing on worker {}",
                task.task_id,
                task.size(),
                worker
            );
            if let Some(cap) = remaining.get_mut(&worker) {
                *cap = cap.saturating_sub(task.size());
            }
            output.assign(index, task, worker);
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::InMemoryMap;

    fn solver(num_workers: u32, capacities: &[u64]) -> DpSolver {
        let map: Arc<dyn DistributedMap> = Arc::new(InMemoryMap::new(1, 1024));
        for (i, &cap) in capacities.iter().enumerate() {
            WorkerProfile::new(i as WorkerId + 1)
                .with_capacity(cap)
                .store(map.as_ref())
                .unwrap();
        }
        let config = DpConfig {
            worker_capacity_max: 1000,
            ..DpConfig::default()
        };
        DpSolver::new(map, num_workers, &config)
    }

    fn writes(sizes: &[u64]) -> Vec<Task> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, &s)| Task::write("f", i as u64 * 1000, s).with_id(i as u64 + 1))
            .collect()
    }

    #[test]
    fn test_knapsack_fast_path() {
        assert_eq!(knapsack(&[1, 2, 3], 6, 256, 50), vec![true, true, true]);
        assert_eq!(knapsack(&[1, 2], 0, 256, 50), vec![false, false]);
    }

    #[test]
    fn test_knapsack_fills_capacity() {
        let taken = knapsack(&[60, 50, 50], 100, 100, 10);
        let used: u64 = [60, 50, 50]
            .iter()
            .zip(&taken)
            .filter(|(_, t)| **t)
            .map(|(s, _)| *s)
            .sum();
        assert_eq!(used, 100);
        assert_eq!(taken, vec![false, true, true]);
    }

    #[test]
    fn test_fit_ordering() {
        let solver = solver(2, &[]);
        let mut fast = WorkerProfile::new(1).with_capacity(1000);
        fast.speed = 5;
        let slow = WorkerProfile::new(2).with_capacity(1000);
        assert!(solver.fit(&fast) > solver.fit(&slow));
        assert!(solver.fit(&fast) <= MAX_SCORE);

        // 同率は id の昇順
        let ranked = solver.rank(&[WorkerProfile::new(2), WorkerProfile::new(1)]);
        assert_eq!(ranked[0].0, 1);
    }

    #[test]
    fn test_respects_capacity() {
        // worker 2 ranks first on free capacity but cannot hold the whole batch
        let solver = solver(2, &[100, 1000]);
        let output = solver.solve(SolverInput::new(writes(&[500, 450, 80])));

        assert_eq!(output.assigned_count(), 3);
        assert_eq!(output.solution[&0], 2);
        assert_eq!(output.solution[&1], 2);
        assert_eq!(output.solution[&2], 1);
    }

    #[test]
    fn test_overflow_goes_to_largest_remaining() {
        let solver = solver(2, &[100, 150]);
        let output = solver.solve(SolverInput::new(writes(&[500])));
        assert_eq!(output.solution[&0], 2);
    }

    #[test]
    fn test_hint_is_charged() {
        let solver = solver(2, &[1000, 1000]);
        let mut tasks = writes(&[900, 500]);
        tasks[0].destination.worker = 1;
        let output = solver.solve(SolverInput::new(tasks));
        assert_eq!(output.solution[&0], 1);
        assert_eq!(output.solution[&1], 2);
    }
}
