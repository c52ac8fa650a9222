//! Solver benchmark
//!
//! Times every assignment policy on synthetic batches of chunk-sized write
//! tasks, with a configurable share of tasks carrying a worker hint.
//!
//! Usage:
//!   cargo bench --bench solvers
//!   cargo bench --bench solvers -- --workers 16 --iterations 200

use std::sync::Arc;
use std::time::{Duration, Instant};

use dtio::config::DpConfig;
use dtio::map::{DistributedMap, InMemoryMap};
use dtio::solver::{DpSolver, RandomSolver, RoundRobinSolver, Solver, SolverInput, WorkerProfile};
use dtio::task::{Task, WorkerId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Benchmark configuration
struct BenchConfig {
    /// Number of iterations for each test
    iterations: usize,
    /// Batch sizes to test (tasks per solve)
    batch_sizes: Vec<usize>,
    /// Warmup iterations
    warmup: usize,
    num_workers: u32,
    /// Percentage of tasks that carry a worker hint
    hinted_percent: u32,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            iterations: 100,
            batch_sizes: vec![16, 64, 256, 1024],
            warmup: 10,
            num_workers: 8,
            hinted_percent: 25,
        }
    }
}

impl BenchConfig {
    fn from_args() -> Result<Self, String> {
        let mut config = Self::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            let value = |i: usize| {
                args.get(i + 1)
                    .ok_or_else(|| format!("{} requires an argument", args[i]))
            };
            match args[i].as_str() {
                "--iterations" => {
                    config.iterations = value(i)?.parse().map_err(|e| format!("--iterations: {}", e))?;
                    i += 2;
                }
                "--workers" => {
                    config.num_workers = value(i)?.parse().map_err(|e| format!("--workers: {}", e))?;
                    i += 2;
                }
                "--hinted" => {
                    config.hinted_percent = value(i)?.parse().map_err(|e| format!("--hinted: {}", e))?;
                    i += 2;
                }
                // cargo bench が渡すフラグは無視
                _ => i += 1,
            }
        }

        if config.iterations == 0 || config.num_workers == 0 {
            return Err("--iterations and --workers must be at least 1".to_string());
        }
        Ok(config)
    }
}

/// Benchmark results for a single solver and batch size
struct BenchResult {
    name: String,
    iterations: usize,
    tasks_per_batch: usize,
    total_duration: Duration,
    min: Duration,
    max: Duration,
    avg: Duration,
}

impl BenchResult {
    fn new(name: String, tasks_per_batch: usize, durations: Vec<Duration>) -> Self {
        let iterations = durations.len();
        let total_duration: Duration = durations.iter().sum();
        let min = durations.iter().min().copied().unwrap_or_default();
        let max = durations.iter().max().copied().unwrap_or_default();
        let avg = total_duration / iterations.max(1) as u32;

        Self {
            name,
            iterations,
            tasks_per_batch,
            total_duration,
            min,
            max,
            avg,
        }
    }

    fn print(&self) {
        println!("  {} ({} tasks/batch)", self.name, self.tasks_per_batch);
        println!("    Iterations: {}", self.iterations);
        println!("    Average:    {:?}", self.avg);
        println!("    Min:        {:?}", self.min);
        println!("    Max:        {:?}", self.max);
        println!(
            "    Throughput: {:.0} tasks/sec",
            (self.iterations * self.tasks_per_batch) as f64 / self.total_duration.as_secs_f64()
        );
    }
}

/// Chunk-sized writes to distinct chunks, some hinted
fn make_batch(rng: &mut StdRng, size: usize, config: &BenchConfig) -> Vec<Task> {
    const CHUNK: u64 = 2 * 1024 * 1024;
    (0..size)
        .map(|i| {
            let len = rng.gen_range(4096..=CHUNK);
            let mut task = Task::write("/bench.dat", i as u64 * CHUNK, len).with_id(i as u64 + 1);
            if rng.gen_range(0..100) < config.hinted_percent {
                let worker = rng.gen_range(1..=config.num_workers) as WorkerId;
                // 直前に生成したタスクなので未割り当て
                let _ = task.assign_worker(worker);
            }
            task
        })
        .collect()
}

fn bench_solver(solver: &dyn Solver, batches: &[Vec<Task>], config: &BenchConfig) -> Vec<Duration> {
    for batch in batches.iter().cycle().take(config.warmup) {
        solver.solve(SolverInput::new(batch.clone()));
    }

    let mut durations = Vec::with_capacity(config.iterations);
    for batch in batches.iter().cycle().take(config.iterations) {
        let input = SolverInput::new(batch.clone());
        let start = Instant::now();
        let output = solver.solve(input);
        durations.push(start.elapsed());
        assert_eq!(output.assigned_count(), batch.len());
    }
    durations
}

fn main() {
    let config = match BenchConfig::from_args() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Usage: cargo bench --bench solvers -- [--iterations N] [--workers N] [--hinted PERCENT]");
            std::process::exit(1);
        }
    };

    println!("\n=== DTIO Solver Benchmark ===\n");
    println!("Configuration:");
    println!("  Iterations:  {}", config.iterations);
    println!("  Warmup:      {}", config.warmup);
    println!("  Workers:     {}", config.num_workers);
    println!("  Hinted:      {}%", config.hinted_percent);
    println!("  Batch sizes: {:?}\n", config.batch_sizes);

    let map: Arc<dyn DistributedMap> = Arc::new(InMemoryMap::new(4, 1 << 20));
    let dp_config = DpConfig::default();
    for worker in 1..=config.num_workers as WorkerId {
        // 容量の異なるワーカーを混ぜる
        let capacity = (worker as u64) * 64 * 1024 * 1024;
        if let Err(e) = WorkerProfile::new(worker).with_capacity(capacity).store(map.as_ref()) {
            eprintln!("Failed to store profile of worker {}: {}", worker, e);
            std::process::exit(1);
        }
    }

    let round_robin = match RoundRobinSolver::new(Arc::clone(&map), config.num_workers) {
        Ok(solver) => solver,
        Err(e) => {
            eprintln!("Failed to create round-robin solver: {}", e);
            std::process::exit(1);
        }
    };
    let solvers: Vec<Box<dyn Solver>> = vec![
        Box::new(round_robin),
        Box::new(RandomSolver::new(config.num_workers, Some(42))),
        Box::new(DpSolver::new(Arc::clone(&map), config.num_workers, &dp_config)),
    ];

    let mut rng = StdRng::seed_from_u64(7);
    let mut results = Vec::new();
    for &size in &config.batch_sizes {
        let batches: Vec<Vec<Task>> = (0..8).map(|_| make_batch(&mut rng, size, &config)).collect();
        for solver in &solvers {
            println!("Running {} with {} tasks/batch...", solver.name(), size);
            let durations = bench_solver(solver.as_ref(), &batches, &config);
            results.push(BenchResult::new(solver.name().to_string(), size, durations));
        }
    }

    println!("\n=== Benchmark Results ===\n");
    for result in &results {
        result.print();
    }
}
