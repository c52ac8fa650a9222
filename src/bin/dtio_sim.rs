//! DTIO pipeline simulator
//!
//! Runs clients, a task scheduler and in-process workers in one process,
//! pushes a write/read workload through the pipeline and prints how the
//! tasks were distributed over the workers.
//!
//! # Usage
//!
//! ```bash
//! dtio_sim --workers 4 --clients 2 --policy DP --file-size 8388608
//! ```

use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use tracing::{error, info};

use dtio::config::{AssignmentPolicy, BuilderPolicy, DtioConfig};
use dtio::system::{DtioSystem, Role};

/// DTIO pipeline simulator
#[derive(Parser, Debug)]
#[command(name = "dtio_sim")]
#[command(about = "Run a DTIO client/scheduler/worker pipeline in one process")]
struct Args {
    /// TOML configuration (defaults apply when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of workers
    #[arg(long)]
    workers: Option<u32>,

    /// Number of client threads
    #[arg(long, default_value_t = 2)]
    clients: usize,

    /// Assignment policy (ROUND_ROBIN, RANDOM, DP, DEFAULT)
    #[arg(long)]
    policy: Option<AssignmentPolicy>,

    /// Aggregate small writes
    #[arg(long)]
    aggregate: bool,

    /// Bytes written and read back per client
    #[arg(long, default_value_t = 8 * 1024 * 1024)]
    file_size: usize,

    /// Size of each write call (bytes)
    #[arg(long, default_value_t = 1024 * 1024)]
    io_size: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

fn main() {
    let args = Args::parse();

    if let Err(e) = run(&args) {
        error!("Simulation failed: {}", e);
        eprintln!("dtio_sim: {}", e);
        std::process::exit(1);
    }
}

fn load_config(args: &Args) -> Result<DtioConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => DtioConfig::from_file(path)?,
        None => DtioConfig::load()?,
    };
    if let Some(workers) = args.workers {
        config.system.num_workers = workers;
    }
    if let Some(policy) = args.policy {
        config.scheduler.assignment_policy = policy;
    }
    if args.aggregate {
        config.io.builder = BuilderPolicy::Aggregating;
    }
    if let Some(level) = &args.log_level {
        config.system.log_level = level.clone();
    }
    Ok(config)
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args)?;
    let num_workers = config.system.num_workers;
    let system = DtioSystem::init(config, Role::Standalone)?;

    let scheduler = system.scheduler();
    let workers = (1..=num_workers as i32)
        .map(|id| system.worker(id))
        .collect::<Result<Vec<_>, _>>()?;

    let start = Instant::now();
    let shared = &system;
    let verified = std::thread::scope(|s| {
        let scheduler_handle = s.spawn(|| scheduler.run(shared.shutdown_flag()));
        let worker_handles: Vec<_> = workers
            .iter()
            .map(|worker| s.spawn(move || worker.run(shared.shutdown_flag())))
            .collect();

        let client_handles: Vec<_> = (0..args.clients)
            .map(|i| s.spawn(move || run_client(shared, i, args.file_size, args.io_size)))
            .collect();

        let mut verified = 0usize;
        let mut failure: Option<String> = None;
        for handle in client_handles {
            match handle.join() {
                Ok(Ok(bytes)) => verified += bytes,
                Ok(Err(e)) => failure = Some(e.to_string()),
                Err(_) => failure = Some("client thread panicked".to_string()),
            }
        }

        shared.shutdown();
        if let Ok(Err(e)) = scheduler_handle.join() {
            failure.get_or_insert(e.to_string());
        }
        for handle in worker_handles {
            if let Ok(Err(e)) = handle.join() {
                failure.get_or_insert(e.to_string());
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(verified),
        }
    })?;
    let elapsed = start.elapsed();

    let stats = scheduler.stats();
    info!("Scheduler: {:?}", stats);

    println!("policy:      {}", system.solver().name());
    println!("clients:     {}", args.clients);
    println!("verified:    {} bytes in {:.3}s", verified, elapsed.as_secs_f64());
    println!(
        "tasks:       {} dispatched, {} rejected, {} batches",
        stats.dispatched, stats.rejected, stats.batches
    );
    println!("distribution:");
    for worker in &workers {
        println!("  worker {:>3}: {:>8} tasks", worker.id(), worker.processed());
    }

    Ok(())
}

/// Write a file in `io_size` pieces, read it back and compare
fn run_client(
    system: &std::sync::Arc<DtioSystem>,
    index: usize,
    file_size: usize,
    io_size: usize,
) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
    let mut client = system.client();
    let filename = format!("/sim/client-{}.dat", index);
    let data: Vec<u8> = (0..file_size).map(|i| (i % 251) as u8 ^ index as u8).collect();

    let fh = client.open(&filename, "w+")?;
    for piece in data.chunks(io_size.max(1)) {
        client.write(fh, piece)?;
    }
    client.flush()?;

    client.seek(fh, 0, dtio::metadata::SeekOrigin::Set)?;
    let mut readback = vec![0u8; file_size];
    let mut filled = 0;
    while filled < file_size {
        let n = client.read(fh, &mut readback[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    client.close(fh)?;

    if readback != data {
        return Err(format!("{}: read back {} bytes that differ from the written data", filename, filled).into());
    }
    info!("{}: verified {} bytes", filename, filled);
    Ok(filled)
}
