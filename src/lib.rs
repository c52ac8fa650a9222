//! DTIO - I/O task scheduling core
//!
//! DTIO redirects application file I/O into a task pipeline: clients split
//! each request into chunk-sized tasks, a scheduler assigns every task to a
//! worker, and workers move the data. All shared state lives in a backing
//! key-value map.
//!
//! # Architecture
//!
//! - **Tasks** ([`task`]): the unit of scheduled work and its id generator
//! - **Metadata** ([`metadata`]): file state and chunk placement on top of
//!   the backing [`map`]
//! - **Builders** ([`builder`]): decomposition of requests into tasks, with
//!   optional aggregation of small writes
//! - **Queues** ([`queue`]): transport between clients, scheduler and workers
//! - **Solvers** ([`solver`]): round-robin, random, capacity-aware DP and
//!   hint-only assignment
//! - **Scheduler** ([`scheduler`]): the batch, solve, dispatch loop
//! - **System** ([`system`]): the per-process service handle that wires it
//!   all together from a [`config::DtioConfig`]
//!
//! # Example
//!
//! ```rust,no_run
//! use dtio::config::DtioConfig;
//! use dtio::system::{DtioSystem, Role};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let system = DtioSystem::init(DtioConfig::load()?, Role::Standalone)?;
//! let scheduler = system.scheduler();
//! let worker = system.worker(1)?;
//!
//! std::thread::scope(|s| -> Result<(), Box<dyn std::error::Error>> {
//!     s.spawn(|| scheduler.run(system.shutdown_flag()));
//!     s.spawn(|| worker.run(system.shutdown_flag()));
//!
//!     let mut client = system.client();
//!     let fh = client.open("/data.bin", "w+")?;
//!     client.write(fh, b"Hello, DTIO!")?;
//!     client.close(fh)?;
//!
//!     system.shutdown();
//!     Ok(())
//! })?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod client;
pub mod codec;
pub mod config;
pub mod constants;
pub mod logging;
pub mod map;
pub mod metadata;
pub mod queue;
pub mod scheduler;
pub mod solver;
pub mod stats;
pub mod system;
pub mod task;
pub mod worker;
