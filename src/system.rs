//! Process-wide service handle
//!
//! One [`DtioSystem`] per process owns the backing map, the queues, the
//! metadata manager, the solver and the task id generator. Schedulers,
//! clients and local workers are created from it and share it by `Arc`.

use crate::client::DtioClient;
use crate::config::{ConfigError, DtioConfig};
use crate::constants::PROCESS_ID;
use crate::map::{self, DistributedMap, GroupKey, MapError, Table};
use crate::metadata::MetadataManager;
use crate::queue::{self, QueueError, QueueSet};
use crate::scheduler::TaskScheduler;
use crate::solver::{self, Solver};
use crate::task::{IdGeneratorError, TaskIdGenerator, MAX_PROCESS_ID};
use crate::worker::LocalWorker;
use crate::{logging, stats};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Map(#[from] MapError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    IdGenerator(#[from] IdGeneratorError),
}

pub type SystemResult<T> = Result<T, SystemError>;

/// Role of the process, used for log prefixes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    TaskScheduler,
    Worker,
    /// Everything in one process (`dtio_sim`, tests)
    Standalone,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::TaskScheduler => "task_scheduler",
            Role::Worker => "worker",
            Role::Standalone => "standalone",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct DtioSystem {
    config: DtioConfig,
    role: Role,
    map: Arc<dyn DistributedMap>,
    queues: QueueSet,
    metadata: Arc<MetadataManager>,
    solver: Arc<dyn Solver>,
    ids: Arc<TaskIdGenerator>,
    shutdown: AtomicBool,
}

impl DtioSystem {
    /// Validate the configuration, start logging and connect the backends
    pub fn init(config: DtioConfig, role: Role) -> SystemResult<Arc<Self>> {
        config.validate()?;
        logging::init_with_hostname(&config.system.log_level, role.as_str());
        stats::init_from_env();

        let map = map::connect(&config)?;
        let queues = queue::connect(&config)?;
        let system = Self::with_backends(config, role, map, queues)?;

        tracing::info!(
            "DTIO system initialized as {} ({} workers, policy {:?})",
            role,
            system.config.system.num_workers,
            system.config.scheduler.assignment_policy
        );
        Ok(system)
    }

    /// Build on already connected backends
    pub fn with_backends(
        config: DtioConfig,
        role: Role,
        map: Arc<dyn DistributedMap>,
        queues: QueueSet,
    ) -> SystemResult<Arc<Self>> {
        let metadata = Arc::new(MetadataManager::new(Arc::clone(&map), config.io.chunk_size));
        let solver = solver::from_policy(&config, Arc::clone(&map))?;
        let process_id = match config.system.process_id {
            Some(process_id) => process_id,
            // 共有カウンタから払い出すので同じマップを使うプロセス間で重複しない
            None => {
                map.counter_inc(Table::CounterDb, PROCESS_ID, GroupKey::Hashed)?
                    % (MAX_PROCESS_ID + 1)
            }
        };
        let ids = Arc::new(TaskIdGenerator::new(process_id)?);
        tracing::debug!("Task ids use process id {}", process_id);

        Ok(Arc::new(Self {
            config,
            role,
            map,
            queues,
            metadata,
            solver,
            ids,
            shutdown: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &DtioConfig {
        &self.config
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn map(&self) -> &Arc<dyn DistributedMap> {
        &self.map
    }

    pub fn queues(&self) -> &QueueSet {
        &self.queues
    }

    pub fn metadata(&self) -> &Arc<MetadataManager> {
        &self.metadata
    }

    pub fn solver(&self) -> &Arc<dyn Solver> {
        &self.solver
    }

    pub fn ids(&self) -> &Arc<TaskIdGenerator> {
        &self.ids
    }

    /// Ask every loop driven by this handle to stop
    pub fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            tracing::info!("DTIO system shutting down");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn shutdown_flag(&self) -> &AtomicBool {
        &self.shutdown
    }

    pub fn scheduler(&self) -> TaskScheduler {
        TaskScheduler::new(
            &self.config,
            self.queues.clone(),
            Arc::clone(&self.solver),
            Arc::clone(&self.metadata),
        )
    }

    pub fn client(self: &Arc<Self>) -> DtioClient {
        DtioClient::new(Arc::clone(self))
    }

    /// In-process worker serving the queue of `worker_id`
    pub fn worker(self: &Arc<Self>, worker_id: crate::task::WorkerId) -> SystemResult<LocalWorker> {
        let queue = Arc::clone(self.queues.worker_queue(worker_id)?);
        Ok(LocalWorker::new(worker_id, queue, Arc::clone(&self.metadata))
            .with_capacity(self.config.dp.worker_capacity_max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AssignmentPolicy, QueueBackend};
    use crate::map::InMemoryMap;

    #[test]
    fn test_init_and_shutdown() {
        let mut config = DtioConfig::default();
        config.system.num_workers = 2;
        config.scheduler.assignment_policy = AssignmentPolicy::Random;

        let system = DtioSystem::init(config, Role::Standalone).unwrap();
        assert_eq!(system.solver().name(), "random");
        assert_eq!(system.queues().num_workers(), 2);
        assert!(!system.is_shutdown());

        system.shutdown();
        system.shutdown();
        assert!(system.is_shutdown());
        assert!(system.worker(3).is_err());
    }

    #[test]
    fn test_init_rejects_invalid_config() {
        let mut config = DtioConfig::default();
        config.system.num_workers = 0;
        assert!(matches!(
            DtioSystem::init(config, Role::Client),
            Err(SystemError::Config(_))
        ));

        let mut config = DtioConfig::default();
        config.backend.queue = QueueBackend::Nats;
        assert!(matches!(
            DtioSystem::init(config, Role::Client),
            Err(SystemError::Queue(QueueError::NotImplemented(_)))
        ));
    }

    #[test]
    fn test_processes_sharing_a_map_get_distinct_id_fields() {
        let config = DtioConfig::default();
        let map: Arc<dyn DistributedMap> = Arc::new(InMemoryMap::new(2, 1 << 20));
        let queues = QueueSet::in_process(config.system.num_workers, 16);

        let process_ids: Vec<u64> = [Role::Client, Role::Client, Role::TaskScheduler]
            .into_iter()
            .map(|role| {
                DtioSystem::with_backends(config.clone(), role, Arc::clone(&map), queues.clone())
                    .unwrap()
                    .ids()
                    .process_id()
            })
            .collect();
        assert_eq!(process_ids, vec![0, 1, 2]);

        let mut ranked = config.clone();
        ranked.system.process_id = Some(700);
        let system = DtioSystem::with_backends(ranked, Role::Worker, map, queues).unwrap();
        let id = system.ids().next_id().unwrap();
        assert_eq!(TaskIdGenerator::extract_components(id).1, 700);
    }
}
