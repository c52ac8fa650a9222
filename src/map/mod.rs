//! Backing key-value map consumed by the scheduling core
//!
//! All shared state (file stats, chunk layout, counters, worker profiles,
//! staged payloads) goes through [`DistributedMap`]. Operations are atomic per
//! key and never transactional across keys.

pub mod memory;
pub mod ring;

pub use memory::InMemoryMap;
pub use ring::{ConsistentHashRing, ServerIndex};

use crate::codec::{self, CodecError};
use crate::config::{DtioConfig, MapBackend};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Logical tables of the backing map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    /// filename -> FileStat
    FileDb,
    /// filename -> chunk index of the file
    FileChunkDb,
    /// `filename#offset` -> ChunkMeta
    ChunkDb,
    /// dataspace id -> staged write payload
    DataspaceDb,
    WorkerScore,
    WorkerCapacity,
    /// task id -> completion marker
    WriteFinishedDb,
    CounterDb,
    StagingDb,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::FileDb => "FILE_DB",
            Table::FileChunkDb => "FILE_CHUNK_DB",
            Table::ChunkDb => "CHUNK_DB",
            Table::DataspaceDb => "DATASPACE_DB",
            Table::WorkerScore => "WORKER_SCORE",
            Table::WorkerCapacity => "WORKER_CAPACITY",
            Table::WriteFinishedDb => "WRITE_FINISHED_DB",
            Table::CounterDb => "COUNTER_DB",
            Table::StagingDb => "STAGING_DB",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing group of a key
///
/// `Hashed` is the `"-1"` group: the map picks the server by hashing the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupKey {
    Hashed,
    Server(ServerIndex),
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKey::Hashed => f.write_str("-1"),
            GroupKey::Server(server) => write!(f, "{}", server),
        }
    }
}

impl std::str::FromStr for GroupKey {
    type Err = MapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "-1" => Ok(GroupKey::Hashed),
            other => other
                .parse::<ServerIndex>()
                .map(GroupKey::Server)
                .map_err(|_| MapError::InvalidGroup(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MapError {
    #[error("Map backend not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("Value of {size} bytes exceeds the {max} byte limit")]
    ValueTooLarge { size: usize, max: u64 },

    #[error("Invalid group key: {0}")]
    InvalidGroup(String),

    #[error("Server {server} out of range ({count} servers)")]
    InvalidServer { server: ServerIndex, count: u32 },

    #[error(transparent)]
    Codec(#[from] CodecError),
}

pub type MapResult<T> = Result<T, MapError>;

/// Capability set of a backing map implementation
pub trait DistributedMap: Send + Sync {
    fn put(&self, table: Table, key: &str, value: &[u8], group: GroupKey) -> MapResult<()>;

    fn get(&self, table: Table, key: &str, group: GroupKey) -> MapResult<Option<Vec<u8>>>;

    fn exists(&self, table: Table, key: &str, group: GroupKey) -> MapResult<bool>;

    /// Returns whether the key was present
    fn remove(&self, table: Table, key: &str, group: GroupKey) -> MapResult<bool>;

    /// Creates the counter at 0 unless it already exists
    fn counter_init(&self, table: Table, key: &str, group: GroupKey) -> MapResult<()>;

    /// Atomically increments the counter and returns the value before the increment
    ///
    /// Linearizable across every caller of the same map. A missing counter
    /// starts at 0.
    fn counter_inc(&self, table: Table, key: &str, group: GroupKey) -> MapResult<u64>;

    fn server_count(&self) -> u32;
}

/// Typed helpers on top of the byte-level map
pub trait MapExt {
    fn put_value<T: Serialize>(&self, table: Table, key: &str, value: &T) -> MapResult<()>;

    fn get_value<T: DeserializeOwned>(&self, table: Table, key: &str) -> MapResult<Option<T>>;
}

impl<M: DistributedMap + ?Sized> MapExt for M {
    fn put_value<T: Serialize>(&self, table: Table, key: &str, value: &T) -> MapResult<()> {
        let bytes = codec::encode(value)?;
        self.put(table, key, &bytes, GroupKey::Hashed)
    }

    fn get_value<T: DeserializeOwned>(&self, table: Table, key: &str) -> MapResult<Option<T>> {
        match self.get(table, key, GroupKey::Hashed)? {
            Some(bytes) => Ok(Some(codec::decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

/// Build the map selected by `backend.map`
pub fn connect(config: &DtioConfig) -> MapResult<Arc<dyn DistributedMap>> {
    match config.backend.map {
        MapBackend::InProcess => Ok(Arc::new(InMemoryMap::new(
            config.backend.map_servers,
            config.io.max_io_unit,
        ))),
        MapBackend::RocksDb => Err(MapError::NotImplemented("ROCKSDB")),
        MapBackend::Memcached => Err(MapError::NotImplemented("MEMCACHED")),
        MapBackend::IoWarp => Err(MapError::NotImplemented("IOWARP")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_key_parse() {
        assert_eq!("-1".parse::<GroupKey>().unwrap(), GroupKey::Hashed);
        assert_eq!("3".parse::<GroupKey>().unwrap(), GroupKey::Server(3));
        assert!("x".parse::<GroupKey>().is_err());
        assert_eq!(GroupKey::Hashed.to_string(), "-1");
    }

    #[test]
    fn test_connect_unsupported_backend() {
        let mut config = DtioConfig::default();
        config.backend.map = MapBackend::RocksDb;
        assert!(matches!(
            connect(&config),
            Err(MapError::NotImplemented("ROCKSDB"))
        ));

        config.backend.map = MapBackend::InProcess;
        let map = connect(&config).unwrap();
        assert_eq!(map.server_count(), config.backend.map_servers);
    }

    #[test]
    fn test_typed_values() {
        let map = InMemoryMap::new(2, crate::constants::MAX_IO_UNIT);
        map.put_value(Table::WorkerScore, "workers", &vec![1u32, 2, 3])
            .unwrap();
        let workers: Option<Vec<u32>> = map.get_value(Table::WorkerScore, "workers").unwrap();
        assert_eq!(workers, Some(vec![1, 2, 3]));

        let missing: Option<Vec<u32>> = map.get_value(Table::WorkerScore, "nope").unwrap();
        assert!(missing.is_none());
    }
}
