use super::ring::{ConsistentHashRing, ServerIndex};
use super::{DistributedMap, GroupKey, MapError, MapResult, Table};
use parking_lot::Mutex;
use std::collections::HashMap;

type EntryKey = (Table, String);

#[derive(Debug, Default)]
struct Shard {
    entries: HashMap<EntryKey, Vec<u8>>,
    counters: HashMap<EntryKey, u64>,
}

/// In-process backing map
///
/// Keys are spread across `servers` shards the same way a multi-server
/// deployment spreads them across map servers: explicit group keys pick the
/// shard, `GroupKey::Hashed` goes through the consistent hash ring. Each shard
/// has its own lock, so every single-key operation (including `counter_inc`)
/// is linearizable.
pub struct InMemoryMap {
    ring: ConsistentHashRing,
    shards: Vec<Mutex<Shard>>,
    max_value_size: u64,
}

impl InMemoryMap {
    pub fn new(servers: u32, max_value_size: u64) -> Self {
        let servers = servers.max(1);
        Self {
            ring: ConsistentHashRing::with_servers(servers),
            shards: (0..servers).map(|_| Mutex::new(Shard::default())).collect(),
            max_value_size,
        }
    }

    fn shard_for(&self, key: &str, group: GroupKey) -> MapResult<&Mutex<Shard>> {
        let server = match group {
            GroupKey::Hashed => self.ring.get_server(key).unwrap_or(0),
            GroupKey::Server(server) => server,
        };

        self.shards
            .get(server as usize)
            .ok_or(MapError::InvalidServer {
                server,
                count: self.shards.len() as u32,
            })
    }

    /// Number of entries held by one shard (counters excluded)
    pub fn shard_len(&self, server: ServerIndex) -> usize {
        self.shards
            .get(server as usize)
            .map(|shard| shard.lock().entries.len())
            .unwrap_or(0)
    }
}

impl DistributedMap for InMemoryMap {
    fn put(&self, table: Table, key: &str, value: &[u8], group: GroupKey) -> MapResult<()> {
        if value.len() as u64 > self.max_value_size {
            return Err(MapError::ValueTooLarge {
                size: value.len(),
                max: self.max_value_size,
            });
        }

        let shard = self.shard_for(key, group)?;
        shard
            .lock()
            .entries
            .insert((table, key.to_string()), value.to_vec());
        tracing::trace!("put {}[{}] ({} bytes)", table, key, value.len());
        Ok(())
    }

    fn get(&self, table: Table, key: &str, group: GroupKey) -> MapResult<Option<Vec<u8>>> {
        let shard = self.shard_for(key, group)?;
        Ok(shard.lock().entries.get(&(table, key.to_string())).cloned())
    }

    fn exists(&self, table: Table, key: &str, group: GroupKey) -> MapResult<bool> {
        let shard = self.shard_for(key, group)?;
        let guard = shard.lock();
        let entry_key = (table, key.to_string());
        Ok(guard.entries.contains_key(&entry_key) || guard.counters.contains_key(&entry_key))
    }

    fn remove(&self, table: Table, key: &str, group: GroupKey) -> MapResult<bool> {
        let shard = self.shard_for(key, group)?;
        let mut guard = shard.lock();
        let entry_key = (table, key.to_string());
        let removed_entry = guard.entries.remove(&entry_key).is_some();
        let removed_counter = guard.counters.remove(&entry_key).is_some();
        Ok(removed_entry || removed_counter)
    }

    fn counter_init(&self, table: Table, key: &str, group: GroupKey) -> MapResult<()> {
        let shard = self.shard_for(key, group)?;
        shard
            .lock()
            .counters
            .entry((table, key.to_string()))
            .or_insert(0);
        Ok(())
    }

    fn counter_inc(&self, table: Table, key: &str, group: GroupKey) -> MapResult<u64> {
        let shard = self.shard_for(key, group)?;
        let mut guard = shard.lock();
        let counter = guard.counters.entry((table, key.to_string())).or_insert(0);
        let previous = *counter;
        *counter = counter.wrapping_add(1);
        Ok(previous)
    }

    fn server_count(&self) -> u32 {
        self.shards.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn map() -> InMemoryMap {
        InMemoryMap::new(4, 1024)
    }

    #[test]
    fn test_put_get_remove() {
        let map = map();
        map.put(Table::FileDb, "a", b"hello", GroupKey::Hashed).unwrap();
        assert!(map.exists(Table::FileDb, "a", GroupKey::Hashed).unwrap());
        assert_eq!(
            map.get(Table::FileDb, "a", GroupKey::Hashed).unwrap(),
            Some(b"hello".to_vec())
        );
        // Same key, different table
        assert!(!map.exists(Table::ChunkDb, "a", GroupKey::Hashed).unwrap());

        assert!(map.remove(Table::FileDb, "a", GroupKey::Hashed).unwrap());
        assert!(!map.remove(Table::FileDb, "a", GroupKey::Hashed).unwrap());
        assert_eq!(map.get(Table::FileDb, "a", GroupKey::Hashed).unwrap(), None);
    }

    #[test]
    fn test_explicit_group() {
        let map = map();
        map.put(Table::StagingDb, "k", b"v", GroupKey::Server(2)).unwrap();
        assert_eq!(map.shard_len(2), 1);
        assert!(matches!(
            map.put(Table::StagingDb, "k", b"v", GroupKey::Server(9)),
            Err(MapError::InvalidServer { server: 9, count: 4 })
        ));
    }

    #[test]
    fn test_value_limit() {
        let map = map();
        let big = vec![0u8; 2048];
        assert!(matches!(
            map.put(Table::DataspaceDb, "1", &big, GroupKey::Hashed),
            Err(MapError::ValueTooLarge { size: 2048, .. })
        ));
    }

    #[test]
    fn test_counter() {
        let map = map();
        map.counter_init(Table::CounterDb, "c", GroupKey::Hashed).unwrap();
        assert_eq!(map.counter_inc(Table::CounterDb, "c", GroupKey::Hashed).unwrap(), 0);
        assert_eq!(map.counter_inc(Table::CounterDb, "c", GroupKey::Hashed).unwrap(), 1);
        // counter_init does not reset an existing counter
        map.counter_init(Table::CounterDb, "c", GroupKey::Hashed).unwrap();
        assert_eq!(map.counter_inc(Table::CounterDb, "c", GroupKey::Hashed).unwrap(), 2);
    }

    #[test]
    fn test_counter_is_linearizable() {
        let map = Arc::new(map());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let map = Arc::clone(&map);
                std::thread::spawn(move || {
                    (0..250)
                        .map(|_| map.counter_inc(Table::CounterDb, "rr", GroupKey::Hashed).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..2000).collect::<Vec<_>>());
    }
}
