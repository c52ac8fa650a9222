use crate::constants::{MAX_SCORE, WORKER_CAPACITY_MAX, WORKER_ENERGY, WORKER_SPEED};
use crate::map::{DistributedMap, MapExt, MapResult, Table};
use crate::task::WorkerId;
use serde::{Deserialize, Serialize};

/// ワーカーの性能プロファイル
///
/// ワーカーマネージャーが WORKER_SCORE に書き込み、DP ソルバーが読む。
/// 残り容量だけは WORKER_CAPACITY に別キーで置かれ、あればそちらが優先される。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerProfile {
    pub worker_id: WorkerId,

    /// 1..=5, 大きいほど速い
    pub speed: u32,

    /// 1..=5, 小さいほど省電力
    pub energy: u32,

    /// 残り容量（バイト）
    pub capacity_bytes: u64,

    /// 実行中のタスク数
    pub task_count: u32,

    /// 0..=MAX_SCORE
    pub score: u32,
}

impl WorkerProfile {
    pub fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            speed: WORKER_SPEED,
            energy: WORKER_ENERGY,
            capacity_bytes: WORKER_CAPACITY_MAX,
            task_count: 0,
            score: MAX_SCORE / 2,
        }
    }

    pub fn with_capacity(mut self, capacity_bytes: u64) -> Self {
        self.capacity_bytes = capacity_bytes;
        self
    }

    fn key(worker_id: WorkerId) -> String {
        worker_id.to_string()
    }

    /// Read the stored profile of `worker_id`, falling back to defaults
    pub fn load<M: DistributedMap + ?Sized>(
        map: &M,
        worker_id: WorkerId,
        default_capacity: u64,
    ) -> MapResult<Self> {
        let key = Self::key(worker_id);
        let mut profile = map
            .get_value::<WorkerProfile>(Table::WorkerScore, &key)?
            .unwrap_or_else(|| Self::new(worker_id).with_capacity(default_capacity));
        profile.worker_id = worker_id;

        if let Some(capacity) = map.get_value::<u64>(Table::WorkerCapacity, &key)? {
            profile.capacity_bytes = capacity;
        }
        Ok(profile)
    }

    pub fn store<M: DistributedMap + ?Sized>(&self, map: &M) -> MapResult<()> {
        map.put_value(Table::WorkerScore, &Self::key(self.worker_id), self)?;
        Self::store_capacity(map, self.worker_id, self.capacity_bytes)
    }

    /// Update only the remaining capacity of `worker_id`
    pub fn store_capacity<M: DistributedMap + ?Sized>(
        map: &M,
        worker_id: WorkerId,
        capacity_bytes: u64,
    ) -> MapResult<()> {
        map.put_value(Table::WorkerCapacity, &Self::key(worker_id), &capacity_bytes)
    }
}
