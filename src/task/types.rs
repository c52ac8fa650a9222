use serde::{Deserialize, Serialize};

/// タスクID（プロセス内で単調増加）
pub type TaskId = u64;

/// ワーカーID。有効値は `1..=num_workers`、未割り当ては [`UNASSIGNED`]
pub type WorkerId = i32;

/// 未割り当てのワーカー / ハッシュ配置のサーバー
pub const UNASSIGNED: WorkerId = -1;

/// タスク種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Read,
    Write,
    Delete,
    Flush,
    Staging,
    Dummy,
}

impl TaskType {
    /// Delete/Flush は既存の配置先でしか実行できない
    pub fn requires_source_worker(&self) -> bool {
        matches!(self, TaskType::Delete | TaskType::Flush)
    }
}

/// データの配置階層
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    Buffers,
    Cache,
    Pfs,
}

/// タスクの送り元/送り先
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLocation {
    pub filename: String,
    pub offset: u64,
    pub size: u64,
    pub tier: Tier,
    /// 担当ワーカー（`-1` = 未割り当て）
    pub worker: WorkerId,
    /// マップのサーバー（`-1` = ハッシュで決定）
    pub server: i32,
}

impl FileLocation {
    pub fn new(filename: impl Into<String>, offset: u64, size: u64, tier: Tier) -> Self {
        Self {
            filename: filename.into(),
            offset,
            size,
            tier,
            worker: UNASSIGNED,
            server: UNASSIGNED,
        }
    }

    pub fn with_worker(mut self, worker: WorkerId) -> Self {
        self.worker = worker;
        self
    }

    pub fn is_assigned(&self) -> bool {
        self.worker >= 0
    }

    /// 範囲の終端（オーバーフロー時は `None`）
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.size)
    }
}

/// タスクの状態。Pending → Completed の一方向のみ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Completed,
}

/// タスクエラー
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {task_id} already assigned to worker {worker}")]
    AlreadyAssigned { task_id: TaskId, worker: WorkerId },

    #[error("Invalid range: offset={offset}, size={size}")]
    InvalidRange { offset: u64, size: u64 },

    #[error("Task of {size} bytes exceeds chunk size {chunk_size}")]
    ChunkOverflow { size: u64, chunk_size: u64 },

    #[error("Task id generation failed: {0}")]
    Id(#[from] super::id::IdGeneratorError),
}

pub type TaskResult<T> = Result<T, TaskError>;

/// スケジューリング単位のI/Oタスク
///
/// 値型としてキューを渡る。`publish_task` で送信側のコピーは消費され、
/// 受信側はデシリアライズされた新しい値を受け取る。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    t_type: TaskType,
    pub source: FileLocation,
    pub destination: FileLocation,
    status: TaskStatus,
    /// 完了時にワーカーが結果を公開するか
    pub publish: bool,
    /// メタデータマネージャーが配置を記録済みか
    pub meta_updated: bool,
    /// Write タスクのペイロードを置いた DATASPACE キー
    #[serde(default)]
    pub dataspace_id: Option<u64>,
}

impl Task {
    pub fn new(t_type: TaskType, source: FileLocation, destination: FileLocation) -> Self {
        Self {
            task_id: 0,
            t_type,
            source,
            destination,
            status: TaskStatus::Pending,
            publish: false,
            meta_updated: false,
            dataspace_id: None,
        }
    }

    /// クライアントのバッファからファイル範囲への書き込み
    pub fn write(filename: impl Into<String>, offset: u64, size: u64) -> Self {
        let filename = filename.into();
        Self::new(
            TaskType::Write,
            FileLocation::new(filename.clone(), 0, size, Tier::Buffers),
            FileLocation::new(filename, offset, size, Tier::Buffers),
        )
    }

    /// ファイル範囲からクライアントのバッファへの読み込み
    pub fn read(filename: impl Into<String>, offset: u64, size: u64) -> Self {
        let filename = filename.into();
        Self::new(
            TaskType::Read,
            FileLocation::new(filename.clone(), offset, size, Tier::Pfs),
            FileLocation::new(filename, 0, size, Tier::Buffers),
        )
    }

    pub fn delete(filename: impl Into<String>, offset: u64, size: u64) -> Self {
        let filename = filename.into();
        Self::new(
            TaskType::Delete,
            FileLocation::new(filename.clone(), offset, size, Tier::Buffers),
            FileLocation::new(filename, offset, size, Tier::Pfs),
        )
    }

    pub fn flush(filename: impl Into<String>, offset: u64, size: u64) -> Self {
        let filename = filename.into();
        Self::new(
            TaskType::Flush,
            FileLocation::new(filename.clone(), offset, size, Tier::Buffers),
            FileLocation::new(filename, offset, size, Tier::Pfs),
        )
    }

    /// PFS からバッファ階層への先読み
    pub fn staging(filename: impl Into<String>, offset: u64, size: u64) -> Self {
        let filename = filename.into();
        Self::new(
            TaskType::Staging,
            FileLocation::new(filename.clone(), offset, size, Tier::Pfs),
            FileLocation::new(filename, offset, size, Tier::Buffers),
        )
    }

    pub fn with_id(mut self, task_id: TaskId) -> Self {
        self.task_id = task_id;
        self
    }

    pub fn t_type(&self) -> TaskType {
        self.t_type
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    /// 完了にする。既に完了していれば `false`
    pub fn complete(&mut self) -> bool {
        if self.status == TaskStatus::Completed {
            return false;
        }
        self.status = TaskStatus::Completed;
        true
    }

    /// ファイル側の位置（Write は送り先、それ以外は送り元）
    pub fn file_location(&self) -> &FileLocation {
        match self.t_type {
            TaskType::Write => &self.destination,
            _ => &self.source,
        }
    }

    fn file_location_mut(&mut self) -> &mut FileLocation {
        match self.t_type {
            TaskType::Write => &mut self.destination,
            _ => &mut self.source,
        }
    }

    pub fn filename(&self) -> &str {
        &self.file_location().filename
    }

    pub fn offset(&self) -> u64 {
        self.file_location().offset
    }

    pub fn size(&self) -> u64 {
        self.file_location().size
    }

    /// 既存データの配置を示すワーカーヒント
    pub fn hinted_worker(&self) -> Option<WorkerId> {
        let location = self.file_location();
        location.is_assigned().then_some(location.worker)
    }

    /// ソルバーが決めたワーカーを設定する（一度だけ）
    pub fn assign_worker(&mut self, worker: WorkerId) -> TaskResult<()> {
        let task_id = self.task_id;
        let location = self.file_location_mut();
        if location.is_assigned() {
            return Err(TaskError::AlreadyAssigned {
                task_id,
                worker: location.worker,
            });
        }
        location.worker = worker;
        Ok(())
    }

    /// キュー投入前の範囲チェック
    pub fn validate(&self, chunk_size: u64) -> TaskResult<()> {
        let location = self.file_location();
        if location.size == 0 || location.end().is_none() {
            return Err(TaskError::InvalidRange {
                offset: location.offset,
                size: location.size,
            });
        }
        if location.size > chunk_size {
            return Err(TaskError::ChunkOverflow {
                size: location.size,
                chunk_size,
            });
        }
        Ok(())
    }
}
