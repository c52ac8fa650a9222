use super::types::TaskId;
use parking_lot::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Snowflake方式のタスクID生成器
///
/// 64ビットのID構成:
/// - 42ビット: タイムスタンプ（ミリ秒、カスタムエポックからの経過時間）
/// - 10ビット: プロセスID（クライアントのランク、0-1023）
/// - 12ビット: シーケンス番号（同一ミリ秒内で0-4095）
///
/// 同一プロセス内では単調増加し、異なるプロセス間では衝突しない。
/// 複数のクライアントスレッドから共有されるため内部状態はMutexで保護する。
#[derive(Debug)]
pub struct TaskIdGenerator {
    process_id: u64,
    epoch: u64,
    /// (最後にIDを生成したタイムスタンプ, シーケンス番号)
    state: Mutex<(u64, u64)>,
}

/// ID生成エラー
#[derive(Debug, thiserror::Error)]
pub enum IdGeneratorError {
    #[error("Invalid process ID: {0} (must be 0-1023)")]
    InvalidProcessId(u64),

    #[error("Clock moved backwards: last={0}, current={1}")]
    ClockMovedBackwards(u64, u64),
}

pub type IdGeneratorResult<T> = Result<T, IdGeneratorError>;

const TIMESTAMP_BITS: u64 = 42;
const PROCESS_ID_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;

/// Largest process id that fits the id layout
pub const MAX_PROCESS_ID: u64 = (1 << PROCESS_ID_BITS) - 1;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

const PROCESS_ID_SHIFT: u64 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u64 = PROCESS_ID_BITS + SEQUENCE_BITS;

// カスタムエポック: 2024-01-01 00:00:00 UTC
const CUSTOM_EPOCH_MS: u64 = 1704067200000;

impl TaskIdGenerator {
    /// 新しいID生成器を作成
    ///
    /// # Errors
    /// プロセスIDが範囲外の場合
    pub fn new(process_id: u64) -> IdGeneratorResult<Self> {
        if process_id > MAX_PROCESS_ID {
            return Err(IdGeneratorError::InvalidProcessId(process_id));
        }

        Ok(Self {
            process_id,
            epoch: CUSTOM_EPOCH_MS,
            state: Mutex::new((0, 0)),
        })
    }

    /// 次のタスクIDを生成
    pub fn next_id(&self) -> IdGeneratorResult<TaskId> {
        let mut current = self.current_timestamp_ms()?;
        let mut state = self.state.lock();
        let (last, sequence) = &mut *state;

        if current < *last {
            return Err(IdGeneratorError::ClockMovedBackwards(*last, current));
        }

        if current == *last {
            *sequence = (*sequence + 1) & MAX_SEQUENCE;
            if *sequence == 0 {
                // シーケンス枯渇: 次のミリ秒まで待つ
                current = self.wait_next_millis(*last)?;
            }
        } else {
            *sequence = 0;
        }

        *last = current;

        let timestamp_part = (current - self.epoch) << TIMESTAMP_SHIFT;
        let process_part = self.process_id << PROCESS_ID_SHIFT;

        Ok(timestamp_part | process_part | *sequence)
    }

    fn current_timestamp_ms(&self) -> IdGeneratorResult<u64> {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .map_err(|_| IdGeneratorError::ClockMovedBackwards(0, 0))
    }

    fn wait_next_millis(&self, last_timestamp: u64) -> IdGeneratorResult<u64> {
        let mut timestamp = self.current_timestamp_ms()?;
        while timestamp <= last_timestamp {
            std::hint::spin_loop();
            timestamp = self.current_timestamp_ms()?;
        }
        Ok(timestamp)
    }

    pub fn process_id(&self) -> u64 {
        self.process_id
    }

    /// IDから各コンポーネントを抽出（デバッグ用）
    pub fn extract_components(id: TaskId) -> (u64, u64, u64) {
        let timestamp = (id >> TIMESTAMP_SHIFT) & ((1 << TIMESTAMP_BITS) - 1);
        let process_id = (id >> PROCESS_ID_SHIFT) & ((1 << PROCESS_ID_BITS) - 1);
        let sequence = id & ((1 << SEQUENCE_BITS) - 1);

        (timestamp, process_id, sequence)
    }
}
