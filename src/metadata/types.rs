use crate::constants::KEY_SEPARATOR;
use crate::task::{TaskId, Tier, WorkerId, UNASSIGNED};
use serde::{Deserialize, Serialize};

/// オープン済みファイルのハンドル（プロセスローカル）
pub type FileHandle = u64;

/// チャンク番号 (`offset / chunk_size`)
pub type ChunkId = u64;

/// fopen 互換のオープンモード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpenMode {
    /// `r`
    Read,
    /// `r+`
    ReadUpdate,
    /// `w`
    Write,
    /// `w+`
    WriteUpdate,
    /// `a`
    Append,
    /// `a+`
    AppendUpdate,
}

impl OpenMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpenMode::Read => "r",
            OpenMode::ReadUpdate => "r+",
            OpenMode::Write => "w",
            OpenMode::WriteUpdate => "w+",
            OpenMode::Append => "a",
            OpenMode::AppendUpdate => "a+",
        }
    }

    /// 既存の内容を破棄する
    pub fn truncates(&self) -> bool {
        matches!(self, OpenMode::Write | OpenMode::WriteUpdate)
    }

    /// ポインタを末尾に置く
    pub fn appends(&self) -> bool {
        matches!(self, OpenMode::Append | OpenMode::AppendUpdate)
    }

    /// ファイルが無ければ作成する
    pub fn creates(&self) -> bool {
        !matches!(self, OpenMode::Read | OpenMode::ReadUpdate)
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, OpenMode::Read)
    }

    /// 同じファイルを同時に開いてよい組み合わせか
    pub fn is_compatible_with(&self, other: OpenMode) -> bool {
        *self == other || (self.is_read_only() && other.is_read_only())
    }
}

impl std::str::FromStr for OpenMode {
    type Err = super::MetadataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // "rb" / "w+b" などのバイナリ指定は無視する
        let mode: String = s.chars().filter(|c| *c != 'b').collect();
        match mode.as_str() {
            "r" => Ok(OpenMode::Read),
            "r+" => Ok(OpenMode::ReadUpdate),
            "w" => Ok(OpenMode::Write),
            "w+" => Ok(OpenMode::WriteUpdate),
            "a" => Ok(OpenMode::Append),
            "a+" => Ok(OpenMode::AppendUpdate),
            _ => Err(super::MetadataError::InvalidMode(s.to_string())),
        }
    }
}

/// シークの基準位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOrigin {
    Set,
    Cur,
    End,
}

/// ファイル状態 (`file_stat`)
///
/// 同じファイルを複数回オープンした場合もエントリは1つで、`open_count` で数える。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub filename: String,
    pub size: u64,
    /// 現在のファイルポインタ
    pub pointer: u64,
    pub mode: OpenMode,
    pub flags: u32,
    pub open_count: u32,
}

impl FileStat {
    pub fn new(filename: impl Into<String>, mode: OpenMode) -> Self {
        Self {
            filename: filename.into(),
            size: 0,
            pointer: 0,
            mode,
            flags: 0,
            open_count: 0,
        }
    }
}

/// チャンクメタデータ (`chunk_meta`)
///
/// `offset..offset+size` はチャンク内で有効なデータの範囲。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub chunk_id: ChunkId,
    pub filename: String,
    pub offset: u64,
    pub size: u64,
    pub tier: Tier,
    /// データを保持しているワーカー
    #[serde(default = "unassigned")]
    pub worker: WorkerId,
    /// 書き込みデータの DATASPACE キー
    #[serde(default)]
    pub dataspace_id: Option<u64>,
    /// 最後にこのチャンクを書いたタスク（重複適用の検出用）
    #[serde(default)]
    pub task_id: Option<TaskId>,
}

fn unassigned() -> WorkerId {
    UNASSIGNED
}

impl ChunkMeta {
    pub fn new(chunk_id: ChunkId, filename: impl Into<String>, offset: u64, size: u64, tier: Tier) -> Self {
        Self {
            chunk_id,
            filename: filename.into(),
            offset,
            size,
            tier,
            worker: UNASSIGNED,
            dataspace_id: None,
            task_id: None,
        }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// 範囲 `[lo, hi)` に切り詰めたコピー
    pub fn clipped(&self, lo: u64, hi: u64) -> Self {
        let start = self.offset.max(lo);
        let end = self.end().min(hi).max(start);
        Self {
            offset: start,
            size: end - start,
            ..self.clone()
        }
    }
}

/// CHUNK_DB のキー (`filename#base_offset`)
pub fn chunk_key(filename: &str, base_offset: u64) -> String {
    format!("{}{}{}", filename, KEY_SEPARATOR, base_offset)
}
