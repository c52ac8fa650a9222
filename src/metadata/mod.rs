// メタデータ管理モジュール
pub mod manager;
pub mod types;

pub use manager::{MetadataError, MetadataManager, MetadataResult};
pub use types::{chunk_key, ChunkId, ChunkMeta, FileHandle, FileStat, OpenMode, SeekOrigin};
