//! Text encoding of values that cross the map and queue boundaries
//!
//! Tasks, chunk metadata, file stats and worker profiles are stored as JSON so
//! that the contents of the backing map stay human-inspectable.

use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Failed to encode {kind}: {source}")]
    Encode {
        kind: &'static str,
        source: serde_json::Error,
    },

    #[error("Failed to decode {kind}: {source}")]
    Decode {
        kind: &'static str,
        source: serde_json::Error,
    },
}

pub type CodecResult<T> = Result<T, CodecError>;

fn kind_of<T>() -> &'static str {
    let name = std::any::type_name::<T>();
    name.rsplit("::").next().unwrap_or(name)
}

pub fn encode<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|source| CodecError::Encode {
        kind: kind_of::<T>(),
        source,
    })
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    serde_json::from_slice(bytes).map_err(|source| CodecError::Decode {
        kind: kind_of::<T>(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ChunkMeta, FileStat, OpenMode};
    use crate::task::{Task, Tier};

    #[test]
    fn test_chunk_meta_roundtrip() {
        let chunk = ChunkMeta::new(7, "f", 1048576, 2097152, Tier::Cache);
        let bytes = encode(&chunk).unwrap();
        let decoded: ChunkMeta = decode(&bytes).unwrap();
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn test_task_roundtrip_keeps_assignment() {
        let mut task = Task::write("data/out.bin", 4096, 512).with_id(99);
        task.assign_worker(2).unwrap();
        task.dataspace_id = Some(17);
        task.complete();

        let decoded: Task = decode(&encode(&task).unwrap()).unwrap();
        assert_eq!(decoded, task);
    }

    #[test]
    fn test_encoding_is_text() {
        let stat = FileStat::new("f", OpenMode::ReadUpdate);
        let bytes = encode(&stat).unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.contains("\"filename\":\"f\""));
    }

    #[test]
    fn test_decode_error_names_type() {
        let err = decode::<ChunkMeta>(b"{not json").unwrap_err();
        assert!(err.to_string().contains("ChunkMeta"));
    }
}
