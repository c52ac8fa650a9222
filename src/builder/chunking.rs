use super::{BuilderError, BuilderResult};
use std::ops::Range;

/// チャンク境界で切り出した範囲
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpan {
    /// チャンク番号
    pub index: u64,

    /// チャンク先頭のオフセット
    pub base: u64,

    /// ファイル上の開始オフセット
    pub offset: u64,

    pub size: u64,

    /// 入力バッファ内の範囲
    pub buffer: Range<usize>,
}

impl ChunkSpan {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// チャンク全体を覆っているか
    pub fn is_full(&self, chunk_size: u64) -> bool {
        self.offset == self.base && self.size == chunk_size
    }
}

/// 固定サイズのチャンクグリッド
///
/// 先頭と末尾のチャンクはチャンク内の途中から/途中までの部分範囲になる。
#[derive(Debug, Clone, Copy)]
pub struct ChunkGrid {
    chunk_size: u64,
}

impl ChunkGrid {
    pub fn new(chunk_size: u64) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// オフセットを含むチャンク番号
    pub fn index_of(&self, offset: u64) -> u64 {
        offset / self.chunk_size
    }

    /// オフセットを含むチャンクの先頭
    pub fn base_of(&self, offset: u64) -> u64 {
        offset - offset % self.chunk_size
    }

    /// `[offset, offset + length)` をチャンク境界で分割する
    ///
    /// `length == 0` や終端のオーバーフローは `InvalidRange`。
    pub fn split(&self, offset: u64, length: u64) -> BuilderResult<Vec<ChunkSpan>> {
        let end = offset
            .checked_add(length)
            .filter(|_| length > 0)
            .ok_or(BuilderError::InvalidRange {
                offset,
                size: length,
            })?;

        let mut spans = Vec::with_capacity(((length / self.chunk_size) + 2) as usize);
        let mut cursor = offset;
        while cursor < end {
            let base = self.base_of(cursor);
            let stop = base.saturating_add(self.chunk_size).min(end);
            let start_in_buffer = (cursor - offset) as usize;
            let stop_in_buffer = (stop - offset) as usize;

            spans.push(ChunkSpan {
                index: self.index_of(cursor),
                base,
                offset: cursor,
                size: stop - cursor,
                buffer: start_in_buffer..stop_in_buffer,
            });
            cursor = stop;
        }

        Ok(spans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_split_aligned() {
        let grid = ChunkGrid::new(2 * MIB);
        let spans = grid.split(0, 5 * MIB).unwrap();

        let ranges: Vec<(u64, u64)> = spans.iter().map(|s| (s.offset, s.end())).collect();
        assert_eq!(ranges, vec![(0, 2 * MIB), (2 * MIB, 4 * MIB), (4 * MIB, 5 * MIB)]);
        assert!(spans[0].is_full(2 * MIB));
        assert!(!spans[2].is_full(2 * MIB));
        assert_eq!(spans[2].buffer, (4 * MIB) as usize..(5 * MIB) as usize);
    }

    #[test]
    fn test_split_unaligned() {
        let grid = ChunkGrid::new(100);
        let spans = grid.split(150, 200).unwrap();

        let ranges: Vec<(u64, u64, u64)> = spans
            .iter()
            .map(|s| (s.index, s.offset, s.size))
            .collect();
        assert_eq!(ranges, vec![(1, 150, 50), (2, 200, 100), (3, 300, 50)]);
        assert_eq!(spans[0].base, 100);
        assert_eq!(spans[1].buffer, 50..150);
    }

    #[test]
    fn test_split_within_one_chunk() {
        let grid = ChunkGrid::new(100);
        let spans = grid.split(10, 20).unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!((spans[0].offset, spans[0].size), (10, 20));
    }

    #[test]
    fn test_split_invalid() {
        let grid = ChunkGrid::new(100);
        assert!(matches!(
            grid.split(0, 0),
            Err(BuilderError::InvalidRange { offset: 0, size: 0 })
        ));
        assert!(grid.split(u64::MAX - 1, 10).is_err());
    }
}
