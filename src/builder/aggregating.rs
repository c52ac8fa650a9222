use super::default::DefaultBuilder;
use super::{BuilderError, BuilderResult, TaskBuilder};
use crate::task::Task;

/// Writes buffered while aggregation is open
#[derive(Debug)]
struct Aggregation {
    filename: String,
    offset: u64,
    data: Vec<u8>,
    publish: bool,
}

impl Aggregation {
    fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }

    /// The next write continues this buffer without a gap or overlap
    fn continues(&self, task: &Task) -> bool {
        self.filename == task.filename() && self.end() == task.offset()
    }
}

/// Aggregating builder
///
/// Contiguous writes smaller than `min_io_unit` to one file are collected in
/// a staging buffer of at most `max_io_unit` bytes and emitted as chunk tasks
/// once the buffer reaches `min_io_unit`. The buffer is closed before anything
/// that could observe or reorder it: a large write, a write elsewhere, a read
/// of the same file, `flush_file`/`flush`, or a delete of the file.
pub struct AggregatingBuilder {
    inner: DefaultBuilder,
    min_io_unit: u64,
    max_io_unit: u64,
    open: Option<Aggregation>,
}

impl AggregatingBuilder {
    pub fn new(inner: DefaultBuilder, min_io_unit: u64, max_io_unit: u64) -> Self {
        Self {
            inner,
            min_io_unit,
            max_io_unit: max_io_unit.max(min_io_unit),
            open: None,
        }
    }

    /// Bytes currently buffered
    pub fn buffered(&self) -> usize {
        self.open.as_ref().map(|agg| agg.data.len()).unwrap_or(0)
    }

    fn close(&mut self) -> BuilderResult<Vec<Task>> {
        let Some(agg) = self.open.take() else {
            return Ok(Vec::new());
        };

        tracing::debug!(
            "Closing aggregation of {} bytes at {} for {}",
            agg.data.len(),
            agg.offset,
            agg.filename
        );
        let mut template = Task::write(agg.filename, agg.offset, agg.data.len() as u64);
        template.publish = agg.publish;
        self.inner.build_write_task(template, &agg.data)
    }

    fn close_if_file(&mut self, filename: &str) -> BuilderResult<Vec<Task>> {
        match &self.open {
            Some(agg) if agg.filename == filename => self.close(),
            _ => Ok(Vec::new()),
        }
    }
}

impl TaskBuilder for AggregatingBuilder {
    fn build_write_task(&mut self, task: Task, data: &[u8]) -> BuilderResult<Vec<Task>> {
        let len = data.len() as u64;
        if task.size() != len {
            return Err(BuilderError::PayloadMismatch {
                len: data.len(),
                size: task.size(),
            });
        }

        if len >= self.min_io_unit {
            let mut tasks = self.close()?;
            tasks.extend(self.inner.build_write_task(task, data)?);
            return Ok(tasks);
        }

        // 範囲の検証は既存バッファを閉じる前に行う
        self.inner.context().grid.split(task.offset(), len)?;

        let mut tasks = Vec::new();
        let fits = self
            .open
            .as_ref()
            .map(|agg| agg.continues(&task) && agg.data.len() as u64 + len <= self.max_io_unit)
            .unwrap_or(false);
        if !fits {
            tasks.extend(self.close()?);
        }

        match self.open.as_mut() {
            Some(agg) => agg.data.extend_from_slice(data),
            None => {
                self.open = Some(Aggregation {
                    filename: task.filename().to_string(),
                    offset: task.offset(),
                    data: data.to_vec(),
                    publish: task.publish,
                });
            }
        }

        if self.buffered() as u64 >= self.min_io_unit {
            tasks.extend(self.close()?);
        }

        Ok(tasks)
    }

    fn build_read_task(&mut self, task: Task) -> BuilderResult<Vec<Task>> {
        let mut tasks = self.close_if_file(task.filename())?;
        tasks.extend(self.inner.build_read_task(task)?);
        Ok(tasks)
    }

    fn build_delete_task(&mut self, task: Task) -> BuilderResult<Vec<Task>> {
        // Buffered writes of a deleted file are dropped, not emitted
        if matches!(&self.open, Some(agg) if agg.filename == task.filename()) {
            self.open = None;
        }
        self.inner.build_delete_task(task)
    }

    fn build_flush_task(&mut self, task: Task) -> BuilderResult<Vec<Task>> {
        let mut tasks = self.close_if_file(task.filename())?;
        tasks.extend(self.inner.build_flush_task(task)?);
        Ok(tasks)
    }

    fn flush_file(&mut self, filename: &str) -> BuilderResult<Vec<Task>> {
        self.close_if_file(filename)
    }

    fn flush(&mut self) -> BuilderResult<Vec<Task>> {
        self.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::BuilderContext;
    use crate::map::{DistributedMap, InMemoryMap};
    use crate::metadata::{MetadataManager, OpenMode};
    use crate::task::TaskIdGenerator;
    use std::sync::Arc;

    fn builder(chunk_size: u64, min: u64, max: u64) -> AggregatingBuilder {
        let map: Arc<dyn DistributedMap> = Arc::new(InMemoryMap::new(2, 1 << 20));
        let metadata = Arc::new(MetadataManager::new(map, chunk_size));
        metadata.create("f", OpenMode::WriteUpdate).unwrap();
        metadata.create("g", OpenMode::WriteUpdate).unwrap();
        let ids = Arc::new(TaskIdGenerator::new(1).unwrap());
        AggregatingBuilder::new(DefaultBuilder::new(BuilderContext::new(metadata, ids)), min, max)
    }

    fn ranges(tasks: &[Task]) -> Vec<(u64, u64)> {
        tasks.iter().map(|t| (t.offset(), t.size())).collect()
    }

    #[test]
    fn test_small_writes_are_buffered_until_min_unit() {
        let mut builder = builder(4096, 100, 1000);

        for i in 0..3 {
            let tasks = builder
                .build_write_task(Task::write("f", i * 30, 30), &[1u8; 30])
                .unwrap();
            assert!(tasks.is_empty());
        }
        assert_eq!(builder.buffered(), 90);

        let tasks = builder
            .build_write_task(Task::write("f", 90, 30), &[1u8; 30])
            .unwrap();
        assert_eq!(ranges(&tasks), vec![(0, 120)]);
        assert_eq!(builder.buffered(), 0);
    }

    #[test]
    fn test_seek_closes_aggregation() {
        let mut builder = builder(4096, 100, 1000);
        builder
            .build_write_task(Task::write("f", 0, 10), &[1u8; 10])
            .unwrap();

        // 非連続オフセット
        let tasks = builder
            .build_write_task(Task::write("f", 500, 10), &[2u8; 10])
            .unwrap();
        assert_eq!(ranges(&tasks), vec![(0, 10)]);
        assert_eq!(builder.buffered(), 10);
    }

    #[test]
    fn test_other_file_closes_aggregation() {
        let mut builder = builder(4096, 100, 1000);
        builder
            .build_write_task(Task::write("f", 0, 10), &[1u8; 10])
            .unwrap();
        let tasks = builder
            .build_write_task(Task::write("g", 10, 10), &[2u8; 10])
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].filename(), "f");
    }

    #[test]
    fn test_read_closes_aggregation_first() {
        let mut builder = builder(4096, 100, 1000);
        builder
            .build_write_task(Task::write("f", 0, 10), &[1u8; 10])
            .unwrap();

        // 別ファイルの読み込みでは閉じない
        builder.build_read_task(Task::read("g", 0, 10)).unwrap();
        assert_eq!(builder.buffered(), 10);

        let tasks = builder.build_read_task(Task::read("f", 0, 10)).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].t_type(), crate::task::TaskType::Write);
        assert_eq!(builder.buffered(), 0);
    }

    #[test]
    fn test_large_write_flushes_pending_first() {
        let mut builder = builder(4096, 100, 1000);
        builder
            .build_write_task(Task::write("f", 0, 10), &[1u8; 10])
            .unwrap();

        let tasks = builder
            .build_write_task(Task::write("f", 5, 200), &[2u8; 200])
            .unwrap();
        // 重なる範囲でも順序は保たれる
        assert_eq!(ranges(&tasks), vec![(0, 10), (5, 200)]);
        assert!(tasks[0].task_id < tasks[1].task_id);
    }

    #[test]
    fn test_buffer_bounded_by_max_unit() {
        let mut builder = builder(64, 100, 100);
        let tasks = builder
            .build_write_task(Task::write("f", 0, 99), &[1u8; 99])
            .unwrap();
        assert!(tasks.is_empty());

        // 99 + 2 > max_io_unit: 先に閉じてから新しく溜める
        let tasks = builder
            .build_write_task(Task::write("f", 99, 2), &[1u8; 2])
            .unwrap();
        assert_eq!(ranges(&tasks), vec![(0, 64), (64, 35)]);
        assert_eq!(builder.buffered(), 2);

        let tasks = builder.flush().unwrap();
        assert_eq!(ranges(&tasks), vec![(99, 2)]);
    }

    #[test]
    fn test_invalid_small_write() {
        let mut builder = builder(64, 100, 100);
        assert!(matches!(
            builder.build_write_task(Task::write("f", 0, 0), &[]),
            Err(BuilderError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_invalid_write_keeps_open_buffer() {
        let mut builder = builder(4096, 100, 1000);
        builder
            .build_write_task(Task::write("f", 0, 10), &[7u8; 10])
            .unwrap();

        assert!(builder.build_write_task(Task::write("g", 0, 0), &[]).is_err());
        assert_eq!(builder.buffered(), 10);

        let tasks = builder.flush().unwrap();
        assert_eq!(ranges(&tasks), vec![(0, 10)]);
        assert_eq!(tasks[0].filename(), "f");
    }
}
