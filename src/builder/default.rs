use super::{BuilderContext, BuilderError, BuilderResult, TaskBuilder};
use crate::constants::DATASPACE_ID;
use crate::map::{GroupKey, Table};
use crate::task::{FileLocation, Task, TaskError, TaskId, TaskType, Tier};
use tracing::instrument;

/// Chunking builder
///
/// Splits every request on the chunk grid. Write payloads are staged in the
/// DATASPACE table under a fresh `DATASPACE_ID`, and a chunk that already
/// lives on a worker passes that worker on as a hint so rewrites stay put.
pub struct DefaultBuilder {
    ctx: BuilderContext,
}

impl DefaultBuilder {
    pub fn new(ctx: BuilderContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &BuilderContext {
        &self.ctx
    }

    fn next_id(&self) -> BuilderResult<TaskId> {
        Ok(self.ctx.ids.next_id().map_err(TaskError::from)?)
    }

    /// Store a payload and return its dataspace id
    fn stage_payload(&self, payload: &[u8]) -> BuilderResult<u64> {
        let map = self.ctx.metadata.map();
        let id = map.counter_inc(Table::CounterDb, DATASPACE_ID, GroupKey::Hashed)?;
        map.put(Table::DataspaceDb, &id.to_string(), payload, GroupKey::Hashed)?;
        Ok(id)
    }

    fn finish(&self, mut task: Task, publish: bool) -> BuilderResult<Task> {
        task.task_id = self.next_id()?;
        task.publish = publish;
        task.validate(self.ctx.grid.chunk_size())?;
        Ok(task)
    }
}

impl TaskBuilder for DefaultBuilder {
    #[instrument(level = "trace", name = "build_write", skip(self, task, data), fields(file = %task.filename(), offset = task.offset(), len = data.len()))]
    fn build_write_task(&mut self, task: Task, data: &[u8]) -> BuilderResult<Vec<Task>> {
        if task.t_type() != TaskType::Write || task.size() != data.len() as u64 {
            return Err(BuilderError::PayloadMismatch {
                len: data.len(),
                size: task.size(),
            });
        }

        let filename = task.filename().to_string();
        let spans = self.ctx.grid.split(task.offset(), task.size())?;
        let mut tasks = Vec::with_capacity(spans.len());

        for span in spans {
            let existing = self.ctx.metadata.chunk_at(&filename, span.base)?;
            let dataspace_id = self.stage_payload(&data[span.buffer.clone()])?;

            let mut chunk_task = Task::write(filename.clone(), span.offset, span.size);
            chunk_task.source.offset = span.buffer.start as u64;
            chunk_task.dataspace_id = Some(dataspace_id);
            if let Some(chunk) = existing.filter(|c| c.worker >= 0) {
                chunk_task.destination.worker = chunk.worker;
                chunk_task.destination.tier = chunk.tier;
            }

            tasks.push(self.finish(chunk_task, task.publish)?);
        }

        tracing::debug!("Built {} write tasks for {}", tasks.len(), filename);
        Ok(tasks)
    }

    #[instrument(level = "trace", name = "build_read", skip(self, task), fields(file = %task.filename(), offset = task.offset(), size = task.size()))]
    fn build_read_task(&mut self, task: Task) -> BuilderResult<Vec<Task>> {
        task.file_location()
            .end()
            .filter(|_| task.size() > 0)
            .ok_or(BuilderError::InvalidRange {
                offset: task.offset(),
                size: task.size(),
            })?;

        let chunks = self.ctx.metadata.fetch_chunks(&task)?;
        let mut tasks = Vec::with_capacity(chunks.len());

        for chunk in chunks.into_iter().filter(|c| c.size > 0) {
            let mut read = Task::read(chunk.filename.clone(), chunk.offset, chunk.size);
            read.source.tier = chunk.tier;
            read.source.worker = chunk.worker;
            // Position of this piece in the caller's buffer
            read.destination.offset = chunk.offset - task.offset();
            tasks.push(self.finish(read, task.publish)?);
        }

        tracing::debug!("Built {} read tasks for {}", tasks.len(), task.filename());
        Ok(tasks)
    }

    fn build_delete_task(&mut self, task: Task) -> BuilderResult<Vec<Task>> {
        let chunks = self.ctx.metadata.chunks(task.filename())?;
        let mut tasks = Vec::with_capacity(chunks.len());

        for chunk in chunks {
            let mut delete = Task::delete(chunk.filename.clone(), chunk.offset, chunk.size);
            delete.source = FileLocation::new(chunk.filename, chunk.offset, chunk.size, chunk.tier)
                .with_worker(chunk.worker);
            tasks.push(self.finish(delete, task.publish)?);
        }

        Ok(tasks)
    }

    fn build_flush_task(&mut self, task: Task) -> BuilderResult<Vec<Task>> {
        let chunks = self.ctx.metadata.chunks(task.filename())?;
        let mut tasks = Vec::new();

        for chunk in chunks.into_iter().filter(|c| c.worker >= 0 && c.tier != Tier::Pfs) {
            let mut flush = Task::flush(chunk.filename.clone(), chunk.offset, chunk.size);
            flush.source = FileLocation::new(chunk.filename, chunk.offset, chunk.size, chunk.tier)
                .with_worker(chunk.worker);
            tasks.push(self.finish(flush, task.publish)?);
        }

        Ok(tasks)
    }
}
