//! Application-facing file API
//!
//! [`DtioClient`] turns stdio-style calls into tasks: the builder splits the
//! request, the metadata manager tracks pointer and size, and the tasks go to
//! the client queue for the scheduler. Writes are synchronous unless
//! `system.async_writes` is set; reads always wait for their data.

use crate::builder::{self, BuilderContext, BuilderError, TaskBuilder};
use crate::constants::MAX_COMPLETION_WAIT_MS;
use crate::map::{GroupKey, MapError, Table};
use crate::metadata::{FileHandle, MetadataError, MetadataManager, OpenMode, SeekOrigin};
use crate::queue::QueueError;
use crate::system::DtioSystem;
use crate::task::{Task, TaskId, TaskType};
use crate::worker::read_result_key;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::instrument;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Builder(#[from] BuilderError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Map(#[from] MapError),

    #[error("Handle {0} is not open for writing")]
    NotWritable(FileHandle),

    #[error("{pending} tasks still pending after {waited:?}")]
    Timeout { pending: usize, waited: Duration },
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Write tasks submitted but not yet confirmed
#[derive(Debug, Clone, Default)]
pub struct PendingWrite {
    pub task_ids: Vec<TaskId>,
    pub bytes: usize,
}

/// Read tasks submitted, waiting for their data
#[derive(Debug, Clone)]
pub struct PendingRead {
    filename: String,
    tasks: Vec<Task>,
    bytes: usize,
}

impl PendingRead {
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

pub struct DtioClient {
    system: Arc<DtioSystem>,
    builder: Box<dyn TaskBuilder>,
    async_writes: bool,
    timeout: Duration,
}

impl DtioClient {
    pub fn new(system: Arc<DtioSystem>) -> Self {
        let ctx = BuilderContext::new(Arc::clone(system.metadata()), Arc::clone(system.ids()));
        let builder = builder::from_policy(system.config(), ctx);
        let async_writes = system.config().system.async_writes;

        Self {
            system,
            builder,
            async_writes,
            timeout: Duration::from_millis(MAX_COMPLETION_WAIT_MS),
        }
    }

    /// Bound on every wait for worker completion
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn metadata(&self) -> &Arc<MetadataManager> {
        self.system.metadata()
    }

    /// Open `filename` with an fopen-style mode string
    ///
    /// Missing files are created unless the mode is `r`/`r+`. Opening an
    /// existing file with `w`/`w+` deletes its chunks on the workers.
    #[instrument(level = "trace", name = "client_open", skip(self))]
    pub fn open(&mut self, filename: &str, mode: &str) -> ClientResult<FileHandle> {
        let mode: OpenMode = mode.parse()?;
        let metadata = Arc::clone(self.metadata());

        if !metadata.is_created(filename)? {
            if !mode.creates() {
                return Err(MetadataError::UnknownFile(filename.to_string()).into());
            }
            return Ok(metadata.create(filename, mode)?);
        }

        if mode.truncates() {
            self.discard(filename)?;
        }
        Ok(metadata.update_on_open(filename, mode)?)
    }

    pub fn close(&mut self, handle: FileHandle) -> ClientResult<()> {
        let filename = self.metadata().get_filename(handle)?;
        self.flush_file(&filename)?;
        Ok(self.metadata().update_on_close(handle)?)
    }

    pub fn write(&mut self, handle: FileHandle, data: &[u8]) -> ClientResult<usize> {
        let pending = self.write_async(handle, data)?;
        if self.async_writes {
            return Ok(pending.bytes);
        }
        self.write_wait(pending)
    }

    /// Submit a write without waiting for the workers
    #[instrument(level = "trace", name = "client_write", skip(self, data), fields(len = data.len()))]
    pub fn write_async(&mut self, handle: FileHandle, data: &[u8]) -> ClientResult<PendingWrite> {
        let filename = self.metadata().get_filename(handle)?;
        let mode = self.metadata().get_handle_mode(handle)?;
        if mode.is_read_only() {
            return Err(ClientError::NotWritable(handle));
        }
        if data.is_empty() {
            return Ok(PendingWrite::default());
        }

        let offset = if mode.appends() {
            self.metadata().get_filesize(&filename)?
        } else {
            self.metadata().get_fp(&filename)?
        };
        let len = data.len() as u64;

        let tasks = self
            .builder
            .build_write_task(Task::write(filename.as_str(), offset, len), data)?;
        self.metadata().update_on_write(&filename, len, offset)?;
        let task_ids = self.submit(tasks)?;

        Ok(PendingWrite {
            task_ids,
            bytes: data.len(),
        })
    }

    /// Wait until every task of `pending` was executed
    pub fn write_wait(&self, pending: PendingWrite) -> ClientResult<usize> {
        self.wait(&pending.task_ids)?;
        Ok(pending.bytes)
    }

    pub fn read(&mut self, handle: FileHandle, buf: &mut [u8]) -> ClientResult<usize> {
        let pending = self.read_async(handle, buf.len())?;
        self.read_wait(pending, buf)
    }

    /// Submit reads of up to `len` bytes at the file pointer
    #[instrument(level = "trace", name = "client_read", skip(self))]
    pub fn read_async(&mut self, handle: FileHandle, len: usize) -> ClientResult<PendingRead> {
        let filename = self.metadata().get_filename(handle)?;
        self.flush_file(&filename)?;

        let pointer = self.metadata().get_fp(&filename)?;
        let size = self.metadata().get_filesize(&filename)?;
        let bytes = (len as u64).min(size.saturating_sub(pointer));
        if bytes == 0 {
            return Ok(PendingRead {
                filename,
                tasks: Vec::new(),
                bytes: 0,
            });
        }

        let tasks = self
            .builder
            .build_read_task(Task::read(filename.as_str(), pointer, bytes))?;
        self.submit(tasks.clone())?;

        Ok(PendingRead {
            filename,
            tasks: tasks
                .into_iter()
                .filter(|t| t.t_type() == TaskType::Read)
                .collect(),
            bytes: bytes as usize,
        })
    }

    /// Collect the data of `pending` into `buf` and advance the pointer
    pub fn read_wait(&self, pending: PendingRead, buf: &mut [u8]) -> ClientResult<usize> {
        let map = self.system.map();
        let mut copied = 0;

        for task in &pending.tasks {
            let key = read_result_key(task.task_id);
            let data = self.wait_for_value(Table::DataspaceDb, &key)?;
            map.remove(Table::DataspaceDb, &key, GroupKey::Hashed)?;

            let start = task.destination.offset as usize;
            let end = (start + data.len()).min(buf.len());
            if start < end {
                buf[start..end].copy_from_slice(&data[..end - start]);
                copied += end - start;
            }
        }

        self.metadata()
            .update_read_task_info(&pending.tasks, &pending.filename)?;
        tracing::debug!("Read {} bytes of {}", copied, pending.filename);
        Ok(copied)
    }

    /// Move the file pointer; returns the new position
    ///
    /// Seeks on append-mode handles are ignored, like seeks outside the file.
    pub fn seek(&mut self, handle: FileHandle, offset: i64, origin: SeekOrigin) -> ClientResult<u64> {
        let filename = self.metadata().get_filename(handle)?;
        self.flush_file(&filename)?;

        if self.metadata().get_handle_mode(handle)?.appends() {
            return Ok(self.metadata().get_fp(&filename)?);
        }
        Ok(self.metadata().update_on_seek(&filename, offset, origin)?)
    }

    pub fn tell(&self, handle: FileHandle) -> ClientResult<u64> {
        let filename = self.metadata().get_filename(handle)?;
        Ok(self.metadata().get_fp(&filename)?)
    }

    /// Delete the file and its chunks
    pub fn remove(&mut self, filename: &str) -> ClientResult<()> {
        self.discard(filename)?;
        Ok(self.metadata().update_on_delete(filename)?)
    }

    /// Close every open aggregation and wait for those writes
    pub fn flush(&mut self) -> ClientResult<()> {
        let tasks = self.builder.flush()?;
        let ids = self.submit(tasks)?;
        self.wait(&ids)
    }

    /// Push the file's chunks down to the backing filesystem
    pub fn fsync(&mut self, handle: FileHandle) -> ClientResult<()> {
        let filename = self.metadata().get_filename(handle)?;
        self.flush_file(&filename)?;

        let tasks = self
            .builder
            .build_flush_task(Task::flush(filename.as_str(), 0, 0))?;
        let ids = self.submit(tasks)?;
        self.wait(&ids)
    }

    fn flush_file(&mut self, filename: &str) -> ClientResult<()> {
        let tasks = self.builder.flush_file(filename)?;
        if tasks.is_empty() {
            return Ok(());
        }
        let ids = self.submit(tasks)?;
        self.wait(&ids)
    }

    /// Delete every chunk of `filename` that lives on a worker
    fn discard(&mut self, filename: &str) -> ClientResult<()> {
        let (held, orphaned): (Vec<Task>, Vec<Task>) = self
            .builder
            .build_delete_task(Task::delete(filename, 0, 0))?
            .into_iter()
            .partition(|t| t.source.is_assigned());
        if !orphaned.is_empty() {
            tracing::debug!("{} chunks of {} have no worker", orphaned.len(), filename);
        }

        let ids = self.submit(held)?;
        if self.async_writes {
            return Ok(());
        }
        self.wait(&ids)
    }

    fn submit(&self, tasks: Vec<Task>) -> ClientResult<Vec<TaskId>> {
        let queue = self.system.queues().client();
        let mut ids = Vec::with_capacity(tasks.len());
        for task in tasks {
            ids.push(task.task_id);
            queue.publish_task(task)?;
        }
        Ok(ids)
    }

    fn wait(&self, task_ids: &[TaskId]) -> ClientResult<()> {
        if task_ids.is_empty() {
            return Ok(());
        }
        if self.metadata().wait_for_completion(task_ids, self.timeout)? {
            return Ok(());
        }

        let pending = task_ids
            .iter()
            .filter(|id| !self.metadata().is_completed(**id).unwrap_or(false))
            .count();
        Err(ClientError::Timeout {
            pending,
            waited: self.timeout,
        })
    }

    fn wait_for_value(&self, table: Table, key: &str) -> ClientResult<Vec<u8>> {
        let map = self.system.map();
        let deadline = Instant::now() + self.timeout;
        let mut backoff = Duration::from_micros(100);

        loop {
            if let Some(value) = map.get(table, key, GroupKey::Hashed)? {
                return Ok(value);
            }
            if Instant::now() >= deadline {
                return Err(ClientError::Timeout {
                    pending: 1,
                    waited: self.timeout,
                });
            }
            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(Duration::from_millis(10));
        }
    }
}
