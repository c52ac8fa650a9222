use super::types::{chunk_key, ChunkMeta, FileHandle, FileStat, OpenMode, SeekOrigin};
use crate::constants::DTIO_FILENAME_MAX;
use crate::map::{DistributedMap, GroupKey, MapError, MapExt, Table};
use crate::task::{Task, TaskId, TaskType, Tier};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::instrument;

/// 適用済みタスクIDを覚えておく件数
pub const APPLIED_TASK_CACHE_ENTRIES: usize = 4096;

/// メタデータ管理エラー
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("Unknown file: {0}")]
    UnknownFile(String),

    #[error("Unknown file handle: {0}")]
    UnknownHandle(FileHandle),

    #[error("Failed to create {filename}: {reason}")]
    CreateFailed { filename: String, reason: String },

    #[error("Failed to close handle {0}")]
    FcloseFailed(FileHandle),

    #[error("Failed to update file pointer of {0}")]
    UpdateOnFseekFailed(String),

    #[error("Write task {task_id} range overflows: offset={offset}, size={size}")]
    UpdateOnWriteFailed { task_id: TaskId, offset: u64, size: u64 },

    #[error("Filename of {len} bytes exceeds {max}")]
    FilenameTooLong { len: usize, max: usize },

    #[error("Invalid open mode: {0}")]
    InvalidMode(String),

    #[error(transparent)]
    Map(#[from] MapError),
}

pub type MetadataResult<T> = Result<T, MetadataError>;

#[derive(Debug, Clone)]
struct OpenHandle {
    filename: String,
    mode: OpenMode,
}

/// メタデータマネージャー
///
/// ファイルの存在、オープン状態、チャンク配置の唯一の管理者。
/// `file_stat` と `chunk_meta` はすべてバッキングマップ上に置き、
/// ハンドル表だけをプロセスローカルに持つ。
///
/// 同一プロセス内の `file_stat` の read-modify-write は `stat_lock` で直列化する。
/// キーをまたぐ更新（サイズ拡張とチャンク登録）はアトミックではない。
pub struct MetadataManager {
    map: Arc<dyn DistributedMap>,
    chunk_size: u64,
    handles: Mutex<HashMap<FileHandle, OpenHandle>>,
    next_handle: AtomicU64,
    stat_lock: Mutex<()>,
    /// 適用済みのタスクID
    applied: Mutex<LruCache<TaskId, ()>>,
}

impl MetadataManager {
    pub fn new(map: Arc<dyn DistributedMap>, chunk_size: u64) -> Self {
        Self::with_applied_capacity(map, chunk_size, APPLIED_TASK_CACHE_ENTRIES)
    }

    pub fn with_applied_capacity(
        map: Arc<dyn DistributedMap>,
        chunk_size: u64,
        capacity: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            map,
            chunk_size,
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            stat_lock: Mutex::new(()),
            applied: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn map(&self) -> &Arc<dyn DistributedMap> {
        &self.map
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    fn check_filename(filename: &str) -> MetadataResult<()> {
        if filename.len() > DTIO_FILENAME_MAX {
            return Err(MetadataError::FilenameTooLong {
                len: filename.len(),
                max: DTIO_FILENAME_MAX,
            });
        }
        Ok(())
    }

    fn load_stat(&self, filename: &str) -> MetadataResult<Option<FileStat>> {
        Ok(self.map.get_value(Table::FileDb, filename)?)
    }

    fn require_stat(&self, filename: &str) -> MetadataResult<FileStat> {
        self.load_stat(filename)?
            .ok_or_else(|| MetadataError::UnknownFile(filename.to_string()))
    }

    fn store_stat(&self, stat: &FileStat) -> MetadataResult<()> {
        Ok(self.map.put_value(Table::FileDb, &stat.filename, stat)?)
    }

    /// `file_stat` を読み込んで更新し、書き戻す
    fn modify_stat<R>(
        &self,
        filename: &str,
        f: impl FnOnce(&mut FileStat) -> R,
    ) -> MetadataResult<R> {
        let _guard = self.stat_lock.lock();
        let mut stat = self.require_stat(filename)?;
        let result = f(&mut stat);
        self.store_stat(&stat)?;
        Ok(result)
    }

    pub fn get_stat(&self, filename: &str) -> MetadataResult<FileStat> {
        self.require_stat(filename)
    }

    pub fn is_created(&self, filename: &str) -> MetadataResult<bool> {
        Ok(self.map.exists(Table::FileDb, filename, GroupKey::Hashed)?)
    }

    /// ファイルを作成してオープンする
    ///
    /// 既に別のモードでオープンされていて両立しない場合は `CreateFailed`。
    #[instrument(level = "trace", name = "metadata_create", skip(self))]
    pub fn create(&self, filename: &str, mode: OpenMode) -> MetadataResult<FileHandle> {
        Self::check_filename(filename)?;

        {
            let _guard = self.stat_lock.lock();
            match self.load_stat(filename)? {
                Some(stat) if stat.open_count > 0 && !stat.mode.is_compatible_with(mode) => {
                    return Err(MetadataError::CreateFailed {
                        filename: filename.to_string(),
                        reason: format!(
                            "already open with mode {} (requested {})",
                            stat.mode.as_str(),
                            mode.as_str()
                        ),
                    });
                }
                Some(_) => {}
                None => {
                    self.store_stat(&FileStat::new(filename, mode))
                        .map_err(|e| MetadataError::CreateFailed {
                            filename: filename.to_string(),
                            reason: e.to_string(),
                        })?;
                    tracing::debug!("Created file stat for {}", filename);
                }
            }
        }

        self.update_on_open(filename, mode)
    }

    pub fn is_opened(&self, filename: &str) -> MetadataResult<bool> {
        Ok(self
            .load_stat(filename)?
            .map(|stat| stat.open_count > 0)
            .unwrap_or(false))
    }

    pub fn is_handle_opened(&self, handle: FileHandle) -> bool {
        self.handles.lock().contains_key(&handle)
    }

    /// オープンを記録してハンドルを返す
    ///
    /// - `w`/`w+`: サイズを0にしてチャンクを破棄
    /// - `a`/`a+`: ポインタを末尾へ
    /// - `r`/`r+`: ポインタを先頭へ（存在しなければ `UnknownFile`）
    #[instrument(level = "trace", name = "metadata_open", skip(self))]
    pub fn update_on_open(&self, filename: &str, mode: OpenMode) -> MetadataResult<FileHandle> {
        Self::check_filename(filename)?;

        let truncated = {
            let _guard = self.stat_lock.lock();
            let mut stat = match self.load_stat(filename)? {
                Some(stat) => stat,
                None if mode.creates() => FileStat::new(filename, mode),
                None => return Err(MetadataError::UnknownFile(filename.to_string())),
            };

            stat.open_count += 1;
            stat.mode = mode;
            let truncated = mode.truncates();
            if truncated {
                stat.size = 0;
                stat.pointer = 0;
            } else if mode.appends() {
                stat.pointer = stat.size;
            } else {
                stat.pointer = 0;
            }
            self.store_stat(&stat)?;
            truncated
        };

        if truncated {
            self.remove_chunks(filename)?;
        }

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().insert(
            handle,
            OpenHandle {
                filename: filename.to_string(),
                mode,
            },
        );
        tracing::debug!("Opened {} as handle {} ({})", filename, handle, mode.as_str());

        Ok(handle)
    }

    /// クローズを記録する。未知のハンドルは `FcloseFailed`
    #[instrument(level = "trace", name = "metadata_close", skip(self))]
    pub fn update_on_close(&self, handle: FileHandle) -> MetadataResult<()> {
        let entry = self
            .handles
            .lock()
            .remove(&handle)
            .ok_or(MetadataError::FcloseFailed(handle))?;

        let _guard = self.stat_lock.lock();
        // 削除済みのファイルなら何もしない
        if let Some(mut stat) = self.load_stat(&entry.filename)? {
            stat.open_count = stat.open_count.saturating_sub(1);
            self.store_stat(&stat)?;
            tracing::debug!(
                "Closed handle {} of {} (open_count={})",
                handle,
                entry.filename,
                stat.open_count
            );
        }

        Ok(())
    }

    /// ファイルポインタを更新して新しい位置を返す
    ///
    /// 移動先が `[0, size]` の外なら無視してポインタを変えない。
    #[instrument(level = "trace", name = "metadata_seek", skip(self))]
    pub fn update_on_seek(
        &self,
        filename: &str,
        offset: i64,
        origin: SeekOrigin,
    ) -> MetadataResult<u64> {
        self.modify_stat(filename, |stat| {
            let base = match origin {
                SeekOrigin::Set => 0,
                SeekOrigin::Cur => stat.pointer as i128,
                SeekOrigin::End => stat.size as i128,
            };
            let target = base + offset as i128;

            if target < 0 || target > stat.size as i128 {
                tracing::warn!(
                    "Ignoring seek of {} to {} (size {})",
                    stat.filename,
                    target,
                    stat.size
                );
            } else {
                stat.pointer = target as u64;
            }
            stat.pointer
        })
        .map_err(|e| match e {
            MetadataError::UnknownFile(name) => MetadataError::UpdateOnFseekFailed(name),
            other => other,
        })
    }

    /// 読み込み分だけポインタを進める
    pub fn update_on_read(&self, filename: &str, size: u64) -> MetadataResult<u64> {
        self.modify_stat(filename, |stat| {
            stat.pointer = stat.pointer.saturating_add(size);
            stat.pointer
        })
    }

    /// 書き込みを反映する（ポインタ移動とサイズ拡張）
    pub fn update_on_write(&self, filename: &str, size: u64, offset: u64) -> MetadataResult<u64> {
        self.modify_stat(filename, |stat| {
            let end = offset.saturating_add(size);
            stat.pointer = end;
            stat.size = stat.size.max(end);
            stat.pointer
        })
    }

    pub fn get_filename(&self, handle: FileHandle) -> MetadataResult<String> {
        self.handles
            .lock()
            .get(&handle)
            .map(|entry| entry.filename.clone())
            .ok_or(MetadataError::UnknownHandle(handle))
    }

    pub fn get_handle_mode(&self, handle: FileHandle) -> MetadataResult<OpenMode> {
        self.handles
            .lock()
            .get(&handle)
            .map(|entry| entry.mode)
            .ok_or(MetadataError::UnknownHandle(handle))
    }

    pub fn get_filesize(&self, filename: &str) -> MetadataResult<u64> {
        Ok(self.require_stat(filename)?.size)
    }

    pub fn get_mode(&self, filename: &str) -> MetadataResult<OpenMode> {
        Ok(self.require_stat(filename)?.mode)
    }

    pub fn get_fp(&self, filename: &str) -> MetadataResult<u64> {
        Ok(self.require_stat(filename)?.pointer)
    }

    fn is_applied(&self, task_id: TaskId) -> bool {
        self.applied.lock().contains(&task_id)
    }

    fn mark_applied(&self, task_id: TaskId) {
        self.applied.lock().put(task_id, ());
    }

    /// 読み込みタスクの分だけポインタを進める（タスクIDで重複排除）
    #[instrument(level = "trace", name = "metadata_read_task_info", skip(self, tasks), fields(count = tasks.len()))]
    pub fn update_read_task_info(&self, tasks: &[Task], filename: &str) -> MetadataResult<u64> {
        let mut bytes = 0u64;
        for task in tasks {
            if task.t_type() != TaskType::Read || task.filename() != filename {
                continue;
            }
            if self.is_applied(task.task_id) {
                tracing::debug!("Skipping already applied read task {}", task.task_id);
                continue;
            }
            self.mark_applied(task.task_id);
            bytes += task.size();
        }

        if bytes == 0 {
            return self.get_fp(filename);
        }
        self.update_on_read(filename, bytes)
    }

    /// ソルバーが決めた書き込み先をチャンクに記録する
    ///
    /// 同じタスクIDの二回目以降の適用は無視する。サイズ拡張を先に書き、
    /// チャンク登録はその後に行う（二つのキーはアトミックに更新されない）。
    /// 適用したタスク数を返す。
    #[instrument(level = "trace", name = "metadata_write_task_info", skip(self, tasks), fields(count = tasks.len()))]
    pub fn update_write_task_info(&self, tasks: &mut [Task], filename: &str) -> MetadataResult<usize> {
        let mut applied = 0;

        for task in tasks.iter_mut() {
            if task.t_type() != TaskType::Write || task.filename() != filename {
                continue;
            }
            if task.meta_updated || self.is_applied(task.task_id) {
                task.meta_updated = true;
                continue;
            }

            let end = task.offset().checked_add(task.size()).ok_or(
                MetadataError::UpdateOnWriteFailed {
                    task_id: task.task_id,
                    offset: task.offset(),
                    size: task.size(),
                },
            )?;
            let base = task.offset() - task.offset() % self.chunk_size;
            let key = chunk_key(filename, base);
            let existing: Option<ChunkMeta> = self.map.get_value(Table::ChunkDb, &key)?;
            if existing.as_ref().and_then(|c| c.task_id) == Some(task.task_id) {
                tracing::debug!("Chunk {} already records task {}", key, task.task_id);
                self.mark_applied(task.task_id);
                task.meta_updated = true;
                continue;
            }

            self.modify_stat(filename, |stat| {
                if end > stat.size {
                    stat.size = end;
                }
            })?;

            let destination = &task.destination;
            let chunk = match existing {
                Some(mut chunk) => {
                    let start = chunk.offset.min(destination.offset);
                    let stop = chunk.end().max(end);
                    chunk.offset = start;
                    chunk.size = stop - start;
                    chunk.tier = destination.tier;
                    chunk.worker = destination.worker;
                    chunk.dataspace_id = task.dataspace_id;
                    chunk.task_id = Some(task.task_id);
                    chunk
                }
                None => ChunkMeta {
                    chunk_id: base / self.chunk_size,
                    filename: filename.to_string(),
                    offset: destination.offset,
                    size: destination.size,
                    tier: destination.tier,
                    worker: destination.worker,
                    dataspace_id: task.dataspace_id,
                    task_id: Some(task.task_id),
                },
            };
            self.map.put_value(Table::ChunkDb, &key, &chunk)?;
            self.add_to_index(filename, base)?;

            self.mark_applied(task.task_id);
            task.meta_updated = true;
            applied += 1;
            tracing::debug!(
                "Recorded chunk {} [{}, {}) on worker {}",
                key,
                chunk.offset,
                chunk.end(),
                chunk.worker
            );
        }

        Ok(applied)
    }

    fn load_index(&self, filename: &str) -> MetadataResult<BTreeSet<u64>> {
        Ok(self
            .map
            .get_value(Table::FileChunkDb, filename)?
            .unwrap_or_default())
    }

    fn add_to_index(&self, filename: &str, base: u64) -> MetadataResult<()> {
        let _guard = self.stat_lock.lock();
        let mut index = self.load_index(filename)?;
        if index.insert(base) {
            self.map.put_value(Table::FileChunkDb, filename, &index)?;
        }
        Ok(())
    }

    /// 記録されているチャンクを offset 順に返す
    pub fn chunks(&self, filename: &str) -> MetadataResult<Vec<ChunkMeta>> {
        let mut chunks = Vec::new();
        for base in self.load_index(filename)? {
            if let Some(chunk) = self
                .map
                .get_value::<ChunkMeta>(Table::ChunkDb, &chunk_key(filename, base))?
            {
                chunks.push(chunk);
            }
        }
        Ok(chunks)
    }

    /// 記録済みチャンクの `chunk_meta`（`base` を先頭とするチャンク）
    pub fn chunk_at(&self, filename: &str, base: u64) -> MetadataResult<Option<ChunkMeta>> {
        Ok(self
            .map
            .get_value(Table::ChunkDb, &chunk_key(filename, base))?)
    }

    /// 読み込みタスクの範囲に重なるチャンクを offset 順に返す
    ///
    /// 記録済みチャンクは範囲に切り詰め、記録の無い部分は PFS 上の
    /// 未割り当てチャンクとして補う。チャンクが一つも無ければ空。
    /// ファイル末尾より先は返さない。
    #[instrument(level = "trace", name = "metadata_fetch_chunks", skip(self, task), fields(task_id = task.task_id))]
    pub fn fetch_chunks(&self, task: &Task) -> MetadataResult<Vec<ChunkMeta>> {
        let filename = task.filename();
        let index = self.load_index(filename)?;
        if index.is_empty() {
            return Ok(Vec::new());
        }

        let start = task.offset();
        let mut end = task.offset().saturating_add(task.size());
        if let Some(stat) = self.load_stat(filename)? {
            end = end.min(stat.size);
        }

        let mut result = Vec::new();
        let mut cursor = start;
        while cursor < end {
            let base = cursor - cursor % self.chunk_size;
            let cell_end = (base + self.chunk_size).min(end);
            let chunk_id = base / self.chunk_size;

            let recorded = if index.contains(&base) {
                self.map
                    .get_value::<ChunkMeta>(Table::ChunkDb, &chunk_key(filename, base))?
            } else {
                None
            };

            match recorded {
                Some(chunk) if chunk.offset < cell_end && chunk.end() > cursor => {
                    if chunk.offset > cursor {
                        result.push(Self::pfs_chunk(chunk_id, filename, cursor, chunk.offset));
                    }
                    let clipped = chunk.clipped(cursor, cell_end);
                    let clipped_end = clipped.end();
                    result.push(clipped);
                    if clipped_end < cell_end {
                        result.push(Self::pfs_chunk(chunk_id, filename, clipped_end, cell_end));
                    }
                }
                _ => result.push(Self::pfs_chunk(chunk_id, filename, cursor, cell_end)),
            }

            cursor = cell_end;
        }

        Ok(result)
    }

    fn pfs_chunk(chunk_id: u64, filename: &str, start: u64, end: u64) -> ChunkMeta {
        ChunkMeta::new(chunk_id, filename, start, end - start, Tier::Pfs)
    }

    /// ファイルのチャンクを削除する（ベストエフォート）
    ///
    /// 途中で失敗したエントリは警告を出して残す。削除できた件数を返す。
    #[instrument(level = "trace", name = "metadata_remove_chunks", skip(self))]
    pub fn remove_chunks(&self, filename: &str) -> MetadataResult<usize> {
        let index = self.load_index(filename)?;
        self.map
            .remove(Table::FileChunkDb, filename, GroupKey::Hashed)?;

        let mut removed = 0;
        for base in index {
            let key = chunk_key(filename, base);
            match self.map.remove(Table::ChunkDb, &key, GroupKey::Hashed) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!("Failed to remove chunk {}: {}", key, e),
            }
        }

        tracing::debug!("Removed {} chunks of {}", removed, filename);
        Ok(removed)
    }

    /// ファイルを削除して UNCREATED に戻す
    #[instrument(level = "trace", name = "metadata_delete", skip(self))]
    pub fn update_on_delete(&self, filename: &str) -> MetadataResult<()> {
        self.remove_chunks(filename)?;
        {
            let _guard = self.stat_lock.lock();
            self.map.remove(Table::FileDb, filename, GroupKey::Hashed)?;
        }
        self.handles
            .lock()
            .retain(|_, entry| entry.filename != filename);
        Ok(())
    }

    /// チャンクの走査からファイルサイズを再計算する
    ///
    /// サイズ拡張とチャンク登録の間で落ちたプロセスが残した不整合を直す。
    pub fn recover_size(&self, filename: &str) -> MetadataResult<u64> {
        let size = self
            .chunks(filename)?
            .iter()
            .map(|chunk| chunk.end())
            .max()
            .unwrap_or(0);

        self.modify_stat(filename, |stat| {
            if stat.size != size {
                tracing::warn!(
                    "Recovered size of {}: {} -> {}",
                    stat.filename,
                    stat.size,
                    size
                );
            }
            stat.size = size;
            stat.pointer = stat.pointer.min(size);
        })?;

        Ok(size)
    }

    /// ワーカーからの完了通知を記録する。初回なら `true`
    pub fn record_completion(&self, task: &Task) -> MetadataResult<bool> {
        let key = task.task_id.to_string();
        if self
            .map
            .exists(Table::WriteFinishedDb, &key, GroupKey::Hashed)?
        {
            return Ok(false);
        }
        self.map.put_value(Table::WriteFinishedDb, &key, &task.t_type())?;
        tracing::debug!("Task {} completed", task.task_id);
        Ok(true)
    }

    pub fn is_completed(&self, task_id: TaskId) -> MetadataResult<bool> {
        Ok(self
            .map
            .exists(Table::WriteFinishedDb, &task_id.to_string(), GroupKey::Hashed)?)
    }

    /// すべてのタスクが完了するまで最大 `timeout` 待つ
    pub fn wait_for_completion(&self, task_ids: &[TaskId], timeout: Duration) -> MetadataResult<bool> {
        let deadline = Instant::now() + timeout;
        let mut pending: Vec<TaskId> = task_ids.to_vec();
        let mut backoff = Duration::from_micros(100);

        loop {
            let mut still_pending = Vec::with_capacity(pending.len());
            for id in pending {
                if !self.is_completed(id)? {
                    still_pending.push(id);
                }
            }
            pending = still_pending;

            if pending.is_empty() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                tracing::warn!("{} tasks not completed within {:?}", pending.len(), timeout);
                return Ok(false);
            }

            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(Duration::from_millis(10));
        }
    }
}
