//! Disk job queue
//!
//! A dedicated worker owns all file I/O. Jobs are posted over a bounded
//! channel and answered through oneshot completions. Contiguous writes
//! to the same file are coalesced before hitting the file system, and a
//! byte budget with high/low watermarks gates producers.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, error, trace, warn};

use crate::error::{Ed2kError, ErrorKind};
use crate::hash::{FileHash, PieceHasher, BLOCK_SIZE};
use crate::settings::SessionSettings;
use crate::storage::file_pool::{FilePool, PoolKey};
use crate::storage::resume::ResumeData;

/// Identifies one file of one storage plus where it lives on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey {
    pub storage_id: u32,
    pub file_index: u32,
    pub path: PathBuf,
}

impl StorageKey {
    fn pool_key(&self) -> PoolKey {
        PoolKey {
            storage_id: self.storage_id,
            file_index: self.file_index,
        }
    }
}

/// Outcome of a disk job.
#[derive(Debug)]
pub enum DiskJobResult {
    Done,
    Data(Vec<u8>),
    PieceHash(FileHash),
    Failed(ErrorKind),
}

enum DiskJob {
    Write {
        key: StorageKey,
        offset: u64,
        data: Vec<u8>,
        done: oneshot::Sender<DiskJobResult>,
    },
    Read {
        key: StorageKey,
        offset: u64,
        len: usize,
        done: oneshot::Sender<DiskJobResult>,
    },
    HashPiece {
        key: StorageKey,
        offset: u64,
        len: u64,
        done: oneshot::Sender<DiskJobResult>,
    },
    CheckResume {
        key: StorageKey,
        resume: ResumeData,
        strict: bool,
        done: oneshot::Sender<DiskJobResult>,
    },
    Rename {
        key: StorageKey,
        new_path: PathBuf,
        done: oneshot::Sender<DiskJobResult>,
    },
    Delete {
        key: StorageKey,
        done: oneshot::Sender<DiskJobResult>,
    },
    Flush {
        key: StorageKey,
        done: oneshot::Sender<DiskJobResult>,
    },
    UpdateSettings {
        high: usize,
        low: usize,
        done: oneshot::Sender<DiskJobResult>,
    },
}

/// Byte budget over the queued write data. Producers wait above the high
/// watermark until the worker drains below the low one.
pub struct DiskBudget {
    queued: AtomicUsize,
    high: AtomicUsize,
    low: AtomicUsize,
    drained: Notify,
}

impl DiskBudget {
    fn new(high: usize, low: usize) -> Self {
        Self {
            queued: AtomicUsize::new(0),
            high: AtomicUsize::new(high),
            low: AtomicUsize::new(low),
            drained: Notify::new(),
        }
    }

    /// Account for `bytes` about to be queued, waiting out back-pressure.
    pub async fn reserve(&self, bytes: usize) {
        loop {
            if self.queued.load(Ordering::Acquire) <= self.high.load(Ordering::Relaxed) {
                self.queued.fetch_add(bytes, Ordering::AcqRel);
                return;
            }
            self.drained.notified().await;
        }
    }

    /// Release `bytes` after the write landed.
    pub fn release(&self, bytes: usize) {
        let before = self.queued.fetch_sub(bytes, Ordering::AcqRel);
        if before.saturating_sub(bytes) < self.low.load(Ordering::Relaxed) {
            self.drained.notify_waiters();
        }
    }

    /// Currently queued bytes.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    fn set_watermarks(&self, high: usize, low: usize) {
        self.high.store(high, Ordering::Relaxed);
        self.low.store(low, Ordering::Relaxed);
        self.drained.notify_waiters();
    }
}

/// Handle to the disk worker.
#[derive(Clone)]
pub struct DiskIo {
    tx: mpsc::Sender<DiskJob>,
    budget: Arc<DiskBudget>,
    pool: Arc<FilePool>,
}

impl DiskIo {
    /// Spawn the disk worker.
    pub fn start(settings: &SessionSettings) -> DiskIo {
        let (tx, rx) = mpsc::channel(256);
        let budget = Arc::new(DiskBudget::new(
            settings.max_queued_disk_bytes,
            settings.max_queued_disk_bytes_low_watermark,
        ));
        let pool = Arc::new(FilePool::new(settings.file_pool_size));

        let worker_budget = budget.clone();
        let worker_pool = pool.clone();
        tokio::spawn(async move {
            run_worker(rx, worker_budget, worker_pool).await;
            debug!("disk worker stopped");
        });

        DiskIo { tx, budget, pool }
    }

    /// Queue a block write. Suspends while the disk buffer budget is
    /// exhausted.
    pub async fn write(&self, key: StorageKey, offset: u64, data: Vec<u8>) -> oneshot::Receiver<DiskJobResult> {
        self.budget.reserve(data.len()).await;
        self.send(|done| DiskJob::Write { key, offset, data, done }).await
    }

    /// Queue a block read.
    pub async fn read(&self, key: StorageKey, offset: u64, len: usize) -> oneshot::Receiver<DiskJobResult> {
        self.send(|done| DiskJob::Read { key, offset, len, done }).await
    }

    /// Queue a streaming piece hash.
    pub async fn hash_piece(&self, key: StorageKey, offset: u64, len: u64) -> oneshot::Receiver<DiskJobResult> {
        self.send(|done| DiskJob::HashPiece { key, offset, len, done }).await
    }

    /// Queue a fast-resume validation against the file on disk.
    pub async fn check_resume(
        &self,
        key: StorageKey,
        resume: ResumeData,
        strict: bool,
    ) -> oneshot::Receiver<DiskJobResult> {
        self.send(|done| DiskJob::CheckResume { key, resume, strict, done }).await
    }

    /// Queue a rename (also used for move-storage).
    pub async fn rename(&self, key: StorageKey, new_path: PathBuf) -> oneshot::Receiver<DiskJobResult> {
        self.send(|done| DiskJob::Rename { key, new_path, done }).await
    }

    /// Queue a delete.
    pub async fn delete(&self, key: StorageKey) -> oneshot::Receiver<DiskJobResult> {
        self.send(|done| DiskJob::Delete { key, done }).await
    }

    /// Queue a flush.
    pub async fn flush(&self, key: StorageKey) -> oneshot::Receiver<DiskJobResult> {
        self.send(|done| DiskJob::Flush { key, done }).await
    }

    /// Update the budget watermarks.
    pub async fn update_settings(&self, settings: &SessionSettings) -> oneshot::Receiver<DiskJobResult> {
        let high = settings.max_queued_disk_bytes;
        let low = settings.max_queued_disk_bytes_low_watermark;
        self.send(move |done| DiskJob::UpdateSettings { high, low, done }).await
    }

    /// Shared byte budget, for producers that want to inspect it.
    pub fn budget(&self) -> &Arc<DiskBudget> {
        &self.budget
    }

    async fn send<F>(&self, make: F) -> oneshot::Receiver<DiskJobResult>
    where
        F: FnOnce(oneshot::Sender<DiskJobResult>) -> DiskJob,
    {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(make(done_tx)).await.is_err() {
            warn!("disk worker gone, job dropped");
        }
        done_rx
    }
}

struct PendingWrite {
    key: StorageKey,
    offset: u64,
    data: Vec<u8>,
    done: Vec<oneshot::Sender<DiskJobResult>>,
}

async fn run_worker(mut rx: mpsc::Receiver<DiskJob>, budget: Arc<DiskBudget>, pool: Arc<FilePool>) {
    while let Some(job) = rx.recv().await {
        let mut writes: Vec<PendingWrite> = Vec::new();
        let mut others: Vec<DiskJob> = Vec::new();
        stash(job, &mut writes, &mut others);

        // drain whatever else is already queued so writes can coalesce
        while let Ok(job) = rx.try_recv() {
            stash(job, &mut writes, &mut others);
            if writes.len() + others.len() >= 64 {
                break;
            }
        }

        coalesce(&mut writes);
        for write in writes {
            execute_write(write, &budget, &pool).await;
        }
        for job in others {
            execute(job, &budget, &pool).await;
        }
    }
}

fn stash(job: DiskJob, writes: &mut Vec<PendingWrite>, others: &mut Vec<DiskJob>) {
    match job {
        DiskJob::Write { key, offset, data, done } => writes.push(PendingWrite {
            key,
            offset,
            data,
            done: vec![done],
        }),
        other => others.push(other),
    }
}

/// Merge queued writes that are contiguous within the same file.
fn coalesce(writes: &mut Vec<PendingWrite>) {
    if writes.len() < 2 {
        return;
    }
    writes.sort_by(|a, b| (&a.key.path, a.offset).cmp(&(&b.key.path, b.offset)));

    let mut merged: Vec<PendingWrite> = Vec::with_capacity(writes.len());
    for write in writes.drain(..) {
        match merged.last_mut() {
            Some(last)
                if last.key == write.key && last.offset + last.data.len() as u64 == write.offset =>
            {
                trace!(
                    "coalescing write at {} (+{}B) into run starting {}",
                    write.offset,
                    write.data.len(),
                    last.offset
                );
                last.data.extend_from_slice(&write.data);
                last.done.extend(write.done);
            }
            _ => merged.push(write),
        }
    }
    *writes = merged;
}

async fn execute_write(write: PendingWrite, budget: &DiskBudget, pool: &FilePool) {
    let bytes = write.data.len();
    let result = do_write(&write.key, write.offset, &write.data, pool).await;
    budget.release(bytes);

    for done in write.done {
        let reply = match &result {
            Ok(()) => DiskJobResult::Done,
            Err(kind) => DiskJobResult::Failed(*kind),
        };
        let _ = done.send(reply);
    }
}

async fn do_write(key: &StorageKey, offset: u64, data: &[u8], pool: &FilePool) -> std::result::Result<(), ErrorKind> {
    let handle = pool
        .open(key.pool_key(), &key.path, true)
        .await
        .map_err(|e| kind_of(&e))?;
    let mut file = handle.lock().await;
    file.seek(SeekFrom::Start(offset)).await.map_err(|_| ErrorKind::Other)?;
    file.write_all(data).await.map_err(|e| {
        error!("write failed at {}+{}: {}", key.path.display(), offset, e);
        ErrorKind::Other
    })?;
    Ok(())
}

async fn execute(job: DiskJob, budget: &DiskBudget, pool: &FilePool) {
    match job {
        DiskJob::Write { .. } => unreachable!("writes are stashed separately"),
        DiskJob::Read { key, offset, len, done } => {
            let result = do_read(&key, offset, len, pool).await;
            let _ = done.send(match result {
                Ok(data) => DiskJobResult::Data(data),
                Err(kind) => DiskJobResult::Failed(kind),
            });
        }
        DiskJob::HashPiece { key, offset, len, done } => {
            let result = do_hash(&key, offset, len, pool).await;
            let _ = done.send(match result {
                Ok(hash) => DiskJobResult::PieceHash(hash),
                Err(kind) => DiskJobResult::Failed(kind),
            });
        }
        DiskJob::CheckResume { key, resume, strict, done } => {
            let result = do_check_resume(&key, &resume, strict).await;
            let _ = done.send(match result {
                Ok(()) => DiskJobResult::Done,
                Err(kind) => DiskJobResult::Failed(kind),
            });
        }
        DiskJob::Rename { key, new_path, done } => {
            pool.remove(key.pool_key()).await;
            let result = fs::rename(&key.path, &new_path).await;
            let _ = done.send(match result {
                Ok(()) => DiskJobResult::Done,
                Err(_) => DiskJobResult::Failed(ErrorKind::FileNotFound),
            });
        }
        DiskJob::Delete { key, done } => {
            pool.remove(key.pool_key()).await;
            let result = fs::remove_file(&key.path).await;
            let _ = done.send(match result {
                Ok(()) => DiskJobResult::Done,
                Err(_) => DiskJobResult::Failed(ErrorKind::FileNotFound),
            });
        }
        DiskJob::Flush { key, done } => {
            let result = match pool.open(key.pool_key(), &key.path, true).await {
                Ok(handle) => handle.lock().await.sync_all().await.map_err(|_| ErrorKind::Other),
                Err(e) => Err(kind_of(&e)),
            };
            let _ = done.send(match result {
                Ok(()) => DiskJobResult::Done,
                Err(kind) => DiskJobResult::Failed(kind),
            });
        }
        DiskJob::UpdateSettings { high, low, done } => {
            budget.set_watermarks(high, low);
            let _ = done.send(DiskJobResult::Done);
        }
    }
}

async fn do_read(key: &StorageKey, offset: u64, len: usize, pool: &FilePool) -> std::result::Result<Vec<u8>, ErrorKind> {
    let handle = pool
        .open(key.pool_key(), &key.path, false)
        .await
        .map_err(|e| kind_of(&e))?;
    let mut file = handle.lock().await;
    file.seek(SeekFrom::Start(offset)).await.map_err(|_| ErrorKind::Other)?;
    let mut data = vec![0u8; len];
    file.read_exact(&mut data).await.map_err(|_| ErrorKind::FileTooShort)?;
    Ok(data)
}

/// Stream one piece through the hasher holding at most one block.
async fn do_hash(key: &StorageKey, offset: u64, len: u64, pool: &FilePool) -> std::result::Result<FileHash, ErrorKind> {
    let handle = pool
        .open(key.pool_key(), &key.path, false)
        .await
        .map_err(|e| kind_of(&e))?;
    let mut file = handle.lock().await;
    file.seek(SeekFrom::Start(offset)).await.map_err(|_| ErrorKind::Other)?;

    let mut hasher = PieceHasher::new();
    let mut block = vec![0u8; BLOCK_SIZE as usize];
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(BLOCK_SIZE) as usize;
        file.read_exact(&mut block[..want])
            .await
            .map_err(|_| ErrorKind::FileTruncated)?;
        hasher.update(&block[..want]);
        remaining -= want as u64;
    }
    Ok(hasher.finalize())
}

async fn do_check_resume(key: &StorageKey, resume: &ResumeData, strict: bool) -> std::result::Result<(), ErrorKind> {
    let metadata = fs::metadata(&key.path).await.map_err(|_| ErrorKind::FileNotFound)?;
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    resume
        .validate(metadata.len(), mtime, strict)
        .map_err(|e| kind_of(&e))
}

fn kind_of(err: &anyhow::Error) -> ErrorKind {
    err.downcast_ref::<Ed2kError>().map(Ed2kError::kind).unwrap_or(ErrorKind::Other)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_for(dir: &std::path::Path, name: &str) -> StorageKey {
        StorageKey {
            storage_id: 1,
            file_index: 0,
            path: dir.join(name),
        }
    }

    fn test_settings() -> SessionSettings {
        SessionSettings::default()
    }

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskIo::start(&test_settings());
        let key = key_for(dir.path(), "a.bin");

        let done = disk.write(key.clone(), 0, b"hello disk".to_vec()).await;
        assert!(matches!(done.await.unwrap(), DiskJobResult::Done));

        let done = disk.read(key, 6, 4).await;
        match done.await.unwrap() {
            DiskJobResult::Data(data) => assert_eq!(data, b"disk"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_contiguous_writes_land_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskIo::start(&test_settings());
        let key = key_for(dir.path(), "b.bin");

        let first = disk.write(key.clone(), 0, vec![1u8; 100]).await;
        let second = disk.write(key.clone(), 100, vec![2u8; 100]).await;
        let third = disk.write(key.clone(), 200, vec![3u8; 100]).await;
        for done in [first, second, third] {
            assert!(matches!(done.await.unwrap(), DiskJobResult::Done));
        }

        let done = disk.read(key, 0, 300).await;
        match done.await.unwrap() {
            DiskJobResult::Data(data) => {
                assert_eq!(&data[..100], &[1u8; 100][..]);
                assert_eq!(&data[100..200], &[2u8; 100][..]);
                assert_eq!(&data[200..], &[3u8; 100][..]);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_missing_file_fails_typed() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskIo::start(&test_settings());
        let done = disk.read(key_for(dir.path(), "absent.bin"), 0, 4).await;
        match done.await.unwrap() {
            DiskJobResult::Failed(kind) => assert_eq!(kind, ErrorKind::FileNotFound),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hash_piece_job() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskIo::start(&test_settings());
        let key = key_for(dir.path(), "c.bin");
        let data = vec![0x7Au8; 1000];
        tokio::fs::write(&key.path, &data).await.unwrap();

        let done = disk.hash_piece(key, 0, 1000).await;
        match done.await.unwrap() {
            DiskJobResult::PieceHash(hash) => assert_eq!(hash, FileHash::hash_block(&data)),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delete_job() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskIo::start(&test_settings());
        let key = key_for(dir.path(), "d.bin");
        tokio::fs::write(&key.path, b"x").await.unwrap();

        let done = disk.delete(key.clone()).await;
        assert!(matches!(done.await.unwrap(), DiskJobResult::Done));
        assert!(!key.path.exists());
    }

    #[tokio::test]
    async fn test_rename_job() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskIo::start(&test_settings());
        let key = key_for(dir.path(), "old.bin");
        tokio::fs::write(&key.path, b"x").await.unwrap();
        let new_path = dir.path().join("new.bin");

        let done = disk.rename(key, new_path.clone()).await;
        assert!(matches!(done.await.unwrap(), DiskJobResult::Done));
        assert!(new_path.exists());
    }

    #[tokio::test]
    async fn test_budget_accounting() {
        let budget = DiskBudget::new(1000, 100);
        budget.reserve(400).await;
        budget.reserve(400).await;
        assert_eq!(budget.queued(), 800);
        budget.release(400);
        budget.release(400);
        assert_eq!(budget.queued(), 0);
    }

    #[tokio::test]
    async fn test_check_resume_job_detects_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskIo::start(&test_settings());
        let key = key_for(dir.path(), "r.bin");
        tokio::fs::write(&key.path, vec![5u8; 999]).await.unwrap();

        let (file_hash, piece_hashes) = crate::hash::hash_buffer(&[5u8; 1000]);
        let resume = ResumeData {
            file_hash,
            file_path: key.path.clone(),
            file_size: 1000,
            piece_hashes,
            have: Vec::new(),
            transferred: 0,
            requested: 0,
            accepted: 0,
            priority: 0,
            saved_mtime: 0,
        };
        let done = disk.check_resume(key, resume, false).await;
        match done.await.unwrap() {
            DiskJobResult::Failed(kind) => assert_eq!(kind, ErrorKind::MismatchingFileSize),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
