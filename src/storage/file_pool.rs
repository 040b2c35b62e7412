//! File handle pool
//!
//! An LRU cache of open file handles keyed by `(storage_id, file_index)`.
//! Opening in write mode upgrades an existing read handle by close and
//! reopen. On capacity overflow the least-recently-used handle is closed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::fs::{File, OpenOptions};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::error::{Ed2kError, ErrorKind};

/// Pool key: which storage and which file within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub storage_id: u32,
    pub file_index: u32,
}

struct PoolEntry {
    file: Arc<Mutex<File>>,
    path: PathBuf,
    write_mode: bool,
    last_used: u64,
}

struct PoolInner {
    entries: HashMap<PoolKey, PoolEntry>,
    clock: u64,
}

/// LRU pool of open file handles. The pool itself is mutex-guarded since
/// both the disk worker and the blocking close worker touch it.
pub struct FilePool {
    inner: Mutex<PoolInner>,
    capacity: usize,
}

impl FilePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                entries: HashMap::new(),
                clock: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    /// Fetch an open handle, opening (or upgrading) as needed.
    pub async fn open(&self, key: PoolKey, path: &PathBuf, write: bool) -> Result<Arc<Mutex<File>>> {
        let mut inner = self.inner.lock().await;
        inner.clock += 1;
        let now = inner.clock;

        if let Some(entry) = inner.entries.get_mut(&key) {
            if entry.write_mode || !write {
                entry.last_used = now;
                trace!("file pool hit: {:?}", key);
                return Ok(entry.file.clone());
            }
            // read handle needs a write upgrade
            debug!("file pool upgrade to write: {:?}", key);
            inner.entries.remove(&key);
        }

        if inner.entries.len() >= self.capacity {
            let lru_key = inner.entries.iter().min_by_key(|(_, e)| e.last_used).map(|(k, _)| *k);
            if let Some(lru_key) = lru_key {
                debug!("file pool evicting {:?}", lru_key);
                inner.entries.remove(&lru_key);
            }
        }

        let file = if write {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)
                .await
        } else {
            File::open(path).await
        }
        .map_err(|e| {
            Ed2kError::storage_error_with_path(ErrorKind::FileNotFound, e.to_string(), path.display().to_string())
        })?;

        let handle = Arc::new(Mutex::new(file));
        inner.entries.insert(
            key,
            PoolEntry {
                file: handle.clone(),
                path: path.clone(),
                write_mode: write,
                last_used: now,
            },
        );
        Ok(handle)
    }

    /// Drop the handle for one file, if pooled.
    pub async fn remove(&self, key: PoolKey) {
        let mut inner = self.inner.lock().await;
        if inner.entries.remove(&key).is_some() {
            debug!("file pool closed {:?}", key);
        }
    }

    /// Drop every handle belonging to a storage.
    pub async fn remove_storage(&self, storage_id: u32) {
        let mut inner = self.inner.lock().await;
        inner.entries.retain(|k, _| k.storage_id != storage_id);
    }

    /// Number of pooled handles.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    /// Path recorded for a pooled handle.
    pub async fn path_of(&self, key: PoolKey) -> Option<PathBuf> {
        self.inner.lock().await.entries.get(&key).map(|e| e.path.clone())
    }
}
