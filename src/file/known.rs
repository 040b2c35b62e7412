//! Known-files catalog
//!
//! The on-disk registry of files that have already been hashed, plus the
//! hashing worker entry point that turns a file on disk into transfer
//! parameters (file hash and piece hash list).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Result;
use bytes::{BufMut, BytesMut};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use crate::error::{Ed2kError, ErrorKind};
use crate::hash::{FileHash, FileHasher, BLOCK_SIZE};
use crate::protocol::tag::{get_hash, get_u16, get_u32, get_u8, Tag, TagList};
use crate::protocol::{ft, MAX_COLLECTION_SIZE};

/// Header byte of the catalog file.
pub const MET_HEADER: u8 = 0x0E;

/// Everything needed to seed a transfer from an existing file.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferParameters {
    pub file_path: PathBuf,
    pub file_size: u64,
    pub file_hash: FileHash,
    pub piece_hashes: Vec<FileHash>,
    /// mtime (seconds since epoch) captured when the file was hashed
    pub last_modified: u64,
}

/// Hash a file on disk into transfer parameters.
///
/// Streams the file one block at a time; `cancel` aborts between blocks
/// with `MakingCancelled`.
pub async fn make_transfer_parameters(path: &Path, cancel: Arc<AtomicBool>) -> Result<TransferParameters> {
    let metadata = fs::metadata(path).await.map_err(|e| {
        Ed2kError::storage_error_with_path(ErrorKind::FileNotFound, e.to_string(), path.display().to_string())
    })?;
    if !metadata.is_file() {
        return Err(Ed2kError::storage_error_with_path(
            ErrorKind::FileNotFound,
            "not a regular file",
            path.display().to_string(),
        )
        .into());
    }
    let file_size = metadata.len();
    if file_size == 0 {
        return Err(Ed2kError::storage_error_with_path(
            ErrorKind::FileSizeZero,
            "refusing to hash an empty file",
            path.display().to_string(),
        )
        .into());
    }
    let last_modified = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);

    info!("hashing {} ({} bytes)", path.display(), file_size);
    let mut file = fs::File::open(path).await?;
    let mut hasher = FileHasher::new(file_size);
    let mut block = vec![0u8; BLOCK_SIZE as usize];
    let mut remaining = file_size;

    while remaining > 0 {
        if cancel.load(Ordering::Relaxed) {
            return Err(Ed2kError::storage_error_with_path(
                ErrorKind::MakingCancelled,
                "hashing cancelled",
                path.display().to_string(),
            )
            .into());
        }
        let want = remaining.min(BLOCK_SIZE) as usize;
        file.read_exact(&mut block[..want]).await.map_err(|e| {
            Ed2kError::storage_error_with_path(ErrorKind::FileTruncated, e.to_string(), path.display().to_string())
        })?;
        hasher.update(&block[..want])?;
        remaining -= want as u64;
    }

    let (file_hash, piece_hashes) = hasher.finalize()?;
    debug!("hashed {} -> {} ({} pieces)", path.display(), file_hash, piece_hashes.len());

    Ok(TransferParameters {
        file_path: path.to_path_buf(),
        file_size,
        file_hash,
        piece_hashes,
        last_modified,
    })
}

/// One catalog entry.
#[derive(Debug, Clone, PartialEq)]
pub struct KnownFileEntry {
    pub last_changed: u32,
    pub hash: FileHash,
    /// Empty when the file fits one piece; the hash then stands alone
    pub piece_hashes: Vec<FileHash>,
    pub tags: TagList,
}

impl KnownFileEntry {
    /// Build an entry from fresh transfer parameters.
    pub fn from_parameters(params: &TransferParameters) -> Self {
        let mut tags = TagList::new();
        let name = params
            .file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        tags.push(Tag::string(ft::FT_FILENAME, name));
        tags.push(Tag::uint(ft::FT_FILESIZE, params.file_size));

        // single-piece files keep only the main hash
        let piece_hashes = if params.piece_hashes.len() > 1 {
            params.piece_hashes.clone()
        } else {
            Vec::new()
        };

        Self {
            last_changed: params.last_modified as u32,
            hash: params.file_hash,
            piece_hashes,
            tags,
        }
    }

    /// Recover transfer parameters, re-inflating the single-piece case.
    pub fn to_parameters(&self, directory: &Path) -> Result<TransferParameters> {
        let name = self
            .tags
            .find(ft::FT_FILENAME)
            .and_then(|t| t.as_str())
            .ok_or_else(|| Ed2kError::storage_error(ErrorKind::NoFilesInResumeData, "entry without file name"))?;
        let file_size = self
            .tags
            .find(ft::FT_FILESIZE)
            .and_then(|t| t.as_uint())
            .ok_or_else(|| Ed2kError::storage_error(ErrorKind::NoFilesInResumeData, "entry without file size"))?;

        let piece_hashes = if self.piece_hashes.is_empty() {
            vec![self.hash]
        } else {
            self.piece_hashes.clone()
        };

        Ok(TransferParameters {
            file_path: directory.join(name),
            file_size,
            file_hash: self.hash,
            piece_hashes,
            last_modified: self.last_changed as u64,
        })
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.last_changed);
        buf.put_slice(&self.hash.0);
        buf.put_u16_le(self.piece_hashes.len() as u16);
        for h in &self.piece_hashes {
            buf.put_slice(&h.0);
        }
        self.tags.write_u32(buf);
    }

    fn read(buf: &mut BytesMut) -> Result<Self> {
        let last_changed = get_u32(buf)?;
        let hash = get_hash(buf)?;
        let count = get_u16(buf)? as usize;
        if count > MAX_COLLECTION_SIZE {
            return Err(Ed2kError::decode_error(ErrorKind::DecodePacketError).into());
        }
        let mut piece_hashes = Vec::with_capacity(count);
        for _ in 0..count {
            piece_hashes.push(get_hash(buf)?);
        }
        let tags = TagList::read_u32(buf)?;
        Ok(Self {
            last_changed,
            hash,
            piece_hashes,
            tags,
        })
    }
}

/// The known-files catalog.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KnownFiles {
    pub entries: Vec<KnownFileEntry>,
}

impl KnownFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the entry for a hash.
    pub fn upsert(&mut self, entry: KnownFileEntry) {
        if let Some(existing) = self.entries.iter_mut().find(|e| e.hash == entry.hash) {
            *existing = entry;
        } else {
            self.entries.push(entry);
        }
    }

    /// Look up by content hash.
    pub fn find(&self, hash: &FileHash) -> Option<&KnownFileEntry> {
        self.entries.iter().find(|e| e.hash == *hash)
    }

    /// Serialize the catalog.
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(MET_HEADER);
        buf.put_u32_le(self.entries.len() as u32);
        for entry in &self.entries {
            entry.write(&mut buf);
        }
        buf
    }

    /// Decode a catalog.
    pub fn from_bytes(data: &[u8]) -> Result<KnownFiles> {
        let mut buf = BytesMut::from(data);
        let header = get_u8(&mut buf)?;
        if header != MET_HEADER {
            return Err(Ed2kError::storage_error(
                ErrorKind::MetFileInvalidHeader,
                format!("bad catalog header: 0x{:02X}", header),
            )
            .into());
        }
        let count = get_u32(&mut buf)? as usize;
        if count > MAX_COLLECTION_SIZE {
            return Err(Ed2kError::decode_error(ErrorKind::DecodePacketError).into());
        }
        let mut entries = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            entries.push(KnownFileEntry::read(&mut buf)?);
        }
        Ok(KnownFiles { entries })
    }

    /// Persist to disk.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, self.to_bytes()).await?;
        Ok(())
    }

    /// Load from disk; a missing file yields an empty catalog.
    pub async fn load(path: &Path) -> Result<KnownFiles> {
        if !path.exists() {
            return Ok(KnownFiles::new());
        }
        let data = fs::read(path).await?;
        Self::from_bytes(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{hash_buffer, PIECE_SIZE};

    fn params_for(data: &[u8], name: &str) -> TransferParameters {
        let (file_hash, piece_hashes) = hash_buffer(data);
        TransferParameters {
            file_path: PathBuf::from(name),
            file_size: data.len() as u64,
            file_hash,
            piece_hashes,
            last_modified: 1_700_000_000,
        }
    }

    #[test]
    fn test_single_piece_entry_drops_hash_list() {
        let params = params_for(&[7u8; 1000], "small.bin");
        let entry = KnownFileEntry::from_parameters(&params);
        assert!(entry.piece_hashes.is_empty());

        let recovered = entry.to_parameters(Path::new("/downloads")).unwrap();
        assert_eq!(recovered.piece_hashes, vec![params.file_hash]);
        assert_eq!(recovered.file_path, PathBuf::from("/downloads/small.bin"));
    }

    #[test]
    fn test_catalog_round_trip() {
        let mut catalog = KnownFiles::new();
        catalog.upsert(KnownFileEntry::from_parameters(&params_for(&[1u8; 100], "a.bin")));
        catalog.upsert(KnownFileEntry::from_parameters(&params_for(&[2u8; 200], "b.bin")));

        let decoded = KnownFiles::from_bytes(&catalog.to_bytes()).unwrap();
        assert_eq!(decoded, catalog);
    }

    #[test]
    fn test_upsert_replaces_by_hash() {
        let params = params_for(&[1u8; 100], "a.bin");
        let mut catalog = KnownFiles::new();
        catalog.upsert(KnownFileEntry::from_parameters(&params));
        let mut updated = KnownFileEntry::from_parameters(&params);
        updated.last_changed = 42;
        catalog.upsert(updated);
        assert_eq!(catalog.entries.len(), 1);
        assert_eq!(catalog.entries[0].last_changed, 42);
    }

    #[test]
    fn test_bad_header_rejected() {
        let err = KnownFiles::from_bytes(&[0x0F, 0, 0, 0, 0]).unwrap_err();
        let err = err.downcast::<Ed2kError>().unwrap();
        assert_eq!(err.kind(), ErrorKind::MetFileInvalidHeader);
    }

    #[tokio::test]
    async fn test_make_transfer_parameters_small_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.bin");
        let data = vec![0x7Au8; 100];
        fs::write(&path, &data).await.unwrap();

        let params = make_transfer_parameters(&path, Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();
        assert_eq!(params.file_size, 100);
        assert_eq!(params.piece_hashes.len(), 1);
        assert_eq!(params.file_hash, FileHash::hash_block(&data));
    }

    #[tokio::test]
    async fn test_make_transfer_parameters_rejects_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        fs::write(&path, b"").await.unwrap();

        let err = make_transfer_parameters(&path, Arc::new(AtomicBool::new(false)))
            .await
            .unwrap_err();
        assert_eq!(err.downcast::<Ed2kError>().unwrap().kind(), ErrorKind::FileSizeZero);
    }

    #[tokio::test]
    async fn test_make_transfer_parameters_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cancel.bin");
        fs::write(&path, vec![1u8; 4096]).await.unwrap();

        let cancelled = Arc::new(AtomicBool::new(true));
        let err = make_transfer_parameters(&path, cancelled).await.unwrap_err();
        assert_eq!(err.downcast::<Ed2kError>().unwrap().kind(), ErrorKind::MakingCancelled);
    }

    #[test]
    fn test_exact_multiple_keeps_terminal_in_catalog() {
        // the catalog stores the full hash list including the terminal piece
        let data = vec![3u8; PIECE_SIZE as usize];
        let params = params_for(&data, "exact.bin");
        assert_eq!(params.piece_hashes.len(), 2);
        let entry = KnownFileEntry::from_parameters(&params);
        assert_eq!(entry.piece_hashes.len(), 2);
    }
}
