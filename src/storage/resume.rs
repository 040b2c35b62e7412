//! Resume data
//!
//! The fast-resume blob saved per transfer: a tag list carrying the file
//! identity, the piece hash set, progress counters and the saved mtime.
//! Unknown tags are ignored on load.

use std::path::{Path, PathBuf};

use anyhow::Result;
use bytes::BytesMut;
use tokio::fs;
use tracing::{debug, warn};

use crate::error::{Ed2kError, ErrorKind};
use crate::hash::{hash_list_len, FileHash};
use crate::protocol::tag::{Tag, TagList, TagName, TagValue};
use crate::protocol::ft;

// free-form tag names for fields without a classic id
const TAG_SAVED_MTIME: &str = "saved_mtime";
const TAG_HAVE_PIECES: &str = "have";
const TAG_HASHSET: &str = "hashset";

/// Fast-resume state for one transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeData {
    pub file_hash: FileHash,
    pub file_path: PathBuf,
    pub file_size: u64,
    pub piece_hashes: Vec<FileHash>,
    /// verified piece bitfield, one bit per piece, MSB first
    pub have: Vec<u8>,
    pub transferred: u64,
    pub requested: u64,
    pub accepted: u64,
    pub priority: u8,
    /// file mtime (seconds) when this blob was written
    pub saved_mtime: u64,
}

impl ResumeData {
    /// Serialize into the tag blob.
    pub fn to_bytes(&self) -> BytesMut {
        let mut tags = TagList::new();
        let name = self
            .file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        tags.push(Tag::string(ft::FT_FILENAME, name));

        // classic clients split 64-bit sizes across two 32-bit tags
        tags.push(Tag::uint(ft::FT_FILESIZE, self.file_size & 0xFFFF_FFFF));
        if self.file_size > u32::MAX as u64 {
            tags.push(Tag::uint(ft::FT_FILESIZE_HI, self.file_size >> 32));
        }

        tags.push(Tag::hash(ft::FT_FILEHASH, self.file_hash));

        if self.piece_hashes.len() > 1 {
            let mut blob = Vec::with_capacity(self.piece_hashes.len() * 16);
            for h in &self.piece_hashes {
                blob.extend_from_slice(&h.0);
            }
            tags.push(Tag {
                name: TagName::Name(TAG_HASHSET.to_string()),
                value: TagValue::Blob(blob),
                compressible: true,
            });
        }

        if !self.have.is_empty() {
            tags.push(Tag {
                name: TagName::Name(TAG_HAVE_PIECES.to_string()),
                value: TagValue::Blob(self.have.clone()),
                compressible: true,
            });
        }

        tags.push(Tag::uint(ft::FT_ATTRANSFERRED, self.transferred & 0xFFFF_FFFF));
        if self.transferred > u32::MAX as u64 {
            tags.push(Tag::uint(ft::FT_ATTRANSFERREDHI, self.transferred >> 32));
        }
        tags.push(Tag::uint(ft::FT_ATREQUESTED, self.requested));
        tags.push(Tag::uint(ft::FT_ATACCEPTED, self.accepted));
        tags.push(Tag::uint(ft::FT_ULPRIORITY, self.priority as u64));
        tags.push(Tag {
            name: TagName::Name(TAG_SAVED_MTIME.to_string()),
            value: TagValue::Uint(self.saved_mtime),
            compressible: true,
        });

        let mut buf = BytesMut::new();
        tags.write_u32(&mut buf);
        buf
    }

    /// Decode a tag blob.
    pub fn from_bytes(data: &[u8]) -> Result<ResumeData> {
        let mut buf = BytesMut::from(data);
        let tags = TagList::read_u32(&mut buf)
            .map_err(|e| Ed2kError::storage_error(ErrorKind::FastResumeParseError, e.to_string()))?;

        let name = tags
            .find(ft::FT_FILENAME)
            .and_then(|t| t.as_str())
            .ok_or_else(|| Ed2kError::storage_error(ErrorKind::NoFilesInResumeData, "missing file name tag"))?
            .to_string();

        let size_lo = tags
            .find(ft::FT_FILESIZE)
            .and_then(|t| t.as_uint())
            .ok_or_else(|| Ed2kError::storage_error(ErrorKind::NoFilesInResumeData, "missing file size tag"))?;
        let size_hi = tags.find(ft::FT_FILESIZE_HI).and_then(|t| t.as_uint()).unwrap_or(0);
        let file_size = (size_hi << 32) | (size_lo & 0xFFFF_FFFF);

        let file_hash = tags.find(ft::FT_FILEHASH).and_then(|t| t.as_hash());

        let piece_hashes = match find_named(&tags, TAG_HASHSET) {
            Some(TagValue::Blob(blob)) if blob.len() % 16 == 0 => blob
                .chunks_exact(16)
                .map(|c| {
                    let mut hash = [0u8; 16];
                    hash.copy_from_slice(c);
                    FileHash(hash)
                })
                .collect(),
            Some(_) => {
                return Err(Ed2kError::storage_error(ErrorKind::FastResumeParseError, "malformed hash set").into())
            }
            None => Vec::new(),
        };

        // either the singular hash or a hash set must be present
        let (file_hash, piece_hashes) = match (file_hash, piece_hashes.len()) {
            (Some(hash), 0) => (hash, vec![hash]),
            (Some(hash), _) => (hash, piece_hashes),
            (None, 0) => {
                return Err(Ed2kError::storage_error(ErrorKind::NoFilesInResumeData, "missing file hash").into())
            }
            (None, _) => (crate::hash::rollup_hashes(&piece_hashes), piece_hashes),
        };

        let have = match find_named(&tags, TAG_HAVE_PIECES) {
            Some(TagValue::Blob(blob)) => blob.clone(),
            _ => Vec::new(),
        };

        let transferred_lo = tags.find(ft::FT_ATTRANSFERRED).and_then(|t| t.as_uint()).unwrap_or(0);
        let transferred_hi = tags.find(ft::FT_ATTRANSFERREDHI).and_then(|t| t.as_uint()).unwrap_or(0);

        Ok(ResumeData {
            file_hash,
            file_path: PathBuf::from(name),
            file_size,
            piece_hashes,
            have,
            transferred: (transferred_hi << 32) | (transferred_lo & 0xFFFF_FFFF),
            requested: tags.find(ft::FT_ATREQUESTED).and_then(|t| t.as_uint()).unwrap_or(0),
            accepted: tags.find(ft::FT_ATACCEPTED).and_then(|t| t.as_uint()).unwrap_or(0),
            priority: tags.find(ft::FT_ULPRIORITY).and_then(|t| t.as_uint()).unwrap_or(0) as u8,
            saved_mtime: match find_named(&tags, TAG_SAVED_MTIME) {
                Some(TagValue::Uint(v)) => *v,
                _ => 0,
            },
        })
    }

    /// Sanity-check the blob against the actual file.
    ///
    /// `strict` additionally rejects an mtime mismatch, forcing a full
    /// hash check.
    pub fn validate(&self, actual_size: u64, actual_mtime: u64, strict: bool) -> Result<()> {
        if self.file_size != actual_size {
            return Err(Ed2kError::storage_error(ErrorKind::MismatchingFileSize, "resume size mismatch").into());
        }
        let expected = hash_list_len(self.file_size) as usize;
        if expected > 0 && self.piece_hashes.len() != expected {
            return Err(
                Ed2kError::storage_error(ErrorKind::FastResumeParseError, "resume hash list length mismatch").into(),
            );
        }
        if strict && self.saved_mtime != 0 && self.saved_mtime != actual_mtime {
            warn!(
                "resume mtime mismatch for {}: saved {} actual {}",
                self.file_path.display(),
                self.saved_mtime,
                actual_mtime
            );
            return Err(Ed2kError::storage_error(ErrorKind::MismatchingFileMtime, "resume mtime mismatch").into());
        }
        Ok(())
    }

    /// Save to file.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, &self.to_bytes()[..]).await?;
        debug!("resume data saved to {}", path.display());
        Ok(())
    }

    /// Load from file.
    pub async fn load(path: &Path) -> Result<Option<ResumeData>> {
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(path).await?;
        Ok(Some(Self::from_bytes(&data)?))
    }
}

fn find_named<'a>(tags: &'a TagList, name: &str) -> Option<&'a TagValue> {
    tags.0.iter().find_map(|t| match &t.name {
        TagName::Name(n) if n == name => Some(&t.value),
        _ => None,
    })
}
