//! Content hash primitives
//!
//! 128-bit MD4 content hashes, per-piece hash lists and the rolling hasher
//! used for block-by-block file hashing.

use std::fmt;

use anyhow::Result;
use md4::{Digest, Md4};
use serde::{Deserialize, Serialize};

use crate::error::{Ed2kError, ErrorKind};

/// Size of one content piece: the unit of hash verification.
pub const PIECE_SIZE: u64 = 9_728_000;

/// Size of one block: the unit of network transfer and disk I/O.
pub const BLOCK_SIZE: u64 = 180_224;

/// Number of blocks in a full piece (ceil division).
pub const BLOCKS_PER_PIECE: u32 = ((PIECE_SIZE + BLOCK_SIZE - 1) / BLOCK_SIZE) as u32;

/// A 128-bit MD4 content hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileHash(pub [u8; 16]);

impl FileHash {
    /// The all-zero, "not yet computed" hash.
    pub const EMPTY: FileHash = FileHash([0u8; 16]);

    /// MD4 of empty input; the terminal piece hash appended to exact-multiple files.
    pub const TERMINAL: FileHash = FileHash([
        0x31, 0xD6, 0xCF, 0xE0, 0xD1, 0x6A, 0xE9, 0x31, 0xB7, 0x3C, 0x59, 0xD7, 0xE0, 0xC0, 0x89, 0xC0,
    ]);

    /// Hash a single buffer.
    pub fn hash_block(data: &[u8]) -> FileHash {
        let mut hasher = Md4::new();
        hasher.update(data);
        FileHash(hasher.finalize().into())
    }

    /// Parse from a 32-character hex string.
    pub fn from_hex(s: &str) -> Result<FileHash> {
        let s = s.trim();
        if s.len() != 32 {
            return Err(Ed2kError::decode_error_with(
                ErrorKind::DecodePacketError,
                format!("bad hash literal length: {}", s.len()),
            )
            .into());
        }
        let bytes = hex::decode(s).map_err(|e| {
            Ed2kError::decode_error_with(ErrorKind::DecodePacketError, format!("bad hash literal: {}", e))
        })?;
        let mut hash = [0u8; 16];
        hash.copy_from_slice(&bytes);
        Ok(FileHash(hash))
    }

    /// Uppercase hex form, the convention used in ed2k links.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    /// True once the hash differs from the all-zero placeholder.
    pub fn is_defined(&self) -> bool {
        *self != FileHash::EMPTY
    }

    /// XOR distance to another 128-bit id.
    pub fn distance(&self, other: &FileHash) -> [u8; 16] {
        let mut out = [0u8; 16];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }
}

impl fmt::Debug for FileHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileHash({})", self.to_hex())
    }
}

impl fmt::Display for FileHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Streaming hasher over a single piece.
pub struct PieceHasher {
    inner: Md4,
    consumed: u64,
}

impl PieceHasher {
    /// Create a fresh piece hasher.
    pub fn new() -> Self {
        Self {
            inner: Md4::new(),
            consumed: 0,
        }
    }

    /// Feed a chunk of the piece.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.consumed += data.len() as u64;
    }

    /// Bytes consumed so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Finish and produce the piece hash.
    pub fn finalize(self) -> FileHash {
        FileHash(self.inner.finalize().into())
    }
}

impl Default for PieceHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of pieces covering `file_size` bytes, without the terminal rule.
pub fn piece_count(file_size: u64) -> u32 {
    ((file_size + PIECE_SIZE - 1) / PIECE_SIZE) as u32
}

/// Number of entries in a conforming piece hash list, including the
/// terminal zero-content hash appended to exact-multiple files.
pub fn hash_list_len(file_size: u64) -> u32 {
    let count = piece_count(file_size);
    if file_size > 0 && file_size % PIECE_SIZE == 0 {
        count + 1
    } else {
        count
    }
}

/// Size in bytes of piece `index` in a file of `file_size` bytes.
pub fn piece_size_at(file_size: u64, index: u32) -> u64 {
    let start = index as u64 * PIECE_SIZE;
    if start >= file_size {
        return 0;
    }
    (file_size - start).min(PIECE_SIZE)
}

/// Number of blocks in piece `index`.
pub fn blocks_in_piece(file_size: u64, index: u32) -> u32 {
    let size = piece_size_at(file_size, index);
    ((size + BLOCK_SIZE - 1) / BLOCK_SIZE) as u32
}

/// Roll a piece hash list up into the file hash.
///
/// A single-entry list is the file hash itself; longer lists hash the
/// concatenation of the piece digests.
pub fn rollup_hashes(piece_hashes: &[FileHash]) -> FileHash {
    match piece_hashes.len() {
        0 => FileHash::EMPTY,
        1 => piece_hashes[0],
        _ => {
            let mut hasher = Md4::new();
            for h in piece_hashes {
                hasher.update(h.0);
            }
            FileHash(hasher.finalize().into())
        }
    }
}

/// Derive `(file_hash, piece_hashes)` from a full in-memory buffer.
///
/// Exact-multiple files get the terminal zero-content piece appended
/// before the rollup; this is mandatory for interoperability.
pub fn hash_buffer(data: &[u8]) -> (FileHash, Vec<FileHash>) {
    let mut piece_hashes = Vec::new();
    if data.is_empty() {
        return (FileHash::EMPTY, piece_hashes);
    }

    for piece in data.chunks(PIECE_SIZE as usize) {
        piece_hashes.push(FileHash::hash_block(piece));
    }
    if data.len() as u64 % PIECE_SIZE == 0 {
        piece_hashes.push(FileHash::TERMINAL);
    }

    (rollup_hashes(&piece_hashes), piece_hashes)
}

/// Incremental file-hash maker fed block-sized chunks in file order.
///
/// Used by the hashing worker so at most one block is held in memory.
pub struct FileHasher {
    file_size: u64,
    consumed: u64,
    current: PieceHasher,
    piece_hashes: Vec<FileHash>,
}

impl FileHasher {
    /// Start hashing a file of a known size.
    pub fn new(file_size: u64) -> Self {
        Self {
            file_size,
            consumed: 0,
            current: PieceHasher::new(),
            piece_hashes: Vec::with_capacity(hash_list_len(file_size) as usize),
        }
    }

    /// Feed the next chunk; chunks must arrive in file order and may not
    /// straddle a piece boundary.
    pub fn update(&mut self, data: &[u8]) -> Result<()> {
        if self.consumed + data.len() as u64 > self.file_size {
            return Err(
                Ed2kError::storage_error(ErrorKind::MismatchingFileSize, "hash input past declared size").into(),
            );
        }
        self.current.update(data);
        self.consumed += data.len() as u64;

        if self.current.consumed() == PIECE_SIZE || self.consumed == self.file_size {
            let finished = std::mem::take(&mut self.current);
            self.piece_hashes.push(finished.finalize());
        }
        Ok(())
    }

    /// Finish: apply the terminal-piece rule and roll up.
    pub fn finalize(mut self) -> Result<(FileHash, Vec<FileHash>)> {
        if self.consumed != self.file_size {
            return Err(Ed2kError::storage_error(ErrorKind::FileTruncated, "hash input short of declared size").into());
        }
        if self.file_size > 0 && self.file_size % PIECE_SIZE == 0 {
            self.piece_hashes.push(FileHash::TERMINAL);
        }
        Ok((rollup_hashes(&self.piece_hashes), self.piece_hashes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_hash_is_md4_of_empty() {
        assert_eq!(FileHash::hash_block(b""), FileHash::TERMINAL);
    }

    #[test]
    fn test_hex_round_trip() {
        let h = FileHash::from_hex("DB48A1C00CC972488C29D3FEC9F16A79").unwrap();
        assert_eq!(h.to_hex(), "DB48A1C00CC972488C29D3FEC9F16A79");
        assert!(h.is_defined());
    }

    #[test]
    fn test_from_hex_rejects_bad_length() {
        assert!(FileHash::from_hex("DB48").is_err());
    }

    #[test]
    fn test_known_md4_vectors() {
        // RFC 1320 test vectors
        assert_eq!(FileHash::hash_block(b"").to_hex(), "31D6CFE0D16AE931B73C59D7E0C089C0");
        assert_eq!(FileHash::hash_block(b"abc").to_hex(), "A448017AAF21D8525FC10AE87AA6729D");
    }

    #[test]
    fn test_single_piece_file_hash() {
        // a file shorter than one piece hashes to its only piece hash
        let data = vec![0x7Au8; 100];
        let (file_hash, pieces) = hash_buffer(&data);
        assert_eq!(pieces.len(), 1);
        assert_eq!(file_hash, FileHash::hash_block(&data));
        assert_eq!(file_hash, pieces[0]);
    }

    #[test]
    fn test_exact_multiple_gets_terminal_piece() {
        let data = vec![1u8; PIECE_SIZE as usize];
        let (file_hash, pieces) = hash_buffer(&data);
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[1], FileHash::TERMINAL);

        let mut rollup = Md4::new();
        rollup.update(pieces[0].0);
        rollup.update(FileHash::TERMINAL.0);
        assert_eq!(file_hash, FileHash(rollup.finalize().into()));
    }

    #[test]
    fn test_hash_list_len_rule() {
        assert_eq!(hash_list_len(100), 1);
        assert_eq!(hash_list_len(PIECE_SIZE), 2);
        assert_eq!(hash_list_len(PIECE_SIZE + 1), 2);
        assert_eq!(hash_list_len(3 * PIECE_SIZE), 4);
        assert_eq!(hash_list_len(0), 0);
    }

    #[test]
    fn test_piece_geometry() {
        assert_eq!(piece_size_at(PIECE_SIZE + 100, 0), PIECE_SIZE);
        assert_eq!(piece_size_at(PIECE_SIZE + 100, 1), 100);
        assert_eq!(blocks_in_piece(PIECE_SIZE + 100, 0), BLOCKS_PER_PIECE);
        assert_eq!(blocks_in_piece(PIECE_SIZE + 100, 1), 1);
    }

    #[test]
    fn test_incremental_matches_buffer() {
        let data = vec![9u8; (BLOCK_SIZE * 3) as usize];
        let mut fh = FileHasher::new(data.len() as u64);
        for chunk in data.chunks(BLOCK_SIZE as usize) {
            fh.update(chunk).unwrap();
        }
        let (file_hash, pieces) = fh.finalize().unwrap();
        let (expected_hash, expected_pieces) = hash_buffer(&data);
        assert_eq!(file_hash, expected_hash);
        assert_eq!(pieces, expected_pieces);
    }

    #[test]
    fn test_incremental_rejects_overrun() {
        let mut fh = FileHasher::new(10);
        assert!(fh.update(&[0u8; 11]).is_err());
    }

    #[test]
    fn test_distance_symmetry() {
        let a = FileHash::hash_block(b"a");
        let b = FileHash::hash_block(b"b");
        assert_eq!(a.distance(&b), b.distance(&a));
        assert_eq!(a.distance(&a), [0u8; 16]);
    }
}
