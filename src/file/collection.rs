//! eMule collections
//!
//! A collection is a list of file references, stored either as a binary
//! tag-list-of-tag-lists or as a plain text file with one ed2k link per
//! line. The reader attempts the binary form first and falls back to
//! line parsing.

use anyhow::Result;
use bytes::{BufMut, BytesMut};
use tracing::debug;

use crate::error::{Ed2kError, ErrorKind};
use crate::file::link::Ed2kLink;
use crate::protocol::tag::{get_u32, Tag, TagList};
use crate::protocol::{ft, MAX_COLLECTION_SIZE};

/// An ordered list of file references.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Collection {
    pub files: Vec<Ed2kLink>,
}

impl Collection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one file reference.
    pub fn add(&mut self, name: impl Into<String>, size: u64, hash: crate::hash::FileHash) {
        self.files.push(Ed2kLink::new(name, size, hash));
    }

    /// Append a file reference parsed from an ed2k link line.
    pub fn add_link(&mut self, line: &str) -> bool {
        match Ed2kLink::parse(line) {
            Ok(link) => {
                self.files.push(link);
                true
            }
            Err(_) => false,
        }
    }

    /// Serialize to the binary tag-list form.
    pub fn to_binary(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.files.len() as u32);
        for file in &self.files {
            let mut tags = TagList::new();
            tags.push(Tag::string(ft::FT_FILENAME, file.name.clone()));
            tags.push(Tag::uint(ft::FT_FILESIZE, file.size));
            tags.push(Tag::hash(ft::FT_FILEHASH, file.hash));
            tags.write_u32(&mut buf);
        }
        buf
    }

    /// Decode the binary tag-list form.
    pub fn from_binary(buf: &mut BytesMut) -> Result<Collection> {
        let count = get_u32(buf)? as usize;
        if count > MAX_COLLECTION_SIZE {
            return Err(Ed2kError::decode_error(ErrorKind::DecodePacketError).into());
        }

        let mut files = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let tags = TagList::read_u32(buf)?;
            let name = tags
                .find(ft::FT_FILENAME)
                .and_then(|t| t.as_str())
                .map(str::to_owned)
                .unwrap_or_default();
            let size = tags.find(ft::FT_FILESIZE).and_then(|t| t.as_uint()).unwrap_or(0);
            let hash = tags.find(ft::FT_FILEHASH).and_then(|t| t.as_hash());

            // entries without a name or hash are skipped, matching the
            // tolerant reader of classic clients
            match hash {
                Some(hash) if !name.is_empty() => files.push(Ed2kLink::new(name, size, hash)),
                _ => debug!("skipping collection entry without name or hash"),
            }
        }
        Ok(Collection { files })
    }

    /// Serialize to the text form: one link per line.
    pub fn to_text(&self) -> String {
        self.files
            .iter()
            .map(Ed2kLink::to_link)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Decode from raw file bytes: binary first, then text lines.
    pub fn from_bytes(data: &[u8]) -> Collection {
        let mut buf = BytesMut::from(data);
        if let Ok(collection) = Collection::from_binary(&mut buf) {
            if !collection.files.is_empty() && buf.is_empty() {
                return collection;
            }
        }

        debug!("binary collection decode failed, falling back to link lines");
        let mut collection = Collection::new();
        if let Ok(text) = std::str::from_utf8(data) {
            for line in text.lines() {
                let line = line.trim_end_matches('\r');
                collection.add_link(line);
            }
        }
        collection
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::FileHash;

    fn sample() -> Collection {
        let mut collection = Collection::new();
        collection.add("file1.txt", 100, FileHash::hash_block(b"1"));
        collection.add("file2.txt", 200, FileHash::hash_block(b"2"));
        collection.add("file3.txt", 300, FileHash::hash_block(b"3"));
        collection
    }

    #[test]
    fn test_binary_round_trip_preserves_order() {
        let original = sample();
        let mut buf = original.to_binary();
        let decoded = Collection::from_binary(&mut buf).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(
            decoded.files.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
            vec!["file1.txt", "file2.txt", "file3.txt"]
        );
    }

    #[test]
    fn test_from_bytes_accepts_binary() {
        let original = sample();
        let decoded = Collection::from_bytes(&original.to_binary());
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_from_bytes_falls_back_to_text() {
        let original = sample();
        let text = original.to_text();
        let decoded = Collection::from_bytes(text.as_bytes());
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_text_fallback_strips_cr() {
        let text = format!("{}\r\n", sample().files[0].to_link());
        let decoded = Collection::from_bytes(text.as_bytes());
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded.files[0].name, "file1.txt");
    }

    #[test]
    fn test_garbage_yields_empty_collection() {
        let decoded = Collection::from_bytes(b"\xFF\xFFnot a collection");
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_oversize_binary_count_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le((MAX_COLLECTION_SIZE + 1) as u32);
        assert!(Collection::from_binary(&mut buf).is_err());
    }
}
