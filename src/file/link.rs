//! ed2k links
//!
//! The shareable identifier format:
//! `ed2k://|file|<filename>|<size>|<hex md4>|/` with an optional
//! `|h=<AICH root>|` part before the trailing slash.

use anyhow::Result;

use crate::error::{Ed2kError, ErrorKind};
use crate::hash::FileHash;

const LINK_PREFIX: &str = "ed2k://|file|";
const LINK_SUFFIX: &str = "|/";

/// A parsed ed2k file link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ed2kLink {
    pub name: String,
    pub size: u64,
    pub hash: FileHash,
    /// AICH root hash in its base32 text form, when present
    pub aich: Option<String>,
}

impl Ed2kLink {
    pub fn new(name: impl Into<String>, size: u64, hash: FileHash) -> Self {
        Self {
            name: name.into(),
            size,
            hash,
            aich: None,
        }
    }

    /// Parse a link, tolerating surrounding whitespace.
    pub fn parse(link: &str) -> Result<Ed2kLink> {
        let link = link.trim();
        if !link.starts_with(LINK_PREFIX) || !link.ends_with(LINK_SUFFIX) {
            return Err(bad_link("missing ed2k file link markers"));
        }

        let inner = &link[LINK_PREFIX.len()..link.len() - LINK_SUFFIX.len()];
        let mut fields = inner.split('|');

        let raw_name = fields.next().ok_or_else(|| bad_link("missing file name"))?;
        if raw_name.is_empty() {
            return Err(bad_link("empty file name"));
        }
        let name = urlencoding::decode(raw_name)
            .map_err(|e| bad_link(format!("undecodable file name: {}", e)))?
            .into_owned();

        let size_field = fields.next().ok_or_else(|| bad_link("missing file size"))?;
        let size: u64 = size_field
            .parse()
            .map_err(|_| bad_link(format!("bad file size: {:?}", size_field)))?;

        let hash_field = fields.next().ok_or_else(|| bad_link("missing file hash"))?;
        let hash = FileHash::from_hex(hash_field)?;

        let mut aich = None;
        for extra in fields {
            if let Some(root) = extra.strip_prefix("h=") {
                aich = Some(root.to_string());
            }
            // unknown parts (p=..., s=...) are ignored
        }

        Ok(Ed2kLink { name, size, hash, aich })
    }

    /// Format as a link, URL-encoding the file name.
    pub fn to_link(&self) -> String {
        let name = urlencoding::encode(&self.name);
        match &self.aich {
            Some(root) => format!("ed2k://|file|{}|{}|{}|h={}|/", name, self.size, self.hash, root),
            None => format!("ed2k://|file|{}|{}|{}|/", name, self.size, self.hash),
        }
    }
}

fn bad_link(message: impl Into<String>) -> anyhow::Error {
    Ed2kError::decode_error_with(ErrorKind::DecodePacketError, message).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_link() {
        let link = Ed2kLink::parse("ed2k://|file|xxx.avi|100|DB48A1C00CC972488C29D3FEC9F16A79|/").unwrap();
        assert_eq!(link.name, "xxx.avi");
        assert_eq!(link.size, 100);
        assert_eq!(link.hash.to_hex(), "DB48A1C00CC972488C29D3FEC9F16A79");
        assert!(link.aich.is_none());
    }

    #[test]
    fn test_parse_strips_whitespace() {
        let link = Ed2kLink::parse("  ed2k://|file|a.iso|5|31D6CFE0D16AE931B73C59D7E0C089C0|/ \n").unwrap();
        assert_eq!(link.name, "a.iso");
    }

    #[test]
    fn test_parse_aich_part() {
        let link =
            Ed2kLink::parse("ed2k://|file|a.iso|5|31D6CFE0D16AE931B73C59D7E0C089C0|h=ABCDEFGH234567|/").unwrap();
        assert_eq!(link.aich.as_deref(), Some("ABCDEFGH234567"));
    }

    #[test]
    fn test_url_encoded_name_round_trip() {
        let original = Ed2kLink::new("my movie (final).avi", 1234, FileHash::TERMINAL);
        let text = original.to_link();
        assert!(!text.contains("my movie (final)"), "name must be escaped: {}", text);
        let parsed = Ed2kLink::parse(&text).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_rejects_malformed_links() {
        assert!(Ed2kLink::parse("http://example.com/x.avi").is_err());
        assert!(Ed2kLink::parse("ed2k://|file|a|nan|31D6CFE0D16AE931B73C59D7E0C089C0|/").is_err());
        assert!(Ed2kLink::parse("ed2k://|file|a|100|SHORT|/").is_err());
        assert!(Ed2kLink::parse("ed2k://|file|a|100|31D6CFE0D16AE931B73C59D7E0C089C0").is_err());
        assert!(Ed2kLink::parse("ed2k://|file||100|31D6CFE0D16AE931B73C59D7E0C089C0|/").is_err());
    }
}
