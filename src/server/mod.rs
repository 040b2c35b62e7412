//! Server module
//!
//! The logical link to an eDonkey index server: login, search, source
//! queries, LowID callbacks and shared-files announces.

pub mod connection;

// Re-export main types
pub use connection::{ServerConnection, ServerConnectionState};

// server capability flags advertised at login
pub const SRV_TCPFLG_COMPRESSION: u32 = 0x0000_0001;
pub const SRV_TCPFLG_NEWTAGS: u32 = 0x0000_0008;
pub const SRV_TCPFLG_UNICODE: u32 = 0x0000_0010;
pub const SRV_TCPFLG_LARGEFILES: u32 = 0x0000_0100;

use crate::hash::FileHash;
use crate::protocol::message::{NetworkPoint, SharedFileEntry};
use crate::protocol::tag::{Tag, TagList};
use crate::protocol::ft;

// sentinel endpoints announcing share state instead of a real address
const ANNOUNCE_COMPLETE: NetworkPoint = NetworkPoint { ip: 0xFBFB_FBFB, port: 0xFBFB };
const ANNOUNCE_INCOMPLETE: NetworkPoint = NetworkPoint { ip: 0xFCFB_FBFB, port: 0xFCFB };

/// Build one OFFERFILES entry. Complete and incomplete files announce
/// well-known sentinel endpoints; a directly reachable client may
/// announce its real point instead.
pub fn announce_entry(
    hash: FileHash,
    name: impl Into<String>,
    size: u64,
    complete: bool,
    own_point: Option<NetworkPoint>,
) -> SharedFileEntry {
    let point = match own_point {
        Some(point) => point,
        None if complete => ANNOUNCE_COMPLETE,
        None => ANNOUNCE_INCOMPLETE,
    };
    let mut tags = TagList::new();
    tags.push(Tag::string(ft::FT_FILENAME, name.into()));
    tags.push(Tag::uint(ft::FT_FILESIZE, size & 0xFFFF_FFFF));
    if size > u32::MAX as u64 {
        tags.push(Tag::uint(ft::FT_FILESIZE_HI, size >> 32));
    }
    SharedFileEntry { hash, point, tags }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announce_sentinels() {
        let complete = announce_entry(FileHash::TERMINAL, "a.bin", 100, true, None);
        assert_eq!(complete.point, ANNOUNCE_COMPLETE);
        let partial = announce_entry(FileHash::TERMINAL, "a.bin", 100, false, None);
        assert_eq!(partial.point, ANNOUNCE_INCOMPLETE);
    }

    #[test]
    fn test_announce_real_point_preferred() {
        let point = NetworkPoint::new(0x0100_0001, 4662);
        let entry = announce_entry(FileHash::TERMINAL, "a.bin", 100, true, Some(point));
        assert_eq!(entry.point, point);
    }

    #[test]
    fn test_announce_large_file_split_size() {
        let entry = announce_entry(FileHash::TERMINAL, "big.bin", 5 * 1024 * 1024 * 1024, true, None);
        assert!(entry.tags.find(ft::FT_FILESIZE_HI).is_some());
    }
}
