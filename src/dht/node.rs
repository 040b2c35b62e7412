//! Kademlia node identity
//!
//! 128-bit node ids sharing the content-hash id space, XOR distance
//! ordering and the wire form of routing contacts.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::Result;
use bytes::{BufMut, BytesMut};
use md4::{Digest, Md4};
use rand::Rng;

use crate::hash::FileHash;
use crate::protocol::tag::{get_u16, get_u32, get_u8, get_hash};

/// Kademlia node id; lives in the same 128-bit space as content hashes.
pub type KadId = FileHash;

/// Derive a node id from the external IP.
///
/// Only the low 26 bits of the address contribute, salted with a random
/// byte, which keeps an attacker from grinding ids over one /6 while
/// letting the id be re-derived cheaply on address change.
pub fn kad_id_from_ip(ip: Ipv4Addr) -> KadId {
    let masked = u32::from(ip) & 0x03FF_FFFF;
    let salt: u8 = rand::thread_rng().gen();
    let mut hasher = Md4::new();
    hasher.update(masked.to_le_bytes());
    hasher.update([salt]);
    FileHash(hasher.finalize().into())
}

/// Compare two ids by distance to a target. Returns the usual ordering
/// of `a` versus `b`.
pub fn cmp_by_distance(target: &KadId, a: &KadId, b: &KadId) -> std::cmp::Ordering {
    a.distance(target).cmp(&b.distance(target))
}

/// One routing contact as carried in bootstrap and lookup responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KadContact {
    pub id: KadId,
    /// IPv4 address in wire (little-endian) order
    pub ip: u32,
    pub udp_port: u16,
    pub tcp_port: u16,
    pub version: u8,
}

impl KadContact {
    pub fn new(id: KadId, addr: SocketAddrV4, version: u8) -> Self {
        Self {
            id,
            ip: u32::from(*addr.ip()).to_be(),
            udp_port: addr.port(),
            tcp_port: addr.port(),
            version,
        }
    }

    /// UDP endpoint of this contact.
    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(self.ip.to_be()), self.udp_port))
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.id.0);
        buf.put_u32_le(self.ip);
        buf.put_u16_le(self.udp_port);
        buf.put_u16_le(self.tcp_port);
        buf.put_u8(self.version);
    }

    pub fn read(buf: &mut BytesMut) -> Result<Self> {
        let id = get_hash(buf)?;
        let ip = get_u32(buf)?;
        let udp_port = get_u16(buf)?;
        let tcp_port = get_u16(buf)?;
        let version = get_u8(buf)?;
        Ok(Self {
            id,
            ip,
            udp_port,
            tcp_port,
            version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_from_ip_is_stable_in_prefix_space() {
        // two addresses sharing the low 26 bits may produce different ids
        // thanks to the salt, but the derivation must never panic and must
        // always be defined
        let id = kad_id_from_ip(Ipv4Addr::new(88, 191, 12, 7));
        assert!(id.is_defined());
    }

    #[test]
    fn test_distance_ordering() {
        let target = FileHash([0u8; 16]);
        let near = FileHash([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
        let far = FileHash([0x80; 16]);
        assert_eq!(cmp_by_distance(&target, &near, &far), std::cmp::Ordering::Less);
    }

    #[test]
    fn test_contact_round_trip() {
        let contact = KadContact {
            id: FileHash::hash_block(b"node"),
            ip: 0x0100007F,
            udp_port: 4672,
            tcp_port: 4662,
            version: 9,
        };
        let mut buf = BytesMut::new();
        contact.write(&mut buf);
        let decoded = KadContact::read(&mut buf).unwrap();
        assert_eq!(decoded, contact);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_udp_addr_mapping() {
        let contact = KadContact::new(
            FileHash::TERMINAL,
            SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 4672),
            9,
        );
        assert_eq!(contact.udp_addr(), "10.1.2.3:4672".parse::<SocketAddr>().unwrap());
    }
}
