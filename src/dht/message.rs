//! DHT wire messages
//!
//! Kademlia v2 UDP packets: `{0xE4, opcode, body}` with no length
//! prefix; the datagram boundary carries it.

use anyhow::Result;
use bytes::{BufMut, BytesMut};

use crate::dht::node::{KadContact, KadId};
use crate::error::{Ed2kError, ErrorKind};
use crate::protocol::tag::{get_hash, get_u16, get_u64, get_u8, TagList};
use crate::protocol::{kad_op, MAX_COLLECTION_SIZE, OP_KADEMLIAHEADER};

/// Find-node versus find-value discriminator in `KADEMLIA2_REQ`.
pub const FIND_NODE: u8 = 0x0B;
pub const FIND_VALUE: u8 = 0x02;
pub const STORE: u8 = 0x04;

/// One keyword or source hit carried in a search response.
#[derive(Debug, Clone, PartialEq)]
pub struct KadSearchHit {
    pub answer: KadId,
    pub tags: TagList,
}

/// Kademlia v2 messages.
#[derive(Debug, Clone, PartialEq)]
pub enum KadMessage {
    Ping,
    Pong {
        udp_port: u16,
    },
    HelloReq {
        id: KadId,
        tcp_port: u16,
        version: u8,
    },
    HelloRes {
        id: KadId,
        tcp_port: u16,
        version: u8,
    },
    BootstrapReq,
    BootstrapRes {
        id: KadId,
        tcp_port: u16,
        version: u8,
        contacts: Vec<KadContact>,
    },
    /// Find nodes close to `target`; `receiver` echoes the queried id
    Req {
        find_type: u8,
        target: KadId,
        receiver: KadId,
    },
    Res {
        target: KadId,
        contacts: Vec<KadContact>,
    },
    SearchKeyReq {
        target: KadId,
        start_position: u16,
    },
    SearchSourceReq {
        target: KadId,
        start_position: u16,
        file_size: u64,
    },
    SearchNotesReq {
        target: KadId,
        file_size: u64,
    },
    SearchRes {
        target: KadId,
        hits: Vec<KadSearchHit>,
    },
}

impl KadMessage {
    /// Opcode on the wire.
    pub fn opcode(&self) -> u8 {
        match self {
            KadMessage::Ping => kad_op::KADEMLIA2_PING,
            KadMessage::Pong { .. } => kad_op::KADEMLIA2_PONG,
            KadMessage::HelloReq { .. } => kad_op::KADEMLIA2_HELLO_REQ,
            KadMessage::HelloRes { .. } => kad_op::KADEMLIA2_HELLO_RES,
            KadMessage::BootstrapReq => kad_op::KADEMLIA2_BOOTSTRAP_REQ,
            KadMessage::BootstrapRes { .. } => kad_op::KADEMLIA2_BOOTSTRAP_RES,
            KadMessage::Req { .. } => kad_op::KADEMLIA2_REQ,
            KadMessage::Res { .. } => kad_op::KADEMLIA2_RES,
            KadMessage::SearchKeyReq { .. } => kad_op::KADEMLIA2_SEARCH_KEY_REQ,
            KadMessage::SearchSourceReq { .. } => kad_op::KADEMLIA2_SEARCH_SOURCE_REQ,
            KadMessage::SearchNotesReq { .. } => kad_op::KADEMLIA2_SEARCH_NOTES_REQ,
            KadMessage::SearchRes { .. } => kad_op::KADEMLIA2_SEARCH_RES,
        }
    }

    /// The opcode expected to answer this request, if any.
    pub fn response_opcode(&self) -> Option<u8> {
        match self {
            KadMessage::Ping => Some(kad_op::KADEMLIA2_PONG),
            KadMessage::HelloReq { .. } => Some(kad_op::KADEMLIA2_HELLO_RES),
            KadMessage::BootstrapReq => Some(kad_op::KADEMLIA2_BOOTSTRAP_RES),
            KadMessage::Req { .. } => Some(kad_op::KADEMLIA2_RES),
            KadMessage::SearchKeyReq { .. }
            | KadMessage::SearchSourceReq { .. }
            | KadMessage::SearchNotesReq { .. } => Some(kad_op::KADEMLIA2_SEARCH_RES),
            _ => None,
        }
    }

    /// The kad id embedded in a reply, used as the extra transaction
    /// discriminator for lookups.
    pub fn packet_kad_id(&self) -> Option<KadId> {
        match self {
            KadMessage::Res { target, .. } => Some(*target),
            KadMessage::SearchRes { target, .. } => Some(*target),
            _ => None,
        }
    }

    /// Serialize into a full UDP datagram.
    pub fn to_datagram(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(OP_KADEMLIAHEADER);
        buf.put_u8(self.opcode());
        self.write_body(&mut buf);
        buf
    }

    fn write_body(&self, buf: &mut BytesMut) {
        match self {
            KadMessage::Ping | KadMessage::BootstrapReq => {}
            KadMessage::Pong { udp_port } => buf.put_u16_le(*udp_port),
            KadMessage::HelloReq { id, tcp_port, version } | KadMessage::HelloRes { id, tcp_port, version } => {
                buf.put_slice(&id.0);
                buf.put_u16_le(*tcp_port);
                buf.put_u8(*version);
            }
            KadMessage::BootstrapRes {
                id,
                tcp_port,
                version,
                contacts,
            } => {
                buf.put_slice(&id.0);
                buf.put_u16_le(*tcp_port);
                buf.put_u8(*version);
                buf.put_u16_le(contacts.len() as u16);
                for contact in contacts {
                    contact.write(buf);
                }
            }
            KadMessage::Req {
                find_type,
                target,
                receiver,
            } => {
                buf.put_u8(*find_type);
                buf.put_slice(&target.0);
                buf.put_slice(&receiver.0);
            }
            KadMessage::Res { target, contacts } => {
                buf.put_slice(&target.0);
                buf.put_u8(contacts.len() as u8);
                for contact in contacts {
                    contact.write(buf);
                }
            }
            KadMessage::SearchKeyReq { target, start_position } => {
                buf.put_slice(&target.0);
                buf.put_u16_le(*start_position);
            }
            KadMessage::SearchSourceReq {
                target,
                start_position,
                file_size,
            } => {
                buf.put_slice(&target.0);
                buf.put_u16_le(*start_position);
                buf.put_u64_le(*file_size);
            }
            KadMessage::SearchNotesReq { target, file_size } => {
                buf.put_slice(&target.0);
                buf.put_u64_le(*file_size);
            }
            KadMessage::SearchRes { target, hits } => {
                buf.put_slice(&target.0);
                buf.put_u16_le(hits.len() as u16);
                for hit in hits {
                    buf.put_slice(&hit.answer.0);
                    hit.tags.write_u8(buf);
                }
            }
        }
    }

    /// Decode a full UDP datagram.
    pub fn from_datagram(data: &[u8]) -> Result<KadMessage> {
        let mut buf = BytesMut::from(data);
        let proto = get_u8(&mut buf)?;
        if proto != OP_KADEMLIAHEADER {
            return Err(Ed2kError::decode_error_with(
                ErrorKind::InvalidProtocolType,
                format!("not a kademlia datagram: 0x{:02X}", proto),
            )
            .into());
        }
        let opcode = get_u8(&mut buf)?;
        Self::read_body(opcode, &mut buf)
    }

    fn read_body(opcode: u8, buf: &mut BytesMut) -> Result<KadMessage> {
        match opcode {
            kad_op::KADEMLIA2_PING => Ok(KadMessage::Ping),
            kad_op::KADEMLIA2_PONG => Ok(KadMessage::Pong {
                udp_port: get_u16(buf)?,
            }),
            kad_op::KADEMLIA2_HELLO_REQ | kad_op::KADEMLIA2_HELLO_RES => {
                let id = get_hash(buf)?;
                let tcp_port = get_u16(buf)?;
                let version = get_u8(buf)?;
                if opcode == kad_op::KADEMLIA2_HELLO_REQ {
                    Ok(KadMessage::HelloReq { id, tcp_port, version })
                } else {
                    Ok(KadMessage::HelloRes { id, tcp_port, version })
                }
            }
            kad_op::KADEMLIA2_BOOTSTRAP_REQ => Ok(KadMessage::BootstrapReq),
            kad_op::KADEMLIA2_BOOTSTRAP_RES => {
                let id = get_hash(buf)?;
                let tcp_port = get_u16(buf)?;
                let version = get_u8(buf)?;
                let count = get_u16(buf)? as usize;
                if count > MAX_COLLECTION_SIZE {
                    return Err(Ed2kError::decode_error(ErrorKind::DecodePacketError).into());
                }
                let mut contacts = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    contacts.push(KadContact::read(buf)?);
                }
                Ok(KadMessage::BootstrapRes {
                    id,
                    tcp_port,
                    version,
                    contacts,
                })
            }
            kad_op::KADEMLIA2_REQ => {
                let find_type = get_u8(buf)?;
                let target = get_hash(buf)?;
                let receiver = get_hash(buf)?;
                Ok(KadMessage::Req {
                    find_type,
                    target,
                    receiver,
                })
            }
            kad_op::KADEMLIA2_RES => {
                let target = get_hash(buf)?;
                let count = get_u8(buf)? as usize;
                let mut contacts = Vec::with_capacity(count);
                for _ in 0..count {
                    contacts.push(KadContact::read(buf)?);
                }
                Ok(KadMessage::Res { target, contacts })
            }
            kad_op::KADEMLIA2_SEARCH_KEY_REQ => Ok(KadMessage::SearchKeyReq {
                target: get_hash(buf)?,
                start_position: get_u16(buf)?,
            }),
            kad_op::KADEMLIA2_SEARCH_SOURCE_REQ => Ok(KadMessage::SearchSourceReq {
                target: get_hash(buf)?,
                start_position: get_u16(buf)?,
                file_size: get_u64(buf)?,
            }),
            kad_op::KADEMLIA2_SEARCH_NOTES_REQ => Ok(KadMessage::SearchNotesReq {
                target: get_hash(buf)?,
                file_size: get_u64(buf)?,
            }),
            kad_op::KADEMLIA2_SEARCH_RES => {
                let target = get_hash(buf)?;
                let count = get_u16(buf)? as usize;
                if count > MAX_COLLECTION_SIZE {
                    return Err(Ed2kError::decode_error(ErrorKind::DecodePacketError).into());
                }
                let mut hits = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    let answer = get_hash(buf)?;
                    let tags = TagList::read_u8(buf)?;
                    hits.push(KadSearchHit { answer, tags });
                }
                Ok(KadMessage::SearchRes { target, hits })
            }
            op => Err(Ed2kError::decode_error_with(
                ErrorKind::UnsupportedPackedType,
                format!("unknown kad opcode: 0x{:02X}", op),
            )
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::FileHash;
    use crate::protocol::tag::Tag;
    use crate::protocol::ft;
    use std::net::SocketAddrV4;

    fn round_trip(msg: &KadMessage) -> KadMessage {
        KadMessage::from_datagram(&msg.to_datagram()).unwrap()
    }

    fn contact(seed: u8) -> KadContact {
        KadContact::new(
            FileHash::hash_block(&[seed]),
            SocketAddrV4::new([10, 0, 0, seed].into(), 4672),
            9,
        )
    }

    #[test]
    fn test_ping_pong_round_trip() {
        assert_eq!(round_trip(&KadMessage::Ping), KadMessage::Ping);
        let pong = KadMessage::Pong { udp_port: 4672 };
        assert_eq!(round_trip(&pong), pong);
    }

    #[test]
    fn test_datagram_has_kad_header() {
        let datagram = KadMessage::Ping.to_datagram();
        assert_eq!(datagram[0], OP_KADEMLIAHEADER);
        assert_eq!(datagram[1], kad_op::KADEMLIA2_PING);
    }

    #[test]
    fn test_hello_round_trip() {
        let msg = KadMessage::HelloReq {
            id: FileHash::hash_block(b"self"),
            tcp_port: 4662,
            version: 9,
        };
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_bootstrap_res_round_trip() {
        let msg = KadMessage::BootstrapRes {
            id: FileHash::hash_block(b"router"),
            tcp_port: 4662,
            version: 9,
            contacts: vec![contact(1), contact(2), contact(3)],
        };
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_req_res_round_trip() {
        let req = KadMessage::Req {
            find_type: FIND_NODE,
            target: FileHash::hash_block(b"t"),
            receiver: FileHash::hash_block(b"r"),
        };
        assert_eq!(round_trip(&req), req);
        assert_eq!(req.response_opcode(), Some(kad_op::KADEMLIA2_RES));

        let res = KadMessage::Res {
            target: FileHash::hash_block(b"t"),
            contacts: vec![contact(4)],
        };
        assert_eq!(round_trip(&res), res);
        assert_eq!(res.packet_kad_id(), Some(FileHash::hash_block(b"t")));
    }

    #[test]
    fn test_search_source_round_trip() {
        let msg = KadMessage::SearchSourceReq {
            target: FileHash::hash_block(b"file"),
            start_position: 0,
            file_size: 123_456_789,
        };
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_search_res_round_trip() {
        let mut tags = TagList::new();
        tags.push(Tag::string(ft::FT_FILENAME, "hit.avi"));
        tags.push(Tag::uint(ft::FT_FILESIZE, 5000));
        let msg = KadMessage::SearchRes {
            target: FileHash::hash_block(b"kw"),
            hits: vec![KadSearchHit {
                answer: FileHash::hash_block(b"file"),
                tags,
            }],
        };
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_non_kad_datagram_rejected() {
        assert!(KadMessage::from_datagram(&[0xE3, 0x60]).is_err());
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        assert!(KadMessage::from_datagram(&[0xE4, 0xFF]).is_err());
    }
}
