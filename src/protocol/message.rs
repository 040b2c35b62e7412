//! ed2k protocol messages
//!
//! Typed client<->server and client<->client messages with their wire
//! serialization. Layouts follow the classic eDonkey framing: little
//! endian integers, u16-length strings, counted containers.

use anyhow::Result;
use bytes::{Buf, BufMut, BytesMut};
use tracing::trace;

use crate::error::{Ed2kError, ErrorKind};
use crate::hash::FileHash;
use crate::protocol::tag::{ensure_len, get_hash, get_u16, get_u32, get_u64, get_u8, put_string_u16, read_string_u16, TagList};
use crate::protocol::{emule_op, peer_op, search::SearchRequest, server_op, MAX_COLLECTION_SIZE, OP_EDONKEYPROT, OP_EMULEPROT};

/// An IPv4 endpoint as carried on the ed2k wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NetworkPoint {
    /// Address (or client id) in little-endian wire order
    pub ip: u32,
    /// TCP port
    pub port: u16,
}

impl NetworkPoint {
    pub fn new(ip: u32, port: u16) -> Self {
        Self { ip, port }
    }

    /// An entry with a zero address or port carries no routing information.
    pub fn is_empty(&self) -> bool {
        self.ip == 0 || self.port == 0
    }

    /// LowID values identify firewalled clients reachable only by callback.
    pub fn is_low_id(&self) -> bool {
        self.ip < crate::protocol::HIGHID_LOWEST
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.ip);
        buf.put_u16_le(self.port);
    }

    pub fn read(buf: &mut BytesMut) -> Result<Self> {
        let ip = get_u32(buf)?;
        let port = get_u16(buf)?;
        Ok(Self { ip, port })
    }

    /// Dotted-quad form of the address.
    pub fn to_socket_addr(&self) -> std::net::SocketAddrV4 {
        std::net::SocketAddrV4::new(std::net::Ipv4Addr::from(self.ip.to_be()), self.port)
    }
}

/// One announced or found shared file.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedFileEntry {
    pub hash: FileHash,
    pub point: NetworkPoint,
    pub tags: TagList,
}

impl SharedFileEntry {
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.hash.0);
        self.point.write(buf);
        self.tags.write_u32(buf);
    }

    pub fn read(buf: &mut BytesMut) -> Result<Self> {
        let hash = get_hash(buf)?;
        let point = NetworkPoint::read(buf)?;
        let tags = TagList::read_u32(buf)?;
        Ok(Self { hash, point, tags })
    }
}

fn check_count(count: usize) -> Result<()> {
    if count > MAX_COLLECTION_SIZE {
        return Err(Ed2kError::decode_error_with(
            ErrorKind::DecodePacketError,
            format!("container too large: {}", count),
        )
        .into());
    }
    Ok(())
}

/// Messages exchanged with an index server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    // client -> server
    LoginRequest {
        hash: FileHash,
        point: NetworkPoint,
        tags: TagList,
    },
    GetServerList,
    OfferFiles(Vec<SharedFileEntry>),
    SearchRequest(SearchRequest),
    QueryMoreResult,
    GetSources {
        hash: FileHash,
        size: u64,
    },
    CallbackRequest {
        client_id: u32,
    },
    // server -> client
    Reject,
    ServerList(Vec<NetworkPoint>),
    SearchResult {
        entries: Vec<SharedFileEntry>,
        more: bool,
    },
    ServerStatus {
        users: u32,
        files: u32,
    },
    CallbackRequested(NetworkPoint),
    CallbackFailed,
    ServerText(String),
    IdChange {
        client_id: u32,
        tcp_flags: u32,
    },
    ServerIdent {
        hash: FileHash,
        point: NetworkPoint,
        tags: TagList,
    },
    FoundSources {
        hash: FileHash,
        sources: Vec<NetworkPoint>,
    },
}

impl ServerMessage {
    /// Opcode used on the wire.
    pub fn opcode(&self) -> u8 {
        match self {
            ServerMessage::LoginRequest { .. } => server_op::LOGINREQUEST,
            ServerMessage::GetServerList => server_op::GETSERVERLIST,
            ServerMessage::OfferFiles(_) => server_op::OFFERFILES,
            ServerMessage::SearchRequest(_) => server_op::SEARCHREQUEST,
            ServerMessage::QueryMoreResult => server_op::QUERY_MORE_RESULT,
            ServerMessage::GetSources { .. } => server_op::GETSOURCES,
            ServerMessage::CallbackRequest { .. } => server_op::CALLBACKREQUEST,
            ServerMessage::Reject => server_op::REJECT,
            ServerMessage::ServerList(_) => server_op::SERVERLIST,
            ServerMessage::SearchResult { .. } => server_op::SEARCHRESULT,
            ServerMessage::ServerStatus { .. } => server_op::SERVERSTATUS,
            ServerMessage::CallbackRequested(_) => server_op::CALLBACKREQUESTED,
            ServerMessage::CallbackFailed => server_op::CALLBACK_FAIL,
            ServerMessage::ServerText(_) => server_op::SERVERMESSAGE,
            ServerMessage::IdChange { .. } => server_op::IDCHANGE,
            ServerMessage::ServerIdent { .. } => server_op::SERVERIDENT,
            ServerMessage::FoundSources { .. } => server_op::FOUNDSOURCES,
        }
    }

    /// Serialize the body; the frame codec adds the header.
    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        match self {
            ServerMessage::LoginRequest { hash, point, tags } => {
                buf.put_slice(&hash.0);
                point.write(&mut buf);
                tags.write_u32(&mut buf);
            }
            ServerMessage::GetServerList | ServerMessage::QueryMoreResult | ServerMessage::Reject | ServerMessage::CallbackFailed => {}
            ServerMessage::OfferFiles(entries) => {
                buf.put_u32_le(entries.len() as u32);
                for entry in entries {
                    entry.write(&mut buf);
                }
            }
            ServerMessage::SearchRequest(request) => {
                request.write(&mut buf);
            }
            ServerMessage::GetSources { hash, size } => {
                buf.put_slice(&hash.0);
                if *size > u32::MAX as u64 {
                    // large-file framing: zero sentinel then 64-bit size
                    buf.put_u32_le(0);
                    buf.put_u64_le(*size);
                } else {
                    buf.put_u32_le(*size as u32);
                }
            }
            ServerMessage::CallbackRequest { client_id } => {
                buf.put_u32_le(*client_id);
            }
            ServerMessage::ServerList(points) => {
                buf.put_u8(points.len() as u8);
                for point in points {
                    point.write(&mut buf);
                }
            }
            ServerMessage::SearchResult { entries, more } => {
                buf.put_u32_le(entries.len() as u32);
                for entry in entries {
                    entry.write(&mut buf);
                }
                buf.put_u8(*more as u8);
            }
            ServerMessage::ServerStatus { users, files } => {
                buf.put_u32_le(*users);
                buf.put_u32_le(*files);
            }
            ServerMessage::CallbackRequested(point) => {
                point.write(&mut buf);
            }
            ServerMessage::ServerText(text) => {
                put_string_u16(&mut buf, text);
            }
            ServerMessage::IdChange { client_id, tcp_flags } => {
                buf.put_u32_le(*client_id);
                buf.put_u32_le(*tcp_flags);
            }
            ServerMessage::ServerIdent { hash, point, tags } => {
                buf.put_slice(&hash.0);
                point.write(&mut buf);
                tags.write_u32(&mut buf);
            }
            ServerMessage::FoundSources { hash, sources } => {
                buf.put_slice(&hash.0);
                buf.put_u8(sources.len() as u8);
                for point in sources {
                    point.write(&mut buf);
                }
            }
        }
        buf
    }

    /// Decode a server message body by opcode.
    pub fn deserialize(opcode: u8, buf: &mut BytesMut) -> Result<ServerMessage> {
        trace!("server message opcode=0x{:02X} body={}B", opcode, buf.len());
        match opcode {
            server_op::LOGINREQUEST => {
                let hash = get_hash(buf)?;
                let point = NetworkPoint::read(buf)?;
                let tags = TagList::read_u32(buf)?;
                Ok(ServerMessage::LoginRequest { hash, point, tags })
            }
            server_op::GETSERVERLIST => Ok(ServerMessage::GetServerList),
            server_op::QUERY_MORE_RESULT => Ok(ServerMessage::QueryMoreResult),
            server_op::REJECT => Ok(ServerMessage::Reject),
            server_op::CALLBACK_FAIL => Ok(ServerMessage::CallbackFailed),
            server_op::OFFERFILES => {
                let count = get_u32(buf)? as usize;
                check_count(count)?;
                let mut entries = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    entries.push(SharedFileEntry::read(buf)?);
                }
                Ok(ServerMessage::OfferFiles(entries))
            }
            server_op::SEARCHREQUEST => Ok(ServerMessage::SearchRequest(SearchRequest::read(buf)?)),
            server_op::GETSOURCES => {
                let hash = get_hash(buf)?;
                // probe the large-file framing first: zero sentinel + u64
                let size = if buf.len() == 12 {
                    let sentinel = get_u32(buf)?;
                    let wide = get_u64(buf)?;
                    if sentinel != 0 {
                        return Err(Ed2kError::decode_error(ErrorKind::DecodePacketError).into());
                    }
                    wide
                } else {
                    get_u32(buf)? as u64
                };
                Ok(ServerMessage::GetSources { hash, size })
            }
            server_op::CALLBACKREQUEST => Ok(ServerMessage::CallbackRequest {
                client_id: get_u32(buf)?,
            }),
            server_op::SERVERLIST => {
                let count = get_u8(buf)? as usize;
                let mut points = Vec::with_capacity(count);
                for _ in 0..count {
                    points.push(NetworkPoint::read(buf)?);
                }
                Ok(ServerMessage::ServerList(points))
            }
            server_op::SEARCHRESULT => {
                let count = get_u32(buf)? as usize;
                check_count(count)?;
                let mut entries = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    entries.push(SharedFileEntry::read(buf)?);
                }
                let more = !buf.is_empty() && get_u8(buf)? != 0;
                Ok(ServerMessage::SearchResult { entries, more })
            }
            server_op::SERVERSTATUS => Ok(ServerMessage::ServerStatus {
                users: get_u32(buf)?,
                files: get_u32(buf)?,
            }),
            server_op::CALLBACKREQUESTED => Ok(ServerMessage::CallbackRequested(NetworkPoint::read(buf)?)),
            server_op::SERVERMESSAGE => Ok(ServerMessage::ServerText(read_string_u16(buf)?)),
            server_op::IDCHANGE => {
                let client_id = get_u32(buf)?;
                // the flags word is absent on older servers
                let tcp_flags = if buf.len() >= 4 { get_u32(buf)? } else { 0 };
                Ok(ServerMessage::IdChange { client_id, tcp_flags })
            }
            server_op::SERVERIDENT => {
                let hash = get_hash(buf)?;
                let point = NetworkPoint::read(buf)?;
                let tags = TagList::read_u32(buf)?;
                Ok(ServerMessage::ServerIdent { hash, point, tags })
            }
            server_op::FOUNDSOURCES => {
                let hash = get_hash(buf)?;
                let count = get_u8(buf)? as usize;
                let mut sources = Vec::with_capacity(count);
                for _ in 0..count {
                    sources.push(NetworkPoint::read(buf)?);
                }
                Ok(ServerMessage::FoundSources { hash, sources })
            }
            op => Err(Ed2kError::decode_error_with(
                ErrorKind::DecodePacketError,
                format!("unknown server opcode: 0x{:02X}", op),
            )
            .into()),
        }
    }
}

/// Messages exchanged between two clients.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    Hello {
        hash: FileHash,
        point: NetworkPoint,
        tags: TagList,
        server_point: NetworkPoint,
    },
    HelloAnswer {
        hash: FileHash,
        point: NetworkPoint,
        tags: TagList,
        server_point: NetworkPoint,
    },
    EmuleInfo {
        version: u8,
        protocol: u8,
        tags: TagList,
    },
    EmuleInfoAnswer {
        version: u8,
        protocol: u8,
        tags: TagList,
    },
    FileRequest {
        hash: FileHash,
    },
    NoSuchFile {
        hash: FileHash,
    },
    FileNameRequest {
        hash: FileHash,
    },
    FileNameAnswer {
        hash: FileHash,
        name: String,
    },
    FileStatus {
        hash: FileHash,
        pieces: u16,
        bitfield: Vec<u8>,
    },
    HashsetRequest {
        hash: FileHash,
    },
    HashsetAnswer {
        hash: FileHash,
        hashes: Vec<FileHash>,
    },
    StartUpload {
        hash: FileHash,
    },
    AcceptUpload,
    QueueRanking {
        rank: u16,
    },
    QueueFull,
    CancelTransfer,
    OutOfParts,
    RequestParts32 {
        hash: FileHash,
        begins: [u32; 3],
        ends: [u32; 3],
    },
    RequestParts64 {
        hash: FileHash,
        begins: [u64; 3],
        ends: [u64; 3],
    },
    SendingPart32 {
        hash: FileHash,
        begin: u32,
        end: u32,
        data: Vec<u8>,
    },
    SendingPart64 {
        hash: FileHash,
        begin: u64,
        end: u64,
        data: Vec<u8>,
    },
    CompressedPart32 {
        hash: FileHash,
        begin: u32,
        packed_len: u32,
        data: Vec<u8>,
    },
    CompressedPart64 {
        hash: FileHash,
        begin: u64,
        packed_len: u32,
        data: Vec<u8>,
    },
    EndOfDownload {
        hash: FileHash,
    },
    ChatMessage(String),
    PublicIpRequest,
    PublicIpAnswer {
        ip: u32,
    },
}

impl PeerMessage {
    /// `(protocol, opcode)` pair used on the wire.
    pub fn wire_id(&self) -> (u8, u8) {
        match self {
            PeerMessage::Hello { .. } => (OP_EDONKEYPROT, peer_op::HELLO),
            PeerMessage::HelloAnswer { .. } => (OP_EDONKEYPROT, peer_op::HELLOANSWER),
            PeerMessage::EmuleInfo { .. } => (OP_EMULEPROT, emule_op::EMULEINFO),
            PeerMessage::EmuleInfoAnswer { .. } => (OP_EMULEPROT, emule_op::EMULEINFOANSWER),
            PeerMessage::FileRequest { .. } => (OP_EDONKEYPROT, peer_op::SETREQFILEID),
            PeerMessage::NoSuchFile { .. } => (OP_EDONKEYPROT, peer_op::FILEREQANSNOFIL),
            PeerMessage::FileNameRequest { .. } => (OP_EDONKEYPROT, peer_op::REQUESTFILENAME),
            PeerMessage::FileNameAnswer { .. } => (OP_EDONKEYPROT, peer_op::REQFILENAMEANSWER),
            PeerMessage::FileStatus { .. } => (OP_EDONKEYPROT, peer_op::FILESTATUS),
            PeerMessage::HashsetRequest { .. } => (OP_EDONKEYPROT, peer_op::HASHSETREQUEST),
            PeerMessage::HashsetAnswer { .. } => (OP_EDONKEYPROT, peer_op::HASHSETANSWER),
            PeerMessage::StartUpload { .. } => (OP_EDONKEYPROT, peer_op::STARTUPLOADREQ),
            PeerMessage::AcceptUpload => (OP_EDONKEYPROT, peer_op::ACCEPTUPLOADREQ),
            PeerMessage::QueueRanking { .. } => (OP_EMULEPROT, emule_op::QUEUERANKING),
            PeerMessage::QueueFull => (OP_EMULEPROT, emule_op::QUEUEFULL),
            PeerMessage::CancelTransfer => (OP_EDONKEYPROT, peer_op::CANCELTRANSFER),
            PeerMessage::OutOfParts => (OP_EDONKEYPROT, peer_op::OUTOFPARTREQS),
            PeerMessage::RequestParts32 { .. } => (OP_EDONKEYPROT, peer_op::REQUESTPARTS),
            PeerMessage::RequestParts64 { .. } => (OP_EMULEPROT, emule_op::REQUESTPARTS_I64),
            PeerMessage::SendingPart32 { .. } => (OP_EDONKEYPROT, peer_op::SENDINGPART),
            PeerMessage::SendingPart64 { .. } => (OP_EMULEPROT, emule_op::SENDINGPART_I64),
            PeerMessage::CompressedPart32 { .. } => (OP_EMULEPROT, emule_op::COMPRESSEDPART),
            PeerMessage::CompressedPart64 { .. } => (OP_EMULEPROT, emule_op::COMPRESSEDPART_I64),
            PeerMessage::EndOfDownload { .. } => (OP_EDONKEYPROT, peer_op::END_OF_DOWNLOAD),
            PeerMessage::ChatMessage(_) => (OP_EDONKEYPROT, peer_op::MESSAGE),
            PeerMessage::PublicIpRequest => (OP_EMULEPROT, emule_op::PUBLICIP_REQ),
            PeerMessage::PublicIpAnswer { .. } => (OP_EMULEPROT, emule_op::PUBLICIP_ANSWER),
        }
    }

    /// Serialize the body; the frame codec adds the header.
    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        match self {
            PeerMessage::Hello { hash, point, tags, server_point } => {
                // HELLO alone leads with the hash length
                buf.put_u8(16);
                buf.put_slice(&hash.0);
                point.write(&mut buf);
                tags.write_u32(&mut buf);
                server_point.write(&mut buf);
            }
            PeerMessage::HelloAnswer { hash, point, tags, server_point } => {
                buf.put_slice(&hash.0);
                point.write(&mut buf);
                tags.write_u32(&mut buf);
                server_point.write(&mut buf);
            }
            PeerMessage::EmuleInfo { version, protocol, tags }
            | PeerMessage::EmuleInfoAnswer { version, protocol, tags } => {
                buf.put_u8(*version);
                buf.put_u8(*protocol);
                tags.write_u32(&mut buf);
            }
            PeerMessage::FileRequest { hash }
            | PeerMessage::NoSuchFile { hash }
            | PeerMessage::FileNameRequest { hash }
            | PeerMessage::HashsetRequest { hash }
            | PeerMessage::StartUpload { hash }
            | PeerMessage::EndOfDownload { hash } => {
                buf.put_slice(&hash.0);
            }
            PeerMessage::FileNameAnswer { hash, name } => {
                buf.put_slice(&hash.0);
                put_string_u16(&mut buf, name);
            }
            PeerMessage::FileStatus { hash, pieces, bitfield } => {
                buf.put_slice(&hash.0);
                buf.put_u16_le(*pieces);
                buf.put_slice(bitfield);
            }
            PeerMessage::HashsetAnswer { hash, hashes } => {
                buf.put_slice(&hash.0);
                buf.put_u16_le(hashes.len() as u16);
                for h in hashes {
                    buf.put_slice(&h.0);
                }
            }
            PeerMessage::AcceptUpload
            | PeerMessage::QueueFull
            | PeerMessage::CancelTransfer
            | PeerMessage::OutOfParts
            | PeerMessage::PublicIpRequest => {}
            PeerMessage::QueueRanking { rank } => {
                buf.put_u16_le(*rank);
            }
            PeerMessage::RequestParts32 { hash, begins, ends } => {
                buf.put_slice(&hash.0);
                for b in begins {
                    buf.put_u32_le(*b);
                }
                for e in ends {
                    buf.put_u32_le(*e);
                }
            }
            PeerMessage::RequestParts64 { hash, begins, ends } => {
                buf.put_slice(&hash.0);
                for b in begins {
                    buf.put_u64_le(*b);
                }
                for e in ends {
                    buf.put_u64_le(*e);
                }
            }
            PeerMessage::SendingPart32 { hash, begin, end, data } => {
                buf.put_slice(&hash.0);
                buf.put_u32_le(*begin);
                buf.put_u32_le(*end);
                buf.put_slice(data);
            }
            PeerMessage::SendingPart64 { hash, begin, end, data } => {
                buf.put_slice(&hash.0);
                buf.put_u64_le(*begin);
                buf.put_u64_le(*end);
                buf.put_slice(data);
            }
            PeerMessage::CompressedPart32 { hash, begin, packed_len, data } => {
                buf.put_slice(&hash.0);
                buf.put_u32_le(*begin);
                buf.put_u32_le(*packed_len);
                buf.put_slice(data);
            }
            PeerMessage::CompressedPart64 { hash, begin, packed_len, data } => {
                buf.put_slice(&hash.0);
                buf.put_u64_le(*begin);
                buf.put_u32_le(*packed_len);
                buf.put_slice(data);
            }
            PeerMessage::ChatMessage(text) => {
                put_string_u16(&mut buf, text);
            }
            PeerMessage::PublicIpAnswer { ip } => {
                buf.put_u32_le(*ip);
            }
        }
        buf
    }

    /// Decode a peer message body by `(protocol, opcode)`.
    pub fn deserialize(protocol: u8, opcode: u8, buf: &mut BytesMut) -> Result<PeerMessage> {
        trace!("peer message proto=0x{:02X} opcode=0x{:02X} body={}B", protocol, opcode, buf.len());
        if protocol == OP_EMULEPROT {
            return Self::deserialize_emule(opcode, buf);
        }
        match opcode {
            peer_op::HELLO => {
                let hash_len = get_u8(buf)?;
                if hash_len != 16 {
                    return Err(Ed2kError::decode_error_with(
                        ErrorKind::DecodePacketError,
                        format!("unexpected hello hash length: {}", hash_len),
                    )
                    .into());
                }
                let hash = get_hash(buf)?;
                let point = NetworkPoint::read(buf)?;
                let tags = TagList::read_u32(buf)?;
                let server_point = NetworkPoint::read(buf)?;
                Ok(PeerMessage::Hello { hash, point, tags, server_point })
            }
            peer_op::HELLOANSWER => {
                let hash = get_hash(buf)?;
                let point = NetworkPoint::read(buf)?;
                let tags = TagList::read_u32(buf)?;
                let server_point = NetworkPoint::read(buf)?;
                Ok(PeerMessage::HelloAnswer { hash, point, tags, server_point })
            }
            peer_op::SETREQFILEID => Ok(PeerMessage::FileRequest { hash: get_hash(buf)? }),
            peer_op::FILEREQANSNOFIL => Ok(PeerMessage::NoSuchFile { hash: get_hash(buf)? }),
            peer_op::REQUESTFILENAME => Ok(PeerMessage::FileNameRequest { hash: get_hash(buf)? }),
            peer_op::REQFILENAMEANSWER => {
                let hash = get_hash(buf)?;
                let name = read_string_u16(buf)?;
                Ok(PeerMessage::FileNameAnswer { hash, name })
            }
            peer_op::FILESTATUS => {
                let hash = get_hash(buf)?;
                let pieces = get_u16(buf)?;
                let nbytes = (pieces as usize + 7) / 8;
                ensure_len(buf, nbytes)?;
                let mut bitfield = vec![0u8; nbytes];
                buf.copy_to_slice(&mut bitfield);
                Ok(PeerMessage::FileStatus { hash, pieces, bitfield })
            }
            peer_op::HASHSETREQUEST => Ok(PeerMessage::HashsetRequest { hash: get_hash(buf)? }),
            peer_op::HASHSETANSWER => {
                let hash = get_hash(buf)?;
                let count = get_u16(buf)? as usize;
                check_count(count)?;
                let mut hashes = Vec::with_capacity(count);
                for _ in 0..count {
                    hashes.push(get_hash(buf)?);
                }
                Ok(PeerMessage::HashsetAnswer { hash, hashes })
            }
            peer_op::STARTUPLOADREQ => Ok(PeerMessage::StartUpload { hash: get_hash(buf)? }),
            peer_op::ACCEPTUPLOADREQ => Ok(PeerMessage::AcceptUpload),
            peer_op::CANCELTRANSFER => Ok(PeerMessage::CancelTransfer),
            peer_op::OUTOFPARTREQS => Ok(PeerMessage::OutOfParts),
            peer_op::REQUESTPARTS => {
                let hash = get_hash(buf)?;
                let mut begins = [0u32; 3];
                let mut ends = [0u32; 3];
                for b in &mut begins {
                    *b = get_u32(buf)?;
                }
                for e in &mut ends {
                    *e = get_u32(buf)?;
                }
                Ok(PeerMessage::RequestParts32 { hash, begins, ends })
            }
            peer_op::SENDINGPART => {
                let hash = get_hash(buf)?;
                let begin = get_u32(buf)?;
                let end = get_u32(buf)?;
                let data = buf.split_to(buf.len()).to_vec();
                Ok(PeerMessage::SendingPart32 { hash, begin, end, data })
            }
            peer_op::END_OF_DOWNLOAD => Ok(PeerMessage::EndOfDownload { hash: get_hash(buf)? }),
            peer_op::MESSAGE => Ok(PeerMessage::ChatMessage(read_string_u16(buf)?)),
            op => Err(Ed2kError::decode_error_with(
                ErrorKind::DecodePacketError,
                format!("unknown peer opcode: 0x{:02X}", op),
            )
            .into()),
        }
    }

    fn deserialize_emule(opcode: u8, buf: &mut BytesMut) -> Result<PeerMessage> {
        match opcode {
            emule_op::EMULEINFO | emule_op::EMULEINFOANSWER => {
                let version = get_u8(buf)?;
                let protocol = get_u8(buf)?;
                let tags = TagList::read_u32(buf)?;
                if opcode == emule_op::EMULEINFO {
                    Ok(PeerMessage::EmuleInfo { version, protocol, tags })
                } else {
                    Ok(PeerMessage::EmuleInfoAnswer { version, protocol, tags })
                }
            }
            emule_op::QUEUERANKING => Ok(PeerMessage::QueueRanking { rank: get_u16(buf)? }),
            emule_op::QUEUEFULL => Ok(PeerMessage::QueueFull),
            emule_op::REQUESTPARTS_I64 => {
                let hash = get_hash(buf)?;
                let mut begins = [0u64; 3];
                let mut ends = [0u64; 3];
                for b in &mut begins {
                    *b = get_u64(buf)?;
                }
                for e in &mut ends {
                    *e = get_u64(buf)?;
                }
                Ok(PeerMessage::RequestParts64 { hash, begins, ends })
            }
            emule_op::SENDINGPART_I64 => {
                let hash = get_hash(buf)?;
                let begin = get_u64(buf)?;
                let end = get_u64(buf)?;
                let data = buf.split_to(buf.len()).to_vec();
                Ok(PeerMessage::SendingPart64 { hash, begin, end, data })
            }
            emule_op::COMPRESSEDPART => {
                let hash = get_hash(buf)?;
                let begin = get_u32(buf)?;
                let packed_len = get_u32(buf)?;
                let data = buf.split_to(buf.len()).to_vec();
                Ok(PeerMessage::CompressedPart32 { hash, begin, packed_len, data })
            }
            emule_op::COMPRESSEDPART_I64 => {
                let hash = get_hash(buf)?;
                let begin = get_u64(buf)?;
                let packed_len = get_u32(buf)?;
                let data = buf.split_to(buf.len()).to_vec();
                Ok(PeerMessage::CompressedPart64 { hash, begin, packed_len, data })
            }
            emule_op::PUBLICIP_REQ => Ok(PeerMessage::PublicIpRequest),
            emule_op::PUBLICIP_ANSWER => Ok(PeerMessage::PublicIpAnswer { ip: get_u32(buf)? }),
            op => Err(Ed2kError::decode_error_with(
                ErrorKind::DecodePacketError,
                format!("unknown emule opcode: 0x{:02X}", op),
            )
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::tag::Tag;
    use crate::protocol::{ct, ft};

    fn server_round_trip(msg: &ServerMessage) -> ServerMessage {
        let mut body = msg.serialize();
        ServerMessage::deserialize(msg.opcode(), &mut body).unwrap()
    }

    fn peer_round_trip(msg: &PeerMessage) -> PeerMessage {
        let (protocol, opcode) = msg.wire_id();
        let mut body = msg.serialize();
        PeerMessage::deserialize(protocol, opcode, &mut body).unwrap()
    }

    fn test_hash() -> FileHash {
        FileHash::hash_block(b"round trip")
    }

    #[test]
    fn test_login_round_trip() {
        let mut tags = TagList::new();
        tags.push(Tag::string(ct::CT_NAME, "client"));
        tags.push(Tag::uint(ct::CT_VERSION, 0x3C));
        let msg = ServerMessage::LoginRequest {
            hash: test_hash(),
            point: NetworkPoint::new(0, 4662),
            tags,
        };
        assert_eq!(server_round_trip(&msg), msg);
    }

    #[test]
    fn test_get_sources_small_file() {
        let msg = ServerMessage::GetSources {
            hash: test_hash(),
            size: 1000,
        };
        let body = msg.serialize();
        assert_eq!(body.len(), 16 + 4);
        assert_eq!(server_round_trip(&msg), msg);
    }

    #[test]
    fn test_get_sources_large_file_uses_sentinel() {
        let msg = ServerMessage::GetSources {
            hash: test_hash(),
            size: 5 * 1024 * 1024 * 1024,
        };
        let body = msg.serialize();
        assert_eq!(body.len(), 16 + 4 + 8);
        assert_eq!(&body[16..20], &[0, 0, 0, 0]);
        assert_eq!(server_round_trip(&msg), msg);
    }

    #[test]
    fn test_found_sources_round_trip() {
        let msg = ServerMessage::FoundSources {
            hash: test_hash(),
            sources: vec![NetworkPoint::new(0x0100007F, 4662), NetworkPoint::new(0x0200007F, 4663)],
        };
        assert_eq!(server_round_trip(&msg), msg);
    }

    #[test]
    fn test_id_change_without_flags() {
        let mut body = BytesMut::new();
        body.put_u32_le(0x00FF_0001);
        let msg = ServerMessage::deserialize(server_op::IDCHANGE, &mut body).unwrap();
        match msg {
            ServerMessage::IdChange { client_id, tcp_flags } => {
                assert_eq!(client_id, 0x00FF_0001);
                assert_eq!(tcp_flags, 0);
            }
            _ => panic!("wrong message type"),
        }
    }

    #[test]
    fn test_search_result_round_trip() {
        let mut tags = TagList::new();
        tags.push(Tag::string(ft::FT_FILENAME, "xxx.avi"));
        tags.push(Tag::uint(ft::FT_FILESIZE, 100));
        let msg = ServerMessage::SearchResult {
            entries: vec![SharedFileEntry {
                hash: test_hash(),
                point: NetworkPoint::new(1, 2),
                tags,
            }],
            more: true,
        };
        assert_eq!(server_round_trip(&msg), msg);
    }

    #[test]
    fn test_oversize_search_result_rejected() {
        let mut body = BytesMut::new();
        body.put_u32_le((MAX_COLLECTION_SIZE + 1) as u32);
        let err = ServerMessage::deserialize(server_op::SEARCHRESULT, &mut body).unwrap_err();
        let err = err.downcast::<Ed2kError>().unwrap();
        assert_eq!(err.kind(), ErrorKind::DecodePacketError);
    }

    #[test]
    fn test_hello_round_trip_keeps_hash_len_byte() {
        let mut tags = TagList::new();
        tags.push(Tag::string(ct::CT_NAME, "peer"));
        let msg = PeerMessage::Hello {
            hash: test_hash(),
            point: NetworkPoint::new(7, 4662),
            tags,
            server_point: NetworkPoint::new(9, 4661),
        };
        let body = msg.serialize();
        assert_eq!(body[0], 16);
        assert_eq!(peer_round_trip(&msg), msg);
    }

    #[test]
    fn test_hello_answer_has_no_hash_len_byte() {
        let msg = PeerMessage::HelloAnswer {
            hash: test_hash(),
            point: NetworkPoint::new(7, 4662),
            tags: TagList::new(),
            server_point: NetworkPoint::default(),
        };
        let body = msg.serialize();
        assert_eq!(&body[..16], &test_hash().0);
        assert_eq!(peer_round_trip(&msg), msg);
    }

    #[test]
    fn test_file_status_round_trip() {
        let msg = PeerMessage::FileStatus {
            hash: test_hash(),
            pieces: 11,
            bitfield: vec![0b1010_1010, 0b0000_0101],
        };
        assert_eq!(peer_round_trip(&msg), msg);
    }

    #[test]
    fn test_hashset_answer_round_trip() {
        let msg = PeerMessage::HashsetAnswer {
            hash: test_hash(),
            hashes: vec![FileHash::hash_block(b"p0"), FileHash::hash_block(b"p1")],
        };
        assert_eq!(peer_round_trip(&msg), msg);
    }

    #[test]
    fn test_request_parts_32_round_trip() {
        let msg = PeerMessage::RequestParts32 {
            hash: test_hash(),
            begins: [0, 180_224, 360_448],
            ends: [180_224, 360_448, 540_672],
        };
        assert_eq!(peer_round_trip(&msg), msg);
    }

    #[test]
    fn test_request_parts_64_round_trip() {
        let msg = PeerMessage::RequestParts64 {
            hash: test_hash(),
            begins: [1 << 33, 0, 0],
            ends: [(1 << 33) + 180_224, 0, 0],
        };
        assert_eq!(peer_round_trip(&msg), msg);
    }

    #[test]
    fn test_sending_part_carries_raw_bytes() {
        let msg = PeerMessage::SendingPart32 {
            hash: test_hash(),
            begin: 0,
            end: 5,
            data: vec![1, 2, 3, 4, 5],
        };
        assert_eq!(peer_round_trip(&msg), msg);
    }

    #[test]
    fn test_compressed_part_round_trip() {
        let msg = PeerMessage::CompressedPart32 {
            hash: test_hash(),
            begin: 180_224,
            packed_len: 64,
            data: vec![0x78, 0x9C, 1, 2, 3],
        };
        assert_eq!(peer_round_trip(&msg), msg);
    }

    #[test]
    fn test_emule_info_round_trip() {
        let mut tags = TagList::new();
        tags.push(Tag::uint(0x20, 1)); // compression version
        let msg = PeerMessage::EmuleInfo {
            version: 0x44,
            protocol: 0x01,
            tags,
        };
        assert_eq!(peer_round_trip(&msg), msg);
    }

    #[test]
    fn test_queue_ranking_round_trip() {
        let msg = PeerMessage::QueueRanking { rank: 12 };
        let (protocol, _) = msg.wire_id();
        assert_eq!(protocol, OP_EMULEPROT);
        assert_eq!(peer_round_trip(&msg), msg);
    }

    #[test]
    fn test_empty_bodied_messages() {
        for msg in [
            PeerMessage::AcceptUpload,
            PeerMessage::CancelTransfer,
            PeerMessage::OutOfParts,
            PeerMessage::QueueFull,
            PeerMessage::PublicIpRequest,
        ] {
            assert!(msg.serialize().is_empty());
            assert_eq!(peer_round_trip(&msg), msg);
        }
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let mut body = BytesMut::new();
        assert!(PeerMessage::deserialize(OP_EDONKEYPROT, 0xEE, &mut body).is_err());
    }

    #[test]
    fn test_network_point_classes() {
        assert!(NetworkPoint::new(0, 4662).is_empty());
        assert!(NetworkPoint::new(100, 0).is_empty());
        assert!(NetworkPoint::new(0x00FF_FFFF, 4662).is_low_id());
        assert!(!NetworkPoint::new(0x0100_0000, 4662).is_low_id());
    }
}
