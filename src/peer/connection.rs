//! Peer connection
//!
//! One TCP session with another client: handshake, hash-set exchange,
//! upload slot negotiation and the request-parts / sending-part flow,
//! including the per-range inflater for compressed parts.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use bytes::BytesMut;
use flate2::{Decompress, FlushDecompress};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::error::{Ed2kError, ErrorKind};
use crate::hash::{rollup_hashes, FileHash};
use crate::protocol::codec::{decode_frame, encode_frame, encode_frame_compressible};
use crate::protocol::message::{NetworkPoint, PeerMessage};
use crate::protocol::tag::{Tag, TagList};
use crate::protocol::{ct, OP_EDONKEYPROT};
use crate::session::bandwidth::BandwidthChannel;
use crate::settings::SessionSettings;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    Connecting,
    Handshaking,
    Idle,
    RequestingFile,
    Downloading,
    SlotQueued,
    Uploading,
    Closing,
}

/// Identity advertised during the handshake.
#[derive(Debug, Clone)]
pub struct HelloParams {
    pub hash: FileHash,
    pub point: NetworkPoint,
    pub name: String,
    pub version: u32,
    pub udp_port: u16,
    pub server_point: NetworkPoint,
}

impl HelloParams {
    fn tag_list(&self) -> TagList {
        let mut tags = TagList::new();
        tags.push(Tag::string(ct::CT_NAME, self.name.clone()));
        tags.push(Tag::uint(ct::CT_VERSION, self.version as u64));
        tags.push(Tag::uint(ct::CT_PORT, self.point.port as u64));
        tags.push(Tag::uint(ct::CT_EMULE_UDPPORTS, self.udp_port as u64));
        // advertising misc options marks us as extension capable
        tags.push(Tag::uint(ct::CT_EMULE_MISCOPTIONS1, 1));
        tags
    }

    fn hello(&self) -> PeerMessage {
        PeerMessage::Hello {
            hash: self.hash,
            point: self.point,
            tags: self.tag_list(),
            server_point: self.server_point,
        }
    }

    fn hello_answer(&self) -> PeerMessage {
        PeerMessage::HelloAnswer {
            hash: self.hash,
            point: self.point,
            tags: self.tag_list(),
            server_point: self.server_point,
        }
    }
}

/// A block range requested from the remote side.
#[derive(Debug, Clone)]
pub struct OutstandingRange {
    pub begin: u64,
    pub end: u64,
    pub received: u64,
    pub issued_at: Instant,
}

/// Streaming inflater for one compressed range.
#[derive(Debug)]
struct RangeInflater {
    decomp: Decompress,
    packed_len: u32,
    packed_seen: u32,
    produced: u64,
}

/// One TCP session with another ed2k client.
#[derive(Debug)]
pub struct PeerConnection {
    pub addr: SocketAddr,
    stream: TcpStream,
    recv_buf: BytesMut,
    pub state: PeerConnectionState,
    /// remote client hash learned in the handshake
    pub peer_hash: Option<FileHash>,
    /// remote speaks the eMule extension protocol
    pub extended: bool,
    /// file this connection is attached to, if any
    pub transfer_hash: Option<FileHash>,
    /// remote have bitfield from the last FILESTATUS
    pub peer_bits: Vec<u8>,
    /// ranges we asked for and still expect data on
    pub outstanding: Vec<OutstandingRange>,
    inflaters: HashMap<u64, RangeInflater>,
    upload: Arc<BandwidthChannel>,
    download: Arc<BandwidthChannel>,
    last_activity: Instant,
}

impl PeerConnection {
    /// Connect out and run the client side of the handshake.
    pub async fn connect(
        addr: SocketAddr,
        our: &HelloParams,
        settings: &SessionSettings,
        upload: Arc<BandwidthChannel>,
        download: Arc<BandwidthChannel>,
    ) -> Result<Self> {
        info!("connecting to peer {}", addr);
        let stream = timeout(settings.connect_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| {
                warn!("connect timeout to {}", addr);
                Ed2kError::peer_error_with_peer(ErrorKind::TimedOut, "connect timeout", addr.to_string())
            })?
            .map_err(|e| {
                Ed2kError::peer_error_with_peer(ErrorKind::ConnectionReset, e.to_string(), addr.to_string())
            })?;

        let mut connection = Self::from_stream(stream, addr, upload, download);
        connection.state = PeerConnectionState::Handshaking;

        connection.send(&our.hello(), settings).await?;
        let answer = connection.read_message(settings).await?;
        let (hash, tags) = match answer {
            PeerMessage::HelloAnswer { hash, tags, .. } => (hash, tags),
            other => {
                return Err(Ed2kError::peer_error_with_peer(
                    ErrorKind::DecodePacketError,
                    format!("expected hello answer, got {:?}", other),
                    addr.to_string(),
                )
                .into())
            }
        };
        connection.finish_handshake(hash, tags, our, settings, true).await?;
        Ok(connection)
    }

    /// Run the server side of the handshake over an accepted socket.
    pub async fn accept(
        stream: TcpStream,
        our: &HelloParams,
        settings: &SessionSettings,
        upload: Arc<BandwidthChannel>,
        download: Arc<BandwidthChannel>,
    ) -> Result<Self> {
        let addr = stream.peer_addr().map_err(|e| {
            Ed2kError::peer_error(ErrorKind::ConnectionReset, format!("no peer address: {}", e))
        })?;
        let mut connection = Self::from_stream(stream, addr, upload, download);
        connection.state = PeerConnectionState::Handshaking;

        let hello = connection.read_message(settings).await?;
        let (hash, tags) = match hello {
            PeerMessage::Hello { hash, tags, .. } => (hash, tags),
            other => {
                return Err(Ed2kError::peer_error_with_peer(
                    ErrorKind::DecodePacketError,
                    format!("expected hello, got {:?}", other),
                    addr.to_string(),
                )
                .into())
            }
        };
        connection.send(&our.hello_answer(), settings).await?;
        connection.finish_handshake(hash, tags, our, settings, false).await?;
        Ok(connection)
    }

    fn from_stream(
        stream: TcpStream,
        addr: SocketAddr,
        upload: Arc<BandwidthChannel>,
        download: Arc<BandwidthChannel>,
    ) -> Self {
        Self {
            addr,
            stream,
            recv_buf: BytesMut::with_capacity(16 * 1024),
            state: PeerConnectionState::Connecting,
            peer_hash: None,
            extended: false,
            transfer_hash: None,
            peer_bits: Vec::new(),
            outstanding: Vec::new(),
            inflaters: HashMap::new(),
            upload,
            download,
            last_activity: Instant::now(),
        }
    }

    async fn finish_handshake(
        &mut self,
        peer_hash: FileHash,
        tags: TagList,
        our: &HelloParams,
        settings: &SessionSettings,
        initiated: bool,
    ) -> Result<()> {
        if peer_hash == our.hash {
            return Err(Ed2kError::peer_error_with_peer(
                ErrorKind::ConnectionToItself,
                "remote presented our own hash",
                self.addr.to_string(),
            )
            .into());
        }
        self.peer_hash = Some(peer_hash);

        let remote_extended = tags.find(ct::CT_EMULE_MISCOPTIONS1).is_some()
            || tags.find(ct::CT_EMULE_VERSION).is_some();
        if remote_extended {
            // capability exchange; the initiator speaks first
            if initiated {
                self.send(&emule_info(), settings).await?;
                match self.read_message(settings).await? {
                    PeerMessage::EmuleInfoAnswer { .. } => self.extended = true,
                    other => {
                        debug!("no emule info answer from {} (got {:?})", self.addr, other);
                    }
                }
            } else {
                match self.read_message(settings).await? {
                    PeerMessage::EmuleInfo { .. } => {
                        self.send(&emule_info_answer(), settings).await?;
                        self.extended = true;
                    }
                    other => {
                        debug!("peer {} skipped emule info (got {:?})", self.addr, other);
                    }
                }
            }
        }

        self.state = PeerConnectionState::Idle;
        info!("handshake complete with {} (extended: {})", self.addr, self.extended);
        Ok(())
    }

    /// Serialize and send one message, honoring the upload rate limit.
    pub async fn send(&mut self, message: &PeerMessage, settings: &SessionSettings) -> Result<()> {
        let (protocol, opcode) = message.wire_id();
        let body = message.serialize();
        // only plain-protocol frames may be packed: the packed marker
        // replaces the protocol byte, and the emule opcode space would
        // become ambiguous after inflation
        let frame = if settings.allow_compression && protocol == OP_EDONKEYPROT && body.len() > 128 && !is_part_data(message) {
            encode_frame_compressible(protocol, opcode, &body)
        } else {
            encode_frame(protocol, opcode, &body)
        };

        self.upload.request(frame.len() as u64).await;
        self.stream.write_all(&frame).await.map_err(|e| {
            Ed2kError::peer_error_with_peer(ErrorKind::ConnectionReset, e.to_string(), self.addr.to_string())
        })?;
        self.last_activity = Instant::now();
        trace!("sent {:?} to {}", opcode_name(message), self.addr);
        Ok(())
    }

    /// Read one message, enforcing the inactivity timeout and the
    /// download rate limit for part payloads.
    pub async fn read_message(&mut self, settings: &SessionSettings) -> Result<PeerMessage> {
        loop {
            if let Some(frame) = decode_frame(&mut self.recv_buf)? {
                self.last_activity = Instant::now();
                let mut body = frame.body;
                let message = PeerMessage::deserialize(frame.protocol, frame.opcode, &mut body)?;
                if let Some(len) = part_payload_len(&message) {
                    self.download.request(len as u64).await;
                }
                return Ok(message);
            }

            let mut chunk = [0u8; 16 * 1024];
            let read = timeout(settings.peer_timeout(), self.stream.read(&mut chunk))
                .await
                .map_err(|_| {
                    Ed2kError::peer_error_with_peer(
                        ErrorKind::TimedOutInactivity,
                        "peer idle too long",
                        self.addr.to_string(),
                    )
                })?
                .map_err(|e| {
                    Ed2kError::peer_error_with_peer(ErrorKind::ConnectionReset, e.to_string(), self.addr.to_string())
                })?;
            if read == 0 {
                return Err(Ed2kError::peer_error_with_peer(
                    ErrorKind::ConnectionReset,
                    "peer closed the connection",
                    self.addr.to_string(),
                )
                .into());
            }
            self.recv_buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Bind this connection to a transfer and ask for the file.
    pub async fn request_file(&mut self, hash: FileHash, settings: &SessionSettings) -> Result<()> {
        self.transfer_hash = Some(hash);
        self.state = PeerConnectionState::RequestingFile;
        self.send(&PeerMessage::FileRequest { hash }, settings).await?;
        self.send(&PeerMessage::FileNameRequest { hash }, settings).await
    }

    /// Ask for the piece hash set and verify it rolls up to `expected`.
    pub async fn request_hashset(
        &mut self,
        expected: FileHash,
        settings: &SessionSettings,
    ) -> Result<Vec<FileHash>> {
        self.send(&PeerMessage::HashsetRequest { hash: expected }, settings).await?;
        loop {
            match self.read_message(settings).await? {
                PeerMessage::HashsetAnswer { hash, hashes } if hash == expected => {
                    return verify_hashset(expected, hashes, &self.addr);
                }
                PeerMessage::HashsetAnswer { hash, .. } => {
                    return Err(Ed2kError::peer_error_with_peer(
                        ErrorKind::MismatchingTransferHash,
                        format!("hash set for unexpected file {}", hash),
                        self.addr.to_string(),
                    )
                    .into());
                }
                other => {
                    trace!("deferring {:?} while waiting for hash set", opcode_name(&other));
                }
            }
        }
    }

    /// Issue up to three block ranges; switches to the 64-bit variant
    /// when any endpoint exceeds 32 bits.
    pub async fn request_parts(&mut self, ranges: &[(u64, u64)], settings: &SessionSettings) -> Result<()> {
        let hash = self.transfer_hash.ok_or_else(|| {
            Ed2kError::peer_error(ErrorKind::InvalidHandle, "request_parts without a bound transfer")
        })?;
        if ranges.is_empty() || ranges.len() > 3 {
            return Err(Ed2kError::peer_error(
                ErrorKind::DecodePacketError,
                format!("bad range count: {}", ranges.len()),
            )
            .into());
        }

        let now = Instant::now();
        for (begin, end) in ranges {
            self.outstanding.push(OutstandingRange {
                begin: *begin,
                end: *end,
                received: 0,
                issued_at: now,
            });
        }

        let wide = ranges.iter().any(|(b, e)| *b > u32::MAX as u64 || *e > u32::MAX as u64);
        let message = if wide {
            let mut begins = [0u64; 3];
            let mut ends = [0u64; 3];
            for (i, (b, e)) in ranges.iter().enumerate() {
                begins[i] = *b;
                ends[i] = *e;
            }
            PeerMessage::RequestParts64 { hash, begins, ends }
        } else {
            let mut begins = [0u32; 3];
            let mut ends = [0u32; 3];
            for (i, (b, e)) in ranges.iter().enumerate() {
                begins[i] = *b as u32;
                ends[i] = *e as u32;
            }
            PeerMessage::RequestParts32 { hash, begins, ends }
        };
        self.state = PeerConnectionState::Downloading;
        self.send(&message, settings).await
    }

    /// Validate an arriving part against the outstanding requests.
    ///
    /// Returns `(file_offset, data)` when the payload is wanted, `None`
    /// for overlap or unsolicited data (which is dropped and logged).
    pub fn accept_part(&mut self, begin: u64, end: u64, data: Vec<u8>) -> Option<(u64, Vec<u8>)> {
        if end.saturating_sub(begin) != data.len() as u64 {
            warn!("part length mismatch from {}: [{}, {}) vs {}B", self.addr, begin, end, data.len());
            return None;
        }
        let range = self
            .outstanding
            .iter_mut()
            .find(|r| begin >= r.begin && end <= r.end && r.begin + r.received == begin);
        match range {
            Some(range) => {
                range.received += data.len() as u64;
                let complete = range.received == range.end - range.begin;
                if complete {
                    let begin_key = range.begin;
                    self.outstanding.retain(|r| r.begin != begin_key);
                }
                Some((begin, data))
            }
            None => {
                warn!("dropping unsolicited part [{}, {}) from {}", begin, end, self.addr);
                None
            }
        }
    }

    /// Feed one compressed-part message through the per-range inflater.
    ///
    /// Returns decompressed `(file_offset, data)` as it becomes
    /// available; the inflater resets when the range completes.
    pub fn accept_compressed_part(&mut self, begin: u64, packed_len: u32, chunk: &[u8]) -> Result<Option<(u64, Vec<u8>)>> {
        let range_len = match self.outstanding.iter().find(|r| r.begin == begin) {
            Some(range) => range.end - range.begin,
            None => {
                warn!("dropping unsolicited compressed part at {} from {}", begin, self.addr);
                return Ok(None);
            }
        };

        let inflater = self.inflaters.entry(begin).or_insert_with(|| RangeInflater {
            decomp: Decompress::new(true),
            packed_len,
            packed_seen: 0,
            produced: 0,
        });
        inflater.packed_seen += chunk.len() as u32;

        let mut out = Vec::with_capacity(chunk.len() * 4);
        let mut consumed = 0usize;
        while consumed < chunk.len() {
            let before_in = inflater.decomp.total_in();
            let before_out = out.len();
            let status = inflater
                .decomp
                .decompress_vec(&chunk[consumed..], &mut out, FlushDecompress::None)
                .map_err(|e| {
                    Ed2kError::peer_error_with_peer(
                        ErrorKind::UnsupportedPackedType,
                        format!("inflate failed: {}", e),
                        self.addr.to_string(),
                    )
                })?;
            consumed += (inflater.decomp.total_in() - before_in) as usize;
            if status == flate2::Status::StreamEnd {
                break;
            }
            if out.len() as u64 + inflater.produced > range_len {
                return Err(Ed2kError::peer_error_with_peer(
                    ErrorKind::DecodePacketError,
                    "compressed part inflates past its range",
                    self.addr.to_string(),
                )
                .into());
            }
            if consumed < chunk.len() {
                if out.len() == before_out && inflater.decomp.total_in() == before_in {
                    // stalled: the stream needs bytes from the next message
                    break;
                }
                out.reserve(16 * 1024);
            }
        }

        if out.is_empty() {
            return Ok(None);
        }

        let offset = begin + inflater.produced;
        inflater.produced += out.len() as u64;
        let finished = inflater.produced >= range_len || inflater.packed_seen >= inflater.packed_len;
        let result = self.accept_part(offset, offset + out.len() as u64, out);
        if finished {
            self.inflaters.remove(&begin);
        }
        Ok(result)
    }

    /// Ranges whose data is overdue; they are dropped here so the picker
    /// can reissue them elsewhere.
    pub fn timed_out_ranges(&mut self, now: Instant, settings: &SessionSettings) -> Vec<(u64, u64)> {
        let deadline = settings.block_request_timeout();
        let mut stale = Vec::new();
        self.outstanding.retain(|range| {
            if now.duration_since(range.issued_at) >= deadline && range.received == 0 {
                stale.push((range.begin, range.end));
                false
            } else {
                true
            }
        });
        for (begin, _) in &stale {
            self.inflaters.remove(begin);
        }
        stale
    }

    /// Idle check driven by the session tick.
    pub fn is_idle_past(&self, now: Instant, settings: &SessionSettings) -> bool {
        now.duration_since(self.last_activity) >= settings.peer_timeout()
    }

    /// Graceful close.
    pub async fn close(&mut self) {
        self.state = PeerConnectionState::Closing;
        let _ = self.stream.shutdown().await;
        debug!("closed connection to {}", self.addr);
    }
}

fn emule_info() -> PeerMessage {
    PeerMessage::EmuleInfo {
        version: 0x44,
        protocol: 0x01,
        tags: capability_tags(),
    }
}

fn emule_info_answer() -> PeerMessage {
    PeerMessage::EmuleInfoAnswer {
        version: 0x44,
        protocol: 0x01,
        tags: capability_tags(),
    }
}

fn capability_tags() -> TagList {
    let mut tags = TagList::new();
    tags.push(Tag::uint(0x20, 1)); // zlib compression
    tags.push(Tag::uint(0x21, 2)); // source exchange version
    tags.push(Tag::uint(0x22, 4)); // udp version
    tags.push(Tag::uint(0x23, 1)); // aich version
    tags.push(Tag::uint(0x24, 1)); // large files
    tags.push(Tag::uint(0x25, 1)); // multipacket
    tags
}

fn verify_hashset(expected: FileHash, hashes: Vec<FileHash>, addr: &SocketAddr) -> Result<Vec<FileHash>> {
    let rolled = rollup_hashes(&hashes);
    if rolled != expected {
        return Err(Ed2kError::peer_error_with_peer(
            ErrorKind::MismatchingTransferHash,
            format!("hash set rolls up to {} not {}", rolled, expected),
            addr.to_string(),
        )
        .into());
    }
    Ok(hashes)
}

fn is_part_data(message: &PeerMessage) -> bool {
    matches!(
        message,
        PeerMessage::SendingPart32 { .. }
            | PeerMessage::SendingPart64 { .. }
            | PeerMessage::CompressedPart32 { .. }
            | PeerMessage::CompressedPart64 { .. }
    )
}

fn part_payload_len(message: &PeerMessage) -> Option<usize> {
    match message {
        PeerMessage::SendingPart32 { data, .. }
        | PeerMessage::SendingPart64 { data, .. }
        | PeerMessage::CompressedPart32 { data, .. }
        | PeerMessage::CompressedPart64 { data, .. } => Some(data.len()),
        _ => None,
    }
}

fn opcode_name(message: &PeerMessage) -> &'static str {
    match message {
        PeerMessage::Hello { .. } => "hello",
        PeerMessage::HelloAnswer { .. } => "hello_answer",
        PeerMessage::EmuleInfo { .. } => "emule_info",
        PeerMessage::EmuleInfoAnswer { .. } => "emule_info_answer",
        PeerMessage::FileRequest { .. } => "file_request",
        PeerMessage::NoSuchFile { .. } => "no_such_file",
        PeerMessage::FileNameRequest { .. } => "file_name_request",
        PeerMessage::FileNameAnswer { .. } => "file_name_answer",
        PeerMessage::FileStatus { .. } => "file_status",
        PeerMessage::HashsetRequest { .. } => "hashset_request",
        PeerMessage::HashsetAnswer { .. } => "hashset_answer",
        PeerMessage::StartUpload { .. } => "start_upload",
        PeerMessage::AcceptUpload => "accept_upload",
        PeerMessage::QueueRanking { .. } => "queue_ranking",
        PeerMessage::QueueFull => "queue_full",
        PeerMessage::CancelTransfer => "cancel_transfer",
        PeerMessage::OutOfParts => "out_of_parts",
        PeerMessage::RequestParts32 { .. } => "request_parts",
        PeerMessage::RequestParts64 { .. } => "request_parts_i64",
        PeerMessage::SendingPart32 { .. } => "sending_part",
        PeerMessage::SendingPart64 { .. } => "sending_part_i64",
        PeerMessage::CompressedPart32 { .. } => "compressed_part",
        PeerMessage::CompressedPart64 { .. } => "compressed_part_i64",
        PeerMessage::EndOfDownload { .. } => "end_of_download",
        PeerMessage::ChatMessage(_) => "message",
        PeerMessage::PublicIpRequest => "public_ip_request",
        PeerMessage::PublicIpAnswer { .. } => "public_ip_answer",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::deflate;
    use tokio::net::TcpListener;

    fn params(tag: u8) -> HelloParams {
        HelloParams {
            hash: FileHash::hash_block(&[tag]),
            point: NetworkPoint::new(0x0100_0000 + tag as u32, 4662),
            name: format!("peer-{}", tag),
            version: 0x3C,
            udp_port: 4672,
            server_point: NetworkPoint::default(),
        }
    }

    fn channels() -> (Arc<BandwidthChannel>, Arc<BandwidthChannel>) {
        (Arc::new(BandwidthChannel::new(0)), Arc::new(BandwidthChannel::new(0)))
    }

    async fn connected_pair() -> (PeerConnection, PeerConnection) {
        let settings = SessionSettings::default();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (up, down) = channels();
            PeerConnection::accept(stream, &params(2), &SessionSettings::default(), up, down)
                .await
                .unwrap()
        });

        let (up, down) = channels();
        let client = PeerConnection::connect(addr, &params(1), &settings, up, down).await.unwrap();
        let server = server.await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_handshake_completes_both_sides() {
        let (client, server) = connected_pair().await;
        assert_eq!(client.state, PeerConnectionState::Idle);
        assert_eq!(server.state, PeerConnectionState::Idle);
        assert_eq!(client.peer_hash, Some(params(2).hash));
        assert_eq!(server.peer_hash, Some(params(1).hash));
        assert!(client.extended);
        assert!(server.extended);
    }

    #[tokio::test]
    async fn test_self_connection_refused() {
        let settings = SessionSettings::default();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // both sides present the same client hash
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (up, down) = channels();
            PeerConnection::accept(stream, &params(1), &SessionSettings::default(), up, down).await
        });

        let (up, down) = channels();
        let err = PeerConnection::connect(addr, &params(1), &settings, up, down)
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast::<Ed2kError>().unwrap().kind(),
            ErrorKind::ConnectionToItself
        );
        let _ = server.await;
    }

    #[tokio::test]
    async fn test_request_flow_messages() {
        let settings = SessionSettings::default();
        let (mut client, mut server) = connected_pair().await;
        let file = FileHash::hash_block(b"file");

        client.request_file(file, &settings).await.unwrap();
        match server.read_message(&settings).await.unwrap() {
            PeerMessage::FileRequest { hash } => assert_eq!(hash, file),
            other => panic!("unexpected message: {:?}", other),
        }
        match server.read_message(&settings).await.unwrap() {
            PeerMessage::FileNameRequest { hash } => assert_eq!(hash, file),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hashset_exchange_verifies_rollup() {
        let settings = SessionSettings::default();
        let (mut client, mut server) = connected_pair().await;

        let pieces = vec![FileHash::hash_block(b"p0"), FileHash::hash_block(b"p1")];
        let file = rollup_hashes(&pieces);
        client.transfer_hash = Some(file);

        let server_pieces = pieces.clone();
        let server_task = tokio::spawn(async move {
            let settings = SessionSettings::default();
            match server.read_message(&settings).await.unwrap() {
                PeerMessage::HashsetRequest { hash } => {
                    server
                        .send(
                            &PeerMessage::HashsetAnswer {
                                hash,
                                hashes: server_pieces,
                            },
                            &settings,
                        )
                        .await
                        .unwrap();
                }
                other => panic!("unexpected message: {:?}", other),
            }
            server
        });

        let got = client.request_hashset(file, &settings).await.unwrap();
        assert_eq!(got, pieces);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_hashset_mismatch_rejected() {
        let settings = SessionSettings::default();
        let (mut client, mut server) = connected_pair().await;
        let file = FileHash::hash_block(b"real-file");

        let server_task = tokio::spawn(async move {
            let settings = SessionSettings::default();
            if let PeerMessage::HashsetRequest { hash } = server.read_message(&settings).await.unwrap() {
                let bogus = vec![FileHash::hash_block(b"x0"), FileHash::hash_block(b"x1")];
                server
                    .send(&PeerMessage::HashsetAnswer { hash, hashes: bogus }, &settings)
                    .await
                    .unwrap();
            }
            server
        });

        let err = client.request_hashset(file, &settings).await.unwrap_err();
        assert_eq!(
            err.downcast::<Ed2kError>().unwrap().kind(),
            ErrorKind::MismatchingTransferHash
        );
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_parts_picks_wire_width() {
        let settings = SessionSettings::default();
        let (mut client, mut server) = connected_pair().await;
        client.transfer_hash = Some(FileHash::hash_block(b"f"));

        client.request_parts(&[(0, 1000)], &settings).await.unwrap();
        assert!(matches!(
            server.read_message(&settings).await.unwrap(),
            PeerMessage::RequestParts32 { .. }
        ));

        client.request_parts(&[(1 << 33, (1 << 33) + 1000)], &settings).await.unwrap();
        assert!(matches!(
            server.read_message(&settings).await.unwrap(),
            PeerMessage::RequestParts64 { .. }
        ));
    }

    #[tokio::test]
    async fn test_accept_part_in_range() {
        let (mut client, _server) = connected_pair().await;
        client.outstanding.push(OutstandingRange {
            begin: 100,
            end: 200,
            received: 0,
            issued_at: Instant::now(),
        });

        let accepted = client.accept_part(100, 150, vec![1u8; 50]);
        assert_eq!(accepted.as_ref().map(|(o, d)| (*o, d.len())), Some((100, 50)));
        // the tail completes and clears the range
        assert!(client.accept_part(150, 200, vec![2u8; 50]).is_some());
        assert!(client.outstanding.is_empty());
    }

    #[tokio::test]
    async fn test_unsolicited_part_dropped() {
        let (mut client, _server) = connected_pair().await;
        assert!(client.accept_part(0, 50, vec![0u8; 50]).is_none());

        client.outstanding.push(OutstandingRange {
            begin: 100,
            end: 200,
            received: 0,
            issued_at: Instant::now(),
        });
        // overlapping but misaligned data is also refused
        assert!(client.accept_part(150, 250, vec![0u8; 100]).is_none());
    }

    #[tokio::test]
    async fn test_compressed_part_inflates_into_range() {
        let (mut client, _server) = connected_pair().await;
        let payload = vec![0x5Au8; 400];
        let packed = deflate(&payload).unwrap();

        client.outstanding.push(OutstandingRange {
            begin: 0,
            end: 400,
            received: 0,
            issued_at: Instant::now(),
        });

        let out = client
            .accept_compressed_part(0, packed.len() as u32, &packed)
            .unwrap()
            .unwrap();
        assert_eq!(out.0, 0);
        assert_eq!(out.1, payload);
        assert!(client.outstanding.is_empty());
        assert!(client.inflaters.is_empty());
    }

    #[tokio::test]
    async fn test_compressed_part_streams_across_messages() {
        let (mut client, _server) = connected_pair().await;
        let payload: Vec<u8> = (0..=255u8).cycle().take(2000).collect();
        let packed = deflate(&payload).unwrap();
        let split = packed.len() / 2;

        client.outstanding.push(OutstandingRange {
            begin: 500,
            end: 2500,
            received: 0,
            issued_at: Instant::now(),
        });

        let mut assembled = Vec::new();
        for chunk in [&packed[..split], &packed[split..]] {
            if let Some((offset, data)) = client.accept_compressed_part(500, packed.len() as u32, chunk).unwrap() {
                assert_eq!(offset as usize - 500, assembled.len());
                assembled.extend_from_slice(&data);
            }
        }
        assert_eq!(assembled, payload);
        assert!(client.inflaters.is_empty());
    }

    #[tokio::test]
    async fn test_timed_out_ranges_rescheduled() {
        let settings = SessionSettings::default();
        let (mut client, _server) = connected_pair().await;
        client.outstanding.push(OutstandingRange {
            begin: 0,
            end: 100,
            received: 0,
            issued_at: Instant::now(),
        });

        assert!(client.timed_out_ranges(Instant::now(), &settings).is_empty());
        let later = Instant::now() + settings.block_request_timeout();
        assert_eq!(client.timed_out_ranges(later, &settings), vec![(0, 100)]);
        assert!(client.outstanding.is_empty());
    }
}
