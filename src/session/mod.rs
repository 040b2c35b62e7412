//! Session module
//!
//! The orchestrator: owns the transfer table, the connection registry,
//! the bandwidth channels, the disk layer, the server link and the DHT,
//! and runs the periodic tick that drives all of them.

pub mod bandwidth;

pub use bandwidth::{BandwidthChannel, HalfOpenThrottle};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, trace, warn};

use crate::alert::{Alert, AlertQueue};
use crate::dht::Dht;
use crate::error::{Ed2kError, ErrorKind};
use crate::file::known::TransferParameters;
use crate::hash::{FileHash, PIECE_SIZE};
use crate::peer::connection::{HelloParams, PeerConnection};
use crate::peer::peer::PeerSourceKind;
use crate::peer::upload::{clamp_ranges, SlotDecision, UploadQueue};
use crate::protocol::message::{NetworkPoint, PeerMessage};
use crate::server::connection::ServerConnection;
use crate::settings::SessionSettings;
use crate::storage::disk_io::{DiskIo, DiskJobResult, StorageKey};
use crate::storage::resume::ResumeData;
use crate::transfer::transfer::{Transfer, TransferState};

/// Completions posted back into the session by worker tasks.
enum SessionEvent {
    CheckDone {
        hash: FileHash,
        have: Vec<bool>,
    },
    CheckFailed {
        hash: FileHash,
        kind: ErrorKind,
    },
    PieceHashed {
        hash: FileHash,
        piece: u32,
        ok: bool,
    },
}

/// Registry entry for one live connection. Dropping the peer means
/// flipping the shutdown channel; the drive loop selects on it and
/// tears the socket down.
struct ConnectionHandle {
    transfer: Option<FileHash>,
    shutdown: watch::Sender<bool>,
}

/// The ed2k session.
pub struct Session {
    pub settings: SessionSettings,
    pub alerts: Arc<AlertQueue>,
    pub disk: DiskIo,
    pub upload_channel: Arc<BandwidthChannel>,
    pub download_channel: Arc<BandwidthChannel>,
    pub half_open: HalfOpenThrottle,
    pub upload_queue: UploadQueue,
    pub our_hash: FileHash,
    transfers: HashMap<FileHash, Transfer>,
    /// one connection per remote endpoint, session wide
    connections: HashMap<SocketAddr, ConnectionHandle>,
    /// peers that supplied blocks to a piece still awaiting its verdict
    piece_contributors: HashMap<(FileHash, u32), Vec<SocketAddr>>,
    pub server: Option<ServerConnection>,
    /// secondary server links; announces fan out to these as well
    pub slave_servers: Vec<ServerConnection>,
    pub dht: Option<Dht>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    next_queue_position: u64,
    next_storage_id: u32,
    storage_ids: HashMap<FileHash, u32>,
    /// the single transfer allowed in checking_files
    checking: Option<FileHash>,
    /// round-robin cursor for fair connect dispatch
    connect_cursor: usize,
    last_second: Instant,
    closing: bool,
}

impl Session {
    /// Build a session; workers are started, no sockets are opened yet.
    pub fn new(settings: SessionSettings) -> Result<Self> {
        settings.validate()?;
        let alerts = Arc::new(AlertQueue::new(settings.alert_queue_size));
        let disk = DiskIo::start(&settings);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        // the client hash is stable per installation; derive it at random
        let mut seed = [0u8; 16];
        rand::Rng::fill(&mut rand::thread_rng(), &mut seed[..]);
        let our_hash = FileHash::hash_block(&seed);
        info!("session starting as client {}", our_hash);

        Ok(Self {
            upload_channel: Arc::new(BandwidthChannel::new(settings.upload_rate_limit)),
            download_channel: Arc::new(BandwidthChannel::new(settings.download_rate_limit)),
            half_open: HalfOpenThrottle::new(settings.half_open_limit),
            upload_queue: UploadQueue::new(settings.upload_slots, 200),
            our_hash,
            transfers: HashMap::new(),
            connections: HashMap::new(),
            piece_contributors: HashMap::new(),
            server: None,
            slave_servers: Vec::new(),
            dht: None,
            events_tx,
            events_rx,
            next_queue_position: 1,
            next_storage_id: 1,
            storage_ids: HashMap::new(),
            checking: None,
            connect_cursor: 0,
            last_second: Instant::now(),
            closing: false,
            alerts,
            disk,
            settings,
        })
    }

    /// Identity advertised to peers.
    pub fn hello_params(&self) -> HelloParams {
        let client_id = self.server.as_ref().map(|s| s.client_id).unwrap_or(0);
        HelloParams {
            hash: self.our_hash,
            point: NetworkPoint::new(client_id, self.settings.listen_port),
            name: self.settings.client_name.clone(),
            version: 0x3C,
            udp_port: self.settings.dht_port,
            server_point: NetworkPoint::default(),
        }
    }

    // ---- transfer table ----

    /// Add a transfer; at most one per file hash.
    pub fn add_transfer(&mut self, params: TransferParameters) -> Result<FileHash> {
        if self.closing {
            return Err(Ed2kError::session_error(ErrorKind::SessionClosing).into());
        }
        let hash = params.file_hash;
        if self.transfers.contains_key(&hash) {
            return Err(Ed2kError::session_error(ErrorKind::DuplicateTransfer).into());
        }

        let queue_position = self.next_queue_position;
        self.next_queue_position += 1;
        let transfer = Transfer::new(params, queue_position, &self.settings)?;
        self.storage_ids.insert(hash, self.next_storage_id);
        self.next_storage_id += 1;
        self.transfers.insert(hash, transfer);
        self.alerts.post(Alert::TransferAdded { hash });
        info!("transfer {} added (queue position {})", hash, queue_position);
        Ok(hash)
    }

    /// Add from validated resume data; skips the checking queue.
    pub fn add_transfer_from_resume(&mut self, resume: ResumeData) -> Result<FileHash> {
        if self.transfers.contains_key(&resume.file_hash) {
            return Err(Ed2kError::session_error(ErrorKind::DuplicateTransfer).into());
        }
        let queue_position = self.next_queue_position;
        self.next_queue_position += 1;
        let hash = resume.file_hash;
        let transfer = Transfer::from_resume(resume, queue_position, &self.settings)?;
        self.storage_ids.insert(hash, self.next_storage_id);
        self.next_storage_id += 1;
        self.transfers.insert(hash, transfer);
        self.alerts.post(Alert::TransferAdded { hash });
        Ok(hash)
    }

    /// Remove a transfer and drop its peer connections.
    pub fn remove_transfer(&mut self, hash: &FileHash) -> Result<()> {
        self.transfers
            .remove(hash)
            .ok_or_else(|| Ed2kError::session_error(ErrorKind::InvalidHandle))?;
        self.drop_transfer_connections(hash, ErrorKind::TransferAborted);
        self.piece_contributors.retain(|(h, _), _| h != hash);
        if self.checking == Some(*hash) {
            self.checking = None;
        }
        self.storage_ids.remove(hash);
        self.alerts.post(Alert::TransferRemoved { hash: *hash });
        info!("transfer {} removed", hash);
        Ok(())
    }

    pub fn transfer(&self, hash: &FileHash) -> Option<&Transfer> {
        self.transfers.get(hash)
    }

    pub fn transfer_mut(&mut self, hash: &FileHash) -> Option<&mut Transfer> {
        self.transfers.get_mut(hash)
    }

    pub fn transfer_count(&self) -> usize {
        self.transfers.len()
    }

    /// Pause one transfer.
    pub fn pause_transfer(&mut self, hash: &FileHash) -> Result<()> {
        let transfer = self
            .transfers
            .get_mut(hash)
            .ok_or_else(|| Ed2kError::session_error(ErrorKind::InvalidHandle))?;
        if let Some((prev, state)) = transfer.pause() {
            self.alerts.post(Alert::StateChanged { hash: *hash, prev, state });
        }
        self.drop_transfer_connections(hash, ErrorKind::TransferPaused);
        Ok(())
    }

    /// Resume one transfer.
    pub fn resume_transfer(&mut self, hash: &FileHash) -> Result<()> {
        let transfer = self
            .transfers
            .get_mut(hash)
            .ok_or_else(|| Ed2kError::session_error(ErrorKind::InvalidHandle))?;
        if let Some((prev, state)) = transfer.resume() {
            self.alerts.post(Alert::StateChanged { hash: *hash, prev, state });
        }
        Ok(())
    }

    // ---- connection registry ----

    /// Register an inbound or outbound connection. At most one per
    /// remote endpoint; duplicates are refused. Returns the shutdown
    /// channel the drive loop must select on.
    pub fn register_connection(
        &mut self,
        addr: SocketAddr,
        transfer: Option<FileHash>,
    ) -> Result<watch::Receiver<bool>> {
        if self.closing {
            return Err(Ed2kError::session_error(ErrorKind::SessionClosing).into());
        }
        if self.connections.len() >= self.settings.connections_limit {
            return Err(Ed2kError::peer_error_with_peer(
                ErrorKind::TooManyConnections,
                "connection limit reached",
                addr.to_string(),
            )
            .into());
        }
        if self.connections.contains_key(&addr) {
            return Err(Ed2kError::peer_error_with_peer(
                ErrorKind::DuplicatePeerId,
                "endpoint already connected",
                addr.to_string(),
            )
            .into());
        }
        let (shutdown, receiver) = watch::channel(false);
        self.connections.insert(addr, ConnectionHandle { transfer, shutdown });
        self.alerts.post(Alert::PeerConnected { addr });
        Ok(receiver)
    }

    /// Drop a connection: remove it from the registry and flip its
    /// shutdown channel so the drive loop tears the socket down.
    pub fn unregister_connection(&mut self, addr: &SocketAddr, kind: ErrorKind) {
        if let Some(handle) = self.connections.remove(addr) {
            let _ = handle.shutdown.send(true);
            self.alerts.post(Alert::PeerDisconnected { addr: *addr, kind });
        }
        if let Some(promoted) = self.upload_queue.release(*addr) {
            trace!("{} promoted to an upload slot", promoted);
        }
    }

    /// Drop every connection attached to one transfer.
    fn drop_transfer_connections(&mut self, hash: &FileHash, kind: ErrorKind) {
        let addrs: Vec<SocketAddr> = self
            .connections
            .iter()
            .filter(|(_, handle)| handle.transfer.as_ref() == Some(hash))
            .map(|(addr, _)| *addr)
            .collect();
        for addr in addrs {
            self.unregister_connection(&addr, kind);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    // ---- scheduler ----

    /// Plan this second's outbound connect attempts: round-robin across
    /// active transfers, bounded by `connection_speed` and the free
    /// half-open slots. Chosen peers are marked as attempted.
    pub fn plan_connects(&mut self, now: Instant) -> Vec<(FileHash, NetworkPoint)> {
        let budget = self
            .settings
            .connection_speed
            .min(self.half_open.available())
            .min(self.settings.connections_limit.saturating_sub(self.connections.len()));
        let mut plan = Vec::new();
        if budget == 0 {
            return plan;
        }

        let mut hashes: Vec<FileHash> = self
            .transfers
            .iter()
            .filter(|(_, t)| t.is_active() && t.wants_data())
            .map(|(h, _)| *h)
            .collect();
        if hashes.is_empty() {
            return plan;
        }
        hashes.sort_by_key(|h| self.transfers[h].queue_position);

        // rotate so each second starts with a different transfer
        let start = self.connect_cursor % hashes.len();
        self.connect_cursor = self.connect_cursor.wrapping_add(1);
        hashes.rotate_left(start);

        let mut exhausted = vec![false; hashes.len()];
        while plan.len() < budget && !exhausted.iter().all(|e| *e) {
            for (index, hash) in hashes.iter().enumerate() {
                if plan.len() >= budget {
                    break;
                }
                if exhausted[index] {
                    continue;
                }
                let connections = &self.connections;
                let transfer = self.transfers.get_mut(hash).expect("hash collected above");
                let candidate = transfer
                    .policy
                    .connect_candidates(now, &self.settings)
                    .into_iter()
                    .find(|p| !connections.contains_key(&SocketAddr::V4(p.to_socket_addr())));
                match candidate {
                    Some(point) => {
                        if let Some(peer) = transfer.policy.peer_mut(&point) {
                            peer.on_connect_started(now);
                        }
                        plan.push((*hash, point));
                    }
                    None => exhausted[index] = true,
                }
            }
        }

        debug!("planned {} connect attempts", plan.len());
        plan
    }

    /// The periodic tick. Call at `tick_interval`; second-granularity
    /// work runs when a full second has elapsed.
    pub async fn tick(&mut self, now: Instant) {
        self.drain_events().await;

        if now.duration_since(self.last_second).as_secs() < 1 {
            return;
        }
        self.last_second = now;

        // bandwidth refill
        self.upload_channel.tick();
        self.download_channel.tick();

        // server keep-alive
        if let Some(server) = self.server.as_mut() {
            if let Err(e) = server.tick(now).await {
                warn!("server link lost: {}", e);
                self.alerts.post(Alert::ServerDisconnected {
                    name: server.params.name.clone(),
                    reason: e.to_string(),
                });
                self.server = None;
            }
        }

        // per-transfer work
        let mut changes = Vec::new();
        for (hash, transfer) in self.transfers.iter_mut() {
            if let Some((prev, state)) = transfer.tick(now, &self.settings) {
                changes.push((*hash, prev, state));
            }
        }
        for (hash, prev, state) in changes {
            self.alerts.post(Alert::StateChanged { hash, prev, state });
        }

        // checking queue: one transfer at a time
        self.start_next_check();

        // dht maintenance
        if let Some(dht) = self.dht.as_ref() {
            dht.tick(&self.alerts).await;
        }
    }

    /// Promote the next queued transfer into checking_files.
    fn start_next_check(&mut self) {
        if self.checking.is_some() {
            return;
        }
        let next = self
            .transfers
            .iter()
            .filter(|(_, t)| t.state == TransferState::QueuedForChecking)
            .min_by_key(|(_, t)| t.queue_position)
            .map(|(h, _)| *h);
        let Some(hash) = next else { return };

        let transfer = self.transfers.get_mut(&hash).expect("picked above");
        let change = transfer.set_state(TransferState::CheckingFiles);
        let piece_hashes = transfer.piece_hashes.clone();
        let file_size = transfer.file_size;
        if let Some((prev, state)) = change {
            self.alerts.post(Alert::StateChanged { hash, prev, state });
        }
        self.checking = Some(hash);

        let key = self.storage_key(&hash).expect("transfer added with storage id");
        let disk = self.disk.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = run_full_check(disk, key, file_size, piece_hashes).await;
            let event = match result {
                Ok(have) => SessionEvent::CheckDone { hash, have },
                Err(kind) => SessionEvent::CheckFailed { hash, kind },
            };
            let _ = events.send(event);
        });
        info!("checking {}", hash);
    }

    async fn drain_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                SessionEvent::CheckDone { hash, have } => {
                    if self.checking == Some(hash) {
                        self.checking = None;
                    }
                    let Some(transfer) = self.transfers.get_mut(&hash) else { continue };
                    for (piece, ok) in have.iter().enumerate() {
                        if *ok {
                            transfer.picker.set_have(piece as u32);
                        }
                    }
                    let next = if transfer.picker.is_finished() {
                        transfer.seed = true;
                        TransferState::Seeding
                    } else {
                        TransferState::Downloading
                    };
                    if let Some((prev, state)) = transfer.set_state(next) {
                        self.alerts.post(Alert::StateChanged { hash, prev, state });
                    }
                }
                SessionEvent::CheckFailed { hash, kind } => {
                    if self.checking == Some(hash) {
                        self.checking = None;
                    }
                    // a missing file just means we start from zero
                    if kind == ErrorKind::FileNotFound {
                        if let Some(transfer) = self.transfers.get_mut(&hash) {
                            if let Some((prev, state)) = transfer.set_state(TransferState::Downloading) {
                                self.alerts.post(Alert::StateChanged { hash, prev, state });
                            }
                            continue;
                        }
                    }
                    self.alerts.post(Alert::TransferFailed { hash, kind });
                    if let Some(transfer) = self.transfers.get_mut(&hash) {
                        if let Some((prev, state)) = transfer.pause() {
                            self.alerts.post(Alert::StateChanged { hash, prev, state });
                        }
                    }
                }
                SessionEvent::PieceHashed { hash, piece, ok } => {
                    self.apply_piece_verdict(hash, piece, ok);
                }
            }
        }
    }

    fn apply_piece_verdict(&mut self, hash: FileHash, piece: u32, ok: bool) {
        let contributors = self.piece_contributors.remove(&(hash, piece)).unwrap_or_default();
        let Some(transfer) = self.transfers.get_mut(&hash) else { return };
        if ok {
            for addr in &contributors {
                if let Some(peer) = transfer.policy.peer_mut(&point_of(addr)) {
                    peer.on_hash_success();
                }
            }
            if let Some((prev, state)) = transfer.on_piece_verified(piece) {
                self.alerts.post(Alert::StateChanged { hash, prev, state });
                self.alerts.post(Alert::TransferFinished { hash });
            }
        } else {
            transfer.picker.on_hash_fail(piece);
            self.alerts.post(Alert::PieceHashFailed { hash, piece });
            // every peer that fed the piece loses trust; repeat
            // offenders get their connection torn down
            let mut to_drop = Vec::new();
            for addr in &contributors {
                if let Some(peer) = transfer.policy.peer_mut(&point_of(addr)) {
                    peer.on_hash_failure();
                    if peer.should_ban() {
                        to_drop.push(*addr);
                    }
                }
            }
            for addr in to_drop {
                self.unregister_connection(&addr, ErrorKind::FailedHashCheck);
            }
        }
    }

    // ---- data path ----

    /// Storage key of a transfer's backing file.
    pub fn storage_key(&self, hash: &FileHash) -> Option<StorageKey> {
        let transfer = self.transfers.get(hash)?;
        let storage_id = *self.storage_ids.get(hash)?;
        Some(StorageKey {
            storage_id,
            file_index: 0,
            path: transfer.file_path.clone(),
        })
    }

    /// A validated block arrived from `from`: write it, update the
    /// picker, and queue a hash check when its piece completed.
    pub async fn on_block_received(
        &mut self,
        hash: FileHash,
        offset: u64,
        data: Vec<u8>,
        from: SocketAddr,
    ) -> Result<()> {
        let key = self
            .storage_key(&hash)
            .ok_or_else(|| Ed2kError::session_error(ErrorKind::InvalidHandle))?;
        let len = data.len() as u64;

        let done = self.disk.write(key.clone(), offset, data).await;
        let transfer = self
            .transfers
            .get_mut(&hash)
            .ok_or_else(|| Ed2kError::session_error(ErrorKind::InvalidHandle))?;
        transfer.on_bytes_downloaded(len);

        match done.await {
            Ok(DiskJobResult::Done) => {}
            Ok(DiskJobResult::Failed(kind)) => {
                // write errors pause the transfer
                self.alerts.post(Alert::DiskError {
                    kind,
                    path: Some(key.path.display().to_string()),
                });
                if let Some(transfer) = self.transfers.get_mut(&hash) {
                    if let Some((prev, state)) = transfer.pause() {
                        self.alerts.post(Alert::StateChanged { hash, prev, state });
                    }
                }
                return Err(Ed2kError::storage_error(kind, "block write failed").into());
            }
            _ => {}
        }

        let transfer = self.transfers.get_mut(&hash).expect("checked above");
        let completed = transfer.picker.mark_received(offset, offset + len);

        // remember who fed the piece until its verdict is in
        let piece = (offset / PIECE_SIZE) as u32;
        let contributors = self.piece_contributors.entry((hash, piece)).or_default();
        if !contributors.contains(&from) {
            contributors.push(from);
        }

        for piece in completed {
            self.queue_piece_check(hash, piece).await;
        }
        Ok(())
    }

    /// Queue the hash verification of one completed piece.
    async fn queue_piece_check(&mut self, hash: FileHash, piece: u32) {
        let Some(key) = self.storage_key(&hash) else { return };
        let Some(transfer) = self.transfers.get(&hash) else { return };
        let expected = match transfer.piece_hashes.get(piece as usize) {
            Some(expected) => *expected,
            None => return,
        };
        let (offset, len) = transfer.picker.piece_extent(piece);

        let done = self.disk.hash_piece(key, offset, len).await;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let ok = matches!(done.await, Ok(DiskJobResult::PieceHash(got)) if got == expected);
            let _ = events.send(SessionEvent::PieceHashed { hash, piece, ok });
        });
    }

    /// Serve one uploaded range to a slot-holding peer.
    pub async fn read_block_for_upload(&mut self, hash: FileHash, begin: u64, end: u64) -> Result<Vec<u8>> {
        let key = self
            .storage_key(&hash)
            .ok_or_else(|| Ed2kError::session_error(ErrorKind::InvalidHandle))?;
        let done = self.disk.read(key, begin, (end - begin) as usize).await;
        match done.await {
            Ok(DiskJobResult::Data(data)) => {
                if let Some(transfer) = self.transfers.get_mut(&hash) {
                    transfer.on_bytes_uploaded(data.len() as u64);
                }
                Ok(data)
            }
            Ok(DiskJobResult::Failed(kind)) => {
                // read errors leave the transfer upload-only on other pieces
                self.alerts.post(Alert::DiskError { kind, path: None });
                Err(Ed2kError::storage_error(kind, "block read failed").into())
            }
            other => Err(Ed2kError::storage_error(
                ErrorKind::Other,
                format!("unexpected disk result: {:?}", other),
            )
            .into()),
        }
    }

    /// Answer a peer's upload request: grant a slot, queue it or refuse.
    pub fn answer_upload_request(&mut self, addr: SocketAddr, hash: &FileHash) -> PeerMessage {
        if !self.transfers.contains_key(hash) {
            return PeerMessage::NoSuchFile { hash: *hash };
        }
        let score = self
            .transfers
            .get(hash)
            .map(|t| {
                let requested = t.stats.requested.max(1);
                t.stats.transferred * 100 / requested
            })
            .unwrap_or(0);
        match self.upload_queue.request_slot(addr, score, Instant::now()) {
            SlotDecision::Accepted => PeerMessage::AcceptUpload,
            SlotDecision::Queued(rank) => PeerMessage::QueueRanking { rank },
            SlotDecision::Full => PeerMessage::QueueFull,
        }
    }

    /// Validate a REQUESTPARTS against a transfer; out-of-range requests
    /// produce `OUTOFPARTREQS` and nothing is sent.
    pub fn validate_part_request(&self, hash: &FileHash, begins: &[u64; 3], ends: &[u64; 3]) -> Vec<(u64, u64)> {
        match self.transfers.get(hash) {
            Some(transfer) => clamp_ranges(transfer.file_size, begins, ends),
            None => Vec::new(),
        }
    }

    /// Build the reply stream for a REQUESTPARTS: one SENDINGPART per
    /// surviving range, or a single OUTOFPARTREQS when nothing does.
    pub async fn serve_part_request(
        &mut self,
        hash: FileHash,
        begins: &[u64; 3],
        ends: &[u64; 3],
    ) -> Vec<PeerMessage> {
        let ranges = self.validate_part_request(&hash, begins, ends);
        if ranges.is_empty() {
            return vec![PeerMessage::OutOfParts];
        }

        let mut out = Vec::with_capacity(ranges.len());
        for (begin, end) in ranges {
            match self.read_block_for_upload(hash, begin, end).await {
                Ok(data) => {
                    let wide = begin > u32::MAX as u64 || end > u32::MAX as u64;
                    out.push(if wide {
                        PeerMessage::SendingPart64 { hash, begin, end, data }
                    } else {
                        PeerMessage::SendingPart32 {
                            hash,
                            begin: begin as u32,
                            end: end as u32,
                            data,
                        }
                    });
                }
                Err(e) => {
                    warn!("serving [{}, {}) of {} failed: {}", begin, end, hash, e);
                    out.push(PeerMessage::OutOfParts);
                    break;
                }
            }
        }
        out
    }

    /// Announce the shared (seeding) transfers to the master server and
    /// every slave link.
    pub async fn announce_shared(&mut self) -> Result<()> {
        let entries: Vec<crate::protocol::message::SharedFileEntry> = self
            .transfers
            .values()
            .filter(|t| t.seed || t.picker.have_count() > 0)
            .map(|t| {
                crate::server::announce_entry(
                    t.hash,
                    t.file_path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    t.file_size,
                    t.picker.is_finished(),
                    None,
                )
            })
            .collect();
        if entries.is_empty() {
            return Ok(());
        }

        if let Some(server) = self.server.as_mut() {
            server.post_announce(entries.clone()).await?;
        }
        for slave in self.slave_servers.iter_mut() {
            if let Err(e) = slave.post_announce(entries.clone()).await {
                warn!("announce to slave {} failed: {}", slave.params.name, e);
            }
        }
        Ok(())
    }

    /// Close down: cancel pending work and refuse new operations.
    pub fn close(&mut self) {
        self.closing = true;
        for (_, handle) in self.connections.drain() {
            let _ = handle.shutdown.send(true);
        }
        info!("session closing");
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }
}

/// Wire form of a socket address, for peer-table lookups.
fn point_of(addr: &SocketAddr) -> NetworkPoint {
    match addr {
        SocketAddr::V4(v4) => NetworkPoint::new(u32::from(*v4.ip()).to_be(), v4.port()),
        SocketAddr::V6(_) => NetworkPoint::default(),
    }
}

/// Full-file hash check: stream every piece through the disk worker and
/// compare with the expected hash list.
async fn run_full_check(
    disk: DiskIo,
    key: StorageKey,
    file_size: u64,
    piece_hashes: Vec<FileHash>,
) -> std::result::Result<Vec<bool>, ErrorKind> {
    let pieces = crate::hash::piece_count(file_size);
    let mut have = vec![false; pieces as usize];
    for piece in 0..pieces {
        let offset = piece as u64 * PIECE_SIZE;
        let len = crate::hash::piece_size_at(file_size, piece);
        let done = disk.hash_piece(key.clone(), offset, len).await;
        match done.await {
            Ok(DiskJobResult::PieceHash(got)) => {
                have[piece as usize] = piece_hashes.get(piece as usize) == Some(&got);
            }
            Ok(DiskJobResult::Failed(kind)) => return Err(kind),
            _ => return Err(ErrorKind::Other),
        }
    }
    Ok(have)
}

/// Drive the download side of one connected peer until it disconnects
/// or the session tears it down.
///
/// The connection has completed its handshake and bound itself to a
/// transfer; this loop registers the endpoint, answers status,
/// negotiates a slot and pumps the parts flow into the session.
pub async fn drive_peer_download(session: Arc<Mutex<Session>>, mut connection: PeerConnection) {
    let addr = connection.addr;
    let Some(hash) = connection.transfer_hash else {
        connection.close().await;
        return;
    };
    let registered = {
        let mut session = session.lock().await;
        session
            .register_connection(addr, Some(hash))
            .map(|shutdown| (session.settings.clone(), shutdown))
    };
    let (settings, mut shutdown) = match registered {
        Ok(pair) => pair,
        Err(e) => {
            debug!("refusing peer {}: {}", addr, e);
            connection.close().await;
            return;
        }
    };

    let exit_kind = loop {
        let message = tokio::select! {
            _ = shutdown.changed() => {
                debug!("connection to {} torn down by the session", addr);
                break ErrorKind::ConnectionReset;
            }
            result = connection.read_message(&settings) => match result {
                Ok(message) => message,
                Err(e) => {
                    debug!("peer {} read failed: {}", addr, e);
                    break e.downcast::<Ed2kError>().map(|e| e.kind()).unwrap_or(ErrorKind::Other);
                }
            },
        };

        match message {
            PeerMessage::NoSuchFile { .. } => break ErrorKind::FileNotFound,
            PeerMessage::FileNameAnswer { .. } => {
                // learned the remote name; ask for its piece map
                let status = {
                    let session = session.lock().await;
                    session.transfer(&hash).map(|t| t.picker.piece_count())
                };
                if status.is_none() {
                    break ErrorKind::InvalidHandle;
                }
            }
            PeerMessage::FileStatus { bitfield, .. } => {
                {
                    let mut session = session.lock().await;
                    if let Some(transfer) = session.transfer_mut(&hash) {
                        transfer.picker.inc_availability(&bitfield);
                    }
                }
                connection.peer_bits = bitfield;
                if connection
                    .send(&PeerMessage::StartUpload { hash }, &settings)
                    .await
                    .is_err()
                {
                    break ErrorKind::ConnectionReset;
                }
            }
            PeerMessage::AcceptUpload => {
                // pick blocks and issue the first request batch
                let ranges: Vec<(u64, u64)> = {
                    let mut session = session.lock().await;
                    match session.transfer_mut(&hash) {
                        Some(transfer) => transfer
                            .picker
                            .pick_blocks(&connection.peer_bits, settings.max_outstanding_requests)
                            .iter()
                            .map(|b| (b.begin, b.end))
                            .collect(),
                        None => break ErrorKind::InvalidHandle,
                    }
                };
                if ranges.is_empty() {
                    let _ = connection.send(&PeerMessage::EndOfDownload { hash }, &settings).await;
                    break ErrorKind::TransferFinished;
                }
                if connection.request_parts(&ranges, &settings).await.is_err() {
                    break ErrorKind::ConnectionReset;
                }
            }
            PeerMessage::QueueRanking { rank } => {
                trace!("queued at {} by {}", rank, addr);
            }
            PeerMessage::SendingPart32 { begin, end, data, .. } => {
                if let Some((offset, data)) = connection.accept_part(begin as u64, end as u64, data) {
                    let mut session = session.lock().await;
                    if session.on_block_received(hash, offset, data, addr).await.is_err() {
                        break ErrorKind::Other;
                    }
                }
            }
            PeerMessage::SendingPart64 { begin, end, data, .. } => {
                if let Some((offset, data)) = connection.accept_part(begin, end, data) {
                    let mut session = session.lock().await;
                    if session.on_block_received(hash, offset, data, addr).await.is_err() {
                        break ErrorKind::Other;
                    }
                }
            }
            PeerMessage::CompressedPart32 { begin, packed_len, data, .. } => {
                match connection.accept_compressed_part(begin as u64, packed_len, &data) {
                    Ok(Some((offset, data))) => {
                        let mut session = session.lock().await;
                        if session.on_block_received(hash, offset, data, addr).await.is_err() {
                            break ErrorKind::Other;
                        }
                    }
                    Ok(None) => {}
                    Err(_) => break ErrorKind::UnsupportedPackedType,
                }
            }
            PeerMessage::CompressedPart64 { begin, packed_len, data, .. } => {
                match connection.accept_compressed_part(begin, packed_len, &data) {
                    Ok(Some((offset, data))) => {
                        let mut session = session.lock().await;
                        if session.on_block_received(hash, offset, data, addr).await.is_err() {
                            break ErrorKind::Other;
                        }
                    }
                    Ok(None) => {}
                    Err(_) => break ErrorKind::UnsupportedPackedType,
                }
            }
            PeerMessage::OutOfParts | PeerMessage::CancelTransfer => {
                debug!("{} ended the parts flow", addr);
                break ErrorKind::TransferAborted;
            }
            other => {
                trace!("unrouted peer message from {}: {:?}", addr, other);
            }
        }
    };

    connection.close().await;
    let mut session = session.lock().await;
    session.unregister_connection(&addr, exit_kind);
}

/// Drive the upload side of one accepted peer until it disconnects or
/// the session tears it down: register the endpoint, answer file
/// queries, negotiate the slot queue and stream parts.
pub async fn drive_peer_upload(session: Arc<Mutex<Session>>, mut connection: PeerConnection) {
    let addr = connection.addr;
    let registered = {
        let mut session = session.lock().await;
        session
            .register_connection(addr, connection.transfer_hash)
            .map(|shutdown| (session.settings.clone(), shutdown))
    };
    let (settings, mut shutdown) = match registered {
        Ok(pair) => pair,
        Err(e) => {
            debug!("refusing peer {}: {}", addr, e);
            connection.close().await;
            return;
        }
    };

    let exit_kind = loop {
        let message = tokio::select! {
            _ = shutdown.changed() => {
                debug!("connection to {} torn down by the session", addr);
                break ErrorKind::ConnectionReset;
            }
            result = connection.read_message(&settings) => match result {
                Ok(message) => message,
                Err(e) => {
                    break e.downcast::<Ed2kError>().map(|e| e.kind()).unwrap_or(ErrorKind::Other);
                }
            },
        };

        match message {
            PeerMessage::FileRequest { hash } | PeerMessage::FileNameRequest { hash } => {
                let reply = {
                    let session = session.lock().await;
                    match session.transfer(&hash) {
                        Some(transfer) => PeerMessage::FileNameAnswer {
                            hash,
                            name: transfer
                                .file_path
                                .file_name()
                                .map(|n| n.to_string_lossy().into_owned())
                                .unwrap_or_default(),
                        },
                        None => PeerMessage::NoSuchFile { hash },
                    }
                };
                let no_file = matches!(reply, PeerMessage::NoSuchFile { .. });
                if connection.send(&reply, &settings).await.is_err() {
                    break ErrorKind::ConnectionReset;
                }
                if no_file {
                    continue;
                }
                let status = {
                    let session = session.lock().await;
                    session.transfer(&hash).map(|t| t.file_status())
                };
                if let Some(status) = status {
                    if connection.send(&status, &settings).await.is_err() {
                        break ErrorKind::ConnectionReset;
                    }
                }
            }
            PeerMessage::HashsetRequest { hash } => {
                let reply = {
                    let session = session.lock().await;
                    match session.transfer(&hash) {
                        Some(transfer) => PeerMessage::HashsetAnswer {
                            hash,
                            hashes: transfer.piece_hashes.clone(),
                        },
                        None => PeerMessage::NoSuchFile { hash },
                    }
                };
                if connection.send(&reply, &settings).await.is_err() {
                    break ErrorKind::ConnectionReset;
                }
            }
            PeerMessage::StartUpload { hash } => {
                connection.transfer_hash = Some(hash);
                let reply = {
                    let mut session = session.lock().await;
                    session.answer_upload_request(addr, &hash)
                };
                if connection.send(&reply, &settings).await.is_err() {
                    break ErrorKind::ConnectionReset;
                }
            }
            PeerMessage::RequestParts32 { hash, begins, ends } => {
                let begins = [begins[0] as u64, begins[1] as u64, begins[2] as u64];
                let ends = [ends[0] as u64, ends[1] as u64, ends[2] as u64];
                if stream_parts(&session, &mut connection, hash, &begins, &ends, &settings)
                    .await
                    .is_err()
                {
                    break ErrorKind::ConnectionReset;
                }
            }
            PeerMessage::RequestParts64 { hash, begins, ends } => {
                if stream_parts(&session, &mut connection, hash, &begins, &ends, &settings)
                    .await
                    .is_err()
                {
                    break ErrorKind::ConnectionReset;
                }
            }
            PeerMessage::EndOfDownload { .. } | PeerMessage::CancelTransfer => {
                break ErrorKind::TransferFinished;
            }
            other => {
                trace!("unrouted peer message from {}: {:?}", addr, other);
            }
        }
    };

    connection.close().await;
    let mut session = session.lock().await;
    session.unregister_connection(&addr, exit_kind);
}

async fn stream_parts(
    session: &Arc<Mutex<Session>>,
    connection: &mut PeerConnection,
    hash: FileHash,
    begins: &[u64; 3],
    ends: &[u64; 3],
    settings: &SessionSettings,
) -> Result<()> {
    // slot holders only; everyone else gets a rank reminder
    let replies = {
        let mut session = session.lock().await;
        if session.upload_queue.has_slot(&connection.addr) {
            session.serve_part_request(hash, begins, ends).await
        } else {
            match session.upload_queue.rank_of(&connection.addr) {
                Some(rank) => vec![PeerMessage::QueueRanking { rank }],
                None => vec![PeerMessage::OutOfParts],
            }
        }
    };
    for reply in replies {
        connection.send(&reply, settings).await?;
    }
    Ok(())
}
