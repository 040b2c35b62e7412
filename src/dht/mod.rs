//! DHT module
//!
//! The Kademlia overlay used for serverless source and keyword search:
//! routing table, RPC transaction table and iterative traversals, glued
//! to a UDP socket.

pub mod message;
pub mod node;
pub mod routing;
pub mod rpc;
pub mod traversal;

// Re-export main types
pub use message::{KadMessage, KadSearchHit};
pub use node::{kad_id_from_ip, KadContact, KadId};
pub use routing::{RoutingTable, K};
pub use rpc::{RpcManager, RpcOutcome};
pub use traversal::{LookupKind, Traversal, ALPHA};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, trace, warn};

use crate::alert::{Alert, AlertQueue};
use crate::error::{Ed2kError, ErrorKind};
use crate::hash::FileHash;
use crate::protocol::message::NetworkPoint;
use crate::protocol::tag::TagList;

// source-hit tag ids used inside kad search results
const TAG_SOURCEIP: u8 = 0xFF;
const TAG_SOURCEPORT: u8 = 0xFE;

/// Kad protocol version we speak.
pub const KAD_VERSION: u8 = 0x09;

/// A finished lookup handed back to the session.
#[derive(Debug)]
pub enum LookupResult {
    Nodes {
        target: KadId,
    },
    Sources {
        target: KadId,
        peers: Vec<NetworkPoint>,
    },
    Keyword {
        target: KadId,
        hits: Vec<KadSearchHit>,
    },
}

/// All mutable DHT state; lives behind one lock shared by the receive
/// task and the session tick.
pub struct DhtState {
    pub own_id: KadId,
    pub tcp_port: u16,
    pub udp_port: u16,
    routing: RoutingTable,
    rpc: RpcManager,
    rpc_tx: mpsc::UnboundedSender<rpc::RpcEvent>,
    rpc_rx: mpsc::UnboundedReceiver<rpc::RpcEvent>,
    /// one traversal per target: concurrent lookups for the same id coalesce
    traversals: HashMap<KadId, Traversal>,
    observers: HashMap<u64, (KadId, SocketAddr)>,
    finished: Vec<LookupResult>,
}

impl DhtState {
    pub fn new(own_id: KadId, tcp_port: u16, udp_port: u16) -> Self {
        let (rpc_tx, rpc_rx) = mpsc::unbounded_channel();
        Self {
            own_id,
            tcp_port,
            udp_port,
            routing: RoutingTable::new(own_id),
            rpc: RpcManager::new(),
            rpc_tx,
            rpc_rx,
            traversals: HashMap::new(),
            observers: HashMap::new(),
            finished: Vec::new(),
        }
    }

    /// Known node count.
    pub fn node_count(&self) -> usize {
        self.routing.node_count()
    }

    /// Handle one incoming datagram; returns packets to send back.
    pub fn handle_message(&mut self, message: KadMessage, from: SocketAddr) -> Vec<(SocketAddr, KadMessage)> {
        // replies to our own RPCs are consumed by the transaction table
        if self.rpc.incoming(&message, from) {
            return Vec::new();
        }

        match message {
            KadMessage::Ping => vec![(
                from,
                KadMessage::Pong {
                    udp_port: self.udp_port,
                },
            )],
            KadMessage::HelloReq { id, tcp_port, version } => {
                self.node_seen_from(id, from, tcp_port, version);
                vec![(
                    from,
                    KadMessage::HelloRes {
                        id: self.own_id,
                        tcp_port: self.tcp_port,
                        version: KAD_VERSION,
                    },
                )]
            }
            KadMessage::BootstrapReq => {
                let contacts = self.routing.closest_nodes(&self.own_id, 20);
                vec![(
                    from,
                    KadMessage::BootstrapRes {
                        id: self.own_id,
                        tcp_port: self.tcp_port,
                        version: KAD_VERSION,
                        contacts,
                    },
                )]
            }
            KadMessage::Req { find_type, target, .. } => {
                // the find type doubles as the requested contact count
                let count = (find_type as usize).min(routing::K);
                let contacts = self.routing.closest_nodes(&target, count);
                vec![(from, KadMessage::Res { target, contacts })]
            }
            KadMessage::SearchKeyReq { .. } | KadMessage::SearchSourceReq { .. } | KadMessage::SearchNotesReq { .. } => {
                // we do not index published values; nothing to answer
                trace!("ignoring search request from {}", from);
                Vec::new()
            }
            other => {
                debug!("unsolicited kad message 0x{:02X} from {}", other.opcode(), from);
                Vec::new()
            }
        }
    }

    fn node_seen_from(&mut self, id: KadId, from: SocketAddr, tcp_port: u16, version: u8) {
        if let SocketAddr::V4(v4) = from {
            let contact = KadContact {
                id,
                ip: u32::from(*v4.ip()).to_be(),
                udp_port: v4.port(),
                tcp_port,
                version,
            };
            self.routing.node_seen(contact);
        }
    }

    /// Start (or join) a lookup toward `target`. Returns false when one
    /// is already running for that id.
    pub fn start_lookup(&mut self, target: KadId, kind: LookupKind) -> bool {
        if self.traversals.contains_key(&target) {
            debug!("lookup for {} already in flight, coalescing", target);
            return false;
        }
        if self.routing.node_count() == 0 {
            warn!("cannot start lookup for {}: no router contacts", target);
            return false;
        }
        let seeds = self.routing.closest_nodes(&target, routing::K);
        let traversal = Traversal::new(self.own_id, target, kind, seeds);
        self.traversals.insert(target, traversal);
        true
    }

    /// Drain RPC events, advance traversals and collect outgoing packets.
    pub fn pump(&mut self) -> Vec<(SocketAddr, KadMessage)> {
        while let Ok((observer_id, outcome)) = self.rpc_rx.try_recv() {
            let Some((target, addr)) = self.observers.get(&observer_id).copied() else {
                continue;
            };
            match outcome {
                rpc::RpcOutcome::Reply(message, from) => {
                    self.observers.remove(&observer_id);
                    match message {
                        KadMessage::Res { contacts, .. } => {
                            for contact in &contacts {
                                self.routing.node_seen(*contact);
                            }
                            if let Some(traversal) = self.traversals.get_mut(&target) {
                                traversal.on_reply(from, &contacts);
                            }
                        }
                        KadMessage::SearchRes { hits, .. } => {
                            if let Some(traversal) = self.traversals.get_mut(&target) {
                                traversal.on_hits(hits);
                            }
                        }
                        KadMessage::BootstrapRes {
                            id,
                            tcp_port,
                            version,
                            contacts,
                        } => {
                            self.node_seen_from(id, from, tcp_port, version);
                            for contact in contacts {
                                self.routing.node_seen(contact);
                            }
                        }
                        KadMessage::Pong { .. } | KadMessage::HelloRes { .. } => {}
                        other => trace!("observer reply 0x{:02X} ignored", other.opcode()),
                    }
                }
                rpc::RpcOutcome::ShortTimeout => {
                    if let Some(traversal) = self.traversals.get_mut(&target) {
                        traversal.on_short_timeout(addr);
                    }
                }
                rpc::RpcOutcome::Timeout => {
                    self.observers.remove(&observer_id);
                    self.routing.node_failed(addr);
                    if let Some(traversal) = self.traversals.get_mut(&target) {
                        traversal.on_timeout(addr);
                    }
                }
            }
        }

        let mut out = Vec::new();
        for traversal in self.traversals.values_mut() {
            for (contact, message) in traversal.next_messages() {
                let addr = contact.udp_addr();
                if let Some(expect) = message.response_opcode() {
                    let kad_id = match &message {
                        KadMessage::Req { target, .. } => Some(*target),
                        KadMessage::SearchKeyReq { target, .. }
                        | KadMessage::SearchSourceReq { target, .. }
                        | KadMessage::SearchNotesReq { target, .. } => Some(*target),
                        _ => None,
                    };
                    let id = self.rpc.register(expect, addr, kad_id, self.rpc_tx.clone());
                    self.observers.insert(id, (traversal.target, addr));
                }
                out.push((addr, message));
            }
        }

        // sweep finished traversals into results
        let finished_targets: Vec<KadId> = self
            .traversals
            .iter()
            .filter(|(_, t)| t.is_finished())
            .map(|(k, _)| *k)
            .collect();
        for target in finished_targets {
            let traversal = self.traversals.remove(&target).expect("target collected above");
            info!("lookup {} finished with {} hits", target, traversal.hits().len());
            self.finished.push(finish(traversal));
        }

        out
    }

    /// Advance RPC timeouts.
    pub fn tick(&mut self, now: Instant) {
        self.rpc.tick(now);
    }

    /// Take completed lookups.
    pub fn take_finished(&mut self) -> Vec<LookupResult> {
        std::mem::take(&mut self.finished)
    }

    /// Register an RPC that is about to be sent outside a traversal
    /// (bootstrap, ping).
    pub fn register_plain_rpc(&mut self, message: &KadMessage, to: SocketAddr) {
        if let Some(expect) = message.response_opcode() {
            self.rpc.register(expect, to, None, self.rpc_tx.clone());
        }
    }
}

fn finish(traversal: Traversal) -> LookupResult {
    match traversal.kind.clone() {
        LookupKind::FindNode => LookupResult::Nodes {
            target: traversal.target,
        },
        LookupKind::Sources { .. } => LookupResult::Sources {
            target: traversal.target,
            peers: traversal.hits().iter().filter_map(hit_to_peer).collect(),
        },
        LookupKind::Keyword => LookupResult::Keyword {
            target: traversal.target,
            hits: traversal.hits().to_vec(),
        },
    }
}

fn hit_to_peer(hit: &KadSearchHit) -> Option<NetworkPoint> {
    let ip = hit.tags.find(TAG_SOURCEIP)?.as_uint()? as u32;
    let port = hit.tags.find(TAG_SOURCEPORT)?.as_uint()? as u16;
    let point = NetworkPoint::new(ip, port);
    (!point.is_empty()).then_some(point)
}

/// Build the tag list of one source hit.
pub fn source_hit_tags(point: NetworkPoint) -> TagList {
    use crate::protocol::tag::Tag;
    let mut tags = TagList::new();
    tags.push(Tag::uint(TAG_SOURCEIP, point.ip as u64));
    tags.push(Tag::uint(TAG_SOURCEPORT, point.port as u64));
    tags
}

/// The running DHT: shared state plus the UDP socket and receive task.
pub struct Dht {
    pub state: Arc<Mutex<DhtState>>,
    socket: Arc<UdpSocket>,
}

impl Dht {
    /// Bind the UDP socket and start the receive task.
    pub async fn start(
        own_id: KadId,
        tcp_port: u16,
        udp_port: u16,
        alerts: Arc<AlertQueue>,
    ) -> Result<Dht> {
        let socket = UdpSocket::bind(("0.0.0.0", udp_port)).await.map_err(|e| {
            Ed2kError::network_error_with_address(ErrorKind::Other, e.to_string(), format!("0.0.0.0:{}", udp_port))
        })?;
        let socket = Arc::new(socket);
        let state = Arc::new(Mutex::new(DhtState::new(own_id, tcp_port, udp_port)));
        info!("dht listening on udp {} as {}", udp_port, own_id);

        let recv_socket = socket.clone();
        let recv_state = state.clone();
        let recv_alerts = alerts;
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let (len, from) = match recv_socket.recv_from(&mut buf).await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("dht socket error: {}", e);
                        break;
                    }
                };
                let message = match KadMessage::from_datagram(&buf[..len]) {
                    Ok(message) => message,
                    Err(e) => {
                        debug!("bad kad datagram from {}: {}", from, e);
                        continue;
                    }
                };
                let replies = {
                    let mut state = recv_state.lock().await;
                    let replies = state.handle_message(message, from);
                    // deliver whatever lookups just completed
                    for result in state.take_finished() {
                        post_result(&recv_alerts, result);
                    }
                    replies
                };
                for (to, reply) in replies {
                    if let Err(e) = recv_socket.send_to(&reply.to_datagram(), to).await {
                        debug!("dht send to {} failed: {}", to, e);
                    }
                }
            }
        });

        Ok(Dht { state, socket })
    }

    /// Seed the routing table through a bootstrap router.
    pub async fn add_router(&self, router: SocketAddr) -> Result<()> {
        let message = KadMessage::BootstrapReq;
        {
            let mut state = self.state.lock().await;
            state.register_plain_rpc(&message, router);
        }
        self.socket.send_to(&message.to_datagram(), router).await.map_err(|e| {
            Ed2kError::dht_error_with_node(ErrorKind::NoRouter, e.to_string(), router.to_string())
        })?;
        Ok(())
    }

    /// Kick off a source lookup; concurrent lookups for one id coalesce.
    pub async fn find_sources(&self, hash: FileHash, file_size: u64, want: usize) -> bool {
        let mut state = self.state.lock().await;
        state.start_lookup(hash, LookupKind::Sources { file_size, want })
    }

    /// Kick off a keyword lookup.
    pub async fn search_keyword(&self, target: KadId) -> bool {
        let mut state = self.state.lock().await;
        state.start_lookup(target, LookupKind::Keyword)
    }

    /// One scheduler tick: advance timeouts, flush traversal RPCs,
    /// deliver finished lookups.
    pub async fn tick(&self, alerts: &AlertQueue) {
        let (packets, finished) = {
            let mut state = self.state.lock().await;
            state.tick(Instant::now());
            let packets = state.pump();
            (packets, state.take_finished())
        };
        for (to, message) in packets {
            if let Err(e) = self.socket.send_to(&message.to_datagram(), to).await {
                debug!("dht send to {} failed: {}", to, e);
                let mut state = self.state.lock().await;
                state.rpc.unreachable(to);
            }
        }
        for result in finished {
            post_result(alerts, result);
        }
    }
}

fn post_result(alerts: &AlertQueue, result: LookupResult) {
    match result {
        LookupResult::Nodes { .. } => {}
        LookupResult::Sources { target, peers } => {
            alerts.post(Alert::DhtPeersFound { target, peers });
        }
        LookupResult::Keyword { target, hits } => {
            let entries = hits
                .into_iter()
                .map(|hit| crate::protocol::message::SharedFileEntry {
                    hash: hit.answer,
                    point: NetworkPoint::default(),
                    tags: hit.tags,
                })
                .collect();
            alerts.post(Alert::DhtKeywordHit { target, entries });
        }
    }
}
