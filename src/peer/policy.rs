//! Peer policy
//!
//! The per-transfer peer list: deduplicated by endpoint, capped in size,
//! with connect eligibility and retry backoff driven by failcounts.

use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, trace};

use crate::peer::peer::{PeerEntry, PeerSourceKind};
use crate::protocol::message::NetworkPoint;
use crate::settings::SessionSettings;

/// The set of known peers for one transfer.
#[derive(Debug)]
pub struct PeerPolicy {
    peers: HashMap<NetworkPoint, PeerEntry>,
    max_size: usize,
}

impl PeerPolicy {
    pub fn new(max_size: usize) -> Self {
        Self {
            peers: HashMap::new(),
            max_size,
        }
    }

    /// Add one peer; duplicates by `(ip, port)` are ignored. Returns
    /// whether the peer was inserted.
    pub fn add_peer(&mut self, point: NetworkPoint, source: PeerSourceKind) -> bool {
        if point.is_empty() {
            return false;
        }
        if self.peers.contains_key(&point) {
            trace!("peer {}:{} already known", point.ip, point.port);
            return false;
        }
        if self.peers.len() >= self.max_size {
            // make room by dropping the worst disconnected peer
            let victim = self
                .peers
                .iter()
                .filter(|(_, p)| !p.connected)
                .max_by_key(|(_, p)| p.failcount)
                .map(|(k, _)| *k);
            match victim {
                Some(key) => {
                    self.peers.remove(&key);
                }
                None => return false,
            }
        }
        self.peers.insert(point, PeerEntry::new(point, source));
        true
    }

    /// Bulk insert, counting how many were new.
    pub fn add_peers(&mut self, points: &[NetworkPoint], source: PeerSourceKind) -> usize {
        let mut added = 0;
        for point in points {
            if self.add_peer(*point, source) {
                added += 1;
            }
        }
        debug!("added {} of {} announced peers (total {})", added, points.len(), self.peers.len());
        added
    }

    /// Peers eligible for a connect attempt now, best first.
    pub fn connect_candidates(&self, now: Instant, settings: &SessionSettings) -> Vec<NetworkPoint> {
        let mut candidates: Vec<&PeerEntry> = self
            .peers
            .values()
            .filter(|p| p.connect_candidate(now, settings))
            .collect();
        // fewer failures first, then least recently tried
        candidates.sort_by_key(|p| (p.failcount, p.last_connect));
        candidates.iter().map(|p| p.point).collect()
    }

    /// Mutable access to one entry.
    pub fn peer_mut(&mut self, point: &NetworkPoint) -> Option<&mut PeerEntry> {
        self.peers.get_mut(point)
    }

    /// Drop peers past the failure cap.
    pub fn prune(&mut self, settings: &SessionSettings) {
        let before = self.peers.len();
        self.peers
            .retain(|_, p| p.connected || p.failcount < settings.max_failcount);
        if self.peers.len() != before {
            debug!("pruned {} dead peers", before - self.peers.len());
        }
    }

    /// Currently connected peer count.
    pub fn connected_count(&self) -> usize {
        self.peers.values().filter(|p| p.connected).count()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Whether the transfer wants more peers than it has.
    pub fn want_more_peers(&self) -> bool {
        self.peers.len() < self.max_size / 2
    }
}
