//! Peer table entries
//!
//! One record per known remote client: where it came from, how often it
//! failed and when it may be contacted again.

use std::time::Instant;

use crate::protocol::message::NetworkPoint;
use crate::settings::SessionSettings;

/// How a peer was learned about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSourceKind {
    Server,
    Dht,
    Exchange,
    Incoming,
    Resume,
}

/// A known peer of one transfer.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub point: NetworkPoint,
    pub source: PeerSourceKind,
    pub failcount: u32,
    pub last_connect: Option<Instant>,
    pub connected: bool,
    /// cleared when the peer contributed to a failing piece
    pub trusted: bool,
    /// consecutive failed piece checks fed by this peer
    pub hash_failures: u32,
}

impl PeerEntry {
    pub fn new(point: NetworkPoint, source: PeerSourceKind) -> Self {
        Self {
            point,
            source,
            failcount: 0,
            last_connect: None,
            connected: false,
            trusted: true,
            hash_failures: 0,
        }
    }

    /// Whether a connect attempt may be made now.
    pub fn connect_candidate(&self, now: Instant, settings: &SessionSettings) -> bool {
        if self.connected || self.point.is_empty() || self.point.is_low_id() {
            return false;
        }
        if self.failcount >= settings.max_failcount {
            return false;
        }
        match self.last_connect {
            None => true,
            Some(last) => now.duration_since(last) >= settings.reconnect_delay(self.failcount),
        }
    }

    /// Record the start of a connect attempt.
    pub fn on_connect_started(&mut self, now: Instant) {
        self.last_connect = Some(now);
    }

    /// Record a successful connection.
    pub fn on_connected(&mut self) {
        self.connected = true;
        self.failcount = 0;
    }

    /// Record a disconnect; `failed` counts against the peer.
    pub fn on_disconnected(&mut self, failed: bool) {
        self.connected = false;
        if failed {
            self.failcount += 1;
        }
    }

    /// The peer fed a piece that failed its hash check.
    pub fn on_hash_failure(&mut self) {
        self.trusted = false;
        self.hash_failures += 1;
    }

    /// A piece this peer fed verified cleanly; the failure streak is
    /// broken.
    pub fn on_hash_success(&mut self) {
        self.hash_failures = 0;
    }

    /// The peer should be dropped for repeated bad data.
    pub fn should_ban(&self) -> bool {
        self.hash_failures >= 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry() -> PeerEntry {
        PeerEntry::new(NetworkPoint::new(0x0100_0000, 4662), PeerSourceKind::Server)
    }

    #[test]
    fn test_fresh_peer_is_candidate() {
        let settings = SessionSettings::default();
        assert!(entry().connect_candidate(Instant::now(), &settings));
    }

    #[test]
    fn test_low_id_peer_not_direct_candidate() {
        let settings = SessionSettings::default();
        let peer = PeerEntry::new(NetworkPoint::new(0x00FF_FFFF, 4662), PeerSourceKind::Server);
        assert!(!peer.connect_candidate(Instant::now(), &settings));
    }

    #[test]
    fn test_reconnect_backoff_scales_with_failcount() {
        let settings = SessionSettings::default();
        let now = Instant::now();
        let mut peer = entry();
        peer.on_connect_started(now);
        peer.on_disconnected(true);
        assert_eq!(peer.failcount, 1);

        assert!(!peer.connect_candidate(now + Duration::from_secs(1), &settings));
        assert!(peer.connect_candidate(now + settings.reconnect_delay(1), &settings));
    }

    #[test]
    fn test_forgotten_after_max_failcount() {
        let settings = SessionSettings::default();
        let mut peer = entry();
        for _ in 0..settings.max_failcount {
            peer.on_connect_started(Instant::now());
            peer.on_disconnected(true);
        }
        let much_later = Instant::now() + Duration::from_secs(1_000_000);
        assert!(!peer.connect_candidate(much_later, &settings));
    }

    #[test]
    fn test_success_resets_failcount() {
        let mut peer = entry();
        peer.on_disconnected(true);
        peer.on_disconnected(true);
        peer.on_connected();
        assert_eq!(peer.failcount, 0);
        assert!(peer.connected);
    }

    #[test]
    fn test_hash_failures_untrust_and_ban() {
        let mut peer = entry();
        peer.on_hash_failure();
        assert!(!peer.trusted);
        assert!(!peer.should_ban());
        peer.on_hash_failure();
        peer.on_hash_failure();
        assert!(peer.should_ban());
    }

    #[test]
    fn test_hash_success_breaks_the_streak() {
        let mut peer = entry();
        peer.on_hash_failure();
        peer.on_hash_failure();
        peer.on_hash_success();
        peer.on_hash_failure();
        assert_eq!(peer.hash_failures, 1);
        assert!(!peer.should_ban());
        // trust is not restored by a clean piece
        assert!(!peer.trusted);
    }
}
