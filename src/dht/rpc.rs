//! DHT RPC manager
//!
//! Tracks one observer per outstanding RPC, keyed by the expected reply
//! opcode and target address, with an optional kad-id discriminator for
//! lookups (the wire carries no explicit transaction id). Replies from a
//! different source address than the observer's target are dropped.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::dht::message::KadMessage;
use crate::dht::node::KadId;

/// No reply within this window fails the observer.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(12);
/// An early warning to the traversal so it can branch out.
pub const RPC_SHORT_TIMEOUT: Duration = Duration::from_secs(2);

/// What became of an RPC.
#[derive(Debug)]
pub enum RpcOutcome {
    /// The matched reply and its true source address
    Reply(KadMessage, SocketAddr),
    /// Still pending, but slow
    ShortTimeout,
    Timeout,
}

/// An event delivered to the owner of an observer.
pub type RpcEvent = (u64, RpcOutcome);

struct Observer {
    id: u64,
    expect: u8,
    target: SocketAddr,
    packet_kad_id: Option<KadId>,
    sent: Instant,
    short_fired: bool,
    events: mpsc::UnboundedSender<RpcEvent>,
}

/// The transaction table.
pub struct RpcManager {
    observers: Vec<Observer>,
    next_id: u64,
}

impl RpcManager {
    pub fn new() -> Self {
        Self {
            observers: Vec::new(),
            next_id: 1,
        }
    }

    /// Install an observer for a sent RPC. Returns its id.
    pub fn register(
        &mut self,
        expect: u8,
        target: SocketAddr,
        packet_kad_id: Option<KadId>,
        events: mpsc::UnboundedSender<RpcEvent>,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.observers.push(Observer {
            id,
            expect,
            target,
            packet_kad_id,
            sent: Instant::now(),
            short_fired: false,
            events,
        });
        trace!("rpc observer {} installed for 0x{:02X} -> {}", id, expect, target);
        id
    }

    /// Route an incoming packet to its observer, if any.
    ///
    /// Returns true when an observer consumed the packet. A reply whose
    /// source address does not match the observer's target is dropped
    /// without consuming the observer.
    pub fn incoming(&mut self, message: &KadMessage, from: SocketAddr) -> bool {
        let opcode = message.opcode();
        let packet_id = message.packet_kad_id();

        let position = self.observers.iter().position(|o| {
            o.expect == opcode
                && o.target.ip() == from.ip()
                && match (&o.packet_kad_id, &packet_id) {
                    (Some(expected), Some(got)) => expected == got,
                    (Some(_), None) => false,
                    (None, _) => true,
                }
        });

        match position {
            Some(index) => {
                let observer = self.observers.swap_remove(index);
                debug!("rpc observer {} matched reply 0x{:02X} from {}", observer.id, opcode, from);
                let _ = observer.events.send((observer.id, RpcOutcome::Reply(message.clone(), from)));
                true
            }
            None => {
                // either unsolicited or spoofed; both are dropped here
                if self.observers.iter().any(|o| o.expect == opcode) {
                    warn!("dropping reply 0x{:02X} from unmatched source {}", opcode, from);
                }
                false
            }
        }
    }

    /// The target endpoint became unreachable; fail its oldest observer.
    pub fn unreachable(&mut self, addr: SocketAddr) {
        if let Some(index) = self.observers.iter().position(|o| o.target == addr) {
            let observer = self.observers.swap_remove(index);
            debug!("rpc observer {} unreachable {}", observer.id, addr);
            let _ = observer.events.send((observer.id, RpcOutcome::Timeout));
        }
    }

    /// Fire short timeouts and expire dead observers.
    pub fn tick(&mut self, now: Instant) {
        for observer in &mut self.observers {
            if !observer.short_fired && now.duration_since(observer.sent) >= RPC_SHORT_TIMEOUT {
                observer.short_fired = true;
                let _ = observer.events.send((observer.id, RpcOutcome::ShortTimeout));
            }
        }

        let mut index = 0;
        while index < self.observers.len() {
            if now.duration_since(self.observers[index].sent) >= RPC_TIMEOUT {
                let observer = self.observers.swap_remove(index);
                debug!("rpc observer {} timed out ({})", observer.id, observer.target);
                let _ = observer.events.send((observer.id, RpcOutcome::Timeout));
            } else {
                index += 1;
            }
        }
    }

    /// Fail everything; used on shutdown.
    pub fn abort_all(&mut self) {
        for observer in self.observers.drain(..) {
            let _ = observer.events.send((observer.id, RpcOutcome::Timeout));
        }
    }

    /// Outstanding observer count.
    pub fn pending(&self) -> usize {
        self.observers.len()
    }
}

impl Default for RpcManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::FileHash;
    use crate::protocol::kad_op;

    fn addr(last: u8) -> SocketAddr {
        format!("10.0.0.{}:4672", last).parse().unwrap()
    }

    fn manager_with_observer(
        expect: u8,
        target: SocketAddr,
        kad_id: Option<KadId>,
    ) -> (RpcManager, mpsc::UnboundedReceiver<RpcEvent>) {
        let mut manager = RpcManager::new();
        let (tx, rx) = mpsc::unbounded_channel();
        manager.register(expect, target, kad_id, tx);
        (manager, rx)
    }

    #[test]
    fn test_matching_reply_consumes_observer() {
        let (mut manager, mut rx) = manager_with_observer(kad_op::KADEMLIA2_PONG, addr(1), None);
        assert!(manager.incoming(&KadMessage::Pong { udp_port: 4672 }, addr(1)));
        assert_eq!(manager.pending(), 0);
        match rx.try_recv().unwrap() {
            (_, RpcOutcome::Reply(KadMessage::Pong { udp_port }, from)) => {
                assert_eq!(udp_port, 4672);
                assert_eq!(from, addr(1));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_reply_from_wrong_source_dropped() {
        let (mut manager, mut rx) = manager_with_observer(kad_op::KADEMLIA2_PONG, addr(1), None);
        assert!(!manager.incoming(&KadMessage::Pong { udp_port: 4672 }, addr(2)));
        assert_eq!(manager.pending(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_kad_id_discriminator() {
        let target_id = FileHash::hash_block(b"lookup");
        let (mut manager, mut rx) = manager_with_observer(kad_op::KADEMLIA2_RES, addr(1), Some(target_id));

        // response for a different lookup id does not match
        let wrong = KadMessage::Res {
            target: FileHash::hash_block(b"other"),
            contacts: Vec::new(),
        };
        assert!(!manager.incoming(&wrong, addr(1)));

        let right = KadMessage::Res {
            target: target_id,
            contacts: Vec::new(),
        };
        assert!(manager.incoming(&right, addr(1)));
        assert!(matches!(rx.try_recv().unwrap().1, RpcOutcome::Reply(..)));
    }

    #[test]
    fn test_reply_after_timeout_dropped() {
        let (mut manager, mut rx) = manager_with_observer(kad_op::KADEMLIA2_PONG, addr(1), None);
        manager.tick(Instant::now() + RPC_TIMEOUT);
        assert!(matches!(rx.try_recv().unwrap().1, RpcOutcome::Timeout));

        // the observer is gone, the late reply finds nothing
        assert!(!manager.incoming(&KadMessage::Pong { udp_port: 4672 }, addr(1)));
    }

    #[test]
    fn test_short_timeout_fires_once_and_keeps_observer() {
        let (mut manager, mut rx) = manager_with_observer(kad_op::KADEMLIA2_PONG, addr(1), None);
        let later = Instant::now() + RPC_SHORT_TIMEOUT;
        manager.tick(later);
        manager.tick(later + Duration::from_millis(100));

        assert!(matches!(rx.try_recv().unwrap().1, RpcOutcome::ShortTimeout));
        assert!(rx.try_recv().is_err(), "short timeout must fire once");
        assert_eq!(manager.pending(), 1);
    }

    #[test]
    fn test_unreachable_fails_observer() {
        let (mut manager, mut rx) = manager_with_observer(kad_op::KADEMLIA2_PONG, addr(1), None);
        manager.unreachable(addr(1));
        assert!(matches!(rx.try_recv().unwrap().1, RpcOutcome::Timeout));
        assert_eq!(manager.pending(), 0);
    }
}
