//! DHT routing table
//!
//! Kademlia k-buckets over 128-bit ids, bucket per shared-prefix length,
//! k = 10 nodes per bucket.

use std::net::SocketAddr;
use std::time::Instant;

use tracing::trace;

use crate::dht::node::{cmp_by_distance, KadContact, KadId};

/// Nodes kept per bucket.
pub const K: usize = 10;

const ID_BITS: usize = 128;

/// A known node plus its liveness bookkeeping.
#[derive(Debug, Clone)]
pub struct Node {
    pub contact: KadContact,
    pub last_seen: Instant,
    pub failed_rpcs: u32,
}

impl Node {
    fn new(contact: KadContact) -> Self {
        Self {
            contact,
            last_seen: Instant::now(),
            failed_rpcs: 0,
        }
    }
}

/// One k-bucket.
#[derive(Debug, Default)]
pub struct KBucket {
    pub nodes: Vec<Node>,
}

impl KBucket {
    /// Insert or refresh; full buckets prefer nodes already present and
    /// evict the stalest failing node if one exists.
    fn node_seen(&mut self, contact: KadContact) -> bool {
        if let Some(node) = self.nodes.iter_mut().find(|n| n.contact.id == contact.id) {
            node.contact = contact;
            node.last_seen = Instant::now();
            node.failed_rpcs = 0;
            return true;
        }

        if self.nodes.len() < K {
            self.nodes.push(Node::new(contact));
            return true;
        }

        if let Some(pos) = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.failed_rpcs > 0)
            .max_by_key(|(_, n)| n.failed_rpcs)
            .map(|(i, _)| i)
        {
            self.nodes[pos] = Node::new(contact);
            return true;
        }

        false
    }

    fn is_full(&self) -> bool {
        self.nodes.len() >= K
    }
}

/// The routing table.
pub struct RoutingTable {
    pub own_id: KadId,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    pub fn new(own_id: KadId) -> Self {
        let mut buckets = Vec::with_capacity(ID_BITS);
        buckets.resize_with(ID_BITS, KBucket::default);
        Self { own_id, buckets }
    }

    /// Record that a node answered or announced itself.
    pub fn node_seen(&mut self, contact: KadContact) -> bool {
        if contact.id == self.own_id {
            return false;
        }
        let index = self.bucket_index(&contact.id);
        let inserted = self.buckets[index].node_seen(contact);
        trace!("node_seen {} -> bucket {} (inserted: {})", contact.id, index, inserted);
        inserted
    }

    /// Record an RPC failure; nodes failing repeatedly age out of their
    /// bucket on the next insertion pressure.
    pub fn node_failed(&mut self, addr: SocketAddr) {
        for bucket in &mut self.buckets {
            for node in &mut bucket.nodes {
                if node.contact.udp_addr() == addr {
                    node.failed_rpcs += 1;
                }
            }
        }
    }

    /// The `count` nodes closest to `target` by XOR distance.
    pub fn closest_nodes(&self, target: &KadId, count: usize) -> Vec<KadContact> {
        let mut all: Vec<KadContact> = self
            .buckets
            .iter()
            .flat_map(|b| b.nodes.iter().map(|n| n.contact))
            .collect();
        all.sort_by(|a, b| cmp_by_distance(target, &a.id, &b.id));
        all.truncate(count);
        all
    }

    /// Total known nodes.
    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(|b| b.nodes.len()).sum()
    }

    /// True when the bucket covering `id` cannot take more nodes.
    pub fn bucket_full(&self, id: &KadId) -> bool {
        self.buckets[self.bucket_index(id)].is_full()
    }

    /// Index = position of the first bit differing from our id.
    fn bucket_index(&self, id: &KadId) -> usize {
        let distance = self.own_id.distance(id);
        for (byte_index, byte) in distance.iter().enumerate() {
            if *byte != 0 {
                return byte_index * 8 + byte.leading_zeros() as usize;
            }
        }
        ID_BITS - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::FileHash;
    use std::net::SocketAddrV4;

    fn contact(seed: u8) -> KadContact {
        KadContact::new(
            FileHash::hash_block(&[seed]),
            SocketAddrV4::new([10, 0, 0, seed].into(), 4672),
            9,
        )
    }

    fn contact_with_id(id: [u8; 16], seed: u8) -> KadContact {
        KadContact::new(FileHash(id), SocketAddrV4::new([10, 0, 1, seed].into(), 4672), 9)
    }

    #[test]
    fn test_own_id_never_inserted() {
        let own = FileHash::hash_block(b"me");
        let mut table = RoutingTable::new(own);
        let mut me = contact(1);
        me.id = own;
        assert!(!table.node_seen(me));
        assert_eq!(table.node_count(), 0);
    }

    #[test]
    fn test_insert_and_refresh() {
        let mut table = RoutingTable::new(FileHash::hash_block(b"me"));
        let c = contact(1);
        assert!(table.node_seen(c));
        assert!(table.node_seen(c));
        assert_eq!(table.node_count(), 1);
    }

    #[test]
    fn test_bucket_eviction_prefers_failing_nodes() {
        let own = FileHash([0u8; 16]);
        let mut table = RoutingTable::new(own);

        // fill one bucket: ids with the top bit set all share bucket 0
        for i in 0..K as u8 {
            let mut id = [0u8; 16];
            id[0] = 0x80;
            id[15] = i + 1;
            assert!(table.node_seen(contact_with_id(id, i + 1)));
        }
        let mut id = [0u8; 16];
        id[0] = 0x80;
        id[15] = 0xEE;
        let newcomer = contact_with_id(id, 200);

        // full bucket of healthy nodes rejects the newcomer
        assert!(!table.node_seen(newcomer));

        // after a failure there is a victim to replace
        let victim = table.closest_nodes(&FileHash(id), 1)[0];
        table.node_failed(victim.udp_addr());
        assert!(table.node_seen(newcomer));
        assert_eq!(table.node_count(), K);
    }

    #[test]
    fn test_closest_nodes_ordering() {
        let own = FileHash::hash_block(b"me");
        let mut table = RoutingTable::new(own);
        for i in 1..=20u8 {
            table.node_seen(contact(i));
        }
        let target = FileHash::hash_block(b"target");
        let closest = table.closest_nodes(&target, K);
        assert_eq!(closest.len(), K);
        for pair in closest.windows(2) {
            assert!(pair[0].id.distance(&target) <= pair[1].id.distance(&target));
        }
    }

    #[test]
    fn test_bucket_index_distribution() {
        let own = FileHash([0u8; 16]);
        let table = RoutingTable::new(own);
        let mut id = [0u8; 16];
        id[0] = 0x80;
        assert_eq!(table.bucket_index(&FileHash(id)), 0);
        id[0] = 0x01;
        assert_eq!(table.bucket_index(&FileHash(id)), 7);
        let same = FileHash([0u8; 16]);
        assert_eq!(table.bucket_index(&same), ID_BITS - 1);
    }
}
