//! Upload slot queue
//!
//! Upload slots are scarce; requesters past the slot count wait in a
//! ranked queue and receive periodic rank updates. Rank order: score
//! descending, then wait time descending. Also hosts the request-range
//! clamping used before serving parts.

use std::net::SocketAddr;
use std::time::Instant;

use tracing::{debug, trace};

/// Outcome of an upload slot request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotDecision {
    /// A free slot was granted
    Accepted,
    /// Queued at this 1-based rank
    Queued(u16),
    /// The waiting queue itself is full
    Full,
}

#[derive(Debug, Clone)]
struct QueuedPeer {
    addr: SocketAddr,
    score: u64,
    enqueued: Instant,
}

/// The per-session upload queue.
pub struct UploadQueue {
    slots: usize,
    max_queued: usize,
    active: Vec<SocketAddr>,
    waiting: Vec<QueuedPeer>,
}

impl UploadQueue {
    pub fn new(slots: usize, max_queued: usize) -> Self {
        Self {
            slots: slots.max(1),
            max_queued,
            active: Vec::new(),
            waiting: Vec::new(),
        }
    }

    /// A peer asks for a slot. `score` is the configured contribution
    /// rating; higher means served sooner.
    pub fn request_slot(&mut self, addr: SocketAddr, score: u64, now: Instant) -> SlotDecision {
        if self.active.contains(&addr) {
            return SlotDecision::Accepted;
        }
        if self.active.len() < self.slots {
            debug!("upload slot granted to {}", addr);
            self.active.push(addr);
            return SlotDecision::Accepted;
        }

        if let Some(existing) = self.waiting.iter_mut().find(|q| q.addr == addr) {
            existing.score = score;
        } else {
            if self.waiting.len() >= self.max_queued {
                return SlotDecision::Full;
            }
            self.waiting.push(QueuedPeer {
                addr,
                score,
                enqueued: now,
            });
        }
        self.sort_queue();
        SlotDecision::Queued(self.rank_of(&addr).expect("just queued"))
    }

    /// A slot holder left; promote the best-ranked waiter, if any.
    pub fn release(&mut self, addr: SocketAddr) -> Option<SocketAddr> {
        let held = self.active.iter().position(|a| *a == addr);
        match held {
            Some(index) => {
                self.active.remove(index);
            }
            None => {
                self.waiting.retain(|q| q.addr != addr);
                return None;
            }
        }

        if self.waiting.is_empty() {
            return None;
        }
        let promoted = self.waiting.remove(0);
        debug!("promoting {} into a freed upload slot", promoted.addr);
        self.active.push(promoted.addr);
        Some(promoted.addr)
    }

    /// Current rank of a queued peer (1-based).
    pub fn rank_of(&self, addr: &SocketAddr) -> Option<u16> {
        self.waiting
            .iter()
            .position(|q| q.addr == *addr)
            .map(|p| (p + 1) as u16)
    }

    /// Whether the peer currently holds a slot.
    pub fn has_slot(&self, addr: &SocketAddr) -> bool {
        self.active.contains(addr)
    }

    /// `(addr, rank)` pairs for the periodic rank broadcast.
    pub fn rankings(&self) -> Vec<(SocketAddr, u16)> {
        self.waiting
            .iter()
            .enumerate()
            .map(|(i, q)| (q.addr, (i + 1) as u16))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn queued_count(&self) -> usize {
        self.waiting.len()
    }

    fn sort_queue(&mut self) {
        // score descending, then longest wait first
        self.waiting.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.enqueued.cmp(&b.enqueued))
        });
        trace!("upload queue reordered ({} waiting)", self.waiting.len());
    }
}

/// Clamp up to three requested `[begin, end)` ranges against the file
/// size. Empty and out-of-bounds ranges are dropped; the caller answers
/// with `OUTOFPARTREQS` when nothing survives.
pub fn clamp_ranges(file_size: u64, begins: &[u64; 3], ends: &[u64; 3]) -> Vec<(u64, u64)> {
    let mut out = Vec::new();
    for i in 0..3 {
        let (begin, end) = (begins[i], ends[i]);
        if begin >= end {
            continue;
        }
        if begin >= file_size || end > file_size {
            continue;
        }
        out.push((begin, end));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(last: u8) -> SocketAddr {
        format!("10.0.0.{}:4662", last).parse().unwrap()
    }

    #[test]
    fn test_slots_granted_until_full() {
        let mut queue = UploadQueue::new(2, 10);
        let now = Instant::now();
        assert_eq!(queue.request_slot(addr(1), 0, now), SlotDecision::Accepted);
        assert_eq!(queue.request_slot(addr(2), 0, now), SlotDecision::Accepted);
        assert_eq!(queue.request_slot(addr(3), 0, now), SlotDecision::Queued(1));
        assert_eq!(queue.active_count(), 2);
        assert_eq!(queue.queued_count(), 1);
    }

    #[test]
    fn test_rank_order_score_then_wait() {
        let mut queue = UploadQueue::new(1, 10);
        let now = Instant::now();
        queue.request_slot(addr(1), 0, now);

        queue.request_slot(addr(2), 10, now);
        queue.request_slot(addr(3), 50, now + Duration::from_secs(1));
        queue.request_slot(addr(4), 10, now + Duration::from_secs(2));

        // higher score first; equal scores by longest wait
        let ranks = queue.rankings();
        assert_eq!(ranks[0].0, addr(3));
        assert_eq!(ranks[1].0, addr(2));
        assert_eq!(ranks[2].0, addr(4));
    }

    #[test]
    fn test_release_promotes_best() {
        let mut queue = UploadQueue::new(1, 10);
        let now = Instant::now();
        queue.request_slot(addr(1), 0, now);
        queue.request_slot(addr(2), 5, now);
        queue.request_slot(addr(3), 9, now);

        let promoted = queue.release(addr(1));
        assert_eq!(promoted, Some(addr(3)));
        assert!(queue.has_slot(&addr(3)));
        assert_eq!(queue.rank_of(&addr(2)), Some(1));
    }

    #[test]
    fn test_queue_full() {
        let mut queue = UploadQueue::new(1, 1);
        let now = Instant::now();
        queue.request_slot(addr(1), 0, now);
        queue.request_slot(addr(2), 0, now);
        assert_eq!(queue.request_slot(addr(3), 0, now), SlotDecision::Full);
    }

    #[test]
    fn test_requeue_updates_score() {
        let mut queue = UploadQueue::new(1, 10);
        let now = Instant::now();
        queue.request_slot(addr(1), 0, now);
        queue.request_slot(addr(2), 1, now);
        queue.request_slot(addr(3), 2, now);
        assert_eq!(queue.rank_of(&addr(2)), Some(2));

        // re-request with a better score climbs the queue
        queue.request_slot(addr(2), 100, now);
        assert_eq!(queue.rank_of(&addr(2)), Some(1));
        assert_eq!(queue.queued_count(), 2);
    }

    #[test]
    fn test_leaving_waiter_removed() {
        let mut queue = UploadQueue::new(1, 10);
        let now = Instant::now();
        queue.request_slot(addr(1), 0, now);
        queue.request_slot(addr(2), 0, now);
        assert_eq!(queue.release(addr(2)), None);
        assert_eq!(queue.queued_count(), 0);
        assert!(queue.has_slot(&addr(1)));
    }

    #[test]
    fn test_clamp_ranges_drops_out_of_bounds() {
        // a request wholly or partly outside [0, file_size) is dropped
        let ranges = clamp_ranges(1000, &[0, 900, 2000], &[100, 1200, 2100]);
        assert_eq!(ranges, vec![(0, 100)]);
    }

    #[test]
    fn test_clamp_ranges_drops_empty() {
        let ranges = clamp_ranges(1000, &[100, 0, 0], &[100, 0, 0]);
        assert!(ranges.is_empty());
    }

    #[test]
    fn test_clamp_ranges_accepts_full_file() {
        let ranges = clamp_ranges(1000, &[0, 0, 0], &[1000, 0, 0]);
        assert_eq!(ranges, vec![(0, 1000)]);
    }
}
