//! DHT traversal
//!
//! Iterative lookups toward a 128-bit target with branching factor α.
//! Candidates are kept in distance order; replies feed new candidates
//! in, and a lookup finishes once the k closest candidates have all
//! answered, the node budget is spent, or a branch-specific goal (enough
//! sources) is met.

use std::net::SocketAddr;

use tracing::{debug, trace};

use crate::dht::message::{KadMessage, KadSearchHit, FIND_NODE, FIND_VALUE};
use crate::dht::node::{cmp_by_distance, KadContact, KadId};
use crate::dht::routing::K;

/// Parallel in-flight RPC bound.
pub const ALPHA: usize = 5;
/// Hard cap on nodes queried per lookup.
pub const MAX_QUERIED: usize = 50;

/// What a lookup is after.
#[derive(Debug, Clone, PartialEq)]
pub enum LookupKind {
    /// Populate the routing table around the target
    FindNode,
    /// Collect download sources for a file of the given size
    Sources { file_size: u64, want: usize },
    /// Keyword search hits
    Keyword,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CandidateState {
    New,
    InFlight,
    Responded,
    Failed,
}

#[derive(Debug, Clone)]
struct Candidate {
    contact: KadContact,
    state: CandidateState,
    /// a slow RPC no longer holds an α slot
    slow: bool,
    /// the payload query was already sent to this node
    searched: bool,
}

/// One in-progress lookup.
pub struct Traversal {
    pub target: KadId,
    pub kind: LookupKind,
    own_id: KadId,
    candidates: Vec<Candidate>,
    queried: usize,
    hits: Vec<KadSearchHit>,
    done: bool,
}

impl Traversal {
    /// Seed a lookup with the closest nodes from the routing table.
    pub fn new(own_id: KadId, target: KadId, kind: LookupKind, seeds: Vec<KadContact>) -> Self {
        let mut traversal = Self {
            target,
            kind,
            own_id,
            candidates: Vec::new(),
            queried: 0,
            hits: Vec::new(),
            done: false,
        };
        for seed in seeds {
            traversal.insert_candidate(seed);
        }
        traversal
    }

    /// Messages to send now, bounded by α minus healthy in-flight RPCs.
    pub fn next_messages(&mut self) -> Vec<(KadContact, KadMessage)> {
        if self.is_finished() {
            return Vec::new();
        }

        let mut out = Vec::new();
        let mut budget = ALPHA.saturating_sub(self.active_requests());

        // payload queries go to responders first
        if !matches!(self.kind, LookupKind::FindNode) {
            let target = self.target;
            let kind = self.kind.clone();
            for candidate in self
                .candidates
                .iter_mut()
                .filter(|c| c.state == CandidateState::Responded && !c.searched)
            {
                candidate.searched = true;
                let message = match &kind {
                    LookupKind::Sources { file_size, .. } => KadMessage::SearchSourceReq {
                        target,
                        start_position: 0,
                        file_size: *file_size,
                    },
                    LookupKind::Keyword => KadMessage::SearchKeyReq {
                        target,
                        start_position: 0,
                    },
                    LookupKind::FindNode => unreachable!(),
                };
                out.push((candidate.contact, message));
            }
        }

        let find_type = if matches!(self.kind, LookupKind::FindNode) {
            FIND_NODE
        } else {
            FIND_VALUE
        };

        for candidate in &mut self.candidates {
            if budget == 0 || self.queried >= MAX_QUERIED {
                break;
            }
            if candidate.state != CandidateState::New {
                continue;
            }
            candidate.state = CandidateState::InFlight;
            self.queried += 1;
            budget -= 1;
            out.push((
                candidate.contact,
                KadMessage::Req {
                    find_type,
                    target: self.target,
                    receiver: candidate.contact.id,
                },
            ));
        }

        trace!(
            "traversal {}: sending {} rpcs ({} queried, {} candidates)",
            self.target,
            out.len(),
            self.queried,
            self.candidates.len()
        );
        out
    }

    /// A lookup reply arrived: absorb the returned contacts.
    pub fn on_reply(&mut self, from: SocketAddr, contacts: &[KadContact]) {
        if let Some(candidate) = self.candidate_mut(from) {
            candidate.state = CandidateState::Responded;
            candidate.slow = false;
        }
        for contact in contacts {
            self.insert_candidate(*contact);
        }
    }

    /// Payload (sources or keyword hits) arrived.
    pub fn on_hits(&mut self, hits: Vec<KadSearchHit>) {
        self.hits.extend(hits);
        if let LookupKind::Sources { want, .. } = &self.kind {
            if self.hits.len() >= *want {
                debug!("traversal {}: enough sources ({}), short-circuiting", self.target, self.hits.len());
                self.done = true;
            }
        }
    }

    /// The RPC to `from` is slow; free its α slot.
    pub fn on_short_timeout(&mut self, from: SocketAddr) {
        if let Some(candidate) = self.candidate_mut(from) {
            if candidate.state == CandidateState::InFlight {
                candidate.slow = true;
            }
        }
    }

    /// The RPC to `from` is dead.
    pub fn on_timeout(&mut self, from: SocketAddr) {
        if let Some(candidate) = self.candidate_mut(from) {
            candidate.state = CandidateState::Failed;
        }
    }

    /// Lookup completion check.
    pub fn is_finished(&self) -> bool {
        if self.done {
            return true;
        }
        if self.queried >= MAX_QUERIED {
            return self.active_requests() == 0;
        }
        // finished once the k closest candidates have all settled
        let mut settled = 0;
        for candidate in self.candidates.iter().take(K) {
            match candidate.state {
                CandidateState::Responded | CandidateState::Failed => settled += 1,
                CandidateState::New | CandidateState::InFlight => return false,
            }
        }
        settled > 0 || self.candidates.is_empty()
    }

    /// Collected payload hits.
    pub fn hits(&self) -> &[KadSearchHit] {
        &self.hits
    }

    /// Contacts that answered, closest first.
    pub fn responded_contacts(&self) -> Vec<KadContact> {
        self.candidates
            .iter()
            .filter(|c| c.state == CandidateState::Responded)
            .map(|c| c.contact)
            .collect()
    }

    fn active_requests(&self) -> usize {
        self.candidates
            .iter()
            .filter(|c| c.state == CandidateState::InFlight && !c.slow)
            .count()
    }

    fn candidate_mut(&mut self, addr: SocketAddr) -> Option<&mut Candidate> {
        self.candidates.iter_mut().find(|c| c.contact.udp_addr() == addr)
    }

    fn insert_candidate(&mut self, contact: KadContact) {
        if contact.id == self.own_id || self.candidates.iter().any(|c| c.contact.id == contact.id) {
            return;
        }
        let target = self.target;
        let position = self
            .candidates
            .partition_point(|c| cmp_by_distance(&target, &c.contact.id, &contact.id) == std::cmp::Ordering::Less);
        self.candidates.insert(
            position,
            Candidate {
                contact,
                state: CandidateState::New,
                slow: false,
                searched: false,
            },
        );
    }
}
