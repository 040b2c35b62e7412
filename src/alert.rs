//! Session alerts
//!
//! Events surfaced to the embedding application. Every asynchronous
//! operation emits exactly one terminal alert; progress and state-change
//! alerts are non-terminal.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;

use crate::error::ErrorKind;
use crate::hash::FileHash;
use crate::protocol::message::{NetworkPoint, SharedFileEntry};
use crate::transfer::TransferState;

/// Session event.
#[derive(Debug, Clone)]
pub enum Alert {
    // server connection
    ServerConnected {
        name: String,
        client_id: u32,
    },
    ServerDisconnected {
        name: String,
        reason: String,
    },
    ServerText {
        name: String,
        text: String,
    },
    ServerStatus {
        name: String,
        users: u32,
        files: u32,
    },
    SearchResult {
        entries: Vec<SharedFileEntry>,
        more: bool,
    },
    FoundSources {
        hash: FileHash,
        sources: Vec<NetworkPoint>,
    },
    CallbackRequested {
        point: NetworkPoint,
    },
    CallbackFailed,
    // transfers
    TransferAdded {
        hash: FileHash,
    },
    TransferRemoved {
        hash: FileHash,
    },
    StateChanged {
        hash: FileHash,
        prev: TransferState,
        state: TransferState,
    },
    TransferFinished {
        hash: FileHash,
    },
    TransferFailed {
        hash: FileHash,
        kind: ErrorKind,
    },
    PieceHashFailed {
        hash: FileHash,
        piece: u32,
    },
    ResumeDataSaved {
        hash: FileHash,
    },
    ResumeDataRejected {
        hash: FileHash,
        kind: ErrorKind,
    },
    // peers
    PeerConnected {
        addr: SocketAddr,
    },
    PeerDisconnected {
        addr: SocketAddr,
        kind: ErrorKind,
    },
    // session plumbing
    ListenFailed {
        port: u16,
        message: String,
    },
    DiskError {
        kind: ErrorKind,
        path: Option<String>,
    },
    // dht
    DhtPeersFound {
        target: FileHash,
        peers: Vec<NetworkPoint>,
    },
    DhtKeywordHit {
        target: FileHash,
        entries: Vec<SharedFileEntry>,
    },
}

impl Alert {
    /// True for alerts that terminate an asynchronous operation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Alert::TransferFinished { .. }
                | Alert::TransferFailed { .. }
                | Alert::TransferRemoved { .. }
                | Alert::CallbackFailed
                | Alert::ResumeDataSaved { .. }
                | Alert::ResumeDataRejected { .. }
                | Alert::ListenFailed { .. }
        )
    }
}

/// Bounded, mutex-guarded alert queue. When full, the oldest alert is
/// dropped so producers never stall the event loop.
pub struct AlertQueue {
    inner: Mutex<VecDeque<Alert>>,
    capacity: usize,
}

impl AlertQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            capacity,
        }
    }

    /// Push one alert, evicting the oldest on overflow.
    pub fn post(&self, alert: Alert) {
        let mut queue = self.inner.lock().expect("alert queue poisoned");
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(alert);
    }

    /// Drain all queued alerts.
    pub fn drain(&self) -> Vec<Alert> {
        let mut queue = self.inner.lock().expect("alert queue poisoned");
        queue.drain(..).collect()
    }

    /// Number of queued alerts.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("alert queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
