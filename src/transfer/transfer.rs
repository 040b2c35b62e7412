//! Transfer state machine
//!
//! The unit of user intent: one content-addressed file being fetched or
//! seeded, with its piece picker, peer policy, counters and state
//! transitions driven by the one-second tick.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use tracing::{debug, info};

use crate::error::{Ed2kError, ErrorKind};
use crate::file::known::TransferParameters;
use crate::hash::{hash_list_len, FileHash};
use crate::peer::policy::PeerPolicy;
use crate::protocol::message::{NetworkPoint, PeerMessage};
use crate::settings::SessionSettings;
use crate::storage::resume::ResumeData;
use crate::transfer::piece_picker::PiecePicker;

/// Lifecycle states of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    QueuedForChecking,
    CheckingFiles,
    Downloading,
    Seeding,
    Finished,
    Allocating,
    Paused,
    Aborted,
}

/// Rolling transfer counters with an EMA rate estimate.
#[derive(Debug, Clone, Default)]
pub struct TransferStats {
    pub transferred: u64,
    pub requested: u64,
    pub accepted: u64,
    /// bytes/s, exponentially smoothed
    pub download_rate: u64,
    pub upload_rate: u64,
    downloaded_this_tick: u64,
    uploaded_this_tick: u64,
}

impl TransferStats {
    /// Fold this second's byte counts into the smoothed rates.
    fn update_rates(&mut self) {
        self.download_rate = ema(self.download_rate, self.downloaded_this_tick);
        self.upload_rate = ema(self.upload_rate, self.uploaded_this_tick);
        self.downloaded_this_tick = 0;
        self.uploaded_this_tick = 0;
    }
}

fn ema(old: u64, sample: u64) -> u64 {
    (old * 7 + sample) / 8
}

/// One managed transfer.
#[derive(Debug)]
pub struct Transfer {
    pub hash: FileHash,
    pub file_path: PathBuf,
    pub file_size: u64,
    pub piece_hashes: Vec<FileHash>,
    pub picker: PiecePicker,
    pub policy: PeerPolicy,
    pub state: TransferState,
    pub queue_position: u64,
    pub stats: TransferStats,
    pub paused: bool,
    pub seed: bool,
    /// mtime recorded when resume data was written
    pub saved_mtime: u64,
    last_announced_state: Option<TransferState>,
}

impl Transfer {
    /// Create a transfer from parameters (fresh add or known file).
    pub fn new(params: TransferParameters, queue_position: u64, settings: &SessionSettings) -> Result<Self> {
        let expected = hash_list_len(params.file_size) as usize;
        if expected > 0 && params.piece_hashes.len() != expected {
            return Err(Ed2kError::storage_error(
                ErrorKind::PiecesNeedReorder,
                format!("hash list has {} entries, expected {}", params.piece_hashes.len(), expected),
            )
            .into());
        }

        Ok(Self {
            hash: params.file_hash,
            file_path: params.file_path,
            file_size: params.file_size,
            piece_hashes: params.piece_hashes,
            picker: PiecePicker::new(params.file_size),
            policy: PeerPolicy::new(settings.max_peerlist_size),
            state: TransferState::QueuedForChecking,
            queue_position,
            stats: TransferStats::default(),
            paused: false,
            seed: false,
            saved_mtime: params.last_modified,
            last_announced_state: None,
        })
    }

    /// Restore a transfer from resume data. The caller has already
    /// validated the blob against the file on disk.
    pub fn from_resume(resume: ResumeData, queue_position: u64, settings: &SessionSettings) -> Result<Self> {
        let params = TransferParameters {
            file_path: resume.file_path.clone(),
            file_size: resume.file_size,
            file_hash: resume.file_hash,
            piece_hashes: resume.piece_hashes.clone(),
            last_modified: resume.saved_mtime,
        };
        let mut transfer = Self::new(params, queue_position, settings)?;
        transfer.picker.load_bitfield(&resume.have);
        transfer.stats.transferred = resume.transferred;
        transfer.stats.requested = resume.requested;
        transfer.stats.accepted = resume.accepted;

        if transfer.picker.is_finished() {
            transfer.seed = true;
            transfer.state = TransferState::Seeding;
        } else {
            transfer.state = TransferState::Downloading;
        }
        info!(
            "restored {} from resume: {}/{} pieces",
            transfer.hash,
            transfer.picker.have_count(),
            transfer.picker.piece_count()
        );
        Ok(transfer)
    }

    /// Move to a new state; returns `(prev, new)` when it changed, for
    /// the state_changed alert.
    pub fn set_state(&mut self, state: TransferState) -> Option<(TransferState, TransferState)> {
        if self.state == state {
            return None;
        }
        let prev = self.state;
        debug!("{}: {:?} -> {:?}", self.hash, prev, state);
        self.state = state;
        Some((prev, state))
    }

    /// Pause: connections are closed by the session, state is kept.
    pub fn pause(&mut self) -> Option<(TransferState, TransferState)> {
        self.paused = true;
        self.set_state(TransferState::Paused)
    }

    /// Resume from pause.
    pub fn resume(&mut self) -> Option<(TransferState, TransferState)> {
        self.paused = false;
        let next = if self.picker.is_finished() {
            TransferState::Seeding
        } else {
            TransferState::Downloading
        };
        self.set_state(next)
    }

    /// Transfer is active enough to talk to peers.
    pub fn is_active(&self) -> bool {
        !self.paused
            && matches!(
                self.state,
                TransferState::Downloading | TransferState::Seeding | TransferState::Finished
            )
    }

    /// Whether the transfer still wants payload data.
    pub fn wants_data(&self) -> bool {
        self.is_active() && !self.picker.is_finished()
    }

    /// Record downloaded payload bytes.
    pub fn on_bytes_downloaded(&mut self, bytes: u64) {
        self.stats.transferred += bytes;
        self.stats.downloaded_this_tick += bytes;
    }

    /// Record uploaded payload bytes.
    pub fn on_bytes_uploaded(&mut self, bytes: u64) {
        self.stats.accepted += bytes;
        self.stats.uploaded_this_tick += bytes;
    }

    /// Record requested bytes.
    pub fn on_bytes_requested(&mut self, bytes: u64) {
        self.stats.requested += bytes;
    }

    /// A piece passed verification. Returns the completion transition
    /// when this was the last piece.
    pub fn on_piece_verified(&mut self, piece: u32) -> Option<(TransferState, TransferState)> {
        self.picker.on_hash_ok(piece);
        if self.picker.is_finished() {
            info!("{} complete", self.hash);
            self.seed = true;
            self.set_state(TransferState::Seeding)
        } else {
            None
        }
    }

    /// Per-second work: refresh rate EMAs, prune dead peers, surface a
    /// state change at most once per tick.
    pub fn tick(&mut self, _now: Instant, settings: &SessionSettings) -> Option<(TransferState, TransferState)> {
        self.stats.update_rates();
        self.policy.prune(settings);

        let announced = self.last_announced_state;
        self.last_announced_state = Some(self.state);
        match announced {
            Some(prev) if prev != self.state => Some((prev, self.state)),
            None => None,
            _ => None,
        }
    }

    /// Our FILESTATUS answer for this file.
    pub fn file_status(&self) -> PeerMessage {
        PeerMessage::FileStatus {
            hash: self.hash,
            pieces: self.picker.piece_count() as u16,
            bitfield: self.picker.have_bitfield(),
        }
    }

    /// Produce resume data for persistence.
    pub fn resume_data(&self) -> ResumeData {
        ResumeData {
            file_hash: self.hash,
            file_path: self.file_path.clone(),
            file_size: self.file_size,
            piece_hashes: self.piece_hashes.clone(),
            have: self.picker.have_bitfield(),
            transferred: self.stats.transferred,
            requested: self.stats.requested,
            accepted: self.stats.accepted,
            priority: 0,
            saved_mtime: self.saved_mtime,
        }
    }

    /// Seed the peer list from a server or DHT source answer.
    pub fn add_sources(&mut self, sources: &[NetworkPoint], kind: crate::peer::peer::PeerSourceKind) -> usize {
        self.policy.add_peers(sources, kind)
    }
}
