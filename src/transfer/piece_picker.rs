//! Piece picker
//!
//! Tracks which pieces are verified, which blocks are requested or
//! received, and chooses the next blocks to ask a peer for: rarest
//! first, then pieces already started, with a random tie-break.

use rand::Rng;
use tracing::{debug, trace};

use crate::hash::{blocks_in_piece, piece_count, piece_size_at, BLOCK_SIZE, PIECE_SIZE};

/// One block expressed as a byte range `[begin, end)` within the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub piece: u32,
    pub block: u32,
    pub begin: u64,
    pub end: u64,
}

#[derive(Debug, Clone, PartialEq)]
enum PieceState {
    Missing,
    Partial {
        requested: Vec<bool>,
        received: Vec<bool>,
        /// monotonically increasing start sequence, for the
        /// earliest-started bias
        started_seq: u64,
    },
    Verifying,
    Have,
}

/// Block-by-block download state for one file.
#[derive(Debug)]
pub struct PiecePicker {
    file_size: u64,
    pieces: Vec<PieceState>,
    availability: Vec<u32>,
    next_start_seq: u64,
}

impl PiecePicker {
    pub fn new(file_size: u64) -> Self {
        let count = piece_count(file_size) as usize;
        Self {
            file_size,
            pieces: vec![PieceState::Missing; count],
            availability: vec![0; count],
            next_start_seq: 0,
        }
    }

    /// Number of downloadable pieces (the terminal hash entry is not one).
    pub fn piece_count(&self) -> u32 {
        self.pieces.len() as u32
    }

    /// Verified pieces so far.
    pub fn have_count(&self) -> u32 {
        self.pieces.iter().filter(|p| matches!(p, PieceState::Have)).count() as u32
    }

    /// All pieces verified.
    pub fn is_finished(&self) -> bool {
        self.pieces.iter().all(|p| matches!(p, PieceState::Have))
    }

    pub fn is_have(&self, piece: u32) -> bool {
        matches!(self.pieces.get(piece as usize), Some(PieceState::Have))
    }

    /// Mark a piece verified without downloading (resume / full check).
    pub fn set_have(&mut self, piece: u32) {
        if let Some(state) = self.pieces.get_mut(piece as usize) {
            *state = PieceState::Have;
        }
    }

    /// The have bitfield in wire order (bit i of byte i/8, LSB first).
    pub fn have_bitfield(&self) -> Vec<u8> {
        let mut bits = vec![0u8; (self.pieces.len() + 7) / 8];
        for (i, piece) in self.pieces.iter().enumerate() {
            if matches!(piece, PieceState::Have) {
                bits[i / 8] |= 1 << (i % 8);
            }
        }
        bits
    }

    /// Load a have bitfield (resume data).
    pub fn load_bitfield(&mut self, bits: &[u8]) {
        for i in 0..self.pieces.len() {
            let byte = i / 8;
            if byte < bits.len() && bits[byte] & (1 << (i % 8)) != 0 {
                self.pieces[i] = PieceState::Have;
            }
        }
    }

    /// A connected peer advertised this bitfield.
    pub fn inc_availability(&mut self, bits: &[u8]) {
        for i in 0..self.pieces.len() {
            if bit_set(bits, i) {
                self.availability[i] += 1;
            }
        }
    }

    /// That peer went away.
    pub fn dec_availability(&mut self, bits: &[u8]) {
        for i in 0..self.pieces.len() {
            if bit_set(bits, i) {
                self.availability[i] = self.availability[i].saturating_sub(1);
            }
        }
    }

    /// Pick up to `count` blocks to request from a peer advertising
    /// `peer_bits`. Picked blocks are marked requested.
    pub fn pick_blocks(&mut self, peer_bits: &[u8], count: usize) -> Vec<BlockRange> {
        let mut out = Vec::new();
        if count == 0 {
            return out;
        }

        // candidate pieces: peer has them, we don't, not being verified
        let mut candidates: Vec<usize> = (0..self.pieces.len())
            .filter(|&i| {
                bit_set(peer_bits, i)
                    && match &self.pieces[i] {
                        PieceState::Missing => true,
                        PieceState::Partial { requested, .. } => requested.iter().any(|r| !r),
                        PieceState::Verifying | PieceState::Have => false,
                    }
            })
            .collect();

        let mut rng = rand::thread_rng();
        let mut keys: Vec<(u32, u64, u32)> = Vec::with_capacity(candidates.len());
        for &i in &candidates {
            let started = match &self.pieces[i] {
                PieceState::Partial { started_seq, .. } => *started_seq,
                _ => u64::MAX,
            };
            keys.push((self.availability[i], started, rng.gen()));
        }
        let mut order: Vec<usize> = (0..candidates.len()).collect();
        order.sort_by_key(|&k| keys[k]);
        candidates = order.into_iter().map(|k| candidates[k]).collect();

        for piece_index in candidates {
            if out.len() >= count {
                break;
            }
            self.start_piece(piece_index);
            let (requested_blocks, piece) = match &mut self.pieces[piece_index] {
                PieceState::Partial { requested, .. } => (requested, piece_index as u32),
                _ => unreachable!("start_piece leaves the piece partial"),
            };
            for (block_index, requested) in requested_blocks.iter_mut().enumerate() {
                if out.len() >= count {
                    break;
                }
                if *requested {
                    continue;
                }
                *requested = true;
                out.push(block_range(self.file_size, piece, block_index as u32));
            }
        }

        trace!("picked {} blocks", out.len());
        out
    }

    fn start_piece(&mut self, index: usize) {
        if matches!(self.pieces[index], PieceState::Missing) {
            let blocks = blocks_in_piece(self.file_size, index as u32) as usize;
            self.pieces[index] = PieceState::Partial {
                requested: vec![false; blocks],
                received: vec![false; blocks],
                started_seq: self.next_start_seq,
            };
            self.next_start_seq += 1;
        }
    }

    /// A requested range timed out; make its blocks pickable again.
    pub fn unrequest_range(&mut self, begin: u64, end: u64) {
        for (piece, block) in blocks_of_range(self.file_size, begin, end) {
            if let Some(PieceState::Partial { requested, received, .. }) = self.pieces.get_mut(piece as usize) {
                if !received[block as usize] {
                    requested[block as usize] = false;
                }
            }
        }
    }

    /// Data for `[begin, end)` arrived and was handed to the disk layer.
    /// Returns pieces whose blocks are now all present: they must be
    /// hash-checked before counting as have.
    pub fn mark_received(&mut self, begin: u64, end: u64) -> Vec<u32> {
        let mut completed = Vec::new();
        for (piece, block) in blocks_of_range(self.file_size, begin, end) {
            let state = &mut self.pieces[piece as usize];
            if let PieceState::Partial { requested, received, .. } = state {
                requested[block as usize] = true;
                received[block as usize] = true;
                if received.iter().all(|r| *r) {
                    *state = PieceState::Verifying;
                    completed.push(piece);
                }
            }
        }
        completed
    }

    /// The hash check of `piece` passed.
    pub fn on_hash_ok(&mut self, piece: u32) {
        if let Some(state) = self.pieces.get_mut(piece as usize) {
            *state = PieceState::Have;
        }
    }

    /// The hash check failed: the piece is re-downloaded from scratch.
    pub fn on_hash_fail(&mut self, piece: u32) {
        debug!("piece {} failed its hash check, resetting", piece);
        if let Some(state) = self.pieces.get_mut(piece as usize) {
            *state = PieceState::Missing;
        }
    }

    /// Byte extent of one piece, for disk hash jobs.
    pub fn piece_extent(&self, piece: u32) -> (u64, u64) {
        (piece as u64 * PIECE_SIZE, piece_size_at(self.file_size, piece))
    }
}

fn bit_set(bits: &[u8], index: usize) -> bool {
    bits.get(index / 8).map_or(false, |b| b & (1 << (index % 8)) != 0)
}

fn block_range(file_size: u64, piece: u32, block: u32) -> BlockRange {
    let begin = piece as u64 * PIECE_SIZE + block as u64 * BLOCK_SIZE;
    let end = (begin + BLOCK_SIZE).min(file_size);
    BlockRange { piece, block, begin, end }
}

/// Blocks wholly or partly covered by `[begin, end)`.
fn blocks_of_range(file_size: u64, begin: u64, end: u64) -> Vec<(u32, u32)> {
    let mut out = Vec::new();
    let end = end.min(file_size);
    let mut offset = begin;
    while offset < end {
        let piece = (offset / PIECE_SIZE) as u32;
        let block = ((offset % PIECE_SIZE) / BLOCK_SIZE) as u32;
        out.push((piece, block));
        let block_end = piece as u64 * PIECE_SIZE + (block as u64 + 1) * BLOCK_SIZE;
        offset = block_end;
    }
    out
}
