//! Transfer module
//!
//! Per-file download state: the piece picker and the transfer state
//! machine driven by the session tick.

pub mod piece_picker;
pub mod transfer;

// Re-export main types
pub use piece_picker::{BlockRange, PiecePicker};
pub use transfer::{Transfer, TransferState, TransferStats};
