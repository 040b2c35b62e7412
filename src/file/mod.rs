//! File metadata module
//!
//! ed2k links, eMule collections and the known-files catalog produced by
//! the hashing worker.

pub mod collection;
pub mod known;
pub mod link;

pub use collection::Collection;
pub use known::{make_transfer_parameters, KnownFileEntry, KnownFiles, TransferParameters};
pub use link::Ed2kLink;
