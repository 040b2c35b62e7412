//! rust-ed2k
//!
//! An eDonkey2000 peer-to-peer engine: index-server login and search,
//! multi-source block transfers between clients, and a Kademlia overlay
//! for serverless source discovery.

pub mod alert;
pub mod dht;
pub mod error;
pub mod file;
pub mod hash;
pub mod peer;
pub mod protocol;
pub mod server;
pub mod session;
pub mod settings;
pub mod storage;
pub mod transfer;

pub use error::{Ed2kError, ErrorKind};

pub use alert::{Alert, AlertQueue};
pub use hash::{FileHash, FileHasher, PieceHasher, BLOCK_SIZE, PIECE_SIZE};
pub use protocol::{
    compile_search, decode_frame, encode_frame, Frame, NetworkPoint, PeerMessage, SearchConstraints,
    SearchRequest, ServerMessage, SharedFileEntry, Tag, TagList, TagValue,
};
pub use dht::{Dht, KadContact, KadId, KadMessage};
pub use file::{Collection, Ed2kLink, KnownFiles, TransferParameters};
pub use peer::{PeerConnection, PeerEntry, PeerPolicy, UploadQueue};
pub use server::ServerConnection;
pub use session::{BandwidthChannel, HalfOpenThrottle, Session};
pub use settings::{ServerParameters, SessionSettings};
pub use storage::{DiskIo, FilePool, ResumeData};
pub use transfer::{PiecePicker, Transfer, TransferState};
