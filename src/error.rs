//! Error types for the ed2k engine
//!
//! This module defines the error kinds surfaced by every component:
//! codec, transport, session, storage and DHT failures.

use std::fmt;

/// Fine-grained failure kinds, mirroring the ed2k error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    // codec
    DecodePacketError,
    InvalidProtocolType,
    UnsupportedPackedType,
    InvalidPacketSize,
    InvalidTagType,
    TagTooLong,
    UnexpectedEof,
    // search expressions
    UnclosedQuotationMark,
    OperatorIncorrectPlace,
    IncorrectBracketsCount,
    EmptyBrackets,
    InputStringTooLarge,
    SearchExpressionTooComplex,
    // transport
    ConnectionReset,
    TimedOut,
    TimedOutInactivity,
    ConnectionToItself,
    DuplicatePeerId,
    BannedByIpFilter,
    TooManyConnections,
    HalfOpenExhausted,
    // session
    SessionClosing,
    DuplicateTransfer,
    TransferPaused,
    TransferFinished,
    TransferAborted,
    InvalidHandle,
    // storage
    FileNotFound,
    FileTooShort,
    FileSizeZero,
    FileTruncated,
    MismatchingFileSize,
    MismatchingFileMtime,
    PiecesNeedReorder,
    FastResumeParseError,
    NoFilesInResumeData,
    MetFileInvalidHeader,
    MakingCancelled,
    // peer data integrity
    MismatchingTransferHash,
    FailedHashCheck,
    // dht
    NoRouter,
    UnreachableEndpoint,
    // catch-all
    Other,
}

impl ErrorKind {
    /// Human readable message for the kind.
    pub fn message(&self) -> &'static str {
        match self {
            ErrorKind::DecodePacketError => "decode packet error",
            ErrorKind::InvalidProtocolType => "invalid protocol type",
            ErrorKind::UnsupportedPackedType => "unsupported packed type",
            ErrorKind::InvalidPacketSize => "invalid packet size",
            ErrorKind::InvalidTagType => "invalid tag type",
            ErrorKind::TagTooLong => "blob tag too long",
            ErrorKind::UnexpectedEof => "unexpected eof",
            ErrorKind::UnclosedQuotationMark => "unclosed quotation mark",
            ErrorKind::OperatorIncorrectPlace => "operator incorrect place",
            ErrorKind::IncorrectBracketsCount => "incorrect brackets count",
            ErrorKind::EmptyBrackets => "empty brackets",
            ErrorKind::InputStringTooLarge => "input string too large",
            ErrorKind::SearchExpressionTooComplex => "search expression too complex",
            ErrorKind::ConnectionReset => "connection reset",
            ErrorKind::TimedOut => "timed out",
            ErrorKind::TimedOutInactivity => "timed out inactivity",
            ErrorKind::ConnectionToItself => "connection to itself",
            ErrorKind::DuplicatePeerId => "duplicate peer id",
            ErrorKind::BannedByIpFilter => "banned by IP filter",
            ErrorKind::TooManyConnections => "too many connections",
            ErrorKind::HalfOpenExhausted => "half-open connection limit exhausted",
            ErrorKind::SessionClosing => "session closing",
            ErrorKind::DuplicateTransfer => "transfer already exists in session",
            ErrorKind::TransferPaused => "transfer paused",
            ErrorKind::TransferFinished => "transfer finished",
            ErrorKind::TransferAborted => "transfer aborted",
            ErrorKind::InvalidHandle => "invalid transfer handle",
            ErrorKind::FileNotFound => "file not exists or is not regular file",
            ErrorKind::FileTooShort => "file is too short",
            ErrorKind::FileSizeZero => "file size is zero",
            ErrorKind::FileTruncated => "file was truncated",
            ErrorKind::MismatchingFileSize => "mismatching file size",
            ErrorKind::MismatchingFileMtime => "mismatching file timestamp",
            ErrorKind::PiecesNeedReorder => "pieces need reorder",
            ErrorKind::FastResumeParseError => "fast resume parse error",
            ErrorKind::NoFilesInResumeData => "no files in resume data",
            ErrorKind::MetFileInvalidHeader => "met file invalid header byte",
            ErrorKind::MakingCancelled => "file parameters making was cancelled",
            ErrorKind::MismatchingTransferHash => "mismatching transfer hash",
            ErrorKind::FailedHashCheck => "failed hash check",
            ErrorKind::NoRouter => "no router",
            ErrorKind::UnreachableEndpoint => "unreachable endpoint",
            ErrorKind::Other => "unknown error",
        }
    }
}

/// Comprehensive error type for ed2k engine operations
#[derive(Debug, Clone)]
pub enum Ed2kError {
    /// Wire decode errors; fatal for the owning connection
    DecodeError {
        kind: ErrorKind,
        message: String,
    },

    /// Peer connection errors
    PeerError {
        kind: ErrorKind,
        message: String,
        peer: Option<String>,
    },

    /// Server connection errors
    ServerError {
        message: String,
        server: Option<String>,
        source: Option<String>,
    },

    /// File I/O and storage errors
    StorageError {
        kind: ErrorKind,
        message: String,
        path: Option<String>,
    },

    /// Session-level errors
    SessionError {
        kind: ErrorKind,
        message: String,
    },

    /// DHT errors; logged, never propagated upward
    DhtError {
        kind: ErrorKind,
        message: String,
        node: Option<String>,
    },

    /// Network transport errors
    NetworkError {
        kind: ErrorKind,
        message: String,
        address: Option<String>,
    },

    /// Search expression errors
    SearchError {
        kind: ErrorKind,
        message: String,
    },
}

impl Ed2kError {
    /// Create a new DecodeError
    pub fn decode_error(kind: ErrorKind) -> Self {
        Ed2kError::DecodeError {
            kind,
            message: kind.message().to_string(),
        }
    }

    /// Create a new DecodeError with detail
    pub fn decode_error_with(kind: ErrorKind, message: impl Into<String>) -> Self {
        Ed2kError::DecodeError {
            kind,
            message: message.into(),
        }
    }

    /// Create a new PeerError
    pub fn peer_error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Ed2kError::PeerError {
            kind,
            message: message.into(),
            peer: None,
        }
    }

    /// Create a new PeerError with peer address
    pub fn peer_error_with_peer(kind: ErrorKind, message: impl Into<String>, peer: impl Into<String>) -> Self {
        Ed2kError::PeerError {
            kind,
            message: message.into(),
            peer: Some(peer.into()),
        }
    }

    /// Create a new ServerError
    pub fn server_error(message: impl Into<String>) -> Self {
        Ed2kError::ServerError {
            message: message.into(),
            server: None,
            source: None,
        }
    }

    /// Create a new ServerError with server name
    pub fn server_error_with_server(message: impl Into<String>, server: impl Into<String>) -> Self {
        Ed2kError::ServerError {
            message: message.into(),
            server: Some(server.into()),
            source: None,
        }
    }

    /// Create a new ServerError with server name and source
    pub fn server_error_full(
        message: impl Into<String>,
        server: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Ed2kError::ServerError {
            message: message.into(),
            server: Some(server.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new StorageError
    pub fn storage_error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Ed2kError::StorageError {
            kind,
            message: message.into(),
            path: None,
        }
    }

    /// Create a new StorageError with path
    pub fn storage_error_with_path(kind: ErrorKind, message: impl Into<String>, path: impl Into<String>) -> Self {
        Ed2kError::StorageError {
            kind,
            message: message.into(),
            path: Some(path.into()),
        }
    }

    /// Create a new SessionError
    pub fn session_error(kind: ErrorKind) -> Self {
        Ed2kError::SessionError {
            kind,
            message: kind.message().to_string(),
        }
    }

    /// Create a new DhtError
    pub fn dht_error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Ed2kError::DhtError {
            kind,
            message: message.into(),
            node: None,
        }
    }

    /// Create a new DhtError with node address
    pub fn dht_error_with_node(kind: ErrorKind, message: impl Into<String>, node: impl Into<String>) -> Self {
        Ed2kError::DhtError {
            kind,
            message: message.into(),
            node: Some(node.into()),
        }
    }

    /// Create a new NetworkError
    pub fn network_error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Ed2kError::NetworkError {
            kind,
            message: message.into(),
            address: None,
        }
    }

    /// Create a new NetworkError with address
    pub fn network_error_with_address(
        kind: ErrorKind,
        message: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Ed2kError::NetworkError {
            kind,
            message: message.into(),
            address: Some(address.into()),
        }
    }

    /// Create a new SearchError
    pub fn search_error(kind: ErrorKind) -> Self {
        Ed2kError::SearchError {
            kind,
            message: kind.message().to_string(),
        }
    }

    /// The failure kind, when one applies.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Ed2kError::DecodeError { kind, .. } => *kind,
            Ed2kError::PeerError { kind, .. } => *kind,
            Ed2kError::ServerError { .. } => ErrorKind::Other,
            Ed2kError::StorageError { kind, .. } => *kind,
            Ed2kError::SessionError { kind, .. } => *kind,
            Ed2kError::DhtError { kind, .. } => *kind,
            Ed2kError::NetworkError { kind, .. } => *kind,
            Ed2kError::SearchError { kind, .. } => *kind,
        }
    }
}

impl fmt::Display for Ed2kError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ed2kError::DecodeError { message, .. } => {
                write!(f, "Decode error: {}", message)
            }
            Ed2kError::PeerError { message, peer, .. } => {
                if let Some(p) = peer {
                    write!(f, "Peer error: {} (peer: {})", message, p)
                } else {
                    write!(f, "Peer error: {}", message)
                }
            }
            Ed2kError::ServerError { message, server, source } => match (server, source) {
                (Some(srv), Some(s)) => write!(f, "Server error: {} (server: {}, source: {})", message, srv, s),
                (Some(srv), None) => write!(f, "Server error: {} (server: {})", message, srv),
                (None, Some(s)) => write!(f, "Server error: {} (source: {})", message, s),
                (None, None) => write!(f, "Server error: {}", message),
            },
            Ed2kError::StorageError { message, path, .. } => {
                if let Some(p) = path {
                    write!(f, "Storage error: {} (path: {})", message, p)
                } else {
                    write!(f, "Storage error: {}", message)
                }
            }
            Ed2kError::SessionError { message, .. } => {
                write!(f, "Session error: {}", message)
            }
            Ed2kError::DhtError { message, node, .. } => {
                if let Some(n) = node {
                    write!(f, "DHT error: {} (node: {})", message, n)
                } else {
                    write!(f, "DHT error: {}", message)
                }
            }
            Ed2kError::NetworkError { message, address, .. } => {
                if let Some(a) = address {
                    write!(f, "Network error: {} (address: {})", message, a)
                } else {
                    write!(f, "Network error: {}", message)
                }
            }
            Ed2kError::SearchError { message, .. } => {
                write!(f, "Search error: {}", message)
            }
        }
    }
}

impl std::error::Error for Ed2kError {}

impl From<std::io::Error> for Ed2kError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::FileNotFound,
            std::io::ErrorKind::ConnectionReset => ErrorKind::ConnectionReset,
            std::io::ErrorKind::TimedOut => ErrorKind::TimedOut,
            std::io::ErrorKind::UnexpectedEof => ErrorKind::UnexpectedEof,
            _ => ErrorKind::Other,
        };
        Ed2kError::StorageError {
            kind,
            message: err.to_string(),
            path: None,
        }
    }
}

impl From<serde_json::Error> for Ed2kError {
    fn from(err: serde_json::Error) -> Self {
        Ed2kError::storage_error(ErrorKind::FastResumeParseError, err.to_string())
    }
}

impl From<std::net::AddrParseError> for Ed2kError {
    fn from(err: std::net::AddrParseError) -> Self {
        Ed2kError::network_error(ErrorKind::Other, err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Ed2kError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Ed2kError::network_error(ErrorKind::TimedOut, "operation timed out")
    }
}
