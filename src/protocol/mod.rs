//! ed2k wire protocol module
//!
//! Implements the eDonkey2000 framed binary protocol: frame codec, tag
//! system, typed messages and search expressions.

pub mod codec;
pub mod message;
pub mod search;
pub mod tag;

// Re-export main types
pub use codec::{decode_frame, encode_frame, encode_frame_compressible, Frame};
pub use message::{NetworkPoint, PeerMessage, ServerMessage, SharedFileEntry};
pub use search::{compile_search, SearchConstraints, SearchEntry, SearchOp, SearchRequest};
pub use tag::{Tag, TagList, TagName, TagValue};

/// Plain eDonkey protocol marker.
pub const OP_EDONKEYPROT: u8 = 0xE3;
/// zlib-compressed body marker; same framing, packed payload.
pub const OP_PACKEDPROT: u8 = 0xD4;
/// eMule extension protocol marker.
pub const OP_EMULEPROT: u8 = 0xC5;
/// Kademlia UDP protocol marker.
pub const OP_KADEMLIAHEADER: u8 = 0xE4;

/// Upper bound on a framed packet body (header `size` field).
pub const MAX_ED2K_PACKET_LEN: u32 = 16 * 1024 * 1024;
/// Safety ceiling on any length-prefixed container.
pub const MAX_COLLECTION_SIZE: usize = 65_536;
/// Safety ceiling on strings and blobs.
pub const MAX_ED2K_STRING_LEN: usize = 65_536;

/// First routable client id; anything below is a LowID assignment.
pub const HIGHID_LOWEST: u32 = 0x0100_0000;

/// Client-to-server TCP opcodes.
pub mod server_op {
    pub const LOGINREQUEST: u8 = 0x01;
    pub const REJECT: u8 = 0x05;
    pub const GETSERVERLIST: u8 = 0x14;
    pub const OFFERFILES: u8 = 0x15;
    pub const SEARCHREQUEST: u8 = 0x16;
    pub const GETSOURCES: u8 = 0x19;
    pub const CALLBACKREQUEST: u8 = 0x1C;
    pub const QUERY_MORE_RESULT: u8 = 0x21;
    pub const SERVERLIST: u8 = 0x32;
    pub const SEARCHRESULT: u8 = 0x33;
    pub const SERVERSTATUS: u8 = 0x34;
    pub const CALLBACKREQUESTED: u8 = 0x35;
    pub const CALLBACK_FAIL: u8 = 0x36;
    pub const SERVERMESSAGE: u8 = 0x38;
    pub const IDCHANGE: u8 = 0x40;
    pub const SERVERIDENT: u8 = 0x41;
    pub const FOUNDSOURCES: u8 = 0x42;
}

/// Client-to-client TCP opcodes, plain protocol.
pub mod peer_op {
    pub const HELLO: u8 = 0x01;
    pub const SENDINGPART: u8 = 0x46;
    pub const REQUESTPARTS: u8 = 0x47;
    pub const FILEREQANSNOFIL: u8 = 0x48;
    pub const END_OF_DOWNLOAD: u8 = 0x49;
    pub const HELLOANSWER: u8 = 0x4C;
    pub const MESSAGE: u8 = 0x4E;
    pub const SETREQFILEID: u8 = 0x4F;
    pub const FILESTATUS: u8 = 0x50;
    pub const HASHSETREQUEST: u8 = 0x51;
    pub const HASHSETANSWER: u8 = 0x52;
    pub const STARTUPLOADREQ: u8 = 0x54;
    pub const ACCEPTUPLOADREQ: u8 = 0x55;
    pub const CANCELTRANSFER: u8 = 0x56;
    pub const OUTOFPARTREQS: u8 = 0x57;
    pub const REQUESTFILENAME: u8 = 0x58;
    pub const REQFILENAMEANSWER: u8 = 0x59;
}

/// Client-to-client TCP opcodes, eMule extension protocol.
pub mod emule_op {
    pub const EMULEINFO: u8 = 0x01;
    pub const EMULEINFOANSWER: u8 = 0x02;
    pub const COMPRESSEDPART: u8 = 0x40;
    pub const QUEUERANKING: u8 = 0x60;
    pub const QUEUEFULL: u8 = 0x93;
    pub const PUBLICIP_REQ: u8 = 0x97;
    pub const PUBLICIP_ANSWER: u8 = 0x98;
    pub const COMPRESSEDPART_I64: u8 = 0xA1;
    pub const SENDINGPART_I64: u8 = 0xA2;
    pub const REQUESTPARTS_I64: u8 = 0xA3;
}

/// Kademlia v2 UDP opcodes.
pub mod kad_op {
    pub const KADEMLIA2_BOOTSTRAP_REQ: u8 = 0x01;
    pub const KADEMLIA2_BOOTSTRAP_RES: u8 = 0x09;
    pub const KADEMLIA2_HELLO_REQ: u8 = 0x11;
    pub const KADEMLIA2_HELLO_RES: u8 = 0x19;
    pub const KADEMLIA2_REQ: u8 = 0x21;
    pub const KADEMLIA2_RES: u8 = 0x29;
    pub const KADEMLIA2_SEARCH_KEY_REQ: u8 = 0x33;
    pub const KADEMLIA2_SEARCH_SOURCE_REQ: u8 = 0x34;
    pub const KADEMLIA2_SEARCH_NOTES_REQ: u8 = 0x35;
    pub const KADEMLIA2_SEARCH_RES: u8 = 0x3B;
    pub const KADEMLIA2_PING: u8 = 0x60;
    pub const KADEMLIA2_PONG: u8 = 0x61;
}

/// Well-known tag name ids.
pub mod ft {
    pub const FT_FILENAME: u8 = 0x01;
    pub const FT_FILESIZE: u8 = 0x02;
    pub const FT_FILETYPE: u8 = 0x03;
    pub const FT_FILEFORMAT: u8 = 0x04;
    pub const FT_LASTSEENCOMPLETE: u8 = 0x05;
    pub const FT_ULPRIORITY: u8 = 0x19;
    pub const FT_AICH_HASH: u8 = 0x27;
    pub const FT_FILEHASH: u8 = 0x28;
    pub const FT_COMPLETE_SOURCES: u8 = 0x30;
    pub const FT_FILESIZE_HI: u8 = 0x3A;
    pub const FT_ATTRANSFERRED: u8 = 0x50;
    pub const FT_ATREQUESTED: u8 = 0x51;
    pub const FT_ATACCEPTED: u8 = 0x52;
    pub const FT_CATEGORY: u8 = 0x53;
    pub const FT_ATTRANSFERREDHI: u8 = 0x54;
    pub const FT_MEDIA_ARTIST: u8 = 0xD0;
    pub const FT_MEDIA_ALBUM: u8 = 0xD1;
    pub const FT_MEDIA_TITLE: u8 = 0xD2;
    pub const FT_MEDIA_LENGTH: u8 = 0xD3;
    pub const FT_MEDIA_BITRATE: u8 = 0xD4;
    pub const FT_MEDIA_CODEC: u8 = 0xD5;
}

/// Login/hello tag name ids.
pub mod ct {
    pub const CT_NAME: u8 = 0x01;
    pub const CT_SERVER_UDPSEARCH_FLAGS: u8 = 0x0E;
    pub const CT_PORT: u8 = 0x0F;
    pub const CT_VERSION: u8 = 0x11;
    pub const CT_SERVER_FLAGS: u8 = 0x20;
    pub const CT_EMULECOMPAT_OPTIONS: u8 = 0xEF;
    pub const CT_EMULE_RESERVED13: u8 = 0xF7;
    pub const CT_EMULE_UDPPORTS: u8 = 0xF9;
    pub const CT_EMULE_MISCOPTIONS1: u8 = 0xFA;
    pub const CT_EMULE_VERSION: u8 = 0xFB;
    pub const CT_EMULE_MISCOPTIONS2: u8 = 0xFE;
}
