//! Frame codec
//!
//! Splits the TCP byte stream into `{proto, u32 size, opcode, body}`
//! frames, validates header fields and unwraps the zlib-packed variant.

use std::io::{Read, Write};

use anyhow::Result;
use bytes::{Buf, BufMut, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tracing::trace;

use crate::error::{Ed2kError, ErrorKind};
use crate::protocol::{MAX_ED2K_PACKET_LEN, OP_EDONKEYPROT, OP_EMULEPROT, OP_KADEMLIAHEADER, OP_PACKEDPROT};

/// Header length on the wire: proto byte, u32 size, opcode.
pub const FRAME_HEADER_LEN: usize = 6;

/// One decoded frame. For the packed protocol the body has already been
/// inflated and `protocol` rewritten to the plain marker.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub protocol: u8,
    pub opcode: u8,
    pub body: BytesMut,
}

/// Try to split one frame off the front of `buf`.
///
/// Returns `Ok(None)` until a complete frame is buffered; the buffer is
/// left untouched in that case so more bytes can be appended.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }

    let protocol = buf[0];
    let size = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);

    match protocol {
        OP_EDONKEYPROT | OP_PACKEDPROT | OP_EMULEPROT => {}
        OP_KADEMLIAHEADER => {
            return Err(Ed2kError::decode_error_with(
                ErrorKind::UnsupportedPackedType,
                "kademlia marker on a stream transport",
            )
            .into())
        }
        p => {
            return Err(Ed2kError::decode_error_with(
                ErrorKind::InvalidProtocolType,
                format!("invalid protocol type: 0x{:02X}", p),
            )
            .into())
        }
    }

    if size == 0 || size > MAX_ED2K_PACKET_LEN {
        return Err(Ed2kError::decode_error_with(
            ErrorKind::InvalidPacketSize,
            format!("invalid packet size: {}", size),
        )
        .into());
    }

    let body_len = (size - 1) as usize;
    if buf.len() < FRAME_HEADER_LEN + body_len {
        return Ok(None);
    }

    buf.advance(5);
    let opcode = buf.get_u8();
    let body = buf.split_to(body_len);
    trace!("frame: proto=0x{:02X} opcode=0x{:02X} body={}B", protocol, opcode, body.len());

    if protocol == OP_PACKEDPROT {
        let inflated = inflate(&body, MAX_ED2K_PACKET_LEN as usize)?;
        return Ok(Some(Frame {
            protocol: OP_EDONKEYPROT,
            opcode,
            body: BytesMut::from(&inflated[..]),
        }));
    }

    Ok(Some(Frame {
        protocol,
        opcode,
        body,
    }))
}

/// Serialize a frame with the given protocol marker, uncompressed.
pub fn encode_frame(protocol: u8, opcode: u8, body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
    buf.put_u8(protocol);
    buf.put_u32_le(body.len() as u32 + 1);
    buf.put_u8(opcode);
    buf.put_slice(body);
    buf
}

/// Serialize a frame, switching to the packed protocol when the deflated
/// body is strictly shorter than the plain one.
pub fn encode_frame_compressible(protocol: u8, opcode: u8, body: &[u8]) -> BytesMut {
    if let Ok(packed) = deflate(body) {
        if packed.len() < body.len() {
            trace!("packing frame opcode=0x{:02X}: {} -> {} bytes", opcode, body.len(), packed.len());
            return encode_frame(OP_PACKEDPROT, opcode, &packed);
        }
    }
    encode_frame(protocol, opcode, body)
}

/// zlib-compress a buffer.
pub fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// zlib-decompress a buffer, bounded by `limit`.
pub fn inflate(data: &[u8], limit: usize) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data).take(limit as u64 + 1);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(|e| {
        Ed2kError::decode_error_with(ErrorKind::UnsupportedPackedType, format!("inflate failed: {}", e))
    })?;
    if out.len() > limit {
        return Err(Ed2kError::decode_error(ErrorKind::InvalidPacketSize).into());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incomplete_header_returns_none() {
        let mut buf = BytesMut::from(&[OP_EDONKEYPROT, 0x05][..]);
        assert!(decode_frame(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_incomplete_body_returns_none() {
        let mut buf = BytesMut::new();
        buf.put_u8(OP_EDONKEYPROT);
        buf.put_u32_le(10);
        buf.put_u8(0x01);
        buf.put_slice(b"half"); // 4 of 9 body bytes
        assert!(decode_frame(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), FRAME_HEADER_LEN + 4);
    }

    #[test]
    fn test_plain_round_trip() {
        let encoded = encode_frame(OP_EDONKEYPROT, 0x42, b"payload");
        let mut buf = encoded.clone();
        let frame = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.protocol, OP_EDONKEYPROT);
        assert_eq!(frame.opcode, 0x42);
        assert_eq!(&frame.body[..], b"payload");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(OP_EDONKEYPROT, 0x01, b"first"));
        buf.extend_from_slice(&encode_frame(OP_EMULEPROT, 0x02, b"second"));

        let first = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(first.opcode, 0x01);
        let second = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(second.protocol, OP_EMULEPROT);
        assert_eq!(&second.body[..], b"second");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_zero_size_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(OP_EDONKEYPROT);
        buf.put_u32_le(0);
        buf.put_u8(0x01);
        let err = decode_frame(&mut buf).unwrap_err();
        let err = err.downcast::<Ed2kError>().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidPacketSize);
    }

    #[test]
    fn test_oversize_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(OP_EDONKEYPROT);
        buf.put_u32_le(MAX_ED2K_PACKET_LEN + 1);
        buf.put_u8(0x01);
        let err = decode_frame(&mut buf).unwrap_err();
        let err = err.downcast::<Ed2kError>().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidPacketSize);
    }

    #[test]
    fn test_bad_protocol_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x55);
        buf.put_u32_le(1);
        buf.put_u8(0x01);
        let err = decode_frame(&mut buf).unwrap_err();
        let err = err.downcast::<Ed2kError>().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidProtocolType);
    }

    #[test]
    fn test_packed_frame_inflates() {
        // highly repetitive payload so the packed form actually wins
        let body = vec![0x61u8; 4096];
        let encoded = encode_frame_compressible(OP_EDONKEYPROT, 0x16, &body);
        assert_eq!(encoded[0], OP_PACKEDPROT);
        assert!(encoded.len() < body.len());

        let mut buf = encoded;
        let frame = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.protocol, OP_EDONKEYPROT);
        assert_eq!(frame.opcode, 0x16);
        assert_eq!(&frame.body[..], &body[..]);
    }

    #[test]
    fn test_tiny_body_stays_plain() {
        // zlib overhead exceeds any saving on a short body
        let encoded = encode_frame_compressible(OP_EDONKEYPROT, 0x01, b"ab");
        assert_eq!(encoded[0], OP_EDONKEYPROT);
    }

    #[test]
    fn test_deflate_inflate_round_trip() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(20);
        let packed = deflate(&data).unwrap();
        let unpacked = inflate(&packed, data.len()).unwrap();
        assert_eq!(unpacked, data);
    }

    #[test]
    fn test_inflate_respects_limit() {
        let data = vec![0u8; 1024];
        let packed = deflate(&data).unwrap();
        assert!(inflate(&packed, 100).is_err());
    }
}
