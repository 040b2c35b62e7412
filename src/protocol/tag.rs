//! ed2k tag system
//!
//! Typed named values forming the ed2k metadata vocabulary. Tags carry
//! either a one-byte well-known name id or a free-form string name, and
//! one of the value types below. Numeric tags auto-compress to the
//! smallest sufficient width on emit; strings flagged compressible use
//! the fixed-length short-string type family.

use anyhow::Result;
use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Ed2kError, ErrorKind};
use crate::hash::FileHash;
use crate::protocol::{MAX_COLLECTION_SIZE, MAX_ED2K_STRING_LEN};

// tag type codes
pub const TAGTYPE_HASH16: u8 = 0x01;
pub const TAGTYPE_STRING: u8 = 0x02;
pub const TAGTYPE_UINT32: u8 = 0x03;
pub const TAGTYPE_FLOAT32: u8 = 0x04;
pub const TAGTYPE_BOOL: u8 = 0x05;
pub const TAGTYPE_BOOLARRAY: u8 = 0x06;
pub const TAGTYPE_BLOB: u8 = 0x07;
pub const TAGTYPE_UINT16: u8 = 0x08;
pub const TAGTYPE_UINT8: u8 = 0x09;
pub const TAGTYPE_BSOB: u8 = 0x0A;
pub const TAGTYPE_UINT64: u8 = 0x0B;
pub const TAGTYPE_STR1: u8 = 0x11;
pub const TAGTYPE_STR16: u8 = 0x20;

/// One-byte-name flag in the type byte.
const TAG_SHORT_NAME: u8 = 0x80;

/// Tag name: well-known id or free-form string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagName {
    Id(u8),
    Name(String),
}

/// Tag payload.
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    /// Unsigned integer of any width; emitted at the smallest width that fits
    Uint(u64),
    Float(f32),
    Bool(bool),
    /// Opaque bit array: bit count plus packed bytes
    BoolArray { bits: u16, data: Vec<u8> },
    Hash(FileHash),
    /// Length-prefixed opaque bytes (u32 length on the wire)
    Blob(Vec<u8>),
    String(String),
    /// eMule "BSOB" blob with a one-byte length prefix
    Bsob(Vec<u8>),
}

/// A named typed metadata atom.
#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub name: TagName,
    pub value: TagValue,
    /// Strings emit as fixed-length short variants when true and short enough
    pub compressible: bool,
}

impl Tag {
    /// Integer tag with a well-known name id.
    pub fn uint(id: u8, value: u64) -> Tag {
        Tag {
            name: TagName::Id(id),
            value: TagValue::Uint(value),
            compressible: true,
        }
    }

    /// String tag with a well-known name id.
    pub fn string(id: u8, value: impl Into<String>) -> Tag {
        Tag {
            name: TagName::Id(id),
            value: TagValue::String(value.into()),
            compressible: true,
        }
    }

    /// Hash tag with a well-known name id.
    pub fn hash(id: u8, value: FileHash) -> Tag {
        Tag {
            name: TagName::Id(id),
            value: TagValue::Hash(value),
            compressible: true,
        }
    }

    /// String tag with a free-form name, never short-form compressed.
    pub fn named_string(name: impl Into<String>, value: impl Into<String>) -> Tag {
        Tag {
            name: TagName::Name(name.into()),
            value: TagValue::String(value.into()),
            compressible: false,
        }
    }

    /// The well-known name id, if this tag has one.
    pub fn name_id(&self) -> Option<u8> {
        match &self.name {
            TagName::Id(id) => Some(*id),
            TagName::Name(_) => None,
        }
    }

    /// Integer value accessor.
    pub fn as_uint(&self) -> Option<u64> {
        match &self.value {
            TagValue::Uint(v) => Some(*v),
            _ => None,
        }
    }

    /// String value accessor.
    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            TagValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Hash value accessor.
    pub fn as_hash(&self) -> Option<FileHash> {
        match &self.value {
            TagValue::Hash(h) => Some(*h),
            _ => None,
        }
    }

    /// Wire type code this tag will serialize with.
    pub fn wire_type(&self) -> u8 {
        match &self.value {
            TagValue::Uint(v) => {
                if *v <= u8::MAX as u64 {
                    TAGTYPE_UINT8
                } else if *v <= u16::MAX as u64 {
                    TAGTYPE_UINT16
                } else if *v <= u32::MAX as u64 {
                    TAGTYPE_UINT32
                } else {
                    TAGTYPE_UINT64
                }
            }
            TagValue::Float(_) => TAGTYPE_FLOAT32,
            TagValue::Bool(_) => TAGTYPE_BOOL,
            TagValue::BoolArray { .. } => TAGTYPE_BOOLARRAY,
            TagValue::Hash(_) => TAGTYPE_HASH16,
            TagValue::Blob(_) => TAGTYPE_BLOB,
            TagValue::String(s) => {
                if self.compressible && !s.is_empty() && s.len() <= 16 {
                    TAGTYPE_STR1 + (s.len() as u8 - 1)
                } else {
                    TAGTYPE_STRING
                }
            }
            TagValue::Bsob(_) => TAGTYPE_BSOB,
        }
    }

    /// Serialize into `buf`.
    pub fn write(&self, buf: &mut BytesMut) {
        let wire_type = self.wire_type();
        match &self.name {
            TagName::Id(id) => {
                buf.put_u8(wire_type | TAG_SHORT_NAME);
                buf.put_u8(*id);
            }
            TagName::Name(name) => {
                buf.put_u8(wire_type);
                buf.put_u16_le(name.len() as u16);
                buf.put_slice(name.as_bytes());
            }
        }

        match &self.value {
            TagValue::Uint(v) => match wire_type {
                TAGTYPE_UINT8 => buf.put_u8(*v as u8),
                TAGTYPE_UINT16 => buf.put_u16_le(*v as u16),
                TAGTYPE_UINT32 => buf.put_u32_le(*v as u32),
                _ => buf.put_u64_le(*v),
            },
            TagValue::Float(v) => buf.put_f32_le(*v),
            TagValue::Bool(v) => buf.put_u8(*v as u8),
            TagValue::BoolArray { bits, data } => {
                buf.put_u16_le(*bits);
                buf.put_slice(data);
            }
            TagValue::Hash(h) => buf.put_slice(&h.0),
            TagValue::Blob(data) => {
                buf.put_u32_le(data.len() as u32);
                buf.put_slice(data);
            }
            TagValue::String(s) => {
                if wire_type == TAGTYPE_STRING {
                    buf.put_u16_le(s.len() as u16);
                }
                buf.put_slice(s.as_bytes());
            }
            TagValue::Bsob(data) => {
                buf.put_u8(data.len() as u8);
                buf.put_slice(data);
            }
        }
    }

    /// Decode one tag from `buf`.
    pub fn read(buf: &mut BytesMut) -> Result<Tag> {
        let type_byte = get_u8(buf)?;
        let short_name = type_byte & TAG_SHORT_NAME != 0;
        let wire_type = type_byte & !TAG_SHORT_NAME;

        let name = if short_name {
            TagName::Id(get_u8(buf)?)
        } else {
            let len = get_u16(buf)? as usize;
            TagName::Name(read_string_bytes(buf, len)?)
        };

        let (value, compressible) = match wire_type {
            TAGTYPE_UINT8 => (TagValue::Uint(get_u8(buf)? as u64), true),
            TAGTYPE_UINT16 => (TagValue::Uint(get_u16(buf)? as u64), true),
            TAGTYPE_UINT32 => (TagValue::Uint(get_u32(buf)? as u64), true),
            TAGTYPE_UINT64 => (TagValue::Uint(get_u64(buf)?), true),
            TAGTYPE_FLOAT32 => {
                ensure_len(buf, 4)?;
                (TagValue::Float(buf.get_f32_le()), true)
            }
            TAGTYPE_BOOL => (TagValue::Bool(get_u8(buf)? != 0), true),
            TAGTYPE_BOOLARRAY => {
                let bits = get_u16(buf)?;
                let nbytes = (bits as usize + 7) / 8;
                ensure_len(buf, nbytes)?;
                let mut data = vec![0u8; nbytes];
                buf.copy_to_slice(&mut data);
                (TagValue::BoolArray { bits, data }, true)
            }
            TAGTYPE_HASH16 => {
                ensure_len(buf, 16)?;
                let mut hash = [0u8; 16];
                buf.copy_to_slice(&mut hash);
                (TagValue::Hash(FileHash(hash)), true)
            }
            TAGTYPE_BLOB => {
                let len = get_u32(buf)? as usize;
                if len > MAX_ED2K_STRING_LEN {
                    return Err(Ed2kError::decode_error(ErrorKind::TagTooLong).into());
                }
                ensure_len(buf, len)?;
                let mut data = vec![0u8; len];
                buf.copy_to_slice(&mut data);
                (TagValue::Blob(data), true)
            }
            TAGTYPE_BSOB => {
                let len = get_u8(buf)? as usize;
                ensure_len(buf, len)?;
                let mut data = vec![0u8; len];
                buf.copy_to_slice(&mut data);
                (TagValue::Bsob(data), true)
            }
            TAGTYPE_STRING => {
                let len = get_u16(buf)? as usize;
                if len > MAX_ED2K_STRING_LEN {
                    return Err(Ed2kError::decode_error(ErrorKind::TagTooLong).into());
                }
                (TagValue::String(read_string_bytes(buf, len)?), false)
            }
            t if (TAGTYPE_STR1..=TAGTYPE_STR16).contains(&t) => {
                let len = (t - TAGTYPE_STR1 + 1) as usize;
                (TagValue::String(read_string_bytes(buf, len)?), true)
            }
            t => {
                return Err(Ed2kError::decode_error_with(
                    ErrorKind::InvalidTagType,
                    format!("invalid tag type: 0x{:02X}", t),
                )
                .into())
            }
        };

        Ok(Tag {
            name,
            value,
            compressible,
        })
    }
}

/// A counted list of tags. The count width on the wire is declared by the
/// containing message, so both 16- and 32-bit forms are provided.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TagList(pub Vec<Tag>);

impl TagList {
    pub fn new() -> TagList {
        TagList(Vec::new())
    }

    pub fn push(&mut self, tag: Tag) {
        self.0.push(tag);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First tag with the given well-known name id.
    pub fn find(&self, id: u8) -> Option<&Tag> {
        self.0.iter().find(|t| t.name_id() == Some(id))
    }

    /// Serialize with a `u8` element count (Kademlia form).
    pub fn write_u8(&self, buf: &mut BytesMut) {
        buf.put_u8(self.0.len() as u8);
        for tag in &self.0 {
            tag.write(buf);
        }
    }

    /// Serialize with a `u16` element count.
    pub fn write_u16(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.0.len() as u16);
        for tag in &self.0 {
            tag.write(buf);
        }
    }

    /// Serialize with a `u32` element count.
    pub fn write_u32(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.0.len() as u32);
        for tag in &self.0 {
            tag.write(buf);
        }
    }

    /// Decode with a `u8` element count (Kademlia form).
    pub fn read_u8(buf: &mut BytesMut) -> Result<TagList> {
        let count = get_u8(buf)? as usize;
        Self::read_items(buf, count)
    }

    /// Decode with a `u16` element count.
    pub fn read_u16(buf: &mut BytesMut) -> Result<TagList> {
        let count = get_u16(buf)? as usize;
        Self::read_items(buf, count)
    }

    /// Decode with a `u32` element count.
    pub fn read_u32(buf: &mut BytesMut) -> Result<TagList> {
        let count = get_u32(buf)? as usize;
        Self::read_items(buf, count)
    }

    fn read_items(buf: &mut BytesMut, count: usize) -> Result<TagList> {
        if count > MAX_COLLECTION_SIZE {
            return Err(Ed2kError::decode_error_with(
                ErrorKind::DecodePacketError,
                format!("tag list too large: {}", count),
            )
            .into());
        }
        let mut tags = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            tags.push(Tag::read(buf)?);
        }
        Ok(TagList(tags))
    }
}

// byte-accurate read helpers shared across the protocol module

pub(crate) fn ensure_len(buf: &BytesMut, n: usize) -> Result<()> {
    if buf.len() < n {
        return Err(Ed2kError::decode_error_with(
            ErrorKind::UnexpectedEof,
            format!("need {} bytes, have {}", n, buf.len()),
        )
        .into());
    }
    Ok(())
}

pub(crate) fn get_u8(buf: &mut BytesMut) -> Result<u8> {
    ensure_len(buf, 1)?;
    Ok(buf.get_u8())
}

pub(crate) fn get_u16(buf: &mut BytesMut) -> Result<u16> {
    ensure_len(buf, 2)?;
    Ok(buf.get_u16_le())
}

pub(crate) fn get_u32(buf: &mut BytesMut) -> Result<u32> {
    ensure_len(buf, 4)?;
    Ok(buf.get_u32_le())
}

pub(crate) fn get_u64(buf: &mut BytesMut) -> Result<u64> {
    ensure_len(buf, 8)?;
    Ok(buf.get_u64_le())
}

pub(crate) fn get_hash(buf: &mut BytesMut) -> Result<FileHash> {
    ensure_len(buf, 16)?;
    let mut hash = [0u8; 16];
    buf.copy_to_slice(&mut hash);
    Ok(FileHash(hash))
}

pub(crate) fn read_string_bytes(buf: &mut BytesMut, len: usize) -> Result<String> {
    ensure_len(buf, len)?;
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    // ed2k predates universal UTF-8; salvage what we can
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub(crate) fn put_string_u16(buf: &mut BytesMut, s: &str) {
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

pub(crate) fn read_string_u16(buf: &mut BytesMut) -> Result<String> {
    let len = get_u16(buf)? as usize;
    if len > MAX_ED2K_STRING_LEN {
        return Err(Ed2kError::decode_error(ErrorKind::TagTooLong).into());
    }
    read_string_bytes(buf, len)
}
