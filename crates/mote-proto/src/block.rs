//! Block1/Block2 option values (RFC 7959).
//!
//! A block option packs three fields into a 0-3 byte unsigned integer:
//!
//! ```text
//! | NUM (4..20 bits) | M (1 bit) | SZX (3 bits) |
//! ```
//!
//! The block size is `2^(SZX + 4)`, so 16..=1024 bytes. SZX 7 is reserved for
//! BERT over reliable transports and is rejected here.

use crate::{
    errors::{ProtocolError, Result},
    option::{decode_uint, encode_uint},
};

/// Smallest block size CoAP can express.
pub const MIN_BLOCK_SIZE: u16 = 16;

/// Largest block size CoAP can express over datagram transports.
pub const MAX_BLOCK_SIZE: u16 = 1024;

/// Decoded block option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockValue {
    /// Block sequence number.
    pub num: u32,
    /// More blocks follow this one.
    pub more: bool,
    /// Size exponent: size is `2^(szx + 4)`.
    pub szx: u8,
}

impl BlockValue {
    /// Largest sequence number expressible in 20 bits.
    pub const MAX_NUM: u32 = (1 << 20) - 1;

    /// Build a block value from a byte size.
    pub fn new(num: u32, more: bool, size: u16) -> Result<Self> {
        let szx = Self::szx_for(size)
            .ok_or_else(|| ProtocolError::InvalidBlock(format!("size {size} is not 16..=1024 power of two")))?;
        if num > Self::MAX_NUM {
            return Err(ProtocolError::InvalidBlock(format!("block number {num} exceeds 20 bits")));
        }
        Ok(Self { num, more, szx })
    }

    /// Size exponent for a byte size, if it is a valid block size.
    pub fn szx_for(size: u16) -> Option<u8> {
        if !size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&size) {
            return None;
        }
        Some((size.trailing_zeros() - 4) as u8)
    }

    /// Block size in bytes.
    pub fn size(&self) -> u16 {
        1u16 << (self.szx + 4)
    }

    /// Byte offset of this block within the full body.
    pub fn offset(&self) -> usize {
        self.num as usize * usize::from(self.size())
    }

    /// Encode as an option value.
    pub fn encode(&self) -> Vec<u8> {
        let raw = (self.num << 4) | (u32::from(self.more) << 3) | u32::from(self.szx);
        encode_uint(raw)
    }

    /// Decode an option value.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > 3 {
            return Err(ProtocolError::InvalidBlock(format!("{} byte value", bytes.len())));
        }
        let raw = decode_uint(bytes)
            .ok_or_else(|| ProtocolError::InvalidBlock("value too long".to_string()))?;

        let szx = (raw & 0x07) as u8;
        if szx == 7 {
            return Err(ProtocolError::InvalidBlock("reserved SZX 7".to_string()));
        }

        Ok(Self { num: raw >> 4, more: raw & 0x08 != 0, szx })
    }
}

/// Cut block `num` of `size` bytes out of `body`.
///
/// Returns the slice and whether more blocks follow, or `None` when the
/// block starts past the end of the body.
pub fn slice(body: &[u8], num: u32, size: u16) -> Option<(&[u8], bool)> {
    let size = usize::from(size);
    let start = (num as usize).checked_mul(size)?;
    if start > body.len() || (start == body.len() && !body.is_empty()) {
        return None;
    }
    let end = (start + size).min(body.len());
    Some((&body[start..end], end < body.len()))
}
