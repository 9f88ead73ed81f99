//! Fixed CoAP header.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Ver| T |  TKL  |      Code     |          Message ID           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned, byteorder::network_endian::U16,
};

use crate::{
    code::Code,
    errors::{ProtocolError, Result},
};

/// CoAP message type (the `T` field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Requires an acknowledgement; retransmitted until acknowledged.
    Confirmable,
    /// Fire-and-forget.
    NonConfirmable,
    /// Acknowledges a confirmable message, optionally carrying a response.
    Acknowledgement,
    /// Rejects a message the receiver cannot process.
    Reset,
}

impl MessageType {
    /// Decode the 2-bit type field.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Self::Confirmable,
            1 => Self::NonConfirmable,
            2 => Self::Acknowledgement,
            _ => Self::Reset,
        }
    }

    /// Encode as the 2-bit type field.
    pub fn bits(self) -> u8 {
        match self {
            Self::Confirmable => 0,
            Self::NonConfirmable => 1,
            Self::Acknowledgement => 2,
            Self::Reset => 3,
        }
    }
}

/// Fixed 4-byte CoAP header.
///
/// Layout is verified at compile time by `zerocopy`; parsing is a cast, not a
/// copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct Header {
    ver_type_tkl: u8,
    code: u8,
    message_id: U16,
}

impl Header {
    /// Encoded size.
    pub const SIZE: usize = 4;

    /// The only defined protocol version.
    pub const VERSION: u8 = 1;

    /// Build a version-1 header.
    pub fn new(message_type: MessageType, token_len: u8, code: Code, message_id: u16) -> Self {
        Self {
            ver_type_tkl: (Self::VERSION << 6) | (message_type.bits() << 4) | (token_len & 0x0F),
            code: code.0,
            message_id: U16::new(message_id),
        }
    }

    /// View the front of a datagram as a header, returning the remainder.
    pub fn parse(bytes: &[u8]) -> Result<(&Self, &[u8])> {
        let (header, rest) = Self::ref_from_prefix(bytes)
            .map_err(|_| ProtocolError::Truncated { needed: Self::SIZE, actual: bytes.len() })?;

        if header.version() != Self::VERSION {
            return Err(ProtocolError::UnsupportedVersion(header.version()));
        }

        Ok((header, rest))
    }

    /// Protocol version.
    pub fn version(&self) -> u8 {
        self.ver_type_tkl >> 6
    }

    /// Message type.
    pub fn message_type(&self) -> MessageType {
        MessageType::from_bits(self.ver_type_tkl >> 4)
    }

    /// Token length nibble (not yet validated against the 8-byte limit).
    pub fn token_len(&self) -> usize {
        usize::from(self.ver_type_tkl & 0x0F)
    }

    /// Request method or response code.
    pub fn code(&self) -> Code {
        Code(self.code)
    }

    /// Message ID used for deduplication and ACK matching.
    pub fn message_id(&self) -> u16 {
        self.message_id.get()
    }
}
