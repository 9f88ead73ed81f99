//! Error types for CoAP encoding and decoding.

use thiserror::Error;

/// Result alias for wire operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while parsing or building CoAP messages.
///
/// Every variant describes a malformed or unrepresentable message. Callers
/// treat them as "drop this datagram" (or answer 4.00/4.02), never as a reason
/// to tear down a session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Datagram ended before a complete field could be read.
    #[error("datagram truncated: need {needed} bytes, have {actual}")]
    Truncated {
        /// Bytes required by the field being read.
        needed: usize,
        /// Bytes actually remaining.
        actual: usize,
    },

    /// Header version field is not 1.
    #[error("unsupported CoAP version {0}")]
    UnsupportedVersion(u8),

    /// Token length nibble is 9..=15.
    #[error("invalid token length {0}")]
    InvalidTokenLength(usize),

    /// Option delta or length used the reserved nibble value 15.
    #[error("reserved nibble in option {field}")]
    ReservedOptionNibble {
        /// Which half of the option byte was reserved ("delta" or "length").
        field: &'static str,
    },

    /// Option number exceeded 65535 after applying deltas.
    #[error("option number overflow")]
    OptionNumberOverflow,

    /// Option value longer than the encoding allows.
    #[error("option {number} value too long: {len} bytes")]
    OptionTooLong {
        /// Option number.
        number: u16,
        /// Value length in bytes.
        len: usize,
    },

    /// Payload marker present but no payload followed.
    #[error("payload marker without payload")]
    EmptyPayloadAfterMarker,

    /// Code 0.00 message carrying a token, options or payload.
    #[error("empty message must not carry token, options or payload")]
    MalformedEmptyMessage,

    /// Block1/Block2 option value is unusable.
    #[error("invalid block option: {0}")]
    InvalidBlock(String),

    /// Uri-Path does not form an LwM2M resource path.
    #[error("invalid resource path: {0}")]
    InvalidPath(String),

    /// Link-format document could not be parsed.
    #[error("invalid link format: {0}")]
    InvalidLinkFormat(String),
}
