//! Complete CoAP messages.

use std::fmt;

use bytes::Bytes;

use crate::{
    block::BlockValue,
    code::Code,
    content_format::ContentFormat,
    errors::{ProtocolError, Result},
    header::{Header, MessageType},
    option::{CoapOption, OptionNumber, decode_options, decode_uint, encode_options, encode_uint},
    path::ResourcePath,
};

/// Request/response correlation token, 0 to 8 bytes.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Token(Vec<u8>);

impl Token {
    /// Longest token the header can express.
    pub const MAX_LEN: usize = 8;

    /// Wrap raw token bytes.
    pub fn new(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > Self::MAX_LEN {
            return Err(ProtocolError::InvalidTokenLength(bytes.len()));
        }
        Ok(Self(bytes.to_vec()))
    }

    /// Token built from a 64-bit value (always 8 bytes).
    pub fn from_u64(value: u64) -> Self {
        Self(value.to_be_bytes().to_vec())
    }

    /// The zero-length token.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Zero-length token.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", hex::encode(&self.0))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

/// A decoded CoAP message.
///
/// Options are kept sorted by number; repeated options (Uri-Path,
/// Uri-Query, Location-Path) keep their insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// CON, NON, ACK or RST.
    pub message_type: MessageType,
    /// Method or response code.
    pub code: Code,
    /// Message ID.
    pub message_id: u16,
    /// Correlation token.
    pub token: Token,
    options: Vec<CoapOption>,
    /// Payload, empty if absent.
    pub payload: Bytes,
}

impl Message {
    /// Message with no token, options or payload.
    pub fn new(message_type: MessageType, code: Code, message_id: u16) -> Self {
        Self {
            message_type,
            code,
            message_id,
            token: Token::empty(),
            options: Vec::new(),
            payload: Bytes::new(),
        }
    }

    /// Request with a token.
    pub fn request(message_type: MessageType, method: Code, message_id: u16, token: Token) -> Self {
        Self { token, ..Self::new(message_type, method, message_id) }
    }

    /// Empty ACK for `message_id`.
    pub fn empty_ack(message_id: u16) -> Self {
        Self::new(MessageType::Acknowledgement, Code::EMPTY, message_id)
    }

    /// RST for `message_id`.
    pub fn reset(message_id: u16) -> Self {
        Self::new(MessageType::Reset, Code::EMPTY, message_id)
    }

    /// ACK carrying the response to this request.
    pub fn piggybacked_response(&self, code: Code) -> Self {
        Self { token: self.token.clone(), ..Self::new(MessageType::Acknowledgement, code, self.message_id) }
    }

    /// Response to a NON request, sent with a fresh message ID.
    pub fn non_response(&self, code: Code, message_id: u16) -> Self {
        Self { token: self.token.clone(), ..Self::new(MessageType::NonConfirmable, code, message_id) }
    }

    /// Replace the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Code 0.00.
    pub fn is_empty_message(&self) -> bool {
        self.code.is_empty()
    }

    /// All options in ascending order.
    pub fn options(&self) -> &[CoapOption] {
        &self.options
    }

    /// Append an option, keeping number order.
    pub fn add_option(&mut self, number: OptionNumber, value: impl Into<Vec<u8>>) {
        let at = self.options.partition_point(|o| o.number <= number);
        self.options.insert(at, CoapOption { number, value: value.into() });
    }

    /// Replace every instance of `number` with a single value.
    pub fn set_option(&mut self, number: OptionNumber, value: impl Into<Vec<u8>>) {
        self.remove_option(number);
        self.add_option(number, value);
    }

    /// Drop every instance of `number`.
    pub fn remove_option(&mut self, number: OptionNumber) {
        self.options.retain(|o| o.number != number);
    }

    /// First value of `number`.
    pub fn option(&self, number: OptionNumber) -> Option<&[u8]> {
        self.options.iter().find(|o| o.number == number).map(|o| o.value.as_slice())
    }

    /// Every value of `number` in order.
    pub fn option_values(&self, number: OptionNumber) -> impl Iterator<Item = &[u8]> {
        self.options.iter().filter(move |o| o.number == number).map(|o| o.value.as_slice())
    }

    /// Append Uri-Path segments.
    pub fn add_uri_path<S: AsRef<[u8]>>(&mut self, segments: impl IntoIterator<Item = S>) {
        for segment in segments {
            self.add_option(OptionNumber::URI_PATH, segment.as_ref());
        }
    }

    /// Append a Uri-Query parameter.
    pub fn add_uri_query(&mut self, query: impl AsRef<str>) {
        self.add_option(OptionNumber::URI_QUERY, query.as_ref().as_bytes());
    }

    /// Uri-Path segments as text.
    pub fn uri_path_segments(&self) -> Vec<String> {
        self.option_values(OptionNumber::URI_PATH)
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .collect()
    }

    /// Uri-Path interpreted as an LwM2M resource path.
    pub fn resource_path(&self) -> Result<ResourcePath> {
        ResourcePath::from_uri_segments(self.option_values(OptionNumber::URI_PATH))
    }

    /// Uri-Query parameters as text.
    pub fn uri_query(&self) -> Vec<String> {
        self.option_values(OptionNumber::URI_QUERY)
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .collect()
    }

    /// Location-Path segments as text.
    pub fn location_path(&self) -> Vec<String> {
        self.option_values(OptionNumber::LOCATION_PATH)
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .collect()
    }

    /// Observe option value. `Some(0)` registers, `Some(1)` deregisters.
    pub fn observe(&self) -> Option<u32> {
        self.option(OptionNumber::OBSERVE).and_then(decode_uint)
    }

    /// Set the Observe option (24-bit sequence).
    pub fn set_observe(&mut self, sequence: u32) {
        self.set_option(OptionNumber::OBSERVE, encode_uint(sequence & 0x00FF_FFFF));
    }

    /// Content-Format option.
    pub fn content_format(&self) -> Option<ContentFormat> {
        self.option(OptionNumber::CONTENT_FORMAT)
            .and_then(decode_uint)
            .and_then(|v| u16::try_from(v).ok())
            .map(ContentFormat)
    }

    /// Set Content-Format.
    pub fn set_content_format(&mut self, format: ContentFormat) {
        self.set_option(OptionNumber::CONTENT_FORMAT, encode_uint(u32::from(format.0)));
    }

    /// Accept option.
    pub fn accept(&self) -> Option<ContentFormat> {
        self.option(OptionNumber::ACCEPT)
            .and_then(decode_uint)
            .and_then(|v| u16::try_from(v).ok())
            .map(ContentFormat)
    }

    /// Block1 option, if present.
    pub fn block1(&self) -> Result<Option<BlockValue>> {
        self.option(OptionNumber::BLOCK1).map(BlockValue::decode).transpose()
    }

    /// Block2 option, if present.
    pub fn block2(&self) -> Result<Option<BlockValue>> {
        self.option(OptionNumber::BLOCK2).map(BlockValue::decode).transpose()
    }

    /// Set Block1.
    pub fn set_block1(&mut self, block: BlockValue) {
        self.set_option(OptionNumber::BLOCK1, block.encode());
    }

    /// Set Block2.
    pub fn set_block2(&mut self, block: BlockValue) {
        self.set_option(OptionNumber::BLOCK2, block.encode());
    }

    /// Set Size1 (total request body size) or Size2 (total response size).
    pub fn set_size(&mut self, number: OptionNumber, size: usize) {
        self.set_option(number, encode_uint(u32::try_from(size).unwrap_or(u32::MAX)));
    }

    /// Serialize to a datagram.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.code.is_empty()
            && (!self.token.is_empty() || !self.options.is_empty() || !self.payload.is_empty())
        {
            return Err(ProtocolError::MalformedEmptyMessage);
        }

        let header =
            Header::new(self.message_type, self.token.len() as u8, self.code, self.message_id);

        let mut out = Vec::with_capacity(Header::SIZE + self.token.len() + self.payload.len() + 16);
        out.extend_from_slice(zerocopy::IntoBytes::as_bytes(&header));
        out.extend_from_slice(self.token.as_bytes());
        encode_options(&self.options, &mut out)?;
        if !self.payload.is_empty() {
            out.push(0xFF);
            out.extend_from_slice(&self.payload);
        }
        Ok(out)
    }

    /// Parse a datagram.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (header, rest) = Header::parse(bytes)?;

        let token_len = header.token_len();
        if token_len > Token::MAX_LEN {
            return Err(ProtocolError::InvalidTokenLength(token_len));
        }
        if rest.len() < token_len {
            return Err(ProtocolError::Truncated { needed: token_len, actual: rest.len() });
        }

        let code = header.code();
        if code.is_empty() && (token_len != 0 || !rest.is_empty()) {
            return Err(ProtocolError::MalformedEmptyMessage);
        }

        let (token, rest) = rest.split_at(token_len);
        let (options, payload) = decode_options(rest)?;

        Ok(Self {
            message_type: header.message_type(),
            code,
            message_id: header.message_id(),
            token: Token(token.to_vec()),
            options,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}
