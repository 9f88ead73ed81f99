//! CoAP options and their delta encoding.

use crate::errors::{ProtocolError, Result};

/// Option number registered with IANA (RFC 7252 §12.2, RFC 7641, RFC 7959).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OptionNumber(pub u16);

impl OptionNumber {
    /// If-Match
    pub const IF_MATCH: Self = Self(1);
    /// Uri-Host
    pub const URI_HOST: Self = Self(3);
    /// ETag
    pub const ETAG: Self = Self(4);
    /// Observe (RFC 7641)
    pub const OBSERVE: Self = Self(6);
    /// Uri-Port
    pub const URI_PORT: Self = Self(7);
    /// Location-Path
    pub const LOCATION_PATH: Self = Self(8);
    /// Uri-Path
    pub const URI_PATH: Self = Self(11);
    /// Content-Format
    pub const CONTENT_FORMAT: Self = Self(12);
    /// Max-Age
    pub const MAX_AGE: Self = Self(14);
    /// Uri-Query
    pub const URI_QUERY: Self = Self(15);
    /// Accept
    pub const ACCEPT: Self = Self(17);
    /// Location-Query
    pub const LOCATION_QUERY: Self = Self(20);
    /// Block2 (RFC 7959)
    pub const BLOCK2: Self = Self(23);
    /// Block1 (RFC 7959)
    pub const BLOCK1: Self = Self(27);
    /// Size2 (RFC 7959)
    pub const SIZE2: Self = Self(28);
    /// Size1
    pub const SIZE1: Self = Self(60);

    /// Critical options must be understood or the message rejected.
    pub fn is_critical(self) -> bool {
        self.0 & 0x01 == 0x01
    }
}

/// A single option instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    /// Option number.
    pub number: OptionNumber,
    /// Raw option value.
    pub value: Vec<u8>,
}

/// Largest value representable with the 2-byte extended length.
const MAX_EXTENDED: usize = 269 + 0xFFFF;

/// Encode an unsigned integer option value in the minimal number of bytes.
///
/// Zero encodes as the empty string.
pub fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

/// Decode an unsigned integer option value of at most 4 bytes.
pub fn decode_uint(bytes: &[u8]) -> Option<u32> {
    if bytes.len() > 4 {
        return None;
    }
    Some(bytes.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
}

/// Split a delta or length into its 4-bit nibble and extension bytes.
fn split_nibble(value: usize) -> (u8, Vec<u8>) {
    if value < 13 {
        (value as u8, Vec::new())
    } else if value < 269 {
        (13, vec![(value - 13) as u8])
    } else {
        (14, ((value - 269) as u16).to_be_bytes().to_vec())
    }
}

/// Append `options` (already sorted by number) to `out`.
pub fn encode_options(options: &[CoapOption], out: &mut Vec<u8>) -> Result<()> {
    let mut last = 0u16;
    for option in options {
        let len = option.value.len();
        if len > MAX_EXTENDED {
            return Err(ProtocolError::OptionTooLong { number: option.number.0, len });
        }

        let delta = usize::from(option.number.0 - last);
        let (delta_nibble, delta_ext) = split_nibble(delta);
        let (len_nibble, len_ext) = split_nibble(len);

        out.push((delta_nibble << 4) | len_nibble);
        out.extend_from_slice(&delta_ext);
        out.extend_from_slice(&len_ext);
        out.extend_from_slice(&option.value);
        last = option.number.0;
    }
    Ok(())
}

/// Read the extended form of a nibble from the front of `input`.
fn read_extended(nibble: u8, input: &mut &[u8], field: &'static str) -> Result<usize> {
    match nibble {
        0..=12 => Ok(usize::from(nibble)),
        13 => {
            let (first, rest) = input
                .split_first()
                .ok_or(ProtocolError::Truncated { needed: 1, actual: 0 })?;
            *input = rest;
            Ok(usize::from(*first) + 13)
        },
        14 => {
            if input.len() < 2 {
                return Err(ProtocolError::Truncated { needed: 2, actual: input.len() });
            }
            let value = u16::from_be_bytes([input[0], input[1]]);
            *input = &input[2..];
            Ok(usize::from(value) + 269)
        },
        _ => Err(ProtocolError::ReservedOptionNibble { field }),
    }
}

/// Decode options from `input`, returning them with the payload (if any).
///
/// Options come out in wire order, which the encoding guarantees is
/// ascending by number.
pub fn decode_options(mut input: &[u8]) -> Result<(Vec<CoapOption>, &[u8])> {
    let mut options = Vec::new();
    let mut number = 0u16;

    while let Some((&first, rest)) = input.split_first() {
        if first == 0xFF {
            if rest.is_empty() {
                return Err(ProtocolError::EmptyPayloadAfterMarker);
            }
            return Ok((options, rest));
        }
        input = rest;

        let delta = read_extended(first >> 4, &mut input, "delta")?;
        let len = read_extended(first & 0x0F, &mut input, "length")?;

        let delta = u16::try_from(delta).map_err(|_| ProtocolError::OptionNumberOverflow)?;
        number = number.checked_add(delta).ok_or(ProtocolError::OptionNumberOverflow)?;

        if input.len() < len {
            return Err(ProtocolError::Truncated { needed: len, actual: input.len() });
        }
        let (value, rest) = input.split_at(len);
        options.push(CoapOption { number: OptionNumber(number), value: value.to_vec() });
        input = rest;
    }

    Ok((options, &[]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uint_is_minimal() {
        assert!(encode_uint(0).is_empty());
        assert_eq!(encode_uint(0x3C), vec![0x3C]);
        assert_eq!(encode_uint(0x0100), vec![0x01, 0x00]);
        assert_eq!(decode_uint(&[0x01, 0x00]), Some(256));
        assert_eq!(decode_uint(&[]), Some(0));
        assert_eq!(decode_uint(&[1, 2, 3, 4, 5]), None);
    }

    #[test]
    fn extended_delta_and_length() {
        let options = vec![
            CoapOption { number: OptionNumber::URI_PATH, value: b"rd".to_vec() },
            CoapOption { number: OptionNumber::SIZE1, value: vec![0xAA; 20] },
            CoapOption { number: OptionNumber(400), value: vec![0x01; 300] },
        ];

        let mut buf = Vec::new();
        encode_options(&options, &mut buf).unwrap();

        // 11 -> delta 11, len 2
        assert_eq!(buf[0], 0xB2);
        // 60 - 11 = 49 -> nibble 13 + ext 36; len 20 -> nibble 13 + ext 7
        assert_eq!(&buf[3..6], &[0xDD, 36, 7]);

        let (decoded, payload) = decode_options(&buf).unwrap();
        assert_eq!(decoded, options);
        assert!(payload.is_empty());
    }

    #[test]
    fn reserved_nibble_rejected() {
        assert_eq!(
            decode_options(&[0xF1, 0x00]),
            Err(ProtocolError::ReservedOptionNibble { field: "delta" })
        );
    }

    #[test]
    fn marker_without_payload_rejected() {
        assert_eq!(decode_options(&[0xFF]), Err(ProtocolError::EmptyPayloadAfterMarker));
    }

    #[test]
    fn truncated_value_rejected() {
        assert_eq!(
            decode_options(&[0xB4, b'r', b'd']),
            Err(ProtocolError::Truncated { needed: 4, actual: 2 })
        );
    }
}
