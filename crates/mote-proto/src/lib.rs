//! Wire model for the mote LwM2M client.
//!
//! A CoAP message is a fixed 4-byte header (zero-copy binary), a token of at
//! most 8 bytes, a delta-encoded option list and an optional payload behind
//! the `0xFF` marker (RFC 7252 §3). This crate parses and builds those
//! messages, plus the handful of value types LwM2M layers on top: Block1/Block2
//! option values (RFC 7959), resource paths, content formats, binding modes
//! and the CoRE link format used in registration payloads.
//!
//! Nothing in here knows about timers, retransmission or server state. That
//! lives in `mote-core`.
//!
//! # Security
//!
//! Parsing never trusts lengths from the wire: the header is read through a
//! compile-time verified `zerocopy` layout, extended option lengths are
//! bounds-checked against the remaining datagram, and reserved nibbles are
//! rejected instead of skipped.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod binding;
pub mod block;
pub mod code;
pub mod content_format;
pub mod errors;
pub mod header;
pub mod link_format;
pub mod message;
pub mod option;
pub mod path;

pub use binding::Binding;
pub use block::BlockValue;
pub use code::Code;
pub use content_format::ContentFormat;
pub use errors::{ProtocolError, Result};
pub use header::{Header, MessageType};
pub use link_format::{Link, LinkAttribute};
pub use message::{Message, Token};
pub use option::{CoapOption, OptionNumber};
pub use path::ResourcePath;
