//! Datagram transport abstraction.
//!
//! A session is one peer (an LwM2M server or bootstrap server) reached over
//! some datagram transport: plain UDP, DTLS, or the in-memory network of the
//! simulation harness. The engine only sees opaque session handles; address
//! resolution and any security handshake live behind [`Transport::connect`].

use std::fmt;

use crate::error::TransportError;

/// Opaque handle for a connected peer, issued by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Non-blocking datagram transport.
///
/// None of these methods may block: `recv` returns `Ok(None)` when nothing is
/// queued, and the driver sleeps until the next wake or until the transport
/// signals readiness.
pub trait Transport {
    /// Open a session to `uri` (for example `coap://192.0.2.1:5683`).
    fn connect(&mut self, uri: &str) -> Result<SessionId, TransportError>;

    /// Send one datagram. Returns the number of bytes written.
    fn send(&mut self, session: SessionId, datagram: &[u8]) -> Result<usize, TransportError>;

    /// Take the next queued datagram for `session`, if any.
    fn recv(&mut self, session: SessionId) -> Result<Option<Vec<u8>>, TransportError>;

    /// Close a session. Unknown sessions are ignored.
    fn close(&mut self, session: SessionId);
}
