//! Engine error types.

use mote_core::{ConfigError, TransactionError, TransportError};
use mote_proto::ProtocolError;
use thiserror::Error;

/// Errors returned synchronously by [`crate::Engine`] operations.
///
/// Outcomes of exchanges that fail later (timeouts, rejected registrations,
/// failed sends) are reported as [`crate::EngineEvent`]s instead.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad or duplicate setup.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// The transport refused to open a session.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A request could not be encoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The transaction store could not take the request.
    #[error("transaction error: {0}")]
    Transaction(#[from] TransactionError),

    /// No live server with this URI.
    #[error("unknown server: {uri}")]
    UnknownServer {
        /// URI that matched nothing.
        uri: String,
    },

    /// The operation needs a registration the server does not hold.
    #[error("server {short_id} is not registered")]
    NotRegistered {
        /// Short server id.
        short_id: u16,
    },
}

impl EngineError {
    /// Returns true if this error needs operator intervention.
    ///
    /// Configuration errors do not go away by calling again. Everything else
    /// concerns one exchange and the engine keeps running.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Configuration(_) => true,

            Self::Transport(_)
            | Self::Protocol(_)
            | Self::Transaction(_)
            | Self::UnknownServer { .. }
            | Self::NotRegistered { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_are_fatal() {
        let err = EngineError::from(ConfigError::AlreadyConfigured);
        assert!(err.is_fatal());
        assert_eq!(err.to_string(), "configuration error: engine already configured");
    }

    #[test]
    fn exchange_errors_are_transient() {
        assert!(!EngineError::NotRegistered { short_id: 3 }.is_fatal());
        assert!(!EngineError::from(TransportError::InvalidUri("x".into())).is_fatal());
        assert!(!EngineError::UnknownServer { uri: "coap://nowhere".into() }.is_fatal());
    }
}
