//! Events reported by the engine.

use mote_core::TransactionId;
use mote_proto::ResourcePath;

/// Asynchronous outcomes, drained with [`crate::Engine::drain_events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The bootstrap server sent Bootstrap-Finish.
    BootstrapFinished,

    /// Bootstrap was rejected or timed out.
    BootstrapFailed {
        /// What went wrong.
        reason: String,
    },

    /// Register succeeded.
    Registered {
        /// Short server id.
        server: u16,
        /// Location assigned by the server.
        location: String,
    },

    /// Registration update succeeded.
    RegistrationUpdated {
        /// Short server id.
        server: u16,
    },

    /// Register or Update was rejected, timed out, or the lifetime lapsed.
    RegistrationFailed {
        /// Short server id.
        server: u16,
        /// What went wrong.
        reason: String,
    },

    /// De-registration finished.
    Deregistered {
        /// Short server id.
        server: u16,
    },

    /// A server started observing a path.
    ObservationStarted {
        /// Short server id.
        server: u16,
        /// Observed path.
        path: ResourcePath,
    },

    /// An observation ended (Cancel-Observe, RST, or teardown).
    ObservationCancelled {
        /// Short server id.
        server: u16,
        /// Observed path.
        path: ResourcePath,
    },

    /// A server wrote a resource.
    ResourceWritten {
        /// Short server id (0 for the bootstrap server).
        server: u16,
        /// Written path.
        path: ResourcePath,
    },

    /// A server executed a resource.
    ResourceExecuted {
        /// Short server id.
        server: u16,
        /// Executed path.
        path: ResourcePath,
    },

    /// An application Send was acknowledged with success.
    SendCompleted {
        /// Handle returned by `submit_send`.
        id: TransactionId,
    },

    /// An application Send was rejected or timed out.
    SendFailed {
        /// Handle returned by `submit_send`.
        id: TransactionId,
        /// What went wrong.
        reason: String,
    },
}
