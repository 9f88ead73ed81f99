//! Mote client core logic
//!
//! Pure state machine logic for an LwM2M client, completely decoupled from
//! I/O. Every component takes the current time as a parameter and returns
//! what should happen next instead of doing it.
//!
//! # Architecture
//!
//! The components here never touch a socket, a clock or a thread. Time is
//! passed in as `now`, randomness comes from an [`env::Environment`], and
//! outbound datagrams are returned to the caller. The engine in `mote-client`
//! owns one instance of each component, feeds them a single `now` per step,
//! and executes the datagrams they produce through a [`transport::Transport`].
//!
//! # Components
//!
//! - [`transaction`]: confirmable retransmission, response matching
//! - [`block`]: Block1/Block2 reassembly per (server, path, direction)
//! - [`observe`]: observations and notification scheduling
//! - [`server`]: server records and the refresh-by-dirty-flag table
//! - [`controller`]: the bootstrap/registration state machine
//! - [`bootstrap`]: progress and timeout of one bootstrap exchange
//! - [`config`]: engine configuration and server accounts
//! - [`storage`]: resource store collaborator and an in-memory store
//! - [`mod@env`]: Environment abstraction (time, RNG)
//! - [`transport`]: Datagram transport abstraction
//! - [`error`]: Error types

pub mod block;
pub mod bootstrap;
pub mod config;
pub mod controller;
pub mod env;
pub mod error;
pub mod observe;
pub mod server;
pub mod storage;
pub mod transaction;
pub mod transport;

pub use block::{BlockKey, BlockOutcome, BlockReassembler, Direction};
pub use bootstrap::{BootstrapProgress, BootstrapSession};
pub use config::{BlockConfig, EngineConfig, Psk, ServerAccount, TransmissionConfig};
pub use controller::{
    Controller, Effect, EngineState, Facts, MAX_REDISPATCH, Transition, UnavailableReason, Verdict,
};
pub use env::Environment;
pub use error::{BlockError, ConfigError, StoreError, TransactionError, TransportError};
pub use observe::{Attributes, DueNotification, ObservationKey, ObservationRegistry};
pub use server::{ServerRecord, ServerStatus, ServerTable};
pub use storage::{MemoryStore, ResourceStore, ResourceValue};
pub use transaction::{
    ResponseOutcome, TransactionEvent, TransactionId, TransactionKind, TransactionStore,
};
pub use transport::{SessionId, Transport};
