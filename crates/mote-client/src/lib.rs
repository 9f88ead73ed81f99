//! Mote LwM2M client engine
//!
//! Ties the sans-IO components of `mote-core` into one step-driven engine:
//! registration and bootstrap, device management requests from servers,
//! observation notifications and application Send.
//!
//! # Components
//!
//! - [`Engine`]: the engine, advanced by [`Engine::step`]
//! - [`EngineEvent`]: asynchronous outcomes drained after each step
//! - [`registration`]: builders for client-originated requests
//! - [`WakeSchedule`]: next-wake computation
//! - `runtime` (feature `transport`): tokio UDP transport and run loop
//!
//! # Driving the engine
//!
//! ```text
//! loop {
//!     report = engine.step(now)
//!     events = engine.drain_events()
//!     sleep(report.next_wake) or until a datagram arrives
//! }
//! ```

#![forbid(unsafe_code)]

mod engine;
mod error;
mod event;
pub mod registration;
mod scheduler;

#[cfg(feature = "transport")]
pub mod runtime;

pub use engine::{Engine, EngineStatus, StepReport};
pub use error::EngineError;
pub use event::EngineEvent;
pub use scheduler::{WakeSchedule, round_up};
