//! Deterministic simulation harness for the mote LwM2M client.
//!
//! In-memory implementations of the Environment and Transport traits plus
//! scripted LwM2M servers, so whole bootstrap/registration/observation
//! flows run on virtual time, reproducibly per seed, with injected loss.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod scenario;
pub mod sim_env;
pub mod sim_network;
pub mod sim_server;
pub mod simulation;

pub use scenario::{OracleFn, RunnableScenario, Scenario};
pub use sim_env::SimEnv;
pub use sim_network::{Link, NetworkStats, SimNetwork, SimTransport};
pub use sim_server::{Behavior, SimServer, provisioning_writes};
pub use simulation::Simulation;
