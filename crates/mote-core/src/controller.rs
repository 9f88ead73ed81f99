//! Bootstrap/registration controller.
//!
//! # Architecture: Pure Evaluator
//!
//! The controller owns the engine state and nothing else. Each evaluation
//! looks at a [`Facts`] snapshot (server list contents and the latest
//! bootstrap/registration outcomes) and returns a [`Verdict`]. The engine
//! performs the verdict's [`Effect`], commits the transition with
//! [`Controller::enter`], recomputes facts and evaluates again, up to
//! [`MAX_REDISPATCH`] times per step. The state is therefore a function of
//! the facts; no other component writes it.
//!
//! # State Machine
//!
//! ```text
//!            ┌─────────┐ live servers  ┌──────────────────┐ RegisterAll ┌─────────────┐
//!    ┌──────>│ Initial │──────────────>│ RegisterRequired │────────────>│ Registering │
//!    │       └─────────┘               └──────────────────┘             └─────────────┘
//!    │            │ none                                                  │  all    │ any
//!    │            ↓                                                       │  ok     │ failed
//!    │  ┌───────────────────┐<──────────────────────────────────────────────────────┘
//!    │  │ BootstrapRequired │<────────────────────┐                       ↓
//!    │  └───────────────────┘      any failed     │                   ┌───────┐
//!    │            │ StartBootstrap                └───────────────────│ Ready │
//!    │            ↓                                                   └───────┘
//!    │   ┌───────────────┐
//!    └───│ Bootstrapping │ (failure: service unavailable)
//!  done  └───────────────┘
//! ```

use std::fmt;

use crate::bootstrap::BootstrapProgress;

/// Bound on state re-evaluations within one step.
pub const MAX_REDISPATCH: usize = 8;

/// Engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    /// Refresh the server list and decide what to do with it.
    Initial,
    /// No usable server account; bootstrap needed.
    BootstrapRequired,
    /// Bootstrap exchange under way.
    Bootstrapping,
    /// Register with every live server.
    RegisterRequired,
    /// Waiting for registration outcomes.
    Registering,
    /// Registered with every live server.
    Ready,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initial => "initial",
            Self::BootstrapRequired => "bootstrap-required",
            Self::Bootstrapping => "bootstrapping",
            Self::RegisterRequired => "register-required",
            Self::Registering => "registering",
            Self::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// Snapshot the controller decides on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Facts {
    /// Non-bootstrap servers in the table.
    pub live_servers: usize,
    /// A bootstrap server is configured.
    pub bootstrap_server: bool,
    /// Progress of the bootstrap exchange.
    pub bootstrap: BootstrapProgress,
    /// Every live server is registered.
    pub all_registered: bool,
    /// At least one live server failed registration.
    pub any_failed: bool,
}

/// What the engine must do when taking a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Nothing beyond the state change.
    None,
    /// Send a Bootstrap-Request.
    StartBootstrap,
    /// Send Register to every live server.
    RegisterAll,
}

/// Why the engine cannot make progress without outside help.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnavailableReason {
    /// Bootstrap is needed but no bootstrap server is configured.
    NoBootstrapServer,
    /// The bootstrap exchange failed.
    BootstrapFailed(String),
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoBootstrapServer => f.write_str("bootstrap required but no bootstrap server configured"),
            Self::BootstrapFailed(reason) => write!(f, "bootstrap failed: {reason}"),
        }
    }
}

/// Controller decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Move to `to` after performing `effect`.
    Advance {
        /// Next state.
        to: EngineState,
        /// Side effect of the transition.
        effect: Effect,
    },
    /// Wait for a response or a timer.
    Hold,
    /// Wait for reconfiguration.
    Unavailable(UnavailableReason),
}

/// A committed state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Previous state.
    pub from: EngineState,
    /// New state.
    pub to: EngineState,
}

/// Owner of the engine state.
#[derive(Debug, Clone)]
pub struct Controller {
    state: EngineState,
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

impl Controller {
    /// Controller in [`EngineState::Initial`].
    pub fn new() -> Self {
        Self { state: EngineState::Initial }
    }

    /// Current state.
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Decide the next move from `facts`.
    pub fn evaluate(&self, facts: &Facts) -> Verdict {
        let advance = |to, effect| Verdict::Advance { to, effect };

        match self.state {
            EngineState::Initial => {
                if facts.live_servers > 0 {
                    advance(EngineState::RegisterRequired, Effect::None)
                } else {
                    advance(EngineState::BootstrapRequired, Effect::None)
                }
            },

            EngineState::BootstrapRequired => {
                if facts.bootstrap_server {
                    advance(EngineState::Bootstrapping, Effect::StartBootstrap)
                } else {
                    Verdict::Unavailable(UnavailableReason::NoBootstrapServer)
                }
            },

            EngineState::Bootstrapping => match &facts.bootstrap {
                BootstrapProgress::Finished => advance(EngineState::Initial, Effect::None),
                BootstrapProgress::Failed(reason) => {
                    Verdict::Unavailable(UnavailableReason::BootstrapFailed(reason.clone()))
                },
                BootstrapProgress::Idle | BootstrapProgress::Pending => Verdict::Hold,
            },

            EngineState::RegisterRequired => {
                if facts.live_servers == 0 {
                    advance(EngineState::BootstrapRequired, Effect::None)
                } else {
                    advance(EngineState::Registering, Effect::RegisterAll)
                }
            },

            EngineState::Registering => {
                if facts.any_failed {
                    advance(EngineState::BootstrapRequired, Effect::None)
                } else if facts.all_registered {
                    advance(EngineState::Ready, Effect::None)
                } else {
                    Verdict::Hold
                }
            },

            EngineState::Ready => {
                if facts.any_failed || facts.live_servers == 0 {
                    advance(EngineState::BootstrapRequired, Effect::None)
                } else {
                    Verdict::Hold
                }
            },
        }
    }

    /// Commit a transition.
    pub fn enter(&mut self, to: EngineState) -> Transition {
        let transition = Transition { from: self.state, to };
        tracing::info!(from = %transition.from, to = %transition.to, "engine state changed");
        self.state = to;
        transition
    }
}
