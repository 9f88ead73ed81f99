//! Progress of one client-initiated bootstrap exchange.
//!
//! ```text
//! Idle ──start──> Requested ──2.04──> InProgress ──Finish──> Finished
//!                     │                    │
//!                     └──── reject / timeout ──> Failed
//! ```
//!
//! The deadline is `bootstrap_timeout` after the last sign of life from the
//! bootstrap server, so a long provisioning sequence does not trip it while
//! requests keep arriving.

use std::time::{Duration, Instant};

/// Bootstrap status reported to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapProgress {
    /// No exchange started.
    Idle,
    /// Exchange running.
    Pending,
    /// Bootstrap-Finish received.
    Finished,
    /// Exchange failed.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Idle,
    Requested,
    InProgress,
    Finished,
    Failed(String),
}

/// One bootstrap exchange.
#[derive(Debug, Clone)]
pub struct BootstrapSession {
    phase: Phase,
    timeout: Duration,
    deadline: Option<Instant>,
}

impl BootstrapSession {
    /// Idle session with the given inactivity timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { phase: Phase::Idle, timeout, deadline: None }
    }

    /// Bootstrap-Request sent.
    pub fn start(&mut self, now: Instant) {
        self.phase = Phase::Requested;
        self.deadline = Some(now + self.timeout);
    }

    /// Bootstrap-Request acknowledged with 2.04 Changed.
    pub fn acknowledged(&mut self, now: Instant) {
        if self.phase == Phase::Requested {
            self.phase = Phase::InProgress;
        }
        self.activity(now);
    }

    /// A request from the bootstrap server arrived.
    pub fn activity(&mut self, now: Instant) {
        if self.is_running() {
            self.deadline = Some(now + self.timeout);
        }
    }

    /// Bootstrap-Finish received.
    pub fn finish(&mut self) {
        self.phase = Phase::Finished;
        self.deadline = None;
    }

    /// The exchange failed.
    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(%reason, "bootstrap failed");
        self.phase = Phase::Failed(reason);
        self.deadline = None;
    }

    /// Current progress; a passed deadline turns a running exchange into a
    /// failure.
    pub fn poll(&mut self, now: Instant) -> BootstrapProgress {
        if self.deadline.is_some_and(|d| now >= d) && self.is_running() {
            self.fail("bootstrap timed out");
        }
        match &self.phase {
            Phase::Idle => BootstrapProgress::Idle,
            Phase::Requested | Phase::InProgress => BootstrapProgress::Pending,
            Phase::Finished => BootstrapProgress::Finished,
            Phase::Failed(reason) => BootstrapProgress::Failed(reason.clone()),
        }
    }

    /// Request sent or provisioning under way.
    pub fn is_running(&self) -> bool {
        matches!(self.phase, Phase::Requested | Phase::InProgress)
    }

    /// Inactivity deadline while running.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Back to idle, keeping the timeout.
    pub fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.deadline = None;
    }
}
