//! Message transaction store.
//!
//! Every client-originated request lives here from creation until it is
//! answered, times out, is reset by the peer or is cancelled. The store owns
//! the serialized datagram so retransmissions are byte-identical.
//!
//! # Retransmission
//!
//! ```text
//!  create ──> deadline = now + ACK_TIMEOUT × [1, ACK_RANDOM_FACTOR)
//!     │
//!     ├─ deadline passes, retransmits < MAX_RETRANSMIT
//!     │      resend, timeout = min(2 × timeout, max_backoff)
//!     │
//!     ├─ deadline passes, retransmits == MAX_RETRANSMIT
//!     │      TimedOut (reported once, entry removed)
//!     │
//!     ├─ empty ACK: stop resending, wait for the separate response
//!     ├─ response (piggybacked or separate): Completed
//!     └─ RST: Reset
//! ```
//!
//! Non-confirmable requests are never resent; they wait `non_lifetime` for a
//! response and then time out.

use std::{
    collections::BTreeMap,
    fmt,
    time::{Duration, Instant},
};

use mote_proto::{Message, MessageType, ResourcePath, Token};

use crate::{
    config::TransmissionConfig, env::Environment, error::TransactionError, transport::SessionId,
};

/// Store-assigned transaction handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(u64);

impl TransactionId {
    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx#{}", self.0)
    }
}

/// What a transaction's outcome should be dispatched to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionKind {
    /// Register with a management server.
    Register,
    /// Registration update.
    Update,
    /// De-register.
    Deregister,
    /// Bootstrap-Request.
    BootstrapRequest,
    /// Observe notification for `path`.
    Notification {
        /// Observed path.
        path: ResourcePath,
    },
    /// Application-initiated LwM2M Send.
    Send,
}

/// Timer-driven transaction events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionEvent {
    /// Resend this datagram.
    Retransmit {
        /// Transaction being resent.
        id: TransactionId,
        /// Destination session.
        session: SessionId,
        /// The original datagram.
        datagram: Vec<u8>,
    },

    /// The transaction failed and was removed.
    TimedOut {
        /// Failed transaction.
        id: TransactionId,
        /// Short id of the server it was addressed to.
        server: u16,
        /// Outcome handler.
        kind: TransactionKind,
        /// It was a confirmable request (as opposed to an unanswered NON).
        confirmable: bool,
    },
}

/// Result of matching an inbound message against outstanding transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// The response completed the transaction, which was removed.
    Completed {
        /// Completed transaction.
        id: TransactionId,
        /// Server short id.
        server: u16,
        /// Outcome handler.
        kind: TransactionKind,
        /// The response.
        response: Message,
    },

    /// Empty ACK: retransmission stopped, a separate response will follow.
    Acknowledged {
        /// Acknowledged transaction.
        id: TransactionId,
    },

    /// The peer rejected the request with RST.
    Reset {
        /// Rejected transaction.
        id: TransactionId,
        /// Server short id.
        server: u16,
        /// Outcome handler.
        kind: TransactionKind,
    },

    /// Nothing outstanding matches.
    Unmatched,
}

#[derive(Debug, Clone)]
struct Transaction {
    server: u16,
    session: SessionId,
    kind: TransactionKind,
    message_id: u16,
    token: Token,
    confirmable: bool,
    datagram: Vec<u8>,
    retransmits: u8,
    timeout: Duration,
    deadline: Instant,
    acknowledged: bool,
}

/// Outstanding client requests keyed by [`TransactionId`].
#[derive(Debug, Clone)]
pub struct TransactionStore {
    config: TransmissionConfig,
    transactions: BTreeMap<TransactionId, Transaction>,
    next_message_ids: BTreeMap<SessionId, u16>,
    next_id: u64,
}

impl TransactionStore {
    /// Empty store.
    pub fn new(config: TransmissionConfig) -> Self {
        Self {
            config,
            transactions: BTreeMap::new(),
            next_message_ids: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Allocate a message ID towards `session` that no outstanding
    /// transaction to the same peer uses.
    ///
    /// Each session's counter starts at a random value.
    pub fn next_message_id(
        &mut self,
        session: SessionId,
        env: &impl Environment,
    ) -> Result<u16, TransactionError> {
        let counter = self.next_message_ids.entry(session).or_insert_with(|| env.random_u16());
        for _ in 0..=u16::MAX {
            let candidate = *counter;
            *counter = counter.wrapping_add(1);
            let in_use = self
                .transactions
                .values()
                .any(|t| t.session == session && t.message_id == candidate);
            if !in_use {
                return Ok(candidate);
            }
        }
        Err(TransactionError::MessageIdsExhausted(session))
    }

    /// Take ownership of `message`, assign its message ID (and a fresh token
    /// unless one is already set), and return the datagram to send.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &mut self,
        server: u16,
        session: SessionId,
        kind: TransactionKind,
        mut message: Message,
        confirmable: bool,
        now: Instant,
        env: &impl Environment,
    ) -> Result<(TransactionId, Vec<u8>), TransactionError> {
        message.message_id = self.next_message_id(session, env)?;
        message.message_type =
            if confirmable { MessageType::Confirmable } else { MessageType::NonConfirmable };
        if message.token.is_empty() {
            message.token = Token::from_u64(env.random_u64());
        }

        let datagram = message.encode()?;

        let timeout = if confirmable {
            let spread = self.config.ack_random_factor - 1.0;
            self.config.ack_timeout.mul_f64(1.0 + env.random_fraction() * spread)
        } else {
            self.config.non_lifetime
        };

        let id = TransactionId(self.next_id);
        self.next_id += 1;

        tracing::debug!(
            %id,
            %session,
            ?kind,
            mid = message.message_id,
            token = %message.token,
            confirmable,
            "transaction created"
        );

        self.transactions.insert(id, Transaction {
            server,
            session,
            kind,
            message_id: message.message_id,
            token: message.token,
            confirmable,
            datagram: datagram.clone(),
            retransmits: 0,
            timeout,
            deadline: now + timeout,
            acknowledged: false,
        });

        Ok((id, datagram))
    }

    /// Advance timers: resend due confirmables, fail exhausted ones.
    pub fn on_tick(&mut self, now: Instant) -> Vec<TransactionEvent> {
        let mut events = Vec::new();
        let mut expired = Vec::new();

        for (id, tx) in &mut self.transactions {
            if tx.deadline > now {
                continue;
            }

            let can_retry =
                tx.confirmable && !tx.acknowledged && tx.retransmits < self.config.max_retransmit;
            if can_retry {
                tx.retransmits += 1;
                tx.timeout = tx.timeout.saturating_mul(2).min(self.config.max_backoff);
                tx.deadline = now + tx.timeout;
                tracing::debug!(%id, attempt = tx.retransmits, next = ?tx.timeout, "retransmitting");
                events.push(TransactionEvent::Retransmit {
                    id: *id,
                    session: tx.session,
                    datagram: tx.datagram.clone(),
                });
            } else {
                expired.push(*id);
            }
        }

        for id in expired {
            if let Some(tx) = self.transactions.remove(&id) {
                tracing::warn!(%id, server = tx.server, kind = ?tx.kind, "transaction timed out");
                events.push(TransactionEvent::TimedOut {
                    id,
                    server: tx.server,
                    kind: tx.kind,
                    confirmable: tx.confirmable,
                });
            }
        }

        events
    }

    /// Match an inbound ACK, RST or response from `session`.
    pub fn on_response(&mut self, session: SessionId, message: &Message, now: Instant) -> ResponseOutcome {
        match message.message_type {
            MessageType::Reset => {
                let Some(id) = self.find(|t| t.session == session && t.message_id == message.message_id)
                else {
                    return ResponseOutcome::Unmatched;
                };
                match self.transactions.remove(&id) {
                    Some(tx) => ResponseOutcome::Reset { id, server: tx.server, kind: tx.kind },
                    None => ResponseOutcome::Unmatched,
                }
            },

            MessageType::Acknowledgement if message.is_empty_message() => {
                let separate_timeout = self.config.separate_response_timeout;
                let Some(id) = self.find(|t| {
                    t.session == session
                        && t.message_id == message.message_id
                        && t.confirmable
                        && !t.acknowledged
                }) else {
                    return ResponseOutcome::Unmatched;
                };
                // Notifications expect nothing beyond the ACK.
                let is_notification = self
                    .transactions
                    .get(&id)
                    .is_some_and(|t| matches!(t.kind, TransactionKind::Notification { .. }));
                if is_notification {
                    return self.complete(id, message);
                }
                if let Some(tx) = self.transactions.get_mut(&id) {
                    tx.acknowledged = true;
                    tx.deadline = now + separate_timeout;
                }
                tracing::debug!(%id, "empty ACK, awaiting separate response");
                ResponseOutcome::Acknowledged { id }
            },

            MessageType::Acknowledgement => {
                let Some(id) = self.find(|t| t.session == session && t.message_id == message.message_id)
                else {
                    return ResponseOutcome::Unmatched;
                };
                let token_matches =
                    self.transactions.get(&id).is_some_and(|t| t.token == message.token);
                if !token_matches {
                    tracing::debug!(
                        %id,
                        token = %message.token,
                        "ACK message id matches but token does not, discarding"
                    );
                    return ResponseOutcome::Unmatched;
                }
                self.complete(id, message)
            },

            MessageType::Confirmable | MessageType::NonConfirmable => {
                if !message.code.is_response() {
                    return ResponseOutcome::Unmatched;
                }
                let Some(id) = self.find(|t| t.session == session && t.token == message.token) else {
                    return ResponseOutcome::Unmatched;
                };
                self.complete(id, message)
            },
        }
    }

    /// Remove a transaction without reporting an outcome.
    pub fn cancel(&mut self, id: TransactionId) -> bool {
        self.transactions.remove(&id).is_some()
    }

    /// Remove every transaction addressed to `server`.
    pub fn cancel_server(&mut self, server: u16) -> usize {
        let before = self.transactions.len();
        self.transactions.retain(|_, t| t.server != server);
        before - self.transactions.len()
    }

    /// Earliest retransmission or expiry deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.transactions.values().map(|t| t.deadline).min()
    }

    /// Deadline of `id`.
    pub fn deadline(&self, id: TransactionId) -> Option<Instant> {
        self.transactions.get(&id).map(|t| t.deadline)
    }

    /// `id` is still outstanding.
    pub fn contains(&self, id: TransactionId) -> bool {
        self.transactions.contains_key(&id)
    }

    /// Outstanding transactions.
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    /// Nothing outstanding.
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    fn find(&self, predicate: impl Fn(&Transaction) -> bool) -> Option<TransactionId> {
        self.transactions.iter().find(|(_, t)| predicate(t)).map(|(id, _)| *id)
    }

    fn complete(&mut self, id: TransactionId, message: &Message) -> ResponseOutcome {
        match self.transactions.remove(&id) {
            Some(tx) => {
                tracing::debug!(%id, code = %message.code, "transaction completed");
                ResponseOutcome::Completed {
                    id,
                    server: tx.server,
                    kind: tx.kind,
                    response: message.clone(),
                }
            },
            None => ResponseOutcome::Unmatched,
        }
    }
}
