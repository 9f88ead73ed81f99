//! The step-driven LwM2M client engine.
//!
//! # Architecture
//!
//! [`Engine`] owns one of each core component and advances all of them from
//! a single entry point, [`Engine::step`]. A step runs, in order:
//!
//! 1. drain inbound datagrams from every open session
//! 2. retransmit or fail due transactions
//! 3. discard stale block transfers
//! 4. registration upkeep (Update at half the lifetime, expiry, bootstrap
//!    timeout)
//! 5. the controller, re-evaluated until it waits (at most
//!    [`MAX_REDISPATCH`] transitions)
//! 6. due observation notifications
//!
//! Every part sees the same `now`. The step never blocks: the transport is
//! polled, not awaited, and the caller sleeps for [`StepReport::next_wake`]
//! or until data arrives.
//!
//! Outcomes that arrive later than the call that caused them (registration
//! results, send results, observation changes) are queued as
//! [`EngineEvent`]s.

mod inbound;

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use bytes::Bytes;
use mote_core::{
    BlockReassembler, BootstrapProgress, BootstrapSession, ConfigError, Controller, Effect,
    EngineConfig, EngineState, Environment, Facts, MAX_REDISPATCH, ObservationKey,
    ObservationRegistry, ResourceStore, ResponseOutcome, ServerAccount, ServerRecord, ServerStatus,
    ServerTable, SessionId, TransactionEvent, TransactionId, TransactionKind, TransactionStore,
    Transition, Transport, UnavailableReason, Verdict,
};
use mote_proto::{Code, Message, MessageType, ResourcePath};

use self::inbound::ResponseCache;
use crate::{error::EngineError, event::EngineEvent, registration, scheduler::WakeSchedule};

/// Whether the engine can make progress on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineStatus {
    /// Working or waiting for a response or timer.
    Running,
    /// Stuck until [`Engine::reconfigure`] is called.
    ServiceUnavailable(UnavailableReason),
}

/// Result of one [`Engine::step`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    /// State after the step.
    pub state: EngineState,
    /// Transitions taken during the step, oldest first.
    pub transitions: Vec<Transition>,
    /// Whether progress is possible.
    pub status: EngineStatus,
    /// Call `step` again after at most this long.
    pub next_wake: Duration,
}

/// LwM2M client engine.
///
/// # Type Parameters
///
/// - `E`: time and randomness
/// - `T`: datagram transport
/// - `S`: object and resource storage
pub struct Engine<E: Environment, T: Transport, S: ResourceStore> {
    env: E,
    transport: T,
    store: S,
    config: EngineConfig,

    endpoint: Option<String>,
    accounts: Vec<ServerAccount>,

    controller: Controller,
    servers: ServerTable,
    transactions: TransactionStore,
    blocks: BlockReassembler,
    observations: ObservationRegistry,
    bootstrap: BootstrapSession,
    responses: ResponseCache,

    events: VecDeque<EngineEvent>,
    carried: Vec<Transition>,
    unavailable: Option<UnavailableReason>,
}

impl<E: Environment, T: Transport, S: ResourceStore> Engine<E, T, S> {
    /// Create an unconfigured engine.
    pub fn new(env: E, transport: T, store: S, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            transactions: TransactionStore::new(config.transmission.clone()),
            blocks: BlockReassembler::new(config.block.clone()),
            bootstrap: BootstrapSession::new(config.bootstrap_timeout),
            env,
            transport,
            store,
            config,
            endpoint: None,
            accounts: Vec::new(),
            controller: Controller::new(),
            servers: ServerTable::new(),
            observations: ObservationRegistry::new(),
            responses: ResponseCache::default(),
            events: VecDeque::new(),
            carried: Vec::new(),
            unavailable: None,
        })
    }

    /// One-time setup with the endpoint name and static server accounts.
    ///
    /// Accounts already provisioned in the store are adopted too, unless a
    /// static account uses the same short id.
    ///
    /// # Errors
    ///
    /// Fails with a configuration error if called twice (the first
    /// configuration stays in place), without accounts, or with an invalid
    /// or duplicate account.
    pub fn configure(
        &mut self,
        endpoint: impl Into<String>,
        accounts: &[ServerAccount],
    ) -> Result<(), EngineError> {
        if self.endpoint.is_some() {
            return Err(ConfigError::AlreadyConfigured.into());
        }
        let endpoint = endpoint.into();
        if endpoint.is_empty() {
            return Err(ConfigError::InvalidField {
                field: "endpoint",
                reason: "must not be empty".to_string(),
            }
            .into());
        }
        validate_accounts(accounts)?;

        self.accounts = merge_accounts(accounts.to_vec(), self.store.server_accounts());
        tracing::info!(%endpoint, accounts = self.accounts.len(), "engine configured");
        self.endpoint = Some(endpoint);
        Ok(())
    }

    /// Replace the server accounts and start over from `Initial`.
    ///
    /// Servers that are no longer listed are torn down on the next step.
    pub fn reconfigure(&mut self, accounts: &[ServerAccount]) -> Result<(), EngineError> {
        if self.endpoint.is_none() {
            return Err(ConfigError::NotConfigured.into());
        }
        validate_accounts(accounts)?;

        self.accounts = accounts.to_vec();
        self.bootstrap.reset();
        self.unavailable = None;
        if self.controller.state() != EngineState::Initial {
            let transition = self.controller.enter(EngineState::Initial);
            self.carried.push(transition);
        }
        Ok(())
    }

    /// Advance every component to `now`.
    ///
    /// # Errors
    ///
    /// Fails before `configure`, or when a Register or Bootstrap-Request
    /// cannot even be built or handed to a new session. The state is left
    /// where it was and the next step retries.
    pub fn step(&mut self, now: Instant) -> Result<StepReport, EngineError> {
        if self.endpoint.is_none() {
            return Err(ConfigError::NotConfigured.into());
        }
        let mut transitions = std::mem::take(&mut self.carried);

        self.poll_inbound(now);
        self.advance_transactions(now);
        self.expire_transfers(now);
        self.maintain_registrations(now);
        self.check_bootstrap(now);

        let status = match self.run_controller(now, &mut transitions) {
            Ok(status) => status,
            Err(err) => {
                self.carried = transitions;
                return Err(err);
            },
        };

        self.deliver_notifications(now);
        self.responses.purge(now);

        let next_wake = self.schedule(now).wait(self.config.clock_granularity, self.config.idle_wake);
        Ok(StepReport { state: self.controller.state(), transitions, status, next_wake })
    }

    /// Push application data to the server at `server_uri` (LwM2M Send).
    ///
    /// The outcome arrives later as [`EngineEvent::SendCompleted`] or
    /// [`EngineEvent::SendFailed`] carrying the returned id.
    pub fn submit_send(
        &mut self,
        server_uri: &str,
        payload: impl Into<Bytes>,
        now: Instant,
    ) -> Result<TransactionId, EngineError> {
        let record = self
            .servers
            .live_servers()
            .find(|r| r.account.uri == server_uri)
            .ok_or_else(|| EngineError::UnknownServer { uri: server_uri.to_string() })?;
        let short_id = record.short_id;
        let session = match (record.status.is_registered(), record.session) {
            (true, Some(session)) => session,
            _ => return Err(EngineError::NotRegistered { short_id }),
        };

        let id = self.submit(short_id, session, TransactionKind::Send, registration::send(payload.into()), true, now)?;
        tracing::debug!(server = short_id, %id, "send submitted");
        Ok(id)
    }

    /// Send De-register to every registered server. Returns how many
    /// requests went out.
    pub fn deregister_all(&mut self, now: Instant) -> Result<usize, EngineError> {
        let targets: Vec<(u16, SessionId, Message)> = self
            .servers
            .live_servers()
            .filter(|r| r.status.is_registered())
            .filter_map(|r| r.session.map(|s| (r.short_id, s, registration::deregister(&r.location))))
            .collect();

        let count = targets.len();
        for (short_id, session, message) in targets {
            if let Some(previous) = self.servers.get_mut(short_id).and_then(|r| r.pending.take()) {
                self.transactions.cancel(previous);
            }
            let id = self.submit(short_id, session, TransactionKind::Deregister, message, true, now)?;
            if let Some(record) = self.servers.get_mut(short_id) {
                record.status = ServerStatus::DeregistrationPending;
                record.pending = Some(id);
            }
            self.drop_observations(short_id);
            tracing::info!(server = short_id, "deregistering");
        }
        Ok(count)
    }

    /// Send a registration Update to `short_id` on the next step.
    pub fn request_update(&mut self, short_id: u16) -> Result<(), EngineError> {
        let record = self
            .servers
            .get_mut(short_id)
            .filter(|r| !r.is_bootstrap())
            .ok_or_else(|| EngineError::UnknownServer { uri: format!("short server id {short_id}") })?;
        if !record.status.is_registered() {
            return Err(EngineError::NotRegistered { short_id });
        }
        record.update_requested = true;
        Ok(())
    }

    /// Receive and retransmit only: no registration upkeep, no state
    /// changes. Used while shutting down.
    pub fn pump(&mut self, now: Instant) {
        self.poll_inbound(now);
        self.advance_transactions(now);
    }

    /// Take the queued events.
    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        self.events.drain(..).collect()
    }

    /// Current controller state.
    pub fn state(&self) -> EngineState {
        self.controller.state()
    }

    /// Endpoint name, once configured.
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Accounts the next refresh builds the server table from.
    pub fn accounts(&self) -> &[ServerAccount] {
        &self.accounts
    }

    /// Record of one server.
    pub fn server(&self, short_id: u16) -> Option<&ServerRecord> {
        self.servers.get(short_id)
    }

    /// All server records.
    pub fn servers(&self) -> &ServerTable {
        &self.servers
    }

    /// Outstanding transactions.
    pub fn transactions(&self) -> &TransactionStore {
        &self.transactions
    }

    /// Active observations.
    pub fn observations(&self) -> &ObservationRegistry {
        &self.observations
    }

    /// Block transfers in progress.
    pub fn blocks(&self) -> &BlockReassembler {
        &self.blocks
    }

    /// Resource store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Resource store, mutably (application-side value updates).
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Transport, mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Environment.
    pub fn env(&self) -> &E {
        &self.env
    }

    /// Configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn poll_inbound(&mut self, now: Instant) {
        let sessions: Vec<SessionId> = self.servers.iter().filter_map(|r| r.session).collect();
        for session in sessions {
            loop {
                match self.transport.recv(session) {
                    Ok(Some(datagram)) => self.handle_datagram(session, &datagram, now),
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(%session, %err, "receive failed");
                        break;
                    },
                }
            }
        }
    }

    fn advance_transactions(&mut self, now: Instant) {
        for event in self.transactions.on_tick(now) {
            match event {
                TransactionEvent::Retransmit { session, datagram, .. } => {
                    self.send_datagram(session, &datagram);
                },
                TransactionEvent::TimedOut { id, server, kind, confirmable } => {
                    let reason = if confirmable {
                        "no response after retransmissions"
                    } else {
                        "no response"
                    };
                    self.on_failure(id, server, kind, confirmable, reason);
                },
            }
        }
    }

    fn expire_transfers(&mut self, now: Instant) {
        for key in self.blocks.expire(now) {
            tracing::debug!(server = key.server, path = %key.path, "stale block transfer discarded");
        }
    }

    fn maintain_registrations(&mut self, now: Instant) {
        let ids: Vec<u16> = self.servers.live_servers().map(|r| r.short_id).collect();
        for short_id in ids {
            let Some(record) = self.servers.get_mut(short_id) else { continue };

            if record.expires_at().is_some_and(|t| now >= t) {
                if let Some(pending) = record.pending.take() {
                    self.transactions.cancel(pending);
                }
                record.failed();
                tracing::warn!(server = short_id, "registration lifetime expired");
                self.events.push_back(EngineEvent::RegistrationFailed {
                    server: short_id,
                    reason: "lifetime expired".to_string(),
                });
                self.drop_observations(short_id);
                continue;
            }

            if record.update_due().is_some_and(|t| now >= t) {
                if let Err(err) = self.send_update(short_id, now) {
                    tracing::warn!(server = short_id, %err, "registration update not sent");
                }
            }
        }
    }

    fn send_update(&mut self, short_id: u16, now: Instant) -> Result<(), EngineError> {
        let (session, message) = {
            let record = self.servers.get(short_id).ok_or_else(|| EngineError::UnknownServer {
                uri: format!("short server id {short_id}"),
            })?;
            let session = record.session.ok_or(EngineError::NotRegistered { short_id })?;
            (session, registration::update(&record.location, &record.account, record.update_requested))
        };

        let id = self.submit(short_id, session, TransactionKind::Update, message, true, now)?;
        if let Some(record) = self.servers.get_mut(short_id) {
            record.status = ServerStatus::UpdatePending;
            record.pending = Some(id);
        }
        tracing::debug!(server = short_id, %id, "registration update sent");
        Ok(())
    }

    fn check_bootstrap(&mut self, now: Instant) {
        if !self.bootstrap.is_running() {
            return;
        }
        if let BootstrapProgress::Failed(reason) = self.bootstrap.poll(now) {
            self.bootstrap_failed(reason);
        }
    }

    fn bootstrap_failed(&mut self, reason: String) {
        if let Some(record) = self.servers.bootstrap_server_mut() {
            if let Some(pending) = record.pending.take() {
                self.transactions.cancel(pending);
            }
            record.failed();
        }
        self.events.push_back(EngineEvent::BootstrapFailed { reason });
    }

    fn run_controller(
        &mut self,
        now: Instant,
        transitions: &mut Vec<Transition>,
    ) -> Result<EngineStatus, EngineError> {
        for _ in 0..MAX_REDISPATCH {
            if self.controller.state() == EngineState::Initial {
                self.refresh_servers();
            }

            let facts = self.facts(now);
            match self.controller.evaluate(&facts) {
                Verdict::Hold => {
                    self.unavailable = None;
                    return Ok(EngineStatus::Running);
                },
                Verdict::Unavailable(reason) => {
                    if self.unavailable.as_ref() != Some(&reason) {
                        tracing::warn!(%reason, "service unavailable");
                    }
                    self.unavailable = Some(reason.clone());
                    return Ok(EngineStatus::ServiceUnavailable(reason));
                },
                Verdict::Advance { to, effect } => {
                    self.perform(effect, now)?;
                    transitions.push(self.controller.enter(to));
                },
            }
        }

        tracing::warn!(state = %self.controller.state(), "state machine still moving after redispatch limit");
        Ok(EngineStatus::Running)
    }

    fn facts(&mut self, now: Instant) -> Facts {
        let live: Vec<ServerStatus> = self.servers.live_servers().map(|r| r.status).collect();
        Facts {
            live_servers: live.len(),
            bootstrap_server: self.servers.bootstrap_server().is_some(),
            bootstrap: self.bootstrap.poll(now),
            all_registered: !live.is_empty() && live.iter().all(|s| s.is_registered()),
            any_failed: live.contains(&ServerStatus::RegistrationFailed),
        }
    }

    fn perform(&mut self, effect: Effect, now: Instant) -> Result<(), EngineError> {
        match effect {
            Effect::None => Ok(()),
            Effect::StartBootstrap => self.start_bootstrap(now),
            Effect::RegisterAll => self.register_all(now),
        }
    }

    fn refresh_servers(&mut self) {
        let removed = self.servers.refresh(&self.accounts);
        for record in removed {
            self.tear_down(record);
        }
        self.bootstrap.reset();
    }

    /// Drop everything scoped to a removed server in one go.
    fn tear_down(&mut self, record: ServerRecord) {
        let short_id = record.short_id;
        let transactions = self.transactions.cancel_server(short_id);
        let transfers = self.blocks.discard_server(short_id);
        let observations = self.observations.cancel_server(short_id);
        if let Some(session) = record.session {
            self.responses.forget_session(session);
            self.transport.close(session);
        }
        tracing::info!(server = short_id, transactions, transfers, observations, "server removed");
    }

    fn start_bootstrap(&mut self, now: Instant) -> Result<(), EngineError> {
        let short_id = ServerAccount::BOOTSTRAP_SHORT_ID;
        let session = self.ensure_session(short_id)?;
        let message = registration::bootstrap_request(self.endpoint.as_deref().unwrap_or_default());

        let id = self.submit(short_id, session, TransactionKind::BootstrapRequest, message, true, now)?;
        if let Some(record) = self.servers.bootstrap_server_mut() {
            record.status = ServerStatus::BootstrapPending;
            record.pending = Some(id);
        }
        self.bootstrap.start(now);
        tracing::info!(%session, "bootstrap requested");
        Ok(())
    }

    fn register_all(&mut self, now: Instant) -> Result<(), EngineError> {
        let endpoint = self.endpoint.clone().unwrap_or_default();
        let links = self.store.object_links();
        let ids: Vec<u16> = self
            .servers
            .live_servers()
            .filter(|r| r.status == ServerStatus::Deregistered && r.pending.is_none())
            .map(|r| r.short_id)
            .collect();

        for short_id in ids {
            let session = self.ensure_session(short_id)?;
            let Some(record) = self.servers.get(short_id) else { continue };
            let message =
                registration::register(&endpoint, &record.account, &self.config.lwm2m_version, &links);

            let id = self.submit(short_id, session, TransactionKind::Register, message, true, now)?;
            if let Some(record) = self.servers.get_mut(short_id) {
                record.status = ServerStatus::RegistrationPending;
                record.pending = Some(id);
            }
            tracing::info!(server = short_id, %session, "registering");
        }
        Ok(())
    }

    fn ensure_session(&mut self, short_id: u16) -> Result<SessionId, EngineError> {
        let record = self.servers.get_mut(short_id).ok_or_else(|| EngineError::UnknownServer {
            uri: format!("short server id {short_id}"),
        })?;
        if let Some(session) = record.session {
            return Ok(session);
        }
        let session = self.transport.connect(&record.account.uri)?;
        tracing::debug!(server = short_id, uri = %record.account.uri, %session, "session opened");
        record.session = Some(session);
        Ok(session)
    }

    fn submit(
        &mut self,
        server: u16,
        session: SessionId,
        kind: TransactionKind,
        message: Message,
        confirmable: bool,
        now: Instant,
    ) -> Result<TransactionId, EngineError> {
        let (id, datagram) =
            self.transactions.create(server, session, kind, message, confirmable, now, &self.env)?;
        self.send_datagram(session, &datagram);
        Ok(id)
    }

    /// Send errors are not fatal: confirmables are resent by the
    /// transaction store, everything else is best effort.
    fn send_datagram(&mut self, session: SessionId, datagram: &[u8]) {
        if let Err(err) = self.transport.send(session, datagram) {
            tracing::warn!(%session, %err, "send failed");
        }
    }

    fn deliver_notifications(&mut self, now: Instant) {
        for notification in self.observations.on_tick(now, &self.store) {
            let server = notification.key.server;
            let Some(record) = self.servers.get(server) else { continue };
            let Some(session) = record.session.filter(|_| record.status.is_registered()) else {
                continue;
            };
            let confirmable = record.account.confirmable_notifications;

            let mut message = Message::request(
                MessageType::NonConfirmable,
                Code::CONTENT,
                0,
                notification.token.clone(),
            );
            message.set_observe(notification.counter);
            message.set_content_format(notification.value.format);
            let message = message.with_payload(notification.value.bytes.clone());
            let kind = TransactionKind::Notification { path: notification.key.path.clone() };

            match self.submit(server, session, kind, message, confirmable, now) {
                Ok(_) => self.observations.record_notification(&notification, now),
                Err(err) => {
                    tracing::warn!(server, path = %notification.key.path, %err, "notification not sent");
                },
            }
        }
    }

    fn schedule(&self, now: Instant) -> WakeSchedule {
        let mut schedule = WakeSchedule::new(now);
        schedule.consider(self.transactions.next_deadline());
        schedule.consider(self.blocks.next_deadline());
        schedule.consider(self.observations.next_deadline());
        schedule.consider(self.bootstrap.next_deadline());
        for record in self.servers.live_servers() {
            schedule.consider(record.update_due());
            schedule.consider(record.expires_at());
        }
        schedule
    }

    fn drop_observations(&mut self, server: u16) {
        for key in self.observations.cancel_within(server, &ResourcePath::root()) {
            self.events.push_back(EngineEvent::ObservationCancelled { server, path: key.path });
        }
    }

    /// Dispatch a matched response, reset, or empty ACK.
    fn on_outcome(&mut self, outcome: ResponseOutcome, now: Instant) {
        match outcome {
            ResponseOutcome::Completed { id, server, kind, response } => {
                self.on_response(id, server, kind, &response, now);
            },
            ResponseOutcome::Reset { id, server, kind } => {
                self.on_failure(id, server, kind, true, "reset by peer");
            },
            ResponseOutcome::Acknowledged { id } => {
                tracing::debug!(%id, "request acknowledged, response to follow");
            },
            ResponseOutcome::Unmatched => {},
        }
    }

    fn on_response(
        &mut self,
        id: TransactionId,
        server: u16,
        kind: TransactionKind,
        response: &Message,
        now: Instant,
    ) {
        match kind {
            TransactionKind::Register => {
                let Some(record) = self.servers.get_mut(server).filter(|r| r.pending == Some(id)) else {
                    return;
                };
                let location = registration::location_of(response);
                if response.code == Code::CREATED && !location.is_empty() {
                    record.registered(location, now);
                    let location = record.location_path();
                    tracing::info!(server, %location, "registered");
                    self.events.push_back(EngineEvent::Registered { server, location });
                } else {
                    record.failed();
                    let reason = if response.code == Code::CREATED {
                        "register response without location".to_string()
                    } else {
                        format!("register rejected with {}", response.code)
                    };
                    tracing::warn!(server, %reason, "registration failed");
                    self.events.push_back(EngineEvent::RegistrationFailed { server, reason });
                }
            },

            TransactionKind::Update => {
                let Some(record) = self.servers.get_mut(server).filter(|r| r.pending == Some(id)) else {
                    return;
                };
                if response.code == Code::CHANGED {
                    record.refreshed(now);
                    self.events.push_back(EngineEvent::RegistrationUpdated { server });
                } else {
                    record.failed();
                    let reason = format!("update rejected with {}", response.code);
                    tracing::warn!(server, %reason, "registration lost");
                    self.events.push_back(EngineEvent::RegistrationFailed { server, reason });
                    self.drop_observations(server);
                }
            },

            TransactionKind::Deregister => self.deregistered(id, server),

            TransactionKind::BootstrapRequest => {
                if response.code == Code::CHANGED {
                    if let Some(record) = self.servers.bootstrap_server_mut() {
                        record.pending = None;
                    }
                    self.bootstrap.acknowledged(now);
                    tracing::info!("bootstrap request accepted");
                } else {
                    let reason = format!("bootstrap request rejected with {}", response.code);
                    self.bootstrap.fail(reason.clone());
                    self.bootstrap_failed(reason);
                }
            },

            TransactionKind::Notification { .. } => {},

            TransactionKind::Send => {
                if response.code.is_success() {
                    self.events.push_back(EngineEvent::SendCompleted { id });
                } else {
                    let reason = format!("send rejected with {}", response.code);
                    self.events.push_back(EngineEvent::SendFailed { id, reason });
                }
            },
        }
    }

    fn on_failure(
        &mut self,
        id: TransactionId,
        server: u16,
        kind: TransactionKind,
        confirmable: bool,
        reason: &str,
    ) {
        match kind {
            TransactionKind::Register | TransactionKind::Update => {
                let Some(record) = self.servers.get_mut(server).filter(|r| r.pending == Some(id)) else {
                    return;
                };
                record.failed();
                tracing::warn!(server, %reason, "registration failed");
                self.events.push_back(EngineEvent::RegistrationFailed { server, reason: reason.to_string() });
                self.drop_observations(server);
            },

            TransactionKind::Deregister => self.deregistered(id, server),

            TransactionKind::BootstrapRequest => {
                if self.bootstrap.is_running() {
                    self.bootstrap.fail(reason);
                    self.bootstrap_failed(format!("bootstrap request failed: {reason}"));
                }
            },

            TransactionKind::Notification { path } => {
                // An unanswered NON notification is the normal case.
                if confirmable {
                    let key = ObservationKey::new(server, path.clone());
                    if self.observations.cancel(&key) {
                        tracing::debug!(server, %path, %reason, "observation dropped");
                        self.events.push_back(EngineEvent::ObservationCancelled { server, path });
                    }
                }
            },

            TransactionKind::Send => {
                self.events.push_back(EngineEvent::SendFailed { id, reason: reason.to_string() });
            },
        }
    }

    fn deregistered(&mut self, id: TransactionId, server: u16) {
        let Some(record) = self.servers.get_mut(server).filter(|r| r.pending == Some(id)) else {
            return;
        };
        record.reset();
        tracing::info!(server, "deregistered");
        self.events.push_back(EngineEvent::Deregistered { server });
    }
}

fn account_key(account: &ServerAccount) -> u16 {
    if account.bootstrap { ServerAccount::BOOTSTRAP_SHORT_ID } else { account.short_id }
}

fn validate_accounts(accounts: &[ServerAccount]) -> Result<(), ConfigError> {
    if accounts.is_empty() {
        return Err(ConfigError::NoAccounts);
    }
    let mut seen = Vec::with_capacity(accounts.len());
    for account in accounts {
        account.validate()?;
        let key = account_key(account);
        if seen.contains(&key) {
            return Err(ConfigError::DuplicateShortId(key));
        }
        seen.push(key);
    }
    Ok(())
}

/// `primary` plus every account of `extra` whose short id is not taken.
fn merge_accounts(mut primary: Vec<ServerAccount>, extra: Vec<ServerAccount>) -> Vec<ServerAccount> {
    for account in extra {
        let key = account_key(&account);
        if !primary.iter().any(|a| account_key(a) == key) {
            primary.push(account);
        }
    }
    primary
}
