//! Server records and the server table.
//!
//! One [`ServerRecord`] per configured server, bootstrap server included
//! (under [`ServerAccount::BOOTSTRAP_SHORT_ID`]). The table is rebuilt from
//! the current account list by [`ServerTable::refresh`]: every record is
//! marked dirty, records whose account is still present are adopted again,
//! and whatever is still dirty afterwards is removed and handed back so the
//! caller can tear down its session, transactions, transfers and
//! observations in one go.

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use crate::{config::ServerAccount, transaction::TransactionId, transport::SessionId};

/// Registration status of one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerStatus {
    /// Not registered, nothing in flight.
    Deregistered,
    /// Register request in flight.
    RegistrationPending,
    /// Registered and within its lifetime.
    Registered,
    /// Registered, Update request in flight.
    UpdatePending,
    /// Registration was rejected, timed out, or its lifetime lapsed.
    RegistrationFailed,
    /// Deregister request in flight.
    DeregistrationPending,
    /// Bootstrap-Request in flight or bootstrap in progress.
    BootstrapPending,
    /// Bootstrap server sent Bootstrap-Finish.
    BootstrapFinished,
    /// Bootstrap-Request rejected or bootstrap timed out.
    BootstrapFailed,
}

impl ServerStatus {
    /// Holds a registration the server knows about.
    pub fn is_registered(self) -> bool {
        matches!(self, Self::Registered | Self::UpdatePending)
    }
}

/// State kept for one server.
#[derive(Debug, Clone)]
pub struct ServerRecord {
    /// Short server id; 0 for the bootstrap server.
    pub short_id: u16,
    /// Account this record was built from.
    pub account: ServerAccount,
    /// Transport session, once connected.
    pub session: Option<SessionId>,
    /// Current status.
    pub status: ServerStatus,
    /// Registration location assigned by the server (`Location-Path`).
    pub location: Vec<String>,
    /// When the current registration was last confirmed.
    pub refreshed_at: Option<Instant>,
    /// Register/Update/Deregister/Bootstrap-Request in flight.
    pub pending: Option<TransactionId>,
    /// An Update was asked for before it is due.
    pub update_requested: bool,
    dirty: bool,
}

impl ServerRecord {
    /// Fresh, deregistered record.
    pub fn new(account: ServerAccount) -> Self {
        Self {
            short_id: if account.bootstrap { ServerAccount::BOOTSTRAP_SHORT_ID } else { account.short_id },
            account,
            session: None,
            status: ServerStatus::Deregistered,
            location: Vec::new(),
            refreshed_at: None,
            pending: None,
            update_requested: false,
            dirty: false,
        }
    }

    /// This is the bootstrap server.
    pub fn is_bootstrap(&self) -> bool {
        self.account.bootstrap
    }

    /// Registration lifetime.
    pub fn lifetime(&self) -> Duration {
        self.account.lifetime
    }

    /// When the next Update is due: half the lifetime after the last
    /// confirmation, or immediately if one was requested.
    pub fn update_due(&self) -> Option<Instant> {
        if !self.status.is_registered() || self.pending.is_some() {
            return None;
        }
        let refreshed = self.refreshed_at?;
        if self.update_requested {
            return Some(refreshed);
        }
        Some(refreshed + self.lifetime() / 2)
    }

    /// When the registration lapses without a successful Update.
    pub fn expires_at(&self) -> Option<Instant> {
        if !self.status.is_registered() {
            return None;
        }
        self.refreshed_at.map(|t| t + self.lifetime())
    }

    /// Register succeeded.
    pub fn registered(&mut self, location: Vec<String>, now: Instant) {
        self.status = ServerStatus::Registered;
        self.location = location;
        self.refreshed_at = Some(now);
        self.pending = None;
        self.update_requested = false;
    }

    /// Update succeeded.
    pub fn refreshed(&mut self, now: Instant) {
        self.status = ServerStatus::Registered;
        self.refreshed_at = Some(now);
        self.pending = None;
        self.update_requested = false;
    }

    /// Registration (or Update) failed.
    pub fn failed(&mut self) {
        self.status = if self.is_bootstrap() {
            ServerStatus::BootstrapFailed
        } else {
            ServerStatus::RegistrationFailed
        };
        self.pending = None;
        self.refreshed_at = None;
        self.location.clear();
    }

    /// Back to the initial state, keeping the session.
    pub fn reset(&mut self) {
        self.status = ServerStatus::Deregistered;
        self.pending = None;
        self.refreshed_at = None;
        self.update_requested = false;
        self.location.clear();
    }

    /// Registration location as a path string (`/rd/5a3f`).
    pub fn location_path(&self) -> String {
        let mut path = String::new();
        for segment in &self.location {
            path.push('/');
            path.push_str(segment);
        }
        path
    }
}

/// Server records keyed by short server id.
#[derive(Debug, Clone, Default)]
pub struct ServerTable {
    records: BTreeMap<u16, ServerRecord>,
}

impl ServerTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the table from `accounts`, returning the records that were
    /// dropped.
    ///
    /// A record survives when an account with the same short id and URI is
    /// still present. A surviving record that had failed registration starts
    /// over as [`ServerStatus::Deregistered`]; a registered one whose
    /// lifetime or binding changed gets an Update requested.
    pub fn refresh(&mut self, accounts: &[ServerAccount]) -> Vec<ServerRecord> {
        for record in self.records.values_mut() {
            record.dirty = true;
        }

        let mut removed = Vec::new();
        for account in accounts {
            let short_id = if account.bootstrap { ServerAccount::BOOTSTRAP_SHORT_ID } else { account.short_id };

            match self.records.get_mut(&short_id) {
                Some(record) if record.dirty && record.account.uri == account.uri => {
                    record.dirty = false;
                    if record.status.is_registered()
                        && (record.account.lifetime != account.lifetime
                            || record.account.binding != account.binding)
                    {
                        record.update_requested = true;
                    }
                    if matches!(
                        record.status,
                        ServerStatus::RegistrationFailed | ServerStatus::BootstrapFailed
                    ) {
                        record.reset();
                    }
                    record.account = account.clone();
                },
                Some(record) if !record.dirty => {
                    tracing::warn!(short_id, "duplicate server account ignored");
                },
                _ => {
                    if let Some(old) = self.records.insert(short_id, ServerRecord::new(account.clone())) {
                        removed.push(old);
                    }
                },
            }
        }

        let dirty: Vec<u16> = self.records.iter().filter(|(_, r)| r.dirty).map(|(id, _)| *id).collect();
        for id in dirty {
            if let Some(record) = self.records.remove(&id) {
                removed.push(record);
            }
        }

        for record in &removed {
            tracing::debug!(short_id = record.short_id, uri = %record.account.uri, "server record dropped");
        }
        removed
    }

    /// Non-bootstrap servers.
    pub fn live_servers(&self) -> impl Iterator<Item = &ServerRecord> {
        self.records.values().filter(|r| !r.is_bootstrap())
    }

    /// The bootstrap server, if configured.
    pub fn bootstrap_server(&self) -> Option<&ServerRecord> {
        self.records.get(&ServerAccount::BOOTSTRAP_SHORT_ID).filter(|r| r.is_bootstrap())
    }

    /// The bootstrap server, mutably.
    pub fn bootstrap_server_mut(&mut self) -> Option<&mut ServerRecord> {
        self.records.get_mut(&ServerAccount::BOOTSTRAP_SHORT_ID).filter(|r| r.is_bootstrap())
    }

    /// Record by short id.
    pub fn get(&self, short_id: u16) -> Option<&ServerRecord> {
        self.records.get(&short_id)
    }

    /// Record by short id, mutably.
    pub fn get_mut(&mut self, short_id: u16) -> Option<&mut ServerRecord> {
        self.records.get_mut(&short_id)
    }

    /// Record owning `session`.
    pub fn by_session(&self, session: SessionId) -> Option<&ServerRecord> {
        self.records.values().find(|r| r.session == Some(session))
    }

    /// Short ids in ascending order.
    pub fn ids(&self) -> Vec<u16> {
        self.records.keys().copied().collect()
    }

    /// All records.
    pub fn iter(&self) -> impl Iterator<Item = &ServerRecord> {
        self.records.values()
    }

    /// Number of records, bootstrap included.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// No records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
