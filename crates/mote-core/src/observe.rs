//! Observation registry and notification scheduling.
//!
//! An observation is keyed by (server, path). Its notification attributes
//! (`pmin`, `pmax`, `gt`, `lt`, `st`) come from Write-Attributes and are
//! inherited down the object tree: an attribute set on `/3/0` applies to an
//! observation of `/3/0/9` unless `/3/0/9` sets its own.
//!
//! A notification is due when
//!
//! - `pmax` has elapsed since the last one, whatever the value, or
//! - `pmin` has elapsed and the value changed (beyond `gt`/`lt`/`st` for
//!   numeric values with thresholds, any byte difference otherwise).
//!
//! A change seen before `pmin` has elapsed is remembered so the next wake is
//! scheduled for the end of `pmin` instead of `pmax`.

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use mote_proto::{ResourcePath, Token};

use crate::storage::{ResourceStore, ResourceValue};

/// Identifies one observation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObservationKey {
    /// Observing server.
    pub server: u16,
    /// Observed path.
    pub path: ResourcePath,
}

impl ObservationKey {
    /// Build a key.
    pub fn new(server: u16, path: ResourcePath) -> Self {
        Self { server, path }
    }
}

/// Notification attributes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes {
    /// Minimum period between notifications.
    pub pmin: Option<Duration>,
    /// Maximum period without a notification.
    pub pmax: Option<Duration>,
    /// Notify when the value crosses above or below this.
    pub gt: Option<f64>,
    /// Notify when the value crosses below or above this.
    pub lt: Option<f64>,
    /// Notify when the value moved at least this far.
    pub st: Option<f64>,
}

impl Attributes {
    /// Apply Write-Attributes query parameters (`pmin=10`, `st=0.5`, or a
    /// bare `gt` to clear). Returns `false` and leaves `self` untouched if
    /// any parameter is unknown or malformed.
    pub fn apply_query<S: AsRef<str>>(&mut self, queries: &[S]) -> bool {
        let mut next = self.clone();
        for query in queries {
            let query = query.as_ref();
            let (key, value) = match query.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (query, None),
            };
            let ok = match key {
                "pmin" => set_seconds(&mut next.pmin, value),
                "pmax" => set_seconds(&mut next.pmax, value),
                "gt" => set_number(&mut next.gt, value),
                "lt" => set_number(&mut next.lt, value),
                "st" => set_number(&mut next.st, value),
                _ => false,
            };
            if !ok {
                return false;
            }
        }

        if let (Some(gt), Some(lt)) = (next.gt, next.lt) {
            if lt >= gt {
                return false;
            }
        }
        if next.st.is_some_and(|st| st < 0.0) {
            return false;
        }

        *self = next;
        true
    }

    fn fill_from(&mut self, parent: &Self) {
        self.pmin = self.pmin.or(parent.pmin);
        self.pmax = self.pmax.or(parent.pmax);
        self.gt = self.gt.or(parent.gt);
        self.lt = self.lt.or(parent.lt);
        self.st = self.st.or(parent.st);
    }

    fn has_thresholds(&self) -> bool {
        self.gt.is_some() || self.lt.is_some() || self.st.is_some()
    }

    /// `new` differs from `old` enough to notify.
    fn changed(&self, old: &ResourceValue, new: &ResourceValue) -> bool {
        match (old.numeric, new.numeric) {
            (Some(a), Some(b)) if self.has_thresholds() => {
                let crossed = |threshold: f64| (a > threshold) != (b > threshold);
                self.st.is_some_and(|st| (b - a).abs() >= st)
                    || self.gt.is_some_and(crossed)
                    || self.lt.is_some_and(crossed)
            },
            _ => old.bytes != new.bytes,
        }
    }
}

fn set_seconds(slot: &mut Option<Duration>, value: Option<&str>) -> bool {
    match value {
        None => {
            *slot = None;
            true
        },
        Some(v) => match v.parse::<u64>() {
            Ok(secs) => {
                *slot = Some(Duration::from_secs(secs));
                true
            },
            Err(_) => false,
        },
    }
}

fn set_number(slot: &mut Option<f64>, value: Option<&str>) -> bool {
    match value {
        None => {
            *slot = None;
            true
        },
        Some(v) => match v.parse::<f64>() {
            Ok(n) if n.is_finite() => {
                *slot = Some(n);
                true
            },
            _ => false,
        },
    }
}

/// A notification the engine should send now.
#[derive(Debug, Clone, PartialEq)]
pub struct DueNotification {
    /// Which observation.
    pub key: ObservationKey,
    /// Token the server used when it started observing.
    pub token: Token,
    /// Current value.
    pub value: ResourceValue,
    /// Observe sequence number to send (already incremented).
    pub counter: u32,
}

#[derive(Debug, Clone)]
struct Observation {
    token: Token,
    last_sent: Instant,
    last_value: ResourceValue,
    counter: u32,
    pending_change: bool,
}

/// All active observations and per-path attributes.
#[derive(Debug, Clone, Default)]
pub struct ObservationRegistry {
    observations: BTreeMap<ObservationKey, Observation>,
    attributes: BTreeMap<ObservationKey, Attributes>,
}

impl ObservationRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) observing. `value` is what the registration
    /// response carries. Returns the Observe sequence number for that
    /// response.
    pub fn observe(&mut self, key: ObservationKey, token: Token, value: ResourceValue, now: Instant) -> u32 {
        let counter = self.observations.get(&key).map_or(0, |o| o.counter + 1);
        tracing::debug!(server = key.server, path = %key.path, %token, "observation started");
        self.observations.insert(key, Observation {
            token,
            last_sent: now,
            last_value: value,
            counter,
            pending_change: false,
        });
        counter
    }

    /// Stop observing.
    pub fn cancel(&mut self, key: &ObservationKey) -> bool {
        let removed = self.observations.remove(key).is_some();
        if removed {
            tracing::debug!(server = key.server, path = %key.path, "observation cancelled");
        }
        removed
    }

    /// Drop observations of `server` at or below `path`.
    pub fn cancel_within(&mut self, server: u16, path: &ResourcePath) -> Vec<ObservationKey> {
        let keys: Vec<ObservationKey> = self
            .observations
            .keys()
            .filter(|k| k.server == server && path.contains(&k.path))
            .cloned()
            .collect();
        for key in &keys {
            self.observations.remove(key);
        }
        keys
    }

    /// Drop everything belonging to `server`.
    pub fn cancel_server(&mut self, server: u16) -> usize {
        let before = self.observations.len();
        self.observations.retain(|k, _| k.server != server);
        self.attributes.retain(|k, _| k.server != server);
        before - self.observations.len()
    }

    /// Apply Write-Attributes to `key`. Returns `false` on a malformed query.
    pub fn write_attributes<S: AsRef<str>>(&mut self, key: ObservationKey, queries: &[S]) -> bool {
        let mut attributes = self.attributes.get(&key).cloned().unwrap_or_default();
        if !attributes.apply_query(queries) {
            return false;
        }
        if attributes == Attributes::default() {
            self.attributes.remove(&key);
        } else {
            self.attributes.insert(key, attributes);
        }
        true
    }

    /// Attributes in effect for `key`, inherited from parent paths.
    pub fn effective_attributes(&self, key: &ObservationKey) -> Attributes {
        effective(&self.attributes, key)
    }

    /// Collect notifications due at `now`.
    ///
    /// Nothing is committed: call [`Self::record_notification`] once the
    /// notification has been handed to the transaction store.
    pub fn on_tick(&mut self, now: Instant, store: &impl ResourceStore) -> Vec<DueNotification> {
        let mut due = Vec::new();

        for (key, obs) in &mut self.observations {
            let attributes = effective(&self.attributes, key);
            let pmin = attributes.pmin.unwrap_or(Duration::ZERO);
            let pmax = attributes.pmax.map(|p| p.max(pmin));
            let elapsed = now.saturating_duration_since(obs.last_sent);

            let value = match store.read(&key.path) {
                Ok(value) => value,
                Err(err) => {
                    tracing::debug!(path = %key.path, %err, "observed resource unreadable");
                    continue;
                },
            };

            let max_due = pmax.is_some_and(|p| elapsed >= p);
            let changed = obs.pending_change || attributes.changed(&obs.last_value, &value);

            if max_due || (changed && elapsed >= pmin) {
                due.push(DueNotification {
                    key: key.clone(),
                    token: obs.token.clone(),
                    value,
                    counter: obs.counter + 1,
                });
            } else if changed {
                obs.pending_change = true;
            }
        }

        due
    }

    /// Commit a notification that was accepted for sending.
    pub fn record_notification(&mut self, notification: &DueNotification, now: Instant) {
        if let Some(obs) = self.observations.get_mut(&notification.key) {
            obs.last_sent = now;
            obs.last_value = notification.value.clone();
            obs.counter = notification.counter;
            obs.pending_change = false;
        }
    }

    /// Earliest `pmax` expiry or end of `pmin` for a pending change.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.observations
            .iter()
            .filter_map(|(key, obs)| {
                let attributes = effective(&self.attributes, key);
                let pmin = attributes.pmin.unwrap_or(Duration::ZERO);
                let max = attributes.pmax.map(|p| obs.last_sent + p.max(pmin));
                let min = obs.pending_change.then(|| obs.last_sent + pmin);
                match (max, min) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                }
            })
            .min()
    }

    /// Last committed sequence number of `key`.
    pub fn counter(&self, key: &ObservationKey) -> Option<u32> {
        self.observations.get(key).map(|o| o.counter)
    }

    /// Token of `key`.
    pub fn token(&self, key: &ObservationKey) -> Option<&Token> {
        self.observations.get(key).map(|o| &o.token)
    }

    /// `key` is being observed.
    pub fn contains(&self, key: &ObservationKey) -> bool {
        self.observations.contains_key(key)
    }

    /// Active observations.
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    /// No active observations.
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }
}

fn effective(attributes: &BTreeMap<ObservationKey, Attributes>, key: &ObservationKey) -> Attributes {
    let mut result = Attributes::default();
    let segments = key.path.segments();
    for depth in (1..=segments.len()).rev() {
        let Ok(path) = ResourcePath::new(&segments[..depth]) else { continue };
        if let Some(set) = attributes.get(&ObservationKey::new(key.server, path)) {
            result.fill_from(set);
        }
    }
    result
}
