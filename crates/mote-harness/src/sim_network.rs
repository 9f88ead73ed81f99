//! In-memory datagram network between the client and simulated servers.
//!
//! Uplink datagrams (client to server) queue until the simulation hands them
//! to the addressed [`crate::SimServer`]; downlink datagrams queue per client
//! session until the engine polls its transport. Both directions pass the
//! same fault filter: seeded random loss, "drop the next n" counters, and
//! partitions per server URI.

use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet, VecDeque},
    rc::Rc,
};

use mote_core::{SessionId, Transport, TransportError};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Which way a datagram travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    /// Client to server.
    Uplink,
    /// Server to client.
    Downlink,
}

/// Datagram counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    /// Datagrams the client sent.
    pub uplink_sent: usize,
    /// Datagrams servers sent.
    pub downlink_sent: usize,
    /// Datagrams lost to faults.
    pub dropped: usize,
}

struct State {
    servers: BTreeSet<String>,
    sessions: BTreeMap<SessionId, String>,
    next_session: u64,
    uplink: VecDeque<(String, Vec<u8>)>,
    downlink: BTreeMap<SessionId, VecDeque<Vec<u8>>>,
    loss: f64,
    drop_uplink: usize,
    drop_downlink: usize,
    partitioned: BTreeSet<String>,
    rng: ChaCha8Rng,
    stats: NetworkStats,
}

impl State {
    fn lose(&mut self, link: Link, uri: &str) -> bool {
        let counter = match link {
            Link::Uplink => &mut self.drop_uplink,
            Link::Downlink => &mut self.drop_downlink,
        };
        let dropped = if *counter > 0 {
            *counter -= 1;
            true
        } else {
            self.partitioned.contains(uri) || (self.loss > 0.0 && self.rng.gen_bool(self.loss))
        };
        if dropped {
            self.stats.dropped += 1;
            tracing::trace!(?link, uri, "datagram dropped");
        }
        dropped
    }
}

/// Shared handle to the simulated network.
#[derive(Clone)]
pub struct SimNetwork {
    state: Rc<RefCell<State>>,
}

impl SimNetwork {
    /// Loss-free network; `seed` drives random loss once enabled.
    pub fn new(seed: u64) -> Self {
        Self {
            state: Rc::new(RefCell::new(State {
                servers: BTreeSet::new(),
                sessions: BTreeMap::new(),
                next_session: 1,
                uplink: VecDeque::new(),
                downlink: BTreeMap::new(),
                loss: 0.0,
                drop_uplink: 0,
                drop_downlink: 0,
                partitioned: BTreeSet::new(),
                rng: ChaCha8Rng::seed_from_u64(seed),
                stats: NetworkStats::default(),
            })),
        }
    }

    /// Make `uri` reachable.
    pub fn add_server(&self, uri: impl Into<String>) {
        self.state.borrow_mut().servers.insert(uri.into());
    }

    /// Client-side transport attached to this network.
    pub fn transport(&self) -> SimTransport {
        SimTransport { network: self.clone() }
    }

    /// Drop each datagram with probability `rate`, in both directions.
    pub fn set_loss(&self, rate: f64) {
        self.state.borrow_mut().loss = rate.clamp(0.0, 1.0);
    }

    /// Drop the next `count` datagrams on `link`.
    pub fn drop_next(&self, link: Link, count: usize) {
        let mut state = self.state.borrow_mut();
        match link {
            Link::Uplink => state.drop_uplink += count,
            Link::Downlink => state.drop_downlink += count,
        }
    }

    /// Cut `uri` off in both directions.
    pub fn partition(&self, uri: &str) {
        self.state.borrow_mut().partitioned.insert(uri.to_string());
    }

    /// Undo [`Self::partition`].
    pub fn heal(&self, uri: &str) {
        self.state.borrow_mut().partitioned.remove(uri);
    }

    /// Take every datagram in flight to servers, oldest first.
    pub fn take_uplink(&self) -> Vec<(String, Vec<u8>)> {
        self.state.borrow_mut().uplink.drain(..).collect()
    }

    /// Send a datagram from server `uri` to every client session open
    /// towards it.
    pub fn send_to_client(&self, uri: &str, datagram: Vec<u8>) {
        let mut state = self.state.borrow_mut();
        state.stats.downlink_sent += 1;
        if state.lose(Link::Downlink, uri) {
            return;
        }
        let sessions: Vec<SessionId> =
            state.sessions.iter().filter(|(_, u)| u.as_str() == uri).map(|(s, _)| *s).collect();
        for session in sessions {
            state.downlink.entry(session).or_default().push_back(datagram.clone());
        }
    }

    /// Datagrams waiting for the client.
    pub fn downlink_pending(&self) -> bool {
        self.state.borrow().downlink.values().any(|q| !q.is_empty())
    }

    /// Counters so far.
    pub fn stats(&self) -> NetworkStats {
        self.state.borrow().stats
    }
}

/// [`Transport`] end of a [`SimNetwork`].
#[derive(Clone)]
pub struct SimTransport {
    network: SimNetwork,
}

impl Transport for SimTransport {
    fn connect(&mut self, uri: &str) -> Result<SessionId, TransportError> {
        let mut state = self.network.state.borrow_mut();
        if !state.servers.contains(uri) {
            return Err(TransportError::Unreachable(uri.to_string()));
        }
        let session = SessionId(state.next_session);
        state.next_session += 1;
        state.sessions.insert(session, uri.to_string());
        Ok(session)
    }

    fn send(&mut self, session: SessionId, datagram: &[u8]) -> Result<usize, TransportError> {
        let mut state = self.network.state.borrow_mut();
        let uri = state.sessions.get(&session).cloned().ok_or(TransportError::UnknownSession(session))?;
        state.stats.uplink_sent += 1;
        if !state.lose(Link::Uplink, &uri) {
            state.uplink.push_back((uri, datagram.to_vec()));
        }
        Ok(datagram.len())
    }

    fn recv(&mut self, session: SessionId) -> Result<Option<Vec<u8>>, TransportError> {
        let mut state = self.network.state.borrow_mut();
        if !state.sessions.contains_key(&session) {
            return Err(TransportError::UnknownSession(session));
        }
        Ok(state.downlink.get_mut(&session).and_then(VecDeque::pop_front))
    }

    fn close(&mut self, session: SessionId) {
        let mut state = self.network.state.borrow_mut();
        state.sessions.remove(&session);
        state.downlink.remove(&session);
    }
}
