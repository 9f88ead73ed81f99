//! Drives one engine against simulated servers on virtual time.

use std::{collections::BTreeMap, time::Duration};

use mote_client::{Engine, EngineError, EngineEvent, StepReport};
use mote_core::{EngineConfig, Environment, MemoryStore, ServerAccount, Transition};

use crate::{SimEnv, SimNetwork, SimServer, SimTransport};

/// Steps taken at one instant while datagrams keep bouncing.
const MAX_STEPS_PER_INSTANT: usize = 64;

/// Client engine, network and servers under one virtual clock.
pub struct Simulation {
    env: SimEnv,
    network: SimNetwork,
    engine: Engine<SimEnv, SimTransport, MemoryStore>,
    servers: BTreeMap<String, SimServer>,
    events: Vec<EngineEvent>,
    transitions: Vec<Transition>,
    last_report: Option<StepReport>,
}

impl Simulation {
    /// Unconfigured engine over an empty network.
    pub fn new(seed: u64, config: EngineConfig, store: MemoryStore) -> Result<Self, EngineError> {
        let env = SimEnv::with_seed(seed);
        let network = SimNetwork::new(seed.rotate_left(17));
        let engine = Engine::new(env.clone(), network.transport(), store, config)?;
        Ok(Self {
            env,
            network,
            engine,
            servers: BTreeMap::new(),
            events: Vec::new(),
            transitions: Vec::new(),
            last_report: None,
        })
    }

    /// Attach a server to the network.
    pub fn add_server(&mut self, server: SimServer) {
        self.network.add_server(server.uri());
        self.servers.insert(server.uri().to_string(), server);
    }

    /// Configure the engine.
    pub fn configure(&mut self, endpoint: &str, accounts: &[ServerAccount]) -> Result<(), EngineError> {
        self.engine.configure(endpoint, accounts)
    }

    /// One engine step at the current virtual time, then let every server
    /// answer what it received.
    pub fn step(&mut self) -> Result<StepReport, EngineError> {
        let report = self.engine.step(self.env.now())?;
        self.transitions.extend(report.transitions.iter().cloned());
        self.events.extend(self.engine.drain_events());
        self.exchange();
        self.last_report = Some(report.clone());
        Ok(report)
    }

    /// Run until `duration` of virtual time has passed, sleeping for each
    /// step's `next_wake` in between.
    pub fn run_for(&mut self, duration: Duration) -> Result<(), EngineError> {
        let end = self.env.elapsed() + duration;
        self.run_while(end, |_| true).map(|_| ())
    }

    /// Run until `done` holds or `limit` of virtual time has passed.
    /// Returns whether `done` was reached.
    pub fn run_until(
        &mut self,
        limit: Duration,
        done: impl Fn(&Self) -> bool,
    ) -> Result<bool, EngineError> {
        let end = self.env.elapsed() + limit;
        self.run_while(end, |sim| !done(sim))?;
        Ok(done(self))
    }

    fn run_while(&mut self, end: Duration, keep_going: impl Fn(&Self) -> bool) -> Result<(), EngineError> {
        let mut same_instant = 0;
        loop {
            let report = self.step()?;
            if !keep_going(self) {
                return Ok(());
            }
            if self.network.downlink_pending() && same_instant < MAX_STEPS_PER_INSTANT {
                same_instant += 1;
                continue;
            }
            same_instant = 0;

            let now = self.env.elapsed();
            if now >= end {
                return Ok(());
            }
            self.env.advance(report.next_wake.min(end - now));
        }
    }

    fn exchange(&mut self) {
        for (uri, datagram) in self.network.take_uplink() {
            match self.servers.get_mut(&uri) {
                Some(server) => server.handle(&datagram),
                None => tracing::debug!(%uri, "datagram for absent server"),
            }
        }
        for (uri, server) in &mut self.servers {
            for datagram in server.take_outbox() {
                self.network.send_to_client(uri, datagram);
            }
        }
    }

    /// The engine under test.
    pub fn engine(&self) -> &Engine<SimEnv, SimTransport, MemoryStore> {
        &self.engine
    }

    /// The engine under test, mutably.
    pub fn engine_mut(&mut self) -> &mut Engine<SimEnv, SimTransport, MemoryStore> {
        &mut self.engine
    }

    /// Resource store of the engine.
    pub fn store_mut(&mut self) -> &mut MemoryStore {
        self.engine.store_mut()
    }

    /// Server at `uri`.
    pub fn server(&self, uri: &str) -> Option<&SimServer> {
        self.servers.get(uri)
    }

    /// Server at `uri`, mutably.
    pub fn server_mut(&mut self, uri: &str) -> Option<&mut SimServer> {
        self.servers.get_mut(uri)
    }

    /// The network.
    pub fn network(&self) -> &SimNetwork {
        &self.network
    }

    /// The environment.
    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    /// Virtual time elapsed.
    pub fn elapsed(&self) -> Duration {
        self.env.elapsed()
    }

    /// Every event drained so far, oldest first.
    pub fn events(&self) -> &[EngineEvent] {
        &self.events
    }

    /// Every state transition so far, oldest first.
    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Report of the most recent step.
    pub fn last_report(&self) -> Option<&StepReport> {
        self.last_report.as_ref()
    }
}
