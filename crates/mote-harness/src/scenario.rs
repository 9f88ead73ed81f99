//! Scenario builder API.
//!
//! Declares servers, faults and a run length, and insists on an oracle: a
//! scenario cannot run without something that checks the final world.

use std::time::Duration;

use mote_core::{EngineConfig, MemoryStore, ServerAccount};

use crate::{Behavior, SimServer, Simulation};

/// Final-state check. Returns a description of what is wrong.
pub type OracleFn = Box<dyn Fn(&Simulation) -> Result<(), String>>;

/// Scenario builder.
pub struct Scenario {
    name: String,
    seed: u64,
    endpoint: String,
    config: EngineConfig,
    store: MemoryStore,
    accounts: Vec<ServerAccount>,
    servers: Vec<SimServer>,
    loss: f64,
    duration: Duration,
}

impl Scenario {
    /// Empty scenario: seed 0, default config, a store with a Device
    /// object, ten virtual minutes.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            seed: 0,
            endpoint: "mote-sim".to_string(),
            config: EngineConfig::default(),
            store: MemoryStore::with_device("mote", "sim"),
            accounts: Vec::new(),
            servers: Vec::new(),
            loss: 0.0,
            duration: Duration::from_secs(600),
        }
    }

    /// RNG seed for the engine and the network.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Endpoint client name.
    #[must_use]
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Initial resource store.
    #[must_use]
    pub fn store(mut self, store: MemoryStore) -> Self {
        self.store = store;
        self
    }

    /// Statically configured management server.
    #[must_use]
    pub fn server(mut self, account: ServerAccount, behavior: Behavior) -> Self {
        self.servers.push(SimServer::new(account.uri.clone(), behavior));
        self.accounts.push(account);
        self
    }

    /// Statically configured bootstrap server provisioning `provisioned`;
    /// each provisioned server is simulated with its behavior.
    #[must_use]
    pub fn bootstrap(mut self, uri: &str, provisioned: Vec<(ServerAccount, Behavior)>) -> Self {
        let accounts = provisioned.iter().map(|(a, _)| a.clone()).collect();
        self.servers.push(SimServer::bootstrap(uri, accounts));
        for (account, behavior) in provisioned {
            self.servers.push(SimServer::new(account.uri, behavior));
        }
        self.accounts.push(ServerAccount::bootstrap(uri));
        self
    }

    /// Random datagram loss in both directions.
    #[must_use]
    pub fn loss(mut self, rate: f64) -> Self {
        self.loss = rate;
        self
    }

    /// Virtual time to run for.
    #[must_use]
    pub fn run_for(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Set the oracle function and return a runnable scenario.
    pub fn oracle(self, oracle: OracleFn) -> RunnableScenario {
        RunnableScenario { scenario: self, oracle }
    }
}

/// A scenario with an oracle function that can be executed.
pub struct RunnableScenario {
    scenario: Scenario,
    oracle: OracleFn,
}

impl RunnableScenario {
    /// Build the world, run it, and hand the result to the oracle.
    pub fn run(self) -> Result<Simulation, String> {
        let Scenario { name, seed, endpoint, config, store, accounts, servers, loss, duration } =
            self.scenario;

        let mut sim = Simulation::new(seed, config, store)
            .map_err(|e| format!("Scenario '{name}': engine setup failed: {e}"))?;
        for server in servers {
            sim.add_server(server);
        }
        sim.network().set_loss(loss);
        sim.configure(&endpoint, &accounts)
            .map_err(|e| format!("Scenario '{name}': configure failed: {e}"))?;
        sim.run_for(duration).map_err(|e| format!("Scenario '{name}': step failed: {e}"))?;

        (self.oracle)(&sim).map_err(|e| format!("Scenario '{name}': {e}"))?;
        Ok(sim)
    }
}
