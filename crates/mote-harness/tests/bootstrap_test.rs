//! Bootstrap flows over the simulated network.

use std::time::Duration;

use mote_client::{EngineEvent, EngineStatus};
use mote_core::{
    EngineConfig, EngineState, MemoryStore, ResourceStore, ServerAccount, Transition,
    UnavailableReason,
};
use mote_harness::{Behavior, Scenario, SimServer, Simulation};
use mote_proto::{Code, ResourcePath};

const BS: &str = "coap://bs.example";
const DM: &str = "coap://dm.example";

fn events_of(sim: &Simulation) -> Vec<&EngineEvent> {
    sim.events().iter().collect()
}

#[test]
fn provisioning_leads_to_registration() {
    let provisioned = ServerAccount::server(101, DM).with_lifetime(Duration::from_secs(300));

    let sim = Scenario::new("bootstrap")
        .bootstrap(BS, vec![(provisioned, Behavior::Accept)])
        .run_for(Duration::from_secs(30))
        .oracle(Box::new(|sim| {
            if sim.engine().state() != EngineState::Ready {
                return Err(format!("expected ready, got {}", sim.engine().state()));
            }
            let events = events_of(sim);
            let finished = events.iter().position(|e| **e == EngineEvent::BootstrapFinished);
            let registered =
                events.iter().position(|e| matches!(e, EngineEvent::Registered { server: 101, .. }));
            match (finished, registered) {
                (Some(f), Some(r)) if f < r => Ok(()),
                _ => Err(format!("unexpected event order {events:?}")),
            }
        }))
        .run()
        .unwrap();

    let bs = sim.server(BS).unwrap();
    assert_eq!(bs.requests().len(), 1);
    assert_eq!(bs.requests()[0].uri_path_segments(), vec!["bs"]);
    assert!(bs.requests()[0].uri_query().iter().any(|q| q == "ep=mote-sim"));

    let dm = sim.server(DM).unwrap();
    assert!(dm.is_registered());
    assert!(dm.requests()[0].uri_query().iter().any(|q| q == "lt=300"));

    let uri = sim.engine().store().read(&ResourcePath::new(&[0, 1, 0]).unwrap()).unwrap();
    assert_eq!(uri.as_text(), Some(DM));
    let accounts = sim.engine().store().server_accounts();
    assert!(accounts.iter().any(|a| a.short_id == 101 && a.uri == DM));
}

fn hop(from: EngineState, to: EngineState) -> Transition {
    Transition { from, to }
}

#[test]
fn bootstrap_transitions_step_by_step() {
    let provisioned = ServerAccount::server(101, DM);
    let mut sim = Simulation::new(5, EngineConfig::default(), MemoryStore::with_device("mote", "sim")).unwrap();
    sim.add_server(SimServer::bootstrap(BS, vec![provisioned]));
    sim.add_server(SimServer::new(DM, Behavior::Accept));
    sim.configure("mote-sim", &[ServerAccount::bootstrap(BS)]).unwrap();

    let first = sim.step().unwrap();
    assert_eq!(first.transitions, vec![
        hop(EngineState::Initial, EngineState::BootstrapRequired),
        hop(EngineState::BootstrapRequired, EngineState::Bootstrapping),
    ]);
    assert_eq!(first.state, EngineState::Bootstrapping);
    assert!(sim.engine().server(101).is_none());

    let mut finished = None;
    for _ in 0..16 {
        let report = sim.step().unwrap();
        if report.transitions.first() == Some(&hop(EngineState::Bootstrapping, EngineState::Initial)) {
            finished = Some(report);
            break;
        }
        assert_eq!(report.state, EngineState::Bootstrapping);
    }
    let finished = finished.unwrap();
    assert_eq!(finished.transitions[1], hop(EngineState::Initial, EngineState::RegisterRequired));
    assert!(!finished.transitions.iter().any(|t| t.to == EngineState::BootstrapRequired));

    let server = sim.engine().server(101).unwrap();
    assert_eq!(server.account.uri, DM);
    assert_eq!(sim.server(DM).unwrap().requests_to("rd").count(), 1);
}

#[test]
fn bootstrap_writes_are_reported() {
    let provisioned = ServerAccount::server(7, DM);
    let sim = Scenario::new("writes")
        .bootstrap(BS, vec![(provisioned, Behavior::Accept)])
        .run_for(Duration::from_secs(5))
        .oracle(Box::new(|_| Ok(())))
        .run()
        .unwrap();

    let written: Vec<&ResourcePath> = sim
        .events()
        .iter()
        .filter_map(|e| match e {
            EngineEvent::ResourceWritten { server: 0, path } => Some(path),
            _ => None,
        })
        .collect();
    assert_eq!(written.len(), 7);
    assert!(written.iter().all(|p| p.object() == Some(0) || p.object() == Some(1)));
}

#[test]
fn silent_bootstrap_server_leaves_service_unavailable() {
    let mut sim = Simulation::new(3, EngineConfig::default(), MemoryStore::new()).unwrap();
    sim.add_server(SimServer::new(BS, Behavior::Silent));
    sim.configure("lonely", &[ServerAccount::bootstrap(BS)]).unwrap();
    sim.run_for(Duration::from_secs(300)).unwrap();

    assert!(sim.events().iter().any(|e| matches!(e, EngineEvent::BootstrapFailed { .. })));
    assert_eq!(sim.engine().state(), EngineState::Bootstrapping);
    assert!(matches!(
        sim.last_report().unwrap().status,
        EngineStatus::ServiceUnavailable(UnavailableReason::BootstrapFailed(_))
    ));
    // Failure is final until reconfiguration.
    assert_eq!(sim.server(BS).unwrap().requests().len(), 5);
}

#[test]
fn rejected_bootstrap_request_fails_immediately() {
    let mut sim = Simulation::new(4, EngineConfig::default(), MemoryStore::new()).unwrap();
    sim.add_server(SimServer::new(BS, Behavior::Reject(Code::BAD_REQUEST)));
    sim.configure("rejected", &[ServerAccount::bootstrap(BS)]).unwrap();
    sim.run_for(Duration::from_secs(1)).unwrap();

    let reason = sim.events().iter().find_map(|e| match e {
        EngineEvent::BootstrapFailed { reason } => Some(reason.clone()),
        _ => None,
    });
    assert!(reason.unwrap().contains("rejected"));
    assert!(matches!(sim.last_report().unwrap().status, EngineStatus::ServiceUnavailable(_)));
}

#[test]
fn bootstrap_server_that_never_finishes_times_out() {
    let config = EngineConfig { bootstrap_timeout: Duration::from_secs(30), ..EngineConfig::default() };
    let mut sim = Simulation::new(5, config, MemoryStore::new()).unwrap();
    // Accepts the request but has nothing to provision.
    sim.add_server(SimServer::new(BS, Behavior::Accept));
    sim.configure("stalled", &[ServerAccount::bootstrap(BS)]).unwrap();

    sim.run_for(Duration::from_secs(20)).unwrap();
    assert_eq!(sim.engine().state(), EngineState::Bootstrapping);
    assert!(sim.events().is_empty());

    sim.run_for(Duration::from_secs(20)).unwrap();
    assert!(sim.events().iter().any(|e| matches!(e, EngineEvent::BootstrapFailed { .. })));
}

#[test]
fn reconfigure_after_failed_bootstrap_recovers() {
    let mut sim = Simulation::new(6, EngineConfig::default(), MemoryStore::with_device("mote", "sim")).unwrap();
    sim.add_server(SimServer::new(BS, Behavior::Silent));
    sim.add_server(SimServer::new(DM, Behavior::Accept));
    sim.configure("recovering", &[ServerAccount::bootstrap(BS)]).unwrap();
    sim.run_for(Duration::from_secs(300)).unwrap();
    assert!(matches!(sim.last_report().unwrap().status, EngineStatus::ServiceUnavailable(_)));

    sim.engine_mut().reconfigure(&[ServerAccount::server(1, DM)]).unwrap();
    let ready = sim.run_until(Duration::from_secs(10), |s| s.engine().state() == EngineState::Ready).unwrap();
    assert!(ready);
    assert!(sim.engine().servers().bootstrap_server().is_none());
}
