//! Registration lifecycle over the simulated network:
//! - Register and reach Ready
//! - Update at half the lifetime
//! - De-register
//! - A silent server sends the engine looking for a bootstrap server

use std::time::Duration;

use mote_client::{EngineEvent, EngineStatus};
use mote_core::{EngineState, Environment, ServerAccount, UnavailableReason};
use mote_harness::{Behavior, Scenario, Simulation};

const DM: &str = "coap://dm.example";
const SILENT: &str = "coap://silent.example";

fn has_event(sim: &Simulation, wanted: impl Fn(&EngineEvent) -> bool) -> bool {
    sim.events().iter().any(wanted)
}

#[test]
fn register_reaches_ready() {
    Scenario::new("register")
        .server(ServerAccount::server(1, DM), Behavior::Accept)
        .run_for(Duration::from_secs(10))
        .oracle(Box::new(|sim| {
            if sim.engine().state() != EngineState::Ready {
                return Err(format!("expected ready, got {}", sim.engine().state()));
            }
            let registered = has_event(sim, |e| {
                *e == EngineEvent::Registered { server: 1, location: "/rd/0001".to_string() }
            });
            if !registered {
                return Err(format!("no Registered event in {:?}", sim.events()));
            }
            let register = &sim.server(DM).ok_or("server missing")?.requests()[0];
            let queries = register.uri_query();
            if !queries.iter().any(|q| q == "ep=mote-sim") || !queries.iter().any(|q| q == "lwm2m=1.1") {
                return Err(format!("register query {queries:?}"));
            }
            Ok(())
        }))
        .run()
        .unwrap();
}

#[test]
fn update_sent_at_half_lifetime() {
    let account = ServerAccount::server(1, DM).with_lifetime(Duration::from_secs(100));
    let mut sim = Scenario::new("update")
        .server(account, Behavior::Accept)
        .run_for(Duration::from_secs(49))
        .oracle(Box::new(|sim| match sim.server(DM).map(|s| s.requests().len()) {
            Some(1) => Ok(()),
            other => Err(format!("expected only the Register before half lifetime, got {other:?}")),
        }))
        .run()
        .unwrap();

    sim.run_for(Duration::from_secs(2)).unwrap();

    let server = sim.server(DM).unwrap();
    assert_eq!(server.requests().len(), 2);
    assert_eq!(server.requests()[1].uri_path_segments(), vec!["rd", "0001"]);
    assert!(has_event(&sim, |e| *e == EngineEvent::RegistrationUpdated { server: 1 }));
    assert_eq!(sim.engine().state(), EngineState::Ready);
}

#[test]
fn updates_keep_registration_alive() {
    let account = ServerAccount::server(1, DM).with_lifetime(Duration::from_secs(60));
    let sim = Scenario::new("keepalive")
        .server(account, Behavior::Accept)
        .run_for(Duration::from_secs(600))
        .oracle(Box::new(|sim| {
            let updates = sim.events().iter().filter(|e| matches!(e, EngineEvent::RegistrationUpdated { .. })).count();
            if updates < 15 {
                return Err(format!("only {updates} updates in ten minutes"));
            }
            if has_event(sim, |e| matches!(e, EngineEvent::RegistrationFailed { .. })) {
                return Err("registration lapsed".to_string());
            }
            Ok(())
        }))
        .run()
        .unwrap();
    assert_eq!(sim.server(DM).unwrap().registrations(), 1);
}

#[test]
fn deregister_releases_registration() {
    let mut sim = Scenario::new("deregister")
        .server(ServerAccount::server(1, DM), Behavior::Accept)
        .run_for(Duration::from_secs(5))
        .oracle(Box::new(|_| Ok(())))
        .run()
        .unwrap();
    assert!(sim.server(DM).unwrap().is_registered());

    let now = sim.env().now();
    assert_eq!(sim.engine_mut().deregister_all(now).unwrap(), 1);
    sim.run_for(Duration::from_secs(1)).unwrap();

    assert!(!sim.server(DM).unwrap().is_registered());
    assert!(has_event(&sim, |e| *e == EngineEvent::Deregistered { server: 1 }));
    assert!(sim.engine().transactions().is_empty());
}

#[test]
fn rejected_register_requires_bootstrap() {
    Scenario::new("rejected")
        .server(ServerAccount::server(1, DM), Behavior::Reject(mote_proto::Code::FORBIDDEN))
        .run_for(Duration::from_secs(10))
        .oracle(Box::new(|sim| {
            if !has_event(sim, |e| matches!(e, EngineEvent::RegistrationFailed { server: 1, .. })) {
                return Err("no RegistrationFailed".to_string());
            }
            match sim.last_report().map(|r| &r.status) {
                Some(EngineStatus::ServiceUnavailable(UnavailableReason::NoBootstrapServer)) => Ok(()),
                other => Err(format!("unexpected status {other:?}")),
            }
        }))
        .run()
        .unwrap();
}

#[test]
fn silent_server_fails_after_retransmissions() {
    let sim = Scenario::new("silent")
        .server(ServerAccount::server(1, DM), Behavior::Accept)
        .server(ServerAccount::server(2, SILENT), Behavior::Silent)
        .run_for(Duration::from_secs(300))
        .oracle(Box::new(|sim| {
            if !has_event(sim, |e| matches!(e, EngineEvent::Registered { server: 1, .. })) {
                return Err("server 1 never registered".to_string());
            }
            if !has_event(sim, |e| matches!(e, EngineEvent::RegistrationFailed { server: 2, .. })) {
                return Err("server 2 never failed".to_string());
            }
            Ok(())
        }))
        .run()
        .unwrap();

    // Initial transmission plus four retransmissions.
    assert_eq!(sim.server(SILENT).unwrap().requests().len(), 5);
    assert_eq!(sim.engine().state(), EngineState::BootstrapRequired);
    assert_eq!(
        sim.last_report().unwrap().status,
        EngineStatus::ServiceUnavailable(UnavailableReason::NoBootstrapServer)
    );
}

#[test]
fn reconfigure_drops_removed_servers() {
    let mut sim = Scenario::new("reconfigure")
        .server(ServerAccount::server(1, DM), Behavior::Accept)
        .server(ServerAccount::server(2, SILENT), Behavior::Silent)
        .run_for(Duration::from_secs(300))
        .oracle(Box::new(|_| Ok(())))
        .run()
        .unwrap();

    sim.engine_mut().reconfigure(&[ServerAccount::server(1, DM)]).unwrap();
    let ready = sim.run_until(Duration::from_secs(10), |s| s.engine().state() == EngineState::Ready).unwrap();

    assert!(ready);
    assert!(sim.engine().server(2).is_none());
    assert_eq!(sim.engine().servers().live_servers().count(), 1);
}
