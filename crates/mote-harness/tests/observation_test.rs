//! Observe and notification behavior against a registered client.

use std::time::Duration;

use mote_client::EngineEvent;
use mote_core::{EngineConfig, EngineState, MemoryStore, ObservationKey, ResourceValue, ServerAccount};
use mote_harness::{Behavior, SimServer, Simulation};
use mote_proto::{Code, Message, MessageType, ResourcePath, Token};

const DM: &str = "coap://dm.example";

fn battery() -> ResourcePath {
    ResourcePath::new(&[3, 0, 9]).unwrap()
}

fn registered(seed: u64, account: ServerAccount) -> Simulation {
    let mut sim = Simulation::new(seed, EngineConfig::default(), MemoryStore::with_device("mote", "sim")).unwrap();
    sim.add_server(SimServer::new(DM, Behavior::Accept));
    sim.configure("observed", &[account]).unwrap();
    let ready = sim.run_until(Duration::from_secs(10), |s| s.engine().state() == EngineState::Ready).unwrap();
    assert!(ready);
    sim
}

fn dm_account() -> ServerAccount {
    ServerAccount::server(1, DM).with_lifetime(Duration::from_secs(3600))
}

/// Send `request` from the server and let the exchange settle.
fn exchange(sim: &mut Simulation, request: Message) {
    sim.server_mut(DM).unwrap().send(request);
    sim.run_for(Duration::from_millis(100)).unwrap();
}

fn observe(sim: &mut Simulation, path: &ResourcePath) -> Token {
    let server = sim.server_mut(DM).unwrap();
    let mut request = server.new_request(Code::GET, path);
    request.set_observe(0);
    let token = request.token.clone();
    exchange(sim, request);
    token
}

fn set_battery(sim: &mut Simulation, level: f64) {
    sim.store_mut().insert(battery(), ResourceValue::number(level));
}

#[test]
fn change_is_notified_with_increasing_sequence() {
    let mut sim = registered(1, dm_account());
    let token = observe(&mut sim, &battery());

    let first = sim.server(DM).unwrap().response_to(&token).unwrap().clone();
    assert_eq!(first.code, Code::CONTENT);
    assert_eq!(first.observe(), Some(0));
    assert_eq!(&first.payload[..], b"100");
    assert!(sim.events().contains(&EngineEvent::ObservationStarted { server: 1, path: battery() }));

    set_battery(&mut sim, 80.0);
    sim.run_for(Duration::from_secs(1)).unwrap();
    set_battery(&mut sim, 60.0);
    sim.run_for(Duration::from_secs(1)).unwrap();

    let notifications = sim.server(DM).unwrap().notifications(&token);
    let sequence: Vec<Option<u32>> = notifications.iter().map(|m| m.observe()).collect();
    assert_eq!(sequence, vec![Some(0), Some(1), Some(2)]);
    assert_eq!(&notifications[2].payload[..], b"60");
    assert_eq!(notifications[1].message_type, MessageType::NonConfirmable);
}

#[test]
fn unchanged_value_is_not_notified() {
    let mut sim = registered(2, dm_account());
    let token = observe(&mut sim, &battery());

    set_battery(&mut sim, 100.0);
    sim.run_for(Duration::from_secs(30)).unwrap();

    assert_eq!(sim.server(DM).unwrap().notifications(&token).len(), 1);
}

#[test]
fn pmin_holds_back_notifications() {
    let mut sim = registered(3, dm_account());

    let server = sim.server_mut(DM).unwrap();
    let mut attributes = server.new_request(Code::PUT, &battery());
    attributes.add_uri_query("pmin=10");
    let attributes_token = attributes.token.clone();
    exchange(&mut sim, attributes);
    let reply = sim.server(DM).unwrap().response_to(&attributes_token).unwrap();
    assert_eq!(reply.code, Code::CHANGED);

    let token = observe(&mut sim, &battery());
    set_battery(&mut sim, 50.0);

    sim.run_for(Duration::from_secs(5)).unwrap();
    assert_eq!(sim.server(DM).unwrap().notifications(&token).len(), 1);

    sim.run_for(Duration::from_secs(6)).unwrap();
    let notifications = sim.server(DM).unwrap().notifications(&token);
    assert_eq!(notifications.len(), 2);
    assert_eq!(&notifications[1].payload[..], b"50");
}

#[test]
fn pmax_forces_periodic_notifications() {
    let mut sim = registered(4, dm_account());

    let server = sim.server_mut(DM).unwrap();
    let mut attributes = server.new_request(Code::PUT, &battery());
    attributes.add_uri_query("pmax=20");
    exchange(&mut sim, attributes);

    let token = observe(&mut sim, &battery());
    sim.run_for(Duration::from_secs(65)).unwrap();

    assert_eq!(sim.server(DM).unwrap().notifications(&token).len(), 4);
}

#[test]
fn step_threshold_filters_small_changes() {
    let mut sim = registered(5, dm_account());

    let server = sim.server_mut(DM).unwrap();
    let mut attributes = server.new_request(Code::PUT, &battery());
    attributes.add_uri_query("st=5");
    exchange(&mut sim, attributes);

    let token = observe(&mut sim, &battery());
    set_battery(&mut sim, 98.0);
    sim.run_for(Duration::from_secs(1)).unwrap();
    assert_eq!(sim.server(DM).unwrap().notifications(&token).len(), 1);

    set_battery(&mut sim, 94.0);
    sim.run_for(Duration::from_secs(1)).unwrap();
    assert_eq!(sim.server(DM).unwrap().notifications(&token).len(), 2);
}

#[test]
fn malformed_attributes_are_rejected() {
    let mut sim = registered(6, dm_account());

    let server = sim.server_mut(DM).unwrap();
    let mut attributes = server.new_request(Code::PUT, &battery());
    attributes.add_uri_query("gt=1");
    attributes.add_uri_query("lt=5");
    let token = attributes.token.clone();
    exchange(&mut sim, attributes);

    assert_eq!(sim.server(DM).unwrap().response_to(&token).unwrap().code, Code::BAD_REQUEST);
}

#[test]
fn observe_cancel_stops_notifications() {
    let mut sim = registered(7, dm_account());
    let token = observe(&mut sim, &battery());

    let server = sim.server_mut(DM).unwrap();
    let mut cancel = server.new_request(Code::GET, &battery());
    cancel.token = token.clone();
    cancel.set_observe(1);
    exchange(&mut sim, cancel);

    assert!(sim.events().contains(&EngineEvent::ObservationCancelled { server: 1, path: battery() }));
    assert!(!sim.engine().observations().contains(&ObservationKey::new(1, battery())));

    let before = sim.server(DM).unwrap().notifications(&token).len();
    set_battery(&mut sim, 10.0);
    sim.run_for(Duration::from_secs(5)).unwrap();
    // The cancelling GET's own reply carries no Observe option.
    assert_eq!(sim.server(DM).unwrap().notifications(&token).len(), before);
}

#[test]
fn reset_to_notification_cancels_observation() {
    let mut sim = registered(8, dm_account());
    let token = observe(&mut sim, &battery());

    set_battery(&mut sim, 70.0);
    sim.run_for(Duration::from_secs(1)).unwrap();
    let notification = sim.server(DM).unwrap().notifications(&token)[1].message_id;

    exchange(&mut sim, Message::reset(notification));

    assert!(sim.engine().observations().is_empty());
    assert!(sim.events().contains(&EngineEvent::ObservationCancelled { server: 1, path: battery() }));
}

#[test]
fn confirmable_notifications_are_acknowledged() {
    let mut sim = registered(9, dm_account().with_confirmable_notifications());
    let token = observe(&mut sim, &battery());

    set_battery(&mut sim, 42.0);
    sim.run_for(Duration::from_secs(1)).unwrap();

    let notifications = sim.server(DM).unwrap().notifications(&token);
    assert_eq!(notifications[1].message_type, MessageType::Confirmable);
    // The server's empty ACK completes the notification.
    assert!(sim.engine().transactions().is_empty());
}

#[test]
fn deleting_an_instance_cancels_observations_below_it() {
    let mut sim = registered(10, dm_account());
    observe(&mut sim, &battery());

    let server = sim.server_mut(DM).unwrap();
    let delete = server.new_request(Code::DELETE, &ResourcePath::new(&[3, 0]).unwrap());
    let token = delete.token.clone();
    exchange(&mut sim, delete);

    assert_eq!(sim.server(DM).unwrap().response_to(&token).unwrap().code, Code::DELETED);
    assert!(sim.engine().observations().is_empty());
}
