//! Engine behavior against a hand-driven loopback transport.
//!
//! Each test plays the server by decoding what the engine sent and pushing
//! replies into the session inbox, one step at a time.

use std::{
    cell::RefCell,
    collections::VecDeque,
    rc::Rc,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use mote_client::{Engine, EngineError, EngineEvent, EngineStatus};
use mote_core::{
    ConfigError, EngineConfig, EngineState, Environment, MemoryStore, ServerAccount, SessionId,
    Transport, TransportError,
};
use mote_proto::{
    Code, ContentFormat, Message, MessageType, OptionNumber, ResourcePath, Token, option::encode_uint,
};

const DM: &str = "coap://dm.example";

#[derive(Clone)]
struct CountingEnv {
    epoch: Instant,
    state: Arc<AtomicU64>,
}

impl CountingEnv {
    fn new() -> Self {
        Self { epoch: Instant::now(), state: Arc::new(AtomicU64::new(0x9e37_79b9_7f4a_7c15)) }
    }
}

impl Environment for CountingEnv {
    fn now(&self) -> Instant {
        self.epoch
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        for byte in buffer {
            // splitmix64 step
            let mut z = self.state.fetch_add(0x9e37_79b9_7f4a_7c15, Ordering::Relaxed);
            z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
            *byte = (z ^ (z >> 31)) as u8;
        }
    }
}

#[derive(Default)]
struct Wire {
    next_session: u64,
    sent: VecDeque<(SessionId, Vec<u8>)>,
    inbox: VecDeque<(SessionId, Vec<u8>)>,
}

#[derive(Clone, Default)]
struct Loopback {
    wire: Rc<RefCell<Wire>>,
}

impl Loopback {
    fn take_sent(&self) -> Vec<Message> {
        self.wire.borrow_mut().sent.drain(..).map(|(_, d)| Message::decode(&d).unwrap()).collect()
    }

    fn deliver(&self, message: &Message) {
        let session = SessionId(1);
        self.wire.borrow_mut().inbox.push_back((session, message.encode().unwrap()));
    }
}

impl Transport for Loopback {
    fn connect(&mut self, _uri: &str) -> Result<SessionId, TransportError> {
        let mut wire = self.wire.borrow_mut();
        wire.next_session += 1;
        Ok(SessionId(wire.next_session))
    }

    fn send(&mut self, session: SessionId, datagram: &[u8]) -> Result<usize, TransportError> {
        self.wire.borrow_mut().sent.push_back((session, datagram.to_vec()));
        Ok(datagram.len())
    }

    fn recv(&mut self, session: SessionId) -> Result<Option<Vec<u8>>, TransportError> {
        let mut wire = self.wire.borrow_mut();
        let position = wire.inbox.iter().position(|(s, _)| *s == session);
        Ok(position.and_then(|i| wire.inbox.remove(i)).map(|(_, d)| d))
    }

    fn close(&mut self, _session: SessionId) {}
}

type TestEngine = Engine<CountingEnv, Loopback, MemoryStore>;

fn engine() -> (TestEngine, Loopback, Instant) {
    let env = CountingEnv::new();
    let now = env.now();
    let wire = Loopback::default();
    let engine =
        Engine::new(env, wire.clone(), MemoryStore::with_device("mote", "test"), EngineConfig::default()).unwrap();
    (engine, wire, now)
}

/// Configure with one server and answer its Register.
fn registered() -> (TestEngine, Loopback, Instant) {
    let (mut engine, wire, now) = engine();
    let account = ServerAccount::server(1, DM).with_lifetime(Duration::from_secs(120));
    engine.configure("tester", &[account]).unwrap();
    engine.step(now).unwrap();

    let register = wire.take_sent().remove(0);
    let mut created = register.piggybacked_response(Code::CREATED);
    created.add_option(OptionNumber::LOCATION_PATH, b"rd".as_slice());
    created.add_option(OptionNumber::LOCATION_PATH, b"42".as_slice());
    wire.deliver(&created);

    let report = engine.step(now).unwrap();
    assert_eq!(report.state, EngineState::Ready);
    engine.drain_events();
    (engine, wire, now)
}

fn request(code: Code, path: &str, message_id: u16) -> Message {
    let mut message = Message::request(MessageType::Confirmable, code, message_id, Token::from_u64(u64::from(message_id)));
    message.add_uri_path(ResourcePath::parse(path).unwrap().uri_segments());
    message
}

/// Deliver `message`, step, and return the single reply.
fn roundtrip(engine: &mut TestEngine, wire: &Loopback, message: &Message, now: Instant) -> Message {
    wire.deliver(message);
    engine.step(now).unwrap();
    let mut sent = wire.take_sent();
    assert_eq!(sent.len(), 1, "expected one reply, got {sent:?}");
    sent.remove(0)
}

#[test]
fn step_before_configure_fails() {
    let (mut engine, _, now) = engine();
    let err = engine.step(now).unwrap_err();
    assert!(matches!(err, EngineError::Configuration(ConfigError::NotConfigured)));
    assert!(err.is_fatal());
}

#[test]
fn configuration_is_validated() {
    let (mut engine, _, _) = engine();
    assert!(matches!(
        engine.configure("tester", &[]),
        Err(EngineError::Configuration(ConfigError::NoAccounts))
    ));
    assert!(matches!(
        engine.configure("tester", &[ServerAccount::server(1, DM), ServerAccount::server(1, "coap://other")]),
        Err(EngineError::Configuration(ConfigError::DuplicateShortId(1)))
    ));
    assert!(engine.configure("", &[ServerAccount::server(1, DM)]).is_err());

    let first = [ServerAccount::server(1, DM).with_lifetime(Duration::from_secs(120))];
    engine.configure("tester", &first).unwrap();
    assert!(matches!(
        engine.configure("other", &[ServerAccount::server(2, "coap://other"), ServerAccount::bootstrap("coap://bs")]),
        Err(EngineError::Configuration(ConfigError::AlreadyConfigured))
    ));
    assert_eq!(engine.endpoint(), Some("tester"));
    assert_eq!(engine.accounts(), &first);
}

#[test]
fn registration_schedules_update_at_half_lifetime() {
    let (mut engine, wire, now) = registered();
    assert_eq!(engine.server(1).unwrap().location_path(), "/rd/42");

    let report = engine.step(now).unwrap();
    assert_eq!(report.status, EngineStatus::Running);
    assert_eq!(report.next_wake, Duration::from_secs(60));

    engine.step(now + Duration::from_secs(60)).unwrap();
    let update = wire.take_sent().remove(0);
    assert_eq!(update.code, Code::POST);
    assert_eq!(update.uri_path_segments(), vec!["rd", "42"]);
}

#[test]
fn send_reports_completion() {
    let (mut engine, wire, now) = registered();
    let id = engine.submit_send(DM, vec![0x81, 0xa1, 0x00], now).unwrap();

    let send = wire.take_sent().remove(0);
    assert_eq!(send.uri_path_segments(), vec!["dp"]);
    assert_eq!(send.content_format(), Some(ContentFormat::SENML_CBOR));

    wire.deliver(&send.piggybacked_response(Code::CHANGED));
    engine.step(now).unwrap();
    assert_eq!(engine.drain_events(), vec![EngineEvent::SendCompleted { id }]);
}

#[test]
fn rejected_send_reports_failure() {
    let (mut engine, wire, now) = registered();
    let id = engine.submit_send(DM, vec![0x80], now).unwrap();

    let send = wire.take_sent().remove(0);
    wire.deliver(&send.piggybacked_response(Code::BAD_REQUEST));
    engine.step(now).unwrap();

    let events = engine.drain_events();
    assert!(matches!(&events[..], [EngineEvent::SendFailed { id: failed, .. }] if *failed == id));
}

#[test]
fn send_needs_a_registered_server() {
    let (mut engine, _, now) = engine();
    engine.configure("tester", &[ServerAccount::server(1, DM)]).unwrap();
    engine.step(now).unwrap();

    assert!(matches!(engine.submit_send(DM, vec![0x80], now), Err(EngineError::NotRegistered { short_id: 1 })));
    assert!(matches!(
        engine.submit_send("coap://nobody", vec![0x80], now),
        Err(EngineError::UnknownServer { .. })
    ));
}

#[test]
fn ping_is_answered_with_reset() {
    let (mut engine, wire, now) = registered();
    let ping = Message::new(MessageType::Confirmable, Code::EMPTY, 0x1234);

    let reply = roundtrip(&mut engine, &wire, &ping, now);
    assert_eq!(reply.message_type, MessageType::Reset);
    assert_eq!(reply.message_id, 0x1234);
}

#[test]
fn request_before_registration_is_unauthorized() {
    let (mut engine, wire, now) = engine();
    engine.configure("tester", &[ServerAccount::server(1, DM)]).unwrap();
    engine.step(now).unwrap();
    wire.take_sent();

    let reply = roundtrip(&mut engine, &wire, &request(Code::GET, "/3/0/0", 7), now);
    assert_eq!(reply.code, Code::UNAUTHORIZED);
}

#[test]
fn unknown_critical_option_is_rejected() {
    let (mut engine, wire, now) = registered();
    let mut message = request(Code::GET, "/3/0/0", 8);
    message.add_option(OptionNumber(9), b"?".as_slice());

    assert_eq!(roundtrip(&mut engine, &wire, &message, now).code, Code::BAD_OPTION);
}

#[test]
fn write_then_read() {
    let (mut engine, wire, now) = registered();

    let mut write = request(Code::PUT, "/3/0/0", 9);
    write.set_content_format(ContentFormat::TEXT_PLAIN);
    let write = write.with_payload("acme");
    let reply = roundtrip(&mut engine, &wire, &write, now);
    assert_eq!(reply.code, Code::CHANGED);
    assert_eq!(reply.message_type, MessageType::Acknowledgement);
    assert_eq!(reply.message_id, 9);

    let reply = roundtrip(&mut engine, &wire, &request(Code::GET, "/3/0/0", 10), now);
    assert_eq!(reply.code, Code::CONTENT);
    assert_eq!(reply.payload.as_ref(), b"acme");

    let events = engine.drain_events();
    let written = ResourcePath::parse("/3/0/0").unwrap();
    assert_eq!(events, vec![EngineEvent::ResourceWritten { server: 1, path: written }]);
}

#[test]
fn execute_and_unknown_paths() {
    let (mut engine, wire, now) = registered();

    let reply = roundtrip(&mut engine, &wire, &request(Code::POST, "/3/0/4", 11), now);
    assert_eq!(reply.code, Code::CHANGED);
    assert_eq!(engine.store().executions().len(), 1);

    let reply = roundtrip(&mut engine, &wire, &request(Code::GET, "/3/0/4", 12), now);
    assert_eq!(reply.code, Code::METHOD_NOT_ALLOWED);

    let reply = roundtrip(&mut engine, &wire, &request(Code::GET, "/9/9/9", 13), now);
    assert_eq!(reply.code, Code::NOT_FOUND);
}

#[test]
fn discover_lists_resources_with_attributes() {
    let (mut engine, wire, now) = registered();

    let mut attributes = request(Code::PUT, "/3/0", 14);
    attributes.add_uri_query("pmin=5");
    assert_eq!(roundtrip(&mut engine, &wire, &attributes, now).code, Code::CHANGED);

    let mut discover = request(Code::GET, "/3/0", 15);
    discover.add_option(OptionNumber::ACCEPT, encode_uint(u32::from(ContentFormat::LINK_FORMAT.0)));
    let reply = roundtrip(&mut engine, &wire, &discover, now);

    assert_eq!(reply.content_format(), Some(ContentFormat::LINK_FORMAT));
    let body = String::from_utf8(reply.payload.to_vec()).unwrap();
    assert!(body.starts_with("</3/0>;pmin=5"), "{body}");
    assert!(body.contains("</3/0/0>"), "{body}");
}

#[test]
fn non_request_gets_non_reply() {
    let (mut engine, wire, now) = registered();
    let mut message = request(Code::GET, "/3/0/1", 16);
    message.message_type = MessageType::NonConfirmable;

    let reply = roundtrip(&mut engine, &wire, &message, now);
    assert_eq!(reply.message_type, MessageType::NonConfirmable);
    assert_eq!(reply.token, message.token);
    assert_eq!(reply.payload.as_ref(), b"test");
}

#[test]
fn duplicate_confirmable_is_not_reexecuted() {
    let (mut engine, wire, now) = registered();
    let execute = request(Code::POST, "/3/0/4", 17);

    let first = roundtrip(&mut engine, &wire, &execute, now);
    let second = roundtrip(&mut engine, &wire, &execute, now + Duration::from_secs(3));

    assert_eq!(first, second);
    assert_eq!(engine.store().executions().len(), 1);
}
