//! Production runtime: system clock, OS entropy, UDP sessions.
//!
//! [`UdpTransport`] gives every session its own connected socket, so two
//! accounts that name the same host and port still have separate sessions
//! and separate inbound streams. A reader task per socket forwards
//! datagrams into a channel; the engine-facing methods only ever poll.
//!
//! Name resolution happens in [`run`], outside of `step`: `connect` only
//! accepts literal addresses or hosts resolved earlier, and remembers the
//! others so the driver can look them up before the next step.
//!
//! `coaps://` URIs are refused: DTLS is not part of this runtime.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    future::Future,
    io,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use mote_core::{EngineState, Environment, ResourceStore, SessionId, Transport, TransportError};
use tokio::{net::UdpSocket, runtime::Handle, sync::mpsc, task::JoinHandle};

use crate::{Engine, EngineError};

/// Largest datagram accepted from the network.
const RECV_BUFFER: usize = 1500;

/// Default CoAP port.
const COAP_PORT: u16 = 5683;

/// How long shutdown waits for De-register responses.
const DEREGISTER_GRACE: Duration = Duration::from_secs(5);

/// Upper bound for one name lookup.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Production environment using system time and OS randomness.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).unwrap_or_else(|e| {
            // Zeros keep the engine alive; tokens become guessable.
            tracing::error!("getrandom failed: {}", e);
            buffer.fill(0);
        });
    }
}

struct UdpSession {
    socket: Arc<UdpSocket>,
    reader: JoinHandle<()>,
}

/// One connected UDP socket per session.
pub struct UdpTransport {
    local: IpAddr,
    handle: Handle,
    resolved: BTreeMap<String, SocketAddr>,
    unresolved: BTreeSet<String>,
    sessions: BTreeMap<SessionId, UdpSession>,
    inboxes: BTreeMap<SessionId, VecDeque<Vec<u8>>>,
    inbound_tx: mpsc::UnboundedSender<(SessionId, Vec<u8>)>,
    inbound_rx: mpsc::UnboundedReceiver<(SessionId, Vec<u8>)>,
    next_session: u64,
}

impl UdpTransport {
    /// Transport whose sockets bind to `local` on ephemeral ports.
    ///
    /// Must be called from within a tokio runtime; reader tasks are spawned
    /// on it.
    pub fn new(local: IpAddr) -> Result<Self, TransportError> {
        let handle = Handle::try_current()
            .map_err(|e| TransportError::Unreachable(format!("no tokio runtime: {e}")))?;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Ok(Self {
            local,
            handle,
            resolved: BTreeMap::new(),
            unresolved: BTreeSet::new(),
            sessions: BTreeMap::new(),
            inboxes: BTreeMap::new(),
            inbound_tx,
            inbound_rx,
            next_session: 1,
        })
    }

    /// Local address of the socket behind `session`.
    pub fn local_addr(&self, session: SessionId) -> Option<SocketAddr> {
        self.sessions.get(&session).and_then(|s| s.socket.local_addr().ok())
    }

    /// Peer address of `session`.
    pub fn peer(&self, session: SessionId) -> Option<SocketAddr> {
        self.sessions.get(&session).and_then(|s| s.socket.peer_addr().ok())
    }

    /// Look up the host of `uri` and remember the address for `connect`.
    pub async fn resolve(&mut self, uri: &str) -> Result<SocketAddr, TransportError> {
        let (host, port) = parse_uri(uri)?;
        let addr = match host.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, port),
            Err(_) => tokio::time::timeout(RESOLVE_TIMEOUT, tokio::net::lookup_host((host, port)))
                .await
                .map_err(|_| TransportError::Unreachable(format!("{uri}: lookup timed out")))?
                .map_err(|e| TransportError::Unreachable(format!("{uri}: {e}")))?
                .next()
                .ok_or_else(|| TransportError::Unreachable(format!("{uri}: no address")))?,
        };
        self.unresolved.remove(uri);
        self.resolved.insert(uri.to_string(), addr);
        tracing::debug!(%uri, %addr, "resolved");
        Ok(addr)
    }

    /// Resolve every URI a `connect` asked for but could not use yet.
    pub async fn resolve_pending(&mut self) {
        let pending: Vec<String> = std::mem::take(&mut self.unresolved).into_iter().collect();
        for uri in pending {
            if let Err(err) = self.resolve(&uri).await {
                tracing::warn!(%uri, %err, "name resolution failed");
            }
        }
    }

    /// URIs waiting for [`Self::resolve_pending`].
    pub fn has_pending(&self) -> bool {
        !self.unresolved.is_empty()
    }

    /// Wait for the next inbound datagram and queue it for its session.
    ///
    /// Cancel safe.
    pub async fn readable(&mut self) {
        if let Some((session, datagram)) = self.inbound_rx.recv().await {
            self.enqueue(session, datagram);
        }
    }

    /// Move every datagram the reader tasks have forwarded into its session
    /// inbox.
    pub fn drain(&mut self) {
        while let Ok((session, datagram)) = self.inbound_rx.try_recv() {
            self.enqueue(session, datagram);
        }
    }

    fn enqueue(&mut self, session: SessionId, datagram: Vec<u8>) {
        if self.sessions.contains_key(&session) {
            self.inboxes.entry(session).or_default().push_back(datagram);
        } else {
            tracing::debug!(%session, len = datagram.len(), "datagram for closed session dropped");
        }
    }

    fn open(&mut self, addr: SocketAddr) -> io::Result<SessionId> {
        let socket = std::net::UdpSocket::bind(SocketAddr::new(self.local, 0))?;
        socket.connect(addr)?;
        socket.set_nonblocking(true)?;
        let socket = {
            let _runtime = self.handle.enter();
            Arc::new(UdpSocket::from_std(socket)?)
        };

        let session = SessionId(self.next_session);
        self.next_session += 1;
        let reader = self.handle.spawn(read_loop(session, Arc::clone(&socket), self.inbound_tx.clone()));
        self.sessions.insert(session, UdpSession { socket, reader });
        Ok(session)
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        for session in self.sessions.values() {
            session.reader.abort();
        }
    }
}

impl Transport for UdpTransport {
    fn connect(&mut self, uri: &str) -> Result<SessionId, TransportError> {
        let (host, port) = parse_uri(uri)?;
        let addr = match (self.resolved.get(uri), host.parse::<IpAddr>()) {
            (Some(addr), _) => *addr,
            (None, Ok(ip)) => SocketAddr::new(ip, port),
            (None, Err(_)) => {
                self.unresolved.insert(uri.to_string());
                return Err(TransportError::Unreachable(format!("{uri}: not resolved yet")));
            },
        };

        let session = self.open(addr)?;
        tracing::debug!(%session, %addr, local = ?self.local_addr(session), "session opened");
        Ok(session)
    }

    fn send(&mut self, session: SessionId, datagram: &[u8]) -> Result<usize, TransportError> {
        let udp = self.sessions.get(&session).ok_or(TransportError::UnknownSession(session))?;
        Ok(udp.socket.try_send(datagram)?)
    }

    fn recv(&mut self, session: SessionId) -> Result<Option<Vec<u8>>, TransportError> {
        if !self.sessions.contains_key(&session) {
            return Err(TransportError::UnknownSession(session));
        }
        self.drain();
        Ok(self.inboxes.get_mut(&session).and_then(VecDeque::pop_front))
    }

    fn close(&mut self, session: SessionId) {
        if let Some(udp) = self.sessions.remove(&session) {
            udp.reader.abort();
        }
        self.inboxes.remove(&session);
    }
}

async fn read_loop(
    session: SessionId,
    socket: Arc<UdpSocket>,
    inbound: mpsc::UnboundedSender<(SessionId, Vec<u8>)>,
) {
    let mut buffer = vec![0u8; RECV_BUFFER];
    loop {
        match socket.recv(&mut buffer).await {
            Ok(len) => {
                if inbound.send((session, buffer[..len].to_vec())).is_err() {
                    return;
                }
            },
            // ICMP port unreachable from an earlier send.
            Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
                tracing::debug!(%session, "peer refused datagram");
            },
            Err(err) => {
                tracing::warn!(%session, %err, "session reader stopped");
                return;
            },
        }
    }
}

/// `coap://host[:port]` to host and port.
fn parse_uri(uri: &str) -> Result<(&str, u16), TransportError> {
    let invalid = || TransportError::InvalidUri(uri.to_string());
    let authority = match uri.split_once("://") {
        Some(("coap", rest)) => rest,
        Some(("coaps", _)) => {
            return Err(TransportError::Unreachable(format!("{uri}: DTLS is not supported")));
        },
        _ => return Err(invalid()),
    };
    let authority = authority.split('/').next().unwrap_or_default();
    if authority.is_empty() {
        return Err(invalid());
    }

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) if !host.ends_with(':') && !port.contains(']') => {
            (host, port.parse::<u16>().map_err(|_| invalid())?)
        },
        _ => (authority, COAP_PORT),
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }
    Ok((host, port))
}

enum Wake {
    Timer,
    Readable,
    Shutdown,
}

/// Drive `engine` until `shutdown` resolves, then de-register.
///
/// Server hosts are resolved before the first step and whenever a step
/// asked for an unknown host. Step errors are logged and retried on the
/// next wake unless they are fatal.
pub async fn run<S: ResourceStore>(
    engine: &mut Engine<SystemEnv, UdpTransport, S>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), EngineError> {
    let mut shutdown = std::pin::pin!(shutdown);
    let mut last_state = EngineState::Initial;

    let uris: Vec<String> = engine.accounts().iter().map(|a| a.uri.clone()).collect();
    for uri in uris {
        if let Err(err) = engine.transport_mut().resolve(&uri).await {
            tracing::warn!(%uri, %err, "name resolution failed");
        }
    }

    loop {
        let wait = match engine.step(Instant::now()) {
            Ok(report) => {
                if report.state != last_state {
                    tracing::info!(from = %last_state, to = %report.state, "engine state");
                    last_state = report.state;
                }
                report.next_wake
            },
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                tracing::warn!(%err, "step failed");
                engine.config().idle_wake.min(Duration::from_secs(1))
            },
        };
        for event in engine.drain_events() {
            tracing::info!(?event, "engine event");
        }
        if engine.transport().has_pending() {
            engine.transport_mut().resolve_pending().await;
        }

        let wake = tokio::select! {
            () = &mut shutdown => Wake::Shutdown,
            () = tokio::time::sleep(wait) => Wake::Timer,
            () = engine.transport_mut().readable() => Wake::Readable,
        };
        match wake {
            Wake::Shutdown => break,
            Wake::Readable | Wake::Timer => {},
        }
    }

    deregister(engine).await
}

async fn deregister<S: ResourceStore>(
    engine: &mut Engine<SystemEnv, UdpTransport, S>,
) -> Result<(), EngineError> {
    let sent = engine.deregister_all(Instant::now())?;
    if sent == 0 {
        return Ok(());
    }
    tracing::info!(servers = sent, "waiting for de-registration");

    let deadline = Instant::now() + DEREGISTER_GRACE;
    while Instant::now() < deadline {
        let pending = engine
            .servers()
            .live_servers()
            .any(|r| r.status == mote_core::ServerStatus::DeregistrationPending);
        if !pending {
            break;
        }
        let _ = tokio::time::timeout(Duration::from_millis(100), engine.transport_mut().readable()).await;
        engine.pump(Instant::now());
    }
    for event in engine.drain_events() {
        tracing::info!(?event, "engine event");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_server_uris() {
        assert_eq!(parse_uri("coap://127.0.0.1:5690").unwrap(), ("127.0.0.1", 5690));
        assert_eq!(parse_uri("coap://127.0.0.1").unwrap(), ("127.0.0.1", 5683));
        assert_eq!(parse_uri("coap://[::1]:6000").unwrap(), ("::1", 6000));
        assert_eq!(parse_uri("coap://[::1]").unwrap(), ("::1", 5683));
        assert_eq!(parse_uri("coap://dm.example/rd").unwrap(), ("dm.example", 5683));
    }

    #[test]
    fn rejects_unsupported_uris() {
        assert!(matches!(parse_uri("http://127.0.0.1"), Err(TransportError::InvalidUri(_))));
        assert!(matches!(parse_uri("coap://"), Err(TransportError::InvalidUri(_))));
        assert!(matches!(parse_uri("coap://127.0.0.1:x"), Err(TransportError::InvalidUri(_))));
        assert!(matches!(parse_uri("coaps://127.0.0.1"), Err(TransportError::Unreachable(_))));
    }

    #[test]
    fn system_env_random_bytes_differ() {
        let env = SystemEnv::new();
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        env.random_bytes(&mut a);
        env.random_bytes(&mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn transport_needs_a_runtime() {
        assert!(UdpTransport::new("127.0.0.1".parse().unwrap()).is_err());
    }

    fn loopback() -> UdpTransport {
        UdpTransport::new("127.0.0.1".parse().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn sessions_are_demultiplexed_by_peer() {
        let mut transport = loopback();
        let peer_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let a = transport.connect(&format!("coap://{}", peer_a.local_addr().unwrap())).unwrap();
        let b = transport.connect(&format!("coap://{}", peer_b.local_addr().unwrap())).unwrap();
        assert_ne!(a, b);
        assert_eq!(transport.peer(a), Some(peer_a.local_addr().unwrap()));

        transport.send(a, b"to-a").unwrap();
        let mut buffer = [0u8; 16];
        let (len, from) = peer_a.recv_from(&mut buffer).await.unwrap();
        assert_eq!(&buffer[..len], b"to-a");
        assert_eq!(Some(from), transport.local_addr(a));

        peer_b.send_to(b"from-b", transport.local_addr(b).unwrap()).await.unwrap();
        transport.readable().await;
        assert_eq!(transport.recv(a).unwrap(), None);
        assert_eq!(transport.recv(b).unwrap(), Some(b"from-b".to_vec()));

        transport.close(b);
        assert!(matches!(transport.recv(b), Err(TransportError::UnknownSession(_))));
    }

    #[tokio::test]
    async fn same_peer_gets_independent_sessions() {
        let mut transport = loopback();
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let uri = format!("coap://{}", server.local_addr().unwrap());

        let bootstrap = transport.connect(&uri).unwrap();
        let dm = transport.connect(&uri).unwrap();
        assert_ne!(bootstrap, dm);
        assert_ne!(transport.local_addr(bootstrap), transport.local_addr(dm));

        server.send_to(b"for-dm", transport.local_addr(dm).unwrap()).await.unwrap();
        transport.readable().await;
        assert_eq!(transport.recv(bootstrap).unwrap(), None);
        assert_eq!(transport.recv(dm).unwrap(), Some(b"for-dm".to_vec()));

        // Closing one session leaves the other usable.
        transport.close(bootstrap);
        transport.send(dm, b"still-open").unwrap();
        let mut buffer = [0u8; 16];
        let (len, _) = server.recv_from(&mut buffer).await.unwrap();
        assert_eq!(&buffer[..len], b"still-open");
    }

    #[tokio::test]
    async fn hostnames_are_resolved_outside_connect() {
        let mut transport = loopback();
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let uri = format!("coap://localhost:{}", server.local_addr().unwrap().port());

        assert!(matches!(transport.connect(&uri), Err(TransportError::Unreachable(_))));
        assert!(transport.has_pending());

        transport.resolve_pending().await;
        assert!(!transport.has_pending());
        let port = server.local_addr().unwrap().port();
        assert!(transport.resolved.get(&uri).is_some_and(|addr| addr.port() == port && addr.ip().is_loopback()));
    }
}
