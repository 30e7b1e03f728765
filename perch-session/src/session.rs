//! Session construction and the public handle.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tracing::debug;

use perch_wire::frame::DEFAULT_PACKET_LEN_MAX;
use perch_wire::{AuthPacket, Encode, OpCode, RequestHeader};

use crate::dispatch::{EventDispatcher, EventSink};
use crate::driver::Driver;
use crate::packet::{Packet, ResponseBody};
use crate::state::{SessionState, StateCell};
use crate::sync::{Flag, lock};
use crate::watch::{WatchRegistration, WatchedEvent, WatcherRegistry};

/// Server-assigned session identity, logged in hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SessionId(pub i64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// One credential handed to the server on every (re)connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    pub scheme: String,
    pub auth: Vec<u8>,
}

/// Static session parameters. The server list is pre-resolved; the engine
/// does no discovery of its own.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub servers: Vec<SocketAddr>,
    /// The timeout requested in the handshake; the server may negotiate it
    /// down. Drives the ping interval and the read deadline until then.
    pub session_timeout: Duration,
    /// Frames at or above this payload size are fatal protocol errors.
    pub packet_len_max: usize,
    /// Fixed prefix virtually prepended to all client paths and stripped
    /// from all server-reported paths.
    pub chroot: Option<String>,
    /// Credentials replayed on every connect.
    pub auth: Vec<AuthInfo>,
    /// Re-register outstanding watches with the server after a reconnect.
    pub reset_watches: bool,
}

impl SessionConfig {
    pub fn new(servers: Vec<SocketAddr>) -> Self {
        Self {
            servers,
            session_timeout: Duration::from_secs(30),
            packet_len_max: DEFAULT_PACKET_LEN_MAX,
            chroot: None,
            auth: Vec::new(),
            reset_watches: true,
        }
    }
}

/// Rejected session configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// The server list was empty.
    NoServers,
    /// The chroot is not an absolute, slash-rooted path without a trailing
    /// slash.
    BadChroot(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NoServers => write!(f, "at least one server address is required"),
            ConfigError::BadChroot(chroot) => write!(f, "invalid chroot path: {chroot:?}"),
        }
    }
}

impl std::error::Error for ConfigError {}

const MIN_PING_INTERVAL_MS: u64 = 10;

/// State shared by the handle and the worker tasks.
pub(crate) struct Shared {
    pub(crate) config: SessionConfig,
    state: StateCell,
    session_id: AtomicI64,
    passwd: Mutex<Vec<u8>>,
    auth: Mutex<Vec<AuthInfo>>,
    last_zxid: AtomicI64,
    next_xid: AtomicI32,
    negotiated_timeout_ms: AtomicI32,
    ping_interval_ms: AtomicU64,
    read_timeout_ms: AtomicU64,
    closing: AtomicBool,
    pub(crate) closed_by_server: AtomicBool,
    pub(crate) sent_count: AtomicU64,
    pub(crate) recv_count: AtomicU64,
    events: EventSink,
}

impl Shared {
    fn new(config: SessionConfig, events: EventSink) -> Self {
        let auth = config.auth.clone();
        let shared = Self {
            config,
            state: StateCell::new(SessionState::NotConnected),
            session_id: AtomicI64::new(0),
            passwd: Mutex::new(Vec::new()),
            auth: Mutex::new(auth),
            last_zxid: AtomicI64::new(0),
            next_xid: AtomicI32::new(1),
            negotiated_timeout_ms: AtomicI32::new(0),
            ping_interval_ms: AtomicU64::new(0),
            read_timeout_ms: AtomicU64::new(0),
            closing: AtomicBool::new(false),
            closed_by_server: AtomicBool::new(false),
            sent_count: AtomicU64::new(0),
            recv_count: AtomicU64::new(0),
            events,
        };
        shared.set_timeouts(shared.config.session_timeout.as_millis() as i32);
        shared
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Move the state cell, emitting the session-state events the edges
    /// demand: entering `Connected` queues `SyncConnected`, and leaving
    /// `Connected` for `NotConnected` queues `Disconnected`. Returns the
    /// previous state.
    pub(crate) fn transition(&self, next: SessionState) -> SessionState {
        let prev = self.state.transition(next);
        if !prev.is_alive() || prev == next {
            return prev;
        }
        match next {
            SessionState::Connected => {
                self.queue_event(WatchedEvent::state_event(SessionState::Connected));
            }
            SessionState::NotConnected if prev == SessionState::Connected => {
                self.queue_event(WatchedEvent::state_event(SessionState::NotConnected));
            }
            _ => {}
        }
        prev
    }

    pub(crate) fn queue_event(&self, event: WatchedEvent) {
        self.events.queue_event(event);
    }

    pub(crate) fn session_id(&self) -> i64 {
        self.session_id.load(Ordering::SeqCst)
    }

    pub(crate) fn set_session(&self, id: i64, passwd: Vec<u8>) {
        self.session_id.store(id, Ordering::SeqCst);
        *lock(&self.passwd) = passwd;
    }

    pub(crate) fn passwd(&self) -> Vec<u8> {
        lock(&self.passwd).clone()
    }

    pub(crate) fn auth_credentials(&self) -> Vec<AuthInfo> {
        lock(&self.auth).clone()
    }

    pub(crate) fn push_auth(&self, info: AuthInfo) {
        lock(&self.auth).push(info);
    }

    pub(crate) fn last_zxid(&self) -> i64 {
        self.last_zxid.load(Ordering::SeqCst)
    }

    /// `last_zxid` only ever moves forward, including across reconnects.
    pub(crate) fn observe_zxid(&self, zxid: i64) {
        self.last_zxid.fetch_max(zxid, Ordering::SeqCst);
    }

    pub(crate) fn next_xid(&self) -> i32 {
        self.next_xid.fetch_add(1, Ordering::SeqCst)
    }

    /// Recompute the deadlines derived from the (negotiated) timeout.
    pub(crate) fn set_timeouts(&self, timeout_ms: i32) {
        self.negotiated_timeout_ms.store(timeout_ms, Ordering::SeqCst);
        let timeout_ms = timeout_ms.max(0) as u64;
        self.ping_interval_ms
            .store((timeout_ms / 3).max(MIN_PING_INTERVAL_MS), Ordering::SeqCst);
        self.read_timeout_ms
            .store((timeout_ms * 2 / 3).max(MIN_PING_INTERVAL_MS), Ordering::SeqCst);
    }

    pub(crate) fn negotiated_timeout_ms(&self) -> i32 {
        self.negotiated_timeout_ms.load(Ordering::SeqCst)
    }

    pub(crate) fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.load(Ordering::SeqCst))
    }

    pub(crate) fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.load(Ordering::SeqCst))
    }

    pub(crate) fn closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub(crate) fn set_closing(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }
}

/// Validate the configuration and spawn the session's worker tasks.
///
/// Must be called from within a tokio runtime. The returned handle is the
/// engine's inbound interface; [`SessionHandle::dispose`] tears everything
/// down.
pub fn start(
    config: SessionConfig,
    registry: Arc<dyn WatcherRegistry>,
) -> Result<SessionHandle, ConfigError> {
    if config.servers.is_empty() {
        return Err(ConfigError::NoServers);
    }
    if let Some(chroot) = &config.chroot {
        if !chroot.starts_with('/') || chroot.len() < 2 || chroot.ends_with('/') {
            return Err(ConfigError::BadChroot(chroot.clone()));
        }
    }

    let (events, event_rx) = EventSink::new(registry.clone());
    let shared = Arc::new(Shared::new(config, events));
    let cancel = Arc::new(Flag::new());
    let (outgoing_tx, outgoing_rx) = unbounded_channel();
    let pending = Arc::new(Mutex::new(VecDeque::new()));

    let dispatcher = tokio::spawn(EventDispatcher::new(event_rx, cancel.clone()).run());
    let driver = tokio::spawn(
        Driver::new(shared.clone(), registry, outgoing_rx, pending, cancel.clone()).run(),
    );

    Ok(SessionHandle {
        shared,
        outgoing_tx,
        cancel,
        tasks: Mutex::new(Some((driver, dispatcher))),
        disposed: AtomicBool::new(false),
    })
}

/// The engine's inbound interface, held by the facade.
pub struct SessionHandle {
    shared: Arc<Shared>,
    outgoing_tx: UnboundedSender<Packet>,
    cancel: Arc<Flag>,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
    disposed: AtomicBool,
}

impl SessionHandle {
    /// Enqueue one request. The xid is assigned here, at enqueue time.
    ///
    /// When the session is closing or already terminal the packet never
    /// reaches the socket: it is finalized immediately with the
    /// state-appropriate loss code and returned finished.
    pub fn queue_packet(
        &self,
        mut header: Option<RequestHeader>,
        request: Option<&dyn Encode>,
        response: Option<Box<dyn ResponseBody>>,
        client_path: Option<String>,
        server_path: Option<String>,
        registration: Option<Box<dyn WatchRegistration>>,
    ) -> Packet {
        if let Some(h) = header.as_mut() {
            h.xid = self.shared.next_xid();
        }
        let packet = Packet::new(header, request, response, client_path, server_path, registration);

        let state = self.shared.state();
        if self.shared.closing() || !state.is_alive() {
            debug!(
                session = %SessionId(self.shared.session_id()),
                state = %state,
                "rejecting packet queued on a closing session"
            );
            packet.finish_conn_loss(state);
            return packet;
        }
        if header.is_some_and(|h| h.op == OpCode::CloseSession.code()) {
            self.shared.set_closing();
        }
        if self.outgoing_tx.send(packet.clone()).is_err() {
            packet.finish_conn_loss(self.shared.state());
        }
        packet
    }

    /// Queue the session-closing request. Flips the closing flag: nothing
    /// queued afterwards reaches the socket, and the driver stops
    /// reconnecting.
    pub fn close(&self) -> Packet {
        self.queue_packet(
            Some(RequestHeader::new(0, OpCode::CloseSession)),
            None,
            None,
            None,
            None,
            None,
        )
    }

    /// Add a credential. It is sent immediately when connected and replayed
    /// on every subsequent reconnect.
    pub fn add_auth(&self, scheme: impl Into<String>, auth: Vec<u8>) {
        let info = AuthInfo { scheme: scheme.into(), auth };
        self.shared.push_auth(info.clone());
        if self.shared.state().is_connected() {
            let packet = Packet::auth(&AuthPacket {
                auth_type: 0,
                scheme: info.scheme,
                auth: info.auth,
            });
            let _ = self.outgoing_tx.send(packet);
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn session_id(&self) -> i64 {
        self.shared.session_id()
    }

    pub fn negotiated_timeout_ms(&self) -> i32 {
        self.shared.negotiated_timeout_ms()
    }

    pub fn last_zxid(&self) -> i64 {
        self.shared.last_zxid()
    }

    pub fn sent_count(&self) -> u64 {
        self.shared.sent_count.load(Ordering::SeqCst)
    }

    pub fn recv_count(&self) -> u64 {
        self.shared.recv_count.load(Ordering::SeqCst)
    }

    /// Tear the session down: cancel both workers, join them, and let the
    /// dispatcher drain any remaining events so watchers observe the final
    /// transitions. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.transition(SessionState::Closed);
        self.cancel.raise();
        let tasks = lock(&self.tasks).take();
        if let Some((driver, dispatcher)) = tasks {
            let _ = driver.await;
            let _ = dispatcher.await;
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &SessionId(self.shared.session_id()))
            .field("state", &self.shared.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::EventType;
    use crate::watch::{OutstandingWatches, Watcher};

    struct NullRegistry;

    impl WatcherRegistry for NullRegistry {
        fn materialize(
            &self,
            _state: SessionState,
            _event_type: EventType,
            _path: Option<&str>,
        ) -> Vec<Arc<dyn Watcher>> {
            Vec::new()
        }

        fn outstanding(&self) -> OutstandingWatches {
            OutstandingWatches::default()
        }
    }

    fn test_shared() -> Shared {
        let (events, _rx) = EventSink::new(Arc::new(NullRegistry));
        Shared::new(
            SessionConfig::new(vec!["127.0.0.1:2181".parse().unwrap()]),
            events,
        )
    }

    #[test]
    fn session_id_displays_in_hex() {
        assert_eq!(SessionId(0xABCD).to_string(), "0xabcd");
        assert_eq!(SessionId(0).to_string(), "0x0");
    }

    #[test]
    fn empty_server_list_is_rejected() {
        let err = start(SessionConfig::new(Vec::new()), Arc::new(NullRegistry)).unwrap_err();
        assert!(matches!(err, ConfigError::NoServers));
    }

    #[test]
    fn chroot_must_be_a_clean_absolute_path() {
        for bad in ["relative", "/", "/trailing/"] {
            let mut config = SessionConfig::new(vec!["127.0.0.1:2181".parse().unwrap()]);
            config.chroot = Some(bad.to_string());
            let result = start(config, Arc::new(NullRegistry));
            assert!(
                matches!(result, Err(ConfigError::BadChroot(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn timeouts_derive_from_the_negotiated_value() {
        let shared = test_shared();
        shared.set_timeouts(30_000);
        assert_eq!(shared.ping_interval(), Duration::from_millis(10_000));
        assert_eq!(shared.read_timeout(), Duration::from_millis(20_000));
    }

    #[test]
    fn xids_count_up_from_one() {
        let shared = test_shared();
        assert_eq!(shared.next_xid(), 1);
        assert_eq!(shared.next_xid(), 2);
        assert_eq!(shared.next_xid(), 3);
    }

    #[test]
    fn observed_zxid_never_goes_backwards() {
        let shared = test_shared();
        shared.observe_zxid(10);
        shared.observe_zxid(5);
        assert_eq!(shared.last_zxid(), 10);
        shared.observe_zxid(20);
        assert_eq!(shared.last_zxid(), 20);
    }

    #[test]
    fn session_identity_implies_password() {
        let shared = test_shared();
        assert_eq!(shared.session_id(), 0);
        shared.set_session(0xABCD, vec![1, 2]);
        assert_eq!(shared.session_id(), 0xABCD);
        assert_eq!(shared.passwd(), vec![1, 2]);
    }
}
