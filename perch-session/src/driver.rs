//! The send driver: owns the socket, drains the outgoing queue, keeps the
//! session alive with pings, and brings connections up and down.
//!
//! For every packet taken off the outgoing queue exactly one of two things
//! happens: it is written to the socket (entering the pending queue first,
//! when it expects a correlated reply), or it is finalized with an error
//! code. Never both.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use perch_wire::{AuthPacket, ConnectRequest, SetWatches};

use crate::packet::Packet;
use crate::reader::SocketReader;
use crate::session::{SessionId, Shared};
use crate::state::SessionState;
use crate::sync::{Flag, lock};
use crate::watch::{WatcherRegistry, prepend_chroot};

/// Pause after cycling through every server without a successful write.
const FULL_CYCLE_BACKOFF: Duration = Duration::from_secs(1);
/// Upper bound on the random pre-reconnect jitter.
const RECONNECT_JITTER_MS: u64 = 50;

struct Conn {
    write: OwnedWriteHalf,
    addr: SocketAddr,
    dead: Arc<Flag>,
    reader: JoinHandle<()>,
}

enum Step {
    Cancelled,
    ConnDead,
    Outgoing(Option<Packet>),
    PingDue,
}

pub(crate) struct Driver {
    shared: Arc<Shared>,
    registry: Arc<dyn WatcherRegistry>,
    outgoing: UnboundedReceiver<Packet>,
    pending: Arc<Mutex<VecDeque<Packet>>>,
    cancel: Arc<Flag>,
    conn: Option<Conn>,
    /// Cursor into the server list for the next attempt.
    next_addr: usize,
    /// Index of the last server a write succeeded against; when the cursor
    /// comes back around to it the whole list has failed and we back off.
    last_connect_index: Option<usize>,
    first_attempt: bool,
    last_send: Instant,
}

impl Driver {
    pub(crate) fn new(
        shared: Arc<Shared>,
        registry: Arc<dyn WatcherRegistry>,
        outgoing: UnboundedReceiver<Packet>,
        pending: Arc<Mutex<VecDeque<Packet>>>,
        cancel: Arc<Flag>,
    ) -> Self {
        Self {
            shared,
            registry,
            outgoing,
            pending,
            cancel,
            conn: None,
            next_addr: 0,
            last_connect_index: None,
            first_attempt: true,
            last_send: Instant::now(),
        }
    }

    pub(crate) async fn run(mut self) {
        while !self.cancel.is_raised() && self.shared.state().is_alive() {
            if self.conn.is_none() {
                if self.shared.closing() {
                    break;
                }
                if let Err(err) = self.connect_once().await {
                    if err.kind() == io::ErrorKind::Interrupted {
                        break;
                    }
                    warn!(
                        session = %SessionId(self.shared.session_id()),
                        error = %err,
                        "connect attempt failed"
                    );
                    self.shared.transition(SessionState::NotConnected);
                    self.teardown_socket();
                }
                continue;
            }
            self.pump_one().await;
        }
        self.shutdown();
    }

    /// One iteration of the connected loop: wait for whichever comes first
    /// of cancellation, connection death, an outgoing packet, or the ping
    /// deadline.
    async fn pump_one(&mut self) {
        let Some(conn) = self.conn.as_ref() else {
            return;
        };
        let dead = conn.dead.clone();
        let cancel = self.cancel.clone();
        let ping_wait = self
            .shared
            .ping_interval()
            .saturating_sub(self.last_send.elapsed());

        let step = tokio::select! {
            _ = cancel.wait() => Step::Cancelled,
            _ = dead.wait() => Step::ConnDead,
            packet = self.outgoing.recv() => Step::Outgoing(packet),
            _ = tokio::time::sleep(ping_wait) => Step::PingDue,
        };

        match step {
            Step::Cancelled => {}
            Step::ConnDead => self.handle_connection_loss(),
            Step::Outgoing(Some(packet)) => {
                if let Err(err) = self.do_send(&packet).await {
                    self.handle_send_error(err);
                }
            }
            Step::Outgoing(None) => {
                // Every handle is gone; nothing further can be queued.
                debug!(
                    session = %SessionId(self.shared.session_id()),
                    "all handles dropped, winding down"
                );
                self.shared.set_closing();
                self.teardown_socket();
            }
            Step::PingDue => {
                if self.shared.state().is_connected() {
                    trace!(session = %SessionId(self.shared.session_id()), "ping");
                    let ping = Packet::ping();
                    if let Err(err) = self.do_send(&ping).await {
                        self.handle_send_error(err);
                    }
                } else {
                    // Handshake still in flight; restart the ping clock.
                    self.last_send = Instant::now();
                }
            }
        }
    }

    /// Write one packet. Packets expecting a correlated reply enter the
    /// pending queue before their bytes are handed to the socket, so the
    /// pending queue is populated in exact send order.
    async fn do_send(&mut self, packet: &Packet) -> io::Result<()> {
        if packet.expects_pending_reply() {
            lock(&self.pending).push_back(packet.clone());
        }
        let Some(conn) = self.conn.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no active connection",
            ));
        };
        conn.write.write_all(packet.serialized()).await?;
        conn.write.flush().await?;
        self.shared.sent_count.fetch_add(1, Ordering::SeqCst);
        self.last_send = Instant::now();
        Ok(())
    }

    fn handle_send_error(&mut self, err: io::Error) {
        if self.shared.closing() || !self.shared.state().is_alive() {
            debug!(
                session = %SessionId(self.shared.session_id()),
                error = %err,
                "send failed while winding down"
            );
            self.teardown_socket();
            return;
        }
        warn!(
            session = %SessionId(self.shared.session_id()),
            server = %self.conn.as_ref().map(|c| c.addr.to_string()).unwrap_or_default(),
            error = %err,
            "send failed, dropping connection"
        );
        self.handle_connection_loss();
    }

    /// The session survives; only the connection is gone. The next loop
    /// iteration reconnects.
    fn handle_connection_loss(&mut self) {
        let by_server = self.shared.closed_by_server.swap(false, Ordering::SeqCst);
        if !self.shared.closing() {
            self.shared.transition(SessionState::NotConnected);
            debug!(
                session = %SessionId(self.shared.session_id()),
                closed_by_server = by_server,
                "scheduling reconnect"
            );
        }
        self.cleanup();
    }

    /// Close the socket and fail everything queued or in flight with the
    /// state-appropriate loss code.
    fn cleanup(&mut self) {
        self.teardown_socket();
        let state = self.shared.state();
        let mut lost: Vec<Packet> = lock(&self.pending).drain(..).collect();
        while let Ok(packet) = self.outgoing.try_recv() {
            lost.push(packet);
        }
        if !lost.is_empty() {
            debug!(
                session = %SessionId(self.shared.session_id()),
                count = lost.len(),
                "failing queued packets"
            );
        }
        for packet in lost {
            packet.finish_conn_loss(state);
        }
    }

    fn teardown_socket(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.reader.abort();
            drop(conn.write);
        }
    }

    /// One reconnect attempt against the next server on the list.
    async fn connect_once(&mut self) -> io::Result<()> {
        if !self.first_attempt {
            let jitter = rand::thread_rng().gen_range(0..=RECONNECT_JITTER_MS);
            self.idle(Duration::from_millis(jitter)).await?;
        }
        self.first_attempt = false;
        if self.last_connect_index == Some(self.next_addr) {
            self.idle(FULL_CYCLE_BACKOFF).await?;
        }

        let index = self.next_addr;
        let addr = self.shared.config.servers[index];
        self.next_addr = (index + 1) % self.shared.config.servers.len();

        self.shared.transition(SessionState::Connecting);
        self.cleanup();

        info!(
            session = %SessionId(self.shared.session_id()),
            server = %addr,
            "connecting"
        );
        let per_host = self.shared.config.session_timeout / self.shared.config.servers.len() as u32;
        let stream = match tokio::time::timeout(per_host, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
            }
        };
        stream.set_nodelay(true)?;
        stream.set_linger(None)?;

        let (read_half, write_half) = stream.into_split();
        let dead = Arc::new(Flag::new());
        let reader = tokio::spawn(
            SocketReader::new(
                self.shared.clone(),
                read_half,
                self.pending.clone(),
                dead.clone(),
                addr,
            )
            .run(),
        );
        self.conn = Some(Conn {
            write: write_half,
            addr,
            dead,
            reader,
        });
        self.last_send = Instant::now();
        self.prime_connection(index, addr).await
    }

    /// First writes on a fresh socket, in order: the connect request (no
    /// header), one auth packet per credential, and a set-watches request if
    /// the registry has anything outstanding. These precede anything from
    /// the outgoing queue.
    async fn prime_connection(&mut self, index: usize, addr: SocketAddr) -> io::Result<()> {
        let connect = ConnectRequest {
            protocol_version: 0,
            last_zxid_seen: self.shared.last_zxid(),
            timeout_ms: self.shared.config.session_timeout.as_millis() as i32,
            session_id: self.shared.session_id(),
            passwd: self.shared.passwd(),
        };
        self.do_send(&Packet::connect(&connect)).await?;
        // A write succeeded against this server: progress was made, so a
        // full cursor cycle back to here means every server failed since.
        self.last_connect_index = Some(index);

        for cred in self.shared.auth_credentials() {
            let auth = AuthPacket {
                auth_type: 0,
                scheme: cred.scheme,
                auth: cred.auth,
            };
            self.do_send(&Packet::auth(&auth)).await?;
        }

        if self.shared.config.reset_watches {
            let outstanding = self.registry.outstanding();
            if !outstanding.is_empty() {
                let chroot = self.shared.config.chroot.as_deref();
                let server_paths = |paths: Vec<String>| {
                    paths
                        .iter()
                        .map(|p| prepend_chroot(chroot, p))
                        .collect::<Vec<_>>()
                };
                let watches = SetWatches {
                    relative_zxid: self.shared.last_zxid(),
                    data_watches: server_paths(outstanding.data),
                    exist_watches: server_paths(outstanding.exist),
                    child_watches: server_paths(outstanding.child),
                };
                self.do_send(&Packet::set_watches(&watches)).await?;
            }
        }

        debug!(
            session = %SessionId(self.shared.session_id()),
            server = %addr,
            "connection primed"
        );
        Ok(())
    }

    /// Cancellation-aware sleep used by the reconnect pacing.
    async fn idle(&self, wait: Duration) -> io::Result<()> {
        tokio::select! {
            _ = self.cancel.wait() => {
                Err(io::Error::new(io::ErrorKind::Interrupted, "session disposed"))
            }
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }

    /// Final wind-down: refuse further queueing, then fail everything that
    /// never made it onto the wire.
    fn shutdown(&mut self) {
        self.shared.set_closing();
        self.shared.transition(SessionState::Closed);
        self.outgoing.close();
        self.cleanup();
        debug!(
            session = %SessionId(self.shared.session_id()),
            sent = self.shared.sent_count.load(Ordering::SeqCst),
            received = self.shared.recv_count.load(Ordering::SeqCst),
            "session loop exited"
        );
    }
}
