//! The receive path: one task per live socket.
//!
//! Reads `[len][payload]` frames, routes the first payload to handshake
//! handling and everything after it to reply routing. Any failure here is
//! reported by raising the connection's dead flag; the send driver notices
//! and runs recovery. A partially read frame is simply abandoned with the
//! socket.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tracing::{debug, info, trace, warn};

use perch_wire::frame::check_frame_len;
use perch_wire::{ConnectResponse, Decode, ErrorCode, Reader, ReplyHeader, WatcherEvent, xid};

use crate::packet::Packet;
use crate::session::{SessionId, Shared};
use crate::state::{EventType, SessionState};
use crate::sync::{Flag, lock};
use crate::watch::{WatchedEvent, strip_chroot};

fn invalid_data(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

pub(crate) struct SocketReader {
    shared: Arc<Shared>,
    read: OwnedReadHalf,
    pending: Arc<Mutex<VecDeque<Packet>>>,
    dead: Arc<Flag>,
    addr: SocketAddr,
}

impl SocketReader {
    pub(crate) fn new(
        shared: Arc<Shared>,
        read: OwnedReadHalf,
        pending: Arc<Mutex<VecDeque<Packet>>>,
        dead: Arc<Flag>,
        addr: SocketAddr,
    ) -> Self {
        Self {
            shared,
            read,
            pending,
            dead,
            addr,
        }
    }

    pub(crate) async fn run(mut self) {
        // The first payload on a fresh socket is always the connect result.
        let mut initialized = false;
        loop {
            let payload = match self.read_frame().await {
                Ok(payload) => payload,
                Err(err) => {
                    self.connection_down(&err);
                    return;
                }
            };
            self.shared.recv_count.fetch_add(1, Ordering::SeqCst);

            let outcome = if initialized {
                self.read_response(&payload)
            } else {
                initialized = true;
                self.read_connect_result(&payload)
            };
            match outcome {
                // Keep reading.
                Ok(true) => {}
                // Terminal state reached; the handler already logged and
                // transitioned. Wake the driver so it can wind down.
                Ok(false) => {
                    self.dead.raise();
                    return;
                }
                Err(err) => {
                    self.connection_down(&err);
                    return;
                }
            }
        }
    }

    /// One length-prefixed frame, reassembled across however many reads the
    /// kernel delivers it in. Bounded by the read deadline.
    async fn read_frame(&mut self) -> io::Result<Vec<u8>> {
        let deadline = self.shared.read_timeout();
        let mut len_buf = [0u8; 4];
        self.read_exact_deadline(&mut len_buf, deadline).await?;

        let len = i32::from_be_bytes(len_buf);
        let len = check_frame_len(len, self.shared.config.packet_len_max).map_err(invalid_data)?;

        let mut payload = vec![0u8; len];
        self.read_exact_deadline(&mut payload, deadline).await?;
        Ok(payload)
    }

    async fn read_exact_deadline(&mut self, buf: &mut [u8], deadline: Duration) -> io::Result<()> {
        match tokio::time::timeout(deadline, self.read.read_exact(buf)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "no data within the read deadline",
            )),
        }
    }

    fn connection_down(&self, err: &io::Error) {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            self.shared.closed_by_server.store(true, Ordering::SeqCst);
        }
        if self.shared.closing() {
            debug!(
                session = %SessionId(self.shared.session_id()),
                server = %self.addr,
                "socket closed while closing session"
            );
        } else {
            warn!(
                session = %SessionId(self.shared.session_id()),
                server = %self.addr,
                error = %err,
                "connection lost"
            );
            self.shared.transition(SessionState::NotConnected);
        }
        self.dead.raise();
    }

    /// Handshake result handling. Returns whether to keep reading.
    fn read_connect_result(&self, payload: &[u8]) -> io::Result<bool> {
        let mut r = Reader::new(payload);
        let resp = ConnectResponse::decode(&mut r).map_err(invalid_data)?;

        if resp.timeout_ms <= 0 {
            warn!(
                session = %SessionId(self.shared.session_id()),
                server = %self.addr,
                "server declared the session expired"
            );
            self.shared
                .queue_event(WatchedEvent::state_event(SessionState::Closed));
            self.shared.transition(SessionState::Closed);
            return Ok(false);
        }

        self.shared.set_session(resp.session_id, resp.passwd);
        self.shared.set_timeouts(resp.timeout_ms);
        info!(
            session = %SessionId(resp.session_id),
            server = %self.addr,
            negotiated_timeout_ms = resp.timeout_ms,
            "session established"
        );
        self.shared.transition(SessionState::Connected);
        Ok(true)
    }

    /// Route one reply by xid. Returns whether to keep reading.
    fn read_response(&self, payload: &[u8]) -> io::Result<bool> {
        let mut r = Reader::new(payload);
        let reply = ReplyHeader::decode(&mut r).map_err(invalid_data)?;

        match reply.xid {
            xid::PING => {
                trace!(
                    session = %SessionId(self.shared.session_id()),
                    zxid = reply.zxid,
                    "pong"
                );
                Ok(true)
            }
            xid::AUTH => {
                if reply.err == ErrorCode::AuthFailed.code() {
                    warn!(
                        session = %SessionId(self.shared.session_id()),
                        server = %self.addr,
                        "authentication failed"
                    );
                    self.shared
                        .queue_event(WatchedEvent::state_event(SessionState::AuthFailed));
                    self.shared.transition(SessionState::AuthFailed);
                    Ok(false)
                } else {
                    debug!(session = %SessionId(self.shared.session_id()), "auth accepted");
                    Ok(true)
                }
            }
            xid::NOTIFICATION => {
                self.handle_notification(&mut r)?;
                Ok(true)
            }
            _ => self.handle_reply(reply, &mut r),
        }
    }

    fn handle_notification(&self, r: &mut Reader<'_>) -> io::Result<()> {
        let event = WatcherEvent::decode(r).map_err(invalid_data)?;
        let Some(event_type) = EventType::from_wire(event.event_type) else {
            warn!(code = event.event_type, "ignoring notification with unknown event type");
            return Ok(());
        };
        let state = SessionState::from_wire(event.state);
        let path = if event_type == EventType::None {
            None
        } else {
            Some(strip_chroot(
                self.shared.config.chroot.as_deref(),
                &event.path,
            ))
        };
        debug!(
            session = %SessionId(self.shared.session_id()),
            event_type = ?event_type,
            path = path.as_deref().unwrap_or(""),
            "notification"
        );
        self.shared.queue_event(WatchedEvent {
            state,
            event_type,
            path,
        });
        Ok(())
    }

    /// Match a reply against the front of the pending queue. The server
    /// answers in exact send order; anything else is unrecoverable on this
    /// connection.
    fn handle_reply(&self, reply: ReplyHeader, r: &mut Reader<'_>) -> io::Result<bool> {
        let packet = lock(&self.pending).pop_front();
        let Some(packet) = packet else {
            return Err(invalid_data(format!(
                "reply with xid {} but nothing pending",
                reply.xid
            )));
        };

        let expected = packet.request_header().map(|h| h.xid).unwrap_or(0);
        if expected != reply.xid {
            warn!(
                session = %SessionId(self.shared.session_id()),
                server = %self.addr,
                expected,
                got = reply.xid,
                "reply out of order, dropping connection"
            );
            packet.finish(ReplyHeader {
                err: ErrorCode::ConnectionLoss.code(),
                ..reply
            });
            return Err(invalid_data(format!(
                "expected reply for xid {expected}, got {}",
                reply.xid
            )));
        }

        if reply.zxid > 0 {
            self.shared.observe_zxid(reply.zxid);
        }
        if reply.err == ErrorCode::Ok.code() {
            if let Err(err) = packet.deserialize_response(r) {
                packet.finish(ReplyHeader {
                    err: ErrorCode::MarshallingError.code(),
                    ..reply
                });
                return Err(invalid_data(err));
            }
        }
        packet.finish(reply);
        trace!(
            session = %SessionId(self.shared.session_id()),
            xid = reply.xid,
            zxid = reply.zxid,
            err = reply.err,
            "request completed"
        );
        Ok(true)
    }
}
