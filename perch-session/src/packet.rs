//! The in-flight request/response unit.
//!
//! A packet's on-wire form is fixed at construction; everything mutable
//! (reply header, response body, registration) lives behind one lock, and
//! the terminal `finished` flag is a sequentially-consistent store observed
//! by the caller. Once `finished` is set, nothing mutates again.

use std::any::Any;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

use perch_wire::frame::frame;
use perch_wire::{
    AuthPacket, ConnectRequest, Decode, DecodeError, Encode, ErrorCode, OpCode, Reader,
    ReplyHeader, RequestHeader, SetWatches, xid,
};

use crate::state::SessionState;
use crate::sync::lock;
use crate::watch::WatchRegistration;

/// A response body slot: deserialized into when the reply arrives with
/// `err == 0`, retrievable by the caller afterwards.
///
/// Implemented for every wire record via the blanket impl; callers queue a
/// `Box<SomeResponse>::default()` and take it back once the packet finishes.
pub trait ResponseBody: Send + 'static {
    fn read_from(&mut self, r: &mut Reader<'_>) -> Result<(), DecodeError>;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T> ResponseBody for T
where
    T: Decode + Send + 'static,
{
    fn read_from(&mut self, r: &mut Reader<'_>) -> Result<(), DecodeError> {
        *self = T::decode(r)?;
        Ok(())
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

struct Slots {
    reply_header: Option<ReplyHeader>,
    response: Option<Box<dyn ResponseBody>>,
    registration: Option<Box<dyn WatchRegistration>>,
}

struct PacketShared {
    header: Option<RequestHeader>,
    serialized: Vec<u8>,
    client_path: Option<String>,
    server_path: Option<String>,
    slots: Mutex<Slots>,
    finished: AtomicBool,
    done: Notify,
}

/// Handle to one in-flight request. Cheap to clone; all clones observe the
/// same completion.
#[derive(Clone)]
pub struct Packet {
    shared: Arc<PacketShared>,
}

impl Packet {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        header: Option<RequestHeader>,
        request: Option<&dyn Encode>,
        response: Option<Box<dyn ResponseBody>>,
        client_path: Option<String>,
        server_path: Option<String>,
        registration: Option<Box<dyn WatchRegistration>>,
    ) -> Self {
        let mut payload = Vec::new();
        if let Some(h) = &header {
            h.encode(&mut payload);
        }
        if let Some(request) = request {
            request.encode(&mut payload);
        }
        Self {
            shared: Arc::new(PacketShared {
                header,
                serialized: frame(&payload),
                client_path,
                server_path,
                slots: Mutex::new(Slots {
                    reply_header: None,
                    response,
                    registration,
                }),
                finished: AtomicBool::new(false),
                done: Notify::new(),
            }),
        }
    }

    /// The session-establishing packet: body only, no header.
    pub(crate) fn connect(req: &ConnectRequest) -> Self {
        Self::new(None, Some(req), None, None, None, None)
    }

    /// Keep-alive: header only, fire-and-forget.
    pub(crate) fn ping() -> Self {
        Self::new(
            Some(RequestHeader::new(xid::PING, OpCode::Ping)),
            None,
            None,
            None,
            None,
            None,
        )
    }

    pub(crate) fn auth(auth: &AuthPacket) -> Self {
        Self::new(
            Some(RequestHeader::new(xid::AUTH, OpCode::Auth)),
            Some(auth),
            None,
            None,
            None,
            None,
        )
    }

    pub(crate) fn set_watches(watches: &SetWatches) -> Self {
        Self::new(
            Some(RequestHeader::new(xid::SET_WATCHES, OpCode::SetWatches)),
            Some(watches),
            None,
            None,
            None,
            None,
        )
    }

    pub fn request_header(&self) -> Option<RequestHeader> {
        self.shared.header
    }

    /// The precomputed length-prefixed on-wire bytes.
    pub(crate) fn serialized(&self) -> &[u8] {
        &self.shared.serialized
    }

    pub fn client_path(&self) -> Option<&str> {
        self.shared.client_path.as_deref()
    }

    pub fn server_path(&self) -> Option<&str> {
        self.shared.server_path.as_deref()
    }

    /// Whether this packet enters the pending queue when sent. Pings and
    /// auth packets do not: their replies are routed by reserved xid.
    pub(crate) fn expects_pending_reply(&self) -> bool {
        match self.shared.header {
            Some(h) => h.op != OpCode::Ping.code() && h.op != OpCode::Auth.code(),
            None => false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::SeqCst)
    }

    /// Resolve once the packet has been finalized, successfully or not.
    pub async fn wait_finished(&self) {
        loop {
            let notified = self.shared.done.notified();
            if self.is_finished() {
                return;
            }
            notified.await;
        }
    }

    /// The reply header, once finished. `None` until then.
    pub fn reply_header(&self) -> Option<ReplyHeader> {
        lock(&self.shared.slots).reply_header
    }

    /// The reply's error code, once finished.
    pub fn err(&self) -> Option<i32> {
        self.reply_header().map(|h| h.err)
    }

    /// Take back the response body that was queued with the request.
    pub fn take_response<T: 'static>(&self) -> Option<Box<T>> {
        let body = lock(&self.shared.slots).response.take()?;
        body.into_any().downcast::<T>().ok()
    }

    /// Deserialize the remaining reply payload into the response slot, if
    /// one was declared.
    pub(crate) fn deserialize_response(&self, r: &mut Reader<'_>) -> Result<(), DecodeError> {
        let mut slots = lock(&self.shared.slots);
        if let Some(body) = slots.response.as_mut() {
            body.read_from(r)?;
        }
        Ok(())
    }

    /// Record the reply and mark the packet finished. Invokes the watch
    /// registration with the reply's error code first, so the registry
    /// reflects the watch before any caller observes completion.
    pub(crate) fn finish(&self, reply: ReplyHeader) {
        if self.is_finished() {
            return;
        }
        let registration = {
            let mut slots = lock(&self.shared.slots);
            slots.reply_header = Some(reply);
            slots.registration.take()
        };
        if let Some(registration) = registration {
            registration.register(reply.err);
        }
        self.shared.finished.store(true, Ordering::SeqCst);
        self.shared.done.notify_waiters();
    }

    /// Finalize a packet that will never get a server reply. The error code
    /// depends on why the session cannot carry it.
    pub(crate) fn finish_conn_loss(&self, state: SessionState) {
        let err = match state {
            SessionState::AuthFailed => ErrorCode::AuthFailed,
            SessionState::Closed => ErrorCode::SessionExpired,
            SessionState::NotConnected | SessionState::Connecting | SessionState::Connected => {
                ErrorCode::ConnectionLoss
            }
        };
        let xid = self.shared.header.map(|h| h.xid).unwrap_or(0);
        self.finish(ReplyHeader {
            xid,
            zxid: -1,
            err: err.code(),
        });
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("header", &self.shared.header)
            .field("finished", &self.is_finished())
            .field("client_path", &self.shared.client_path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perch_wire::GetDataResponse;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn serialized_form_is_frame_of_header_and_body() {
        let p = Packet::ping();
        // 4-byte length prefix + 8-byte header, nothing else.
        assert_eq!(p.serialized().len(), 12);
        assert_eq!(&p.serialized()[..4], &8u32.to_be_bytes());
        let mut r = Reader::new(&p.serialized()[4..]);
        let h = RequestHeader::decode(&mut r).unwrap();
        assert_eq!(h.xid, xid::PING);
        assert_eq!(h.op, OpCode::Ping.code());
    }

    #[test]
    fn pings_and_auth_skip_the_pending_queue() {
        assert!(!Packet::ping().expects_pending_reply());
        assert!(
            !Packet::auth(&AuthPacket {
                auth_type: 0,
                scheme: "digest".into(),
                auth: vec![],
            })
            .expects_pending_reply()
        );
        assert!(
            Packet::set_watches(&SetWatches::default()).expects_pending_reply()
        );
        assert!(!Packet::connect(&ConnectRequest::default()).expects_pending_reply());
    }

    #[test]
    fn conn_loss_error_tracks_session_state() {
        let cases = [
            (SessionState::NotConnected, ErrorCode::ConnectionLoss),
            (SessionState::Connected, ErrorCode::ConnectionLoss),
            (SessionState::Closed, ErrorCode::SessionExpired),
            (SessionState::AuthFailed, ErrorCode::AuthFailed),
        ];
        for (state, expected) in cases {
            let p = Packet::new(
                Some(RequestHeader::new(5, OpCode::GetData)),
                None,
                None,
                None,
                None,
                None,
            );
            p.finish_conn_loss(state);
            assert!(p.is_finished());
            assert_eq!(p.err(), Some(expected.code()));
        }
    }

    #[test]
    fn finish_is_idempotent_and_freezes_the_reply() {
        let p = Packet::new(
            Some(RequestHeader::new(1, OpCode::GetData)),
            None,
            None,
            None,
            None,
            None,
        );
        p.finish(ReplyHeader { xid: 1, zxid: 10, err: 0 });
        p.finish(ReplyHeader { xid: 1, zxid: 99, err: -4 });
        assert_eq!(p.reply_header(), Some(ReplyHeader { xid: 1, zxid: 10, err: 0 }));
    }

    #[test]
    fn registration_sees_the_reply_error() {
        struct Recording(Arc<AtomicI32>);
        impl WatchRegistration for Recording {
            fn register(&self, err: i32) {
                self.0.store(err, Ordering::SeqCst);
            }
        }

        let seen = Arc::new(AtomicI32::new(i32::MIN));
        let p = Packet::new(
            Some(RequestHeader::new(2, OpCode::Exists)),
            None,
            None,
            Some("/node".into()),
            Some("/node".into()),
            Some(Box::new(Recording(seen.clone()))),
        );
        p.finish(ReplyHeader {
            xid: 2,
            zxid: 3,
            err: ErrorCode::NoNode.code(),
        });
        assert_eq!(seen.load(Ordering::SeqCst), ErrorCode::NoNode.code());
    }

    #[test]
    fn response_slot_round_trip() {
        let p = Packet::new(
            Some(RequestHeader::new(3, OpCode::GetData)),
            None,
            Some(Box::new(GetDataResponse::default())),
            None,
            None,
            None,
        );
        let reply_body = GetDataResponse {
            data: vec![1, 2, 3],
            ..GetDataResponse::default()
        };
        let bytes = reply_body.to_vec();
        p.deserialize_response(&mut Reader::new(&bytes)).unwrap();
        p.finish(ReplyHeader { xid: 3, zxid: 4, err: 0 });

        let got = p.take_response::<GetDataResponse>().unwrap();
        assert_eq!(*got, reply_body);
        // A second take yields nothing.
        assert!(p.take_response::<GetDataResponse>().is_none());
    }

    #[tokio::test]
    async fn wait_finished_resolves_for_late_and_early_waiters() {
        let p = Packet::ping();
        let waiter = {
            let p = p.clone();
            tokio::spawn(async move { p.wait_finished().await })
        };
        tokio::task::yield_now().await;
        p.finish(ReplyHeader { xid: xid::PING, zxid: -1, err: 0 });
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        // Already finished: resolves immediately.
        p.wait_finished().await;
    }
}
