#![deny(unsafe_code)]

//! Session engine for a ZooKeeper-style hierarchical coordination service.
//!
//! One [`start`]ed session owns a single logical identity against a
//! replicated ensemble: it keeps exactly one framed TCP connection at a
//! time, multiplexes ordered request/response traffic over it, heartbeats
//! with pings, reconnects on failure while preserving the session id and
//! password, and delivers watch notifications to user callbacks.
//!
//! The engine is deliberately thin at its edges. The data-operation surface
//! (create/get/set/delete), the watcher registry, and credential management
//! belong to an outer facade; they talk to the engine through
//! [`SessionHandle::queue_packet`], [`WatcherRegistry`], and
//! [`WatchRegistration`].
//!
//! # Shape
//!
//! Two long-running tasks per session, plus one reader per live socket:
//!
//! - the **send driver** drains the outgoing queue, writes frames, emits
//!   pings when idle, and runs reconnection;
//! - the **socket reader** parses `[len][payload]` frames, completes the
//!   handshake, and matches replies FIFO against the pending queue;
//! - the **event dispatcher** invokes watchers one at a time, with the
//!   interested watcher set captured at enqueue time.

mod dispatch;
mod driver;
mod packet;
mod reader;
mod session;
mod state;
mod sync;
mod watch;

pub use packet::{Packet, ResponseBody};
pub use session::{
    AuthInfo, ConfigError, SessionConfig, SessionHandle, SessionId, start,
};
pub use state::{EventType, SessionState};
pub use watch::{
    OutstandingWatches, WatchRegistration, WatchedEvent, Watcher, WatcherRegistry,
};
