//! Session state and the atomic cell that owns it.

use std::sync::atomic::{AtomicI32, Ordering};

/// The lifecycle state of a session.
///
/// `Closed` and `AuthFailed` are terminal: once either is reached the cell
/// refuses every further transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No live socket; the driver will attempt a reconnect.
    NotConnected,
    /// A socket is open but the session handshake has not completed.
    Connecting,
    /// Handshake complete; requests flow.
    Connected,
    /// The session is over: expired by the server or closed by the user.
    Closed,
    /// The server rejected our credentials.
    AuthFailed,
}

impl SessionState {
    /// Whether the session can still make progress (reconnect, send, receive).
    pub fn is_alive(self) -> bool {
        !matches!(self, SessionState::Closed | SessionState::AuthFailed)
    }

    pub fn is_connected(self) -> bool {
        self == SessionState::Connected
    }

    /// The wire code used in watcher events for this state.
    ///
    /// These are the server's notification-state codes: Disconnected = 0,
    /// SyncConnected = 3, AuthFailed = 4, Expired = −112. `Connecting` never
    /// appears in an event; it shares the disconnected code.
    pub fn wire_code(self) -> i32 {
        match self {
            SessionState::NotConnected | SessionState::Connecting => 0,
            SessionState::Connected => 3,
            SessionState::AuthFailed => 4,
            SessionState::Closed => -112,
        }
    }

    /// Map a notification's state code back to a session state. Codes we do
    /// not track (read-only, SASL) collapse to `NotConnected`.
    pub fn from_wire(code: i32) -> Self {
        match code {
            3 => SessionState::Connected,
            4 => SessionState::AuthFailed,
            -112 => SessionState::Closed,
            _ => SessionState::NotConnected,
        }
    }

    fn cell_code(self) -> i32 {
        match self {
            SessionState::NotConnected => 0,
            SessionState::Connecting => 1,
            SessionState::Connected => 2,
            SessionState::Closed => 3,
            SessionState::AuthFailed => 4,
        }
    }

    fn from_cell_code(code: i32) -> Self {
        match code {
            0 => SessionState::NotConnected,
            1 => SessionState::Connecting,
            2 => SessionState::Connected,
            3 => SessionState::Closed,
            _ => SessionState::AuthFailed,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::NotConnected => "not-connected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Closed => "closed",
            SessionState::AuthFailed => "auth-failed",
        };
        f.write_str(name)
    }
}

/// What a watch notification reports happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// A session-state change rather than a node event.
    None,
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

impl EventType {
    pub fn wire_code(self) -> i32 {
        match self {
            EventType::None => -1,
            EventType::NodeCreated => 1,
            EventType::NodeDeleted => 2,
            EventType::NodeDataChanged => 3,
            EventType::NodeChildrenChanged => 4,
        }
    }

    pub fn from_wire(code: i32) -> Option<Self> {
        Some(match code {
            -1 => EventType::None,
            1 => EventType::NodeCreated,
            2 => EventType::NodeDeleted,
            3 => EventType::NodeDataChanged,
            4 => EventType::NodeChildrenChanged,
            _ => return None,
        })
    }
}

/// Single sequentially-consistent cell holding the session state.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicI32);

impl StateCell {
    pub(crate) fn new(initial: SessionState) -> Self {
        Self(AtomicI32::new(initial.cell_code()))
    }

    pub(crate) fn get(&self) -> SessionState {
        SessionState::from_cell_code(self.0.load(Ordering::SeqCst))
    }

    /// Store `next` unless the current state is terminal. Returns the state
    /// that was current just before the call, so callers can tell which edge
    /// (if any) was taken.
    pub(crate) fn transition(&self, next: SessionState) -> SessionState {
        let mut cur = self.0.load(Ordering::SeqCst);
        loop {
            let cur_state = SessionState::from_cell_code(cur);
            if !cur_state.is_alive() {
                return cur_state;
            }
            match self.0.compare_exchange(
                cur,
                next.cell_code(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return cur_state,
                Err(actual) => cur = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinary_transitions_take_effect() {
        let cell = StateCell::new(SessionState::NotConnected);
        assert_eq!(cell.transition(SessionState::Connecting), SessionState::NotConnected);
        assert_eq!(cell.transition(SessionState::Connected), SessionState::Connecting);
        assert_eq!(cell.get(), SessionState::Connected);
    }

    #[test]
    fn terminal_states_are_sticky() {
        let cell = StateCell::new(SessionState::Connected);
        cell.transition(SessionState::Closed);
        assert_eq!(cell.transition(SessionState::Connecting), SessionState::Closed);
        assert_eq!(cell.get(), SessionState::Closed);

        let cell = StateCell::new(SessionState::Connecting);
        cell.transition(SessionState::AuthFailed);
        assert_eq!(cell.transition(SessionState::Closed), SessionState::AuthFailed);
        assert_eq!(cell.get(), SessionState::AuthFailed);
    }

    #[test]
    fn wire_codes_round_trip_for_event_states() {
        for state in [
            SessionState::NotConnected,
            SessionState::Connected,
            SessionState::Closed,
            SessionState::AuthFailed,
        ] {
            assert_eq!(SessionState::from_wire(state.wire_code()), state);
        }
    }

    #[test]
    fn event_types_round_trip() {
        for ty in [
            EventType::None,
            EventType::NodeCreated,
            EventType::NodeDeleted,
            EventType::NodeDataChanged,
            EventType::NodeChildrenChanged,
        ] {
            assert_eq!(EventType::from_wire(ty.wire_code()), Some(ty));
        }
        assert_eq!(EventType::from_wire(99), None);
    }
}
