//! Watch events and the seams to the watcher registry.
//!
//! The registry itself lives outside the engine; the engine only asks it two
//! questions: "who cares about this event right now" (at enqueue time, so
//! later re-registration cannot change delivery) and "which watches are
//! outstanding" (to rebuild server-side watches after a reconnect).

use std::sync::Arc;

use crate::state::{EventType, SessionState};

/// A change delivered to watchers: either a node event reported by the
/// server or a session-state transition observed locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    pub state: SessionState,
    pub event_type: EventType,
    /// `None` for session-state events; the chroot-stripped node path
    /// otherwise.
    pub path: Option<String>,
}

impl WatchedEvent {
    /// A session-state change notification.
    pub fn state_event(state: SessionState) -> Self {
        Self {
            state,
            event_type: EventType::None,
            path: None,
        }
    }
}

/// A callback interested in watch events. Invoked one at a time, in queue
/// order, on the event-dispatch task.
pub trait Watcher: Send + Sync {
    fn process(&self, event: &WatchedEvent);
}

/// The three path sets the server needs to rebuild watches after a
/// reconnect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutstandingWatches {
    pub data: Vec<String>,
    pub exist: Vec<String>,
    pub child: Vec<String>,
}

impl OutstandingWatches {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.exist.is_empty() && self.child.is_empty()
    }
}

/// The registry the facade owns. Queried, never mutated, by the engine.
pub trait WatcherRegistry: Send + Sync {
    /// The watchers to deliver `(state, event_type, path)` to, captured at
    /// the moment the event is queued.
    fn materialize(
        &self,
        state: SessionState,
        event_type: EventType,
        path: Option<&str>,
    ) -> Vec<Arc<dyn Watcher>>;

    /// Watch paths (client-relative) that should be re-registered with the
    /// server on reconnect.
    fn outstanding(&self) -> OutstandingWatches;
}

/// Records one watch in the registry once the server has answered the
/// request that asked for it. The error code decides what (if anything) gets
/// recorded; an exists-watch, for example, also registers on `NoNode`.
pub trait WatchRegistration: Send {
    fn register(&self, err: i32);
}

/// Translate a server-reported path back into client terms by removing the
/// chroot prefix. An exact match collapses to `/`; paths outside the chroot
/// (which the server should never send) pass through unchanged.
pub(crate) fn strip_chroot(chroot: Option<&str>, server_path: &str) -> String {
    let Some(chroot) = chroot else {
        return server_path.to_owned();
    };
    if server_path == chroot {
        return "/".to_owned();
    }
    match server_path.strip_prefix(chroot) {
        Some(rest) if rest.starts_with('/') => rest.to_owned(),
        _ => server_path.to_owned(),
    }
}

/// Prepend the chroot to a client path for the server's benefit.
pub(crate) fn prepend_chroot(chroot: Option<&str>, client_path: &str) -> String {
    match chroot {
        None => client_path.to_owned(),
        Some(chroot) if client_path == "/" => chroot.to_owned(),
        Some(chroot) => format!("{chroot}{client_path}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_without_chroot_is_identity() {
        assert_eq!(strip_chroot(None, "/foo"), "/foo");
    }

    #[test]
    fn strip_exact_match_yields_root() {
        assert_eq!(strip_chroot(Some("/chroot"), "/chroot"), "/");
    }

    #[test]
    fn strip_removes_prefix() {
        assert_eq!(strip_chroot(Some("/chroot"), "/chroot/foo"), "/foo");
        assert_eq!(strip_chroot(Some("/a/b"), "/a/b/c/d"), "/c/d");
    }

    #[test]
    fn strip_does_not_eat_sibling_prefixes() {
        // "/chrooted" is not under "/chroot".
        assert_eq!(strip_chroot(Some("/chroot"), "/chrooted"), "/chrooted");
    }

    #[test]
    fn prepend_round_trips_with_strip() {
        for path in ["/", "/foo", "/foo/bar"] {
            let server = prepend_chroot(Some("/app"), path);
            assert_eq!(strip_chroot(Some("/app"), &server), path);
        }
    }
}
