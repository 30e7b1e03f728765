//! The event-dispatch side of the engine.
//!
//! Producers (the send driver and the socket reader) hand events to
//! [`EventSink::queue_event`], which captures the interested watchers at
//! enqueue time and pushes the pair onto an unbounded queue. A single task
//! drains that queue and invokes watchers one at a time, so user callbacks
//! never run concurrently with each other.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{debug, error};

use crate::state::EventType;
use crate::sync::Flag;
use crate::watch::{WatchedEvent, Watcher, WatcherRegistry};

pub(crate) struct Delivery {
    event: WatchedEvent,
    watchers: Vec<Arc<dyn Watcher>>,
}

/// Producer half: enqueue-time dedup and watcher materialization.
pub(crate) struct EventSink {
    tx: UnboundedSender<Delivery>,
    registry: Arc<dyn WatcherRegistry>,
    /// Wire code of the last session state queued, for dedup of
    /// back-to-back identical state events.
    last_queued_state: AtomicI32,
}

impl EventSink {
    pub(crate) fn new(registry: Arc<dyn WatcherRegistry>) -> (Self, UnboundedReceiver<Delivery>) {
        let (tx, rx) = unbounded_channel();
        let sink = Self {
            tx,
            registry,
            // Matches the pre-connect session state.
            last_queued_state: AtomicI32::new(crate::state::SessionState::NotConnected.wire_code()),
        };
        (sink, rx)
    }

    pub(crate) fn queue_event(&self, event: WatchedEvent) {
        let code = event.state.wire_code();
        let prev = self.last_queued_state.swap(code, Ordering::SeqCst);
        if event.event_type == EventType::None && prev == code {
            return;
        }
        let watchers =
            self.registry
                .materialize(event.state, event.event_type, event.path.as_deref());
        debug!(
            state = %event.state,
            event_type = ?event.event_type,
            path = event.path.as_deref().unwrap_or(""),
            watcher_count = watchers.len(),
            "queueing event"
        );
        // Send only fails after dispose has torn the dispatcher down.
        let _ = self.tx.send(Delivery { event, watchers });
    }
}

/// Consumer half: the long-running dispatch task.
pub(crate) struct EventDispatcher {
    rx: UnboundedReceiver<Delivery>,
    cancel: Arc<Flag>,
}

impl EventDispatcher {
    pub(crate) fn new(rx: UnboundedReceiver<Delivery>, cancel: Arc<Flag>) -> Self {
        Self { rx, cancel }
    }

    pub(crate) async fn run(mut self) {
        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.wait() => break,
                delivery = self.rx.recv() => match delivery {
                    Some(delivery) => dispatch(delivery),
                    None => return,
                },
            }
        }
        // Cancelled: drain whatever is already queued so watchers observe
        // the final state transitions before the task exits.
        self.rx.close();
        while let Ok(delivery) = self.rx.try_recv() {
            dispatch(delivery);
        }
    }
}

fn dispatch(delivery: Delivery) {
    for watcher in &delivery.watchers {
        let result = catch_unwind(AssertUnwindSafe(|| watcher.process(&delivery.event)));
        if result.is_err() {
            error!(
                event_type = ?delivery.event.event_type,
                path = delivery.event.path.as_deref().unwrap_or(""),
                "watcher panicked; continuing with remaining watchers"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SessionState;
    use crate::watch::OutstandingWatches;
    use std::sync::Mutex;
    use std::time::Duration;

    struct FanoutRegistry {
        watchers: Vec<Arc<dyn Watcher>>,
    }

    impl WatcherRegistry for FanoutRegistry {
        fn materialize(
            &self,
            _state: SessionState,
            _event_type: EventType,
            _path: Option<&str>,
        ) -> Vec<Arc<dyn Watcher>> {
            self.watchers.clone()
        }

        fn outstanding(&self) -> OutstandingWatches {
            OutstandingWatches::default()
        }
    }

    struct Recording(Arc<Mutex<Vec<WatchedEvent>>>);

    impl Watcher for Recording {
        fn process(&self, event: &WatchedEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    struct Panicking;

    impl Watcher for Panicking {
        fn process(&self, _event: &WatchedEvent) {
            panic!("bad watcher");
        }
    }

    fn recording_watcher(log: Arc<Mutex<Vec<WatchedEvent>>>) -> Arc<dyn Watcher> {
        Arc::new(Recording(log))
    }

    #[tokio::test]
    async fn duplicate_state_events_are_dropped_at_enqueue() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(FanoutRegistry {
            watchers: vec![recording_watcher(log.clone())],
        });
        let (sink, rx) = EventSink::new(registry);
        let cancel = Arc::new(Flag::new());
        let task = tokio::spawn(EventDispatcher::new(rx, cancel.clone()).run());

        sink.queue_event(WatchedEvent::state_event(SessionState::Connected));
        sink.queue_event(WatchedEvent::state_event(SessionState::Connected));
        sink.queue_event(WatchedEvent::state_event(SessionState::NotConnected));
        sink.queue_event(WatchedEvent::state_event(SessionState::NotConnected));
        sink.queue_event(WatchedEvent::state_event(SessionState::Connected));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.raise();
        task.await.unwrap();

        let states: Vec<SessionState> = log.lock().unwrap().iter().map(|e| e.state).collect();
        assert_eq!(
            states,
            [SessionState::Connected, SessionState::NotConnected, SessionState::Connected]
        );
    }

    #[tokio::test]
    async fn initial_disconnected_state_event_is_deduped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(FanoutRegistry {
            watchers: vec![recording_watcher(log.clone())],
        });
        let (sink, rx) = EventSink::new(registry);
        let cancel = Arc::new(Flag::new());
        let task = tokio::spawn(EventDispatcher::new(rx, cancel.clone()).run());

        // The session starts disconnected; repeating that state says nothing.
        sink.queue_event(WatchedEvent::state_event(SessionState::NotConnected));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.raise();
        task.await.unwrap();

        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn node_events_are_never_deduped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(FanoutRegistry {
            watchers: vec![recording_watcher(log.clone())],
        });
        let (sink, rx) = EventSink::new(registry);
        let cancel = Arc::new(Flag::new());
        let task = tokio::spawn(EventDispatcher::new(rx, cancel.clone()).run());

        let node_event = WatchedEvent {
            state: SessionState::Connected,
            event_type: EventType::NodeDataChanged,
            path: Some("/x".into()),
        };
        sink.queue_event(node_event.clone());
        sink.queue_event(node_event.clone());

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.raise();
        task.await.unwrap();

        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn a_panicking_watcher_does_not_poison_the_queue() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(FanoutRegistry {
            watchers: vec![Arc::new(Panicking), recording_watcher(log.clone())],
        });
        let (sink, rx) = EventSink::new(registry);
        let cancel = Arc::new(Flag::new());
        let task = tokio::spawn(EventDispatcher::new(rx, cancel.clone()).run());

        sink.queue_event(WatchedEvent {
            state: SessionState::Connected,
            event_type: EventType::NodeCreated,
            path: Some("/a".into()),
        });
        sink.queue_event(WatchedEvent {
            state: SessionState::Connected,
            event_type: EventType::NodeDeleted,
            path: Some("/a".into()),
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.raise();
        task.await.unwrap();

        // The well-behaved watcher saw both events despite its neighbor.
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn events_queued_before_shutdown_are_still_delivered() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(FanoutRegistry {
            watchers: vec![recording_watcher(log.clone())],
        });
        let (sink, rx) = EventSink::new(registry);
        let cancel = Arc::new(Flag::new());

        // Queue before the dispatcher even starts, then cancel immediately.
        sink.queue_event(WatchedEvent::state_event(SessionState::Connected));
        sink.queue_event(WatchedEvent::state_event(SessionState::Closed));
        cancel.raise();

        EventDispatcher::new(rx, cancel).run().await;

        let states: Vec<SessionState> = log.lock().unwrap().iter().map(|e| e.state).collect();
        assert_eq!(states, [SessionState::Connected, SessionState::Closed]);
    }
}
