//! One-shot watch bookkeeping
//!
//! Backends deliver each watch registration at most once. The coordinator
//! tracks a small state machine per `(path, kind)`:
//!
//! ```text
//! Armed --fire--> Fired --arm--> Armed
//!                   \---dispose--> Disposed
//! ```
//!
//! Arming is idempotent while armed, so callers can re-arm eagerly without
//! piling up duplicate registrations. Events for watches that are not armed
//! (disposed paths, duplicates, registrations from an expired session) are
//! dropped before they reach the consumer.

use crate::backend::{CoordinationBackend, WatchEvent, WatchKind, WatchSink};
use crate::error::Result;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// State of one watch registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Armed,
    Fired,
    Disposed,
}

/// Manages one-shot watches against a [`CoordinationBackend`].
pub struct WatchCoordinator {
    backend: Arc<dyn CoordinationBackend>,
    states: DashMap<(String, WatchKind), WatchState>,
    sink: WatchSink,
}

/// The consumer side: yields only events that fired an armed watch.
pub struct WatchEvents {
    coordinator: Arc<WatchCoordinator>,
    rx: mpsc::UnboundedReceiver<WatchEvent>,
}

impl WatchCoordinator {
    pub fn new(backend: Arc<dyn CoordinationBackend>) -> (Arc<Self>, WatchEvents) {
        let (sink, rx) = mpsc::unbounded_channel();
        let coordinator = Arc::new(Self {
            backend,
            states: DashMap::new(),
            sink,
        });
        let events = WatchEvents {
            coordinator: coordinator.clone(),
            rx,
        };
        (coordinator, events)
    }

    /// Arm a data watch on `path`
    pub async fn arm_node(&self, path: &str) -> Result<()> {
        self.arm(path, WatchKind::Node).await
    }

    /// Arm a children watch on `path`
    pub async fn arm_children(&self, path: &str) -> Result<()> {
        self.arm(path, WatchKind::Children).await
    }

    async fn arm(&self, path: &str, kind: WatchKind) -> Result<()> {
        let key = (path.to_string(), kind);
        let previous = match self.states.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if *entry.get() == WatchState::Armed {
                    return Ok(());
                }
                Some(std::mem::replace(entry.get_mut(), WatchState::Armed))
            }
            Entry::Vacant(entry) => {
                entry.insert(WatchState::Armed);
                None
            }
        };

        let registered = match kind {
            WatchKind::Node => self.backend.watch_node(path, self.sink.clone()).await,
            WatchKind::Children => self.backend.watch_children(path, self.sink.clone()).await,
        };

        if let Err(err) = registered {
            match previous {
                Some(state) => {
                    self.states.insert(key, state);
                }
                None => {
                    self.states.remove(&key);
                }
            }
            return Err(err);
        }

        trace!(path, ?kind, "Watch armed");
        Ok(())
    }

    /// Consume a delivered event. Returns whether it fired an armed watch
    /// and should be handled.
    pub fn fire(&self, event: &WatchEvent) -> bool {
        let key = (event.path.clone(), event.watch_kind());
        match self.states.get_mut(&key) {
            Some(mut state) if *state == WatchState::Armed => {
                *state = WatchState::Fired;
                true
            }
            _ => {
                trace!(path = %event.path, kind = ?event.kind, "Dropping stale watch event");
                false
            }
        }
    }

    /// Stop handling events for every watch on `path`
    pub fn dispose(&self, path: &str) {
        for kind in [WatchKind::Node, WatchKind::Children] {
            if let Some(mut state) = self.states.get_mut(&(path.to_string(), kind)) {
                *state = WatchState::Disposed;
            }
        }
    }

    /// Forget every registration, e.g. after the session was lost and the
    /// server discarded its watches.
    pub fn reset(&self) {
        self.states.clear();
    }

    pub fn state(&self, path: &str, kind: WatchKind) -> Option<WatchState> {
        self.states.get(&(path.to_string(), kind)).map(|s| *s)
    }

    /// Number of watches currently armed
    pub fn armed_count(&self) -> usize {
        self.states.iter().filter(|s| *s.value() == WatchState::Armed).count()
    }
}

impl WatchEvents {
    /// Next event that fired an armed watch
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        loop {
            let event = self.rx.recv().await?;
            if self.coordinator.fire(&event) {
                return Some(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::WatchEventKind;
    use crate::memory::InMemoryBackend;
    use std::time::Duration;

    fn setup() -> (InMemoryBackend, Arc<WatchCoordinator>, WatchEvents) {
        let backend = InMemoryBackend::new();
        let (coordinator, events) = WatchCoordinator::new(Arc::new(backend.clone()));
        (backend, coordinator, events)
    }

    async fn next(events: &mut WatchEvents) -> Option<WatchEvent> {
        tokio::time::timeout(Duration::from_millis(50), events.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_arm_is_idempotent() {
        let (backend, coordinator, mut events) = setup();

        coordinator.arm_node("/r/a").await.unwrap();
        coordinator.arm_node("/r/a").await.unwrap();
        assert_eq!(backend.watch_count(), 1);
        assert_eq!(coordinator.state("/r/a", WatchKind::Node), Some(WatchState::Armed));

        backend.write("/r/a", vec![]).await.unwrap();
        let event = next(&mut events).await.unwrap();
        assert_eq!(event.kind, WatchEventKind::NodeCreated);
        assert_eq!(coordinator.state("/r/a", WatchKind::Node), Some(WatchState::Fired));
    }

    #[tokio::test]
    async fn test_rearm_after_fire() {
        let (backend, coordinator, mut events) = setup();

        coordinator.arm_children("/r").await.unwrap();
        backend.write("/r/a", vec![]).await.unwrap();
        assert!(next(&mut events).await.is_some());

        // Not re-armed yet: the next change goes unnoticed
        backend.write("/r/b", vec![]).await.unwrap();
        assert!(next(&mut events).await.is_none());

        coordinator.arm_children("/r").await.unwrap();
        backend.write("/r/c", vec![]).await.unwrap();
        assert_eq!(next(&mut events).await.unwrap().path, "/r");
    }

    #[tokio::test]
    async fn test_disposed_events_are_dropped() {
        let (backend, coordinator, mut events) = setup();

        coordinator.arm_node("/r/a").await.unwrap();
        coordinator.dispose("/r/a");
        backend.write("/r/a", vec![]).await.unwrap();

        assert!(next(&mut events).await.is_none());
        assert_eq!(coordinator.state("/r/a", WatchKind::Node), Some(WatchState::Disposed));

        // A disposed path can be watched again
        coordinator.arm_node("/r/a").await.unwrap();
        backend.delete("/r/a").await.unwrap();
        assert_eq!(next(&mut events).await.unwrap().kind, WatchEventKind::NodeDeleted);
    }

    #[tokio::test]
    async fn test_unknown_events_are_dropped() {
        let (_backend, coordinator, _events) = setup();
        assert!(!coordinator.fire(&WatchEvent::new("/x", WatchEventKind::NodeDataChanged)));
    }

    #[tokio::test]
    async fn test_failed_arm_is_rolled_back() {
        let (backend, coordinator, _events) = setup();

        backend.disconnect();
        assert!(coordinator.arm_node("/r/a").await.is_err());
        assert_eq!(coordinator.state("/r/a", WatchKind::Node), None);

        backend.reconnect();
        coordinator.arm_node("/r/a").await.unwrap();
        assert_eq!(coordinator.armed_count(), 1);

        coordinator.reset();
        assert_eq!(coordinator.armed_count(), 0);
    }
}
