//! Event Listener Table
//!
//! Named-event listener registry shared by every channel implementation.
//! Listeners are plain synchronous callbacks; anything slow must spawn.
//!
//! Dispatch snapshots the listener list before invoking, so a listener may
//! call [`EventEmitter::off`] (including on itself) without deadlocking.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::{Payload, PeerHandle};

/// Identifier returned by [`EventEmitter::on`], used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// One delivered event
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    /// Event payload
    pub data: Payload,
    /// Originating peer (server side only)
    pub peer: Option<PeerHandle>,
}

type Listener = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

/// Named-event listener table
///
/// Cheap to clone; clones share the same table.
#[derive(Clone, Default)]
pub struct EventEmitter {
    listeners: Arc<RwLock<HashMap<String, Vec<(ListenerId, Listener)>>>>,
}

impl EventEmitter {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for `event`
    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(ChannelEvent) + Send + Sync + 'static,
    {
        let id = ListenerId::next();
        self.listeners
            .write()
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Unregister a listener
    ///
    /// Returns true if the listener was registered.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let Some(list) = listeners.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            listeners.remove(event);
        }
        removed
    }

    /// Deliver an event to every listener registered for it
    ///
    /// Returns the number of listeners invoked.
    pub fn emit(&self, event: &str, data: Payload, peer: Option<PeerHandle>) -> usize {
        let snapshot: Vec<Listener> = match self.listeners.read().get(event) {
            Some(list) => list.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => return 0,
        };

        let count = snapshot.len();
        for listener in snapshot {
            listener(ChannelEvent {
                data: data.clone(),
                peer: peer.clone(),
            });
        }
        count
    }

    /// Number of listeners registered for `event`
    #[must_use]
    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.read().get(event).map_or(0, Vec::len)
    }

    /// Drop every listener
    pub fn clear(&self) {
        self.listeners.write().clear();
    }
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.read();
        let mut counts: Vec<(&String, usize)> =
            listeners.iter().map(|(k, v)| (k, v.len())).collect();
        counts.sort();
        f.debug_struct("EventEmitter")
            .field("listeners", &counts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn test_emit_reaches_registered_listeners() {
        let emitter = EventEmitter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_a = Arc::clone(&seen);
        emitter.on("sum", move |e| seen_a.lock().push(("a", e.data)));
        let seen_b = Arc::clone(&seen);
        emitter.on("sum", move |e| seen_b.lock().push(("b", e.data)));

        assert_eq!(emitter.emit("sum", json!(3), None), 2);
        assert_eq!(emitter.emit("other", json!(3), None), 0);
        assert_eq!(*seen.lock(), vec![("a", json!(3)), ("b", json!(3))]);
    }

    #[test]
    fn test_off_removes_only_that_listener() {
        let emitter = EventEmitter::new();
        let first = emitter.on("tick", |_| {});
        let _second = emitter.on("tick", |_| {});

        assert!(emitter.off("tick", first));
        assert!(!emitter.off("tick", first));
        assert_eq!(emitter.listener_count("tick"), 1);
        assert!(!emitter.off("missing", first));
    }

    #[test]
    fn test_listener_can_unregister_itself() {
        let emitter = EventEmitter::new();
        let calls = Arc::new(AtomicU64::new(0));
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));

        let emitter_inner = emitter.clone();
        let calls_inner = Arc::clone(&calls);
        let slot_inner = Arc::clone(&slot);
        let id = emitter.on("once", move |_| {
            calls_inner.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = slot_inner.lock().take() {
                emitter_inner.off("once", id);
            }
        });
        *slot.lock() = Some(id);

        emitter.emit("once", Payload::Null, None);
        emitter.emit("once", Payload::Null, None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.listener_count("once"), 0);
    }

    #[test]
    fn test_peer_is_forwarded() {
        let emitter = EventEmitter::new();
        let peer = PeerHandle::new(None);
        let seen = Arc::new(Mutex::new(None));

        let seen_inner = Arc::clone(&seen);
        emitter.on("ping", move |e| *seen_inner.lock() = e.peer);
        emitter.emit("ping", Payload::Null, Some(peer.clone()));

        assert_eq!(seen.lock().clone(), Some(peer));
    }

    #[test]
    fn test_clear() {
        let emitter = EventEmitter::new();
        emitter.on("a", |_| {});
        emitter.on("b", |_| {});
        emitter.clear();
        assert_eq!(emitter.listener_count("a"), 0);
        assert_eq!(emitter.listener_count("b"), 0);
    }
}
