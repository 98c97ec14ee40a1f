//! Event router: per-type listener registration and dispatch.
//!
//! Inbound [`ServerFrame`]s are dispatched synchronously, in arrival
//! order, to every listener registered for the frame's [`EventKind`].
//! Listener invocations are isolated: one panicking listener does not
//! prevent delivery to the rest. Registration hands back a
//! [`ListenerId`]; unregistering an id that was never issued for that
//! kind is a programming-contract violation and panics.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::protocol::{EventKind, ServerFrame};

/// Opaque handle for unregistering a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&ServerFrame) + Send + Sync>;

/// Dispatches inbound events by type to registered listeners.
pub struct EventRouter {
    listeners: RwLock<HashMap<EventKind, Vec<(ListenerId, Listener)>>>,
    next_id: AtomicU64,
}

impl EventRouter {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener for one event kind.
    pub fn on(
        &self,
        kind: EventKind,
        listener: impl Fn(&ServerFrame) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Unregister a listener.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not registered for `kind` — that is a caller
    /// bug, not a runtime condition.
    pub fn off(&self, kind: EventKind, id: ListenerId) {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let entries = listeners.entry(kind).or_default();
        let Some(pos) = entries.iter().position(|(lid, _)| *lid == id) else {
            panic!("listener {id:?} is not registered for {kind:?}");
        };
        entries.remove(pos);
    }

    /// Deliver a frame to every listener of its kind, in registration
    /// order. Synchronous; each invocation is isolated.
    pub fn dispatch(&self, frame: &ServerFrame) {
        let kind = frame.event.kind();
        let snapshot: Vec<Listener> = {
            let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
            listeners
                .get(&kind)
                .map(|entries| entries.iter().map(|(_, l)| l.clone()).collect())
                .unwrap_or_default()
        };

        if snapshot.is_empty() {
            log::trace!("no listeners for {kind:?}, dropping frame");
            return;
        }

        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(frame))).is_err() {
                log::error!("listener for {kind:?} panicked; continuing delivery");
            }
        }
    }

    /// Number of listeners registered for a kind.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .map_or(0, Vec::len)
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Actor, CollaborationEvent, PresenceStatus};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use uuid::Uuid;

    fn comment_frame(body: &str) -> ServerFrame {
        ServerFrame::new(
            CollaborationEvent::CommentAdded {
                entity_id: Uuid::new_v4(),
                body: body.to_string(),
            },
            Some("project:42".to_string()),
            Actor::new("Sarah"),
            1_700_000_000_000,
        )
    }

    #[test]
    fn test_dispatch_by_kind() {
        let router = EventRouter::new();
        let comments = Arc::new(AtomicUsize::new(0));
        let typing = Arc::new(AtomicUsize::new(0));

        let c = comments.clone();
        router.on(EventKind::CommentAdded, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let t = typing.clone();
        router.on(EventKind::UserTyping, move |_| {
            t.fetch_add(1, Ordering::SeqCst);
        });

        router.dispatch(&comment_frame("hello"));
        router.dispatch(&comment_frame("again"));

        assert_eq!(comments.load(Ordering::SeqCst), 2);
        assert_eq!(typing.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_dispatch_order_and_payload() {
        let router = EventRouter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = seen.clone();
            router.on(EventKind::CommentAdded, move |frame| {
                if let CollaborationEvent::CommentAdded { body, .. } = &frame.event {
                    seen.lock().unwrap().push(format!("{tag}:{body}"));
                }
            });
        }

        router.dispatch(&comment_frame("hi"));
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["first:hi", "second:hi", "third:hi"]
        );
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let router = EventRouter::new();
        let delivered = Arc::new(AtomicUsize::new(0));

        router.on(EventKind::CommentAdded, |_| {
            panic!("listener bug");
        });
        let d = delivered.clone();
        router.on(EventKind::CommentAdded, move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });

        router.dispatch(&comment_frame("still delivered"));
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_off_stops_delivery() {
        let router = EventRouter::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        let id = router.on(EventKind::UserPresence, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let frame = ServerFrame::new(
            CollaborationEvent::UserPresence {
                status: PresenceStatus::Online,
            },
            None,
            Actor::new("Sarah"),
            0,
        );
        router.dispatch(&frame);
        router.off(EventKind::UserPresence, id);
        router.dispatch(&frame);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(router.listener_count(EventKind::UserPresence), 0);
    }

    #[test]
    #[should_panic(expected = "is not registered")]
    fn test_off_unknown_id_panics() {
        let router = EventRouter::new();
        let id = router.on(EventKind::UserTyping, |_| {});
        router.off(EventKind::CommentAdded, id);
    }
}
