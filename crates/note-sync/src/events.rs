//! Event infrastructure for editing sessions.
//!
//! `SessionEvent` is what a UI bridge renders from; it serializes to tagged
//! camelCase JSON. `EventBus` must live in an `Arc` so subscriptions can
//! detach themselves when dropped.

use crate::coordinator::SaveStatus;
use crate::presence::Presence;
use crate::store::NoteId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Events emitted by an editing session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    /// Save status moved
    StatusChanged { status: SaveStatus },
    /// The visible buffer changed.
    BufferChanged {
        /// Produced by this client's input
        local: bool,
        content: String,
    },
    /// Other participants joined, left or changed presence.
    PresenceChanged { participants: Vec<Presence> },
    /// A note of this context was deleted elsewhere; refetch history.
    #[serde(rename_all = "camelCase")]
    HistoryChanged { deleted_id: NoteId },
    /// Replication could not be established; editing continues single-user.
    Degraded { room: String, reason: String },
}

type Listener = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Keeps a listener registered. Dropping it removes the listener.
#[must_use = "the listener is removed as soon as the subscription is dropped"]
pub struct Subscription {
    bus: Weak<EventBus>,
    key: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.key);
        }
    }
}

/// Fans session events out to listeners, in subscription order.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<BTreeMap<u64, Listener>>,
    next_key: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        self: &Arc<Self>,
        listener: impl Fn(&SessionEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(key, Arc::new(listener));
        Subscription {
            bus: Arc::downgrade(self),
            key,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.lock().len()
    }

    pub fn emit(&self, event: SessionEvent) {
        // Snapshot first: a listener may subscribe or drop a subscription
        let listeners: Vec<Listener> = self.lock().values().cloned().collect();
        for listener in listeners {
            listener(&event);
        }
    }

    fn remove(&self, key: u64) {
        self.lock().remove(&key);
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, Listener>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(bus: &Arc<EventBus>) -> (Subscription, Arc<Mutex<Vec<SessionEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = bus.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
        (sub, seen)
    }

    #[test]
    fn test_listener_receives_events() {
        let bus = Arc::new(EventBus::new());
        let (_sub, seen) = collect(&bus);

        bus.emit(SessionEvent::StatusChanged {
            status: SaveStatus::Unsaved,
        });

        assert_eq!(
            *seen.lock().unwrap(),
            vec![SessionEvent::StatusChanged {
                status: SaveStatus::Unsaved
            }]
        );
    }

    #[test]
    fn test_dropping_subscription_detaches_listener() {
        let bus = Arc::new(EventBus::new());
        let (sub, seen) = collect(&bus);
        let (_other, other_seen) = collect(&bus);
        assert_eq!(bus.listener_count(), 2);

        drop(sub);
        assert_eq!(bus.listener_count(), 1);
        bus.emit(SessionEvent::StatusChanged {
            status: SaveStatus::Saved,
        });

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(other_seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_session_event_serialization() {
        let event = SessionEvent::BufferChanged {
            local: false,
            content: "hi".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"bufferChanged\""));
        assert!(json.contains("\"local\":false"));

        let status = SessionEvent::StatusChanged {
            status: SaveStatus::Saving,
        };
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, r#"{"type":"statusChanged","status":"saving"}"#);
    }
}
