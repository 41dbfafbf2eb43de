//! Single-user buffer used when no room can be joined.
//!
//! Same [`Replication`] surface as a room, so the session and the persistence
//! side run unchanged: mutations are local transactions, nothing is broadcast
//! and nobody else is ever present.

use crate::presence::{Presence, PresencePatch};
use crate::replication::{Origin, ReplicaEvent, Replication, ReplicationError, Result, Transaction};
use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

pub struct LocalBuffer {
    content: Mutex<String>,
    me: Mutex<Presence>,
    seeded: AtomicBool,
    closed: AtomicBool,
    /// Held so the session's event stream stays open until leave
    events: Mutex<Option<mpsc::UnboundedSender<ReplicaEvent>>>,
}

impl LocalBuffer {
    pub fn new(me: Presence) -> (Self, mpsc::UnboundedReceiver<ReplicaEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                content: Mutex::new(String::new()),
                me: Mutex::new(me),
                seeded: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                events: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    fn write(&self, new_value: &str, origin: Origin) -> Result<Option<Transaction>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ReplicationError::Closed);
        }
        let mut content = self.content.lock().unwrap_or_else(|e| e.into_inner());
        if *content == new_value {
            return Ok(None);
        }
        *content = new_value.to_string();
        Ok(Some(Transaction::new(origin, new_value)))
    }
}

#[async_trait]
impl Replication for LocalBuffer {
    fn current_buffer(&self) -> String {
        self.content.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn mutate(&self, new_value: &str) -> Result<Option<Transaction>> {
        self.write(new_value, Origin::Local)
    }

    fn seed(&self, content: &str) -> Result<Option<Transaction>> {
        self.seeded.store(true, Ordering::SeqCst);
        self.write(content, Origin::InitialSync)
    }

    fn needs_seed(&self) -> bool {
        !self.seeded.load(Ordering::SeqCst)
    }

    fn presence(&self) -> Vec<Presence> {
        Vec::new()
    }

    fn own_presence(&self) -> Presence {
        self.me.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn update_own_presence(&self, patch: PresencePatch) {
        self.me
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .apply(&patch);
    }

    fn is_replicated(&self) -> bool {
        false
    }

    async fn leave(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.events.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}
