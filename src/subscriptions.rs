//! The subscription registry.
//!
//! Subscriptions live in an immutable `HashMap` snapshot keyed by sid.
//! Mutations clone the map and swap in a new snapshot under the write half
//! of the lock; the per-message fan-out path only clones the current `Arc`,
//! so it never contends with writers for longer than the pointer read.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};
use tokio::sync::mpsc;

use crate::types::{Msg, Sid, Subject};

/// One registered subscription as seen by the dispatcher
#[derive(Clone)]
pub(crate) struct Entry {
    pub subject: Subject,
    pub queue_group: Option<String>,
    pub inbox: mpsc::Sender<Msg>,
}

pub(crate) type Snapshot = Arc<HashMap<Sid, Entry>>;

pub(crate) struct Registry {
    next_sid: AtomicU64,
    entries: RwLock<Snapshot>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            next_sid: AtomicU64::new(1),
            entries: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Install a new subscription and return its sid and inbox reader.
    ///
    /// Sids are never reused for the lifetime of the registry, so a message
    /// in flight for a removed subscription can never be delivered to a new
    /// one.
    pub fn add(
        &self,
        subject: Subject,
        queue_group: Option<String>,
        capacity: usize,
    ) -> (Sid, mpsc::Receiver<Msg>) {
        let capacity = capacity.max(1);
        let sid = self.next_sid.fetch_add(1, Ordering::Relaxed);
        let (inbox, reader) = mpsc::channel(capacity);
        let entry = Entry {
            subject,
            queue_group,
            inbox,
        };
        let mut entries = self.entries.write().expect("registry lock poisoned");
        let mut next = HashMap::clone(&entries);
        next.insert(sid, entry);
        *entries = Arc::new(next);
        (sid, reader)
    }

    /// Remove a subscription. Returns false when the sid is not registered.
    /// The inbox reader is unaffected and may still drain delivered
    /// messages.
    pub fn remove(&self, sid: Sid) -> bool {
        let mut entries = self.entries.write().expect("registry lock poisoned");
        if !entries.contains_key(&sid) {
            return false;
        }
        let mut next = HashMap::clone(&entries);
        next.remove(&sid);
        *entries = Arc::new(next);
        true
    }

    /// The current immutable snapshot. A single message dispatch uses
    /// exactly one snapshot; a subscription added mid-flight may or may not
    /// see that message.
    pub fn snapshot(&self) -> Snapshot {
        Arc::clone(&self.entries.read().expect("registry lock poisoned"))
    }

    /// Drop every entry, closing all inboxes. Used on dispose.
    pub fn clear(&self) {
        let mut entries = self.entries.write().expect("registry lock poisoned");
        *entries = Arc::new(HashMap::new());
    }
}
