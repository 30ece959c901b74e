//! Typed sync events and their subscriber list.
//!
//! Subscribers get an unbounded receiver each. Publishing never blocks; a
//! subscriber that dropped its receiver is pruned on the next publish.

use farmsync_engine::{EntityKind, FailureKind, LocalId, Operation, ServerId, SyncSummary};
use serde::Serialize;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

/// Something observers may want to react to.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    PassStarted,

    EntrySynced {
        kind: EntityKind,
        entry_id: i64,
        local_id: LocalId,
        server_id: Option<ServerId>,
    },

    EntryFailed {
        kind: EntityKind,
        entry_id: i64,
        local_id: LocalId,
        failure: FailureKind,
        message: String,
    },

    PassCompleted { summary: SyncSummary },

    /// A local record was written through the client
    RecordChanged {
        kind: EntityKind,
        local_id: LocalId,
        operation: Operation,
    },

    ConnectivityChanged { online: bool },
}

pub type EventSender = mpsc::UnboundedSender<SyncEvent>;

/// A live subscription. Drop it (or call [`EventHub::unsubscribe`]) to stop.
#[derive(Debug)]
pub struct Subscription {
    pub id: String,
    pub receiver: mpsc::UnboundedReceiver<SyncEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        self.receiver.recv().await
    }
}

/// Explicit list of event subscribers.
#[derive(Debug, Default)]
pub struct EventHub {
    subscribers: DashMap<String, EventSender>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
        }
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn subscribe(&self) -> Subscription {
        let id = uuid::Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.insert(id.clone(), sender);

        tracing::debug!(subscription = %id, "Event subscriber registered");
        Subscription { id, receiver }
    }

    pub fn unsubscribe(&self, id: &str) {
        if self.subscribers.remove(id).is_some() {
            tracing::debug!(subscription = %id, "Event subscriber removed");
        }
    }

    /// Send to every live subscriber.
    ///
    /// Returns the number of subscribers that received the event.
    pub fn publish(&self, event: SyncEvent) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        for entry in self.subscribers.iter() {
            if entry.value().send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                closed.push(entry.key().clone());
            }
        }

        for id in closed {
            self.subscribers.remove(&id);
        }

        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
