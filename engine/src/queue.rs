//! Sync queue entry types.
//!
//! Changes are recorded as queue entries, not pushed directly. An entry is
//! a durable statement of intent: it survives even if the record it
//! describes is deleted afterwards.

use crate::{error::Result, EntityKind, EntityRecord, Error, LocalId, ServerId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error message stored on entries whose parent has no server id yet.
pub const UNRESOLVED_DEPENDENCY: &str = "unresolved dependency";

/// The mutation an entry replays against the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CREATE" => Ok(Operation::Create),
            "UPDATE" => Ok(Operation::Update),
            "DELETE" => Ok(Operation::Delete),
            other => Err(Error::UnknownVariant {
                what: "operation",
                value: other.to_string(),
            }),
        }
    }
}

/// Lifecycle of a queue entry.
///
/// ```text
/// pending ──► syncing ──► synced
///    │           │
///    └─────► failed ◄────┘
///              │
///              └──► pending   (retry, while under the ceiling)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Syncing => "syncing",
            QueueStatus::Synced => "synced",
            QueueStatus::Failed => "failed",
        }
    }

    /// Whether `self → next` is a legal move.
    ///
    /// `syncing → pending` is never legal: a failed attempt must pass
    /// through `failed` so its diagnostic is kept.
    pub fn can_transition_to(&self, next: QueueStatus) -> bool {
        use QueueStatus::*;
        matches!(
            (self, next),
            (Pending, Syncing)
                | (Pending, Failed)
                | (Syncing, Synced)
                | (Syncing, Failed)
                | (Failed, Pending)
        )
    }

    /// Validate a transition.
    pub fn transition(self, next: QueueStatus) -> Result<QueueStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Synced)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "syncing" => Ok(QueueStatus::Syncing),
            "synced" => Ok(QueueStatus::Synced),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(Error::UnknownVariant {
                what: "queue status",
                value: other.to_string(),
            }),
        }
    }
}

/// Why an entry ended up in `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network error, timeout, server 5xx
    Transient,
    /// The server refused the payload; retrying won't help
    Rejected,
    /// A parent (or the record's own create) has no server id yet
    UnresolvedDependency,
    /// A previous pass died while the entry was `syncing`
    Interrupted,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Rejected => "rejected",
            FailureKind::UnresolvedDependency => "unresolved_dependency",
            FailureKind::Interrupted => "interrupted",
        }
    }

    /// Whether this failure moves the entry closer to the retry ceiling.
    pub fn counts_toward_retry(&self) -> bool {
        !matches!(self, FailureKind::UnresolvedDependency)
    }

    /// Whether the scheduler may retry without an operator signal.
    pub fn auto_retry(&self) -> bool {
        !matches!(self, FailureKind::Rejected)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "transient" => Ok(FailureKind::Transient),
            "rejected" => Ok(FailureKind::Rejected),
            "unresolved_dependency" => Ok(FailureKind::UnresolvedDependency),
            "interrupted" => Ok(FailureKind::Interrupted),
            other => Err(Error::UnknownVariant {
                what: "failure kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Diagnostic attached to a transition into `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Earliest time the scheduler may retry; `None` means never on its own
    pub next_attempt_at: Option<Timestamp>,
}

impl SyncFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            next_attempt_at: None,
        }
    }

    pub fn unresolved_dependency(now: Timestamp) -> Self {
        Self::new(FailureKind::UnresolvedDependency, UNRESOLVED_DEPENDENCY).retry_at(now)
    }

    pub fn retry_at(mut self, at: Timestamp) -> Self {
        self.next_attempt_at = Some(at);
        self
    }
}

/// An entry about to be appended to the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewQueueEntry {
    pub entity_kind: EntityKind,
    pub operation: Operation,
    pub local_id: LocalId,
    pub server_id: Option<ServerId>,
    pub payload: serde_json::Value,
}

impl NewQueueEntry {
    /// Entry carrying the full current state of `record`.
    pub fn for_record(operation: Operation, record: &EntityRecord) -> Self {
        Self {
            entity_kind: record.kind,
            operation,
            local_id: record.local_id.clone(),
            server_id: record.server_id.clone(),
            payload: record.snapshot(),
        }
    }

    /// The operation that replays the record's current pending state.
    pub fn rebuild_for(record: &EntityRecord) -> Self {
        let operation = if record.is_deleted {
            Operation::Delete
        } else if record.server_id.is_none() {
            Operation::Create
        } else {
            Operation::Update
        };
        Self::for_record(operation, record)
    }
}

/// A persisted queue entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Monotonic id; replay order within a kind
    pub id: i64,
    pub entity_kind: EntityKind,
    pub operation: Operation,
    pub local_id: LocalId,
    /// Snapshot at enqueue time
    pub server_id: Option<ServerId>,
    pub payload: serde_json::Value,
    pub status: QueueStatus,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub next_attempt_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl QueueEntry {
    /// Decode the record snapshot carried in the payload.
    pub fn record_snapshot(&self) -> Result<EntityRecord> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| Error::InvalidPayload(format!("queue entry {}: {}", self.id, e)))
    }

    /// Parked entries have hit the retry ceiling and wait for an operator.
    pub fn is_parked(&self, max_retries: u32) -> bool {
        self.status == QueueStatus::Failed && self.retry_count >= max_retries
    }
}
