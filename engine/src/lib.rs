//! # FarmSync Engine
//!
//! The deterministic core of an offline-first sync engine for farm-operations
//! data (organizations, farms, batches and their daily records).
//!
//! This crate holds everything about synchronization that can be expressed
//! without touching a disk or a socket. The `farmsync-client` crate wires it
//! to SQLite, the network and the async runtime.
//!
//! ## Design Principles
//!
//! - **No IO**: no files, network, or runtime in here
//! - **Deterministic**: time comes from an injected [`Clock`], randomness is
//!   passed in as a sample
//! - **Closed set of kinds**: [`EntityKind`] is an enum, so adding a kind
//!   makes the compiler point at every table, endpoint and wire mapping
//!
//! ## Core Concepts
//!
//! ### Entity records
//!
//! An [`EntityRecord`] is a domain object plus its sync bookkeeping:
//! a client-generated `local_id`, the server-assigned `server_id` once the
//! server accepted it, the tenant (`organization_id`), the `needs_sync` /
//! `is_synced` flags and a soft-delete marker.
//!
//! ### Queue entries
//!
//! Every client-originated mutation becomes a [`QueueEntry`] carrying a full
//! snapshot of the record. Entries move through the [`QueueStatus`] state
//! machine: `pending → syncing → {synced | failed}`, `failed → pending`.
//!
//! ### Dependency order and foreign keys
//!
//! Kinds sync parents-first ([`EntityKind::in_dependency_order`]). Before a
//! child is sent, its foreign keys (local ids of parents) are swapped for
//! the parents' server ids by [`resolve_foreign_keys`].
//!
//! ### Wire format
//!
//! Storage uses snake_case, the server speaks camelCase with a few per-kind
//! renames. [`to_wire`] and [`from_wire`] translate both ways.
//!
//! ## Quick Start
//!
//! ```rust
//! use farmsync_engine::{EntityKind, EntityRecord, to_wire};
//! use chrono::{TimeZone, Utc};
//! use serde_json::json;
//!
//! let now = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
//! let batch = EntityRecord::new_local(
//!     EntityKind::Batch,
//!     "batch-local-1",
//!     Some("org-1".to_string()),
//!     json!({"name": "Layers A", "farm_ref": "farm-local-1",
//!            "initial_count": 500, "start_date": "2024-03-01"}),
//!     now,
//!     false,
//! );
//! assert!(batch.needs_sync);
//!
//! let mut resolved = batch.data.as_object().unwrap().clone();
//! resolved.insert("farm_ref".into(), json!("100"));
//! let wire = to_wire(&batch, &resolved, None);
//! assert_eq!(wire["farmId"], "100");
//! assert_eq!(wire["initialQuantity"], 500);
//! ```

pub mod backoff;
pub mod clock;
pub mod entity;
pub mod error;
pub mod queue;
pub mod record;
pub mod resolve;
pub mod snapshot;
pub mod summary;
pub mod wire;

// Re-export main types at crate root
pub use backoff::BackoffPolicy;
pub use clock::{Clock, ManualClock, SystemClock};
pub use entity::{EntityKind, FieldDef, FieldType, ForeignKey};
pub use error::Error;
pub use queue::{
    FailureKind, NewQueueEntry, Operation, QueueEntry, QueueStatus, SyncFailure,
    UNRESOLVED_DEPENDENCY,
};
pub use record::EntityRecord;
pub use resolve::{
    decide_server_write, foreign_key_values, localize_foreign_keys, resolve_foreign_keys,
    ParentLookup, Resolution, ServerWriteDecision,
};
pub use snapshot::{backup_key, BackupInfo, BackupSnapshot, DataExport, EXPORT_FORMAT_VERSION};
pub use summary::{KindTotals, SyncSummary};
pub use wire::{camel_to_snake, from_wire, snake_to_camel, to_wire, WireRecord};

/// Type aliases for clarity
pub type LocalId = String;
pub type ServerId = String;
pub type OrganizationId = String;
pub type SchemaVersion = u32;
pub type Timestamp = chrono::DateTime<chrono::Utc>;
