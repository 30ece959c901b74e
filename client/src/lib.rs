//! # FarmSync Client
//!
//! Offline-first storage and synchronization for farm-operations data.
//!
//! Writes land in a local SQLite database first and are queued for upload.
//! A [`SyncDriver`] drains the queue whenever the network is available,
//! resolving foreign keys between records created offline before sending
//! them. Schema changes go through the [`MigrationManager`], which backs up
//! before each step and restores on failure.
//!
//! The usual entry point is the [`Coordinator`], which boots everything in
//! order and hands back a [`SyncClient`]:
//!
//! ```no_run
//! use farmsync_client::{Config, Coordinator, HttpRemoteApi, ManualConnectivity};
//! use farmsync_engine::EntityKind;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_env()?;
//! let remote = Arc::new(HttpRemoteApi::from_config(&config)?);
//! let connectivity = Arc::new(ManualConnectivity::online());
//!
//! let booted = Coordinator::new(config, remote, connectivity).boot().await;
//! if let Some(client) = booted.client {
//!     client.create(EntityKind::Farm, json!({"name": "North"})).await?;
//!     client.trigger_sync().await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod db;
pub mod driver;
pub mod error;
pub mod events;
pub mod migration;
pub mod queue;
pub mod remote;
pub mod session;
pub mod store;

pub use client::{IntegrityReport, SyncClient, SyncStatus};
pub use config::{Config, ConfigError};
pub use connectivity::{ConnectionType, ConnectivityProvider, ConnectivityState, ManualConnectivity};
pub use coordinator::{with_retry, BootErrorCode, BootMode, BootReport, Booted, Coordinator};
pub use driver::{DriverSettings, HousekeepingReport, RefreshReport, SyncDriver, SyncOutcome};
pub use error::{ClientError, Result};
pub use events::{EventHub, Subscription, SyncEvent};
pub use migration::{
    ImportReport, MigrationManager, MigrationReport, MigrationSettings, MigrationStatus,
    MigrationStep, LATEST_SCHEMA_VERSION,
};
pub use queue::{PurgeFilter, QueueCounts, SyncQueue};
pub use remote::{HttpRemoteApi, RemoteAck, RemoteApi, RemoteError};
pub use session::SessionContext;
pub use store::{ApplyOutcome, LocalStore, Query};
