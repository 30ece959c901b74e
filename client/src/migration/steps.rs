//! Versioned schema steps.
//!
//! Every step checks the current state before mutating (`IF NOT EXISTS`,
//! `PRAGMA table_info`), so running it twice is harmless.

use crate::db::{ensure_settings_table, index_exists, table_has_column};
use farmsync_engine::{EntityKind, SchemaVersion};
use sqlx::SqliteConnection;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Latest schema version this build knows how to reach.
pub const LATEST_SCHEMA_VERSION: SchemaVersion = 3;

/// Future returned by a step.
pub type StepFuture<'c> = Pin<Box<dyn Future<Output = Result<(), sqlx::Error>> + Send + 'c>>;

/// Function applying a step on a connection inside a transaction.
pub type StepFn = for<'c> fn(&'c mut SqliteConnection) -> StepFuture<'c>;

/// One versioned migration step.
#[derive(Clone, Copy)]
pub struct MigrationStep {
    pub version: SchemaVersion,
    pub description: &'static str,
    pub apply: StepFn,
}

impl MigrationStep {
    pub const fn new(version: SchemaVersion, description: &'static str, apply: StepFn) -> Self {
        Self {
            version,
            description,
            apply,
        }
    }
}

impl fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationStep")
            .field("version", &self.version)
            .field("description", &self.description)
            .finish()
    }
}

/// The built-in steps, in version order.
pub fn default_steps() -> Vec<MigrationStep> {
    vec![
        MigrationStep::new(1, "create base tables", create_base_tables),
        MigrationStep::new(2, "track last sync time on entities", add_last_synced_at),
        MigrationStep::new(3, "queue scheduling and lookup indexes", add_queue_schedule),
    ]
}

fn create_base_tables(conn: &mut SqliteConnection) -> StepFuture<'_> {
    Box::pin(async move {
        ensure_settings_table(&mut *conn).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS backups (
                key TEXT PRIMARY KEY NOT NULL,
                created_at TEXT NOT NULL,
                schema_version INTEGER NOT NULL,
                record_count INTEGER NOT NULL,
                data TEXT NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY NOT NULL,
                display_name TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_kind TEXT NOT NULL,
                operation TEXT NOT NULL,
                local_id TEXT NOT NULL,
                server_id TEXT,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                failure_kind TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await?;

        for kind in EntityKind::ALL {
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    local_id TEXT PRIMARY KEY NOT NULL,
                    server_id TEXT,
                    organization_id TEXT,
                    data TEXT NOT NULL,
                    needs_sync INTEGER NOT NULL DEFAULT 1,
                    is_synced INTEGER NOT NULL DEFAULT 0,
                    is_deleted INTEGER NOT NULL DEFAULT 0,
                    deleted_at TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )
                "#,
                kind.table()
            ))
            .execute(&mut *conn)
            .await?;
        }

        Ok(())
    })
}

fn add_last_synced_at(conn: &mut SqliteConnection) -> StepFuture<'_> {
    Box::pin(async move {
        for kind in EntityKind::ALL {
            if table_has_column(&mut *conn, kind.table(), "last_synced_at").await? {
                continue;
            }
            sqlx::query(&format!(
                "ALTER TABLE {} ADD COLUMN last_synced_at TEXT",
                kind.table()
            ))
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    })
}

fn add_queue_schedule(conn: &mut SqliteConnection) -> StepFuture<'_> {
    Box::pin(async move {
        if !table_has_column(&mut *conn, "sync_queue", "next_attempt_at").await? {
            sqlx::query("ALTER TABLE sync_queue ADD COLUMN next_attempt_at TEXT")
                .execute(&mut *conn)
                .await?;
        }

        if !index_exists(&mut *conn, "idx_sync_queue_status_kind").await? {
            sqlx::query("CREATE INDEX idx_sync_queue_status_kind ON sync_queue (status, entity_kind)")
                .execute(&mut *conn)
                .await?;
        }

        for kind in EntityKind::ALL {
            let index = format!("idx_{}_org_server", kind.table());
            if index_exists(&mut *conn, &index).await? {
                continue;
            }
            sqlx::query(&format!(
                "CREATE INDEX {index} ON {} (organization_id, server_id)",
                kind.table()
            ))
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    })
}
