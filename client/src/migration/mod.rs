//! Versioned schema and state evolution.
//!
//! The persisted `schema_version` setting records the last applied step.
//! [`MigrationManager::migrate`] brings it up to the latest version, one
//! step at a time. Each step runs in a transaction under a timeout. From
//! version 2 on, a backup is taken first and restored if the step fails.

mod backup;
pub mod steps;

pub use backup::ImportReport;
pub use steps::{default_steps, MigrationStep, StepFn, StepFuture, LATEST_SCHEMA_VERSION};

use crate::db::{self, encode_ts, keys, Pool};
use crate::error::{ClientError, Result};
use farmsync_engine::{Clock, SchemaVersion};
use serde::Serialize;
use sqlx::{Connection, SqliteConnection};
use std::sync::Arc;
use std::time::Duration;

/// Id of the account row every installation is seeded with.
pub const SEED_ACCOUNT_ID: &str = "local-operator";

/// Tunables for the migration manager.
#[derive(Debug, Clone)]
pub struct MigrationSettings {
    /// Bound on a single step
    pub step_timeout: Duration,
    /// Pre-migration backups are deleted after this long
    pub backup_grace: Duration,
    /// Written to `sync.retention_days` on first setup
    pub retention_days: u32,
    /// Written to `sync.max_retries` on first setup
    pub max_retries: u32,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(60),
            backup_grace: Duration::from_secs(24 * 60 * 60),
            retention_days: 7,
            max_retries: 5,
        }
    }
}

/// Result of a [`MigrationManager::migrate`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub from: SchemaVersion,
    pub to: SchemaVersion,
    pub applied: Vec<SchemaVersion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStatus {
    pub current_version: SchemaVersion,
    pub target_version: SchemaVersion,
    pub pending: Vec<SchemaVersion>,
    pub initial_setup_completed: bool,
}

/// The migration manager.
#[derive(Debug, Clone)]
pub struct MigrationManager {
    pool: Pool,
    clock: Arc<dyn Clock>,
    steps: Arc<[MigrationStep]>,
    settings: MigrationSettings,
}

impl MigrationManager {
    pub fn new(pool: Pool, clock: Arc<dyn Clock>, settings: MigrationSettings) -> Self {
        Self {
            pool,
            clock,
            steps: default_steps().into(),
            settings,
        }
    }

    /// Replace the step table.
    pub fn with_steps(mut self, mut steps: Vec<MigrationStep>) -> Self {
        steps.sort_by_key(|s| s.version);
        self.steps = steps.into();
        self
    }

    pub fn target_version(&self) -> SchemaVersion {
        self.steps.iter().map(|s| s.version).max().unwrap_or(0)
    }

    /// Create the tables the manager itself relies on.
    async fn ensure_bookkeeping(&self) -> Result<()> {
        db::ensure_settings_table(&self.pool).await?;
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
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persisted schema version; 0 on a fresh install.
    pub async fn current_version(&self) -> Result<SchemaVersion> {
        self.ensure_bookkeeping().await?;
        match db::get_setting(&self.pool, keys::SCHEMA_VERSION).await? {
            None => Ok(0),
            Some(raw) => raw.trim().parse().map_err(|_| ClientError::MigrationFailed {
                version: 0,
                reason: format!("invalid schema_version setting: {raw:?}"),
            }),
        }
    }

    pub async fn status(&self) -> Result<MigrationStatus> {
        let current_version = self.current_version().await?;
        let pending = self
            .steps
            .iter()
            .map(|s| s.version)
            .filter(|v| *v > current_version)
            .collect();
        let initial_setup_completed =
            db::get_flag(&self.pool, keys::INITIAL_SETUP_COMPLETED).await?;

        Ok(MigrationStatus {
            current_version,
            target_version: self.target_version(),
            pending,
            initial_setup_completed,
        })
    }

    /// Apply every step above the persisted version.
    ///
    /// A failed step is rolled back, the pre-migration backup is restored
    /// and the error is returned; later steps are not attempted.
    pub async fn migrate(&self) -> Result<MigrationReport> {
        let from = self.current_version().await?;
        let target = self.target_version();
        let mut applied = Vec::new();

        if from > target {
            tracing::warn!(from, target, "Schema is newer than this build; leaving it alone");
        }

        for step in self.steps.iter().filter(|s| s.version > from) {
            let backup = if step.version > 1 {
                let snapshot = self.create_backup().await.map_err(|e| {
                    ClientError::MigrationFailed {
                        version: step.version,
                        reason: format!("pre-migration backup failed: {e}"),
                    }
                })?;
                Some(snapshot)
            } else {
                None
            };

            tracing::info!(
                version = step.version,
                description = step.description,
                "Applying migration step"
            );

            if let Err(err) = self.apply_step(step).await {
                tracing::error!(version = step.version, error = %err, "Migration step failed");

                if let Some(backup) = &backup {
                    match self.restore_snapshot(&backup.data).await {
                        Ok(()) => tracing::info!(key = %backup.key, "Restored pre-migration backup"),
                        Err(e) => tracing::error!(
                            key = %backup.key,
                            error = %e,
                            "Failed to restore pre-migration backup"
                        ),
                    }
                }

                return Err(match err {
                    ClientError::MigrationTimeout { .. } => err,
                    other => ClientError::MigrationFailed {
                        version: step.version,
                        reason: other.to_string(),
                    },
                });
            }

            applied.push(step.version);
            if let Some(backup) = backup {
                self.schedule_backup_cleanup(backup.key);
            }
        }

        let to = self.current_version().await?;
        if !applied.is_empty() {
            tracing::info!(from, to, "Schema migrated");
        }
        Ok(MigrationReport { from, to, applied })
    }

    async fn apply_step(&self, step: &MigrationStep) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let result = self.apply_step_on(&mut conn, step).await;

        // Statements prepared against the old shape of a table must not outlive the step
        if let Err(e) = conn.clear_cached_statements().await {
            tracing::warn!(error = %e, "Failed to clear cached statements");
            conn.close_on_drop();
        }
        result
    }

    async fn apply_step_on(&self, conn: &mut SqliteConnection, step: &MigrationStep) -> Result<()> {
        let mut tx = conn.begin().await?;

        let outcome =
            tokio::time::timeout(self.settings.step_timeout, (step.apply)(&mut *tx)).await;
        let result = match outcome {
            Err(_) => Err(ClientError::MigrationTimeout {
                version: step.version,
            }),
            Ok(Err(e)) => Err(ClientError::from(e)),
            Ok(Ok(())) => db::set_setting(
                &mut *tx,
                keys::SCHEMA_VERSION,
                &step.version.to_string(),
                self.clock.now(),
            )
            .await
            .map_err(ClientError::from),
        };

        match result {
            Ok(()) => {
                tx.commit().await?;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "Rollback after failed step failed");
                }
                Err(e)
            }
        }
    }

    fn schedule_backup_cleanup(&self, key: String) {
        let pool = self.pool.clone();
        let grace = self.settings.backup_grace;

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            match sqlx::query("DELETE FROM backups WHERE key = ?")
                .bind(&key)
                .execute(&pool)
                .await
            {
                Ok(_) => tracing::debug!(key = %key, "Removed pre-migration backup"),
                Err(e) => tracing::warn!(key = %key, error = %e, "Failed to remove backup"),
            }
        });
    }

    /// Seed the operator account and write default settings once.
    pub async fn bootstrap(&self) -> Result<()> {
        let now = self.clock.now();

        sqlx::query("INSERT OR IGNORE INTO accounts (id, display_name, created_at) VALUES (?, ?, ?)")
            .bind(SEED_ACCOUNT_ID)
            .bind("Local operator")
            .bind(encode_ts(now))
            .execute(&self.pool)
            .await
            .map_err(|e| ClientError::SeedDataMissing(e.to_string()))?;

        let seeded: Option<String> = sqlx::query_scalar("SELECT id FROM accounts WHERE id = ?")
            .bind(SEED_ACCOUNT_ID)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ClientError::SeedDataMissing(e.to_string()))?;
        if seeded.is_none() {
            return Err(ClientError::SeedDataMissing(SEED_ACCOUNT_ID.to_string()));
        }

        if db::get_flag(&self.pool, keys::INITIAL_SETUP_COMPLETED).await? {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let defaults = [
            (keys::RETENTION_DAYS, self.settings.retention_days.to_string()),
            (keys::MAX_RETRIES, self.settings.max_retries.to_string()),
            (keys::INITIAL_SYNC_COMPLETED, "false".to_string()),
            (keys::LEGACY_IMPORT_COMPLETED, "false".to_string()),
            (keys::INITIAL_SETUP_COMPLETED, "true".to_string()),
        ];
        for (key, value) in &defaults {
            db::set_setting(&mut *tx, key, value, now).await?;
        }
        tx.commit().await?;

        tracing::info!("Initial setup completed");
        Ok(())
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}
