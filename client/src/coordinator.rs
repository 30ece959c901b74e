//! Boot sequence.
//!
//! Brings the subsystem up in order: storage, migrations, a storage ping,
//! background maintenance, the connectivity listener, and the first full
//! sync. Storage and migration failures are retried with backoff. If they
//! keep failing the coordinator degrades instead of erroring out:
//!
//! | failure                | mode                   | code                  |
//! |------------------------|------------------------|-----------------------|
//! | storage won't open     | [`BootMode::OnlineOnly`] | `STORAGE_UNAVAILABLE` |
//! | migrations won't apply | [`BootMode::ReadOnly`]   | `MIGRATION_FAILED`    |

use crate::client::SyncClient;
use crate::config::Config;
use crate::connectivity::ConnectivityProvider;
use crate::db::{self, keys};
use crate::driver::SyncOutcome;
use crate::error::{ClientError, Result};
use crate::migration::{MigrationManager, MigrationReport, MigrationStep};
use crate::remote::RemoteApi;
use crate::session::SessionContext;
use farmsync_engine::{BackoffPolicy, Clock, DataExport, SystemClock};
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BootMode {
    Full,
    /// Reads work, mutations fail with `ReadOnly`, sync is off
    ReadOnly,
    /// No local store; only the remote API is usable
    OnlineOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BootErrorCode {
    StorageUnavailable,
    MigrationFailed,
}

impl BootErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootErrorCode::StorageUnavailable => "STORAGE_UNAVAILABLE",
            BootErrorCode::MigrationFailed => "MIGRATION_FAILED",
        }
    }
}

/// How boot went.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BootReport {
    pub mode: BootMode,
    pub error_code: Option<BootErrorCode>,
    pub error: Option<String>,
    pub migration: Option<MigrationReport>,
    pub initial_sync_ran: bool,
}

impl BootReport {
    fn full(migration: MigrationReport) -> Self {
        Self {
            mode: BootMode::Full,
            error_code: None,
            error: None,
            migration: Some(migration),
            initial_sync_ran: false,
        }
    }

    fn degraded(mode: BootMode, code: BootErrorCode, error: &ClientError) -> Self {
        Self {
            mode,
            error_code: Some(code),
            error: Some(error.to_string()),
            migration: None,
            initial_sync_ran: false,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.mode != BootMode::Full
    }
}

/// Everything boot produced.
#[derive(Debug)]
pub struct Booted {
    pub report: BootReport,
    /// Absent in online-only mode
    pub client: Option<SyncClient>,
    pub remote: Arc<dyn RemoteApi>,
    /// Legacy import and integrity check
    pub maintenance: Option<JoinHandle<()>>,
    /// Connectivity listener and periodic sync
    pub listeners: Vec<JoinHandle<()>>,
}

impl Booted {
    /// Stop the background listeners.
    pub fn shutdown(&self) {
        for handle in &self.listeners {
            handle.abort();
        }
    }
}

/// Run `op` until it succeeds or `policy` runs out of attempts.
pub async fn with_retry<T, F, Fut>(policy: &BackoffPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if policy.should_retry(attempt) => {
                let delay = policy.delay_for(attempt, rand::random::<f64>());
                tracing::warn!(what, attempt, ?delay, error = %e, "Boot step failed; retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                tracing::error!(what, attempt, error = %e, "Boot step failed; giving up");
                return Err(e);
            }
        }
    }
}

/// Boots the client.
pub struct Coordinator {
    config: Config,
    remote: Arc<dyn RemoteApi>,
    connectivity: Arc<dyn ConnectivityProvider>,
    clock: Arc<dyn Clock>,
    steps: Option<Vec<MigrationStep>>,
}

impl Coordinator {
    pub fn new(
        config: Config,
        remote: Arc<dyn RemoteApi>,
        connectivity: Arc<dyn ConnectivityProvider>,
    ) -> Self {
        Self {
            config,
            remote,
            connectivity,
            clock: Arc::new(SystemClock),
            steps: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the built-in migration steps.
    pub fn with_migration_steps(mut self, steps: Vec<MigrationStep>) -> Self {
        self.steps = Some(steps);
        self
    }

    pub async fn boot(self) -> Booted {
        let policy = self.config.boot_policy();

        let url = self.config.database_url.clone();
        let opened = with_retry(&policy, "open storage", || {
            let url = url.clone();
            async move {
                let pool = db::create_pool(&url).await?;
                db::ping(&pool).await?;
                Ok(pool)
            }
        })
        .await;
        let pool = match opened {
            Ok(pool) => pool,
            Err(e) => return self.online_only(&e),
        };

        let mut migrations = MigrationManager::new(
            pool.clone(),
            self.clock.clone(),
            self.config.migration_settings(),
        );
        if let Some(steps) = self.steps.clone() {
            migrations = migrations.with_steps(steps);
        }

        let migrated = with_retry(&policy, "migrate", || {
            let migrations = migrations.clone();
            async move {
                let report = migrations.migrate().await?;
                migrations.bootstrap().await?;
                Ok(report)
            }
        })
        .await;

        let session = Arc::new(SessionContext::new(self.config.organization_id.clone()));
        let mut report = match migrated {
            Ok(migration) => BootReport::full(migration),
            Err(e) => {
                session.set_read_only(true);
                BootReport::degraded(BootMode::ReadOnly, BootErrorCode::MigrationFailed, &e)
            }
        };

        if let Err(e) = db::ping(&pool).await {
            return self.online_only(&ClientError::from(e));
        }

        let client = SyncClient::assemble(
            pool,
            migrations,
            self.remote.clone(),
            self.connectivity.clone(),
            self.clock.clone(),
            session,
            self.config.driver_settings(),
        );
        client.restore_session().await;

        let mut maintenance_task = None;
        let mut listeners = Vec::new();

        if report.mode == BootMode::Full {
            maintenance_task = Some(tokio::spawn(maintenance(
                client.clone(),
                self.config.legacy_import_path.clone(),
            )));

            listeners.push(client.driver().spawn_connectivity_listener());
            if let Some(every) = self.config.sync_interval {
                listeners.push(client.driver().spawn_periodic(every));
            }

            report.initial_sync_ran = initial_sync(&client, self.connectivity.as_ref()).await;
        }

        tracing::info!(mode = ?report.mode, code = ?report.error_code, "Boot finished");
        Booted {
            report,
            client: Some(client),
            remote: self.remote,
            maintenance: maintenance_task,
            listeners,
        }
    }

    fn online_only(&self, error: &ClientError) -> Booted {
        tracing::error!(error = %error, "Local storage unavailable; running online-only");
        Booted {
            report: BootReport::degraded(
                BootMode::OnlineOnly,
                BootErrorCode::StorageUnavailable,
                error,
            ),
            client: None,
            remote: self.remote.clone(),
            maintenance: None,
            listeners: Vec::new(),
        }
    }
}

/// Best-effort background work after boot.
async fn maintenance(client: SyncClient, legacy_path: Option<PathBuf>) {
    if let Some(path) = legacy_path {
        if let Err(e) = import_legacy(&client, &path).await {
            tracing::warn!(path = %path.display(), error = %e, "Legacy import failed");
        }
    }

    match client.verify_integrity().await {
        Ok(report) => tracing::info!(?report, "Integrity check finished"),
        Err(e) => tracing::warn!(error = %e, "Integrity check failed"),
    }
}

/// Import a legacy JSON export once.
async fn import_legacy(client: &SyncClient, path: &std::path::Path) -> Result<()> {
    if db::get_flag(client.pool(), keys::LEGACY_IMPORT_COMPLETED).await? {
        return Ok(());
    }
    if !tokio::fs::try_exists(path).await? {
        tracing::debug!(path = %path.display(), "No legacy data to import");
        return Ok(());
    }

    let raw = tokio::fs::read_to_string(path).await?;
    let data = DataExport::from_json(&raw)?;
    let imported = client.import_data(&data, false).await?;

    db::set_setting(
        client.pool(),
        keys::LEGACY_IMPORT_COMPLETED,
        "true",
        client.clock().now(),
    )
    .await?;
    tracing::info!(records = imported.imported, "Legacy data imported");
    Ok(())
}

/// First full sync: push the queue, then pull everything.
async fn initial_sync(client: &SyncClient, connectivity: &dyn ConnectivityProvider) -> bool {
    match db::get_flag(client.pool(), keys::INITIAL_SYNC_COMPLETED).await {
        Ok(true) => return false,
        Ok(false) => {}
        Err(e) => {
            tracing::warn!(error = %e, "Could not read initial sync flag");
            return false;
        }
    }
    if !connectivity.current().is_online() {
        tracing::info!("Offline at boot; initial sync deferred");
        return false;
    }

    match client.trigger_sync().await {
        Ok(SyncOutcome::Completed(_)) => {}
        Ok(outcome) => {
            tracing::debug!(?outcome, "Initial sync did not run");
            return false;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Initial sync failed");
            return false;
        }
    }

    let reports = client.driver().pull_all().await;
    if reports.iter().any(|r| r.error.is_some()) {
        tracing::warn!("Initial pull incomplete; will retry at next boot");
        return true;
    }

    if let Err(e) = db::set_setting(
        client.pool(),
        keys::INITIAL_SYNC_COMPLETED,
        "true",
        client.clock().now(),
    )
    .await
    {
        tracing::warn!(error = %e, "Could not record initial sync");
    }
    true
}
