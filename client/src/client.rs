//! Consumer-facing API.
//!
//! [`SyncClient`] bundles the store, queue, driver and migration manager
//! behind one cheaply cloneable handle. Mutations go to the local store and
//! are announced on the event hub; everything else delegates.

use crate::config::Config;
use crate::connectivity::ConnectivityProvider;
use crate::db::{self, keys, Pool};
use crate::driver::{DriverSettings, HousekeepingReport, RefreshReport, SyncDriver, SyncOutcome};
use crate::error::{ClientError, Result};
use crate::events::{EventHub, Subscription, SyncEvent};
use crate::migration::{ImportReport, MigrationManager, MigrationStatus};
use crate::queue::{QueueCounts, SyncQueue};
use crate::remote::RemoteApi;
use crate::session::SessionContext;
use crate::store::{LocalStore, Query};
use farmsync_engine::{
    BackupInfo, Clock, DataExport, EntityKind, EntityRecord, NewQueueEntry, OrganizationId,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Queue state for the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub per_kind: BTreeMap<EntityKind, QueueCounts>,
    pub pending: u64,
    pub failed: u64,
    pub running: bool,
    pub online: bool,
    pub read_only: bool,
    pub initial_sync_completed: bool,
}

/// Result of [`SyncClient::verify_integrity`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    /// Queue entries recreated for records flagged `needs_sync`
    pub rebuilt_entries: u64,
}

/// Handle to a booted local store and its sync machinery.
#[derive(Debug, Clone)]
pub struct SyncClient {
    pool: Pool,
    store: LocalStore,
    queue: SyncQueue,
    driver: Arc<SyncDriver>,
    migrations: MigrationManager,
    events: Arc<EventHub>,
    session: Arc<SessionContext>,
    connectivity: Arc<dyn ConnectivityProvider>,
    clock: Arc<dyn Clock>,
}

impl SyncClient {
    /// Wire the services together over an already migrated pool.
    pub fn assemble(
        pool: Pool,
        migrations: MigrationManager,
        remote: Arc<dyn RemoteApi>,
        connectivity: Arc<dyn ConnectivityProvider>,
        clock: Arc<dyn Clock>,
        session: Arc<SessionContext>,
        settings: DriverSettings,
    ) -> Self {
        let events = EventHub::new_shared();
        let queue = SyncQueue::new(pool.clone(), clock.clone());
        let store = LocalStore::new(pool.clone(), queue.clone(), session.clone(), clock.clone());
        let driver = Arc::new(SyncDriver::new(
            store.clone(),
            queue.clone(),
            remote,
            connectivity.clone(),
            events.clone(),
            clock.clone(),
            settings,
        ));

        Self {
            pool,
            store,
            queue,
            driver,
            migrations,
            events,
            session,
            connectivity,
            clock,
        }
    }

    /// Open the database, migrate, seed and assemble.
    ///
    /// No background tasks are started; see the coordinator for that.
    pub async fn open(
        config: &Config,
        remote: Arc<dyn RemoteApi>,
        connectivity: Arc<dyn ConnectivityProvider>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let pool = db::create_pool(&config.database_url).await?;
        let migrations =
            MigrationManager::new(pool.clone(), clock.clone(), config.migration_settings());
        migrations.migrate().await?;
        migrations.bootstrap().await?;

        let session = Arc::new(SessionContext::new(config.organization_id.clone()));
        let client = Self::assemble(
            pool,
            migrations,
            remote,
            connectivity,
            clock,
            session,
            config.driver_settings(),
        );
        client.restore_session().await;
        Ok(client)
    }

    /// Pick up the organization persisted by a previous session, unless one
    /// was configured.
    pub async fn restore_session(&self) {
        if self.session.organization_id().is_some() {
            return;
        }
        match db::get_setting(&self.pool, keys::CURRENT_ORGANIZATION_ID).await {
            Ok(Some(org)) if !org.is_empty() => self.session.set_organization(Some(org)),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Could not read saved organization"),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn driver(&self) -> &Arc<SyncDriver> {
        &self.driver
    }

    pub fn migrations(&self) -> &MigrationManager {
        &self.migrations
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn max_retries(&self) -> u32 {
        self.driver.settings().backoff.max_attempts
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.session.is_read_only() {
            return Err(ClientError::ReadOnly);
        }
        Ok(())
    }

    fn announce(&self, kind: EntityKind, local_id: &str, operation: farmsync_engine::Operation) {
        self.events.publish(SyncEvent::RecordChanged {
            kind,
            local_id: local_id.to_string(),
            operation,
        });
    }

    // Records

    pub async fn create(&self, kind: EntityKind, data: Value) -> Result<EntityRecord> {
        let record = self.store.create(kind, data, false).await?;
        self.announce(kind, &record.local_id, farmsync_engine::Operation::Create);
        Ok(record)
    }

    /// Returns 0 when the record doesn't exist or has been deleted.
    pub async fn update(&self, kind: EntityKind, local_id: &str, patch: Value) -> Result<u64> {
        let affected = self.store.update(kind, local_id, patch, false).await?;
        if affected > 0 {
            self.announce(kind, local_id, farmsync_engine::Operation::Update);
        }
        Ok(affected)
    }

    /// Soft delete.
    pub async fn delete(&self, kind: EntityKind, local_id: &str) -> Result<EntityRecord> {
        let record = self.store.soft_delete(kind, local_id, false).await?;
        self.announce(kind, local_id, farmsync_engine::Operation::Delete);
        Ok(record)
    }

    pub async fn hard_delete(&self, kind: EntityKind, local_id: &str) -> Result<u64> {
        self.store.hard_delete(kind, local_id).await
    }

    pub async fn get(
        &self,
        kind: EntityKind,
        local_id: &str,
        include_deleted: bool,
    ) -> Option<EntityRecord> {
        self.store.get_by_id(kind, local_id, include_deleted).await
    }

    pub async fn get_by_server_id(&self, kind: EntityKind, server_id: &str) -> Option<EntityRecord> {
        self.store.get_by_server_id(kind, server_id, false).await
    }

    pub async fn list(&self, kind: EntityKind, query: &Query) -> Vec<EntityRecord> {
        self.store.query(kind, query).await
    }

    pub async fn count(&self, kind: EntityKind, query: &Query) -> u64 {
        self.store.count(kind, query).await
    }

    /// Read-through from the server; local data is kept on any failure.
    pub async fn refresh(&self, kind: EntityKind) -> RefreshReport {
        if self.session.is_read_only() {
            let mut report = RefreshReport::new(kind);
            report.error = Some(ClientError::ReadOnly.to_string());
            return report;
        }
        self.driver.refresh(kind).await
    }

    // Sync

    pub async fn trigger_sync(&self) -> Result<SyncOutcome> {
        self.driver.run_pass().await
    }

    pub fn cancel_sync(&self) {
        self.driver.cancel();
    }

    /// Queue counts per kind. Storage errors read as an empty queue.
    pub async fn sync_status(&self) -> SyncStatus {
        let per_kind = match self.queue.counts().await {
            Ok(counts) => counts,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read queue counts");
                BTreeMap::new()
            }
        };
        let initial_sync_completed = db::get_flag(&self.pool, keys::INITIAL_SYNC_COMPLETED)
            .await
            .unwrap_or(false);

        SyncStatus {
            pending: per_kind.values().map(|c| c.pending).sum(),
            failed: per_kind.values().map(|c| c.failed).sum(),
            per_kind,
            running: self.driver.is_running(),
            online: self.connectivity.current().is_online(),
            read_only: self.session.is_read_only(),
            initial_sync_completed,
        }
    }

    /// Manually retry failed entries under the ceiling, rejected ones too.
    pub async fn retry_failed(&self, ids: Option<&[i64]>) -> Result<u64> {
        self.ensure_writable()?;
        self.queue.retry_failed(ids, self.max_retries()).await
    }

    /// Drop entries parked at the retry ceiling.
    pub async fn clear_failed(&self) -> Result<u64> {
        self.ensure_writable()?;
        self.queue.clear_failed(self.max_retries()).await
    }

    pub async fn housekeeping(&self) -> Result<HousekeepingReport> {
        self.ensure_writable()?;
        self.driver.housekeeping().await
    }

    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    pub fn unsubscribe(&self, subscription_id: &str) {
        self.events.unsubscribe(subscription_id);
    }

    // Session

    pub fn organization_id(&self) -> Option<OrganizationId> {
        self.session.organization_id()
    }

    /// Switch tenant and remember it for the next session.
    pub async fn set_organization(&self, organization_id: Option<OrganizationId>) -> Result<()> {
        match &organization_id {
            Some(org) => {
                db::set_setting(
                    &self.pool,
                    keys::CURRENT_ORGANIZATION_ID,
                    org,
                    self.clock.now(),
                )
                .await?;
            }
            None => {
                db::delete_setting(&self.pool, keys::CURRENT_ORGANIZATION_ID).await?;
            }
        }
        tracing::info!(organization_id = ?organization_id, "Organization context changed");
        self.session.set_organization(organization_id);
        Ok(())
    }

    // Migrations and backups

    pub async fn migration_status(&self) -> Result<MigrationStatus> {
        self.migrations.status().await
    }

    pub async fn create_backup(&self) -> Result<BackupInfo> {
        Ok(self.migrations.create_backup().await?.info())
    }

    /// Restore a backup and queue whatever it holds that still needs syncing.
    pub async fn restore_from_backup(&self, key: &str) -> Result<BackupInfo> {
        self.ensure_writable()?;
        let info = self.migrations.restore_from_backup(key).await?;
        self.rebuild_missing_entries().await?;
        Ok(info)
    }

    pub async fn list_backups(&self) -> Result<Vec<BackupInfo>> {
        self.migrations.list_backups().await
    }

    pub async fn export_data(&self) -> Result<DataExport> {
        self.migrations.export_data().await
    }

    /// Load an export; imported records flagged `needs_sync` are queued.
    pub async fn import_data(&self, data: &DataExport, clear_existing: bool) -> Result<ImportReport> {
        self.ensure_writable()?;
        let report = self.migrations.import_data(data, clear_existing).await?;
        self.rebuild_missing_entries().await?;
        Ok(report)
    }

    /// Run `PRAGMA quick_check` and recreate queue entries for records that
    /// still need syncing but have nothing queued.
    pub async fn verify_integrity(&self) -> Result<IntegrityReport> {
        let quick_check_ok = db::quick_check(&self.pool).await?;
        if !quick_check_ok {
            tracing::error!("Database integrity check failed");
        }

        let rebuilt_entries = if self.session.is_read_only() {
            0
        } else {
            self.rebuild_missing_entries().await?
        };

        Ok(IntegrityReport {
            quick_check_ok,
            rebuilt_entries,
        })
    }

    /// Queue an entry for every record with `needs_sync` set and nothing
    /// outstanding. Returns how many were queued.
    async fn rebuild_missing_entries(&self) -> Result<u64> {
        let mut rebuilt = 0;
        for kind in EntityKind::in_dependency_order() {
            for record in self.store.pending_records(kind).await? {
                if self
                    .queue
                    .has_outstanding(kind, &record.local_id, None)
                    .await?
                {
                    continue;
                }
                self.queue.enqueue(NewQueueEntry::rebuild_for(&record)).await?;
                rebuilt += 1;
                tracing::info!(
                    kind = %kind,
                    local_id = %record.local_id,
                    "Rebuilt missing sync entry"
                );
            }
        }
        Ok(rebuilt)
    }
}
