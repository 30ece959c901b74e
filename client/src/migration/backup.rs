//! Backups, export and import.

use super::MigrationManager;
use crate::db::{self, encode_ts, keys};
use crate::error::{ClientError, Result};
use farmsync_engine::{BackupInfo, BackupSnapshot, DataExport, EntityKind, Error, Timestamp};
use serde::Serialize;

/// Result of [`MigrationManager::import_data`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub imported: usize,
    pub cleared: u64,
}

impl MigrationManager {
    /// Every entity (soft-deleted included) and the portable settings.
    ///
    /// Kinds whose table does not exist yet are skipped.
    pub async fn export_data(&self) -> Result<DataExport> {
        let version = self.current_version().await?;
        let mut export = DataExport::new(version, self.clock.now());

        for (key, value) in db::all_settings(&self.pool).await? {
            if key != keys::SCHEMA_VERSION {
                export.settings.insert(key, value);
            }
        }

        for kind in EntityKind::ALL {
            if !db::table_exists(&self.pool, kind.table()).await? {
                continue;
            }
            for row in db::get_all_entities(&self.pool, kind).await? {
                export.add_record(row.into_record(kind)?);
            }
        }

        Ok(export)
    }

    /// Snapshot everything into the backups table.
    pub async fn create_backup(&self) -> Result<BackupSnapshot> {
        let snapshot = BackupSnapshot::new(self.export_data().await?);
        let info = snapshot.info();

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO backups (key, created_at, schema_version, record_count, data)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&snapshot.key)
        .bind(encode_ts(snapshot.created_at))
        .bind(i64::from(info.schema_version))
        .bind(i64::try_from(info.record_count).unwrap_or(i64::MAX))
        .bind(snapshot.data.to_json()?)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            key = %snapshot.key,
            schema_version = info.schema_version,
            records = info.record_count,
            "Backup created"
        );
        Ok(snapshot)
    }

    /// Stored backups, newest first.
    pub async fn list_backups(&self) -> Result<Vec<BackupInfo>> {
        self.ensure_bookkeeping().await?;

        let rows: Vec<(String, String, i64, i64)> = sqlx::query_as(
            "SELECT key, created_at, schema_version, record_count FROM backups ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(key, created_at, schema_version, record_count)| -> Result<BackupInfo> {
                Ok(BackupInfo {
                    key,
                    created_at: db::decode_ts(&created_at)?,
                    schema_version: u32::try_from(schema_version).unwrap_or(0),
                    record_count: usize::try_from(record_count).unwrap_or(0),
                })
            })
            .collect()
    }

    pub async fn load_backup(&self, key: &str) -> Result<BackupSnapshot> {
        self.ensure_bookkeeping().await?;

        let row: Option<(String, String)> =
            sqlx::query_as("SELECT created_at, data FROM backups WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        let (created_at, data) = row.ok_or_else(|| ClientError::BackupNotFound(key.to_string()))?;

        Ok(BackupSnapshot {
            key: key.to_string(),
            created_at: db::decode_ts(&created_at)?,
            data: DataExport::from_json(&data)?,
        })
    }

    /// Replace all entities and settings with a stored backup.
    pub async fn restore_from_backup(&self, key: &str) -> Result<BackupInfo> {
        let backup = self.load_backup(key).await?;
        self.restore_snapshot(&backup.data).await?;
        tracing::info!(key = %key, "Backup restored");
        Ok(backup.info())
    }

    /// Write an export back verbatim, schema version included.
    pub(crate) async fn restore_snapshot(&self, export: &DataExport) -> Result<()> {
        let target = self.target_version();
        if export.schema_version > target {
            return Err(Error::SchemaVersionMismatch {
                expected: target,
                actual: export.schema_version,
            }
            .into());
        }

        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        for kind in EntityKind::ALL {
            if !db::table_exists(&mut *tx, kind.table()).await? {
                if !export.records(kind).is_empty() {
                    tracing::warn!(kind = %kind, "Table missing; skipping records in backup");
                }
                continue;
            }
            db::clear_entities(&mut *tx, kind).await?;
            let with_last_synced =
                db::table_has_column(&mut *tx, kind.table(), "last_synced_at").await?;
            for record in export.records(kind) {
                db::replace_entity(&mut *tx, record, with_last_synced).await?;
            }
        }

        for (key, value) in &export.settings {
            db::set_setting(&mut *tx, key, value, now).await?;
        }
        db::set_setting(
            &mut *tx,
            keys::SCHEMA_VERSION,
            &export.schema_version.to_string(),
            now,
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Load records from an export in one transaction.
    ///
    /// Settings in the export are not applied.
    pub async fn import_data(&self, data: &DataExport, clear_existing: bool) -> Result<ImportReport> {
        data.validate(self.target_version())?;

        let mut report = ImportReport::default();
        let mut tx = self.pool.begin().await?;

        if clear_existing {
            for kind in EntityKind::ALL {
                if db::table_exists(&mut *tx, kind.table()).await? {
                    report.cleared += db::clear_entities(&mut *tx, kind).await?;
                }
            }
        }

        for (kind, records) in &data.entities {
            if records.is_empty() {
                continue;
            }
            if !db::table_exists(&mut *tx, kind.table()).await? {
                return Err(ClientError::StorageUnavailable(format!(
                    "table {} does not exist",
                    kind.table()
                )));
            }
            let with_last_synced =
                db::table_has_column(&mut *tx, kind.table(), "last_synced_at").await?;
            for record in records {
                db::replace_entity(&mut *tx, record, with_last_synced).await?;
                report.imported += 1;
            }
        }

        tx.commit().await?;
        tracing::info!(
            imported = report.imported,
            cleared = report.cleared,
            "Data imported"
        );
        Ok(report)
    }

    /// Delete backups older than `older_than`, keeping the newest `keep_latest`.
    pub async fn cleanup_backups(&self, keep_latest: usize, older_than: Timestamp) -> Result<u64> {
        self.ensure_bookkeeping().await?;

        let result = sqlx::query(
            r#"
            DELETE FROM backups
            WHERE created_at < ?
              AND key NOT IN (SELECT key FROM backups ORDER BY created_at DESC LIMIT ?)
            "#,
        )
        .bind(encode_ts(older_than))
        .bind(i64::try_from(keep_latest).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_pool;
    use crate::migration::{MigrationSettings, LATEST_SCHEMA_VERSION};
    use chrono::{TimeZone, Utc};
    use farmsync_engine::{Clock, EntityRecord, ManualClock};
    use serde_json::json;
    use std::sync::Arc;

    async fn manager() -> (MigrationManager, Arc<ManualClock>) {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap(),
        ));
        let manager = MigrationManager::new(pool, clock.clone(), MigrationSettings::default());
        manager.migrate().await.unwrap();
        (manager, clock)
    }

    fn farm(id: &str, clock: &ManualClock) -> EntityRecord {
        EntityRecord::new_local(
            EntityKind::Farm,
            id,
            Some("org-1".into()),
            json!({"name": id}),
            clock.now(),
            false,
        )
    }

    #[tokio::test]
    async fn backup_and_restore_round_trip() {
        let (manager, clock) = manager().await;
        db::insert_entity(manager.pool(), &farm("farm-1", &clock))
            .await
            .unwrap();

        let backup = manager.create_backup().await.unwrap();
        assert_eq!(backup.info().record_count, 1);

        db::clear_entities(manager.pool(), EntityKind::Farm)
            .await
            .unwrap();
        manager.restore_from_backup(&backup.key).await.unwrap();

        let restored = db::get_entity(manager.pool(), EntityKind::Farm, "farm-1")
            .await
            .unwrap();
        assert!(restored.is_some());
    }

    #[tokio::test]
    async fn restoring_unknown_backup_fails() {
        let (manager, _) = manager().await;
        let err = manager.restore_from_backup("backup-missing").await.unwrap_err();
        assert!(matches!(err, ClientError::BackupNotFound(_)));
    }

    #[tokio::test]
    async fn export_omits_schema_version_setting() {
        let (manager, _) = manager().await;
        let export = manager.export_data().await.unwrap();
        assert_eq!(export.schema_version, LATEST_SCHEMA_VERSION);
        assert!(!export.settings.contains_key(keys::SCHEMA_VERSION));
    }

    #[tokio::test]
    async fn import_with_clear_replaces_rows() {
        let (manager, clock) = manager().await;
        db::insert_entity(manager.pool(), &farm("old", &clock))
            .await
            .unwrap();

        let mut export = DataExport::new(1, clock.now());
        export.add_record(farm("new-1", &clock));
        export.add_record(farm("new-2", &clock));

        let report = manager.import_data(&export, true).await.unwrap();
        assert_eq!(report, ImportReport { imported: 2, cleared: 1 });

        let rows = db::get_all_entities(manager.pool(), EntityKind::Farm)
            .await
            .unwrap();
        let ids: Vec<_> = rows.into_iter().map(|r| r.local_id).collect();
        assert_eq!(ids, vec!["new-1".to_string(), "new-2".to_string()]);
    }

    #[tokio::test]
    async fn cleanup_keeps_newest() {
        let (manager, clock) = manager().await;
        manager.create_backup().await.unwrap();
        clock.advance(chrono::Duration::hours(1));
        manager.create_backup().await.unwrap();
        clock.advance(chrono::Duration::hours(1));
        manager.create_backup().await.unwrap();

        let cutoff = clock.now();
        let removed = manager.cleanup_backups(1, cutoff).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(manager.list_backups().await.unwrap().len(), 1);
    }
}
