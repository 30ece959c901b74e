//! Schema migrations, backups and rollback.

mod common;

use common::{farm, t0, Harness, ORG};
use farmsync_client::db::{self, keys};
use farmsync_client::migration::steps::{default_steps, StepFuture};
use farmsync_client::{
    ClientError, MigrationManager, MigrationSettings, MigrationStep, LATEST_SCHEMA_VERSION,
};
use farmsync_engine::{Clock, EntityKind, EntityRecord, ManualClock};
use sqlx::SqliteConnection;
use std::sync::Arc;
use std::time::Duration;

async fn fresh_manager(settings: MigrationSettings) -> MigrationManager {
    let pool = db::create_pool("sqlite::memory:").await.unwrap();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(t0()));
    MigrationManager::new(pool, clock, settings)
}

fn wipe_farms_then_fail(conn: &mut SqliteConnection) -> StepFuture<'_> {
    Box::pin(async move {
        sqlx::query("DELETE FROM farms").execute(&mut *conn).await?;
        sqlx::query("SELECT missing_column FROM farms")
            .execute(&mut *conn)
            .await?;
        Ok(())
    })
}

fn hang(_conn: &mut SqliteConnection) -> StepFuture<'_> {
    Box::pin(async {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    })
}

fn add_farm_notes(conn: &mut SqliteConnection) -> StepFuture<'_> {
    Box::pin(async move {
        sqlx::query("ALTER TABLE farms ADD COLUMN notes TEXT")
            .execute(&mut *conn)
            .await?;
        Ok(())
    })
}

fn with_extra_step(step: MigrationStep) -> Vec<MigrationStep> {
    let mut steps = default_steps();
    steps.push(step);
    steps
}

async fn seed_farm(manager: &MigrationManager) -> EntityRecord {
    let record = EntityRecord::new_local(
        EntityKind::Farm,
        "farm-local-1",
        Some(ORG.to_string()),
        farm("North"),
        t0(),
        false,
    );
    db::insert_entity(manager.pool(), &record).await.unwrap();
    record
}

#[tokio::test]
async fn migrating_twice_is_a_no_op() {
    let manager = fresh_manager(MigrationSettings::default()).await;

    let first = manager.migrate().await.unwrap();
    assert_eq!(first.from, 0);
    assert_eq!(first.to, LATEST_SCHEMA_VERSION);
    assert_eq!(first.applied, vec![1, 2, 3]);

    let second = manager.migrate().await.unwrap();
    assert!(second.applied.is_empty());
    assert_eq!(second.to, LATEST_SCHEMA_VERSION);

    let status = manager.status().await.unwrap();
    assert!(status.pending.is_empty());
    assert!(!status.initial_setup_completed);
}

#[tokio::test]
async fn steps_tolerate_being_replayed() {
    let manager = fresh_manager(MigrationSettings::default()).await;
    manager.migrate().await.unwrap();

    let mut conn = manager.pool().acquire().await.unwrap();
    for step in default_steps() {
        (step.apply)(&mut *conn).await.unwrap();
    }
}

#[tokio::test]
async fn bootstrap_seeds_defaults_once() {
    let manager = fresh_manager(MigrationSettings::default()).await;
    manager.migrate().await.unwrap();
    manager.bootstrap().await.unwrap();

    assert!(db::get_flag(manager.pool(), keys::INITIAL_SETUP_COMPLETED)
        .await
        .unwrap());
    assert_eq!(
        db::get_setting(manager.pool(), keys::MAX_RETRIES).await.unwrap(),
        Some("5".to_string())
    );

    db::set_setting(manager.pool(), keys::MAX_RETRIES, "9", t0())
        .await
        .unwrap();
    manager.bootstrap().await.unwrap();
    assert_eq!(
        db::get_setting(manager.pool(), keys::MAX_RETRIES).await.unwrap(),
        Some("9".to_string())
    );
}

#[tokio::test]
async fn failed_step_restores_the_backup() {
    let manager = fresh_manager(MigrationSettings::default()).await;
    manager.migrate().await.unwrap();
    let farm = seed_farm(&manager).await;

    let upgraded = manager.clone().with_steps(with_extra_step(MigrationStep::new(
        4,
        "broken step",
        wipe_farms_then_fail,
    )));
    let err = upgraded.migrate().await.unwrap_err();
    assert!(matches!(err, ClientError::MigrationFailed { version: 4, .. }));
    assert!(err.is_migration());

    assert_eq!(upgraded.current_version().await.unwrap(), 3);
    let restored = db::get_entity(manager.pool(), EntityKind::Farm, &farm.local_id)
        .await
        .unwrap()
        .expect("farm survives the failed step");
    assert_eq!(
        restored.into_record(EntityKind::Farm).unwrap().data["name"],
        "North"
    );

    let backups = upgraded.list_backups().await.unwrap();
    assert!(backups.iter().any(|b| b.schema_version == 3 && b.record_count == 1));
}

#[tokio::test]
async fn hung_step_times_out() {
    let manager = fresh_manager(MigrationSettings {
        step_timeout: Duration::from_millis(50),
        ..MigrationSettings::default()
    })
    .await;
    manager.migrate().await.unwrap();

    let upgraded = manager
        .clone()
        .with_steps(with_extra_step(MigrationStep::new(4, "hangs", hang)));
    let err = upgraded.migrate().await.unwrap_err();
    assert!(matches!(err, ClientError::MigrationTimeout { version: 4 }));
    assert_eq!(err.code(), "MIGRATION_TIMEOUT");
    assert_eq!(upgraded.current_version().await.unwrap(), 3);
}

#[tokio::test]
async fn newer_schema_is_left_alone() {
    let manager = fresh_manager(MigrationSettings::default()).await;
    manager.migrate().await.unwrap();
    db::set_setting(manager.pool(), keys::SCHEMA_VERSION, "99", t0())
        .await
        .unwrap();

    let report = manager.migrate().await.unwrap();
    assert_eq!(report.from, 99);
    assert!(report.applied.is_empty());
}

#[tokio::test]
async fn restore_brings_back_earlier_state() {
    let h = Harness::new().await;
    let kept = h.client.create(EntityKind::Farm, farm("North")).await.unwrap();
    let backup = h.client.create_backup().await.unwrap();
    assert_eq!(backup.record_count, 1);

    h.clock.advance(chrono::Duration::minutes(5));
    h.client.create(EntityKind::Farm, farm("Later")).await.unwrap();
    h.client.delete(EntityKind::Farm, &kept.local_id).await.unwrap();

    let restored = h.client.restore_from_backup(&backup.key).await.unwrap();
    assert_eq!(restored.key, backup.key);

    let farms = h
        .client
        .list(EntityKind::Farm, &farmsync_client::Query::new())
        .await;
    assert_eq!(farms.len(), 1);
    assert_eq!(farms[0].local_id, kept.local_id);

    let err = h.client.restore_from_backup("no-such-backup").await.unwrap_err();
    assert_eq!(err.code(), "BACKUP_NOT_FOUND");
}

#[tokio::test]
async fn export_then_import_into_an_empty_store() {
    let source = Harness::new().await;
    let f = source.client.create(EntityKind::Farm, farm("North")).await.unwrap();
    source
        .client
        .create(EntityKind::Batch, common::batch(&f.local_id))
        .await
        .unwrap();
    let export = source.client.export_data().await.unwrap();
    assert_eq!(export.records(EntityKind::Batch).len(), 1);

    let target = Harness::new().await;
    let report = target.client.import_data(&export, true).await.unwrap();
    assert_eq!(report.imported, 2);

    let imported = target.client.get(EntityKind::Farm, &f.local_id, false).await.unwrap();
    assert_eq!(imported.data["name"], "North");
}

#[tokio::test]
async fn export_works_on_the_pool_that_ran_the_migrations() {
    let manager = fresh_manager(MigrationSettings::default()).await;
    manager.migrate().await.unwrap();
    let farm = seed_farm(&manager).await;

    let export = manager.export_data().await.unwrap();
    let farms = export.records(EntityKind::Farm);
    assert_eq!(farms.len(), 1);
    assert_eq!(farms[0].local_id, farm.local_id);
    assert_eq!(farms[0].data["name"], "North");

    let backup = manager.create_backup().await.unwrap();
    assert_eq!(backup.info().record_count, 1);

    // A later step widens a table the backup already read
    let upgraded = manager
        .clone()
        .with_steps(with_extra_step(MigrationStep::new(4, "farm notes", add_farm_notes)));
    assert_eq!(upgraded.migrate().await.unwrap().applied, vec![4]);

    let export = upgraded.export_data().await.unwrap();
    assert_eq!(export.records(EntityKind::Farm).len(), 1);
    let row = db::get_entity(upgraded.pool(), EntityKind::Farm, &farm.local_id)
        .await
        .unwrap()
        .unwrap();
    assert!(row.last_synced_at.is_none());
}

#[tokio::test]
async fn imported_pending_records_go_out_on_the_next_pass() {
    let source = Harness::new().await;
    let f = source.client.create(EntityKind::Farm, farm("North")).await.unwrap();
    source
        .client
        .create(EntityKind::Batch, common::batch(&f.local_id))
        .await
        .unwrap();
    let export = source.client.export_data().await.unwrap();

    let target = Harness::new().await;
    target.client.import_data(&export, true).await.unwrap();
    assert_eq!(target.client.sync_status().await.pending, 2);

    target.client.trigger_sync().await.unwrap();
    assert_eq!(target.remote.calls_for(EntityKind::Farm).len(), 1);
    let batches = target.remote.calls_for(EntityKind::Batch);
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].method, "create");
    assert_eq!(batches[0].body["farmId"], "100");

    let imported = target.client.get(EntityKind::Farm, &f.local_id, false).await.unwrap();
    assert!(!imported.needs_sync);
}

#[tokio::test]
async fn restore_requeues_records_that_need_syncing() {
    let h = Harness::new().await;
    h.client.create(EntityKind::Farm, farm("North")).await.unwrap();
    let backup = h.client.create_backup().await.unwrap();

    sqlx::query("DELETE FROM sync_queue")
        .execute(h.client.pool())
        .await
        .unwrap();
    assert_eq!(h.client.sync_status().await.pending, 0);

    h.client.restore_from_backup(&backup.key).await.unwrap();
    assert_eq!(h.client.sync_status().await.pending, 1);

    h.client.trigger_sync().await.unwrap();
    assert_eq!(h.remote.calls_for(EntityKind::Farm).len(), 1);
}
