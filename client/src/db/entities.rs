//! Database operations for the per-kind entity tables.

use super::{decode_opt_ts, decode_ts, encode_ts, try_get_optional};
use crate::error::ClientError;
use farmsync_engine::{EntityKind, EntityRecord, Timestamp};
use sqlx::{Row, Sqlite};

/// Columns read back into [`StoredEntity`] on the latest schema.
pub const ENTITY_COLUMNS: &str = "local_id, server_id, organization_id, data, needs_sync, \
     is_synced, is_deleted, deleted_at, created_at, updated_at, last_synced_at";

/// A stored entity row from the database.
#[derive(Debug)]
pub struct StoredEntity {
    pub local_id: String,
    pub server_id: Option<String>,
    pub organization_id: Option<String>,
    pub data: String,
    pub needs_sync: bool,
    pub is_synced: bool,
    pub is_deleted: bool,
    pub deleted_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub last_synced_at: Option<String>,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for StoredEntity {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(StoredEntity {
            local_id: row.try_get("local_id")?,
            server_id: row.try_get("server_id")?,
            organization_id: row.try_get("organization_id")?,
            data: row.try_get("data")?,
            needs_sync: row.try_get("needs_sync")?,
            is_synced: row.try_get("is_synced")?,
            is_deleted: row.try_get("is_deleted")?,
            deleted_at: row.try_get("deleted_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            last_synced_at: try_get_optional(row, "last_synced_at")?,
        })
    }
}

impl StoredEntity {
    /// Convert database row to an engine record.
    pub fn into_record(self, kind: EntityKind) -> Result<EntityRecord, ClientError> {
        Ok(EntityRecord {
            kind,
            local_id: self.local_id,
            server_id: self.server_id,
            organization_id: self.organization_id,
            needs_sync: self.needs_sync,
            is_synced: self.is_synced,
            is_deleted: self.is_deleted,
            deleted_at: decode_opt_ts(self.deleted_at)?,
            created_at: decode_ts(&self.created_at)?,
            updated_at: decode_ts(&self.updated_at)?,
            last_synced_at: decode_opt_ts(self.last_synced_at)?,
            data: serde_json::from_str(&self.data)?,
        })
    }
}

/// Insert a new entity row.
pub async fn insert_entity<'e, E>(executor: E, record: &EntityRecord) -> Result<(), ClientError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        r#"
        INSERT INTO {} (
            local_id, server_id, organization_id, data, needs_sync, is_synced,
            is_deleted, deleted_at, created_at, updated_at, last_synced_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        record.kind.table()
    );

    sqlx::query(&sql)
        .bind(&record.local_id)
        .bind(&record.server_id)
        .bind(&record.organization_id)
        .bind(serde_json::to_string(&record.data)?)
        .bind(record.needs_sync)
        .bind(record.is_synced)
        .bind(record.is_deleted)
        .bind(record.deleted_at.map(encode_ts))
        .bind(encode_ts(record.created_at))
        .bind(encode_ts(record.updated_at))
        .bind(record.last_synced_at.map(encode_ts))
        .execute(executor)
        .await?;

    Ok(())
}

/// Insert or replace a row by `local_id`.
///
/// `with_last_synced` is false while the table predates the
/// `last_synced_at` column.
pub async fn replace_entity<'e, E>(
    executor: E,
    record: &EntityRecord,
    with_last_synced: bool,
) -> Result<(), ClientError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let (extra_column, extra_param) = if with_last_synced {
        (", last_synced_at", ", ?")
    } else {
        ("", "")
    };
    let sql = format!(
        r#"
        INSERT OR REPLACE INTO {} (
            local_id, server_id, organization_id, data, needs_sync, is_synced,
            is_deleted, deleted_at, created_at, updated_at{extra_column}
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?{extra_param})
        "#,
        record.kind.table()
    );

    let mut query = sqlx::query(&sql)
        .bind(&record.local_id)
        .bind(&record.server_id)
        .bind(&record.organization_id)
        .bind(serde_json::to_string(&record.data)?)
        .bind(record.needs_sync)
        .bind(record.is_synced)
        .bind(record.is_deleted)
        .bind(record.deleted_at.map(encode_ts))
        .bind(encode_ts(record.created_at))
        .bind(encode_ts(record.updated_at));
    if with_last_synced {
        query = query.bind(record.last_synced_at.map(encode_ts));
    }
    query.execute(executor).await?;

    Ok(())
}

/// Overwrite every mutable column of an existing row.
///
/// Returns the number of rows affected.
pub async fn update_entity<'e, E>(executor: E, record: &EntityRecord) -> Result<u64, ClientError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        r#"
        UPDATE {} SET
            server_id = ?,
            organization_id = ?,
            data = ?,
            needs_sync = ?,
            is_synced = ?,
            is_deleted = ?,
            deleted_at = ?,
            updated_at = ?,
            last_synced_at = ?
        WHERE local_id = ?
        "#,
        record.kind.table()
    );

    let result = sqlx::query(&sql)
        .bind(&record.server_id)
        .bind(&record.organization_id)
        .bind(serde_json::to_string(&record.data)?)
        .bind(record.needs_sync)
        .bind(record.is_synced)
        .bind(record.is_deleted)
        .bind(record.deleted_at.map(encode_ts))
        .bind(encode_ts(record.updated_at))
        .bind(record.last_synced_at.map(encode_ts))
        .bind(&record.local_id)
        .execute(executor)
        .await?;

    Ok(result.rows_affected())
}

/// Get an entity by local id, deleted or not.
pub async fn get_entity<'e, E>(
    executor: E,
    kind: EntityKind,
    local_id: &str,
) -> Result<Option<StoredEntity>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, StoredEntity>(&format!(
        "SELECT {ENTITY_COLUMNS} FROM {} WHERE local_id = ?",
        kind.table()
    ))
    .bind(local_id)
    .fetch_optional(executor)
    .await
}

/// Get an entity by server id, optionally within one organization.
pub async fn get_entity_by_server_id<'e, E>(
    executor: E,
    kind: EntityKind,
    server_id: &str,
    organization_id: Option<&str>,
) -> Result<Option<StoredEntity>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, StoredEntity>(&format!(
        r#"
        SELECT {ENTITY_COLUMNS} FROM {} WHERE server_id = ?
          AND (? IS NULL OR organization_id = ? OR organization_id IS NULL)
        ORDER BY created_at
        LIMIT 1
        "#,
        kind.table()
    ))
    .bind(server_id)
    .bind(organization_id)
    .bind(organization_id)
    .fetch_optional(executor)
    .await
}

/// Every row of a kind, soft-deleted ones included.
///
/// Also runs against tables that predate `last_synced_at`, so the
/// statement is not cached: a cached `SELECT *` keeps the old column set
/// after a migration adds one.
pub async fn get_all_entities<'e, E>(
    executor: E,
    kind: EntityKind,
) -> Result<Vec<StoredEntity>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, StoredEntity>(&format!(
        "SELECT * FROM {} ORDER BY created_at, local_id",
        kind.table()
    ))
    .persistent(false)
    .fetch_all(executor)
    .await
}

/// Rows with unsynced local mutations.
pub async fn get_pending_entities<'e, E>(
    executor: E,
    kind: EntityKind,
) -> Result<Vec<StoredEntity>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, StoredEntity>(&format!(
        "SELECT {ENTITY_COLUMNS} FROM {} WHERE needs_sync = 1 ORDER BY created_at, local_id",
        kind.table()
    ))
    .fetch_all(executor)
    .await
}

/// Clear the sync flags after the server accepted the record.
///
/// The row is left untouched while any queue entry other than
/// `synced_entry` is still outstanding for it, so a mutation queued
/// mid-pass keeps `needs_sync` set.
pub async fn mark_entity_synced<'e, E>(
    executor: E,
    kind: EntityKind,
    local_id: &str,
    server_id: Option<&str>,
    synced_entry: Option<i64>,
    now: Timestamp,
) -> Result<u64, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(&format!(
        r#"
        UPDATE {} SET
            needs_sync = 0,
            is_synced = 1,
            last_synced_at = ?,
            server_id = COALESCE(?, server_id)
        WHERE local_id = ?
          AND NOT EXISTS (
            SELECT 1 FROM sync_queue q
            WHERE q.entity_kind = ? AND q.local_id = ?
              AND q.status IN ('pending', 'syncing', 'failed')
              AND (? IS NULL OR q.id != ?)
          )
        "#,
        kind.table()
    ))
    .bind(encode_ts(now))
    .bind(server_id)
    .bind(local_id)
    .bind(kind.as_str())
    .bind(local_id)
    .bind(synced_entry)
    .bind(synced_entry)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

/// Store the server id without touching the sync flags.
pub async fn assign_entity_server_id<'e, E>(
    executor: E,
    kind: EntityKind,
    local_id: &str,
    server_id: &str,
) -> Result<u64, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(&format!(
        "UPDATE {} SET server_id = ? WHERE local_id = ?",
        kind.table()
    ))
    .bind(server_id)
    .bind(local_id)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

/// Physically remove a row.
pub async fn delete_entity<'e, E>(
    executor: E,
    kind: EntityKind,
    local_id: &str,
) -> Result<u64, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(&format!("DELETE FROM {} WHERE local_id = ?", kind.table()))
        .bind(local_id)
        .execute(executor)
        .await?;

    Ok(result.rows_affected())
}

/// Remove every row of a kind.
pub async fn clear_entities<'e, E>(executor: E, kind: EntityKind) -> Result<u64, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(&format!("DELETE FROM {}", kind.table()))
        .execute(executor)
        .await?;

    Ok(result.rows_affected())
}
