//! Database operations for the sync_queue table.

use super::{decode_opt_ts, decode_ts, encode_ts, try_get_optional};
use crate::error::ClientError;
use farmsync_engine::{FailureKind, NewQueueEntry, QueueEntry, Timestamp};
use sqlx::{Row, Sqlite};

/// Columns read back into [`StoredQueueEntry`] on the latest schema.
pub const QUEUE_COLUMNS: &str = "id, entity_kind, operation, local_id, server_id, payload, \
     status, retry_count, error_message, failure_kind, next_attempt_at, created_at, updated_at";

/// A stored queue row from the database.
#[derive(Debug)]
pub struct StoredQueueEntry {
    pub id: i64,
    pub entity_kind: String,
    pub operation: String,
    pub local_id: String,
    pub server_id: Option<String>,
    pub payload: String,
    pub status: String,
    pub retry_count: i64,
    pub error_message: Option<String>,
    pub failure_kind: Option<String>,
    pub next_attempt_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for StoredQueueEntry {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(StoredQueueEntry {
            id: row.try_get("id")?,
            entity_kind: row.try_get("entity_kind")?,
            operation: row.try_get("operation")?,
            local_id: row.try_get("local_id")?,
            server_id: row.try_get("server_id")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            retry_count: row.try_get("retry_count")?,
            error_message: row.try_get("error_message")?,
            failure_kind: row.try_get("failure_kind")?,
            next_attempt_at: try_get_optional(row, "next_attempt_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl StoredQueueEntry {
    /// Convert database row to an engine queue entry.
    pub fn into_entry(self) -> Result<QueueEntry, ClientError> {
        Ok(QueueEntry {
            id: self.id,
            entity_kind: self.entity_kind.parse()?,
            operation: self.operation.parse()?,
            local_id: self.local_id,
            server_id: self.server_id,
            payload: serde_json::from_str(&self.payload)?,
            status: self.status.parse()?,
            retry_count: u32::try_from(self.retry_count).unwrap_or(u32::MAX),
            error_message: self.error_message,
            failure_kind: self
                .failure_kind
                .as_deref()
                .map(|s| s.parse::<FailureKind>())
                .transpose()?,
            next_attempt_at: decode_opt_ts(self.next_attempt_at)?,
            created_at: decode_ts(&self.created_at)?,
            updated_at: decode_ts(&self.updated_at)?,
        })
    }
}

/// Append an entry with status `pending`.
///
/// Returns the new entry id.
pub async fn insert_queue_entry<'e, E>(
    executor: E,
    entry: &NewQueueEntry,
    now: Timestamp,
) -> Result<i64, ClientError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO sync_queue (
            entity_kind, operation, local_id, server_id, payload,
            status, retry_count, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, 'pending', 0, ?, ?)
        "#,
    )
    .bind(entry.entity_kind.as_str())
    .bind(entry.operation.as_str())
    .bind(&entry.local_id)
    .bind(&entry.server_id)
    .bind(serde_json::to_string(&entry.payload)?)
    .bind(encode_ts(now))
    .bind(encode_ts(now))
    .execute(executor)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Get a queue entry by id.
pub async fn get_queue_entry<'e, E>(
    executor: E,
    id: i64,
) -> Result<Option<StoredQueueEntry>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, StoredQueueEntry>(&format!(
        "SELECT {QUEUE_COLUMNS} FROM sync_queue WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(executor)
    .await
}
