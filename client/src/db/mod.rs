//! Database module for SQLite persistence.

mod entities;
mod pool;
mod queue;
mod settings;

pub use entities::*;
pub use pool::*;
pub use queue::*;
pub use settings::*;

use farmsync_engine::Timestamp;
use sqlx::{Row, Sqlite};

/// Timestamps are stored as RFC 3339 text with millisecond precision, so
/// lexical order matches chronological order.
pub fn encode_ts(ts: Timestamp) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn decode_ts(raw: &str) -> Result<Timestamp, sqlx::Error> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&chrono::Utc))
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

pub fn decode_opt_ts(raw: Option<String>) -> Result<Option<Timestamp>, sqlx::Error> {
    raw.as_deref().map(decode_ts).transpose()
}

/// Read an optional column that older schema versions don't have yet.
pub(crate) fn try_get_optional<T>(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<Option<T>, sqlx::Error>
where
    T: for<'r> sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    match row.try_get::<Option<T>, _>(column) {
        Ok(value) => Ok(value),
        Err(sqlx::Error::ColumnNotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check whether a table exists.
pub async fn table_exists<'e, E>(executor: E, table: &str) -> Result<bool, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let found: Option<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_optional(executor)
            .await?;
    Ok(found.is_some())
}

/// Check whether a table has a column.
pub async fn table_has_column<'e, E>(
    executor: E,
    table: &str,
    column: &str,
) -> Result<bool, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
        .fetch_all(executor)
        .await?;

    for row in rows {
        let name: String = row.try_get("name")?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Check whether an index exists.
pub async fn index_exists<'e, E>(executor: E, index: &str) -> Result<bool, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let found: Option<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'index' AND name = ?")
            .bind(index)
            .fetch_optional(executor)
            .await?;
    Ok(found.is_some())
}
