//! Key-value settings table.

use super::encode_ts;
use farmsync_engine::Timestamp;
use sqlx::Sqlite;

/// Well-known settings keys.
pub mod keys {
    pub const SCHEMA_VERSION: &str = "schema_version";
    pub const INITIAL_SETUP_COMPLETED: &str = "initial_setup_completed";
    pub const INITIAL_SYNC_COMPLETED: &str = "initial_sync_completed";
    pub const LEGACY_IMPORT_COMPLETED: &str = "legacy_import_completed";
    pub const RETENTION_DAYS: &str = "sync.retention_days";
    pub const MAX_RETRIES: &str = "sync.max_retries";
    pub const CURRENT_ORGANIZATION_ID: &str = "current_organization_id";
}

/// Create the settings table if missing.
pub async fn ensure_settings_table<'e, E>(executor: E) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY NOT NULL,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(executor)
    .await?;
    Ok(())
}

/// Get a setting value.
pub async fn get_setting<'e, E>(executor: E, key: &str) -> Result<Option<String>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(executor)
        .await
}

/// Boolean flags are stored as `"true"` / `"false"`.
pub async fn get_flag<'e, E>(executor: E, key: &str) -> Result<bool, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    Ok(get_setting(executor, key).await?.as_deref() == Some("true"))
}

/// Insert or replace a setting.
pub async fn set_setting<'e, E>(
    executor: E,
    key: &str,
    value: &str,
    now: Timestamp,
) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO settings (key, value, updated_at)
        VALUES (?, ?, ?)
        ON CONFLICT (key) DO UPDATE SET
            value = excluded.value,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(key)
    .bind(value)
    .bind(encode_ts(now))
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn delete_setting<'e, E>(executor: E, key: &str) -> Result<u64, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query("DELETE FROM settings WHERE key = ?")
        .bind(key)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

/// All settings, sorted by key.
pub async fn all_settings<'e, E>(executor: E) -> Result<Vec<(String, String)>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query_as("SELECT key, value FROM settings ORDER BY key")
        .fetch_all(executor)
        .await
}
