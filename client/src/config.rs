//! Configuration management for the client.

use crate::driver::DriverSettings;
use crate::migration::MigrationSettings;
use farmsync_engine::BackoffPolicy;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Client configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL
    pub database_url: String,
    /// Base URL of the remote API
    pub api_base_url: String,
    /// Bearer token for the remote API
    pub api_token: Option<String>,
    /// Bound on every remote call
    pub request_timeout: Duration,
    /// Wait after coming online before syncing
    pub sync_debounce: Duration,
    /// Periodic sync interval; `None` disables the timer
    pub sync_interval: Option<Duration>,
    /// Retry ceiling for queue entries
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// How long synced queue entries are kept
    pub retention_days: u32,
    /// How long parked failed entries are kept
    pub failed_max_age_days: u32,
    /// Entries left `syncing` longer than this are considered interrupted
    pub stuck_grace: Duration,
    pub migration_timeout: Duration,
    /// Pre-migration backups are removed after this long
    pub backup_grace: Duration,
    /// Attempts for opening storage and migrating at boot
    pub boot_retries: u32,
    /// JSON export imported once on first boot
    pub legacy_import_path: Option<PathBuf>,
    /// Initial session organization
    pub organization_id: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://farmsync.db".to_string(),
            api_base_url: "http://localhost:3000/api".to_string(),
            api_token: None,
            request_timeout: Duration::from_secs(30),
            sync_debounce: Duration::from_millis(2000),
            sync_interval: None,
            max_retries: 5,
            backoff_base: Duration::from_millis(2000),
            backoff_max: Duration::from_secs(300),
            retention_days: 7,
            failed_max_age_days: 30,
            stuck_grace: Duration::from_secs(300),
            migration_timeout: Duration::from_secs(60),
            backup_grace: Duration::from_secs(24 * 60 * 60),
            boot_retries: 3,
            legacy_import_path: None,
            organization_id: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let sync_interval_secs: u64 = parse_or(&var, "FARMSYNC_SYNC_INTERVAL_SECS", 0)?;

        Ok(Self {
            database_url: var("FARMSYNC_DATABASE_URL").unwrap_or(defaults.database_url),
            api_base_url: var("FARMSYNC_API_BASE_URL").unwrap_or(defaults.api_base_url),
            api_token: var("FARMSYNC_API_TOKEN"),
            request_timeout: Duration::from_secs(parse_or(
                &var,
                "FARMSYNC_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )?),
            sync_debounce: Duration::from_millis(parse_or(
                &var,
                "FARMSYNC_SYNC_DEBOUNCE_MS",
                defaults.sync_debounce.as_millis() as u64,
            )?),
            sync_interval: (sync_interval_secs > 0)
                .then(|| Duration::from_secs(sync_interval_secs)),
            max_retries: parse_or(&var, "FARMSYNC_MAX_RETRIES", defaults.max_retries)?,
            backoff_base: Duration::from_millis(parse_or(
                &var,
                "FARMSYNC_BACKOFF_BASE_MS",
                defaults.backoff_base.as_millis() as u64,
            )?),
            backoff_max: Duration::from_millis(parse_or(
                &var,
                "FARMSYNC_BACKOFF_MAX_MS",
                defaults.backoff_max.as_millis() as u64,
            )?),
            retention_days: parse_or(&var, "FARMSYNC_RETENTION_DAYS", defaults.retention_days)?,
            failed_max_age_days: parse_or(
                &var,
                "FARMSYNC_FAILED_MAX_AGE_DAYS",
                defaults.failed_max_age_days,
            )?,
            stuck_grace: Duration::from_secs(parse_or(
                &var,
                "FARMSYNC_STUCK_GRACE_SECS",
                defaults.stuck_grace.as_secs(),
            )?),
            migration_timeout: Duration::from_secs(parse_or(
                &var,
                "FARMSYNC_MIGRATION_TIMEOUT_SECS",
                defaults.migration_timeout.as_secs(),
            )?),
            backup_grace: Duration::from_secs(parse_or(
                &var,
                "FARMSYNC_BACKUP_GRACE_SECS",
                defaults.backup_grace.as_secs(),
            )?),
            boot_retries: parse_or(&var, "FARMSYNC_BOOT_RETRIES", defaults.boot_retries)?,
            legacy_import_path: var("FARMSYNC_LEGACY_IMPORT_PATH").map(PathBuf::from),
            organization_id: var("FARMSYNC_ORGANIZATION_ID"),
        })
    }

    /// Backoff schedule for queue entries.
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.max_retries, self.backoff_base, self.backoff_max).with_jitter(0.2)
    }

    /// Backoff schedule for opening storage and migrating at boot.
    pub fn boot_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.boot_retries.max(1), self.backoff_base, self.backoff_max)
    }

    pub fn driver_settings(&self) -> DriverSettings {
        DriverSettings {
            request_timeout: self.request_timeout,
            backoff: self.backoff_policy(),
            retention: chrono::Duration::days(i64::from(self.retention_days)),
            failed_max_age: chrono::Duration::days(i64::from(self.failed_max_age_days)),
            stuck_grace: chrono::Duration::from_std(self.stuck_grace)
                .unwrap_or_else(|_| chrono::Duration::minutes(5)),
            debounce: self.sync_debounce,
            batch_limit: None,
        }
    }

    pub fn migration_settings(&self) -> MigrationSettings {
        MigrationSettings {
            step_timeout: self.migration_timeout,
            backup_grace: self.backup_grace,
            retention_days: self.retention_days,
            max_retries: self.max_retries,
        }
    }
}

fn parse_or<T, F>(var: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            name,
            value: raw,
        }),
        None => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
}
