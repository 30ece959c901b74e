//! Durable, ordered log of pending mutations.
//!
//! The queue records intent independently of the current entity state: an
//! entry keeps its full record snapshot even if the record is later edited
//! or removed. Status changes go through the engine's state machine, so an
//! illegal transition leaves the row untouched.

use crate::db::{self, encode_ts, Pool, StoredQueueEntry, QUEUE_COLUMNS};
use crate::error::{ClientError, Result};
use farmsync_engine::{
    Clock, EntityKind, FailureKind, NewQueueEntry, QueueEntry, QueueStatus, SyncFailure, Timestamp,
};
use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Age/status predicate for [`SyncQueue::purge`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeFilter {
    pub status: Option<QueueStatus>,
    pub kind: Option<EntityKind>,
    /// Only entries last touched before this time
    pub older_than: Option<Timestamp>,
    /// Only entries with at least this many counted failures
    pub min_retry_count: Option<u32>,
}

impl PurgeFilter {
    /// Synced entries past the retention window.
    pub fn synced_before(cutoff: Timestamp) -> Self {
        Self {
            status: Some(QueueStatus::Synced),
            older_than: Some(cutoff),
            ..Self::default()
        }
    }

    /// Failed entries parked at the retry ceiling and older than `cutoff`.
    pub fn parked_before(max_retries: u32, cutoff: Timestamp) -> Self {
        Self {
            status: Some(QueueStatus::Failed),
            older_than: Some(cutoff),
            min_retry_count: Some(max_retries),
            ..Self::default()
        }
    }
}

/// Entry counts per status for one kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounts {
    pub pending: u64,
    pub syncing: u64,
    pub synced: u64,
    pub failed: u64,
}

/// The sync queue service.
#[derive(Debug, Clone)]
pub struct SyncQueue {
    pool: Pool,
    clock: Arc<dyn Clock>,
}

impl SyncQueue {
    pub fn new(pool: Pool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Append an entry with status `pending`.
    pub async fn enqueue(&self, entry: NewQueueEntry) -> Result<i64> {
        let id = db::insert_queue_entry(&self.pool, &entry, self.clock.now()).await?;
        tracing::debug!(
            entry_id = id,
            kind = %entry.entity_kind,
            operation = %entry.operation,
            local_id = %entry.local_id,
            "Enqueued sync entry"
        );
        Ok(id)
    }

    pub async fn get(&self, id: i64) -> Result<Option<QueueEntry>> {
        db::get_queue_entry(&self.pool, id)
            .await?
            .map(StoredQueueEntry::into_entry)
            .transpose()
    }

    /// Entries with `status`, oldest first.
    pub async fn dequeue_batch(
        &self,
        status: QueueStatus,
        kind: Option<EntityKind>,
        limit: Option<u32>,
    ) -> Result<Vec<QueueEntry>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {QUEUE_COLUMNS} FROM sync_queue WHERE status = "));
        qb.push_bind(status.as_str());
        if let Some(kind) = kind {
            qb.push(" AND entity_kind = ").push_bind(kind.as_str());
        }
        qb.push(" ORDER BY id ASC");
        if let Some(limit) = limit {
            qb.push(" LIMIT ").push_bind(i64::from(limit));
        }

        qb.build_query_as::<StoredQueueEntry>()
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(StoredQueueEntry::into_entry)
            .collect()
    }

    /// Move an entry to `status`.
    ///
    /// Entering `failed` records `failure` (a transient failure with no
    /// message if none is given) and bumps `retry_count` unless the failure
    /// kind doesn't count toward the ceiling. Entering `synced` clears the
    /// failure fields.
    pub async fn mark_status(
        &self,
        id: i64,
        status: QueueStatus,
        failure: Option<SyncFailure>,
    ) -> Result<QueueEntry> {
        let current = self
            .get(id)
            .await?
            .ok_or(ClientError::QueueEntryNotFound(id))?;
        current.status.transition(status)?;

        let now = encode_ts(self.clock.now());
        let result = match status {
            QueueStatus::Failed => {
                let failure =
                    failure.unwrap_or_else(|| SyncFailure::new(FailureKind::Transient, "unknown error"));
                let increment = i64::from(failure.kind.counts_toward_retry());
                sqlx::query(
                    r#"
                    UPDATE sync_queue SET
                        status = 'failed',
                        retry_count = retry_count + ?,
                        error_message = ?,
                        failure_kind = ?,
                        next_attempt_at = ?,
                        updated_at = ?
                    WHERE id = ? AND status = ?
                    "#,
                )
                .bind(increment)
                .bind(&failure.message)
                .bind(failure.kind.as_str())
                .bind(failure.next_attempt_at.map(encode_ts))
                .bind(&now)
                .bind(id)
                .bind(current.status.as_str())
                .execute(&self.pool)
                .await?
            }
            QueueStatus::Synced => {
                sqlx::query(
                    r#"
                    UPDATE sync_queue SET
                        status = 'synced',
                        error_message = NULL,
                        failure_kind = NULL,
                        next_attempt_at = NULL,
                        updated_at = ?
                    WHERE id = ? AND status = ?
                    "#,
                )
                .bind(&now)
                .bind(id)
                .bind(current.status.as_str())
                .execute(&self.pool)
                .await?
            }
            QueueStatus::Pending | QueueStatus::Syncing => {
                sqlx::query(
                    "UPDATE sync_queue SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
                )
                .bind(status.as_str())
                .bind(&now)
                .bind(id)
                .bind(current.status.as_str())
                .execute(&self.pool)
                .await?
            }
        };

        if result.rows_affected() == 0 {
            // Someone else moved it between the read and the write
            let latest = self
                .get(id)
                .await?
                .ok_or(ClientError::QueueEntryNotFound(id))?;
            return Err(farmsync_engine::Error::InvalidTransition {
                from: latest.status,
                to: status,
            }
            .into());
        }

        self.get(id).await?.ok_or(ClientError::QueueEntryNotFound(id))
    }

    /// Remove entries matching `filter`.
    pub async fn purge(&self, filter: &PurgeFilter) -> Result<u64> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("DELETE FROM sync_queue WHERE 1 = 1");
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(kind) = filter.kind {
            qb.push(" AND entity_kind = ").push_bind(kind.as_str());
        }
        if let Some(cutoff) = filter.older_than {
            qb.push(" AND updated_at < ").push_bind(encode_ts(cutoff));
        }
        if let Some(min) = filter.min_retry_count {
            qb.push(" AND retry_count >= ").push_bind(i64::from(min));
        }

        let purged = qb.build().execute(&self.pool).await?.rows_affected();
        if purged > 0 {
            tracing::info!(purged, ?filter, "Purged sync queue entries");
        }
        Ok(purged)
    }

    /// Scheduled retry: move due, non-rejected failures back to `pending`.
    pub async fn requeue_due(&self, now: Timestamp, max_retries: u32) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sync_queue SET status = 'pending', updated_at = ?
            WHERE status = 'failed'
              AND (failure_kind IS NULL OR failure_kind != 'rejected')
              AND (next_attempt_at IS NULL OR next_attempt_at <= ?)
              AND retry_count < ?
            "#,
        )
        .bind(encode_ts(now))
        .bind(encode_ts(now))
        .bind(i64::from(max_retries))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Manual retry of failed entries below the ceiling, rejected ones
    /// included. `ids` narrows the retry to specific entries.
    pub async fn retry_failed(&self, ids: Option<&[i64]>, max_retries: u32) -> Result<u64> {
        if ids.is_some_and(|ids| ids.is_empty()) {
            return Ok(0);
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "UPDATE sync_queue SET status = 'pending', next_attempt_at = NULL, updated_at = ",
        );
        qb.push_bind(encode_ts(self.clock.now()));
        qb.push(" WHERE status = 'failed' AND retry_count < ");
        qb.push_bind(i64::from(max_retries));
        if let Some(ids) = ids {
            qb.push(" AND id IN (");
            let mut separated = qb.separated(", ");
            for id in ids {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
        }

        let retried = qb.build().execute(&self.pool).await?.rows_affected();
        tracing::info!(retried, "Manual retry of failed sync entries");
        Ok(retried)
    }

    /// Remove entries parked at the retry ceiling.
    pub async fn clear_failed(&self, max_retries: u32) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sync_queue WHERE status = 'failed' AND retry_count >= ?")
            .bind(i64::from(max_retries))
            .execute(&self.pool)
            .await?;

        let cleared = result.rows_affected();
        tracing::info!(cleared, "Cleared parked sync entries");
        Ok(cleared)
    }

    /// Fail entries left `syncing` since before `older_than`.
    ///
    /// A pass that died mid-entry leaves its entry `syncing`; those are
    /// marked `failed` as interrupted and become due immediately.
    pub async fn reset_stuck(&self, older_than: Timestamp) -> Result<u64> {
        let now = encode_ts(self.clock.now());
        let result = sqlx::query(
            r#"
            UPDATE sync_queue SET
                status = 'failed',
                retry_count = retry_count + 1,
                error_message = 'interrupted',
                failure_kind = 'interrupted',
                next_attempt_at = ?,
                updated_at = ?
            WHERE status = 'syncing' AND updated_at < ?
            "#,
        )
        .bind(&now)
        .bind(&now)
        .bind(encode_ts(older_than))
        .execute(&self.pool)
        .await?;

        let reset = result.rows_affected();
        if reset > 0 {
            tracing::warn!(reset, "Reset interrupted sync entries");
        }
        Ok(reset)
    }

    /// Whether the record has entries still on their way to the server.
    pub async fn has_outstanding(
        &self,
        kind: EntityKind,
        local_id: &str,
        except_id: Option<i64>,
    ) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM sync_queue
            WHERE entity_kind = ? AND local_id = ?
              AND status IN ('pending', 'syncing', 'failed')
              AND (? IS NULL OR id != ?)
            LIMIT 1
            "#,
        )
        .bind(kind.as_str())
        .bind(local_id)
        .bind(except_id)
        .bind(except_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(found.is_some())
    }

    /// Entry counts per kind and status.
    pub async fn counts(&self) -> Result<BTreeMap<EntityKind, QueueCounts>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT entity_kind, status, COUNT(*) FROM sync_queue GROUP BY entity_kind, status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts: BTreeMap<EntityKind, QueueCounts> = BTreeMap::new();
        for (kind, status, count) in rows {
            let kind: EntityKind = kind.parse()?;
            let status: QueueStatus = status.parse()?;
            let entry = counts.entry(kind).or_default();
            let count = u64::try_from(count).unwrap_or(0);
            match status {
                QueueStatus::Pending => entry.pending = count,
                QueueStatus::Syncing => entry.syncing = count,
                QueueStatus::Synced => entry.synced = count,
                QueueStatus::Failed => entry.failed = count,
            }
        }
        Ok(counts)
    }
}
