//! The sync driver: drains the queue against the server.
//!
//! One pass walks the kinds parents-first and sends each pending entry in
//! FIFO order. Foreign keys are swapped for server ids right before the
//! send, so a child queued offline goes out with its parent's real id.
//! Failures are recorded per entry and never abort the pass.
//!
//! Passes come from three places (an explicit trigger, the connectivity
//! listener, an optional timer) and all go through the same guard, so at
//! most one runs at a time.

use crate::connectivity::ConnectivityProvider;
use crate::error::{ClientError, Result};
use crate::events::{EventHub, SyncEvent};
use crate::queue::{PurgeFilter, SyncQueue};
use crate::remote::{RemoteAck, RemoteApi, RemoteError};
use crate::store::{ApplyOutcome, LocalStore};
use farmsync_engine::{
    foreign_key_values, from_wire, resolve_foreign_keys, to_wire, BackoffPolicy, Clock,
    EntityKind, FailureKind, Operation, ParentLookup, QueueEntry, QueueStatus, Resolution,
    ServerId, SyncFailure, SyncSummary, Timestamp,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Tunables for the sync driver.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// Bound on each remote call
    pub request_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// Synced entries older than this are purged after a pass
    pub retention: chrono::Duration,
    /// Parked entries older than this are purged after a pass
    pub failed_max_age: chrono::Duration,
    /// Entries `syncing` for longer than this are considered interrupted
    pub stuck_grace: chrono::Duration,
    /// Wait after coming online before starting a pass
    pub debounce: Duration,
    /// Cap on entries per kind per pass
    pub batch_limit: Option<u32>,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
            retention: chrono::Duration::days(7),
            failed_max_age: chrono::Duration::days(30),
            stuck_grace: chrono::Duration::minutes(5),
            debounce: Duration::from_millis(2000),
            batch_limit: None,
        }
    }
}

/// Result of asking for a pass.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Completed(SyncSummary),
    /// Another pass holds the guard; nothing was touched
    AlreadyInProgress,
    Offline,
}

impl SyncOutcome {
    pub fn summary(&self) -> Option<&SyncSummary> {
        match self {
            SyncOutcome::Completed(summary) => Some(summary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HousekeepingReport {
    pub reset_stuck: u64,
    pub requeued: u64,
    pub purged_synced: u64,
    pub purged_parked: u64,
}

/// What a read-through refresh did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshReport {
    pub kind: EntityKind,
    pub fetched: usize,
    pub inserted: usize,
    pub overwritten: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Why the refresh didn't reach the server, if it didn't
    pub error: Option<String>,
}

impl RefreshReport {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            fetched: 0,
            inserted: 0,
            overwritten: 0,
            skipped: 0,
            failed: 0,
            error: None,
        }
    }
}

enum EntryResult {
    Synced(Option<ServerId>),
    Failed(SyncFailure),
}

/// How an entry reaches the server.
enum Dispatch {
    Create,
    Update(ServerId),
    Delete(ServerId),
    /// Deleting a record the server never saw
    LocalOnly,
}

/// The sync driver.
pub struct SyncDriver {
    store: LocalStore,
    queue: SyncQueue,
    remote: Arc<dyn RemoteApi>,
    connectivity: Arc<dyn ConnectivityProvider>,
    events: Arc<EventHub>,
    clock: Arc<dyn Clock>,
    settings: DriverSettings,
    pass_guard: Mutex<()>,
    cancel_requested: AtomicBool,
}

impl fmt::Debug for SyncDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncDriver")
            .field("remote", &self.remote)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SyncDriver {
    pub fn new(
        store: LocalStore,
        queue: SyncQueue,
        remote: Arc<dyn RemoteApi>,
        connectivity: Arc<dyn ConnectivityProvider>,
        events: Arc<EventHub>,
        clock: Arc<dyn Clock>,
        settings: DriverSettings,
    ) -> Self {
        Self {
            store,
            queue,
            remote,
            connectivity,
            events,
            clock,
            settings,
            pass_guard: Mutex::new(()),
            cancel_requested: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    fn max_retries(&self) -> u32 {
        self.settings.backoff.max_attempts
    }

    /// Whether a pass currently holds the guard.
    pub fn is_running(&self) -> bool {
        self.pass_guard.try_lock().is_err()
    }

    /// Ask the running pass to stop after its current entry.
    pub fn cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    fn should_stop(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst) || !self.connectivity.current().is_online()
    }

    /// Run one pass over the queue.
    pub async fn run_pass(&self) -> Result<SyncOutcome> {
        let Ok(_guard) = self.pass_guard.try_lock() else {
            tracing::debug!("Sync pass already in progress");
            return Ok(SyncOutcome::AlreadyInProgress);
        };
        if self.store.session().is_read_only() {
            return Err(ClientError::ReadOnly);
        }
        if !self.connectivity.current().is_online() {
            tracing::debug!("Offline; skipping sync pass");
            return Ok(SyncOutcome::Offline);
        }
        self.cancel_requested.store(false, Ordering::SeqCst);

        let started_at = self.clock.now();
        let mut summary = SyncSummary::new(started_at);
        summary.reset_stuck = self
            .queue
            .reset_stuck(started_at - self.settings.stuck_grace)
            .await?;
        summary.requeued = self
            .queue
            .requeue_due(started_at, self.max_retries())
            .await?;

        self.events.publish(SyncEvent::PassStarted);
        tracing::info!(
            reset_stuck = summary.reset_stuck,
            requeued = summary.requeued,
            "Sync pass started"
        );

        'kinds: for kind in EntityKind::in_dependency_order() {
            let entries = self
                .queue
                .dequeue_batch(QueueStatus::Pending, Some(kind), self.settings.batch_limit)
                .await?;

            for entry in entries {
                if self.should_stop() {
                    summary.cancelled = true;
                    break 'kinds;
                }

                let result = match self.process_entry(&entry).await {
                    Ok(result) => result,
                    Err(e) => self.fail_after_error(&entry, e).await,
                };

                match result {
                    EntryResult::Synced(server_id) => {
                        summary.record_success(kind);
                        self.events.publish(SyncEvent::EntrySynced {
                            kind,
                            entry_id: entry.id,
                            local_id: entry.local_id.clone(),
                            server_id,
                        });
                    }
                    EntryResult::Failed(failure) => {
                        summary.record_failure(kind);
                        self.events.publish(SyncEvent::EntryFailed {
                            kind,
                            entry_id: entry.id,
                            local_id: entry.local_id.clone(),
                            failure: failure.kind,
                            message: failure.message,
                        });
                    }
                }
            }
        }

        if !summary.cancelled {
            if let Err(e) = self.purge_expired(self.clock.now()).await {
                tracing::warn!(error = %e, "Queue purge after sync pass failed");
            }
        }

        summary.finish(self.clock.now());
        let totals = summary.totals();
        tracing::info!(
            attempted = totals.attempted,
            succeeded = totals.succeeded,
            failed = totals.failed,
            cancelled = summary.cancelled,
            "Sync pass completed"
        );
        self.events.publish(SyncEvent::PassCompleted {
            summary: summary.clone(),
        });

        Ok(SyncOutcome::Completed(summary))
    }

    /// Send one entry and record the outcome on the queue and the store.
    async fn process_entry(&self, entry: &QueueEntry) -> Result<EntryResult> {
        let kind = entry.entity_kind;
        let now = self.clock.now();

        let record = match entry.record_snapshot() {
            Ok(record) => record,
            Err(e) => {
                return self
                    .fail(entry, SyncFailure::new(FailureKind::Rejected, e.to_string()))
                    .await
            }
        };

        // The record's own server id may have arrived after this entry was queued
        let own_server_id = self
            .store
            .find(kind, &entry.local_id)
            .await?
            .and_then(|current| current.server_id)
            .or_else(|| entry.server_id.clone());

        let dispatch = match (entry.operation, own_server_id.clone()) {
            (Operation::Create, None) => Dispatch::Create,
            (Operation::Create | Operation::Update, Some(server_id)) => Dispatch::Update(server_id),
            (Operation::Update, None) => {
                return self
                    .fail(entry, SyncFailure::unresolved_dependency(now))
                    .await
            }
            (Operation::Delete, Some(server_id)) => Dispatch::Delete(server_id),
            (Operation::Delete, None) => {
                if self
                    .queue
                    .has_outstanding(kind, &entry.local_id, Some(entry.id))
                    .await?
                {
                    return self
                        .fail(entry, SyncFailure::unresolved_dependency(now))
                        .await;
                }
                Dispatch::LocalOnly
            }
        };

        let body = match dispatch {
            Dispatch::Create | Dispatch::Update(_) => {
                match self.resolve(kind, &record.data).await? {
                    Resolution::Resolved(resolved) => {
                        Some(to_wire(&record, &resolved, own_server_id.as_deref()))
                    }
                    Resolution::Unresolved {
                        field, reference, ..
                    } => {
                        tracing::debug!(
                            kind = %kind,
                            local_id = %entry.local_id,
                            field,
                            reference = %reference,
                            "Parent not synced yet"
                        );
                        return self
                            .fail(entry, SyncFailure::unresolved_dependency(now))
                            .await;
                    }
                    Resolution::MissingParent {
                        field,
                        parent,
                        reference,
                    } => {
                        let message = format!("missing parent {parent} {reference} for {field}");
                        return self
                            .fail(entry, SyncFailure::new(FailureKind::Rejected, message))
                            .await;
                    }
                }
            }
            Dispatch::Delete(_) | Dispatch::LocalOnly => None,
        };

        self.queue
            .mark_status(entry.id, QueueStatus::Syncing, None)
            .await?;

        let outcome = match dispatch {
            Dispatch::LocalOnly => Ok(RemoteAck { server_id: None }),
            dispatch => self.send(kind, dispatch, body).await,
        };

        match outcome {
            Ok(ack) => {
                if entry.operation == Operation::Create
                    && own_server_id.is_none()
                    && ack.server_id.is_none()
                {
                    let failure = SyncFailure::new(
                        FailureKind::Rejected,
                        RemoteError::InvalidResponse("create response carried no id".into())
                            .to_string(),
                    );
                    return self.fail(entry, failure).await;
                }

                let server_id = ack.server_id.or(own_server_id);
                let cleared = self
                    .store
                    .mark_synced(kind, &entry.local_id, server_id.as_deref(), Some(entry.id))
                    .await?;

                // Later mutations are still queued; keep needs_sync but remember the id
                if cleared == 0 {
                    if let Some(server_id) = &server_id {
                        self.store
                            .assign_server_id(kind, &entry.local_id, server_id)
                            .await?;
                    }
                }

                self.queue
                    .mark_status(entry.id, QueueStatus::Synced, None)
                    .await?;
                tracing::debug!(
                    kind = %kind,
                    entry_id = entry.id,
                    local_id = %entry.local_id,
                    server_id = ?server_id,
                    "Entry synced"
                );
                Ok(EntryResult::Synced(server_id))
            }
            Err(e) => {
                let failure = self.failure_for(entry, &e, now);
                self.fail(entry, failure).await
            }
        }
    }

    async fn send(
        &self,
        kind: EntityKind,
        dispatch: Dispatch,
        body: Option<Value>,
    ) -> std::result::Result<RemoteAck, RemoteError> {
        let body = body.unwrap_or(Value::Null);
        let call = async {
            match dispatch {
                Dispatch::Create => self.remote.create(kind, body).await,
                Dispatch::Update(server_id) => self.remote.update(kind, &server_id, body).await,
                Dispatch::Delete(server_id) => self
                    .remote
                    .delete(kind, &server_id)
                    .await
                    .map(|()| RemoteAck {
                        server_id: Some(server_id),
                    }),
                Dispatch::LocalOnly => Ok(RemoteAck::default()),
            }
        };

        match tokio::time::timeout(self.settings.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout(self.settings.request_timeout)),
        }
    }

    /// Look up every parent, then let the engine decide.
    async fn resolve(&self, kind: EntityKind, data: &Value) -> Result<Resolution> {
        let mut lookups: HashMap<(EntityKind, String), ParentLookup> = HashMap::new();
        for (fk, value) in foreign_key_values(kind, data) {
            let Some(reference) = value else { continue };
            let lookup = self.store.lookup_parent(fk.references, &reference).await?;
            lookups.insert((fk.references, reference), lookup);
        }

        Ok(resolve_foreign_keys(kind, data, |parent, reference| {
            lookups
                .get(&(parent, reference.to_string()))
                .cloned()
                .unwrap_or(ParentLookup::Missing)
        }))
    }

    fn failure_for(&self, entry: &QueueEntry, error: &RemoteError, now: Timestamp) -> SyncFailure {
        match error {
            RemoteError::Transient(_) | RemoteError::Timeout(_) => {
                let attempt = entry.retry_count + 1;
                let delay = self.settings.backoff.delay_for(attempt, rand::random::<f64>());
                let delay = chrono::Duration::from_std(delay)
                    .unwrap_or_else(|_| chrono::Duration::seconds(1));
                SyncFailure::new(FailureKind::Transient, error.to_string()).retry_at(now + delay)
            }
            RemoteError::Rejected { .. }
            | RemoteError::InvalidResponse(_)
            | RemoteError::Configuration(_) => {
                SyncFailure::new(FailureKind::Rejected, error.to_string())
            }
        }
    }

    async fn fail(&self, entry: &QueueEntry, failure: SyncFailure) -> Result<EntryResult> {
        tracing::warn!(
            kind = %entry.entity_kind,
            entry_id = entry.id,
            local_id = %entry.local_id,
            operation = %entry.operation,
            failure = %failure.kind,
            error = %failure.message,
            "Sync entry failed"
        );
        self.queue
            .mark_status(entry.id, QueueStatus::Failed, Some(failure.clone()))
            .await?;
        Ok(EntryResult::Failed(failure))
    }

    /// A storage error mid-entry: park the entry as transient if possible.
    async fn fail_after_error(&self, entry: &QueueEntry, error: ClientError) -> EntryResult {
        tracing::error!(
            kind = %entry.entity_kind,
            entry_id = entry.id,
            local_id = %entry.local_id,
            error = %error,
            "Error while processing sync entry"
        );
        let failure = SyncFailure::new(FailureKind::Transient, error.to_string())
            .retry_at(self.clock.now());
        if let Err(e) = self
            .queue
            .mark_status(entry.id, QueueStatus::Failed, Some(failure.clone()))
            .await
        {
            tracing::warn!(entry_id = entry.id, error = %e, "Could not mark entry failed");
        }
        EntryResult::Failed(failure)
    }

    async fn purge_expired(&self, now: Timestamp) -> Result<(u64, u64)> {
        let synced = self
            .queue
            .purge(&PurgeFilter::synced_before(now - self.settings.retention))
            .await?;
        let parked = self
            .queue
            .purge(&PurgeFilter::parked_before(
                self.max_retries(),
                now - self.settings.failed_max_age,
            ))
            .await?;
        Ok((synced, parked))
    }

    /// Queue maintenance without sending anything.
    pub async fn housekeeping(&self) -> Result<HousekeepingReport> {
        let now = self.clock.now();
        let reset_stuck = self
            .queue
            .reset_stuck(now - self.settings.stuck_grace)
            .await?;
        let requeued = self.queue.requeue_due(now, self.max_retries()).await?;
        let (purged_synced, purged_parked) = self.purge_expired(now).await?;

        let report = HousekeepingReport {
            reset_stuck,
            requeued,
            purged_synced,
            purged_parked,
        };
        tracing::info!(?report, "Housekeeping completed");
        Ok(report)
    }

    /// Pull one kind from the server into the local store.
    ///
    /// Never fails; problems are reported in the returned report and local
    /// data stays as it was.
    pub async fn refresh(&self, kind: EntityKind) -> RefreshReport {
        let mut report = RefreshReport::new(kind);

        if !self.connectivity.current().is_online() {
            report.error = Some("offline".into());
            return report;
        }

        let organization = if kind.requires_tenant() {
            self.store.session().organization_id()
        } else {
            None
        };

        let listed = tokio::time::timeout(
            self.settings.request_timeout,
            self.remote.list(kind, organization.as_deref()),
        )
        .await
        .unwrap_or(Err(RemoteError::Timeout(self.settings.request_timeout)));

        let items = match listed {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(kind = %kind, error = %e, "Refresh failed; keeping local data");
                report.error = Some(e.to_string());
                return report;
            }
        };

        report.fetched = items.len();
        for item in &items {
            let wire = match from_wire(kind, item) {
                Ok(wire) => wire,
                Err(e) => {
                    tracing::debug!(kind = %kind, error = %e, "Skipping malformed server record");
                    report.failed += 1;
                    continue;
                }
            };
            match self.store.apply_server_record(kind, wire).await {
                Ok(ApplyOutcome::Inserted) => report.inserted += 1,
                Ok(ApplyOutcome::Overwritten) => report.overwritten += 1,
                Ok(ApplyOutcome::SkippedPendingLocal) => report.skipped += 1,
                Err(e) => {
                    tracing::warn!(kind = %kind, error = %e, "Failed to apply server record");
                    report.failed += 1;
                }
            }
        }

        tracing::debug!(?report, "Refresh completed");
        report
    }

    /// Refresh every kind, parents first.
    pub async fn pull_all(&self) -> Vec<RefreshReport> {
        let mut reports = Vec::new();
        for kind in EntityKind::in_dependency_order() {
            reports.push(self.refresh(kind).await);
        }
        reports
    }

    /// Run a pass on every offline → online transition.
    ///
    /// The pass starts after the debounce, and only if the connection is
    /// still up by then.
    pub fn spawn_connectivity_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let driver = Arc::clone(self);
        let mut changes = self.connectivity.subscribe();

        tokio::spawn(async move {
            let mut was_online = changes.borrow_and_update().is_online();

            while changes.changed().await.is_ok() {
                let online = changes.borrow_and_update().is_online();
                if online == was_online {
                    continue;
                }
                was_online = online;
                driver
                    .events
                    .publish(SyncEvent::ConnectivityChanged { online });

                if !online {
                    tracing::info!("Connection lost");
                    continue;
                }

                tokio::time::sleep(driver.settings.debounce).await;
                if !driver.connectivity.current().is_online() {
                    tracing::debug!("Connection dropped during debounce");
                    continue;
                }

                tracing::info!("Connection restored; starting sync");
                match driver.run_pass().await {
                    Ok(outcome) => tracing::debug!(?outcome, "Reconnect sync finished"),
                    Err(e) => tracing::warn!(error = %e, "Reconnect sync failed"),
                }
            }
        })
    }

    /// Run a pass every `every` while online.
    pub fn spawn_periodic(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let driver = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if !driver.connectivity.current().is_online() {
                    continue;
                }
                if let Err(e) = driver.run_pass().await {
                    tracing::warn!(error = %e, "Periodic sync failed");
                }
            }
        })
    }
}
