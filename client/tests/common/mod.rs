//! Shared fixtures for the client integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use farmsync_client::db;
use farmsync_client::{
    DriverSettings, ManualConnectivity, MigrationManager, MigrationSettings, RemoteAck, RemoteApi,
    RemoteError, SessionContext, SyncClient,
};
use farmsync_engine::{Clock, EntityKind, ManualClock, Timestamp};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

pub const ORG: &str = "org-1";

pub fn t0() -> Timestamp {
    Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
}

pub fn farm(name: &str) -> Value {
    json!({"name": name, "location": "Valley"})
}

pub fn batch(farm_ref: &str) -> Value {
    json!({
        "name": "Layers A",
        "farm_ref": farm_ref,
        "initial_count": 500,
        "start_date": "2024-03-01"
    })
}

/// One call the fake server received.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub method: &'static str,
    pub kind: EntityKind,
    pub server_id: Option<String>,
    pub body: Value,
}

#[derive(Debug, Default)]
struct State {
    next_ids: HashMap<EntityKind, u64>,
    failures: HashMap<EntityKind, VecDeque<RemoteError>>,
    listed: HashMap<EntityKind, Vec<Value>>,
    calls: Vec<Call>,
}

/// In-memory stand-in for the remote API.
///
/// Server ids are handed out per kind: farms from 100, batches from 200,
/// everything else from 300.
#[derive(Debug, Default)]
pub struct FakeRemote {
    state: Mutex<State>,
    gate: Option<Arc<Semaphore>>,
    /// Signalled whenever a write reaches the server
    pub entered: Notify,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes block until [`FakeRemote::release`] hands out permits.
    pub fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::default()
        }
    }

    pub fn release(&self, writes: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(writes);
        }
    }

    /// The next write for `kind` fails with `error`.
    pub fn fail_next(&self, kind: EntityKind, error: RemoteError) {
        self.lock().failures.entry(kind).or_default().push_back(error);
    }

    /// Records the server returns when `kind` is listed.
    pub fn set_listed(&self, kind: EntityKind, records: Vec<Value>) {
        self.lock().listed.insert(kind, records);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn calls_for(&self, kind: EntityKind) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.kind == kind).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    async fn enter(&self) {
        self.entered.notify_one();
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
    }

    fn record(
        &self,
        method: &'static str,
        kind: EntityKind,
        server_id: Option<&str>,
        body: Value,
    ) -> Result<(), RemoteError> {
        let mut state = self.lock();
        state.calls.push(Call {
            method,
            kind,
            server_id: server_id.map(str::to_string),
            body,
        });
        match state.failures.get_mut(&kind).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn allocate(&self, kind: EntityKind) -> String {
        let base = match kind {
            EntityKind::Farm => 100,
            EntityKind::Batch => 200,
            _ => 300,
        };
        let mut state = self.lock();
        let next = state.next_ids.entry(kind).or_insert(base);
        let id = *next;
        *next += 1;
        id.to_string()
    }
}

#[async_trait]
impl RemoteApi for FakeRemote {
    async fn create(&self, kind: EntityKind, body: Value) -> Result<RemoteAck, RemoteError> {
        self.enter().await;
        self.record("create", kind, None, body)?;
        Ok(RemoteAck {
            server_id: Some(self.allocate(kind)),
        })
    }

    async fn update(
        &self,
        kind: EntityKind,
        server_id: &str,
        body: Value,
    ) -> Result<RemoteAck, RemoteError> {
        self.enter().await;
        self.record("update", kind, Some(server_id), body)?;
        Ok(RemoteAck {
            server_id: Some(server_id.to_string()),
        })
    }

    async fn delete(&self, kind: EntityKind, server_id: &str) -> Result<(), RemoteError> {
        self.enter().await;
        self.record("delete", kind, Some(server_id), Value::Null)
    }

    async fn list(
        &self,
        kind: EntityKind,
        _organization_id: Option<&str>,
    ) -> Result<Vec<Value>, RemoteError> {
        Ok(self.lock().listed.get(&kind).cloned().unwrap_or_default())
    }
}

/// A client over an in-memory database with a manual clock.
pub struct Harness {
    pub client: SyncClient,
    pub remote: Arc<FakeRemote>,
    pub clock: Arc<ManualClock>,
    pub connectivity: Arc<ManualConnectivity>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_remote(FakeRemote::new()).await
    }

    pub async fn with_remote(remote: FakeRemote) -> Self {
        Self::build(remote, Some(ORG.to_string())).await
    }

    pub async fn without_organization() -> Self {
        Self::build(FakeRemote::new(), None).await
    }

    async fn build(remote: FakeRemote, organization: Option<String>) -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        let remote = Arc::new(remote);
        let connectivity = Arc::new(ManualConnectivity::online());

        let pool = db::create_pool("sqlite::memory:").await.unwrap();
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let migrations =
            MigrationManager::new(pool.clone(), dyn_clock.clone(), MigrationSettings::default());
        migrations.migrate().await.unwrap();
        migrations.bootstrap().await.unwrap();

        let settings = DriverSettings {
            request_timeout: Duration::from_secs(5),
            debounce: Duration::from_millis(10),
            ..DriverSettings::default()
        };
        let client = SyncClient::assemble(
            pool,
            migrations,
            remote.clone(),
            connectivity.clone(),
            dyn_clock,
            Arc::new(SessionContext::new(organization)),
            settings,
        );

        Self {
            client,
            remote,
            clock,
            connectivity,
        }
    }

    /// Move past any backoff so failed entries are due again.
    pub fn skip_backoff(&self) {
        self.clock.advance(chrono::Duration::hours(1));
    }
}
