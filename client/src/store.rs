//! The local data store.
//!
//! All reads and writes, from the UI and from sync, go through
//! [`LocalStore`]. Client-originated mutations are paired with a sync queue
//! append; writes carrying server data use `skip_sync` and are never
//! queued. Reads scope to the session's organization and hide soft-deleted
//! rows unless a [`Query`] asks for them.

use crate::db::{self, Pool, StoredEntity, ENTITY_COLUMNS};
use crate::error::{ClientError, Result};
use crate::queue::SyncQueue;
use crate::session::SessionContext;
use farmsync_engine::{
    decide_server_write, foreign_key_values, localize_foreign_keys, Clock, EntityKind,
    EntityRecord, LocalId, NewQueueEntry, Operation, ParentLookup, ServerWriteDecision,
    WireRecord,
};
use serde_json::{Map, Value};
use sqlx::{QueryBuilder, Sqlite};
use std::collections::HashMap;
use std::sync::Arc;

/// Field-equality filter over entity payloads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    filters: Vec<(String, Value)>,
    include_deleted: bool,
    limit: Option<u32>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match records whose payload `field` equals `value`.
    pub fn field_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((field.into(), value.into()));
        self
    }

    /// Include soft-deleted records.
    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    fn push_conditions<'a>(
        &self,
        qb: &mut QueryBuilder<'a, Sqlite>,
        kind: EntityKind,
        organization_id: Option<String>,
    ) {
        qb.push(" WHERE 1 = 1");
        if kind.requires_tenant() {
            if let Some(org) = organization_id {
                qb.push(" AND organization_id = ").push_bind(org);
            }
        }
        if !self.include_deleted {
            qb.push(" AND is_deleted = 0");
        }
        for (field, value) in &self.filters {
            qb.push(" AND json_extract(data, ")
                .push_bind(format!("$.{field}"))
                .push(")");
            match value {
                Value::Null => {
                    qb.push(" IS NULL");
                }
                Value::Bool(b) => {
                    qb.push(" = ").push_bind(i64::from(*b));
                }
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        qb.push(" = ").push_bind(i);
                    } else {
                        qb.push(" = ").push_bind(n.as_f64().unwrap_or_default());
                    }
                }
                Value::String(s) => {
                    qb.push(" = ").push_bind(s.clone());
                }
                other => {
                    qb.push(" = ").push_bind(other.to_string());
                }
            }
        }
    }
}

/// What [`LocalStore::apply_server_record`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    Overwritten,
    /// The local copy has unsynced edits and was left alone
    SkippedPendingLocal,
}

/// The local store service.
#[derive(Debug, Clone)]
pub struct LocalStore {
    pool: Pool,
    queue: SyncQueue,
    session: Arc<SessionContext>,
    clock: Arc<dyn Clock>,
}

impl LocalStore {
    pub fn new(
        pool: Pool,
        queue: SyncQueue,
        session: Arc<SessionContext>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pool,
            queue,
            session,
            clock,
        }
    }

    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.session.is_read_only() {
            return Err(ClientError::ReadOnly);
        }
        Ok(())
    }

    /// Create a record.
    ///
    /// Unless `skip_sync`, a CREATE entry is queued. A failed queue append
    /// is logged and the record still stands; the integrity check rebuilds
    /// the entry from the `needs_sync` flag.
    pub async fn create(
        &self,
        kind: EntityKind,
        data: Value,
        skip_sync: bool,
    ) -> Result<EntityRecord> {
        self.ensure_writable()?;

        let organization_id = if kind.requires_tenant() {
            Some(
                self.session
                    .organization_id()
                    .ok_or(farmsync_engine::Error::NoOrganizationContext(kind))?,
            )
        } else {
            None
        };

        let mut payload = match data {
            Value::Object(map) => map,
            _ => {
                return Err(farmsync_engine::Error::InvalidPayload(
                    "payload must be an object".into(),
                )
                .into())
            }
        };
        kind.normalize_payload(&mut payload);
        let data = Value::Object(payload);
        kind.validate_payload(&data)?;

        let record = EntityRecord::new_local(
            kind,
            uuid::Uuid::new_v4().to_string(),
            organization_id,
            data,
            self.clock.now(),
            skip_sync,
        );
        db::insert_entity(&self.pool, &record).await?;

        tracing::debug!(kind = %kind, local_id = %record.local_id, skip_sync, "Created record");

        if !skip_sync {
            self.enqueue(Operation::Create, &record).await;
        }
        Ok(record)
    }

    /// Shallow-merge `patch` into a record's payload.
    ///
    /// Returns the number of rows affected; 0 means the record doesn't
    /// exist or, for a local edit, has been soft-deleted.
    pub async fn update(
        &self,
        kind: EntityKind,
        local_id: &str,
        patch: Value,
        skip_sync: bool,
    ) -> Result<u64> {
        self.ensure_writable()?;

        let mut patch = match patch {
            Value::Object(map) => map,
            _ => {
                return Err(farmsync_engine::Error::InvalidPayload(
                    "patch must be an object".into(),
                )
                .into())
            }
        };
        kind.normalize_payload(&mut patch);
        kind.validate_patch(&patch)?;

        let Some(mut record) = self.find(kind, local_id).await? else {
            tracing::debug!(kind = %kind, local_id = %local_id, "Update of missing record");
            return Ok(0);
        };
        if record.is_deleted && !skip_sync {
            tracing::debug!(kind = %kind, local_id = %local_id, "Update of deleted record");
            return Ok(0);
        }

        record.merge_patch(&patch, self.clock.now(), skip_sync);
        let affected = db::update_entity(&self.pool, &record).await?;

        if affected > 0 && !skip_sync {
            self.enqueue(Operation::Update, &record).await;
        }
        Ok(affected)
    }

    /// Soft-delete a record.
    pub async fn soft_delete(
        &self,
        kind: EntityKind,
        local_id: &str,
        skip_sync: bool,
    ) -> Result<EntityRecord> {
        self.ensure_writable()?;

        let mut record = self
            .find(kind, local_id)
            .await?
            .ok_or_else(|| farmsync_engine::Error::RecordNotFound(local_id.to_string()))?;
        if record.is_deleted {
            return Ok(record);
        }

        record.mark_deleted(self.clock.now(), skip_sync);
        db::update_entity(&self.pool, &record).await?;

        if !skip_sync {
            self.enqueue(Operation::Delete, &record).await;
        }
        Ok(record)
    }

    /// Physically remove a record. Queued entries for it are kept.
    pub async fn hard_delete(&self, kind: EntityKind, local_id: &str) -> Result<u64> {
        self.ensure_writable()?;
        let removed = db::delete_entity(&self.pool, kind, local_id).await?;
        tracing::info!(kind = %kind, local_id = %local_id, removed, "Hard-deleted record");
        Ok(removed)
    }

    /// Look a record up by local id, without scoping or filtering.
    pub async fn find(&self, kind: EntityKind, local_id: &str) -> Result<Option<EntityRecord>> {
        db::get_entity(&self.pool, kind, local_id)
            .await?
            .map(|row| row.into_record(kind))
            .transpose()
    }

    /// Look a record up by server id within the current organization.
    pub async fn find_by_server_id(
        &self,
        kind: EntityKind,
        server_id: &str,
    ) -> Result<Option<EntityRecord>> {
        let org = self.scope_for(kind);
        db::get_entity_by_server_id(&self.pool, kind, server_id, org.as_deref())
            .await?
            .map(|row| row.into_record(kind))
            .transpose()
    }

    /// Get a record by local id.
    ///
    /// Soft-deleted records are returned only with `include_deleted`.
    /// Storage errors are logged and read as "not found".
    pub async fn get_by_id(
        &self,
        kind: EntityKind,
        local_id: &str,
        include_deleted: bool,
    ) -> Option<EntityRecord> {
        let record = match self.find(kind, local_id).await {
            Ok(record) => record?,
            Err(e) => {
                tracing::warn!(kind = %kind, local_id = %local_id, error = %e, "Read failed");
                return None;
            }
        };
        self.visible(&record, include_deleted).then_some(record)
    }

    /// Get a record by server id.
    pub async fn get_by_server_id(
        &self,
        kind: EntityKind,
        server_id: &str,
        include_deleted: bool,
    ) -> Option<EntityRecord> {
        let record = match self.find_by_server_id(kind, server_id).await {
            Ok(record) => record?,
            Err(e) => {
                tracing::warn!(kind = %kind, server_id = %server_id, error = %e, "Read failed");
                return None;
            }
        };
        self.visible(&record, include_deleted).then_some(record)
    }

    /// Records matching `query`, oldest first.
    pub async fn query(&self, kind: EntityKind, query: &Query) -> Vec<EntityRecord> {
        match self.try_query(kind, query).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(kind = %kind, error = %e, "Query failed");
                Vec::new()
            }
        }
    }

    async fn try_query(&self, kind: EntityKind, query: &Query) -> Result<Vec<EntityRecord>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {ENTITY_COLUMNS} FROM {}", kind.table()));
        query.push_conditions(&mut qb, kind, self.session.organization_id());
        qb.push(" ORDER BY created_at, local_id");
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(i64::from(limit));
        }

        qb.build_query_as::<StoredEntity>()
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|row| row.into_record(kind))
            .collect()
    }

    /// Number of records matching `query` (the limit is ignored).
    pub async fn count(&self, kind: EntityKind, query: &Query) -> u64 {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT COUNT(*) FROM {}", kind.table()));
        query.push_conditions(&mut qb, kind, self.session.organization_id());

        match qb.build_query_scalar::<i64>().fetch_one(&self.pool).await {
            Ok(count) => u64::try_from(count).unwrap_or(0),
            Err(e) => {
                tracing::warn!(kind = %kind, error = %e, "Count failed");
                0
            }
        }
    }

    /// Record the server's acceptance of a record.
    ///
    /// Never fails on a missing record: a concurrent delete must not abort
    /// a sync pass.
    ///
    /// Nothing changes while entries other than `synced_entry` are still
    /// outstanding for the record; 0 is returned in that case.
    pub async fn mark_synced(
        &self,
        kind: EntityKind,
        local_id: &str,
        server_id: Option<&str>,
        synced_entry: Option<i64>,
    ) -> Result<u64> {
        let affected = db::mark_entity_synced(
            &self.pool,
            kind,
            local_id,
            server_id,
            synced_entry,
            self.clock.now(),
        )
        .await?;
        if affected == 0 {
            tracing::debug!(
                kind = %kind,
                local_id = %local_id,
                "mark_synced: record missing or still has queued mutations"
            );
        }
        Ok(affected)
    }

    /// Store the server id while later mutations are still outstanding.
    pub async fn assign_server_id(
        &self,
        kind: EntityKind,
        local_id: &str,
        server_id: &str,
    ) -> Result<u64> {
        Ok(db::assign_entity_server_id(&self.pool, kind, local_id, server_id).await?)
    }

    /// Records with unsynced local mutations, across organizations.
    pub async fn pending_records(&self, kind: EntityKind) -> Result<Vec<EntityRecord>> {
        db::get_pending_entities(&self.pool, kind)
            .await?
            .into_iter()
            .map(|row| row.into_record(kind))
            .collect()
    }

    /// What the store knows about a referenced parent.
    ///
    /// A reference that matches no local id but matches a server id is
    /// already a server id and is used as-is.
    pub async fn lookup_parent(&self, kind: EntityKind, reference: &str) -> Result<ParentLookup> {
        if let Some(parent) = self.find(kind, reference).await? {
            return Ok(match parent.server_id {
                Some(server_id) => ParentLookup::Synced(server_id),
                None => ParentLookup::Pending,
            });
        }
        if self.find_by_server_id(kind, reference).await?.is_some() {
            return Ok(ParentLookup::Synced(reference.to_string()));
        }
        Ok(ParentLookup::Missing)
    }

    /// Apply a record read from the server.
    ///
    /// Local pending writes win until synced; otherwise server data
    /// overwrites the local copy. Unknown records are inserted as synced.
    pub async fn apply_server_record(
        &self,
        kind: EntityKind,
        mut wire: WireRecord,
    ) -> Result<ApplyOutcome> {
        self.ensure_writable()?;
        self.localize(kind, &mut wire.data).await?;

        let mut existing = self.find_by_server_id(kind, &wire.server_id).await?;
        if existing.is_none() {
            if let Some(client_id) = &wire.client_id {
                existing = self.find(kind, client_id).await?;
            }
        }

        let now = self.clock.now();
        let fallback_org = self.session.organization_id();

        match decide_server_write(existing.as_ref()) {
            ServerWriteDecision::Insert => {
                let local_id = wire
                    .client_id
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let record = EntityRecord::from_server(kind, local_id, wire, fallback_org, now);
                db::insert_entity(&self.pool, &record).await?;
                Ok(ApplyOutcome::Inserted)
            }
            ServerWriteDecision::Overwrite => {
                let Some(mut record) = existing else {
                    return Ok(ApplyOutcome::SkippedPendingLocal);
                };
                record.apply_server_state(wire, fallback_org, now);
                db::update_entity(&self.pool, &record).await?;
                Ok(ApplyOutcome::Overwritten)
            }
            ServerWriteDecision::KeepLocal => {
                if let Some(record) = existing.filter(|r| r.server_id.is_none()) {
                    // Matched by client id: the create already landed
                    db::assign_entity_server_id(&self.pool, kind, &record.local_id, &wire.server_id)
                        .await?;
                }
                tracing::debug!(
                    kind = %kind,
                    server_id = %wire.server_id,
                    "Kept local record with pending changes"
                );
                Ok(ApplyOutcome::SkippedPendingLocal)
            }
        }
    }

    /// Swap server-side parent ids for local ids where the parent is known.
    async fn localize(&self, kind: EntityKind, data: &mut Map<String, Value>) -> Result<()> {
        let snapshot = Value::Object(data.clone());
        let mut known: HashMap<(EntityKind, String), LocalId> = HashMap::new();

        for (fk, value) in foreign_key_values(kind, &snapshot) {
            let Some(server_ref) = value else { continue };
            if let Some(parent) = self.find_by_server_id(fk.references, &server_ref).await? {
                known.insert((fk.references, server_ref), parent.local_id);
            }
        }

        localize_foreign_keys(kind, data, |parent, server_ref| {
            known.get(&(parent, server_ref.to_string())).cloned()
        });
        Ok(())
    }

    async fn enqueue(&self, operation: Operation, record: &EntityRecord) {
        if let Err(e) = self
            .queue
            .enqueue(NewQueueEntry::for_record(operation, record))
            .await
        {
            tracing::error!(
                kind = %record.kind,
                local_id = %record.local_id,
                operation = %operation,
                error = %e,
                "Failed to enqueue sync entry"
            );
        }
    }

    fn scope_for(&self, kind: EntityKind) -> Option<String> {
        if kind.requires_tenant() {
            self.session.organization_id()
        } else {
            None
        }
    }

    fn visible(&self, record: &EntityRecord, include_deleted: bool) -> bool {
        if record.is_deleted && !include_deleted {
            return false;
        }
        match (self.scope_for(record.kind), &record.organization_id) {
            (Some(scope), Some(org)) => &scope == org,
            _ => true,
        }
    }
}
