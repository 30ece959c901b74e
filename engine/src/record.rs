//! Entity records with their sync bookkeeping.

use crate::{EntityKind, LocalId, OrganizationId, ServerId, Timestamp, WireRecord};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A domain object as stored on the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Which kind of entity this is
    pub kind: EntityKind,
    /// Client-generated identity, stable for the record's lifetime
    pub local_id: LocalId,
    /// Assigned once the server accepted the create
    pub server_id: Option<ServerId>,
    /// Tenant scope; `None` only for tenant-root kinds
    pub organization_id: Option<OrganizationId>,
    /// Local copy has mutations the server hasn't seen
    pub needs_sync: bool,
    /// This exact version was accepted by the server
    pub is_synced: bool,
    /// Soft-delete marker
    pub is_deleted: bool,
    pub deleted_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    /// When the server last accepted this record
    #[serde(default)]
    pub last_synced_at: Option<Timestamp>,
    /// Entity payload (snake_case, foreign keys hold parent local ids)
    pub data: Value,
}

impl EntityRecord {
    /// Create a record written on this device.
    ///
    /// `skip_sync` marks the write as already authoritative (it won't be
    /// queued for upload).
    pub fn new_local(
        kind: EntityKind,
        local_id: impl Into<LocalId>,
        organization_id: Option<OrganizationId>,
        data: Value,
        now: Timestamp,
        skip_sync: bool,
    ) -> Self {
        Self {
            kind,
            local_id: local_id.into(),
            server_id: None,
            organization_id,
            needs_sync: !skip_sync,
            is_synced: skip_sync,
            is_deleted: false,
            deleted_at: None,
            created_at: now,
            updated_at: now,
            last_synced_at: None,
            data,
        }
    }

    /// Create a record from authoritative server data.
    pub fn from_server(
        kind: EntityKind,
        local_id: impl Into<LocalId>,
        wire: WireRecord,
        fallback_organization: Option<OrganizationId>,
        now: Timestamp,
    ) -> Self {
        let created_at = wire.created_at.unwrap_or(now);
        let mut record = Self {
            kind,
            local_id: local_id.into(),
            server_id: Some(wire.server_id.clone()),
            organization_id: None,
            needs_sync: false,
            is_synced: true,
            is_deleted: false,
            deleted_at: None,
            created_at,
            updated_at: created_at,
            last_synced_at: None,
            data: Value::Object(Map::new()),
        };
        record.apply_server_state(wire, fallback_organization, now);
        record
    }

    /// Check if record is active (not soft-deleted).
    pub fn is_active(&self) -> bool {
        !self.is_deleted
    }

    /// Payload field by name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    /// Shallow-merge a patch into the payload.
    pub fn merge_patch(&mut self, patch: &Map<String, Value>, now: Timestamp, skip_sync: bool) {
        if !self.data.is_object() {
            self.data = Value::Object(Map::new());
        }
        if let Value::Object(data) = &mut self.data {
            for (key, value) in patch {
                data.insert(key.clone(), value.clone());
            }
        }
        self.touch(now, skip_sync);
    }

    /// Mark record as deleted (tombstone).
    pub fn mark_deleted(&mut self, now: Timestamp, skip_sync: bool) {
        self.is_deleted = true;
        self.deleted_at = Some(now);
        self.touch(now, skip_sync);
    }

    /// Record the server's acceptance of the current version.
    pub fn mark_synced(&mut self, server_id: Option<ServerId>, now: Timestamp) {
        if let Some(id) = server_id {
            self.server_id = Some(id);
        }
        self.needs_sync = false;
        self.is_synced = true;
        self.last_synced_at = Some(now);
    }

    /// Overwrite local state with what the server returned.
    pub fn apply_server_state(
        &mut self,
        wire: WireRecord,
        fallback_organization: Option<OrganizationId>,
        now: Timestamp,
    ) {
        let existing_organization = self.organization_id.take();
        self.server_id = Some(wire.server_id);
        self.organization_id = wire
            .organization_id
            .or(fallback_organization)
            .or(existing_organization);
        self.data = Value::Object(wire.data);
        self.is_deleted = wire.is_deleted;
        self.deleted_at = if wire.is_deleted {
            wire.deleted_at.or(Some(now))
        } else {
            None
        };
        self.updated_at = wire.updated_at.unwrap_or(now);
        self.needs_sync = false;
        self.is_synced = true;
        self.last_synced_at = Some(now);
    }

    /// Snapshot of the whole record, as carried by queue entries.
    pub fn snapshot(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    fn touch(&mut self, now: Timestamp, skip_sync: bool) {
        self.updated_at = now;
        self.needs_sync = !skip_sync;
        self.is_synced = skip_sync;
    }
}
