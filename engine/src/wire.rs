//! Translation between storage format and the server's wire format.
//!
//! Storage is snake_case; the server speaks camelCase, and a handful of
//! fields are renamed per kind (`farm_ref` travels as `farmId`). Local
//! bookkeeping (`needs_sync`, `is_synced`, ...) never leaves the device.

use crate::{error::Result, EntityKind, EntityRecord, Error, LocalId, ServerId, Timestamp};
use serde_json::{Map, Value};

/// Envelope keys the wire format reserves for record identity.
const ENVELOPE_KEYS: &[&str] = &[
    "id",
    "clientId",
    "organizationId",
    "createdAt",
    "updatedAt",
    "deletedAt",
    "isDeleted",
];

/// `feed_type` → `feedType`
pub fn snake_to_camel(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = false;
    for c in name.chars() {
        if c == '_' {
            upper = !out.is_empty();
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// `feedType` → `feed_type`
pub fn camel_to_snake(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

impl EntityKind {
    /// Wire name of a storage field.
    pub fn wire_field(&self, field: &str) -> String {
        self.wire_renames()
            .iter()
            .find(|(storage, _)| *storage == field)
            .map(|(_, wire)| wire.to_string())
            .unwrap_or_else(|| snake_to_camel(field))
    }

    /// Storage name of a wire field.
    pub fn storage_field(&self, wire: &str) -> String {
        self.wire_renames()
            .iter()
            .find(|(_, w)| *w == wire)
            .map(|(storage, _)| storage.to_string())
            .unwrap_or_else(|| camel_to_snake(wire))
    }
}

/// Build the request body for a record.
///
/// `resolved` is the record's payload with foreign keys already swapped for
/// server ids. `server_id` is the record's own server identity, if any.
pub fn to_wire(
    record: &EntityRecord,
    resolved: &Map<String, Value>,
    server_id: Option<&str>,
) -> Value {
    let kind = record.kind;
    let mut body = Map::new();

    for (field, value) in resolved {
        body.insert(kind.wire_field(field), value.clone());
    }

    if let Some(id) = server_id {
        body.insert("id".into(), Value::String(id.to_string()));
    }
    body.insert("clientId".into(), Value::String(record.local_id.clone()));
    if let Some(org) = &record.organization_id {
        body.insert("organizationId".into(), Value::String(org.clone()));
    }
    body.insert("createdAt".into(), Value::String(record.created_at.to_rfc3339()));
    body.insert("updatedAt".into(), Value::String(record.updated_at.to_rfc3339()));

    Value::Object(body)
}

/// A record as returned by the server, mapped back to storage names.
#[derive(Debug, Clone, PartialEq)]
pub struct WireRecord {
    pub server_id: ServerId,
    /// Local id echoed back by the server, when it kept one
    pub client_id: Option<LocalId>,
    pub organization_id: Option<String>,
    pub data: Map<String, Value>,
    pub is_deleted: bool,
    pub deleted_at: Option<Timestamp>,
    pub created_at: Option<Timestamp>,
    pub updated_at: Option<Timestamp>,
}

/// Parse a server record.
pub fn from_wire(kind: EntityKind, value: &Value) -> Result<WireRecord> {
    let obj = value
        .as_object()
        .ok_or_else(|| Error::InvalidPayload(format!("{kind}: wire record must be an object")))?;

    let server_id = obj
        .get("id")
        .and_then(id_string)
        .ok_or_else(|| Error::InvalidPayload(format!("{kind}: wire record has no id")))?;

    let mut data = Map::new();
    for (key, val) in obj {
        if ENVELOPE_KEYS.contains(&key.as_str()) {
            continue;
        }
        data.insert(kind.storage_field(key), val.clone());
    }
    kind.normalize_payload(&mut data);

    let deleted_at = timestamp_field(obj, "deletedAt");
    let is_deleted = obj
        .get("isDeleted")
        .and_then(Value::as_bool)
        .unwrap_or(deleted_at.is_some());

    Ok(WireRecord {
        server_id,
        client_id: obj.get("clientId").and_then(id_string),
        organization_id: obj.get("organizationId").and_then(id_string),
        data,
        is_deleted,
        deleted_at,
        created_at: timestamp_field(obj, "createdAt"),
        updated_at: timestamp_field(obj, "updatedAt"),
    })
}

/// Ids arrive as strings or numbers.
pub(crate) fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn timestamp_field(obj: &Map<String, Value>, key: &str) -> Option<Timestamp> {
    obj.get(key)
        .and_then(Value::as_str)
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&chrono::Utc))
}
