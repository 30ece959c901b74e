//! Foreign-key resolution and the server-read conflict policy.
//!
//! # Outbound
//!
//! A child created offline points at its parent's *local* id. Before the
//! child can be sent, every foreign key has to be swapped for the parent's
//! *server* id. The IO layer looks parents up and hands the answers to
//! [`resolve_foreign_keys`], which decides whether the entry can go out.
//!
//! # Inbound
//!
//! Records read from the server carry server ids in their foreign keys.
//! [`localize_foreign_keys`] maps them back to local ids where the parent
//! is known locally. [`decide_server_write`] applies the conflict policy:
//! local pending writes win until synced, server reads win afterwards.

use crate::{EntityKind, EntityRecord, ForeignKey, LocalId, ServerId};
use serde_json::{Map, Value};

/// What the local store knows about a referenced parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentLookup {
    /// Parent reached the server; use this id on the wire
    Synced(ServerId),
    /// Parent exists locally but has no server id yet
    Pending,
    /// Nothing local matches the reference
    Missing,
}

/// Outcome of resolving a payload's foreign keys.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Payload with every foreign key replaced by a server id (or null)
    Resolved(Map<String, Value>),
    /// A parent hasn't synced yet; retry on a later pass
    Unresolved {
        field: &'static str,
        parent: EntityKind,
        reference: String,
    },
    /// The reference points at nothing; the server would reject it
    MissingParent {
        field: &'static str,
        parent: EntityKind,
        reference: String,
    },
}

/// Foreign keys of `kind` with their values in `data`.
///
/// Absent, null and blank references come back as `None`.
pub fn foreign_key_values(kind: EntityKind, data: &Value) -> Vec<(ForeignKey, Option<String>)> {
    kind.foreign_keys()
        .into_iter()
        .map(|fk| {
            let value = data
                .get(fk.field)
                .and_then(crate::wire::id_string)
                .filter(|s| !s.trim().is_empty());
            (fk, value)
        })
        .collect()
}

/// Swap local parent ids for server ids.
///
/// `lookup` is called once per non-null foreign key with the referenced
/// kind and the stored reference.
pub fn resolve_foreign_keys<F>(kind: EntityKind, data: &Value, mut lookup: F) -> Resolution
where
    F: FnMut(EntityKind, &str) -> ParentLookup,
{
    let mut resolved = data.as_object().cloned().unwrap_or_default();

    for (fk, value) in foreign_key_values(kind, data) {
        let Some(reference) = value else {
            resolved.insert(fk.field.to_string(), Value::Null);
            continue;
        };

        match lookup(fk.references, &reference) {
            ParentLookup::Synced(server_id) => {
                resolved.insert(fk.field.to_string(), Value::String(server_id));
            }
            ParentLookup::Pending => {
                return Resolution::Unresolved {
                    field: fk.field,
                    parent: fk.references,
                    reference,
                };
            }
            ParentLookup::Missing => {
                return Resolution::MissingParent {
                    field: fk.field,
                    parent: fk.references,
                    reference,
                };
            }
        }
    }

    Resolution::Resolved(resolved)
}

/// Map server-side parent ids in `data` back to local ids.
///
/// References with no local parent are left as server ids; outbound
/// resolution accepts those as-is.
pub fn localize_foreign_keys<F>(kind: EntityKind, data: &mut Map<String, Value>, mut lookup: F)
where
    F: FnMut(EntityKind, &str) -> Option<LocalId>,
{
    for fk in kind.foreign_keys() {
        let Some(server_ref) = data.get(fk.field).and_then(crate::wire::id_string) else {
            continue;
        };
        if let Some(local_id) = lookup(fk.references, &server_ref) {
            data.insert(fk.field.to_string(), Value::String(local_id));
        }
    }
}

/// What to do with a record that arrived from a server read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerWriteDecision {
    /// No local copy; store it as synced
    Insert,
    /// Local copy is synced; server data replaces it
    Overwrite,
    /// Local copy has unsynced edits; it wins until they reach the server
    KeepLocal,
}

/// Conflict policy for server-originated writes.
pub fn decide_server_write(local: Option<&EntityRecord>) -> ServerWriteDecision {
    match local {
        None => ServerWriteDecision::Insert,
        Some(record) if record.needs_sync => ServerWriteDecision::KeepLocal,
        Some(_) => ServerWriteDecision::Overwrite,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::collections::HashMap;

    fn batch_data(farm_ref: Value) -> Value {
        json!({"name": "A", "farm_ref": farm_ref, "initial_count": 10, "start_date": "2024-01-01"})
    }

    #[test]
    fn resolves_synced_parent() {
        let data = batch_data(json!("farm-local"));
        let result = resolve_foreign_keys(EntityKind::Batch, &data, |kind, id| {
            assert_eq!(kind, EntityKind::Farm);
            assert_eq!(id, "farm-local");
            ParentLookup::Synced("100".into())
        });

        match result {
            Resolution::Resolved(map) => {
                assert_eq!(map["farm_ref"], "100");
                assert_eq!(map["name"], "A");
            }
            other => panic!("expected resolved, got {other:?}"),
        }
    }

    #[test]
    fn pending_parent_is_unresolved() {
        let data = batch_data(json!("farm-local"));
        let result =
            resolve_foreign_keys(EntityKind::Batch, &data, |_, _| ParentLookup::Pending);
        assert_eq!(
            result,
            Resolution::Unresolved {
                field: "farm_ref",
                parent: EntityKind::Farm,
                reference: "farm-local".into()
            }
        );
    }

    #[test]
    fn missing_parent_is_reported() {
        let data = batch_data(json!("ghost"));
        let result =
            resolve_foreign_keys(EntityKind::Batch, &data, |_, _| ParentLookup::Missing);
        assert!(matches!(result, Resolution::MissingParent { .. }));
    }

    #[test]
    fn null_and_blank_references_stay_null() {
        for value in [Value::Null, json!(""), json!("   ")] {
            let data = batch_data(value);
            let result = resolve_foreign_keys(EntityKind::Batch, &data, |_, _| {
                panic!("lookup must not run for empty references")
            });
            match result {
                Resolution::Resolved(map) => assert_eq!(map["farm_ref"], Value::Null),
                other => panic!("expected resolved, got {other:?}"),
            }
        }
    }

    #[test]
    fn kinds_without_foreign_keys_pass_through() {
        let data = json!({"name": "North"});
        let result = resolve_foreign_keys(EntityKind::Farm, &data, |_, _| ParentLookup::Missing);
        assert_eq!(
            result,
            Resolution::Resolved(data.as_object().unwrap().clone())
        );
    }

    #[test]
    fn localize_maps_known_parents_only() {
        let known: HashMap<&str, &str> = [("200", "batch-local")].into_iter().collect();

        let mut data = json!({"batch_ref": "200", "date": "2024-01-01"})
            .as_object()
            .unwrap()
            .clone();
        localize_foreign_keys(EntityKind::WeightRecord, &mut data, |_, id| {
            known.get(id).map(|s| s.to_string())
        });
        assert_eq!(data["batch_ref"], "batch-local");

        let mut unknown = json!({"batch_ref": "999"}).as_object().unwrap().clone();
        localize_foreign_keys(EntityKind::WeightRecord, &mut unknown, |_, _| None);
        assert_eq!(unknown["batch_ref"], "999");
    }

    #[test]
    fn conflict_policy() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let mut record = EntityRecord::new_local(
            EntityKind::Farm,
            "farm-1",
            Some("org".into()),
            json!({"name": "Local"}),
            now,
            false,
        );

        assert_eq!(decide_server_write(None), ServerWriteDecision::Insert);
        assert_eq!(
            decide_server_write(Some(&record)),
            ServerWriteDecision::KeepLocal
        );

        record.mark_synced(Some("100".into()), now);
        assert_eq!(
            decide_server_write(Some(&record)),
            ServerWriteDecision::Overwrite
        );
    }
}
