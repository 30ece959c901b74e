//! Export and backup formats.
//!
//! A [`DataExport`] is a full copy of every entity (soft-deleted ones
//! included) plus the schema version and the settings worth carrying over.
//! A [`BackupSnapshot`] wraps an export with the key it is stored under.
//! Maps are `BTreeMap`s so serialized output is deterministic.

use crate::{error::Result, EntityKind, EntityRecord, Error, SchemaVersion, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the export format for future compatibility.
pub const EXPORT_FORMAT_VERSION: u32 = 1;

/// Key a backup is stored under, derived from its creation time.
pub fn backup_key(created_at: Timestamp) -> String {
    format!(
        "backup-{}",
        created_at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    )
}

/// Full export of local data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataExport {
    pub format_version: u32,
    pub schema_version: SchemaVersion,
    pub exported_at: Timestamp,
    /// Settings carried with the data (never `schema_version`)
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    /// Records by kind
    #[serde(default)]
    pub entities: BTreeMap<EntityKind, Vec<EntityRecord>>,
}

impl DataExport {
    pub fn new(schema_version: SchemaVersion, exported_at: Timestamp) -> Self {
        Self {
            format_version: EXPORT_FORMAT_VERSION,
            schema_version,
            exported_at,
            settings: BTreeMap::new(),
            entities: BTreeMap::new(),
        }
    }

    pub fn add_record(&mut self, record: EntityRecord) {
        self.entities.entry(record.kind).or_default().push(record);
    }

    pub fn records(&self, kind: EntityKind) -> &[EntityRecord] {
        self.entities.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Count total records across all kinds.
    pub fn record_count(&self) -> usize {
        self.entities.values().map(Vec::len).sum()
    }

    /// Count active (non-deleted) records.
    pub fn active_record_count(&self) -> usize {
        self.entities
            .values()
            .flatten()
            .filter(|r| r.is_active())
            .count()
    }

    /// Check the export can be loaded by a store at `latest` schema.
    pub fn validate(&self, latest: SchemaVersion) -> Result<()> {
        if self.format_version > EXPORT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported export format version: {} (max supported: {})",
                self.format_version, EXPORT_FORMAT_VERSION
            )));
        }

        if self.schema_version > latest {
            return Err(Error::SchemaVersionMismatch {
                expected: latest,
                actual: self.schema_version,
            });
        }

        for (kind, records) in &self.entities {
            for record in records {
                if record.kind != *kind {
                    return Err(Error::InvalidSnapshot(format!(
                        "record {} is a {} filed under {}",
                        record.local_id, record.kind, kind
                    )));
                }
                if record.kind.requires_tenant() && record.organization_id.is_none() {
                    return Err(Error::InvalidSnapshot(format!(
                        "{} {} has no organization",
                        record.kind, record.local_id
                    )));
                }
            }
        }

        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let export: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if export.format_version > EXPORT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported export format version: {} (max supported: {})",
                export.format_version, EXPORT_FORMAT_VERSION
            )));
        }

        Ok(export)
    }
}

/// A stored backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSnapshot {
    pub key: String,
    pub created_at: Timestamp,
    pub data: DataExport,
}

impl BackupSnapshot {
    pub fn new(data: DataExport) -> Self {
        Self {
            key: backup_key(data.exported_at),
            created_at: data.exported_at,
            data,
        }
    }

    pub fn info(&self) -> BackupInfo {
        BackupInfo::from(self)
    }
}

/// Summary of a backup (without the data).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    pub key: String,
    pub created_at: Timestamp,
    pub schema_version: SchemaVersion,
    pub record_count: usize,
}

impl From<&BackupSnapshot> for BackupInfo {
    fn from(snapshot: &BackupSnapshot) -> Self {
        Self {
            key: snapshot.key.clone(),
            created_at: snapshot.created_at,
            schema_version: snapshot.data.schema_version,
            record_count: snapshot.data.record_count(),
        }
    }
}
