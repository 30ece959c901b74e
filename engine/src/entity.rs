//! Entity kinds and their field schemas.
//!
//! Each [`EntityKind`] carries everything the rest of the system needs to
//! know about it: storage table, remote endpoint, dependency rank, payload
//! fields and foreign keys. Payloads are validated against the field
//! definitions before they are stored.

use crate::{error::Result, Error};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Field types supported in entity payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    /// Calendar date or timestamp as an ISO-8601 string
    Date,
    /// Local id (or server id) of another entity
    Reference(EntityKind),
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Date => write!(f, "Date"),
            FieldType::Reference(kind) => write!(f, "Reference({kind})"),
        }
    }
}

/// Definition of a payload field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name (storage, snake_case)
    pub name: &'static str,
    /// Field type
    pub field_type: FieldType,
    /// Whether this field is required on create
    pub required: bool,
}

impl FieldDef {
    /// Create a required field definition.
    pub const fn required(name: &'static str, field_type: FieldType) -> Self {
        Self {
            name,
            field_type,
            required: true,
        }
    }

    /// Create an optional field definition.
    pub const fn optional(name: &'static str, field_type: FieldType) -> Self {
        Self {
            name,
            field_type,
            required: false,
        }
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: Option<&serde_json::Value>) -> Result<()> {
        match value {
            None if self.required => Err(Error::MissingRequiredField(self.name.to_string())),
            None => Ok(()),
            Some(serde_json::Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.to_string()))
            }
            Some(serde_json::Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &serde_json::Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String | FieldType::Date => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            // Server ids may arrive as numbers
            FieldType::Reference(_) => value.is_string() || value.is_i64() || value.is_u64(),
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.to_string(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "Null",
        serde_json::Value::Bool(_) => "Bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        serde_json::Value::Number(_) => "Float",
        serde_json::Value::String(_) => "String",
        serde_json::Value::Array(_) => "Array",
        serde_json::Value::Object(_) => "Object",
    }
}

/// A foreign-key field pointing at another entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKey {
    pub field: &'static str,
    pub references: EntityKind,
}

/// Every kind of entity the client stores and syncs.
///
/// Declaration order is dependency order, so the derived `Ord` sorts
/// parents before children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Organization,
    Farm,
    Batch,
    FeedRecord,
    HealthRecord,
    MortalityRecord,
    ProductionRecord,
    WaterRecord,
    WeightRecord,
}

const ORGANIZATION_FIELDS: &[FieldDef] = &[
    FieldDef::required("name", FieldType::String),
    FieldDef::optional("contact_email", FieldType::String),
];

const FARM_FIELDS: &[FieldDef] = &[
    FieldDef::required("name", FieldType::String),
    FieldDef::optional("location", FieldType::String),
    FieldDef::optional("farm_type", FieldType::String),
    FieldDef::optional("capacity", FieldType::Int),
];

const BATCH_FIELDS: &[FieldDef] = &[
    FieldDef::required("name", FieldType::String),
    FieldDef::required("farm_ref", FieldType::Reference(EntityKind::Farm)),
    FieldDef::optional("breed", FieldType::String),
    FieldDef::required("initial_count", FieldType::Int),
    FieldDef::optional("current_count", FieldType::Int),
    FieldDef::required("start_date", FieldType::Date),
    FieldDef::optional("status", FieldType::String),
];

const FEED_FIELDS: &[FieldDef] = &[
    FieldDef::required("batch_ref", FieldType::Reference(EntityKind::Batch)),
    FieldDef::required("date", FieldType::Date),
    FieldDef::required("feed_type", FieldType::String),
    FieldDef::required("quantity_kg", FieldType::Float),
    FieldDef::optional("cost", FieldType::Float),
];

const HEALTH_FIELDS: &[FieldDef] = &[
    FieldDef::required("batch_ref", FieldType::Reference(EntityKind::Batch)),
    FieldDef::required("date", FieldType::Date),
    FieldDef::required("condition", FieldType::String),
    FieldDef::optional("treatment", FieldType::String),
    FieldDef::optional("medication", FieldType::String),
    FieldDef::optional("notes", FieldType::String),
];

const MORTALITY_FIELDS: &[FieldDef] = &[
    FieldDef::required("batch_ref", FieldType::Reference(EntityKind::Batch)),
    FieldDef::required("date", FieldType::Date),
    FieldDef::required("count", FieldType::Int),
    FieldDef::optional("cause", FieldType::String),
];

const PRODUCTION_FIELDS: &[FieldDef] = &[
    FieldDef::required("batch_ref", FieldType::Reference(EntityKind::Batch)),
    FieldDef::required("date", FieldType::Date),
    FieldDef::required("eggs_collected", FieldType::Int),
    FieldDef::optional("eggs_broken", FieldType::Int),
    FieldDef::optional("notes", FieldType::String),
];

const WATER_FIELDS: &[FieldDef] = &[
    FieldDef::required("batch_ref", FieldType::Reference(EntityKind::Batch)),
    FieldDef::required("date", FieldType::Date),
    FieldDef::required("quantity_liters", FieldType::Float),
];

const WEIGHT_FIELDS: &[FieldDef] = &[
    FieldDef::required("batch_ref", FieldType::Reference(EntityKind::Batch)),
    FieldDef::required("date", FieldType::Date),
    FieldDef::required("average_weight_g", FieldType::Float),
    FieldDef::optional("sample_size", FieldType::Int),
];

impl EntityKind {
    /// All kinds, in dependency order.
    pub const ALL: [EntityKind; 9] = [
        EntityKind::Organization,
        EntityKind::Farm,
        EntityKind::Batch,
        EntityKind::FeedRecord,
        EntityKind::HealthRecord,
        EntityKind::MortalityRecord,
        EntityKind::ProductionRecord,
        EntityKind::WaterRecord,
        EntityKind::WeightRecord,
    ];

    /// Stable identifier used in the queue and in exports.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Organization => "organization",
            EntityKind::Farm => "farm",
            EntityKind::Batch => "batch",
            EntityKind::FeedRecord => "feed_record",
            EntityKind::HealthRecord => "health_record",
            EntityKind::MortalityRecord => "mortality_record",
            EntityKind::ProductionRecord => "production_record",
            EntityKind::WaterRecord => "water_record",
            EntityKind::WeightRecord => "weight_record",
        }
    }

    /// Local storage table.
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Organization => "organizations",
            EntityKind::Farm => "farms",
            EntityKind::Batch => "batches",
            EntityKind::FeedRecord => "feed_records",
            EntityKind::HealthRecord => "health_records",
            EntityKind::MortalityRecord => "mortality_records",
            EntityKind::ProductionRecord => "production_records",
            EntityKind::WaterRecord => "water_records",
            EntityKind::WeightRecord => "weight_records",
        }
    }

    /// Remote API path segment.
    pub fn endpoint(&self) -> &'static str {
        match self {
            EntityKind::Organization => "organizations",
            EntityKind::Farm => "farms",
            EntityKind::Batch => "batches",
            EntityKind::FeedRecord => "feed-records",
            EntityKind::HealthRecord => "health-records",
            EntityKind::MortalityRecord => "mortality-records",
            EntityKind::ProductionRecord => "production-records",
            EntityKind::WaterRecord => "water-records",
            EntityKind::WeightRecord => "weight-records",
        }
    }

    /// Parents have a lower rank than their children.
    pub fn dependency_rank(&self) -> u8 {
        match self {
            EntityKind::Organization => 0,
            EntityKind::Farm => 1,
            EntityKind::Batch => 2,
            EntityKind::FeedRecord
            | EntityKind::HealthRecord
            | EntityKind::MortalityRecord
            | EntityKind::ProductionRecord
            | EntityKind::WaterRecord
            | EntityKind::WeightRecord => 3,
        }
    }

    /// Tenant-root kinds are the only ones without an organization scope.
    pub fn requires_tenant(&self) -> bool {
        !matches!(self, EntityKind::Organization)
    }

    /// Payload field definitions.
    pub fn fields(&self) -> &'static [FieldDef] {
        match self {
            EntityKind::Organization => ORGANIZATION_FIELDS,
            EntityKind::Farm => FARM_FIELDS,
            EntityKind::Batch => BATCH_FIELDS,
            EntityKind::FeedRecord => FEED_FIELDS,
            EntityKind::HealthRecord => HEALTH_FIELDS,
            EntityKind::MortalityRecord => MORTALITY_FIELDS,
            EntityKind::ProductionRecord => PRODUCTION_FIELDS,
            EntityKind::WaterRecord => WATER_FIELDS,
            EntityKind::WeightRecord => WEIGHT_FIELDS,
        }
    }

    /// Foreign-key fields, derived from the `Reference` field types.
    pub fn foreign_keys(&self) -> Vec<ForeignKey> {
        self.fields()
            .iter()
            .filter_map(|f| match f.field_type {
                FieldType::Reference(references) => Some(ForeignKey {
                    field: f.name,
                    references,
                }),
                _ => None,
            })
            .collect()
    }

    /// Storage-to-wire renames that don't follow plain camelCase.
    pub fn wire_renames(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            EntityKind::Organization => &[("contact_email", "email")],
            EntityKind::Farm => &[("farm_type", "type")],
            EntityKind::Batch => &[("farm_ref", "farmId"), ("initial_count", "initialQuantity")],
            EntityKind::FeedRecord
            | EntityKind::HealthRecord
            | EntityKind::MortalityRecord
            | EntityKind::ProductionRecord
            | EntityKind::WaterRecord
            | EntityKind::WeightRecord => &[("batch_ref", "batchId")],
        }
    }

    /// Kinds sorted parents-first.
    pub fn in_dependency_order() -> Vec<EntityKind> {
        let mut kinds = Self::ALL.to_vec();
        kinds.sort_by_key(|k| (k.dependency_rank(), *k));
        kinds
    }

    /// Validate a complete payload for a create.
    pub fn validate_payload(&self, payload: &serde_json::Value) -> Result<()> {
        let obj = payload
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("payload must be an object".into()))?;

        for field in self.fields() {
            field.validate(obj.get(field.name))?;
        }

        Ok(())
    }

    /// Validate a partial payload for an update: only the present fields
    /// are type-checked, and required fields may not be nulled out.
    pub fn validate_patch(&self, patch: &serde_json::Map<String, serde_json::Value>) -> Result<()> {
        for field in self.fields() {
            if let Some(value) = patch.get(field.name) {
                field.validate(Some(value))?;
            }
        }
        Ok(())
    }

    /// Normalize sentinel values: blank foreign keys become `null`.
    pub fn normalize_payload(&self, payload: &mut serde_json::Map<String, serde_json::Value>) {
        for fk in self.foreign_keys() {
            if let Some(value) = payload.get_mut(fk.field) {
                if value.as_str().is_some_and(|s| s.trim().is_empty()) {
                    *value = serde_json::Value::Null;
                }
            }
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s || k.table() == s)
            .ok_or_else(|| Error::UnknownEntityKind(s.to_string()))
    }
}
