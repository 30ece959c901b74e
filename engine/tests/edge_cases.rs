//! Edge case tests for farmsync-engine
//!
//! These tests cover boundary conditions and unusual inputs.

use chrono::{Duration, TimeZone, Utc};
use farmsync_engine::{
    decide_server_write, from_wire, resolve_foreign_keys, to_wire, BackoffPolicy, DataExport,
    EntityKind, EntityRecord, Error, NewQueueEntry, Operation, ParentLookup, QueueStatus,
    Resolution, ServerWriteDecision, Timestamp,
};
use proptest::prelude::*;
use serde_json::{json, Value};

fn t0() -> Timestamp {
    Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
}

fn batch(local_id: &str, farm_ref: Value) -> EntityRecord {
    EntityRecord::new_local(
        EntityKind::Batch,
        local_id,
        Some("org-1".into()),
        json!({
            "name": "Layers A",
            "farm_ref": farm_ref,
            "initial_count": 500,
            "start_date": "2024-03-01"
        }),
        t0(),
        false,
    )
}

// ============================================================================
// Payload Validation
// ============================================================================

#[test]
fn empty_string_is_a_valid_string_field() {
    assert!(EntityKind::Farm
        .validate_payload(&json!({"name": ""}))
        .is_ok());
}

#[test]
fn unicode_payloads_pass_through_wire_mapping() {
    let names = ["日本語テスト", "Привет мир", "🐔🥚", "Hello\nWorld\tTab"];

    for name in names {
        let record = EntityRecord::new_local(
            EntityKind::Farm,
            "farm-1",
            Some("org-1".into()),
            json!({"name": name}),
            t0(),
            false,
        );
        let wire = to_wire(&record, record.data.as_object().unwrap(), Some("7"));
        let parsed = from_wire(EntityKind::Farm, &wire).unwrap();
        assert_eq!(parsed.data["name"], name);
    }
}

#[test]
fn non_object_payload_is_rejected() {
    for payload in [json!([1, 2]), json!("farm"), Value::Null] {
        assert!(matches!(
            EntityKind::Farm.validate_payload(&payload),
            Err(Error::InvalidPayload(_))
        ));
    }
}

#[test]
fn integer_field_rejects_float() {
    let result = EntityKind::MortalityRecord.validate_payload(&json!({
        "batch_ref": "b1",
        "date": "2024-03-01",
        "count": 2.5
    }));
    assert!(matches!(result, Err(Error::TypeMismatch { .. })));
}

#[test]
fn float_field_accepts_integer() {
    let result = EntityKind::WaterRecord.validate_payload(&json!({
        "batch_ref": "b1",
        "date": "2024-03-01",
        "quantity_liters": 40
    }));
    assert!(result.is_ok());
}

#[test]
fn numeric_foreign_key_is_accepted() {
    let result = EntityKind::FeedRecord.validate_payload(&json!({
        "batch_ref": 200,
        "date": "2024-03-01",
        "feed_type": "starter",
        "quantity_kg": 12.5
    }));
    assert!(result.is_ok());
}

#[test]
fn patch_cannot_null_required_field() {
    let patch = json!({"name": null});
    assert!(matches!(
        EntityKind::Farm.validate_patch(patch.as_object().unwrap()),
        Err(Error::MissingRequiredField(field)) if field == "name"
    ));
}

#[test]
fn blank_foreign_keys_normalize_to_null() {
    let mut payload = json!({"farm_ref": "  ", "name": "  "})
        .as_object()
        .unwrap()
        .clone();
    EntityKind::Batch.normalize_payload(&mut payload);
    assert_eq!(payload["farm_ref"], Value::Null);
    // Only foreign keys are normalized
    assert_eq!(payload["name"], "  ");
}

// ============================================================================
// Foreign Keys
// ============================================================================

#[test]
fn numeric_parent_reference_is_looked_up_as_string() {
    let record = batch("b1", json!(100));
    let result = resolve_foreign_keys(EntityKind::Batch, &record.data, |_, reference| {
        assert_eq!(reference, "100");
        ParentLookup::Synced("100".into())
    });
    assert!(matches!(result, Resolution::Resolved(_)));
}

#[test]
fn resolution_leaves_original_payload_untouched() {
    let record = batch("b1", json!("farm-local"));
    let _ = resolve_foreign_keys(EntityKind::Batch, &record.data, |_, _| {
        ParentLookup::Synced("100".into())
    });
    assert_eq!(record.data["farm_ref"], "farm-local");
}

#[test]
fn every_child_kind_points_at_a_lower_rank() {
    for kind in EntityKind::ALL {
        for fk in kind.foreign_keys() {
            assert!(
                fk.references.dependency_rank() < kind.dependency_rank(),
                "{kind}.{} must reference a parent synced earlier",
                fk.field
            );
        }
    }
}

// ============================================================================
// Conflict Policy
// ============================================================================

#[test]
fn deleted_local_with_pending_sync_is_kept() {
    let mut record = batch("b1", json!("f1"));
    record.mark_synced(Some("200".into()), t0());
    record.mark_deleted(t0() + Duration::minutes(1), false);
    assert_eq!(
        decide_server_write(Some(&record)),
        ServerWriteDecision::KeepLocal
    );
}

#[test]
fn server_tombstone_marks_local_deleted() {
    let mut record = batch("b1", json!("f1"));
    record.mark_synced(Some("200".into()), t0());

    let wire = json!({
        "id": "200",
        "name": "Layers A",
        "farmId": "100",
        "initialQuantity": 500,
        "startDate": "2024-03-01",
        "deletedAt": "2024-03-02T10:00:00Z"
    });
    let later = t0() + Duration::days(1);
    record.apply_server_state(from_wire(EntityKind::Batch, &wire).unwrap(), None, later);

    assert!(record.is_deleted);
    assert!(record.is_synced);
    assert_eq!(record.organization_id.as_deref(), Some("org-1"));
}

// ============================================================================
// Queue Entries
// ============================================================================

#[test]
fn queue_payload_is_a_full_snapshot() {
    let mut record = batch("b1", json!("f1"));
    record.merge_patch(
        json!({"breed": "Leghorn"}).as_object().unwrap(),
        t0(),
        false,
    );
    let entry = NewQueueEntry::for_record(Operation::Update, &record);

    // The patch alone would only carry `breed`
    assert_eq!(entry.payload["data"]["name"], "Layers A");
    assert_eq!(entry.payload["data"]["breed"], "Leghorn");
    assert_eq!(entry.payload["needs_sync"], true);
}

#[test]
fn snapshot_of_deleted_record_survives_export() {
    let mut record = batch("b1", json!("f1"));
    record.mark_deleted(t0(), false);

    let mut export = DataExport::new(3, t0());
    export.add_record(record.clone());
    let parsed = DataExport::from_json(&export.to_json().unwrap()).unwrap();

    assert_eq!(parsed.records(EntityKind::Batch), &[record]);
    assert_eq!(parsed.active_record_count(), 0);
}

#[test]
fn malformed_export_is_invalid_snapshot() {
    assert!(matches!(
        DataExport::from_json("{\"formatVersion\": 1"),
        Err(Error::InvalidSnapshot(_))
    ));
}

// ============================================================================
// Properties
// ============================================================================

fn arb_status() -> impl Strategy<Value = QueueStatus> {
    prop_oneof![
        Just(QueueStatus::Pending),
        Just(QueueStatus::Syncing),
        Just(QueueStatus::Synced),
        Just(QueueStatus::Failed),
    ]
}

proptest! {
    #[test]
    fn prop_syncing_only_leaves_to_synced_or_failed(next in arb_status()) {
        let allowed = QueueStatus::Syncing.can_transition_to(next);
        prop_assert_eq!(
            allowed,
            matches!(next, QueueStatus::Synced | QueueStatus::Failed)
        );
    }

    #[test]
    fn prop_transition_agrees_with_predicate(from in arb_status(), to in arb_status()) {
        let result = from.transition(to);
        prop_assert_eq!(result.is_ok(), from.can_transition_to(to));
        if let Err(err) = result {
            prop_assert_eq!(err, Error::InvalidTransition { from, to });
        }
    }

    #[test]
    fn prop_random_walk_never_returns_from_synced(steps in prop::collection::vec(arb_status(), 0..32)) {
        let mut status = QueueStatus::Pending;
        for next in steps {
            if let Ok(moved) = status.transition(next) {
                prop_assert!(status != QueueStatus::Synced);
                status = moved;
            }
        }
    }

    #[test]
    fn prop_backoff_is_monotone_and_capped(
        base_ms in 1u64..5_000,
        max_ms in 1u64..600_000,
        attempt in 1u32..64,
    ) {
        let policy = BackoffPolicy::new(
            10,
            std::time::Duration::from_millis(base_ms),
            std::time::Duration::from_millis(max_ms),
        );
        let current = policy.delay_for(attempt, 0.5);
        let next = policy.delay_for(attempt + 1, 0.5);
        prop_assert!(current <= next);
        prop_assert!(next <= std::time::Duration::from_millis(max_ms));
    }

    #[test]
    fn prop_jitter_stays_within_cap(sample in 0.0f64..1.0, attempt in 1u32..20) {
        let policy = BackoffPolicy::default();
        prop_assert!(policy.delay_for(attempt, sample) <= policy.max_delay);
    }

    #[test]
    fn prop_wire_mapping_preserves_batch_payload(
        initial in 0i64..1_000_000,
        name in "[A-Za-z0-9 ]{1,24}",
    ) {
        let record = EntityRecord::new_local(
            EntityKind::Batch,
            "b1",
            Some("org-1".into()),
            json!({
                "name": name,
                "farm_ref": "100",
                "initial_count": initial,
                "start_date": "2024-03-01"
            }),
            t0(),
            false,
        );
        let wire = to_wire(&record, record.data.as_object().unwrap(), Some("200"));
        let parsed = from_wire(EntityKind::Batch, &wire).unwrap();

        prop_assert_eq!(parsed.server_id, "200");
        prop_assert_eq!(parsed.client_id.as_deref(), Some("b1"));
        prop_assert_eq!(Value::Object(parsed.data), record.data);
    }
}
