//! Per-pass sync totals.

use crate::{EntityKind, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Totals for one entity kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KindTotals {
    pub attempted: u32,
    pub succeeded: u32,
    pub failed: u32,
}

/// What a sync pass did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub started_at: Timestamp,
    pub finished_at: Option<Timestamp>,
    pub per_kind: BTreeMap<EntityKind, KindTotals>,
    /// The pass stopped early (cancel request or connectivity loss)
    pub cancelled: bool,
    /// Entries found stuck in `syncing` and reset before the pass
    pub reset_stuck: u64,
    /// Failed entries moved back to `pending` before the pass
    pub requeued: u64,
}

impl SyncSummary {
    pub fn new(started_at: Timestamp) -> Self {
        Self {
            started_at,
            finished_at: None,
            per_kind: BTreeMap::new(),
            cancelled: false,
            reset_stuck: 0,
            requeued: 0,
        }
    }

    pub fn record_success(&mut self, kind: EntityKind) {
        let totals = self.per_kind.entry(kind).or_default();
        totals.attempted += 1;
        totals.succeeded += 1;
    }

    pub fn record_failure(&mut self, kind: EntityKind) {
        let totals = self.per_kind.entry(kind).or_default();
        totals.attempted += 1;
        totals.failed += 1;
    }

    pub fn kind(&self, kind: EntityKind) -> KindTotals {
        self.per_kind.get(&kind).copied().unwrap_or_default()
    }

    pub fn totals(&self) -> KindTotals {
        self.per_kind
            .values()
            .fold(KindTotals::default(), |acc, t| KindTotals {
                attempted: acc.attempted + t.attempted,
                succeeded: acc.succeeded + t.succeeded,
                failed: acc.failed + t.failed,
            })
    }

    pub fn finish(&mut self, at: Timestamp) {
        self.finished_at = Some(at);
    }
}
