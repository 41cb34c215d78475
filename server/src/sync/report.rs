//! Reports produced by the sync service.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tandem_engine::{BatchReport, CounterAdjustment, EntityKind};

/// What one forward reconciliation cycle did.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    /// Kinds synced, in sync order.
    pub kinds: Vec<EntityKind>,
    pub batches: Vec<BatchReport>,
    pub counter_adjustments: Vec<CounterAdjustment>,
    pub duration_ms: u64,
}

/// Result of a forward cycle that did not fail.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Nothing was dirty; no store was touched.
    Skipped,
    Synced(CycleReport),
}

impl CycleOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, CycleOutcome::Skipped)
    }

    pub fn report(&self) -> Option<&CycleReport> {
        match self {
            CycleOutcome::Skipped => None,
            CycleOutcome::Synced(report) => Some(report),
        }
    }
}

/// Per-kind result of restoring the primary store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KindRestore {
    pub kind: EntityKind,
    /// Records written from the durable store.
    pub restored: usize,
    /// Primary records deleted because the durable store lacks them or holds
    /// their natural key under another ID.
    pub removed: usize,
}

/// What a reverse sync did.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub kinds: Vec<KindRestore>,
    pub counter_adjustments: Vec<CounterAdjustment>,
}

impl RestoreReport {
    pub fn restored(&self, kind: EntityKind) -> Option<KindRestore> {
        self.kinds.iter().find(|k| k.kind == kind).copied()
    }
}

/// Point-in-time view of the sync service.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Whether the timer task is running.
    pub running: bool,
    /// Whether a cycle is executing right now.
    pub in_flight: bool,
    pub interval_secs: u64,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub elapsed_secs: Option<f64>,
    pub pending_types: Vec<EntityKind>,
    pub healthy: bool,
}
