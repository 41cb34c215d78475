//! Identity conflict resolution for durable upserts.
//!
//! The primary store is the only ID authority. The durable store may still
//! hold a row for the same logical entity under another ID, for example one
//! seeded out-of-band. Upserting by ID alone would leave two rows for one
//! natural key, so each incoming record is resolved in three steps:
//!
//! 1. Found by ID: update the row in place.
//! 2. Not found by ID but the natural key is held by another ID: the stale
//!    row (and everything depending on it) is deleted, then the record is
//!    inserted under the primary store's ID.
//! 3. Neither: insert.
//!
//! When a row is found by ID while its incoming natural key is held by a
//! different row, that other row is evicted first so the uniqueness
//! constraint cannot abort the batch.

use crate::{EntityKind, Id};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// What the durable store must do with one incoming record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Overwrite mutable fields of the row with the same ID.
    Update,
    /// Delete the row holding the natural key, then update in place.
    UpdateEvicting { stale_id: Id },
    /// Delete the stale row holding the natural key, then insert.
    ReplaceStale { stale_id: Id },
    /// Insert a new row.
    Insert,
}

impl Resolution {
    /// ID of the row that must be deleted (with cascade) before writing.
    pub fn evicted(&self) -> Option<Id> {
        match self {
            Resolution::UpdateEvicting { stale_id } | Resolution::ReplaceStale { stale_id } => {
                Some(*stale_id)
            }
            Resolution::Update | Resolution::Insert => None,
        }
    }

    /// Whether the record is written as a new row.
    pub fn inserts(&self) -> bool {
        matches!(self, Resolution::Insert | Resolution::ReplaceStale { .. })
    }
}

/// Resolve one incoming record.
///
/// `found_by_id` is the result of the lookup by ID; `key_owner` the ID of the
/// row currently holding the record's natural key, if any. Kinds without a
/// natural key always pass `None`.
pub fn resolve(incoming_id: Id, found_by_id: bool, key_owner: Option<Id>) -> Resolution {
    let drifted = key_owner.filter(|&owner| owner != incoming_id);

    match (found_by_id, drifted) {
        (true, None) => Resolution::Update,
        (true, Some(stale_id)) => Resolution::UpdateEvicting { stale_id },
        (false, Some(stale_id)) => Resolution::ReplaceStale { stale_id },
        (false, None) => Resolution::Insert,
    }
}

/// Resolve one record of a full incoming collection.
///
/// A natural key held by a row whose ID is also in `batch` is not drift:
/// that row is rewritten under its own key in the same batch, so it is left
/// in place instead of being evicted with its dependents.
pub fn resolve_in_batch(
    incoming_id: Id,
    found_by_id: bool,
    key_owner: Option<Id>,
    batch: &BTreeSet<Id>,
) -> Resolution {
    resolve(
        incoming_id,
        found_by_id,
        key_owner.filter(|owner| !batch.contains(owner)),
    )
}

/// IDs present in the durable store but absent from the incoming full
/// collection. These rows are deleted so deletions propagate.
pub fn orphaned_ids(
    existing: impl IntoIterator<Item = Id>,
    incoming: impl IntoIterator<Item = Id>,
) -> Vec<Id> {
    let incoming: BTreeSet<Id> = incoming.into_iter().collect();
    let mut orphaned: Vec<Id> = existing
        .into_iter()
        .filter(|id| !incoming.contains(id))
        .collect();
    orphaned.sort_unstable();
    orphaned.dedup();
    orphaned
}

/// A stale durable row replaced by the primary store's record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityDrift {
    pub stale_id: Id,
    pub id: Id,
}

/// Outcome of one transactional batch for one kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub kind: EntityKind,
    pub inserted: usize,
    pub updated: usize,
    pub drifted: Vec<IdentityDrift>,
    pub removed: usize,
}

impl BatchReport {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            inserted: 0,
            updated: 0,
            drifted: Vec::new(),
            removed: 0,
        }
    }

    /// Account for one applied resolution.
    pub fn record(&mut self, id: Id, resolution: Resolution) {
        if let Some(stale_id) = resolution.evicted() {
            self.drifted.push(IdentityDrift { stale_id, id });
        }
        if resolution.inserts() {
            self.inserted += 1;
        } else {
            self.updated += 1;
        }
    }

    /// Number of records written.
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}
