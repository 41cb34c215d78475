//! Counter reconciliation planning.
//!
//! After a batch lands in the durable store, the primary store's ID counter
//! for that kind must be at least the largest ID the durable store holds.
//! Otherwise the next issued ID could collide with a durable row that was
//! seeded out-of-band or survived a primary-store reset.

use crate::{EntityKind, Id};
use serde::{Deserialize, Serialize};

/// A required counter move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterAdjustment {
    pub kind: EntityKind,
    /// Counter value before the move (last issued ID).
    pub current: Id,
    /// Value the counter must reach.
    pub target: Id,
}

impl CounterAdjustment {
    /// How far the counter lags behind the durable store.
    pub fn gap(&self) -> u64 {
        self.target - self.current
    }

    /// Whether the lag is large enough to alert on.
    pub fn is_alarming(&self, threshold: u64) -> bool {
        self.gap() > threshold
    }
}

/// Plan the counter move for one kind, if one is needed.
pub fn plan_adjustment(kind: EntityKind, current: Id, durable_max: Id) -> Option<CounterAdjustment> {
    (durable_max > current).then_some(CounterAdjustment {
        kind,
        current,
        target: durable_max,
    })
}
