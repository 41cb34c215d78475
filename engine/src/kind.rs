//! Entity kinds and the order in which they are reconciled.
//!
//! Dirty tracking works at the granularity of a kind: one mutation marks the
//! whole kind dirty and the next cycle resynchronizes the full collection.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// The synchronized entity types.
///
/// Variant order is the dependency order used by a reconciliation cycle:
/// tasks reference users and groups, so they always come last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    #[serde(rename = "users")]
    User,
    #[serde(rename = "groups")]
    Group,
    #[serde(rename = "tasks")]
    Task,
}

impl EntityKind {
    /// Every kind, in sync order.
    pub const ALL: [EntityKind; 3] = [EntityKind::User, EntityKind::Group, EntityKind::Task];

    /// Collection name, used for dirty-set members and table names.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "users",
            EntityKind::Group => "groups",
            EntityKind::Task => "tasks",
        }
    }

    /// Singular name, used as the record key prefix.
    pub fn singular(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Group => "group",
            EntityKind::Task => "task",
        }
    }

    /// Whether records of this kind carry a natural unique key
    /// (email for users, name for groups).
    pub fn has_natural_key(&self) -> bool {
        matches!(self, EntityKind::User | EntityKind::Group)
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
        match s {
            "users" | "user" => Ok(EntityKind::User),
            "groups" | "group" => Ok(EntityKind::Group),
            "tasks" | "task" => Ok(EntityKind::Task),
            other => Err(Error::UnknownEntityKind(other.to_string())),
        }
    }
}

/// Kinds to push in one cycle, in dependency order.
///
/// Returns `None` when nothing is dirty, in which case the cycle is skipped
/// without touching either store.
pub fn sync_plan<'a>(dirty: impl IntoIterator<Item = &'a EntityKind>) -> Option<Vec<EntityKind>> {
    let ordered: BTreeSet<EntityKind> = dirty.into_iter().copied().collect();
    if ordered.is_empty() {
        None
    } else {
        Some(ordered.into_iter().collect())
    }
}
