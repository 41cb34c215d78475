//! Secondary index derivation.
//!
//! The primary store keeps, next to every record, a set of index entries:
//! membership in the all-IDs set of its kind, an alternate-key lookup for
//! identity-bearing kinds, and foreign-key grouping sets. This module computes
//! those entries from a record so that every backend maintains the same
//! indices, and so that updates and deletes can remove exactly what a previous
//! save added.

use crate::{Entity, EntityKind, Id};
use std::collections::BTreeSet;
use std::fmt;

/// A set-valued index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexSet {
    /// Every ID of a kind.
    All(EntityKind),
    /// Users of a group.
    GroupMembers(Id),
    /// Groups a user belongs to.
    UserGroups(Id),
    /// Tasks owned by a user.
    UserTasks(Id),
    /// Tasks filed under a group.
    GroupTasks(Id),
}

impl IndexSet {
    /// Kind whose records contribute the entries of this set. Membership
    /// edges belong to groups, task groupings to tasks.
    pub fn owner_kind(&self) -> EntityKind {
        match self {
            IndexSet::All(kind) => *kind,
            IndexSet::GroupMembers(_) | IndexSet::UserGroups(_) => EntityKind::Group,
            IndexSet::UserTasks(_) | IndexSet::GroupTasks(_) => EntityKind::Task,
        }
    }

    /// Parse a set name produced by `Display`. Returns `None` for any other
    /// key, including alternate-key lookups that happen to contain colons.
    pub fn parse(name: &str) -> Option<Self> {
        let parts: Vec<&str> = name.split(':').collect();
        match parts.as_slice() {
            [kind, "all"] => kind.parse().ok().map(IndexSet::All),
            [owner, id, set] => {
                let id: Id = id.parse().ok()?;
                match (*owner, *set) {
                    ("group", "members") => Some(IndexSet::GroupMembers(id)),
                    ("user", "groups") => Some(IndexSet::UserGroups(id)),
                    ("user", "tasks") => Some(IndexSet::UserTasks(id)),
                    ("group", "tasks") => Some(IndexSet::GroupTasks(id)),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

impl fmt::Display for IndexSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexSet::All(kind) => write!(f, "{}:all", kind.as_str()),
            IndexSet::GroupMembers(id) => write!(f, "group:{id}:members"),
            IndexSet::UserGroups(id) => write!(f, "user:{id}:groups"),
            IndexSet::UserTasks(id) => write!(f, "user:{id}:tasks"),
            IndexSet::GroupTasks(id) => write!(f, "group:{id}:tasks"),
        }
    }
}

/// One index entry contributed by a record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexEntry {
    /// `id` is a member of `set`.
    Member { set: IndexSet, id: Id },
    /// The natural key `key` of `kind` resolves to `id`.
    Unique { kind: EntityKind, key: String, id: Id },
}

impl IndexEntry {
    fn member(set: IndexSet, id: Id) -> Self {
        IndexEntry::Member { set, id }
    }
}

/// Name of the alternate-key lookup for a natural key.
pub fn unique_key_name(kind: EntityKind, key: &str) -> String {
    match kind {
        EntityKind::User => format!("user:email:{key}"),
        EntityKind::Group => format!("group:name:{key}"),
        EntityKind::Task => format!("task:key:{key}"),
    }
}

/// Common prefix of every alternate-key lookup of a kind.
pub fn unique_key_prefix(kind: EntityKind) -> String {
    unique_key_name(kind, "")
}

/// All index entries a record participates in.
pub fn index_entries(entity: &Entity) -> BTreeSet<IndexEntry> {
    let mut entries = BTreeSet::new();
    let id = entity.id();
    let kind = entity.kind();

    entries.insert(IndexEntry::member(IndexSet::All(kind), id));
    if let Some(key) = entity.natural_key() {
        entries.insert(IndexEntry::Unique { kind, key, id });
    }

    match entity {
        Entity::User(_) => {}
        Entity::Group(group) => {
            for &user_id in &group.member_ids {
                entries.insert(IndexEntry::member(IndexSet::GroupMembers(group.id), user_id));
                entries.insert(IndexEntry::member(IndexSet::UserGroups(user_id), group.id));
            }
        }
        Entity::Task(task) => {
            entries.insert(IndexEntry::member(IndexSet::UserTasks(task.user_id), task.id));
            entries.insert(IndexEntry::member(IndexSet::GroupTasks(task.group_id), task.id));
        }
    }

    entries
}

/// Index changes needed to move from one version of a record to another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexDiff {
    pub added: Vec<IndexEntry>,
    pub removed: Vec<IndexEntry>,
}

impl IndexDiff {
    /// Diff between the previous version (if any) and the next version (if
    /// any). `(Some, None)` describes a delete.
    pub fn between(previous: Option<&Entity>, next: Option<&Entity>) -> Self {
        let before = previous.map(index_entries).unwrap_or_default();
        let after = next.map(index_entries).unwrap_or_default();

        Self {
            added: after.difference(&before).cloned().collect(),
            removed: before.difference(&after).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}
