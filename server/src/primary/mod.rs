//! Primary store: the low-latency system of record for live writes.
//!
//! Holds entity records, their secondary indices, one monotonic ID counter
//! per entity kind, the dirty-kind set and the last-sync timestamp. Every
//! write marks its kind dirty in the same step, so the sync service knows the
//! durable store is stale for that kind.

mod memory;
mod redis_store;

pub use self::memory::MemoryPrimaryStore;
pub use self::redis_store::RedisPrimaryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use tandem_engine::{Entity, EntityKind, Id, IndexSet, Timestamp};

use crate::error::StoreResult;

/// Key of the dirty-kind set.
pub const DIRTY_KEY: &str = "sync:dirty";

/// Key of the kinds claimed by the cycle currently pushing them.
pub const IN_FLIGHT_KEY: &str = "sync:in_flight";

/// Key of the last successful sync timestamp.
pub const LAST_SYNC_KEY: &str = "sync:last_sync";

/// Record key for one entity.
pub fn record_key(kind: EntityKind, id: Id) -> String {
    format!("{}:{}", kind.singular(), id)
}

/// Counter key for one kind.
pub fn counter_key(kind: EntityKind) -> String {
    format!("counter:{}", kind.singular())
}

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_millis() -> Timestamp {
    Utc::now().timestamp_millis().max(0) as Timestamp
}

/// Outcome of an index repair pass over one kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// IDs listed in the all-IDs set without a readable record.
    pub dangling_removed: usize,
    /// Records whose index entries were rewritten.
    pub reindexed: usize,
    /// Grouping-set members and alternate-key lookups no readable record
    /// accounts for.
    pub stale_entries_removed: usize,
}

/// Storage contract of the primary store.
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    /// Issue the next ID for a kind. Strictly greater than any ID issued
    /// before, including across restarts.
    async fn next_id(&self, kind: EntityKind) -> StoreResult<Id>;

    /// The last issued ID for a kind (0 if none).
    async fn current_counter(&self, kind: EntityKind) -> StoreResult<Id>;

    /// Raise the counter to at least `at_least`; never lowers it. Returns the
    /// counter value afterwards.
    async fn advance_counter(&self, kind: EntityKind, at_least: Id) -> StoreResult<Id>;

    /// Write a record and every index entry it participates in, dropping
    /// entries the previous version held, and mark its kind dirty.
    async fn save(&self, entity: &Entity) -> StoreResult<()>;

    async fn get(&self, kind: EntityKind, id: Id) -> StoreResult<Option<Entity>>;

    /// Look a record up by its natural key (email or group name).
    async fn get_by_key(&self, kind: EntityKind, key: &str) -> StoreResult<Option<Entity>>;

    /// Every readable record of a kind. Records that cannot be read are
    /// skipped and logged rather than failing the whole read.
    async fn get_all(&self, kind: EntityKind) -> StoreResult<Vec<Entity>>;

    /// Members of a grouping set, e.g. the tasks of a user.
    async fn index_members(&self, set: &IndexSet) -> StoreResult<Vec<Id>>;

    /// Remove a record and all of its index entries, without cascading.
    /// Marks its kind dirty. Returns the removed record, if it was readable.
    async fn remove(&self, kind: EntityKind, id: Id) -> StoreResult<Option<Entity>>;

    async fn mark_dirty(&self, kind: EntityKind) -> StoreResult<()>;

    /// Kinds that are dirty or claimed by a running cycle.
    async fn dirty_types(&self) -> StoreResult<BTreeSet<EntityKind>>;

    /// Drop kinds from both the dirty set and the in-flight set.
    async fn clear_dirty_types(&self, kinds: &[EntityKind]) -> StoreResult<()>;

    /// Atomically move the dirty set into the in-flight set and return the
    /// in-flight kinds. Writes after this call mark the kind dirty again.
    /// Kinds left in flight by an interrupted cycle are returned too.
    async fn take_dirty_types(&self) -> StoreResult<BTreeSet<EntityKind>>;

    /// Return the in-flight kinds to the dirty set after a failed cycle.
    async fn requeue_dirty_types(&self) -> StoreResult<()>;

    /// Forget the in-flight kinds after a successful cycle.
    async fn complete_dirty_types(&self) -> StoreResult<()>;

    async fn last_sync_time(&self) -> StoreResult<Option<DateTime<Utc>>>;

    async fn set_last_sync_time(&self, at: DateTime<Utc>) -> StoreResult<()>;

    /// Ask the store to persist itself to disk.
    async fn persist_snapshot(&self) -> StoreResult<()>;

    /// Drop dangling all-IDs entries and index entries of a kind that no
    /// readable record accounts for, then rewrite the indices of every
    /// readable record of that kind.
    async fn repair_indices(&self, kind: EntityKind) -> StoreResult<RepairReport>;

    /// Delete a record with referential cleanup.
    ///
    /// Deleting a user removes it from every group it belonged to and deletes
    /// its tasks; groups it administered get the lowest remaining member as
    /// admin, or are deleted when no member remains. Deleting a group deletes
    /// its tasks. Returns `false` if the record did not exist.
    async fn delete(&self, kind: EntityKind, id: Id) -> StoreResult<bool> {
        let Some(entity) = self.get(kind, id).await? else {
            return Ok(false);
        };

        match &entity {
            Entity::User(user) => {
                for task_id in self.index_members(&IndexSet::UserTasks(user.id)).await? {
                    self.remove(EntityKind::Task, task_id).await?;
                }

                for group_id in self.index_members(&IndexSet::UserGroups(user.id)).await? {
                    let Some(Entity::Group(mut group)) =
                        self.get(EntityKind::Group, group_id).await?
                    else {
                        continue;
                    };
                    group.member_ids.remove(&user.id);

                    if group.admin_id == user.id {
                        match group.member_ids.first().copied() {
                            Some(successor) => group.admin_id = successor,
                            None => {
                                self.delete(EntityKind::Group, group.id).await?;
                                continue;
                            }
                        }
                    }
                    group.updated_at = now_millis();
                    self.save(&Entity::Group(group)).await?;
                }
            }
            Entity::Group(group) => {
                for task_id in self.index_members(&IndexSet::GroupTasks(group.id)).await? {
                    self.remove(EntityKind::Task, task_id).await?;
                }
            }
            Entity::Task(_) => {}
        }

        self.remove(kind, id).await?;
        tracing::debug!(kind = %kind, id, "Deleted record with cascade");
        Ok(true)
    }
}
