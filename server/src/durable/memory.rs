//! In-process durable store.
//!
//! Behaves like the PostgreSQL schema: one row per ID, natural keys unique at
//! commit, foreign keys from tasks and memberships, cascading deletes. A batch is
//! applied to a staged copy of the tables and swapped in only when every
//! record succeeded, which gives the same all-or-nothing result as a
//! rolled-back transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use tandem_engine::{
    orphaned_ids, resolve_in_batch, BatchReport, Entity, EntityKind, Error, Id,
};

use super::DurableStore;
use crate::error::{StoreError, StoreResult};

/// Durable-side bookkeeping kept next to each row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowMeta {
    /// When the row was first written. Preserved by updates.
    pub first_synced_at: DateTime<Utc>,
    pub last_synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Row {
    entity: Entity,
    meta: RowMeta,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    rows: BTreeMap<(EntityKind, Id), Row>,
}

impl Tables {
    fn contains(&self, kind: EntityKind, id: Id) -> bool {
        self.rows.contains_key(&(kind, id))
    }

    fn ids(&self, kind: EntityKind) -> Vec<Id> {
        self.rows
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, id)| *id)
            .collect()
    }

    /// Row outside `batch` holding a natural key.
    fn key_owner(&self, kind: EntityKind, key: &str, batch: &BTreeSet<Id>) -> Option<Id> {
        self.rows
            .iter()
            .filter(|((k, id), _)| *k == kind && !batch.contains(id))
            .find(|(_, row)| row.entity.natural_key().as_deref() == Some(key))
            .map(|((_, id), _)| *id)
    }

    /// Fails on the first natural key held by two rows of a kind.
    fn check_unique_keys(&self, kind: EntityKind) -> StoreResult<()> {
        let mut owners: BTreeMap<String, Id> = BTreeMap::new();
        for ((k, id), row) in &self.rows {
            let Some(key) = row.entity.natural_key().filter(|_| *k == kind) else {
                continue;
            };
            if let Some(&owner) = owners.get(&key) {
                return Err(StoreError::DuplicateKey { kind, key, owner });
            }
            owners.insert(key, *id);
        }
        Ok(())
    }

    fn check_references(&self, entity: &Entity) -> StoreResult<()> {
        let missing = |target: EntityKind, target_id: Id| StoreError::MissingReference {
            kind: entity.kind(),
            id: entity.id(),
            target,
            target_id,
        };

        match entity {
            Entity::User(_) => Ok(()),
            Entity::Group(group) => {
                match group
                    .member_ids
                    .iter()
                    .find(|&&user_id| !self.contains(EntityKind::User, user_id))
                {
                    Some(&user_id) => Err(missing(EntityKind::User, user_id)),
                    None => Ok(()),
                }
            }
            Entity::Task(task) => {
                if !self.contains(EntityKind::User, task.user_id) {
                    return Err(missing(EntityKind::User, task.user_id));
                }
                if !self.contains(EntityKind::Group, task.group_id) {
                    return Err(missing(EntityKind::Group, task.group_id));
                }
                Ok(())
            }
        }
    }

    fn write(&mut self, entity: &Entity, now: DateTime<Utc>) {
        let key = (entity.kind(), entity.id());
        let first_synced_at = self
            .rows
            .get(&key)
            .map(|row| row.meta.first_synced_at)
            .unwrap_or(now);

        self.rows.insert(
            key,
            Row {
                entity: entity.clone(),
                meta: RowMeta {
                    first_synced_at,
                    last_synced_at: now,
                },
            },
        );
    }

    /// Delete a row and everything that references it.
    fn delete_cascade(&mut self, kind: EntityKind, id: Id) -> bool {
        if self.rows.remove(&(kind, id)).is_none() {
            return false;
        }

        match kind {
            EntityKind::User => {
                self.rows.retain(|_, row| match &row.entity {
                    Entity::Task(task) => task.user_id != id,
                    _ => true,
                });
                for row in self.rows.values_mut() {
                    if let Entity::Group(group) = &mut row.entity {
                        group.member_ids.remove(&id);
                    }
                }
            }
            EntityKind::Group => {
                self.rows.retain(|_, row| match &row.entity {
                    Entity::Task(task) => task.group_id != id,
                    _ => true,
                });
            }
            EntityKind::Task => {}
        }
        true
    }
}

/// Durable store held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryDurableStore {
    tables: RwLock<Tables>,
    failures: Mutex<BTreeSet<(EntityKind, Id)>>,
    commits: AtomicUsize,
}

impl MemoryDurableStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row directly, as an out-of-band writer would, without
    /// conflict resolution.
    pub fn seed(&self, entity: impl Into<Entity>) {
        let entity = entity.into();
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .write(&entity, Utc::now());
    }

    /// Make every batch that contains this record fail.
    pub fn fail_record(&self, kind: EntityKind, id: Id) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((kind, id));
    }

    pub fn clear_failures(&self) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of committed write transactions.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn get(&self, kind: EntityKind, id: Id) -> Option<Entity> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .rows
            .get(&(kind, id))
            .map(|row| row.entity.clone())
    }

    pub fn row_meta(&self, kind: EntityKind, id: Id) -> Option<RowMeta> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .rows
            .get(&(kind, id))
            .map(|row| row.meta)
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    async fn sync_collection(
        &self,
        kind: EntityKind,
        records: &[Entity],
    ) -> StoreResult<BatchReport> {
        let failures = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let mut staged = tables.clone();
        let now = Utc::now();
        let mut report = BatchReport::new(kind);
        let batch: BTreeSet<Id> = records.iter().map(Entity::id).collect();

        for entity in records {
            if entity.kind() != kind {
                return Err(Error::KindMismatch {
                    expected: kind,
                    actual: entity.kind(),
                }
                .into());
            }
            entity.validate()?;

            let id = entity.id();
            if failures.contains(&(kind, id)) {
                return Err(StoreError::Injected { kind, id });
            }

            let found_by_id = staged.contains(kind, id);
            let key_owner = entity
                .natural_key()
                .and_then(|key| staged.key_owner(kind, &key, &batch));
            let resolution = resolve_in_batch(id, found_by_id, key_owner, &batch);

            if let Some(stale_id) = resolution.evicted() {
                staged.delete_cascade(kind, stale_id);
            }
            staged.check_references(entity)?;
            staged.write(entity, now);
            report.record(id, resolution);
        }

        let orphans = orphaned_ids(staged.ids(kind), records.iter().map(Entity::id));
        for id in orphans {
            if staged.delete_cascade(kind, id) {
                report.removed += 1;
            }
        }
        staged.check_unique_keys(kind)?;

        *tables = staged;
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(report)
    }

    async fn get_all(&self, kind: EntityKind) -> StoreResult<Vec<Entity>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables
            .rows
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, row)| row.entity.clone())
            .collect())
    }

    async fn max_id(&self, kind: EntityKind) -> StoreResult<Id> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables.ids(kind).into_iter().max().unwrap_or(0))
    }

    async fn delete(&self, kind: EntityKind, id: Id) -> StoreResult<bool> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let deleted = tables.delete_cascade(kind, id);
        if deleted {
            self.commits.fetch_add(1, Ordering::SeqCst);
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_engine::{Group, Task, User};

    #[tokio::test]
    async fn batch_inserts_then_updates() {
        let store = MemoryDurableStore::new();
        let users: Vec<Entity> = vec![
            User::new(1, "a@x.com", "A", 1).into(),
            User::new(2, "b@x.com", "B", 1).into(),
        ];

        let report = store.sync_collection(EntityKind::User, &users).await.unwrap();
        assert_eq!(report.inserted, 2);
        let first = store.row_meta(EntityKind::User, 1).unwrap();

        let renamed: Vec<Entity> = vec![
            User::new(1, "a@x.com", "Alice", 2).into(),
            User::new(2, "b@x.com", "B", 1).into(),
        ];
        let report = store.sync_collection(EntityKind::User, &renamed).await.unwrap();
        assert_eq!(report.updated, 2);
        assert_eq!(report.inserted, 0);

        let stored = store.get(EntityKind::User, 1).unwrap();
        assert_eq!(stored.as_user().unwrap().name, "Alice");
        assert_eq!(
            store.row_meta(EntityKind::User, 1).unwrap().first_synced_at,
            first.first_synced_at
        );
    }

    #[tokio::test]
    async fn missing_reference_rolls_back_batch() {
        let store = MemoryDurableStore::new();
        store.seed(User::new(1, "a@x.com", "A", 1));
        store.seed(Group::new(2, "Ops", 1, 1));

        let tasks: Vec<Entity> = vec![
            Task::new(10, "ok", 1, 2, 1).into(),
            Task::new(11, "orphan", 99, 2, 1).into(),
        ];
        let err = store
            .sync_collection(EntityKind::Task, &tasks)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::MissingReference {
                target: EntityKind::User,
                target_id: 99,
                ..
            }
        ));
        assert!(store.get(EntityKind::Task, 10).is_none());
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn deleting_user_cascades() {
        let store = MemoryDurableStore::new();
        store.seed(User::new(1, "a@x.com", "A", 1));
        store.seed(User::new(2, "b@x.com", "B", 1));
        store.seed(Group::new(3, "Ops", 2, 1).with_members([1]));
        store.seed(Task::new(4, "t", 1, 3, 1));

        assert!(store.delete(EntityKind::User, 1).await.unwrap());
        assert!(store.get(EntityKind::Task, 4).is_none());
        let group = store.get(EntityKind::Group, 3).unwrap();
        assert!(!group.as_group().unwrap().member_ids.contains(&1));
        assert!(!store.delete(EntityKind::User, 1).await.unwrap());
    }

    #[tokio::test]
    async fn rejects_records_of_other_kind() {
        let store = MemoryDurableStore::new();
        let records: Vec<Entity> = vec![User::new(1, "a@x.com", "A", 1).into()];
        let err = store
            .sync_collection(EntityKind::Group, &records)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Engine(Error::KindMismatch { .. })));
    }

    #[tokio::test]
    async fn keys_can_swap_within_one_batch() {
        let store = MemoryDurableStore::new();
        store.seed(User::new(1, "a@x.com", "A", 1));
        store.seed(User::new(2, "b@x.com", "B", 1));
        store.seed(Task::new(4, "t", 2, 3, 1));

        let swapped: Vec<Entity> = vec![
            User::new(1, "b@x.com", "A", 2).into(),
            User::new(2, "a@x.com", "B", 2).into(),
        ];
        let report = store.sync_collection(EntityKind::User, &swapped).await.unwrap();
        assert_eq!(report.updated, 2);
        assert!(report.drifted.is_empty());
        assert_eq!(
            store.get(EntityKind::User, 2).unwrap().as_user().unwrap().email,
            "a@x.com"
        );
        assert!(store.get(EntityKind::Task, 4).is_some());
    }

    #[tokio::test]
    async fn duplicate_keys_in_one_batch_roll_back() {
        let store = MemoryDurableStore::new();
        let users: Vec<Entity> = vec![
            User::new(1, "a@x.com", "A", 1).into(),
            User::new(2, "a@x.com", "B", 1).into(),
        ];
        let err = store
            .sync_collection(EntityKind::User, &users)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { owner: 1, .. }));
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn max_id_of_empty_kind_is_zero() {
        let store = MemoryDurableStore::new();
        assert_eq!(store.max_id(EntityKind::Task).await.unwrap(), 0);
        store.seed(User::new(7, "a@x.com", "A", 1));
        assert_eq!(store.max_id(EntityKind::User).await.unwrap(), 7);
    }
}
