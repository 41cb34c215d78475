//! In-process primary store.
//!
//! Mirrors the Redis layout with concurrent maps: serialized records, index
//! sets, alternate-key lookups and counters. Records are kept serialized so
//! unreadable entries behave exactly as they do in Redis. Used for tests and
//! embedded single-process deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use tandem_engine::{
    index_entries, normalize_group_name, unique_key_name, unique_key_prefix, Entity, EntityKind,
    Id, IndexDiff, IndexEntry, IndexSet,
};

use super::{record_key, PrimaryStore, RepairReport};
use crate::error::{StoreError, StoreResult};

/// Primary store held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryPrimaryStore {
    records: DashMap<(EntityKind, Id), String>,
    sets: DashMap<IndexSet, BTreeSet<Id>>,
    unique: DashMap<String, Id>,
    counters: DashMap<EntityKind, Id>,
    dirty: Mutex<DirtySets>,
    last_sync: RwLock<Option<DateTime<Utc>>>,
    /// Serializes multi-map writes so a record and its indices change together.
    write_lock: Mutex<()>,
    snapshots: AtomicUsize,
}

/// Kinds awaiting a cycle and kinds claimed by the running one.
#[derive(Debug, Default)]
struct DirtySets {
    pending: BTreeSet<EntityKind>,
    in_flight: BTreeSet<EntityKind>,
}

impl DirtySets {
    fn mark(&mut self, kind: EntityKind) {
        self.pending.insert(kind);
    }

    fn union(&self) -> BTreeSet<EntityKind> {
        self.pending.union(&self.in_flight).copied().collect()
    }
}

impl MemoryPrimaryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a raw value under a record key and list it in the all-IDs set,
    /// bypassing validation. Used to simulate damaged records.
    pub fn insert_raw(&self, kind: EntityKind, id: Id, raw: impl Into<String>) {
        let _write = self.write_guard();
        self.records.insert((kind, id), raw.into());
        self.sets.entry(IndexSet::All(kind)).or_default().insert(id);
    }

    /// List an ID in the all-IDs set without a record behind it.
    pub fn insert_dangling_id(&self, kind: EntityKind, id: Id) {
        self.sets.entry(IndexSet::All(kind)).or_default().insert(id);
    }

    /// Write one index entry without a record behind it.
    pub fn insert_index_entry(&self, entry: &IndexEntry) {
        let _write = self.write_guard();
        self.add_entry(entry);
    }

    /// Number of times [`PrimaryStore::persist_snapshot`] was called.
    pub fn snapshot_count(&self) -> usize {
        self.snapshots.load(Ordering::SeqCst)
    }

    fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dirty_guard(&self) -> MutexGuard<'_, DirtySets> {
        self.dirty.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_record(&self, kind: EntityKind, id: Id) -> Option<serde_json::Result<Entity>> {
        self.records
            .get(&(kind, id))
            .map(|raw| Entity::from_json(kind, raw.value()))
    }

    fn apply_diff(&self, kind: EntityKind, diff: &IndexDiff) {
        for entry in &diff.removed {
            match entry {
                IndexEntry::Member { set, id } => self.remove_member(set, *id),
                IndexEntry::Unique { key, id, .. } => {
                    self.unique
                        .remove_if(&unique_key_name(kind, key), |_, owner| owner == id);
                }
            }
        }
        for entry in &diff.added {
            self.add_entry(entry);
        }
    }

    fn add_entry(&self, entry: &IndexEntry) {
        match entry {
            IndexEntry::Member { set, id } => {
                self.sets.entry(set.clone()).or_default().insert(*id);
            }
            IndexEntry::Unique { kind, key, id } => {
                self.unique.insert(unique_key_name(*kind, key), *id);
            }
        }
    }

    fn remove_member(&self, set: &IndexSet, id: Id) {
        let now_empty = match self.sets.get_mut(set) {
            Some(mut members) => {
                members.remove(&id);
                members.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.sets.remove_if(set, |_, members| members.is_empty());
        }
    }

    fn lookup_key(kind: EntityKind, key: &str) -> String {
        match kind {
            EntityKind::Group => unique_key_name(kind, &normalize_group_name(key)),
            _ => unique_key_name(kind, key),
        }
    }
}

#[async_trait]
impl PrimaryStore for MemoryPrimaryStore {
    async fn next_id(&self, kind: EntityKind) -> StoreResult<Id> {
        let mut counter = self.counters.entry(kind).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn current_counter(&self, kind: EntityKind) -> StoreResult<Id> {
        Ok(self.counters.get(&kind).map(|c| *c).unwrap_or(0))
    }

    async fn advance_counter(&self, kind: EntityKind, at_least: Id) -> StoreResult<Id> {
        let mut counter = self.counters.entry(kind).or_insert(0);
        if *counter < at_least {
            *counter = at_least;
        }
        Ok(*counter)
    }

    async fn save(&self, entity: &Entity) -> StoreResult<()> {
        entity.validate()?;
        let kind = entity.kind();
        let id = entity.id();
        let json = entity.to_json()?;

        let _write = self.write_guard();

        if let Some(key) = entity.natural_key() {
            if let Some(owner) = self.unique.get(&unique_key_name(kind, &key)).map(|o| *o) {
                if owner != id {
                    return Err(StoreError::DuplicateKey { kind, key, owner });
                }
            }
        }

        let previous = self.read_record(kind, id).and_then(Result::ok);
        let diff = IndexDiff::between(previous.as_ref(), Some(entity));
        self.apply_diff(kind, &diff);
        self.records.insert((kind, id), json);
        self.dirty_guard().mark(kind);
        Ok(())
    }

    async fn get(&self, kind: EntityKind, id: Id) -> StoreResult<Option<Entity>> {
        self.read_record(kind, id)
            .transpose()
            .map_err(StoreError::from)
    }

    async fn get_by_key(&self, kind: EntityKind, key: &str) -> StoreResult<Option<Entity>> {
        let owner = self.unique.get(&Self::lookup_key(kind, key)).map(|o| *o);
        match owner {
            Some(id) => self.get(kind, id).await,
            None => Ok(None),
        }
    }

    async fn get_all(&self, kind: EntityKind) -> StoreResult<Vec<Entity>> {
        let ids = self.index_members(&IndexSet::All(kind)).await?;
        let mut entities = Vec::with_capacity(ids.len());

        for id in ids {
            match self.read_record(kind, id) {
                Some(Ok(entity)) => entities.push(entity),
                Some(Err(e)) => {
                    tracing::warn!(key = %record_key(kind, id), error = %e, "Skipping unreadable record");
                }
                None => {
                    tracing::warn!(key = %record_key(kind, id), "Skipping dangling index entry");
                }
            }
        }

        Ok(entities)
    }

    async fn index_members(&self, set: &IndexSet) -> StoreResult<Vec<Id>> {
        Ok(self
            .sets
            .get(set)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn remove(&self, kind: EntityKind, id: Id) -> StoreResult<Option<Entity>> {
        let _write = self.write_guard();

        let previous = match self.records.remove(&(kind, id)) {
            Some((_, raw)) => match Entity::from_json(kind, &raw) {
                Ok(entity) => Some(entity),
                Err(e) => {
                    tracing::warn!(
                        key = %record_key(kind, id),
                        error = %e,
                        "Removed unreadable record, its index entries remain until repair"
                    );
                    None
                }
            },
            None => None,
        };
        let diff = IndexDiff::between(previous.as_ref(), None);
        self.apply_diff(kind, &diff);
        self.remove_member(&IndexSet::All(kind), id);
        self.dirty_guard().mark(kind);

        Ok(previous)
    }

    async fn mark_dirty(&self, kind: EntityKind) -> StoreResult<()> {
        self.dirty_guard().mark(kind);
        Ok(())
    }

    async fn dirty_types(&self) -> StoreResult<BTreeSet<EntityKind>> {
        Ok(self.dirty_guard().union())
    }

    async fn clear_dirty_types(&self, kinds: &[EntityKind]) -> StoreResult<()> {
        let mut dirty = self.dirty_guard();
        for kind in kinds {
            dirty.pending.remove(kind);
            dirty.in_flight.remove(kind);
        }
        Ok(())
    }

    async fn take_dirty_types(&self) -> StoreResult<BTreeSet<EntityKind>> {
        let mut dirty = self.dirty_guard();
        let pending = std::mem::take(&mut dirty.pending);
        dirty.in_flight.extend(pending);
        Ok(dirty.in_flight.clone())
    }

    async fn requeue_dirty_types(&self) -> StoreResult<()> {
        let mut dirty = self.dirty_guard();
        let in_flight = std::mem::take(&mut dirty.in_flight);
        dirty.pending.extend(in_flight);
        Ok(())
    }

    async fn complete_dirty_types(&self) -> StoreResult<()> {
        self.dirty_guard().in_flight.clear();
        Ok(())
    }

    async fn last_sync_time(&self) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(*self.last_sync.read().unwrap_or_else(PoisonError::into_inner))
    }

    async fn set_last_sync_time(&self, at: DateTime<Utc>) -> StoreResult<()> {
        *self.last_sync.write().unwrap_or_else(PoisonError::into_inner) = Some(at);
        Ok(())
    }

    async fn persist_snapshot(&self) -> StoreResult<()> {
        self.snapshots.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("In-memory primary store snapshot requested");
        Ok(())
    }

    async fn repair_indices(&self, kind: EntityKind) -> StoreResult<RepairReport> {
        let _write = self.write_guard();
        let mut report = RepairReport::default();

        let listed: Vec<Id> = self
            .sets
            .get(&IndexSet::All(kind))
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default();
        for id in listed {
            if !matches!(self.read_record(kind, id), Some(Ok(_))) {
                self.remove_member(&IndexSet::All(kind), id);
                report.dangling_removed += 1;
            }
        }

        let entities: Vec<Entity> = self
            .records
            .iter()
            .filter(|entry| entry.key().0 == kind)
            .filter_map(|entry| Entity::from_json(kind, entry.value()).ok())
            .collect();
        let expected: BTreeSet<IndexEntry> = entities.iter().flat_map(index_entries).collect();

        let stale_members: Vec<(IndexSet, Id)> = self
            .sets
            .iter()
            .filter(|set| set.key().owner_kind() == kind && !matches!(set.key(), IndexSet::All(_)))
            .flat_map(|set| {
                let name = set.key().clone();
                set.value()
                    .iter()
                    .map(move |&id| (name.clone(), id))
                    .collect::<Vec<_>>()
            })
            .filter(|(set, id)| {
                !expected.contains(&IndexEntry::Member {
                    set: set.clone(),
                    id: *id,
                })
            })
            .collect();
        for (set, id) in &stale_members {
            tracing::debug!(set = %set, id, "Removing stale index member");
            self.remove_member(set, *id);
        }

        let owners: BTreeMap<String, Id> = expected
            .iter()
            .filter_map(|entry| match entry {
                IndexEntry::Unique { kind, key, id } => Some((unique_key_name(*kind, key), *id)),
                IndexEntry::Member { .. } => None,
            })
            .collect();
        let prefix = unique_key_prefix(kind);
        let stale_keys: Vec<String> = self
            .unique
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .filter(|entry| owners.get(entry.key()) != Some(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();
        for key in &stale_keys {
            tracing::debug!(key = %key, "Removing stale alternate key");
            self.unique.remove(key);
        }
        report.stale_entries_removed = stale_members.len() + stale_keys.len();

        for entry in &expected {
            self.add_entry(entry);
        }
        report.reindexed = entities.len();

        Ok(report)
    }
}
