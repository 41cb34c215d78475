//! Integration tests for the sync service.
//!
//! These run against the in-memory store backends, so no Redis or
//! PostgreSQL instance is needed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tandem_engine::{Entity, EntityKind, Group, Id, IdentityDrift, IndexSet, Task, User};
use tandem_server::durable::{DurableStore, MemoryDurableStore};
use tandem_server::error::{StoreResult, SyncError};
use tandem_server::primary::{MemoryPrimaryStore, PrimaryStore, RepairReport};
use tandem_server::sync::{CycleOutcome, SyncService, SyncSettings};

struct Harness {
    primary: Arc<MemoryPrimaryStore>,
    durable: Arc<MemoryDurableStore>,
    service: Arc<SyncService>,
}

fn harness_with_interval(interval: Duration) -> Harness {
    let primary = Arc::new(MemoryPrimaryStore::new());
    let durable = Arc::new(MemoryDurableStore::new());
    let settings = SyncSettings {
        interval,
        ..SyncSettings::default()
    };
    let service = Arc::new(SyncService::new(
        primary.clone(),
        durable.clone(),
        settings,
    ));
    Harness {
        primary,
        durable,
        service,
    }
}

fn harness() -> Harness {
    harness_with_interval(Duration::from_secs(30))
}

async fn save(primary: &MemoryPrimaryStore, entity: impl Into<Entity>) {
    primary.save(&entity.into()).await.unwrap();
}

/// Users 1 and 2, group 3 administered by 1 with both as members, and tasks
/// 4 (user 2) and 5 (user 1), all in group 3.
async fn seed_team(primary: &MemoryPrimaryStore) {
    for _ in 0..2 {
        primary.next_id(EntityKind::User).await.unwrap();
    }
    save(primary, User::new(1, "ada@example.com", "Ada", 1)).await;
    save(primary, User::new(2, "bob@example.com", "Bob", 1)).await;

    primary.advance_counter(EntityKind::Group, 3).await.unwrap();
    save(primary, Group::new(3, "Platform", 1, 1).with_members([2])).await;

    primary.advance_counter(EntityKind::Task, 5).await.unwrap();
    save(primary, Task::new(4, "Rotate keys", 2, 3, 1)).await;
    save(primary, Task::new(5, "Write runbook", 1, 3, 1)).await;
}

async fn assert_converged(primary: &MemoryPrimaryStore, durable: &MemoryDurableStore) {
    for kind in EntityKind::ALL {
        assert_eq!(
            primary.get_all(kind).await.unwrap(),
            durable.get_all(kind).await.unwrap(),
            "{kind} diverged"
        );
    }
}

// ============================================================================
// Forward Reconciliation
// ============================================================================

#[tokio::test]
async fn cycle_converges_both_stores() {
    let h = harness();
    seed_team(&h.primary).await;

    let outcome = h.service.force_sync_now().await.unwrap();
    let report = outcome.report().unwrap();
    assert_eq!(report.kinds, EntityKind::ALL.to_vec());
    assert_eq!(report.batches.iter().map(|b| b.written()).sum::<usize>(), 5);

    assert_converged(&h.primary, &h.durable).await;
    assert!(h.primary.dirty_types().await.unwrap().is_empty());
    assert!(h.primary.last_sync_time().await.unwrap().is_some());
}

#[tokio::test]
async fn clean_store_skips_cycle() {
    let h = harness();
    seed_team(&h.primary).await;
    h.service.force_sync_now().await.unwrap();

    let commits = h.durable.commit_count();
    let stamped = h.primary.last_sync_time().await.unwrap();

    let outcome = h.service.force_sync_now().await.unwrap();
    assert!(outcome.is_skipped());
    assert_eq!(h.durable.commit_count(), commits);
    assert_eq!(h.primary.last_sync_time().await.unwrap(), stamped);
    assert!(h.primary.dirty_types().await.unwrap().is_empty());
}

#[tokio::test]
async fn only_dirty_kinds_are_synced() {
    let h = harness();
    seed_team(&h.primary).await;
    h.service.force_sync_now().await.unwrap();

    save(&h.primary, User::new(2, "bob@example.com", "Robert", 2)).await;
    let outcome = h.service.force_sync_now().await.unwrap();
    assert_eq!(outcome.report().unwrap().kinds, vec![EntityKind::User]);

    let bob = h.durable.get(EntityKind::User, 2).unwrap();
    assert_eq!(bob.as_user().unwrap().name, "Robert");
}

#[tokio::test]
async fn drifted_identity_replaces_stale_durable_row() {
    let h = harness();
    h.durable.seed(User::new(9, "ada@example.com", "Ada (old)", 1));
    h.durable.seed(User::new(8, "eve@example.com", "Eve", 1));
    h.durable.seed(Group::new(20, "Legacy", 8, 1).with_members([9]));
    h.durable.seed(Task::new(30, "Old task", 9, 20, 1));

    save(&h.primary, User::new(5, "ada@example.com", "Ada", 2)).await;
    save(&h.primary, User::new(8, "eve@example.com", "Eve", 1)).await;

    let outcome = h.service.force_sync_now().await.unwrap();
    let batch = &outcome.report().unwrap().batches[0];
    assert_eq!(batch.drifted, vec![IdentityDrift { stale_id: 9, id: 5 }]);

    assert!(h.durable.get(EntityKind::User, 9).is_none());
    assert!(h.durable.get(EntityKind::Task, 30).is_none());
    let legacy = h.durable.get(EntityKind::Group, 20).unwrap();
    assert!(!legacy.as_group().unwrap().member_ids.contains(&9));

    let ada = h.durable.get(EntityKind::User, 5).unwrap();
    assert_eq!(ada.as_user().unwrap().email, "ada@example.com");
}

#[tokio::test]
async fn counter_catches_up_with_durable_maximum() {
    let h = harness();
    for id in 1..=3 {
        assert_eq!(h.primary.next_id(EntityKind::User).await.unwrap(), id);
        save(&h.primary, User::new(id, format!("u{id}@example.com"), "U", 1)).await;
    }
    // Restored out of band without touching the counter.
    save(&h.primary, User::new(10, "late@example.com", "Late", 1)).await;

    let outcome = h.service.force_sync_now().await.unwrap();
    let adjustments = &outcome.report().unwrap().counter_adjustments;
    assert_eq!(adjustments.len(), 1);
    assert_eq!((adjustments[0].current, adjustments[0].target), (3, 10));

    assert_eq!(h.primary.next_id(EntityKind::User).await.unwrap(), 11);
}

#[tokio::test]
async fn cascading_delete_propagates() {
    let h = harness();
    seed_team(&h.primary).await;
    h.service.force_sync_now().await.unwrap();

    assert!(h.primary.delete(EntityKind::User, 1).await.unwrap());

    assert!(h.primary.get(EntityKind::Task, 5).await.unwrap().is_none());
    assert!(h
        .primary
        .index_members(&IndexSet::UserTasks(1))
        .await
        .unwrap()
        .is_empty());
    assert!(h
        .primary
        .index_members(&IndexSet::UserGroups(1))
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        h.primary
            .index_members(&IndexSet::GroupMembers(3))
            .await
            .unwrap(),
        vec![2]
    );
    let group = h.primary.get(EntityKind::Group, 3).await.unwrap().unwrap();
    assert_eq!(group.as_group().unwrap().admin_id, 2);

    h.service.force_sync_now().await.unwrap();
    assert!(h.durable.get(EntityKind::User, 1).is_none());
    assert!(h.durable.get(EntityKind::Task, 5).is_none());
    assert!(h.durable.get(EntityKind::Task, 4).is_some());
    assert_converged(&h.primary, &h.durable).await;
}

#[tokio::test]
async fn deleting_last_member_deletes_group() {
    let h = harness();
    save(&h.primary, User::new(1, "solo@example.com", "Solo", 1)).await;
    save(&h.primary, Group::new(2, "Solo Team", 1, 1)).await;
    save(&h.primary, Task::new(3, "Alone", 1, 2, 1)).await;

    assert!(h.primary.delete(EntityKind::User, 1).await.unwrap());
    assert!(h.primary.get(EntityKind::Group, 2).await.unwrap().is_none());
    assert!(h
        .primary
        .get_by_key(EntityKind::Group, "solo team")
        .await
        .unwrap()
        .is_none());
    assert!(h
        .primary
        .index_members(&IndexSet::GroupTasks(2))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn swapped_emails_keep_dependents() {
    let h = harness();
    seed_team(&h.primary).await;
    h.service.force_sync_now().await.unwrap();

    save(&h.primary, User::new(1, "carol@example.com", "Ada", 2)).await;
    save(&h.primary, User::new(2, "ada@example.com", "Bob", 2)).await;
    save(&h.primary, User::new(1, "bob@example.com", "Ada", 3)).await;

    let outcome = h.service.force_sync_now().await.unwrap();
    let batch = &outcome.report().unwrap().batches[0];
    assert_eq!(batch.updated, 2);
    assert!(batch.drifted.is_empty());

    assert!(h.durable.get(EntityKind::Task, 4).is_some());
    let group = h.durable.get(EntityKind::Group, 3).unwrap();
    assert!(group.as_group().unwrap().member_ids.contains(&2));
    assert_converged(&h.primary, &h.durable).await;
}

#[tokio::test]
async fn write_during_pull_is_synced_next_cycle() {
    let primary = Arc::new(MemoryPrimaryStore::new());
    let durable = Arc::new(MemoryDurableStore::new());
    let racing = Arc::new(SaveAfterFirstPull {
        inner: primary.clone(),
        pending: Mutex::new(Some(User::new(2, "b@example.com", "B", 2).into())),
    });
    let service = SyncService::new(racing, durable.clone(), SyncSettings::default());
    save(&primary, User::new(1, "a@example.com", "A", 1)).await;

    service.force_sync_now().await.unwrap();
    assert!(durable.get(EntityKind::User, 1).is_some());
    assert!(durable.get(EntityKind::User, 2).is_none());
    assert_eq!(
        primary.dirty_types().await.unwrap(),
        BTreeSet::from([EntityKind::User])
    );

    service.force_sync_now().await.unwrap();
    assert!(durable.get(EntityKind::User, 2).is_some());
    assert!(primary.dirty_types().await.unwrap().is_empty());
}

/// Saves one record right after the first full read of its kind, as a
/// client write racing a cycle would.
struct SaveAfterFirstPull {
    inner: Arc<MemoryPrimaryStore>,
    pending: Mutex<Option<Entity>>,
}

#[async_trait]
impl PrimaryStore for SaveAfterFirstPull {
    async fn next_id(&self, kind: EntityKind) -> StoreResult<Id> {
        self.inner.next_id(kind).await
    }

    async fn current_counter(&self, kind: EntityKind) -> StoreResult<Id> {
        self.inner.current_counter(kind).await
    }

    async fn advance_counter(&self, kind: EntityKind, at_least: Id) -> StoreResult<Id> {
        self.inner.advance_counter(kind, at_least).await
    }

    async fn save(&self, entity: &Entity) -> StoreResult<()> {
        self.inner.save(entity).await
    }

    async fn get(&self, kind: EntityKind, id: Id) -> StoreResult<Option<Entity>> {
        self.inner.get(kind, id).await
    }

    async fn get_by_key(&self, kind: EntityKind, key: &str) -> StoreResult<Option<Entity>> {
        self.inner.get_by_key(kind, key).await
    }

    async fn get_all(&self, kind: EntityKind) -> StoreResult<Vec<Entity>> {
        let records = self.inner.get_all(kind).await?;
        let pending = {
            let mut pending = self.pending.lock().unwrap();
            match pending.as_ref() {
                Some(entity) if entity.kind() == kind => pending.take(),
                _ => None,
            }
        };
        if let Some(entity) = pending {
            self.inner.save(&entity).await?;
        }
        Ok(records)
    }

    async fn index_members(&self, set: &IndexSet) -> StoreResult<Vec<Id>> {
        self.inner.index_members(set).await
    }

    async fn remove(&self, kind: EntityKind, id: Id) -> StoreResult<Option<Entity>> {
        self.inner.remove(kind, id).await
    }

    async fn mark_dirty(&self, kind: EntityKind) -> StoreResult<()> {
        self.inner.mark_dirty(kind).await
    }

    async fn dirty_types(&self) -> StoreResult<BTreeSet<EntityKind>> {
        self.inner.dirty_types().await
    }

    async fn clear_dirty_types(&self, kinds: &[EntityKind]) -> StoreResult<()> {
        self.inner.clear_dirty_types(kinds).await
    }

    async fn take_dirty_types(&self) -> StoreResult<BTreeSet<EntityKind>> {
        self.inner.take_dirty_types().await
    }

    async fn requeue_dirty_types(&self) -> StoreResult<()> {
        self.inner.requeue_dirty_types().await
    }

    async fn complete_dirty_types(&self) -> StoreResult<()> {
        self.inner.complete_dirty_types().await
    }

    async fn last_sync_time(&self) -> StoreResult<Option<DateTime<Utc>>> {
        self.inner.last_sync_time().await
    }

    async fn set_last_sync_time(&self, at: DateTime<Utc>) -> StoreResult<()> {
        self.inner.set_last_sync_time(at).await
    }

    async fn persist_snapshot(&self) -> StoreResult<()> {
        self.inner.persist_snapshot().await
    }

    async fn repair_indices(&self, kind: EntityKind) -> StoreResult<RepairReport> {
        self.inner.repair_indices(kind).await
    }
}

#[tokio::test]
async fn failed_record_keeps_kind_dirty() {
    let h = harness();
    save(&h.primary, User::new(1, "a@example.com", "A", 1)).await;
    save(&h.primary, User::new(2, "b@example.com", "B", 1)).await;
    h.durable.fail_record(EntityKind::User, 2);

    let err = h.service.force_sync_now().await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Push {
            kind: EntityKind::User,
            ..
        }
    ));
    assert!(h.durable.get(EntityKind::User, 1).is_none());
    assert_eq!(
        h.primary.dirty_types().await.unwrap(),
        BTreeSet::from([EntityKind::User])
    );
    assert!(h.primary.last_sync_time().await.unwrap().is_none());

    h.durable.clear_failures();
    h.service.force_sync_now().await.unwrap();
    assert!(h.durable.get(EntityKind::User, 1).is_some());
    assert!(h.durable.get(EntityKind::User, 2).is_some());
    assert!(h.primary.dirty_types().await.unwrap().is_empty());
}

#[tokio::test]
async fn failure_in_later_kind_aborts_whole_cycle() {
    let h = harness();
    seed_team(&h.primary).await;
    h.durable.fail_record(EntityKind::Task, 5);

    assert!(h.service.force_sync_now().await.is_err());
    // Earlier kinds committed, but nothing is cleared.
    assert!(h.durable.get(EntityKind::User, 1).is_some());
    assert_eq!(h.primary.dirty_types().await.unwrap().len(), 3);
    assert!(h.primary.last_sync_time().await.unwrap().is_none());
}

#[tokio::test]
async fn concurrent_forced_syncs_do_not_overlap() {
    let h = harness();
    seed_team(&h.primary).await;

    let (first, second) = tokio::join!(h.service.force_sync_now(), h.service.force_sync_now());
    let outcomes = [first.unwrap(), second.unwrap()];
    assert_eq!(outcomes.iter().filter(|o| o.is_skipped()).count(), 1);
    assert_converged(&h.primary, &h.durable).await;
}

// ============================================================================
// Health and Status
// ============================================================================

#[tokio::test]
async fn never_synced_is_unhealthy() {
    let h = harness();
    assert!(!h.service.is_healthy().await);

    let status = h.service.status().await;
    assert!(!status.healthy);
    assert!(status.last_sync_time.is_none());
    assert!(status.elapsed_secs.is_none());
}

#[tokio::test]
async fn health_boundary_is_twice_the_interval() {
    let h = harness_with_interval(Duration::from_secs(10));

    let recent = Utc::now() - chrono::Duration::milliseconds(19_500);
    h.primary.set_last_sync_time(recent).await.unwrap();
    assert!(h.service.is_healthy().await);

    let stale = Utc::now() - chrono::Duration::seconds(20);
    h.primary.set_last_sync_time(stale).await.unwrap();
    assert!(!h.service.is_healthy().await);
}

#[tokio::test]
async fn status_reports_pending_types() {
    let h = harness();
    save(&h.primary, User::new(1, "a@example.com", "A", 1)).await;

    let status = h.service.status().await;
    assert_eq!(status.pending_types, vec![EntityKind::User]);
    assert_eq!(status.interval_secs, 30);
    assert!(!status.running);
    assert!(!status.in_flight);

    h.service.force_sync_now().await.unwrap();
    let status = h.service.status().await;
    assert!(status.pending_types.is_empty());
    assert!(status.healthy);
}

// ============================================================================
// Recovery
// ============================================================================

#[tokio::test]
async fn reverse_sync_rebuilds_primary() {
    let h = harness();
    h.durable.seed(User::new(1, "ada@example.com", "Ada", 1));
    h.durable.seed(User::new(10, "bob@example.com", "Bob", 1));
    h.durable.seed(Group::new(11, "Platform", 1, 1).with_members([10]));
    h.durable.seed(Task::new(12, "Rotate keys", 10, 11, 1));

    // Absent from the durable store.
    save(&h.primary, User::new(2, "carol@example.com", "Carol", 1)).await;
    // Holds a natural key the durable store has under another ID.
    save(&h.primary, User::new(3, "bob@example.com", "Bobby", 1)).await;

    let report = h.service.reverse_sync().await.unwrap();
    let users = report.restored(EntityKind::User).unwrap();
    assert_eq!((users.restored, users.removed), (2, 2));

    assert_converged(&h.primary, &h.durable).await;
    let bob = h
        .primary
        .get_by_key(EntityKind::User, "bob@example.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bob.id(), 10);
    assert_eq!(
        h.primary
            .index_members(&IndexSet::GroupMembers(11))
            .await
            .unwrap(),
        vec![1, 10]
    );
    assert_eq!(
        h.primary
            .index_members(&IndexSet::UserTasks(10))
            .await
            .unwrap(),
        vec![12]
    );

    assert_eq!(h.primary.next_id(EntityKind::User).await.unwrap(), 11);
    assert_eq!(h.primary.next_id(EntityKind::Task).await.unwrap(), 13);
    assert!(h.primary.dirty_types().await.unwrap().is_empty());
    assert!(h.service.is_healthy().await);
}

#[tokio::test]
async fn reverse_sync_drops_dangling_index_entries() {
    let h = harness();
    h.durable.seed(User::new(1, "ada@example.com", "Ada", 1));
    h.primary.insert_dangling_id(EntityKind::User, 7);

    h.service.restore_from_durable().await.unwrap();
    assert_eq!(
        h.primary
            .index_members(&IndexSet::All(EntityKind::User))
            .await
            .unwrap(),
        vec![1]
    );
}

#[tokio::test]
async fn emergency_backup_syncs_everything_and_snapshots() {
    let h = harness();
    seed_team(&h.primary).await;
    h.service.force_sync_now().await.unwrap();

    let outcome = h.service.emergency_backup().await.unwrap();
    assert!(matches!(&outcome, CycleOutcome::Synced(report) if report.kinds.len() == 3));
    assert_eq!(h.primary.snapshot_count(), 1);
    assert_converged(&h.primary, &h.durable).await;
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn start_is_idempotent_and_stop_halts_cycles() {
    let h = harness_with_interval(Duration::from_millis(50));
    assert!(h.service.start());
    assert!(!h.service.start());
    assert!(h.service.is_running());

    save(&h.primary, User::new(1, "a@example.com", "A", 1)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(h.durable.get(EntityKind::User, 1).is_some());

    h.service.stop();
    assert!(!h.service.is_running());
    tokio::time::sleep(Duration::from_millis(100)).await;

    save(&h.primary, User::new(2, "b@example.com", "B", 1)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(h.durable.get(EntityKind::User, 2).is_none());
    assert!(!h.service.status().await.running);
}
