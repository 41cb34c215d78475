//! Background reconciliation between the primary and durable stores.
//!
//! A cycle claims the dirty-kind set, pushes the full collection of each
//! claimed kind to the durable store in dependency order, aligns ID counters,
//! then releases the claim and stamps the last-sync time. Writes landing
//! while a cycle runs mark their kind dirty again for the next cycle. A failed
//! cycle returns its claimed kinds to the dirty set and leaves the timestamp
//! untouched.

mod counters;
mod report;

pub use self::counters::CounterReconciler;
pub use self::report::{CycleOutcome, CycleReport, KindRestore, RestoreReport, SyncStatus};

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tandem_engine::{elapsed_since, is_healthy, sync_plan, BatchReport, Entity, EntityKind, Id};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::durable::DurableStore;
use crate::error::{StoreResult, SyncError};
use crate::primary::PrimaryStore;

/// Tunables of the sync service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    /// Time between timer-driven cycles.
    pub interval: Duration,
    /// Counter gap above which reconciliation logs a warning.
    pub counter_gap_alert: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            counter_gap_alert: 1000,
        }
    }
}

/// Keeps the durable store in step with the primary store.
pub struct SyncService {
    primary: Arc<dyn PrimaryStore>,
    durable: Arc<dyn DurableStore>,
    settings: SyncSettings,
    counters: CounterReconciler,
    /// Held for the whole of a cycle, a restore or a backup.
    cycle_guard: tokio::sync::Mutex<()>,
    /// Shutdown handle of the timer task; dropping it stops the task.
    worker: Mutex<Option<watch::Sender<()>>>,
    /// Last-sync time seen most recently, served when the store is unreadable.
    last_sync: RwLock<Option<DateTime<Utc>>>,
}

impl SyncService {
    pub fn new(
        primary: Arc<dyn PrimaryStore>,
        durable: Arc<dyn DurableStore>,
        settings: SyncSettings,
    ) -> Self {
        let counters = CounterReconciler::new(
            Arc::clone(&primary),
            Arc::clone(&durable),
            settings.counter_gap_alert,
        );
        Self {
            primary,
            durable,
            settings,
            counters,
            cycle_guard: tokio::sync::Mutex::new(()),
            worker: Mutex::new(None),
            last_sync: RwLock::new(None),
        }
    }

    pub fn settings(&self) -> SyncSettings {
        self.settings
    }

    /// Spawn the timer task. Returns `false` if it was already running.
    ///
    /// The first cycle runs one interval after start.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return false;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        *worker = Some(shutdown_tx);

        let service = Arc::clone(self);
        tokio::spawn(async move { service.run_timer(shutdown_rx).await });

        tracing::info!(
            interval_secs = self.settings.interval.as_secs(),
            "Sync service started"
        );
        true
    }

    /// Prevent future cycles. A cycle already running completes.
    pub fn stop(&self) {
        let stopped = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();
        if stopped {
            tracing::info!("Sync service stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    async fn run_timer(&self, mut shutdown: watch::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.on_tick().await,
            }
        }
        tracing::debug!("Sync timer task exited");
    }

    async fn on_tick(&self) {
        let Ok(_guard) = self.cycle_guard.try_lock() else {
            tracing::debug!("Previous cycle still running, skipping tick");
            return;
        };
        // Failures are logged by `cycle` and retried on the next tick.
        let _ = self.cycle().await;
    }

    /// Run a cycle now, waiting for an in-flight cycle to finish first.
    pub async fn force_sync_now(&self) -> Result<CycleOutcome, SyncError> {
        let _guard = self.cycle_guard.lock().await;
        tracing::info!("Forced sync requested");
        self.cycle().await
    }

    /// Mark every kind dirty, sync everything, then ask the primary store to
    /// persist itself.
    pub async fn emergency_backup(&self) -> Result<CycleOutcome, SyncError> {
        tracing::warn!("Emergency backup requested");
        for kind in EntityKind::ALL {
            self.primary.mark_dirty(kind).await?;
        }
        let outcome = self.force_sync_now().await?;
        self.primary.persist_snapshot().await?;
        tracing::info!("Emergency backup completed");
        Ok(outcome)
    }

    /// Entry point used by the admin surface to rebuild the primary store.
    pub async fn restore_from_durable(&self) -> Result<RestoreReport, SyncError> {
        self.reverse_sync().await
    }

    /// Overwrite the primary store with the durable store's contents.
    ///
    /// Per kind, primary records the durable store lacks are deleted, as are
    /// records whose natural key the durable store holds under another ID.
    /// Counters are then advanced past the durable maxima, indices repaired
    /// and the dirty set cleared.
    pub async fn reverse_sync(&self) -> Result<RestoreReport, SyncError> {
        let _guard = self.cycle_guard.lock().await;
        tracing::info!("Restoring primary store from durable store");

        let mut report = RestoreReport::default();
        for kind in EntityKind::ALL {
            let restored = self
                .restore_kind(kind)
                .await
                .map_err(|source| SyncError::Restore { kind, source })?;
            tracing::debug!(
                kind = %kind,
                restored = restored.restored,
                removed = restored.removed,
                "Restored collection"
            );
            report.kinds.push(restored);
        }

        report.counter_adjustments = self.counters.reconcile(&EntityKind::ALL).await;
        for kind in EntityKind::ALL {
            self.primary
                .repair_indices(kind)
                .await
                .map_err(|source| SyncError::Restore { kind, source })?;
        }

        self.primary.clear_dirty_types(&EntityKind::ALL).await?;
        self.stamp_last_sync().await?;
        tracing::info!("Primary store restored");
        Ok(report)
    }

    async fn restore_kind(&self, kind: EntityKind) -> StoreResult<KindRestore> {
        let records = self.durable.get_all(kind).await?;
        let ids: BTreeSet<Id> = records.iter().map(Entity::id).collect();
        let key_owners: BTreeMap<String, Id> = records
            .iter()
            .filter_map(|entity| entity.natural_key().map(|key| (key, entity.id())))
            .collect();

        let mut removed = 0;
        for entity in self.primary.get_all(kind).await? {
            let id = entity.id();
            let key_taken = entity
                .natural_key()
                .and_then(|key| key_owners.get(&key).copied())
                .is_some_and(|owner| owner != id);
            if !ids.contains(&id) || key_taken {
                self.primary.remove(kind, id).await?;
                removed += 1;
            }
        }

        for entity in &records {
            self.primary.save(entity).await?;
        }

        Ok(KindRestore {
            kind,
            restored: records.len(),
            removed,
        })
    }

    async fn cycle(&self) -> Result<CycleOutcome, SyncError> {
        let result = self.run_cycle().await;
        if let Err(e) = &result {
            tracing::error!(kind = ?e.kind(), error = %e, "Reconciliation cycle failed");
        }
        result
    }

    async fn run_cycle(&self) -> Result<CycleOutcome, SyncError> {
        let started = Instant::now();
        let dirty = self.primary.take_dirty_types().await?;
        let Some(plan) = sync_plan(&dirty) else {
            tracing::debug!("No dirty types, skipping cycle");
            return Ok(CycleOutcome::Skipped);
        };

        tracing::info!(kinds = ?plan, "Starting reconciliation cycle");
        let batches = match self.push_kinds(&plan).await {
            Ok(batches) => batches,
            Err(e) => {
                if let Err(requeue) = self.primary.requeue_dirty_types().await {
                    tracing::error!(error = %requeue, "Failed to requeue dirty types");
                }
                return Err(e);
            }
        };

        let counter_adjustments = self.counters.reconcile(&plan).await;
        self.primary.complete_dirty_types().await?;
        self.stamp_last_sync().await?;

        let report = CycleReport {
            kinds: plan,
            batches,
            counter_adjustments,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(
            kinds = ?report.kinds,
            duration_ms = report.duration_ms,
            "Reconciliation cycle completed"
        );
        Ok(CycleOutcome::Synced(report))
    }

    async fn push_kinds(&self, plan: &[EntityKind]) -> Result<Vec<BatchReport>, SyncError> {
        let mut batches = Vec::with_capacity(plan.len());
        for &kind in plan {
            let records = self
                .primary
                .get_all(kind)
                .await
                .map_err(|source| SyncError::Pull { kind, source })?;
            let batch = self
                .durable
                .sync_collection(kind, &records)
                .await
                .map_err(|source| SyncError::Push { kind, source })?;

            tracing::debug!(
                kind = %kind,
                inserted = batch.inserted,
                updated = batch.updated,
                drifted = batch.drifted.len(),
                removed = batch.removed,
                "Synced collection"
            );
            for drift in &batch.drifted {
                tracing::warn!(
                    kind = %kind,
                    stale_id = drift.stale_id,
                    id = drift.id,
                    "Replaced durable row with drifted identity"
                );
            }
            batches.push(batch);
        }
        Ok(batches)
    }

    async fn stamp_last_sync(&self) -> Result<(), SyncError> {
        let now = Utc::now();
        self.primary.set_last_sync_time(now).await?;
        *self.last_sync.write().unwrap_or_else(PoisonError::into_inner) = Some(now);
        Ok(())
    }

    /// Last successful sync, falling back to the cached value when the
    /// primary store cannot be read.
    pub async fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        match self.primary.last_sync_time().await {
            Ok(at) => {
                *self.last_sync.write().unwrap_or_else(PoisonError::into_inner) = at;
                at
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read last sync time, using cached value");
                let cached = *self.last_sync.read().unwrap_or_else(PoisonError::into_inner);
                cached
            }
        }
    }

    /// Healthy iff the last successful sync is less than twice the interval
    /// ago. Never synced is unhealthy.
    pub async fn is_healthy(&self) -> bool {
        let last_sync = self.last_sync_time().await;
        is_healthy(self.elapsed(last_sync), self.settings.interval)
    }

    fn elapsed(&self, last_sync: Option<DateTime<Utc>>) -> Option<Duration> {
        let to_millis = |at: DateTime<Utc>| at.timestamp_millis().max(0) as u64;
        elapsed_since(last_sync.map(to_millis), to_millis(Utc::now()))
    }

    /// Current state of the service. Never fails.
    pub async fn status(&self) -> SyncStatus {
        let last_sync = self.last_sync_time().await;
        let elapsed = self.elapsed(last_sync);
        let pending_types = match self.primary.dirty_types().await {
            Ok(kinds) => kinds.into_iter().collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read dirty types");
                Vec::new()
            }
        };

        SyncStatus {
            running: self.is_running(),
            in_flight: self.cycle_guard.try_lock().is_err(),
            interval_secs: self.settings.interval.as_secs(),
            last_sync_time: last_sync,
            elapsed_secs: elapsed.map(|d| d.as_secs_f64()),
            pending_types,
            healthy: is_healthy(elapsed, self.settings.interval),
        }
    }
}
