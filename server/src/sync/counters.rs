//! Counter reconciliation after a completed batch.

use std::sync::Arc;
use tandem_engine::{plan_adjustment, CounterAdjustment, EntityKind};

use crate::durable::DurableStore;
use crate::error::StoreResult;
use crate::primary::PrimaryStore;

/// Keeps the primary store's ID counters ahead of the durable store.
pub struct CounterReconciler {
    primary: Arc<dyn PrimaryStore>,
    durable: Arc<dyn DurableStore>,
    gap_alert: u64,
}

impl CounterReconciler {
    pub fn new(
        primary: Arc<dyn PrimaryStore>,
        durable: Arc<dyn DurableStore>,
        gap_alert: u64,
    ) -> Self {
        Self {
            primary,
            durable,
            gap_alert,
        }
    }

    /// Align the counters of `kinds`. Failures are logged and skipped; they
    /// never undo the batches that already landed.
    pub async fn reconcile(&self, kinds: &[EntityKind]) -> Vec<CounterAdjustment> {
        let mut adjustments = Vec::new();
        for &kind in kinds {
            match self.reconcile_kind(kind).await {
                Ok(Some(adjustment)) => adjustments.push(adjustment),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(kind = %kind, error = %e, "Counter reconciliation failed");
                }
            }
        }
        adjustments
    }

    async fn reconcile_kind(&self, kind: EntityKind) -> StoreResult<Option<CounterAdjustment>> {
        let current = self.primary.current_counter(kind).await?;
        let durable_max = self.durable.max_id(kind).await?;
        let Some(adjustment) = plan_adjustment(kind, current, durable_max) else {
            return Ok(None);
        };

        let value = self.primary.advance_counter(kind, adjustment.target).await?;
        if adjustment.is_alarming(self.gap_alert) {
            tracing::warn!(
                kind = %kind,
                from = adjustment.current,
                to = value,
                gap = adjustment.gap(),
                "Large ID counter gap reconciled"
            );
        } else {
            tracing::info!(kind = %kind, from = adjustment.current, to = value, "Advanced ID counter");
        }
        Ok(Some(adjustment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::MemoryDurableStore;
    use crate::primary::MemoryPrimaryStore;
    use tandem_engine::User;

    #[tokio::test]
    async fn advances_lagging_counter_only() {
        let primary = Arc::new(MemoryPrimaryStore::new());
        let durable = Arc::new(MemoryDurableStore::new());
        for _ in 0..3 {
            primary.next_id(EntityKind::User).await.unwrap();
        }
        durable.seed(User::new(10, "a@x.com", "A", 1));

        let reconciler = CounterReconciler::new(primary.clone(), durable, 1000);
        let adjustments = reconciler
            .reconcile(&[EntityKind::User, EntityKind::Task])
            .await;

        assert_eq!(adjustments.len(), 1);
        assert_eq!(adjustments[0].current, 3);
        assert_eq!(adjustments[0].target, 10);
        assert_eq!(primary.next_id(EntityKind::User).await.unwrap(), 11);
        assert_eq!(primary.current_counter(EntityKind::Task).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn counter_ahead_of_durable_is_left_alone() {
        let primary = Arc::new(MemoryPrimaryStore::new());
        let durable = Arc::new(MemoryDurableStore::new());
        primary.advance_counter(EntityKind::User, 50).await.unwrap();
        durable.seed(User::new(10, "a@x.com", "A", 1));

        let reconciler = CounterReconciler::new(primary.clone(), durable, 1000);
        assert!(reconciler.reconcile(&[EntityKind::User]).await.is_empty());
        assert_eq!(primary.current_counter(EntityKind::User).await.unwrap(), 50);
    }
}
