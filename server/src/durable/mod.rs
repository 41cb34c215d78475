//! Durable store: transactional persistence used for backup and recovery.
//!
//! Only the sync service writes here. Each kind is written as a full
//! collection inside one transaction, with identity conflicts resolved by
//! [`tandem_engine::resolve`].

mod memory;
mod postgres;
mod rows;

pub use self::memory::{MemoryDurableStore, RowMeta};
pub use self::postgres::PgDurableStore;

use async_trait::async_trait;
use tandem_engine::{BatchReport, Entity, EntityKind, Id};

use crate::error::StoreResult;

/// Storage contract of the durable store.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Make the stored collection of `kind` equal to `records`, all or
    /// nothing.
    ///
    /// Each record is resolved by ID, then by natural key; rows holding a
    /// record's natural key under another ID are deleted with their
    /// dependents. Rows whose ID is absent from `records` are deleted.
    async fn sync_collection(&self, kind: EntityKind, records: &[Entity])
        -> StoreResult<BatchReport>;

    /// Every row of a kind, ordered by ID.
    async fn get_all(&self, kind: EntityKind) -> StoreResult<Vec<Entity>>;

    /// Largest ID stored for a kind (0 when empty).
    async fn max_id(&self, kind: EntityKind) -> StoreResult<Id>;

    /// Delete one row. Users and groups cascade to tasks and memberships
    /// in the same transaction.
    async fn delete(&self, kind: EntityKind, id: Id) -> StoreResult<bool>;
}
