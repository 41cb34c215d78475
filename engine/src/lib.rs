//! # Tandem Engine
//!
//! Pure reconciliation logic for keeping a low-latency key-value store (the
//! system of record) consistent with a durable relational store.
//!
//! This crate holds every decision the sync service makes, with no knowledge
//! of Redis, PostgreSQL, or the network. The server crate supplies the IO.
//!
//! ## Design Principles
//!
//! - **No IO**: store backends live in `tandem-server`
//! - **Deterministic**: same inputs always produce the same decisions
//! - **Shared by backends**: the Redis, PostgreSQL and in-memory backends all
//!   call into the same index and resolution logic
//!
//! ## Core Concepts
//!
//! ### Entities
//!
//! [`User`], [`Group`] and [`Task`] records, wrapped in [`Entity`]. Every
//! entity has a numeric ID issued by the primary store; that ID joins the two
//! stores. Group membership edges ([`Membership`]) travel with their group.
//!
//! ### Entity kinds
//!
//! [`EntityKind`] is the unit of dirty tracking. [`sync_plan`] turns a dirty
//! set into the dependency order users → groups → tasks.
//!
//! ### Secondary indices
//!
//! [`index_entries`] derives every index a record participates in, and
//! [`IndexDiff`] computes what a save or delete must add and remove.
//!
//! ### Conflict resolution
//!
//! [`resolve`] decides, per incoming record, whether the durable store
//! updates in place, inserts, or replaces a stale row holding the same
//! natural key under a different ID.
//!
//! ### Counters and health
//!
//! [`plan_adjustment`] computes how far an ID counter must advance to clear
//! the durable store's maximum ID. [`is_healthy`] is a pure function of the
//! time since the last successful cycle.
//!
//! ## Quick Start
//!
//! ```rust
//! use tandem_engine::{resolve, sync_plan, EntityKind, Resolution};
//!
//! let dirty = [EntityKind::Task, EntityKind::User];
//! assert_eq!(
//!     sync_plan(dirty.iter()).unwrap(),
//!     vec![EntityKind::User, EntityKind::Task]
//! );
//!
//! // User 5 arrives; the durable store holds its email under ID 9.
//! assert_eq!(resolve(5, false, Some(9)), Resolution::ReplaceStale { stale_id: 9 });
//! ```

pub mod counter;
pub mod error;
pub mod health;
pub mod index;
pub mod kind;
pub mod model;
pub mod resolve;

// Re-export main types at crate root
pub use counter::{plan_adjustment, CounterAdjustment};
pub use error::{Error, Result};
pub use health::{elapsed_since, is_healthy, HEALTH_INTERVAL_FACTOR};
pub use index::{
    index_entries, unique_key_name, unique_key_prefix, IndexDiff, IndexEntry, IndexSet,
};
pub use kind::{sync_plan, EntityKind};
pub use model::{normalize_group_name, Entity, Group, Membership, Task, TaskStatus, User};
pub use resolve::{
    orphaned_ids, resolve, resolve_in_batch, BatchReport, IdentityDrift, Resolution,
};

/// Type aliases for clarity
pub type Id = u64;
pub type Timestamp = u64;
