//! Error types for the Tandem engine.

use crate::{EntityKind, Id};
use thiserror::Error;

/// All possible errors from the Tandem engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("unknown entity kind: {0}")]
    UnknownEntityKind(String),

    #[error("entity kind mismatch: expected {expected}, got {actual}")]
    KindMismatch {
        expected: EntityKind,
        actual: EntityKind,
    },

    #[error("invalid record {kind}:{id}: {reason}")]
    InvalidRecord {
        kind: EntityKind,
        id: Id,
        reason: String,
    },

    #[error("invalid task status: {0}")]
    InvalidTaskStatus(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
