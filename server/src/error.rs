//! Unified error handling for the server.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tandem_engine::{EntityKind, Id};

/// Errors raised by a store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] tandem_engine::Error),

    #[error("{kind} key '{key}' is already held by id {owner}")]
    DuplicateKey {
        kind: EntityKind,
        key: String,
        owner: Id,
    },

    #[error("{kind}:{id} references missing {target}:{target_id}")]
    MissingReference {
        kind: EntityKind,
        id: Id,
        target: EntityKind,
        target_id: Id,
    },

    #[error("Write to '{key}' kept racing concurrent writers")]
    Contended { key: String },

    #[error("Corrupt value at '{key}': {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Injected failure writing {kind}:{id}")]
    Injected { kind: EntityKind, id: Id },
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors that abort a reconciliation or recovery run.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Failed to read {kind} from primary store: {source}")]
    Pull {
        kind: EntityKind,
        #[source]
        source: StoreError,
    },

    #[error("Failed to write {kind} to durable store: {source}")]
    Push {
        kind: EntityKind,
        #[source]
        source: StoreError,
    },

    #[error("Failed to restore {kind} into primary store: {source}")]
    Restore {
        kind: EntityKind,
        #[source]
        source: StoreError,
    },

    #[error("Primary store error: {0}")]
    Primary(#[from] StoreError),
}

impl SyncError {
    /// The entity kind the failure is attributed to, if any.
    pub fn kind(&self) -> Option<EntityKind> {
        match self {
            SyncError::Pull { kind, .. }
            | SyncError::Push { kind, .. }
            | SyncError::Restore { kind, .. } => Some(*kind),
            SyncError::Primary(_) => None,
        }
    }
}

/// Application error type for the admin surface.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, details) = match &self {
            AppError::Sync(e) => {
                tracing::error!("Sync error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Sync failed".to_string(),
                    Some(e.to_string()),
                )
            }
        };

        let body = Json(ErrorResponse {
            error: error_message,
            details,
        });

        (status, body).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;
