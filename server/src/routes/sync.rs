//! Sync admin routes.

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};

use crate::error::Result;
use crate::sync::{CycleOutcome, RestoreReport, SyncStatus};
use crate::AppState;

/// Create sync routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sync/status", get(status_handler))
        .route("/sync/force", post(force_handler))
        .route("/sync/backup", post(backup_handler))
        .route("/sync/restore", post(restore_handler))
}

/// GET /sync/status - Current state of the sync service.
async fn status_handler(State(state): State<AppState>) -> Json<SyncStatus> {
    Json(state.sync.status().await)
}

/// POST /sync/force - Run a reconciliation cycle now.
async fn force_handler(State(state): State<AppState>) -> Result<Json<CycleOutcome>> {
    let outcome = state.sync.force_sync_now().await?;
    Ok(Json(outcome))
}

/// POST /sync/backup - Sync every kind and snapshot the primary store.
async fn backup_handler(State(state): State<AppState>) -> Result<Json<CycleOutcome>> {
    let outcome = state.sync.emergency_backup().await?;
    Ok(Json(outcome))
}

/// POST /sync/restore - Rebuild the primary store from the durable store.
async fn restore_handler(State(state): State<AppState>) -> Result<Json<RestoreReport>> {
    let report = state.sync.restore_from_durable().await?;
    Ok(Json(report))
}
