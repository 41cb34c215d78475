//! Tandem Server - keeps a Redis primary store and a PostgreSQL durable
//! store consistent.
//!
//! Application code writes only to the [`primary::PrimaryStore`]. The
//! [`sync::SyncService`] periodically copies every dirty entity kind to the
//! [`durable::DurableStore`], and can rebuild the primary store from the
//! durable one after data loss. A small admin HTTP surface exposes health,
//! status and the manual sync operations.

pub mod config;
pub mod durable;
pub mod error;
pub mod primary;
pub mod retry;
pub mod routes;
pub mod sync;

use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::sync::SyncService;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub sync: Arc<SyncService>,
}

impl AppState {
    pub fn new(sync: Arc<SyncService>) -> Self {
        Self { sync }
    }
}

/// Build the admin router with tracing and CORS layers.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
