//! Route modules for the download service

pub mod downloads;
pub mod health;

use axum::Router;

use crate::state::AppState;

/// Assemble every route under its public prefix
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .nest("/api/v1/files", downloads::router())
        .nest("/api/v1/cache", downloads::cache_router())
        .nest("/opds/v1/files", downloads::opds_router())
        .with_state(state)
}
