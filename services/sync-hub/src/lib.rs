pub mod auth;
pub mod catchup;
pub mod conflict;
pub mod config;
pub mod db;
pub mod error;
pub mod fabric;
pub mod hub;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod rate_limit;
pub mod repo;
pub mod state;
pub mod ws;

pub use state::AppState;

use axum::{routing::get, Router};

/// The full HTTP surface: two liveness probes and the one persistent
/// sync channel. Everything else — bookmark/collection CRUD, account
/// management — lives in front-end services this core does not expose.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/ws/v1/sync", get(ws::handler::ws_sync_handler))
        .with_state(state)
}

mod health {
    use axum::response::IntoResponse;

    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }

    pub async fn readyz() -> impl IntoResponse {
        "ok"
    }
}
