pub mod auth;
pub mod cache;
pub mod config;
pub mod connection;
pub mod db;
pub mod error;
pub mod handlers;
pub mod registry;
pub mod repo;
pub mod router;
pub mod state;
pub mod subscriptions;
pub mod tables;
pub mod tasks;
pub mod util;

pub use state::AppState;

use axum::{routing::get, Router};
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/v1/clients", get(connection::ws_handler))
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Spawn the task worker pool and the delivery-expiry sweeper.
pub async fn spawn_background(state: &AppState) {
    tasks::spawn_workers(state).await;

    let sweeper_state = state.clone();
    tokio::spawn(async move {
        let retention_ms = sweeper_state.config.store.message_retention_secs as i64 * 1000;
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.tick().await;
        loop {
            interval.tick().await;
            let cutoff = util::now_millis() - retention_ms;
            match repo::messages::expire(&sweeper_state.pool, cutoff).await {
                Ok(0) => debug!("expiry sweep: nothing to do"),
                Ok(n) => info!(expired = n, "expiry sweep transitioned deliveries"),
                Err(e) => error!(error = %e, "expiry sweep failed"),
            }
        }
    });
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
