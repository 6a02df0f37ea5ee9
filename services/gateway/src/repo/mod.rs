//! Durable persistence: messages, per-recipient deliveries, offline
//! digests, the subscription mirror, and profile metadata.

pub mod digests;
pub mod messages;
pub mod profiles;
pub mod subscriptions;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQL: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
