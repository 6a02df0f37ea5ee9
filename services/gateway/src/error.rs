//! Gateway-side error taxonomy and its mapping onto wire envelopes.

use chan_protocol::{error_codes, ErrorEnvelope};
use thiserror::Error;

use crate::auth::AuthError;
use crate::repo::StoreError;
use crate::tables::TableError;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed frame, missing type/route, unknown native type.
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("authentication required")]
    Unauthenticated,
    #[error("scope not permitted")]
    Unauthorized,
    #[error("no route matches {0}")]
    NotFound(String),
    #[error("CapacityExhausted")]
    Capacity,
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("task failed: {0}")]
    Task(String),
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<TableError> for GatewayError {
    fn from(e: TableError) -> Self {
        match e {
            TableError::CapacityExhausted => Self::Capacity,
        }
    }
}

impl GatewayError {
    pub fn wire_code(&self) -> &'static str {
        match self {
            Self::Protocol(_) => error_codes::PROTOCOL_VIOLATION,
            Self::Unauthenticated => error_codes::UNAUTHENTICATED,
            Self::Unauthorized => error_codes::UNAUTHORIZED,
            Self::NotFound(_) => error_codes::NOT_FOUND,
            Self::Capacity => error_codes::CAPACITY_EXHAUSTED,
            Self::Auth(e) => e.wire_code(),
            Self::Task(_) => error_codes::TASK_FAILED,
            Self::Persistence(_) => error_codes::PERSISTENCE_ERROR,
            Self::Internal(_) => error_codes::INTERNAL_ERROR,
        }
    }

    /// HTTP-semantic marker where the taxonomy defines one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Unauthenticated => Some(401),
            Self::Unauthorized => Some(403),
            Self::NotFound(_) => Some(404),
            Self::Task(_) | Self::Persistence(_) | Self::Internal(_) => Some(500),
            _ => None,
        }
    }

    pub fn envelope(&self, timestamp: i64) -> ErrorEnvelope {
        ErrorEnvelope {
            code: self.wire_code().to_owned(),
            message: self.to_string(),
            status: self.status(),
            timestamp,
        }
    }
}
