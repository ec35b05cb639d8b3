//! Error types for the application

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Unknown run: {0}")]
    UnknownRun(Uuid),

    #[error("Unknown approval request: {0}")]
    UnknownRequest(Uuid),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Run {0} is terminal, no further events may be appended")]
    RunTerminated(Uuid),

    #[error("Invalid run transition: {0}")]
    InvalidTransition(String),

    #[error("Approval request {0} is already decided")]
    AlreadyDecided(Uuid),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Capability denied by approval request {0}")]
    CapabilityDenied(Uuid),

    #[error("Audit chain for workspace {workspace_id} is broken at event {event_id}")]
    ChainMismatch {
        workspace_id: String,
        event_id: Uuid,
    },

    #[error("Completion error: {0}")]
    Completion(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error".to_string(),
                )
            }
            AppError::UnknownRun(_)
            | AppError::UnknownRequest(_)
            | AppError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::RunTerminated(_)
            | AppError::InvalidTransition(_)
            | AppError::AlreadyDecided(_)
            | AppError::CapabilityDenied(_) => (StatusCode::CONFLICT, self.to_string()),
            AppError::Forbidden(e) => (StatusCode::FORBIDDEN, e.clone()),
            AppError::Unauthorized(e) => (StatusCode::UNAUTHORIZED, e.clone()),
            AppError::ChainMismatch { .. } => {
                tracing::error!("{}", self);
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            AppError::Completion(e) => {
                tracing::error!("Completion error: {}", e);
                (StatusCode::BAD_GATEWAY, format!("Completion error: {}", e))
            }
            AppError::BadRequest(e) => (StatusCode::BAD_REQUEST, e.clone()),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.clone())
            }
        };

        (status, message).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
