//! Server-specific error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::archive::gateway::GatewayError;
use crate::archive::ArchiveError;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        AppError::Archive(err.into())
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Internal(_) | AppError::Config(_) | AppError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            },
            AppError::Archive(e) => archive_status(e),
        }
    }
}

fn archive_status(err: &ArchiveError) -> StatusCode {
    match err {
        ArchiveError::NotFound(_) | ArchiveError::UnknownExecution(_) => StatusCode::NOT_FOUND,
        ArchiveError::IllegalTransition { .. } | ArchiveError::Frozen(_) => StatusCode::CONFLICT,
        ArchiveError::Validation(_) | ArchiveError::InvalidJobName(_) => StatusCode::BAD_REQUEST,
        ArchiveError::Gateway(GatewayError::NotFound(_)) => StatusCode::NOT_FOUND,
        ArchiveError::Gateway(GatewayError::AlreadyExists(_)) => StatusCode::CONFLICT,
        ArchiveError::Gateway(_) | ArchiveError::Provisioning { .. } => StatusCode::BAD_GATEWAY,
        ArchiveError::Store(_)
        | ArchiveError::Database(_)
        | ArchiveError::Serialization(_)
        | ArchiveError::Decode(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_message = match &self {
            AppError::Config(message) => {
                tracing::error!("Configuration error: {}", message);
                "Server configuration error".to_string()
            },
            AppError::Storage(e) => {
                tracing::error!("Storage error: {:?}", e);
                "A storage error occurred".to_string()
            },
            AppError::Archive(ArchiveError::Database(e)) => {
                tracing::error!("Database error: {:?}", e);
                "A database error occurred".to_string()
            },
            other if status.is_server_error() => {
                tracing::error!("{}", other);
                other.to_string()
            },
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": {
                "message": error_message,
                "status": status.as_u16(),
            }
        }));

        (status, body).into_response()
    }
}
