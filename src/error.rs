// error.rs
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::models::ErrorBody;

/// Failures of a single device read/write through the proxy gateway.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
    #[error("Invalid device address: {0}")]
    InvalidAddress(String),
    #[error("Device responded with HTTP {status}")]
    UpstreamHttp { status: u16 },
    #[error("Device unreachable: {message}")]
    UpstreamUnreachable { message: String },
    #[error("Malformed device response: {0}")]
    MalformedResponse(String),
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Device not found")]
    DeviceNotFound,
    #[error("Device is not connected")]
    NotConnected,
    #[error("Validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::DeviceNotFound => StatusCode::NOT_FOUND,
            AppError::NotConnected => StatusCode::CONFLICT,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Proxy(ProxyError::InvalidAddress(_)) => StatusCode::BAD_REQUEST,
            AppError::Proxy(ProxyError::UpstreamHttp { status }) => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            AppError::Proxy(_) => StatusCode::BAD_GATEWAY,
            AppError::Storage(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = ?self, "Request failed");
        }
        (status, Json(ErrorBody::new(self.to_string()))).into_response()
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        AppError::Validation(errors.to_string())
    }
}
