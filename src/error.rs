use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SlowDownError {
    #[error("Unable to resolve client key: {0}")]
    KeyResolution(String),

    #[error("Counter store call timed out after {0}ms")]
    StoreTimeout(u64),

    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type SlowDownResult<T> = Result<T, SlowDownError>;

impl From<redis::RedisError> for SlowDownError {
    fn from(err: redis::RedisError) -> Self {
        SlowDownError::StoreUnavailable(err.to_string())
    }
}

impl From<validator::ValidationErrors> for SlowDownError {
    fn from(err: validator::ValidationErrors) -> Self {
        SlowDownError::Configuration(err.to_string())
    }
}

impl From<serde_json::Error> for SlowDownError {
    fn from(err: serde_json::Error) -> Self {
        SlowDownError::Configuration(err.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_error(err: &SlowDownError) -> Self {
        let message = err.to_string();
        match err {
            SlowDownError::KeyResolution(_) => Self::new("bad_request", &message, 400),
            SlowDownError::Validation(_) => Self::new("validation_error", &message, 422),
            SlowDownError::StoreTimeout(_) => Self::new("gateway_timeout", &message, 504),
            SlowDownError::StoreUnavailable(_) => Self::new("service_unavailable", &message, 503),
            SlowDownError::Configuration(_) => Self::new("configuration_error", &message, 500),
            SlowDownError::Internal(_) => Self::new("internal_error", &message, 500),
        }
    }
}

impl IntoResponse for SlowDownError {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_error(&self);
        let status =
            StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}
