// HTTP error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use huddle_sfu::SfuError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type for HTTP handlers
pub type AppResult<T> = Result<T, AppError>;

/// Application error with HTTP status code
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for AppError {}

/// Error response JSON structure
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status: u16,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            error: self.message,
            status: status.as_u16(),
        });

        (status, body).into_response()
    }
}

impl From<SfuError> for AppError {
    fn from(err: SfuError) -> Self {
        match err {
            SfuError::NotFound(msg) => Self::not_found(msg),
            SfuError::RoomFull(msg) => Self::conflict(msg),
            SfuError::InvalidRequest(msg) => Self::bad_request(msg),
            other => {
                tracing::error!(error = %other, "SFU error");
                Self::internal_server_error("Internal server error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sfu_error_status_mapping() {
        let cases = [
            (SfuError::NotFound("room x".into()), StatusCode::NOT_FOUND),
            (SfuError::RoomFull("limit 1".into()), StatusCode::CONFLICT),
            (SfuError::InvalidRequest("bad".into()), StatusCode::BAD_REQUEST),
            (
                SfuError::Engine("worker died".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }

    #[test]
    fn test_internal_errors_are_not_leaked() {
        let err = AppError::from(SfuError::Engine("worker 7 crashed".into()));
        assert!(!err.message.contains("worker 7"));
    }
}
