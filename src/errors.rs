use crate::services::{archive_service::ArchiveError, object_store::StoreError};
use axum::{
    Json,
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

/// Missing and expired objects are indistinguishable to clients. Internal
/// details of storage failures stay in the log.
impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            err if err.is_not_found() => AppError::not_found("Not Found"),
            StoreError::Io(err) if err.kind() == io::ErrorKind::FileTooLarge => {
                AppError::new(StatusCode::PAYLOAD_TOO_LARGE, err.to_string())
            }
            StoreError::InvalidKey(rejection) => AppError::bad_request(rejection.to_string()),
            StoreError::LengthMismatch { expected, actual, .. } => AppError::bad_request(format!(
                "body length {} does not match declared length {}",
                actual, expected
            )),
            other => {
                tracing::error!("storage failure: {}", other);
                AppError::internal("Could not process request")
            }
        }
    }
}

impl From<ArchiveError> for AppError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::NotFound(_) => AppError::not_found("Not Found"),
            ArchiveError::Store(store) => store.into(),
            other => {
                tracing::error!("archive failure: {}", other);
                AppError::internal("Could not process request")
            }
        }
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        AppError::new(err.status(), err.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::object_key::KeyRejection;

    #[test]
    fn not_found_store_errors_map_to_404() {
        let err: AppError = StoreError::NotFound("tok/a.txt".into()).into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let io_missing = io::Error::new(io::ErrorKind::NotFound, "gone");
        let err: AppError = StoreError::Io(io_missing).into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn rejected_keys_map_to_400() {
        let err: AppError = StoreError::InvalidKey(KeyRejection::InvalidName("..".into())).into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn oversized_uploads_map_to_413() {
        let too_large = io::Error::new(io::ErrorKind::FileTooLarge, "upload exceeds 4 bytes");
        let err: AppError = StoreError::Io(too_large).into();
        assert_eq!(err.status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn other_failures_hide_their_details() {
        let err: AppError = StoreError::Io(io::Error::other("disk on fire")).into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.message.contains("disk"));

        let err: AppError = ArchiveError::NotFound("tok/a".into()).into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }
}
