use crate::services::{file_service::StorageError, object_store::ObjectStoreError};
use axum::{
    Json,
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

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

    /// Shortcut for 400 Bad Request
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

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        AppError::new(err.status(), err.body_text())
    }
}

fn object_store_status(err: &ObjectStoreError) -> StatusCode {
    match err {
        ObjectStoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        ObjectStoreError::InvalidObjectKey
        | ObjectStoreError::InvalidBucketName(_)
        | ObjectStoreError::SizeMismatch { .. } => StatusCode::BAD_REQUEST,
        ObjectStoreError::PresignExpired | ObjectStoreError::InvalidSignature => {
            StatusCode::FORBIDDEN
        }
        ObjectStoreError::CorruptMetadata(_)
        | ObjectStoreError::Signing(_)
        | ObjectStoreError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<ObjectStoreError> for AppError {
    fn from(err: ObjectStoreError) -> Self {
        let status = object_store_status(&err);
        if status.is_server_error() {
            tracing::error!("object store failure: {}", err);
            return AppError::internal("internal storage error");
        }
        AppError::new(status, err.to_string())
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        let status = match &err {
            StorageError::Policy(_) | StorageError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            StorageError::Forbidden(_) => StatusCode::FORBIDDEN,
            StorageError::BucketNotFound(_)
            | StorageError::FileNotFound(_)
            | StorageError::ObjectMissing { .. } => StatusCode::NOT_FOUND,
            StorageError::Object(inner) => object_store_status(inner),
            StorageError::Timeout { .. }
            | StorageError::Inconsistent(_)
            | StorageError::Metadata(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        match &err {
            StorageError::Timeout { .. } => AppError::internal(err.to_string()),
            _ if status.is_server_error() => {
                tracing::error!("storage failure: {}", err);
                AppError::internal("internal storage error")
            }
            _ => AppError::new(status, err.to_string()),
        }
    }
}
