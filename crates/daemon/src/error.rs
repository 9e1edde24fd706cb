//! Errors surfaced at the request boundary.

use std::io;

use axum::http::StatusCode;
use model::ModelError;
use thiserror::Error;

use crate::cache::CacheError;
use crate::imaging::ImagingError;

/// Error returned by [`crate::service::GalleryService`] operations.
///
/// Corrupt or outdated cache entries never appear here; backends turn them
/// into misses.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// A path failed sandbox validation.
    #[error("unsafe path: {0:?}")]
    UnsafePath(String),

    /// Some other request parameter was malformed.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The file, directory or image does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A cache backend could not be reached.
    #[error("cache unavailable: {0}")]
    BackendUnavailable(String),

    /// Producing a thumbnail or metadata failed. Nothing was cached.
    #[error("failed to produce {artifact}: {source}")]
    Filler {
        artifact: &'static str,
        #[source]
        source: ImagingError,
    },

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    /// HTTP status this error maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::UnsafePath(_) | ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Filler { .. } | ServiceError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Map a filesystem error for `what` to `NotFound` or `Internal`.
    pub fn from_io(what: impl std::fmt::Display, error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::NotADirectory => {
                ServiceError::NotFound(what.to_string())
            }
            _ => ServiceError::Internal(format!("{}: {}", what, error)),
        }
    }
}

impl From<ModelError> for ServiceError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::UnsafePath(path) => ServiceError::UnsafePath(path),
            err if err.is_client_error() => ServiceError::BadRequest(err.to_string()),
            err => ServiceError::Internal(err.to_string()),
        }
    }
}

impl From<CacheError> for ServiceError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::BackendUnavailable(_) | CacheError::Closed => {
                ServiceError::BackendUnavailable(err.to_string())
            }
            err => ServiceError::Internal(err.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for ServiceError {
    fn from(err: tokio::task::JoinError) -> Self {
        ServiceError::Internal(format!("background task failed: {}", err))
    }
}
