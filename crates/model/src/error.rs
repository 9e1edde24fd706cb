//! Error types for the model crate.

use thiserror::Error;

/// Model error type covering validation and encoding failures.
#[derive(Debug, Error)]
pub enum ModelError {
    /// A path string failed sandbox validation.
    #[error("unsafe path: {0:?}")]
    UnsafePath(String),

    /// A page token could not be decoded.
    #[error("invalid page token: {0}")]
    InvalidPageToken(String),

    /// A page size was not an integer.
    #[error("invalid page size: {0:?}")]
    InvalidPageSize(String),

    /// A thumbnail size is not one of the known buckets.
    #[error("unknown thumbnail size: {0:?}")]
    UnknownThumbSize(String),

    /// Failed to serialize a value.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize a value.
    #[error("deserialization failed: {0}")]
    Deserialization(String),
}

/// Result type alias for model operations.
pub type Result<T> = std::result::Result<T, ModelError>;

impl ModelError {
    /// Whether this error was caused by client input rather than a fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ModelError::UnsafePath(_)
                | ModelError::InvalidPageToken(_)
                | ModelError::InvalidPageSize(_)
                | ModelError::UnknownThumbSize(_)
        )
    }
}

impl From<serde_json::Error> for ModelError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ModelError::Deserialization(err.to_string())
        } else {
            ModelError::Serialization(err.to_string())
        }
    }
}

impl From<rmp_serde::encode::Error> for ModelError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ModelError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ModelError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ModelError::Deserialization(err.to_string())
    }
}
