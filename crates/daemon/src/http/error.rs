use axum::http::header::{ACCEPT, CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::error::ServiceError;

/// A failed request, rendered for the client that sent it.
#[derive(Debug)]
pub struct HttpError {
    pub error: ServiceError,
    pub path: String,
    /// The client listed `application/json` in `Accept`.
    pub wants_json: bool,
}

#[derive(Serialize)]
struct ErrorBody {
    status: u16,
    error: String,
}

impl HttpError {
    pub fn new(error: ServiceError, path: impl Into<String>, headers: &HeaderMap) -> Self {
        Self {
            error,
            path: path.into(),
            wants_json: wants_json(headers),
        }
    }
}

pub fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.contains("application/json"))
        .unwrap_or(false)
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = self.error.status();

        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), path = %self.path, error = %self.error, "Request failed");
        } else {
            tracing::debug!(status = status.as_u16(), path = %self.path, error = %self.error, "Request rejected");
        }

        if self.wants_json {
            let body = ErrorBody {
                status: status.as_u16(),
                error: self.error.to_string(),
            };
            return (status, Json(body)).into_response();
        }

        (
            status,
            [
                (CONTENT_TYPE, "text/plain; charset=utf-8"),
                (X_CONTENT_TYPE_OPTIONS, "nosniff"),
            ],
            format!(
                "{} {}\n\n{}\n",
                status.as_u16(),
                status.canonical_reason().unwrap_or_default(),
                self.error
            ),
        )
            .into_response()
    }
}
