//! Thin HTTP adapter over [`GalleryService`].
//!
//! | Route            | Query                         | Operation                  |
//! |------------------|-------------------------------|----------------------------|
//! | `/static/*path`  |                               | frontend asset             |
//! | `/*path`         | none                          | file, or index page        |
//! | `/*path`         | `action=thumb` or `size=`     | thumbnail                  |
//! | `/*path`         | `action=info`                 | directory listing page     |
//! | `/*path`         | `action=image-info`           | image dimensions           |
//!
//! Any other `action` is a 400.

mod error;
mod handlers;

use std::future::Future;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::{DefaultOnFailure, DefaultOnResponse, TraceLayer};
use tower_http::LatencyUnit;
use tracing::Level;

pub use error::{wants_json, HttpError};

use crate::service::GalleryService;

pub type AppState = Arc<GalleryService>;

/// Build the router.
pub fn router(service: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .on_response(
            DefaultOnResponse::new()
                .include_headers(false)
                .level(Level::INFO)
                .latency_unit(LatencyUnit::Micros),
        )
        .on_failure(DefaultOnFailure::new().latency_unit(LatencyUnit::Micros));

    Router::new()
        .route("/static/*path", get(handlers::resource))
        .route("/", get(handlers::root))
        .route("/*path", get(handlers::path))
        .with_state(service)
        .layer(trace_layer)
}

/// Serve requests on `listener` until `shutdown` resolves. In-flight
/// requests are allowed to finish.
pub async fn serve<F>(
    listener: TcpListener,
    service: AppState,
    shutdown: F,
) -> Result<(), HttpServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "HTTP server listening");

    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown)
        .await?;

    tracing::info!("HTTP server stopped");
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    #[error("an error occurred running the HTTP server: {0}")]
    ServingFailed(#[from] std::io::Error),
}
