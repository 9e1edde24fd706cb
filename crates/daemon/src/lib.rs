//! # Lightbox Daemon Library
//!
//! This crate serves a directory tree of images over HTTP. Thumbnails and
//! image dimensions are computed on first request and kept in versioned
//! caches, so later requests for an unchanged image are served without
//! decoding it again.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    HTTP adapter (axum)                   │
//! ├──────────────────────────────────────────────────────────┤
//! │                     Gallery service                      │
//! │                                                          │
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────────┐  │
//! │  │  Directory   │  │  Thumbnail   │  │    Metadata    │  │
//! │  │   lister     │  │    cache     │  │     cache      │  │
//! │  └──────────────┘  └──────────────┘  └────────────────┘  │
//! │                                                          │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │               Image runtime (decode)               │  │
//! │  └────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use daemon::cache::Cache;
//! use daemon::{Config, GalleryService, ImageRuntime};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let imaging = Arc::new(ImageRuntime::init(&config.imaging));
//!
//!     let service = Arc::new(GalleryService::new(
//!         &config.paths,
//!         Cache::from_config(&config.cache.thumbnails).await?,
//!         Cache::from_config(&config.cache.metadata).await?,
//!         Arc::clone(&imaging),
//!         config.imaging.fill_timeout(),
//!     ));
//!
//!     let listener = tokio::net::TcpListener::bind(config.listen_addr()?).await?;
//!     daemon::http::serve(listener, Arc::clone(&service), async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//!
//!     service.close().await?;
//!     imaging.teardown();
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`cache`]: Versioned caches and their backends
//! - [`imaging`]: Image decoding and thumbnail rendering
//! - [`listing`]: Directory enumeration below the image root
//! - [`service`]: Gallery operations
//! - [`http`]: Routes and error rendering
//! - [`error`]: Request-level errors

pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod imaging;
pub mod listing;
pub mod service;

// Re-export model for convenience
pub use model;

pub use cache::{Cache, CacheError, CachedContent, Filled, VersionedCache};
pub use config::Config;
pub use error::{ServiceError, ServiceResult};
pub use imaging::{ImageRuntime, ImagingError};
pub use listing::{DirectoryLister, ListedEntry};
pub use service::GalleryService;
