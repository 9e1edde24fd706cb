//! # Lightbox Model Library
//!
//! Pure definitions shared by the lightbox gallery daemon.
//!
//! ## Overview
//!
//! - **Path sandbox**: [`RelativePath`] is the only way an untrusted path
//!   reaches the filesystem
//! - **Cache identity**: [`CacheKey`] and [`CacheVersion`] for versioned caches
//! - **Pagination**: [`PageToken`], [`Page`] and [`page::paginate`]
//! - **Response models**: directory listings and image metadata
//!
//! ## Example Usage
//!
//! ```rust
//! use model::{Page, PageToken, RelativePath};
//!
//! let path = RelativePath::new("holiday/2019").unwrap();
//! assert!(RelativePath::new("holiday/../../etc").is_err());
//!
//! let token = PageToken::new("beach.jpg", false).encode();
//! let page = Page::parse(&token, Some("500")).unwrap();
//! assert_eq!(page.size, model::page::MAX_PAGE_SIZE);
//! # let _ = path;
//! ```
//!
//! ## Modules
//!
//! - [`safe`]: Path sandbox and cache keys
//! - [`page`]: Page tokens and the pagination algorithm
//! - [`thumb`]: Thumbnail size buckets
//! - [`item`]: Listing and metadata models
//! - [`error`]: Error types

pub mod error;
pub mod item;
pub mod page;
pub mod safe;
pub mod thumb;

pub use error::{ModelError, Result};
pub use item::{Directory, DirectoryListing, Image, Item};
pub use page::{ListingOrder, Page, PageSlice, PageToken};
pub use safe::{CacheKey, CacheVersion, RelativePath};
pub use thumb::ThumbSize;
