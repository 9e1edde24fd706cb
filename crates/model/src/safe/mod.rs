//! Validation and identity for untrusted input.
//!
//! - [`path`]: sandboxed relative paths
//! - [`key`]: structurally delimited cache keys and versions

pub mod key;
pub mod path;

pub use key::{CacheKey, CacheVersion};
pub use path::{is_safe_relative_path, RelativePath};
