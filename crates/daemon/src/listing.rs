//! Directory listing below the image root.
//!
//! Paths arrive as [`RelativePath`]s, so they have already passed the
//! sandbox. Symlinks are not followed: a link is neither a directory nor a
//! regular file and never shows up in a listing.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use model::page::{self, ListingOrder};
use model::{CacheVersion, Page, PageSlice, RelativePath};
use tracing::debug;

use crate::error::{ServiceError, ServiceResult};

/// File extensions served as images, lowercase.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Type of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
    Other,
}

/// A directory entry with the metadata the gallery needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedEntry {
    /// Entry name (not full path).
    pub name: String,
    pub kind: EntryKind,
    /// Size in bytes (0 for anything but regular files).
    pub size: u64,
    pub modified: SystemTime,
}

impl ListedEntry {
    /// Version tag for artifacts derived from this entry.
    pub fn version(&self) -> CacheVersion {
        CacheVersion::fingerprint(self.modified, self.size)
    }

    /// A subdirectory that should be listed.
    pub fn is_image_directory(&self) -> bool {
        self.kind == EntryKind::Directory && !self.name.starts_with('.')
    }

    /// A regular file with a supported image extension.
    pub fn is_image(&self) -> bool {
        self.kind == EntryKind::File && is_image_name(&self.name)
    }

    pub fn is_visible(&self) -> bool {
        self.is_image_directory() || self.is_image()
    }

    fn from_metadata(name: String, metadata: &fs::Metadata) -> Self {
        let file_type = metadata.file_type();
        let kind = if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        };

        Self {
            name,
            kind,
            size: if kind == EntryKind::File { metadata.len() } else { 0 },
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        }
    }
}

impl ListingOrder for ListedEntry {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Whether `name` is a visible file name with a supported image extension.
pub fn is_image_name(name: &str) -> bool {
    if name.starts_with('.') {
        return false;
    }
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

/// Lists directories below a fixed base.
#[derive(Debug, Clone)]
pub struct DirectoryLister {
    base: PathBuf,
}

impl DirectoryLister {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Full filesystem path of `path`.
    pub fn resolve(&self, path: &RelativePath) -> PathBuf {
        path.to_path(&self.base)
    }

    /// Stat a single entry without following symlinks.
    pub fn stat(&self, path: &RelativePath) -> ServiceResult<ListedEntry> {
        let full = self.resolve(path);
        let metadata =
            fs::symlink_metadata(&full).map_err(|e| ServiceError::from_io(path, e))?;
        Ok(ListedEntry::from_metadata(
            path.file_name().to_string(),
            &metadata,
        ))
    }

    /// All entries of `path` in listing order, hidden and unsupported ones
    /// included.
    pub fn list(&self, path: &RelativePath) -> ServiceResult<Vec<ListedEntry>> {
        let full = self.resolve(path);

        let metadata = fs::metadata(&full).map_err(|e| ServiceError::from_io(path, e))?;
        if !metadata.is_dir() {
            return Err(ServiceError::NotFound(format!("{} is not a directory", path)));
        }

        let entries = fs::read_dir(&full).map_err(|e| ServiceError::from_io(path, e))?;

        let mut results = Vec::new();
        for entry_result in entries {
            let entry = match entry_result {
                Ok(e) => e,
                Err(e) => {
                    debug!(path = %path, error = %e, "Skipping unreadable directory entry");
                    continue;
                }
            };

            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(raw) => {
                    debug!(path = %path, name = ?raw, "Skipping entry with non UTF-8 name");
                    continue;
                }
            };

            // Does not follow symlinks. Entries removed since read_dir are skipped.
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };

            results.push(ListedEntry::from_metadata(name, &metadata));
        }

        results.sort_by(page::compare);
        Ok(results)
    }

    /// One page of the visible entries of `path`.
    pub fn page(&self, path: &RelativePath, page: &Page) -> ServiceResult<PageSlice<ListedEntry>> {
        let entries = self.list(path)?;
        Ok(page::paginate(&entries, page, ListedEntry::is_visible))
    }
}
