//! Filesystem cache backend.
//!
//! Every key maps to one file below the cache root, named with the URL-safe
//! base64 encoding of the key bytes. Names longer than [`MAX_COMPONENT_LEN`]
//! are cut into chunks; every chunk but the last becomes a directory with the
//! [`DIR_SUFFIX`] appended. Base64 never contains a `.`, so entry files and
//! chunk directories cannot share a name. The entry version lives in the
//! extended attribute [`VERSION_ATTR`] of that file.
//!
//! Writes go to a temporary file in the directory of the final name. The
//! version attribute is set on the temporary file before it is renamed over
//! the final name, so a reader sees either the complete old entry, the
//! complete new entry, or nothing. Stray temporary files left behind by a
//! crash start with `.tmp` and never collide with entry names.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use bytes::Bytes;
use model::{CacheKey, CacheVersion};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::{CacheError, CachedContent, VersionedCache};

/// Extended attribute holding the entry version.
///
/// Unprivileged processes may only use the `user.` namespace.
pub const VERSION_ATTR: &str = "user.lightbox.cache-version";

/// Longest chunk of an encoded key used as one path component.
///
/// Leaves room below the usual 255-byte `NAME_MAX` for [`DIR_SUFFIX`].
pub const MAX_COMPONENT_LEN: usize = 200;

/// Marks a directory holding a chunk of a long entry name.
pub const DIR_SUFFIX: &str = ".d";

/// Cache storing one file per key.
#[derive(Debug, Clone)]
pub struct FileCache {
    root: PathBuf,
}

impl FileCache {
    /// Open a cache rooted at `root`.
    ///
    /// The directory must exist, and its filesystem must support user
    /// extended attributes.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, CacheError> {
        let root = root.as_ref().to_path_buf();

        let metadata = fs::metadata(&root).map_err(|e| {
            CacheError::io(format!("cache directory {}", root.display()), e)
        })?;
        if !metadata.is_dir() {
            return Err(CacheError::io(
                format!("cache directory {}", root.display()),
                io::Error::new(io::ErrorKind::NotADirectory, "not a directory"),
            ));
        }

        if !xattr::SUPPORTED_PLATFORM {
            return Err(CacheError::Unsupported(
                "extended attributes are not available on this platform".to_string(),
            ));
        }
        probe_xattr_support(&root)?;

        info!(root = %root.display(), "Opened file cache");
        Ok(Self { root })
    }

    /// The cache root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File name for `key`.
    pub fn file_name(key: &CacheKey) -> String {
        URL_SAFE.encode(key.as_bytes())
    }

    /// Full path of the file backing `key`.
    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        let name = Self::file_name(key);
        let mut path = self.root.clone();

        // Base64 output is ASCII, so every byte offset is a char boundary.
        let mut rest = name.as_str();
        while rest.len() > MAX_COMPONENT_LEN {
            let (chunk, tail) = rest.split_at(MAX_COMPONENT_LEN);
            path.push(format!("{}{}", chunk, DIR_SUFFIX));
            rest = tail;
        }
        path.push(rest);
        path
    }

    async fn blocking<T, F>(f: F) -> Result<T, CacheError>
    where
        F: FnOnce() -> Result<T, CacheError> + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| CacheError::Task(e.to_string()))?
    }
}

/// Check that `root` accepts user extended attributes.
fn probe_xattr_support(root: &Path) -> Result<(), CacheError> {
    let probe = NamedTempFile::new_in(root)
        .map_err(|e| CacheError::io(format!("create probe file in {}", root.display()), e))?;

    xattr::set(probe.path(), VERSION_ATTR, b"probe").map_err(|e| {
        CacheError::Unsupported(format!(
            "filesystem of {} does not support extended attributes: {}",
            root.display(),
            e
        ))
    })
}

/// Whether `path` holds an entry at `version`.
///
/// Every failure is a miss: missing file, something other than a regular
/// file, missing or unreadable attribute, or a different version.
fn check_entry(path: &Path, version: &CacheVersion) -> bool {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                debug!(path = %path.display(), error = %e, "Cache entry stat failed");
            }
            return false;
        }
    };

    if !metadata.is_file() {
        debug!(path = %path.display(), "Corrupt cache entry: not a regular file");
        return false;
    }

    match xattr::get(path, VERSION_ATTR) {
        Ok(Some(stored)) if stored == version.as_bytes() => true,
        Ok(Some(_)) => {
            debug!(path = %path.display(), "Outdated cache entry");
            false
        }
        Ok(None) => {
            debug!(path = %path.display(), "Corrupt cache entry: no version attribute");
            false
        }
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Corrupt cache entry: unreadable version attribute");
            false
        }
    }
}

/// Write `value` and `version` to a temporary file and rename it to `path`.
fn write_entry(root: &Path, path: &Path, version: &CacheVersion, value: &[u8]) -> Result<(), CacheError> {
    let dir = path.parent().unwrap_or(root);
    if dir != root {
        fs::create_dir_all(dir)
            .map_err(|e| CacheError::io(format!("create directory {}", dir.display()), e))?;
    }

    let mut temp = NamedTempFile::new_in(dir)
        .map_err(|e| CacheError::io(format!("create temporary file in {}", dir.display()), e))?;

    temp.write_all(value).map_err(|e| {
        if e.kind() == io::ErrorKind::WriteZero {
            CacheError::ShortWrite(temp.path().to_path_buf())
        } else {
            CacheError::io(format!("write {}", temp.path().display()), e)
        }
    })?;

    xattr::set(temp.path(), VERSION_ATTR, version.as_bytes())
        .map_err(|e| CacheError::io(format!("set version on {}", temp.path().display()), e))?;

    // Dropping the temporary file on any error above removes it.
    temp.persist(path)
        .map_err(|e| CacheError::io(format!("commit {}", path.display()), e.error))?;

    Ok(())
}

impl VersionedCache for FileCache {
    async fn put(
        &self,
        key: &CacheKey,
        version: &CacheVersion,
        value: Bytes,
    ) -> Result<(), CacheError> {
        let root = self.root.clone();
        let path = self.entry_path(key);
        let version = version.clone();

        Self::blocking(move || write_entry(&root, &path, &version, &value)).await
    }

    async fn get(
        &self,
        key: &CacheKey,
        version: &CacheVersion,
    ) -> Result<Option<Bytes>, CacheError> {
        let path = self.entry_path(key);
        let version = version.clone();

        Self::blocking(move || {
            if !check_entry(&path, &version) {
                return Ok(None);
            }
            match fs::read(&path) {
                Ok(bytes) => Ok(Some(Bytes::from(bytes))),
                // Replaced by a concurrent writer between check and read.
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(CacheError::io(format!("read {}", path.display()), e)),
            }
        })
        .await
    }

    async fn get_content(
        &self,
        key: &CacheKey,
        version: &CacheVersion,
        content_type: &str,
    ) -> Result<Option<CachedContent>, CacheError> {
        let path = self.entry_path(key);
        let version = version.clone();
        let content_type = content_type.to_string();

        Self::blocking(move || {
            Ok(check_entry(&path, &version).then_some(CachedContent::File { path, content_type }))
        })
        .await
    }

    /// Nothing to release; calling this any number of times is fine.
    async fn close(&self) -> Result<(), CacheError> {
        Ok(())
    }
}
