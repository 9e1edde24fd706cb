//! Versioned caches for derived artifacts.
//!
//! A versioned cache stores at most one value per key, tagged with the
//! version it was produced for. A lookup is a hit only when the stored
//! version equals the requested one byte-for-byte; anything else is a miss,
//! and the next fill overwrites the entry.
//!
//! ## Backends
//!
//! - [`FileCache`]: one file per key, version in an extended attribute,
//!   committed with an atomic rename
//! - [`RedisCache`]: value and version as two keys on a Redis-compatible
//!   server, written with one `MSET`
//! - [`EmbeddedCache`]: a [`RedisCache`] talking to an in-process server on
//!   the loopback interface
//!
//! Entries are never evicted or expired. Concurrent fills for the same key
//! are not coalesced: both fillers run and the last write wins. Each write
//! is atomic, so a reader never sees a torn entry.

pub mod embedded;
pub mod file;
pub mod redis;

use std::future::Future;
use std::io;
use std::path::PathBuf;

use bytes::Bytes;
use model::{CacheKey, CacheVersion, ModelError};
use thiserror::Error;

use crate::config::CacheConfig;

pub use embedded::{EmbeddedCache, EmbeddedServer};
pub use file::FileCache;
pub use redis::{RedisCache, RedisCacheConfig};

/// Errors reported by cache backends.
///
/// Version mismatches and corrupt entries are misses and never show up here.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A filesystem operation failed.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// Fewer bytes than expected reached the temporary file.
    #[error("short write to {0}")]
    ShortWrite(PathBuf),

    /// The backend cannot work on this system or configuration.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The backend could not be reached or lost its connection.
    #[error("cache backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The cache was used after `close`.
    #[error("cache is closed")]
    Closed,

    /// A key could not be encoded.
    #[error("invalid cache key: {0}")]
    Key(#[from] ModelError),

    /// A background task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}

impl CacheError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        CacheError::Io {
            context: context.into(),
            source,
        }
    }
}

/// What a filler produced on a miss.
#[derive(Debug, Clone)]
pub struct Filled {
    /// Version to store the value under.
    pub version: CacheVersion,
    pub value: Bytes,
}

impl Filled {
    pub fn new(version: CacheVersion, value: impl Into<Bytes>) -> Self {
        Self {
            version,
            value: value.into(),
        }
    }
}

/// A cached value ready to be streamed to a client.
#[derive(Debug, Clone)]
pub enum CachedContent {
    /// Served from a file. The file is opened again on every serve, so
    /// serving twice yields whatever the file holds at that time.
    File { path: PathBuf, content_type: String },

    /// Served from memory. Serving twice yields identical bytes.
    Bytes { bytes: Bytes, content_type: String },
}

impl CachedContent {
    pub fn content_type(&self) -> &str {
        match self {
            CachedContent::File { content_type, .. } => content_type,
            CachedContent::Bytes { content_type, .. } => content_type,
        }
    }

    /// Load the whole value into memory.
    pub async fn read_all(&self) -> io::Result<Bytes> {
        match self {
            CachedContent::File { path, .. } => Ok(Bytes::from(tokio::fs::read(path).await?)),
            CachedContent::Bytes { bytes, .. } => Ok(bytes.clone()),
        }
    }
}

/// Trait implemented by every cache backend.
///
/// Fillers are only invoked on a miss. A filler error is returned to the
/// caller unchanged and nothing is stored; cache errors are converted into
/// the caller's error type.
#[allow(async_fn_in_trait)]
pub trait VersionedCache: Send + Sync {
    /// Store `value` under `key`, replacing any previous entry.
    async fn put(
        &self,
        key: &CacheKey,
        version: &CacheVersion,
        value: Bytes,
    ) -> Result<(), CacheError>;

    /// Look up `key` at `version`. `Ok(None)` is a miss.
    async fn get(&self, key: &CacheKey, version: &CacheVersion)
        -> Result<Option<Bytes>, CacheError>;

    /// Like [`VersionedCache::get`], but returns a handle that can stream
    /// the value without loading it first.
    async fn get_content(
        &self,
        key: &CacheKey,
        version: &CacheVersion,
        content_type: &str,
    ) -> Result<Option<CachedContent>, CacheError>;

    /// Release backend resources.
    async fn close(&self) -> Result<(), CacheError>;

    /// Return the value for `key` at `version`, invoking `filler` on a miss
    /// and storing what it produces.
    async fn get_or_fill<F, Fut, E>(
        &self,
        key: &CacheKey,
        version: &CacheVersion,
        filler: F,
    ) -> Result<Bytes, E>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Filled, E>> + Send,
        E: From<CacheError> + Send,
    {
        if let Some(value) = self.get(key, version).await? {
            tracing::trace!(?key, "cache hit");
            return Ok(value);
        }

        tracing::debug!(?key, "cache miss, filling");
        let filled = filler().await?;
        self.put(key, &filled.version, filled.value.clone()).await?;
        Ok(filled.value)
    }

    /// Like [`VersionedCache::get_or_fill`], but returns a streamable handle.
    ///
    /// Freshly filled values are served from memory.
    async fn get_or_fill_handler<F, Fut, E>(
        &self,
        key: &CacheKey,
        version: &CacheVersion,
        filler: F,
        content_type: &str,
    ) -> Result<CachedContent, E>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Filled, E>> + Send,
        E: From<CacheError> + Send,
    {
        if let Some(content) = self.get_content(key, version, content_type).await? {
            tracing::trace!(?key, "cache hit");
            return Ok(content);
        }

        tracing::debug!(?key, "cache miss, filling");
        let filled = filler().await?;
        self.put(key, &filled.version, filled.value.clone()).await?;
        Ok(CachedContent::Bytes {
            bytes: filled.value,
            content_type: content_type.to_string(),
        })
    }
}

/// The cache backend selected at startup.
pub enum Cache {
    File(FileCache),
    Redis(RedisCache),
    Embedded(EmbeddedCache),
}

impl Cache {
    /// Build the backend described by `config`.
    ///
    /// Fails if the backend cannot be reached or initialised.
    pub async fn from_config(config: &CacheConfig) -> Result<Self, CacheError> {
        match config {
            CacheConfig::File { dir } => Ok(Cache::File(FileCache::new(dir)?)),
            CacheConfig::Redis {
                address,
                password,
                prefix,
            } => {
                let config = RedisCacheConfig {
                    address: address.clone(),
                    password: password.clone(),
                    prefix: prefix.clone(),
                };
                Ok(Cache::Redis(RedisCache::connect(&config).await?))
            }
            CacheConfig::Embedded { prefix } => {
                Ok(Cache::Embedded(EmbeddedCache::start(prefix).await?))
            }
        }
    }

    /// Backend name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Cache::File(_) => "file",
            Cache::Redis(_) => "redis",
            Cache::Embedded(_) => "embedded",
        }
    }
}

impl VersionedCache for Cache {
    async fn put(
        &self,
        key: &CacheKey,
        version: &CacheVersion,
        value: Bytes,
    ) -> Result<(), CacheError> {
        match self {
            Cache::File(c) => c.put(key, version, value).await,
            Cache::Redis(c) => c.put(key, version, value).await,
            Cache::Embedded(c) => c.put(key, version, value).await,
        }
    }

    async fn get(
        &self,
        key: &CacheKey,
        version: &CacheVersion,
    ) -> Result<Option<Bytes>, CacheError> {
        match self {
            Cache::File(c) => c.get(key, version).await,
            Cache::Redis(c) => c.get(key, version).await,
            Cache::Embedded(c) => c.get(key, version).await,
        }
    }

    async fn get_content(
        &self,
        key: &CacheKey,
        version: &CacheVersion,
        content_type: &str,
    ) -> Result<Option<CachedContent>, CacheError> {
        match self {
            Cache::File(c) => c.get_content(key, version, content_type).await,
            Cache::Redis(c) => c.get_content(key, version, content_type).await,
            Cache::Embedded(c) => c.get_content(key, version, content_type).await,
        }
    }

    async fn close(&self) -> Result<(), CacheError> {
        match self {
            Cache::File(c) => c.close().await,
            Cache::Redis(c) => c.close().await,
            Cache::Embedded(c) => c.close().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Debug, Error)]
    enum TestError {
        #[error("filler failed")]
        Filler,
        #[error(transparent)]
        Cache(#[from] CacheError),
    }

    fn key(s: &str) -> CacheKey {
        CacheKey::new(&("test", s)).unwrap()
    }

    async fn exercise_contract(cache: &Cache) {
        let k = key("contract");
        let v1 = CacheVersion::from_bytes("v1");
        let v2 = CacheVersion::from_bytes("v2");
        let calls = AtomicUsize::new(0);

        let value = cache
            .get_or_fill(&k, &v1, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>(Filled::new(v1.clone(), &b"first"[..]))
            })
            .await
            .unwrap();
        assert_eq!(&value[..], b"first");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let value = cache
            .get_or_fill(&k, &v1, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>(Filled::new(v1.clone(), &b"second"[..]))
            })
            .await
            .unwrap();
        assert_eq!(&value[..], b"first");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let value = cache
            .get_or_fill(&k, &v2, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>(Filled::new(v2.clone(), &b"third"[..]))
            })
            .await
            .unwrap();
        assert_eq!(&value[..], b"third");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.get(&k, &v1).await.unwrap(), None);
        assert_eq!(cache.get(&k, &v2).await.unwrap().unwrap(), &b"third"[..]);

        let err = cache
            .get_or_fill(&key("failing"), &v1, || async {
                Err::<Filled, _>(TestError::Filler)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TestError::Filler));
        assert_eq!(cache.get(&key("failing"), &v1).await.unwrap(), None);

        let content = cache
            .get_or_fill_handler(
                &key("handler"),
                &v1,
                || async { Ok::<_, TestError>(Filled::new(v1.clone(), &b"jpeg"[..])) },
                "image/jpeg",
            )
            .await
            .unwrap();
        assert_eq!(content.content_type(), "image/jpeg");
        assert_eq!(&content.read_all().await.unwrap()[..], b"jpeg");
        assert_eq!(&content.read_all().await.unwrap()[..], b"jpeg");

        let content = cache
            .get_or_fill_handler(
                &key("handler"),
                &v1,
                || async { Err::<Filled, _>(TestError::Filler) },
                "image/jpeg",
            )
            .await
            .unwrap();
        assert_eq!(&content.read_all().await.unwrap()[..], b"jpeg");
    }

    #[tokio::test]
    async fn test_file_backend_contract() {
        let dir = TempDir::new().unwrap();
        if !xattr::SUPPORTED_PLATFORM {
            return;
        }
        let cache = match FileCache::new(dir.path()) {
            Ok(cache) => Cache::File(cache),
            // tmpfs without user xattrs
            Err(CacheError::Unsupported(_)) => return,
            Err(e) => panic!("unexpected error: {}", e),
        };
        exercise_contract(&cache).await;
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_embedded_backend_contract() {
        let cache = Cache::Embedded(EmbeddedCache::start("test:").await.unwrap());
        assert_eq!(cache.kind(), "embedded");
        exercise_contract(&cache).await;
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_from_config_file_missing_dir() {
        let dir = TempDir::new().unwrap();
        let config = CacheConfig::File {
            dir: dir.path().join("missing"),
        };
        assert!(Cache::from_config(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_cached_content_bytes() {
        let content = CachedContent::Bytes {
            bytes: Bytes::from_static(b"abc"),
            content_type: "text/plain".to_string(),
        };
        assert_eq!(content.content_type(), "text/plain");
        assert_eq!(&content.read_all().await.unwrap()[..], b"abc");
    }
}
