//! Redis cache backend.
//!
//! Each entry occupies two keys under the configured prefix: the value at
//! `prefix + key` and the version at `prefix + key.derive("ver")`. Both are
//! written with a single `MSET` and read with a single `MGET`, so readers
//! never pair a value with the wrong version.
//!
//! The multiplexed connection is shared by all requests; it pipelines
//! concurrent commands over one socket.

use bytes::Bytes;
use model::{CacheKey, CacheVersion};
use redis::aio::MultiplexedConnection;
use tokio::sync::RwLock;
use tracing::{info, warn};
use url::Url;

use super::{CacheError, CachedContent, VersionedCache};

/// Connection settings for [`RedisCache`].
#[derive(Debug, Clone, Default)]
pub struct RedisCacheConfig {
    /// `host:port` of the server.
    pub address: String,
    /// Sent with `AUTH` during the handshake when set.
    pub password: Option<String>,
    /// Prepended to every key.
    pub prefix: String,
}

/// Cache stored on a Redis-compatible server.
pub struct RedisCache {
    connection: RwLock<Option<MultiplexedConnection>>,
    prefix: Vec<u8>,
}

impl RedisCache {
    /// Dial the server, authenticate and check it answers `PING`.
    pub async fn connect(config: &RedisCacheConfig) -> Result<Self, CacheError> {
        let url = connection_url(config)?;
        let client = redis::Client::open(url.as_str())
            .map_err(|e| CacheError::BackendUnavailable(format!("invalid address {}: {}", config.address, e)))?;

        let mut connection = client.get_multiplexed_async_connection().await.map_err(|e| {
            CacheError::BackendUnavailable(format!("connect to {}: {}", config.address, e))
        })?;

        let pong: String = redis::cmd("PING")
            .query_async(&mut connection)
            .await
            .map_err(|e| CacheError::BackendUnavailable(format!("ping {}: {}", config.address, e)))?;
        if pong != "PONG" {
            return Err(CacheError::BackendUnavailable(format!(
                "unexpected PING reply from {}: {}",
                config.address, pong
            )));
        }

        info!(address = %config.address, prefix = %config.prefix, "Connected to redis cache");
        Ok(Self {
            connection: RwLock::new(Some(connection)),
            prefix: config.prefix.as_bytes().to_vec(),
        })
    }

    fn data_key(&self, key: &CacheKey) -> Vec<u8> {
        [self.prefix.as_slice(), key.as_bytes()].concat()
    }

    fn version_key(&self, key: &CacheKey) -> Result<Vec<u8>, CacheError> {
        Ok([self.prefix.as_slice(), key.derive("ver")?.as_bytes()].concat())
    }

    async fn connection(&self) -> Result<MultiplexedConnection, CacheError> {
        self.connection.read().await.clone().ok_or(CacheError::Closed)
    }

    /// Whether [`VersionedCache::close`] has been called.
    pub async fn is_closed(&self) -> bool {
        self.connection.read().await.is_none()
    }
}

/// Build the `redis://` URL for `config`, percent-encoding the password.
fn connection_url(config: &RedisCacheConfig) -> Result<Url, CacheError> {
    let mut url = Url::parse(&format!("redis://{}/", config.address))
        .map_err(|e| CacheError::BackendUnavailable(format!("invalid address {}: {}", config.address, e)))?;

    if let Some(password) = &config.password {
        url.set_password(Some(password)).map_err(|_| {
            CacheError::BackendUnavailable(format!("cannot use a password with {}", config.address))
        })?;
    }

    Ok(url)
}

impl VersionedCache for RedisCache {
    async fn put(
        &self,
        key: &CacheKey,
        version: &CacheVersion,
        value: Bytes,
    ) -> Result<(), CacheError> {
        let mut connection = self.connection().await?;

        let () = redis::cmd("MSET")
            .arg(self.data_key(key))
            .arg(&value[..])
            .arg(self.version_key(key)?)
            .arg(version.as_bytes())
            .query_async(&mut connection)
            .await
            .map_err(|e| CacheError::BackendUnavailable(format!("MSET failed: {}", e)))?;

        Ok(())
    }

    /// Transport and decode errors are logged and reported as misses; the
    /// following `put` surfaces a lost connection.
    async fn get(
        &self,
        key: &CacheKey,
        version: &CacheVersion,
    ) -> Result<Option<Bytes>, CacheError> {
        let mut connection = self.connection().await?;

        let result: redis::RedisResult<Vec<Option<Vec<u8>>>> = redis::cmd("MGET")
            .arg(self.version_key(key)?)
            .arg(self.data_key(key))
            .query_async(&mut connection)
            .await;

        let values = match result {
            Ok(values) => values,
            Err(e) => {
                warn!(?key, error = %e, "Redis cache read failed, treating as miss");
                return Ok(None);
            }
        };

        match values.as_slice() {
            [Some(stored), Some(data)] if stored.as_slice() == version.as_bytes() => {
                Ok(Some(Bytes::from(data.clone())))
            }
            _ => Ok(None),
        }
    }

    /// Values are served from memory, so the handle can be served any
    /// number of times.
    async fn get_content(
        &self,
        key: &CacheKey,
        version: &CacheVersion,
        content_type: &str,
    ) -> Result<Option<CachedContent>, CacheError> {
        Ok(self.get(key, version).await?.map(|bytes| CachedContent::Bytes {
            bytes,
            content_type: content_type.to_string(),
        }))
    }

    /// Drop the connection. Idempotent; later operations fail with
    /// [`CacheError::Closed`].
    async fn close(&self) -> Result<(), CacheError> {
        if self.connection.write().await.take().is_some() {
            info!("Closed redis cache connection");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_url_without_password() {
        let config = RedisCacheConfig {
            address: "127.0.0.1:6379".to_string(),
            ..Default::default()
        };
        assert_eq!(connection_url(&config).unwrap().as_str(), "redis://127.0.0.1:6379/");
    }

    #[test]
    fn test_connection_url_encodes_password() {
        let config = RedisCacheConfig {
            address: "localhost:6379".to_string(),
            password: Some("p@ss/word".to_string()),
            prefix: String::new(),
        };
        let url = connection_url(&config).unwrap();
        assert_eq!(url.host_str(), Some("localhost"));
        assert_eq!(url.port(), Some(6379));
        assert_eq!(url.password(), Some("p%40ss%2Fword"));
    }

    #[test]
    fn test_connection_url_rejects_garbage() {
        let config = RedisCacheConfig {
            address: "not a host".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            connection_url(&config),
            Err(CacheError::BackendUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_refused_is_backend_unavailable() {
        // Bind and drop a listener to find a port nobody is listening on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let config = RedisCacheConfig {
            address,
            ..Default::default()
        };
        let err = RedisCache::connect(&config).await.err().unwrap();
        assert!(matches!(err, CacheError::BackendUnavailable(_)));
    }
}
