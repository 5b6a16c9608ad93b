//! Cache-Aside Store
//!
//! Reads go cache first, then the durable store; writes invalidate then
//! refresh. Values are JSON-encoded and every entry carries a TTL.
//!
//! Backends:
//! - [`RedisCache`] for deployments
//! - [`MemoryCache`] for local runs and tests

pub mod memory;
pub mod redis;

pub use self::memory::MemoryCache;
pub use self::redis::RedisCache;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

/// Fallback entry lifetime when none is configured
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("cache backend: {0}")]
    Backend(String),

    #[error("cache encode: {0}")]
    Encode(String),

    #[error("cache decode: {0}")]
    Decode(String),
}

impl From<::redis::RedisError> for CacheError {
    fn from(e: ::redis::RedisError) -> Self {
        CacheError::Backend(e.to_string())
    }
}

/// Key-value cache with per-entry expiry
///
/// `get` returns `Ok(None)` on a miss; `Err` is reserved for transport or
/// backend failures so callers can tell the two apart.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Per-read cache policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheControl {
    /// Serve from cache when present
    #[default]
    Default,
    /// Skip the cache read, go to the store, then refresh the cache
    MustRevalidate,
}

impl CacheControl {
    /// Parse a `Cache-Control` header value
    ///
    /// Only `must-revalidate` is recognised; everything else is `Default`.
    pub fn from_header(value: Option<&str>) -> Self {
        let revalidate = value
            .map(|v| {
                v.split(',')
                    .any(|d| d.trim().eq_ignore_ascii_case("must-revalidate"))
            })
            .unwrap_or(false);
        if revalidate {
            CacheControl::MustRevalidate
        } else {
            CacheControl::Default
        }
    }
}

/// Where a fetched value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Cache,
    Store,
}

/// Result of a cache-aside read
#[derive(Debug)]
pub struct Fetched<T> {
    pub value: T,
    pub source: Source,
    /// Cache failure observed after a successful store read
    pub cache_error: Option<CacheError>,
}

/// JSON cache-aside helper over any [`CacheStore`]
#[derive(Clone)]
pub struct CacheAside {
    cache: Arc<dyn CacheStore>,
    ttl: Duration,
}

impl CacheAside {
    /// A zero `ttl` falls back to [`DEFAULT_TTL`]
    pub fn new(cache: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        let ttl = if ttl.is_zero() { DEFAULT_TTL } else { ttl };
        Self { cache, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    /// Read and decode a cached value
    pub async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.cache.get(key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| CacheError::Decode(e.to_string())),
            None => Ok(None),
        }
    }

    /// Invalidate, then store the fresh value
    pub async fn write<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        let raw = serde_json::to_string(value).map_err(|e| CacheError::Encode(e.to_string()))?;
        self.cache.delete(key).await?;
        self.cache.set(key, &raw, self.ttl).await
    }

    pub async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        self.cache.delete(key).await
    }

    /// Cache-aside read
    ///
    /// Under [`CacheControl::Default`] a hit is returned directly; a miss loads
    /// from the store and refreshes the cache. [`CacheControl::MustRevalidate`]
    /// skips the read. Store errors and cache read errors propagate. A failed
    /// refresh after a good store read is reported in [`Fetched::cache_error`].
    pub async fn fetch<T, E, F, Fut>(
        &self,
        key: &str,
        control: CacheControl,
        loader: F,
    ) -> Result<Fetched<T>, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if control == CacheControl::Default {
            if let Some(value) = self.read::<T>(key).await? {
                debug!(key, "cache hit");
                return Ok(Fetched {
                    value,
                    source: Source::Cache,
                    cache_error: None,
                });
            }
            debug!(key, "cache miss");
        }

        let value = loader().await?;
        let cache_error = self.write(key, &value).await.err();
        Ok(Fetched {
            value,
            source: Source::Store,
            cache_error,
        })
    }
}
