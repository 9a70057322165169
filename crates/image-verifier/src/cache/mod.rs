mod disabled;
mod redis;

pub use disabled::DisabledCache;
pub use redis::RedisCache;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache disabled")]
    Disabled,
    #[error("cache miss for {0}")]
    Miss(String),
    #[error("cache backend error: {0}")]
    Backend(String),
}

/// A previous validation result for an image, keyed by the image's
/// original string. At most one of the two fields is non-empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedEntry {
    pub digest: String,
    pub error: String,
}

/// Capability over the validation-result cache. The disabled variant
/// answers every read with a miss and turns writes into no-ops, so
/// callers never branch on whether caching is active.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<String, CacheError>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;
    async fn ping(&self) -> Result<(), CacheError>;
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError>;
    async fn del(&self, keys: &[String]) -> Result<(), CacheError>;
}

/// Builds the process-wide cache. A non-positive expiry disables caching
/// entirely; a failing backend connection degrades to the disabled cache
/// instead of blocking admissions.
pub async fn new_cache(expiry_seconds: i64, cert_dir: &Path) -> Arc<dyn Cache> {
    if expiry_seconds <= 0 {
        return Arc::new(DisabledCache);
    }

    match RedisCache::connect(cert_dir).await {
        Ok(cache) => Arc::new(cache),
        Err(e) => {
            warn!(error = %e, "cannot connect to cache, falling back to disabled cache");
            Arc::new(DisabledCache)
        }
    }
}
