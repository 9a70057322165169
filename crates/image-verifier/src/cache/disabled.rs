use std::time::Duration;

use async_trait::async_trait;

use super::{Cache, CacheError};

/// No-op cache used when caching is disabled by configuration.
pub struct DisabledCache;

#[async_trait]
impl Cache for DisabledCache {
    async fn get(&self, _key: &str) -> Result<String, CacheError> {
        Err(CacheError::Disabled)
    }

    async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }

    async fn keys(&self, _pattern: &str) -> Result<Vec<String>, CacheError> {
        Ok(Vec::new())
    }

    async fn del(&self, _keys: &[String]) -> Result<(), CacheError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_miss_writes_succeed() {
        let cache = DisabledCache;
        assert!(matches!(cache.get("key").await, Err(CacheError::Disabled)));
        assert!(cache
            .set("key", "value".to_string(), Duration::from_secs(1))
            .await
            .is_ok());
        assert!(cache.ping().await.is_ok());
        assert!(cache.keys("*").await.unwrap().is_empty());
        assert!(cache.del(&["key".to_string()]).await.is_ok());
    }
}
