use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, TlsCertificates};

use super::{Cache, CacheError};

const DEFAULT_REDIS_PORT: u16 = 6379;

/// Redis-backed cache. Host and password come from the environment, the
/// TLS root certificate from the mounted cert directory.
pub struct RedisCache {
    connection: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(cert_dir: &Path) -> Result<Self, CacheError> {
        let host = std::env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string());
        let password = std::env::var("REDIS_PASSWORD").unwrap_or_default();

        let root_cert = std::fs::read(cert_dir.join("tls.crt"))
            .map_err(|e| CacheError::Backend(format!("could not read redis cert: {e}")))?;

        let url = format!("rediss://:{password}@{host}:{DEFAULT_REDIS_PORT}");
        let client = Client::build_with_tls(
            url,
            TlsCertificates {
                client_tls: None,
                root_cert: Some(root_cert),
            },
        )
        .map_err(|e| CacheError::Backend(e.to_string()))?;

        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;

        Ok(RedisCache { connection })
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<String, CacheError> {
        let mut connection = self.connection.clone();
        let value: Option<String> = connection
            .get(key)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        value.ok_or_else(|| CacheError::Miss(key.to_string()))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let mut connection = self.connection.clone();
        connection
            .set_ex::<_, _, ()>(key, value, ttl.as_secs())
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut connection = self.connection.clone();
        redis::cmd("PING")
            .query_async::<()>(&mut connection)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let mut connection = self.connection.clone();
        connection
            .keys(pattern)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))
    }

    async fn del(&self, keys: &[String]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut connection = self.connection.clone();
        connection
            .del::<_, ()>(keys)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))
    }
}
