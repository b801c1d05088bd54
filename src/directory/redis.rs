use async_trait::async_trait;
use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use std::time::Duration;
use tracing::{debug, error};

use super::{Directory, DirectoryError};

/// Default key prefix for route entries
pub const DEFAULT_KEY_PREFIX: &str = "conduit:route:";

/// Directory stored in Redis, one string key per device identity.
///
/// Keys are `<prefix><identity>`. When a TTL is configured every `set`
/// refreshes the expiry, so entries left behind by a crashed connection
/// layer eventually disappear.
#[derive(Clone)]
pub struct RedisDirectory {
    pool: Pool,
    key_prefix: String,
    ttl: Option<Duration>,
}

impl RedisDirectory {
    /// Create a directory using the default key prefix and no expiry.
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            ttl: None,
        }
    }

    /// Set the key prefix
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Expire entries after `ttl` unless refreshed by another `set`
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    fn key(&self, identity: &str) -> String {
        format!("{}{}", self.key_prefix, identity)
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, DirectoryError> {
        self.pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get Redis connection for directory");
            DirectoryError::StoreUnavailable(e.to_string())
        })
    }
}

#[async_trait]
impl Directory for RedisDirectory {
    async fn set(&self, identity: &str, route: &str) -> Result<(), DirectoryError> {
        let mut conn = self.connection().await?;
        let key = self.key(identity);

        let mut set = cmd("SET");
        set.arg(&key).arg(route);
        if let Some(ttl) = self.ttl {
            set.arg("EX").arg(ttl.as_secs().max(1));
        }

        let _: () = set
            .query_async(&mut conn)
            .await
            .map_err(|e| DirectoryError::StoreUnavailable(e.to_string()))?;

        debug!(identity = %identity, route = %route, "Route registered");
        Ok(())
    }

    async fn get(&self, identity: &str) -> Result<Option<String>, DirectoryError> {
        let mut conn = self.connection().await?;

        cmd("GET")
            .arg(self.key(identity))
            .query_async(&mut conn)
            .await
            .map_err(|e| DirectoryError::StoreUnavailable(e.to_string()))
    }

    async fn delete(&self, identity: &str) -> Result<(), DirectoryError> {
        let mut conn = self.connection().await?;

        let removed: u64 = cmd("DEL")
            .arg(self.key(identity))
            .query_async(&mut conn)
            .await
            .map_err(|e| DirectoryError::StoreUnavailable(e.to_string()))?;

        debug!(identity = %identity, removed = removed, "Route removed");
        Ok(())
    }
}
