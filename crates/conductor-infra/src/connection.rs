//! Shared Redis connection settings

use crate::{InfraError, Result};
use redis::aio::ConnectionManager;
use redis::Client;
use tracing::info;

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: String::from("redis://127.0.0.1:6379"),
            key_prefix: String::from("conductor:"),
        }
    }
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_key_prefix(mut self, prefix: Option<String>) -> Self {
        if let Some(prefix) = prefix {
            self.key_prefix = prefix;
        }
        self
    }

    /// `{prefix}{kind}:{id}`
    pub fn key(&self, kind: &str, id: &str) -> String {
        format!("{}{}:{}", self.key_prefix, kind, id)
    }

    pub async fn connect(&self) -> Result<ConnectionManager> {
        info!(url = %self.url, "Connecting to Redis");

        let client = Client::open(self.url.clone())?;
        let connection = ConnectionManager::new(client).await?;

        let _: () = redis::cmd("PING")
            .query_async(&mut connection.clone())
            .await
            .map_err(|e| InfraError::Configuration(format!("Redis ping failed: {}", e)))?;

        info!("Redis connection established");
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let config = RedisConfig::new("redis://localhost:6379");
        assert_eq!(config.key("run", "abc"), "conductor:run:abc");

        let config = config.with_key_prefix(Some("staging:".to_string()));
        assert_eq!(config.key("lock", "env:prod"), "staging:lock:env:prod");

        let config = config.with_key_prefix(None);
        assert_eq!(config.key_prefix, "staging:");
    }
}
