//! Redis lease backend
//!
//! A lease is a JSON [`ResourceLock`] stored at `{prefix}lock:{resource}` with
//! a millisecond expiry, so Redis drops it when the holder stops renewing.
//! Each run also has a `{prefix}held:{run_id}` set naming its resources. All
//! holder checks run inside Lua scripts so they are atomic with the write.

use crate::connection::RedisConfig;
use crate::{InfraError, Result};
use async_trait::async_trait;
use chrono::Utc;
use conductor_workflow::{AcquireOutcome, LockBackend, ResourceLock};
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tracing::debug;

/// KEYS: lock, held set. ARGV: run id, lease json, ttl ms, resource.
/// Returns the lease now stored under the key.
static ACQUIRE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local current = redis.call('GET', KEYS[1])
if current then
  local lease = cjson.decode(current)
  if lease.holder_run_id ~= ARGV[1] then
    return current
  end
  lease.expires_at = cjson.decode(ARGV[2]).expires_at
  current = cjson.encode(lease)
  redis.call('SET', KEYS[1], current, 'PX', ARGV[3])
  return current
end
redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
redis.call('SADD', KEYS[2], ARGV[4])
return ARGV[2]
"#,
    )
});

/// KEYS: lock. ARGV: run id, new expires_at, ttl ms. Nil when not held.
static RENEW: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local current = redis.call('GET', KEYS[1])
if not current then
  return false
end
local lease = cjson.decode(current)
if lease.holder_run_id ~= ARGV[1] then
  return false
end
lease.expires_at = ARGV[2]
local updated = cjson.encode(lease)
redis.call('SET', KEYS[1], updated, 'PX', ARGV[3])
return updated
"#,
    )
});

/// KEYS: lock, held set. ARGV: run id, resource. 1 when released.
static RELEASE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
redis.call('SREM', KEYS[2], ARGV[2])
local current = redis.call('GET', KEYS[1])
if not current then
  return 0
end
local lease = cjson.decode(current)
if lease.holder_run_id ~= ARGV[1] then
  return 0
end
redis.call('DEL', KEYS[1])
return 1
"#,
    )
});

#[derive(Clone)]
pub struct RedisLockBackend {
    connection: ConnectionManager,
    config: RedisConfig,
}

impl RedisLockBackend {
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let connection = config.connect().await?;
        Ok(Self { connection, config })
    }

    fn lock_key(&self, resource: &str) -> String {
        self.config.key("lock", resource)
    }

    fn held_key(&self, run_id: &str) -> String {
        self.config.key("held", run_id)
    }
}

fn ttl_ms(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

fn parse_lease(raw: &str) -> Result<ResourceLock> {
    Ok(serde_json::from_str(raw)?)
}

#[async_trait]
impl LockBackend for RedisLockBackend {
    async fn try_acquire(
        &self,
        key: &str,
        run_id: &str,
        ttl: Duration,
    ) -> conductor_workflow::Result<AcquireOutcome> {
        let lease = ResourceLock::new(key, run_id, ttl);
        let body = serde_json::to_string(&lease)?;
        let mut conn = self.connection.clone();

        let stored: String = ACQUIRE
            .key(self.lock_key(key))
            .key(self.held_key(run_id))
            .arg(run_id)
            .arg(body)
            .arg(ttl_ms(ttl))
            .arg(key)
            .invoke_async(&mut conn)
            .await
            .map_err(InfraError::from)?;

        let current = parse_lease(&stored)?;
        if current.holder_run_id == run_id {
            Ok(AcquireOutcome::Acquired(current))
        } else {
            debug!(resource = %key, run_id = %run_id, holder = %current.holder_run_id, "Lease is taken");
            Ok(AcquireOutcome::Blocked(current))
        }
    }

    async fn renew(
        &self,
        key: &str,
        run_id: &str,
        ttl: Duration,
    ) -> conductor_workflow::Result<Option<ResourceLock>> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        let mut conn = self.connection.clone();

        let updated: Option<String> = RENEW
            .key(self.lock_key(key))
            .arg(run_id)
            .arg(expires_at.to_rfc3339())
            .arg(ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(InfraError::from)?;

        Ok(updated.as_deref().map(parse_lease).transpose()?)
    }

    async fn release(&self, key: &str, run_id: &str) -> conductor_workflow::Result<bool> {
        let mut conn = self.connection.clone();
        let released: i64 = RELEASE
            .key(self.lock_key(key))
            .key(self.held_key(run_id))
            .arg(run_id)
            .arg(key)
            .invoke_async(&mut conn)
            .await
            .map_err(InfraError::from)?;
        Ok(released == 1)
    }

    async fn get(&self, key: &str) -> conductor_workflow::Result<Option<ResourceLock>> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.get(self.lock_key(key)).await.map_err(InfraError::from)?;
        Ok(raw.as_deref().map(parse_lease).transpose()?)
    }

    async fn held_by(&self, run_id: &str) -> conductor_workflow::Result<Vec<ResourceLock>> {
        let mut conn = self.connection.clone();
        let resources: Vec<String> = conn
            .smembers(self.held_key(run_id))
            .await
            .map_err(InfraError::from)?;

        let mut held = Vec::new();
        for resource in resources {
            match self.get(&resource).await? {
                Some(lease) if lease.holder_run_id == run_id => held.push(lease),
                _ => {
                    // Lapsed or taken over; drop it from the index
                    let _: () = conn
                        .srem(self.held_key(run_id), &resource)
                        .await
                        .map_err(InfraError::from)?;
                }
            }
        }
        held.sort_by(|a, b| a.resource_key.cmp(&b.resource_key));
        Ok(held)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_never_zero() {
        assert_eq!(ttl_ms(Duration::ZERO), 1);
        assert_eq!(ttl_ms(Duration::from_secs(2)), 2000);
    }

    #[test]
    fn test_lease_json_matches_script_fields() {
        let lease = ResourceLock::new("env:prod", "run-1", Duration::from_secs(30));
        let json: serde_json::Value = serde_json::to_value(&lease).unwrap();

        assert_eq!(json["holder_run_id"], "run-1");
        assert!(json["expires_at"].is_string());
        assert_eq!(parse_lease(&json.to_string()).unwrap(), lease);
    }

    // Needs a live server: REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored
    async fn backend() -> RedisLockBackend {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let prefix = format!("conductor-test-{}:", uuid::Uuid::new_v4());
        RedisLockBackend::new(RedisConfig::new(url).with_key_prefix(Some(prefix)))
            .await
            .expect("redis should be reachable")
    }

    #[tokio::test]
    #[ignore]
    async fn test_mutual_exclusion() {
        let backend = backend().await;
        let ttl = Duration::from_secs(10);

        assert!(matches!(
            backend.try_acquire("db", "run-a", ttl).await.unwrap(),
            AcquireOutcome::Acquired(_)
        ));
        match backend.try_acquire("db", "run-b", ttl).await.unwrap() {
            AcquireOutcome::Blocked(holder) => assert_eq!(holder.holder_run_id, "run-a"),
            other => panic!("expected contention, got {:?}", other),
        }

        assert!(backend.renew("db", "run-a", ttl).await.unwrap().is_some());
        assert!(backend.renew("db", "run-b", ttl).await.unwrap().is_none());
        assert_eq!(backend.held_by("run-a").await.unwrap().len(), 1);

        assert!(!backend.release("db", "run-b").await.unwrap());
        assert!(backend.release("db", "run-a").await.unwrap());
        assert!(backend.get("db").await.unwrap().is_none());
        assert!(backend.held_by("run-a").await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore]
    async fn test_lease_lapses() {
        let backend = backend().await;
        backend
            .try_acquire("db", "run-a", Duration::from_millis(50))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(matches!(
            backend.try_acquire("db", "run-b", Duration::from_secs(1)).await.unwrap(),
            AcquireOutcome::Acquired(_)
        ));
        assert!(backend.held_by("run-a").await.unwrap().is_empty());
    }
}
