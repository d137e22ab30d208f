use super::{LockBackend, LockError};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::time::Duration;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Single-instance Redis lease lock (`SET NX PX` + compare-and-delete).
#[derive(Clone)]
pub struct RedisLock {
    redis: ConnectionManager,
    release_script: Script,
}

impl RedisLock {
    pub fn new(redis: ConnectionManager) -> Self {
        RedisLock {
            redis,
            release_script: Script::new(RELEASE_SCRIPT),
        }
    }
}

#[async_trait]
impl LockBackend for RedisLock {
    async fn try_acquire(&self, key: &str, token: &str, lease: Duration) -> Result<bool, LockError> {
        let millis = u64::try_from(lease.as_millis()).unwrap_or(u64::MAX).max(1);
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(millis)
            .query_async(&mut self.redis.clone())
            .await?;

        Ok(reply.is_some())
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let removed: i64 = self
            .release_script
            .key(key)
            .arg(token)
            .invoke_async(&mut self.redis.clone())
            .await?;

        Ok(removed == 1)
    }

    async fn is_held(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let holder: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.redis.clone())
            .await?;

        Ok(holder.as_deref() == Some(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{DistributedLock, LockOptions};
    use std::sync::Arc;

    #[tokio::test]
    #[ignore]
    async fn test_lease_round_trip() {
        // Requires Redis
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let client = redis::Client::open(url).expect("valid redis url");
        let conn = ConnectionManager::new(client).await.expect("redis reachable");
        let lock = DistributedLock::new(Arc::new(RedisLock::new(conn)), LockOptions::default());
        let key = format!("balance_mutex:test-{}", uuid::Uuid::new_v4());

        let lease = lock.acquire(&key).await.unwrap();
        lock.ensure_held(&lease, Duration::from_millis(100)).await.unwrap();
        lock.release(lease).await.unwrap();
    }
}
