//! Lease-based per-key mutual exclusion.
//!
//! A lease is a self-expiring entry holding a random token. Only the token
//! holder can release it, and a crashed holder blocks others for at most one
//! lease period. A holder that outlives its lease has lost the lock, so
//! callers must check [`DistributedLock::ensure_held`] before publishing any
//! work done under it.

pub mod memory;
pub mod redis_lock;

use crate::config::LockConfig;
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

pub use self::memory::InMemoryLock;
pub use self::redis_lock::RedisLock;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("timed out after {0:?} waiting for lock")]
    Timeout(Duration),

    #[error("lease expired or taken over")]
    Lost,

    #[error("lock backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for LockError {
    fn from(err: redis::RedisError) -> Self {
        LockError::Backend(err.to_string())
    }
}

/// Storage primitive behind [`DistributedLock`].
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Set `key` to `token` for `lease` unless the key already exists.
    async fn try_acquire(&self, key: &str, token: &str, lease: Duration) -> Result<bool, LockError>;

    /// Delete `key` if it still holds `token`. Returns whether it did.
    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError>;

    /// Whether `key` still holds `token`.
    async fn is_held(&self, key: &str, token: &str) -> Result<bool, LockError>;
}

#[derive(Debug, Clone)]
pub struct LockOptions {
    pub lease: Duration,
    pub wait: Duration,
    pub retry_delay_min: Duration,
    pub retry_delay_max: Duration,
    /// Lease time that must remain for [`DistributedLock::ensure_held`] to pass
    /// before a commit.
    pub commit_margin: Duration,
}

impl From<&LockConfig> for LockOptions {
    fn from(config: &LockConfig) -> Self {
        LockOptions {
            lease: Duration::from_millis(config.lease_ms),
            wait: Duration::from_millis(config.wait_ms),
            retry_delay_min: Duration::from_millis(config.retry_delay_min_ms),
            retry_delay_max: Duration::from_millis(config.retry_delay_max_ms),
            commit_margin: Duration::from_millis(config.commit_margin_ms),
        }
    }
}

impl Default for LockOptions {
    fn default() -> Self {
        LockOptions::from(&LockConfig::default())
    }
}

/// An acquired lease. Give it back with [`DistributedLock::release`].
#[derive(Debug)]
pub struct Lease {
    key: String,
    token: String,
    expires_at: Instant,
}

impl Lease {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Lease time left by the local clock.
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

#[derive(Clone)]
pub struct DistributedLock {
    backend: Arc<dyn LockBackend>,
    options: LockOptions,
}

impl DistributedLock {
    pub fn new(backend: Arc<dyn LockBackend>, options: LockOptions) -> Self {
        DistributedLock { backend, options }
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// Acquire `key`, retrying with jitter until the configured wait runs out.
    pub async fn acquire(&self, key: &str) -> Result<Lease, LockError> {
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.options.wait;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let started = Instant::now();
            if self
                .backend
                .try_acquire(key, &token, self.options.lease)
                .await?
            {
                debug!("Acquired {} after {} attempt(s)", key, attempts);
                return Ok(Lease {
                    key: key.to_string(),
                    token,
                    // Measured from before the request so the local view never
                    // outlasts the backend's expiry.
                    expires_at: started + self.options.lease,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                warn!("Gave up on {} after {} attempt(s)", key, attempts);
                return Err(LockError::Timeout(self.options.wait));
            }

            let delay = self.retry_delay().min(deadline - now);
            tokio::time::sleep(delay).await;
        }
    }

    /// Fail unless `lease` is still held with at least `margin` left.
    pub async fn ensure_held(&self, lease: &Lease, margin: Duration) -> Result<(), LockError> {
        if lease.remaining() < margin {
            return Err(LockError::Lost);
        }

        if self.backend.is_held(&lease.key, &lease.token).await? {
            Ok(())
        } else {
            Err(LockError::Lost)
        }
    }

    pub async fn release(&self, lease: Lease) -> Result<(), LockError> {
        if self.backend.release(&lease.key, &lease.token).await? {
            Ok(())
        } else {
            Err(LockError::Lost)
        }
    }

    fn retry_delay(&self) -> Duration {
        let min = self.options.retry_delay_min.as_millis() as u64;
        let max = self.options.retry_delay_max.as_millis() as u64;
        if max <= min {
            return Duration::from_millis(min);
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_with(options: LockOptions) -> (Arc<InMemoryLock>, DistributedLock) {
        let backend = Arc::new(InMemoryLock::new());
        (backend.clone(), DistributedLock::new(backend, options))
    }

    fn fast_options() -> LockOptions {
        LockOptions {
            lease: Duration::from_secs(8),
            wait: Duration::from_millis(200),
            retry_delay_min: Duration::from_millis(5),
            retry_delay_max: Duration::from_millis(10),
            commit_margin: Duration::from_millis(500),
        }
    }

    #[test]
    fn test_options_follow_lock_config() {
        let options = LockOptions::from(&LockConfig {
            lease_ms: 2000,
            commit_margin_ms: 300,
            ..LockConfig::default()
        });

        assert_eq!(options.lease, Duration::from_secs(2));
        assert_eq!(options.commit_margin, Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_acquire_release_reacquire() {
        let (_, lock) = lock_with(fast_options());

        let lease = lock.acquire("balance_mutex:u1").await.unwrap();
        assert_eq!(lease.key(), "balance_mutex:u1");
        lock.release(lease).await.unwrap();

        let again = lock.acquire("balance_mutex:u1").await.unwrap();
        lock.release(again).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_contended_key_times_out() {
        let (_, lock) = lock_with(fast_options());
        let _held = lock.acquire("balance_mutex:u1").await.unwrap();

        let err = lock.acquire("balance_mutex:u1").await.unwrap_err();
        assert!(matches!(err, LockError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_contend() {
        let (_, lock) = lock_with(fast_options());
        let a = lock.acquire("balance_mutex:a").await.unwrap();
        let b = lock.acquire("balance_mutex:b").await.unwrap();

        lock.release(a).await.unwrap();
        lock.release(b).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_gets_lock_after_holder_releases() {
        let (_, lock) = lock_with(LockOptions {
            wait: Duration::from_secs(2),
            ..fast_options()
        });
        let held = lock.acquire("balance_mutex:u1").await.unwrap();

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.acquire("balance_mutex:u1").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        lock.release(held).await.unwrap();

        let lease = waiter.await.unwrap().unwrap();
        lock.release(lease).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_is_lost_and_can_be_taken() {
        let (_, lock) = lock_with(LockOptions {
            lease: Duration::from_millis(100),
            ..fast_options()
        });
        let stale = lock.acquire("balance_mutex:u1").await.unwrap();

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(matches!(
            lock.ensure_held(&stale, Duration::ZERO).await,
            Err(LockError::Lost)
        ));

        let fresh = lock.acquire("balance_mutex:u1").await.unwrap();
        // The stale holder must not be able to free the new holder's lease
        assert!(matches!(lock.release(stale).await, Err(LockError::Lost)));
        lock.ensure_held(&fresh, Duration::ZERO).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_held_enforces_margin() {
        let (_, lock) = lock_with(LockOptions {
            lease: Duration::from_millis(1000),
            ..fast_options()
        });
        let lease = lock.acquire("balance_mutex:u1").await.unwrap();

        tokio::time::advance(Duration::from_millis(800)).await;
        lock.ensure_held(&lease, Duration::from_millis(100)).await.unwrap();
        assert!(matches!(
            lock.ensure_held(&lease, Duration::from_millis(500)).await,
            Err(LockError::Lost)
        ));
    }
}
