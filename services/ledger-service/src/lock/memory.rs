use super::{LockBackend, LockError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Process-local lease table, for tests and single-instance runs.
#[derive(Default)]
pub struct InMemoryLock {
    leases: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockBackend for InMemoryLock {
    async fn try_acquire(&self, key: &str, token: &str, lease: Duration) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut leases = self.leases.lock();

        if let Some((_, expires_at)) = leases.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }

        leases.insert(key.to_string(), (token.to_string(), now + lease));
        Ok(true)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut leases = self.leases.lock();

        let owned = matches!(
            leases.get(key),
            Some((holder, expires_at)) if holder == token && *expires_at > now
        );
        if owned {
            leases.remove(key);
        }
        Ok(owned)
    }

    async fn is_held(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let now = Instant::now();
        Ok(matches!(
            self.leases.lock().get(key),
            Some((holder, expires_at)) if holder == token && *expires_at > now
        ))
    }
}
