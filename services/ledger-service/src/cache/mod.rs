//! Read cache for balances and transaction-history pages.
//!
//! Reads go through the cache and fall back to the store; credits delete the
//! affected entries. Nothing here ever fails a request: backend errors are
//! logged and reported to callers as a miss.

pub mod memory;
pub mod redis_cache;

use crate::config::LedgerConfig;
use crate::models::Transaction;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, warn};

pub use self::memory::InMemoryCache;
pub use self::redis_cache::RedisCache;

/// Cache key layout
pub mod keys {
    pub const BALANCE: &str = "balance";
    pub const TRANSACTIONS: &str = "transactions";
    pub const BALANCE_MUTEX: &str = "balance_mutex";

    pub fn balance(uid: &str) -> String {
        format!("{}:{}", BALANCE, uid)
    }

    pub fn history_page(uid: &str, page: u32, page_size: u32) -> String {
        format!("{}:{}:{}:{}", TRANSACTIONS, uid, page, page_size)
    }

    pub fn balance_mutex(uid: &str) -> String {
        format!("{}:{}", BALANCE_MUTEX, uid)
    }
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Key/value store with per-entry TTL. A missing key is `Ok(None)`.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    /// Delete every key in `keys`, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError>;
}

#[derive(Default, Debug, Clone)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
}

impl CacheMetrics {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64) / (total as f64) * 100.0
        }
    }
}

#[derive(Clone)]
pub struct LedgerCache {
    backend: Arc<dyn CacheBackend>,
    balance_ttl: Duration,
    history_ttl: Duration,
    metrics: Arc<RwLock<CacheMetrics>>,
}

impl LedgerCache {
    pub fn new(backend: Arc<dyn CacheBackend>, config: &LedgerConfig) -> Self {
        LedgerCache {
            backend,
            balance_ttl: config.balance_cache_ttl(),
            history_ttl: config.history_cache_ttl(),
            metrics: Arc::new(RwLock::new(CacheMetrics::default())),
        }
    }

    // =========================================================================
    // BALANCE CACHE
    // =========================================================================

    pub async fn get_balance(&self, uid: &str) -> Option<Decimal> {
        let key = keys::balance(uid);

        match self.backend.get(&key).await {
            Ok(Some(raw)) => match Decimal::from_str(&raw) {
                Ok(balance) => {
                    self.record_hit().await;
                    Some(balance)
                }
                Err(e) => {
                    warn!("Discarding unparsable cached balance for {}: {}", uid, e);
                    self.record_miss().await;
                    None
                }
            },
            Ok(None) => {
                self.record_miss().await;
                None
            }
            Err(e) => {
                error!("Error getting balance from cache for {}: {}", uid, e);
                self.record_error().await;
                self.record_miss().await;
                None
            }
        }
    }

    pub async fn set_balance(&self, uid: &str, balance: Decimal) {
        let key = keys::balance(uid);

        match self.backend.set_ex(&key, balance.to_string(), self.balance_ttl).await {
            Ok(()) => self.record_set().await,
            Err(e) => {
                error!("Error setting balance in cache for {}: {}", uid, e);
                self.record_error().await;
            }
        }
    }

    // =========================================================================
    // TRANSACTION HISTORY CACHE
    // =========================================================================

    pub async fn get_history_page(
        &self,
        uid: &str,
        page: u32,
        page_size: u32,
    ) -> Option<Vec<Transaction>> {
        let key = keys::history_page(uid, page, page_size);

        match self.backend.get(&key).await {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(transactions) => {
                    self.record_hit().await;
                    Some(transactions)
                }
                Err(e) => {
                    warn!("Failed to deserialize cached history page {}: {}", key, e);
                    self.record_miss().await;
                    None
                }
            },
            Ok(None) => {
                self.record_miss().await;
                None
            }
            Err(e) => {
                error!("Error getting transactions from cache ({}): {}", key, e);
                self.record_error().await;
                self.record_miss().await;
                None
            }
        }
    }

    pub async fn set_history_page(
        &self,
        uid: &str,
        page: u32,
        page_size: u32,
        transactions: &[Transaction],
    ) {
        let key = keys::history_page(uid, page, page_size);

        let json = match serde_json::to_string(transactions) {
            Ok(json) => json,
            Err(e) => {
                error!("Error serializing history page {} for cache: {}", key, e);
                self.record_error().await;
                return;
            }
        };

        match self.backend.set_ex(&key, json, self.history_ttl).await {
            Ok(()) => self.record_set().await,
            Err(e) => {
                error!("Error setting transactions in cache ({}): {}", key, e);
                self.record_error().await;
            }
        }
    }

    // =========================================================================
    // INVALIDATION
    // =========================================================================

    /// Drop the cached balance and history pages `1..=max_pages` of
    /// `page_size` for `uid`. Pages outside that range are left to expire.
    pub async fn invalidate_user(&self, uid: &str, max_pages: u32, page_size: u32) {
        let mut stale = Vec::with_capacity(max_pages as usize + 1);
        stale.push(keys::balance(uid));
        stale.extend((1..=max_pages).map(|page| keys::history_page(uid, page, page_size)));

        match self.backend.delete(&stale).await {
            Ok(_) => self.record_delete().await,
            Err(e) => {
                error!("Error invalidating cache for {}: {}", uid, e);
                self.record_error().await;
            }
        }
    }

    // =========================================================================
    // METRICS
    // =========================================================================

    async fn record_hit(&self) {
        self.metrics.write().await.hits += 1;
    }

    async fn record_miss(&self) {
        self.metrics.write().await.misses += 1;
    }

    async fn record_set(&self) {
        self.metrics.write().await.sets += 1;
    }

    async fn record_delete(&self) {
        self.metrics.write().await.deletes += 1;
    }

    async fn record_error(&self) {
        self.metrics.write().await.errors += 1;
    }

    pub async fn get_metrics(&self) -> CacheMetrics {
        self.metrics.read().await.clone()
    }
}

/// Backend whose every call fails as if Redis refused the connection.
#[cfg(test)]
pub(crate) struct UnreachableCache;

#[cfg(test)]
#[async_trait]
impl CacheBackend for UnreachableCache {
    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        Err(connection_refused())
    }

    async fn set_ex(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
        Err(connection_refused())
    }

    async fn delete(&self, _keys: &[String]) -> Result<u64, CacheError> {
        Err(connection_refused())
    }
}

#[cfg(test)]
fn connection_refused() -> CacheError {
    let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused");
    CacheError::Redis(redis::RedisError::from(io))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ledger_cache(backend: Arc<dyn CacheBackend>) -> LedgerCache {
        LedgerCache::new(backend, &LedgerConfig::default())
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(keys::balance("u1"), "balance:u1");
        assert_eq!(keys::history_page("u1", 2, 10), "transactions:u1:2:10");
        assert_eq!(keys::balance_mutex("u1"), "balance_mutex:u1");
    }

    #[test]
    fn test_cache_metrics_hit_rate() {
        let metrics = CacheMetrics {
            hits: 3,
            misses: 1,
            ..CacheMetrics::default()
        };
        assert_eq!(metrics.hit_rate(), 75.0);
        assert_eq!(CacheMetrics::default().hit_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_balance_round_trips_through_cache() {
        let cache = ledger_cache(Arc::new(InMemoryCache::new()));

        assert_eq!(cache.get_balance("u1").await, None);
        cache.set_balance("u1", dec!(100.25)).await;
        assert_eq!(cache.get_balance("u1").await, Some(dec!(100.25)));

        let metrics = cache.get_metrics().await;
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.sets, 1);
    }

    #[tokio::test]
    async fn test_garbage_entries_read_as_miss() {
        let backend = Arc::new(InMemoryCache::new());
        let cache = ledger_cache(backend.clone());
        let ttl = Duration::from_secs(60);

        backend.set_ex("balance:u1", "not-a-number".into(), ttl).await.unwrap();
        backend
            .set_ex("transactions:u1:1:10", "{broken".into(), ttl)
            .await
            .unwrap();

        assert_eq!(cache.get_balance("u1").await, None);
        assert!(cache.get_history_page("u1", 1, 10).await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_user_stops_at_page_bound() {
        let backend = Arc::new(InMemoryCache::new());
        let cache = ledger_cache(backend.clone());
        let ttl = Duration::from_secs(60);

        cache.set_balance("u1", dec!(1)).await;
        cache.set_history_page("u1", 1, 10, &[]).await;
        cache.set_history_page("u1", 3, 10, &[]).await;
        cache.set_history_page("u1", 4, 10, &[]).await;
        backend.set_ex("balance:u2", "7".into(), ttl).await.unwrap();

        cache.invalidate_user("u1", 3, 10).await;

        assert_eq!(backend.get("balance:u1").await.unwrap(), None);
        assert_eq!(backend.get("transactions:u1:1:10").await.unwrap(), None);
        assert_eq!(backend.get("transactions:u1:3:10").await.unwrap(), None);
        assert!(backend.get("transactions:u1:4:10").await.unwrap().is_some());
        assert!(backend.get("balance:u2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_backend_outage_degrades_to_miss() {
        let cache = ledger_cache(Arc::new(UnreachableCache));

        assert_eq!(cache.get_balance("u1").await, None);
        cache.set_balance("u1", dec!(5)).await;
        cache.invalidate_user("u1", 100, 10).await;

        let metrics = cache.get_metrics().await;
        assert_eq!(metrics.errors, 3);
        assert_eq!(metrics.hits, 0);
    }
}
