use config::{ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub ledger: LedgerConfig,
    pub lock: LockConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_retries: u32,
    pub connect_retry_delay_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RedisConfig {
    pub url: String,
}

/// Cache lifetimes and history paging limits.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LedgerConfig {
    pub balance_cache_ttl_secs: u64,
    pub history_cache_ttl_secs: u64,
    /// Page size whose cached history pages are dropped after a credit.
    pub history_page_size: u32,
    /// Pages `1..=max_invalidated_pages` are dropped after a credit. History
    /// pages past this bound stay cached until their TTL runs out.
    pub max_invalidated_pages: u32,
    pub max_page_size: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            balance_cache_ttl_secs: 60,
            history_cache_ttl_secs: 600,
            history_page_size: 10,
            max_invalidated_pages: 100,
            max_page_size: 100,
        }
    }
}

impl LedgerConfig {
    pub fn balance_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.balance_cache_ttl_secs)
    }

    pub fn history_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.history_cache_ttl_secs)
    }
}

/// Per-user balance lock timings, in milliseconds.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LockConfig {
    pub lease_ms: u64,
    pub wait_ms: u64,
    pub retry_delay_min_ms: u64,
    pub retry_delay_max_ms: u64,
    /// Minimum lease time that must remain when a credit commits.
    pub commit_margin_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig {
            lease_ms: 8000,
            wait_ms: 4000,
            retry_delay_min_ms: 50,
            retry_delay_max_ms: 250,
            commit_margin_ms: 500,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());
        let ledger = LedgerConfig::default();
        let lock = LockConfig::default();

        let mut builder = config::Config::builder()
            // Start with default configuration
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8000)?
            .set_default("server.workers", 4)?
            .set_default("database.url", "")?
            .set_default("database.max_connections", 10)?
            .set_default("database.min_connections", 2)?
            .set_default("database.connect_retries", 5)?
            .set_default("database.connect_retry_delay_secs", 5)?
            .set_default("redis.url", "redis://127.0.0.1:6379")?
            .set_default("ledger.balance_cache_ttl_secs", ledger.balance_cache_ttl_secs)?
            .set_default("ledger.history_cache_ttl_secs", ledger.history_cache_ttl_secs)?
            .set_default("ledger.history_page_size", ledger.history_page_size)?
            .set_default("ledger.max_invalidated_pages", ledger.max_invalidated_pages)?
            .set_default("ledger.max_page_size", ledger.max_page_size)?
            .set_default("lock.lease_ms", lock.lease_ms)?
            .set_default("lock.wait_ms", lock.wait_ms)?
            .set_default("lock.retry_delay_min_ms", lock.retry_delay_min_ms)?
            .set_default("lock.retry_delay_max_ms", lock.retry_delay_max_ms)?
            .set_default("lock.commit_margin_ms", lock.commit_margin_ms)?;

        // Add environment-specific config file if it exists
        if let Ok(config_file) = env::var("CONFIG_FILE") {
            builder = builder.add_source(File::with_name(&config_file).required(false));
        } else {
            builder = builder.add_source(
                File::with_name(&format!("config/{}", environment)).required(false),
            );
        }

        // Override with environment variables
        builder = builder.add_source(
            Environment::with_prefix("LEDGER_SERVICE")
                .separator("__")
                .list_separator(","),
        );

        if let Ok(db_url) = env::var("DATABASE_URL") {
            builder = builder.set_override("database.url", db_url)?;
        }

        if let Ok(redis_url) = env::var("REDIS_URL") {
            builder = builder.set_override("redis.url", redis_url)?;
        }

        if let Ok(port) = env::var("LEDGER_SERVICE_PORT") {
            builder = builder.set_override("server.port", port)?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("Server port cannot be 0".to_string());
        }

        if self.database.url.is_empty() {
            return Err("Database URL is required".to_string());
        }

        if self.redis.url.is_empty() {
            return Err("Redis URL is required".to_string());
        }

        if self.database.connect_retries == 0 {
            return Err("At least one database connection attempt is required".to_string());
        }

        self.ledger.validate()?;
        self.lock.validate()
    }
}

impl LedgerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.balance_cache_ttl_secs == 0 || self.history_cache_ttl_secs == 0 {
            return Err("Cache TTLs must be greater than 0".to_string());
        }

        if self.history_page_size == 0 || self.max_page_size == 0 {
            return Err("Page sizes must be greater than 0".to_string());
        }

        if self.history_page_size > self.max_page_size {
            return Err(format!(
                "history_page_size ({}) exceeds max_page_size ({})",
                self.history_page_size, self.max_page_size
            ));
        }

        Ok(())
    }
}

impl LockConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.lease_ms == 0 {
            return Err("Lock lease must be greater than 0".to_string());
        }

        if self.retry_delay_min_ms > self.retry_delay_max_ms {
            return Err("Lock retry_delay_min_ms exceeds retry_delay_max_ms".to_string());
        }

        if self.commit_margin_ms >= self.lease_ms {
            return Err("Lock commit margin must be smaller than the lease".to_string());
        }

        Ok(())
    }
}
