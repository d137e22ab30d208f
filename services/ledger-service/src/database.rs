use crate::config::DatabaseConfig;
use crate::errors::{LedgerError, Result};
use crate::models::{Transaction, TransactionType, User};
use crate::store::{CommittedCredit, LedgerStore, PendingCredit};
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use std::time::Duration;
use tracing::{info, warn};

pub struct Database {
    pool: Pool<Postgres>,
}

impl Database {
    pub async fn new(database_url: &str, max_connections: u32, min_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        Ok(Database { pool })
    }

    /// Connect, retrying a bounded number of times with a fixed delay.
    pub async fn connect_with_retry(config: &DatabaseConfig) -> Result<Self> {
        let delay = Duration::from_secs(config.connect_retry_delay_secs);
        let mut last_error = None;

        for attempt in 1..=config.connect_retries {
            match Database::new(&config.url, config.max_connections, config.min_connections).await {
                Ok(db) => {
                    info!("Connected to the database on attempt {}", attempt);
                    return Ok(db);
                }
                Err(e) => {
                    warn!(
                        "Failed to connect to the database (attempt {}/{}): {}",
                        attempt, config.connect_retries, e
                    );
                    last_error = Some(e);
                    if attempt < config.connect_retries {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            LedgerError::Persistence("no database connection attempts were made".to_string())
        }))
    }
}

/// A unique violation on the idempotency key means another request already
/// committed `transaction_id`.
fn credit_insert_error(err: sqlx::Error, transaction_id: &str) -> LedgerError {
    if let sqlx::Error::Database(db_err) = &err {
        let on_transaction_id = db_err
            .constraint()
            .map(|name| name.contains("transaction_id"))
            .unwrap_or(false);
        if db_err.is_unique_violation() && on_transaction_id {
            return LedgerError::DuplicateTransaction(transaction_id.to_string());
        }
    }
    LedgerError::from(err)
}

struct PgPendingCredit {
    tx: sqlx::Transaction<'static, Postgres>,
    user: User,
    transaction: Transaction,
}

#[async_trait]
impl PendingCredit for PgPendingCredit {
    fn user(&self) -> &User {
        &self.user
    }

    async fn commit(self: Box<Self>) -> Result<CommittedCredit> {
        let PgPendingCredit {
            tx,
            user,
            transaction,
        } = *self;
        tx.commit().await?;

        Ok(CommittedCredit { user, transaction })
    }
}

#[async_trait]
impl LedgerStore for Database {
    async fn find_user(&self, uid: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, uid, balance, created_at, updated_at FROM users WHERE uid = $1
            "#,
        )
        .bind(uid)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn transaction_exists(&self, transaction_id: &str) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS(SELECT 1 FROM transactions WHERE transaction_id = $1)
            "#,
        )
        .bind(transaction_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn stage_credit(
        &self,
        uid: &str,
        amount: Decimal,
        transaction_id: &str,
    ) -> Result<Box<dyn PendingCredit>> {
        let mut tx = self.pool.begin().await?;

        // Find-or-create
        sqlx::query(
            r#"
            INSERT INTO users (uid, balance) VALUES ($1, 0)
            ON CONFLICT (uid) DO NOTHING
            "#,
        )
        .bind(uid)
        .execute(&mut *tx)
        .await?;

        let transaction = sqlx::query_as::<_, Transaction>(
            r#"
            INSERT INTO transactions (user_id, amount, type, transaction_id)
            SELECT id, $2, $3, $4 FROM users WHERE uid = $1
            RETURNING id, user_id, amount, type, transaction_id, created_at
            "#,
        )
        .bind(uid)
        .bind(amount)
        .bind(TransactionType::Credit.as_str())
        .bind(transaction_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| credit_insert_error(e, transaction_id))?;

        let user = sqlx::query_as::<_, User>(
            r#"
            UPDATE users
            SET balance = balance + $2,
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, uid, balance, created_at, updated_at
            "#,
        )
        .bind(transaction.user_id)
        .bind(amount)
        .fetch_one(&mut *tx)
        .await?;

        Ok(Box::new(PgPendingCredit {
            tx,
            user,
            transaction,
        }))
    }

    async fn list_transactions(
        &self,
        user_id: i64,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Transaction>> {
        let transactions = sqlx::query_as::<_, Transaction>(
            r#"
            SELECT id, user_id, amount, type, transaction_id, created_at
            FROM transactions
            WHERE user_id = $1
            ORDER BY id ASC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(transactions)
    }

    async fn count_transactions(&self, user_id: i64) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM transactions WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}
