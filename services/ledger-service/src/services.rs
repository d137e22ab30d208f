use crate::cache::{keys, LedgerCache};
use crate::config::LedgerConfig;
use crate::errors::{LedgerError, Result};
use crate::lock::{DistributedLock, Lease, LockError};
use crate::models::{CreditReceipt, HistoryPage, Pagination, Transaction};
use crate::store::{CommittedCredit, LedgerStore};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CREDIT_SUCCESS_MESSAGE: &str = "Funds added successfully";

/// Fractional digits an amount may carry; the ledger columns are `NUMERIC(20, 8)`.
pub const MAX_AMOUNT_SCALE: u32 = 8;

pub struct LedgerService {
    store: Arc<dyn LedgerStore>,
    cache: LedgerCache,
    lock: DistributedLock,
    ledger: LedgerConfig,
}

impl LedgerService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        cache: LedgerCache,
        lock: DistributedLock,
        ledger: LedgerConfig,
    ) -> Self {
        LedgerService {
            store,
            cache,
            lock,
            ledger,
        }
    }

    /// Page size used when a history request names none.
    pub fn default_page_size(&self) -> u32 {
        self.ledger.history_page_size
    }

    /// Credit `amount` to `uid`.
    ///
    /// `idempotency_key` becomes the transaction's `transaction_id`; a fresh
    /// one is generated when the caller has none, in which case retries of the
    /// same request cannot be recognised as duplicates.
    pub async fn apply_credit(
        &self,
        uid: &str,
        amount: Decimal,
        idempotency_key: Option<String>,
    ) -> Result<CreditReceipt> {
        if amount <= Decimal::ZERO || amount.normalize().scale() > MAX_AMOUNT_SCALE {
            return Err(LedgerError::InvalidAmount(amount));
        }

        let transaction_id = idempotency_key.unwrap_or_else(|| Uuid::new_v4().to_string());

        // Fast path only; concurrent requests are serialized by the lock below.
        if self.store.transaction_exists(&transaction_id).await? {
            return Err(LedgerError::DuplicateTransaction(transaction_id));
        }

        let lease = self
            .lock
            .acquire(&keys::balance_mutex(uid))
            .await
            .map_err(|e| {
                error!("Error acquiring balance lock for {}: {}", uid, e);
                LedgerError::LockUnavailable {
                    uid: uid.to_string(),
                    reason: e.to_string(),
                }
            })?;

        let outcome = self
            .commit_credit(&lease, uid, amount, &transaction_id)
            .await;

        match self.lock.release(lease).await {
            Ok(()) => {}
            Err(LockError::Lost) => {
                warn!("Balance lock for {} expired before release", uid)
            }
            Err(e) => error!("Error releasing balance lock for {}: {}", uid, e),
        }

        let committed = outcome?;

        self.cache
            .invalidate_user(
                uid,
                self.ledger.max_invalidated_pages,
                self.ledger.history_page_size,
            )
            .await;

        info!(
            "Credited {} to {} (transaction: {}, balance: {})",
            amount, uid, transaction_id, committed.user.balance
        );

        Ok(CreditReceipt {
            uid: uid.to_string(),
            transaction_id,
            amount,
            balance: committed.user.balance,
            message: CREDIT_SUCCESS_MESSAGE.to_string(),
        })
    }

    /// Critical section: runs only while `lease` is held.
    async fn commit_credit(
        &self,
        lease: &Lease,
        uid: &str,
        amount: Decimal,
        transaction_id: &str,
    ) -> Result<CommittedCredit> {
        let pending = self
            .store
            .stage_credit(uid, amount, transaction_id)
            .await
            .map_err(|e| {
                error!("Error staging credit for {}: {}", uid, e);
                e
            })?;

        debug!(
            "Staged credit {} for {} (pending balance: {})",
            transaction_id,
            uid,
            pending.user().balance
        );

        let margin = self.lock.options().commit_margin;
        if let Err(e) = self.lock.ensure_held(lease, margin).await {
            // Dropping `pending` rolls the staged write back
            error!("Balance lock for {} no longer safe to commit under: {}", uid, e);
            return Err(LedgerError::LockLost(uid.to_string()));
        }

        pending.commit().await.map_err(|e| {
            error!("Error committing credit for {}: {}", uid, e);
            e
        })
    }

    /// Balance for `uid`, cache first.
    pub async fn get_balance(&self, uid: &str) -> Result<Decimal> {
        if let Some(balance) = self.cache.get_balance(uid).await {
            return Ok(balance);
        }

        let user = self
            .store
            .find_user(uid)
            .await?
            .ok_or_else(|| LedgerError::UserNotFound(uid.to_string()))?;

        self.cache.set_balance(uid, user.balance).await;

        Ok(user.balance)
    }

    /// One page of `uid`'s transactions plus a freshly counted pagination summary.
    pub async fn get_history(&self, uid: &str, page: u32, page_size: u32) -> Result<HistoryPage> {
        if page == 0 {
            return Err(LedgerError::InvalidPagination(
                "page must be at least 1".to_string(),
            ));
        }
        if page_size == 0 || page_size > self.ledger.max_page_size {
            return Err(LedgerError::InvalidPagination(format!(
                "page size must be between 1 and {}",
                self.ledger.max_page_size
            )));
        }

        let user = self
            .store
            .find_user(uid)
            .await?
            .ok_or_else(|| LedgerError::UserNotFound(uid.to_string()))?;

        let transactions = match self.cache.get_history_page(uid, page, page_size).await {
            Some(cached) => cached,
            None => {
                let offset = i64::from(page - 1) * i64::from(page_size);
                let fetched: Vec<Transaction> = self
                    .store
                    .list_transactions(user.id, offset, i64::from(page_size))
                    .await?;
                self.cache
                    .set_history_page(uid, page, page_size, &fetched)
                    .await;
                fetched
            }
        };

        let total = self.store.count_transactions(user.id).await?;
        let total = u64::try_from(total).unwrap_or(0);

        Ok(HistoryPage {
            transactions,
            pagination: Pagination::new(page, page_size, total),
        })
    }
}
