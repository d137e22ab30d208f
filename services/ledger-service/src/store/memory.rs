use super::{CommittedCredit, LedgerStore, PendingCredit};
use crate::errors::{LedgerError, Result};
use crate::models::{Transaction, TransactionType, User};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// In-process ledger store.
///
/// Staging snapshots the user's balance and commit writes
/// `snapshot + amount` back, the same read-modify-write a row-level save
/// performs. Two credits for one user that overlap without the balance lock
/// therefore lose an update, which keeps the lock observable in tests.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
    stage_latency: Duration,
}

#[derive(Default)]
struct MemoryState {
    users: HashMap<String, User>,
    transactions: Vec<Transaction>,
    next_user_id: i64,
    next_transaction_id: i64,
}

impl MemoryState {
    fn user_by_id(&self, user_id: i64) -> Option<&User> {
        self.users.values().find(|u| u.id == user_id)
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `latency` while staging, widening the window between the
    /// balance read and the commit.
    pub fn with_stage_latency(latency: Duration) -> Self {
        InMemoryStore {
            stage_latency: latency,
            ..Self::default()
        }
    }

    pub fn transactions_for(&self, uid: &str) -> Vec<Transaction> {
        let state = self.state.lock();
        match state.users.get(uid) {
            Some(user) => state
                .transactions
                .iter()
                .filter(|t| t.user_id == user.id)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }
}

struct MemoryPendingCredit {
    state: Arc<Mutex<MemoryState>>,
    user: User,
    transaction: Transaction,
}

#[async_trait]
impl PendingCredit for MemoryPendingCredit {
    fn user(&self) -> &User {
        &self.user
    }

    async fn commit(self: Box<Self>) -> Result<CommittedCredit> {
        let mut state = self.state.lock();

        if state
            .transactions
            .iter()
            .any(|t| t.transaction_id == self.transaction.transaction_id)
        {
            return Err(LedgerError::DuplicateTransaction(
                self.transaction.transaction_id.clone(),
            ));
        }

        let mut transaction = self.transaction.clone();
        state.next_transaction_id += 1;
        transaction.id = state.next_transaction_id;

        let user = state
            .users
            .entry(self.user.uid.clone())
            .or_insert_with(|| self.user.clone());
        user.balance = self.user.balance;
        user.updated_at = self.user.updated_at;
        let user = user.clone();
        transaction.user_id = user.id;

        state.transactions.push(transaction.clone());

        Ok(CommittedCredit { user, transaction })
    }
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    async fn find_user(&self, uid: &str) -> Result<Option<User>> {
        Ok(self.state.lock().users.get(uid).cloned())
    }

    async fn transaction_exists(&self, transaction_id: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .transactions
            .iter()
            .any(|t| t.transaction_id == transaction_id))
    }

    async fn stage_credit(
        &self,
        uid: &str,
        amount: Decimal,
        transaction_id: &str,
    ) -> Result<Box<dyn PendingCredit>> {
        let now = Utc::now();
        let snapshot = {
            let mut state = self.state.lock();
            let existing = state.users.get(uid).cloned();
            match existing {
                Some(user) => user,
                // Created on commit, so a rolled-back first credit leaves no user
                None => {
                    state.next_user_id += 1;
                    User {
                        id: state.next_user_id,
                        uid: uid.to_string(),
                        balance: Decimal::ZERO,
                        created_at: now,
                        updated_at: now,
                    }
                }
            }
        };

        if !self.stage_latency.is_zero() {
            tokio::time::sleep(self.stage_latency).await;
        }

        let user = User {
            balance: snapshot.balance + amount,
            updated_at: now,
            ..snapshot
        };
        let transaction = Transaction {
            id: 0,
            user_id: user.id,
            amount,
            kind: TransactionType::Credit,
            transaction_id: transaction_id.to_string(),
            created_at: now,
        };

        Ok(Box::new(MemoryPendingCredit {
            state: Arc::clone(&self.state),
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
        let state = self.state.lock();
        if state.user_by_id(user_id).is_none() {
            return Ok(Vec::new());
        }

        let offset = usize::try_from(offset.max(0)).unwrap_or(usize::MAX);
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);

        Ok(state
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_transactions(&self, user_id: i64) -> Result<i64> {
        let state = self.state.lock();
        let count = state
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id)
            .count();

        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_commit_applies_balance_and_row() {
        let store = InMemoryStore::new();

        let committed = store
            .stage_credit("u1", dec!(25.50), "tx-1")
            .await
            .unwrap()
            .commit()
            .await
            .unwrap();

        assert_eq!(committed.user.balance, dec!(25.50));
        assert_eq!(committed.transaction.id, 1);
        assert!(store.transaction_exists("tx-1").await.unwrap());
        assert_eq!(store.count_transactions(committed.user.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dropped_pending_credit_leaves_no_trace() {
        let store = InMemoryStore::new();
        store
            .stage_credit("u1", dec!(5), "tx-1")
            .await
            .unwrap()
            .commit()
            .await
            .unwrap();

        let pending = store.stage_credit("u1", dec!(7), "tx-2").await.unwrap();
        assert_eq!(pending.user().balance, dec!(12));
        drop(pending);

        let user = store.find_user("u1").await.unwrap().unwrap();
        assert_eq!(user.balance, dec!(5));
        assert!(!store.transaction_exists("tx-2").await.unwrap());
    }

    #[tokio::test]
    async fn test_rolled_back_first_credit_creates_no_user() {
        let store = InMemoryStore::new();
        drop(store.stage_credit("fresh", dec!(3), "tx-1").await.unwrap());

        assert!(store.find_user("fresh").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected_at_commit() {
        let store = InMemoryStore::new();
        let first = store.stage_credit("u1", dec!(1), "same").await.unwrap();
        let second = store.stage_credit("u1", dec!(1), "same").await.unwrap();

        first.commit().await.unwrap();
        let err = second.commit().await.err().unwrap();

        assert!(matches!(err, LedgerError::DuplicateTransaction(_)));
        assert_eq!(store.transactions_for("u1").len(), 1);
    }

    #[tokio::test]
    async fn test_list_transactions_windows_in_creation_order() {
        let store = InMemoryStore::new();
        for i in 1..=5 {
            store
                .stage_credit("u1", Decimal::from(i), &format!("tx-{}", i))
                .await
                .unwrap()
                .commit()
                .await
                .unwrap();
        }
        let user = store.find_user("u1").await.unwrap().unwrap();

        let page = store.list_transactions(user.id, 2, 2).await.unwrap();
        let keys: Vec<_> = page.iter().map(|t| t.transaction_id.as_str()).collect();
        assert_eq!(keys, vec!["tx-3", "tx-4"]);
    }
}
