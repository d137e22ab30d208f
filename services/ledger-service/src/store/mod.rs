//! Durable store contract for users and their transactions.
//!
//! The PostgreSQL implementation lives in [`crate::database`]; [`memory`]
//! provides an in-process store for tests and local runs.

pub mod memory;

use crate::errors::Result;
use crate::models::{Transaction, User};
use async_trait::async_trait;
use rust_decimal::Decimal;

pub use memory::InMemoryStore;

/// A credit written inside an open store transaction but not yet committed.
///
/// Dropping the value without calling [`PendingCredit::commit`] rolls the
/// write back, so neither the transaction row nor the balance change become
/// visible.
#[async_trait]
pub trait PendingCredit: Send {
    /// User row as it will look after commit.
    fn user(&self) -> &User;

    async fn commit(self: Box<Self>) -> Result<CommittedCredit>;
}

#[derive(Debug, Clone)]
pub struct CommittedCredit {
    pub user: User,
    pub transaction: Transaction,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn find_user(&self, uid: &str) -> Result<Option<User>>;

    async fn transaction_exists(&self, transaction_id: &str) -> Result<bool>;

    /// Find-or-create the user, insert a credit row keyed by `transaction_id`
    /// and add `amount` to the balance, all in one uncommitted transaction.
    async fn stage_credit(
        &self,
        uid: &str,
        amount: Decimal,
        transaction_id: &str,
    ) -> Result<Box<dyn PendingCredit>>;

    /// Transactions of a user in creation order.
    async fn list_transactions(
        &self,
        user_id: i64,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Transaction>>;

    async fn count_transactions(&self, user_id: i64) -> Result<i64>;
}
