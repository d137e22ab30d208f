use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use thiserror::Error;

/// Ledger account, created lazily on the first credit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub uid: String,
    pub balance: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Transaction type. Only credits are written today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Credit,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Credit => "credit",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown transaction type: {0}")]
pub struct UnknownTransactionType(pub String);

impl TryFrom<String> for TransactionType {
    type Error = UnknownTransactionType;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "credit" => Ok(TransactionType::Credit),
            _ => Err(UnknownTransactionType(value)),
        }
    }
}

/// Immutable ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Transaction {
    pub id: i64,
    pub user_id: i64,
    pub amount: Decimal,
    #[serde(rename = "type")]
    #[sqlx(rename = "type", try_from = "String")]
    pub kind: TransactionType,
    pub transaction_id: String,
    pub created_at: DateTime<Utc>,
}

/// Credit request body
#[derive(Debug, Deserialize, Serialize, validator::Validate)]
pub struct AddFundsRequest {
    pub amount: Decimal,
    #[validate(length(min = 1, max = 128))]
    pub transaction_id: Option<String>,
}

/// Outcome of an applied credit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditReceipt {
    pub uid: String,
    pub transaction_id: String,
    pub amount: Decimal,
    pub balance: Decimal,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pagination {
    pub current_page: u32,
    pub total_pages: u32,
    /// Next page number, 0 on the last page.
    pub next_page_id: u32,
}

impl Pagination {
    pub fn new(current_page: u32, page_size: u32, total_count: u64) -> Self {
        let page_size = u64::from(page_size.max(1));
        let total_pages = total_count.div_ceil(page_size);
        let total_pages = u32::try_from(total_pages).unwrap_or(u32::MAX);
        let next_page_id = if current_page < total_pages {
            current_page + 1
        } else {
            0
        };

        Pagination {
            current_page,
            total_pages,
            next_page_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    pub transactions: Vec<Transaction>,
    pub pagination: Pagination,
}
