pub mod cache;
pub mod config;
pub mod database;
pub mod errors;
pub mod handlers;
pub mod lock;
pub mod models;
pub mod services;
pub mod store;

pub use config::Config;
pub use errors::{LedgerError, Result};
