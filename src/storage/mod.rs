//! Storage backends for blockfeed
//!
//! - Postgres: API keys (with enable/disable), delivery history backing the
//!   daily delivery limit, and a LISTEN/NOTIFY event feed

mod postgres;

pub use postgres::{ApiKeyRecord, PostgresConfig, PostgresStore, EVENTS_CHANNEL};

use thiserror::Error;

/// Storage errors
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),
}
