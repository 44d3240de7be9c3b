//! API key authorization

use crate::auth::keys::ApiKey;
use crate::auth::quota::{DeliveryDenied, DeliveryLedger};
use crate::topics::TopicFamily;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing API key")]
    Missing,

    #[error("unknown API key")]
    UnknownKey,

    #[error("API key is disabled")]
    Disabled,

    #[error("authorization backend error: {0}")]
    Backend(String),
}

/// Decides whether a credential may open subscriptions and keep receiving
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, key: &ApiKey) -> Result<(), AuthError>;

    /// Checked before every delivery under `key`. Runs on the dispatch path and
    /// must not block.
    fn admit_delivery(&self, _key: &ApiKey) -> Result<(), DeliveryDenied> {
        Ok(())
    }

    /// Called once a delivery under `key` was queued
    fn record_delivery(&self, _key: &ApiKey, _family: TopicFamily, _bytes: usize) {}
}

/// Accepts a fixed list of keys, typically from configuration
#[derive(Debug, Default)]
pub struct StaticKeyAuthorizer {
    keys: Vec<ApiKey>,
    ledger: DeliveryLedger,
}

impl StaticKeyAuthorizer {
    pub fn new(keys: impl IntoIterator<Item = ApiKey>) -> Self {
        let mut list: Vec<ApiKey> = Vec::new();
        for key in keys {
            if !key.is_empty() && !list.contains(&key) {
                list.push(key);
            }
        }
        Self {
            keys: list,
            ledger: DeliveryLedger::default(),
        }
    }

    /// Cap deliveries per key and day
    pub fn with_daily_limit(mut self, limit: u64) -> Self {
        self.ledger = DeliveryLedger::new(Some(limit));
        self
    }

    pub fn ledger(&self) -> &DeliveryLedger {
        &self.ledger
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl Authorizer for StaticKeyAuthorizer {
    async fn authorize(&self, key: &ApiKey) -> Result<(), AuthError> {
        if key.is_empty() {
            return Err(AuthError::Missing);
        }

        // No early exit so the scan time does not depend on which key matched
        let found = self
            .keys
            .iter()
            .fold(false, |found, known| known.matches(key.as_str()) | found);

        if found {
            Ok(())
        } else {
            Err(AuthError::UnknownKey)
        }
    }

    fn admit_delivery(&self, key: &ApiKey) -> Result<(), DeliveryDenied> {
        self.ledger.admit(key)
    }

    fn record_delivery(&self, key: &ApiKey, family: TopicFamily, bytes: usize) {
        self.ledger.record(key, family, bytes);
    }
}

/// Development mode: any non-empty key is accepted
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAnyKey;

#[async_trait]
impl Authorizer for AllowAnyKey {
    async fn authorize(&self, key: &ApiKey) -> Result<(), AuthError> {
        if key.is_empty() {
            Err(AuthError::Missing)
        } else {
            Ok(())
        }
    }
}
