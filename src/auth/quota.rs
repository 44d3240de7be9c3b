//! Per-key delivery accounting
//!
//! Every delivery is admitted and recorded on the dispatch path, which never
//! waits on I/O, so the ledger lives in memory. A backend that persists it
//! (`storage::PostgresStore`) syncs the ledger in the background: it flushes
//! recorded deliveries, refreshes revoked keys and reloads daily counts.

use crate::auth::keys::ApiKey;
use crate::topics::TopicFamily;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;

/// Deliveries allowed per key and day unless configured otherwise
pub const DEFAULT_DAILY_DELIVERY_LIMIT: u64 = 50_000;

/// Length of the rate limit window
pub const DELIVERY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Why a delivery was refused. The message is the reply sent to the subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryDenied {
    #[error("Bad API Key")]
    Revoked,

    #[error("Crossed Allowed Rate Limit")]
    RateLimited,
}

/// One successful delivery, kept until a backend flushes it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRecord {
    pub key: ApiKey,
    pub family: TopicFamily,
    pub bytes: usize,
    pub delivered_at: SystemTime,
}

#[derive(Debug)]
struct Usage {
    window_start: Instant,
    count: u64,
}

impl Usage {
    fn fresh() -> Self {
        Self {
            window_start: Instant::now(),
            count: 0,
        }
    }

    /// Count within the current window, restarting the window once it expired
    fn current(&mut self) -> u64 {
        if self.window_start.elapsed() >= DELIVERY_WINDOW {
            *self = Self::fresh();
        }
        self.count
    }
}

#[derive(Debug, Default)]
pub struct DeliveryLedger {
    /// `None` means unlimited
    daily_limit: Option<u64>,
    usage: DashMap<ApiKey, Usage>,
    revoked: DashSet<ApiKey>,
    /// Only filled when a backend drains it
    keep_records: bool,
    records: Mutex<Vec<DeliveryRecord>>,
}

impl DeliveryLedger {
    pub fn new(daily_limit: Option<u64>) -> Self {
        Self {
            daily_limit,
            ..Default::default()
        }
    }

    /// Keep a `DeliveryRecord` per delivery for `take_records`
    pub fn with_records(mut self) -> Self {
        self.keep_records = true;
        self
    }

    pub fn daily_limit(&self) -> Option<u64> {
        self.daily_limit
    }

    /// Decide whether one more message may go out under `key`
    pub fn admit(&self, key: &ApiKey) -> Result<(), DeliveryDenied> {
        if self.revoked.contains(key) {
            return Err(DeliveryDenied::Revoked);
        }

        let Some(limit) = self.daily_limit else {
            return Ok(());
        };
        let Some(mut usage) = self.usage.get_mut(key) else {
            return Ok(());
        };
        if usage.current() >= limit {
            Err(DeliveryDenied::RateLimited)
        } else {
            Ok(())
        }
    }

    /// Count a delivery that was queued for a subscriber
    pub fn record(&self, key: &ApiKey, family: TopicFamily, bytes: usize) {
        {
            let mut usage = self.usage.entry(key.clone()).or_insert_with(Usage::fresh);
            usage.current();
            usage.count += 1;
        }

        if self.keep_records {
            self.records.lock().push(DeliveryRecord {
                key: key.clone(),
                family,
                bytes,
                delivered_at: SystemTime::now(),
            });
        }
    }

    /// Deliveries counted for `key` in the current window
    pub fn deliveries(&self, key: &ApiKey) -> u64 {
        self.usage
            .get_mut(key)
            .map(|mut usage| usage.current())
            .unwrap_or(0)
    }

    /// Replace every local count with `counts`, e.g. the totals a database
    /// reports for the last day. Keys missing from `counts` start over at zero.
    pub fn replace_deliveries(&self, counts: impl IntoIterator<Item = (ApiKey, u64)>) {
        let counts: HashMap<ApiKey, u64> = counts.into_iter().collect();
        self.usage.retain(|key, _| counts.contains_key(key));
        for (key, count) in counts {
            self.usage.insert(
                key,
                Usage {
                    window_start: Instant::now(),
                    count,
                },
            );
        }
    }

    pub fn revoke(&self, key: &ApiKey) {
        self.revoked.insert(key.clone());
    }

    pub fn reinstate(&self, key: &ApiKey) {
        self.revoked.remove(key);
    }

    pub fn is_revoked(&self, key: &ApiKey) -> bool {
        self.revoked.contains(key)
    }

    /// Make `keys` the complete revoked set
    pub fn set_revoked(&self, keys: impl IntoIterator<Item = ApiKey>) {
        let keys: DashSet<ApiKey> = keys.into_iter().collect();
        self.revoked.retain(|key| keys.contains(key));
        for key in keys {
            self.revoked.insert(key);
        }
    }

    /// Hand over every record kept since the last call
    pub fn take_records(&self) -> Vec<DeliveryRecord> {
        std::mem::take(&mut *self.records.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_reached() {
        let ledger = DeliveryLedger::new(Some(3));
        let key = ApiKey::new("0xk");

        for _ in 0..3 {
            assert_eq!(ledger.admit(&key), Ok(()));
            ledger.record(&key, TopicFamily::Block, 10);
        }
        assert_eq!(ledger.admit(&key), Err(DeliveryDenied::RateLimited));
        assert_eq!(ledger.deliveries(&key), 3);

        // Other keys have their own budget
        assert_eq!(ledger.admit(&ApiKey::new("0xother")), Ok(()));
    }

    #[test]
    fn test_unlimited() {
        let ledger = DeliveryLedger::new(None);
        let key = ApiKey::new("0xk");
        ledger.replace_deliveries([(key.clone(), 1_000_000)]);
        assert_eq!(ledger.admit(&key), Ok(()));
    }

    #[test]
    fn test_replace_deliveries() {
        let ledger = DeliveryLedger::new(Some(10));
        let (a, b) = (ApiKey::new("0xa"), ApiKey::new("0xb"));
        ledger.record(&a, TopicFamily::Block, 1);

        ledger.replace_deliveries([(b.clone(), 10)]);
        assert_eq!(ledger.deliveries(&a), 0);
        assert_eq!(ledger.deliveries(&b), 10);
        assert_eq!(ledger.admit(&b), Err(DeliveryDenied::RateLimited));
    }

    #[test]
    fn test_revoke_and_reinstate() {
        let ledger = DeliveryLedger::new(None);
        let key = ApiKey::new("0xk");

        ledger.revoke(&key);
        assert_eq!(ledger.admit(&key), Err(DeliveryDenied::Revoked));

        ledger.reinstate(&key);
        assert_eq!(ledger.admit(&key), Ok(()));
    }

    #[test]
    fn test_set_revoked_replaces_set() {
        let ledger = DeliveryLedger::new(None);
        let (a, b) = (ApiKey::new("0xa"), ApiKey::new("0xb"));

        ledger.set_revoked([a.clone()]);
        assert!(ledger.is_revoked(&a));

        ledger.set_revoked([b.clone()]);
        assert!(!ledger.is_revoked(&a));
        assert!(ledger.is_revoked(&b));
    }

    #[test]
    fn test_records_only_when_kept() {
        let key = ApiKey::new("0xk");

        let plain = DeliveryLedger::new(None);
        plain.record(&key, TopicFamily::Block, 5);
        assert!(plain.take_records().is_empty());

        let kept = DeliveryLedger::new(None).with_records();
        kept.record(&key, TopicFamily::Event, 5);
        kept.record(&key, TopicFamily::Transaction, 7);

        let records = kept.take_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].family, TopicFamily::Event);
        assert_eq!(records[1].bytes, 7);
        assert!(kept.take_records().is_empty());
    }

    #[test]
    fn test_denial_messages() {
        assert_eq!(DeliveryDenied::Revoked.to_string(), "Bad API Key");
        assert_eq!(
            DeliveryDenied::RateLimited.to_string(),
            "Crossed Allowed Rate Limit"
        );
    }
}
