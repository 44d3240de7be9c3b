//! Subscription registry
//!
//! Subscriptions are indexed by topic family, so a published `block` never scans
//! transaction or event patterns. Within a family each session keeps its own
//! pattern set, scanned linearly at dispatch time.
//!
//! The index sits behind a single reader-writer lock: subscribe, unsubscribe and
//! session removal take it exclusively, dispatch snapshots share it. A snapshot
//! therefore never observes a half-applied change.

use crate::auth::{ApiKey, Authorizer};
use crate::error::{BrokerError, Result};
use crate::server::protocol::{OutboundMessage, Reply};
use crate::server::session::{CloseReason, Session, SessionId};
use crate::topics::{Topic, TopicFamily, TopicPattern};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Effect of a subscribe or unsubscribe command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionChange {
    Subscribed(TopicPattern),
    /// Same (session, pattern) already present; nothing added
    AlreadySubscribed(TopicPattern),
    Unsubscribed(TopicPattern),
    /// Pattern was not subscribed; nothing removed
    NotSubscribed(TopicPattern),
}

impl SubscriptionChange {
    pub fn pattern(&self) -> &TopicPattern {
        match self {
            SubscriptionChange::Subscribed(p)
            | SubscriptionChange::AlreadySubscribed(p)
            | SubscriptionChange::Unsubscribed(p)
            | SubscriptionChange::NotSubscribed(p) => p,
        }
    }

    pub fn reply(&self) -> Reply {
        match self {
            SubscriptionChange::Subscribed(p) | SubscriptionChange::AlreadySubscribed(p) => {
                Reply::subscribed(p)
            }
            SubscriptionChange::Unsubscribed(p) | SubscriptionChange::NotSubscribed(p) => {
                Reply::unsubscribed(p)
            }
        }
    }
}

/// One entry of a dispatch snapshot
#[derive(Debug, Clone)]
pub struct MatchedSubscription {
    pub session: Arc<Session>,
    pub pattern: Arc<TopicPattern>,
    /// Key the subscription was opened with, checked again on every delivery
    pub credential: Arc<ApiKey>,
}

struct SessionSubscriptions {
    session: Arc<Session>,
    /// Pattern -> credential it was opened with
    patterns: HashMap<Arc<TopicPattern>, Arc<ApiKey>>,
}

#[derive(Default)]
struct FamilyIndex {
    families: HashMap<TopicFamily, HashMap<SessionId, SessionSubscriptions>>,
}

/// Authoritative set of live sessions and their subscriptions
pub struct SubscriptionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    index: RwLock<FamilyIndex>,
    authorizer: Arc<dyn Authorizer>,
}

impl SubscriptionRegistry {
    pub fn new(authorizer: Arc<dyn Authorizer>) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            index: RwLock::new(FamilyIndex::default()),
            authorizer,
        })
    }

    /// Register a new active session with an outbound queue of `capacity` messages
    pub fn open_session(
        self: &Arc<Self>,
        capacity: usize,
    ) -> (Arc<Session>, mpsc::Receiver<OutboundMessage>) {
        let (session, rx) = Session::new(Arc::downgrade(self), capacity);
        self.sessions.insert(session.id(), session.clone());
        debug!(session_id = %session.id(), "Session opened");
        (session, rx)
    }

    /// Add `pattern` for `session`. Idempotent per (session, pattern).
    ///
    /// Validation and authorization happen before the index is touched, so a
    /// failed subscribe leaves no trace.
    pub async fn subscribe(
        &self,
        session: &Arc<Session>,
        pattern: &str,
        credential: &ApiKey,
    ) -> Result<SubscriptionChange> {
        let pattern = TopicPattern::parse(pattern)?;

        self.authorizer
            .authorize(credential)
            .await
            .map_err(|e| BrokerError::Unauthorized(e.to_string()))?;

        let mut index = self.index.write();

        // Checked under the write lock: removal flips the state before taking it
        if !session.is_active() {
            return Err(BrokerError::TransportClosed(session.id()));
        }

        let entry = index
            .families
            .entry(pattern.family())
            .or_default()
            .entry(session.id())
            .or_insert_with(|| SessionSubscriptions {
                session: session.clone(),
                patterns: HashMap::new(),
            });

        if let Some(existing) = entry.patterns.get_mut(&pattern) {
            *existing = Arc::new(credential.clone());
            return Ok(SubscriptionChange::AlreadySubscribed(pattern));
        }

        entry
            .patterns
            .insert(Arc::new(pattern.clone()), Arc::new(credential.clone()));
        debug!(session_id = %session.id(), pattern = %pattern, "Subscribed");

        Ok(SubscriptionChange::Subscribed(pattern))
    }

    /// Remove `pattern` for `session`; absent subscriptions are not an error
    pub fn unsubscribe(&self, session: SessionId, pattern: &str) -> Result<SubscriptionChange> {
        let pattern = TopicPattern::parse(pattern)?;

        if self.remove_subscription(session, &pattern) {
            debug!(session_id = %session, pattern = %pattern, "Unsubscribed");
            Ok(SubscriptionChange::Unsubscribed(pattern))
        } else {
            Ok(SubscriptionChange::NotSubscribed(pattern))
        }
    }

    /// Remove one already parsed subscription, returning whether it existed
    pub fn remove_subscription(&self, session: SessionId, pattern: &TopicPattern) -> bool {
        let mut index = self.index.write();
        let Some(family) = index.families.get_mut(&pattern.family()) else {
            return false;
        };
        let Some(entry) = family.get_mut(&session) else {
            return false;
        };

        let removed = entry.patterns.remove(pattern).is_some();
        if entry.patterns.is_empty() {
            family.remove(&session);
        }
        removed
    }

    /// Drop a session and every subscription it holds, returning how many went.
    ///
    /// Called by `Session::close`; repeated calls find nothing to remove.
    pub fn remove_session(&self, session: SessionId) -> usize {
        self.sessions.remove(&session);

        let mut index = self.index.write();
        let mut removed = 0;
        for family in index.families.values_mut() {
            if let Some(entry) = family.remove(&session) {
                removed += entry.patterns.len();
            }
        }
        removed
    }

    /// Point-in-time snapshot of every subscription whose pattern matches `topic`.
    ///
    /// A session appears once per matching pattern.
    pub fn subscriptions_matching(&self, topic: &Topic) -> Vec<MatchedSubscription> {
        let index = self.index.read();
        let Some(family) = index.families.get(&topic.family()) else {
            return Vec::new();
        };

        let mut matched = Vec::new();
        for entry in family.values() {
            for (pattern, credential) in &entry.patterns {
                if pattern.matches(topic) {
                    matched.push(MatchedSubscription {
                        session: entry.session.clone(),
                        pattern: pattern.clone(),
                        credential: credential.clone(),
                    });
                }
            }
        }
        matched
    }

    /// Close every live session, e.g. on broker shutdown
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let sessions: Vec<Arc<Session>> = self.sessions.iter().map(|e| e.value().clone()).collect();
        sessions.iter().filter(|s| s.close(reason)).count()
    }

    pub(crate) fn authorizer(&self) -> &Arc<dyn Authorizer> {
        &self.authorizer
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|s| s.value().clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.index
            .read()
            .families
            .values()
            .flat_map(|family| family.values())
            .map(|entry| entry.patterns.len())
            .sum()
    }

    /// Patterns currently held by one session
    pub fn subscriptions_of(&self, session: SessionId) -> Vec<TopicPattern> {
        let index = self.index.read();
        let mut patterns: Vec<TopicPattern> = index
            .families
            .values()
            .filter_map(|family| family.get(&session))
            .flat_map(|entry| entry.patterns.keys().map(|p| p.as_ref().clone()))
            .collect();
        patterns.sort();
        patterns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticKeyAuthorizer;

    const KEY: &str = "0xgood";

    fn registry() -> Arc<SubscriptionRegistry> {
        SubscriptionRegistry::new(Arc::new(StaticKeyAuthorizer::new([ApiKey::new(KEY)])))
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let registry = registry();
        let (session, _rx) = registry.open_session(8);
        let key = ApiKey::new(KEY);

        let first = registry.subscribe(&session, "block", &key).await.unwrap();
        let second = registry.subscribe(&session, "block", &key).await.unwrap();

        assert_eq!(first, SubscriptionChange::Subscribed(TopicPattern::Block));
        assert_eq!(second, SubscriptionChange::AlreadySubscribed(TopicPattern::Block));
        assert_eq!(registry.subscription_count(), 1);
        assert_eq!(registry.subscriptions_matching(&Topic::Block).len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_absent_is_noop() {
        let registry = registry();
        let (session, _rx) = registry.open_session(8);

        let change = registry.unsubscribe(session.id(), "transaction/*/*").unwrap();
        assert!(matches!(change, SubscriptionChange::NotSubscribed(_)));
        assert_eq!(registry.subscription_count(), 0);

        registry
            .subscribe(&session, "block", &ApiKey::new(KEY))
            .await
            .unwrap();
        let change = registry.unsubscribe(session.id(), "transaction/0xA/*").unwrap();
        assert!(matches!(change, SubscriptionChange::NotSubscribed(_)));
        assert_eq!(registry.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_removes() {
        let registry = registry();
        let (session, _rx) = registry.open_session(8);
        let key = ApiKey::new(KEY);

        registry.subscribe(&session, "transaction/0xA/*", &key).await.unwrap();
        registry.subscribe(&session, "transaction/*/0xB", &key).await.unwrap();

        let change = registry.unsubscribe(session.id(), "transaction/0xA/*").unwrap();
        assert!(matches!(change, SubscriptionChange::Unsubscribed(_)));
        assert_eq!(
            registry.subscriptions_of(session.id()),
            vec![TopicPattern::parse("transaction/*/0xB").unwrap()]
        );
    }

    #[tokio::test]
    async fn test_unauthorized_leaves_no_state() {
        let registry = registry();
        let (session, _rx) = registry.open_session(8);

        let err = registry
            .subscribe(&session, "block", &ApiKey::new("0xbad"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Unauthorized(_)));
        assert_eq!(registry.subscription_count(), 0);
        assert!(session.is_active());
    }

    #[tokio::test]
    async fn test_invalid_pattern_rejected() {
        let registry = registry();
        let (session, _rx) = registry.open_session(8);
        let key = ApiKey::new(KEY);

        for bad in ["transaction/*", "event/*/*/*/*", "transaction//*", "blocks", ""] {
            let err = registry.subscribe(&session, bad, &key).await.unwrap_err();
            assert!(matches!(err, BrokerError::InvalidPattern(_)), "{}", bad);
        }
        assert!(matches!(
            registry.unsubscribe(session.id(), "block/*"),
            Err(BrokerError::InvalidPattern(_))
        ));
        assert_eq!(registry.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_overlapping_patterns_match_once_each() {
        let registry = registry();
        let (session, _rx) = registry.open_session(8);
        let key = ApiKey::new(KEY);

        registry.subscribe(&session, "transaction/0xA/*", &key).await.unwrap();
        registry.subscribe(&session, "transaction/*/0xB", &key).await.unwrap();

        let matched = registry.subscriptions_matching(&Topic::transaction("0xA", "0xB"));
        assert_eq!(matched.len(), 2);

        let mut patterns: Vec<String> = matched.iter().map(|m| m.pattern.to_string()).collect();
        patterns.sort();
        assert_eq!(patterns, vec!["transaction/*/0xB", "transaction/0xA/*"]);
        assert!(matched.iter().all(|m| m.session.id() == session.id()));
    }

    #[tokio::test]
    async fn test_remove_session_clears_all_families() {
        let registry = registry();
        let (session, _rx) = registry.open_session(8);
        let key = ApiKey::new(KEY);

        for pattern in ["block", "transaction/*/*", "event/*/*/*/*/*", "event/0xC/*/*/*/*"] {
            registry.subscribe(&session, pattern, &key).await.unwrap();
        }
        assert_eq!(registry.subscription_count(), 4);

        assert_eq!(registry.remove_session(session.id()), 4);
        assert_eq!(registry.remove_session(session.id()), 0);

        assert!(registry.subscriptions_matching(&Topic::Block).is_empty());
        assert!(registry
            .subscriptions_matching(&Topic::event("0xC", &["0x1"]).unwrap())
            .is_empty());
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_after_close_rejected() {
        let registry = registry();
        let (session, _rx) = registry.open_session(8);
        session.close(CloseReason::TransportClosed);

        let err = registry
            .subscribe(&session, "block", &ApiKey::new(KEY))
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::TransportClosed(session.id()));
        assert_eq!(registry.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_carries_latest_credential() {
        let registry = SubscriptionRegistry::new(Arc::new(crate::auth::AllowAnyKey));
        let (session, _rx) = registry.open_session(8);

        registry
            .subscribe(&session, "block", &ApiKey::new("0xfirst"))
            .await
            .unwrap();
        registry
            .subscribe(&session, "block", &ApiKey::new("0xsecond"))
            .await
            .unwrap();

        let matched = registry.subscriptions_matching(&Topic::Block);
        assert_eq!(matched.len(), 1);
        assert_eq!(*matched[0].credential, ApiKey::new("0xsecond"));
    }

    #[tokio::test]
    async fn test_remove_subscription() {
        let registry = registry();
        let (session, _rx) = registry.open_session(8);
        let key = ApiKey::new(KEY);
        registry.subscribe(&session, "block", &key).await.unwrap();
        registry.subscribe(&session, "transaction/*/*", &key).await.unwrap();

        assert!(registry.remove_subscription(session.id(), &TopicPattern::Block));
        assert!(!registry.remove_subscription(session.id(), &TopicPattern::Block));
        assert_eq!(registry.subscription_count(), 1);
        assert!(session.is_active());
    }

    #[tokio::test]
    async fn test_families_are_isolated() {
        let registry = registry();
        let (session, _rx) = registry.open_session(8);
        let key = ApiKey::new(KEY);

        registry.subscribe(&session, "transaction/*/*", &key).await.unwrap();

        assert!(registry.subscriptions_matching(&Topic::Block).is_empty());
        assert_eq!(
            registry
                .subscriptions_matching(&Topic::transaction("0x1", ""))
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = registry();
        let sessions: Vec<_> = (0..5).map(|_| registry.open_session(4)).collect();
        assert_eq!(registry.session_count(), 5);

        assert_eq!(registry.close_all(CloseReason::Shutdown), 5);
        assert_eq!(registry.session_count(), 0);
        assert!(sessions.iter().all(|(s, _)| !s.is_active()));
    }
}
