//! Event dispatch and fan-out

use crate::auth::Authorizer;
use crate::error::{BrokerError, Result};
use crate::events::Publishable;
use crate::server::protocol::{OutboundMessage, Payload, Reply};
use crate::server::registry::SubscriptionRegistry;
use crate::server::session::SessionId;
use crate::topics::Topic;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Event handed to the dispatcher by an external feed
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub topic: Topic,
    pub payload: Payload,
}

impl PublishedEvent {
    pub fn new(topic: Topic, payload: Payload) -> Self {
        Self { topic, payload }
    }

    /// Decode the `{"topic": "...", "payload": <json>}` envelope used by feeds
    pub fn from_json(raw: &str) -> Result<Self> {
        #[derive(Deserialize)]
        struct Envelope {
            topic: String,
            payload: serde_json::Value,
        }

        let envelope: Envelope =
            serde_json::from_str(raw).map_err(|e| BrokerError::InvalidPayload(e.to_string()))?;
        let topic = Topic::parse(&envelope.topic)?;
        let payload = Payload::from_value(&envelope.payload)?;

        Ok(Self { topic, payload })
    }

    pub fn from_event<E: Publishable>(event: &E) -> Result<Self> {
        Ok(Self {
            topic: event.topic()?,
            payload: Payload::to_payload(event)?,
        })
    }
}

/// Outcome of one publish
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub sequence: u64,
    /// Matching subscriptions in the snapshot
    pub matched: usize,
    /// Messages enqueued successfully
    pub delivered: usize,
    /// Subscriptions dropped because their key was revoked or over its limit
    pub denied: usize,
    /// Sessions closed because a send failed
    #[serde(skip)]
    pub closed: Vec<SessionId>,
}

/// Delivers published events to every matching subscription
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<SubscriptionRegistry>,
    authorizer: Arc<dyn Authorizer>,
    /// Held across snapshot and enqueue so every session sees one global order
    sequence: Arc<Mutex<u64>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self {
            authorizer: registry.authorizer().clone(),
            registry,
            sequence: Arc::new(Mutex::new(0)),
        }
    }

    /// Fan an event out to its subscribers.
    ///
    /// At-most-once: a session whose queue is full or gone is closed and skipped,
    /// the rest still receive the event. Never blocks on a slow subscriber.
    ///
    /// Each delivery is admitted by the authorizer first. A refused subscription
    /// is removed and its session told why; the session itself stays open.
    pub fn publish(&self, topic: &Topic, payload: Payload) -> DispatchReport {
        let mut sequence = self.sequence.lock();
        *sequence += 1;

        let matched = self.registry.subscriptions_matching(topic);
        let mut report = DispatchReport {
            sequence: *sequence,
            matched: matched.len(),
            ..Default::default()
        };

        if matched.is_empty() {
            debug!(topic = %topic, sequence = report.sequence, "No subscribers for topic");
            return report;
        }

        for subscription in matched {
            if let Err(denied) = self.authorizer.admit_delivery(&subscription.credential) {
                self.registry
                    .remove_subscription(subscription.session.id(), &subscription.pattern);
                debug!(
                    session_id = %subscription.session.id(),
                    pattern = %subscription.pattern,
                    reason = %denied,
                    "Delivery refused, subscription dropped"
                );
                // A failed send closes the session on its own
                let _ = subscription
                    .session
                    .send(OutboundMessage::Reply(Reply::error(denied.to_string())));
                report.denied += 1;
                continue;
            }

            match subscription
                .session
                .send(OutboundMessage::Event(payload.clone()))
            {
                Ok(()) => {
                    report.delivered += 1;
                    self.authorizer.record_delivery(
                        &subscription.credential,
                        topic.family(),
                        payload.len(),
                    );
                }
                Err(e) => {
                    debug!(
                        session_id = %subscription.session.id(),
                        pattern = %subscription.pattern,
                        error = %e,
                        "Dropped delivery"
                    );
                    if !report.closed.contains(&subscription.session.id()) {
                        report.closed.push(subscription.session.id());
                    }
                }
            }
        }

        debug!(
            topic = %topic,
            sequence = report.sequence,
            matched = report.matched,
            delivered = report.delivered,
            denied = report.denied,
            "Dispatched"
        );

        report
    }

    /// Validate raw JSON text and publish it
    pub fn publish_json(&self, topic: &Topic, payload: &str) -> Result<DispatchReport> {
        let payload = Payload::parse(payload)?;
        Ok(self.publish(topic, payload))
    }

    /// Publish a typed chain payload under the topic it derives
    pub fn publish_event<E: Publishable>(&self, event: &E) -> Result<DispatchReport> {
        let published = PublishedEvent::from_event(event)?;
        Ok(self.publish(&published.topic, published.payload))
    }

    /// Drain a feed until every sender is gone
    pub async fn run(self, mut feed: mpsc::Receiver<PublishedEvent>) {
        info!("Dispatcher feed started");

        while let Some(event) = feed.recv().await {
            let report = self.publish(&event.topic, event.payload);
            if !report.closed.is_empty() {
                warn!(
                    topic = %event.topic,
                    closed = report.closed.len(),
                    "Sessions dropped during dispatch"
                );
            }
        }

        info!("Dispatcher feed ended");
    }

    /// Sequence number of the most recent publish
    pub fn last_sequence(&self) -> u64 {
        *self.sequence.lock()
    }
}
