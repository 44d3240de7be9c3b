//! Per-connection session state

use crate::error::{BrokerError, Result};
use crate::server::protocol::{Command, CommandType, OutboundMessage, Reply};
use crate::server::registry::{SubscriptionChange, SubscriptionRegistry};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unique session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Liveness of a session. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer went away or a write failed
    TransportClosed,
    /// Outbound queue was full
    Overflow,
    /// Broker is shutting down
    Shutdown,
}

/// A connected subscriber
pub struct Session {
    id: SessionId,
    /// Bounded FIFO towards the transport writer
    tx: mpsc::Sender<OutboundMessage>,
    state: watch::Sender<SessionState>,
    registry: Weak<SubscriptionRegistry>,
}

impl Session {
    /// Sessions are created through `SubscriptionRegistry::open_session`
    pub(crate) fn new(
        registry: Weak<SubscriptionRegistry>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (state, _) = watch::channel(SessionState::Active);

        let session = Arc::new(Self {
            id: SessionId::new(),
            tx,
            state,
            registry,
        });

        (session, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Receiver notified on every state transition
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Enqueue a message without waiting.
    ///
    /// A full queue closes the session: dropping the whole session keeps every
    /// surviving session's stream gap-free.
    pub fn send(&self, msg: OutboundMessage) -> Result<()> {
        if !self.is_active() {
            return Err(BrokerError::TransportClosed(self.id));
        }

        match self.tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(session_id = %self.id, "Outbound queue full, closing session");
                self.close(CloseReason::Overflow);
                Err(BrokerError::SessionOverflow(self.id))
            }
            Err(TrySendError::Closed(_)) => {
                self.close(CloseReason::TransportClosed);
                Err(BrokerError::TransportClosed(self.id))
            }
        }
    }

    /// Tear the session down. Returns false if it was already closing or closed.
    ///
    /// The `Active -> Closing` check-and-set guarantees the registry cleanup runs
    /// exactly once no matter how many paths race to close.
    pub fn close(&self, reason: CloseReason) -> bool {
        let won = self.state.send_if_modified(|state| {
            if *state == SessionState::Active {
                *state = SessionState::Closing;
                true
            } else {
                false
            }
        });

        if !won {
            return false;
        }

        let removed = self
            .registry
            .upgrade()
            .map(|registry| registry.remove_session(self.id))
            .unwrap_or(0);

        self.state.send_replace(SessionState::Closed);

        info!(
            session_id = %self.id,
            reason = ?reason,
            subscriptions = removed,
            "Session closed"
        );
        true
    }

    /// Decode one raw command, apply it, and queue the reply.
    ///
    /// Per-command failures are logged and answered; the session stays open.
    pub async fn handle_command(self: &Arc<Self>, raw: &[u8]) -> Result<SubscriptionChange> {
        let result = self.apply_command(raw).await;

        let reply = match &result {
            Ok(change) => change.reply(),
            Err(e) => {
                debug!(session_id = %self.id, error = %e, "Command rejected");
                Reply::from_error(e)
            }
        };

        self.send(OutboundMessage::Reply(reply))?;
        result
    }

    async fn apply_command(self: &Arc<Self>, raw: &[u8]) -> Result<SubscriptionChange> {
        let command = Command::decode(raw)?;

        let registry = self
            .registry
            .upgrade()
            .ok_or(BrokerError::TransportClosed(self.id))?;

        match command.kind {
            CommandType::Subscribe => {
                registry
                    .subscribe(self, &command.name, &command.api_key)
                    .await
            }
            CommandType::Unsubscribe => registry.unsubscribe(self.id, &command.name),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
