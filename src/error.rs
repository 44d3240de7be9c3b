//! Broker error taxonomy
//!
//! Every variant is scoped to one command or one session; none of them is fatal to
//! the broker process.

use crate::server::SessionId;
use crate::topics::TopicError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// Undecodable command. Logged, session continues.
    #[error("malformed command: {0}")]
    MalformedCommand(String),

    /// Wrong arity or bad segment. Subscribe rejected, session continues.
    #[error("invalid topic pattern: {0}")]
    InvalidPattern(#[from] TopicError),

    /// Credential rejected. Subscribe rejected, session continues.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Outbound queue exceeded. Session forcibly closed.
    #[error("outbound queue of session {0} overflowed")]
    SessionOverflow(SessionId),

    /// Session already torn down, locally or by the peer.
    #[error("session {0} is closed")]
    TransportClosed(SessionId),

    /// Publisher handed over something that is not JSON.
    #[error("invalid event payload: {0}")]
    InvalidPayload(String),
}

/// Result type for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;
