//! Wire messages exchanged with subscribers

use crate::auth::ApiKey;
use crate::error::{BrokerError, Result};
use crate::topics::TopicPattern;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Reply code for an accepted command
pub const CODE_OK: u8 = 1;
/// Reply code for a rejected command
pub const CODE_ERROR: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandType {
    Subscribe,
    Unsubscribe,
}

/// Subscription or unsubscription request sent by a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Topic pattern, e.g. `transaction/*/0xB`
    pub name: String,
    #[serde(rename = "type")]
    pub kind: CommandType,
    #[serde(rename = "apiKey", default)]
    pub api_key: ApiKey,
}

impl Command {
    pub fn subscribe(name: impl Into<String>, api_key: impl Into<ApiKey>) -> Self {
        Self {
            name: name.into(),
            kind: CommandType::Subscribe,
            api_key: api_key.into(),
        }
    }

    pub fn unsubscribe(name: impl Into<String>, api_key: impl Into<ApiKey>) -> Self {
        Self {
            name: name.into(),
            kind: CommandType::Unsubscribe,
            api_key: api_key.into(),
        }
    }

    /// Decode a raw frame; anything that is not a well-shaped command is malformed
    pub fn decode(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).map_err(|e| BrokerError::MalformedCommand(e.to_string()))
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Validated pattern named by this command
    pub fn pattern(&self) -> Result<TopicPattern> {
        Ok(TopicPattern::parse(&self.name)?)
    }
}

/// Reply to a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub code: u8,
    #[serde(rename = "msg")]
    pub message: String,
}

impl Reply {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            code: CODE_OK,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: CODE_ERROR,
            message: message.into(),
        }
    }

    pub fn subscribed(pattern: &TopicPattern) -> Self {
        Self::ok(format!("Subscribed to `{}`", pattern))
    }

    pub fn unsubscribed(pattern: &TopicPattern) -> Self {
        Self::ok(format!("Unsubscribed from `{}`", pattern))
    }

    pub fn from_error(err: &BrokerError) -> Self {
        match err {
            BrokerError::MalformedCommand(_) => Self::error("Bad Payload"),
            BrokerError::InvalidPattern(e) => Self::error(format!("Bad Topic: {}", e)),
            BrokerError::Unauthorized(_) => Self::error("Bad API Key"),
            other => Self::error(other.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }
}

/// Event body as published, validated JSON shared by every recipient
#[derive(Clone, PartialEq, Eq)]
pub struct Payload(Arc<str>);

impl Payload {
    /// Validate JSON text supplied by a publisher
    pub fn parse(text: impl Into<String>) -> Result<Self> {
        let text = text.into();
        serde_json::from_str::<serde::de::IgnoredAny>(&text)
            .map_err(|e| BrokerError::InvalidPayload(e.to_string()))?;
        Ok(Self(text.into()))
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        Self::to_payload(value)
    }

    /// Serialize any publishable value once
    pub fn to_payload<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        serde_json::to_string(value)
            .map(|text| Self(text.into()))
            .map_err(|e| BrokerError::InvalidPayload(e.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({} bytes)", self.0.len())
    }
}

/// Message queued for delivery to one session
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// Raw published event
    Event(Payload),
    /// Reply to one of the session's commands
    Reply(Reply),
}

impl OutboundMessage {
    /// Text frame to write on the wire
    pub fn into_text(self) -> serde_json::Result<String> {
        match self {
            OutboundMessage::Event(payload) => Ok(payload.as_str().to_string()),
            OutboundMessage::Reply(reply) => serde_json::to_string(&reply),
        }
    }
}
