//! Blockfeed - topic-based event broker for a blockchain gateway
//!
//! Subscribers connect over WebSocket and register topic patterns such as
//! `transaction/0xA/*` or `event/0xC/*/*/*/*`. Every event published under a
//! concrete topic is pushed, as-is, to each matching subscription.

pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod server;
pub mod storage;
pub mod topics;

pub use auth::{AdminKey, ApiKey, Authorizer};
pub use config::BrokerConfig;
pub use error::{BrokerError, Result};
pub use events::{Block, LogEvent, Publishable, Transaction};
pub use server::{Broker, Dispatcher};
pub use topics::{Topic, TopicPattern};
