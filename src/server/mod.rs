//! Blockfeed server implementation
//!
//! Handles WebSocket sessions, the subscription registry and event fan-out.

mod broker;
mod dispatch;
pub mod protocol;
mod registry;
mod session;
pub mod websocket;

pub use broker::Broker;
pub use dispatch::{DispatchReport, Dispatcher, PublishedEvent};
pub use protocol::{Command, CommandType, OutboundMessage, Payload, Reply};
pub use registry::{MatchedSubscription, SubscriptionChange, SubscriptionRegistry};
pub use session::{CloseReason, Session, SessionId, SessionState};
pub use websocket::{create_router, WsState};
