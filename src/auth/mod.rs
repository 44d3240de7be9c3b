//! Authentication and authorization
//!
//! Subscribers present an API key with every `subscribe` command; the broker hands
//! it to an `Authorizer` and never interprets it itself. Publishers pushing events
//! over HTTP authenticate with the admin key.
//!
//! Authorizers:
//! - `StaticKeyAuthorizer`: keys listed in configuration
//! - `PostgresStore` (see `storage`): keys kept in the database, can be disabled
//! - `AllowAnyKey`: development only
//!
//! Authorizers are consulted again before every delivery: a key that was
//! disabled or crossed its daily delivery limit stops receiving events.

mod authorizer;
mod keys;
mod quota;

pub use authorizer::{AllowAnyKey, AuthError, Authorizer, StaticKeyAuthorizer};
pub use keys::{AdminKey, ApiKey, API_KEY_PREFIX};
pub use quota::{
    DeliveryDenied, DeliveryLedger, DeliveryRecord, DEFAULT_DAILY_DELIVERY_LIMIT, DELIVERY_WINDOW,
};
