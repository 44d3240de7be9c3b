//! Credential types
//!
//! - `ApiKey`: opaque subscriber credential sent with every subscribe command
//! - `AdminKey`: publisher credential guarding the HTTP publish endpoint

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix of generated API keys
pub const API_KEY_PREFIX: &str = "0x";

/// Random bytes behind a generated API key (hex encoded after the prefix)
const API_KEY_BYTES: usize = 32;

/// Compare two secrets without short-circuiting on the first differing byte
pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

/// Subscriber credential. Opaque to the broker; only an `Authorizer` interprets it.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Generate a fresh key: `0x` followed by 64 hex digits
    pub fn generate() -> Self {
        let mut bytes = [0u8; API_KEY_BYTES];
        rand::rng().fill(&mut bytes);

        Self(format!("{}{}", API_KEY_PREFIX, hex::encode(bytes)))
    }

    /// Shape check only, says nothing about whether the key is known
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == API_KEY_PREFIX.len() + API_KEY_BYTES * 2
            && self.0.starts_with(API_KEY_PREFIX)
            && self.0[API_KEY_PREFIX.len()..]
                .chars()
                .all(|c| c.is_ascii_hexdigit())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Constant-time equality against a stored key
    pub fn matches(&self, other: &str) -> bool {
        constant_time_eq(&self.0, other)
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiKey([REDACTED])")
    }
}

impl From<&str> for ApiKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for ApiKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Admin key for publishing
#[derive(Clone)]
pub struct AdminKey {
    key: String,
}

impl AdminKey {
    pub fn new(key: String) -> Self {
        Self { key }
    }

    pub fn matches(&self, token: &str) -> bool {
        constant_time_eq(&self.key, token)
    }

    /// Accepts `Bearer <key>` as sent in an `Authorization` header
    pub fn matches_bearer(&self, header: &str) -> bool {
        header
            .strip_prefix("Bearer ")
            .is_some_and(|token| self.matches(token.trim()))
    }
}

impl fmt::Debug for AdminKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AdminKey([REDACTED])")
    }
}
