//! Broker configuration

use crate::auth::AdminKey;
use std::net::SocketAddr;

/// Default websocket port of the gateway
pub const DEFAULT_PORT: u16 = 7000;

/// Default per-session outbound queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 128;

/// Library-facing broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Messages buffered per session before it is dropped as too slow
    pub queue_capacity: usize,
    /// Guards the HTTP publish endpoint; publishing over HTTP is disabled without it
    pub admin_key: Option<AdminKey>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            admin_key: None,
        }
    }
}

impl BrokerConfig {
    pub fn with_bind_addr(mut self, bind_addr: SocketAddr) -> Self {
        self.bind_addr = bind_addr;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity.max(1);
        self
    }

    pub fn with_admin_key(mut self, admin_key: AdminKey) -> Self {
        self.admin_key = Some(admin_key);
        self
    }
}
