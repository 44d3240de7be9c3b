//! Broker: owns the registry and dispatcher and serves the websocket endpoint

use crate::auth::Authorizer;
use crate::config::BrokerConfig;
use crate::error::Result as BrokerResult;
use crate::server::dispatch::{DispatchReport, Dispatcher, PublishedEvent};
use crate::server::protocol::Payload;
use crate::server::registry::SubscriptionRegistry;
use crate::server::session::CloseReason;
use crate::server::websocket::{create_router, WsState};
use crate::topics::Topic;

use anyhow::{Context, Result};
use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

/// The blockfeed broker
pub struct Broker {
    config: BrokerConfig,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Dispatcher,
}

impl Broker {
    pub fn new(config: BrokerConfig, authorizer: Arc<dyn Authorizer>) -> Self {
        let registry = SubscriptionRegistry::new(authorizer);
        let dispatcher = Dispatcher::new(registry.clone());

        Self {
            config,
            registry,
            dispatcher,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<SubscriptionRegistry> {
        self.registry.clone()
    }

    /// Handle for publishing from outside the broker
    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    pub fn session_count(&self) -> usize {
        self.registry.session_count()
    }

    /// HTTP routes: `/v1/ws`, `/v1/publish`, `/health`
    pub fn router(&self) -> Router {
        create_router(WsState {
            registry: self.registry.clone(),
            dispatcher: self.dispatcher.clone(),
            queue_capacity: self.config.queue_capacity,
            admin_key: self.config.admin_key.clone(),
        })
    }

    /// Publish validated JSON text under a concrete topic
    pub fn publish(&self, topic: &str, payload: &str) -> BrokerResult<DispatchReport> {
        let topic = Topic::parse(topic)?;
        let payload = Payload::parse(payload)?;
        Ok(self.dispatcher.publish(&topic, payload))
    }

    /// Spawn a task draining `feed` into the dispatcher
    pub fn spawn_feed(&self, feed: mpsc::Receiver<PublishedEvent>) -> JoinHandle<()> {
        tokio::spawn(self.dispatcher.clone().run(feed))
    }

    /// Bind the configured address and serve until `shutdown` resolves
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.bind_addr))?;

        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    ///
    /// On shutdown every session is closed so its connection task returns and
    /// the server can drain.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr: SocketAddr = listener.local_addr()?;
        info!(addr = %addr, "Blockfeed broker listening");

        let registry = self.registry.clone();
        let graceful = async move {
            shutdown.await;
            let closed = registry.close_all(CloseReason::Shutdown);
            info!(sessions = closed, "Shutting down, closed sessions");
        };

        axum::serve(listener, self.router())
            .with_graceful_shutdown(graceful)
            .await
            .context("Server error")?;

        info!("Blockfeed broker stopped");
        Ok(())
    }
}
