//! Connection handlers for the local endpoints
//!
//! [`ProxyHandler`] serves the memcached data path; [`ConfigHandler`]
//! serves the synthetic cluster-config endpoint. [`PoolDisconnect`] wires
//! a server pool's drain into listener shutdown.

mod config;
mod proxy;

pub use config::ConfigHandler;
pub use proxy::ProxyHandler;

use crate::listener::ShutdownHandler;
use crate::pool::Server;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Disconnects a server pool, bounded by a drain timeout, when the owning
/// listener shuts down.
pub struct PoolDisconnect {
    server: Arc<Server>,
    timeout: Duration,
}

impl PoolDisconnect {
    /// Tie `server` to listener shutdown with the given drain bound.
    pub fn new(server: Arc<Server>, timeout: Duration) -> Arc<Self> {
        Arc::new(PoolDisconnect { server, timeout })
    }
}

#[async_trait]
impl ShutdownHandler for PoolDisconnect {
    async fn shutdown(&self) {
        let deadline = Instant::now() + self.timeout;
        let _ = self.server.disconnect(Some(deadline)).await;
    }
}
