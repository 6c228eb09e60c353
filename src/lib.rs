//! # mcbridge - Memcached Sidecar Proxy
//!
//! Mcbridge is a sidecar proxy for ElastiCache-style memcached clusters.
//! A client application connects to a local endpoint (usually a Unix
//! domain socket) as if it were a single memcached instance; mcbridge
//! multiplexes the client's requests onto pooled, long-lived TCP
//! connections to the real upstream nodes.
//!
//! ## Features
//!
//! - **Cluster Discovery**: One-shot `config get cluster` bootstrap
//!   against the real ElastiCache config endpoint
//! - **Connection Pooling**: Ordered, generational pools with min/max
//!   sizing, background maintenance, and per-connection inactivity expiry
//! - **Opaque Framing**: Memcached binary frames are relayed byte-for-byte;
//!   payloads are never parsed or rewritten
//! - **Config Emulation**: A local endpoint answers `config get cluster`
//!   with a synthetic manifest pointing at the local proxies
//! - **Graceful Shutdown**: First signal drains connections, a second
//!   force-closes in-flight work
//!
//! ## Architecture
//!
//! ```text
//! Client -> local socket -> mcbridge -> pooled TCP -> memcached node
//! ```
//!
//! One listener per upstream node plus one config responder. Each
//! accepted client socket gets its own task running a strictly serial
//! read / round-trip / reply loop.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod elasticache;
pub mod error;
pub mod handlers;
pub mod listener;
pub mod metrics;
pub mod pool;
pub mod wire;

// Re-export commonly used items
pub use config::{load_config, Config};
pub use error::{ConfigError, PoolError, WireError};

/// Version of the mcbridge library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");
