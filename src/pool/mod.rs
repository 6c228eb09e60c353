//! Upstream connection pooling for mcbridge
//!
//! This module provides the ordered, generational connection pool the proxy
//! multiplexes client requests over: a generic FIFO resource pool, the
//! upstream connection type, the server pool that binds the two together,
//! and the checkout wrapper handed to request handlers.

mod connection;
mod monitor;
mod resource;
mod server;
mod wrapper;

pub use connection::{next_connection_id, Connection, ConnectionState, ExpireReason};
pub use monitor::{Event, EventType, Monitor};
pub use resource::{ResourceHooks, ResourcePool, ResourcePoolOptions};
pub use server::{Server, ServerState};
pub use wrapper::ConnectionWrapper;
