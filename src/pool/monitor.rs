//! Pool monitor events
//!
//! The server pool reports lifecycle events through a single-method sink
//! so metrics wiring stays outside the pool. Events are emitted strictly
//! after the state change they describe has committed.

use std::sync::Arc;

/// Types of pool events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// The pool finished connecting
    PoolCreated,
    /// The pool generation was bumped
    PoolCleared,
    /// The pool finished disconnecting
    PoolClosed,
    /// A connection was minted
    ConnectionCreated,
    /// A connection was disposed of
    ConnectionClosed,
    /// A checkout completed successfully
    GetSucceeded,
    /// A checkout failed
    GetFailed,
    /// A checked-out connection came back
    ConnectionReturned,
}

impl EventType {
    /// Wire name used in metric names.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PoolCreated => "pool_created",
            EventType::PoolCleared => "pool_cleared",
            EventType::PoolClosed => "pool_closed",
            EventType::ConnectionCreated => "connection_created",
            EventType::ConnectionClosed => "connection_closed",
            EventType::GetSucceeded => "get_succeeded",
            EventType::GetFailed => "get_failed",
            EventType::ConnectionReturned => "connection_returned",
        }
    }
}

/// A single pool event.
#[derive(Debug, Clone)]
pub struct Event {
    /// What happened
    pub event_type: EventType,
    /// Upstream address the pool serves
    pub address: String,
    /// Connection the event concerns; 0 for pool-level events
    pub connection_id: u64,
    /// Free-form reason tag
    pub reason: Option<&'static str>,
}

/// Sink for pool events.
pub trait Monitor: Send + Sync {
    /// Receive one event.
    fn event(&self, event: &Event);
}

/// Convenience for the pool's optional monitor field.
pub(crate) fn emit(
    monitor: &Option<Arc<dyn Monitor>>,
    event_type: EventType,
    address: &str,
    connection_id: u64,
    reason: Option<&'static str>,
) {
    if let Some(monitor) = monitor {
        monitor.event(&Event {
            event_type,
            address: address.to_string(),
            connection_id,
            reason,
        });
    }
}
