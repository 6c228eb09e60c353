//! Upstream connection lifecycle
//!
//! A [`Connection`] owns one TCP socket to a memcached node plus the state
//! the pool needs to decide when to retire it: the generation it was minted
//! under, its inactivity deadline, and a sticky record of why it expired.

use crate::error::PoolError;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::debug;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

/// Allocate a process-unique monotonic connection identifier.
///
/// Shared between upstream connections and accepted client sockets so a
/// single id space covers every socket the proxy touches.
pub fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::SeqCst) + 1
}

/// Lifecycle states; transitions flow only forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, never dialed
    Fresh,
    /// Dialed and usable
    Live,
    /// Marked for discard on return
    Expiring,
    /// Socket released; terminal
    Closed,
}

/// Why a connection was rejected by the expiry predicate. Recorded once;
/// later checks keep the first reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireReason {
    /// The inactivity deadline passed
    Expired,
    /// Minted under an older pool generation
    Stale,
    /// The owning pool is no longer connected
    PoolClosed,
}

impl ExpireReason {
    /// Tag value for monitor events.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpireReason::Expired => "expired",
            ExpireReason::Stale => "stale",
            ExpireReason::PoolClosed => "pool_closed",
        }
    }
}

impl std::fmt::Display for ExpireReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single upstream socket plus its lifecycle state.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    address: String,
    stream: Option<TcpStream>,
    generation: u64,
    created_at: Instant,
    expires_at: Option<Instant>,
    last_used_at: Instant,
    idle_timeout: Option<Duration>,
    state: ConnectionState,
    expire_reason: OnceLock<ExpireReason>,
}

impl Connection {
    /// Allocate a fresh connection. No network I/O happens here; the dial
    /// is deferred to the first checkout.
    pub fn new(address: &str, generation: u64, idle_timeout: Option<Duration>) -> Self {
        let now = Instant::now();
        Connection {
            id: next_connection_id(),
            address: address.to_string(),
            stream: None,
            generation,
            created_at: now,
            expires_at: idle_timeout.map(|t| now + t),
            last_used_at: now,
            idle_timeout,
            state: ConnectionState::Fresh,
            expire_reason: OnceLock::new(),
        }
    }

    /// Process-unique identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Upstream endpoint string.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Generation the connection was minted under.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Wall-clock age of the connection.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Whether the socket has been dialed.
    pub fn is_dialed(&self) -> bool {
        self.state != ConnectionState::Fresh
    }

    /// The recorded expiry reason, if the predicate ever matched.
    pub fn expire_reason(&self) -> Option<ExpireReason> {
        self.expire_reason.get().copied()
    }

    /// Mutable access to the socket while checked out.
    pub fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }

    /// Open the TCP socket. `Fresh -> Live`; a failed or timed-out dial
    /// transitions to `Closed` and surfaces the cause.
    pub async fn connect(&mut self, timeout: Duration) -> Result<(), PoolError> {
        let dial = tokio::time::timeout(timeout, TcpStream::connect(&self.address)).await;

        let stream = match dial {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.state = ConnectionState::Closed;
                return Err(PoolError::Dial {
                    address: self.address.clone(),
                    id: self.id,
                    source: e,
                });
            }
            Err(_) => {
                self.state = ConnectionState::Closed;
                return Err(PoolError::Dial {
                    address: self.address.clone(),
                    id: self.id,
                    source: io::Error::new(io::ErrorKind::TimedOut, "connect timeout"),
                });
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(address = %self.address, id = self.id, error = %e, "failed to set nodelay");
        }

        self.stream = Some(stream);
        self.state = ConnectionState::Live;
        self.touch();
        debug!(address = %self.address, id = self.id, "upstream connection established");
        Ok(())
    }

    /// Refresh `last_used_at` and the inactivity deadline.
    pub fn touch(&mut self) {
        let now = Instant::now();
        self.last_used_at = now;
        self.expires_at = self.idle_timeout.map(|t| now + t);
    }

    /// Mark the connection for discard when it is next returned.
    pub fn mark_expiring(&mut self) {
        if matches!(self.state, ConnectionState::Fresh | ConnectionState::Live) {
            self.state = ConnectionState::Expiring;
        }
    }

    /// Idempotent close: `-> Closed`, socket released.
    pub fn close(&mut self) {
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Closed;
            self.stream = None;
        }
    }

    /// Expiry predicate. Pool state and generation arrive as snapshots so
    /// the connection never holds a reference back into its pool. The
    /// first matching reason is recorded and sticks.
    pub fn expired(&self, pool_open: bool, pool_generation: u64) -> bool {
        match self.state {
            ConnectionState::Closed | ConnectionState::Expiring => return true,
            ConnectionState::Fresh | ConnectionState::Live => {}
        }

        if !pool_open {
            let _ = self.expire_reason.set(ExpireReason::PoolClosed);
            return true;
        }

        if self.generation < pool_generation {
            let _ = self.expire_reason.set(ExpireReason::Stale);
            return true;
        }

        if let Some(deadline) = self.expires_at {
            if deadline <= Instant::now() {
                let _ = self.expire_reason.set(ExpireReason::Expired);
                return true;
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic() {
        let a = Connection::new("localhost:11211", 0, None);
        let b = Connection::new("localhost:11211", 0, None);
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_new_connection_is_fresh() {
        let conn = Connection::new("localhost:11211", 3, None);
        assert_eq!(conn.state(), ConnectionState::Fresh);
        assert!(!conn.is_dialed());
        assert_eq!(conn.generation(), 3);
        assert_eq!(conn.expire_reason(), None);
    }

    #[test]
    fn test_fresh_live_connection_not_expired() {
        let conn = Connection::new("localhost:11211", 1, Some(Duration::from_secs(60)));
        assert!(!conn.expired(true, 1));
        assert_eq!(conn.expire_reason(), None);
    }

    #[test]
    fn test_expired_by_inactivity() {
        let conn = Connection::new("localhost:11211", 0, Some(Duration::from_nanos(1)));
        std::thread::sleep(Duration::from_millis(2));
        assert!(conn.expired(true, 0));
        assert_eq!(conn.expire_reason(), Some(ExpireReason::Expired));
    }

    #[test]
    fn test_expired_by_generation() {
        let conn = Connection::new("localhost:11211", 1, None);
        assert!(conn.expired(true, 2));
        assert_eq!(conn.expire_reason(), Some(ExpireReason::Stale));
    }

    #[test]
    fn test_expired_by_pool_state() {
        let conn = Connection::new("localhost:11211", 1, None);
        assert!(conn.expired(false, 1));
        assert_eq!(conn.expire_reason(), Some(ExpireReason::PoolClosed));
    }

    #[test]
    fn test_reason_precedence_and_stickiness() {
        // pool closure outranks staleness, and the first reason sticks
        let conn = Connection::new("localhost:11211", 1, Some(Duration::from_nanos(1)));
        std::thread::sleep(Duration::from_millis(2));
        assert!(conn.expired(false, 2));
        assert_eq!(conn.expire_reason(), Some(ExpireReason::PoolClosed));

        assert!(conn.expired(true, 2));
        assert_eq!(conn.expire_reason(), Some(ExpireReason::PoolClosed));
    }

    #[test]
    fn test_touch_refreshes_deadline() {
        let mut conn = Connection::new("localhost:11211", 0, Some(Duration::from_millis(50)));
        std::thread::sleep(Duration::from_millis(30));
        conn.touch();
        std::thread::sleep(Duration::from_millis(30));
        // 60ms since creation but only 30ms since last touch
        assert!(!conn.expired(true, 0));
    }

    #[test]
    fn test_close_is_idempotent_and_terminal() {
        let mut conn = Connection::new("localhost:11211", 0, None);
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.expired(true, 0));
    }

    #[test]
    fn test_mark_expiring() {
        let mut conn = Connection::new("localhost:11211", 0, None);
        conn.mark_expiring();
        assert_eq!(conn.state(), ConnectionState::Expiring);
        assert!(conn.expired(true, 0));

        // expiring does not regress a closed connection
        let mut conn = Connection::new("localhost:11211", 0, None);
        conn.close();
        conn.mark_expiring();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_expire_reason_display() {
        assert_eq!(ExpireReason::Expired.to_string(), "expired");
        assert_eq!(ExpireReason::Stale.to_string(), "stale");
        assert_eq!(ExpireReason::PoolClosed.to_string(), "pool_closed");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut conn = Connection::new(&addr.to_string(), 0, None);
        let err = conn.connect(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, PoolError::Dial { .. }));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_connect_transitions_to_live() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut conn = Connection::new(&addr.to_string(), 0, None);
        conn.connect(Duration::from_secs(1)).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Live);
        assert!(conn.is_dialed());
        assert!(conn.stream_mut().is_some());
    }
}
