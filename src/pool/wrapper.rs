//! Checkout handle for pooled connections
//!
//! A [`ConnectionWrapper`] ties a checked-out connection to its semaphore
//! permit. Dropping the wrapper is the return operation; the permit is
//! released only after the return has committed, so permits in use always
//! equal outstanding wrappers.

use super::connection::Connection;
use super::server::ServerShared;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::OwnedSemaphorePermit;

/// Borrow handle returned by [`Server::checkout`](super::Server::checkout).
pub struct ConnectionWrapper {
    conn: Option<Connection>,
    shared: Arc<ServerShared>,
    permit: OwnedSemaphorePermit,
    discard: bool,
}

impl std::fmt::Debug for ConnectionWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionWrapper")
            .field("conn", &self.conn)
            .field("discard", &self.discard)
            .finish()
    }
}

impl ConnectionWrapper {
    pub(crate) fn new(
        conn: Connection,
        shared: Arc<ServerShared>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        ConnectionWrapper {
            conn: Some(conn),
            shared,
            permit,
            discard: false,
        }
    }

    /// Identifier of the borrowed connection.
    pub fn id(&self) -> u64 {
        self.conn.as_ref().expect("connection already returned").id()
    }

    /// Upstream endpoint of the borrowed connection.
    pub fn address(&self) -> &str {
        self.conn
            .as_ref()
            .expect("connection already returned")
            .address()
    }

    /// Mutable access to the upstream socket.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        self.conn
            .as_mut()
            .expect("connection already returned")
            .stream_mut()
            .expect("connection not dialed")
    }

    /// Mark the connection for discard: it transitions to `Expiring` and
    /// the pool closes it instead of reusing it. Idempotent.
    pub fn close(&mut self) {
        if !self.discard {
            self.discard = true;
            if let Some(conn) = self.conn.as_mut() {
                conn.mark_expiring();
            }
        }
    }

    /// Return the connection to the pool. Dropping the wrapper does the
    /// same thing; this form just names the operation at call sites.
    pub fn checkin(self) {}
}

impl Drop for ConnectionWrapper {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.check_in(conn, self.discard);
        }
        // the permit field drops after this body runs, releasing the
        // semaphore slot once the return is committed
    }
}
