//! Error types for mcbridge
//!
//! This module defines all custom error types used throughout the proxy.

use std::io;
use thiserror::Error;

/// Errors surfaced while moving wire messages to or from a socket.
///
/// Every variant except [`WireError::Eof`] is fatal for the connection it
/// occurred on: the socket has been shut down and the pool will evict the
/// upstream connection.
#[derive(Error, Debug)]
pub enum WireError {
    /// The operation's context was cancelled before or during I/O
    #[error("connection {id} to {address}: operation cancelled")]
    Cancelled {
        /// Endpoint the socket is connected to
        address: String,
        /// Connection identifier
        id: u64,
    },

    /// The composed read/write deadline elapsed
    #[error("connection {id} to {address}: {op} deadline exceeded")]
    Timeout {
        /// Endpoint the socket is connected to
        address: String,
        /// Connection identifier
        id: u64,
        /// Which operation timed out ("read" or "write")
        op: &'static str,
    },

    /// The stream ended partway through the 24-byte header
    #[error("connection {id} to {address}: incomplete read of message header")]
    IncompleteHeader {
        /// Endpoint the socket is connected to
        address: String,
        /// Connection identifier
        id: u64,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },

    /// The stream ended partway through the message body
    #[error("connection {id} to {address}: incomplete read of message body")]
    IncompleteBody {
        /// Endpoint the socket is connected to
        address: String,
        /// Connection identifier
        id: u64,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },

    /// A write syscall failed
    #[error("connection {id} to {address}: unable to write wire message")]
    WriteFailed {
        /// Endpoint the socket is connected to
        address: String,
        /// Connection identifier
        id: u64,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },

    /// Clean end-of-stream at a message boundary
    #[error("end of stream")]
    Eof,
}

impl WireError {
    /// Whether this error is the distinguished clean-close case.
    pub fn is_eof(&self) -> bool {
        matches!(self, WireError::Eof)
    }
}

/// Errors surfaced by the server pool.
#[derive(Error, Debug)]
pub enum PoolError {
    /// The pool is not in the `Connected` lifecycle state
    #[error("pool for {address} is closed")]
    Closed {
        /// Upstream address the pool serves
        address: String,
    },

    /// The checkout deadline elapsed while waiting for a permit
    #[error("timed out waiting for a connection to {address}")]
    Timeout {
        /// Upstream address the pool serves
        address: String,
    },

    /// The checkout context was cancelled
    #[error("checkout from pool for {address} cancelled")]
    Cancelled {
        /// Upstream address the pool serves
        address: String,
    },

    /// The pool is at `max_size` and cannot mint another connection
    #[error("pool for {address} is at capacity")]
    Full {
        /// Upstream address the pool serves
        address: String,
    },

    /// Dialing the upstream failed
    #[error("connection {id} to {address}: dial failed")]
    Dial {
        /// Upstream address that was dialed
        address: String,
        /// Connection identifier
        id: u64,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },
}

/// Configuration errors, reported before the proxy starts.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The network flag was not one of the recognized values
    #[error("invalid network: {0}")]
    InvalidNetwork(String),

    /// Pool bounds are inconsistent
    #[error("invalid pool size: {0}")]
    InvalidPoolSize(String),

    /// The upstream config address is missing
    #[error("missing upstream config address")]
    MissingUpstream,

    /// The log level flag was not recognized
    #[error("invalid loglevel: {0}")]
    InvalidLogLevel(String),

    /// A configuration file could not be read or parsed
    #[error("configuration file error: {0}")]
    File(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_error_display() {
        let err = WireError::Timeout {
            address: "localhost:11211".to_string(),
            id: 7,
            op: "read",
        };
        assert_eq!(
            format!("{}", err),
            "connection 7 to localhost:11211: read deadline exceeded"
        );

        let err = WireError::Cancelled {
            address: "localhost:11211".to_string(),
            id: 3,
        };
        assert_eq!(
            format!("{}", err),
            "connection 3 to localhost:11211: operation cancelled"
        );
    }

    #[test]
    fn test_wire_error_eof() {
        assert!(WireError::Eof.is_eof());
        assert!(!WireError::Cancelled {
            address: String::new(),
            id: 0
        }
        .is_eof());
    }

    #[test]
    fn test_wire_error_source_chain() {
        let err = WireError::IncompleteHeader {
            address: "localhost:11211".to_string(),
            id: 1,
            source: io::Error::new(io::ErrorKind::UnexpectedEof, "early eof"),
        };
        let source = std::error::Error::source(&err);
        assert!(source.is_some());
    }

    #[test]
    fn test_pool_error_display() {
        let err = PoolError::Closed {
            address: "localhost:11211".to_string(),
        };
        assert_eq!(format!("{}", err), "pool for localhost:11211 is closed");

        let err = PoolError::Timeout {
            address: "localhost:11211".to_string(),
        };
        assert_eq!(
            format!("{}", err),
            "timed out waiting for a connection to localhost:11211"
        );
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidNetwork("udp".to_string());
        assert_eq!(format!("{}", err), "invalid network: udp");

        let err = ConfigError::MissingUpstream;
        assert_eq!(format!("{}", err), "missing upstream config address");
    }
}
