//! Per-client request loop
//!
//! For each accepted client socket: read a wire message, check an
//! upstream connection out of the pool, write the message upstream, read
//! the reply, return the connection, write the reply back. Requests on
//! one client socket are strictly serial; there is no pipelining.

use crate::error::{PoolError, WireError};
use crate::listener::{ConnectionHandler, ProxyStream};
use crate::metrics::StatsdClient;
use crate::pool::{ConnectionWrapper, Server};
use crate::wire::{read_frame, write_frame};
use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

#[derive(Error, Debug)]
enum HandleError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl HandleError {
    fn is_eof(&self) -> bool {
        matches!(self, HandleError::Wire(e) if e.is_eof())
    }
}

/// Handler for the memcached data path.
pub struct ProxyHandler {
    statsd: Arc<StatsdClient>,
    server: Arc<Server>,
    local_address: String,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl ProxyHandler {
    /// Build a handler proxying to `server`.
    pub fn new(
        statsd: Arc<StatsdClient>,
        server: Arc<Server>,
        local_address: &str,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(ProxyHandler {
            statsd,
            server,
            local_address: local_address.to_string(),
            read_timeout,
            write_timeout,
        })
    }

    async fn handle_message(
        &self,
        stream: &mut ProxyStream,
        buf: &mut BytesMut,
        id: u64,
        kill: &CancellationToken,
    ) -> Result<(), HandleError> {
        let start = Instant::now();
        let result = self.handle_message_inner(stream, buf, id, kill).await;
        self.statsd.timing(
            "handle_message",
            start.elapsed(),
            &[format!("success:{}", result.is_ok())],
        );
        result
    }

    async fn handle_message_inner(
        &self,
        stream: &mut ProxyStream,
        buf: &mut BytesMut,
        id: u64,
        kill: &CancellationToken,
    ) -> Result<(), HandleError> {
        // no read timeout on the client side; clients may idle
        read_frame(stream, buf, kill, None, None, &self.local_address, id).await?;

        self.round_trip(buf, id, kill).await?;

        write_frame(stream, buf, kill, None, None, &self.local_address, id).await?;
        Ok(())
    }

    /// One upstream round trip. The request in `buf` is replaced by the
    /// reply. Wire errors on the upstream leg mark the connection for
    /// discard before it is returned.
    async fn round_trip(
        &self,
        buf: &mut BytesMut,
        client_id: u64,
        kill: &CancellationToken,
    ) -> Result<(), HandleError> {
        let mut wrapper = self.checkout(kill).await?;
        let address = wrapper.address().to_string();
        let upstream_id = wrapper.id();
        debug!(local_id = client_id, upstream_id, "connection checked out");

        if let Err(e) = write_frame(
            wrapper.stream_mut(),
            buf,
            kill,
            Some(self.write_timeout),
            None,
            &address,
            upstream_id,
        )
        .await
        {
            wrapper.close();
            return Err(e.into());
        }

        if let Err(e) = read_frame(
            wrapper.stream_mut(),
            buf,
            kill,
            Some(self.read_timeout),
            None,
            &address,
            upstream_id,
        )
        .await
        {
            wrapper.close();
            return Err(e.into());
        }

        Ok(())
    }

    async fn checkout(&self, kill: &CancellationToken) -> Result<ConnectionWrapper, PoolError> {
        let start = Instant::now();
        let result = self.server.checkout(kill, None).await;
        let address = match &result {
            Ok(wrapper) => wrapper.address().to_string(),
            Err(_) => String::new(),
        };
        self.statsd.timing(
            "checkout_connection",
            start.elapsed(),
            &[
                format!("address:{}", address),
                format!("success:{}", result.is_ok()),
            ],
        );
        result
    }
}

#[async_trait]
impl ConnectionHandler for ProxyHandler {
    async fn handle(&self, mut stream: ProxyStream, id: u64, kill: CancellationToken) {
        let mut buf = BytesMut::new();
        loop {
            if let Err(e) = self.handle_message(&mut stream, &mut buf, id, &kill).await {
                // errors during force shutdown and clean closes are routine
                if !e.is_eof() && !kill.is_cancelled() {
                    error!(local_id = id, error = %e, "error handling message");
                }
                return;
            }
        }
    }
}
