//! Local endpoint listener
//!
//! Binds one stream listener per endpoint (Unix socket or TCP port),
//! spawns a task per accepted connection, and fans out the two shutdown
//! signals: `shutdown` stops accepting and drains, `kill` additionally
//! cancels the token every in-flight wire operation selects on.

use crate::metrics::{GaugeTracker, StatsdClient};
use crate::pool::next_connection_id;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const RESTART_SLEEP: Duration = Duration::from_secs(1);

/// An accepted client stream, Unix or TCP.
#[derive(Debug)]
pub enum ProxyStream {
    /// TCP client socket
    Tcp(TcpStream),
    /// Unix-domain client socket
    Unix(UnixStream),
}

impl AsyncRead for ProxyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            ProxyStream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ProxyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ProxyStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            ProxyStream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            ProxyStream::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            ProxyStream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Per-connection entry point. One task runs `handle` for each accepted
/// socket; `kill` is cancelled when the listener is force-stopped.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    /// Serve one client connection to completion.
    async fn handle(&self, stream: ProxyStream, id: u64, kill: CancellationToken);
}

/// Hook run once after the accept loop drains.
#[async_trait]
pub trait ShutdownHandler: Send + Sync {
    /// Release whatever the listener's handlers were sharing.
    async fn shutdown(&self);
}

enum BoundListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl BoundListener {
    async fn accept(&self) -> std::io::Result<ProxyStream> {
        match self {
            BoundListener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(ProxyStream::Tcp(stream))
            }
            BoundListener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(ProxyStream::Unix(stream))
            }
        }
    }

    fn local_description(&self) -> String {
        match self {
            BoundListener::Tcp(listener) => listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default(),
            BoundListener::Unix(listener) => listener
                .local_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
                .unwrap_or_default(),
        }
    }
}

/// Accept loop over one local endpoint.
pub struct Listener {
    network: String,
    address: String,
    unlink: bool,
    statsd: Arc<StatsdClient>,
    handler: Arc<dyn ConnectionHandler>,
    shutdown_handler: Option<Arc<dyn ShutdownHandler>>,
    bound_address: OnceLock<String>,
    quit: CancellationToken,
    kill: CancellationToken,
}

impl Listener {
    /// Create a listener. The bind happens inside [`run`](Listener::run)
    /// so a panic-restart can re-bind.
    pub fn new(
        network: &str,
        address: &str,
        unlink: bool,
        statsd: Arc<StatsdClient>,
        handler: Arc<dyn ConnectionHandler>,
        shutdown_handler: Option<Arc<dyn ShutdownHandler>>,
    ) -> Arc<Self> {
        Arc::new(Listener {
            network: network.to_string(),
            address: address.to_string(),
            unlink,
            statsd,
            handler,
            shutdown_handler,
            bound_address: OnceLock::new(),
            quit: CancellationToken::new(),
            kill: CancellationToken::new(),
        })
    }

    /// The address actually bound, once the accept loop is up. For TCP
    /// this resolves port 0 to the assigned port.
    pub fn bound_address(&self) -> Option<&str> {
        self.bound_address.get().map(|s| s.as_str())
    }

    /// Stop accepting and let in-flight connections drain.
    pub fn shutdown(&self) {
        self.quit.cancel();
    }

    /// Stop accepting and abort every in-flight wire operation.
    pub fn kill(&self) {
        self.quit.cancel();
        self.kill.cancel();
    }

    fn bind(&self) -> Result<BoundListener> {
        if self.network.contains("unix") {
            if self.unlink {
                let _ = std::fs::remove_file(&self.address);
            }
            let listener = UnixListener::bind(&self.address)
                .with_context(|| format!("failed to bind unix socket {}", self.address))?;
            Ok(BoundListener::Unix(listener))
        } else {
            let addr = listen_address(&self.network, &self.address);
            let listener = std::net::TcpListener::bind(&addr)
                .with_context(|| format!("failed to bind {}", addr))?;
            listener
                .set_nonblocking(true)
                .context("failed to set listener nonblocking")?;
            let listener =
                TcpListener::from_std(listener).context("failed to register listener")?;
            Ok(BoundListener::Tcp(listener))
        }
    }

    /// Bind and serve until shutdown. A panic escaping the accept loop is
    /// logged and the loop restarts after a 1 s sleep; bind errors are
    /// fatal and surface to the caller.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        loop {
            let bound = self.bind()?;
            let _ = self.bound_address.set(bound.local_description());

            let accept = tokio::spawn(self.clone().accept_loop(bound));
            match accept.await {
                Ok(()) => break,
                Err(e) if e.is_panic() => {
                    error!(
                        address = %self.address,
                        panic = %panic_message(&e),
                        "accept loop crashed"
                    );
                    tokio::time::sleep(RESTART_SLEEP).await;
                    info!(address = %self.address, "restarting accept loop");
                }
                Err(_) => break,
            }
        }

        if let Some(handler) = &self.shutdown_handler {
            handler.shutdown().await;
        }
        info!(address = %self.address, "listener shut down");
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, bound: BoundListener) {
        let open = Arc::new(GaugeTracker::new(self.statsd.clone(), "open_connections"));
        let mut tasks: JoinSet<()> = JoinSet::new();

        info!(network = %self.network, address = %bound.local_description(), "listening");

        loop {
            tokio::select! {
                _ = self.quit.cancelled() => break,
                accepted = bound.accept() => match accepted {
                    Ok(stream) => {
                        let id = next_connection_id();
                        open.increment("connection_opened", &[]);
                        debug!(local_id = id, "accepted client connection");

                        let handler = self.handler.clone();
                        let kill = self.kill.clone();
                        tasks.spawn(async move {
                            handler.handle(stream, id, kill).await;
                            debug!(local_id = id, "client connection finished");
                        });
                    }
                    Err(e) => {
                        error!(address = %self.address, error = %e, "failed to accept incoming connection");
                    }
                },
                Some(finished) = tasks.join_next(), if !tasks.is_empty() => {
                    self.reap(finished, &open);
                }
            }
        }

        info!(address = %self.address, open = tasks.len(), "waiting for open connections");
        while let Some(finished) = tasks.join_next().await {
            self.reap(finished, &open);
        }
    }

    fn reap(&self, finished: Result<(), tokio::task::JoinError>, open: &GaugeTracker) {
        open.decrement("connection_closed", &[]);
        if let Err(e) = finished {
            if e.is_panic() {
                // one client dies, the process does not
                error!(address = %self.address, panic = %panic_message(&e), "connection handler crashed");
            }
        }
    }
}

fn panic_message(e: &tokio::task::JoinError) -> String {
    format!("{}", e)
}

/// Resolve Go-style listen addresses: an empty host (":11220") binds the
/// unspecified address for the network's family.
fn listen_address(network: &str, address: &str) -> String {
    match address.strip_prefix(':') {
        Some(port) if !address.contains("]:") => {
            if network == "tcp6" {
                format!("[::]:{}", port)
            } else {
                format!("0.0.0.0:{}", port)
            }
        }
        _ => address.to_string(),
    }
}
