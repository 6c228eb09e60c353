//! Local cluster-config responder
//!
//! Emulates the ElastiCache auto-discovery endpoint: line-delimited
//! commands in, a synthetic cluster manifest out, so cluster-aware
//! drivers route through the local proxies.

use crate::listener::{ConnectionHandler, ProxyStream};
use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::error;

const READ_CHUNK: usize = 4096;

/// Handler answering `stats` and `config get cluster`.
pub struct ConfigHandler {
    manifest: String,
}

impl ConfigHandler {
    /// Build a responder advertising `manifest` (the space-joined proxy
    /// endpoint list).
    pub fn new(manifest: String) -> std::sync::Arc<Self> {
        std::sync::Arc::new(ConfigHandler { manifest })
    }

    fn respond(&self, command: &[u8]) -> Option<Vec<u8>> {
        match command {
            b"stats" => Some(b"STAT version 1.6.0\nEND\n".to_vec()),
            b"config get cluster" => Some(
                format!(
                    "CONFIG cluster 0 {}\n1\n{}\n\nEND\r\n",
                    self.manifest.len(),
                    self.manifest
                )
                .into_bytes(),
            ),
            _ => None,
        }
    }

    async fn serve(&self, stream: &mut ProxyStream, kill: &CancellationToken) -> io::Result<()> {
        let mut buf: Vec<u8> = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let n = tokio::select! {
                n = stream.read(&mut chunk) => n?,
                _ = kill.cancelled() => return Ok(()),
            };
            if n == 0 {
                return Ok(());
            }
            buf.extend_from_slice(&chunk[..n]);

            // commands are \r\n-delimited and may arrive split across reads
            while let Some(i) = find_crlf(&buf) {
                let response = self.respond(&buf[..i]);
                buf.drain(..i + 2);
                if let Some(response) = response {
                    stream.write_all(&response).await?;
                }
            }
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[async_trait]
impl ConnectionHandler for ConfigHandler {
    async fn handle(&self, mut stream: ProxyStream, id: u64, kill: CancellationToken) {
        if let Err(e) = self.serve(&mut stream, &kill).await {
            if !kill.is_cancelled() {
                error!(local_id = id, error = %e, "error handling config request");
            }
        }
    }
}
