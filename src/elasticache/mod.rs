//! ElastiCache cluster discovery
//!
//! One-shot bootstrap against the real config endpoint: send
//! `config get cluster` and parse the advertised node list. AWS documents
//! that the nodes are always on line 3 of the response.

use anyhow::{bail, Context, Result};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

const DEFAULT_CONFIG_PORT: u16 = 11211;
const NODES_LINE: usize = 3;
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Query the config endpoint and return the cluster's `host:port` node
/// addresses. A missing port on `endpoint` defaults to 11211.
pub async fn cluster_nodes(endpoint: &str) -> Result<Vec<String>> {
    let endpoint = if endpoint.contains(':') {
        endpoint.to_string()
    } else {
        format!("{}:{}", endpoint, DEFAULT_CONFIG_PORT)
    };

    tokio::time::timeout(DISCOVERY_TIMEOUT, fetch_nodes(&endpoint))
        .await
        .with_context(|| format!("discovery against {} timed out", endpoint))?
}

async fn fetch_nodes(endpoint: &str) -> Result<Vec<String>> {
    let stream = TcpStream::connect(endpoint)
        .await
        .with_context(|| format!("failed to connect to config endpoint {}", endpoint))?;
    let mut stream = BufReader::new(stream);

    stream
        .get_mut()
        .write_all(b"config get cluster\r\n")
        .await
        .context("failed to send config get cluster")?;

    let response = read_nodes_line(&mut stream).await?;
    debug!(endpoint, nodes = %response, "config read");
    parse_nodes(&response)
}

async fn read_nodes_line<R>(reader: &mut R) -> Result<String>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut response = String::new();
    let mut line = String::new();
    let mut count = 0;

    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .await
            .context("failed to read config response")?;
        if n == 0 {
            break;
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        count += 1;
        if count == NODES_LINE {
            response = trimmed.to_string();
        }
        if trimmed == "END" {
            break;
        }
    }

    Ok(response)
}

/// Parse a space-separated `host|ip|port` list into `host:port` strings.
fn parse_nodes(response: &str) -> Result<Vec<String>> {
    let mut nodes = Vec::new();

    for entry in response.split(' ') {
        let fields: Vec<&str> = entry.split('|').collect();
        if fields.len() != 3 {
            bail!("malformed cluster entry: {:?}", entry);
        }
        let port: u16 = fields[2]
            .parse()
            .with_context(|| format!("malformed port in cluster entry: {:?}", entry))?;
        nodes.push(format!("{}:{}", fields[0], port));
    }

    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn start_config_endpoint(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 64];
            let n = socket.read(&mut request).await.unwrap();
            assert_eq!(&request[..n], b"config get cluster\r\n");
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        addr
    }

    #[test]
    fn test_parse_nodes() {
        let nodes = parse_nodes(
            "host-a.cache.amazonaws.com|10.0.0.1|11211 host-b.cache.amazonaws.com|10.0.0.2|11211",
        )
        .unwrap();
        assert_eq!(
            nodes,
            vec![
                "host-a.cache.amazonaws.com:11211",
                "host-b.cache.amazonaws.com:11211"
            ]
        );
    }

    #[test]
    fn test_parse_nodes_rejects_malformed_entry() {
        assert!(parse_nodes("host-only").is_err());
        assert!(parse_nodes("host|ip|notaport").is_err());
    }

    #[tokio::test]
    async fn test_cluster_nodes_reads_line_three() {
        let addr = start_config_endpoint(
            "CONFIG cluster 0 64\r\n12\r\nhost-a|10.0.0.1|11211 host-b|10.0.0.2|11212\r\n\r\nEND\r\n",
        )
        .await;

        let nodes = cluster_nodes(&addr).await.unwrap();
        assert_eq!(nodes, vec!["host-a:11211", "host-b:11212"]);
    }

    #[tokio::test]
    async fn test_cluster_nodes_connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert!(cluster_nodes(&addr).await.is_err());
    }
}
