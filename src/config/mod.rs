//! Configuration module for mcbridge
//!
//! This module provides configuration types and parsing for the proxy.

mod pool;

pub use pool::PoolConfig;

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Network types a listener can bind.
pub const VALID_NETWORKS: [&str; 5] = ["tcp", "tcp4", "tcp6", "unix", "unixpacket"];

fn default_local_config_host() -> String {
    ":11210".to_string()
}

fn default_network() -> String {
    "unix".to_string()
}

fn default_local_socket_prefix() -> String {
    "/var/tmp/mcbridge-".to_string()
}

fn default_local_socket_suffix() -> String {
    ".sock".to_string()
}

fn default_local_port_start() -> u16 {
    11220
}

fn default_read_timeout_ms() -> u64 {
    1000
}

fn default_write_timeout_ms() -> u64 {
    1000
}

fn default_statsd_address() -> String {
    "localhost:8125".to_string()
}

/// Top-level proxy configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Seed address for ElastiCache cluster discovery
    pub upstream_config_host: String,

    /// Bind address for the local config responder
    #[serde(default = "default_local_config_host")]
    pub local_config_host: String,

    /// Network to bind local proxies on (tcp, tcp4, tcp6, unix, unixpacket)
    #[serde(default = "default_network")]
    pub network: String,

    /// Prefix for per-upstream unix socket filenames
    #[serde(default = "default_local_socket_prefix")]
    pub local_socket_prefix: String,

    /// Suffix for per-upstream unix socket filenames
    #[serde(default = "default_local_socket_suffix")]
    pub local_socket_suffix: String,

    /// First TCP port for per-upstream listeners; the upstream index is added
    #[serde(default = "default_local_port_start")]
    pub local_port_start: u16,

    /// Unlink existing unix sockets before listening
    #[serde(default)]
    pub unlink: bool,

    /// Upstream read timeout in milliseconds
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Upstream write timeout in milliseconds
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Statsd sink address
    #[serde(default = "default_statsd_address")]
    pub statsd_address: String,

    /// Connection pool tuning
    #[serde(default)]
    pub pool: PoolConfig,
}

impl Config {
    /// Build a configuration with defaults for everything but the
    /// discovery seed.
    pub fn new(upstream_config_host: impl Into<String>) -> Self {
        Config {
            upstream_config_host: upstream_config_host.into(),
            local_config_host: default_local_config_host(),
            network: default_network(),
            local_socket_prefix: default_local_socket_prefix(),
            local_socket_suffix: default_local_socket_suffix(),
            local_port_start: default_local_port_start(),
            unlink: false,
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            statsd_address: default_statsd_address(),
            pool: PoolConfig::default(),
        }
    }

    /// Upstream read timeout as a [`Duration`].
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Upstream write timeout as a [`Duration`].
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Whether the local proxies bind unix-family sockets.
    pub fn is_unix(&self) -> bool {
        self.network.contains("unix")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream_config_host.is_empty() {
            return Err(ConfigError::MissingUpstream);
        }
        if !VALID_NETWORKS.contains(&self.network.as_str()) {
            return Err(ConfigError::InvalidNetwork(self.network.clone()));
        }
        self.pool.validate()?;
        Ok(())
    }
}

/// Load configuration from a TOML file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path.as_ref())
        .map_err(|e| ConfigError::File(format!("{:?}: {}", path.as_ref(), e)))?;

    parse_config(&content)
}

/// Parse configuration from a TOML string.
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(content).map_err(|e| ConfigError::File(e.to_string()))?;
    config.validate()?;
    Ok(config)
}
