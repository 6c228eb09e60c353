//! Connection pool configuration
//!
//! Defines sizing and maintenance tuning for the upstream connection pools.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_max_size() -> u64 {
    10
}

fn default_connection_idle_timeout_secs() -> u64 {
    300
}

fn default_maintain_interval_secs() -> u64 {
    15
}

fn default_connect_timeout_secs() -> u64 {
    10
}

/// Connection pool configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PoolConfig {
    /// Minimum number of pooled upstream connections
    #[serde(default)]
    pub min_size: u64,

    /// Maximum number of upstream connections (pooled + checked out)
    #[serde(default = "default_max_size")]
    pub max_size: u64,

    /// Seconds a connection may sit unused before it expires; 0 disables
    #[serde(default = "default_connection_idle_timeout_secs")]
    pub connection_idle_timeout_secs: u64,

    /// Seconds between background maintenance passes
    #[serde(default = "default_maintain_interval_secs")]
    pub maintain_interval_secs: u64,

    /// Seconds to wait for an upstream dial to complete
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            min_size: 0,
            max_size: default_max_size(),
            connection_idle_timeout_secs: default_connection_idle_timeout_secs(),
            maintain_interval_secs: default_maintain_interval_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl PoolConfig {
    /// Per-connection inactivity deadline, if enabled.
    pub fn connection_idle_timeout(&self) -> Option<Duration> {
        if self.connection_idle_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.connection_idle_timeout_secs))
        }
    }

    /// Interval between maintenance passes.
    pub fn maintain_interval(&self) -> Duration {
        Duration::from_secs(self.maintain_interval_secs)
    }

    /// Upstream dial deadline.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Validate the pool configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_size > self.max_size {
            return Err(ConfigError::InvalidPoolSize(
                "min_size cannot be greater than max_size".to_string(),
            ));
        }
        if self.max_size == 0 {
            return Err(ConfigError::InvalidPoolSize(
                "max_size must be greater than 0".to_string(),
            ));
        }
        if self.maintain_interval_secs == 0 {
            return Err(ConfigError::InvalidPoolSize(
                "maintain_interval_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
