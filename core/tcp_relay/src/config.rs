//! Relay configuration
//!
//! Loaded from JSON. Every field has a default so an empty object (or no
//! config at all) yields a working pass-through-capable relay.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default netfilter queue for host → network traffic
pub const DEFAULT_EGRESS_QUEUE: u16 = 1;

/// Default netfilter queue for network → host traffic
pub const DEFAULT_INGRESS_QUEUE: u16 = 2;

/// Connections with no packets for this long are evicted
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

/// Recent diagnostic lines kept for error dumps
pub const DEFAULT_DIAG_BACKLOG: usize = 10;

/// Bound on queued diagnostic lines awaiting the logging thread
pub const DEFAULT_DIAG_CHANNEL_CAPACITY: usize = 1024;

/// Optimistic merge attempts before merging under the table lock
pub const DEFAULT_MERGE_RETRIES: u32 = 4;

/// Runtime settings for a [`crate::Relay`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub egress_queue: u16,
    pub ingress_queue: u16,
    /// When false, payloads are forwarded without calling the cipher
    pub encryption_enabled: bool,
    pub idle_timeout_secs: u64,
    pub diag_backlog: usize,
    pub diag_channel_capacity: usize,
    pub merge_retries: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            egress_queue: DEFAULT_EGRESS_QUEUE,
            ingress_queue: DEFAULT_INGRESS_QUEUE,
            encryption_enabled: true,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            diag_backlog: DEFAULT_DIAG_BACKLOG,
            diag_channel_capacity: DEFAULT_DIAG_CHANNEL_CAPACITY,
            merge_retries: DEFAULT_MERGE_RETRIES,
        }
    }
}

impl RelayConfig {
    /// Parse and validate a JSON document
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.egress_queue == self.ingress_queue {
            return Err(ConfigError::Invalid("egress_queue and ingress_queue must differ"));
        }
        if self.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid("idle_timeout_secs must be positive"));
        }
        if self.diag_channel_capacity == 0 {
            return Err(ConfigError::Invalid("diag_channel_capacity must be positive"));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}
