//! # Harvester Configuration
//!
//! Settings for the bus, node-side consumers and steps.
//!
//! ## Sources
//!
//! Later sources override earlier ones:
//!
//! 1. Built-in defaults ([`HarvesterConfig::default`])
//! 2. Optional TOML file (`config/harvester.toml` or an explicit path)
//! 3. Environment variables such as `HARVESTER__NODE__COMPLETION_TIMEOUT_MS`
//!
//! ## Usage
//!
//! ```rust,no_run
//! use harvester_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let timeout = manager.config().node.completion_timeout();
//! let destination = &manager.config().broker.destination;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvesterConfig {
    pub broker: BrokerConfig,
    pub consumer: ConsumerConfig,
    pub node: NodeConfig,
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Well-known destination shared by writers and consumers
    pub destination: String,
    /// Envelopes buffered per subscription before publishers wait
    pub subscription_buffer: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            destination: "harvester.items".to_string(),
            subscription_buffer: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Envelopes queued per handler registration
    pub handler_queue_capacity: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            handler_queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// How long an async step waits for its expected item count
    pub completion_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            completion_timeout_ms: 30_000,
        }
    }
}

impl NodeConfig {
    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Emit a progress log line every N published items
    pub progress_log_interval: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            progress_log_interval: 1000,
        }
    }
}

impl HarvesterConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.broker.destination.trim().is_empty() {
            return Err(ConfigurationError::invalid_value(
                "broker.destination",
                self.broker.destination.clone(),
                "destination cannot be empty",
            ));
        }

        let positive: [(&str, u64); 4] = [
            (
                "broker.subscription_buffer",
                self.broker.subscription_buffer as u64,
            ),
            (
                "consumer.handler_queue_capacity",
                self.consumer.handler_queue_capacity as u64,
            ),
            ("node.completion_timeout_ms", self.node.completion_timeout_ms),
            ("stream.progress_log_interval", self.stream.progress_log_interval),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigurationError::invalid_value(
                    field,
                    "0",
                    "must be greater than zero",
                ));
            }
        }
        Ok(())
    }
}
