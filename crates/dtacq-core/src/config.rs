//! Device connection and readout configuration.
//!
//! Settings are layered with Figment, lowest priority first:
//! 1. Built-in defaults ([`DeviceConfig::default`])
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `DTACQ_` (e.g. `DTACQ_QUEUE_CAPACITY=8192`)
//!
//! Durations use humantime notation (`"5s"`, `"750ms"`).
//!
//! ```toml
//! control_port = 4220
//! data_port = 4210
//! command_timeout = "10s"
//! buffer_size = 1048576
//! queue_capacity = 4096
//! poll_interval = "1ms"
//! query_data32 = true
//! ```

use crate::error::{AcqError, Result};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Control (command/response) port.
pub const DEFAULT_CONTROL_PORT: u16 = 4220;

/// Streaming data port.
pub const DEFAULT_DATA_PORT: u16 = 4210;

/// Receive buffer size in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// Handoff queue capacity in chunks.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "DTACQ_";

/// Connection and readout settings for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Port of the line-oriented control channel.
    pub control_port: u16,

    /// Port of the binary streaming channel.
    pub data_port: u16,

    /// Timeout for establishing either TCP connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Time allowed for a control response to reach its prompt.
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,

    /// Default receive buffer size in bytes.
    pub buffer_size: usize,

    /// Capacity of the reader-to-worker queue, in chunks.
    pub queue_capacity: usize,

    /// How long the worker waits for data before re-checking the socket.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Ask the device for its word width with `data32`. Firmware that fixes
    /// the width at 16 bits does not answer it.
    pub query_data32: bool,

    /// Worker threads for a reactor created from this config.
    pub reactor_threads: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            control_port: DEFAULT_CONTROL_PORT,
            data_port: DEFAULT_DATA_PORT,
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(10),
            buffer_size: DEFAULT_BUFFER_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            poll_interval: Duration::from_millis(1),
            query_data32: true,
            reactor_threads: crate::reactor::DEFAULT_REACTOR_THREADS,
        }
    }
}

impl DeviceConfig {
    /// Load defaults, then `path` (if given), then `DTACQ_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(DeviceConfig::default()));

        if let Some(path) = path {
            if !path.exists() {
                return Err(AcqError::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            debug!("Loading device config from: {}", path.display());
            figment = figment.merge(Toml::file(path));
        }

        let config: DeviceConfig = figment.merge(Env::prefixed(ENV_PREFIX)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the readout cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.control_port == 0 || self.data_port == 0 {
            return Err(AcqError::Config("ports cannot be 0".into()));
        }
        if self.control_port == self.data_port {
            return Err(AcqError::Config(
                "control and data ports must differ".into(),
            ));
        }
        if self.buffer_size == 0 {
            return Err(AcqError::Config("buffer_size cannot be 0".into()));
        }
        if self.queue_capacity == 0 {
            return Err(AcqError::Config("queue_capacity cannot be 0".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(AcqError::Config("poll_interval cannot be 0".into()));
        }
        if self.reactor_threads == 0 {
            return Err(AcqError::Config("reactor_threads cannot be 0".into()));
        }
        Ok(())
    }
}
