//! Per-connection tunables the handler treats as given.
//!
//! The handler never reads files or environment variables itself; loading a
//! `ConnectParams` from TOML is a convenience for the (out-of-scope)
//! connection manager that owns configuration for a whole client instance.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Tunables for one `SocketHandler` connection.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectParams {
    /// Absolute deadline for connecting, handshaking, and any TLS hand-off
    /// combined, in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Coarsest granularity at which timeout ticks fire, bounding detection
    /// latency for every timer (connect, read, write, handshake-wait).
    #[serde(default = "default_poller_tick_resolution_ms")]
    pub poller_tick_resolution_ms: u64,

    /// Read-inactivity threshold once the connection is ready for
    /// application traffic, in seconds. `0` disables the timer.
    #[serde(default = "default_read_idle_timeout_secs")]
    pub read_idle_timeout_secs: u64,

    /// Write-inactivity threshold once the connection is ready for
    /// application traffic, in seconds. `0` disables the timer.
    #[serde(default = "default_write_idle_timeout_secs")]
    pub write_idle_timeout_secs: u64,

    /// Client certificate for mutual TLS, if required by the server.
    #[serde(default)]
    pub tls_client_cert_path: Option<PathBuf>,

    /// Private key matching `tls_client_cert_path`.
    #[serde(default)]
    pub tls_client_key_path: Option<PathBuf>,
}

impl Default for ConnectParams {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            poller_tick_resolution_ms: default_poller_tick_resolution_ms(),
            read_idle_timeout_secs: default_read_idle_timeout_secs(),
            write_idle_timeout_secs: default_write_idle_timeout_secs(),
            tls_client_cert_path: None,
            tls_client_key_path: None,
        }
    }
}

impl ConnectParams {
    /// Load from a TOML file, falling back to defaults for any absent key.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let params: Self = toml::from_str(&content)?;
        Ok(params)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn tick_resolution(&self) -> Duration {
        Duration::from_millis(self.poller_tick_resolution_ms)
    }

    pub fn read_idle_timeout(&self) -> Option<Duration> {
        (self.read_idle_timeout_secs > 0).then(|| Duration::from_secs(self.read_idle_timeout_secs))
    }

    pub fn write_idle_timeout(&self) -> Option<Duration> {
        (self.write_idle_timeout_secs > 0)
            .then(|| Duration::from_secs(self.write_idle_timeout_secs))
    }
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_poller_tick_resolution_ms() -> u64 {
    500
}

fn default_read_idle_timeout_secs() -> u64 {
    0
}

fn default_write_idle_timeout_secs() -> u64 {
    0
}
