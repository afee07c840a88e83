use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use crate::error::{Error, Result};

/// Connection and transfer settings for a clamd client.
///
/// Values are plain data; nothing here opens a connection. The client
/// validates the whole record before every operation.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ClientConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    #[serde(default = "default_max_stream_size")]
    pub max_stream_size: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_write_timeout_ms")]
    pub read_write_timeout_ms: u64,
}

fn default_port() -> u16 {
    3310
}

fn default_max_chunk_size() -> usize {
    131_072
}

fn default_max_stream_size() -> u64 {
    26_214_400
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

fn default_read_write_timeout_ms() -> u64 {
    300_000
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            max_chunk_size: default_max_chunk_size(),
            max_stream_size: default_max_stream_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_write_timeout_ms: default_read_write_timeout_ms(),
        }
    }

    pub fn with_max_chunk_size(mut self, bytes: usize) -> Self {
        self.max_chunk_size = bytes;
        self
    }

    pub fn with_max_stream_size(mut self, bytes: u64) -> Self {
        self.max_stream_size = bytes;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_read_write_timeout(mut self, timeout: Duration) -> Self {
        self.read_write_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.read_write_timeout_ms)
    }

    /// Reads a TOML file holding a single client table and validates it.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: ClientConfig = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        config
            .validate()
            .map_err(|e| Error::Config(format!("Invalid config: {}", e)))?;
        Ok(config)
    }

    /// Candidate config files in lookup order.
    pub fn default_locations() -> Vec<PathBuf> {
        let mut locations = vec![PathBuf::from("/etc/clamd-client/client.toml")];
        if let Some(dir) = dirs::config_dir() {
            locations.push(dir.join("clamd-client/client.toml"));
        }
        if let Some(dir) = dirs::home_dir() {
            locations.push(dir.join(".clamd-client.toml"));
        }
        locations.push(PathBuf::from("./clamd-client.toml"));
        locations
    }

    /// Loads the first file from [`ClientConfig::default_locations`] that
    /// exists. `Ok(None)` when there is none.
    pub async fn load_from_default_locations() -> Result<Option<Self>> {
        for path in Self::default_locations() {
            if fs::try_exists(&path).await.unwrap_or(false) {
                tracing::info!("Loading config from: {:?}", path);
                return Self::load(path).await.map(Some);
            }
        }
        Ok(None)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "Server address must not be empty".to_string(),
            ));
        }

        // u16 caps the upper bound already
        if self.port == 0 {
            return Err(Error::InvalidArgument(
                "Port must be between 1 and 65535".to_string(),
            ));
        }

        if self.max_chunk_size == 0 || self.max_chunk_size as u64 > u32::MAX as u64 {
            return Err(Error::InvalidArgument(format!(
                "Max chunk size must be between 1 and {} bytes, got {}",
                u32::MAX,
                self.max_chunk_size
            )));
        }

        if self.max_stream_size == 0 {
            return Err(Error::InvalidArgument(
                "Max stream size must be greater than zero".to_string(),
            ));
        }

        if self.connect_timeout_ms == 0 || self.read_write_timeout_ms == 0 {
            return Err(Error::InvalidArgument(
                "Timeouts must be at least 1 millisecond".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("localhost", default_port())
    }
}
