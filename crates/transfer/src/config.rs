//! Transfer tuning, loadable from TOML.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DEFAULT_BUFFER_SIZE, DEFAULT_OPERATION_TIMEOUT_MS};

/// Errors produced while loading a [`TransferConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Settings shared by every batch created with them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// How long a drained batch waits for the next announced file, in
    /// milliseconds. `0` fails immediately when files are missing.
    pub operation_timeout_ms: u64,

    /// Copy buffer size per item, in bytes.
    pub buffer_size: usize,

    /// Capacity of each batch's event stream.
    pub event_capacity: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT_MS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            event_capacity: 64,
        }
    }
}

impl TransferConfig {
    /// The drain timeout as a [`Duration`].
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Returns a copy with a different drain timeout.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Parses and validates a TOML document. Missing keys take defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: TransferConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.as_ref().display(), "transfer configuration loaded");
        Ok(config)
    }

    /// Rejects values no batch can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be positive".into()));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be positive".into()));
        }
        Ok(())
    }
}
