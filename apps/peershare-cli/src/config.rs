//! CLI configuration.
//!
//! Read from the TOML file given with `--config`; every field is optional:
//!
//! ```toml
//! device_name = "laptop"
//! download_dir = "/home/me/Downloads"
//!
//! [transfer]
//! operation_timeout_ms = 1000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use peershare_transfer::TransferConfig;
use serde::{Deserialize, Serialize};

use crate::args::Args;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Name this device announces (hostname by default).
    #[serde(default = "default_device_name")]
    pub device_name: String,

    /// Where received files are written.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    #[serde(default)]
    pub transfer: TransferConfig,
}

fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "PeerShare".into())
}

fn default_download_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join("Downloads"))
        .unwrap_or_else(|| PathBuf::from("Downloads"))
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            download_dir: default_download_dir(),
            transfer: TransferConfig::default(),
        }
    }
}

impl AppConfig {
    /// Loads `path`, or the defaults when no file is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                let config: AppConfig = toml::from_str(&content)?;
                tracing::debug!(path = %path.display(), "configuration read");
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Applies command-line overrides.
    pub fn with_overrides(mut self, args: &Args) -> Self {
        if let Some(dir) = &args.into {
            self.download_dir = dir.clone();
        }
        if let Some(ms) = args.timeout_ms {
            self.transfer = self.transfer.with_operation_timeout(Duration::from_millis(ms));
        }
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.device_name.trim().is_empty() {
            anyhow::bail!("device_name must not be empty");
        }
        self.transfer.validate()?;
        Ok(())
    }
}
