use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Environment variable naming the YAML configuration file.
pub const CONFIG_ENV: &str = "SANDBOX_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read sandbox config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Runtime knobs for one sandbox session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// How long a single handshake attempt waits for the host.
    pub handshake_timeout_ms: u64,
    pub handshake_attempts: u32,
    pub fetch_timeout_ms: u64,
    /// Promise jobs drained per evaluation before giving up.
    pub max_pending_jobs: usize,
    /// How long the post-load event loop keeps running timers.
    pub settle_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 250,
            handshake_attempts: 3,
            fetch_timeout_ms: 10_000,
            max_pending_jobs: 1_000,
            settle_ms: 0,
        }
    }
}

impl SandboxConfig {
    /// Load from `config_path`, falling back to defaults when it is absent.
    /// Keys missing from the file keep their defaults.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        match config_path {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(&path)?;
                let config: SandboxConfig = serde_yaml::from_str(&contents)?;
                tracing::debug!(target: "sandbox::config", path = %path.display(), ?config, "loaded config");
                Ok(config)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(std::env::var_os(CONFIG_ENV).map(PathBuf::from))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}
