use crate::monitor::{PollPolicy, PolicyError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from aps.toml.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
#[derive(Default)]
pub struct AutomationConfig {
    pub api: ApiConfig,
    pub http: HttpConfig,
    pub poll: PollConfig,
    pub report: ReportConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub da_region: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    /// Timeout for signed-URL uploads/downloads and app bundle uploads.
    pub transfer_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PollConfig {
    pub max_wait_secs: u64,
    pub interval_secs: u64,
    pub max_query_attempts: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Download the work item report once a terminal status is seen.
    pub fetch: bool,
    /// Keep at most this many trailing bytes of the report as diagnostics.
    pub max_bytes: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub region: String,
    pub policy_key: String,
}

// --- Default implementations ---

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://developer.api.autodesk.com".to_string(),
            da_region: "us-east".to_string(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            transfer_timeout_secs: 120,
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_wait_secs: 600,
            interval_secs: 10,
            max_query_attempts: 3,
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            fetch: true,
            max_bytes: 8192,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            region: "US".to_string(),
            policy_key: "transient".to_string(),
        }
    }
}

impl PollConfig {
    /// Validated poll policy for the monitor.
    pub fn policy(&self) -> Result<PollPolicy, PolicyError> {
        PollPolicy::new(
            Duration::from_secs(self.max_wait_secs),
            Duration::from_secs(self.interval_secs),
            self.max_query_attempts,
        )
    }

    /// Copy with command-line overrides for the budget and cadence.
    pub fn overridden(&self, max_wait_secs: Option<u64>, interval_secs: Option<u64>) -> Self {
        Self {
            max_wait_secs: max_wait_secs.unwrap_or(self.max_wait_secs),
            interval_secs: interval_secs.unwrap_or(self.interval_secs),
            ..self.clone()
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }
}

/// Errors loading the configuration file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

/// Load config from `path`. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<AutomationConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(AutomationConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}
