//! Configuration management

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use pairgate_core::StoreConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ledger path that selects the in-memory ledger.
pub const MEMORY_LEDGER_PATH: &str = ":memory:";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub listen_addr: SocketAddr,
    pub ledger_path: PathBuf,
    pub request_ttl_secs: u64,
    pub max_pending: usize,
    pub retention_secs: u64,
    pub sweep_interval_secs: u64,
    pub audit_log_path: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 7030)),
            ledger_path: PathBuf::from("pairgate-ledger.db"),
            request_ttl_secs: 600,
            max_pending: 32,
            retention_secs: 3600,
            sweep_interval_secs: 30,
            audit_log_path: None,
        }
    }
}

impl DaemonConfig {
    /// Load configuration from environment variables and TOML file
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("PAIRGATE_LISTEN_ADDR") {
            config.listen_addr = addr
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("Invalid listen_addr: {}", e)))?;
        }

        if let Ok(path) = std::env::var("PAIRGATE_LEDGER_PATH") {
            config.ledger_path = PathBuf::from(path);
        }

        if let Ok(ttl) = std::env::var("PAIRGATE_REQUEST_TTL_SECS") {
            config.request_ttl_secs = parse_env_number("PAIRGATE_REQUEST_TTL_SECS", &ttl)?;
        }

        if let Ok(max) = std::env::var("PAIRGATE_MAX_PENDING") {
            config.max_pending = parse_env_number("PAIRGATE_MAX_PENDING", &max)?;
        }

        if let Ok(retention) = std::env::var("PAIRGATE_RETENTION_SECS") {
            config.retention_secs = parse_env_number("PAIRGATE_RETENTION_SECS", &retention)?;
        }

        if let Ok(interval) = std::env::var("PAIRGATE_SWEEP_INTERVAL_SECS") {
            config.sweep_interval_secs = parse_env_number("PAIRGATE_SWEEP_INTERVAL_SECS", &interval)?;
        }

        if let Ok(path) = std::env::var("PAIRGATE_AUDIT_LOG_PATH") {
            config.audit_log_path = Some(PathBuf::from(path));
        }

        // Load from TOML config file (if specified)
        if let Ok(config_path) = std::env::var("PAIRGATE_CONFIG") {
            config.load_from_toml(&config_path)?;
        }

        config.validate()?;

        Ok(config)
    }

    /// Load from TOML config file
    fn load_from_toml<P: AsRef<Path>>(&mut self, path: P) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let toml_config: toml::Value = toml::from_str(&content)?;

        if let Some(addr) = toml_config.get("listen_addr").and_then(|v| v.as_str()) {
            self.listen_addr = addr
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("Invalid listen_addr in TOML: {}", e)))?;
        }

        if let Some(path) = toml_config.get("ledger_path").and_then(|v| v.as_str()) {
            self.ledger_path = PathBuf::from(path);
        }

        if let Some(ttl) = toml_config.get("request_ttl_secs").and_then(|v| v.as_integer()) {
            self.request_ttl_secs = non_negative("request_ttl_secs", ttl)?;
        }

        if let Some(max) = toml_config.get("max_pending").and_then(|v| v.as_integer()) {
            self.max_pending = non_negative("max_pending", max)? as usize;
        }

        if let Some(retention) = toml_config.get("retention_secs").and_then(|v| v.as_integer()) {
            self.retention_secs = non_negative("retention_secs", retention)?;
        }

        if let Some(interval) = toml_config.get("sweep_interval_secs").and_then(|v| v.as_integer()) {
            self.sweep_interval_secs = non_negative("sweep_interval_secs", interval)?;
        }

        if let Some(path) = toml_config.get("audit_log_path").and_then(|v| v.as_str()) {
            self.audit_log_path = Some(PathBuf::from(path));
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_ttl_secs == 0 {
            return Err(ConfigError::Invalid("request_ttl_secs must be > 0".to_string()));
        }

        if self.max_pending == 0 {
            return Err(ConfigError::Invalid("max_pending must be > 0".to_string()));
        }

        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid("sweep_interval_secs must be > 0".to_string()));
        }

        Ok(())
    }

    /// True when the ledger should live in memory only.
    pub fn uses_memory_ledger(&self) -> bool {
        self.ledger_path.as_os_str() == MEMORY_LEDGER_PATH
    }

    /// Get request store config
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            request_ttl: Duration::from_secs(self.request_ttl_secs),
            max_pending: self.max_pending,
            retention: Duration::from_secs(self.retention_secs),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn parse_env_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("Invalid {}: {}", name, e)))
}

fn non_negative(key: &str, value: i64) -> Result<u64, ConfigError> {
    u64::try_from(value)
        .map_err(|_| ConfigError::Invalid(format!("{} must not be negative in TOML", key)))
}
