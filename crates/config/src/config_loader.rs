use crate::context_config::ContextSettings;
use llamarelay_common::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub runtime: RuntimeConfig,
    pub models: ModelsConfig,
    pub contexts: ContextSettings,
    pub logging: LoggingConfig,
}

/// Front-end server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Tunables of the inference orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// How long a completion waits for the server to become ready
    pub ready_timeout_secs: u64,
    /// How long `stop` waits for a graceful exit before killing
    pub stop_timeout_secs: u64,
    /// First restart delay after a worker crash
    pub worker_restart_delay_ms: u64,
    /// Upper bound for the worker restart backoff
    pub worker_restart_max_delay_ms: u64,
    /// Pause before retrying an empty dialogue answer
    pub dialogue_retry_delay_ms: u64,
    /// Longest single message delivered to a channel
    pub max_message_len: usize,
}

/// Models configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// Directory relative executables are resolved against
    pub directory: Option<PathBuf>,
    pub registry_file: Option<PathBuf>,
    /// Model selected at startup; the registry default when unset
    pub default_model: Option<String>,
}

/// Log file output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Where daily log files are written; `~/.llamarelay/logs` when unset
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8081,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            ready_timeout_secs: 600,
            stop_timeout_secs: 5,
            worker_restart_delay_ms: 1000,
            worker_restart_max_delay_ms: 30_000,
            dialogue_retry_delay_ms: 1000,
            max_message_len: 1950,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            file_prefix: "llamarelay.log".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn log_dir(&self) -> PathBuf {
        match &self.directory {
            Some(dir) => dir.clone(),
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".llamarelay")
                .join("logs"),
        }
    }
}

impl RuntimeConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn worker_restart_delay(&self) -> Duration {
        Duration::from_millis(self.worker_restart_delay_ms)
    }

    pub fn worker_restart_max_delay(&self) -> Duration {
        Duration::from_millis(self.worker_restart_max_delay_ms)
    }

    pub fn dialogue_retry_delay(&self) -> Duration {
        Duration::from_millis(self.dialogue_retry_delay_ms)
    }
}

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from file or use defaults
    pub fn load(path: Option<&Path>) -> Result<AppConfig> {
        if let Some(path) = path {
            if path.exists() {
                return Self::read(path);
            }
            debug!("Config file {} does not exist, checking defaults", path.display());
        }

        // Check default locations
        let default_paths = vec![
            PathBuf::from("llamarelay.json"),
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("llamarelay/config.json"),
        ];

        for path in default_paths {
            if path.exists() {
                return Self::read(&path);
            }
        }

        // Use defaults
        info!("No configuration file found, using defaults");
        Ok(AppConfig::default())
    }

    fn read(path: &Path) -> Result<AppConfig> {
        info!("Loading configuration from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(config: &AppConfig, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(config)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
