use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info};

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct EnricherConfig {
    pub queue: QueueSettings,
    pub throttle: ThrottleSettings,
    pub robots: RobotsSettings,
    pub fetch: FetchSettings,
    pub dispatch: DispatchSettings,
    pub parse_context: ParseContextSettings,
    pub storage: StorageSettings,
}

/// Task queue settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct QueueSettings {
    /// Maximum number of tasks running at once
    pub concurrency: usize,
    /// Attempts per task before it is reported as failed
    pub max_attempts: u32,
}

/// Per-host politeness settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ThrottleSettings {
    pub min_interval_ms: u64,
}

/// Robots policy cache settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RobotsSettings {
    pub ttl_ms: u64,
    pub fetch_timeout_ms: u64,
    /// Scheme used to reach `/robots.txt`
    pub scheme: String,
}

/// HTTP fetch settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct FetchSettings {
    pub timeout_ms: u64,
    pub user_agent: String,
    pub max_redirects: usize,
    /// Markup beyond this many bytes is never read
    pub max_body_bytes: usize,
}

/// Settings for requests sent into the parse context
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DispatchSettings {
    pub timeout_ms: u64,
    pub transient_retries: u32,
    pub retry_backoff_ms: u64,
}

/// Isolated parse context settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ParseContextSettings {
    /// When disabled every page goes through the fallback extractor
    pub enabled: bool,
    /// The context is torn down after this long without requests
    pub idle_timeout_ms: u64,
}

/// Result storage settings
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct StorageSettings {
    /// Where the JSON result file is written; in-memory only when unset
    pub results_path: Option<PathBuf>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_attempts: 3,
        }
    }
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self { min_interval_ms: 1000 }
    }
}

impl Default for RobotsSettings {
    fn default() -> Self {
        Self {
            ttl_ms: 86_400_000,
            fetch_timeout_ms: 5000,
            scheme: "https".to_string(),
        }
    }
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 8000,
            user_agent: format!(
                "link-enricher/{} (+personal bookmark metadata refresher)",
                env!("CARGO_PKG_VERSION")
            ),
            max_redirects: 10,
            max_body_bytes: 16_384,
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            transient_retries: 3,
            retry_backoff_ms: 50,
        }
    }
}

impl Default for ParseContextSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_timeout_ms: 60_000,
        }
    }
}

impl ThrottleSettings {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

impl RobotsSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

impl FetchSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl DispatchSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl ParseContextSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl EnricherConfig {
    /// Get the path to the config directory
    pub fn config_dir() -> PathBuf {
        let path = if let Some(proj_dirs) =
            directories::ProjectDirs::from("com", "link-enricher", "link-enricher")
        {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        };

        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }

        path
    }

    pub fn default_path() -> PathBuf {
        Self::config_dir().join("default.yaml")
    }

    /// Load the default configuration, writing it out on first use
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_path();

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_to_file(&config_path)?;
            Ok(config)
        }
    }

    /// Load configuration from an explicit path, or the default location
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => Self::load_default(),
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        Self::from_yaml(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(contents)?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize configuration")
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        fs::write(path, self.to_yaml()?)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let config = EnricherConfig::default();
        assert_eq!(config.throttle.min_interval_ms, 1000);
        assert_eq!(config.robots.ttl_ms, 86_400_000);
        assert_eq!(config.fetch.timeout_ms, 8000);
        assert_eq!(config.fetch.max_body_bytes, 16_384);
        assert_eq!(config.dispatch.timeout_ms, 5000);
        assert_eq!(config.dispatch.transient_retries, 3);
        assert_eq!(config.dispatch.retry_backoff_ms, 50);
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = EnricherConfig::from_yaml(
            "queue:\n  concurrency: 2\nthrottle:\n  min_interval_ms: 250\n",
        )
        .unwrap();
        assert_eq!(config.queue.concurrency, 2);
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.throttle.min_interval_ms, 250);
        assert_eq!(config.robots.scheme, "https");
    }

    #[test]
    fn yaml_roundtrip_through_file() {
        let dir =
            std::env::temp_dir().join(format!("link-enricher-config-{}", uuid::Uuid::new_v4()));
        let path = dir.join("custom.yaml");
        let mut config = EnricherConfig::default();
        config.fetch.user_agent = "TestBot/1.0".to_string();
        config.save_to_file(&path).unwrap();

        let loaded = EnricherConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.fetch.user_agent, "TestBot/1.0");
        fs::remove_dir_all(dir).ok();
    }
}
