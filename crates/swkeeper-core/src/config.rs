//! Application configuration management.
//!
//! This module handles loading and saving the configuration that shapes the
//! cache and update behaviour: the application name used to namespace cache
//! generations, the origin being served, the shell manifest primed on install
//! and the version endpoint polled by pages.
//!
//! Configuration is stored at `~/.config/swkeeper/config.json`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "swkeeper";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Durable update state file name (in the data directory)
pub const STATE_FILE: &str = "update-state.json";

/// Default path segment marking API data requests.
const DEFAULT_API_MARKER: &str = "/api/";

/// Minimum spacing between version endpoint calls.
const DEFAULT_CHECK_INTERVAL_SECS: u64 = 60;

/// How long a page waits for the worker to confirm activation before reloading anyway.
const DEFAULT_ACTIVATION_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Prefix of every cache name, e.g. `myapp` in `myapp-core-v1700000000000`.
    pub app_name: String,
    /// Origin the worker is controlling; manifest paths are resolved against it.
    pub origin: Url,
    /// Path segment identifying API data requests.
    pub api_marker: String,
    /// Documents primed into the core cache on install. The first entry is the
    /// root document served as the offline shell.
    pub shell_manifest: Vec<String>,
    /// Query parameters that mark a request as cache-busting.
    pub cache_busting_params: Vec<String>,
    /// Version endpoint. `None` disables update negotiation.
    pub version_url: Option<Url>,
    pub check_interval_secs: u64,
    pub activation_timeout_secs: u64,
    /// Promote a freshly installed generation without waiting for pages to close.
    pub skip_waiting_on_install: bool,
}

impl Default for Config {
    fn default() -> Self {
        let origin = Url::parse("http://localhost:8080/").expect("default origin is a valid URL");
        Self {
            app_name: APP_NAME.to_string(),
            version_url: origin.join("/api/version").ok(),
            origin,
            api_marker: DEFAULT_API_MARKER.to_string(),
            shell_manifest: vec![
                "/".to_string(),
                "/index.html".to_string(),
                "/manifest.json".to_string(),
            ],
            cache_busting_params: ["_", "v", "t", "cb", "nocache"]
                .iter()
                .map(|p| p.to_string())
                .collect(),
            check_interval_secs: DEFAULT_CHECK_INTERVAL_SECS,
            activation_timeout_secs: DEFAULT_ACTIVATION_TIMEOUT_SECS,
            skip_waiting_on_install: true,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply `SWKEEPER_APP_NAME`, `SWKEEPER_ORIGIN` and `SWKEEPER_VERSION_URL`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var("SWKEEPER_APP_NAME") {
            if !name.is_empty() {
                self.app_name = name;
            }
        }
        if let Ok(origin) = std::env::var("SWKEEPER_ORIGIN") {
            match Url::parse(&origin) {
                Ok(url) => self.origin = url,
                Err(e) => warn!(value = %origin, error = %e, "Ignoring invalid SWKEEPER_ORIGIN"),
            }
        }
        if let Ok(version_url) = std::env::var("SWKEEPER_VERSION_URL") {
            match Url::parse(&version_url) {
                Ok(url) => self.version_url = Some(url),
                Err(e) => {
                    warn!(value = %version_url, error = %e, "Ignoring invalid SWKEEPER_VERSION_URL")
                }
            }
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding one JSON file per named cache.
    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME).join(&self.app_name))
    }

    /// Directory holding durable update state.
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME).join(&self.app_name))
    }

    pub fn check_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.check_interval_secs as i64)
    }

    pub fn activation_timeout(&self) -> Duration {
        Duration::from_secs(self.activation_timeout_secs)
    }
}
