use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::runtime::RuntimeConfig;

const APP_DIR: &str = "ai-companion";

pub const ENV_SERVER_URI: &str = "AI_COMPANION_SERVER_URI";
pub const ENV_RENDEZVOUS_HOST: &str = "AI_COMPANION_RENDEZVOUS_HOST";
pub const ENV_ASSET_DIR: &str = "AI_COMPANION_ASSET_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TurnSettings {
    #[serde(default = "default_turn_url")]
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

fn default_turn_url() -> String {
    "turn:turn.appinventor.mit.edu:3478".to_string()
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            url: default_turn_url(),
            username: String::new(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeSettings {
    #[serde(default = "default_toast_interval_secs")]
    pub toast_interval_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_toast_interval_secs() -> u64 {
    10
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            toast_interval_secs: default_toast_interval_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl RuntimeSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            toast_interval: Duration::from_secs(self.toast_interval_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    #[serde(default = "default_server_uri")]
    pub server_uri: String,
    #[serde(default = "default_rendezvous_host")]
    pub rendezvous_host: String,
    #[serde(default = "default_asset_dir")]
    pub asset_dir: PathBuf,
    #[serde(default)]
    pub turn: TurnSettings,
    #[serde(default)]
    pub runtime: RuntimeSettings,
}

fn default_server_uri() -> String {
    "http://localhost:8888".to_string()
}

fn default_rendezvous_host() -> String {
    "rendezvous.appinventor.mit.edu".to_string()
}

fn default_asset_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("AppInventor")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_uri: default_server_uri(),
            rendezvous_host: default_rendezvous_host(),
            asset_dir: default_asset_dir(),
            turn: TurnSettings::default(),
            runtime: RuntimeSettings::default(),
        }
    }
}

impl Config {
    pub fn get_config_path() -> Result<PathBuf> {
        let config_dir = if cfg!(target_os = "linux") {
            // Use XDG config directory on Linux
            dirs::config_dir()
                .context("Failed to get XDG config directory")?
                .join(APP_DIR)
        } else {
            dirs::home_dir()
                .context("Failed to get home directory")?
                .join(format!(".{}", APP_DIR))
        };

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create config directory: {:?}", config_dir))?;
            info!("Created config directory: {:?}", config_dir);
        }

        Ok(config_dir.join("config.toml"))
    }

    /// Loads the config file, then applies environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = Self::get_config_path()?;
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Reads `path`; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        debug!("Loading config from: {:?}", path);

        if !path.exists() {
            info!("Config file doesn't exist, using defaults");
            return Ok(Self::default());
        }

        let config_content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&config_content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        debug!("Loaded config for server {}", config.server_uri);
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::get_config_path()?;
        self.save_to(&config_path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        debug!("Saving config to: {:?}", path);

        let config_content =
            toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(path, config_content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        info!("Config saved successfully");
        Ok(())
    }

    /// Environment variables (including ones loaded from `.env`) win over the file.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(uri) = lookup(ENV_SERVER_URI) {
            debug!("{} overrides server_uri", ENV_SERVER_URI);
            self.server_uri = uri;
        }
        if let Some(host) = lookup(ENV_RENDEZVOUS_HOST) {
            debug!("{} overrides rendezvous_host", ENV_RENDEZVOUS_HOST);
            self.rendezvous_host = host;
        }
        if let Some(dir) = lookup(ENV_ASSET_DIR) {
            debug!("{} overrides asset_dir", ENV_ASSET_DIR);
            self.asset_dir = PathBuf::from(dir);
        }
    }

    pub fn set_server_uri(&mut self, uri: String) -> Result<()> {
        if !uri.starts_with("http://") && !uri.starts_with("https://") {
            anyhow::bail!("Server URI must start with http:// or https://: {}", uri);
        }
        info!("Setting server URI to: {}", uri);
        self.server_uri = uri.trim_end_matches('/').to_string();
        self.save()
    }

    pub fn set_rendezvous_host(&mut self, host: String) -> Result<()> {
        if host.trim().is_empty() || host.contains('/') {
            anyhow::bail!("Rendezvous host must be a bare host name: '{}'", host);
        }
        info!("Setting rendezvous host to: {}", host);
        self.rendezvous_host = host;
        self.save()
    }

    pub fn set_asset_dir(&mut self, dir: PathBuf) -> Result<()> {
        info!("Setting asset directory to: {:?}", dir);
        self.asset_dir = dir;
        self.save()
    }
}
