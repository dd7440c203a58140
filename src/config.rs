use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::download::headers::header_map;
use crate::download::manager::default_download_root;
use crate::download::DownloadOptions;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    /// Extra headers sent with every request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    /// Defaults to the user's download directory
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

// Default value functions
fn default_timeout_secs() -> u64 {
    3600
}
fn default_probe_timeout_secs() -> u64 {
    30
}
fn default_user_agent() -> String {
    "dlqueue/0.1.0".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            download_dir: None,
            timeout_secs: default_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl Config {
    /// Typed options for a [`crate::Downloader`].
    pub fn download_options(&self) -> Result<DownloadOptions> {
        let headers = header_map(
            self.headers
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str())),
        )?;

        Ok(DownloadOptions {
            download_root: self
                .general
                .download_dir
                .clone()
                .unwrap_or_else(default_download_root),
            timeout: Duration::from_secs(self.general.timeout_secs),
            probe_timeout: Duration::from_secs(self.general.probe_timeout_secs),
            user_agent: self.general.user_agent.clone(),
            headers,
        })
    }
}

pub struct ConfigManager {
    config_dir: PathBuf,
    config_file: PathBuf,
    config: Config,
}

impl ConfigManager {
    /// Create a new ConfigManager and load existing config or create default
    pub fn new() -> Result<Self> {
        let project_dirs =
            ProjectDirs::from("", "", "dlqueue").context("Failed to determine config directory")?;

        Self::with_file(project_dirs.config_dir().join("config.toml"))
    }

    /// Load the config at `config_file`, creating it with defaults if missing
    pub fn with_file(config_file: PathBuf) -> Result<Self> {
        let config_dir = config_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        if !config_dir.as_os_str().is_empty() && !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create config directory: {:?}", config_dir))?;
        }

        let config = if config_file.exists() {
            Self::load_config(&config_file)?
        } else {
            let default_config = Config::default();
            Self::save_config(&config_file, &default_config)?;
            default_config
        };

        Ok(Self {
            config_dir,
            config_file,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn save(&self) -> Result<()> {
        Self::save_config(&self.config_file, &self.config)
    }

    pub fn reload(&mut self) -> Result<()> {
        self.config = Self::load_config(&self.config_file)?;
        Ok(())
    }

    /// Reset to defaults and write to disk
    pub fn reset(&mut self) -> Result<()> {
        self.config = Config::default();
        self.save()
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    fn load_config(config_file: &Path) -> Result<Config> {
        let content = fs::read_to_string(config_file)
            .with_context(|| format!("Failed to read config file: {:?}", config_file))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", config_file))?;

        Ok(config)
    }

    fn save_config(config_file: &Path, config: &Config) -> Result<()> {
        let content = toml::to_string_pretty(config).context("Failed to serialize config")?;

        fs::write(config_file, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_file))?;

        Ok(())
    }

    /// Create a sample config file for user reference
    pub fn create_sample_config(&self) -> Result<PathBuf> {
        let sample_file = self.config_dir.join("config.sample.toml");
        Self::save_config(&sample_file, &Config::default())?;
        Ok(sample_file)
    }

    pub fn validate(&self) -> Result<()> {
        if self.config.general.timeout_secs == 0 {
            anyhow::bail!("timeout_secs must be greater than 0");
        }

        if self.config.general.probe_timeout_secs == 0 {
            anyhow::bail!("probe_timeout_secs must be greater than 0");
        }

        if self.config.general.user_agent.trim().is_empty() {
            anyhow::bail!("user_agent cannot be empty");
        }

        if let Some(dir) = &self.config.general.download_dir {
            if dir.as_os_str().is_empty() {
                anyhow::bail!("download_dir cannot be empty");
            }
        }

        self.config
            .download_options()?
            .validate()
            .context("Invalid download settings")?;

        Ok(())
    }
}
