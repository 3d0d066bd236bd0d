//! Configuration file management
//!
//! Loads TOML configuration files and provides application settings.
//! Default config path: ~/.config/kmscommit/config.toml

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{
    DEFAULT_DEMO_FRAMES, DEFAULT_DRM_DEVICE, DEFAULT_FENCE_TIMEOUT_MS, DEFAULT_FRAME_INTERVAL_MS,
    MAX_FENCE_TIMEOUT_MS, MIN_FENCE_TIMEOUT_MS,
};
use crate::kms::ManagerOptions;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Device settings
    pub device: DeviceConfig,
    /// Commit pipeline settings
    pub commit: CommitConfig,
    /// Demo flip loop settings
    pub demo: DemoConfig,
}

/// Device settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    /// DRM device node, or a pattern ending in `%` to open every
    /// /dev/dri/card<N> in order until one is missing
    pub path: String,
    /// Prefer external monitors over internal (eDP) display
    /// When true, external monitors (HDMI, DisplayPort, DVI, VGA) take priority
    /// When false, use first connected display
    pub prefer_external: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_DRM_DEVICE.to_string(),
            prefer_external: true,
        }
    }
}

impl DeviceConfig {
    /// Device nodes to open, in order
    pub fn device_paths(&self) -> Vec<PathBuf> {
        let Some(prefix) = self.path.strip_suffix('%') else {
            return vec![PathBuf::from(&self.path)];
        };
        (0..)
            .map(|idx| PathBuf::from(format!("{}{}", prefix, idx)))
            .take_while(|path| path.exists())
            .collect()
    }
}

/// Commit pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CommitConfig {
    /// Upper bound for a single completion fence wait (milliseconds)
    /// A fence that does not signal in time is logged and retired anyway
    pub fence_timeout_ms: u64,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            fence_timeout_ms: DEFAULT_FENCE_TIMEOUT_MS,
        }
    }
}

impl CommitConfig {
    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            fence_timeout: Duration::from_millis(self.fence_timeout_ms),
        }
    }
}

/// Demo flip loop settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DemoConfig {
    /// Number of page flips before blanking
    pub frames: u32,
    /// Delay between flips (milliseconds)
    pub frame_interval_ms: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            frames: DEFAULT_DEMO_FRAMES,
            frame_interval_ms: DEFAULT_FRAME_INTERVAL_MS,
        }
    }
}

impl Config {
    const SYSTEM_CONFIG_PATH: &'static str = "/etc/kmscommit/config.toml";

    /// Get the path that would be used for loading config
    /// Returns None if using built-in defaults
    pub fn config_path() -> Option<PathBuf> {
        // 1. KMSCOMMIT_CONFIG environment variable
        if let Ok(path) = std::env::var("KMSCOMMIT_CONFIG") {
            let p = Path::new(&path);
            if p.exists() {
                return Some(p.to_path_buf());
            }
        }

        // 2. User config: ~/.config/kmscommit/config.toml
        if let Some(config_path) = default_config_path() {
            if config_path.exists() {
                return Some(config_path);
            }
        }

        // 3. System config: /etc/kmscommit/config.toml
        let system_config = Path::new(Self::SYSTEM_CONFIG_PATH);
        if system_config.exists() {
            return Some(system_config.to_path_buf());
        }

        None
    }

    /// Load configuration with priority:
    /// 1. KMSCOMMIT_CONFIG environment variable
    /// 2. ~/.config/kmscommit/config.toml (user config)
    /// 3. /etc/kmscommit/config.toml (system config)
    /// 4. Built-in defaults
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            match Self::load_from_file(&path) {
                Ok(config) => {
                    info!("Loaded config: {}", path.display());
                    return config;
                }
                Err(e) => {
                    warn!("Failed to load config {}: {}", path.display(), e);
                }
            }
        }
        info!("Using built-in default config");
        Self::default()
    }

    /// Load settings from specified path
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse and sanitize a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.sanitize();
        Ok(config)
    }

    /// Clamp out-of-range values
    fn sanitize(&mut self) {
        let timeout = self.commit.fence_timeout_ms;
        let clamped = timeout.clamp(MIN_FENCE_TIMEOUT_MS, MAX_FENCE_TIMEOUT_MS);
        if clamped != timeout {
            warn!(
                "commit.fence_timeout_ms={} out of range, using {}",
                timeout, clamped
            );
            self.commit.fence_timeout_ms = clamped;
        }

        if self.device.path.trim().is_empty() {
            warn!("device.path is empty, using {}", DEFAULT_DRM_DEVICE);
            self.device.path = DEFAULT_DRM_DEVICE.to_string();
        }
    }

    /// Write the default config to the user config path
    pub fn write_default(force: bool) -> Result<PathBuf> {
        let path = default_config_path()
            .ok_or_else(|| anyhow::anyhow!("Config directory not found"))?;

        if path.exists() && !force {
            anyhow::bail!("Config file already exists: {}", path.display());
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let content =
            toml::to_string_pretty(&Config::default()).context("Failed to serialize config")?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        info!("Wrote default config: {}", path.display());
        Ok(path)
    }
}

/// Get default config file path
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("kmscommit").join("config.toml"))
}
