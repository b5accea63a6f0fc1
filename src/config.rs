//! Configuration management for kpodd
//!
//! Handles loading and validation of the JSON configuration file.
//! Configuration is stored at `~/.config/kpodd/config.json`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::transport::{DeviceFilter, KPOD_PRODUCT_ID, KPOD_VENDOR_ID};

// ============================================================================
// Constants
// ============================================================================

/// Default config directory name
const CONFIG_DIR: &str = "kpodd";

/// Default config file name
const CONFIG_FILE: &str = "config.json";

/// Default status poll interval
///
/// The device accepts at most 20 commands per second, i.e. one every 50ms.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

/// Shortest poll interval the device command budget allows
pub const MIN_POLL_INTERVAL_MS: u64 = 50;

/// Default hidraw rescan interval for attach/detach detection
pub const DEFAULT_RESCAN_INTERVAL_MS: u64 = 2000;

/// Shortest hidraw rescan interval
pub const MIN_RESCAN_INTERVAL_MS: u64 = 100;

// ============================================================================
// Device Configuration
// ============================================================================

/// Which device class to drive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// USB vendor ID (default: 0x04D8)
    #[serde(default = "default_vendor_id")]
    pub vendor_id: u16,

    /// USB product ID (default: 0xF12D)
    #[serde(default = "default_product_id")]
    pub product_id: u16,
}

fn default_vendor_id() -> u16 { KPOD_VENDOR_ID }
fn default_product_id() -> u16 { KPOD_PRODUCT_ID }

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            vendor_id: KPOD_VENDOR_ID,
            product_id: KPOD_PRODUCT_ID,
        }
    }
}

impl DeviceConfig {
    pub fn filter(&self) -> DeviceFilter {
        DeviceFilter {
            vendor_id: self.vendor_id,
            product_id: self.product_id,
        }
    }
}

// ============================================================================
// Polling Configuration
// ============================================================================

/// Status polling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Interval between status requests in milliseconds (default: 50)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval() -> u64 { DEFAULT_POLL_INTERVAL_MS }

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl PollingConfig {
    pub fn new(poll_interval_ms: u64) -> Self {
        Self { poll_interval_ms }
    }

    /// Clamp the interval to the device command budget
    pub fn validate(&mut self) {
        if self.poll_interval_ms < MIN_POLL_INTERVAL_MS {
            tracing::warn!(
                requested = self.poll_interval_ms,
                minimum = MIN_POLL_INTERVAL_MS,
                "Poll interval exceeds device command budget, clamping"
            );
            self.poll_interval_ms = MIN_POLL_INTERVAL_MS;
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ============================================================================
// Hidraw Configuration
// ============================================================================

/// Linux hidraw transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HidrawConfig {
    /// Interval between device rescans in milliseconds (default: 2000)
    #[serde(default = "default_rescan_interval")]
    pub rescan_interval_ms: u64,
}

fn default_rescan_interval() -> u64 { DEFAULT_RESCAN_INTERVAL_MS }

impl Default for HidrawConfig {
    fn default() -> Self {
        Self {
            rescan_interval_ms: DEFAULT_RESCAN_INTERVAL_MS,
        }
    }
}

impl HidrawConfig {
    pub fn validate(&mut self) {
        self.rescan_interval_ms = self.rescan_interval_ms.max(MIN_RESCAN_INTERVAL_MS);
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_millis(self.rescan_interval_ms)
    }
}

// ============================================================================
// Main Configuration
// ============================================================================

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub polling: PollingConfig,

    #[serde(default)]
    pub hidraw: HidrawConfig,

    /// Configuration file path (not serialized)
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

impl Config {
    /// Get the default config directory path
    pub fn default_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join(CONFIG_DIR))
    }

    /// Get the default config file path
    pub fn default_config_path() -> Option<PathBuf> {
        Self::default_config_dir().map(|p| p.join(CONFIG_FILE))
    }

    /// Load configuration from the default location
    ///
    /// Returns default config if file doesn't exist.
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_config_path() {
            Some(path) => Self::load(&path),
            None => {
                tracing::warn!("Could not determine config directory, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from file path
    ///
    /// Returns default config if file doesn't exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            let mut config = Self::default();
            config.config_path = Some(path.to_path_buf());
            return Ok(config);
        }

        let contents = fs::read_to_string(path)?;
        let mut config: Config = serde_json::from_str(&contents)?;

        config.validate();
        config.config_path = Some(path.to_path_buf());

        tracing::info!(
            path = %path.display(),
            device = %config.device.filter(),
            poll_interval_ms = config.polling.poll_interval_ms,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Validate and clamp all values
    pub fn validate(&mut self) {
        self.polling.validate();
        self.hidraw.validate();
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Configuration error type
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading file
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    /// JSON parsing error
    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),
}
