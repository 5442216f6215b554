//! Configuration System using Figment
//!
//! This module provides strongly-typed configuration loading for a sweep.
//! Configuration is loaded from:
//! 1. built-in defaults (the analyzer's usual front-panel values)
//! 2. a TOML file (optional)
//! 3. Environment variables (prefixed with `LCR_SWEEP_`, `__` separates
//!    nested keys)
//!
//! # Example
//! ```no_run
//! use lcr_sweep::config::AppConfig;
//!
//! let config = AppConfig::load_from("lcr_sweep.toml")?;
//! println!("Sweeping {} frequencies on {}", config.sweep.frequencies.len(), config.sweep.port);
//! # Ok::<(), lcr_sweep::error::ConfigError>(())
//! ```
//!
//! ```toml
//! [application]
//! log_level = "debug"
//! display_style = "line"
//!
//! [sweep]
//! port = "/dev/ttyUSB0"
//! baud_rate = 9600
//! dc_bias_mv = 0
//! ac_level_mv = 300
//!
//! [sweep.timing]
//! settle_delay = "1s"
//! read_timeout = "1s"
//!
//! [sweep.retry]
//! max_attempts = 50
//! ```

use crate::error::ConfigError;
use crate::sweep::RetryPolicy;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Frequencies (Hz) swept when none are configured.
pub const DEFAULT_FREQUENCIES: [f64; 16] = [
    100.0, 120.0, 200.0, 400.0, 800.0, 1000.0, 2000.0, 4000.0, 8000.0, 10000.0, 15000.0, 20000.0,
    40000.0, 50000.0, 80000.0, 100000.0,
];

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "LCR_SWEEP_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Measurement run settings
    #[serde(default)]
    pub sweep: SweepConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// How the front-end should draw the sample stream
    #[serde(default)]
    pub display_style: DisplayStyle,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            display_style: DisplayStyle::default(),
        }
    }
}

/// Plot style requested by the user. Passed through to the renderer only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayStyle {
    /// Individual markers
    #[default]
    Points,
    /// Connected line
    Line,
}

/// Immutable configuration for one measurement run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Serial port identifier (e.g. "COM14", "/dev/ttyUSB0")
    #[serde(default = "default_port")]
    pub port: String,
    /// Serial baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// DC bias in millivolts
    #[serde(default)]
    pub dc_bias_mv: i32,
    /// AC test level in millivolts
    #[serde(default = "default_ac_level")]
    pub ac_level_mv: i32,
    /// Target frequencies in Hz, swept in this order
    #[serde(default = "default_frequencies")]
    pub frequencies: Vec<f64>,
    /// Read settings back after configuring and fail on mismatch
    #[serde(default)]
    pub strict: bool,
    /// Command pacing and read timeout
    #[serde(default)]
    pub timing: TimingConfig,
    /// Per-frequency retry bound
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud_rate(),
            dc_bias_mv: 0,
            ac_level_mv: default_ac_level(),
            frequencies: default_frequencies(),
            strict: false,
            timing: TimingConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Command pacing
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Pause after every command before further interaction
    #[serde(default = "default_settle_delay", with = "humantime_serde")]
    pub settle_delay: Duration,
    /// Maximum wait for one response line
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle_delay: default_settle_delay(),
            read_timeout: default_read_timeout(),
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_port() -> String {
    "COM14".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_ac_level() -> i32 {
    300
}

fn default_frequencies() -> Vec<f64> {
    DEFAULT_FREQUENCIES.to_vec()
}

fn default_settle_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(1)
}

impl AppConfig {
    /// Layered provider: defaults, then `path` (if given), then environment.
    ///
    /// Callers can merge further layers (e.g. command-line overrides) before
    /// extracting with [`AppConfig::from_figment`].
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Extract a configuration from a prepared provider.
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        Ok(figment.extract()?)
    }

    /// Load defaults overridden by environment variables only.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment(None))
    }

    /// Load defaults, then a TOML file, then environment variables.
    ///
    /// Environment variables can override the file, e.g.
    /// `LCR_SWEEP_SWEEP__PORT=/dev/ttyUSB1`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment(Some(path.as_ref())))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        crate::logging::parse_log_level(&self.application.log_level)
            .map_err(ConfigError::Invalid)?;
        self.sweep.validate()
    }

    /// Render the resolved configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

impl SweepConfig {
    /// Check values the client itself depends on.
    ///
    /// Bias and level are deliberately left to the instrument: the device
    /// decides what it accepts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port.trim().is_empty() {
            return Err(ConfigError::Invalid("Serial port must not be empty".into()));
        }
        if self.baud_rate == 0 {
            return Err(ConfigError::Invalid("Baud rate must be greater than zero".into()));
        }
        if let Some(bad) = self
            .frequencies
            .iter()
            .find(|f| !f.is_finite() || **f <= 0.0)
        {
            return Err(ConfigError::Invalid(format!(
                "Invalid frequency {} Hz. Frequencies must be positive and finite",
                bad
            )));
        }
        if self.retry.max_attempts == Some(0) {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
