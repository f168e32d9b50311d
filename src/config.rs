//! Configuration management for Parley
//!
//! Settings are stored in `~/.parley/config.json` with a schema version and
//! sequential migrations. Every section is `#[serde(default)]`, so partial
//! files load with defaults for anything missing.

use crate::audio::capture::CaptureConstraints;
use crate::audio::vad::VadConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Current config schema version
pub const CURRENT_VERSION: u32 = 1;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Unknown config version: {0}")]
    UnknownVersion(u32),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Schema version for migrations
    pub version: u32,
    /// Capture settings
    pub audio: AudioConfig,
    /// Voice activity detection
    pub vad: VadConfig,
    /// Device selection and liveness testing
    pub devices: DevicesConfig,
    /// Speech-to-text bridge
    pub speech: SpeechConfig,
    /// Retry and watchdog policy
    pub recovery: RecoveryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            audio: AudioConfig::default(),
            vad: VadConfig::default(),
            devices: DevicesConfig::default(),
            speech: SpeechConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

/// Capture configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Processing requested from the platform when a stream is opened
    pub constraints: CaptureConstraints,
    /// Analyse audio inside the capture callback when the stream allows it
    pub realtime_processing: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            constraints: CaptureConstraints::default(),
            realtime_processing: true,
        }
    }
}

/// Device management configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    /// Upper bound on a liveness test; exceeding it yields "unknown"
    pub liveness_timeout_ms: u64,
    /// Upper bound on a real acquisition
    pub acquire_timeout_ms: u64,
    /// How long a liveness test holds the device before checking the track
    pub sample_duration_ms: u64,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            liveness_timeout_ms: 1_500,
            acquire_timeout_ms: 5_000,
            sample_duration_ms: 100,
        }
    }
}

/// Speech-to-text bridge configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// Recognition language (BCP 47)
    pub language: String,
    /// Ask the engine for interim (non-final) results
    pub interim_results: bool,
    /// Delay before restarting after a benign session end
    pub restart_delay_ms: u64,
    /// Benign ends tolerated inside the window before giving up
    pub max_rapid_restarts: u32,
    /// Window for counting rapid restarts
    pub rapid_restart_window_ms: u64,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            language: "en-US".to_string(),
            interim_results: true,
            restart_delay_ms: 250,
            max_rapid_restarts: 5,
            rapid_restart_window_ms: 10_000,
        }
    }
}

/// Recovery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Internal retries for transient failures before surfacing
    pub max_retries: u32,
    /// Fixed delay between retries
    pub retry_backoff_ms: u64,
    /// Minimum gap between releasing a device and acquiring again
    pub min_restart_delay_ms: u64,
    /// Interval of the capture liveness watchdog
    pub watchdog_interval_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_ms: 1_000,
            min_restart_delay_ms: 300,
            watchdog_interval_ms: 2_000,
        }
    }
}

impl Config {
    /// Reject values the orchestrator cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.vad
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if self.devices.liveness_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "devices.liveness_timeout_ms must be positive".to_string(),
            ));
        }
        if self.devices.acquire_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "devices.acquire_timeout_ms must be positive".to_string(),
            ));
        }
        if self.devices.sample_duration_ms >= self.devices.liveness_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "devices.sample_duration_ms ({}) must be shorter than liveness_timeout_ms ({})",
                self.devices.sample_duration_ms, self.devices.liveness_timeout_ms
            )));
        }
        if self.recovery.watchdog_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "recovery.watchdog_interval_ms must be positive".to_string(),
            ));
        }
        if self.speech.language.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "speech.language must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parley's data directory (~/.parley)
pub fn parley_dir() -> PathBuf {
    home_dir_or_fallback().join(".parley")
}

/// Get the path to the config file (~/.parley/config.json)
pub fn default_config_path() -> PathBuf {
    parley_dir().join("config.json")
}

/// Get the home directory, falling back to /tmp if unavailable
fn home_dir_or_fallback() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        tracing::error!("Could not determine home directory, using /tmp");
        PathBuf::from("/tmp")
    })
}

/// Load configuration from `path`
///
/// A missing file yields defaults. Older schema versions are migrated and
/// the migrated file is written back.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        tracing::info!("Config file not found at {}, using defaults", path.display());
        return Ok(Config::default());
    }

    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: Config = serde_json::from_str(&contents)?;

    let original_version = config.version;
    let migrated = migrate_config(config)?;
    if migrated.version != original_version {
        save_config(path, &migrated)?;
    }

    migrated.validate()?;
    Ok(migrated)
}

/// Save configuration to `path`, creating parent directories
pub fn save_config(path: &Path, config: &Config) -> Result<(), ConfigError> {
    let write_error = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(write_error)?;
    }
    let contents = serde_json::to_string_pretty(config)?;
    fs::write(path, contents).map_err(write_error)?;

    tracing::info!("Config saved to {}", path.display());
    Ok(())
}

/// Migrate configuration from older schema versions
fn migrate_config(mut config: Config) -> Result<Config, ConfigError> {
    let original_version = config.version;

    while config.version < CURRENT_VERSION {
        config = apply_migration(config)?;
    }
    if config.version > CURRENT_VERSION {
        return Err(ConfigError::UnknownVersion(config.version));
    }

    if config.version != original_version {
        tracing::info!(
            "Migrated config from version {} to {}",
            original_version,
            config.version
        );
    }
    Ok(config)
}

/// Apply a single migration step
fn apply_migration(config: Config) -> Result<Config, ConfigError> {
    match config.version {
        // Version 0 -> 1: initial schema
        0 => Ok(Config {
            version: 1,
            ..config
        }),
        v => Err(ConfigError::UnknownVersion(v)),
    }
}
