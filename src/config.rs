//! Configuration System using Figment
//!
//! Configuration is layered from:
//! 1. Built-in defaults matching the chamber hardware
//! 2. `config/chamber.toml` (optional)
//! 3. Environment variables (prefixed with `CHAMBER_`)
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated with a double underscore:
//!
//! ```text
//! CHAMBER_APPLICATION__LOG_LEVEL=debug
//! CHAMBER_MOTOR_BUS__PORT=/dev/ttyUSB0
//! CHAMBER_SWEEP__ERROR_POLICY=abort
//! ```
//!
//! # Example
//!
//! ```no_run
//! use chamber_daq::config::Settings;
//!
//! let settings = Settings::load()?;
//! println!("Motor bus: {}", settings.motor_bus.port);
//! # Ok::<(), chamber_daq::config::ConfigError>(())
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::experiment::sweep::ErrorPolicy;
use crate::hardware::motor::{ACCELERATION_RANGE, SPEED_RANGE};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/chamber.toml";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Serial motor controller connection
    #[serde(default)]
    pub motor_bus: MotorBusConfig,
    /// Network analyzer connection and timing
    #[serde(default)]
    pub vna: VnaConfig,
    /// Per-axis speed and acceleration defaults
    #[serde(default)]
    pub motors: MotorTuning,
    /// Sweep sequencing behaviour
    #[serde(default)]
    pub sweep: SweepConfig,
    /// Configuration store location
    #[serde(default)]
    pub store: StoreConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory receiving the `_s11.csv` / `_s21.csv` result files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Serial motor controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotorBusConfig {
    /// Serial port (e.g., "/dev/ttyUSB0", "COM3")
    #[serde(default = "default_serial_port")]
    pub port: String,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Motion acknowledgement timeout in milliseconds
    #[serde(default = "default_bus_timeout")]
    pub timeout_ms: u64,
}

/// Network analyzer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VnaConfig {
    /// Explicit VISA resource; when absent the first resource on `bus` is used
    #[serde(default)]
    pub resource: Option<String>,
    /// Bus type used for discovery (e.g., "GPIB")
    #[serde(default = "default_vna_bus")]
    pub bus: String,
    /// Query timeout in milliseconds
    #[serde(default = "default_vna_timeout")]
    pub timeout_ms: u64,
    /// Pause after `:TRIG:SING` and after loading a state file
    #[serde(default = "default_vna_settle")]
    pub settle_ms: u64,
    /// Pause after storing a state file or starting an e-cal
    #[serde(default = "default_save_state")]
    pub save_state_ms: u64,
}

/// Motor speed/acceleration defaults applied at session start
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotorTuning {
    /// Stand rotation speed (steps/s)
    #[serde(default = "default_stand_speed")]
    pub stand_speed: u32,
    /// Stand translation speed (steps/s)
    #[serde(default = "default_translation_speed")]
    pub translation_speed: u32,
    /// Speed of both polarization axes (steps/s)
    #[serde(default = "default_polarization_speed")]
    pub polarization_speed: u32,
    /// Acceleration applied to every axis
    #[serde(default = "default_acceleration")]
    pub acceleration: u32,
    /// Translation applied to move the stand into measurement position (degrees)
    #[serde(default = "default_stand_offset")]
    pub stand_offset_deg: f64,
}

/// Sweep sequencing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Settle delay after each stand rotation
    #[serde(default = "default_step_settle")]
    pub step_settle_ms: u64,
    /// What to do when the analyzer error queue is not empty
    #[serde(default)]
    pub error_policy: ErrorPolicy,
}

/// Configuration store location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// JSON file holding persisted options
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_serial_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_bus_timeout() -> u64 {
    30_000
}

fn default_vna_bus() -> String {
    "GPIB".to_string()
}

fn default_vna_timeout() -> u64 {
    60_000
}

fn default_vna_settle() -> u64 {
    1000
}

fn default_save_state() -> u64 {
    2000
}

fn default_stand_speed() -> u32 {
    1500
}

fn default_translation_speed() -> u32 {
    5000
}

fn default_polarization_speed() -> u32 {
    2500
}

fn default_acceleration() -> u32 {
    1
}

fn default_stand_offset() -> f64 {
    -650.0
}

fn default_step_settle() -> u64 {
    250
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/config_options.json")
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for MotorBusConfig {
    fn default() -> Self {
        Self {
            port: default_serial_port(),
            baud_rate: default_baud_rate(),
            timeout_ms: default_bus_timeout(),
        }
    }
}

impl Default for VnaConfig {
    fn default() -> Self {
        Self {
            resource: None,
            bus: default_vna_bus(),
            timeout_ms: default_vna_timeout(),
            settle_ms: default_vna_settle(),
            save_state_ms: default_save_state(),
        }
    }
}

impl Default for MotorTuning {
    fn default() -> Self {
        Self {
            stand_speed: default_stand_speed(),
            translation_speed: default_translation_speed(),
            polarization_speed: default_polarization_speed(),
            acceleration: default_acceleration(),
            stand_offset_deg: default_stand_offset(),
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            step_settle_ms: default_step_settle(),
            error_policy: ErrorPolicy::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl MotorBusConfig {
    /// Acknowledgement timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl VnaConfig {
    /// Query timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl SweepConfig {
    /// Per-step settle delay as a `Duration`.
    pub fn step_settle(&self) -> Duration {
        Duration::from_millis(self.step_settle_ms)
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from `config/chamber.toml` and environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error: defaults and environment overrides still apply.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file is malformed or validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("CHAMBER_").split("__"))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Motor speeds are within 1..=6000 and acceleration within 1..=127
    /// - Serial port name is not empty
    /// - All timeouts are non-zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.motor_bus.port.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "motor_bus.port cannot be empty".to_string(),
            ));
        }

        let speeds = [
            ("stand_speed", self.motors.stand_speed),
            ("translation_speed", self.motors.translation_speed),
            ("polarization_speed", self.motors.polarization_speed),
        ];
        for (name, speed) in speeds {
            if !SPEED_RANGE.contains(&speed) {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid motors.{} {}. Must be {}-{}",
                    name,
                    speed,
                    SPEED_RANGE.start(),
                    SPEED_RANGE.end()
                )));
            }
        }

        if !ACCELERATION_RANGE.contains(&self.motors.acceleration) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid motors.acceleration {}. Must be {}-{}",
                self.motors.acceleration,
                ACCELERATION_RANGE.start(),
                ACCELERATION_RANGE.end()
            )));
        }

        if !self.motors.stand_offset_deg.is_finite() {
            return Err(ConfigError::ValidationError(
                "motors.stand_offset_deg must be a finite number".to_string(),
            ));
        }

        if self.motor_bus.timeout_ms == 0 || self.vna.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "Timeouts must be greater than zero".to_string(),
            ));
        }

        if self.vna.bus.trim().is_empty() && self.vna.resource.is_none() {
            return Err(ConfigError::ValidationError(
                "Either vna.resource or vna.bus must be set".to_string(),
            ));
        }

        Ok(())
    }
}
