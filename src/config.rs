//! Layered configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. simulation.toml file (base configuration)
//! 2. Environment variables (prefixed with STAGE_SIM_)
//!
//! Every key has a sensible default, so the simulator also runs without a
//! config file. Nested keys contain underscores themselves, so environment
//! overrides use a double underscore as the section separator, e.g.
//! `STAGE_SIM_MOTION__TICK_INTERVAL=50ms`.
//!
//! # Example
//! ```no_run
//! use stage_sim::config::SimConfig;
//!
//! # fn main() -> Result<(), figment::Error> {
//! let config = SimConfig::load()?;
//! println!("Application: {}", config.application.name);
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::axis::{
    MotionDefaults, DEFAULT_ACCELERATION_UM_S2, DEFAULT_SPEED_XY_UM_S, DEFAULT_SPEED_Z_UM_S,
};
use crate::registry::StageModel;
use crate::transform::CalibrationSettings;

/// Path the simulator reads when no config file is given explicitly.
pub const DEFAULT_CONFIG_PATH: &str = "config/simulation.toml";

/// Top-level simulator configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SimConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Motion defaults and scheduler settings
    pub motion: MotionConfig,
    /// Calibration fit thresholds
    pub calibration: CalibrationConfig,
    /// Stages created at startup
    pub stages: Vec<StageDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
        }
    }
}

/// Motion defaults and scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionConfig {
    /// Default speed for x/y axes in micrometers per second
    #[serde(default = "default_speed_xy")]
    pub default_speed_xy_um_s: f64,
    /// Default speed for z axes in micrometers per second
    #[serde(default = "default_speed_z")]
    pub default_speed_z_um_s: f64,
    /// Acceleration magnitude in micrometers per second squared
    #[serde(default = "default_acceleration")]
    pub default_acceleration_um_s2: f64,
    /// Distance from target below which a move counts as complete, micrometers
    #[serde(default = "default_position_tolerance")]
    pub position_tolerance_um: f64,
    /// Wall-clock interval between scheduler ticks in the console frontend
    #[serde(with = "humantime_serde", default = "default_tick_interval")]
    pub tick_interval: Duration,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            default_speed_xy_um_s: default_speed_xy(),
            default_speed_z_um_s: default_speed_z(),
            default_acceleration_um_s2: default_acceleration(),
            position_tolerance_um: default_position_tolerance(),
            tick_interval: default_tick_interval(),
        }
    }
}

impl MotionConfig {
    /// The motion defaults handed to stage models and move commands.
    pub fn defaults(&self) -> MotionDefaults {
        MotionDefaults {
            speed_xy_um_s: self.default_speed_xy_um_s,
            speed_z_um_s: self.default_speed_z_um_s,
            acceleration_um_s2: self.default_acceleration_um_s2,
        }
    }
}

/// Calibration fit thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Condition numbers above this reject a fit as degenerate
    #[serde(default = "default_condition_limit")]
    pub condition_limit: f64,
    /// RMS residual in micrometers above which a fit is logged as poor
    #[serde(default = "default_residual_warn")]
    pub residual_warn_um: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            condition_limit: default_condition_limit(),
            residual_warn_um: default_residual_warn(),
        }
    }
}

impl CalibrationConfig {
    /// The settings handed to calibration fits.
    pub fn settings(&self) -> CalibrationSettings {
        CalibrationSettings {
            condition_limit: self.condition_limit,
            residual_warn_um: self.residual_warn_um,
        }
    }
}

/// Stage definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Unique stage identifier
    pub id: String,
    /// Built-in stage model to instantiate
    pub model: StageModel,
    /// Whether this stage is created at startup
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_app_name() -> String {
    "stage-sim".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_speed_xy() -> f64 {
    DEFAULT_SPEED_XY_UM_S
}

fn default_speed_z() -> f64 {
    DEFAULT_SPEED_Z_UM_S
}

fn default_acceleration() -> f64 {
    DEFAULT_ACCELERATION_UM_S2
}

fn default_position_tolerance() -> f64 {
    0.01
}

fn default_tick_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_condition_limit() -> f64 {
    1e8
}

fn default_residual_warn() -> f64 {
    1.0
}

fn default_enabled() -> bool {
    true
}

impl SimConfig {
    /// Load configuration from simulation.toml and environment variables
    ///
    /// Environment variables can override configuration with prefix STAGE_SIM_
    /// Example: STAGE_SIM_APPLICATION__LOG_LEVEL=debug
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("STAGE_SIM_").split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        // Validate motion values
        let positive = [
            ("default_speed_xy_um_s", self.motion.default_speed_xy_um_s),
            ("default_speed_z_um_s", self.motion.default_speed_z_um_s),
            (
                "default_acceleration_um_s2",
                self.motion.default_acceleration_um_s2,
            ),
            ("position_tolerance_um", self.motion.position_tolerance_um),
        ];
        for (key, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(format!("Invalid {key} {value}. Must be finite and positive"));
            }
        }
        if self.motion.tick_interval.is_zero() {
            return Err("Invalid tick_interval. Must be non-zero".to_string());
        }

        // Validate calibration thresholds
        if !self.calibration.condition_limit.is_finite() || self.calibration.condition_limit <= 1.0
        {
            return Err(format!(
                "Invalid condition_limit {}. Must be finite and above 1",
                self.calibration.condition_limit
            ));
        }
        if !self.calibration.residual_warn_um.is_finite()
            || self.calibration.residual_warn_um <= 0.0
        {
            return Err(format!(
                "Invalid residual_warn_um {}. Must be finite and positive",
                self.calibration.residual_warn_um
            ));
        }

        // Validate stage IDs are unique
        let mut ids = std::collections::HashSet::new();
        for stage in &self.stages {
            if stage.id.trim().is_empty() {
                return Err("Stage ID must not be empty".to_string());
            }
            if !ids.insert(&stage.id) {
                return Err(format!("Duplicate stage ID: {}", stage.id));
            }
        }

        Ok(())
    }

    /// Get all enabled stages
    pub fn enabled_stages(&self) -> Vec<&StageDefinition> {
        self.stages.iter().filter(|stage| stage.enabled).collect()
    }
}
