//! Custom error types for the simulation engine.
//!
//! This module defines the primary error type, `SimError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to
//! handle the different kinds of errors that can occur, from I/O and
//! configuration issues to kinematic and calibration problems.
//!
//! ## Error Hierarchy
//!
//! `SimError` is an enum that consolidates various error sources:
//!
//! - **`Config`**: Wraps errors from the `figment` crate, typically related to
//!   file parsing or format issues in the configuration files.
//! - **`Configuration`**: Represents semantic errors in the configuration, such
//!   as values that pass parsing but are logically incorrect (e.g., a tolerance
//!   of zero). These are caught during the validation step.
//! - **`Io`** / **`Json`**: Wrap `std::io::Error` and `serde_json::Error` for
//!   calibration import/export.
//! - **`DuplicateStage`** / **`UnknownStage`**: Registry lookups and stage
//!   creation with an already-used identifier.
//! - **`DegenerateCalibration`**: The supplied correspondence points are
//!   collinear, duplicated, or too few to determine a transformation, or the
//!   least-squares system is ill-conditioned.
//! - **`OutOfBounds`** / **`InvalidSpeed`**: Kinematic validation failures.
//!   These are raised before any axis state changes, so a rejected move leaves
//!   the stage exactly where it was.
//! - **`StageBusy`** / **`FaultedStage`**: Lifecycle gating. A stage executes
//!   one move at a time, and a faulted stage refuses everything except a reset.
//!
//! By using `#[from]`, `SimError` can be seamlessly created from underlying
//! error types, simplifying error handling throughout the crate with the `?`
//! operator.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type SimResult<T> = std::result::Result<T, SimError>;

/// Unified error type for registry, calibration, kinematics, and scheduling.
#[derive(Error, Debug)]
pub enum SimError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Stage '{id}' is already registered")]
    DuplicateStage { id: String },

    #[error("No stage registered under '{id}'")]
    UnknownStage { id: String },

    #[error("Degenerate calibration: {reason} (condition number {condition:.3e})")]
    DegenerateCalibration { reason: String, condition: f64 },

    #[error("Target {target:.3} um on axis '{axis}' is outside [{min:.3}, {max:.3}] um")]
    OutOfBounds {
        axis: String,
        target: f64,
        min: f64,
        max: f64,
    },

    #[error("Requested speed {requested:.3} um/s is invalid (axis maximum {max:.3} um/s)")]
    InvalidSpeed { requested: f64, max: f64 },

    #[error("Stage '{id}' is busy executing another move")]
    StageBusy { id: String },

    #[error("Stage '{id}' is faulted and must be reset before use")]
    FaultedStage { id: String },

    #[error("Invalid axis specification for '{label}': {reason}")]
    InvalidAxisSpec { label: String, reason: String },

    #[error("Invalid tick step {dt} s; dt must be finite and positive")]
    InvalidTimeStep { dt: f64 },
}
