//! # Stage Simulation Core Library
//!
//! This crate implements a virtual motorized-stage setup for developing and
//! testing chip alignment workflows without hardware. It models the
//! kinematics of fiber-positioning stages (bounded axes, trapezoidal
//! velocity profiles) and the coordinate calibration that relates each
//! stage's native frame to the chip under test. Time only advances when the
//! embedder ticks the simulation, so runs are fully reproducible.
//!
//! ## Crate Structure
//!
//! The library is organized into several modules, each with a distinct
//! responsibility:
//!
//! - **`axis`**: Per-axis travel bounds and trapezoidal trajectory planning.
//! - **`config`**: Layered configuration loading (TOML file plus environment
//!   overrides) via Figment. See `config::SimConfig`.
//! - **`error`**: The central `SimError` enum shared across the crate.
//! - **`logging`**: Structured logging setup on top of `tracing`.
//! - **`registry`**: Id-keyed ownership of stages plus built-in stage models.
//! - **`scheduler`**: Caller-driven advancement of in-flight moves and the
//!   move lifecycle (planned, running, completed, faulted, cancelled).
//! - **`simulation`**: The `Simulation` facade embedders interact with,
//!   including the position update broadcast channel.
//! - **`stage`**: The virtual stage itself: axes, calibration and motion
//!   status with atomic command validation.
//! - **`transform`**: Stage-to-chip coordinate calibration, from a single
//!   offset pairing up to a least-squares affine fit, with JSON persistence.

pub mod axis;
pub mod config;
pub mod error;
pub mod logging;
pub mod registry;
pub mod scheduler;
pub mod simulation;
pub mod stage;
pub mod transform;
