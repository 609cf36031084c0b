//! Per-axis motion model: travel bounds and trapezoidal trajectory planning.
//!
//! An [`Axis`] pairs a static [`AxisSpec`] (bounds and kinematic limits) with
//! the current commanded position. Planning a move produces a [`Trajectory`],
//! a closed-form trapezoidal velocity profile that the scheduler samples at
//! its own cadence; the axis itself never advances time.

use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};

/// Default translational speed for horizontal (x/y) axes, micrometers per second.
pub const DEFAULT_SPEED_XY_UM_S: f64 = 200.0;

/// Default translational speed for vertical (z) axes, micrometers per second.
pub const DEFAULT_SPEED_Z_UM_S: f64 = 20.0;

/// Default acceleration magnitude, micrometers per second squared.
pub const DEFAULT_ACCELERATION_UM_S2: f64 = 50.0;

/// Speed and acceleration defaults applied when a command omits them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionDefaults {
    /// Speed for x/y axes when a move does not specify one, micrometers per second.
    pub speed_xy_um_s: f64,
    /// Speed for z axes when a move does not specify one, micrometers per second.
    pub speed_z_um_s: f64,
    /// Acceleration magnitude for all axes, micrometers per second squared.
    pub acceleration_um_s2: f64,
}

impl Default for MotionDefaults {
    fn default() -> Self {
        Self {
            speed_xy_um_s: DEFAULT_SPEED_XY_UM_S,
            speed_z_um_s: DEFAULT_SPEED_Z_UM_S,
            acceleration_um_s2: DEFAULT_ACCELERATION_UM_S2,
        }
    }
}

/// Static description of one stage axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisSpec {
    /// Short axis name, e.g. "x", "y", "z".
    pub label: String,
    /// Lower travel limit, micrometers.
    pub min_position_um: f64,
    /// Upper travel limit, micrometers.
    pub max_position_um: f64,
    /// Highest commandable speed, micrometers per second.
    pub max_velocity_um_s: f64,
    /// Acceleration magnitude used for every move, micrometers per second squared.
    pub max_acceleration_um_s2: f64,
    /// Position the axis starts at, micrometers.
    #[serde(default)]
    pub initial_position_um: f64,
}

impl AxisSpec {
    /// Creates a spec starting at position zero.
    pub fn new(
        label: impl Into<String>,
        min_position_um: f64,
        max_position_um: f64,
        max_velocity_um_s: f64,
        max_acceleration_um_s2: f64,
    ) -> Self {
        Self {
            label: label.into(),
            min_position_um,
            max_position_um,
            max_velocity_um_s,
            max_acceleration_um_s2,
            initial_position_um: 0.0,
        }
    }

    /// Returns the spec with a different starting position.
    pub fn with_initial_position(mut self, position_um: f64) -> Self {
        self.initial_position_um = position_um;
        self
    }

    /// Checks the spec for internal consistency.
    pub fn validate(&self) -> SimResult<()> {
        let fail = |reason: String| SimError::InvalidAxisSpec {
            label: self.label.clone(),
            reason,
        };
        if self.label.trim().is_empty() {
            return Err(fail("axis label must not be empty".into()));
        }
        if !self.min_position_um.is_finite() || !self.max_position_um.is_finite() {
            return Err(fail("travel limits must be finite".into()));
        }
        if self.min_position_um >= self.max_position_um {
            return Err(fail(format!(
                "min position {} must be below max position {}",
                self.min_position_um, self.max_position_um
            )));
        }
        if !(self.max_velocity_um_s.is_finite() && self.max_velocity_um_s > 0.0) {
            return Err(fail(format!(
                "max velocity {} must be finite and positive",
                self.max_velocity_um_s
            )));
        }
        if !(self.max_acceleration_um_s2.is_finite() && self.max_acceleration_um_s2 > 0.0) {
            return Err(fail(format!(
                "max acceleration {} must be finite and positive",
                self.max_acceleration_um_s2
            )));
        }
        if !self.initial_position_um.is_finite()
            || self.initial_position_um < self.min_position_um
            || self.initial_position_um > self.max_position_um
        {
            return Err(fail(format!(
                "initial position {} lies outside [{}, {}]",
                self.initial_position_um, self.min_position_um, self.max_position_um
            )));
        }
        Ok(())
    }
}

/// Runtime state of one axis: its spec plus the current position.
#[derive(Debug, Clone)]
pub struct Axis {
    spec: AxisSpec,
    position_um: f64,
}

impl Axis {
    /// Builds an axis from a validated spec, starting at its initial position.
    pub fn new(spec: AxisSpec) -> SimResult<Self> {
        spec.validate()?;
        let position_um = spec.initial_position_um;
        Ok(Self { spec, position_um })
    }

    /// The static spec this axis was built from.
    pub fn spec(&self) -> &AxisSpec {
        &self.spec
    }

    /// The axis label, e.g. "x".
    pub fn label(&self) -> &str {
        &self.spec.label
    }

    /// Current position, micrometers.
    pub fn position_um(&self) -> f64 {
        self.position_um
    }

    pub(crate) fn set_position_um(&mut self, position_um: f64) {
        self.position_um = position_um;
    }

    /// Rejects targets outside the travel limits.
    pub fn validate_target(&self, target_um: f64) -> SimResult<()> {
        if !target_um.is_finite()
            || target_um < self.spec.min_position_um
            || target_um > self.spec.max_position_um
        {
            return Err(SimError::OutOfBounds {
                axis: self.spec.label.clone(),
                target: target_um,
                min: self.spec.min_position_um,
                max: self.spec.max_position_um,
            });
        }
        Ok(())
    }

    /// Plans a trapezoidal move from the current position to `target_um`.
    ///
    /// The commanded speed must be positive and within the axis limit; the
    /// acceleration always comes from the spec.
    pub fn plan_move(&self, target_um: f64, speed_um_s: f64) -> SimResult<Trajectory> {
        self.validate_target(target_um)?;
        if !speed_um_s.is_finite() || speed_um_s <= 0.0 || speed_um_s > self.spec.max_velocity_um_s
        {
            return Err(SimError::InvalidSpeed {
                requested: speed_um_s,
                max: self.spec.max_velocity_um_s,
            });
        }
        Ok(Trajectory::plan(
            self.position_um,
            target_um,
            speed_um_s,
            self.spec.max_acceleration_um_s2,
        ))
    }
}

/// Closed-form trapezoidal velocity profile between two positions.
///
/// The profile accelerates at the axis limit, cruises at the commanded
/// speed, and decelerates symmetrically. Moves too short to reach the
/// commanded speed degenerate into a triangular profile that peaks at
/// `sqrt(accel * distance)`.
#[derive(Debug, Clone, Copy)]
pub struct Trajectory {
    start_um: f64,
    target_um: f64,
    /// +1.0 towards larger positions, -1.0 towards smaller, 0.0 for no move.
    direction: f64,
    acceleration_um_s2: f64,
    /// Peak velocity actually reached, which may be below the commanded speed.
    cruise_velocity_um_s: f64,
    t_accel_s: f64,
    t_cruise_s: f64,
    duration_s: f64,
}

impl Trajectory {
    pub(crate) fn plan(start_um: f64, target_um: f64, speed_um_s: f64, accel_um_s2: f64) -> Self {
        let distance = (target_um - start_um).abs();
        if distance == 0.0 {
            return Self {
                start_um,
                target_um,
                direction: 0.0,
                acceleration_um_s2: accel_um_s2,
                cruise_velocity_um_s: 0.0,
                t_accel_s: 0.0,
                t_cruise_s: 0.0,
                duration_s: 0.0,
            };
        }

        let direction = (target_um - start_um).signum();
        // Distance consumed by the symmetric accel + decel ramps at full speed.
        let ramp_distance = speed_um_s * speed_um_s / accel_um_s2;
        let (cruise_velocity_um_s, t_accel_s, t_cruise_s) = if distance >= ramp_distance {
            let t_accel = speed_um_s / accel_um_s2;
            let t_cruise = (distance - ramp_distance) / speed_um_s;
            (speed_um_s, t_accel, t_cruise)
        } else {
            // Triangular profile: never reaches the commanded speed.
            let peak = (accel_um_s2 * distance).sqrt();
            (peak, peak / accel_um_s2, 0.0)
        };

        Self {
            start_um,
            target_um,
            direction,
            acceleration_um_s2: accel_um_s2,
            cruise_velocity_um_s,
            t_accel_s,
            t_cruise_s,
            duration_s: 2.0 * t_accel_s + t_cruise_s,
        }
    }

    /// Position the profile starts from, micrometers.
    pub fn start_um(&self) -> f64 {
        self.start_um
    }

    /// Position the profile ends at, micrometers.
    pub fn target_um(&self) -> f64 {
        self.target_um
    }

    /// Total profile duration, seconds.
    pub fn duration_s(&self) -> f64 {
        self.duration_s
    }

    /// Peak velocity the profile reaches, micrometers per second.
    pub fn peak_velocity_um_s(&self) -> f64 {
        self.cruise_velocity_um_s
    }

    /// Position at elapsed time `t_s`, clamped to the profile endpoints.
    ///
    /// Sampling is monotonic in `t_s`; times at or beyond the duration
    /// return the exact target.
    pub fn sample(&self, t_s: f64) -> f64 {
        if t_s <= 0.0 {
            return self.start_um;
        }
        if t_s >= self.duration_s {
            return self.target_um;
        }

        let a = self.acceleration_um_s2;
        let v = self.cruise_velocity_um_s;
        let accel_distance = 0.5 * a * self.t_accel_s * self.t_accel_s;
        let decel_start = self.t_accel_s + self.t_cruise_s;

        let travelled = if t_s < self.t_accel_s {
            0.5 * a * t_s * t_s
        } else if t_s < decel_start {
            accel_distance + v * (t_s - self.t_accel_s)
        } else {
            let tau = t_s - decel_start;
            accel_distance + v * self.t_cruise_s + v * tau - 0.5 * a * tau * tau
        };

        self.start_um + self.direction * travelled
    }
}
