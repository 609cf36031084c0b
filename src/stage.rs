//! Virtual motorized stage: axes, calibration and motion status.
//!
//! A [`VirtualStage`] owns one to three [`Axis`] models and a
//! [`CalibrationTransform`] relating its native frame to the chip frame.
//! Commands are validated atomically: a move either yields trajectories for
//! every axis or leaves the stage untouched. The stage itself never advances
//! time; the scheduler samples the returned [`MovePlan`] and commits
//! positions back.

use std::fmt;

use nalgebra::Point3;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::axis::{Axis, AxisSpec, Trajectory};
use crate::error::{SimError, SimResult};
use crate::transform::{
    CalibrationReport, CalibrationSettings, CalibrationTransform, Frame, Pairing,
};

/// Largest number of axes a stage may carry.
pub const MAX_AXES: usize = 3;

/// What a stage is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MotionStatus {
    /// Ready to accept a move.
    Idle,
    /// A move is in progress.
    Moving,
    /// A runtime fault latched; requires a reset before new moves.
    Faulted,
}

impl fmt::Display for MotionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MotionStatus::Idle => write!(f, "idle"),
            MotionStatus::Moving => write!(f, "moving"),
            MotionStatus::Faulted => write!(f, "faulted"),
        }
    }
}

/// Per-axis trajectories for one accepted move command.
#[derive(Debug, Clone)]
pub struct MovePlan {
    trajectories: Vec<Trajectory>,
    duration_s: f64,
}

impl MovePlan {
    /// One trajectory per stage axis, in axis order.
    pub fn trajectories(&self) -> &[Trajectory] {
        &self.trajectories
    }

    /// Duration of the slowest axis trajectory, seconds.
    pub fn duration_s(&self) -> f64 {
        self.duration_s
    }
}

/// A virtual motorized positioning stage.
#[derive(Debug)]
pub struct VirtualStage {
    id: String,
    axes: Vec<Axis>,
    transform: CalibrationTransform,
    status: MotionStatus,
}

impl VirtualStage {
    /// Builds an idle, uncalibrated stage from per-axis specs.
    ///
    /// A stage carries between one and [`MAX_AXES`] axes; every spec is
    /// validated before any axis is constructed.
    pub fn new(id: impl Into<String>, specs: Vec<AxisSpec>) -> SimResult<Self> {
        let id = id.into();
        if specs.is_empty() || specs.len() > MAX_AXES {
            return Err(SimError::Configuration(format!(
                "stage '{}' must have between 1 and {} axes, got {}",
                id,
                MAX_AXES,
                specs.len()
            )));
        }
        let axes = specs
            .into_iter()
            .map(Axis::new)
            .collect::<SimResult<Vec<_>>>()?;
        Ok(Self {
            id,
            axes,
            transform: CalibrationTransform::identity(),
            status: MotionStatus::Idle,
        })
    }

    /// Unique stage identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The stage's axes in order.
    pub fn axes(&self) -> &[Axis] {
        &self.axes
    }

    /// Number of axes on this stage.
    pub fn axis_count(&self) -> usize {
        self.axes.len()
    }

    /// Current motion status.
    pub fn status(&self) -> MotionStatus {
        self.status
    }

    /// The calibration currently in effect.
    pub fn transform(&self) -> &CalibrationTransform {
        &self.transform
    }

    /// Current position in the requested frame.
    ///
    /// Stages with fewer than three axes report zero for the missing
    /// components.
    pub fn current_position(&self, frame: Frame) -> Point3<f64> {
        let native = self.native_position();
        match frame {
            Frame::Native => native,
            Frame::Chip => self.transform.to_chip(native),
        }
    }

    /// Per-axis native positions, micrometers.
    pub fn native_positions(&self) -> Vec<f64> {
        self.axes.iter().map(Axis::position_um).collect()
    }

    /// Validates and plans a move to `target`, marking the stage as moving.
    ///
    /// Chip-frame targets are converted through the calibration first. All
    /// axis targets and the speed are checked before anything changes; on
    /// error the stage stays idle at its current position. `speed` of `None`
    /// commands each axis at its own velocity limit.
    pub fn begin_move(
        &mut self,
        target: Point3<f64>,
        frame: Frame,
        speed_um_s: Option<f64>,
    ) -> SimResult<MovePlan> {
        self.ensure_commandable()?;

        let native_target = match frame {
            Frame::Native => target,
            Frame::Chip => self.transform.to_native(target),
        };
        let components = [native_target.x, native_target.y, native_target.z];

        // Plan every axis before touching any state so a rejection on a
        // later axis cannot leave a partial move behind.
        let trajectories = self
            .axes
            .iter()
            .enumerate()
            .map(|(i, axis)| {
                let speed = speed_um_s.unwrap_or(axis.spec().max_velocity_um_s);
                axis.plan_move(components[i], speed)
            })
            .collect::<SimResult<Vec<_>>>()?;

        let duration_s = trajectories
            .iter()
            .map(Trajectory::duration_s)
            .fold(0.0_f64, f64::max);

        self.status = MotionStatus::Moving;
        info!(
            stage = %self.id,
            frame = %frame,
            target_x = target.x,
            target_y = target.y,
            target_z = target.z,
            duration_s,
            "move accepted"
        );
        Ok(MovePlan {
            trajectories,
            duration_s,
        })
    }

    /// Replaces the calibration with a fresh fit over `pairings`.
    ///
    /// Rejected while the stage is moving or faulted. A fit whose residuals
    /// exceed the warning threshold is still applied but logged.
    pub fn calibrate(
        &mut self,
        pairings: &[Pairing],
        settings: &CalibrationSettings,
    ) -> SimResult<CalibrationReport> {
        self.ensure_commandable()?;
        let (transform, report) = CalibrationTransform::fit(pairings, settings)?;
        if report.is_poor(settings) {
            warn!(
                stage = %self.id,
                rms_um = report.rms_um,
                max_um = report.max_um,
                "calibration accepted with poor residuals"
            );
        }
        self.transform = transform;
        info!(
            stage = %self.id,
            pairings = pairings.len(),
            rms_um = report.rms_um,
            "stage calibrated"
        );
        Ok(report)
    }

    /// Records one coordinate pairing, upgrading the calibration stepwise.
    ///
    /// See [`CalibrationTransform::add_pairing`] for the upgrade rules.
    pub fn add_pairing(
        &mut self,
        pairing: Pairing,
        settings: &CalibrationSettings,
    ) -> SimResult<Option<CalibrationReport>> {
        self.ensure_commandable()?;
        let report = self.transform.add_pairing(pairing, settings)?;
        if let Some(ref r) = report {
            if r.is_poor(settings) {
                warn!(
                    stage = %self.id,
                    rms_um = r.rms_um,
                    "pairing accepted with poor residuals"
                );
            }
        }
        Ok(report)
    }

    /// Installs a transform restored from disk.
    pub fn set_transform(&mut self, transform: CalibrationTransform) -> SimResult<()> {
        self.ensure_commandable()?;
        self.transform = transform;
        Ok(())
    }

    /// Clears a latched fault; a no-op when already idle.
    pub fn reset(&mut self) -> SimResult<()> {
        match self.status {
            MotionStatus::Idle => Ok(()),
            MotionStatus::Moving => Err(SimError::StageBusy {
                id: self.id.clone(),
            }),
            MotionStatus::Faulted => {
                self.status = MotionStatus::Idle;
                info!(stage = %self.id, "fault cleared");
                Ok(())
            }
        }
    }

    pub(crate) fn set_status(&mut self, status: MotionStatus) {
        self.status = status;
    }

    /// Writes sampled positions back to the axes, one value per axis.
    pub(crate) fn commit_positions(&mut self, positions_um: &[f64]) {
        for (axis, &position) in self.axes.iter_mut().zip(positions_um) {
            axis.set_position_um(position);
        }
    }

    fn native_position(&self) -> Point3<f64> {
        let p = |i: usize| self.axes.get(i).map_or(0.0, Axis::position_um);
        Point3::new(p(0), p(1), p(2))
    }

    fn ensure_commandable(&self) -> SimResult<()> {
        match self.status {
            MotionStatus::Idle => Ok(()),
            MotionStatus::Moving => Err(SimError::StageBusy {
                id: self.id.clone(),
            }),
            MotionStatus::Faulted => Err(SimError::FaultedStage {
                id: self.id.clone(),
            }),
        }
    }
}
