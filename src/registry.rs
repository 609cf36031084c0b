//! Registry of virtual stages keyed by their unique identifier.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::axis::{AxisSpec, MotionDefaults};
use crate::error::{SimError, SimResult};
use crate::stage::{MotionStatus, VirtualStage};
use crate::transform::TransformKind;

/// Built-in stage archetypes with realistic travel ranges.
///
/// Velocity limits and acceleration are taken from the configured
/// [`MotionDefaults`], so a stage's default speed and its limit coincide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageModel {
    /// Three-axis fiber positioner: +/-50 mm horizontal travel, +/-20 mm vertical.
    FiberPositioner,
    /// Two-axis planar stage without a vertical axis.
    PlanarXy,
    /// Single-axis rail with 100 mm of travel from its home position.
    LinearRail,
}

impl StageModel {
    /// Axis specs for this model under the given motion defaults.
    pub fn axis_specs(&self, defaults: &MotionDefaults) -> Vec<AxisSpec> {
        let xy = |label: &str| {
            AxisSpec::new(
                label,
                -50_000.0,
                50_000.0,
                defaults.speed_xy_um_s,
                defaults.acceleration_um_s2,
            )
        };
        match self {
            StageModel::FiberPositioner => vec![
                xy("x"),
                xy("y"),
                AxisSpec::new(
                    "z",
                    -20_000.0,
                    20_000.0,
                    defaults.speed_z_um_s,
                    defaults.acceleration_um_s2,
                ),
            ],
            StageModel::PlanarXy => vec![xy("x"), xy("y")],
            StageModel::LinearRail => vec![AxisSpec::new(
                "x",
                0.0,
                100_000.0,
                defaults.speed_xy_um_s,
                defaults.acceleration_um_s2,
            )],
        }
    }
}

impl fmt::Display for StageModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageModel::FiberPositioner => write!(f, "fiber_positioner"),
            StageModel::PlanarXy => write!(f, "planar_xy"),
            StageModel::LinearRail => write!(f, "linear_rail"),
        }
    }
}

impl FromStr for StageModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fiber_positioner" => Ok(StageModel::FiberPositioner),
            "planar_xy" => Ok(StageModel::PlanarXy),
            "linear_rail" => Ok(StageModel::LinearRail),
            other => Err(format!(
                "unknown stage model '{other}' (expected fiber_positioner, planar_xy or linear_rail)"
            )),
        }
    }
}

/// Summary row describing one registered stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageInfo {
    /// Unique stage identifier.
    pub id: String,
    /// Axis labels in order.
    pub axes: Vec<String>,
    /// Current motion status.
    pub status: MotionStatus,
    /// Calibration stage the transform has reached.
    pub transform: TransformKind,
    /// Number of recorded coordinate pairings.
    pub pairings: usize,
}

/// Owns every [`VirtualStage`] in the simulation, keyed by id.
#[derive(Debug, Default)]
pub struct StageRegistry {
    stages: HashMap<String, VirtualStage>,
}

impl StageRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and registers a stage with explicit axis specs.
    pub fn create_stage(
        &mut self,
        id: impl Into<String>,
        specs: Vec<AxisSpec>,
    ) -> SimResult<&mut VirtualStage> {
        let id = id.into();
        if self.stages.contains_key(&id) {
            return Err(SimError::DuplicateStage { id });
        }
        let stage = VirtualStage::new(id.clone(), specs)?;
        info!(stage = %id, axes = stage.axis_count(), "stage registered");
        Ok(self.stages.entry(id).or_insert(stage))
    }

    /// Creates and registers a stage from a built-in model.
    pub fn create_stage_from_model(
        &mut self,
        id: impl Into<String>,
        model: StageModel,
        defaults: &MotionDefaults,
    ) -> SimResult<&mut VirtualStage> {
        self.create_stage(id, model.axis_specs(defaults))
    }

    /// Looks up a stage by id.
    pub fn get(&self, id: &str) -> SimResult<&VirtualStage> {
        self.stages.get(id).ok_or_else(|| SimError::UnknownStage {
            id: id.to_string(),
        })
    }

    /// Looks up a stage by id for mutation.
    pub fn get_mut(&mut self, id: &str) -> SimResult<&mut VirtualStage> {
        self.stages
            .get_mut(id)
            .ok_or_else(|| SimError::UnknownStage {
                id: id.to_string(),
            })
    }

    /// Removes a stage, returning whether it existed.
    ///
    /// Removing an unknown id is not an error; repeated removes are no-ops.
    pub fn remove(&mut self, id: &str) -> bool {
        let removed = self.stages.remove(id).is_some();
        if removed {
            info!(stage = %id, "stage removed");
        } else {
            debug!(stage = %id, "remove of unknown stage ignored");
        }
        removed
    }

    /// Whether a stage with this id is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.stages.contains_key(id)
    }

    /// Number of registered stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Summaries for all registered stages, sorted by id.
    pub fn list(&self) -> Vec<StageInfo> {
        let mut infos: Vec<StageInfo> = self
            .stages
            .values()
            .map(|stage| StageInfo {
                id: stage.id().to_string(),
                axes: stage.axes().iter().map(|a| a.label().to_string()).collect(),
                status: stage.status(),
                transform: stage.transform().kind(),
                pairings: stage.transform().pairing_count(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }
}
