//! Caller-driven motion scheduler.
//!
//! Accepted moves are handed to the [`MotionScheduler`], which advances them
//! in discrete time steps. Nothing moves between calls to
//! [`tick`](MotionScheduler::tick): the caller owns the clock, which makes
//! runs reproducible and lets a frontend scale simulated time freely.
//!
//! A move passes through `Planned -> Running` and ends in exactly one of
//! `Completed`, `Faulted` or `Cancelled`. Terminal states are kept per stage
//! until the next move replaces them, so a caller can always ask how the
//! last command ended.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::axis::Trajectory;
use crate::error::{SimError, SimResult};
use crate::registry::StageRegistry;
use crate::stage::{MotionStatus, MovePlan};

/// Lifecycle state of one scheduled move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MoveState {
    /// Accepted but not yet advanced by a tick.
    Planned,
    /// Currently being advanced.
    Running,
    /// Reached its target within tolerance.
    Completed,
    /// A runtime fault stopped the move; the stage latched Faulted.
    Faulted,
    /// Cancelled on request before reaching the target.
    Cancelled,
}

impl MoveState {
    /// Whether this state ends the move.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MoveState::Completed | MoveState::Faulted | MoveState::Cancelled
        )
    }
}

impl fmt::Display for MoveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MoveState::Planned => write!(f, "planned"),
            MoveState::Running => write!(f, "running"),
            MoveState::Completed => write!(f, "completed"),
            MoveState::Faulted => write!(f, "faulted"),
            MoveState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Snapshot of a stage's native axis positions after a tick.
#[derive(Debug, Clone, Serialize)]
pub struct PositionUpdate {
    /// Stage the update belongs to.
    pub stage_id: String,
    /// Native per-axis positions, micrometers.
    pub positions_um: Vec<f64>,
    /// Simulated time at the end of the tick, seconds.
    pub sim_time_s: f64,
    /// Wall-clock time the tick was processed.
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct ScheduledMove {
    trajectories: Vec<Trajectory>,
    state: MoveState,
    elapsed_s: f64,
    cancel_requested: bool,
    issued_at: DateTime<Utc>,
}

/// Advances accepted moves in caller-controlled time steps.
#[derive(Debug)]
pub struct MotionScheduler {
    /// In-flight moves, keyed by stage id. A stage has at most one.
    active: HashMap<String, ScheduledMove>,
    /// Terminal state of each stage's most recent move.
    outcomes: HashMap<String, MoveState>,
    sim_time_s: f64,
    tolerance_um: f64,
}

impl MotionScheduler {
    /// Creates a scheduler that completes moves within `tolerance_um` of target.
    pub fn new(tolerance_um: f64) -> Self {
        Self {
            active: HashMap::new(),
            outcomes: HashMap::new(),
            sim_time_s: 0.0,
            tolerance_um,
        }
    }

    /// Total simulated time advanced so far, seconds.
    pub fn sim_time_s(&self) -> f64 {
        self.sim_time_s
    }

    /// Registers an accepted move for ticking.
    ///
    /// The stage must already be marked moving; its previous outcome is
    /// superseded.
    pub fn submit(&mut self, stage_id: impl Into<String>, plan: MovePlan) {
        let stage_id = stage_id.into();
        self.outcomes.remove(&stage_id);
        debug!(
            stage = %stage_id,
            duration_s = plan.duration_s(),
            "move scheduled"
        );
        self.active.insert(
            stage_id,
            ScheduledMove {
                trajectories: plan.trajectories().to_vec(),
                state: MoveState::Planned,
                elapsed_s: 0.0,
                cancel_requested: false,
                issued_at: Utc::now(),
            },
        );
    }

    /// Flags the stage's in-flight move for cancellation.
    ///
    /// Takes effect on the next tick; returns whether a move was in flight.
    pub fn request_cancel(&mut self, stage_id: &str) -> bool {
        match self.active.get_mut(stage_id) {
            Some(mv) => {
                mv.cancel_requested = true;
                true
            }
            None => false,
        }
    }

    /// State of the stage's current or most recent move, if any.
    pub fn move_state(&self, stage_id: &str) -> Option<MoveState> {
        self.active
            .get(stage_id)
            .map(|mv| mv.state)
            .or_else(|| self.outcomes.get(stage_id).copied())
    }

    /// Drops all bookkeeping for a stage, e.g. after it is removed.
    pub fn forget(&mut self, stage_id: &str) {
        self.active.remove(stage_id);
        self.outcomes.remove(stage_id);
    }

    /// Advances every in-flight move by `dt_s` seconds of simulated time.
    ///
    /// Returns one [`PositionUpdate`] per stage whose position changed this
    /// tick. Cancellation is honored before sampling; a sampled position
    /// outside its axis bounds faults the stage without committing the bad
    /// position.
    pub fn tick(
        &mut self,
        dt_s: f64,
        registry: &mut StageRegistry,
    ) -> SimResult<Vec<PositionUpdate>> {
        if !dt_s.is_finite() || dt_s <= 0.0 {
            return Err(SimError::InvalidTimeStep { dt: dt_s });
        }
        self.sim_time_s += dt_s;
        let timestamp = Utc::now();

        let mut updates = Vec::new();
        let mut resolved = Vec::new();

        for (stage_id, mv) in self.active.iter_mut() {
            let stage = match registry.get_mut(stage_id) {
                Ok(stage) => stage,
                Err(_) => {
                    warn!(stage = %stage_id, "dropping move for vanished stage");
                    mv.state = MoveState::Cancelled;
                    resolved.push(stage_id.clone());
                    continue;
                }
            };

            if mv.cancel_requested {
                mv.state = MoveState::Cancelled;
                stage.set_status(MotionStatus::Idle);
                debug!(
                    stage = %stage_id,
                    elapsed_s = mv.elapsed_s,
                    issued_at = %mv.issued_at,
                    "move cancelled"
                );
                resolved.push(stage_id.clone());
                continue;
            }

            if mv.state == MoveState::Planned {
                mv.state = MoveState::Running;
            }
            mv.elapsed_s += dt_s;

            let samples: Vec<f64> = mv
                .trajectories
                .iter()
                .map(|t| t.sample(mv.elapsed_s))
                .collect();

            // Targets were validated when the move was planned, so a sample
            // outside the travel limits means the profile itself is broken.
            let out_of_bounds = stage
                .axes()
                .iter()
                .zip(samples.iter())
                .any(|(axis, sample)| axis.validate_target(*sample).is_err());
            if out_of_bounds {
                mv.state = MoveState::Faulted;
                stage.set_status(MotionStatus::Faulted);
                warn!(
                    stage = %stage_id,
                    elapsed_s = mv.elapsed_s,
                    "sampled position left axis bounds, stage faulted"
                );
                resolved.push(stage_id.clone());
                continue;
            }

            let within_tolerance = mv
                .trajectories
                .iter()
                .zip(samples.iter())
                .all(|(t, sample)| (sample - t.target_um()).abs() <= self.tolerance_um);

            let positions_um = if within_tolerance {
                // Snap to the exact targets so sampling error never lingers
                // in the committed position.
                let finals: Vec<f64> =
                    mv.trajectories.iter().map(Trajectory::target_um).collect();
                stage.commit_positions(&finals);
                stage.set_status(MotionStatus::Idle);
                mv.state = MoveState::Completed;
                debug!(stage = %stage_id, elapsed_s = mv.elapsed_s, "move completed");
                resolved.push(stage_id.clone());
                finals
            } else {
                stage.commit_positions(&samples);
                samples
            };

            updates.push(PositionUpdate {
                stage_id: stage_id.clone(),
                positions_um,
                sim_time_s: self.sim_time_s,
                timestamp,
            });
        }

        for stage_id in resolved {
            if let Some(mv) = self.active.remove(&stage_id) {
                self.outcomes.insert(stage_id, mv.state);
            }
        }

        Ok(updates)
    }
}
