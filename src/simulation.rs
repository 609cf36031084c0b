//! Top-level simulation facade.
//!
//! [`Simulation`] owns the stage registry and the motion scheduler and is
//! the surface embedders talk to. Position updates produced by each tick
//! are both returned to the caller and fanned out over a broadcast channel,
//! so a frontend can render motion while another component records it.

use std::path::Path;

use nalgebra::{Point3, Vector3};
use tokio::sync::broadcast;
use tracing::info;

use crate::axis::{AxisSpec, MotionDefaults};
use crate::config::SimConfig;
use crate::error::SimResult;
use crate::registry::{StageInfo, StageModel, StageRegistry};
use crate::scheduler::{MotionScheduler, MoveState, PositionUpdate};
use crate::stage::MotionStatus;
use crate::transform::{CalibrationReport, CalibrationSettings, CalibrationTransform, Frame, Pairing};

/// Capacity of the position update broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A complete virtual motion setup: stages, scheduler and event fan-out.
pub struct Simulation {
    registry: StageRegistry,
    scheduler: MotionScheduler,
    defaults: MotionDefaults,
    calibration: CalibrationSettings,
    event_tx: broadcast::Sender<PositionUpdate>,
}

impl Simulation {
    /// Builds a simulation and creates every enabled stage from the config.
    pub fn new(config: &SimConfig) -> SimResult<Self> {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let mut sim = Self {
            registry: StageRegistry::new(),
            scheduler: MotionScheduler::new(config.motion.position_tolerance_um),
            defaults: config.motion.defaults(),
            calibration: config.calibration.settings(),
            event_tx,
        };
        for definition in config.enabled_stages() {
            sim.create_stage_from_model(&definition.id, definition.model)?;
        }
        info!(stages = sim.registry.len(), "simulation initialized");
        Ok(sim)
    }

    /// Creates a stage with explicit axis specs.
    pub fn create_stage(&mut self, id: &str, specs: Vec<AxisSpec>) -> SimResult<()> {
        self.registry.create_stage(id, specs)?;
        Ok(())
    }

    /// Creates a stage from a built-in model under the configured defaults.
    pub fn create_stage_from_model(&mut self, id: &str, model: StageModel) -> SimResult<()> {
        self.registry
            .create_stage_from_model(id, model, &self.defaults)?;
        Ok(())
    }

    /// Removes a stage and forgets its scheduled move, if any.
    ///
    /// Returns whether the stage existed; removing twice is a no-op.
    pub fn remove_stage(&mut self, id: &str) -> bool {
        let removed = self.registry.remove(id);
        if removed {
            self.scheduler.forget(id);
        }
        removed
    }

    /// Whether a stage with this id exists.
    pub fn has_stage(&self, id: &str) -> bool {
        self.registry.contains(id)
    }

    /// Summaries of all stages, sorted by id.
    pub fn list_stages(&self) -> Vec<StageInfo> {
        self.registry.list()
    }

    /// Current position of a stage in the requested frame.
    pub fn current_position(&self, id: &str, frame: Frame) -> SimResult<Point3<f64>> {
        Ok(self.registry.get(id)?.current_position(frame))
    }

    /// Current motion status of a stage.
    pub fn motion_status(&self, id: &str) -> SimResult<MotionStatus> {
        Ok(self.registry.get(id)?.status())
    }

    /// State of the stage's current or most recent move.
    ///
    /// `None` means no move has been commanded since the stage was created.
    pub fn move_state(&self, id: &str) -> SimResult<Option<MoveState>> {
        self.registry.get(id)?;
        Ok(self.scheduler.move_state(id))
    }

    /// Total simulated time advanced so far, seconds.
    pub fn sim_time_s(&self) -> f64 {
        self.scheduler.sim_time_s()
    }

    /// Commands an absolute move; the stage starts moving on the next tick.
    ///
    /// `speed_um_s` of `None` commands each axis at its own velocity limit.
    pub fn move_to(
        &mut self,
        id: &str,
        target: Point3<f64>,
        frame: Frame,
        speed_um_s: Option<f64>,
    ) -> SimResult<()> {
        let plan = self
            .registry
            .get_mut(id)?
            .begin_move(target, frame, speed_um_s)?;
        self.scheduler.submit(id, plan);
        Ok(())
    }

    /// Commands a move relative to the current position in the given frame.
    pub fn move_relative(
        &mut self,
        id: &str,
        delta: Vector3<f64>,
        frame: Frame,
        speed_um_s: Option<f64>,
    ) -> SimResult<()> {
        let stage = self.registry.get_mut(id)?;
        let target = stage.current_position(frame) + delta;
        let plan = stage.begin_move(target, frame, speed_um_s)?;
        self.scheduler.submit(id, plan);
        Ok(())
    }

    /// Requests cancellation of the stage's in-flight move.
    ///
    /// Returns whether a move was in flight; the cancellation itself takes
    /// effect on the next tick.
    pub fn cancel(&mut self, id: &str) -> SimResult<bool> {
        self.registry.get(id)?;
        Ok(self.scheduler.request_cancel(id))
    }

    /// Clears a latched fault on the stage.
    pub fn reset(&mut self, id: &str) -> SimResult<()> {
        self.registry.get_mut(id)?.reset()
    }

    /// Replaces the stage's calibration with a fresh fit over `pairings`.
    pub fn calibrate(&mut self, id: &str, pairings: &[Pairing]) -> SimResult<CalibrationReport> {
        let settings = self.calibration;
        self.registry.get_mut(id)?.calibrate(pairings, &settings)
    }

    /// Records one coordinate pairing on the stage.
    pub fn add_calibration_pairing(
        &mut self,
        id: &str,
        pairing: Pairing,
    ) -> SimResult<Option<CalibrationReport>> {
        let settings = self.calibration;
        self.registry.get_mut(id)?.add_pairing(pairing, &settings)
    }

    /// Writes the stage's calibration to a JSON file.
    pub fn save_calibration<P: AsRef<Path>>(&self, id: &str, path: P) -> SimResult<()> {
        self.registry.get(id)?.transform().save(path)
    }

    /// Restores a stage calibration previously saved to JSON.
    pub fn load_calibration<P: AsRef<Path>>(&mut self, id: &str, path: P) -> SimResult<()> {
        let stage = self.registry.get_mut(id)?;
        let transform = CalibrationTransform::load(path)?;
        stage.set_transform(transform)
    }

    /// Advances simulated time by `dt_s` seconds.
    ///
    /// Updates are broadcast to subscribers and returned to the caller.
    pub fn tick(&mut self, dt_s: f64) -> SimResult<Vec<PositionUpdate>> {
        let updates = self.scheduler.tick(dt_s, &mut self.registry)?;
        for update in &updates {
            // Send errors just mean nobody is subscribed right now.
            let _ = self.event_tx.send(update.clone());
        }
        Ok(updates)
    }

    /// Subscribe to position updates produced by future ticks.
    pub fn subscribe(&self) -> broadcast::Receiver<PositionUpdate> {
        self.event_tx.subscribe()
    }
}
