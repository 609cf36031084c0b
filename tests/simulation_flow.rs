//! End-to-end flows through the simulation facade: command, tick, query.

use approx::assert_relative_eq;
use nalgebra::{Point3, Vector3};
use stage_sim::axis::AxisSpec;
use stage_sim::config::SimConfig;
use stage_sim::error::SimError;
use stage_sim::registry::StageModel;
use stage_sim::scheduler::MoveState;
use stage_sim::simulation::Simulation;
use stage_sim::stage::MotionStatus;
use stage_sim::transform::{Frame, Pairing};

fn test_sim() -> Simulation {
    Simulation::new(&SimConfig::default()).unwrap()
}

/// Single axis over [0, 100] um at 10 um/s. The huge acceleration makes the
/// profile effectively constant-velocity, so expected positions are easy to
/// compute by hand.
fn bench_axis() -> Vec<AxisSpec> {
    vec![AxisSpec::new("x", 0.0, 100.0, 10.0, 1e6)]
}

fn run_until_idle(sim: &mut Simulation, id: &str, dt_s: f64) {
    for _ in 0..10_000 {
        if sim.motion_status(id).unwrap() != MotionStatus::Moving {
            return;
        }
        sim.tick(dt_s).unwrap();
    }
    panic!("stage '{id}' never went idle");
}

#[test]
fn move_advances_only_on_ticks_and_completes_in_tolerance() {
    let mut sim = test_sim();
    sim.create_stage("bench", bench_axis()).unwrap();

    sim.move_to("bench", Point3::new(50.0, 0.0, 0.0), Frame::Native, None)
        .unwrap();
    assert_eq!(sim.motion_status("bench").unwrap(), MotionStatus::Moving);
    assert_eq!(sim.move_state("bench").unwrap(), Some(MoveState::Planned));

    // Nothing moves without a tick.
    assert_relative_eq!(
        sim.current_position("bench", Frame::Native).unwrap().x,
        0.0
    );

    // 10 um/s: each 1 s tick advances 10 um.
    let updates = sim.tick(1.0).unwrap();
    assert_eq!(updates.len(), 1);
    assert_relative_eq!(updates[0].positions_um[0], 10.0, epsilon = 0.01);
    assert_eq!(sim.move_state("bench").unwrap(), Some(MoveState::Running));

    for _ in 0..3 {
        sim.tick(1.0).unwrap();
    }
    assert_eq!(sim.motion_status("bench").unwrap(), MotionStatus::Moving);

    // The fifth second reaches the target within tolerance and snaps exact.
    sim.tick(1.0).unwrap();
    assert_eq!(sim.motion_status("bench").unwrap(), MotionStatus::Idle);
    assert_eq!(sim.move_state("bench").unwrap(), Some(MoveState::Completed));
    assert_relative_eq!(
        sim.current_position("bench", Frame::Native).unwrap().x,
        50.0
    );
    assert_relative_eq!(sim.sim_time_s(), 5.0);
}

#[test]
fn busy_stage_rejects_overlapping_commands() {
    let mut sim = test_sim();
    sim.create_stage("bench", bench_axis()).unwrap();

    sim.move_to("bench", Point3::new(50.0, 0.0, 0.0), Frame::Native, None)
        .unwrap();
    sim.tick(1.0).unwrap();

    let err = sim
        .move_to("bench", Point3::new(10.0, 0.0, 0.0), Frame::Native, None)
        .unwrap_err();
    assert!(matches!(err, SimError::StageBusy { ref id } if id == "bench"));
    let err = sim
        .move_relative("bench", Vector3::new(1.0, 0.0, 0.0), Frame::Native, None)
        .unwrap_err();
    assert!(matches!(err, SimError::StageBusy { .. }));

    // The original command is unaffected by the rejected ones.
    run_until_idle(&mut sim, "bench", 1.0);
    assert_relative_eq!(
        sim.current_position("bench", Frame::Native).unwrap().x,
        50.0
    );
}

#[test]
fn cancelled_move_keeps_last_committed_position() {
    let mut sim = test_sim();
    sim.create_stage("bench", bench_axis()).unwrap();

    sim.move_to("bench", Point3::new(50.0, 0.0, 0.0), Frame::Native, None)
        .unwrap();
    for _ in 0..3 {
        sim.tick(1.0).unwrap();
    }
    let before = sim.current_position("bench", Frame::Native).unwrap().x;

    assert!(sim.cancel("bench").unwrap());
    sim.tick(1.0).unwrap();

    assert_eq!(sim.motion_status("bench").unwrap(), MotionStatus::Idle);
    assert_eq!(sim.move_state("bench").unwrap(), Some(MoveState::Cancelled));
    assert_relative_eq!(
        sim.current_position("bench", Frame::Native).unwrap().x,
        before
    );

    // Cancelling with nothing in flight reports false, and the stage
    // accepts new moves immediately.
    assert!(!sim.cancel("bench").unwrap());
    sim.move_to("bench", Point3::new(10.0, 0.0, 0.0), Frame::Native, None)
        .unwrap();
    run_until_idle(&mut sim, "bench", 1.0);
    assert_relative_eq!(
        sim.current_position("bench", Frame::Native).unwrap().x,
        10.0
    );
}

#[test]
fn rejected_commands_leave_no_trace() {
    let mut sim = test_sim();
    sim.create_stage("bench", bench_axis()).unwrap();

    let err = sim
        .move_to("bench", Point3::new(150.0, 0.0, 0.0), Frame::Native, None)
        .unwrap_err();
    assert!(matches!(err, SimError::OutOfBounds { .. }));

    assert_eq!(sim.motion_status("bench").unwrap(), MotionStatus::Idle);
    assert_eq!(sim.move_state("bench").unwrap(), None);
    assert!(sim.tick(1.0).unwrap().is_empty());
    assert_relative_eq!(
        sim.current_position("bench", Frame::Native).unwrap().x,
        0.0
    );
}

#[test]
fn duplicate_and_unknown_ids_are_reported() {
    let mut sim = test_sim();
    sim.create_stage_from_model("left", StageModel::PlanarXy)
        .unwrap();

    let err = sim
        .create_stage_from_model("left", StageModel::PlanarXy)
        .unwrap_err();
    assert!(matches!(err, SimError::DuplicateStage { ref id } if id == "left"));

    assert!(matches!(
        sim.current_position("ghost", Frame::Chip),
        Err(SimError::UnknownStage { .. })
    ));

    // Removal is idempotent and frees the id for reuse.
    assert!(sim.remove_stage("left"));
    assert!(!sim.remove_stage("left"));
    sim.create_stage_from_model("left", StageModel::PlanarXy)
        .unwrap();
}

#[test]
fn calibrated_chip_moves_land_on_chip_targets() {
    let mut sim = test_sim();
    sim.create_stage_from_model("left", StageModel::FiberPositioner)
        .unwrap();

    // Pure translation: chip = native + (10, -20, 5).
    let offset = Vector3::new(10.0, -20.0, 5.0);
    let pairings: Vec<Pairing> = [
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(1000.0, 0.0, 0.0),
        Point3::new(0.0, 1000.0, 0.0),
    ]
    .iter()
    .map(|&stage| Pairing::new(stage, stage + offset))
    .collect();

    let report = sim.calibrate("left", &pairings).unwrap();
    assert!(report.rms_um < 1e-9);

    sim.move_to("left", Point3::new(100.0, 50.0, 10.0), Frame::Chip, None)
        .unwrap();
    run_until_idle(&mut sim, "left", 0.1);

    let chip = sim.current_position("left", Frame::Chip).unwrap();
    assert_relative_eq!(chip.x, 100.0, epsilon = 1e-6);
    assert_relative_eq!(chip.y, 50.0, epsilon = 1e-6);
    assert_relative_eq!(chip.z, 10.0, epsilon = 1e-6);

    let native = sim.current_position("left", Frame::Native).unwrap();
    assert_relative_eq!(native.x, 90.0, epsilon = 1e-6);
    assert_relative_eq!(native.y, 70.0, epsilon = 1e-6);
    assert_relative_eq!(native.z, 5.0, epsilon = 1e-6);
}

#[test]
fn relative_moves_compose_in_the_chip_frame() {
    let mut sim = test_sim();
    sim.create_stage_from_model("left", StageModel::PlanarXy)
        .unwrap();

    // Single pairing gives a translation offset of (100, 0, 0).
    sim.add_calibration_pairing(
        "left",
        Pairing::new(Point3::new(0.0, 0.0, 0.0), Point3::new(100.0, 0.0, 0.0)),
    )
    .unwrap();

    sim.move_relative("left", Vector3::new(25.0, 0.0, 0.0), Frame::Chip, None)
        .unwrap();
    run_until_idle(&mut sim, "left", 0.1);

    // Chip moved +25 from chip origin (100, 0): native sits at 25.
    assert_relative_eq!(
        sim.current_position("left", Frame::Chip).unwrap().x,
        125.0,
        epsilon = 1e-6
    );
    assert_relative_eq!(
        sim.current_position("left", Frame::Native).unwrap().x,
        25.0,
        epsilon = 1e-6
    );
}

#[test]
fn subscribers_see_every_tick_update() {
    let mut sim = test_sim();
    sim.create_stage("bench", bench_axis()).unwrap();
    let mut rx = sim.subscribe();

    sim.move_to("bench", Point3::new(30.0, 0.0, 0.0), Frame::Native, None)
        .unwrap();
    sim.tick(1.0).unwrap();
    sim.tick(1.0).unwrap();

    let first = rx.try_recv().unwrap();
    let second = rx.try_recv().unwrap();
    assert_eq!(first.stage_id, "bench");
    assert!(second.sim_time_s > first.sim_time_s);
    assert!(second.positions_um[0] > first.positions_um[0]);
    assert!(rx.try_recv().is_err());
}
