//! Calibration fitting and persistence across the public API.

use approx::assert_relative_eq;
use nalgebra::{Matrix2, Point3, Vector2};
use stage_sim::config::SimConfig;
use stage_sim::error::SimError;
use stage_sim::registry::StageModel;
use stage_sim::simulation::Simulation;
use stage_sim::transform::{
    CalibrationSettings, CalibrationTransform, Frame, Pairing, TransformKind,
};

/// Pairings generated from a rotation, anisotropic scale and translation,
/// the kind of mapping a skewed chip mount produces.
fn skewed_mount_pairings() -> Vec<Pairing> {
    let angle = 12.0_f64.to_radians();
    let m = Matrix2::new(angle.cos(), -angle.sin(), angle.sin(), angle.cos())
        * Matrix2::new(1.01, 0.0, 0.0, 0.98);
    let t = Vector2::new(-420.0, 77.0);
    let z_offset = -12.0;

    [
        (0.0, 0.0, 0.0),
        (2000.0, 0.0, 0.0),
        (0.0, 2000.0, 0.0),
        (2000.0, 2000.0, 0.0),
        (-500.0, 1200.0, 0.0),
    ]
    .iter()
    .map(|&(x, y, z)| {
        let chip = m * Vector2::new(x, y) + t;
        Pairing::new(
            Point3::new(x, y, z),
            Point3::new(chip.x, chip.y, z + z_offset),
        )
    })
    .collect()
}

#[test]
fn fit_inverts_cleanly_across_the_workspace() {
    let (transform, report) =
        CalibrationTransform::fit(&skewed_mount_pairings(), &CalibrationSettings::default())
            .unwrap();
    assert!(report.rms_um < 1e-6);

    for x in [-3000.0, 0.0, 1500.0, 4000.0] {
        for y in [-2500.0, 100.0, 3500.0] {
            let native = Point3::new(x, y, 50.0);
            let roundtrip = transform.to_native(transform.to_chip(native));
            assert_relative_eq!(roundtrip.x, native.x, epsilon = 1e-6);
            assert_relative_eq!(roundtrip.y, native.y, epsilon = 1e-6);
            assert_relative_eq!(roundtrip.z, native.z, epsilon = 1e-6);
        }
    }
}

#[test]
fn noisy_pairings_fit_but_report_poor_residuals() {
    let mut pairings = skewed_mount_pairings();
    // Perturb one observation by a few micrometers, as a badly focused
    // pairing measurement would.
    pairings[2].chip.x += 4.0;
    pairings[2].chip.y -= 3.0;

    let strict = CalibrationSettings {
        condition_limit: 1e8,
        residual_warn_um: 0.5,
    };
    let (transform, report) = CalibrationTransform::fit(&pairings, &strict).unwrap();

    assert_eq!(transform.kind(), TransformKind::Affine);
    assert!(report.rms_um > 0.5, "rms {} too small", report.rms_um);
    assert!(report.max_um >= report.rms_um);
    assert!(report.is_poor(&strict));
}

#[test]
fn affine_calibration_survives_disk_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mount.json");

    let (saved, _) =
        CalibrationTransform::fit(&skewed_mount_pairings(), &CalibrationSettings::default())
            .unwrap();
    saved.save(&path).unwrap();

    let restored = CalibrationTransform::load(&path).unwrap();
    assert_eq!(restored.kind(), TransformKind::Affine);
    assert_eq!(restored.pairing_count(), saved.pairing_count());

    for probe in [
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(1234.5, -678.9, 42.0),
    ] {
        let a = saved.to_chip(probe);
        let b = restored.to_chip(probe);
        assert_relative_eq!(a.x, b.x, epsilon = 1e-9);
        assert_relative_eq!(a.y, b.y, epsilon = 1e-9);
        assert_relative_eq!(a.z, b.z, epsilon = 1e-9);
    }
}

#[test]
fn offset_calibration_survives_disk_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offset.json");

    let saved = CalibrationTransform::from_single_pairing(Pairing::new(
        Point3::new(10.0, 20.0, 30.0),
        Point3::new(15.0, 18.0, 33.0),
    ));
    saved.save(&path).unwrap();

    let restored = CalibrationTransform::load(&path).unwrap();
    assert_eq!(restored.kind(), TransformKind::Offset);
    assert_eq!(restored.pairing_count(), 1);

    let chip = restored.to_chip(Point3::new(0.0, 0.0, 0.0));
    assert_relative_eq!(chip.x, 5.0);
    assert_relative_eq!(chip.y, -2.0);
    assert_relative_eq!(chip.z, 3.0);
}

#[test]
fn load_rejects_files_with_missing_fields() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("truncated.json");
    std::fs::write(&path, r#"{ "kind": "affine" }"#).unwrap();

    let err = CalibrationTransform::load(&path).unwrap_err();
    assert!(matches!(err, SimError::Configuration(_)));
}

#[test]
fn calibration_transfers_between_stages_through_files() {
    // Setup: calibrate one stage and persist its transform.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.json");

    let mut sim = Simulation::new(&SimConfig::default()).unwrap();
    sim.create_stage_from_model("first", StageModel::FiberPositioner)
        .unwrap();
    sim.create_stage_from_model("second", StageModel::FiberPositioner)
        .unwrap();
    sim.calibrate("first", &skewed_mount_pairings()).unwrap();
    sim.save_calibration("first", &path).unwrap();

    // Act: restore it onto an uncalibrated stage.
    sim.load_calibration("second", &path).unwrap();

    // Assert: both stages agree on where chip coordinates lie.
    let a = sim.current_position("first", Frame::Chip).unwrap();
    let b = sim.current_position("second", Frame::Chip).unwrap();
    assert_relative_eq!(a.x, b.x, epsilon = 1e-9);
    assert_relative_eq!(a.y, b.y, epsilon = 1e-9);
    assert_relative_eq!(a.z, b.z, epsilon = 1e-9);

    let infos = sim.list_stages();
    assert!(infos
        .iter()
        .all(|info| info.transform == TransformKind::Affine));
}
