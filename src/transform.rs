//! Stage-to-chip coordinate transformations.
//!
//! Every stage carries a [`CalibrationTransform`] that maps between its
//! native actuator frame and the chip frame shared by all stages. A fresh
//! transform is the identity; feeding it coordinate pairings upgrades it in
//! two steps:
//!
//! 1. The first pairing establishes a pure translation offset, enough for
//!    coarse moves near the paired location.
//! 2. Three or more non-collinear pairings determine a full in-plane affine
//!    mapping (2x2 linear part plus translation) together with a constant
//!    z offset, fitted by least squares over all accumulated pairings.
//!
//! The fit rejects degenerate geometry (collinear or duplicated pairings)
//! instead of producing a garbage mapping, and a fitted transform can be
//! persisted to JSON and restored later.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::str::FromStr;

use chrono::Utc;
use nalgebra::{DMatrix, Matrix2, Point3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{SimError, SimResult};

/// Threshold below which the fitted linear part counts as singular.
const DETERMINANT_EPSILON: f64 = 1e-10;

/// Singular-value cutoff handed to the SVD least-squares solver.
const LSTSQ_EPSILON: f64 = 1e-12;

/// Minimum number of pairings required for a full affine fit.
pub const MIN_AFFINE_PAIRINGS: usize = 3;

/// Coordinate frame a position is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frame {
    /// The stage's own actuator frame, in micrometers per axis.
    Native,
    /// The chip frame shared by all stages, in micrometers.
    Chip,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Native => write!(f, "native"),
            Frame::Chip => write!(f, "chip"),
        }
    }
}

impl FromStr for Frame {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" | "stage" => Ok(Frame::Native),
            "chip" => Ok(Frame::Chip),
            other => Err(format!("unknown frame '{other}' (expected 'native' or 'chip')")),
        }
    }
}

/// One observed correspondence between a stage position and a chip position.
///
/// Pairings are recorded by driving the stage to a known chip feature and
/// noting both coordinates at the same instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pairing {
    /// Stage position in the native frame, micrometers.
    pub stage: Point3<f64>,
    /// The chip position the stage was aligned to, micrometers.
    pub chip: Point3<f64>,
}

impl Pairing {
    /// Creates a pairing from matching native and chip coordinates.
    pub fn new(stage: Point3<f64>, chip: Point3<f64>) -> Self {
        Self { stage, chip }
    }
}

/// Thresholds applied while fitting calibrations.
#[derive(Debug, Clone, Copy)]
pub struct CalibrationSettings {
    /// Condition numbers above this reject the fit as degenerate.
    pub condition_limit: f64,
    /// RMS residual (micrometers) above which a fit is flagged as poor.
    pub residual_warn_um: f64,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            condition_limit: 1e8,
            residual_warn_um: 1.0,
        }
    }
}

/// Quality summary of an affine calibration fit.
#[derive(Debug, Clone, Serialize)]
pub struct CalibrationReport {
    /// Per-pairing distance between predicted and observed chip position, micrometers.
    pub residuals_um: Vec<f64>,
    /// Root-mean-square of the residuals, micrometers.
    pub rms_um: f64,
    /// Largest single residual, micrometers.
    pub max_um: f64,
    /// Condition number of the least-squares design matrix.
    pub condition: f64,
}

impl CalibrationReport {
    /// Whether the fit quality falls below the configured warning threshold.
    pub fn is_poor(&self, settings: &CalibrationSettings) -> bool {
        self.rms_um > settings.residual_warn_um
    }
}

/// The mapping stage a transform has reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformKind {
    /// No calibration applied; native and chip frames coincide.
    Identity,
    /// Single-pairing translation offset.
    Offset,
    /// Full least-squares affine mapping.
    Affine,
}

impl fmt::Display for TransformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformKind::Identity => write!(f, "identity"),
            TransformKind::Offset => write!(f, "offset"),
            TransformKind::Affine => write!(f, "affine"),
        }
    }
}

#[derive(Debug, Clone)]
enum Mapping {
    Identity,
    Offset(Vector3<f64>),
    Affine {
        /// In-plane linear part, native -> chip.
        m: Matrix2<f64>,
        /// Cached inverse of `m` for chip -> native conversions.
        m_inv: Matrix2<f64>,
        /// In-plane translation, native -> chip, micrometers.
        translation: Vector2<f64>,
        /// Constant z offset added when going native -> chip, micrometers.
        z_offset: f64,
    },
}

/// Affine stage-to-chip calibration accumulated from coordinate pairings.
#[derive(Debug, Clone)]
pub struct CalibrationTransform {
    mapping: Mapping,
    pairings: Vec<Pairing>,
}

impl Default for CalibrationTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl CalibrationTransform {
    /// An uncalibrated transform where both frames coincide.
    pub fn identity() -> Self {
        Self {
            mapping: Mapping::Identity,
            pairings: Vec::new(),
        }
    }

    /// A translation-only transform anchored to a single pairing.
    pub fn from_single_pairing(pairing: Pairing) -> Self {
        Self {
            mapping: Mapping::Offset(pairing.chip - pairing.stage),
            pairings: vec![pairing],
        }
    }

    /// Fits a full affine transform to the given pairings by least squares.
    ///
    /// Requires at least [`MIN_AFFINE_PAIRINGS`] pairings whose stage-side
    /// positions are not collinear. Returns the fitted transform together
    /// with a residual report; the caller decides whether a poor fit is
    /// still acceptable.
    pub fn fit(
        pairings: &[Pairing],
        settings: &CalibrationSettings,
    ) -> SimResult<(Self, CalibrationReport)> {
        let (mapping, condition) = Self::solve_affine(pairings, settings)?;
        let report = Self::report_for(&mapping, pairings, condition);
        debug!(
            pairings = pairings.len(),
            rms_um = report.rms_um,
            condition = report.condition,
            "affine calibration fitted"
        );
        Ok((
            Self {
                mapping,
                pairings: pairings.to_vec(),
            },
            report,
        ))
    }

    /// Adds one pairing, upgrading the mapping as far as the data allows.
    ///
    /// The first pairing switches the transform to a translation offset. The
    /// second is stored without changing the mapping. From the third pairing
    /// on, every addition refits the full affine mapping; if the refit is
    /// degenerate the new pairing is discarded and the previous mapping stays
    /// in effect.
    pub fn add_pairing(
        &mut self,
        pairing: Pairing,
        settings: &CalibrationSettings,
    ) -> SimResult<Option<CalibrationReport>> {
        match self.pairings.len() {
            0 => {
                *self = Self::from_single_pairing(pairing);
                Ok(None)
            }
            1 => {
                // Two pairings underdetermine the linear part; keep the
                // offset anchored to the first pairing until a third arrives.
                self.pairings.push(pairing);
                Ok(None)
            }
            _ => {
                let mut candidate = self.pairings.clone();
                candidate.push(pairing);
                let (fitted, report) = Self::fit(&candidate, settings)?;
                *self = fitted;
                Ok(Some(report))
            }
        }
    }

    /// Which mapping stage the transform has reached.
    pub fn kind(&self) -> TransformKind {
        match self.mapping {
            Mapping::Identity => TransformKind::Identity,
            Mapping::Offset(_) => TransformKind::Offset,
            Mapping::Affine { .. } => TransformKind::Affine,
        }
    }

    /// Whether any calibration has been applied beyond the identity.
    pub fn is_calibrated(&self) -> bool {
        !matches!(self.mapping, Mapping::Identity)
    }

    /// Number of pairings accumulated so far.
    pub fn pairing_count(&self) -> usize {
        self.pairings.len()
    }

    /// The accumulated pairings backing the current mapping.
    pub fn pairings(&self) -> &[Pairing] {
        &self.pairings
    }

    /// Maps a native stage position into the chip frame.
    pub fn to_chip(&self, native: Point3<f64>) -> Point3<f64> {
        match &self.mapping {
            Mapping::Identity => native,
            Mapping::Offset(offset) => native + offset,
            Mapping::Affine {
                m,
                translation,
                z_offset,
                ..
            } => {
                let xy = m * Vector2::new(native.x, native.y) + translation;
                Point3::new(xy.x, xy.y, native.z + z_offset)
            }
        }
    }

    /// Maps a chip position back into the stage's native frame.
    pub fn to_native(&self, chip: Point3<f64>) -> Point3<f64> {
        match &self.mapping {
            Mapping::Identity => chip,
            Mapping::Offset(offset) => chip - offset,
            Mapping::Affine {
                m_inv,
                translation,
                z_offset,
                ..
            } => {
                let xy = m_inv * (Vector2::new(chip.x, chip.y) - translation);
                Point3::new(xy.x, xy.y, chip.z - z_offset)
            }
        }
    }

    /// Writes the transform and its pairings to a JSON file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> SimResult<()> {
        let file = CalibrationFile::from_transform(self);
        let writer = BufWriter::new(File::create(path.as_ref())?);
        serde_json::to_writer_pretty(writer, &file)?;
        debug!(path = %path.as_ref().display(), kind = %self.kind(), "calibration saved");
        Ok(())
    }

    /// Restores a transform previously written by [`save`](Self::save).
    ///
    /// The linear part is re-inverted on load; a file whose matrix has gone
    /// singular is rejected rather than silently accepted.
    pub fn load<P: AsRef<Path>>(path: P) -> SimResult<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let file: CalibrationFile = serde_json::from_reader(reader)?;
        let transform = file.into_transform()?;
        debug!(
            path = %path.as_ref().display(),
            kind = %transform.kind(),
            pairings = transform.pairing_count(),
            "calibration loaded"
        );
        Ok(transform)
    }

    /// Solves the centered least-squares system for the affine mapping.
    fn solve_affine(
        pairings: &[Pairing],
        settings: &CalibrationSettings,
    ) -> SimResult<(Mapping, f64)> {
        let n = pairings.len();
        if n < MIN_AFFINE_PAIRINGS {
            return Err(SimError::DegenerateCalibration {
                reason: format!(
                    "{n} pairing(s) cannot determine an affine mapping, need at least {MIN_AFFINE_PAIRINGS}"
                ),
                condition: f64::INFINITY,
            });
        }

        // Center the stage-side xy coordinates before building the design
        // matrix; this keeps the condition number meaningful for stages that
        // operate far from their native origin.
        let centroid = pairings
            .iter()
            .fold(Vector2::zeros(), |acc, p| {
                acc + Vector2::new(p.stage.x, p.stage.y)
            })
            / n as f64;

        let a = DMatrix::from_fn(n, 3, |row, col| {
            let p = &pairings[row];
            match col {
                0 => p.stage.x - centroid.x,
                1 => p.stage.y - centroid.y,
                _ => 1.0,
            }
        });
        let b = DMatrix::from_fn(n, 2, |row, col| {
            let p = &pairings[row];
            if col == 0 {
                p.chip.x
            } else {
                p.chip.y
            }
        });

        let svd = a.svd(true, true);
        let singular = &svd.singular_values;
        let s_max = singular[0];
        let s_min = singular[singular.len() - 1];
        let condition = if s_min > 0.0 {
            s_max / s_min
        } else {
            f64::INFINITY
        };
        if !condition.is_finite() || condition > settings.condition_limit {
            return Err(SimError::DegenerateCalibration {
                reason: "stage-side pairings are collinear or duplicated".into(),
                condition,
            });
        }

        let w = svd
            .solve(&b, LSTSQ_EPSILON)
            .map_err(|msg| SimError::DegenerateCalibration {
                reason: msg.to_string(),
                condition,
            })?;

        // Rows of w are [m_col_x, m_col_y, c]; undo the centering so the
        // translation applies to raw native coordinates.
        let m = Matrix2::new(w[(0, 0)], w[(1, 0)], w[(0, 1)], w[(1, 1)]);
        let det = m.determinant();
        if det.abs() < DETERMINANT_EPSILON {
            return Err(SimError::DegenerateCalibration {
                reason: format!("chip-side pairings are collinear (determinant {det:.3e})"),
                condition,
            });
        }
        let m_inv = m
            .try_inverse()
            .ok_or_else(|| SimError::DegenerateCalibration {
                reason: format!("linear part is not invertible (determinant {det:.3e})"),
                condition,
            })?;
        let translation = Vector2::new(w[(2, 0)], w[(2, 1)]) - m * centroid;

        let z_offset = pairings
            .iter()
            .map(|p| p.chip.z - p.stage.z)
            .sum::<f64>()
            / n as f64;

        Ok((
            Mapping::Affine {
                m,
                m_inv,
                translation,
                z_offset,
            },
            condition,
        ))
    }

    fn report_for(mapping: &Mapping, pairings: &[Pairing], condition: f64) -> CalibrationReport {
        let probe = Self {
            mapping: mapping.clone(),
            pairings: Vec::new(),
        };
        let residuals_um: Vec<f64> = pairings
            .iter()
            .map(|p| (probe.to_chip(p.stage) - p.chip).norm())
            .collect();
        let rms_um = (residuals_um.iter().map(|r| r * r).sum::<f64>()
            / residuals_um.len().max(1) as f64)
            .sqrt();
        let max_um = residuals_um.iter().copied().fold(0.0_f64, f64::max);
        CalibrationReport {
            residuals_um,
            rms_um,
            max_um,
            condition,
        }
    }
}

/// On-disk JSON shape for a saved calibration.
///
/// Matrices are stored as plain row-major arrays so the file stays readable
/// and the serde model does not depend on nalgebra's layout.
#[derive(Debug, Serialize, Deserialize)]
struct CalibrationFile {
    kind: TransformKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    matrix: Option<[f64; 4]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    translation_um: Option<[f64; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    z_offset_um: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    offset_um: Option<[f64; 3]>,
    #[serde(default)]
    stage_coordinates: Vec<[f64; 3]>,
    #[serde(default)]
    chip_coordinates: Vec<[f64; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    saved_at: Option<String>,
}

impl CalibrationFile {
    fn from_transform(transform: &CalibrationTransform) -> Self {
        let (matrix, translation_um, z_offset_um, offset_um) = match &transform.mapping {
            Mapping::Identity => (None, None, None, None),
            Mapping::Offset(offset) => (None, None, None, Some([offset.x, offset.y, offset.z])),
            Mapping::Affine {
                m,
                translation,
                z_offset,
                ..
            } => (
                Some([m[(0, 0)], m[(0, 1)], m[(1, 0)], m[(1, 1)]]),
                Some([translation.x, translation.y]),
                Some(*z_offset),
                None,
            ),
        };
        Self {
            kind: transform.kind(),
            matrix,
            translation_um,
            z_offset_um,
            offset_um,
            stage_coordinates: transform
                .pairings
                .iter()
                .map(|p| [p.stage.x, p.stage.y, p.stage.z])
                .collect(),
            chip_coordinates: transform
                .pairings
                .iter()
                .map(|p| [p.chip.x, p.chip.y, p.chip.z])
                .collect(),
            saved_at: Some(Utc::now().to_rfc3339()),
        }
    }

    fn into_transform(self) -> SimResult<CalibrationTransform> {
        let pairings: Vec<Pairing> = self
            .stage_coordinates
            .iter()
            .zip(self.chip_coordinates.iter())
            .map(|(s, c)| {
                Pairing::new(
                    Point3::new(s[0], s[1], s[2]),
                    Point3::new(c[0], c[1], c[2]),
                )
            })
            .collect();

        let mapping = match self.kind {
            TransformKind::Identity => Mapping::Identity,
            TransformKind::Offset => {
                let offset = self.offset_um.ok_or_else(|| {
                    SimError::Configuration("offset calibration file is missing 'offset_um'".into())
                })?;
                Mapping::Offset(Vector3::new(offset[0], offset[1], offset[2]))
            }
            TransformKind::Affine => {
                let raw = self.matrix.ok_or_else(|| {
                    SimError::Configuration("affine calibration file is missing 'matrix'".into())
                })?;
                let t = self.translation_um.ok_or_else(|| {
                    SimError::Configuration(
                        "affine calibration file is missing 'translation_um'".into(),
                    )
                })?;
                let m = Matrix2::new(raw[0], raw[1], raw[2], raw[3]);
                let det = m.determinant();
                if det.abs() < DETERMINANT_EPSILON {
                    return Err(SimError::DegenerateCalibration {
                        reason: format!("stored matrix is singular (determinant {det:.3e})"),
                        condition: f64::INFINITY,
                    });
                }
                let m_inv = m
                    .try_inverse()
                    .ok_or_else(|| SimError::DegenerateCalibration {
                        reason: format!("stored matrix is not invertible (determinant {det:.3e})"),
                        condition: f64::INFINITY,
                    })?;
                Mapping::Affine {
                    m,
                    m_inv,
                    translation: Vector2::new(t[0], t[1]),
                    z_offset: self.z_offset_um.unwrap_or(0.0),
                }
            }
        };

        Ok(CalibrationTransform { mapping, pairings })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn settings() -> CalibrationSettings {
        CalibrationSettings::default()
    }

    /// Pairings generated from a known rotation + scale + translation.
    fn synthetic_pairings() -> Vec<Pairing> {
        let angle = 30.0_f64.to_radians();
        let scale = 1.02;
        let m = Matrix2::new(angle.cos(), -angle.sin(), angle.sin(), angle.cos()) * scale;
        let t = Vector2::new(1500.0, -230.0);
        let z_offset = 42.5;
        [
            (0.0, 0.0, 10.0),
            (1000.0, 0.0, 10.0),
            (0.0, 1000.0, 10.0),
            (750.0, 620.0, 10.0),
        ]
        .iter()
        .map(|&(x, y, z)| {
            let chip_xy = m * Vector2::new(x, y) + t;
            Pairing::new(
                Point3::new(x, y, z),
                Point3::new(chip_xy.x, chip_xy.y, z + z_offset),
            )
        })
        .collect()
    }

    #[test]
    fn identity_transform_passes_points_through() {
        let transform = CalibrationTransform::identity();
        let p = Point3::new(12.0, -4.5, 100.0);
        assert_eq!(transform.to_chip(p), p);
        assert_eq!(transform.to_native(p), p);
        assert_eq!(transform.kind(), TransformKind::Identity);
        assert!(!transform.is_calibrated());
    }

    #[test]
    fn single_pairing_yields_translation_offset() {
        let pairing = Pairing::new(Point3::new(100.0, 200.0, 50.0), Point3::new(110.0, 190.0, 55.0));
        let transform = CalibrationTransform::from_single_pairing(pairing);
        assert_eq!(transform.kind(), TransformKind::Offset);

        let chip = transform.to_chip(Point3::new(0.0, 0.0, 0.0));
        assert_relative_eq!(chip.x, 10.0);
        assert_relative_eq!(chip.y, -10.0);
        assert_relative_eq!(chip.z, 5.0);

        let back = transform.to_native(chip);
        assert_relative_eq!(back.x, 0.0);
        assert_relative_eq!(back.y, 0.0);
        assert_relative_eq!(back.z, 0.0);
    }

    #[test]
    fn affine_fit_recovers_rotation_scale_translation() {
        let pairings = synthetic_pairings();
        let (transform, report) = CalibrationTransform::fit(&pairings, &settings()).unwrap();
        assert_eq!(transform.kind(), TransformKind::Affine);
        assert!(report.rms_um < 1e-6, "rms {} too large", report.rms_um);
        assert!(report.condition < 100.0);

        for pairing in &pairings {
            let predicted = transform.to_chip(pairing.stage);
            assert_relative_eq!(predicted.x, pairing.chip.x, epsilon = 1e-6);
            assert_relative_eq!(predicted.y, pairing.chip.y, epsilon = 1e-6);
            assert_relative_eq!(predicted.z, pairing.chip.z, epsilon = 1e-6);

            let back = transform.to_native(pairing.chip);
            assert_relative_eq!(back.x, pairing.stage.x, epsilon = 1e-6);
            assert_relative_eq!(back.y, pairing.stage.y, epsilon = 1e-6);
            assert_relative_eq!(back.z, pairing.stage.z, epsilon = 1e-6);
        }
    }

    #[test]
    fn fit_requires_three_pairings() {
        let pairings = vec![
            Pairing::new(Point3::origin(), Point3::origin()),
            Pairing::new(Point3::new(1.0, 0.0, 0.0), Point3::new(1.0, 0.0, 0.0)),
        ];
        let err = CalibrationTransform::fit(&pairings, &settings()).unwrap_err();
        assert!(matches!(err, SimError::DegenerateCalibration { .. }));
    }

    #[test]
    fn collinear_pairings_are_rejected() {
        let pairings: Vec<Pairing> = (0..4)
            .map(|i| {
                let x = i as f64 * 100.0;
                Pairing::new(Point3::new(x, 0.0, 0.0), Point3::new(x + 5.0, 3.0, 0.0))
            })
            .collect();
        match CalibrationTransform::fit(&pairings, &settings()) {
            Err(SimError::DegenerateCalibration { condition, .. }) => {
                assert!(!condition.is_finite() || condition > settings().condition_limit);
            }
            other => panic!("expected degenerate calibration, got {other:?}"),
        }
    }

    #[test]
    fn duplicated_pairings_are_rejected() {
        let p = Pairing::new(Point3::new(10.0, 20.0, 0.0), Point3::new(12.0, 18.0, 0.0));
        let err = CalibrationTransform::fit(&[p, p, p], &settings()).unwrap_err();
        assert!(matches!(err, SimError::DegenerateCalibration { .. }));
    }

    #[test]
    fn add_pairing_upgrades_identity_to_offset_then_affine() {
        let pairings = synthetic_pairings();
        let mut transform = CalibrationTransform::identity();

        assert!(transform.add_pairing(pairings[0], &settings()).unwrap().is_none());
        assert_eq!(transform.kind(), TransformKind::Offset);

        assert!(transform.add_pairing(pairings[1], &settings()).unwrap().is_none());
        assert_eq!(transform.kind(), TransformKind::Offset);
        assert_eq!(transform.pairing_count(), 2);

        let report = transform
            .add_pairing(pairings[2], &settings())
            .unwrap()
            .unwrap();
        assert_eq!(transform.kind(), TransformKind::Affine);
        assert!(report.rms_um < 1e-6);
    }

    #[test]
    fn degenerate_refit_keeps_previous_mapping_and_drops_pairing() {
        let mut transform = CalibrationTransform::identity();
        let p0 = Pairing::new(Point3::new(0.0, 0.0, 0.0), Point3::new(10.0, 0.0, 0.0));
        let p1 = Pairing::new(Point3::new(100.0, 0.0, 0.0), Point3::new(110.0, 0.0, 0.0));
        // Collinear with the first two: the affine refit must fail.
        let p2 = Pairing::new(Point3::new(200.0, 0.0, 0.0), Point3::new(210.0, 0.0, 0.0));

        transform.add_pairing(p0, &settings()).unwrap();
        transform.add_pairing(p1, &settings()).unwrap();
        let before = transform.to_chip(Point3::new(50.0, 50.0, 0.0));

        let err = transform.add_pairing(p2, &settings()).unwrap_err();
        assert!(matches!(err, SimError::DegenerateCalibration { .. }));
        assert_eq!(transform.kind(), TransformKind::Offset);
        assert_eq!(transform.pairing_count(), 2);
        assert_eq!(transform.to_chip(Point3::new(50.0, 50.0, 0.0)), before);
    }

    #[test]
    fn save_and_load_roundtrip_preserves_mapping() {
        let pairings = synthetic_pairings();
        let (transform, _) = CalibrationTransform::fit(&pairings, &settings()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration.json");
        transform.save(&path).unwrap();

        let restored = CalibrationTransform::load(&path).unwrap();
        assert_eq!(restored.kind(), TransformKind::Affine);
        assert_eq!(restored.pairing_count(), pairings.len());

        let probe = Point3::new(333.0, -81.0, 12.0);
        let a = transform.to_chip(probe);
        let b = restored.to_chip(probe);
        assert_relative_eq!(a.x, b.x, epsilon = 1e-9);
        assert_relative_eq!(a.y, b.y, epsilon = 1e-9);
        assert_relative_eq!(a.z, b.z, epsilon = 1e-9);
    }

    #[test]
    fn load_rejects_singular_matrix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(
            &path,
            r#"{
                "kind": "affine",
                "matrix": [1.0, 2.0, 2.0, 4.0],
                "translation_um": [0.0, 0.0],
                "z_offset_um": 0.0
            }"#,
        )
        .unwrap();

        let err = CalibrationTransform::load(&path).unwrap_err();
        assert!(matches!(err, SimError::DegenerateCalibration { .. }));
    }
}
