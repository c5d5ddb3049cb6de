//! Tsai camera calibration.
//!
//! The camera model maps world points (mm) to frame-grabber pixels through a
//! rigid transform, a pinhole projection, one radial and two decentering
//! distortion terms, and the sensor-to-pixel scaling of [CameraParameters].
//! Calibration runs a closed-form estimate of the pose ([extrinsic]) followed
//! by nonlinear least squares over reprojection error ([solver]).
#![deny(rust_2018_idioms)]

use thiserror::Error;

/// Maximum number of data points allowed in a [CalibrationData] set.
pub const MAX_POINTS: usize = 500;

/// An arbitrary tolerance factor.
pub const EPSILON: f64 = 1.0e-8;

#[derive(Error, Debug)]
pub enum TsaiError {
    #[error("malformed input (row {row:?}, field {field:?}): {msg}")]
    MalformedInput {
        /// 1-based row (line) number, when reading a file.
        row: Option<u64>,
        /// 1-based field number within the row or string.
        field: Option<usize>,
        msg: String,
    },
    #[error("point count {count} exceeds maximum of {max}")]
    PointCountExceeded { count: usize, max: usize },
    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(String),
    #[error("projection undefined: {0}")]
    ProjectionUndefined(String),
    #[error("convergence failure ({kind}) after {evaluations} evaluations")]
    ConvergenceFailure {
        kind: ConvergenceFailureKind,
        evaluations: usize,
    },
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("CSV error: {source}")]
    Csv {
        #[from]
        source: csv::Error,
    },
}

impl TsaiError {
    pub(crate) fn malformed<S: Into<String>>(
        row: Option<u64>,
        field: Option<usize>,
        msg: S,
    ) -> Self {
        TsaiError::MalformedInput {
            row,
            field,
            msg: msg.into(),
        }
    }
}

/// Why the nonlinear refinement did not converge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvergenceFailureKind {
    /// The function evaluation budget was used up.
    MaxEvaluationsExceeded,
    /// The residual stopped decreasing before the tolerances were met.
    Stalled(String),
    /// Residual evaluation failed or the optimizer aborted.
    NumericalBreakdown(String),
    /// A [solver::CancelToken] was triggered.
    Cancelled,
}

impl std::fmt::Display for ConvergenceFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConvergenceFailureKind::MaxEvaluationsExceeded => {
                write!(f, "maximum function evaluations exceeded")
            }
            ConvergenceFailureKind::Stalled(why) => write!(f, "stalled: {why}"),
            ConvergenceFailureKind::NumericalBreakdown(why) => {
                write!(f, "numerical breakdown: {why}")
            }
            ConvergenceFailureKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

pub type Result<M> = std::result::Result<M, TsaiError>;

pub mod camera_params;
pub mod constants;
pub mod data;
pub mod distortion;
pub mod error_stats;
pub mod extrinsic;
pub mod formats;
pub mod rotation;
pub mod solver;
pub mod transform;

pub use crate::camera_params::CameraParameters;
pub use crate::constants::{CalibrationConstants, RotationSpec};
pub use crate::data::{CalibrationData, CalibrationPoint};
pub use crate::error_stats::{ErrorReport, ErrorStats};
pub use crate::extrinsic::ExtrinsicEstimate;
pub use crate::solver::{
    Calibration, CalibrationMode, CalibrationSolver, CancelToken, RefinementReport, SolverConfig,
    SolverState, StageReport,
};
pub use crate::transform::TsaiCamera;
