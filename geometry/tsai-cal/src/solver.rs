//! Nonlinear refinement of a calibration.
//!
//! A calibration run is a linear estimate from [crate::extrinsic] followed by
//! one or two Levenberg-Marquardt stages minimizing the distorted image
//! plane reprojection error. Each stage frees a subset of the model
//! parameters and holds the rest at their current values.
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt, TerminationReason};
use nalgebra::{storage::Owned, DMatrix, DVector, Dyn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::extrinsic::{estimate_coplanar, estimate_noncoplanar};
use crate::transform::world_to_image;
use crate::{
    CalibrationConstants, CalibrationData, CalibrationPoint, CameraParameters,
    ConvergenceFailureKind, Result, TsaiCamera, TsaiError,
};

/// Point count at which residuals are evaluated in parallel.
pub const PARALLEL_THRESHOLD: usize = 64;

/// Lower bound on the relative error of the residual function, used to pick
/// the forward difference step.
const EPSFCN: f64 = 1.0e-16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationMode {
    /// Planar target; refines `f`, `Tz` and `kappa1`.
    Coplanar,
    /// Planar target; additionally refines the pose and principal point.
    CoplanarFullOptimization,
    /// Three dimensional target; also estimates `sx`, then refines `f`,
    /// `Tz` and `kappa1`.
    Noncoplanar,
    /// Three dimensional target; additionally refines the pose, the
    /// principal point and `sx`.
    NoncoplanarFullOptimization,
}

impl CalibrationMode {
    pub fn is_coplanar(&self) -> bool {
        matches!(
            self,
            CalibrationMode::Coplanar | CalibrationMode::CoplanarFullOptimization
        )
    }

    fn full_parameters(&self) -> Option<&'static [Param]> {
        match self {
            CalibrationMode::Coplanar | CalibrationMode::Noncoplanar => None,
            CalibrationMode::CoplanarFullOptimization => Some(COPLANAR_FULL),
            CalibrationMode::NoncoplanarFullOptimization => Some(NONCOPLANAR_FULL),
        }
    }
}

impl std::fmt::Display for CalibrationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CalibrationMode::Coplanar => "coplanar",
            CalibrationMode::CoplanarFullOptimization => "coplanar full optimization",
            CalibrationMode::Noncoplanar => "noncoplanar",
            CalibrationMode::NoncoplanarFullOptimization => "noncoplanar full optimization",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolverState {
    /// No calibration has been started.
    Idle,
    /// A linear estimate is available.
    Seeded,
    Refining,
    Converged,
    Failed,
}

/// Cooperative cancellation of a running calibration.
///
/// Clones share the same flag. The solver checks it once per parameter
/// update.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Tolerances and budget of the Levenberg-Marquardt stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
    pub ftol: f64,
    pub xtol: f64,
    pub gtol: f64,
    /// Evaluation budget is `patience * (n + 1)` for `n` free parameters.
    pub patience: usize,
    pub stepbound: f64,
    pub scale_diag: bool,
    pub parallel_threshold: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            ftol: 1.0e-5,
            xtol: 1.0e-7,
            gtol: 0.0,
            patience: 1000,
            stepbound: 100.0,
            scale_diag: true,
            parallel_threshold: PARALLEL_THRESHOLD,
        }
    }
}

impl SolverConfig {
    pub fn with_ftol(mut self, ftol: f64) -> Self {
        self.ftol = ftol;
        self
    }
    pub fn with_xtol(mut self, xtol: f64) -> Self {
        self.xtol = xtol;
        self
    }
    pub fn with_gtol(mut self, gtol: f64) -> Self {
        self.gtol = gtol;
        self
    }
    pub fn with_patience(mut self, patience: usize) -> Self {
        self.patience = patience;
        self
    }
    pub fn with_stepbound(mut self, stepbound: f64) -> Self {
        self.stepbound = stepbound;
        self
    }
    pub fn with_scale_diag(mut self, scale_diag: bool) -> Self {
        self.scale_diag = scale_diag;
        self
    }
    pub fn with_parallel_threshold(mut self, parallel_threshold: usize) -> Self {
        self.parallel_threshold = parallel_threshold;
        self
    }

    fn levenberg_marquardt(&self) -> LevenbergMarquardt<f64> {
        LevenbergMarquardt::new()
            .with_ftol(self.ftol)
            .with_xtol(self.xtol)
            .with_gtol(self.gtol)
            .with_patience(self.patience)
            .with_stepbound(self.stepbound)
            .with_scale_diag(self.scale_diag)
    }
}

/// A model parameter which a refinement stage may free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Param {
    Rx,
    Ry,
    Rz,
    Tx,
    Ty,
    Tz,
    Kappa1,
    F,
    Cx,
    Cy,
    Sx,
}

impl Param {
    fn name(&self) -> &'static str {
        match self {
            Param::Rx => "Rx",
            Param::Ry => "Ry",
            Param::Rz => "Rz",
            Param::Tx => "Tx",
            Param::Ty => "Ty",
            Param::Tz => "Tz",
            Param::Kappa1 => "kappa1",
            Param::F => "f",
            Param::Cx => "Cx",
            Param::Cy => "Cy",
            Param::Sx => "sx",
        }
    }
}

const FOCAL_DISTORTION: &[Param] = &[Param::F, Param::Tz, Param::Kappa1];
const COPLANAR_FULL: &[Param] = &[
    Param::Rx,
    Param::Ry,
    Param::Rz,
    Param::Tx,
    Param::Ty,
    Param::Tz,
    Param::Kappa1,
    Param::F,
    Param::Cx,
    Param::Cy,
];
const NONCOPLANAR_FULL: &[Param] = &[
    Param::Rx,
    Param::Ry,
    Param::Rz,
    Param::Tx,
    Param::Ty,
    Param::Tz,
    Param::Kappa1,
    Param::F,
    Param::Cx,
    Param::Cy,
    Param::Sx,
];
const EXTRINSIC: &[Param] = &[
    Param::Rx,
    Param::Ry,
    Param::Rz,
    Param::Tx,
    Param::Ty,
    Param::Tz,
];

/// Camera and constants being refined.
#[derive(Debug, Clone)]
struct Model {
    cp: CameraParameters,
    cc: CalibrationConstants,
}

impl Model {
    fn get(&self, free: &[Param]) -> DVector<f64> {
        DVector::from_iterator(
            free.len(),
            free.iter().map(|p| match p {
                Param::Rx => self.cc.rx(),
                Param::Ry => self.cc.ry(),
                Param::Rz => self.cc.rz(),
                Param::Tx => self.cc.tx(),
                Param::Ty => self.cc.ty(),
                Param::Tz => self.cc.tz(),
                Param::Kappa1 => self.cc.kappa1(),
                Param::F => self.cc.f(),
                Param::Cx => self.cp.cx(),
                Param::Cy => self.cp.cy(),
                Param::Sx => self.cp.sx(),
            }),
        )
    }

    /// A copy with the free parameters replaced by `x`.
    fn with_params(&self, free: &[Param], x: &DVector<f64>) -> Result<Model> {
        let mut a = self.cc.to_array();
        let (mut cx, mut cy, mut sx) = (self.cp.cx(), self.cp.cy(), self.cp.sx());
        for (p, v) in free.iter().zip(x.iter()) {
            match p {
                Param::F => a[0] = *v,
                Param::Kappa1 => a[1] = *v,
                Param::Tx => a[4] = *v,
                Param::Ty => a[5] = *v,
                Param::Tz => a[6] = *v,
                Param::Rx => a[7] = *v,
                Param::Ry => a[8] = *v,
                Param::Rz => a[9] = *v,
                Param::Cx => cx = *v,
                Param::Cy => cy = *v,
                Param::Sx => sx = *v,
            }
        }
        let cc = CalibrationConstants::from_angles(
            a[0], a[1], a[2], a[3], a[4], a[5], a[6], a[7], a[8], a[9],
        )?;
        let cp = if free.iter().any(|p| matches!(p, Param::Cx | Param::Cy | Param::Sx)) {
            self.cp.with_refined(cx, cy, sx)?
        } else {
            self.cp
        };
        Ok(Model { cp, cc })
    }
}

#[inline]
fn point_residual(model: &Model, p: &CalibrationPoint) -> Option<[f64; 2]> {
    let (xf, yf) = world_to_image(&model.cp, &model.cc, p.xw, p.yw, p.zw).ok()?;
    Some([xf - p.Xf, yf - p.Yf])
}

/// The least squares problem of a single refinement stage.
struct ReprojectionProblem<'a> {
    data: &'a CalibrationData,
    base: &'a Model,
    free: &'static [Param],
    x: DVector<f64>,
    parallel_threshold: usize,
    cancel: &'a CancelToken,
    cancelled: bool,
}

impl ReprojectionProblem<'_> {
    /// Residuals for the parameter vector `x`, two per point in point order.
    fn residuals_at(&self, x: &DVector<f64>) -> Option<DVector<f64>> {
        let model = self.base.with_params(self.free, x).ok()?;
        let points = self.data.points();
        let per_point: Vec<[f64; 2]> = if points.len() >= self.parallel_threshold {
            points
                .par_iter()
                .map(|p| point_residual(&model, p))
                .collect::<Option<Vec<_>>>()?
        } else {
            points
                .iter()
                .map(|p| point_residual(&model, p))
                .collect::<Option<Vec<_>>>()?
        };
        Some(DVector::from_iterator(
            2 * per_point.len(),
            per_point.into_iter().flatten(),
        ))
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for ReprojectionProblem<'_> {
    type ParameterStorage = Owned<f64, Dyn>;
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        if self.cancel.is_cancelled() {
            self.cancelled = true;
        }
        self.x.copy_from(x);
    }

    fn params(&self) -> DVector<f64> {
        self.x.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        if self.cancelled {
            return None;
        }
        self.residuals_at(&self.x)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        if self.cancelled {
            return None;
        }
        let r0 = self.residuals_at(&self.x)?;
        let eps = EPSFCN.max(f64::EPSILON).sqrt();
        let mut jac = DMatrix::<f64>::zeros(r0.len(), self.x.len());
        for j in 0..self.x.len() {
            let mut h = eps * self.x[j].abs();
            if h == 0.0 {
                h = eps;
            }
            let mut x = self.x.clone();
            x[j] += h;
            let r = self.residuals_at(&x)?;
            jac.set_column(j, &((r - &r0) / h));
        }
        Some(jac)
    }
}

/// Outcome of one refinement stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub name: String,
    pub parameters: Vec<String>,
    pub evaluations: usize,
    /// Half the sum of squared residuals at the end of the stage.
    pub objective: f64,
    pub termination: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefinementReport {
    pub stages: Vec<StageReport>,
}

/// Result of a successful calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    /// Camera parameters, updated if the mode refines `Cx`, `Cy` or `sx`.
    pub camera: CameraParameters,
    pub constants: CalibrationConstants,
    pub report: RefinementReport,
}

impl Calibration {
    pub fn tsai_camera(&self) -> TsaiCamera {
        TsaiCamera::new(self.camera, self.constants.clone())
    }
}

/// Runs calibrations for one camera.
#[derive(Debug)]
pub struct CalibrationSolver {
    camera: CameraParameters,
    config: SolverConfig,
    cancel: CancelToken,
    state: SolverState,
}

impl CalibrationSolver {
    pub fn new(camera: CameraParameters, config: SolverConfig) -> Self {
        Self {
            camera,
            config,
            cancel: CancelToken::new(),
            state: SolverState::Idle,
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> SolverState {
        self.state
    }

    pub fn camera(&self) -> &CameraParameters {
        &self.camera
    }

    fn transition(&mut self, state: SolverState) {
        info!("solver state {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Estimate and refine a full calibration from `data`.
    pub fn calibrate(
        &mut self,
        data: &CalibrationData,
        mode: CalibrationMode,
    ) -> Result<Calibration> {
        info!("calibrating with {} points, mode: {mode}", data.len());
        let result = self.calibrate_inner(data, mode);
        self.finish(result)
    }

    /// Refine only the pose of `seed`, holding all intrinsics fixed.
    pub fn calibrate_extrinsics(
        &mut self,
        data: &CalibrationData,
        seed: &CalibrationConstants,
    ) -> Result<Calibration> {
        info!("refining extrinsics with {} points", data.len());
        let model = Model {
            cp: self.camera,
            cc: seed.clone(),
        };
        self.transition(SolverState::Seeded);
        let mut report = RefinementReport::default();
        let result = self
            .refine(data, "extrinsics", model, EXTRINSIC, &mut report)
            .map(|model| Calibration {
                camera: model.cp,
                constants: model.cc,
                report,
            });
        self.finish(result)
    }

    fn finish(&mut self, result: Result<Calibration>) -> Result<Calibration> {
        match &result {
            Ok(_) => self.transition(SolverState::Converged),
            Err(e) => {
                warn!("calibration failed: {e}");
                self.transition(SolverState::Failed);
            }
        }
        result
    }

    fn calibrate_inner(
        &mut self,
        data: &CalibrationData,
        mode: CalibrationMode,
    ) -> Result<Calibration> {
        let estimate = if mode.is_coplanar() {
            estimate_coplanar(&self.camera, data)?
        } else {
            estimate_noncoplanar(&self.camera, data)?
        };
        let cp = self
            .camera
            .with_refined(self.camera.cx(), self.camera.cy(), estimate.sx)?;
        let model = Model {
            cp,
            cc: estimate.to_constants()?,
        };
        self.transition(SolverState::Seeded);

        let mut report = RefinementReport::default();
        let mut model = self.refine(
            data,
            "focal length and distortion",
            model,
            FOCAL_DISTORTION,
            &mut report,
        )?;
        if let Some(full) = mode.full_parameters() {
            model = self.refine(data, "full optimization", model, full, &mut report)?;
        }
        Ok(Calibration {
            camera: model.cp,
            constants: model.cc,
            report,
        })
    }

    fn refine(
        &mut self,
        data: &CalibrationData,
        name: &str,
        model: Model,
        free: &'static [Param],
        report: &mut RefinementReport,
    ) -> Result<Model> {
        if self.cancel.is_cancelled() {
            return Err(TsaiError::ConvergenceFailure {
                kind: ConvergenceFailureKind::Cancelled,
                evaluations: 0,
            });
        }
        if data.len() * 2 < free.len() {
            return Err(TsaiError::DegenerateGeometry(format!(
                "{} points cannot constrain {} parameters",
                data.len(),
                free.len()
            )));
        }
        self.transition(SolverState::Refining);

        let x0 = model.get(free);
        debug!(
            "stage {name}: start {:?}",
            free.iter().zip(x0.iter()).collect::<Vec<_>>()
        );
        let problem = ReprojectionProblem {
            data,
            base: &model,
            free,
            x: x0,
            parallel_threshold: self.config.parallel_threshold,
            cancel: &self.cancel,
            cancelled: false,
        };
        let (problem, lm_report) = self.config.levenberg_marquardt().minimize(problem);
        let evaluations = lm_report.number_of_evaluations;
        let cancelled = problem.cancelled;
        let x = problem.x;

        debug!(
            "stage {name}: {:?} after {evaluations} evaluations, objective {}",
            lm_report.termination, lm_report.objective_function
        );
        report.stages.push(StageReport {
            name: name.to_string(),
            parameters: free.iter().map(|p| p.name().to_string()).collect(),
            evaluations,
            objective: lm_report.objective_function,
            termination: format!("{:?}", lm_report.termination),
        });

        if cancelled {
            return Err(TsaiError::ConvergenceFailure {
                kind: ConvergenceFailureKind::Cancelled,
                evaluations,
            });
        }
        if let Some(kind) = failure_kind(&lm_report.termination) {
            return Err(TsaiError::ConvergenceFailure { kind, evaluations });
        }
        model.with_params(free, &x)
    }
}

fn failure_kind(termination: &TerminationReason) -> Option<ConvergenceFailureKind> {
    use TerminationReason::*;
    match termination {
        ResidualsZero | Orthogonal | Converged { .. } => None,
        LostPatience => Some(ConvergenceFailureKind::MaxEvaluationsExceeded),
        NoImprovementPossible(why) => Some(ConvergenceFailureKind::Stalled(why.to_string())),
        Numerical(why) => Some(ConvergenceFailureKind::NumericalBreakdown(format!(
            "non-finite {why}"
        ))),
        User(why) => Some(ConvergenceFailureKind::NumericalBreakdown(format!(
            "{why} could not be evaluated"
        ))),
        other => Some(ConvergenceFailureKind::NumericalBreakdown(format!(
            "{other:?}"
        ))),
    }
}
