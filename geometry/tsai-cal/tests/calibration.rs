use approx::assert_relative_eq;

use tsai_cal::error_stats::ErrorReport;
use tsai_cal::transform::world_to_image;
use tsai_cal::{
    CalibrationConstants, CalibrationData, CalibrationMode, CalibrationPoint, CalibrationSolver,
    CameraParameters, SolverConfig, SolverState, TsaiError,
};

fn camera(sx: f64) -> CameraParameters {
    CameraParameters::new(512.0, 512.0, 0.01, 0.01, 0.01, 0.01, 256.0, 256.0, sx).unwrap()
}

fn truth() -> CalibrationConstants {
    CalibrationConstants::from_angles(16.0, 5.0e-3, 0.0, 0.0, -90.0, -60.0, 1000.0, 0.5, -0.2, 0.1)
        .unwrap()
}

/// Small deterministic pixel noise.
fn noise(i: usize) -> (f64, f64) {
    let i = i as f64;
    (0.02 * (1.7 * i + 0.3).sin(), 0.02 * (2.3 * i).cos())
}

fn synthesize(cp: &CameraParameters, cc: &CalibrationConstants, world: &[[f64; 3]]) -> CalibrationData {
    let mut data = CalibrationData::new();
    for (i, w) in world.iter().enumerate() {
        let (xf, yf) = world_to_image(cp, cc, w[0], w[1], w[2]).unwrap();
        let (nx, ny) = noise(i);
        data.push(CalibrationPoint::new(w[0], w[1], w[2], xf + nx, yf + ny))
            .unwrap();
    }
    data
}

fn planar_target() -> Vec<[f64; 3]> {
    let mut out = Vec::new();
    for i in 0..9 {
        for j in 0..9 {
            out.push([20.0 + 20.0 * i as f64, 20.0 + 20.0 * j as f64, 0.0]);
        }
    }
    out
}

fn layered_target() -> Vec<[f64; 3]> {
    let mut out = Vec::new();
    for z in [0.0, -50.0, -100.0] {
        for i in 0..5 {
            for j in 0..5 {
                out.push([20.0 + 40.0 * i as f64, 20.0 + 40.0 * j as f64, z]);
            }
        }
    }
    out
}

fn assert_close_to_truth(cc: &CalibrationConstants) {
    let t = truth();
    assert_relative_eq!(cc.f(), t.f(), max_relative = 5e-3);
    assert_relative_eq!(cc.tz(), t.tz(), max_relative = 5e-3);
    assert_relative_eq!(cc.kappa1(), t.kappa1(), max_relative = 0.1);
    assert_relative_eq!(cc.rx(), t.rx(), epsilon = 1e-3);
    assert_relative_eq!(cc.ry(), t.ry(), epsilon = 1e-3);
    assert_relative_eq!(cc.rz(), t.rz(), epsilon = 1e-3);
}

#[test]
fn coplanar_recovers_parameters() {
    let cp = camera(1.0);
    let data = synthesize(&cp, &truth(), &planar_target());
    let mut solver = CalibrationSolver::new(cp, SolverConfig::default());
    let cal = solver.calibrate(&data, CalibrationMode::Coplanar).unwrap();
    assert_eq!(solver.state(), SolverState::Converged);
    assert_close_to_truth(&cal.constants);
    assert_eq!(cal.camera, cp);
    assert_eq!(cal.report.stages[0].parameters, ["f", "Tz", "kappa1"]);
}

#[test]
fn coplanar_full_optimization() {
    let cp = camera(1.0);
    let data = synthesize(&cp, &truth(), &planar_target());
    let mut solver = CalibrationSolver::new(cp, SolverConfig::default());
    let cal = solver
        .calibrate(&data, CalibrationMode::CoplanarFullOptimization)
        .unwrap();
    assert_eq!(cal.report.stages.len(), 2);
    assert_eq!(cal.report.stages[1].parameters.len(), 10);
    assert_close_to_truth(&cal.constants);
    assert_eq!(cal.camera.sx(), 1.0);

    let errors = ErrorReport::compute(&cal.camera, &cal.constants, &data).unwrap();
    assert!(errors.distorted_image_plane.mean < 0.1, "{errors}");
}

#[test]
fn noncoplanar_recovers_sx() {
    let true_cp = camera(1.03);
    let data = synthesize(&true_cp, &truth(), &layered_target());
    // sx is unknown at the start
    let mut solver = CalibrationSolver::new(camera(1.0), SolverConfig::default());
    let cal = solver.calibrate(&data, CalibrationMode::Noncoplanar).unwrap();
    assert_relative_eq!(cal.camera.sx(), 1.03, max_relative = 1e-3);
    assert_close_to_truth(&cal.constants);
}

#[test]
fn noncoplanar_full_optimization() {
    let true_cp = camera(1.03);
    let data = synthesize(&true_cp, &truth(), &layered_target());
    let mut solver = CalibrationSolver::new(camera(1.0), SolverConfig::default());
    let cal = solver
        .calibrate(&data, CalibrationMode::NoncoplanarFullOptimization)
        .unwrap();
    assert_eq!(cal.report.stages[1].parameters.len(), 11);
    assert_relative_eq!(cal.camera.sx(), 1.03, max_relative = 1e-3);
    assert_relative_eq!(cal.camera.cx(), 256.0, epsilon = 2.0);
    assert_relative_eq!(cal.camera.cy(), 256.0, epsilon = 2.0);
    assert_close_to_truth(&cal.constants);

    let errors = ErrorReport::compute(&cal.camera, &cal.constants, &data).unwrap();
    assert!(errors.distorted_image_plane.mean < 0.1, "{errors}");
    assert!(errors.normalized_calibration_error.mean < 1.0, "{errors}");
}

#[test]
fn extrinsic_refinement_recovers_pose() {
    let cp = camera(1.0);
    let t = truth();
    let data = synthesize(&cp, &t, &planar_target());
    let seed = CalibrationConstants::from_angles(
        t.f(),
        t.kappa1(),
        0.0,
        0.0,
        t.tx() + 5.0,
        t.ty() - 4.0,
        t.tz() + 20.0,
        t.rx() + 0.02,
        t.ry() - 0.01,
        t.rz() + 0.015,
    )
    .unwrap();
    let mut solver = CalibrationSolver::new(cp, SolverConfig::default());
    let cal = solver.calibrate_extrinsics(&data, &seed).unwrap();
    assert_eq!(cal.report.stages.len(), 1);
    assert_eq!(cal.constants.f(), t.f());
    assert_eq!(cal.constants.kappa1(), t.kappa1());
    assert_relative_eq!(cal.constants.tx(), t.tx(), epsilon = 0.1);
    assert_relative_eq!(cal.constants.ty(), t.ty(), epsilon = 0.1);
    assert_relative_eq!(cal.constants.tz(), t.tz(), epsilon = 0.5);
    assert_relative_eq!(cal.constants.rx(), t.rx(), epsilon = 1e-3);
    assert_relative_eq!(cal.constants.ry(), t.ry(), epsilon = 1e-3);
    assert_relative_eq!(cal.constants.rz(), t.rz(), epsilon = 1e-3);
}

#[test]
fn collinear_points_are_degenerate() {
    let cp = camera(1.0);
    let world: Vec<[f64; 3]> = (0..20)
        .map(|i| [10.0 + 8.0 * i as f64, 30.0 + 4.0 * i as f64, 0.0])
        .collect();
    let data = synthesize(&cp, &truth(), &world);
    let mut solver = CalibrationSolver::new(cp, SolverConfig::default());
    let err = solver
        .calibrate(&data, CalibrationMode::Coplanar)
        .unwrap_err();
    assert!(matches!(err, TsaiError::DegenerateGeometry(_)), "{err}");
    assert_eq!(solver.state(), SolverState::Failed);
}

#[test]
fn coplanar_mode_rejects_3d_target() {
    let cp = camera(1.0);
    let data = synthesize(&cp, &truth(), &layered_target());
    let mut solver = CalibrationSolver::new(cp, SolverConfig::default());
    assert!(matches!(
        solver.calibrate(&data, CalibrationMode::CoplanarFullOptimization),
        Err(TsaiError::DegenerateGeometry(_))
    ));
}
