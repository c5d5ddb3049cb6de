//! Closed-form initial estimate of the camera pose and focal length.
//!
//! Both estimators use the radial alignment constraint: with distortion
//! purely radial about the principal point, the vector from the image
//! centre to a distorted image point is parallel to the vector from the
//! optical axis to the point in the camera frame. That gives a linear system
//! in the first two rows of the rotation and in `Tx`, `Ty`, independent of
//! `f`, `Tz` and `kappa1`, which are then found in a second linear step.
#![allow(non_snake_case)]

use nalgebra::{DMatrix, DVector, Matrix3, RowVector3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::rotation::{angles_from_matrix, matrix_from_angles, nearest_rotation};
use crate::{
    CalibrationConstants, CalibrationData, CalibrationPoint, CameraParameters, Result,
    TsaiError, EPSILON,
};

/// Fewest points accepted by [estimate_coplanar].
pub const MIN_COPLANAR_POINTS: usize = 5;
/// Fewest points accepted by [estimate_noncoplanar].
pub const MIN_NONCOPLANAR_POINTS: usize = 7;

/// Linear estimate of the pose, focal length and (noncoplanar only) `sx`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExtrinsicEstimate {
    pub rx: f64,
    pub ry: f64,
    pub rz: f64,
    pub tx: f64,
    pub ty: f64,
    pub tz: f64,
    pub f: f64,
    pub sx: f64,
}

impl ExtrinsicEstimate {
    /// Constants with this pose and focal length and no lens distortion.
    pub fn to_constants(&self) -> Result<CalibrationConstants> {
        CalibrationConstants::from_angles(
            self.f, 0.0, 0.0, 0.0, self.tx, self.ty, self.tz, self.rx, self.ry, self.rz,
        )
    }

    pub fn rotation(&self) -> Matrix3<f64> {
        matrix_from_angles(self.rx, self.ry, self.rz)
    }
}

fn degenerate<S: Into<String>>(msg: S) -> TsaiError {
    TsaiError::DegenerateGeometry(msg.into())
}

/// Least squares solution of `a x = b` via SVD, failing if `a` does not have
/// full column rank.
fn lstsq(a: DMatrix<f64>, b: &DVector<f64>, what: &str) -> Result<DVector<f64>> {
    let ncols = a.ncols();
    if !a.iter().chain(b.iter()).all(|v| v.is_finite()) {
        return Err(degenerate(format!("non-finite values in {what} system")));
    }
    let svd = a.svd(true, true);
    let smax = svd.singular_values.max();
    let tol = smax * EPSILON;
    let rank = svd.rank(tol);
    if rank < ncols {
        return Err(degenerate(format!(
            "{what} system has rank {rank}, need {ncols}"
        )));
    }
    let x = svd.solve(b, tol).map_err(|e| degenerate(format!("{what}: {e}")))?;
    if !x.iter().all(|v| v.is_finite()) {
        return Err(degenerate(format!("non-finite {what} solution")));
    }
    Ok(x)
}

/// Ratio of smallest to largest singular value of the centred point cloud.
fn spread_ratio<const D: usize>(pts: &[[f64; D]]) -> f64 {
    let n = pts.len();
    let mut m = DMatrix::<f64>::zeros(n, D);
    for (i, p) in pts.iter().enumerate() {
        for (j, v) in p.iter().enumerate() {
            m[(i, j)] = *v;
        }
    }
    for j in 0..D {
        let mean = m.column(j).mean();
        m.column_mut(j).add_scalar_mut(-mean);
    }
    let sv = m.singular_values();
    let smax = sv.max();
    if smax == 0.0 {
        return 0.0;
    }
    sv.min() / smax
}

/// Index of the point farthest from the image centre.
fn farthest_from_centre(sensor: &[(f64, f64)]) -> usize {
    let mut best = 0;
    let mut best_r2 = -1.0;
    for (i, (Xd, Yd)) in sensor.iter().enumerate() {
        let r2 = Xd * Xd + Yd * Yd;
        if r2 > best_r2 {
            best = i;
            best_r2 = r2;
        }
    }
    best
}

#[inline]
fn same_sign(a: f64, b: f64) -> bool {
    a.is_sign_negative() == b.is_sign_negative()
}

/// Solve `[yc, -Yd] (f, Tz)^T = w Yd` for the focal length and `Tz`.
fn focal_and_tz(
    points: &[CalibrationPoint],
    sensor: &[(f64, f64)],
    r: &Matrix3<f64>,
    ty: f64,
) -> Result<(f64, f64)> {
    let n = points.len();
    let mut a = DMatrix::<f64>::zeros(n, 2);
    let mut b = DVector::<f64>::zeros(n);
    for (i, (p, (_, Yd))) in points.iter().zip(sensor.iter()).enumerate() {
        let yc = r[(1, 0)] * p.xw + r[(1, 1)] * p.yw + r[(1, 2)] * p.zw + ty;
        let w = r[(2, 0)] * p.xw + r[(2, 1)] * p.yw + r[(2, 2)] * p.zw;
        a[(i, 0)] = yc;
        a[(i, 1)] = -Yd;
        b[i] = w * Yd;
    }
    let x = lstsq(a, &b, "focal length")?;
    Ok((x[0], x[1]))
}

/// Complete a rotation from its first two rows.
fn complete_rotation(row1: RowVector3<f64>, row2: RowVector3<f64>) -> Result<Matrix3<f64>> {
    let row3 = row1.cross(&row2);
    let m = Matrix3::from_rows(&[row1, row2, row3]);
    let r = nearest_rotation(&m)?;
    let (rx, ry, rz) = angles_from_matrix(&r);
    Ok(matrix_from_angles(rx, ry, rz))
}

fn finish(
    r: &Matrix3<f64>,
    tx: f64,
    ty: f64,
    tz: f64,
    f: f64,
    sx: f64,
) -> Result<ExtrinsicEstimate> {
    if !(f > 0.0 && f.is_finite()) {
        return Err(degenerate(format!("estimated focal length {f} is not positive")));
    }
    if !(tz > 0.0 && tz.is_finite()) {
        return Err(degenerate(format!(
            "estimated Tz {tz} puts the target behind the camera"
        )));
    }
    if !(tx.is_finite() && ty.is_finite() && sx.is_finite() && sx > 0.0) {
        return Err(degenerate("non-finite pose estimate"));
    }
    let (rx, ry, rz) = angles_from_matrix(r);
    let est = ExtrinsicEstimate {
        rx,
        ry,
        rz,
        tx,
        ty,
        tz,
        f,
        sx,
    };
    debug!("linear estimate: {est:?}");
    Ok(est)
}

/// Estimate pose and focal length from points in the `zw = 0` plane.
///
/// Uses `sx` from `cp`, which cannot be recovered from a planar target.
pub fn estimate_coplanar(cp: &CameraParameters, data: &CalibrationData) -> Result<ExtrinsicEstimate> {
    let points = data.points();
    if points.len() < MIN_COPLANAR_POINTS {
        return Err(degenerate(format!(
            "coplanar calibration needs at least {MIN_COPLANAR_POINTS} points, got {}",
            points.len()
        )));
    }
    if let Some((i, p)) = points
        .iter()
        .enumerate()
        .find(|(_, p)| p.zw.abs() > EPSILON)
    {
        return Err(degenerate(format!(
            "coplanar calibration needs zw = 0, point {} has zw = {}",
            i + 1,
            p.zw
        )));
    }
    let world: Vec<[f64; 2]> = points.iter().map(|p| [p.xw, p.yw]).collect();
    if spread_ratio(&world) <= EPSILON {
        return Err(degenerate("calibration points are collinear"));
    }

    let sensor: Vec<(f64, f64)> = points.iter().map(|p| cp.image_to_sensor(p.Xf, p.Yf)).collect();

    let n = points.len();
    let mut a = DMatrix::<f64>::zeros(n, 5);
    let mut b = DVector::<f64>::zeros(n);
    for (i, (p, (Xd, Yd))) in points.iter().zip(sensor.iter()).enumerate() {
        a[(i, 0)] = Yd * p.xw;
        a[(i, 1)] = Yd * p.yw;
        a[(i, 2)] = *Yd;
        a[(i, 3)] = -Xd * p.xw;
        a[(i, 4)] = -Xd * p.yw;
        b[i] = *Xd;
    }
    let u = lstsq(a, &b, "radial alignment")?;
    let (r1p, r2p, txp, r4p, r5p) = (u[0], u[1], u[2], u[3], u[4]);

    let small = |v: f64| v.abs() < EPSILON;
    let ty_squared = if small(r1p) && small(r2p) {
        1.0 / (r4p * r4p + r5p * r5p)
    } else if small(r4p) && small(r5p) {
        1.0 / (r1p * r1p + r2p * r2p)
    } else if small(r1p) && small(r4p) {
        1.0 / (r2p * r2p + r5p * r5p)
    } else if small(r2p) && small(r5p) {
        1.0 / (r1p * r1p + r4p * r4p)
    } else {
        let sr = r1p * r1p + r2p * r2p + r4p * r4p + r5p * r5p;
        let ur = r1p * r5p - r4p * r2p;
        (sr - (sr * sr - 4.0 * ur * ur).max(0.0).sqrt()) / (2.0 * ur * ur)
    };
    if !(ty_squared > 0.0 && ty_squared.is_finite()) {
        return Err(degenerate(format!("cannot recover Ty (Ty^2 = {ty_squared})")));
    }

    let far = farthest_from_centre(&sensor);
    let (pf, (Xd_far, Yd_far)) = (points[far], sensor[far]);
    let mut ty = ty_squared.sqrt();
    let xc = (r1p * pf.xw + r2p * pf.yw + txp) * ty;
    let yc = (r4p * pf.xw + r5p * pf.yw) * ty + ty;
    if !(same_sign(xc, Xd_far) && same_sign(yc, Yd_far)) {
        ty = -ty;
    }

    let (r1, r2, tx, r4, r5) = (r1p * ty, r2p * ty, txp * ty, r4p * ty, r5p * ty);
    let r3 = (1.0 - r1 * r1 - r2 * r2).max(0.0).sqrt();
    let mut r6 = (1.0 - r4 * r4 - r5 * r5).max(0.0).sqrt();
    if r1 * r4 + r2 * r5 > 0.0 {
        r6 = -r6;
    }
    let mut r = complete_rotation(
        RowVector3::new(r1, r2, r3),
        RowVector3::new(r4, r5, r6),
    )?;

    let (mut f, mut tz) = focal_and_tz(points, &sensor, &r, ty)?;
    if f < 0.0 {
        debug!("negative focal length {f}, flipping rotation");
        r[(0, 2)] = -r[(0, 2)];
        r[(1, 2)] = -r[(1, 2)];
        r[(2, 0)] = -r[(2, 0)];
        r[(2, 1)] = -r[(2, 1)];
        let (rx, ry, rz) = angles_from_matrix(&r);
        r = matrix_from_angles(rx, ry, rz);
        (f, tz) = focal_and_tz(points, &sensor, &r, ty)?;
    }
    if f < 0.0 {
        return Err(degenerate(format!(
            "focal length remains negative ({f}) after flipping the rotation"
        )));
    }

    finish(&r, tx, ty, tz, f, cp.sx())
}

/// Estimate pose, focal length and `sx` from points spanning all three
/// world dimensions.
pub fn estimate_noncoplanar(
    cp: &CameraParameters,
    data: &CalibrationData,
) -> Result<ExtrinsicEstimate> {
    let points = data.points();
    if points.len() < MIN_NONCOPLANAR_POINTS {
        return Err(degenerate(format!(
            "noncoplanar calibration needs at least {MIN_NONCOPLANAR_POINTS} points, got {}",
            points.len()
        )));
    }
    let world: Vec<[f64; 3]> = points.iter().map(|p| [p.xw, p.yw, p.zw]).collect();
    if spread_ratio(&world) <= EPSILON {
        return Err(degenerate(
            "calibration points lie in a single plane, use coplanar calibration",
        ));
    }

    // sx is unknown, so it is left out of the horizontal coordinate
    let sensor: Vec<(f64, f64)> = points
        .iter()
        .map(|p| (cp.dpx() * (p.Xf - cp.cx()), cp.dpy() * (p.Yf - cp.cy())))
        .collect();

    let n = points.len();
    let mut a = DMatrix::<f64>::zeros(n, 7);
    let mut b = DVector::<f64>::zeros(n);
    for (i, (p, (Xd, Yd))) in points.iter().zip(sensor.iter()).enumerate() {
        a[(i, 0)] = Yd * p.xw;
        a[(i, 1)] = Yd * p.yw;
        a[(i, 2)] = Yd * p.zw;
        a[(i, 3)] = *Yd;
        a[(i, 4)] = -Xd * p.xw;
        a[(i, 5)] = -Xd * p.yw;
        a[(i, 6)] = -Xd * p.zw;
        b[i] = *Xd;
    }
    let u = lstsq(a, &b, "radial alignment")?;

    let row2_norm = (u[4] * u[4] + u[5] * u[5] + u[6] * u[6]).sqrt();
    if !(row2_norm > 0.0) {
        return Err(degenerate("cannot recover Ty"));
    }
    let ty_abs = 1.0 / row2_norm;
    let sx = (u[0] * u[0] + u[1] * u[1] + u[2] * u[2]).sqrt() * ty_abs;
    if !(sx > 0.0 && sx.is_finite()) {
        return Err(degenerate(format!("estimated sx {sx} is not positive")));
    }

    let rows = |ty: f64| {
        let row1 = RowVector3::new(u[0], u[1], u[2]) * (ty / sx);
        let row2 = RowVector3::new(u[4], u[5], u[6]) * ty;
        let tx = u[3] * ty / sx;
        (row1, row2, tx)
    };

    let far = farthest_from_centre(&sensor);
    let (pf, (Xd_far, Yd_far)) = (points[far], sensor[far]);
    let mut ty = ty_abs;
    let (row1, row2, tx) = rows(ty);
    let xc = row1[0] * pf.xw + row1[1] * pf.yw + row1[2] * pf.zw + tx;
    let yc = row2[0] * pf.xw + row2[1] * pf.yw + row2[2] * pf.zw + ty;
    if !(same_sign(xc, Xd_far) && same_sign(yc, Yd_far)) {
        ty = -ty;
    }
    let (row1, row2, tx) = rows(ty);

    let r = complete_rotation(row1, row2)?;
    let (f, tz) = focal_and_tz(points, &sensor, &r, ty)?;
    if f < 0.0 {
        return Err(degenerate(format!(
            "estimated focal length {f} is negative, check the handedness of the world frame"
        )));
    }

    finish(&r, tx, ty, tz, f, sx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::world_to_image;
    use approx::assert_abs_diff_eq;

    fn camera() -> CameraParameters {
        CameraParameters::new(512.0, 512.0, 0.01, 0.01, 0.01, 0.01, 256.0, 256.0, 1.0).unwrap()
    }

    fn truth() -> CalibrationConstants {
        CalibrationConstants::from_angles(
            16.0, 0.0, 0.0, 0.0, -90.0, -60.0, 1000.0, 0.3, -0.2, 0.1,
        )
        .unwrap()
    }

    fn render(cp: &CameraParameters, cc: &CalibrationConstants, world: &[[f64; 3]]) -> CalibrationData {
        let mut data = CalibrationData::new();
        for w in world {
            let (xf, yf) = world_to_image(cp, cc, w[0], w[1], w[2]).unwrap();
            data.push(CalibrationPoint::new(w[0], w[1], w[2], xf, yf))
                .unwrap();
        }
        data
    }

    fn grid(z_levels: &[f64]) -> Vec<[f64; 3]> {
        let mut out = Vec::new();
        for &z in z_levels {
            for i in 0..7 {
                for j in 0..7 {
                    out.push([20.0 + 25.0 * i as f64, 20.0 + 25.0 * j as f64, z]);
                }
            }
        }
        out
    }

    #[test]
    fn test_coplanar_exact() {
        let cp = camera();
        let cc = truth();
        let data = render(&cp, &cc, &grid(&[0.0]));
        let est = estimate_coplanar(&cp, &data).unwrap();
        assert_abs_diff_eq!(est.f, 16.0, epsilon = 1e-6);
        assert_abs_diff_eq!(est.tz, 1000.0, epsilon = 1e-4);
        assert_abs_diff_eq!(est.tx, -90.0, epsilon = 1e-6);
        assert_abs_diff_eq!(est.ty, -60.0, epsilon = 1e-6);
        assert_abs_diff_eq!(est.rotation(), *cc.rotation(), epsilon = 1e-8);
    }

    #[test]
    fn test_noncoplanar_exact() {
        let cp = camera();
        let cc = truth();
        // frame grabber with a 2% horizontal timing error
        let cp_true = cp.with_refined(256.0, 256.0, 1.02).unwrap();
        let data = render(&cp_true, &cc, &grid(&[0.0, -40.0, -80.0]));
        let est = estimate_noncoplanar(&cp, &data).unwrap();
        assert_abs_diff_eq!(est.sx, 1.02, epsilon = 1e-8);
        assert_abs_diff_eq!(est.f, 16.0, epsilon = 1e-6);
        assert_abs_diff_eq!(est.tz, 1000.0, epsilon = 1e-4);
        assert_abs_diff_eq!(est.rotation(), *cc.rotation(), epsilon = 1e-8);
    }

    #[test]
    fn test_collinear_rejected() {
        let cp = camera();
        let cc = truth();
        let world: Vec<[f64; 3]> = (0..10).map(|i| [10.0 * i as f64, 5.0 * i as f64, 0.0]).collect();
        let data = render(&cp, &cc, &world);
        let err = estimate_coplanar(&cp, &data).unwrap_err();
        assert!(matches!(err, TsaiError::DegenerateGeometry(_)));
    }

    #[test]
    fn test_coplanar_requires_z0() {
        let cp = camera();
        let cc = truth();
        let data = render(&cp, &cc, &grid(&[0.0, -40.0]));
        assert!(matches!(
            estimate_coplanar(&cp, &data),
            Err(TsaiError::DegenerateGeometry(_))
        ));
    }

    #[test]
    fn test_noncoplanar_rejects_plane() {
        let cp = camera();
        let cc = truth();
        let data = render(&cp, &cc, &grid(&[0.0]));
        assert!(matches!(
            estimate_noncoplanar(&cp, &data),
            Err(TsaiError::DegenerateGeometry(_))
        ));
    }

    #[test]
    fn test_too_few_points() {
        let cp = camera();
        let cc = truth();
        let world = grid(&[0.0]);
        let data = render(&cp, &cc, &world[..4]);
        assert!(matches!(
            estimate_coplanar(&cp, &data),
            Err(TsaiError::DegenerateGeometry(_))
        ));
    }
}
