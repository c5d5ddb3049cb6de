//! Lens distortion on the sensor plane.
//!
//! Coordinates here are in mm on the sensor plane, relative to the
//! principal point. The model is one radial term `kappa1` and two
//! decentering terms `p1`, `p2`:
//!
//! ```text
//! r^2 = Xu^2 + Yu^2
//! Xd  = Xu (1 + kappa1 r^2) + 2 p1 Xu Yu + p2 (r^2 + 2 Xu^2)
//! Yd  = Yu (1 + kappa1 r^2) + p1 (r^2 + 2 Yu^2) + 2 p2 Xu Yu
//! ```
#![allow(non_snake_case)]

use crate::{CalibrationConstants, Result, TsaiError, EPSILON};

const MAX_NEWTON_STEPS: usize = 20;

/// Apply lens distortion to undistorted sensor coordinates.
pub fn distort(cc: &CalibrationConstants, Xu: f64, Yu: f64) -> (f64, f64) {
    distort_raw(cc.kappa1(), cc.p1(), cc.p2(), Xu, Yu)
}

#[inline]
fn distort_raw(kappa1: f64, p1: f64, p2: f64, Xu: f64, Yu: f64) -> (f64, f64) {
    let r2 = Xu * Xu + Yu * Yu;
    let radial = 1.0 + kappa1 * r2;
    let Xd = Xu * radial + 2.0 * p1 * Xu * Yu + p2 * (r2 + 2.0 * Xu * Xu);
    let Yd = Yu * radial + p1 * (r2 + 2.0 * Yu * Yu) + 2.0 * p2 * Xu * Yu;
    (Xd, Yd)
}

/// Remove lens distortion from distorted sensor coordinates.
///
/// Fails with [TsaiError::ProjectionUndefined] when no undistorted point maps
/// to `(Xd, Yd)`, which happens beyond the maximum radius of a barrel
/// (`kappa1 < 0`) lens.
pub fn undistort(cc: &CalibrationConstants, Xd: f64, Yd: f64) -> Result<(f64, f64)> {
    let (kappa1, p1, p2) = (cc.kappa1(), cc.p1(), cc.p2());

    let radial = undistort_radial(kappa1, Xd, Yd);
    if p1 == 0.0 && p2 == 0.0 {
        return radial;
    }

    // Newton on the full model, seeded with the radial-only solution.
    let (mut Xu, mut Yu) = radial.unwrap_or((Xd, Yd));
    for _ in 0..MAX_NEWTON_STEPS {
        let (fx, fy) = distort_raw(kappa1, p1, p2, Xu, Yu);
        let (ex, ey) = (fx - Xd, fy - Yd);

        let r2 = Xu * Xu + Yu * Yu;
        let j11 = 1.0 + kappa1 * r2 + 2.0 * kappa1 * Xu * Xu + 2.0 * p1 * Yu + 6.0 * p2 * Xu;
        let j12 = 2.0 * kappa1 * Xu * Yu + 2.0 * p1 * Xu + 2.0 * p2 * Yu;
        let j22 = 1.0 + kappa1 * r2 + 2.0 * kappa1 * Yu * Yu + 6.0 * p1 * Yu + 2.0 * p2 * Xu;
        let det = j11 * j22 - j12 * j12;
        if det.abs() < f64::EPSILON || !det.is_finite() {
            break;
        }
        let dx = (j22 * ex - j12 * ey) / det;
        let dy = (j11 * ey - j12 * ex) / det;
        Xu -= dx;
        Yu -= dy;
        if dx.hypot(dy) < EPSILON {
            return Ok((Xu, Yu));
        }
    }
    Err(TsaiError::ProjectionUndefined(format!(
        "undistortion of ({Xd}, {Yd}) did not converge"
    )))
}

/// Radial-only undistortion.
///
/// Solves `kappa1 ru^3 + ru - rd = 0` for the undistorted radius in closed
/// form and scales `(Xd, Yd)` by `ru / rd`.
fn undistort_radial(kappa1: f64, Xd: f64, Yd: f64) -> Result<(f64, f64)> {
    let rd = Xd.hypot(Yd);
    if kappa1 == 0.0 || rd == 0.0 {
        return Ok((Xd, Yd));
    }

    let ru = solve_radius(kappa1, rd).ok_or_else(|| {
        TsaiError::ProjectionUndefined(format!(
            "distorted radius {rd} exceeds the largest radius reachable with kappa1 = {kappa1}"
        ))
    })?;

    let scale = ru / rd;
    Ok((Xd * scale, Yd * scale))
}

/// Cardano solution of `kappa1 ru^3 + ru - rd = 0` for the smallest positive
/// root, with one Newton step to polish it.
fn solve_radius(kappa1: f64, rd: f64) -> Option<f64> {
    // depressed cubic ru^3 + p ru + q = 0
    let p = 1.0 / kappa1;
    let q = -rd / kappa1;
    let Q = p / 3.0;
    let R = -q / 2.0;
    let D = Q * Q * Q + R * R;

    let mut ru = if D > 0.0 {
        // one real root
        let sqrt_d = D.sqrt();
        let S = (R + sqrt_d).cbrt();
        let T = (R - sqrt_d).cbrt();
        S + T
    } else {
        // three real roots
        let sqrt_neg_d = (-D).sqrt();
        let S = R.hypot(sqrt_neg_d).cbrt();
        let T = sqrt_neg_d.atan2(R) / 3.0;
        let (sin_t, cos_t) = T.sin_cos();
        -S * cos_t + 3f64.sqrt() * S * sin_t
    };

    if !ru.is_finite() || ru <= 0.0 {
        return None;
    }

    let g = kappa1 * ru * ru * ru + ru - rd;
    let dg = 3.0 * kappa1 * ru * ru + 1.0;
    if dg != 0.0 {
        ru -= g / dg;
    }
    Some(ru)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn constants(kappa1: f64, p1: f64, p2: f64) -> CalibrationConstants {
        CalibrationConstants::from_angles(8.0, kappa1, p1, p2, 0.0, 0.0, 500.0, 0.0, 0.0, 0.0)
            .unwrap()
    }

    fn sensor_grid() -> Vec<(f64, f64)> {
        let mut out = Vec::new();
        for i in -5..=5 {
            for j in -5..=5 {
                out.push((i as f64 * 0.6, j as f64 * 0.45));
            }
        }
        out
    }

    #[test]
    fn test_no_distortion_is_identity() {
        let cc = constants(0.0, 0.0, 0.0);
        for (x, y) in sensor_grid() {
            assert_eq!(distort(&cc, x, y), (x, y));
            assert_eq!(undistort(&cc, x, y).unwrap(), (x, y));
        }
    }

    #[test]
    fn test_radial_roundtrip() {
        for kappa1 in [5.0e-3, 1.0e-4, -1.0e-3, -4.0e-3] {
            let cc = constants(kappa1, 0.0, 0.0);
            for (xu, yu) in sensor_grid() {
                let (xd, yd) = distort(&cc, xu, yu);
                let (x2, y2) = undistort(&cc, xd, yd).unwrap();
                assert_abs_diff_eq!(x2, xu, epsilon = EPSILON);
                assert_abs_diff_eq!(y2, yu, epsilon = EPSILON);
            }
        }
    }

    #[test]
    fn test_decentering_roundtrip() {
        let cc = constants(2.0e-3, 3.0e-4, -2.0e-4);
        for (xu, yu) in sensor_grid() {
            let (xd, yd) = distort(&cc, xu, yu);
            let (x2, y2) = undistort(&cc, xd, yd).unwrap();
            assert_abs_diff_eq!(x2, xu, epsilon = EPSILON);
            assert_abs_diff_eq!(y2, yu, epsilon = EPSILON);
        }
    }

    #[test]
    fn test_barrel_beyond_max_radius() {
        // kappa1 ru^3 + ru peaks at ru = sqrt(-1 / (3 kappa1)).
        let kappa1: f64 = -1.0e-2;
        let ru_max = (-1.0 / (3.0 * kappa1)).sqrt();
        let rd_max = kappa1 * ru_max.powi(3) + ru_max;
        let cc = constants(kappa1, 0.0, 0.0);

        let (x, _) = undistort(&cc, 0.99 * rd_max, 0.0).unwrap();
        assert!(x > 0.0 && x < ru_max);

        let err = undistort(&cc, 1.01 * rd_max, 0.0).unwrap_err();
        assert!(matches!(err, TsaiError::ProjectionUndefined(_)));
    }

    #[test]
    fn test_solve_radius_picks_small_root() {
        // Two positive roots exist for this barrel lens; the one
        // continuous with ru = rd is the smaller.
        let kappa1: f64 = -1.0e-2;
        let rd = 3.0;
        let ru = solve_radius(kappa1, rd).unwrap();
        assert_abs_diff_eq!(kappa1 * ru.powi(3) + ru, rd, epsilon = 1e-12);
        assert!(ru < (-1.0 / (3.0 * kappa1)).sqrt());
    }
}
