//! Conversions between roll/pitch/yaw angles and rotation matrices.
//!
//! The matrix is `R = Rz(Rz) * Ry(Ry) * Rx(Rx)`, mapping world coordinates to
//! camera coordinates. Row-major entries are named `r1..r9`.

use nalgebra::Matrix3;

use crate::{Result, TsaiError};

/// Tolerance for accepting a user supplied matrix as a rotation.
pub const ORTHONORMAL_TOLERANCE: f64 = 1.0e-6;

/// Build the rotation matrix for the angles `(rx, ry, rz)` in radians.
pub fn matrix_from_angles(rx: f64, ry: f64, rz: f64) -> Matrix3<f64> {
    let (sa, ca) = rx.sin_cos();
    let (sb, cb) = ry.sin_cos();
    let (sg, cg) = rz.sin_cos();

    #[rustfmt::skip]
    let m = Matrix3::new(
        cb * cg, cg * sa * sb - ca * sg, sa * sg + ca * cg * sb,
        cb * sg, sa * sb * sg + ca * cg, ca * sb * sg - cg * sa,
        -sb,     cb * sa,                ca * cb,
    );
    m
}

/// Recover `(rx, ry, rz)` from a rotation matrix.
///
/// This is the inverse of [matrix_from_angles] for a proper rotation. At
/// `ry = ±pi/2` (gimbal lock) `rz` is taken as `atan2(r4, r1)` and `rx`
/// absorbs the remaining freedom.
pub fn angles_from_matrix(m: &Matrix3<f64>) -> (f64, f64, f64) {
    let (r1, r2, r3) = (m[(0, 0)], m[(0, 1)], m[(0, 2)]);
    let (r4, r5, r6) = (m[(1, 0)], m[(1, 1)], m[(1, 2)]);
    let r7 = m[(2, 0)];

    let rz = r4.atan2(r1);
    let (sg, cg) = rz.sin_cos();
    let ry = (-r7).atan2(r1 * cg + r4 * sg);
    let rx = (r3 * sg - r6 * cg).atan2(r5 * cg - r2 * sg);
    (rx, ry, rz)
}

/// Frobenius norm of `R * R^T - I`.
pub fn orthonormality_error(m: &Matrix3<f64>) -> f64 {
    (m * m.transpose() - Matrix3::identity()).norm()
}

/// Check that `m` is a proper rotation to within [ORTHONORMAL_TOLERANCE].
pub fn check_rotation(m: &Matrix3<f64>) -> Result<()> {
    let err = orthonormality_error(m);
    if !err.is_finite() || err > ORTHONORMAL_TOLERANCE {
        return Err(TsaiError::malformed(
            None,
            None,
            format!("rotation matrix is not orthonormal (|R R^T - I| = {err:e})"),
        ));
    }
    let det = m.determinant();
    if (det - 1.0).abs() > ORTHONORMAL_TOLERANCE {
        return Err(TsaiError::malformed(
            None,
            None,
            format!("rotation matrix determinant is {det}, expected +1"),
        ));
    }
    Ok(())
}

/// Project an approximately orthonormal matrix onto the closest rotation.
///
/// Uses the polar decomposition via SVD and flips the sign of the last
/// singular vector if needed to give `det = +1`.
pub fn nearest_rotation(m: &Matrix3<f64>) -> Result<Matrix3<f64>> {
    if !m.iter().all(|v| v.is_finite()) {
        return Err(TsaiError::DegenerateGeometry(
            "non-finite entries in rotation estimate".into(),
        ));
    }
    let svd = m.svd(true, true);
    let u = svd
        .u
        .ok_or_else(|| TsaiError::DegenerateGeometry("SVD failed".into()))?;
    let v_t = svd
        .v_t
        .ok_or_else(|| TsaiError::DegenerateGeometry("SVD failed".into()))?;
    let r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_fixed = u;
        u_fixed.set_column(2, &(-u.column(2)));
        return Ok(u_fixed * v_t);
    }
    Ok(r)
}
