//! Extrinsic and lens distortion parameters.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::rotation::{angles_from_matrix, check_rotation, matrix_from_angles, nearest_rotation};
use crate::{Result, TsaiError};

/// How the rotation of a [CalibrationConstants] is specified on construction.
#[derive(Debug, Clone, PartialEq)]
pub enum RotationSpec {
    /// Angles in radians, `R = Rz(rz) * Ry(ry) * Rx(rx)`.
    Angles { rx: f64, ry: f64, rz: f64 },
    /// A rotation matrix, checked for orthonormality. It is stored
    /// normalized to the nearest exact rotation, so entries may move by up
    /// to [crate::rotation::ORTHONORMAL_TOLERANCE].
    Matrix(Matrix3<f64>),
}

/// The calibrated model: focal length, distortion, and world-to-camera pose.
///
/// The rotation is stored both as angles and as a matrix. The fields are
/// private and every constructor or setter derives one representation from
/// the other, so they always agree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "CalibrationConstantsRepr", into = "CalibrationConstantsRepr")]
pub struct CalibrationConstants {
    f: f64,
    kappa1: f64,
    p1: f64,
    p2: f64,
    t: Vector3<f64>,
    rx: f64,
    ry: f64,
    rz: f64,
    r: Matrix3<f64>,
}

#[derive(Serialize, Deserialize)]
struct CalibrationConstantsRepr {
    f: f64,
    kappa1: f64,
    p1: f64,
    p2: f64,
    #[serde(rename = "Tx")]
    tx: f64,
    #[serde(rename = "Ty")]
    ty: f64,
    #[serde(rename = "Tz")]
    tz: f64,
    #[serde(rename = "Rx")]
    rx: f64,
    #[serde(rename = "Ry")]
    ry: f64,
    #[serde(rename = "Rz")]
    rz: f64,
}

impl TryFrom<CalibrationConstantsRepr> for CalibrationConstants {
    type Error = TsaiError;
    fn try_from(r: CalibrationConstantsRepr) -> Result<Self> {
        CalibrationConstants::from_angles(
            r.f, r.kappa1, r.p1, r.p2, r.tx, r.ty, r.tz, r.rx, r.ry, r.rz,
        )
    }
}

impl From<CalibrationConstants> for CalibrationConstantsRepr {
    fn from(c: CalibrationConstants) -> Self {
        Self {
            f: c.f,
            kappa1: c.kappa1,
            p1: c.p1,
            p2: c.p2,
            tx: c.t.x,
            ty: c.t.y,
            tz: c.t.z,
            rx: c.rx,
            ry: c.ry,
            rz: c.rz,
        }
    }
}

impl CalibrationConstants {
    /// Field names in the order of the canonical 10-field CSV format.
    pub const FIELD_NAMES: [&'static str; 10] =
        ["f", "kappa1", "p1", "p2", "Tx", "Ty", "Tz", "Rx", "Ry", "Rz"];

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        f: f64,
        kappa1: f64,
        p1: f64,
        p2: f64,
        tx: f64,
        ty: f64,
        tz: f64,
        rotation: RotationSpec,
    ) -> Result<Self> {
        let scalars = [f, kappa1, p1, p2, tx, ty, tz];
        for (i, value) in scalars.iter().enumerate() {
            if !value.is_finite() {
                return Err(TsaiError::malformed(
                    None,
                    Some(i + 1),
                    format!("{} must be finite, got {value}", Self::FIELD_NAMES[i]),
                ));
            }
        }
        if f <= 0.0 {
            return Err(TsaiError::malformed(
                None,
                Some(1),
                format!("focal length must be > 0, got {f}"),
            ));
        }

        let (rx, ry, rz) = match rotation {
            RotationSpec::Angles { rx, ry, rz } => {
                for (i, value) in [rx, ry, rz].iter().enumerate() {
                    if !value.is_finite() {
                        return Err(TsaiError::malformed(
                            None,
                            Some(i + 8),
                            format!(
                                "{} must be finite, got {value}",
                                Self::FIELD_NAMES[i + 7]
                            ),
                        ));
                    }
                }
                (rx, ry, rz)
            }
            RotationSpec::Matrix(m) => {
                check_rotation(&m)?;
                angles_from_matrix(&nearest_rotation(&m)?)
            }
        };

        Ok(Self {
            f,
            kappa1,
            p1,
            p2,
            t: Vector3::new(tx, ty, tz),
            rx,
            ry,
            rz,
            r: matrix_from_angles(rx, ry, rz),
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn from_angles(
        f: f64,
        kappa1: f64,
        p1: f64,
        p2: f64,
        tx: f64,
        ty: f64,
        tz: f64,
        rx: f64,
        ry: f64,
        rz: f64,
    ) -> Result<Self> {
        Self::new(f, kappa1, p1, p2, tx, ty, tz, RotationSpec::Angles { rx, ry, rz })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn from_matrix(
        f: f64,
        kappa1: f64,
        p1: f64,
        p2: f64,
        tx: f64,
        ty: f64,
        tz: f64,
        r: Matrix3<f64>,
    ) -> Result<Self> {
        Self::new(f, kappa1, p1, p2, tx, ty, tz, RotationSpec::Matrix(r))
    }

    #[inline]
    pub fn f(&self) -> f64 {
        self.f
    }
    #[inline]
    pub fn kappa1(&self) -> f64 {
        self.kappa1
    }
    #[inline]
    pub fn p1(&self) -> f64 {
        self.p1
    }
    #[inline]
    pub fn p2(&self) -> f64 {
        self.p2
    }
    #[inline]
    pub fn tx(&self) -> f64 {
        self.t.x
    }
    #[inline]
    pub fn ty(&self) -> f64 {
        self.t.y
    }
    #[inline]
    pub fn tz(&self) -> f64 {
        self.t.z
    }
    #[inline]
    pub fn rx(&self) -> f64 {
        self.rx
    }
    #[inline]
    pub fn ry(&self) -> f64 {
        self.ry
    }
    #[inline]
    pub fn rz(&self) -> f64 {
        self.rz
    }

    /// `(rx, ry, rz)` in radians.
    pub fn angles(&self) -> (f64, f64, f64) {
        (self.rx, self.ry, self.rz)
    }

    pub fn translation(&self) -> &Vector3<f64> {
        &self.t
    }

    /// The world-to-camera rotation matrix.
    pub fn rotation(&self) -> &Matrix3<f64> {
        &self.r
    }

    /// Rotation entries `r1..r9` in row-major order.
    pub fn r(&self) -> [f64; 9] {
        let m = &self.r;
        [
            m[(0, 0)],
            m[(0, 1)],
            m[(0, 2)],
            m[(1, 0)],
            m[(1, 1)],
            m[(1, 2)],
            m[(2, 0)],
            m[(2, 1)],
            m[(2, 2)],
        ]
    }

    /// Set the rotation angles, recomputing the matrix.
    pub fn set_angles(&mut self, rx: f64, ry: f64, rz: f64) -> Result<()> {
        *self = Self::new(
            self.f,
            self.kappa1,
            self.p1,
            self.p2,
            self.t.x,
            self.t.y,
            self.t.z,
            RotationSpec::Angles { rx, ry, rz },
        )?;
        Ok(())
    }

    /// Set the rotation from a matrix, recovering the angles.
    pub fn set_rotation_matrix(&mut self, m: Matrix3<f64>) -> Result<()> {
        *self = Self::new(
            self.f,
            self.kappa1,
            self.p1,
            self.p2,
            self.t.x,
            self.t.y,
            self.t.z,
            RotationSpec::Matrix(m),
        )?;
        Ok(())
    }

    /// The parameters in the order of the canonical 10-field CSV format.
    pub fn to_array(&self) -> [f64; 10] {
        [
            self.f, self.kappa1, self.p1, self.p2, self.t.x, self.t.y, self.t.z, self.rx,
            self.ry, self.rz,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_angle_and_matrix_paths_agree() {
        let by_angles = crate::tests::tilted_constants();
        let by_matrix = CalibrationConstants::from_matrix(
            12.0,
            2.0e-3,
            0.0,
            0.0,
            -15.0,
            20.0,
            1100.0,
            *by_angles.rotation(),
        )
        .unwrap();
        assert_abs_diff_eq!(*by_angles.rotation(), *by_matrix.rotation(), epsilon = 1e-9);
        assert_abs_diff_eq!(by_angles.rx(), by_matrix.rx(), epsilon = 1e-9);
        assert_abs_diff_eq!(by_angles.ry(), by_matrix.ry(), epsilon = 1e-9);
        assert_abs_diff_eq!(by_angles.rz(), by_matrix.rz(), epsilon = 1e-9);
    }

    #[test]
    fn test_setters_keep_matrix_current() {
        let mut cc = crate::tests::tilted_constants();
        cc.set_angles(0.1, 0.2, 0.3).unwrap();
        assert_abs_diff_eq!(
            *cc.rotation(),
            matrix_from_angles(0.1, 0.2, 0.3),
            epsilon = 1e-15
        );

        let m = matrix_from_angles(-0.7, 0.05, 2.0);
        cc.set_rotation_matrix(m).unwrap();
        let (rx, ry, rz) = cc.angles();
        assert_abs_diff_eq!(rx, -0.7, epsilon = 1e-12);
        assert_abs_diff_eq!(ry, 0.05, epsilon = 1e-12);
        assert_abs_diff_eq!(rz, 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(*cc.rotation(), m, epsilon = 1e-12);
    }

    #[test]
    fn test_nearly_orthonormal_matrix_is_normalized() {
        let exact = matrix_from_angles(0.4, -0.25, 0.1);
        let mut m = exact;
        m[(0, 1)] += 2.0e-7;
        m[(2, 2)] -= 1.5e-7;
        let cc = CalibrationConstants::from_matrix(12.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1000.0, m)
            .unwrap();
        let r = cc.rotation();
        assert!(crate::rotation::orthonormality_error(r) < 1e-12);
        assert!((r - m).amax() < crate::rotation::ORTHONORMAL_TOLERANCE);
        assert_abs_diff_eq!(*r, exact, epsilon = 1e-6);
        let (rx, ry, rz) = cc.angles();
        assert_abs_diff_eq!(matrix_from_angles(rx, ry, rz), *r, epsilon = 1e-15);
    }

    #[test]
    fn test_rejects_bad_matrix() {
        let mut m = matrix_from_angles(0.1, 0.2, 0.3);
        m[(0, 0)] *= 1.01;
        let err = CalibrationConstants::from_matrix(10.0, 0.0, 0.0, 0.0, 0.0, 0.0, 100.0, m)
            .unwrap_err();
        assert!(matches!(err, TsaiError::MalformedInput { .. }));

        let mut cc = crate::tests::tilted_constants();
        let before = cc.clone();
        assert!(cc.set_rotation_matrix(m).is_err());
        assert_eq!(cc, before);
    }

    #[test]
    fn test_rejects_nonpositive_focal_length() {
        let err = CalibrationConstants::from_angles(
            0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 100.0, 0.0, 0.0, 0.0,
        )
        .unwrap_err();
        match err {
            TsaiError::MalformedInput { field, .. } => assert_eq!(field, Some(1)),
            e => panic!("unexpected error {e}"),
        }
    }

    #[test]
    fn test_serde_uses_angles() {
        let cc = crate::tests::tilted_constants();
        let buf = serde_yaml::to_string(&cc).unwrap();
        assert!(buf.contains("Rx:"));
        assert!(!buf.contains("r1"));
        let cc2: CalibrationConstants = serde_yaml::from_str(&buf).unwrap();
        assert_abs_diff_eq!(*cc.rotation(), *cc2.rotation(), epsilon = 1e-15);
        assert_eq!(cc.to_array(), cc2.to_array());
    }
}
