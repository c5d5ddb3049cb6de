//! Forward and inverse coordinate transforms.
//!
//! The forward pipeline is world -> camera -> undistorted sensor ->
//! distorted sensor -> frame grabber pixel. Every function takes the
//! camera and the calibration explicitly.
#![allow(non_snake_case)]

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::distortion::{distort, undistort};
use crate::{CalibrationConstants, CameraParameters, Result, TsaiError, EPSILON};

/// Rigid transform of a world point (mm) into the camera frame.
#[inline]
pub fn world_to_camera(cc: &CalibrationConstants, xw: f64, yw: f64, zw: f64) -> Vector3<f64> {
    cc.rotation() * Vector3::new(xw, yw, zw) + cc.translation()
}

/// Inverse of [world_to_camera].
#[inline]
pub fn camera_to_world(cc: &CalibrationConstants, xc: &Vector3<f64>) -> Vector3<f64> {
    cc.rotation().transpose() * (xc - cc.translation())
}

/// Pinhole projection of a camera frame point onto the undistorted sensor
/// plane.
pub fn camera_to_undistorted_sensor(
    cc: &CalibrationConstants,
    xc: &Vector3<f64>,
) -> Result<(f64, f64)> {
    if xc.z <= 0.0 || xc.z.is_nan() {
        return Err(TsaiError::ProjectionUndefined(format!(
            "point is not in front of the camera (zc = {})",
            xc.z
        )));
    }
    Ok((cc.f() * xc.x / xc.z, cc.f() * xc.y / xc.z))
}

/// World point to undistorted sensor coordinates (mm).
pub fn world_to_undistorted_sensor(
    cc: &CalibrationConstants,
    xw: f64,
    yw: f64,
    zw: f64,
) -> Result<(f64, f64)> {
    camera_to_undistorted_sensor(cc, &world_to_camera(cc, xw, yw, zw))
}

/// Project a world point (mm) to distorted frame grabber coordinates (pixels).
pub fn world_to_image(
    cp: &CameraParameters,
    cc: &CalibrationConstants,
    xw: f64,
    yw: f64,
    zw: f64,
) -> Result<(f64, f64)> {
    let (Xu, Yu) = world_to_undistorted_sensor(cc, xw, yw, zw)?;
    let (Xd, Yd) = distort(cc, Xu, Yu);
    let (Xf, Yf) = cp.sensor_to_image(Xd, Yd);
    if !(Xf.is_finite() && Yf.is_finite()) {
        return Err(TsaiError::ProjectionUndefined(format!(
            "world point ({xw}, {yw}, {zw}) projects to non-finite pixel ({Xf}, {Yf})"
        )));
    }
    Ok((Xf, Yf))
}

/// Back-project a distorted image point onto the world plane `z = zw`.
pub fn image_to_world(
    cp: &CameraParameters,
    cc: &CalibrationConstants,
    Xfd: f64,
    Yfd: f64,
    zw: f64,
) -> Result<(f64, f64)> {
    let (Xd, Yd) = cp.image_to_sensor(Xfd, Yfd);
    let (Xu, Yu) = undistort(cc, Xd, Yd)?;

    let [r1, r2, r3, r4, r5, r6, r7, r8, r9] = cc.r();
    let (f, t) = (cc.f(), cc.translation());

    let a11 = f * r1 - Xu * r7;
    let a12 = f * r2 - Xu * r8;
    let a21 = f * r4 - Yu * r7;
    let a22 = f * r5 - Yu * r8;
    let b1 = Xu * (r9 * zw + t.z) - f * (r3 * zw + t.x);
    let b2 = Yu * (r9 * zw + t.z) - f * (r6 * zw + t.y);

    let det = a11 * a22 - a12 * a21;
    let norm = a11.abs().max(a12.abs()).max(a21.abs()).max(a22.abs());
    if !det.is_finite() || det.abs() <= EPSILON * norm * norm {
        return Err(TsaiError::ProjectionUndefined(format!(
            "ray through ({Xfd}, {Yfd}) is parallel to the plane z = {zw}"
        )));
    }
    let xw = (b1 * a22 - a12 * b2) / det;
    let yw = (a11 * b2 - b1 * a21) / det;
    Ok((xw, yw))
}

pub fn distorted_to_undistorted_sensor(
    cc: &CalibrationConstants,
    Xd: f64,
    Yd: f64,
) -> Result<(f64, f64)> {
    undistort(cc, Xd, Yd)
}

pub fn undistorted_to_distorted_sensor(cc: &CalibrationConstants, Xu: f64, Yu: f64) -> (f64, f64) {
    distort(cc, Xu, Yu)
}

/// Remove lens distortion from a frame grabber coordinate (pixels).
pub fn distorted_to_undistorted_image(
    cp: &CameraParameters,
    cc: &CalibrationConstants,
    Xfd: f64,
    Yfd: f64,
) -> Result<(f64, f64)> {
    let (Xd, Yd) = cp.image_to_sensor(Xfd, Yfd);
    let (Xu, Yu) = undistort(cc, Xd, Yd)?;
    Ok(cp.sensor_to_image(Xu, Yu))
}

/// Apply lens distortion to an undistorted frame grabber coordinate (pixels).
pub fn undistorted_to_distorted_image(
    cp: &CameraParameters,
    cc: &CalibrationConstants,
    Xfu: f64,
    Yfu: f64,
) -> (f64, f64) {
    let (Xu, Yu) = cp.image_to_sensor(Xfu, Yfu);
    let (Xd, Yd) = distort(cc, Xu, Yu);
    cp.sensor_to_image(Xd, Yd)
}

/// A camera together with its calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TsaiCamera {
    params: CameraParameters,
    constants: CalibrationConstants,
}

impl TsaiCamera {
    pub fn new(params: CameraParameters, constants: CalibrationConstants) -> Self {
        Self { params, constants }
    }

    pub fn params(&self) -> &CameraParameters {
        &self.params
    }

    pub fn constants(&self) -> &CalibrationConstants {
        &self.constants
    }

    pub fn into_parts(self) -> (CameraParameters, CalibrationConstants) {
        (self.params, self.constants)
    }

    pub fn world_to_camera(&self, xw: f64, yw: f64, zw: f64) -> Vector3<f64> {
        world_to_camera(&self.constants, xw, yw, zw)
    }

    pub fn camera_to_world(&self, xc: &Vector3<f64>) -> Vector3<f64> {
        camera_to_world(&self.constants, xc)
    }

    pub fn world_to_image(&self, xw: f64, yw: f64, zw: f64) -> Result<(f64, f64)> {
        world_to_image(&self.params, &self.constants, xw, yw, zw)
    }

    pub fn image_to_world(&self, Xfd: f64, Yfd: f64, zw: f64) -> Result<(f64, f64)> {
        image_to_world(&self.params, &self.constants, Xfd, Yfd, zw)
    }

    pub fn distorted_to_undistorted_image(&self, Xfd: f64, Yfd: f64) -> Result<(f64, f64)> {
        distorted_to_undistorted_image(&self.params, &self.constants, Xfd, Yfd)
    }

    pub fn undistorted_to_distorted_image(&self, Xfu: f64, Yfu: f64) -> (f64, f64) {
        undistorted_to_distorted_image(&self.params, &self.constants, Xfu, Yfu)
    }

    pub fn distorted_to_undistorted_sensor(&self, Xd: f64, Yd: f64) -> Result<(f64, f64)> {
        distorted_to_undistorted_sensor(&self.constants, Xd, Yd)
    }

    pub fn undistorted_to_distorted_sensor(&self, Xu: f64, Yu: f64) -> (f64, f64) {
        undistorted_to_distorted_sensor(&self.constants, Xu, Yu)
    }
}
