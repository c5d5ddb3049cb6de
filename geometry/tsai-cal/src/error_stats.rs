#![allow(non_snake_case)]

use serde::{Deserialize, Serialize};

use crate::transform::{
    distorted_to_undistorted_image, world_to_camera, world_to_image, world_to_undistorted_sensor,
};
use crate::{CalibrationConstants, CalibrationData, CameraParameters, Result, TsaiError};

/// Summary of a per-point error measure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorStats {
    pub per_point: Vec<f64>,
    pub mean: f64,
    /// Sample standard deviation (`n - 1` denominator), zero for one point.
    pub std_dev: f64,
    pub max: f64,
    /// Sum of squared errors.
    pub sse: f64,
}

impl ErrorStats {
    pub fn from_per_point(per_point: Vec<f64>) -> Result<Self> {
        if per_point.is_empty() {
            return Err(TsaiError::DegenerateGeometry(
                "no points to compute error statistics".into(),
            ));
        }
        let n = per_point.len() as f64;
        let sum: f64 = per_point.iter().sum();
        let sse: f64 = per_point.iter().map(|e| e * e).sum();
        let mean = sum / n;
        let std_dev = if per_point.len() > 1 {
            (per_point.iter().map(|e| (e - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
        } else {
            0.0
        };
        let max = per_point.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Ok(Self {
            per_point,
            mean,
            std_dev,
            max,
            sse,
        })
    }
}

impl std::fmt::Display for ErrorStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "mean = {:.6}, stddev = {:.6}, max = {:.6}, sse = {:.6}",
            self.mean, self.std_dev, self.max, self.sse
        )
    }
}

/// Distance (pixels) between observed and projected distorted image points.
pub fn distorted_image_plane_error_stats(
    cp: &CameraParameters,
    cc: &CalibrationConstants,
    data: &CalibrationData,
) -> Result<ErrorStats> {
    let per_point = data
        .iter()
        .map(|p| {
            let (Xf, Yf) = world_to_image(cp, cc, p.xw, p.yw, p.zw)?;
            Ok((Xf - p.Xf).hypot(Yf - p.Yf))
        })
        .collect::<Result<Vec<_>>>()?;
    ErrorStats::from_per_point(per_point)
}

/// Distance (pixels) between observed points with distortion removed and
/// the undistorted projections.
pub fn undistorted_image_plane_error_stats(
    cp: &CameraParameters,
    cc: &CalibrationConstants,
    data: &CalibrationData,
) -> Result<ErrorStats> {
    let per_point = data
        .iter()
        .map(|p| {
            let (Xfu_obs, Yfu_obs) = distorted_to_undistorted_image(cp, cc, p.Xf, p.Yf)?;
            let (Xu, Yu) = world_to_undistorted_sensor(cc, p.xw, p.yw, p.zw)?;
            let (Xfu, Yfu) = cp.sensor_to_image(Xu, Yu);
            Ok((Xfu - Xfu_obs).hypot(Yfu - Yfu_obs))
        })
        .collect::<Result<Vec<_>>>()?;
    ErrorStats::from_per_point(per_point)
}

/// Observed point as undistorted sensor coordinates divided by `f`, i.e. the
/// direction `(x, y, 1)` of its back-projected ray in the camera frame.
fn ray_direction(
    cp: &CameraParameters,
    cc: &CalibrationConstants,
    Xf: f64,
    Yf: f64,
) -> Result<(f64, f64)> {
    let (Xd, Yd) = cp.image_to_sensor(Xf, Yf);
    let (Xu, Yu) = crate::distortion::undistort(cc, Xd, Yd)?;
    Ok((Xu / cc.f(), Yu / cc.f()))
}

/// Distance (mm) between each world point and the back-projected ray of its
/// observation, measured in the camera frame.
pub fn object_space_error_stats(
    cp: &CameraParameters,
    cc: &CalibrationConstants,
    data: &CalibrationData,
) -> Result<ErrorStats> {
    let per_point = data
        .iter()
        .map(|p| {
            let xc = world_to_camera(cc, p.xw, p.yw, p.zw);
            let (u, v) = ray_direction(cp, cc, p.Xf, p.Yf)?;
            let t = (xc.x * u + xc.y * v + xc.z) / (u * u + v * v + 1.0);
            let (dx, dy, dz) = (xc.x - t * u, xc.y - t * v, xc.z - t);
            Ok((dx * dx + dy * dy + dz * dz).sqrt())
        })
        .collect::<Result<Vec<_>>>()?;
    ErrorStats::from_per_point(per_point)
}

/// Normalized calibration error of Weng, Cohen and Herniou (1992).
///
/// Each point's error is the distance in the camera frame between the
/// world point and the back-projected observation at the same depth,
/// normalized by the size of a pixel projected to that depth. The overall
/// measure is the `mean`. A value near 1 means the residual error is
/// comparable to digitization noise.
pub fn normalized_calibration_error(
    cp: &CameraParameters,
    cc: &CalibrationConstants,
    data: &CalibrationData,
) -> Result<ErrorStats> {
    let f = cc.f();
    let per_point = data
        .iter()
        .map(|p| {
            let xc = world_to_camera(cc, p.xw, p.yw, p.zw);
            let (u, v) = ray_direction(cp, cc, p.Xf, p.Yf)?;
            let (x_hat, y_hat) = (xc.z * u, xc.z * v);
            let dx = xc.z * cp.dpx() / (cp.sx() * f);
            let dy = xc.z * cp.dpy() / f;
            let num = (x_hat - xc.x).powi(2) + (y_hat - xc.y).powi(2);
            let den = (dx * dx + dy * dy) / 12.0;
            Ok((num / den).sqrt())
        })
        .collect::<Result<Vec<_>>>()?;
    ErrorStats::from_per_point(per_point)
}

/// All error measures for one calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub distorted_image_plane: ErrorStats,
    pub undistorted_image_plane: ErrorStats,
    pub object_space: ErrorStats,
    pub normalized_calibration_error: ErrorStats,
}

impl ErrorReport {
    pub fn compute(
        cp: &CameraParameters,
        cc: &CalibrationConstants,
        data: &CalibrationData,
    ) -> Result<Self> {
        Ok(Self {
            distorted_image_plane: distorted_image_plane_error_stats(cp, cc, data)?,
            undistorted_image_plane: undistorted_image_plane_error_stats(cp, cc, data)?,
            object_space: object_space_error_stats(cp, cc, data)?,
            normalized_calibration_error: normalized_calibration_error(cp, cc, data)?,
        })
    }
}

impl std::fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "distorted image plane error [pix]:   {}", self.distorted_image_plane)?;
        writeln!(f, "undistorted image plane error [pix]: {}", self.undistorted_image_plane)?;
        writeln!(f, "object space error [mm]:             {}", self.object_space)?;
        write!(
            f,
            "normalized calibration error:        {:.6}",
            self.normalized_calibration_error.mean
        )
    }
}
