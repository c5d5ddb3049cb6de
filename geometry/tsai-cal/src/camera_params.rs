#![allow(non_snake_case)]

use serde::{Deserialize, Serialize};

use crate::{Result, TsaiError};

/// Fixed parameters of a camera + frame grabber combination.
///
/// These are usually taken from the manufacturer's specifications. `Cx`, `Cy`
/// (the center of radial lens distortion) and `sx` (the horizontal scale
/// uncertainty factor) can also be refined by the full-optimization
/// calibration modes, which return an updated copy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "CameraParametersRepr")]
pub struct CameraParameters {
    /// [sel] Number of sensor elements in the camera's x direction
    pub(crate) Ncx: f64,
    /// [pix] Number of pixels in the frame grabber's x direction
    pub(crate) Nfx: f64,
    /// [mm/sel] X dimension of the camera's sensor element
    pub(crate) dx: f64,
    /// [mm/sel] Y dimension of the camera's sensor element
    pub(crate) dy: f64,
    /// [mm/pix] Effective X dimension of a frame grabber pixel
    pub(crate) dpx: f64,
    /// [mm/pix] Effective Y dimension of a frame grabber pixel
    pub(crate) dpy: f64,
    /// [pix] Z axis intercept of the camera coordinate system
    pub(crate) Cx: f64,
    /// [pix] Z axis intercept of the camera coordinate system
    pub(crate) Cy: f64,
    /// [] Scale factor to compensate for any error in dpx
    pub(crate) sx: f64,
}

#[derive(Deserialize)]
struct CameraParametersRepr {
    #[serde(rename = "Ncx")]
    ncx: f64,
    #[serde(rename = "Nfx")]
    nfx: f64,
    dx: f64,
    dy: f64,
    dpx: f64,
    dpy: f64,
    #[serde(rename = "Cx")]
    cx: f64,
    #[serde(rename = "Cy")]
    cy: f64,
    sx: f64,
}

impl TryFrom<CameraParametersRepr> for CameraParameters {
    type Error = TsaiError;
    fn try_from(r: CameraParametersRepr) -> Result<Self> {
        CameraParameters::new(r.ncx, r.nfx, r.dx, r.dy, r.dpx, r.dpy, r.cx, r.cy, r.sx)
    }
}

impl CameraParameters {
    /// Field names in the order of the 9-field CSV format.
    pub const FIELD_NAMES: [&'static str; 9] =
        ["Ncx", "Nfx", "dx", "dy", "dpx", "dpy", "Cx", "Cy", "sx"];

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        Ncx: f64,
        Nfx: f64,
        dx: f64,
        dy: f64,
        dpx: f64,
        dpy: f64,
        Cx: f64,
        Cy: f64,
        sx: f64,
    ) -> Result<Self> {
        let cp = Self::validated(Ncx, Nfx, dx, dy, dpx, dpy, Cx, Cy, sx)?;
        if (sx - 1.0).abs() > 0.1 {
            tracing::warn!("scale factor sx = {sx} is far from 1.0");
        }
        Ok(cp)
    }

    #[allow(clippy::too_many_arguments)]
    fn validated(
        Ncx: f64,
        Nfx: f64,
        dx: f64,
        dy: f64,
        dpx: f64,
        dpy: f64,
        Cx: f64,
        Cy: f64,
        sx: f64,
    ) -> Result<Self> {
        let positive = [
            ("Ncx", Ncx),
            ("Nfx", Nfx),
            ("dx", dx),
            ("dy", dy),
            ("dpx", dpx),
            ("dpy", dpy),
            ("sx", sx),
        ];
        for (i, (name, value)) in positive.iter().enumerate() {
            if !value.is_finite() || *value <= 0.0 {
                let field = Self::FIELD_NAMES.iter().position(|n| n == name).unwrap_or(i);
                return Err(TsaiError::malformed(
                    None,
                    Some(field + 1),
                    format!("camera parameter {name} must be finite and > 0, got {value}"),
                ));
            }
        }
        for (field, name, value) in [(7, "Cx", Cx), (8, "Cy", Cy)] {
            if !value.is_finite() {
                return Err(TsaiError::malformed(
                    None,
                    Some(field),
                    format!("camera parameter {name} must be finite, got {value}"),
                ));
            }
        }
        Ok(Self {
            Ncx,
            Nfx,
            dx,
            dy,
            dpx,
            dpy,
            Cx,
            Cy,
            sx,
        })
    }

    /// Build parameters from sensor geometry, deriving the effective frame
    /// grabber pixel size.
    ///
    /// The frame grabber resamples `Ncx` sensor elements into `Nfx` pixels, so
    /// `dpx = dx * Ncx / Nfx`. Rows are not resampled, so `dpy = dy`.
    pub fn from_sensor(
        Ncx: f64,
        Nfx: f64,
        dx: f64,
        dy: f64,
        Cx: f64,
        Cy: f64,
        sx: f64,
    ) -> Result<Self> {
        if !(Nfx.is_finite() && Nfx > 0.0) {
            return Err(TsaiError::malformed(
                None,
                Some(2),
                format!("camera parameter Nfx must be finite and > 0, got {Nfx}"),
            ));
        }
        Self::new(Ncx, Nfx, dx, dy, dx * Ncx / Nfx, dy, Cx, Cy, sx)
    }

    /// The parameters in the order of the 9-field CSV format.
    pub fn to_array(&self) -> [f64; 9] {
        [
            self.Ncx, self.Nfx, self.dx, self.dy, self.dpx, self.dpy, self.Cx, self.Cy, self.sx,
        ]
    }

    #[inline]
    pub fn ncx(&self) -> f64 {
        self.Ncx
    }
    #[inline]
    pub fn nfx(&self) -> f64 {
        self.Nfx
    }
    #[inline]
    pub fn dx(&self) -> f64 {
        self.dx
    }
    #[inline]
    pub fn dy(&self) -> f64 {
        self.dy
    }
    #[inline]
    pub fn dpx(&self) -> f64 {
        self.dpx
    }
    #[inline]
    pub fn dpy(&self) -> f64 {
        self.dpy
    }
    #[inline]
    pub fn cx(&self) -> f64 {
        self.Cx
    }
    #[inline]
    pub fn cy(&self) -> f64 {
        self.Cy
    }
    #[inline]
    pub fn sx(&self) -> f64 {
        self.sx
    }

    /// Return a copy with a new principal point and scale factor.
    ///
    /// Used by the full-optimization modes; the original is left untouched.
    pub fn with_refined(&self, Cx: f64, Cy: f64, sx: f64) -> Result<Self> {
        Self::validated(
            self.Ncx, self.Nfx, self.dx, self.dy, self.dpx, self.dpy, Cx, Cy, sx,
        )
    }

    /// Convert frame grabber pixels to distorted sensor plane coordinates (mm).
    #[inline]
    pub fn image_to_sensor(&self, Xf: f64, Yf: f64) -> (f64, f64) {
        (self.dpx * (Xf - self.Cx) / self.sx, self.dpy * (Yf - self.Cy))
    }

    /// Convert sensor plane coordinates (mm) to frame grabber pixels.
    #[inline]
    pub fn sensor_to_image(&self, Xd: f64, Yd: f64) -> (f64, f64) {
        (Xd * self.sx / self.dpx + self.Cx, Yd / self.dpy + self.Cy)
    }
}
