#![allow(non_snake_case)]

use serde::{Deserialize, Serialize};

use crate::{Result, TsaiError, EPSILON, MAX_POINTS};

/// A world point (mm) and its observed frame grabber location (pixels).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    pub xw: f64,
    pub yw: f64,
    pub zw: f64,
    #[serde(rename = "Xf")]
    pub Xf: f64,
    #[serde(rename = "Yf")]
    pub Yf: f64,
}

impl CalibrationPoint {
    pub fn new(xw: f64, yw: f64, zw: f64, Xf: f64, Yf: f64) -> Self {
        Self { xw, yw, zw, Xf, Yf }
    }
}

/// An ordered set of at most [MAX_POINTS] point correspondences.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CalibrationData {
    points: Vec<CalibrationPoint>,
}

impl CalibrationData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a vector of points, failing if there are too many.
    pub fn from_points(points: Vec<CalibrationPoint>) -> Result<Self> {
        if points.len() > MAX_POINTS {
            return Err(TsaiError::PointCountExceeded {
                count: points.len(),
                max: MAX_POINTS,
            });
        }
        Ok(Self { points })
    }

    pub fn push(&mut self, point: CalibrationPoint) -> Result<()> {
        if self.points.len() >= MAX_POINTS {
            return Err(TsaiError::PointCountExceeded {
                count: self.points.len() + 1,
                max: MAX_POINTS,
            });
        }
        self.points.push(point);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[CalibrationPoint] {
        &self.points
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CalibrationPoint> {
        self.points.iter()
    }

    /// True if every point lies in the `zw = 0` plane (to within [EPSILON]).
    pub fn is_coplanar_z0(&self) -> bool {
        self.points.iter().all(|p| p.zw.abs() <= EPSILON)
    }
}

impl<'a> IntoIterator for &'a CalibrationData {
    type Item = &'a CalibrationPoint;
    type IntoIter = std::slice::Iter<'a, CalibrationPoint>;
    fn into_iter(self) -> Self::IntoIter {
        self.points.iter()
    }
}

impl<'de> Deserialize<'de> for CalibrationData {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Repr {
            points: Vec<CalibrationPoint>,
        }
        let repr = Repr::deserialize(deserializer)?;
        CalibrationData::from_points(repr.points).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_limit() {
        let mut data = CalibrationData::new();
        for i in 0..MAX_POINTS {
            data.push(CalibrationPoint::new(i as f64, 0.0, 0.0, 1.0, 2.0))
                .unwrap();
        }
        assert_eq!(data.len(), MAX_POINTS);
        match data.push(CalibrationPoint::new(0.0, 0.0, 0.0, 0.0, 0.0)) {
            Err(TsaiError::PointCountExceeded { count, max }) => {
                assert_eq!(count, MAX_POINTS + 1);
                assert_eq!(max, MAX_POINTS);
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(data.len(), MAX_POINTS);
    }

    #[test]
    fn test_coplanar() {
        let mut data = CalibrationData::new();
        data.push(CalibrationPoint::new(1.0, 2.0, 0.0, 0.0, 0.0))
            .unwrap();
        data.push(CalibrationPoint::new(3.0, 2.0, 1e-10, 0.0, 0.0))
            .unwrap();
        assert!(data.is_coplanar_z0());
        data.push(CalibrationPoint::new(3.0, 2.0, 0.5, 0.0, 0.0))
            .unwrap();
        assert!(!data.is_coplanar_z0());
    }

    #[test]
    fn test_deserialize_enforces_limit() {
        let points = vec![CalibrationPoint::new(0.0, 0.0, 0.0, 0.0, 0.0); MAX_POINTS];
        let buf = serde_yaml::to_string(&CalibrationData {
            points: points.clone(),
        })
        .unwrap();
        assert_eq!(
            serde_yaml::from_str::<CalibrationData>(&buf).unwrap().len(),
            MAX_POINTS
        );

        let mut points = points;
        points.push(CalibrationPoint::new(1.0, 0.0, 0.0, 0.0, 0.0));
        let buf = serde_yaml::to_string(&CalibrationData { points }).unwrap();
        assert!(serde_yaml::from_str::<CalibrationData>(&buf).is_err());
    }
}
