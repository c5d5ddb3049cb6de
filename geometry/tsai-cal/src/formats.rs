//! Delimited text formats.
//!
//! Parameter strings are single comma separated records of fixed arity.
//! Errors report the 1-based field (and, for files, line) at fault.
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use nalgebra::Matrix3;
use tracing::debug;

use crate::rotation::matrix_from_angles;
use crate::{
    CalibrationConstants, CalibrationData, CalibrationPoint, CameraParameters, Result,
    TsaiError,
};

/// Allowed difference between a supplied rotation matrix and the one implied
/// by the supplied angles.
pub const ANGLE_MATRIX_TOLERANCE: f64 = 1.0e-6;

const MATRIX_FORM_NAMES: [&str; 19] = [
    "f", "kappa1", "p1", "p2", "Tx", "Ty", "Tz", "Rx", "Ry", "Rz", "r1", "r2", "r3", "r4", "r5",
    "r6", "r7", "r8", "r9",
];

const CALIBRATION_DATA_NAMES: [&str; 5] = ["xw", "yw", "zw", "Xf", "Yf"];

fn line_of(record: &csv::StringRecord) -> Option<u64> {
    record.position().map(|p| p.line())
}

/// Parse every field of `record` as a number, requiring exactly
/// `names.len()` fields.
fn parse_fields(record: &csv::StringRecord, names: &[&str]) -> Result<Vec<f64>> {
    let row = line_of(record);
    if record.len() != names.len() {
        let field = record.len().min(names.len()) + 1;
        return Err(TsaiError::malformed(
            row,
            Some(field),
            format!("expected {} fields, got {}", names.len(), record.len()),
        ));
    }
    record
        .iter()
        .zip(names.iter())
        .enumerate()
        .map(|(i, (text, name))| {
            text.parse::<f64>().map_err(|_| {
                TsaiError::malformed(row, Some(i + 1), format!("{name}: cannot parse {text:?}"))
            })
        })
        .collect()
}

/// Read a single comma separated record from a string.
fn parse_single_record(s: &str, names: &[&str]) -> Result<Vec<f64>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(s.as_bytes());
    let mut record = csv::StringRecord::new();
    if !rdr.read_record(&mut record)? {
        return Err(TsaiError::malformed(
            None,
            Some(1),
            format!("empty input, expected {} fields", names.len()),
        ));
    }
    let values = parse_fields(&record, names)?;
    let mut extra = csv::StringRecord::new();
    if rdr.read_record(&mut extra)? {
        return Err(TsaiError::malformed(
            line_of(&extra),
            None,
            "expected a single line",
        ));
    }
    Ok(values)
}

/// Parse the 9-field form `Ncx,Nfx,dx,dy,dpx,dpy,Cx,Cy,sx`.
pub fn parse_camera_parameters(s: &str) -> Result<CameraParameters> {
    let v = parse_single_record(s, &CameraParameters::FIELD_NAMES)?;
    CameraParameters::new(v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7], v[8])
}

/// Parse the canonical 10-field form `f,kappa1,p1,p2,Tx,Ty,Tz,Rx,Ry,Rz`.
///
/// The rotation matrix is computed from the angles.
pub fn parse_calibration_constants(s: &str) -> Result<CalibrationConstants> {
    let v = parse_single_record(s, &CalibrationConstants::FIELD_NAMES)?;
    CalibrationConstants::from_angles(v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7], v[8], v[9])
}

/// Parse the 19-field form: the canonical 10 fields followed by `r1..r9`.
///
/// The matrix must be a rotation and must agree with the angles to within
/// [ANGLE_MATRIX_TOLERANCE]. The stored rotation is the matrix projected onto
/// the nearest exact rotation, with the angles recovered from it, so stored
/// `r1..r9` can differ from the input by up to that tolerance.
pub fn parse_calibration_constants_matrix_form(s: &str) -> Result<CalibrationConstants> {
    let v = parse_single_record(s, &MATRIX_FORM_NAMES)?;
    let m = Matrix3::from_row_slice(&v[10..19]);
    let cc = CalibrationConstants::from_matrix(v[0], v[1], v[2], v[3], v[4], v[5], v[6], m)?;

    let from_angles = matrix_from_angles(v[7], v[8], v[9]);
    let diff = (from_angles - m).amax();
    if !(diff <= ANGLE_MATRIX_TOLERANCE) {
        return Err(TsaiError::malformed(
            None,
            None,
            format!("r1..r9 differ from the matrix of Rx, Ry, Rz by up to {diff:e}"),
        ));
    }
    Ok(cc)
}

/// Canonical 10-field representation of `cc`.
pub fn format_calibration_constants(cc: &CalibrationConstants) -> String {
    join(&cc.to_array())
}

/// 9-field representation of `cp`.
pub fn format_camera_parameters(cp: &CameraParameters) -> String {
    join(&cp.to_array())
}

fn join(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Read calibration points, one `xw,yw,zw,Xf,Yf` row per line.
///
/// Lines starting with `#` are comments. There is no header.
pub fn read_calibration_data<R: Read>(rdr: R) -> Result<CalibrationData> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_reader(rdr);
    let mut data = CalibrationData::new();
    for record in rdr.records() {
        let record = record?;
        let v = parse_fields(&record, &CALIBRATION_DATA_NAMES)?;
        data.push(CalibrationPoint::new(v[0], v[1], v[2], v[3], v[4]))?;
    }
    debug!("read {} calibration points", data.len());
    Ok(data)
}

pub fn load_calibration_data<P: AsRef<Path>>(path: P) -> Result<CalibrationData> {
    let fd = std::fs::File::open(path.as_ref())?;
    read_calibration_data(fd)
}

/// Default output path for [project_observation_file]: `<stem>_a.csv` next
/// to the input.
pub fn default_output_path<P: AsRef<Path>>(input: P) -> PathBuf {
    let input = input.as_ref();
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    input.with_file_name(format!("{stem}_a.csv"))
}

/// Round half away from zero, failing if the result is not an `i64`.
fn nearest_pixel(v: f64, row: Option<u64>) -> Result<i64> {
    let r = v.round();
    // 2^63 is exact in f64 and one past i64::MAX
    if r.is_finite() && r >= -(2f64.powi(63)) && r < 2f64.powi(63) {
        Ok(r as i64)
    } else {
        Err(TsaiError::ProjectionUndefined(format!(
            "line {}: pixel coordinate {v} is out of range",
            row.unwrap_or(0)
        )))
    }
}

/// Project rows of world points to rounded pixel coordinates.
///
/// The input has a header line, which is skipped, then rows of a time token
/// followed by `x,y,z` triples. Each output row is the time token followed by
/// `Xf,Yf` for each triple, rounded to the nearest integer. Returns the number
/// of rows written.
pub fn project_observations<R: Read, W: Write>(
    cp: &CameraParameters,
    cc: &CalibrationConstants,
    rdr: R,
    wtr: W,
) -> Result<usize> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(rdr);
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_writer(wtr);

    let mut count = 0;
    for record in rdr.records() {
        let record = record?;
        let row = line_of(&record);
        let n_coords = record.len().saturating_sub(1);
        if n_coords == 0 || n_coords % 3 != 0 {
            return Err(TsaiError::malformed(
                row,
                Some(record.len() + 1),
                format!("expected a time and x,y,z triples, got {} coordinates", n_coords),
            ));
        }

        let time = &record[0];
        if time.parse::<f64>().is_err() {
            return Err(TsaiError::malformed(
                row,
                Some(1),
                format!("cannot parse time {time:?}"),
            ));
        }

        let mut out = Vec::with_capacity(1 + 2 * n_coords / 3);
        out.push(time.to_string());
        let mut xyz = [0.0; 3];
        for (i, text) in record.iter().enumerate().skip(1) {
            xyz[(i - 1) % 3] = text.parse::<f64>().map_err(|_| {
                TsaiError::malformed(row, Some(i + 1), format!("cannot parse {text:?}"))
            })?;
            if i % 3 == 0 {
                let (xf, yf) =
                    crate::transform::world_to_image(cp, cc, xyz[0], xyz[1], xyz[2]).map_err(
                        |e| match e {
                            TsaiError::ProjectionUndefined(msg) => TsaiError::ProjectionUndefined(
                                format!("line {}: {msg}", row.unwrap_or(0)),
                            ),
                            e => e,
                        },
                    )?;
                out.push(nearest_pixel(xf, row)?.to_string());
                out.push(nearest_pixel(yf, row)?.to_string());
            }
        }
        wtr.write_record(&out)?;
        count += 1;
    }
    wtr.flush()?;
    Ok(count)
}

/// Run [project_observations] from `input` to `output`.
pub fn project_observation_file<P: AsRef<Path>, Q: AsRef<Path>>(
    cp: &CameraParameters,
    cc: &CalibrationConstants,
    input: P,
    output: Q,
) -> Result<usize> {
    let rdr = std::fs::File::open(input.as_ref())?;
    let wtr = std::io::BufWriter::new(std::fs::File::create(output.as_ref())?);
    project_observations(cp, cc, rdr, wtr)
}
