use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand, ValueEnum};
use eyre::{self, Context, Result};
use serde::Serialize;
use tracing::info;

use tsai_cal::{
    formats, Calibration, CalibrationConstants, CalibrationMode, CalibrationSolver,
    CameraParameters, ErrorReport, SolverConfig,
};

mod logging;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Also write log messages to this file.
    #[arg(long, global = true)]
    log_file: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Project rows of world points to rounded pixel coordinates.
    Project(ProjectArgs),
    /// Calibrate a camera from world points and their observed pixels.
    Calibrate(CalibrateArgs),
}

#[derive(Parser)]
struct ProjectArgs {
    /// CSV file with a header line, then rows of `time,x1,y1,z1,x2,y2,z2,...`.
    observations: Utf8PathBuf,

    /// Camera parameters `Ncx,Nfx,dx,dy,dpx,dpy,Cx,Cy,sx`.
    camera_params: String,

    /// Calibration constants `f,kappa1,p1,p2,Tx,Ty,Tz,Rx,Ry,Rz`, followed by
    /// `r1..r9` with `--rotation-format matrix`.
    calibration_constants: String,

    #[arg(long, value_enum, default_value_t)]
    rotation_format: RotationFormat,

    /// Output file. Defaults to `<OBSERVATIONS stem>_a.csv` in the same
    /// directory.
    #[arg(long)]
    output: Option<Utf8PathBuf>,
}

#[derive(Parser)]
struct CalibrateArgs {
    /// CSV file of `xw,yw,zw,Xf,Yf` rows. `#` starts a comment.
    data: Utf8PathBuf,

    /// Camera parameters `Ncx,Nfx,dx,dy,dpx,dpy,Cx,Cy,sx`.
    camera_params: String,

    /// Calibration mode. Not used with `--extrinsic-only`.
    #[arg(long, value_enum, default_value_t, conflicts_with = "extrinsic_only")]
    mode: Mode,

    /// Starting calibration constants `f,kappa1,p1,p2,Tx,Ty,Tz,Rx,Ry,Rz`.
    #[arg(long, requires = "extrinsic_only")]
    seed: Option<String>,

    /// Refine only the pose of `--seed`, holding the intrinsics fixed.
    #[arg(long, requires = "seed")]
    extrinsic_only: bool,

    /// Save the result, with error statistics, as YAML.
    #[arg(long)]
    save_yaml: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, ValueEnum)]
enum RotationFormat {
    /// Rx, Ry, Rz Euler angles in radians.
    #[default]
    Angles,
    /// The angles plus the nine entries of the rotation matrix, row major.
    Matrix,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, ValueEnum)]
enum Mode {
    #[default]
    Coplanar,
    CoplanarFull,
    Noncoplanar,
    NoncoplanarFull,
}

impl From<Mode> for CalibrationMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Coplanar => CalibrationMode::Coplanar,
            Mode::CoplanarFull => CalibrationMode::CoplanarFullOptimization,
            Mode::Noncoplanar => CalibrationMode::Noncoplanar,
            Mode::NoncoplanarFull => CalibrationMode::NoncoplanarFullOptimization,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_file.as_deref())?;
    match cli.command {
        Command::Project(args) => project(args),
        Command::Calibrate(args) => calibrate(args),
    }
}

fn parse_camera(s: &str) -> Result<CameraParameters> {
    formats::parse_camera_parameters(s)
        .with_context(|| format!("Parsing camera parameters \"{s}\""))
}

fn parse_constants(s: &str, format: RotationFormat) -> Result<CalibrationConstants> {
    let cc = match format {
        RotationFormat::Angles => formats::parse_calibration_constants(s),
        RotationFormat::Matrix => formats::parse_calibration_constants_matrix_form(s),
    };
    cc.with_context(|| format!("Parsing calibration constants \"{s}\""))
}

fn project(args: ProjectArgs) -> Result<()> {
    let cp = parse_camera(&args.camera_params)?;
    let cc = parse_constants(&args.calibration_constants, args.rotation_format)?;

    let output = match args.output {
        Some(output) => output,
        None => {
            let output = formats::default_output_path(&args.observations);
            Utf8PathBuf::from_path_buf(output)
                .map_err(|p| eyre::eyre!("Output path {} is not UTF-8", p.display()))?
        }
    };

    let rows = formats::project_observation_file(&cp, &cc, &args.observations, &output)
        .with_context(|| format!("Projecting {} to {output}", args.observations))?;
    info!("{rows} rows projected from {} to {output}", args.observations);
    Ok(())
}

#[derive(Serialize)]
struct SavedCalibration<'a> {
    mode: Option<CalibrationMode>,
    camera: &'a CameraParameters,
    constants: &'a CalibrationConstants,
    errors: &'a ErrorReport,
    refinement: &'a tsai_cal::RefinementReport,
}

fn calibrate(args: CalibrateArgs) -> Result<()> {
    let cp = parse_camera(&args.camera_params)?;
    let data = formats::load_calibration_data(&args.data)
        .with_context(|| format!("Reading calibration data {}", args.data))?;

    let mut solver = CalibrationSolver::new(cp, SolverConfig::default());
    let (cal, mode) = match (&args.seed, args.extrinsic_only) {
        (Some(seed), true) => {
            let seed = parse_constants(seed, RotationFormat::Angles)?;
            let cal = solver
                .calibrate_extrinsics(&data, &seed)
                .with_context(|| format!("Refining extrinsics from {}", args.data))?;
            (cal, None)
        }
        _ => {
            let mode = CalibrationMode::from(args.mode);
            let cal = solver
                .calibrate(&data, mode)
                .with_context(|| format!("Calibrating from {}", args.data))?;
            (cal, Some(mode))
        }
    };

    let errors = ErrorReport::compute(&cal.camera, &cal.constants, &data)
        .with_context(|| format!("Computing errors for {}", args.data))?;

    println!("{}", formats::format_calibration_constants(&cal.constants));
    println!("{}", formats::format_camera_parameters(&cal.camera));
    println!("{errors}");

    if let Some(path) = &args.save_yaml {
        save_yaml(path, mode, &cal, &errors)
            .with_context(|| format!("Saving calibration to {path}"))?;
        info!("Calibration saved to {path}");
    }
    Ok(())
}

fn save_yaml(
    path: &Utf8Path,
    mode: Option<CalibrationMode>,
    cal: &Calibration,
    errors: &ErrorReport,
) -> Result<()> {
    let saved = SavedCalibration {
        mode,
        camera: &cal.camera,
        constants: &cal.constants,
        errors,
        refinement: &cal.report,
    };
    let local = chrono::Local::now();
    let mut f = std::fs::File::create(path)?;
    std::io::Write::write_all(
        &mut f,
        format!(
            "# Saved by {} at {}\n\
             # Mean distorted image plane error: {:.3} pix\n",
            env!("CARGO_PKG_NAME"),
            local,
            errors.distorted_image_plane.mean
        )
        .as_bytes(),
    )?;
    serde_yaml::to_writer(f, &saved)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn missing_arguments_are_rejected() {
        assert!(Cli::try_parse_from(["tsai-cal", "project", "obs.csv"]).is_err());
        assert!(Cli::try_parse_from([
            "tsai-cal",
            "project",
            "obs.csv",
            "1,2,3,4,5,6,7,8,9",
            "1,2,3,4,5,6,7,8,9,10",
            "extra"
        ])
        .is_err());
        // `--seed` and `--extrinsic-only` go together.
        assert!(Cli::try_parse_from([
            "tsai-cal",
            "calibrate",
            "data.csv",
            "1,2,3,4,5,6,7,8,9",
            "--extrinsic-only"
        ])
        .is_err());
    }

    #[test]
    fn mode_conflicts_with_extrinsic_only() {
        let base = [
            "tsai-cal",
            "calibrate",
            "data.csv",
            "1,2,3,4,5,6,7,8,9",
            "--seed",
            "12,0,0,0,0,0,1000,0,0,0",
            "--extrinsic-only",
        ];
        assert!(Cli::try_parse_from(base).is_ok());
        let with_mode = base.iter().copied().chain(["--mode", "noncoplanar"]);
        assert!(Cli::try_parse_from(with_mode).is_err());
    }

    #[test]
    fn mode_names() {
        let cli = Cli::try_parse_from([
            "tsai-cal",
            "calibrate",
            "data.csv",
            "1,2,3,4,5,6,7,8,9",
            "--mode",
            "noncoplanar-full",
        ])
        .unwrap();
        match cli.command {
            Command::Calibrate(args) => assert_eq!(
                CalibrationMode::from(args.mode),
                CalibrationMode::NoncoplanarFullOptimization
            ),
            Command::Project(_) => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn project_writes_default_output() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap().to_owned();
        let observations = dir.join("points.csv");
        std::fs::write(&observations, "t,x,y,z\n1.5,0,0,1000\n").unwrap();
        project(ProjectArgs {
            observations,
            camera_params: "1300,1030,0.00463,0.00463,0.00466,0.00463,515,512,1.0".into(),
            calibration_constants: "12.0,0,0,0,0,0,1000,0,0,0".into(),
            rotation_format: RotationFormat::Angles,
            output: None,
        })
        .unwrap();
        let written = std::fs::read_to_string(dir.join("points_a.csv")).unwrap();
        assert_eq!(written, "1.5,515,512\n");
    }
}
