use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::Parser;
use log::{error, info, warn};
use nalgebra as na;
use scene::{Simulator, Trajectory};
use vio::{DiagnosticsSink, Estimator, EstimatorConfig, Measurement, Signal, Timestamp, VisualOutcome};

mod scene;
mod util;

/// Software-in-the-loop run of the visual-inertial estimator on a synthetic room
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// JSON estimator configuration; unspecified fields keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Simulated time (s)
    #[arg(long, default_value_t = 30.0)]
    duration: f64,

    /// Inertial sample rate (Hz)
    #[arg(long, default_value_t = 200.0)]
    imu_rate: f64,

    /// Camera frame rate (Hz)
    #[arg(long, default_value_t = 20.0)]
    camera_rate: f64,

    /// Attach the true depth to every observation
    #[arg(long)]
    depth_hints: bool,
}

/// Camera looking along body +x, image rows along body -z
pub(crate) fn forward_mount() -> [f64; 4] {
    let rbc = na::Rotation3::from_matrix_unchecked(na::Matrix3::new(
        0.0, 0.0, 1.0, //
        -1.0, 0.0, 0.0, //
        0.0, -1.0, 0.0,
    ));
    let q = na::UnitQuaternion::from_rotation_matrix(&rbc);
    [q.w, q.i, q.j, q.k]
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<EstimatorConfig> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
        }
        None => {
            let mut config = EstimatorConfig::default();
            config.camera.rotation_bc = forward_mount();
            Ok(config)
        }
    }
}

#[derive(Debug, Default, Clone)]
struct SignalTally {
    frames: usize,
    promoted: usize,
    lost: usize,
    outliers: usize,
    evicted: usize,
    demoted: usize,
    triangulation_failures: usize,
    rejected: usize,
}

/// Counts diagnostics for the final summary
struct TallySink(Arc<Mutex<SignalTally>>);

impl DiagnosticsSink for TallySink {
    fn on_signal(&mut self, _timestamp: Timestamp, signal: &Signal) {
        let Ok(mut tally) = self.0.lock() else {
            return;
        };
        match signal {
            Signal::Promoted { .. } => tally.promoted += 1,
            Signal::TrackLost { .. } => tally.lost += 1,
            Signal::OutlierRejected { .. } => tally.outliers += 1,
            Signal::Evicted { .. } => tally.evicted += 1,
            Signal::Demoted { .. } => tally.demoted += 1,
            Signal::TriangulationFailure { .. } => tally.triangulation_failures += 1,
        }
    }

    fn on_rejected(&mut self, _error: &vio::VioError) {
        if let Ok(mut tally) = self.0.lock() {
            tally.rejected += 1;
        }
    }

    fn on_visual_report(&mut self, _report: &vio::VisualReport) {
        if let Ok(mut tally) = self.0.lock() {
            tally.frames += 1;
        }
    }
}

/// Estimate versus ground truth, both expressed relative to the starting pose
struct PoseError {
    position: f64,
    rotation_deg: f64,
}

fn pose_error(estimator: &Estimator, trajectory: &Trajectory, origin: &na::Isometry3<f64>) -> Option<PoseError> {
    let estimate = estimator.gsb()?;
    let t = estimator.now()?.as_secs_f64();
    let truth = origin.inverse() * trajectory.pose(t);
    Some(PoseError {
        position: (estimate.translation.vector - truth.translation.vector).norm(),
        rotation_deg: util::rotation_error_deg(&estimate.rotation, &truth.rotation),
    })
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = load_config(args.config.as_ref())?;
    let tally = Arc::new(Mutex::new(SignalTally::default()));
    let mut estimator = Estimator::with_sink(config.clone(), Box::new(TallySink(tally.clone())))
        .context("invalid estimator configuration")?;

    let trajectory = Trajectory::default();
    let origin = trajectory.pose(0.0);
    let simulator = Simulator::new(
        &config,
        trajectory.clone(),
        args.duration,
        args.imu_rate,
        args.camera_rate,
        args.depth_hints,
    );

    let (tx, rx) = crossbeam_channel::bounded::<Measurement>(256);
    let producer = simulator.run(tx);

    let mut next_log = 1.0;
    for measurement in rx.iter() {
        match estimator.process(measurement) {
            Ok(Some(VisualOutcome::Applied(report))) if report.num_outliers() > 0 => {
                warn!("{}: {} observations gated", report.timestamp, report.num_outliers());
            }
            Ok(_) => {}
            Err(err) if err.is_fatal() => {
                error!("stopping: {}", err);
                break;
            }
            // Already logged by the estimator
            Err(_) => {}
        }

        let Some(now) = estimator.now().map(|t| t.as_secs_f64()) else {
            continue;
        };
        if now >= next_log {
            next_log += 1.0;
            if let Some(err) = pose_error(&estimator, &trajectory, &origin) {
                info!(
                    "t = {:5.1}s  position error {:.3} m  rotation error {:.2} deg  instate {}",
                    now,
                    err.position,
                    err.rotation_deg,
                    estimator.num_instate_features()
                );
            }
        }
    }
    drop(rx);
    if producer.join().is_err() {
        warn!("simulation thread panicked");
    }

    let tally = tally.lock().map(|t| t.clone()).unwrap_or_default();
    info!(
        "frames {}  promoted {}  lost {}  outliers {}  evicted {}  demoted {}  triangulation failures {}  rejected {}",
        tally.frames,
        tally.promoted,
        tally.lost,
        tally.outliers,
        tally.evicted,
        tally.demoted,
        tally.triangulation_failures,
        tally.rejected
    );
    if let Some(err) = pose_error(&estimator, &trajectory, &origin) {
        info!(
            "final position error {:.3} m, rotation error {:.2} deg",
            err.position, err.rotation_deg
        );
    }
    if let Some(core) = estimator.core() {
        let (roll, pitch, yaw) = util::euler_deg(&core.rsb);
        info!(
            "final attitude roll {:.1} pitch {:.1} yaw {:.1} deg, gyro bias {:?}, td {:.4} s",
            roll, pitch, yaw, core.bg, core.td
        );
    }
    if let Some(variance) = estimator.gauge_variance() {
        info!("gauge variance (x, y, z, yaw): {:?}", variance);
    }
    if estimator.is_terminated() {
        anyhow::bail!("estimator session terminated");
    }
    Ok(())
}
