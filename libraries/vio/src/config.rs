use nalgebra as na;
use serde::{Deserialize, Serialize};

use crate::error::{helpers, VioResult};

/// Configuration for the estimator, supplied once at construction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Gravity magnitude in m/s^2
    pub gravity: f64,

    /// Continuous-time IMU noise densities
    pub imu_noise: ImuNoise,

    /// Fixed IMU calibration matrices
    pub imu_intrinsics: ImuIntrinsics,

    /// Camera model and extrinsic prior
    pub camera: CameraConfig,

    /// Initial standard deviations of the error state
    pub initial_uncertainty: InitialUncertainty,

    /// Front-end tracking parameters
    pub tracker: TrackerConfig,

    /// Landmark promotion and eviction policy
    pub landmarks: LandmarkConfig,

    /// Measurement update parameters
    pub update: UpdateConfig,

    /// Sample ordering and integration parameters
    pub timing: TimingConfig,

    /// Gauge fixing scheme selected at initialization
    pub gauge: GaugeMode,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            gravity: 9.8,
            imu_noise: ImuNoise::default(),
            imu_intrinsics: ImuIntrinsics::default(),
            camera: CameraConfig::default(),
            initial_uncertainty: InitialUncertainty::default(),
            tracker: TrackerConfig::default(),
            landmarks: LandmarkConfig::default(),
            update: UpdateConfig::default(),
            timing: TimingConfig::default(),
            gauge: GaugeMode::Fixed,
        }
    }
}

/// IMU noise densities
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImuNoise {
    /// Gyroscope white noise (rad/s/sqrt(Hz))
    pub gyro_noise: f64,
    /// Accelerometer white noise (m/s^2/sqrt(Hz))
    pub accel_noise: f64,
    /// Gyroscope bias random walk (rad/s^2/sqrt(Hz))
    pub gyro_bias_walk: f64,
    /// Accelerometer bias random walk (m/s^3/sqrt(Hz))
    pub accel_bias_walk: f64,
}

impl Default for ImuNoise {
    fn default() -> Self {
        Self {
            gyro_noise: 1.6e-3,
            accel_noise: 2.0e-2,
            gyro_bias_walk: 2.0e-5,
            accel_bias_walk: 3.0e-3,
        }
    }
}

/// Accelerometer / gyroscope calibration, row-major 3x3
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImuIntrinsics {
    pub ca: [f64; 9],
    pub cg: [f64; 9],
}

impl Default for ImuIntrinsics {
    fn default() -> Self {
        let identity = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];
        Self {
            ca: identity,
            cg: identity,
        }
    }
}

impl ImuIntrinsics {
    pub fn ca_matrix(&self) -> na::Matrix3<f64> {
        na::Matrix3::from_row_slice(&self.ca)
    }

    pub fn cg_matrix(&self) -> na::Matrix3<f64> {
        na::Matrix3::from_row_slice(&self.cg)
    }
}

/// Pinhole + radial-tangential camera, and its pose in the body frame
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub width: u32,
    pub height: u32,
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// Distortion coefficients (k1, k2, p1, p2)
    pub distortion: [f64; 4],
    /// Camera-to-body rotation prior as quaternion (w, x, y, z)
    pub rotation_bc: [f64; 4],
    /// Camera-to-body translation prior (m)
    pub translation_bc: [f64; 3],
    /// Camera clock offset prior (s)
    pub time_offset: f64,
    /// Pixel measurement standard deviation
    pub pixel_noise: f64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fx: 500.0,
            fy: 500.0,
            cx: 320.0,
            cy: 240.0,
            distortion: [0.0; 4],
            rotation_bc: [1.0, 0.0, 0.0, 0.0],
            translation_bc: [0.0; 3],
            time_offset: 0.0,
            pixel_noise: 1.0,
        }
    }
}

impl CameraConfig {
    pub fn rotation_bc(&self) -> na::UnitQuaternion<f64> {
        let [w, x, y, z] = self.rotation_bc;
        na::UnitQuaternion::from_quaternion(na::Quaternion::new(w, x, y, z))
    }

    pub fn translation_bc(&self) -> na::Vector3<f64> {
        na::Vector3::from_column_slice(&self.translation_bc)
    }
}

/// Initial standard deviations for the core error state
///
/// A zero entry freezes the corresponding block: it keeps zero variance
/// and is never corrected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InitialUncertainty {
    /// Roll/pitch/yaw of the body (rad)
    pub orientation: f64,
    /// Body position (m)
    pub position: f64,
    /// Body velocity (m/s)
    pub velocity: f64,
    pub gyro_bias: f64,
    pub accel_bias: f64,
    /// Gravity direction, two tangent components (rad)
    pub gravity: f64,
    /// Camera-to-body rotation (rad)
    pub extrinsic_rotation: f64,
    /// Camera-to-body translation (m)
    pub extrinsic_translation: f64,
    /// Camera clock offset (s)
    pub time_offset: f64,
}

impl Default for InitialUncertainty {
    fn default() -> Self {
        Self {
            orientation: 0.05,
            position: 1e-3,
            velocity: 0.5,
            gyro_bias: 1e-2,
            accel_bias: 0.1,
            gravity: 0.05,
            extrinsic_rotation: 0.0,
            extrinsic_translation: 0.0,
            time_offset: 0.0,
        }
    }
}

/// Lucas-Kanade parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LkConfig {
    /// Half-width of the tracking window
    pub win_size: usize,
    /// Maximum iterations per pyramid level
    pub max_iterations: usize,
    /// Stop once the update is shorter than this (px)
    pub epsilon: f32,
    /// Pyramid levels (1 = no pyramid)
    pub num_levels: usize,
    /// Minimum structure-tensor eigenvalue per window pixel
    pub min_eigenvalue: f32,
    /// Maximum forward-backward disagreement (px)
    pub max_fb_error: f32,
}

impl Default for LkConfig {
    fn default() -> Self {
        Self {
            win_size: 7,
            max_iterations: 20,
            epsilon: 0.01,
            num_levels: 3,
            min_eigenvalue: 1e-3,
            max_fb_error: 1.0,
        }
    }
}

/// Front-end parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Detect new corners while the live track count is below this
    pub target_tracks: usize,
    /// FAST-9 intensity threshold
    pub fast_threshold: u8,
    /// Grid cell size for spreading new detections (px)
    pub grid_size: u32,
    /// Tracks closer than this to the image border are dropped (px)
    pub border: f64,
    pub lk: LkConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            target_tracks: 120,
            fast_threshold: 20,
            grid_size: 40,
            border: 8.0,
            lk: LkConfig::default(),
        }
    }
}

/// Landmark lifecycle policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LandmarkConfig {
    /// Maximum number of landmarks in the filter state
    pub max_instate: usize,
    /// Track length required before promotion is attempted
    pub min_track_length: usize,
    /// Observations kept per track
    pub max_track_history: usize,
    /// Promotions attempted per frame
    pub max_promotions_per_frame: usize,
    /// Minimum angle between extreme viewing rays (deg)
    pub min_parallax_deg: f64,
    /// Maximum RMS reprojection error after refinement (px)
    pub max_reprojection_error: f64,
    /// Valid depth range for new landmarks (m)
    pub min_depth: f64,
    pub max_depth: f64,
    /// Multiplier on the triangulation covariance
    pub init_cov_inflation: f64,
    /// Relative depth standard deviation of depth hints
    pub depth_hint_std_ratio: f64,
    /// Consecutive gated frames before an instate landmark is dropped
    pub max_consecutive_outliers: usize,
}

impl Default for LandmarkConfig {
    fn default() -> Self {
        Self {
            max_instate: 30,
            min_track_length: 5,
            max_track_history: 12,
            max_promotions_per_frame: 10,
            min_parallax_deg: 1.0,
            max_reprojection_error: 2.0,
            min_depth: 0.1,
            max_depth: 60.0,
            init_cov_inflation: 4.0,
            depth_hint_std_ratio: 0.05,
            max_consecutive_outliers: 3,
        }
    }
}

/// Measurement update parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Chi-square threshold on the 2-DOF innovation (5.991 = 95%)
    pub outlier_gate: f64,
    /// Most negative covariance eigenvalue tolerated before declaring degeneracy
    pub psd_tolerance: f64,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            outlier_gate: 5.991,
            psd_tolerance: 1e-6,
        }
    }
}

/// Sample ordering and integration parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Accelerometer samples averaged for gravity alignment
    pub init_imu_samples: usize,
    /// Longest single integration step (s)
    pub max_integration_step: f64,
    /// Upper bound on sub-steps per interval; longer gaps are integrated
    /// with proportionally longer steps
    pub max_substeps: usize,
    /// Inertial gap that triggers a warning (s)
    pub max_imu_gap: f64,
    /// A frame this much older than the filter time is still accepted (s)
    pub visual_tolerance: f64,
    /// Frames waiting for the inertial stream to catch up
    pub max_pending_frames: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            init_imu_samples: 1,
            max_integration_step: 0.01,
            max_substeps: 100,
            max_imu_gap: 0.1,
            visual_tolerance: 0.005,
            max_pending_frames: 4,
        }
    }
}

/// Which unobservable directions the filter pins down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GaugeMode {
    /// Global position and yaw are projected out after every correction
    Fixed,
    /// Global position and yaw float freely and are only monitored
    Floating,
}

impl EstimatorConfig {
    /// Check every parameter the filter relies on
    pub fn validate(&self) -> VioResult<()> {
        if !(self.gravity > 0.0 && self.gravity.is_finite()) {
            return Err(helpers::config_error("gravity must be positive", "gravity"));
        }

        let noise = &self.imu_noise;
        for (value, name) in [
            (noise.gyro_noise, "imu_noise.gyro_noise"),
            (noise.accel_noise, "imu_noise.accel_noise"),
            (noise.gyro_bias_walk, "imu_noise.gyro_bias_walk"),
            (noise.accel_bias_walk, "imu_noise.accel_bias_walk"),
        ] {
            if !(value >= 0.0 && value.is_finite()) {
                return Err(helpers::config_error(
                    format!("noise density must be non-negative, got {}", value),
                    name,
                ));
            }
        }

        for (m, name) in [
            (self.imu_intrinsics.ca_matrix(), "imu_intrinsics.ca"),
            (self.imu_intrinsics.cg_matrix(), "imu_intrinsics.cg"),
        ] {
            if m.determinant().abs() < 1e-9 {
                return Err(helpers::config_error("calibration matrix is singular", name));
            }
        }

        let cam = &self.camera;
        if cam.width == 0 || cam.height == 0 {
            return Err(helpers::config_error("image size must be non-zero", "camera.width"));
        }
        if !(cam.fx > 0.0 && cam.fy > 0.0) {
            return Err(helpers::config_error("focal lengths must be positive", "camera.fx"));
        }
        if !(cam.pixel_noise > 0.0) {
            return Err(helpers::config_error(
                "pixel noise must be positive",
                "camera.pixel_noise",
            ));
        }
        let q = cam.rotation_bc;
        let q_norm = (q[0] * q[0] + q[1] * q[1] + q[2] * q[2] + q[3] * q[3]).sqrt();
        if (q_norm - 1.0).abs() > 1e-3 {
            return Err(helpers::config_error(
                format!("extrinsic quaternion is not unit length ({})", q_norm),
                "camera.rotation_bc",
            ));
        }

        let init = &self.initial_uncertainty;
        for (value, name) in [
            (init.orientation, "initial_uncertainty.orientation"),
            (init.position, "initial_uncertainty.position"),
            (init.velocity, "initial_uncertainty.velocity"),
            (init.gyro_bias, "initial_uncertainty.gyro_bias"),
            (init.accel_bias, "initial_uncertainty.accel_bias"),
            (init.gravity, "initial_uncertainty.gravity"),
            (init.extrinsic_rotation, "initial_uncertainty.extrinsic_rotation"),
            (init.extrinsic_translation, "initial_uncertainty.extrinsic_translation"),
            (init.time_offset, "initial_uncertainty.time_offset"),
        ] {
            if !(value >= 0.0 && value.is_finite()) {
                return Err(helpers::config_error(
                    "standard deviation must be non-negative",
                    name,
                ));
            }
        }

        if self.tracker.lk.num_levels == 0 || self.tracker.lk.win_size == 0 {
            return Err(helpers::config_error(
                "pyramid levels and window size must be non-zero",
                "tracker.lk",
            ));
        }
        if self.tracker.grid_size == 0 {
            return Err(helpers::config_error("grid size must be non-zero", "tracker.grid_size"));
        }

        let lm = &self.landmarks;
        if lm.min_track_length < 2 {
            return Err(helpers::config_error(
                "promotion needs at least two observations",
                "landmarks.min_track_length",
            ));
        }
        if lm.max_track_history < lm.min_track_length {
            return Err(helpers::config_error(
                "track history must hold at least min_track_length observations",
                "landmarks.max_track_history",
            ));
        }
        if !(lm.min_depth > 0.0 && lm.max_depth > lm.min_depth) {
            return Err(helpers::config_error(
                "depth range must satisfy 0 < min_depth < max_depth",
                "landmarks.min_depth",
            ));
        }
        if !(lm.init_cov_inflation >= 1.0) {
            return Err(helpers::config_error(
                "covariance inflation must be at least 1",
                "landmarks.init_cov_inflation",
            ));
        }

        if !(self.update.outlier_gate > 0.0) {
            return Err(helpers::config_error(
                "outlier gate must be positive",
                "update.outlier_gate",
            ));
        }
        if !(self.update.psd_tolerance >= 0.0) {
            return Err(helpers::config_error(
                "PSD tolerance must be non-negative",
                "update.psd_tolerance",
            ));
        }

        let timing = &self.timing;
        if timing.init_imu_samples == 0 {
            return Err(helpers::config_error(
                "at least one sample is needed for gravity alignment",
                "timing.init_imu_samples",
            ));
        }
        if !(timing.max_integration_step > 0.0) {
            return Err(helpers::config_error(
                "integration step must be positive",
                "timing.max_integration_step",
            ));
        }
        if timing.max_substeps == 0 {
            return Err(helpers::config_error(
                "at least one integration sub-step is needed",
                "timing.max_substeps",
            ));
        }
        if !(timing.visual_tolerance >= 0.0) {
            return Err(helpers::config_error(
                "visual tolerance must be non-negative",
                "timing.visual_tolerance",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EstimatorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation_names_parameter() {
        let mut config = EstimatorConfig::default();
        config.landmarks.min_track_length = 1;
        match config.validate() {
            Err(crate::VioError::ConfigurationError { parameter, .. }) => {
                assert_eq!(parameter.as_deref(), Some("landmarks.min_track_length"));
            }
            other => panic!("expected configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_singular_calibration_rejected() {
        let mut config = EstimatorConfig::default();
        config.imu_intrinsics.ca = [0.0; 9];
        assert!(config.validate().is_err(), "singular Ca must be rejected");
    }
}
