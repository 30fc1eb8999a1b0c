//! Estimator facade.
//!
//! Owns every component and is the only place where measurements enter the
//! filter. Inertial samples must arrive in strictly increasing time order.
//! Visual frames may run ahead of the inertial stream, in which case they
//! wait until an inertial sample passes their timestamp.

use std::collections::VecDeque;

use log::{debug, error, info, warn};
use nalgebra as na;

use crate::camera::Camera;
use crate::config::{EstimatorConfig, InitialUncertainty};
use crate::diagnostics::{DiagnosticsSink, NoopSink};
use crate::error::{helpers, SensorType, VioError, VioResult};
use crate::gauge::{self, Gauge, GaugeGroup};
use crate::landmarks::{LandmarkManager, LandmarkStatus};
use crate::propagator::ImuPropagator;
use crate::state::{CoreState, StateStore, BA, BG, CORE_DIM, T, TBC, TD, V, W, WBC, WG};
use crate::tracker::FeatureTracker;
use crate::types::{
    ImuSample, LandmarkId, Measurement, Timestamp, VisualInput, VisualOutcome, VisualReport,
};
use crate::update::{self, UpdateParams};
use crate::utils;

/// Visual-inertial EKF
pub struct Estimator {
    config: EstimatorConfig,
    camera: Camera,
    propagator: ImuPropagator,
    update_params: UpdateParams,
    tracker: FeatureTracker,
    landmarks: LandmarkManager,
    gauge: Gauge,
    store: Option<StateStore>,

    /// Filter time; before initialization, time of the last inertial sample
    time: Option<Timestamp>,
    last_imu: Option<ImuSample>,
    alignment: Vec<na::Vector3<f64>>,
    pending: VecDeque<(Timestamp, VisualInput)>,

    last_correction: Option<na::DVector<f64>>,
    last_report: Option<VisualReport>,
    measurement_update_initialized: bool,
    terminated: bool,
    sink: Box<dyn DiagnosticsSink>,
}

impl Estimator {
    pub fn new(config: EstimatorConfig) -> VioResult<Self> {
        Self::with_sink(config, Box::new(NoopSink))
    }

    /// Create an estimator reporting diagnostics to `sink`
    pub fn with_sink(config: EstimatorConfig, sink: Box<dyn DiagnosticsSink>) -> VioResult<Self> {
        config.validate()?;
        Ok(Self {
            camera: Camera::from_config(&config.camera),
            propagator: ImuPropagator::new(&config),
            update_params: UpdateParams::from_config(&config),
            tracker: FeatureTracker::new(config.tracker.clone()),
            landmarks: LandmarkManager::new(&config.landmarks, config.camera.pixel_noise),
            gauge: Gauge::new(),
            store: None,
            time: None,
            last_imu: None,
            alignment: Vec::with_capacity(config.timing.init_imu_samples),
            pending: VecDeque::with_capacity(config.timing.max_pending_frames.max(1)),
            last_correction: None,
            last_report: None,
            measurement_update_initialized: false,
            terminated: false,
            sink,
            config,
        })
    }

    /// Dispatch one item of the intake queue. Visual items return their
    /// outcome, inertial items `None`.
    pub fn process(&mut self, measurement: Measurement) -> VioResult<Option<VisualOutcome>> {
        match measurement {
            Measurement::Inertial(sample) => self.process_inertial(sample).map(|_| None),
            Measurement::Visual { timestamp, input } => self.process_visual(timestamp, input).map(Some),
        }
    }

    /// Propagate the filter to the sample time, applying any buffered frame
    /// the sample passes on the way
    pub fn process_inertial(&mut self, sample: ImuSample) -> VioResult<()> {
        self.guard()?;
        let result = self.inertial(sample);
        self.finish(result)
    }

    /// Hand a camera frame to the filter
    pub fn process_visual(&mut self, timestamp: Timestamp, input: VisualInput) -> VioResult<VisualOutcome> {
        self.guard()?;
        let result = self.visual(timestamp, input);
        self.finish(result)
    }

    fn guard(&self) -> VioResult<()> {
        if self.terminated {
            Err(VioError::SessionTerminated)
        } else {
            Ok(())
        }
    }

    fn finish<R>(&mut self, result: VioResult<R>) -> VioResult<R> {
        if let Err(err) = &result {
            if err.is_fatal() {
                error!("estimator session terminated: {}", err);
                self.terminated = true;
            } else {
                warn!("{}", err);
            }
            self.sink.on_rejected(err);
        }
        result
    }

    fn inertial(&mut self, sample: ImuSample) -> VioResult<()> {
        helpers::check_vector_finite(&sample.gyro, "gyroscope reading", SensorType::Imu)?;
        helpers::check_vector_finite(&sample.accel, "accelerometer reading", SensorType::Imu)?;
        if let Some(time) = self.time {
            if sample.timestamp <= time {
                return Err(helpers::out_of_order(SensorType::Imu, sample.timestamp, time));
            }
        }

        if self.store.is_none() {
            self.alignment.push(sample.accel);
            if self.alignment.len() >= self.config.timing.init_imu_samples {
                if let Err(err) = self.initialize(sample.timestamp) {
                    self.alignment.pop();
                    return Err(err);
                }
            }
            self.time = Some(sample.timestamp);
            self.last_imu = Some(sample);
            return Ok(());
        }

        while self
            .pending
            .front()
            .map_or(false, |(frame_time, _)| *frame_time <= sample.timestamp)
        {
            let Some((frame_time, input)) = self.pending.pop_front() else {
                break;
            };
            self.advance_to(frame_time)?;
            match self.apply_frame(frame_time, &input) {
                Ok(_) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!("buffered frame at {} dropped: {}", frame_time, err);
                    self.sink.on_rejected(&err);
                }
            }
        }

        self.advance_to(sample.timestamp)?;
        self.last_imu = Some(sample);
        Ok(())
    }

    /// Integrate the last inertial reading up to `target`
    fn advance_to(&mut self, target: Timestamp) -> VioResult<()> {
        let (Some(time), Some(last), Some(store)) = (self.time, self.last_imu, self.store.as_mut()) else {
            return Err(helpers::not_initialized("no inertial reading to integrate"));
        };
        if target <= time {
            return Ok(());
        }
        self.propagator
            .propagate(store, &last.gyro, &last.accel, target.seconds_since(time))?;
        self.time = Some(target);
        Ok(())
    }

    /// Gravity alignment from the averaged accelerometer readings
    fn initialize(&mut self, timestamp: Timestamp) -> VioResult<()> {
        let count = self.alignment.len() as f64;
        let mean = self.alignment.iter().fold(na::Vector3::zeros(), |acc, a| acc + a) / count;
        let specific_force = self.propagator.ca() * mean;
        if specific_force.norm() < 1e-6 {
            return Err(helpers::invalid_input(
                "accelerometer reads zero during gravity alignment",
                SensorType::Imu,
            ));
        }
        if specific_force.norm() < 0.5 * self.config.gravity {
            warn!(
                "specific force {:.2} m/s^2 during alignment is far from gravity; the platform may not be at rest",
                specific_force.norm()
            );
        }

        let mut core = CoreState::default();
        core.rsb = utils::rotation_between(&specific_force, &na::Vector3::z());
        core.rbc = self.config.camera.rotation_bc();
        core.tbc = self.config.camera.translation_bc();
        core.td = self.config.camera.time_offset;

        let covariance = initial_covariance(&self.config.initial_uncertainty);
        let mut store = StateStore::new(core, covariance, self.config.gravity)?;
        let mut gauge = self.gauge.clone();
        gauge.initialize(self.config.gauge, &mut store)?;

        let (roll, pitch, _) = store.core().rsb.euler_angles();
        info!(
            "initialized at {} from {} samples: roll {:.2} deg, pitch {:.2} deg",
            timestamp,
            self.alignment.len(),
            roll.to_degrees(),
            pitch.to_degrees()
        );
        self.gauge = gauge;
        self.store = Some(store);
        self.alignment.clear();
        Ok(())
    }

    fn visual(&mut self, timestamp: Timestamp, input: VisualInput) -> VioResult<VisualOutcome> {
        let time = match (self.time, self.store.is_some()) {
            (Some(time), true) => time,
            _ => {
                return Err(helpers::not_initialized(
                    "visual frame received before gravity alignment",
                ))
            }
        };

        if timestamp > time {
            let capacity = self.config.timing.max_pending_frames.max(1);
            if self.pending.len() >= capacity {
                if let Some((dropped, _)) = self.pending.pop_front() {
                    warn!("pending frame queue full, dropping frame at {}", dropped);
                }
            }
            let index = self.pending.partition_point(|(t, _)| *t <= timestamp);
            self.pending.insert(index, (timestamp, input));
            debug!("frame at {} buffered ({} pending)", timestamp, self.pending.len());
            return Ok(VisualOutcome::Buffered);
        }

        if time.seconds_since(timestamp) > self.config.timing.visual_tolerance {
            return Err(helpers::out_of_order(SensorType::Camera, timestamp, time));
        }
        self.apply_frame(time, &input).map(VisualOutcome::Applied)
    }

    /// Track, correct and update landmarks for one frame at the current
    /// filter time. Nothing is committed unless every stage succeeds.
    fn apply_frame(&mut self, timestamp: Timestamp, input: &VisualInput) -> VioResult<VisualReport> {
        let mut store = self
            .store
            .clone()
            .ok_or_else(|| helpers::not_initialized("no state to correct"))?;
        let mut tracker = self.tracker.clone();
        let mut landmarks = self.landmarks.clone();
        let mut gauge = self.gauge.clone();
        let mut signals = Vec::new();

        let updates = tracker.track(input)?;
        let gsc = store.core().gsc_at_camera_time();
        let observations = landmarks.ingest(&updates, &gsc, &mut store, &mut signals)?;
        let outcome = update::correct(&mut store, &observations, &self.camera, &self.update_params, &mut gauge)?;
        let corrected_gsc = store.core().gsc_at_camera_time();
        landmarks.apply_outcome(&outcome, &corrected_gsc, &mut store, &mut signals)?;
        landmarks.promote(&mut store, &self.camera, &mut signals)?;

        let report = VisualReport {
            timestamp,
            num_tracks: tracker.num_live(),
            num_inliers: outcome.inliers.len(),
            num_instate: store.num_landmarks(),
            signals,
        };

        self.store = Some(store);
        self.tracker = tracker;
        self.landmarks = landmarks;
        self.gauge = gauge;
        if let Some(delta) = outcome.correction {
            self.last_correction = Some(delta);
            self.measurement_update_initialized = true;
        }

        debug!(
            "frame {}: {} tracks, {} inliers, {} outliers, {} instate",
            timestamp,
            report.num_tracks,
            report.num_inliers,
            report.num_outliers(),
            report.num_instate
        );
        for signal in &report.signals {
            self.sink.on_signal(timestamp, signal);
        }
        self.sink.on_visual_report(&report);
        self.last_report = Some(report.clone());
        Ok(report)
    }

    // Queries

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.store.is_some()
    }

    /// Whether at least one visual correction has been applied
    pub fn measurement_update_initialized(&self) -> bool {
        self.measurement_update_initialized
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Current filter time
    pub fn now(&self) -> Option<Timestamp> {
        self.time
    }

    pub fn gauge_group(&self) -> GaugeGroup {
        self.gauge.group()
    }

    /// Frames waiting for the inertial stream
    pub fn num_pending_frames(&self) -> usize {
        self.pending.len()
    }

    pub fn state(&self) -> Option<&StateStore> {
        self.store.as_ref()
    }

    pub fn core(&self) -> Option<&CoreState> {
        self.store.as_ref().map(|s| s.core())
    }

    /// Body pose in the spatial frame
    pub fn gsb(&self) -> Option<na::Isometry3<f64>> {
        self.core().map(|c| c.gsb())
    }

    /// Camera pose in the spatial frame
    pub fn gsc(&self) -> Option<na::Isometry3<f64>> {
        self.core().map(|c| c.gsc())
    }

    /// Camera pose in the body frame
    pub fn gbc(&self) -> Option<na::Isometry3<f64>> {
        self.core().map(|c| c.gbc())
    }

    /// Body pose as a 3x4 `[R | T]` matrix
    pub fn gsb_matrix(&self) -> Option<na::Matrix3x4<f64>> {
        self.gsb().map(|g| rigid_3x4(&g))
    }

    pub fn gsc_matrix(&self) -> Option<na::Matrix3x4<f64>> {
        self.gsc().map(|g| rigid_3x4(&g))
    }

    pub fn gbc_matrix(&self) -> Option<na::Matrix3x4<f64>> {
        self.gbc().map(|g| rigid_3x4(&g))
    }

    pub fn vsb(&self) -> Option<na::Vector3<f64>> {
        self.core().map(|c| c.vsb)
    }

    pub fn bg(&self) -> Option<na::Vector3<f64>> {
        self.core().map(|c| c.bg)
    }

    pub fn ba(&self) -> Option<na::Vector3<f64>> {
        self.core().map(|c| c.ba)
    }

    /// Gravity rotation as a matrix
    pub fn rg(&self) -> Option<na::Matrix3<f64>> {
        self.core().map(|c| c.rg.to_rotation_matrix().into_inner())
    }

    /// Gravity vector in the spatial frame
    pub fn gravity(&self) -> Option<na::Vector3<f64>> {
        self.store.as_ref().map(|s| s.core().gravity(s.gravity_magnitude()))
    }

    /// Camera clock offset (s)
    pub fn td(&self) -> Option<f64> {
        self.core().map(|c| c.td)
    }

    /// Accelerometer calibration matrix
    pub fn ca(&self) -> &na::Matrix3<f64> {
        self.propagator.ca()
    }

    /// Gyroscope calibration matrix
    pub fn cg(&self) -> &na::Matrix3<f64> {
        self.propagator.cg()
    }

    /// Full error-state covariance
    pub fn covariance(&self) -> Option<&na::DMatrix<f64>> {
        self.store.as_ref().map(|s| s.covariance())
    }

    /// Covariance of the core error state
    pub fn core_covariance(&self) -> Option<na::DMatrix<f64>> {
        self.store.as_ref().map(|s| s.core_covariance())
    }

    /// Covariance of one named core block: one of the layout offsets
    /// (`W`, `T`, `V`, `BG`, `BA`, `WG`, `WBC`, `TBC`, `TD`)
    pub fn block_covariance(&self, offset: usize) -> Option<na::DMatrix<f64>> {
        let size = match offset {
            W | T | V | BG | BA | WBC | TBC => 3,
            WG => 2,
            TD => 1,
            _ => return None,
        };
        debug_assert!(offset + size <= CORE_DIM);
        self.store.as_ref().map(|s| s.block_covariance(offset, size))
    }

    /// Variance along the unobservable directions (x, y, z, yaw)
    pub fn gauge_variance(&self) -> Option<na::Vector4<f64>> {
        let store = self.store.as_ref()?;
        gauge::variance_along(store, store.covariance()).ok()
    }

    fn innovation(&self, offset: usize) -> Option<na::Vector3<f64>> {
        self.last_correction
            .as_ref()
            .map(|delta| delta.fixed_rows::<3>(offset).into_owned())
    }

    /// Orientation part of the last applied correction
    pub fn inn_wsb(&self) -> Option<na::Vector3<f64>> {
        self.innovation(W)
    }

    /// Position part of the last applied correction
    pub fn inn_tsb(&self) -> Option<na::Vector3<f64>> {
        self.innovation(T)
    }

    /// Velocity part of the last applied correction
    pub fn inn_vsb(&self) -> Option<na::Vector3<f64>> {
        self.innovation(V)
    }

    pub fn last_visual_report(&self) -> Option<&VisualReport> {
        self.last_report.as_ref()
    }

    pub fn num_instate_features(&self) -> usize {
        self.store.as_ref().map_or(0, |s| s.num_landmarks())
    }

    pub fn landmark_status(&self, id: LandmarkId) -> Option<LandmarkStatus> {
        self.landmarks.status(id)
    }

    /// Instate landmark positions, one per row, zero padded to `rows`
    pub fn instate_feature_positions(&self, rows: usize) -> na::DMatrix<f64> {
        let mut out = na::DMatrix::zeros(rows, 3);
        if let Some(store) = &self.store {
            for (row, (_, position)) in store.landmarks().take(rows).enumerate() {
                out.fixed_view_mut::<1, 3>(row, 0).copy_from(&position.transpose());
            }
        }
        out
    }

    /// Instate landmark covariances, row-major 3x3 per row, zero padded
    pub fn instate_feature_covs(&self, rows: usize) -> na::DMatrix<f64> {
        let mut out = na::DMatrix::zeros(rows, 9);
        if let Some(store) = &self.store {
            for (row, id) in store.landmark_ids().take(rows).enumerate() {
                if let Some(cov) = store.landmark_covariance(id) {
                    for i in 0..3 {
                        for j in 0..3 {
                            out[(row, 3 * i + j)] = cov[(i, j)];
                        }
                    }
                }
            }
        }
        out
    }

    /// Instate landmark ids, padded with -1
    pub fn instate_feature_ids(&self, rows: usize) -> Vec<i64> {
        let mut out = vec![-1; rows];
        if let Some(store) = &self.store {
            for (slot, id) in out.iter_mut().zip(store.landmark_ids()) {
                *slot = id.0 as i64;
            }
        }
        out
    }
}

/// Diagonal covariance from the configured standard deviations
fn initial_covariance(init: &InitialUncertainty) -> na::DMatrix<f64> {
    let mut diag = na::DVector::zeros(CORE_DIM);
    let blocks = [
        (W, 3, init.orientation),
        (T, 3, init.position),
        (V, 3, init.velocity),
        (BG, 3, init.gyro_bias),
        (BA, 3, init.accel_bias),
        (WG, 2, init.gravity),
        (WBC, 3, init.extrinsic_rotation),
        (TBC, 3, init.extrinsic_translation),
        (TD, 1, init.time_offset),
    ];
    for (offset, size, std) in blocks {
        for i in 0..size {
            diag[offset + i] = std * std;
        }
    }
    na::DMatrix::from_diagonal(&diag)
}

fn rigid_3x4(g: &na::Isometry3<f64>) -> na::Matrix3x4<f64> {
    g.to_homogeneous().fixed_view::<3, 4>(0, 0).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FeatureFrame, ImuSample};

    fn at_rest(t: f64) -> ImuSample {
        ImuSample::new(
            Timestamp::from_secs_f64(t),
            na::Vector3::zeros(),
            na::Vector3::new(0.0, 0.0, 9.8),
        )
    }

    #[test]
    fn test_alignment_levels_tilted_body() {
        let mut estimator = Estimator::new(EstimatorConfig::default()).unwrap();
        // Body pitched so gravity reads partly along x
        let tilt = na::UnitQuaternion::from_euler_angles(0.0, 0.3, 0.0);
        let accel = tilt.inverse() * na::Vector3::new(0.0, 0.0, 9.8);
        estimator
            .process_inertial(ImuSample::new(Timestamp(0), na::Vector3::zeros(), accel))
            .unwrap();
        assert!(estimator.is_initialized());
        let rsb = estimator.core().unwrap().rsb;
        let up = rsb * accel.normalize();
        assert!((up - na::Vector3::z()).norm() < 1e-12, "aligned body must see gravity along +z");
        assert_eq!(estimator.gauge_group(), GaugeGroup::Fixed);
    }

    #[test]
    fn test_rejected_alignment_sample_leaves_clock_alone() {
        let mut estimator = Estimator::new(EstimatorConfig::default()).unwrap();
        let dead = ImuSample::new(Timestamp(1000), na::Vector3::zeros(), na::Vector3::zeros());
        let err = estimator.process_inertial(dead).unwrap_err();
        assert!(matches!(err, VioError::InvalidInput { .. }));
        assert!(!estimator.is_initialized());
        assert_eq!(estimator.now(), None, "rejected sample must not move the filter clock");
        assert_eq!(estimator.gauge_group(), GaugeGroup::Uninitialized);

        let good = ImuSample::new(Timestamp(1000), na::Vector3::zeros(), na::Vector3::new(0.0, 0.0, 9.8));
        estimator.process_inertial(good).unwrap();
        assert!(estimator.is_initialized());
        assert_eq!(estimator.now(), Some(Timestamp(1000)));
    }

    #[test]
    fn test_visual_before_initialization_is_rejected() {
        let mut estimator = Estimator::new(EstimatorConfig::default()).unwrap();
        let err = estimator
            .process_visual(Timestamp(0), VisualInput::Features(FeatureFrame::default()))
            .unwrap_err();
        assert!(matches!(err, VioError::NotInitialized { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_future_frame_is_buffered_then_applied() {
        let mut estimator = Estimator::new(EstimatorConfig::default()).unwrap();
        estimator.process_inertial(at_rest(0.0)).unwrap();
        let outcome = estimator
            .process_visual(Timestamp::from_secs_f64(0.012), VisualInput::Features(FeatureFrame::default()))
            .unwrap();
        assert!(matches!(outcome, VisualOutcome::Buffered));
        assert_eq!(estimator.num_pending_frames(), 1);

        estimator.process_inertial(at_rest(0.005)).unwrap();
        assert_eq!(estimator.num_pending_frames(), 1, "frame is still in the future");
        estimator.process_inertial(at_rest(0.015)).unwrap();
        assert_eq!(estimator.num_pending_frames(), 0);
        assert_eq!(
            estimator.last_visual_report().unwrap().timestamp,
            Timestamp::from_secs_f64(0.012)
        );
        assert_eq!(estimator.now(), Some(Timestamp::from_secs_f64(0.015)));
    }

    #[test]
    fn test_stale_frame_is_out_of_order() {
        let mut estimator = Estimator::new(EstimatorConfig::default()).unwrap();
        estimator.process_inertial(at_rest(0.0)).unwrap();
        estimator.process_inertial(at_rest(0.1)).unwrap();
        let err = estimator
            .process_visual(Timestamp::from_secs_f64(0.05), VisualInput::Features(FeatureFrame::default()))
            .unwrap_err();
        assert!(matches!(err, VioError::OutOfOrderSample { sensor: SensorType::Camera, .. }));

        // Within tolerance: applied at the current filter time
        let outcome = estimator
            .process_visual(Timestamp::from_secs_f64(0.098), VisualInput::Features(FeatureFrame::default()))
            .unwrap();
        assert!(matches!(outcome, VisualOutcome::Applied(_)));
    }

    #[test]
    fn test_pending_queue_is_bounded() {
        let mut config = EstimatorConfig::default();
        config.timing.max_pending_frames = 2;
        let mut estimator = Estimator::new(config).unwrap();
        estimator.process_inertial(at_rest(0.0)).unwrap();
        for k in 1..=4 {
            estimator
                .process_visual(Timestamp::from_secs_f64(0.01 * k as f64), VisualInput::Features(FeatureFrame::default()))
                .unwrap();
        }
        assert_eq!(estimator.num_pending_frames(), 2);
    }

    #[test]
    fn test_padded_outputs_before_landmarks() {
        let mut estimator = Estimator::new(EstimatorConfig::default()).unwrap();
        estimator.process_inertial(at_rest(0.0)).unwrap();
        assert_eq!(estimator.instate_feature_ids(3), vec![-1, -1, -1]);
        assert_eq!(estimator.instate_feature_positions(3), na::DMatrix::zeros(3, 3));
        assert_eq!(estimator.instate_feature_covs(2).shape(), (2, 9));
        assert!(estimator.inn_wsb().is_none());
        assert_eq!(estimator.block_covariance(WG).unwrap().shape(), (2, 2));
        assert!(estimator.block_covariance(4).is_none());
    }
}
