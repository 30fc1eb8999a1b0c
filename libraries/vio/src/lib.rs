//! # VIO - Visual-Inertial Odometry
//!
//! Error-state extended Kalman filter fusing gyroscope/accelerometer samples
//! with monocular camera measurements. It estimates a metric body pose,
//! velocity, sensor biases, gravity direction, camera extrinsics and clock
//! offset, together with a sparse set of 3D landmarks, all with a joint
//! covariance.
//!
//! ## Features
//!
//! - Strapdown inertial propagation with first-order covariance propagation
//! - Built-in FAST-9 + pyramidal Lucas-Kanade front end, or external feature lists
//! - Landmark lifecycle with triangulation or depth-aided initialization,
//!   capacity-driven eviction and outlier-driven demotion
//! - Chi-square gated, batched EKF correction
//! - Fixed or floating gauge for the unobservable global position and yaw
//!
//! ## Usage
//!
//! Build an [`Estimator`] from an [`EstimatorConfig`], then feed it
//! [`Measurement`]s from a single consumer in timestamp order. Non-fatal
//! conditions come back as [`Signal`]s in each frame's [`VisualReport`];
//! recoverable rejections are `Err` values the caller can log and move past.
//! A [`VioError::NumericalDegeneracy`] ends the session.
//!
//! ## Platform Support
//!
//! Requires the standard library: the covariance grows and shrinks with the
//! landmark set (`DMatrix`), and the image front end is built on `image`.

pub mod camera;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod estimator;
pub mod gauge;
pub mod landmarks;
pub mod lk;
pub mod propagator;
pub mod state;
pub mod tracker;
pub mod triangulation;
pub mod types;
pub mod update;
pub mod utils;

pub use config::{EstimatorConfig, GaugeMode};
pub use diagnostics::{DiagnosticsSink, NoopSink};
pub use error::{SensorType, VioError, VioResult};
pub use estimator::Estimator;
pub use gauge::GaugeGroup;
pub use landmarks::LandmarkStatus;
pub use types::{
    FeatureFrame, FeatureObservation, ImuSample, LandmarkId, Measurement, Signal, Timestamp, TrackId,
    TriangulationIssue, VisualInput, VisualOutcome, VisualReport,
};
