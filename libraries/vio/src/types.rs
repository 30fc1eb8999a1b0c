use std::fmt;

use image::GrayImage;
use nalgebra as na;
use serde::{Deserialize, Serialize};

/// Sensor timestamp in nanoseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Build a timestamp from seconds
    pub fn from_secs_f64(secs: f64) -> Self {
        Timestamp((secs * 1e9).round().max(0.0) as u64)
    }

    /// Timestamp in seconds
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 * 1e-9
    }

    /// Signed difference `self - earlier` in seconds
    pub fn seconds_since(&self, earlier: Timestamp) -> f64 {
        (self.0 as i128 - earlier.0 as i128) as f64 * 1e-9
    }

    /// Nanosecond count
    pub fn nanos(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}s", self.as_secs_f64())
    }
}

/// Identifier of a landmark, issued once per session and never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LandmarkId(pub u64);

impl fmt::Display for LandmarkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Identifier of a 2D feature track in the front end
pub type TrackId = u64;

/// One gyroscope + accelerometer reading
#[derive(Debug, Clone, Copy)]
pub struct ImuSample {
    /// Sample time
    pub timestamp: Timestamp,

    /// Raw angular velocity in body frame (rad/s)
    pub gyro: na::Vector3<f64>,

    /// Raw specific force in body frame (m/s^2); reads +g along up at rest
    pub accel: na::Vector3<f64>,
}

impl ImuSample {
    pub fn new(timestamp: Timestamp, gyro: na::Vector3<f64>, accel: na::Vector3<f64>) -> Self {
        Self {
            timestamp,
            gyro,
            accel,
        }
    }
}

/// A 2D feature reported by an external tracker
#[derive(Debug, Clone, Copy)]
pub struct FeatureObservation {
    /// Track id assigned by the external tracker
    pub track_id: TrackId,

    /// Pixel coordinate (column, row)
    pub pixel: na::Vector2<f64>,

    /// Optional metric depth along the optical axis (stereo / RGB-D)
    pub depth: Option<f64>,
}

impl FeatureObservation {
    pub fn new(track_id: TrackId, pixel: na::Vector2<f64>) -> Self {
        Self {
            track_id,
            pixel,
            depth: None,
        }
    }

    pub fn with_depth(mut self, depth: f64) -> Self {
        self.depth = Some(depth);
        self
    }
}

/// Feature list for one camera frame
#[derive(Debug, Clone, Default)]
pub struct FeatureFrame {
    pub observations: Vec<FeatureObservation>,
}

/// Visual measurement handed to the estimator
#[derive(Debug, Clone)]
pub enum VisualInput {
    /// Raw grayscale image, tracked by the built-in front end
    Image(GrayImage),

    /// Already-associated feature list from an external tracker
    Features(FeatureFrame),
}

/// Item of the single-consumer intake queue
#[derive(Debug, Clone)]
pub enum Measurement {
    Inertial(ImuSample),
    Visual {
        timestamp: Timestamp,
        input: VisualInput,
    },
}

impl Measurement {
    pub fn timestamp(&self) -> Timestamp {
        match self {
            Measurement::Inertial(sample) => sample.timestamp,
            Measurement::Visual { timestamp, .. } => *timestamp,
        }
    }
}

/// Why a landmark could not be initialized yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriangulationIssue {
    /// Fewer usable views than required
    TooFewViews,
    /// Viewing rays are nearly parallel
    LowParallax,
    /// Point ends up behind (or too close to) one of the cameras
    BadDepth,
    /// Residual after refinement exceeds the bound
    ReprojectionError,
    /// Normal equations are singular
    Singular,
}

/// Non-fatal per-frame condition reported to the caller
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// The front end lost the track; the landmark is destroyed
    TrackLost { landmark: LandmarkId, was_instate: bool },

    /// Promotion deferred because the initial 3D estimate was unusable
    TriangulationFailure {
        landmark: LandmarkId,
        issue: TriangulationIssue,
    },

    /// Observation excluded from the correction by the statistical gate
    OutlierRejected {
        landmark: LandmarkId,
        mahalanobis_sq: f64,
    },

    /// Landmark added to the filter state
    Promoted { landmark: LandmarkId },

    /// Instate landmark dropped to make room for a better candidate
    Evicted { landmark: LandmarkId },

    /// Instate landmark dropped for repeated gating failures or bad depth
    Demoted { landmark: LandmarkId },
}

/// Summary of one processed camera frame
#[derive(Debug, Clone, Default)]
pub struct VisualReport {
    /// Frame time
    pub timestamp: Timestamp,

    /// Live 2D tracks after this frame
    pub num_tracks: usize,

    /// Instate observations that passed the gate and were fused
    pub num_inliers: usize,

    /// Instate landmarks after promotion/eviction
    pub num_instate: usize,

    /// Every non-fatal condition raised while processing the frame
    pub signals: Vec<Signal>,
}

impl VisualReport {
    pub fn count<F: Fn(&Signal) -> bool>(&self, predicate: F) -> usize {
        self.signals.iter().filter(|s| predicate(s)).count()
    }

    pub fn num_outliers(&self) -> usize {
        self.count(|s| matches!(s, Signal::OutlierRejected { .. }))
    }

    pub fn num_promoted(&self) -> usize {
        self.count(|s| matches!(s, Signal::Promoted { .. }))
    }
}

/// Result of handing a frame to the estimator
#[derive(Debug, Clone)]
pub enum VisualOutcome {
    /// Frame was processed immediately
    Applied(VisualReport),

    /// Frame is newer than the inertial stream and waits in the queue
    Buffered,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_conversions() {
        let t = Timestamp::from_secs_f64(1.25);
        assert_eq!(t.nanos(), 1_250_000_000);
        assert!((t.as_secs_f64() - 1.25).abs() < 1e-12);

        let earlier = Timestamp(1_000_000_000);
        assert!((t.seconds_since(earlier) - 0.25).abs() < 1e-12);
        assert!((earlier.seconds_since(t) + 0.25).abs() < 1e-12);
    }
}
