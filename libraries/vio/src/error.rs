use std::fmt;
use thiserror::Error;

use crate::types::Timestamp;

/// Primary error type for the estimator crate
#[derive(Error, Debug, Clone)]
pub enum VioError {
    /// Measurement with a non-increasing or too-stale timestamp
    #[error("Out-of-order {sensor} sample: {message}")]
    OutOfOrderSample {
        /// Detailed error message
        message: String,
        /// Sensor that produced the sample
        sensor: SensorType,
        /// Timestamp of the rejected sample
        timestamp: Timestamp,
        /// Filter time when the sample was rejected
        filter_time: Timestamp,
    },

    /// A measurement arrived before the filter could be initialized
    #[error("Estimator not initialized: {message}")]
    NotInitialized {
        /// Detailed error message
        message: String,
    },

    /// Measurement content is malformed (NaN, wrong intake mode, empty image)
    #[error("Invalid {sensor} input: {message}")]
    InvalidInput {
        /// Detailed error message
        message: String,
        /// Sensor that produced the input
        sensor: SensorType,
    },

    /// Covariance lost positive-semidefiniteness or the state went non-finite
    #[error("Numerical degeneracy in {component}: {message}")]
    NumericalDegeneracy {
        /// Detailed error message
        message: String,
        /// Component where the degeneracy was detected
        component: String,
        /// Smallest covariance eigenvalue, when that was the trigger
        min_eigenvalue: Option<f64>,
    },

    /// Matrix operation errors
    #[error("Matrix operation error: {message}")]
    MatrixError {
        /// Detailed error message
        message: String,
        /// Operation that failed
        operation: String,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    ConfigurationError {
        /// Detailed error message
        message: String,
        /// Configuration parameter that caused the error
        parameter: Option<String>,
    },

    /// The session hit a fatal error earlier and must be rebuilt
    #[error("Session terminated after a fatal error; reinitialize the estimator")]
    SessionTerminated,
}

impl VioError {
    /// Whether the error ends the current session.
    ///
    /// Everything except numerical degeneracy is recovered locally: the
    /// offending sample is dropped and the caller may keep feeding data.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VioError::NumericalDegeneracy { .. } | VioError::SessionTerminated
        )
    }
}

/// Types of sensors that could generate errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorType {
    /// Inertial Measurement Unit
    Imu,
    /// Monocular camera (image or external feature list)
    Camera,
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorType::Imu => write!(f, "IMU"),
            SensorType::Camera => write!(f, "camera"),
        }
    }
}

/// Helper functions for creating common errors
pub mod helpers {
    use super::*;
    use nalgebra as na;

    /// Create an out-of-order sample error
    pub fn out_of_order(
        sensor: SensorType,
        timestamp: Timestamp,
        filter_time: Timestamp,
    ) -> VioError {
        VioError::OutOfOrderSample {
            message: format!(
                "sample at {} does not follow filter time {}",
                timestamp, filter_time
            ),
            sensor,
            timestamp,
            filter_time,
        }
    }

    /// Create a not-initialized error
    pub fn not_initialized(message: impl Into<String>) -> VioError {
        VioError::NotInitialized {
            message: message.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(message: impl Into<String>, sensor: SensorType) -> VioError {
        VioError::InvalidInput {
            message: message.into(),
            sensor,
        }
    }

    /// Create a numerical degeneracy error
    pub fn degeneracy(
        message: impl Into<String>,
        component: impl Into<String>,
        min_eigenvalue: Option<f64>,
    ) -> VioError {
        VioError::NumericalDegeneracy {
            message: message.into(),
            component: component.into(),
            min_eigenvalue,
        }
    }

    /// Create a matrix error
    pub fn matrix_error(message: impl Into<String>, operation: impl Into<String>) -> VioError {
        VioError::MatrixError {
            message: message.into(),
            operation: operation.into(),
        }
    }

    /// Create a configuration error
    pub fn config_error(message: impl Into<String>, parameter: impl Into<String>) -> VioError {
        VioError::ConfigurationError {
            message: message.into(),
            parameter: Some(parameter.into()),
        }
    }

    /// Check that a 3-vector sample contains only finite values
    pub fn check_vector_finite(
        vec: &na::Vector3<f64>,
        name: &str,
        sensor: SensorType,
    ) -> Result<(), VioError> {
        if vec.iter().all(|v| v.is_finite()) {
            Ok(())
        } else {
            Err(invalid_input(
                format!("{} contains NaN or infinite values", name),
                sensor,
            ))
        }
    }

    /// Check if a time delta in seconds is usable for integration
    pub fn check_time_delta(dt: f64) -> Result<(), VioError> {
        if dt <= 0.0 || !dt.is_finite() {
            Err(invalid_input(
                format!("Invalid integration step: {}", dt),
                SensorType::Imu,
            ))
        } else {
            Ok(())
        }
    }
}

/// Type alias for Result with VioError
pub type VioResult<T> = Result<T, VioError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let stale = helpers::out_of_order(SensorType::Imu, Timestamp(5), Timestamp(10));
        assert!(!stale.is_fatal(), "out-of-order samples are recoverable");

        let degenerate = helpers::degeneracy("negative eigenvalue", "covariance", Some(-1.0));
        assert!(degenerate.is_fatal(), "degeneracy must end the session");
        assert!(VioError::SessionTerminated.is_fatal());
    }

    #[test]
    fn test_time_delta_validation() {
        assert!(helpers::check_time_delta(0.005).is_ok());
        assert!(helpers::check_time_delta(0.0).is_err());
        assert!(helpers::check_time_delta(f64::NAN).is_err());
    }
}
