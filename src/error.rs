//! Error taxonomy for the inertial sensor front end

use thiserror::Error;

use crate::types::SensorKind;

/// Errors reported by the inertial sensor front end
///
/// Only [`InsError::CapacityExceeded`] is fatal; it means the build and the
/// hardware disagree about how many sensors exist. Everything else is a
/// recoverable condition the caller may log and carry on from.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InsError {
    #[error("{kind} instance table is full ({max} instances)")]
    CapacityExceeded { kind: SensorKind, max: usize },

    #[error("no {kind} instance {instance}")]
    NoSuchInstance { kind: SensorKind, instance: usize },

    #[error("invalid raw sample rate {0} Hz")]
    InvalidSampleRate(f32),

    #[error("no complete sample set within {timeout_us} us")]
    MissedDeadline { timeout_us: u64 },

    #[error("calibration did not converge after {iterations} iterations")]
    CalibrationDidNotConverge { iterations: usize },

    #[error("calibration poses are degenerate")]
    DegeneratePoses,

    #[error("calibration needs at least {required} poses, got {got}")]
    InsufficientPoses { required: usize, got: usize },

    #[error("offset {offset:.3} m/s/s exceeds limit {limit:.3}")]
    OffsetTooLarge { offset: f32, limit: f32 },

    #[error("offset changed by {change:.3} m/s/s, limit {limit:.3}")]
    OffsetChangeTooLarge { change: f32, limit: f32 },

    #[error("scale factor {scale:.3} outside plausible range")]
    ScaleOutOfRange { scale: f32 },

    #[error("motion detected during calibration")]
    MotionDetected,

    #[error("trim of {angle_deg:.1} deg exceeds limit")]
    TrimTooLarge { angle_deg: f32 },

    #[error("a calibration session is already running")]
    CalibrationInProgress,

    #[error("no calibration session is running")]
    NoCalibrationSession,

    #[error("{kind} instance {instance} is not usable for calibration")]
    NotCalibratable { kind: SensorKind, instance: usize },

    #[error("parameter {name}: {reason}")]
    Parameter { name: String, reason: String },

    #[error("diagnostic sink: {0}")]
    Sink(String),
}

impl From<serde_json::Error> for InsError {
    fn from(err: serde_json::Error) -> Self {
        InsError::Sink(err.to_string())
    }
}

impl From<std::io::Error> for InsError {
    fn from(err: std::io::Error) -> Self {
        InsError::Sink(err.to_string())
    }
}

/// Result type used throughout the crate
pub type InsResult<T> = Result<T, InsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = InsError::CapacityExceeded {
            kind: SensorKind::Gyro,
            max: 3,
        };
        assert_eq!(err.to_string(), "gyro instance table is full (3 instances)");

        let err = InsError::OffsetChangeTooLarge {
            change: 4.5,
            limit: 4.0,
        };
        assert_eq!(err.to_string(), "offset changed by 4.500 m/s/s, limit 4.000");
    }
}
