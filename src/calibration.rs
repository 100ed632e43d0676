//! Sensor calibration for the inertial sensor front end
//!
//! Accelerometers are fitted from a handful of stationary poses with a
//! Gauss-Newton solve of offset and per-axis scale. Gyroscope bias is the mean
//! of a stationary window. The board level trim comes from a level pose.

use log::debug;
use nalgebra::{Matrix6, Vector3, Vector6};

use crate::error::{InsError, InsResult};
use crate::math::{GRAVITY_MSS, RAD_TO_DEG};
use crate::types::CalibrationSettings;

/// Largest RMS fit residual accepted, in g
const MAX_FIT_RESIDUAL: f64 = 0.02;

/// Pose sets spanning less than this, in g, cannot constrain a fit
const MIN_POSE_SPREAD: f64 = 0.5;

/// Relative Tikhonov damping added to the normal equations
const DAMPING: f64 = 1e-4;

/// Offset and per-axis scale of a sensor
///
/// Applied as `(uncalibrated - offset) * scale`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub offset: Vector3<f32>,
    pub scale: Vector3<f32>,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            offset: Vector3::zeros(),
            scale: Vector3::repeat(1.0),
        }
    }
}

impl Calibration {
    /// Identity calibration
    pub fn identity() -> Self {
        Self::default()
    }

    /// Apply the calibration to a reading
    ///
    /// # Example
    /// ```
    /// use nalgebra::Vector3;
    /// use fusion_ins::Calibration;
    ///
    /// let calibration = Calibration {
    ///     offset: Vector3::new(0.1, 0.2, 0.3),
    ///     scale: Vector3::new(2.0, 2.0, 2.0),
    /// };
    /// let calibrated = calibration.apply(Vector3::new(1.1, 1.2, 1.3));
    /// assert!((calibrated - Vector3::new(2.0, 2.0, 2.0)).norm() < 1e-6);
    /// ```
    #[inline]
    pub fn apply(&self, uncalibrated: Vector3<f32>) -> Vector3<f32> {
        (uncalibrated - self.offset).component_mul(&self.scale)
    }

    /// Calibrate a time integral of readings spanning `dt` seconds
    #[inline]
    pub fn apply_delta(&self, delta: Vector3<f32>, dt: f32) -> Vector3<f32> {
        (delta - self.offset * dt).component_mul(&self.scale)
    }

    /// Finite offset and strictly positive finite scale
    pub fn is_valid(&self) -> bool {
        self.offset.iter().all(|v| v.is_finite())
            && self.scale.iter().all(|v| v.is_finite() && *v > 0.0)
    }
}

/// Converged accelerometer fit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccelFit {
    pub calibration: Calibration,
    /// Gauss-Newton iterations used
    pub iterations: usize,
    /// RMS of `|corrected| - g` over the poses, m/s/s
    pub residual_rms: f32,
}

/// Accelerometer offset and scale estimator
///
/// # Example
/// ```
/// use nalgebra::Vector3;
/// use fusion_ins::{AccelCalibrator, CalibrationSettings, GRAVITY_MSS};
///
/// let g = GRAVITY_MSS;
/// let bias = Vector3::new(0.3, -0.2, 0.5);
/// let poses: Vec<_> = [
///     Vector3::new(0.0, 0.0, g),
///     Vector3::new(0.0, 0.0, -g),
///     Vector3::new(g, 0.0, 0.0),
///     Vector3::new(-g, 0.0, 0.0),
///     Vector3::new(0.0, g, 0.0),
///     Vector3::new(0.0, -g, 0.0),
/// ]
/// .iter()
/// .map(|p| p + bias)
/// .collect();
///
/// let calibrator = AccelCalibrator::new(CalibrationSettings::default());
/// let fit = calibrator.fit(&poses).unwrap();
/// assert!((fit.calibration.offset - bias).norm() < 1e-3);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct AccelCalibrator {
    settings: CalibrationSettings,
}

impl AccelCalibrator {
    pub fn new(settings: CalibrationSettings) -> Self {
        Self { settings }
    }

    /// Fit offset and scale so every pose reads one g
    ///
    /// # Arguments
    /// * `poses` - Averaged stationary readings in m/s/s, one per pose
    ///
    /// # Errors
    /// [`InsError::InsufficientPoses`], [`InsError::DegeneratePoses`] or
    /// [`InsError::CalibrationDidNotConverge`]
    pub fn fit(&self, poses: &[Vector3<f32>]) -> InsResult<AccelFit> {
        if poses.len() < self.settings.min_poses {
            return Err(InsError::InsufficientPoses {
                required: self.settings.min_poses,
                got: poses.len(),
            });
        }

        // Solve in units of g to keep the normal equations well scaled
        let samples: Vec<Vector3<f64>> = poses
            .iter()
            .map(|p| p.cast::<f64>() / f64::from(GRAVITY_MSS))
            .collect();
        if samples.iter().any(|s| !s.iter().all(|v| v.is_finite())) {
            return Err(InsError::DegeneratePoses);
        }
        let spread = samples
            .iter()
            .map(|s| (s - samples[0]).norm())
            .fold(0.0, f64::max);
        if spread < MIN_POSE_SPREAD {
            return Err(InsError::DegeneratePoses);
        }

        // Parameters are [offset; scale]
        let mut params = Vector6::new(0.0, 0.0, 0.0, 1.0, 1.0, 1.0);
        for iteration in 1..=self.settings.max_iterations {
            let (jtj, jtr, _) = normal_equations(&samples, &params);
            let trace = jtj.trace();
            if !(trace.is_finite() && trace > 0.0) {
                return Err(InsError::DegeneratePoses);
            }
            let damped = jtj + Matrix6::identity() * (DAMPING * trace / 6.0);
            let step = damped
                .cholesky()
                .ok_or(InsError::DegeneratePoses)?
                .solve(&(-jtr));
            params += step;

            if !params.iter().all(|v| v.is_finite()) {
                break;
            }
            if step.norm() < self.settings.convergence_threshold {
                let (_, _, sum_sq) = normal_equations(&samples, &params);
                let rms = (sum_sq / samples.len() as f64).sqrt();
                debug!(
                    "accel fit converged after {} iterations, rms residual {:.5} g",
                    iteration, rms
                );
                if rms > MAX_FIT_RESIDUAL {
                    break;
                }
                let calibration = Calibration {
                    offset: Vector3::new(params[0], params[1], params[2]).cast::<f32>() * GRAVITY_MSS,
                    scale: Vector3::new(params[3], params[4], params[5]).cast::<f32>(),
                };
                return Ok(AccelFit {
                    calibration,
                    iterations: iteration,
                    residual_rms: rms as f32 * GRAVITY_MSS,
                });
            }
        }

        Err(InsError::CalibrationDidNotConverge {
            iterations: self.settings.max_iterations,
        })
    }

    /// Check a fit for plausibility
    ///
    /// # Arguments
    /// * `fit` - Fit to check
    /// * `previous` - Previously accepted calibration of the same sensor, if any
    pub fn validate(&self, fit: &AccelFit, previous: Option<&Calibration>) -> InsResult<()> {
        let calibration = &fit.calibration;
        let offset = calibration.offset.amax();
        if !offset.is_finite() || offset > self.settings.max_abs_offset_mss {
            return Err(InsError::OffsetTooLarge {
                offset,
                limit: self.settings.max_abs_offset_mss,
            });
        }

        if let Some(scale) = calibration
            .scale
            .iter()
            .copied()
            .find(|s| !(self.settings.min_scale..=self.settings.max_scale).contains(s))
        {
            return Err(InsError::ScaleOutOfRange { scale });
        }

        if let Some(previous) = previous {
            let change = (calibration.offset - previous.offset).norm();
            if change > self.settings.max_offset_change_mss {
                return Err(InsError::OffsetChangeTooLarge {
                    change,
                    limit: self.settings.max_offset_change_mss,
                });
            }
        }
        Ok(())
    }
}

/// `JᵀJ`, `Jᵀr` and `Σr²` for `r_i = |s ∘ (x_i - b)| - 1`
fn normal_equations(samples: &[Vector3<f64>], params: &Vector6<f64>) -> (Matrix6<f64>, Vector6<f64>, f64) {
    let offset = Vector3::new(params[0], params[1], params[2]);
    let scale = Vector3::new(params[3], params[4], params[5]);

    let mut jtj = Matrix6::zeros();
    let mut jtr = Vector6::zeros();
    let mut sum_sq = 0.0;
    for sample in samples {
        let centered = sample - offset;
        let corrected = centered.component_mul(&scale);
        let magnitude = corrected.norm();
        if magnitude <= f64::EPSILON {
            continue;
        }
        let residual = magnitude - 1.0;
        let unit = corrected / magnitude;

        let mut jacobian = Vector6::zeros();
        for axis in 0..3 {
            jacobian[axis] = -scale[axis] * unit[axis];
            jacobian[axis + 3] = centered[axis] * unit[axis];
        }

        jtj += jacobian * jacobian.transpose();
        jtr += jacobian * residual;
        sum_sq += residual * residual;
    }
    (jtj, jtr, sum_sq)
}

/// Progress of a stationary gyro window
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GyroStep {
    /// Window still filling
    Collecting,
    /// Motion restarted the window
    Restarted,
    /// Window complete, bias in rad/s
    Done(Vector3<f32>),
    /// Too many restarts
    Failed,
}

/// Gyroscope bias from a stationary window
///
/// The bias is the window mean. A sample deviating from the running mean by
/// more than the motion threshold on any axis restarts the window.
#[derive(Debug, Clone, Copy)]
pub struct GyroCalibrator {
    window: u32,
    threshold: f32,
    max_restarts: u8,
    sum: Vector3<f32>,
    count: u32,
    restarts: u8,
    result: Option<Vector3<f32>>,
}

impl GyroCalibrator {
    /// # Arguments
    /// * `settings` - Window length, motion threshold and restart budget
    /// * `sample_rate` - Rate at which samples will be fed, Hz
    pub fn new(settings: &CalibrationSettings, sample_rate: f32) -> Self {
        let window = (settings.gyro_window_ms as f32 * sample_rate / 1000.0).round() as u32;
        Self {
            window: window.max(1),
            threshold: settings.gyro_motion_threshold,
            max_restarts: settings.gyro_max_restarts,
            sum: Vector3::zeros(),
            count: 0,
            restarts: 0,
            result: None,
        }
    }

    /// Feed one uncalibrated gyro reading
    pub fn update(&mut self, gyroscope: Vector3<f32>) -> GyroStep {
        if let Some(bias) = self.result {
            return GyroStep::Done(bias);
        }
        if self.failed() {
            return GyroStep::Failed;
        }

        if self.count > 0 {
            let mean = self.sum / self.count as f32;
            let deviation = gyroscope - mean;
            if deviation.iter().any(|d| d.abs() > self.threshold) {
                self.restart();
                return if self.restarts > self.max_restarts {
                    GyroStep::Failed
                } else {
                    GyroStep::Restarted
                };
            }
        }

        self.sum += gyroscope;
        self.count += 1;
        if self.count >= self.window {
            let bias = self.sum / self.count as f32;
            self.result = Some(bias);
            return GyroStep::Done(bias);
        }
        GyroStep::Collecting
    }

    /// Discard the window, counting a restart
    pub fn restart(&mut self) {
        self.sum = Vector3::zeros();
        self.count = 0;
        self.result = None;
        self.restarts = self.restarts.saturating_add(1);
    }

    pub fn restarts(&self) -> u8 {
        self.restarts
    }

    /// Restart budget exhausted
    pub fn failed(&self) -> bool {
        self.result.is_none() && self.restarts > self.max_restarts
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    /// Bias once the window completed
    pub fn bias(&self) -> Option<Vector3<f32>> {
        self.result
    }
}

/// Board level trim from a level accelerometer reading
///
/// # Returns
/// Roll and pitch trim in radians (yaw is always zero)
///
/// # Errors
/// [`InsError::TrimTooLarge`] when either angle exceeds `limit_deg`
///
/// # Example
/// ```
/// use nalgebra::Vector3;
/// use fusion_ins::calculate_trim;
///
/// let trim = calculate_trim(Vector3::new(0.0, 0.0, 9.8), 10.0).unwrap();
/// assert!(trim.norm() < 1e-6);
/// assert!(calculate_trim(Vector3::new(0.0, 9.8, 9.8), 10.0).is_err());
/// ```
pub fn calculate_trim(level_accel: Vector3<f32>, limit_deg: f32) -> InsResult<Vector3<f32>> {
    let roll = level_accel.y.atan2(level_accel.z);
    let pitch = (-level_accel.x).atan2((level_accel.y.powi(2) + level_accel.z.powi(2)).sqrt());

    let angle_deg = roll.abs().max(pitch.abs()) * RAD_TO_DEG;
    if !angle_deg.is_finite() || angle_deg > limit_deg {
        return Err(InsError::TrimTooLarge { angle_deg });
    }
    Ok(Vector3::new(roll, pitch, 0.0))
}

/// Outcome of a calibration operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CalibrationResult {
    /// No calibration has run
    #[default]
    Idle,
    Running,
    Success,
    /// The fit did not converge or was implausible
    ConvergeFailure,
    MotionDetected,
    /// The fitted offset was too large or moved too far from the previous one
    OffsetTooLarge,
    Aborted,
}

impl From<&InsError> for CalibrationResult {
    fn from(err: &InsError) -> Self {
        match err {
            InsError::OffsetTooLarge { .. } | InsError::OffsetChangeTooLarge { .. } => {
                CalibrationResult::OffsetTooLarge
            }
            InsError::MotionDetected => CalibrationResult::MotionDetected,
            InsError::CalibrationInProgress => CalibrationResult::Running,
            InsError::NoCalibrationSession => CalibrationResult::Idle,
            _ => CalibrationResult::ConvergeFailure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn six_poses(offset: Vector3<f32>, scale: Vector3<f32>) -> Vec<Vector3<f32>> {
        let g = GRAVITY_MSS;
        [
            Vector3::new(0.0, 0.0, g),
            Vector3::new(0.0, 0.0, -g),
            Vector3::new(g, 0.0, 0.0),
            Vector3::new(-g, 0.0, 0.0),
            Vector3::new(0.0, g, 0.0),
            Vector3::new(0.0, -g, 0.0),
        ]
        .iter()
        // Invert (raw - offset) * scale = truth
        .map(|truth| truth.component_div(&scale) + offset)
        .collect()
    }

    #[test]
    fn test_inertial_calibration() {
        let calibration = Calibration {
            offset: Vector3::new(0.1, 0.2, 0.3),
            scale: Vector3::new(0.5, 0.5, 0.5),
        };
        let calibrated = calibration.apply(Vector3::new(1.0, 2.0, 3.0));
        assert_relative_eq!(calibrated, Vector3::new(0.45, 0.9, 1.35), epsilon = 1e-6);

        let delta = calibration.apply_delta(Vector3::new(0.01, 0.02, 0.03), 0.01);
        assert_relative_eq!(delta, Vector3::new(0.0045, 0.009, 0.0135), epsilon = 1e-7);
        assert!(Calibration::identity().is_valid());
    }

    #[test]
    fn test_fit_recovers_offset_and_scale() {
        let offset = Vector3::new(0.4, -0.3, 0.6);
        let scale = Vector3::new(1.02, 0.97, 1.01);
        let calibrator = AccelCalibrator::new(CalibrationSettings::default());
        let fit = calibrator.fit(&six_poses(offset, scale)).unwrap();

        assert_relative_eq!(fit.calibration.offset, offset, epsilon = 1e-3);
        assert_relative_eq!(fit.calibration.scale, scale, epsilon = 1e-4);
        assert!(fit.residual_rms < 1e-3);
    }

    #[test]
    fn test_fit_underdetermined_poses_still_read_one_g() {
        let offset = Vector3::new(0.0, 0.0, 0.5 * GRAVITY_MSS);
        let poses: Vec<_> = six_poses(offset, Vector3::repeat(1.0))
            .into_iter()
            .take(4)
            .collect();
        let calibrator = AccelCalibrator::new(CalibrationSettings::default());
        let fit = calibrator.fit(&poses).unwrap();

        for pose in &poses {
            let corrected = fit.calibration.apply(*pose);
            assert!((corrected.norm() - GRAVITY_MSS).abs() < 0.05);
        }
    }

    #[test]
    fn test_fit_rejects_bad_input() {
        let calibrator = AccelCalibrator::new(CalibrationSettings::default());
        let level = Vector3::new(0.0, 0.0, GRAVITY_MSS);

        assert_eq!(
            calibrator.fit(&[level, -level]),
            Err(InsError::InsufficientPoses { required: 3, got: 2 })
        );
        assert_eq!(
            calibrator.fit(&[level, level, level * 1.01]),
            Err(InsError::DegeneratePoses)
        );
    }

    #[test]
    fn test_fit_rejects_inconsistent_poses() {
        let calibrator = AccelCalibrator::new(CalibrationSettings::default());
        let g = GRAVITY_MSS;
        // Opposite poses cannot both read one g with a sane fit
        let poses = [
            Vector3::new(0.0, 0.0, g),
            Vector3::new(0.0, 0.0, -0.2 * g),
            Vector3::new(0.0, 0.0, 3.0 * g),
            Vector3::new(0.0, 0.0, -2.5 * g),
        ];
        let result = calibrator.fit(&poses);
        assert!(result.is_err(), "unexpected fit {:?}", result);
    }

    #[test]
    fn test_validate() {
        let calibrator = AccelCalibrator::new(CalibrationSettings::default());
        let fit = |offset: Vector3<f32>, scale: f32| AccelFit {
            calibration: Calibration {
                offset,
                scale: Vector3::repeat(scale),
            },
            iterations: 5,
            residual_rms: 0.0,
        };

        assert!(calibrator.validate(&fit(Vector3::new(0.5, 0.0, 4.9), 1.0), None).is_ok());
        assert!(matches!(
            calibrator.validate(&fit(Vector3::new(9.0, 0.0, 0.0), 1.0), None),
            Err(InsError::OffsetTooLarge { .. })
        ));
        assert!(matches!(
            calibrator.validate(&fit(Vector3::zeros(), 1.5), None),
            Err(InsError::ScaleOutOfRange { .. })
        ));

        let previous = Calibration::identity();
        assert!(matches!(
            calibrator.validate(&fit(Vector3::new(0.0, 0.0, 4.9), 1.0), Some(&previous)),
            Err(InsError::OffsetChangeTooLarge { .. })
        ));
    }

    #[test]
    fn test_gyro_window_mean() {
        let settings = CalibrationSettings::default();
        let mut calibrator = GyroCalibrator::new(&settings, 100.0);
        assert_eq!(calibrator.window(), 100);

        let bias = Vector3::new(0.01, -0.02, 0.005);
        let mut step = GyroStep::Collecting;
        for i in 0..100 {
            let noise = if i % 2 == 0 { 0.001 } else { -0.001 };
            step = calibrator.update(bias + Vector3::repeat(noise));
        }
        match step {
            GyroStep::Done(estimate) => assert_relative_eq!(estimate, bias, epsilon = 1e-5),
            other => panic!("expected a completed window, got {:?}", other),
        }
    }

    #[test]
    fn test_gyro_motion_restarts_then_fails() {
        let settings = CalibrationSettings {
            gyro_max_restarts: 2,
            ..Default::default()
        };
        let mut calibrator = GyroCalibrator::new(&settings, 100.0);
        let still = Vector3::zeros();
        let moving = Vector3::new(0.5, 0.0, 0.0);

        calibrator.update(still);
        assert_eq!(calibrator.update(moving), GyroStep::Restarted);
        calibrator.update(still);
        assert_eq!(calibrator.update(moving), GyroStep::Restarted);
        calibrator.update(still);
        assert_eq!(calibrator.update(moving), GyroStep::Failed);
        assert_eq!(calibrator.update(still), GyroStep::Failed);
    }

    #[test]
    fn test_trim() {
        let g = GRAVITY_MSS;
        let roll = 3.0f32.to_radians();
        let accel = Vector3::new(0.0, g * roll.sin(), g * roll.cos());
        let trim = calculate_trim(accel, 10.0).unwrap();
        assert_relative_eq!(trim.x, roll, epsilon = 1e-5);
        assert_relative_eq!(trim.y, 0.0, epsilon = 1e-6);

        assert!(matches!(
            calculate_trim(Vector3::new(-g, 0.0, g), 10.0),
            Err(InsError::TrimTooLarge { .. })
        ));
    }

    #[test]
    fn test_result_codes() {
        let err = InsError::OffsetChangeTooLarge {
            change: 5.0,
            limit: 4.0,
        };
        assert_eq!(CalibrationResult::from(&err), CalibrationResult::OffsetTooLarge);
        assert_eq!(
            CalibrationResult::from(&InsError::DegeneratePoses),
            CalibrationResult::ConvergeFailure
        );
        assert_eq!(
            CalibrationResult::from(&InsError::MotionDetected),
            CalibrationResult::MotionDetected
        );
    }
}
