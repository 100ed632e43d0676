//! Core types and settings for the inertial sensor front end

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::rotation::Rotation;

/// Maximum number of instances per sensor kind
pub const MAX_INSTANCES: usize = 3;

/// Number of independently configured harmonic notch sets
pub const NUM_NOTCH_SETS: usize = 2;

/// Maximum number of harmonics per notch set (one bit each in [`NotchSettings::harmonics`])
pub const MAX_HARMONICS: usize = 8;

/// Kind of inertial sensor behind an instance
///
/// # Example
/// ```
/// use fusion_ins::SensorKind;
///
/// assert_eq!(SensorKind::Gyro.to_string(), "gyro");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    /// Accelerometer, m/s/s
    Accel,
    /// Gyroscope, rad/s
    Gyro,
}

impl SensorKind {
    /// Both kinds, accelerometers first
    pub const ALL: [SensorKind; 2] = [SensorKind::Accel, SensorKind::Gyro];

    /// Bit used for this kind in sensor masks (bit 0 accel, bit 1 gyro)
    pub fn mask_bit(self) -> u8 {
        match self {
            SensorKind::Accel => 1 << 0,
            SensorKind::Gyro => 1 << 1,
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorKind::Accel => f.write_str("accel"),
            SensorKind::Gyro => f.write_str("gyro"),
        }
    }
}

/// How a harmonic notch set derives its center frequency from the tracked reference
///
/// The reference value is supplied with
/// [`InertialSensor::set_notch_reference`](crate::InertialSensor::set_notch_reference).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotchTracking {
    /// Center frequency stays at the configured value
    #[default]
    Fixed,
    /// Reference is a throttle fraction; `center * sqrt(value / reference)`
    Throttle,
    /// Reference is a rotor speed in RPM; `value / 60 * reference`
    Rpm,
}

impl NotchTracking {
    /// Parameter encoding used by the `INS_HNTCH_MODE` family
    pub fn from_param(value: i32) -> Self {
        match value {
            1 => NotchTracking::Throttle,
            2 => NotchTracking::Rpm,
            _ => NotchTracking::Fixed,
        }
    }

    /// Inverse of [`NotchTracking::from_param`]
    pub fn to_param(self) -> i32 {
        match self {
            NotchTracking::Fixed => 0,
            NotchTracking::Throttle => 1,
            NotchTracking::Rpm => 2,
        }
    }
}

/// Harmonic notch filter settings
///
/// Bandwidth and attenuation are fixed when the filters are built. Only the
/// center frequency follows the tracked reference at runtime.
///
/// # Example
/// ```
/// use fusion_ins::{NotchSettings, NotchTracking};
///
/// let notch = NotchSettings {
///     enabled: true,
///     center_hz: 80.0,
///     tracking: NotchTracking::Throttle,
///     reference: 0.25, // hover throttle
///     ..Default::default()
/// };
/// assert!((notch.frequency_for(0.25) - 80.0).abs() < 1e-3);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotchSettings {
    /// Whether this notch set is active
    pub enabled: bool,
    /// Fundamental center frequency in Hz at the reference point
    pub center_hz: f32,
    /// -3dB bandwidth of the fundamental in Hz
    pub bandwidth_hz: f32,
    /// Attenuation at the center frequency in dB
    pub attenuation_db: f32,
    /// Harmonic bitmask, bit 0 is the fundamental
    pub harmonics: u8,
    /// Reference value at which `center_hz` applies
    pub reference: f32,
    /// Lowest center frequency as a ratio of `center_hz`
    pub min_ratio: f32,
    /// Tracking mode
    pub tracking: NotchTracking,
}

impl Default for NotchSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            center_hz: 80.0,
            bandwidth_hz: 40.0,
            attenuation_db: 40.0,
            harmonics: 0b0000_0001,
            reference: 0.0,
            min_ratio: 1.0,
            tracking: NotchTracking::Fixed,
        }
    }
}

impl NotchSettings {
    /// Resolve the fundamental center frequency for a tracked reference value
    pub fn frequency_for(&self, value: f32) -> f32 {
        let tracked = match self.tracking {
            NotchTracking::Fixed => self.center_hz,
            NotchTracking::Throttle => {
                if self.reference > 0.0 {
                    self.center_hz * (value.max(0.0) / self.reference).sqrt()
                } else {
                    self.center_hz
                }
            }
            NotchTracking::Rpm => value.max(0.0) / 60.0 * self.reference,
        };
        tracked.max(self.center_hz * self.min_ratio)
    }
}

/// Batch sampler settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Sensor kinds to capture, bit 0 accel, bit 1 gyro. Zero disables capture.
    pub sensor_mask: u8,
    /// Capacity of each capture ring in samples
    pub required_count: u16,
    /// Samples per emitted record
    pub samples_per_msg: u16,
    /// Minimum interval between emitted records in milliseconds
    pub push_interval_ms: u16,
    /// Capture post-filter data instead of sensor-rate data
    pub post_filter: bool,
    /// Capture both pre- and post-filter data
    pub pre_and_post_filter: bool,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            sensor_mask: 0,
            required_count: 1024,
            samples_per_msg: 32,
            push_interval_ms: 10,
            post_filter: false,
            pre_and_post_filter: false,
        }
    }
}

impl BatchSettings {
    /// Whether any capture is configured
    pub fn enabled(&self) -> bool {
        self.sensor_mask != 0 && self.required_count > 0
    }

    /// Whether sensor-rate (pre-filter) data is captured
    pub fn captures_raw(&self) -> bool {
        self.pre_and_post_filter || !self.post_filter
    }

    /// Whether post-filter data is captured
    pub fn captures_filtered(&self) -> bool {
        self.pre_and_post_filter || self.post_filter
    }
}

/// Calibration engine settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSettings {
    /// Largest plausible accelerometer offset per axis in m/s/s
    pub max_abs_offset_mss: f32,
    /// Largest accepted offset change against the previous calibration in m/s/s
    pub max_offset_change_mss: f32,
    /// Smallest plausible scale factor
    pub min_scale: f32,
    /// Largest plausible scale factor
    pub max_scale: f32,
    /// Gauss-Newton iteration budget
    pub max_iterations: usize,
    /// Step norm below which the fit is considered converged (in g units)
    pub convergence_threshold: f64,
    /// Reduced samples averaged for each accelerometer pose
    pub pose_samples: u16,
    /// Minimum number of poses for an accelerometer fit
    pub min_poses: usize,
    /// Stationary window for gyro calibration in milliseconds
    pub gyro_window_ms: u32,
    /// Deviation from the window mean treated as motion, rad/s
    pub gyro_motion_threshold: f32,
    /// Window restarts before the gyro calibration gives up
    pub gyro_max_restarts: u8,
    /// Largest accepted trim angle in degrees
    pub trim_limit_deg: f32,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            max_abs_offset_mss: 8.0,
            max_offset_change_mss: 4.0,
            min_scale: 0.8,
            max_scale: 1.2,
            max_iterations: 50,
            convergence_threshold: 1e-7,
            pose_samples: 40,
            min_poses: 3,
            gyro_window_ms: 1000,
            gyro_motion_threshold: 0.05,
            gyro_max_restarts: 5,
            trim_limit_deg: 10.0,
        }
    }
}

/// Inertial sensor front end settings
///
/// # Example
/// ```
/// use fusion_ins::InsSettings;
///
/// let settings = InsSettings {
///     loop_rate_hz: 1000,
///     gyro_filter_hz: 80.0,
///     ..Default::default()
/// };
/// assert!((settings.loop_delta_t() - 0.001).abs() < 1e-6);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InsSettings {
    /// Rate at which `update()` is expected to run
    pub loop_rate_hz: u16,
    /// Upper clamp for the loop delta time in seconds, zero derives 10 loop periods
    pub loop_delta_t_max: f32,
    /// `wait_for_sample()` gives up after this many loop periods
    pub wait_timeout_periods: f32,
    /// Accelerometer low-pass cutoff in Hz, zero disables
    pub accel_filter_hz: f32,
    /// Gyroscope low-pass cutoff in Hz, zero disables
    pub gyro_filter_hz: f32,
    /// Board mounting rotation applied to every instance
    pub board_orientation: Rotation,
    /// Instances used for estimation and waited on, bit per instance index
    pub use_mask: u8,
    /// An instance is stalled after this many raw sample periods without data
    pub stall_timeout_periods: f32,
    /// Backend errors accepted after the startup grace period
    pub error_count_threshold: u32,
    /// Errors reported during this period after construction are ignored
    pub startup_grace_ms: u32,
    /// Accelerometer disagreement limit in m/s/s
    pub accel_consistency_mss: f32,
    /// Gyroscope disagreement limit in deg/s
    pub gyro_consistency_deg_s: f32,
    /// Vibration level below which the vehicle counts as still, m/s/s
    pub still_threshold: f32,
    /// Per-axis accelerometer magnitude counted as a clip, m/s/s
    pub accel_clip_mss: f32,
    /// Harmonic notch sets
    pub notches: [NotchSettings; NUM_NOTCH_SETS],
    /// Apply harmonic notches to accelerometers as well as gyroscopes
    pub notch_accel: bool,
    /// Spectral capture window length in samples, zero disables
    pub gyro_window_size: u16,
    /// Cutoff of the spectral capture tap in Hz, zero leaves it unfiltered
    pub spectral_filter_hz: f32,
    /// Batch sampler settings
    pub batch: BatchSettings,
    /// Calibration settings
    pub calibration: CalibrationSettings,
}

impl Default for InsSettings {
    fn default() -> Self {
        Self {
            loop_rate_hz: 400,
            loop_delta_t_max: 0.0,
            wait_timeout_periods: 2.0,
            accel_filter_hz: 20.0,
            gyro_filter_hz: 20.0,
            board_orientation: Rotation::None,
            use_mask: 0b111,
            stall_timeout_periods: 50.0,
            error_count_threshold: 10,
            startup_grace_ms: 2000,
            accel_consistency_mss: 0.75,
            gyro_consistency_deg_s: 5.0,
            still_threshold: 2.5,
            accel_clip_mss: 15.5 * crate::math::GRAVITY_MSS,
            notches: [NotchSettings::default(); NUM_NOTCH_SETS],
            notch_accel: false,
            gyro_window_size: 0,
            spectral_filter_hz: 0.0,
            batch: BatchSettings::default(),
            calibration: CalibrationSettings::default(),
        }
    }
}

impl InsSettings {
    /// Nominal loop period in seconds
    pub fn loop_delta_t(&self) -> f32 {
        1.0 / f32::from(self.loop_rate_hz.max(1))
    }

    /// Upper clamp applied to the measured loop delta time
    pub fn delta_t_max(&self) -> f32 {
        if self.loop_delta_t_max > 0.0 {
            self.loop_delta_t_max
        } else {
            10.0 * self.loop_delta_t()
        }
    }

    /// Whether instance `index` is selected by the use mask
    pub fn uses(&self, index: usize) -> bool {
        index < 8 && self.use_mask & (1 << index) != 0
    }
}
