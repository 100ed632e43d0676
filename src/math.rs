//! Mathematical constants and nalgebra extensions

use nalgebra::Vector3;

/// Standard gravity in m/s/s
pub const GRAVITY_MSS: f32 = 9.80665;

/// Mathematical constants
pub const DEG_TO_RAD: f32 = core::f32::consts::PI / 180.0;
pub const RAD_TO_DEG: f32 = 180.0 / core::f32::consts::PI;

/// Extension trait for Vector3 operations
pub trait Vector3Ext {
    /// True when every component is finite
    fn all_finite(&self) -> bool;
}

impl Vector3Ext for Vector3<f32> {
    fn all_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Smoothing factor of a first-order low-pass filter
///
/// `alpha = dt / (dt + 1 / (2π fc))`; a non-positive cutoff passes the input through.
pub fn lowpass_alpha(dt: f32, cutoff_hz: f32) -> f32 {
    if cutoff_hz <= 0.0 || dt <= 0.0 {
        return 1.0;
    }
    let rc = 1.0 / (2.0 * core::f32::consts::PI * cutoff_hz);
    dt / (dt + rc)
}

/// Microseconds to seconds
#[inline]
pub fn us_to_s(us: u64) -> f32 {
    us as f32 * 1.0e-6
}
