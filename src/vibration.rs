//! Vibration and clipping monitor

use nalgebra::Vector3;

use crate::filter::LowPassFilter;

/// Cutoff of the filter tracking the vibration-free signal
const VIBE_FLOOR_FILT_HZ: f32 = 5.0;

/// Cutoff of the filter smoothing the squared deviation from the floor
const VIBE_LIVE_FILT_HZ: f32 = 2.0;

/// How long a negative X acceleration peak is held
pub const PEAK_HOLD_TIMEOUT_MS: u64 = 500;

/// Per-instance vibration estimator, run on every sensor-rate accel sample
#[derive(Debug, Clone)]
pub struct VibrationMonitor {
    floor: LowPassFilter,
    live: LowPassFilter,
    clip_limit: f32,
}

impl VibrationMonitor {
    /// # Arguments
    /// * `clip_limit` - Per-axis magnitude in m/s/s counted as a clip
    pub fn new(clip_limit: f32) -> Self {
        Self {
            floor: LowPassFilter::new(VIBE_FLOOR_FILT_HZ),
            live: LowPassFilter::new(VIBE_LIVE_FILT_HZ),
            clip_limit,
        }
    }

    /// Update with one calibrated sample taken `dt` seconds after the previous one
    ///
    /// # Returns
    /// `true` when the sample clipped on any axis
    pub fn update(&mut self, sample: Vector3<f32>, dt: f32) -> bool {
        let floor = self.floor.apply(sample, dt);
        let deviation = sample - floor;
        self.live.apply(deviation.component_mul(&deviation), dt);
        sample.amax() > self.clip_limit
    }

    /// Vibration level per axis in m/s/s
    pub fn levels(&self) -> Vector3<f32> {
        self.live.output().map(|v| v.max(0.0).sqrt())
    }
}

/// Holds the most negative X acceleration for [`PEAK_HOLD_TIMEOUT_MS`]
#[derive(Debug, Clone, Copy, Default)]
pub struct PeakHold {
    peak: Option<(f32, u64)>,
}

impl PeakHold {
    pub fn update(&mut self, accel_x: f32, now_ms: u64) {
        if accel_x >= 0.0 {
            return;
        }
        let replace = match self.peak {
            Some((held, expires_ms)) => accel_x < held || now_ms >= expires_ms,
            None => true,
        };
        if replace {
            self.peak = Some((accel_x, now_ms + PEAK_HOLD_TIMEOUT_MS));
        }
    }

    /// Held peak, `None` once it has expired
    pub fn peak(&self, now_ms: u64) -> Option<f32> {
        self.peak
            .filter(|&(_, expires_ms)| now_ms < expires_ms)
            .map(|(held, _)| held)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::GRAVITY_MSS;
    use core::f32::consts::PI;

    #[test]
    fn test_steady_signal_has_no_vibration() {
        let mut monitor = VibrationMonitor::new(15.5 * GRAVITY_MSS);
        for _ in 0..2000 {
            assert!(!monitor.update(Vector3::new(0.0, 0.0, GRAVITY_MSS), 0.001));
        }
        assert!(monitor.levels().norm() < 1e-3);
    }

    #[test]
    fn test_vibration_tracks_amplitude() {
        let mut monitor = VibrationMonitor::new(15.5 * GRAVITY_MSS);
        let amplitude = 4.0;
        for i in 0..4000 {
            let t = i as f32 * 0.001;
            let shake = amplitude * (2.0 * PI * 100.0 * t).sin();
            monitor.update(Vector3::new(shake, 0.0, GRAVITY_MSS), 0.001);
        }
        let levels = monitor.levels();
        // RMS of a sine is amplitude / sqrt(2)
        assert!((levels.x - amplitude / 2.0f32.sqrt()).abs() < 0.4, "level {}", levels.x);
        assert!(levels.y < 1e-3);
    }

    #[test]
    fn test_clip_detection() {
        let mut monitor = VibrationMonitor::new(16.0 * GRAVITY_MSS);
        assert!(!monitor.update(Vector3::new(0.0, 0.0, GRAVITY_MSS), 0.001));
        assert!(monitor.update(Vector3::new(0.0, -16.5 * GRAVITY_MSS, 0.0), 0.001));
    }

    #[test]
    fn test_peak_hold() {
        let mut hold = PeakHold::default();
        assert_eq!(hold.peak(0), None);

        hold.update(2.0, 0);
        assert_eq!(hold.peak(0), None);

        hold.update(-3.0, 100);
        hold.update(-1.0, 200);
        assert_eq!(hold.peak(300), Some(-3.0));

        // Expired peak is replaced by any new negative value
        assert_eq!(hold.peak(600), None);
        hold.update(-1.0, 650);
        assert_eq!(hold.peak(700), Some(-1.0));
    }
}
