//! Bank of notches at a fundamental frequency and its harmonics

use nalgebra::Vector3;

use super::notch::{NotchFilter, NotchShape};
use crate::types::{MAX_HARMONICS, NotchSettings};

/// Center changes smaller than this do not recompute coefficients
pub const CENTER_DEADBAND_HZ: f32 = 0.1;

/// Harmonics at or above this fraction of the sample rate are bypassed
const MAX_HARMONIC_RATIO: f32 = 0.48;

/// Harmonic notch filter
///
/// One notch per harmonic bit in [`NotchSettings::harmonics`], all sharing the
/// attenuation and quality factor of the fundamental. Only the center
/// frequency is live.
///
/// # Example
/// ```
/// use nalgebra::Vector3;
/// use fusion_ins::NotchSettings;
/// use fusion_ins::filter::HarmonicNotchFilter;
///
/// let settings = NotchSettings {
///     enabled: true,
///     harmonics: 0b101, // fundamental and third harmonic
///     ..Default::default()
/// };
/// let mut filter = HarmonicNotchFilter::new(1000.0, &settings);
/// filter.update_center(80.0);
/// assert_eq!(filter.active_harmonics(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct HarmonicNotchFilter {
    sample_rate_hz: f32,
    shape: NotchShape,
    harmonics: u8,
    notches: [NotchFilter; MAX_HARMONICS],
    center_hz: Option<f32>,
}

impl HarmonicNotchFilter {
    pub fn new(sample_rate_hz: f32, settings: &NotchSettings) -> Self {
        Self {
            sample_rate_hz,
            shape: NotchShape::new(settings.center_hz, settings.bandwidth_hz, settings.attenuation_db),
            harmonics: settings.harmonics,
            notches: [NotchFilter::default(); MAX_HARMONICS],
            center_hz: None,
        }
    }

    /// Move the fundamental to `center_hz`
    ///
    /// # Returns
    /// `true` when the coefficients were recomputed
    pub fn update_center(&mut self, center_hz: f32) -> bool {
        if !center_hz.is_finite() {
            return false;
        }
        if self
            .center_hz
            .is_some_and(|current| (center_hz - current).abs() <= CENTER_DEADBAND_HZ)
        {
            return false;
        }
        self.center_hz = Some(center_hz);

        let limit = MAX_HARMONIC_RATIO * self.sample_rate_hz;
        for (i, notch) in self.notches.iter_mut().enumerate() {
            let frequency = center_hz * (i + 1) as f32;
            if self.harmonics & (1 << i) == 0 || frequency >= limit {
                notch.disable();
            } else {
                notch.tune(self.sample_rate_hz, frequency, self.shape);
            }
        }
        true
    }

    pub fn apply(&mut self, sample: Vector3<f32>) -> Vector3<f32> {
        self.notches
            .iter_mut()
            .fold(sample, |signal, notch| notch.apply(signal))
    }

    /// Current fundamental, `None` until the first [`update_center`](Self::update_center)
    pub fn center_hz(&self) -> Option<f32> {
        self.center_hz
    }

    /// Number of harmonics currently filtering
    pub fn active_harmonics(&self) -> usize {
        self.notches.iter().filter(|n| n.is_active()).count()
    }

    /// Combined magnitude response at `freq_hz`
    pub fn gain_at(&self, freq_hz: f32) -> f32 {
        self.notches
            .iter()
            .map(|n| n.gain_at(self.sample_rate_hz, freq_hz))
            .product()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(harmonics: u8) -> NotchSettings {
        NotchSettings {
            enabled: true,
            center_hz: 80.0,
            bandwidth_hz: 40.0,
            attenuation_db: 40.0,
            harmonics,
            ..Default::default()
        }
    }

    #[test]
    fn test_harmonics_follow_fundamental() {
        let mut filter = HarmonicNotchFilter::new(1000.0, &settings(0b011));
        assert!(filter.update_center(80.0));
        assert_eq!(filter.active_harmonics(), 2);
        assert!(filter.gain_at(80.0) < 0.02);
        assert!(filter.gain_at(160.0) < 0.02);
        assert!(filter.gain_at(400.0) > 0.95);
    }

    #[test]
    fn test_high_harmonics_bypassed() {
        // Third harmonic at 540 Hz is above 0.48 * 1000
        let mut filter = HarmonicNotchFilter::new(1000.0, &settings(0b111));
        filter.update_center(180.0);
        assert_eq!(filter.active_harmonics(), 2);

        filter.update_center(100.0);
        assert_eq!(filter.active_harmonics(), 3);
    }

    #[test]
    fn test_deadband() {
        let mut filter = HarmonicNotchFilter::new(1000.0, &settings(0b001));
        assert!(filter.update_center(80.0));
        assert!(!filter.update_center(80.05));
        assert_eq!(filter.center_hz(), Some(80.0));
        assert!(filter.update_center(80.5));
        assert_eq!(filter.center_hz(), Some(80.5));
    }
}
