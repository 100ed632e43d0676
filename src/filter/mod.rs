//! Filter stack applied to reduced samples
//!
//! Each instance runs a second-order low-pass followed by the enabled
//! harmonic notch sets. Gyro instances may additionally feed a separate
//! low-pass tap used for spectral capture; it never affects the control
//! signal.

mod harmonic_notch;
mod low_pass;
mod notch;

pub use harmonic_notch::{CENTER_DEADBAND_HZ, HarmonicNotchFilter};
pub use low_pass::{LowPassFilter, LowPassFilter2p};
pub use notch::{NotchFilter, NotchShape};

use nalgebra::Vector3;

use crate::types::{InsSettings, NUM_NOTCH_SETS, SensorKind};

/// Low-pass and notch filters of one instance
#[derive(Debug, Clone)]
pub struct FilterStack {
    low_pass: LowPassFilter2p,
    notches: [Option<HarmonicNotchFilter>; NUM_NOTCH_SETS],
    spectral: Option<LowPassFilter2p>,
}

impl FilterStack {
    /// Build the filters for an instance producing reduced samples at `sample_rate_hz`
    pub fn new(kind: SensorKind, sample_rate_hz: f32, settings: &InsSettings) -> Self {
        let cutoff_hz = match kind {
            SensorKind::Accel => settings.accel_filter_hz,
            SensorKind::Gyro => settings.gyro_filter_hz,
        };
        let notched = kind == SensorKind::Gyro || settings.notch_accel;

        let mut notches: [Option<HarmonicNotchFilter>; NUM_NOTCH_SETS] = Default::default();
        if notched {
            for (slot, notch) in notches.iter_mut().zip(settings.notches.iter()) {
                if notch.enabled {
                    let mut filter = HarmonicNotchFilter::new(sample_rate_hz, notch);
                    filter.update_center(notch.center_hz);
                    *slot = Some(filter);
                }
            }
        }

        let spectral = (kind == SensorKind::Gyro && settings.gyro_window_size > 0)
            .then(|| LowPassFilter2p::new(sample_rate_hz, settings.spectral_filter_hz));

        Self {
            low_pass: LowPassFilter2p::new(sample_rate_hz, cutoff_hz),
            notches,
            spectral,
        }
    }

    /// Move every notch set to its target fundamental
    pub fn retune(&mut self, targets: &[f32; NUM_NOTCH_SETS]) {
        for (notch, target) in self.notches.iter_mut().zip(targets) {
            if let Some(notch) = notch {
                notch.update_center(*target);
            }
        }
    }

    pub fn apply(&mut self, sample: Vector3<f32>) -> Vector3<f32> {
        let filtered = self.low_pass.apply(sample);
        self.notches
            .iter_mut()
            .flatten()
            .fold(filtered, |signal, notch| notch.apply(signal))
    }

    /// Feed the spectral capture tap, `None` when capture is disabled
    pub fn spectral_tap(&mut self, sample: Vector3<f32>) -> Option<Vector3<f32>> {
        self.spectral.as_mut().map(|filter| filter.apply(sample))
    }

    /// Current fundamental of a notch set, `None` when the set is not applied
    pub fn notch_center(&self, set: usize) -> Option<f32> {
        self.notches.get(set)?.as_ref()?.center_hz()
    }

    /// Combined notch response at `freq_hz`
    pub fn notch_gain_at(&self, freq_hz: f32) -> f32 {
        self.notches
            .iter()
            .flatten()
            .map(|notch| notch.gain_at(freq_hz))
            .product()
    }
}
