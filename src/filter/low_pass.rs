//! Low-pass filters

use core::f32::consts::PI;

use nalgebra::Vector3;

use crate::math::lowpass_alpha;

/// First-order low-pass filter with a per-sample interval
///
/// The state is seeded from the first sample so there is no start-up transient.
#[derive(Debug, Clone, Copy)]
pub struct LowPassFilter {
    cutoff_hz: f32,
    state: Option<Vector3<f32>>,
}

impl LowPassFilter {
    pub fn new(cutoff_hz: f32) -> Self {
        Self {
            cutoff_hz,
            state: None,
        }
    }

    /// Filter one sample taken `dt` seconds after the previous one
    pub fn apply(&mut self, sample: Vector3<f32>, dt: f32) -> Vector3<f32> {
        let output = match self.state {
            Some(state) => state + (sample - state) * lowpass_alpha(dt, self.cutoff_hz),
            None => sample,
        };
        self.state = Some(output);
        output
    }

    /// Last output, zero before the first sample
    pub fn output(&self) -> Vector3<f32> {
        self.state.unwrap_or_else(Vector3::zeros)
    }

    pub fn reset(&mut self) {
        self.state = None;
    }
}

/// Second-order Butterworth low-pass biquad
///
/// A cutoff of zero, or one at or above Nyquist, makes the filter a passthrough.
///
/// # Example
/// ```
/// use nalgebra::Vector3;
/// use fusion_ins::filter::LowPassFilter2p;
///
/// let mut filter = LowPassFilter2p::new(400.0, 20.0);
/// let level = Vector3::new(0.0, 0.0, 9.8);
/// // Seeded from the first sample, so a constant input passes straight through
/// assert!((filter.apply(level) - level).norm() < 1e-4);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct LowPassFilter2p {
    sample_rate_hz: f32,
    cutoff_hz: f32,
    coefficients: Option<Biquad>,
    delay_element_1: Vector3<f32>,
    delay_element_2: Vector3<f32>,
    seeded: bool,
}

#[derive(Debug, Clone, Copy)]
struct Biquad {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
}

impl LowPassFilter2p {
    pub fn new(sample_rate_hz: f32, cutoff_hz: f32) -> Self {
        let coefficients = (cutoff_hz > 0.0 && cutoff_hz < 0.5 * sample_rate_hz).then(|| {
            let fr = sample_rate_hz / cutoff_hz;
            let ohm = (PI / fr).tan();
            let c = 1.0 + 2.0 * (PI / 4.0).cos() * ohm + ohm * ohm;
            let b0 = ohm * ohm / c;
            Biquad {
                b0,
                b1: 2.0 * b0,
                b2: b0,
                a1: 2.0 * (ohm * ohm - 1.0) / c,
                a2: (1.0 - 2.0 * (PI / 4.0).cos() * ohm + ohm * ohm) / c,
            }
        });

        Self {
            sample_rate_hz,
            cutoff_hz,
            coefficients,
            delay_element_1: Vector3::zeros(),
            delay_element_2: Vector3::zeros(),
            seeded: false,
        }
    }

    pub fn apply(&mut self, sample: Vector3<f32>) -> Vector3<f32> {
        let Some(q) = self.coefficients else {
            return sample;
        };

        if !self.seeded {
            let dc = sample / (q.b0 + q.b1 + q.b2);
            self.delay_element_1 = dc;
            self.delay_element_2 = dc;
            self.seeded = true;
        }

        let delay_element_0 = sample - self.delay_element_1 * q.a1 - self.delay_element_2 * q.a2;
        let output =
            delay_element_0 * q.b0 + self.delay_element_1 * q.b1 + self.delay_element_2 * q.b2;

        self.delay_element_2 = self.delay_element_1;
        self.delay_element_1 = delay_element_0;

        output
    }

    /// Whether the filter does anything
    pub fn is_active(&self) -> bool {
        self.coefficients.is_some()
    }

    pub fn cutoff_hz(&self) -> f32 {
        self.cutoff_hz
    }

    pub fn sample_rate_hz(&self) -> f32 {
        self.sample_rate_hz
    }

    pub fn reset(&mut self) {
        self.seeded = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_amplitude(filter: &mut LowPassFilter2p, freq_hz: f32) -> f32 {
        let fs = filter.sample_rate_hz();
        let mut peak = 0.0f32;
        for i in 0..4000 {
            let t = i as f32 / fs;
            let out = filter.apply(Vector3::new((2.0 * PI * freq_hz * t).sin(), 0.0, 0.0));
            if i > 2000 {
                peak = peak.max(out.x.abs());
            }
        }
        peak
    }

    #[test]
    fn test_passband_and_stopband() {
        let mut filter = LowPassFilter2p::new(1000.0, 20.0);
        assert!(sine_amplitude(&mut filter, 2.0) > 0.98);

        let mut filter = LowPassFilter2p::new(1000.0, 20.0);
        // Two poles, so 200 Hz is down by roughly 40 dB
        assert!(sine_amplitude(&mut filter, 200.0) < 0.02);

        let mut filter = LowPassFilter2p::new(1000.0, 20.0);
        let at_cutoff = sine_amplitude(&mut filter, 20.0);
        assert!((at_cutoff - core::f32::consts::FRAC_1_SQRT_2).abs() < 0.03);
    }

    #[test]
    fn test_disabled_is_passthrough() {
        let mut filter = LowPassFilter2p::new(1000.0, 0.0);
        assert!(!filter.is_active());
        let v = Vector3::new(1.0, -5.0, 3.0);
        assert_eq!(filter.apply(v), v);

        let mut above_nyquist = LowPassFilter2p::new(400.0, 300.0);
        assert_eq!(above_nyquist.apply(v), v);
    }

    #[test]
    fn test_seeded_from_first_sample() {
        let mut filter = LowPassFilter2p::new(400.0, 10.0);
        let v = Vector3::new(0.0, 0.0, 9.80665);
        for _ in 0..10 {
            assert!((filter.apply(v) - v).norm() < 1e-4);
        }
    }

    #[test]
    fn test_first_order_converges() {
        let mut filter = LowPassFilter::new(5.0);
        assert_eq!(filter.apply(Vector3::new(1.0, 1.0, 1.0), 0.001), Vector3::new(1.0, 1.0, 1.0));
        for _ in 0..2000 {
            filter.apply(Vector3::zeros(), 0.001);
        }
        assert!(filter.output().norm() < 1e-3);
    }
}
