//! Single biquad notch filter

use core::f32::consts::PI;

use nalgebra::Vector3;

/// Attenuation and quality factor of a notch
///
/// Computed once from center frequency, bandwidth and attenuation and then
/// shared by every harmonic of a notch set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NotchShape {
    /// Linear amplitude parameter, `10^(-attenuation_db / 40)`
    pub a: f32,
    /// Quality factor, zero when the bandwidth is too wide for the center frequency
    pub q: f32,
}

impl NotchShape {
    pub fn new(center_hz: f32, bandwidth_hz: f32, attenuation_db: f32) -> Self {
        let a = 10.0f32.powf(-attenuation_db / 40.0);
        let q = if center_hz > 0.5 * bandwidth_hz {
            let octaves = (center_hz / (center_hz - bandwidth_hz / 2.0)).log2() * 2.0;
            let width = 2.0f32.powf(octaves);
            width.sqrt() / (width - 1.0)
        } else {
            0.0
        };
        Self { a, q }
    }
}

#[derive(Debug, Clone, Copy)]
struct Coefficients {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
}

/// Biquad notch filter over 3-axis samples
///
/// While inactive the filter passes samples through and tracks them in its
/// history, so activation starts from the current signal. Retuning an active
/// filter only replaces the coefficients.
#[derive(Debug, Clone, Copy)]
pub struct NotchFilter {
    center_hz: f32,
    coefficients: Option<Coefficients>,
    input_1: Vector3<f32>,
    input_2: Vector3<f32>,
    output_1: Vector3<f32>,
    output_2: Vector3<f32>,
    seeded: bool,
}

impl Default for NotchFilter {
    fn default() -> Self {
        Self {
            center_hz: 0.0,
            coefficients: None,
            input_1: Vector3::zeros(),
            input_2: Vector3::zeros(),
            output_1: Vector3::zeros(),
            output_2: Vector3::zeros(),
            seeded: false,
        }
    }
}

impl NotchFilter {
    /// Build a notch from center frequency, bandwidth and attenuation
    ///
    /// # Example
    /// ```
    /// use fusion_ins::filter::NotchFilter;
    ///
    /// let notch = NotchFilter::new(1000.0, 80.0, 40.0, 40.0);
    /// assert!(notch.is_active());
    /// assert!((notch.gain_at(1000.0, 80.0) - 0.01).abs() < 1e-3);
    /// ```
    pub fn new(sample_rate_hz: f32, center_hz: f32, bandwidth_hz: f32, attenuation_db: f32) -> Self {
        let mut notch = Self::default();
        notch.tune(sample_rate_hz, center_hz, NotchShape::new(center_hz, bandwidth_hz, attenuation_db));
        notch
    }

    /// Set the center frequency, keeping the filter history
    ///
    /// A center at or above Nyquist, or a zero quality factor, deactivates the
    /// notch.
    pub fn tune(&mut self, sample_rate_hz: f32, center_hz: f32, shape: NotchShape) {
        self.center_hz = center_hz;
        if center_hz <= 0.0 || center_hz >= 0.5 * sample_rate_hz || shape.q <= 0.0 {
            self.coefficients = None;
            return;
        }

        let omega = 2.0 * PI * center_hz / sample_rate_hz;
        let alpha = omega.sin() / (2.0 * shape.q);
        let a_sq = shape.a * shape.a;
        let a0_inv = 1.0 / (1.0 + alpha);
        let b1 = -2.0 * omega.cos();
        self.coefficients = Some(Coefficients {
            b0: (1.0 + alpha * a_sq) * a0_inv,
            b1: b1 * a0_inv,
            b2: (1.0 - alpha * a_sq) * a0_inv,
            a1: b1 * a0_inv,
            a2: (1.0 - alpha) * a0_inv,
        });
    }

    /// Deactivate the notch; samples pass through unchanged
    pub fn disable(&mut self) {
        self.coefficients = None;
    }

    pub fn apply(&mut self, sample: Vector3<f32>) -> Vector3<f32> {
        let Some(c) = self.coefficients else {
            self.seed(sample);
            return sample;
        };
        if !self.seeded {
            self.seed(sample);
        }

        let output = sample * c.b0 + self.input_1 * c.b1 + self.input_2 * c.b2
            - self.output_1 * c.a1
            - self.output_2 * c.a2;

        self.input_2 = self.input_1;
        self.input_1 = sample;
        self.output_2 = self.output_1;
        self.output_1 = output;

        output
    }

    fn seed(&mut self, sample: Vector3<f32>) {
        self.input_1 = sample;
        self.input_2 = sample;
        self.output_1 = sample;
        self.output_2 = sample;
        self.seeded = true;
    }

    pub fn is_active(&self) -> bool {
        self.coefficients.is_some()
    }

    pub fn center_hz(&self) -> f32 {
        self.center_hz
    }

    /// Magnitude response at `freq_hz`
    pub fn gain_at(&self, sample_rate_hz: f32, freq_hz: f32) -> f32 {
        let Some(c) = self.coefficients else {
            return 1.0;
        };
        let w = 2.0 * PI * freq_hz / sample_rate_hz;
        let (cos1, sin1) = (w.cos(), w.sin());
        let (cos2, sin2) = ((2.0 * w).cos(), (2.0 * w).sin());
        let num_re = c.b0 + c.b1 * cos1 + c.b2 * cos2;
        let num_im = -(c.b1 * sin1 + c.b2 * sin2);
        let den_re = 1.0 + c.a1 * cos1 + c.a2 * cos2;
        let den_im = -(c.a1 * sin1 + c.a2 * sin2);
        ((num_re * num_re + num_im * num_im) / (den_re * den_re + den_im * den_im)).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape() {
        let shape = NotchShape::new(80.0, 40.0, 40.0);
        assert!((shape.a - 0.1).abs() < 1e-6);
        assert!(shape.q > 1.0 && shape.q < 3.0);

        // Bandwidth wider than twice the center cannot be realised
        assert_eq!(NotchShape::new(10.0, 40.0, 40.0).q, 0.0);
    }

    #[test]
    fn test_attenuates_center_only() {
        let notch = NotchFilter::new(1000.0, 80.0, 40.0, 40.0);
        assert!(notch.gain_at(1000.0, 80.0) < 0.011);
        assert!(notch.gain_at(1000.0, 10.0) > 0.95);
        assert!(notch.gain_at(1000.0, 300.0) > 0.95);
    }

    #[test]
    fn test_time_domain_attenuation() {
        let fs = 1000.0;
        let mut notch = NotchFilter::new(fs, 80.0, 40.0, 40.0);
        let mut peak = 0.0f32;
        for i in 0..3000 {
            let t = i as f32 / fs;
            let out = notch.apply(Vector3::new((2.0 * PI * 80.0 * t).sin(), 0.0, 0.0));
            if i > 2000 {
                peak = peak.max(out.x.abs());
            }
        }
        assert!(peak < 0.05, "residual amplitude {}", peak);
    }

    #[test]
    fn test_inactive_passthrough() {
        let mut notch = NotchFilter::new(200.0, 150.0, 40.0, 40.0);
        assert!(!notch.is_active());
        let v = Vector3::new(1.0, 2.0, 3.0);
        assert_eq!(notch.apply(v), v);
    }

    #[test]
    fn test_retune_keeps_history() {
        let fs = 1000.0;
        let shape = NotchShape::new(80.0, 40.0, 40.0);
        let mut notch = NotchFilter::default();
        notch.tune(fs, 80.0, shape);

        let constant = Vector3::new(0.5, 0.5, 0.5);
        for _ in 0..200 {
            notch.apply(constant);
        }
        notch.tune(fs, 100.0, shape);
        // Unity DC gain and settled history, so a retune causes no step
        let out = notch.apply(constant);
        assert!((out - constant).norm() < 1e-3);
    }
}
