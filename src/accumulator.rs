//! Oversampled sample reduction
//!
//! Backends usually sample faster than the main loop runs. The accumulator
//! averages `ratio` consecutive raw samples into one reduced sample and keeps
//! their time integral (delta angle for gyros, delta velocity for accels).

use nalgebra::Vector3;

use crate::math::us_to_s;

/// Longest accepted interval between raw samples, in nominal periods
const MAX_DT_PERIODS: f32 = 10.0;

/// One reduced sample, the mean of `ratio` raw samples
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReducedSample {
    /// Arithmetic mean of the raw samples
    pub value: Vector3<f32>,
    /// Time integral of the raw samples
    pub delta: Vector3<f32>,
    /// Interval covered by `delta`, seconds
    pub delta_dt: f32,
    /// Timestamp of the last raw sample, microseconds
    pub timestamp_us: u64,
}

/// Number of raw samples averaged into one reduced sample
///
/// # Example
/// ```
/// use fusion_ins::accumulator::oversampling_ratio;
///
/// assert_eq!(oversampling_ratio(1000.0, 400), 3);
/// assert_eq!(oversampling_ratio(100.0, 400), 1);
/// ```
pub fn oversampling_ratio(raw_rate_hz: f32, loop_rate_hz: u16) -> u16 {
    let ratio = (raw_rate_hz / f32::from(loop_rate_hz.max(1))).round();
    if ratio.is_finite() && ratio >= 1.0 {
        ratio.min(f32::from(u16::MAX)) as u16
    } else {
        1
    }
}

/// Accumulates raw samples into reduced samples
#[derive(Debug, Clone)]
pub struct SampleAccumulator {
    ratio: u16,
    nominal_dt: f32,
    sum: Vector3<f32>,
    delta: Vector3<f32>,
    delta_dt: f32,
    count: u16,
    last_timestamp_us: Option<u64>,
}

impl SampleAccumulator {
    /// Create an accumulator for a backend sampling at `raw_rate_hz`
    pub fn new(ratio: u16, raw_rate_hz: f32) -> Self {
        Self {
            ratio: ratio.max(1),
            nominal_dt: 1.0 / raw_rate_hz,
            sum: Vector3::zeros(),
            delta: Vector3::zeros(),
            delta_dt: 0.0,
            count: 0,
            last_timestamp_us: None,
        }
    }

    /// Add one raw sample
    ///
    /// # Returns
    /// The reduced sample when this raw sample completes a group of `ratio`
    pub fn ingest(&mut self, sample: Vector3<f32>, timestamp_us: u64) -> Option<ReducedSample> {
        let dt = self.sample_dt(timestamp_us);
        self.last_timestamp_us = Some(timestamp_us);

        self.sum += sample;
        self.delta += sample * dt;
        self.delta_dt += dt;
        self.count += 1;

        if self.count < self.ratio {
            return None;
        }

        let reduced = ReducedSample {
            value: self.sum / f32::from(self.count),
            delta: self.delta,
            delta_dt: self.delta_dt,
            timestamp_us,
        };
        self.clear();
        Some(reduced)
    }

    /// Interval since the previous raw sample
    ///
    /// Nominal for the first sample and for timestamps that do not advance,
    /// clamped so a stalled bus cannot produce a huge integral.
    pub fn sample_dt(&self, timestamp_us: u64) -> f32 {
        match self.last_timestamp_us {
            Some(previous) if timestamp_us > previous => {
                us_to_s(timestamp_us - previous).min(MAX_DT_PERIODS * self.nominal_dt)
            }
            _ => self.nominal_dt,
        }
    }

    fn clear(&mut self) {
        self.sum = Vector3::zeros();
        self.delta = Vector3::zeros();
        self.delta_dt = 0.0;
        self.count = 0;
    }

    pub fn ratio(&self) -> u16 {
        self.ratio
    }

    /// Raw samples waiting for the current group to complete
    pub fn pending(&self) -> u16 {
        self.count
    }
}
