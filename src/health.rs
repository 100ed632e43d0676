//! Health and redundancy management
//!
//! Each instance is judged healthy from sample freshness, its error count
//! and the failover kill switch. Among healthy instances the front end
//! picks the first usable one per kind and flags disagreement between them.

use log::{info, warn};
use nalgebra::Vector3;

use crate::types::SensorKind;

/// Health of one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthState {
    #[default]
    Unhealthy,
    Healthy,
}

/// What the health tracker knows about an instance at one update
#[derive(Debug, Clone, Copy)]
pub struct HealthInputs {
    pub now_us: u64,
    /// Timestamp of the last published sample, zero when none arrived yet
    pub last_sample_us: u64,
    /// Cumulative backend error count
    pub error_count: u32,
    /// Whether the startup grace period has elapsed
    pub past_grace: bool,
    pub killed: bool,
}

/// Per-instance health state machine
#[derive(Debug, Clone)]
pub struct HealthTracker {
    kind: SensorKind,
    index: usize,
    stall_timeout_us: u64,
    error_threshold: u32,
    startup_errors: Option<u32>,
    state: HealthState,
}

impl HealthTracker {
    /// # Arguments
    /// * `raw_rate_hz` - Raw sample rate of the backend
    /// * `stall_timeout_periods` - Raw sample periods without data before the instance stalls
    /// * `error_threshold` - Errors accepted after the startup grace period
    pub fn new(
        kind: SensorKind,
        index: usize,
        raw_rate_hz: f32,
        stall_timeout_periods: f32,
        error_threshold: u32,
    ) -> Self {
        let stall_timeout_us = (stall_timeout_periods * 1.0e6 / raw_rate_hz).max(1.0) as u64;
        Self {
            kind,
            index,
            stall_timeout_us,
            error_threshold,
            startup_errors: None,
            state: HealthState::Unhealthy,
        }
    }

    /// Re-evaluate health, logging transitions
    pub fn evaluate(&mut self, inputs: HealthInputs) -> HealthState {
        if inputs.past_grace && self.startup_errors.is_none() {
            self.startup_errors = Some(inputs.error_count);
        }
        let excess_errors = self
            .startup_errors
            .map_or(0, |startup| inputs.error_count.saturating_sub(startup));

        let stalled = inputs.last_sample_us == 0
            || inputs.now_us.saturating_sub(inputs.last_sample_us) > self.stall_timeout_us;

        let state = if inputs.killed || stalled || excess_errors > self.error_threshold {
            HealthState::Unhealthy
        } else {
            HealthState::Healthy
        };

        if state != self.state {
            match state {
                HealthState::Unhealthy if inputs.killed => {
                    warn!("{} {} killed", self.kind, self.index)
                }
                HealthState::Unhealthy if stalled => {
                    warn!("{} {} unhealthy: no data for {} us", self.kind, self.index, self.stall_timeout_us)
                }
                HealthState::Unhealthy => {
                    warn!("{} {} unhealthy: {} errors", self.kind, self.index, excess_errors)
                }
                HealthState::Healthy => info!("{} {} healthy", self.kind, self.index),
            }
            self.state = state;
        }
        state
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    pub fn is_healthy(&self) -> bool {
        self.state == HealthState::Healthy
    }

    pub fn stall_timeout_us(&self) -> u64 {
        self.stall_timeout_us
    }
}

/// Selection inputs of one instance
#[derive(Debug, Clone, Copy, Default)]
pub struct Candidate {
    pub used: bool,
    pub healthy: bool,
    pub calibrated: bool,
}

/// Pick the first usable instance
///
/// # Returns
/// The lowest index that is used, healthy and calibrated, with `true`. When
/// none qualifies, the lowest used and healthy index (else zero) with `false`.
///
/// # Example
/// ```
/// use fusion_ins::health::{Candidate, first_usable};
///
/// let healthy = Candidate { used: true, healthy: true, calibrated: false };
/// let ready = Candidate { used: true, healthy: true, calibrated: true };
/// assert_eq!(first_usable(&[healthy, ready]), (1, true));
/// assert_eq!(first_usable(&[healthy, healthy]), (0, false));
/// ```
pub fn first_usable(candidates: &[Candidate]) -> (usize, bool) {
    if let Some(i) = candidates
        .iter()
        .position(|c| c.used && c.healthy && c.calibrated)
    {
        return (i, true);
    }
    let fallback = candidates
        .iter()
        .position(|c| c.used && c.healthy)
        .unwrap_or(0);
    (fallback, false)
}

/// Whether every pair of readings agrees within `threshold`
///
/// Readings are compared by the norm of their vector difference; `None`
/// entries (unhealthy instances) are skipped.
pub fn consistent(readings: &[Option<Vector3<f32>>], threshold: f32) -> bool {
    readings.iter().enumerate().all(|(i, a)| match a {
        Some(a) => readings[i + 1..]
            .iter()
            .flatten()
            .all(|b| (a - b).norm() <= threshold),
        None => true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(now_us: u64, last_sample_us: u64) -> HealthInputs {
        HealthInputs {
            now_us,
            last_sample_us,
            error_count: 0,
            past_grace: true,
            killed: false,
        }
    }

    #[test]
    fn test_stall_timeout() {
        // 50 periods at 1 kHz
        let mut tracker = HealthTracker::new(SensorKind::Gyro, 0, 1000.0, 50.0, 10);
        assert_eq!(tracker.stall_timeout_us(), 50_000);
        assert_eq!(tracker.state(), HealthState::Unhealthy);

        assert_eq!(tracker.evaluate(inputs(1_000, 0)), HealthState::Unhealthy);
        assert_eq!(tracker.evaluate(inputs(1_000, 900)), HealthState::Healthy);
        assert_eq!(tracker.evaluate(inputs(50_900, 900)), HealthState::Healthy);
        assert_eq!(tracker.evaluate(inputs(51_000, 900)), HealthState::Unhealthy);
        assert_eq!(tracker.evaluate(inputs(52_000, 51_900)), HealthState::Healthy);
    }

    #[test]
    fn test_startup_errors_ignored() {
        let mut tracker = HealthTracker::new(SensorKind::Accel, 1, 1000.0, 50.0, 10);
        let mut state = inputs(1_000, 1_000);

        state.past_grace = false;
        state.error_count = 500;
        assert!(tracker.evaluate(state) == HealthState::Healthy);

        // Errors present when the grace period ends are the baseline
        state.past_grace = true;
        assert!(tracker.evaluate(state) == HealthState::Healthy);
        state.error_count = 510;
        assert!(tracker.evaluate(state) == HealthState::Healthy);
        state.error_count = 511;
        assert!(tracker.evaluate(state) == HealthState::Unhealthy);
    }

    #[test]
    fn test_killed() {
        let mut tracker = HealthTracker::new(SensorKind::Gyro, 0, 1000.0, 50.0, 10);
        let mut state = inputs(1_000, 1_000);
        assert!(tracker.evaluate(state) == HealthState::Healthy);
        state.killed = true;
        assert!(tracker.evaluate(state) == HealthState::Unhealthy);
    }

    #[test]
    fn test_first_usable_fallback() {
        let unhealthy = Candidate {
            used: true,
            healthy: false,
            calibrated: true,
        };
        let unused = Candidate {
            used: false,
            healthy: true,
            calibrated: true,
        };
        let uncalibrated = Candidate {
            used: true,
            healthy: true,
            calibrated: false,
        };
        assert_eq!(first_usable(&[unhealthy, unused, uncalibrated]), (2, false));
        assert_eq!(first_usable(&[unhealthy, unused]), (0, false));
        assert_eq!(first_usable(&[]), (0, false));
    }

    #[test]
    fn test_consistency() {
        let a = Vector3::new(0.0, 0.0, 9.8);
        let b = Vector3::new(0.5, 0.0, 9.8);
        let c = Vector3::new(1.0, 0.0, 9.8);
        assert!(consistent(&[Some(a), Some(b)], 0.75));
        assert!(!consistent(&[Some(a), Some(b), Some(c)], 0.75));
        // Unhealthy instances do not take part
        assert!(consistent(&[Some(a), None, Some(b)], 0.75));
        assert!(consistent(&[], 0.75));
    }
}
