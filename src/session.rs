//! Calibration sessions
//!
//! A session lives between an explicit start and finish (or abort) on the
//! control surface and is fed reduced samples by `update()`.

use log::{info, warn};
use nalgebra::Vector3;

use crate::calibration::{GyroCalibrator, GyroStep};
use crate::types::{CalibrationSettings, MAX_INSTANCES};

/// Accelerometer pose collection
#[derive(Debug, Clone)]
pub struct AccelSession {
    instance_mask: u8,
    pose_samples: u16,
    poses: [Vec<Vector3<f32>>; MAX_INSTANCES],
    collecting: Option<PoseCollector>,
}

#[derive(Debug, Clone, Default)]
struct PoseCollector {
    sum: [Vector3<f64>; MAX_INSTANCES],
    count: [u16; MAX_INSTANCES],
}

impl AccelSession {
    /// # Arguments
    /// * `instance_mask` - Accel instances taking part, bit per index
    /// * `pose_samples` - Reduced samples averaged per pose
    pub fn new(instance_mask: u8, pose_samples: u16) -> Self {
        Self {
            instance_mask,
            pose_samples: pose_samples.max(1),
            poses: Default::default(),
            collecting: None,
        }
    }

    /// Whether `instance` takes part in the session
    pub fn includes(&self, instance: usize) -> bool {
        instance < MAX_INSTANCES && self.instance_mask & (1 << instance) != 0
    }

    /// Participating instances in index order
    pub fn instances(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_INSTANCES).filter(|&i| self.includes(i))
    }

    /// Start averaging the next pose
    ///
    /// # Returns
    /// `false` when a pose is already being collected
    pub fn begin_pose(&mut self) -> bool {
        if self.collecting.is_some() {
            return false;
        }
        self.collecting = Some(PoseCollector::default());
        true
    }

    pub fn is_collecting(&self) -> bool {
        self.collecting.is_some()
    }

    /// Feed one uncalibrated reduced sample
    pub fn feed(&mut self, instance: usize, sample: Vector3<f32>) {
        if !self.includes(instance) {
            return;
        }
        let Some(collector) = self.collecting.as_mut() else {
            return;
        };
        if collector.count[instance] >= self.pose_samples {
            return;
        }
        collector.sum[instance] += sample.cast::<f64>();
        collector.count[instance] += 1;

        let instance_mask = self.instance_mask;
        let pose_samples = self.pose_samples;
        let complete = (0..MAX_INSTANCES)
            .filter(|&i| instance_mask & (1 << i) != 0)
            .all(|i| collector.count[i] >= pose_samples);
        if complete {
            for i in (0..MAX_INSTANCES).filter(|&i| instance_mask & (1 << i) != 0) {
                let mean = collector.sum[i] / f64::from(collector.count[i]);
                self.poses[i].push(mean.cast::<f32>());
            }
            self.collecting = None;
            info!("accel calibration pose {} captured", self.pose_count());
        }
    }

    /// Complete poses per instance
    pub fn pose_count(&self) -> usize {
        self.instances()
            .map(|i| self.poses[i].len())
            .min()
            .unwrap_or(0)
    }

    pub fn poses(&self, instance: usize) -> &[Vector3<f32>] {
        self.poses.get(instance).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// State of a gyro session after a feed
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GyroSessionState {
    Running,
    /// Every instance completed its window
    Complete,
    /// Motion persisted beyond the restart budget
    Failed,
}

/// Stationary-window gyro calibration of every participating instance
#[derive(Debug, Clone)]
pub struct GyroSession {
    calibrators: [Option<GyroCalibrator>; MAX_INSTANCES],
}

impl GyroSession {
    /// # Arguments
    /// * `rates` - Reduced sample rate of each participating instance
    pub fn new(settings: &CalibrationSettings, rates: &[Option<f32>; MAX_INSTANCES]) -> Self {
        let mut calibrators: [Option<GyroCalibrator>; MAX_INSTANCES] = Default::default();
        for (calibrator, rate) in calibrators.iter_mut().zip(rates) {
            *calibrator = rate.map(|rate| GyroCalibrator::new(settings, rate));
        }
        Self { calibrators }
    }

    /// Feed one uncalibrated reduced sample
    ///
    /// Motion on any instance restarts the window of every instance.
    pub fn feed(&mut self, instance: usize, sample: Vector3<f32>) -> GyroSessionState {
        let step = match self.calibrators.get_mut(instance) {
            Some(Some(calibrator)) => calibrator.update(sample),
            _ => return self.state(),
        };
        if step == GyroStep::Restarted {
            warn!("gyro calibration: motion on instance {}, restarting", instance);
            let others = self
                .calibrators
                .iter_mut()
                .enumerate()
                .filter(|(i, _)| *i != instance)
                .filter_map(|(_, c)| c.as_mut());
            for other in others {
                other.restart();
            }
        }
        self.state()
    }

    pub fn state(&self) -> GyroSessionState {
        let mut calibrators = self.calibrators.iter().flatten();
        if calibrators.clone().any(|c| c.failed()) {
            GyroSessionState::Failed
        } else if calibrators.all(|c| c.bias().is_some()) {
            GyroSessionState::Complete
        } else {
            GyroSessionState::Running
        }
    }

    /// Bias of every participating instance, once complete
    pub fn biases(&self) -> [Option<Vector3<f32>>; MAX_INSTANCES] {
        core::array::from_fn(|i| self.calibrators[i].as_ref().and_then(|c| c.bias()))
    }
}
