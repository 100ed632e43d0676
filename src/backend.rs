//! Producer side of a sensor instance
//!
//! A backend driver owns a [`BackendHandle`] and calls
//! [`ingest`](BackendHandle::ingest) for every raw sample, usually from its
//! own thread. Everything the consumer needs crosses over through the
//! lock-free [`InstanceShared`] state: complete reduced samples in a bounded
//! queue, plus atomics for timestamps, counters and calibration.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crossbeam::atomic::AtomicCell;
use crossbeam::channel::Sender;
use crossbeam::queue::ArrayQueue;
use nalgebra::Vector3;

use crate::accumulator::SampleAccumulator;
use crate::batch::CaptureRing;
use crate::calibration::Calibration;
use crate::filter::FilterStack;
use crate::math::Vector3Ext;
use crate::rotation::Rotation;
use crate::types::{NUM_NOTCH_SETS, SensorKind};
use crate::vibration::VibrationMonitor;

/// Reduced samples buffered between producer and consumer
pub const PUBLISH_QUEUE_DEPTH: usize = 8;

/// A reduced sample as handed to the consumer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PublishedSample {
    /// Rotated, uncalibrated mean
    pub raw: Vector3<f32>,
    /// Calibrated mean, before filtering
    pub calibrated: Vector3<f32>,
    /// Calibrated and filtered
    pub filtered: Vector3<f32>,
    /// Calibrated time integral
    pub delta: Vector3<f32>,
    pub delta_dt: f32,
    pub timestamp_us: u64,
}

/// Notch targets written by the consumer and read by every producer
#[derive(Debug)]
pub(crate) struct NotchTargets {
    centers: [AtomicCell<f32>; NUM_NOTCH_SETS],
}

impl NotchTargets {
    pub fn new(initial: [f32; NUM_NOTCH_SETS]) -> Self {
        Self {
            centers: initial.map(AtomicCell::new),
        }
    }

    pub fn store(&self, set: usize, center_hz: f32) {
        if let Some(center) = self.centers.get(set) {
            center.store(center_hz);
        }
    }

    pub fn load(&self) -> [f32; NUM_NOTCH_SETS] {
        core::array::from_fn(|set| self.centers[set].load())
    }
}

/// State shared between one producer and the consumer
#[derive(Debug)]
pub(crate) struct InstanceShared {
    pub kind: SensorKind,
    pub index: usize,
    pub stable_id: u32,
    pub raw_rate_hz: f32,
    pub ratio: u16,
    pub queue: ArrayQueue<PublishedSample>,
    pub overruns: AtomicU32,
    /// Zero until the first sample
    pub last_sample_us: AtomicU64,
    pub error_count: AtomicU32,
    pub clip_count: AtomicU32,
    pub vibration: AtomicCell<Vector3<f32>>,
    pub calibration: AtomicCell<Calibration>,
    pub temperature: AtomicCell<f32>,
    pub batch_raw: Option<CaptureRing>,
    pub batch_filtered: Option<CaptureRing>,
    pub gyro_window: Option<ArrayQueue<Vector3<f32>>>,
}

impl InstanceShared {
    pub fn new(kind: SensorKind, index: usize, stable_id: u32, raw_rate_hz: f32, ratio: u16) -> Self {
        Self {
            kind,
            index,
            stable_id,
            raw_rate_hz,
            ratio,
            queue: ArrayQueue::new(PUBLISH_QUEUE_DEPTH),
            overruns: AtomicU32::new(0),
            last_sample_us: AtomicU64::new(0),
            error_count: AtomicU32::new(0),
            clip_count: AtomicU32::new(0),
            vibration: AtomicCell::new(Vector3::zeros()),
            calibration: AtomicCell::new(Calibration::identity()),
            temperature: AtomicCell::new(0.0),
            batch_raw: None,
            batch_filtered: None,
            gyro_window: None,
        }
    }

    /// Rate of reduced samples
    pub fn sample_rate_hz(&self) -> f32 {
        self.raw_rate_hz / f32::from(self.ratio)
    }
}

/// Handle through which a backend driver feeds one sensor instance
///
/// Created by [`InertialSensor::register`](crate::InertialSensor::register)
/// and moved to the producer thread. Never blocks.
#[derive(Debug)]
pub struct BackendHandle {
    shared: Arc<InstanceShared>,
    targets: Arc<NotchTargets>,
    doorbell: Sender<()>,
    accumulator: SampleAccumulator,
    filters: FilterStack,
    vibration: Option<VibrationMonitor>,
    sensor_rotation: Rotation,
    board_rotation: Rotation,
}

impl BackendHandle {
    pub(crate) fn new(
        shared: Arc<InstanceShared>,
        targets: Arc<NotchTargets>,
        doorbell: Sender<()>,
        filters: FilterStack,
        vibration: Option<VibrationMonitor>,
        board_rotation: Rotation,
    ) -> Self {
        let accumulator = SampleAccumulator::new(shared.ratio, shared.raw_rate_hz);
        Self {
            shared,
            targets,
            doorbell,
            accumulator,
            filters,
            vibration,
            sensor_rotation: Rotation::None,
            board_rotation,
        }
    }

    /// Instance index within its kind
    pub fn instance(&self) -> usize {
        self.shared.index
    }

    pub fn kind(&self) -> SensorKind {
        self.shared.kind
    }

    /// Oversampling ratio applied by the accumulator
    pub fn ratio(&self) -> u16 {
        self.shared.ratio
    }

    /// Feed one raw sample in the sensor frame
    ///
    /// # Arguments
    /// * `sample` - m/s/s for accelerometers, rad/s for gyroscopes
    /// * `timestamp_us` - Sample time on the front end's clock
    ///
    /// Non-finite samples are dropped and counted as errors.
    pub fn ingest(&mut self, sample: Vector3<f32>, timestamp_us: u64) {
        if !sample.all_finite() {
            self.report_error();
            return;
        }
        let body = self.board_rotation.rotate(self.sensor_rotation.rotate(sample));
        let calibration = self.shared.calibration.load();

        if let Some(vibration) = self.vibration.as_mut() {
            let dt = self.accumulator.sample_dt(timestamp_us);
            if vibration.update(calibration.apply(body), dt) {
                self.shared.clip_count.fetch_add(1, Ordering::Relaxed);
            }
            self.shared.vibration.store(vibration.levels());
        }
        if let Some(ring) = &self.shared.batch_raw {
            ring.force_push(calibration.apply(body).into());
        }
        self.shared.last_sample_us.store(timestamp_us.max(1), Ordering::Release);

        let Some(reduced) = self.accumulator.ingest(body, timestamp_us) else {
            return;
        };

        let calibrated = calibration.apply(reduced.value);
        self.filters.retune(&self.targets.load());
        let filtered = self.filters.apply(calibrated);

        if let (Some(window), Some(tap)) =
            (&self.shared.gyro_window, self.filters.spectral_tap(calibrated))
        {
            window.force_push(tap);
        }
        if let Some(ring) = &self.shared.batch_filtered {
            ring.force_push(filtered.into());
        }

        let mut published = PublishedSample {
            raw: reduced.value,
            calibrated,
            filtered,
            delta: calibration.apply_delta(reduced.delta, reduced.delta_dt),
            delta_dt: reduced.delta_dt,
            timestamp_us: reduced.timestamp_us,
        };
        // A full queue sheds its oldest sample, whose integral moves into the new one
        while let Err(rejected) = self.shared.queue.push(published) {
            published = rejected;
            if let Some(evicted) = self.shared.queue.pop() {
                published.delta += evicted.delta;
                published.delta_dt += evicted.delta_dt;
                self.shared.overruns.fetch_add(1, Ordering::Relaxed);
            }
        }
        // A full doorbell already wakes the consumer
        let _ = self.doorbell.try_send(());
    }

    /// Record one bus or device error
    pub fn report_error(&self) {
        self.report_errors(1);
    }

    pub fn report_errors(&self, count: u32) {
        self.shared.error_count.fetch_add(count, Ordering::Relaxed);
    }

    /// Sensor temperature in degrees Celsius
    pub fn set_temperature(&self, celsius: f32) {
        self.shared.temperature.store(celsius);
    }

    /// Mounting rotation of the sensor relative to the board
    pub fn set_orientation(&mut self, rotation: Rotation) {
        self.sensor_rotation = rotation;
    }
}
