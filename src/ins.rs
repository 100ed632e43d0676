//! Inertial sensor front end
//!
//! [`InertialSensor`] owns the instance tables and runs on the estimator's
//! thread. Backends feed it through their [`BackendHandle`]s; the estimator
//! calls [`wait_for_sample`](InertialSensor::wait_for_sample) and
//! [`update`](InertialSensor::update) once per loop and then reads the
//! accessors.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, bounded};
use crossbeam::queue::ArrayQueue;
use log::{debug, error, info, warn};
use nalgebra::Vector3;

use crate::accumulator::oversampling_ratio;
use crate::backend::{BackendHandle, InstanceShared, NotchTargets};
use crate::batch::BatchSampler;
use crate::calibration::{AccelCalibrator, Calibration, CalibrationResult, calculate_trim};
use crate::clock::{Clock, MonotonicClock};
use crate::error::{InsError, InsResult};
use crate::filter::FilterStack;
use crate::health::{Candidate, HealthInputs, HealthState, HealthTracker, consistent, first_usable};
use crate::math::{DEG_TO_RAD, Vector3Ext, us_to_s};
use crate::params::{self, MemoryParameterStore, ParameterStore};
use crate::registry::{InstanceSlot, InstanceTable};
use crate::session::{AccelSession, GyroSession, GyroSessionState};
use crate::sink::{DiagnosticRecord, DiagnosticSink, ImuRecord, NotchRecord, VibrationRecord};
use crate::types::{InsSettings, MAX_INSTANCES, NUM_NOTCH_SETS, SensorKind};
use crate::vibration::{PeakHold, VibrationMonitor};

/// Longest a single wait for samples may block
const MAX_WAIT: Duration = Duration::from_secs(1);

/// Inertial sensor front end
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use nalgebra::Vector3;
/// use fusion_ins::{Clock, InertialSensor, InsSettings, ManualClock, MemoryParameterStore, SensorKind};
///
/// let clock = Arc::new(ManualClock::new(1));
/// let mut ins = InertialSensor::new(
///     InsSettings::default(),
///     clock.clone(),
///     Box::new(MemoryParameterStore::new()),
/// );
/// let mut gyro = ins.register(SensorKind::Gyro, 400.0, 0x11).unwrap();
/// let mut accel = ins.register(SensorKind::Accel, 400.0, 0x12).unwrap();
///
/// clock.advance_us(2500);
/// gyro.ingest(Vector3::new(0.0, 0.0, 0.1), clock.now_us());
/// accel.ingest(Vector3::new(0.0, 0.0, 9.8), clock.now_us());
///
/// ins.wait_for_sample().unwrap();
/// ins.update();
/// assert!(ins.gyro_health(0) && ins.accel_health(0));
/// assert!((ins.gyro(0).z - 0.1).abs() < 1e-4);
/// ```
pub struct InertialSensor {
    settings: InsSettings,
    clock: Arc<dyn Clock>,
    params: Box<dyn ParameterStore>,
    accels: InstanceTable,
    gyros: InstanceTable,
    targets: Arc<NotchTargets>,
    doorbell_tx: Sender<()>,
    doorbell_rx: Receiver<()>,
    batch: BatchSampler,
    created_us: u64,
    last_update_us: Option<u64>,
    delta_time: f32,
    first_usable_accel: usize,
    first_usable_gyro: usize,
    accel_primary_ok: bool,
    gyro_primary_ok: bool,
    accels_consistent: bool,
    gyros_consistent: bool,
    peak_hold: PeakHold,
    missed_deadlines: u32,
    accel_session: Option<AccelSession>,
    accel_status: CalibrationResult,
    accel_requires_reboot: bool,
    gyro_session: Option<GyroSession>,
    gyro_status: CalibrationResult,
    new_trim: Option<Vector3<f32>>,
}

impl InertialSensor {
    /// Create a front end with explicit settings
    ///
    /// # Arguments
    /// * `settings` - Front end configuration
    /// * `clock` - Time source shared with the backends' timestamps
    /// * `params` - Store holding persisted calibrations
    pub fn new(settings: InsSettings, clock: Arc<dyn Clock>, params: Box<dyn ParameterStore>) -> Self {
        let (doorbell_tx, doorbell_rx) = bounded(1);
        let created_us = clock.now_us();
        Self {
            settings,
            targets: Arc::new(NotchTargets::new(settings.notches.map(|n| n.center_hz))),
            batch: BatchSampler::new(settings.batch),
            clock,
            params,
            accels: InstanceTable::new(SensorKind::Accel),
            gyros: InstanceTable::new(SensorKind::Gyro),
            doorbell_tx,
            doorbell_rx,
            created_us,
            last_update_us: None,
            delta_time: settings.loop_delta_t(),
            first_usable_accel: 0,
            first_usable_gyro: 0,
            accel_primary_ok: false,
            gyro_primary_ok: false,
            accels_consistent: true,
            gyros_consistent: true,
            peak_hold: PeakHold::default(),
            missed_deadlines: 0,
            accel_session: None,
            accel_status: CalibrationResult::Idle,
            accel_requires_reboot: false,
            gyro_session: None,
            gyro_status: CalibrationResult::Idle,
            new_trim: None,
        }
    }

    /// Create a front end configured from a parameter store
    ///
    /// Parameters missing from the store are registered with their values
    /// from `base`.
    pub fn from_parameters(base: InsSettings, clock: Arc<dyn Clock>, mut params: Box<dyn ParameterStore>) -> Self {
        let settings = params::load_settings(params.as_mut(), base);
        Self::new(settings, clock, params)
    }

    /// Create a front end on the monotonic clock with an in-memory parameter store
    pub fn with_settings(settings: InsSettings) -> Self {
        Self::new(
            settings,
            Arc::new(MonotonicClock::new()),
            Box::new(MemoryParameterStore::new()),
        )
    }

    pub fn settings(&self) -> &InsSettings {
        &self.settings
    }

    /// Parameter store holding persisted calibrations and trim
    pub fn parameters(&self) -> &dyn ParameterStore {
        self.params.as_ref()
    }

    fn table(&self, kind: SensorKind) -> &InstanceTable {
        match kind {
            SensorKind::Accel => &self.accels,
            SensorKind::Gyro => &self.gyros,
        }
    }

    fn table_mut(&mut self, kind: SensorKind) -> &mut InstanceTable {
        match kind {
            SensorKind::Accel => &mut self.accels,
            SensorKind::Gyro => &mut self.gyros,
        }
    }

    /// Register a backend
    ///
    /// The persisted calibration of `stable_id` is loaded when one exists,
    /// whatever slot it was saved in.
    ///
    /// # Arguments
    /// * `kind` - Sensor kind
    /// * `raw_rate_hz` - Rate at which the backend will call `ingest`
    /// * `stable_id` - Identity of the physical sensor, non-zero
    ///
    /// # Errors
    /// [`InsError::CapacityExceeded`] when [`MAX_INSTANCES`] of `kind` are
    /// already registered
    pub fn register(&mut self, kind: SensorKind, raw_rate_hz: f32, stable_id: u32) -> InsResult<BackendHandle> {
        if !(raw_rate_hz.is_finite() && raw_rate_hz > 0.0) {
            return Err(InsError::InvalidSampleRate(raw_rate_hz));
        }
        if self.table(kind).is_full() {
            let err = InsError::CapacityExceeded {
                kind,
                max: MAX_INSTANCES,
            };
            error!("cannot register {} id {:#x}: {}", kind, stable_id, err);
            return Err(err);
        }

        let settings = self.settings;
        let index = self.table(kind).len();
        let ratio = oversampling_ratio(raw_rate_hz, settings.loop_rate_hz);
        let mut shared = InstanceShared::new(kind, index, stable_id, raw_rate_hz, ratio);
        let sample_rate_hz = shared.sample_rate_hz();

        if self.batch.captures(kind) {
            if settings.batch.captures_raw() {
                shared.batch_raw = Some(self.batch.add_stream(index as u8, kind, false, raw_rate_hz));
            }
            if settings.batch.captures_filtered() {
                shared.batch_filtered = Some(self.batch.add_stream(index as u8, kind, true, sample_rate_hz));
            }
        }
        if kind == SensorKind::Gyro && settings.gyro_window_size > 0 {
            shared.gyro_window = Some(ArrayQueue::new(usize::from(settings.gyro_window_size)));
        }

        let stored = params::load_calibration(self.params.as_ref(), kind, stable_id);
        let persist_slot = match stored {
            Some((slot, calibration)) => {
                shared.calibration.store(calibration);
                slot
            }
            None => self.free_persist_slot(kind, index),
        };

        let shared = Arc::new(shared);
        let health = HealthTracker::new(
            kind,
            index,
            raw_rate_hz,
            settings.stall_timeout_periods,
            settings.error_count_threshold,
        );
        let mut slot = InstanceSlot::new(Arc::clone(&shared), health, stored.is_some(), persist_slot);
        if kind == SensorKind::Accel {
            slot.position_offset = params::load_position_offset(self.params.as_ref(), persist_slot);
        }
        self.table_mut(kind).push(slot)?;

        info!(
            "registered {} {} id {:#x}: {} Hz raw, ratio {}, {}",
            kind,
            index,
            stable_id,
            raw_rate_hz,
            ratio,
            if stored.is_some() { "calibrated" } else { "not calibrated" }
        );

        let filters = FilterStack::new(kind, sample_rate_hz, &settings);
        let vibration = (kind == SensorKind::Accel).then(|| VibrationMonitor::new(settings.accel_clip_mss));
        Ok(BackendHandle::new(
            shared,
            Arc::clone(&self.targets),
            self.doorbell_tx.clone(),
            filters,
            vibration,
            settings.board_orientation,
        ))
    }

    /// Register an accelerometer backend
    pub fn register_accel(&mut self, raw_rate_hz: f32, stable_id: u32) -> InsResult<BackendHandle> {
        self.register(SensorKind::Accel, raw_rate_hz, stable_id)
    }

    /// Register a gyroscope backend
    pub fn register_gyro(&mut self, raw_rate_hz: f32, stable_id: u32) -> InsResult<BackendHandle> {
        self.register(SensorKind::Gyro, raw_rate_hz, stable_id)
    }

    /// Persistence slot for a sensor without a stored calibration
    ///
    /// Prefers a slot no registered instance claims and no other sensor has
    /// been saved in.
    fn free_persist_slot(&self, kind: SensorKind, index: usize) -> usize {
        let claimed: Vec<usize> = self.table(kind).claimed_persist_slots().collect();
        let unclaimed = |slot: &usize| !claimed.contains(slot);
        (0..MAX_INSTANCES)
            .filter(unclaimed)
            .find(|&slot| params::stored_id(self.params.as_ref(), kind, slot).is_none())
            .or_else(|| (0..MAX_INSTANCES).find(unclaimed))
            .unwrap_or(index)
    }

    /// Block until a complete sample set is available
    ///
    /// A set is complete when every used and healthy instance has an
    /// unconsumed sample, or when any instance has one while none is
    /// healthy. Gives up after `wait_timeout_periods` loop periods of real
    /// time, and never waits longer than one second.
    ///
    /// # Errors
    /// [`InsError::MissedDeadline`] on timeout; the previous sample set stays
    /// in place
    pub fn wait_for_sample(&mut self) -> InsResult<()> {
        let periods = self.settings.wait_timeout_periods.max(0.0);
        let timeout = Duration::try_from_secs_f32(periods * self.settings.loop_delta_t())
            .unwrap_or(MAX_WAIT)
            .min(MAX_WAIT);
        let deadline = Instant::now().checked_add(timeout).unwrap_or_else(Instant::now);

        loop {
            if self.sample_set_ready() {
                return Ok(());
            }
            if self.doorbell_rx.recv_deadline(deadline).is_err() {
                // A sample may have landed right at the deadline
                if self.sample_set_ready() {
                    return Ok(());
                }
                self.missed_deadlines = self.missed_deadlines.saturating_add(1);
                let timeout_us = timeout.as_micros() as u64;
                debug!("no complete sample set within {} us", timeout_us);
                return Err(InsError::MissedDeadline { timeout_us });
            }
        }
    }

    fn sample_set_ready(&self) -> bool {
        let slots = || self.accels.iter().chain(self.gyros.iter());
        let mut waited_on = false;
        for slot in slots().filter(|s| s.state.healthy && self.settings.uses(s.shared.index)) {
            waited_on = true;
            if !slot.has_pending() {
                return false;
            }
        }
        waited_on || slots().any(InstanceSlot::has_pending)
    }

    /// Consume published samples and refresh every derived output
    ///
    /// Instances without new samples keep their previous values and report
    /// no delta.
    pub fn update(&mut self) {
        let now_us = self.clock.now_us();
        self.delta_time = match self.last_update_us {
            Some(previous) => us_to_s(now_us.saturating_sub(previous)).min(self.settings.delta_t_max()),
            None => self.settings.loop_delta_t(),
        };
        self.last_update_us = Some(now_us);

        let accel_session = &mut self.accel_session;
        for slot in self.accels.iter_mut() {
            let index = slot.shared.index;
            slot.drain(|sample| {
                if let Some(session) = accel_session.as_mut() {
                    session.feed(index, sample.raw);
                }
            });
        }
        let gyro_session = &mut self.gyro_session;
        for slot in self.gyros.iter_mut() {
            let index = slot.shared.index;
            slot.drain(|sample| {
                if let Some(session) = gyro_session.as_mut() {
                    session.feed(index, sample.raw);
                }
            });
        }

        self.evaluate_health(now_us);
        self.select_primaries();
        self.check_consistency();

        if let Some(primary) = self.accels.get(self.first_usable_accel) {
            self.peak_hold.update(primary.state.value.x, now_us / 1000);
        }
        self.conclude_gyro_calibration();
    }

    fn evaluate_health(&mut self, now_us: u64) {
        let grace_us = u64::from(self.settings.startup_grace_ms) * 1000;
        let past_grace = now_us.saturating_sub(self.created_us) >= grace_us;
        for table in [&mut self.accels, &mut self.gyros] {
            for slot in table.iter_mut() {
                let inputs = HealthInputs {
                    now_us,
                    last_sample_us: slot.last_sample_us(),
                    error_count: slot.shared.error_count.load(Ordering::Relaxed),
                    past_grace,
                    killed: slot.state.killed,
                };
                slot.state.healthy = slot.state.health.evaluate(inputs) == HealthState::Healthy;
            }
        }
    }

    fn candidates(&self, kind: SensorKind) -> Vec<Candidate> {
        self.table(kind)
            .iter()
            .map(|slot| Candidate {
                used: self.settings.uses(slot.shared.index),
                healthy: slot.state.healthy,
                calibrated: slot.state.calibrated_ok,
            })
            .collect()
    }

    fn select_primaries(&mut self) {
        let (accel, accel_ok) = first_usable(&self.candidates(SensorKind::Accel));
        let (gyro, gyro_ok) = first_usable(&self.candidates(SensorKind::Gyro));
        if accel != self.first_usable_accel {
            info!("primary accel {} -> {}", self.first_usable_accel, accel);
        }
        if gyro != self.first_usable_gyro {
            info!("primary gyro {} -> {}", self.first_usable_gyro, gyro);
        }
        self.first_usable_accel = accel;
        self.first_usable_gyro = gyro;
        self.accel_primary_ok = accel_ok;
        self.gyro_primary_ok = gyro_ok;
    }

    fn healthy_readings(&self, kind: SensorKind) -> [Option<Vector3<f32>>; MAX_INSTANCES] {
        let table = self.table(kind);
        core::array::from_fn(|i| {
            table
                .get(i)
                .filter(|slot| slot.state.healthy)
                .map(|slot| slot.state.value)
        })
    }

    fn check_consistency(&mut self) {
        let accels = self.accels_consistent(self.settings.accel_consistency_mss);
        let gyros = self.gyros_consistent(self.settings.gyro_consistency_deg_s);
        if accels != self.accels_consistent {
            if accels {
                info!("accels consistent");
            } else {
                warn!("accels inconsistent");
            }
        }
        if gyros != self.gyros_consistent {
            if gyros {
                info!("gyros consistent");
            } else {
                warn!("gyros inconsistent");
            }
        }
        self.accels_consistent = accels;
        self.gyros_consistent = gyros;
    }

    // Estimator accessors

    /// Filtered, calibrated acceleration of instance `i` in m/s/s, zero for unknown instances
    pub fn accel(&self, i: usize) -> Vector3<f32> {
        self.accels.get(i).map_or_else(Vector3::zeros, |slot| slot.state.value)
    }

    pub fn accel_primary(&self) -> Vector3<f32> {
        self.accel(self.first_usable_accel)
    }

    /// Filtered, calibrated angular rate of instance `i` in rad/s, zero for unknown instances
    pub fn gyro(&self, i: usize) -> Vector3<f32> {
        self.gyros.get(i).map_or_else(Vector3::zeros, |slot| slot.state.value)
    }

    pub fn gyro_primary(&self) -> Vector3<f32> {
        self.gyro(self.first_usable_gyro)
    }

    /// Delta angle in rad and the interval it covers, `None` when the last
    /// update consumed no new gyro sample
    pub fn delta_angle(&self, i: usize) -> Option<(Vector3<f32>, f32)> {
        self.gyros
            .get(i)
            .filter(|slot| slot.state.delta_valid)
            .map(|slot| (slot.state.delta, slot.state.delta_dt))
    }

    /// Delta velocity in m/s and the interval it covers, `None` when the last
    /// update consumed no new accel sample
    pub fn delta_velocity(&self, i: usize) -> Option<(Vector3<f32>, f32)> {
        self.accels
            .get(i)
            .filter(|slot| slot.state.delta_valid)
            .map(|slot| (slot.state.delta, slot.state.delta_dt))
    }

    /// Time between the last two updates, clamped to the configured maximum
    pub fn delta_time(&self) -> f32 {
        self.delta_time
    }

    pub fn loop_delta_t(&self) -> f32 {
        self.settings.loop_delta_t()
    }

    pub fn loop_rate_hz(&self) -> u16 {
        self.settings.loop_rate_hz
    }

    pub fn accel_health(&self, i: usize) -> bool {
        self.accels.get(i).is_some_and(|slot| slot.state.healthy)
    }

    pub fn gyro_health(&self, i: usize) -> bool {
        self.gyros.get(i).is_some_and(|slot| slot.state.healthy)
    }

    /// At least one accel registered and every one healthy
    pub fn accel_health_all(&self) -> bool {
        self.accels.len() > 0 && self.accels.iter().all(|slot| slot.state.healthy)
    }

    /// At least one gyro registered and every one healthy
    pub fn gyro_health_all(&self) -> bool {
        self.gyros.len() > 0 && self.gyros.iter().all(|slot| slot.state.healthy)
    }

    /// Both first usable instances are used, healthy and calibrated
    pub fn healthy(&self) -> bool {
        self.accel_primary_ok && self.gyro_primary_ok
    }

    pub fn accel_calibrated_ok(&self, i: usize) -> bool {
        self.accels.get(i).is_some_and(|slot| slot.state.calibrated_ok)
    }

    pub fn gyro_calibrated_ok(&self, i: usize) -> bool {
        self.gyros.get(i).is_some_and(|slot| slot.state.calibrated_ok)
    }

    pub fn accel_calibrated_ok_all(&self) -> bool {
        self.accels.len() > 0 && self.accels.iter().all(|slot| slot.state.calibrated_ok)
    }

    pub fn gyro_calibrated_ok_all(&self) -> bool {
        self.gyros.len() > 0 && self.gyros.iter().all(|slot| slot.state.calibrated_ok)
    }

    pub fn first_usable_accel(&self) -> usize {
        self.first_usable_accel
    }

    pub fn first_usable_gyro(&self) -> usize {
        self.first_usable_gyro
    }

    /// Vibration level per axis in m/s/s
    pub fn vibration_levels(&self, i: usize) -> Vector3<f32> {
        self.accels
            .get(i)
            .map_or_else(Vector3::zeros, |slot| slot.shared.vibration.load())
    }

    /// Clip events since the previous call for the same instance
    pub fn take_accel_clip_count(&mut self, i: usize) -> u32 {
        let Some(slot) = self.accels.get_mut(i) else {
            return 0;
        };
        let total = slot.shared.clip_count.load(Ordering::Relaxed);
        let count = total.wrapping_sub(slot.state.clips_taken);
        slot.state.clips_taken = total;
        count
    }

    /// Clip events since start-up
    pub fn accel_clip_count(&self, i: usize) -> u32 {
        self.accels
            .get(i)
            .map_or(0, |slot| slot.shared.clip_count.load(Ordering::Relaxed))
    }

    /// Most negative X acceleration of the primary accel within the hold period
    pub fn accel_peak_hold_neg_x(&self) -> Option<f32> {
        self.peak_hold.peak(self.clock.now_ms())
    }

    /// Vibration on every axis of the primary accel below the still threshold
    pub fn is_still(&self) -> bool {
        self.accels.get(self.first_usable_accel).is_some_and(|slot| {
            let levels = slot.shared.vibration.load();
            levels.iter().all(|v| *v < self.settings.still_threshold)
        })
    }

    pub fn accel_offsets(&self, i: usize) -> Vector3<f32> {
        self.calibration(SensorKind::Accel, i).offset
    }

    pub fn accel_scale(&self, i: usize) -> Vector3<f32> {
        self.calibration(SensorKind::Accel, i).scale
    }

    pub fn gyro_offsets(&self, i: usize) -> Vector3<f32> {
        self.calibration(SensorKind::Gyro, i).offset
    }

    /// Calibration currently applied by the producer of an instance
    pub fn calibration(&self, kind: SensorKind, i: usize) -> Calibration {
        self.table(kind)
            .get(i)
            .map_or_else(Calibration::identity, |slot| slot.shared.calibration.load())
    }

    pub fn accel_count(&self) -> usize {
        self.accels.len()
    }

    pub fn gyro_count(&self) -> usize {
        self.gyros.len()
    }

    pub fn raw_rate_hz(&self, kind: SensorKind, i: usize) -> Option<f32> {
        self.table(kind).get(i).map(|slot| slot.shared.raw_rate_hz)
    }

    /// Last temperature reported by the backend, degrees Celsius
    pub fn temperature(&self, kind: SensorKind, i: usize) -> Option<f32> {
        self.table(kind).get(i).map(|slot| slot.shared.temperature.load())
    }

    /// Position of accel `i` relative to the center of gravity, metres in the body frame
    ///
    /// Zero for an unregistered instance or one without a configured offset.
    pub fn imu_pos_offset(&self, i: usize) -> Vector3<f32> {
        self.accels.get(i).map_or_else(Vector3::zeros, |slot| slot.position_offset)
    }

    /// Position offset of the first usable accel
    pub fn imu_pos_offset_primary(&self) -> Vector3<f32> {
        self.imu_pos_offset(self.first_usable_accel)
    }

    /// Set and persist the position offset of accel `i`
    pub fn set_imu_pos_offset(&mut self, i: usize, offset: Vector3<f32>) -> InsResult<()> {
        let slot = self.accels.require_mut(i)?;
        let prefix = params::names::POSITION[slot.persist_slot];
        if !offset.all_finite() {
            return Err(InsError::Parameter {
                name: prefix.to_string(),
                reason: "position offset must be finite".to_string(),
            });
        }
        params::save_position_offset(self.params.as_mut(), slot.persist_slot, offset)?;
        slot.position_offset = offset;
        Ok(())
    }

    /// Reduced samples shed because the consumer fell behind
    ///
    /// Their delta angle or velocity is carried into the next sample, so
    /// only the readings are lost.
    pub fn overruns(&self, kind: SensorKind, i: usize) -> u32 {
        self.table(kind)
            .get(i)
            .map_or(0, |slot| slot.shared.overruns.load(Ordering::Relaxed))
    }

    pub fn missed_deadlines(&self) -> u32 {
        self.missed_deadlines
    }

    /// Clock time of the last update, microseconds
    pub fn last_update_us(&self) -> Option<u64> {
        self.last_update_us
    }

    /// Accels agreed within `accel_consistency_mss` at the last update
    pub fn accels_consistent_flag(&self) -> bool {
        self.accels_consistent
    }

    /// Gyros agreed within `gyro_consistency_deg_s` at the last update
    pub fn gyros_consistent_flag(&self) -> bool {
        self.gyros_consistent
    }

    pub fn consistent(&self) -> bool {
        self.accels_consistent && self.gyros_consistent
    }

    /// Whether healthy accels currently agree within `threshold_mss`
    pub fn accels_consistent(&self, threshold_mss: f32) -> bool {
        consistent(&self.healthy_readings(SensorKind::Accel), threshold_mss)
    }

    /// Whether healthy gyros currently agree within `threshold_deg_s`
    pub fn gyros_consistent(&self, threshold_deg_s: f32) -> bool {
        consistent(&self.healthy_readings(SensorKind::Gyro), threshold_deg_s * DEG_TO_RAD)
    }

    /// Force the accel and gyro at index `i` unhealthy, or release them
    pub fn kill_imu(&mut self, i: usize, kill: bool) -> InsResult<()> {
        let mut found = false;
        for table in [&mut self.accels, &mut self.gyros] {
            if let Some(slot) = table.get_mut(i) {
                slot.state.killed = kill;
                found = true;
            }
        }
        if !found {
            return Err(InsError::NoSuchInstance {
                kind: SensorKind::Gyro,
                instance: i,
            });
        }
        warn!("imu {} {}", i, if kill { "killed" } else { "released" });
        Ok(())
    }

    /// Drain the spectral capture window of gyro `i`
    pub fn take_gyro_window(&self, i: usize) -> Vec<Vector3<f32>> {
        self.gyros
            .get(i)
            .and_then(|slot| slot.shared.gyro_window.as_ref())
            .map(|window| std::iter::from_fn(|| window.pop()).collect())
            .unwrap_or_default()
    }

    // Harmonic notch tracking

    /// Feed the tracked reference (throttle or rotor speed) to every notch set
    pub fn set_notch_reference(&mut self, value: f32) {
        for (set, notch) in self.settings.notches.iter().enumerate() {
            if notch.enabled {
                self.targets.store(set, notch.frequency_for(value));
            }
        }
    }

    /// Target fundamental of a notch set, `None` when the set is disabled
    pub fn notch_frequency(&self, set: usize) -> Option<f32> {
        let notch = self.settings.notches.get(set)?;
        notch.enabled.then(|| self.targets.load()[set])
    }

    // Calibration control surface

    /// Start an accelerometer calibration
    ///
    /// # Arguments
    /// * `instance_mask` - Accels to calibrate, bit per index; zero selects all
    pub fn start_accel_calibration(&mut self, instance_mask: u8) -> InsResult<()> {
        if self.accel_session.is_some() {
            return Err(InsError::CalibrationInProgress);
        }
        let count = self.accels.len();
        let mask = if instance_mask == 0 {
            ((1u16 << count) - 1) as u8
        } else {
            instance_mask
        };
        if let Some(missing) = (0..8).find(|&i| mask & (1 << i) != 0 && i >= count) {
            return Err(InsError::NoSuchInstance {
                kind: SensorKind::Accel,
                instance: missing,
            });
        }
        if mask == 0 {
            return Err(InsError::NoSuchInstance {
                kind: SensorKind::Accel,
                instance: 0,
            });
        }

        self.accel_session = Some(AccelSession::new(mask, self.settings.calibration.pose_samples));
        self.accel_status = CalibrationResult::Running;
        info!("accel calibration started, mask {:#05b}", mask);
        Ok(())
    }

    /// Average the next samples of every participating accel as one pose
    ///
    /// The vehicle must be held still in the new attitude until
    /// [`accel_pose_pending`](Self::accel_pose_pending) clears.
    pub fn accept_accel_pose(&mut self) -> InsResult<()> {
        let session = self.accel_session.as_mut().ok_or(InsError::NoCalibrationSession)?;
        if !session.begin_pose() {
            return Err(InsError::CalibrationInProgress);
        }
        info!("collecting accel calibration pose {}", session.pose_count() + 1);
        Ok(())
    }

    /// A pose is still being averaged
    pub fn accel_pose_pending(&self) -> bool {
        self.accel_session.as_ref().is_some_and(AccelSession::is_collecting)
    }

    /// Poses captured by the running accel calibration
    pub fn accel_pose_count(&self) -> usize {
        self.accel_session.as_ref().map_or(0, AccelSession::pose_count)
    }

    /// Fit, validate and apply the running accel calibration
    ///
    /// All participating instances are fitted and validated before any new
    /// calibration is applied; on failure every previous calibration stays.
    pub fn finish_accel_calibration(&mut self) -> InsResult<()> {
        let session = self.accel_session.as_ref().ok_or(InsError::NoCalibrationSession)?;
        if session.is_collecting() {
            return Err(InsError::CalibrationInProgress);
        }
        let Some(session) = self.accel_session.take() else {
            return Err(InsError::NoCalibrationSession);
        };

        let result = self.apply_accel_session(&session);
        match &result {
            Ok(()) => {
                self.accel_status = CalibrationResult::Success;
                info!("accel calibration complete");
            }
            Err(err) => {
                self.accel_status = CalibrationResult::from(err);
                warn!("accel calibration failed: {}", err);
            }
        }
        result
    }

    fn apply_accel_session(&mut self, session: &AccelSession) -> InsResult<()> {
        let calibrator = AccelCalibrator::new(self.settings.calibration);
        let mut accepted: [Option<Calibration>; MAX_INSTANCES] = [None; MAX_INSTANCES];
        for index in session.instances() {
            let slot = self.accels.require(index)?;
            let previous = slot
                .state
                .calibrated_ok
                .then(|| slot.shared.calibration.load());
            let fit = calibrator.fit(session.poses(index))?;
            calibrator.validate(&fit, previous.as_ref())?;
            info!(
                "accel {} fit in {} iterations: offset {:?} scale {:?}",
                index,
                fit.iterations,
                fit.calibration.offset.as_slice(),
                fit.calibration.scale.as_slice()
            );
            accepted[index] = Some(fit.calibration);
        }

        let trim_instance = if session.includes(self.first_usable_accel) {
            Some(self.first_usable_accel)
        } else {
            session.instances().next()
        };
        let level = trim_instance.and_then(|i| Some((session.poses(i).first()?, accepted[i]?)));
        let trim = level.and_then(|(level, calibration)| {
            calculate_trim(calibration.apply(*level), self.settings.calibration.trim_limit_deg)
                .map_err(|err| warn!("first pose not usable for trim: {}", err))
                .ok()
        });

        // Nothing goes live until everything is persisted
        for (index, calibration) in accepted.iter().enumerate() {
            let Some(calibration) = calibration else {
                continue;
            };
            let slot = self.accels.require(index)?;
            params::save_calibration(
                self.params.as_mut(),
                SensorKind::Accel,
                slot.persist_slot,
                slot.shared.stable_id,
                calibration,
            )?;
        }
        if let Some(trim) = trim {
            params::save_trim(self.params.as_mut(), trim)?;
        }

        for (index, calibration) in accepted.iter().enumerate() {
            let Some(calibration) = calibration else {
                continue;
            };
            let slot = self.accels.require_mut(index)?;
            if slot.state.calibrated_ok {
                self.accel_requires_reboot = true;
            }
            slot.shared.calibration.store(*calibration);
            slot.state.calibrated_ok = true;
        }
        if trim.is_some() {
            self.new_trim = trim;
        }
        Ok(())
    }

    /// Discard the running accel calibration
    pub fn abort_accel_calibration(&mut self) -> InsResult<()> {
        self.accel_session.take().ok_or(InsError::NoCalibrationSession)?;
        self.accel_status = CalibrationResult::Aborted;
        info!("accel calibration aborted");
        Ok(())
    }

    pub fn accel_calibration_status(&self) -> CalibrationResult {
        self.accel_status
    }

    /// An accel calibration replaced a calibration that consumers may have cached
    pub fn accel_cal_requires_reboot(&self) -> bool {
        self.accel_requires_reboot
    }

    /// Start a stationary-window calibration of every gyro
    pub fn start_gyro_calibration(&mut self) -> InsResult<()> {
        if self.gyro_session.is_some() {
            return Err(InsError::CalibrationInProgress);
        }
        if self.gyros.len() == 0 {
            return Err(InsError::NoSuchInstance {
                kind: SensorKind::Gyro,
                instance: 0,
            });
        }
        let gyros = &self.gyros;
        let rates = core::array::from_fn(|i| gyros.get(i).map(|slot| slot.shared.sample_rate_hz()));
        self.gyro_session = Some(GyroSession::new(&self.settings.calibration, &rates));
        self.gyro_status = CalibrationResult::Running;
        info!("gyro calibration started");
        Ok(())
    }

    fn conclude_gyro_calibration(&mut self) {
        let Some(state) = self.gyro_session.as_ref().map(GyroSession::state) else {
            return;
        };
        match state {
            GyroSessionState::Running => {}
            GyroSessionState::Failed => {
                self.gyro_session = None;
                self.gyro_status = CalibrationResult::MotionDetected;
                warn!("gyro calibration failed: motion detected");
            }
            GyroSessionState::Complete => {
                let Some(session) = self.gyro_session.take() else {
                    return;
                };
                for (index, bias) in session.biases().iter().enumerate() {
                    let (Some(bias), Some(slot)) = (bias, self.gyros.get_mut(index)) else {
                        continue;
                    };
                    let calibration = Calibration {
                        offset: *bias,
                        scale: Vector3::repeat(1.0),
                    };
                    slot.shared.calibration.store(calibration);
                    slot.state.calibrated_ok = true;
                    info!("gyro {} bias {:?}", index, bias.as_slice());

                    if let Err(err) = params::save_calibration(
                        self.params.as_mut(),
                        SensorKind::Gyro,
                        slot.persist_slot,
                        slot.shared.stable_id,
                        &calibration,
                    ) {
                        error!("failed to save gyro {} calibration: {}", index, err);
                    }
                }
                self.gyro_status = CalibrationResult::Success;
            }
        }
    }

    pub fn gyro_calibration_status(&self) -> CalibrationResult {
        self.gyro_status
    }

    pub fn abort_gyro_calibration(&mut self) -> InsResult<()> {
        self.gyro_session.take().ok_or(InsError::NoCalibrationSession)?;
        self.gyro_status = CalibrationResult::Aborted;
        info!("gyro calibration aborted");
        Ok(())
    }

    /// Compute the level trim from the primary accel's current reading
    ///
    /// The accel must be healthy and calibrated.
    ///
    /// # Returns
    /// Roll and pitch trim in radians, also persisted as `AHRS_TRIM_*`
    pub fn calibrate_trim(&mut self) -> InsResult<Vector3<f32>> {
        let index = self.first_usable_accel;
        let slot = self.accels.require(index)?;
        if !(slot.state.healthy && slot.state.calibrated_ok) {
            return Err(InsError::NotCalibratable {
                kind: SensorKind::Accel,
                instance: index,
            });
        }
        let trim = calculate_trim(slot.state.value, self.settings.calibration.trim_limit_deg)?;
        params::save_trim(self.params.as_mut(), trim)?;
        self.new_trim = Some(trim);
        info!("trim roll {:.2} pitch {:.2} deg", trim.x.to_degrees(), trim.y.to_degrees());
        Ok(trim)
    }

    /// Trim computed since the last call
    pub fn new_trim(&mut self) -> Option<Vector3<f32>> {
        self.new_trim.take()
    }

    // Diagnostics

    /// Write one IMU record per registered instance
    pub fn write_imu(&self, sink: &mut dyn DiagnosticSink) -> InsResult<()> {
        let timestamp_us = self.last_update_us.unwrap_or(0);
        for table in [&self.accels, &self.gyros] {
            for slot in table.iter() {
                sink.write(&DiagnosticRecord::Imu(ImuRecord {
                    timestamp_us,
                    instance: slot.shared.index as u8,
                    kind: slot.shared.kind,
                    value: slot.state.value.into(),
                    healthy: slot.state.healthy,
                    temperature: slot.shared.temperature.load(),
                    overruns: slot.shared.overruns.load(Ordering::Relaxed),
                }))?;
            }
        }
        Ok(())
    }

    /// Write one vibration record per accel
    pub fn write_vibration(&self, sink: &mut dyn DiagnosticSink) -> InsResult<()> {
        let timestamp_us = self.last_update_us.unwrap_or(0);
        for slot in self.accels.iter() {
            sink.write(&DiagnosticRecord::Vibration(VibrationRecord {
                timestamp_us,
                instance: slot.shared.index as u8,
                vibration: slot.shared.vibration.load().into(),
                clip_count: slot.shared.clip_count.load(Ordering::Relaxed),
            }))?;
        }
        Ok(())
    }

    /// Write one record per enabled notch set
    pub fn write_notch(&self, sink: &mut dyn DiagnosticSink) -> InsResult<()> {
        let timestamp_us = self.last_update_us.unwrap_or(0);
        for set in 0..NUM_NOTCH_SETS {
            let Some(center_hz) = self.notch_frequency(set) else {
                continue;
            };
            sink.write(&DiagnosticRecord::Notch(NotchRecord {
                timestamp_us,
                set: set as u8,
                center_hz,
                harmonics: self.settings.notches[set].harmonics,
            }))?;
        }
        Ok(())
    }

    /// Emit the next batch capture record when one is due
    pub fn periodic(&mut self, sink: &mut dyn DiagnosticSink) -> InsResult<bool> {
        self.batch.periodic(self.clock.now_ms(), sink)
    }
}
