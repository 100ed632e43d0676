//! Fixed-size instance table
//!
//! Instances are registered once at start-up and never removed. Each slot
//! pairs the state shared with the producer with the consumer's own view,
//! which only `update()` mutates.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use nalgebra::Vector3;

use crate::backend::{InstanceShared, PublishedSample};
use crate::error::{InsError, InsResult};
use crate::health::HealthTracker;
use crate::types::{MAX_INSTANCES, SensorKind};

/// Consumer-side view of one instance
#[derive(Debug, Clone)]
pub(crate) struct ConsumerState {
    /// Filtered, calibrated reading
    pub value: Vector3<f32>,
    pub delta: Vector3<f32>,
    pub delta_dt: f32,
    /// New samples were consumed by the last update
    pub delta_valid: bool,
    pub health: HealthTracker,
    pub healthy: bool,
    pub calibrated_ok: bool,
    pub killed: bool,
    /// Clip total at the last read-and-reset
    pub clips_taken: u32,
}

/// One registered instance
#[derive(Debug)]
pub(crate) struct InstanceSlot {
    pub shared: Arc<InstanceShared>,
    pub state: ConsumerState,
    /// Parameter slot the calibration is persisted in
    pub persist_slot: usize,
    /// Sensor position relative to the center of gravity, metres
    pub position_offset: Vector3<f32>,
}

impl InstanceSlot {
    pub fn new(shared: Arc<InstanceShared>, health: HealthTracker, calibrated_ok: bool, persist_slot: usize) -> Self {
        Self {
            shared,
            state: ConsumerState {
                value: Vector3::zeros(),
                delta: Vector3::zeros(),
                delta_dt: 0.0,
                delta_valid: false,
                health,
                healthy: false,
                calibrated_ok,
                killed: false,
                clips_taken: 0,
            },
            persist_slot,
            position_offset: Vector3::zeros(),
        }
    }

    /// Consume every published sample
    ///
    /// Deltas of all consumed samples are summed and the latest value kept.
    /// `on_sample` sees every consumed sample in order.
    pub fn drain(&mut self, mut on_sample: impl FnMut(&PublishedSample)) {
        let mut delta = Vector3::zeros();
        let mut delta_dt = 0.0;
        let mut consumed = false;
        while let Some(sample) = self.shared.queue.pop() {
            on_sample(&sample);
            delta += sample.delta;
            delta_dt += sample.delta_dt;
            self.state.value = sample.filtered;
            consumed = true;
        }
        self.state.delta_valid = consumed;
        if consumed {
            self.state.delta = delta;
            self.state.delta_dt = delta_dt;
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.shared.queue.is_empty()
    }

    pub fn last_sample_us(&self) -> u64 {
        self.shared.last_sample_us.load(Ordering::Acquire)
    }
}

/// Instances of one sensor kind
#[derive(Debug)]
pub(crate) struct InstanceTable {
    kind: SensorKind,
    slots: [Option<InstanceSlot>; MAX_INSTANCES],
    len: usize,
}

impl InstanceTable {
    pub fn new(kind: SensorKind) -> Self {
        Self {
            kind,
            slots: core::array::from_fn(|_| None),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_full(&self) -> bool {
        self.len >= MAX_INSTANCES
    }

    /// Append a slot
    ///
    /// # Returns
    /// Its index, or [`InsError::CapacityExceeded`] when the table is full
    pub fn push(&mut self, slot: InstanceSlot) -> InsResult<usize> {
        if self.is_full() {
            return Err(InsError::CapacityExceeded {
                kind: self.kind,
                max: MAX_INSTANCES,
            });
        }
        let index = self.len;
        self.slots[index] = Some(slot);
        self.len += 1;
        Ok(index)
    }

    pub fn get(&self, index: usize) -> Option<&InstanceSlot> {
        self.slots.get(index)?.as_ref()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut InstanceSlot> {
        self.slots.get_mut(index)?.as_mut()
    }

    /// Slot at `index`, or [`InsError::NoSuchInstance`]
    pub fn require(&self, index: usize) -> InsResult<&InstanceSlot> {
        self.get(index).ok_or(InsError::NoSuchInstance {
            kind: self.kind,
            instance: index,
        })
    }

    pub fn require_mut(&mut self, index: usize) -> InsResult<&mut InstanceSlot> {
        let kind = self.kind;
        self.get_mut(index)
            .ok_or(InsError::NoSuchInstance { kind, instance: index })
    }

    pub fn iter(&self) -> impl Iterator<Item = &InstanceSlot> {
        self.slots.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut InstanceSlot> {
        self.slots.iter_mut().flatten()
    }

    /// Persistence slots already claimed by registered instances
    pub fn claimed_persist_slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.iter().map(|slot| slot.persist_slot)
    }
}
