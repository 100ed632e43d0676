//! Parameter store, settings loading and calibration persistence
//!
//! Parameters use the flight-stack naming (`INS_GYRO_FILTER`, `INS_HNTCH_FREQ`,
//! `INS_ACC2OFFS_X`, ...). The storage medium behind a store is not this
//! crate's concern; [`MemoryParameterStore`] keeps everything in a map and
//! round-trips through serde.

use std::collections::BTreeMap;

use log::{info, warn};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::calibration::Calibration;
use crate::error::InsResult;
use crate::math::Vector3Ext;
use crate::rotation::Rotation;
use crate::types::{InsSettings, MAX_INSTANCES, NUM_NOTCH_SETS, NotchTracking, SensorKind};

/// Value held by a parameter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i32),
    Float(f32),
}

impl ParamValue {
    pub fn as_f32(self) -> f32 {
        match self {
            ParamValue::Int(v) => v as f32,
            ParamValue::Float(v) => v,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            ParamValue::Int(v) => v,
            ParamValue::Float(v) => v.round() as i32,
        }
    }
}

/// Named parameter storage
pub trait ParameterStore: Send {
    /// Current value of a parameter, if it exists
    fn get(&self, name: &str) -> Option<ParamValue>;

    /// Set and persist a parameter
    fn set(&mut self, name: &str, value: ParamValue) -> InsResult<()>;

    /// Register a default; an existing value is left untouched
    fn set_default(&mut self, name: &str, value: ParamValue);
}

/// In-memory parameter store
///
/// # Example
/// ```
/// use fusion_ins::{MemoryParameterStore, ParamValue, ParameterStore};
///
/// let mut store = MemoryParameterStore::new();
/// store.set_default("INS_GYRO_FILTER", ParamValue::Float(20.0));
/// store.set("INS_GYRO_FILTER", ParamValue::Float(40.0)).unwrap();
/// store.set_default("INS_GYRO_FILTER", ParamValue::Float(20.0));
/// assert_eq!(store.get("INS_GYRO_FILTER"), Some(ParamValue::Float(40.0)));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryParameterStore {
    values: BTreeMap<String, ParamValue>,
}

impl MemoryParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored parameters
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over all parameters in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, ParamValue)> {
        self.values.iter().map(|(name, value)| (name.as_str(), *value))
    }
}

impl ParameterStore for MemoryParameterStore {
    fn get(&self, name: &str) -> Option<ParamValue> {
        self.values.get(name).copied()
    }

    fn set(&mut self, name: &str, value: ParamValue) -> InsResult<()> {
        self.values.insert(name.to_string(), value);
        Ok(())
    }

    fn set_default(&mut self, name: &str, value: ParamValue) {
        self.values.entry(name.to_string()).or_insert(value);
    }
}

/// Parameter names
pub mod names {
    pub const LOOP_RATE: &str = "SCHED_LOOP_RATE";
    pub const BOARD_ORIENTATION: &str = "AHRS_ORIENTATION";
    pub const GYRO_FILTER: &str = "INS_GYRO_FILTER";
    pub const ACCEL_FILTER: &str = "INS_ACCEL_FILTER";
    pub const STILL_THRESH: &str = "INS_STILL_THRESH";
    pub const USE: [&str; super::MAX_INSTANCES] = ["INS_USE", "INS_USE2", "INS_USE3"];

    pub const NOTCH_PREFIX: [&str; super::NUM_NOTCH_SETS] = ["INS_HNTCH", "INS_HNTC2"];
    pub const NOTCH_ACCEL: &str = "INS_HNTCH_ACCEL";

    pub const LOG_BAT_MASK: &str = "INS_LOG_BAT_MASK";
    pub const LOG_BAT_CNT: &str = "INS_LOG_BAT_CNT";
    pub const LOG_BAT_LGCT: &str = "INS_LOG_BAT_LGCT";
    pub const LOG_BAT_LGIN: &str = "INS_LOG_BAT_LGIN";
    pub const LOG_BAT_OPT: &str = "INS_LOG_BAT_OPT";

    pub const ACCEL_ID: [&str; super::MAX_INSTANCES] = ["INS_ACC_ID", "INS_ACC2_ID", "INS_ACC3_ID"];
    pub const GYRO_ID: [&str; super::MAX_INSTANCES] = ["INS_GYR_ID", "INS_GYR2_ID", "INS_GYR3_ID"];
    pub const ACCEL_OFFSET: [&str; super::MAX_INSTANCES] =
        ["INS_ACCOFFS", "INS_ACC2OFFS", "INS_ACC3OFFS"];
    pub const ACCEL_SCALE: [&str; super::MAX_INSTANCES] =
        ["INS_ACCSCAL", "INS_ACC2SCAL", "INS_ACC3SCAL"];
    pub const GYRO_OFFSET: [&str; super::MAX_INSTANCES] =
        ["INS_GYROFFS", "INS_GYR2OFFS", "INS_GYR3OFFS"];

    pub const POSITION: [&str; super::MAX_INSTANCES] = ["INS_POS1", "INS_POS2", "INS_POS3"];

    pub const TRIM: [&str; 3] = ["AHRS_TRIM_X", "AHRS_TRIM_Y", "AHRS_TRIM_Z"];

    /// Parameter name for one field of a notch set, e.g. `INS_HNTC2_FREQ`
    pub fn notch(set: usize, field: &str) -> String {
        format!("{}_{}", NOTCH_PREFIX[set], field)
    }
}

const OPT_POST_FILTER: i32 = 1 << 0;
const OPT_PRE_AND_POST_FILTER: i32 = 1 << 1;

fn read_f32(store: &mut dyn ParameterStore, name: &str, default: f32) -> f32 {
    store.set_default(name, ParamValue::Float(default));
    store.get(name).map_or(default, ParamValue::as_f32)
}

fn read_i32(store: &mut dyn ParameterStore, name: &str, default: i32) -> i32 {
    store.set_default(name, ParamValue::Int(default));
    store.get(name).map_or(default, ParamValue::as_i32)
}

fn read_cutoff(store: &mut dyn ParameterStore, name: &str, default: f32) -> f32 {
    let value = read_f32(store, name, default);
    if value.is_finite() && value >= 0.0 {
        value
    } else {
        warn!("{} = {} is not a valid cutoff, using {}", name, value, default);
        default
    }
}

/// Build settings from a parameter store
///
/// Every parameter read is first registered with its value from `base` as
/// the default, so a fresh store ends up fully populated.
///
/// # Arguments
/// * `store` - Parameter store to read from
/// * `base` - Settings providing defaults and every value without a parameter
///
/// # Example
/// ```
/// use fusion_ins::{InsSettings, MemoryParameterStore, ParamValue, ParameterStore, load_settings};
///
/// let mut store = MemoryParameterStore::new();
/// store.set("INS_GYRO_FILTER", ParamValue::Float(80.0)).unwrap();
///
/// let settings = load_settings(&mut store, InsSettings::default());
/// assert_eq!(settings.gyro_filter_hz, 80.0);
/// assert!(store.get("INS_ACCEL_FILTER").is_some());
/// ```
pub fn load_settings(store: &mut dyn ParameterStore, base: InsSettings) -> InsSettings {
    let mut settings = base;

    let loop_rate = read_i32(store, names::LOOP_RATE, i32::from(base.loop_rate_hz));
    settings.loop_rate_hz = match u16::try_from(loop_rate) {
        Ok(rate) if rate > 0 => rate,
        _ => {
            warn!("{} = {} is out of range, using {}", names::LOOP_RATE, loop_rate, base.loop_rate_hz);
            base.loop_rate_hz
        }
    };

    let orientation = read_i32(store, names::BOARD_ORIENTATION, base.board_orientation.to_param());
    settings.board_orientation = Rotation::from_param(orientation).unwrap_or_else(|| {
        warn!("unknown board orientation {}, using none", orientation);
        Rotation::None
    });

    settings.gyro_filter_hz = read_cutoff(store, names::GYRO_FILTER, base.gyro_filter_hz);
    settings.accel_filter_hz = read_cutoff(store, names::ACCEL_FILTER, base.accel_filter_hz);
    settings.still_threshold = read_f32(store, names::STILL_THRESH, base.still_threshold);

    let mut use_mask = 0u8;
    for (i, name) in names::USE.iter().enumerate() {
        if read_i32(store, name, i32::from(base.uses(i))) != 0 {
            use_mask |= 1 << i;
        }
    }
    settings.use_mask = use_mask;

    for set in 0..NUM_NOTCH_SETS {
        let notch = &mut settings.notches[set];
        let defaults = base.notches[set];
        notch.enabled = read_i32(store, &names::notch(set, "ENABLE"), i32::from(defaults.enabled)) != 0;
        notch.center_hz = read_f32(store, &names::notch(set, "FREQ"), defaults.center_hz);
        notch.bandwidth_hz = read_f32(store, &names::notch(set, "BW"), defaults.bandwidth_hz);
        notch.attenuation_db = read_f32(store, &names::notch(set, "ATT"), defaults.attenuation_db);
        notch.harmonics =
            read_i32(store, &names::notch(set, "HMNCS"), i32::from(defaults.harmonics)) as u8;
        notch.reference = read_f32(store, &names::notch(set, "REF"), defaults.reference);
        notch.min_ratio = read_f32(store, &names::notch(set, "FM_RAT"), defaults.min_ratio);
        notch.tracking = NotchTracking::from_param(read_i32(
            store,
            &names::notch(set, "MODE"),
            defaults.tracking.to_param(),
        ));
    }
    settings.notch_accel = read_i32(store, names::NOTCH_ACCEL, i32::from(base.notch_accel)) != 0;

    let batch = &mut settings.batch;
    batch.sensor_mask = read_i32(store, names::LOG_BAT_MASK, i32::from(base.batch.sensor_mask)) as u8;
    batch.required_count =
        read_i32(store, names::LOG_BAT_CNT, i32::from(base.batch.required_count)).clamp(0, 16384) as u16;
    batch.samples_per_msg =
        read_i32(store, names::LOG_BAT_LGCT, i32::from(base.batch.samples_per_msg)).clamp(1, 1024) as u16;
    batch.push_interval_ms =
        read_i32(store, names::LOG_BAT_LGIN, i32::from(base.batch.push_interval_ms)).clamp(0, 1000) as u16;
    let default_opt = if base.batch.pre_and_post_filter {
        OPT_PRE_AND_POST_FILTER
    } else if base.batch.post_filter {
        OPT_POST_FILTER
    } else {
        0
    };
    let options = read_i32(store, names::LOG_BAT_OPT, default_opt);
    batch.post_filter = options & OPT_POST_FILTER != 0;
    batch.pre_and_post_filter = options & OPT_PRE_AND_POST_FILTER != 0;

    settings
}

fn id_names(kind: SensorKind) -> &'static [&'static str; MAX_INSTANCES] {
    match kind {
        SensorKind::Accel => &names::ACCEL_ID,
        SensorKind::Gyro => &names::GYRO_ID,
    }
}

fn offset_names(kind: SensorKind) -> &'static [&'static str; MAX_INSTANCES] {
    match kind {
        SensorKind::Accel => &names::ACCEL_OFFSET,
        SensorKind::Gyro => &names::GYRO_OFFSET,
    }
}

fn read_vector(store: &dyn ParameterStore, prefix: &str) -> Option<Vector3<f32>> {
    let x = store.get(&format!("{}_X", prefix))?.as_f32();
    let y = store.get(&format!("{}_Y", prefix))?.as_f32();
    let z = store.get(&format!("{}_Z", prefix))?.as_f32();
    Some(Vector3::new(x, y, z))
}

fn write_vector(store: &mut dyn ParameterStore, prefix: &str, v: Vector3<f32>) -> InsResult<()> {
    store.set(&format!("{}_X", prefix), ParamValue::Float(v.x))?;
    store.set(&format!("{}_Y", prefix), ParamValue::Float(v.y))?;
    store.set(&format!("{}_Z", prefix), ParamValue::Float(v.z))
}

/// Stable id stored in persistence slot `slot`, if any
pub fn stored_id(store: &dyn ParameterStore, kind: SensorKind, slot: usize) -> Option<u32> {
    let name = id_names(kind).get(slot)?;
    store.get(name).map(|v| v.as_i32() as u32).filter(|&id| id != 0)
}

/// Find the persisted calibration of the sensor with `stable_id`
///
/// Every slot is searched, so a sensor keeps its calibration when the
/// hardware enumerates in a different order.
///
/// # Returns
/// The persistence slot and its calibration, or `None` when the sensor has
/// never been calibrated
pub fn load_calibration(
    store: &dyn ParameterStore,
    kind: SensorKind,
    stable_id: u32,
) -> Option<(usize, Calibration)> {
    let slot = (0..MAX_INSTANCES).find(|&slot| stored_id(store, kind, slot) == Some(stable_id))?;
    let offset = read_vector(store, offset_names(kind)[slot])?;
    let scale = match kind {
        SensorKind::Accel => read_vector(store, names::ACCEL_SCALE[slot])?,
        SensorKind::Gyro => Vector3::repeat(1.0),
    };
    let calibration = Calibration { offset, scale };
    if !calibration.is_valid() {
        warn!("ignoring invalid stored {} calibration in slot {}", kind, slot);
        return None;
    }
    Some((slot, calibration))
}

/// Persist a calibration together with the stable id it belongs to
pub fn save_calibration(
    store: &mut dyn ParameterStore,
    kind: SensorKind,
    slot: usize,
    stable_id: u32,
    calibration: &Calibration,
) -> InsResult<()> {
    write_vector(store, offset_names(kind)[slot], calibration.offset)?;
    if kind == SensorKind::Accel {
        write_vector(store, names::ACCEL_SCALE[slot], calibration.scale)?;
    }
    store.set(id_names(kind)[slot], ParamValue::Int(stable_id as i32))?;
    info!("saved {} calibration for id {:#x} in slot {}", kind, stable_id, slot);
    Ok(())
}

/// Position offset of the accel persisted in `slot`, metres in the body frame
///
/// Zero when the slot has none.
pub fn load_position_offset(store: &dyn ParameterStore, slot: usize) -> Vector3<f32> {
    names::POSITION
        .get(slot)
        .and_then(|prefix| read_vector(store, prefix))
        .filter(Vector3Ext::all_finite)
        .unwrap_or_else(Vector3::zeros)
}

pub fn save_position_offset(store: &mut dyn ParameterStore, slot: usize, offset: Vector3<f32>) -> InsResult<()> {
    write_vector(store, names::POSITION[slot], offset)
}

/// Persist the board level trim in radians
pub fn save_trim(store: &mut dyn ParameterStore, trim: Vector3<f32>) -> InsResult<()> {
    for (name, value) in names::TRIM.iter().zip(trim.iter()) {
        store.set(name, ParamValue::Float(*value))?;
    }
    Ok(())
}
