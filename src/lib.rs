//! [![github]](https://github.com/wboayue/fusion-ins)&ensp;[![crates-io]](https://crates.io/crates/fusion-ins)&ensp;[![license]](https://opensource.org/licenses/MIT)
//!
//! [github]: https://img.shields.io/badge/github-8da0cb?style=for-the-badge&labelColor=555555&logo=github
//! [crates-io]: https://img.shields.io/badge/crates.io-fc8d62?style=for-the-badge&labelColor=555555&logo=rust
//! [license]: https://img.shields.io/badge/License-MIT-blue.svg?style=for-the-badge&labelColor=555555
//!
//! Fusion INS - An inertial sensor front end for flight controllers
//!
//! This library sits between redundant accelerometer and gyroscope drivers
//! and an attitude/position estimator. Backends feed raw samples from their
//! own threads; the estimator receives a single fixed-rate, calibrated and
//! filtered stream together with a running judgement of which sensors are
//! fit for flight.
//!
//! # Features
//!
//! - Up to three accelerometers and three gyroscopes at independent raw rates
//! - Oversampling reduction to the loop rate with delta angle/velocity integration
//! - Low-pass and throttle/RPM tracking harmonic notch filtering
//! - Six-pose Gauss-Newton accelerometer calibration, stationary gyro bias, level trim
//! - Health, failover and consistency monitoring
//! - Vibration, clipping and batch sampling diagnostics
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use nalgebra::Vector3;
//! use fusion_ins::{Clock, InertialSensor, InsSettings, MemoryParameterStore, MonotonicClock};
//!
//! let clock = Arc::new(MonotonicClock::new());
//! let mut ins = InertialSensor::new(
//!     InsSettings::default(),
//!     clock.clone(),
//!     Box::new(MemoryParameterStore::new()),
//! );
//! let mut gyro = ins.register_gyro(1000.0, 0x0001).unwrap();
//! let mut accel = ins.register_accel(1000.0, 0x0002).unwrap();
//!
//! // Usually on driver threads; timestamps come from the front end's clock
//! for _ in 0..3 {
//!     gyro.ingest(Vector3::new(0.0, 0.0, 0.05), clock.now_us());
//!     accel.ingest(Vector3::new(0.0, 0.0, 9.81), clock.now_us());
//! }
//!
//! // Estimator loop
//! ins.wait_for_sample().unwrap();
//! ins.update();
//! let rate = ins.gyro_primary();
//! let (delta_angle, dt) = ins.delta_angle(0).unwrap();
//! assert!((rate.z - 0.05).abs() < 1e-4);
//! assert!((delta_angle.z - 0.05 * dt).abs() < 1e-6);
//! ```
//!
//! For more documentation and examples, see: <https://github.com/wboayue/fusion-ins>

pub mod accumulator;
mod backend;
mod batch;
pub mod calibration;
mod clock;
mod error;
pub mod filter;
pub mod health;
mod ins;
mod math;
pub mod params;
mod registry;
mod rotation;
mod session;
mod sink;
mod types;
mod vibration;

// Re-export all public types and functions
pub use backend::{BackendHandle, PUBLISH_QUEUE_DEPTH, PublishedSample};
pub use batch::{BatchSampler, BatchStream, CaptureRing};
pub use calibration::{
    AccelCalibrator, AccelFit, Calibration, CalibrationResult, GyroCalibrator, GyroStep, calculate_trim,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::{InsError, InsResult};
pub use health::HealthState;
pub use ins::InertialSensor;
pub use math::{DEG_TO_RAD, GRAVITY_MSS, RAD_TO_DEG, Vector3Ext};
pub use params::{MemoryParameterStore, ParamValue, ParameterStore, load_settings};
pub use rotation::Rotation;
pub use session::{AccelSession, GyroSession, GyroSessionState};
pub use sink::{
    BatchRecord, DiagnosticRecord, DiagnosticSink, ImuRecord, JsonLinesSink, MemorySink, NotchRecord,
    VibrationRecord,
};
pub use types::*;
pub use vibration::{PEAK_HOLD_TIMEOUT_MS, PeakHold, VibrationMonitor};
