use criterion::{Criterion, black_box, criterion_group, criterion_main};
use fusion_ins::filter::HarmonicNotchFilter;
use fusion_ins::{
    AccelCalibrator, CalibrationSettings, Clock, GRAVITY_MSS, InertialSensor, InsSettings, ManualClock,
    MemoryParameterStore, NotchSettings, NotchTracking,
};
use nalgebra::Vector3;
use rand::prelude::*;
use rand_pcg::Pcg64;
use std::f32::consts::PI;
use std::sync::Arc;

// Pre-generated sensor data to eliminate RNG overhead during benchmarks
struct PreGeneratedData {
    samples: Vec<(Vector3<f32>, Vector3<f32>)>,
    index: usize,
}

impl PreGeneratedData {
    fn new(count: usize, seed: u64) -> Self {
        let mut rng = Pcg64::seed_from_u64(seed);
        let mut samples = Vec::with_capacity(count);

        for i in 0..count {
            let time = i as f32 * 0.001; // 1kHz raw rate

            // Slow attitude motion plus an 80 Hz rotor line
            let motion_phase = time * 0.5 * 2.0 * PI;
            let rotor = (time * 80.0 * 2.0 * PI).sin();

            let gyroscope = Vector3::new(
                0.2 * motion_phase.sin() + 0.5 * rotor + rng.random_range(-0.01..0.01),
                0.2 * (motion_phase * 1.3).cos() + 0.5 * rotor + rng.random_range(-0.01..0.01),
                0.2 * (motion_phase * 0.7).sin() + rng.random_range(-0.01..0.01),
            );

            let accelerometer = Vector3::new(
                -1.0 * motion_phase.sin() + 2.0 * rotor + rng.random_range(-0.02..0.02),
                1.0 * motion_phase.cos() + 2.0 * rotor + rng.random_range(-0.02..0.02),
                GRAVITY_MSS + rng.random_range(-0.02..0.02),
            );

            samples.push((gyroscope, accelerometer));
        }

        Self { samples, index: 0 }
    }

    fn next(&mut self) -> (Vector3<f32>, Vector3<f32>) {
        let sample = self.samples[self.index];
        self.index = (self.index + 1) % self.samples.len();
        sample
    }
}

fn notched_settings() -> InsSettings {
    let mut settings = InsSettings {
        loop_rate_hz: 1000,
        ..Default::default()
    };
    settings.notches[0] = NotchSettings {
        enabled: true,
        harmonics: 0b0011,
        reference: 0.25,
        tracking: NotchTracking::Throttle,
        ..Default::default()
    };
    settings
}

fn sensor(settings: InsSettings) -> (InertialSensor, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1));
    let ins = InertialSensor::new(settings, clock.clone(), Box::new(MemoryParameterStore::new()));
    (ins, clock)
}

/// Benchmark the producer path of one raw gyro sample through accumulator and filters
fn bench_ingest(c: &mut Criterion) {
    let (mut ins, clock) = sensor(notched_settings());
    let mut gyro = ins.register_gyro(1000.0, 1).unwrap();
    let mut data = PreGeneratedData::new(1000, 42);

    c.bench_function("ins_ingest_gyro", |b| {
        b.iter(|| {
            let (gyroscope, _) = data.next();
            clock.advance_us(1000);
            gyro.ingest(black_box(gyroscope), clock.now_us());
        })
    });
}

/// Benchmark one consumer update with two gyros and two accels
fn bench_update(c: &mut Criterion) {
    let (mut ins, clock) = sensor(notched_settings());
    let mut gyros = [
        ins.register_gyro(1000.0, 1).unwrap(),
        ins.register_gyro(1000.0, 2).unwrap(),
    ];
    let mut accels = [
        ins.register_accel(1000.0, 3).unwrap(),
        ins.register_accel(1000.0, 4).unwrap(),
    ];
    let mut data = PreGeneratedData::new(1000, 7);

    c.bench_function("ins_update_2x2", |b| {
        b.iter(|| {
            let (gyroscope, accelerometer) = data.next();
            clock.advance_us(1000);
            let now = clock.now_us();
            for gyro in gyros.iter_mut() {
                gyro.ingest(gyroscope, now);
            }
            for accel in accels.iter_mut() {
                accel.ingest(accelerometer, now);
            }
            ins.update();
            black_box(ins.gyro_primary())
        })
    });
}

/// Benchmark a harmonic notch bank with a moving center
fn bench_harmonic_notch(c: &mut Criterion) {
    let settings = NotchSettings {
        enabled: true,
        harmonics: 0b1111,
        ..Default::default()
    };
    let mut filter = HarmonicNotchFilter::new(1000.0, &settings);
    let mut data = PreGeneratedData::new(1000, 3);
    let mut center = 80.0f32;

    c.bench_function("harmonic_notch_retune_apply", |b| {
        b.iter(|| {
            center = if center > 120.0 { 80.0 } else { center + 0.5 };
            filter.update_center(center);
            let (gyroscope, _) = data.next();
            black_box(filter.apply(black_box(gyroscope)))
        })
    });
}

/// Benchmark a six-pose accelerometer fit
fn bench_accel_fit(c: &mut Criterion) {
    let g = GRAVITY_MSS;
    let offset = Vector3::new(0.3, -0.2, 0.5);
    let scale = Vector3::new(1.02, 0.97, 1.01);
    let poses: Vec<Vector3<f32>> = [
        Vector3::new(0.0, 0.0, g),
        Vector3::new(0.0, 0.0, -g),
        Vector3::new(g, 0.0, 0.0),
        Vector3::new(-g, 0.0, 0.0),
        Vector3::new(0.0, g, 0.0),
        Vector3::new(0.0, -g, 0.0),
    ]
    .iter()
    .map(|p| p.component_div(&scale) + offset)
    .collect();
    let calibrator = AccelCalibrator::new(CalibrationSettings::default());

    c.bench_function("accel_fit_six_poses", |b| {
        b.iter(|| black_box(calibrator.fit(black_box(&poses))))
    });
}

/// Benchmark InertialSensor creation and registration
fn bench_creation(c: &mut Criterion) {
    c.bench_function("ins_new_register", |b| {
        b.iter(|| {
            let (mut ins, _) = sensor(notched_settings());
            black_box(ins.register_gyro(1000.0, 1).ok());
            black_box(ins.register_accel(1000.0, 2).ok());
            ins
        })
    });
}

criterion_group!(
    benches,
    bench_ingest,
    bench_update,
    bench_harmonic_notch,
    bench_accel_fit,
    bench_creation
);

criterion_main!(benches);
