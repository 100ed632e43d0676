//! Diagnostic records and sinks
//!
//! The front end emits structured records (batch captures, IMU snapshots,
//! vibration and notch state) to a [`DiagnosticSink`]. The wire format is up
//! to the sink; [`JsonLinesSink`] writes one JSON object per line.

use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::error::InsResult;
use crate::types::SensorKind;

/// A block of consecutive samples from one capture ring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub timestamp_ms: u64,
    pub instance: u8,
    pub kind: SensorKind,
    /// Captured after the filter stack rather than at sensor rate
    pub post_filter: bool,
    /// Increments with every emitted batch record
    pub seq: u32,
    pub sample_rate_hz: f32,
    pub samples: Vec<[f32; 3]>,
}

/// Snapshot of one instance after an update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImuRecord {
    pub timestamp_us: u64,
    pub instance: u8,
    pub kind: SensorKind,
    /// Filtered, calibrated reading
    pub value: [f32; 3],
    pub healthy: bool,
    pub temperature: f32,
    /// Samples dropped because the consumer fell behind
    pub overruns: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VibrationRecord {
    pub timestamp_us: u64,
    pub instance: u8,
    pub vibration: [f32; 3],
    /// Total clip count since start-up
    pub clip_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotchRecord {
    pub timestamp_us: u64,
    pub set: u8,
    pub center_hz: f32,
    pub harmonics: u8,
}

/// Any diagnostic record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiagnosticRecord {
    Batch(BatchRecord),
    Imu(ImuRecord),
    Vibration(VibrationRecord),
    Notch(NotchRecord),
}

/// Destination for diagnostic records
pub trait DiagnosticSink {
    fn write(&mut self, record: &DiagnosticRecord) -> InsResult<()>;
}

/// Sink collecting records in memory
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Vec<DiagnosticRecord>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[DiagnosticRecord] {
        &self.records
    }

    /// Remove and return everything collected so far
    pub fn take(&mut self) -> Vec<DiagnosticRecord> {
        std::mem::take(&mut self.records)
    }
}

impl DiagnosticSink for MemorySink {
    fn write(&mut self, record: &DiagnosticRecord) -> InsResult<()> {
        self.records.push(record.clone());
        Ok(())
    }
}

/// Sink writing one JSON object per line
///
/// # Example
/// ```
/// use fusion_ins::{DiagnosticRecord, DiagnosticSink, JsonLinesSink, NotchRecord};
///
/// let mut sink = JsonLinesSink::new(Vec::new());
/// sink.write(&DiagnosticRecord::Notch(NotchRecord {
///     timestamp_us: 0,
///     set: 0,
///     center_hz: 80.0,
///     harmonics: 1,
/// }))
/// .unwrap();
/// let text = String::from_utf8(sink.into_inner()).unwrap();
/// assert!(text.starts_with(r#"{"type":"notch""#));
/// ```
#[derive(Debug)]
pub struct JsonLinesSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> DiagnosticSink for JsonLinesSink<W> {
    fn write(&mut self, record: &DiagnosticRecord) -> InsResult<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_lines() {
        let mut sink = JsonLinesSink::new(Vec::new());
        let batch = DiagnosticRecord::Batch(BatchRecord {
            timestamp_ms: 12,
            instance: 1,
            kind: SensorKind::Gyro,
            post_filter: false,
            seq: 3,
            sample_rate_hz: 1000.0,
            samples: vec![[0.0, 0.5, 1.0]],
        });
        let vibration = DiagnosticRecord::Vibration(VibrationRecord {
            timestamp_us: 5,
            instance: 0,
            vibration: [0.1, 0.2, 0.3],
            clip_count: 2,
        });
        sink.write(&batch).unwrap();
        sink.write(&vibration).unwrap();

        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(r#""kind":"gyro""#));

        let decoded: DiagnosticRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(decoded, vibration);
    }

    #[test]
    fn test_memory_sink_take() {
        let mut sink = MemorySink::new();
        let record = DiagnosticRecord::Notch(NotchRecord {
            timestamp_us: 1,
            set: 1,
            center_hz: 100.0,
            harmonics: 3,
        });
        sink.write(&record).unwrap();
        assert_eq!(sink.records().len(), 1);
        assert_eq!(sink.take(), vec![record]);
        assert!(sink.records().is_empty());
    }
}
