//! Batch sampler
//!
//! Producers push sensor-rate and/or post-filter samples into bounded rings
//! (oldest data is overwritten). The consumer periodically drains one ring at
//! a time, rotating over every (instance, kind, pre/post filter) stream so no
//! stream starves.

use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use log::debug;

use crate::error::InsResult;
use crate::sink::{BatchRecord, DiagnosticRecord, DiagnosticSink};
use crate::types::{BatchSettings, SensorKind};

/// Capture ring shared between a producer and the batch sampler
pub type CaptureRing = Arc<ArrayQueue<[f32; 3]>>;

/// One captured stream
#[derive(Debug, Clone)]
pub struct BatchStream {
    pub instance: u8,
    pub kind: SensorKind,
    pub post_filter: bool,
    pub sample_rate_hz: f32,
    pub ring: CaptureRing,
}

/// Rotating reader over capture rings
#[derive(Debug)]
pub struct BatchSampler {
    settings: BatchSettings,
    streams: Vec<BatchStream>,
    cursor: usize,
    seq: u32,
    last_push_ms: Option<u64>,
}

impl BatchSampler {
    pub fn new(settings: BatchSettings) -> Self {
        Self {
            settings,
            streams: Vec::new(),
            cursor: 0,
            seq: 0,
            last_push_ms: None,
        }
    }

    /// Whether `kind` is selected for capture
    pub fn captures(&self, kind: SensorKind) -> bool {
        self.settings.enabled() && self.settings.sensor_mask & kind.mask_bit() != 0
    }

    /// Create a capture ring for a new stream
    pub fn add_stream(
        &mut self,
        instance: u8,
        kind: SensorKind,
        post_filter: bool,
        sample_rate_hz: f32,
    ) -> CaptureRing {
        let ring = Arc::new(ArrayQueue::new(usize::from(self.settings.required_count.max(1))));
        self.streams.push(BatchStream {
            instance,
            kind,
            post_filter,
            sample_rate_hz,
            ring: Arc::clone(&ring),
        });
        ring
    }

    pub fn streams(&self) -> &[BatchStream] {
        &self.streams
    }

    /// Emit at most one batch record
    ///
    /// Rate limited to one record per `push_interval_ms`. Starting at the
    /// rotation cursor, the first stream with pending samples is drained by
    /// up to `samples_per_msg` samples and the cursor moves past it.
    ///
    /// # Returns
    /// Whether a record was written
    pub fn periodic(&mut self, now_ms: u64, sink: &mut dyn DiagnosticSink) -> InsResult<bool> {
        if self.streams.is_empty() {
            return Ok(false);
        }
        let interval_ms = u64::from(self.settings.push_interval_ms);
        if self
            .last_push_ms
            .is_some_and(|last| now_ms.saturating_sub(last) < interval_ms)
        {
            return Ok(false);
        }

        let count = self.streams.len();
        let Some(index) = (0..count)
            .map(|offset| (self.cursor + offset) % count)
            .find(|&i| !self.streams[i].ring.is_empty())
        else {
            return Ok(false);
        };

        let stream = &self.streams[index];
        let samples: Vec<[f32; 3]> = std::iter::from_fn(|| stream.ring.pop())
            .take(usize::from(self.settings.samples_per_msg.max(1)))
            .collect();
        let record = BatchRecord {
            timestamp_ms: now_ms,
            instance: stream.instance,
            kind: stream.kind,
            post_filter: stream.post_filter,
            seq: self.seq,
            sample_rate_hz: stream.sample_rate_hz,
            samples,
        };
        debug!(
            "batch {} from {} {} ({} samples)",
            record.seq,
            record.kind,
            record.instance,
            record.samples.len()
        );

        self.cursor = (index + 1) % count;
        self.seq = self.seq.wrapping_add(1);
        self.last_push_ms = Some(now_ms);
        sink.write(&DiagnosticRecord::Batch(record))?;
        Ok(true)
    }
}
