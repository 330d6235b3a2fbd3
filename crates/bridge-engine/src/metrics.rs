//! Metrics collection and reporting.

use std::time::{Duration, Instant};

use bridge_ingest::IngestStatistics;
use bridge_webrtc::AttachmentStatistics;
use parking_lot::RwLock;
use serde::Serialize;

/// Point-in-time stream metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StreamMetrics {
    pub audio_packets_per_sec: f32,
    pub video_packets_per_sec: f32,
    pub ingest_bitrate_kbps: u32,
    pub relayed_transports: usize,
    pub samples_written: u64,
    /// Events dropped because a sink fell behind.
    pub delivery_drops: u64,
    pub packets_skipped: u64,
    pub write_errors: u64,
    pub uptime_seconds: u64,
}

/// Warnings raised from consecutive snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamWarning {
    /// Sinks dropped events since the last report.
    SlowSinks { dropped: u64 },

    /// Sample writes failed since the last report.
    WriteErrors { errors: u64 },
}

#[derive(Debug, Default, Clone, Copy)]
struct Reported {
    ingest: IngestStatistics,
    delivery_drops: u64,
    write_errors: u64,
}

/// Computes rates from the ingest and relay counters.
pub struct MetricsCollector {
    start_time: RwLock<Option<Instant>>,
    last_report_time: RwLock<Instant>,
    last: RwLock<Reported>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start_time: RwLock::new(None),
            last_report_time: RwLock::new(Instant::now()),
            last: RwLock::new(Reported::default()),
        }
    }

    /// Start metrics collection.
    pub fn start(&self) {
        *self.start_time.write() = Some(Instant::now());
        *self.last_report_time.write() = Instant::now();
    }

    /// Stop metrics collection.
    pub fn stop(&self) {
        *self.start_time.write() = None;
    }

    pub fn is_running(&self) -> bool {
        self.start_time.read().is_some()
    }

    /// Get current metrics snapshot.
    pub fn snapshot(
        &self,
        ingest: &IngestStatistics,
        relayed: &[AttachmentStatistics],
    ) -> StreamMetrics {
        self.snapshot_at(Instant::now(), ingest, relayed)
    }

    fn snapshot_at(
        &self,
        now: Instant,
        ingest: &IngestStatistics,
        relayed: &[AttachmentStatistics],
    ) -> StreamMetrics {
        let elapsed = now
            .duration_since(*self.last_report_time.read())
            .as_secs_f32();
        let last = *self.last.read();

        let rate = |current: u64, previous: u64| {
            if elapsed > 0.0 {
                current.saturating_sub(previous) as f32 / elapsed
            } else {
                0.0
            }
        };

        let bytes = ingest.audio_bytes + ingest.video_bytes;
        let last_bytes = last.ingest.audio_bytes + last.ingest.video_bytes;
        let ingest_bitrate_kbps = (rate(bytes, last_bytes) * 8.0 / 1000.0) as u32;

        let uptime_seconds = self
            .start_time
            .read()
            .map(|s| now.duration_since(s).as_secs())
            .unwrap_or(0);

        StreamMetrics {
            audio_packets_per_sec: rate(ingest.audio_packets, last.ingest.audio_packets),
            video_packets_per_sec: rate(ingest.video_packets, last.ingest.video_packets),
            ingest_bitrate_kbps,
            relayed_transports: relayed.len(),
            samples_written: relayed.iter().map(|s| s.samples_written).sum(),
            delivery_drops: relayed
                .iter()
                .map(|s| s.audio_delivery.dropped + s.video_delivery.dropped)
                .sum(),
            packets_skipped: relayed.iter().map(|s| s.packets_skipped).sum(),
            write_errors: relayed.iter().map(|s| s.write_errors).sum(),
            uptime_seconds,
        }
    }

    /// Check for warnings against the last reported snapshot.
    pub fn check_warnings(&self, metrics: &StreamMetrics) -> Vec<StreamWarning> {
        let last = *self.last.read();
        let mut warnings = Vec::new();

        if metrics.delivery_drops > last.delivery_drops {
            warnings.push(StreamWarning::SlowSinks {
                dropped: metrics.delivery_drops - last.delivery_drops,
            });
        }
        if metrics.write_errors > last.write_errors {
            warnings.push(StreamWarning::WriteErrors {
                errors: metrics.write_errors - last.write_errors,
            });
        }

        warnings
    }

    /// Update last report state for rate calculation.
    pub fn mark_reported(&self, ingest: &IngestStatistics, metrics: &StreamMetrics) {
        *self.last_report_time.write() = Instant::now();
        *self.last.write() = Reported {
            ingest: *ingest,
            delivery_drops: metrics.delivery_drops,
            write_errors: metrics.write_errors,
        };
    }

    /// Time since the last report.
    pub fn since_report(&self) -> Duration {
        self.last_report_time.read().elapsed()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
