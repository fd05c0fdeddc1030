//! Metrics reports for headless batching runs.
//!
//! A [`MetricsReport`] collects the sender, receiver and compression counters
//! of one run plus a per-second timeline, and is exported as JSON for
//! regression tracking.

use anyhow::Result;
use mmobatch_net::{BatchProcessingStats, CompressionStats, MessageBatchStats, Priority};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use tracing::debug;

/// Top-level metrics report.
///
/// This is the format of the metrics.json files written by the profiler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReport {
    /// Run identifier
    pub test_name: String,

    /// Timestamp when metrics were collected (ISO 8601)
    pub timestamp: String,

    /// Overall result
    pub result: TestResult,

    /// Sender-side batching metrics
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batching: Option<BatchingMetrics>,

    /// Receiver-side dispatch metrics
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch: Option<DispatchMetrics>,

    /// Character state compression metrics
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<CompressionMetrics>,

    /// Sender/receiver agreement on character positions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift: Option<DriftMetrics>,

    /// One sample per simulated second
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub timeline: Vec<ProfileSample>,

    /// Run execution metrics
    pub test_execution: TestExecutionMetrics,
}

/// Overall result status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestResult {
    /// All validations passed
    Pass,
    /// A validation failed
    Fail,
    /// Run was skipped
    Skip,
}

/// Sender-side batching metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchingMetrics {
    /// Messages accepted into the queues
    pub messages_queued: u64,

    /// Messages folded into envelopes
    pub messages_batched: u64,

    /// Envelopes sent
    pub batches_sent: u64,

    /// Envelope bytes sent
    pub bytes_sent: u64,

    /// Estimated bytes saved versus unbatched sends
    pub bandwidth_saved: u64,

    /// Average entries per envelope
    pub avg_batch_size: f64,

    /// Envelope sends that failed
    pub send_failures: u64,

    /// Messages resent unbatched
    pub fallback_messages: u64,

    /// Messages dropped by the queue bound
    pub messages_dropped: u64,

    /// Envelopes per priority
    pub batches_by_priority: BTreeMap<String, u64>,
}

impl From<&MessageBatchStats> for BatchingMetrics {
    fn from(stats: &MessageBatchStats) -> Self {
        let batches_by_priority = Priority::ALL
            .iter()
            .map(|p| (format!("{p:?}").to_lowercase(), stats.priority(*p).batches))
            .collect();
        Self {
            messages_queued: stats.messages_queued,
            messages_batched: stats.messages_batched,
            batches_sent: stats.batches_sent,
            bytes_sent: stats.bytes_sent,
            bandwidth_saved: stats.bandwidth_saved,
            avg_batch_size: stats.average_batch_size(),
            send_failures: stats.send_failures,
            fallback_messages: stats.fallback_messages,
            messages_dropped: stats.messages_dropped,
            batches_by_priority,
        }
    }
}

/// Receiver-side dispatch metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchMetrics {
    /// Envelopes decoded
    pub batches_received: u64,

    /// Messages delivered to handlers
    pub messages_processed: u64,

    /// Messages without a handler
    pub unknown_messages: u64,

    /// Handler errors and panics
    pub handler_failures: u64,

    /// Envelopes that failed to decode
    pub malformed_batches: u64,

    /// Average processing time per envelope (microseconds)
    pub avg_processing_time_us: f64,

    /// Average entries per envelope
    pub avg_messages_per_batch: f64,
}

impl DispatchMetrics {
    /// Sum the counters of several receivers.
    pub fn merged<'a>(stats: impl IntoIterator<Item = &'a BatchProcessingStats>) -> Self {
        let mut total = BatchProcessingStats::default();
        for s in stats {
            total.batches_received += s.batches_received;
            total.messages_processed += s.messages_processed;
            total.unknown_messages += s.unknown_messages;
            total.handler_failures += s.handler_failures;
            total.malformed_batches += s.malformed_batches;
            total.batched_entries += s.batched_entries;
            total.total_processing_time += s.total_processing_time;
        }
        Self::from(&total)
    }
}

impl From<&BatchProcessingStats> for DispatchMetrics {
    fn from(stats: &BatchProcessingStats) -> Self {
        Self {
            batches_received: stats.batches_received,
            messages_processed: stats.messages_processed,
            unknown_messages: stats.unknown_messages,
            handler_failures: stats.handler_failures,
            malformed_batches: stats.malformed_batches,
            avg_processing_time_us: stats.average_processing_time().as_secs_f64() * 1e6,
            avg_messages_per_batch: stats.average_messages_per_batch(),
        }
    }
}

/// Character state compression metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompressionMetrics {
    /// Positions encoded
    pub positions_encoded: u64,

    /// Positions sent absolute
    pub absolute_positions: u64,

    /// Axes zeroed by the delta threshold
    pub zeroed_axes: u64,

    /// Rotations sent as no-change
    pub unchanged_rotations: u64,

    /// Encoded bytes over raw bytes
    pub compression_ratio: f64,
}

impl From<&CompressionStats> for CompressionMetrics {
    fn from(stats: &CompressionStats) -> Self {
        Self {
            positions_encoded: stats.positions_encoded,
            absolute_positions: stats.absolute_positions,
            zeroed_axes: stats.zeroed_axes,
            unchanged_rotations: stats.unchanged_rotations,
            compression_ratio: stats.ratio(),
        }
    }
}

/// Position agreement between sender snapshots and receiver mirrors
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriftMetrics {
    /// Entities compared
    pub entities: usize,

    /// Largest sender/receiver distance
    pub max_drift: f32,

    /// Mean sender/receiver distance
    pub avg_drift: f32,
}

/// Counters sampled at the end of one simulated second
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileSample {
    /// Simulated second
    pub second: u64,

    /// Messages batched during this second
    pub messages_batched: u64,

    /// Envelopes sent during this second
    pub batches_sent: u64,

    /// Envelope bytes sent during this second
    pub bytes_sent: u64,

    /// Bandwidth saved during this second
    pub bandwidth_saved: u64,

    /// Messages the receivers processed during this second
    pub messages_processed: u64,
}

/// Run execution metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestExecutionMetrics {
    /// Wall-clock duration (seconds)
    pub duration_seconds: f64,

    /// Simulated duration (seconds)
    pub simulated_seconds: f64,

    /// Frames simulated
    pub frames: u64,

    /// Number of validations passed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validations_passed: Option<usize>,
}

/// Builder for constructing metrics reports
pub struct MetricsReportBuilder {
    report: MetricsReport,
}

impl MetricsReportBuilder {
    /// Create a new builder with run name
    pub fn new(test_name: impl Into<String>) -> Self {
        Self {
            report: MetricsReport {
                test_name: test_name.into(),
                timestamp: chrono::Utc::now().to_rfc3339(),
                result: TestResult::Pass,
                batching: None,
                dispatch: None,
                compression: None,
                drift: None,
                timeline: Vec::new(),
                test_execution: TestExecutionMetrics::default(),
            },
        }
    }

    /// Set result
    pub fn result(mut self, result: TestResult) -> Self {
        self.report.result = result;
        self
    }

    /// Set batching metrics
    pub fn batching(mut self, metrics: BatchingMetrics) -> Self {
        self.report.batching = Some(metrics);
        self
    }

    /// Set dispatch metrics
    pub fn dispatch(mut self, metrics: DispatchMetrics) -> Self {
        self.report.dispatch = Some(metrics);
        self
    }

    /// Set compression metrics
    pub fn compression(mut self, metrics: CompressionMetrics) -> Self {
        self.report.compression = Some(metrics);
        self
    }

    /// Set drift metrics
    pub fn drift(mut self, metrics: DriftMetrics) -> Self {
        self.report.drift = Some(metrics);
        self
    }

    /// Set the per-second timeline
    pub fn timeline(mut self, samples: Vec<ProfileSample>) -> Self {
        self.report.timeline = samples;
        self
    }

    /// Set execution metrics
    pub fn execution(mut self, metrics: TestExecutionMetrics) -> Self {
        self.report.test_execution = metrics;
        self
    }

    /// Build the metrics report
    pub fn build(self) -> MetricsReport {
        self.report
    }
}

/// Sink for writing metrics reports to JSON files
pub struct MetricsSink {
    path: std::path::PathBuf,
}

impl MetricsSink {
    /// Create a new metrics sink at the specified path
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        Ok(Self { path })
    }

    /// Write metrics report to file
    pub fn write(&self, report: &MetricsReport) -> Result<()> {
        let json = serde_json::to_string_pretty(report)?;
        let mut file = File::create(&self.path)?;
        file.write_all(json.as_bytes())?;
        debug!("Wrote metrics report to {}", self.path.display());
        Ok(())
    }
}
