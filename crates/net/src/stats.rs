//! Accumulating counters for the batcher, dispatcher and compressor.

use crate::compression::{PositionDelta, RotationDelta};
use crate::envelope::PER_SEND_OVERHEAD;
use crate::priority::Priority;
use glam::Vec3;
use std::time::Duration;

/// Counters of one priority bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PriorityCounters {
    /// Messages folded into envelopes.
    pub messages: u64,
    /// Envelopes sent.
    pub batches: u64,
}

/// Sender-side statistics of a [`crate::MessageBatcher`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageBatchStats {
    /// Messages accepted into the queues.
    pub messages_queued: u64,
    /// Messages folded into envelopes.
    pub messages_batched: u64,
    /// Envelopes handed to the transport successfully.
    pub batches_sent: u64,
    /// Envelope bytes handed to the transport.
    pub bytes_sent: u64,
    /// Estimated bytes saved versus one send per message.
    pub bandwidth_saved: u64,
    /// Envelope sends the transport rejected.
    pub send_failures: u64,
    /// Messages resent individually after an envelope send failed.
    pub fallback_messages: u64,
    /// Messages evicted or rejected by the queue bound.
    pub messages_dropped: u64,
    /// Messages sent immediately because batching is disabled.
    pub direct_sends: u64,
    /// Breakdown by priority.
    pub per_priority: [PriorityCounters; 4],
}

impl MessageBatchStats {
    /// Counters for one priority.
    pub fn priority(&self, priority: Priority) -> PriorityCounters {
        self.per_priority[priority.index()]
    }

    /// Mean entries per envelope.
    pub fn average_batch_size(&self) -> f64 {
        if self.batches_sent == 0 {
            0.0
        } else {
            self.messages_batched as f64 / self.batches_sent as f64
        }
    }

    /// Record one envelope of `bytes` that replaced sends costing `naive_bytes`.
    pub(crate) fn record_batch(
        &mut self,
        priority: Priority,
        messages: usize,
        bytes: usize,
        naive_bytes: usize,
    ) {
        let counters = &mut self.per_priority[priority.index()];
        counters.messages += messages as u64;
        counters.batches += 1;
        self.messages_batched += messages as u64;
        self.batches_sent += 1;
        self.bytes_sent += bytes as u64;
        self.bandwidth_saved += naive_bytes.saturating_sub(bytes + PER_SEND_OVERHEAD) as u64;
    }

    /// Zero every counter.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Receiver-side statistics of a [`crate::BatchDispatcher`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchProcessingStats {
    /// Envelopes decoded successfully.
    pub batches_received: u64,
    /// Messages a handler accepted.
    pub messages_processed: u64,
    /// Entries whose type had no handler.
    pub unknown_messages: u64,
    /// Handler invocations that returned an error or panicked.
    pub handler_failures: u64,
    /// Envelopes that failed to decode.
    pub malformed_batches: u64,
    /// Entries seen inside decoded envelopes.
    pub batched_entries: u64,
    /// Time spent processing decoded envelopes.
    pub total_processing_time: Duration,
}

impl BatchProcessingStats {
    /// Mean processing time per envelope since creation or the last reset.
    ///
    /// This is a cumulative average; call [`Self::reset`] to start a new window.
    pub fn average_processing_time(&self) -> Duration {
        if self.batches_received == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(
                self.total_processing_time.as_secs_f64() / self.batches_received as f64,
            )
        }
    }

    /// Mean entries per envelope.
    pub fn average_messages_per_batch(&self) -> f64 {
        if self.batches_received == 0 {
            0.0
        } else {
            self.batched_entries as f64 / self.batches_received as f64
        }
    }

    pub(crate) fn record_batch(&mut self, entries: usize, elapsed: Duration) {
        self.batches_received += 1;
        self.batched_entries += entries as u64;
        self.total_processing_time += elapsed;
    }

    /// Zero every counter.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Statistics of delta-compressed character state.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CompressionStats {
    /// Positions encoded.
    pub positions_encoded: u64,
    /// Positions sent as absolute values.
    pub absolute_positions: u64,
    /// Individual axes zeroed by the delta threshold.
    pub zeroed_axes: u64,
    /// Rotations encoded.
    pub rotations_encoded: u64,
    /// Rotations sent as `NoChange`.
    pub unchanged_rotations: u64,
    /// Bytes the fields would take uncompressed.
    pub raw_bytes: u64,
    /// Bytes the fields took on the wire.
    pub encoded_bytes: u64,
}

impl CompressionStats {
    /// Record a position field, `raw` being the uncompressed delta.
    pub fn record_position(&mut self, encoded: &PositionDelta, raw: Vec3) {
        self.positions_encoded += 1;
        self.raw_bytes += (1 + 3 * 4) as u64;
        self.encoded_bytes += encoded.encoded_len() as u64;
        match encoded {
            PositionDelta::Absolute(_) => self.absolute_positions += 1,
            PositionDelta::Delta(delta) => {
                let zeroed = [
                    (delta.x, raw.x),
                    (delta.y, raw.y),
                    (delta.z, raw.z),
                ]
                .iter()
                .filter(|(sent, actual)| *sent == 0.0 && *actual != 0.0)
                .count();
                self.zeroed_axes += zeroed as u64;
            }
        }
    }

    /// Record a rotation field.
    pub fn record_rotation(&mut self, encoded: &RotationDelta) {
        self.rotations_encoded += 1;
        self.raw_bytes += (1 + 4 * 4) as u64;
        self.encoded_bytes += encoded.encoded_len() as u64;
        if matches!(encoded, RotationDelta::NoChange) {
            self.unchanged_rotations += 1;
        }
    }

    /// Encoded bytes divided by raw bytes (1.0 when nothing was recorded).
    pub fn ratio(&self) -> f64 {
        if self.raw_bytes == 0 {
            1.0
        } else {
            self.encoded_bytes as f64 / self.raw_bytes as f64
        }
    }

    /// Zero every counter.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Quat;

    #[test]
    fn bandwidth_saved_is_clamped() {
        let mut stats = MessageBatchStats::default();
        stats.record_batch(Priority::Low, 1, 40, 20);
        assert_eq!(stats.bandwidth_saved, 0);
        stats.record_batch(Priority::Low, 4, 40, 100);
        assert_eq!(stats.bandwidth_saved, 100 - 40 - PER_SEND_OVERHEAD as u64);
        assert_eq!(stats.priority(Priority::Low).batches, 2);
        assert!((stats.average_batch_size() - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn processing_averages() {
        let mut stats = BatchProcessingStats::default();
        assert_eq!(stats.average_processing_time(), Duration::ZERO);
        stats.record_batch(3, Duration::from_micros(30));
        stats.record_batch(1, Duration::from_micros(10));
        let average = stats.average_processing_time().as_nanos() as i128;
        assert!((average - 20_000).abs() <= 1, "average {average}ns");
        assert!((stats.average_messages_per_batch() - 2.0).abs() < f64::EPSILON);
        stats.reset();
        assert_eq!(stats, BatchProcessingStats::default());
    }

    #[test]
    fn processing_average_survives_u32_batch_counts() {
        let stats = BatchProcessingStats {
            batches_received: u64::from(u32::MAX) + 1,
            total_processing_time: Duration::from_micros(u64::from(u32::MAX) + 1),
            ..Default::default()
        };
        let average = stats.average_processing_time().as_nanos() as i128;
        assert!((average - 1_000).abs() <= 1, "average {average}ns");
    }

    #[test]
    fn compression_counts_no_change_and_zeroed_axes() {
        let mut stats = CompressionStats::default();
        stats.record_position(
            &PositionDelta::Delta(Vec3::new(1.0, 0.0, 0.0)),
            Vec3::new(1.0, 0.004, 0.0),
        );
        stats.record_rotation(&RotationDelta::NoChange);
        stats.record_rotation(&RotationDelta::Absolute(Quat::IDENTITY));
        assert_eq!(stats.zeroed_axes, 1);
        assert_eq!(stats.unchanged_rotations, 1);
        assert_eq!(stats.encoded_bytes, 13 + 1 + 17);
        assert!(stats.ratio() < 1.0);
    }
}
