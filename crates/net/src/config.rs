//! Tunables for the batcher and the character state sampler.
//!
//! Both structs deserialize with `#[serde(default)]`, so a config file only
//! needs the keys it overrides. Durations are stored in milliseconds.

use crate::priority::{DeliveryMethod, Priority};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// What happens when a priority queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued message of that priority.
    DropOldest,
    /// Refuse the new message with [`crate::BatchError::QueueFull`].
    Reject,
}

/// Message batcher configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    /// When false, queued messages bypass batching and are sent immediately.
    pub enabled: bool,
    /// Flush interval of the Critical bucket.
    pub critical_interval_ms: u64,
    /// Flush interval of the High bucket.
    pub high_interval_ms: u64,
    /// Flush interval of the Medium bucket.
    pub medium_interval_ms: u64,
    /// Flush interval of the Low bucket.
    pub low_interval_ms: u64,
    /// Buffered message count that forces a flush; also caps entries per envelope.
    pub max_messages_per_batch: usize,
    /// Estimated buffered bytes that force a flush; also caps envelope size.
    pub max_batch_bytes: usize,
    /// Messages each priority queue may hold between ticks (0 = unbounded).
    pub queue_capacity: usize,
    /// Behaviour when a queue is at capacity.
    pub overflow_policy: OverflowPolicy,
    /// Transport channel envelopes are sent on.
    pub channel: u8,
    /// Character state sampler settings.
    pub character_state: CharacterStateConfig,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            critical_interval_ms: 16,
            high_interval_ms: 33,
            medium_interval_ms: 100,
            low_interval_ms: 500,
            max_messages_per_batch: 50,
            max_batch_bytes: 1200,
            queue_capacity: 8192,
            overflow_policy: OverflowPolicy::DropOldest,
            channel: 0,
            character_state: CharacterStateConfig::default(),
        }
    }
}

impl BatchingConfig {
    /// Flush interval configured for `priority`.
    pub fn flush_interval(&self, priority: Priority) -> Duration {
        let millis = match priority {
            Priority::Critical => self.critical_interval_ms,
            Priority::High => self.high_interval_ms,
            Priority::Medium => self.medium_interval_ms,
            Priority::Low => self.low_interval_ms,
        };
        Duration::from_millis(millis)
    }

    /// Replace limits that would stall batching with workable minimums.
    pub fn normalized(mut self) -> Self {
        if self.max_messages_per_batch == 0 {
            warn!("max_messages_per_batch must be at least 1; using 1");
            self.max_messages_per_batch = 1;
        }
        if self.max_batch_bytes < ENVELOPE_FLOOR {
            warn!(
                "max_batch_bytes {} too small; using {}",
                self.max_batch_bytes, ENVELOPE_FLOOR
            );
            self.max_batch_bytes = ENVELOPE_FLOOR;
        }
        self.character_state = self.character_state.normalized();
        self
    }
}

const ENVELOPE_FLOOR: usize = 64;

/// Character state sampler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CharacterStateConfig {
    /// Sampling interval (10 Hz by default).
    pub sample_interval_ms: u64,
    /// Distance an entity must move before a new sample is sent.
    pub position_threshold: f32,
    /// Rotation change in degrees before a new sample is sent.
    pub rotation_threshold_degrees: f32,
    /// Pending updates that force an immediate flush.
    pub max_pending_updates: usize,
    /// Per-axis delta below which an axis is sent as zero.
    pub position_delta_threshold: f32,
    /// Rotation change in degrees below which `NoChange` is sent.
    pub rotation_delta_threshold_degrees: f32,
    /// Priority used when handing batches to the message batcher.
    pub priority: Priority,
    /// Delivery method of state batches.
    pub delivery: DeliveryMethod,
    /// Send absolute positions every N batches per destination (0 = never).
    pub absolute_keyframe_interval: u32,
}

impl Default for CharacterStateConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 100,
            position_threshold: 0.1,
            rotation_threshold_degrees: 5.0,
            max_pending_updates: 20,
            position_delta_threshold: 0.01,
            rotation_delta_threshold_degrees: 1.0,
            priority: Priority::Medium,
            delivery: DeliveryMethod::Unreliable,
            absolute_keyframe_interval: 0,
        }
    }
}

impl CharacterStateConfig {
    /// Sampling interval as a duration.
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    fn normalized(mut self) -> Self {
        if self.max_pending_updates == 0 {
            warn!("max_pending_updates must be at least 1; using 1");
            self.max_pending_updates = 1;
        }
        self
    }
}
