//! Sampled, delta-compressed character state.
//!
//! [`CharacterStateBatcher`] keeps the last significant snapshot per entity and
//! only records an update when the entity moved or turned past the configured
//! thresholds. Every sampling interval (or when the pending list fills up) the
//! pending updates are grouped per destination into a
//! [`CompressedCharacterStateBatch`] and handed to the message batcher, or
//! straight to the transport when no batcher is attached.
//!
//! [`CharacterStateMirror`] is the receiving side: it applies batches onto its
//! own per-entity baseline.

use crate::clock::Clock;
use crate::compression::{
    encode_position, encode_rotation, rotation_angle_degrees, PositionDelta, RotationDelta,
};
use crate::config::CharacterStateConfig;
use crate::envelope::{decode_frame, encode_frame, WireError};
use crate::priority::{ConnectionId, MessageType};
use crate::stats::CompressionStats;
use crate::transport::Transport;
use crate::BatchQueue;
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Last significant state recorded for an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct CharacterStateSnapshot {
    /// Entity identifier.
    pub entity_id: String,
    /// World position.
    pub position: Vec3,
    /// Orientation.
    pub rotation: Quat,
    /// Clock reading when recorded.
    pub timestamp: Duration,
}

/// A significant change waiting for the next flush.
///
/// `previous_*` is the snapshot that was current when the update was queued,
/// `None` for the first sighting of the entity.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedCharacterStateUpdate {
    /// Entity identifier.
    pub entity_id: String,
    /// Position the receiver is assumed to hold.
    pub previous_position: Option<Vec3>,
    /// Rotation the receiver is assumed to hold.
    pub previous_rotation: Option<Quat>,
    /// New position.
    pub position: Vec3,
    /// New rotation.
    pub rotation: Quat,
    /// Connection the update is addressed to.
    pub destination: ConnectionId,
}

/// One entity's compressed state on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterStateRecord {
    /// Entity identifier.
    pub entity_id: String,
    /// Compressed position.
    pub position: PositionDelta,
    /// Compressed rotation.
    pub rotation: RotationDelta,
}

/// State updates for one destination, sent as [`MessageType::CHARACTER_STATE_BATCH`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedCharacterStateBatch {
    /// Diagnostic id, wraps per batcher instance.
    pub batch_id: u32,
    /// Creation time in seconds on the sender's clock.
    pub timestamp: f32,
    /// Records in queue order.
    pub updates: Vec<CharacterStateRecord>,
}

impl CompressedCharacterStateBatch {
    /// Serialize to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        encode_frame("character state batch", self)
    }

    /// Parse wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        decode_frame("character state batch", bytes)
    }
}

/// Interval-sampled producer of compressed character state.
pub struct CharacterStateBatcher {
    config: CharacterStateConfig,
    channel: u8,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    queue: Option<BatchQueue>,
    snapshots: HashMap<String, CharacterStateSnapshot>,
    pending: Vec<CompressedCharacterStateUpdate>,
    last_sample: Duration,
    next_batch_id: u32,
    batches_per_destination: HashMap<ConnectionId, u32>,
    batches_sent: u64,
    backlogged: bool,
    stats: CompressionStats,
}

impl CharacterStateBatcher {
    /// Create a batcher that sends directly on `channel` until a batcher queue is attached.
    pub fn new(
        config: CharacterStateConfig,
        channel: u8,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let last_sample = clock.now();
        Self {
            config,
            channel,
            transport,
            clock,
            queue: None,
            snapshots: HashMap::new(),
            pending: Vec::new(),
            last_sample,
            next_batch_id: 1,
            batches_per_destination: HashMap::new(),
            batches_sent: 0,
            backlogged: false,
            stats: CompressionStats::default(),
        }
    }

    /// Route batches through a message batcher queue.
    pub fn with_batcher(mut self, queue: BatchQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Record a new state for `entity_id` if it changed significantly.
    ///
    /// Returns whether the update was accepted. Filling the pending list
    /// flushes immediately; if that cannot happen because the transport is
    /// not ready, further updates are refused until a flush succeeds.
    pub fn queue_character_state_update(
        &mut self,
        entity_id: &str,
        position: Vec3,
        rotation: Quat,
        destination: ConnectionId,
    ) -> bool {
        if self.pending.len() >= self.config.max_pending_updates && !self.can_flush() {
            if !self.backlogged {
                warn!(
                    "transport not ready, holding {} state updates and refusing more",
                    self.pending.len()
                );
                self.backlogged = true;
            }
            return false;
        }

        let previous = self.snapshots.get(entity_id);
        if let Some(snapshot) = previous {
            let moved = position.distance(snapshot.position) >= self.config.position_threshold;
            let turned = rotation_angle_degrees(rotation, snapshot.rotation)
                >= self.config.rotation_threshold_degrees;
            if !moved && !turned {
                return false;
            }
        }

        let (previous_position, previous_rotation) = previous
            .map(|s| (Some(s.position), Some(s.rotation)))
            .unwrap_or((None, None));
        self.pending.push(CompressedCharacterStateUpdate {
            entity_id: entity_id.to_string(),
            previous_position,
            previous_rotation,
            position,
            rotation,
            destination,
        });
        self.snapshots.insert(
            entity_id.to_string(),
            CharacterStateSnapshot {
                entity_id: entity_id.to_string(),
                position,
                rotation,
                timestamp: self.clock.now(),
            },
        );
        trace!("queued state for {} -> {}", entity_id, destination);

        if self.pending.len() >= self.config.max_pending_updates && self.can_flush() {
            debug!("{} pending state updates, flushing early", self.pending.len());
            self.flush();
        }
        true
    }

    /// Flush when the sampling interval has elapsed. Returns batches handed off.
    pub fn tick(&mut self) -> usize {
        let now = self.clock.now();
        if now.saturating_sub(self.last_sample) < self.config.sample_interval() {
            return 0;
        }
        self.last_sample = now;
        self.flush()
    }

    /// Compress and hand off every pending update. Returns batches handed off.
    ///
    /// Without an attached batcher the updates stay pending while the
    /// transport is not ready.
    pub fn flush(&mut self) -> usize {
        if self.pending.is_empty() {
            return 0;
        }
        if !self.can_flush() {
            trace!("transport not ready, keeping {} state updates", self.pending.len());
            return 0;
        }
        self.backlogged = false;

        let mut groups: Vec<(ConnectionId, Vec<CompressedCharacterStateUpdate>)> = Vec::new();
        for update in std::mem::take(&mut self.pending) {
            match groups.iter_mut().find(|(dest, _)| *dest == update.destination) {
                Some((_, group)) => group.push(update),
                None => groups.push((update.destination, vec![update])),
            }
        }

        let mut sent = 0;
        for (destination, updates) in groups {
            if self.send_batch(destination, updates) {
                sent += 1;
            }
        }
        sent
    }

    /// Direct sends need a ready transport; a batcher queue always accepts.
    fn can_flush(&self) -> bool {
        self.queue.is_some() || self.transport.is_ready()
    }

    fn send_batch(
        &mut self,
        destination: ConnectionId,
        updates: Vec<CompressedCharacterStateUpdate>,
    ) -> bool {
        let sequence = self.batches_per_destination.entry(destination).or_insert(0);
        let interval = self.config.absolute_keyframe_interval;
        let keyframe = interval > 0 && *sequence % interval == 0;
        *sequence = sequence.wrapping_add(1);

        let records: Vec<CharacterStateRecord> = updates
            .iter()
            .map(|update| self.compress(update, keyframe))
            .collect();
        let batch = CompressedCharacterStateBatch {
            batch_id: self.next_batch_id,
            timestamp: self.clock.now().as_secs_f32(),
            updates: records,
        };
        self.next_batch_id = self.next_batch_id.wrapping_add(1);

        let bytes = match batch.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("dropping state batch for {}: {}", destination, err);
                return false;
            }
        };

        let result = match &self.queue {
            Some(queue) => queue.queue_raw_message(
                destination,
                self.config.delivery,
                MessageType::CHARACTER_STATE_BATCH,
                bytes,
                self.config.priority,
            ),
            None => self
                .transport
                .send(
                    destination,
                    self.channel,
                    self.config.delivery,
                    MessageType::CHARACTER_STATE_BATCH,
                    &bytes,
                )
                .map_err(Into::into),
        };
        match result {
            Ok(()) => {
                debug!(
                    "state batch {} -> {}: {} updates{}",
                    batch.batch_id,
                    destination,
                    batch.updates.len(),
                    if keyframe { " (keyframe)" } else { "" }
                );
                self.batches_sent += 1;
                true
            }
            Err(err) => {
                warn!("state batch {} to {} failed: {}", batch.batch_id, destination, err);
                false
            }
        }
    }

    fn compress(
        &mut self,
        update: &CompressedCharacterStateUpdate,
        keyframe: bool,
    ) -> CharacterStateRecord {
        let (position, rotation) = if keyframe {
            (
                PositionDelta::Absolute(update.position),
                RotationDelta::Absolute(update.rotation),
            )
        } else {
            (
                encode_position(
                    update.position,
                    update.previous_position,
                    self.config.position_delta_threshold,
                ),
                encode_rotation(
                    update.rotation,
                    update.previous_rotation,
                    self.config.rotation_delta_threshold_degrees,
                ),
            )
        };
        let raw = update.position - update.previous_position.unwrap_or(Vec3::ZERO);
        self.stats.record_position(&position, raw);
        self.stats.record_rotation(&rotation);
        CharacterStateRecord {
            entity_id: update.entity_id.clone(),
            position,
            rotation,
        }
    }

    /// Forget an entity and drop its pending updates.
    ///
    /// Returns whether a snapshot existed.
    pub fn clear_character_state(&mut self, entity_id: &str) -> bool {
        self.pending.retain(|update| update.entity_id != entity_id);
        self.snapshots.remove(entity_id).is_some()
    }

    /// Last significant snapshot of an entity.
    pub fn snapshot(&self, entity_id: &str) -> Option<&CharacterStateSnapshot> {
        self.snapshots.get(entity_id)
    }

    /// Updates waiting for the next flush.
    pub fn pending(&self) -> &[CompressedCharacterStateUpdate] {
        &self.pending
    }

    /// Entities with a snapshot.
    pub fn tracked_entities(&self) -> usize {
        self.snapshots.len()
    }

    /// Batches handed off since creation.
    pub fn batches_sent(&self) -> u64 {
        self.batches_sent
    }

    /// Compression statistics.
    pub fn stats(&self) -> CompressionStats {
        self.stats
    }

    /// Zero the compression statistics.
    pub fn reset_stats(&mut self) {
        self.stats.reset();
    }
}

/// Receiver-side copy of entity state rebuilt from state batches.
#[derive(Debug, Default)]
pub struct CharacterStateMirror {
    states: HashMap<String, (Vec3, Quat)>,
    batches_applied: u64,
}

impl CharacterStateMirror {
    /// Create an empty mirror.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a decoded batch; unseen entities start from the origin and identity.
    pub fn apply_batch(&mut self, batch: &CompressedCharacterStateBatch) {
        for record in &batch.updates {
            let (position, rotation) = self
                .states
                .entry(record.entity_id.clone())
                .or_insert((Vec3::ZERO, Quat::IDENTITY));
            *position = record.position.apply(*position);
            *rotation = record.rotation.apply(*rotation);
        }
        self.batches_applied += 1;
    }

    /// Decode and apply a batch payload. Returns the number of records applied.
    pub fn apply_bytes(&mut self, bytes: &[u8]) -> Result<usize, WireError> {
        let batch = CompressedCharacterStateBatch::decode(bytes)?;
        self.apply_batch(&batch);
        Ok(batch.updates.len())
    }

    /// Mirrored state of an entity.
    pub fn get(&self, entity_id: &str) -> Option<(Vec3, Quat)> {
        self.states.get(entity_id).copied()
    }

    /// Forget an entity.
    pub fn remove(&mut self, entity_id: &str) -> bool {
        self.states.remove(entity_id).is_some()
    }

    /// Number of mirrored entities.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether nothing is mirrored.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Batches applied since creation.
    pub fn batches_applied(&self) -> u64 {
        self.batches_applied
    }
}
