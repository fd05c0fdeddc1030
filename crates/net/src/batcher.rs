//! Priority-bucketed message batching.
//!
//! Producers enqueue through a cloneable [`BatchQueue`] from any thread. The
//! owning thread calls [`MessageBatcher::tick`] once per frame; each priority
//! bucket flushes independently when its oldest message reaches the bucket's
//! interval, when it holds `max_messages_per_batch` messages, when its
//! estimated size reaches `max_batch_bytes`, or when a flush is forced.
//!
//! A flush groups buffered messages by destination and sends one
//! [`BatchedMessage`] per destination (split only when a group exceeds the
//! count or size limit). Order within a destination follows enqueue order.

use crate::clock::Clock;
use crate::config::{BatchingConfig, OverflowPolicy};
use crate::envelope::{
    encode_frame, estimated_entry_size, BatchEntry, BatchedMessage, ENVELOPE_HEADER_ESTIMATE,
    PER_SEND_OVERHEAD,
};
use crate::error::BatchError;
use crate::lock;
use crate::priority::{ConnectionId, DeliveryMethod, MessageType, Priority};
use crate::stats::MessageBatchStats;
use crate::transport::Transport;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, instrument, trace, warn};

/// A serialized message waiting for its bucket to flush.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    /// Connection the message is addressed to.
    pub destination: ConnectionId,
    /// Delivery requested by the producer.
    pub delivery: DeliveryMethod,
    /// Message type code.
    pub message_type: MessageType,
    /// Serialized message.
    pub payload: Vec<u8>,
    /// Bucket the message was queued into.
    pub priority: Priority,
    /// Clock reading at enqueue time.
    pub enqueued_at: Duration,
}

impl PendingMessage {
    fn estimated_size(&self) -> usize {
        estimated_entry_size(self.payload.len())
    }
}

/// Lifecycle of a priority bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketState {
    /// Nothing buffered.
    Idle,
    /// Messages buffered, no trigger met yet.
    Accumulating,
    /// Envelopes being built and sent.
    Flushing,
}

/// Why a bucket flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// Oldest message reached the bucket's interval.
    Age,
    /// Buffered count reached `max_messages_per_batch`.
    Count,
    /// Estimated bytes reached `max_batch_bytes`.
    Size,
    /// Explicit `flush_priority` / `flush_all`.
    Forced,
}

#[derive(Clone)]
struct DirectSend {
    transport: Arc<dyn Transport>,
    channel: u8,
}

struct QueueSet {
    queues: [Mutex<VecDeque<PendingMessage>>; 4],
    capacity: usize,
    policy: OverflowPolicy,
    queued: AtomicU64,
    dropped: AtomicU64,
    direct_sends: AtomicU64,
    direct_failures: AtomicU64,
}

impl QueueSet {
    fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            queues: Default::default(),
            capacity,
            policy,
            queued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            direct_sends: AtomicU64::new(0),
            direct_failures: AtomicU64::new(0),
        }
    }

    fn push(&self, message: PendingMessage) -> Result<(), BatchError> {
        let priority = message.priority;
        let mut queue = lock(&self.queues[priority.index()]);
        if self.capacity > 0 && queue.len() >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            match self.policy {
                OverflowPolicy::Reject => {
                    warn!("{:?} queue full ({}), rejecting message", priority, self.capacity);
                    return Err(BatchError::QueueFull(priority));
                }
                OverflowPolicy::DropOldest => {
                    queue.pop_front();
                    warn!("{:?} queue full ({}), dropped oldest message", priority, self.capacity);
                }
            }
        }
        queue.push_back(message);
        self.queued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn take(&self, priority: Priority) -> VecDeque<PendingMessage> {
        std::mem::take(&mut *lock(&self.queues[priority.index()]))
    }

    fn len(&self, priority: Priority) -> usize {
        lock(&self.queues[priority.index()]).len()
    }
}

/// Thread-safe enqueue handle of a [`MessageBatcher`].
#[derive(Clone)]
pub struct BatchQueue {
    shared: Arc<QueueSet>,
    clock: Arc<dyn Clock>,
    direct: Option<DirectSend>,
}

impl BatchQueue {
    /// Serialize `message` with postcard and enqueue it.
    pub fn queue_message<T: Serialize + ?Sized>(
        &self,
        destination: ConnectionId,
        delivery: DeliveryMethod,
        message_type: MessageType,
        message: &T,
        priority: Priority,
    ) -> Result<(), BatchError> {
        let payload = encode_frame("message payload", message)?;
        self.queue_raw_message(destination, delivery, message_type, payload, priority)
    }

    /// Enqueue an already serialized payload.
    ///
    /// When batching is disabled the payload is sent immediately instead,
    /// unless the transport is not ready yet; then it waits for the next
    /// tick like a batched message.
    pub fn queue_raw_message(
        &self,
        destination: ConnectionId,
        delivery: DeliveryMethod,
        message_type: MessageType,
        payload: Vec<u8>,
        priority: Priority,
    ) -> Result<(), BatchError> {
        if let Some(direct) = self.direct.as_ref().filter(|d| d.transport.is_ready()) {
            let delivery = priority.default_delivery().max(delivery);
            return match direct
                .transport
                .send(destination, direct.channel, delivery, message_type, &payload)
            {
                Ok(()) => {
                    self.shared.direct_sends.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                Err(err) => {
                    self.shared.direct_failures.fetch_add(1, Ordering::Relaxed);
                    Err(err.into())
                }
            };
        }

        trace!(
            "queue {} for {} at {:?} ({} bytes)",
            message_type,
            destination,
            priority,
            payload.len()
        );
        self.shared.push(PendingMessage {
            destination,
            delivery,
            message_type,
            payload,
            priority,
            enqueued_at: self.clock.now(),
        })
    }

    /// Messages waiting in the shared queue of `priority`.
    pub fn len(&self, priority: Priority) -> usize {
        self.shared.len(priority)
    }

    /// Whether every shared queue is empty.
    pub fn is_empty(&self) -> bool {
        Priority::ALL.iter().all(|p| self.shared.len(*p) == 0)
    }
}

#[derive(Debug)]
struct Bucket {
    buffered: Vec<PendingMessage>,
    bytes: usize,
    state: BucketState,
    last_trigger: Option<FlushTrigger>,
}

impl Default for Bucket {
    fn default() -> Self {
        Self {
            buffered: Vec::new(),
            bytes: 0,
            state: BucketState::Idle,
            last_trigger: None,
        }
    }
}

/// Per-priority message batcher.
pub struct MessageBatcher {
    config: BatchingConfig,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    queue: BatchQueue,
    buckets: [Bucket; 4],
    next_batch_id: u32,
    stats: MessageBatchStats,
}

impl MessageBatcher {
    /// Create a batcher sending through `transport`.
    pub fn new(
        config: BatchingConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let config = config.normalized();
        let direct = (!config.enabled).then(|| DirectSend {
            transport: Arc::clone(&transport),
            channel: config.channel,
        });
        let queue = BatchQueue {
            shared: Arc::new(QueueSet::new(config.queue_capacity, config.overflow_policy)),
            clock: Arc::clone(&clock),
            direct,
        };
        Self {
            config,
            transport,
            clock,
            queue,
            buckets: Default::default(),
            next_batch_id: 1,
            stats: MessageBatchStats::default(),
        }
    }

    /// Enqueue handle usable from other threads.
    pub fn queue(&self) -> BatchQueue {
        self.queue.clone()
    }

    /// Active configuration.
    pub fn config(&self) -> &BatchingConfig {
        &self.config
    }

    /// Serialize and enqueue a message.
    pub fn queue_message<T: Serialize + ?Sized>(
        &self,
        destination: ConnectionId,
        delivery: DeliveryMethod,
        message_type: MessageType,
        message: &T,
        priority: Priority,
    ) -> Result<(), BatchError> {
        self.queue
            .queue_message(destination, delivery, message_type, message, priority)
    }

    /// Enqueue an already serialized payload.
    pub fn queue_raw_message(
        &self,
        destination: ConnectionId,
        delivery: DeliveryMethod,
        message_type: MessageType,
        payload: Vec<u8>,
        priority: Priority,
    ) -> Result<(), BatchError> {
        self.queue
            .queue_raw_message(destination, delivery, message_type, payload, priority)
    }

    /// Drain shared queues and flush every bucket whose trigger is met.
    ///
    /// Does nothing while the transport is not ready; messages stay queued.
    /// Returns the number of envelopes sent.
    #[instrument(skip(self), level = "trace")]
    pub fn tick(&mut self) -> usize {
        if !self.transport.is_ready() {
            trace!("transport not ready, deferring flush");
            return 0;
        }
        let now = self.clock.now();
        let mut envelopes = 0;
        for priority in Priority::ALL {
            self.drain_queue(priority);
            let trigger = if self.config.enabled {
                self.trigger(priority, now)
            } else {
                Some(FlushTrigger::Forced)
            };
            if let Some(trigger) = trigger {
                envelopes += self.flush_bucket(priority, trigger);
            }
        }
        envelopes
    }

    /// Flush one priority regardless of timing.
    pub fn flush_priority(&mut self, priority: Priority) -> usize {
        if !self.transport.is_ready() {
            debug!("transport not ready, skipping forced {:?} flush", priority);
            return 0;
        }
        self.drain_queue(priority);
        self.flush_bucket(priority, FlushTrigger::Forced)
    }

    /// Flush every priority regardless of timing.
    pub fn flush_all(&mut self) -> usize {
        Priority::ALL
            .into_iter()
            .map(|priority| self.flush_priority(priority))
            .sum()
    }

    /// Current state of a priority bucket.
    pub fn bucket_state(&self, priority: Priority) -> BucketState {
        self.buckets[priority.index()].state
    }

    /// Trigger of the most recent flush of `priority`.
    pub fn last_flush_trigger(&self, priority: Priority) -> Option<FlushTrigger> {
        self.buckets[priority.index()].last_trigger
    }

    /// Messages of `priority` not yet sent (queued plus buffered).
    pub fn pending(&self, priority: Priority) -> usize {
        self.queue.len(priority) + self.buckets[priority.index()].buffered.len()
    }

    /// Snapshot of the statistics.
    pub fn stats(&self) -> MessageBatchStats {
        let shared = &self.queue.shared;
        let mut stats = self.stats.clone();
        stats.messages_queued = shared.queued.load(Ordering::Relaxed);
        stats.messages_dropped += shared.dropped.load(Ordering::Relaxed);
        stats.direct_sends = shared.direct_sends.load(Ordering::Relaxed);
        stats.send_failures += shared.direct_failures.load(Ordering::Relaxed);
        stats
    }

    #[cfg(test)]
    fn set_next_batch_id(&mut self, id: u32) {
        self.next_batch_id = id;
    }

    /// Zero all statistics.
    pub fn reset_stats(&mut self) {
        let shared = &self.queue.shared;
        shared.queued.store(0, Ordering::Relaxed);
        shared.dropped.store(0, Ordering::Relaxed);
        shared.direct_sends.store(0, Ordering::Relaxed);
        shared.direct_failures.store(0, Ordering::Relaxed);
        self.stats.reset();
    }

    fn drain_queue(&mut self, priority: Priority) {
        let drained = self.queue.shared.take(priority);
        if drained.is_empty() {
            return;
        }
        let bucket = &mut self.buckets[priority.index()];
        for message in drained {
            bucket.bytes += message.estimated_size();
            bucket.buffered.push(message);
        }
        bucket.state = BucketState::Accumulating;
    }

    fn trigger(&self, priority: Priority, now: Duration) -> Option<FlushTrigger> {
        let bucket = &self.buckets[priority.index()];
        let oldest = bucket.buffered.first()?;
        if bucket.buffered.len() >= self.config.max_messages_per_batch {
            Some(FlushTrigger::Count)
        } else if bucket.bytes >= self.config.max_batch_bytes {
            Some(FlushTrigger::Size)
        } else if now.saturating_sub(oldest.enqueued_at) >= self.config.flush_interval(priority) {
            Some(FlushTrigger::Age)
        } else {
            None
        }
    }

    fn flush_bucket(&mut self, priority: Priority, trigger: FlushTrigger) -> usize {
        let bucket = &mut self.buckets[priority.index()];
        if bucket.buffered.is_empty() {
            return 0;
        }
        bucket.state = BucketState::Flushing;
        bucket.last_trigger = Some(trigger);
        bucket.bytes = 0;
        let messages = std::mem::take(&mut bucket.buffered);
        debug!(
            "flushing {} {:?} messages ({:?})",
            messages.len(),
            priority,
            trigger
        );

        if !self.config.enabled {
            self.send_deferred(messages);
            self.buckets[priority.index()].state = BucketState::Idle;
            return 0;
        }

        let mut envelopes = 0;
        for (destination, group) in group_by_destination(messages) {
            for chunk in split_group(
                group,
                self.config.max_messages_per_batch,
                self.config.max_batch_bytes,
            ) {
                self.send_envelope(priority, destination, chunk);
                envelopes += 1;
            }
        }

        self.buckets[priority.index()].state = BucketState::Idle;
        envelopes
    }

    fn send_envelope(
        &mut self,
        priority: Priority,
        destination: ConnectionId,
        chunk: Vec<PendingMessage>,
    ) {
        let batch_id = self.next_batch_id;
        self.next_batch_id = self.next_batch_id.wrapping_add(1);

        let delivery = chunk
            .iter()
            .fold(priority.default_delivery(), |strongest, m| strongest.max(m.delivery));
        let naive_bytes: usize = chunk
            .iter()
            .map(|m| PER_SEND_OVERHEAD + m.payload.len())
            .sum();
        let requested: Vec<DeliveryMethod> = chunk.iter().map(|m| m.delivery).collect();

        let mut envelope = BatchedMessage::new(batch_id, self.clock.now().as_secs_f32());
        for message in chunk {
            envelope.push(message.message_type, message.payload, priority);
        }

        let bytes = match envelope.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("batch {} failed to encode: {}", batch_id, err);
                self.stats.send_failures += 1;
                self.send_unbatched(priority, destination, envelope.entries, &requested);
                return;
            }
        };

        match self.transport.send(
            destination,
            self.config.channel,
            delivery,
            MessageType::BATCHED_MESSAGE,
            &bytes,
        ) {
            Ok(()) => {
                trace!(
                    "batch {} -> {}: {} entries, {} bytes, {:?}",
                    batch_id,
                    destination,
                    envelope.len(),
                    bytes.len(),
                    delivery
                );
                self.stats
                    .record_batch(priority, envelope.len(), bytes.len(), naive_bytes);
            }
            Err(err) => {
                warn!(
                    "batch {} to {} failed ({}), sending {} messages unbatched",
                    batch_id,
                    destination,
                    err,
                    envelope.len()
                );
                self.stats.send_failures += 1;
                self.send_unbatched(priority, destination, envelope.entries, &requested);
            }
        }
    }

    /// Send messages held back while batching is disabled and the transport
    /// was not ready.
    fn send_deferred(&mut self, messages: Vec<PendingMessage>) {
        let shared = &self.queue.shared;
        for message in messages {
            let delivery = message.priority.default_delivery().max(message.delivery);
            match self.transport.send(
                message.destination,
                self.config.channel,
                delivery,
                message.message_type,
                &message.payload,
            ) {
                Ok(()) => {
                    shared.direct_sends.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    warn!(
                        "dropping deferred {} to {}: {}",
                        message.message_type, message.destination, err
                    );
                    shared.direct_failures.fetch_add(1, Ordering::Relaxed);
                    self.stats.messages_dropped += 1;
                }
            }
        }
    }

    fn send_unbatched(
        &mut self,
        priority: Priority,
        destination: ConnectionId,
        entries: Vec<BatchEntry>,
        requested: &[DeliveryMethod],
    ) {
        for (entry, requested) in entries.into_iter().zip(requested) {
            let delivery = priority.default_delivery().max(*requested);
            match self.transport.send(
                destination,
                self.config.channel,
                delivery,
                entry.message_type,
                &entry.payload,
            ) {
                Ok(()) => self.stats.fallback_messages += 1,
                Err(err) => {
                    warn!(
                        "dropping {} to {}: unbatched send failed: {}",
                        entry.message_type, destination, err
                    );
                    self.stats.send_failures += 1;
                    self.stats.messages_dropped += 1;
                }
            }
        }
    }
}

/// Split messages per destination, keeping first-seen destination order and
/// enqueue order inside each group.
fn group_by_destination(
    messages: Vec<PendingMessage>,
) -> Vec<(ConnectionId, Vec<PendingMessage>)> {
    let mut index: HashMap<ConnectionId, usize> = HashMap::new();
    let mut groups: Vec<(ConnectionId, Vec<PendingMessage>)> = Vec::new();
    for message in messages {
        let slot = *index.entry(message.destination).or_insert_with(|| {
            groups.push((message.destination, Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(message);
    }
    groups
}

/// Cut a destination group into consecutive envelopes within the limits.
fn split_group(
    group: Vec<PendingMessage>,
    max_messages: usize,
    max_bytes: usize,
) -> Vec<Vec<PendingMessage>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut current_bytes = ENVELOPE_HEADER_ESTIMATE;
    for message in group {
        let size = message.estimated_size();
        if !current.is_empty()
            && (current.len() >= max_messages || current_bytes + size > max_bytes)
        {
            chunks.push(std::mem::take(&mut current));
            current_bytes = ENVELOPE_HEADER_ESTIMATE;
        }
        current_bytes += size;
        current.push(message);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::MemoryTransport;

    fn batcher_with(config: BatchingConfig) -> (MessageBatcher, MemoryTransport, ManualClock) {
        let transport = MemoryTransport::new();
        let clock = ManualClock::new();
        let batcher = MessageBatcher::new(
            config,
            Arc::new(transport.clone()),
            Arc::new(clock.clone()),
        );
        (batcher, transport, clock)
    }

    fn batcher() -> (MessageBatcher, MemoryTransport, ManualClock) {
        batcher_with(BatchingConfig::default())
    }

    fn decode_all(transport: &MemoryTransport) -> Vec<(ConnectionId, BatchedMessage)> {
        transport
            .drain()
            .into_iter()
            .map(|sent| {
                assert_eq!(sent.message_type, MessageType::BATCHED_MESSAGE);
                (sent.destination, BatchedMessage::decode(&sent.payload).unwrap())
            })
            .collect()
    }

    fn raw(batcher: &MessageBatcher, dest: u64, payload: Vec<u8>, priority: Priority) {
        batcher
            .queue_raw_message(
                ConnectionId(dest),
                DeliveryMethod::Unreliable,
                MessageType(5),
                payload,
                priority,
            )
            .unwrap();
    }

    #[test]
    fn critical_messages_flush_together_after_interval() {
        let (mut batcher, transport, clock) = batcher();
        raw(&batcher, 1, vec![1], Priority::Critical);
        clock.set(Duration::from_millis(10));
        raw(&batcher, 1, vec![2], Priority::Critical);
        clock.set(Duration::from_millis(20));

        assert_eq!(batcher.tick(), 1);
        let sent = decode_all(&transport);
        assert_eq!(sent.len(), 1);
        let (destination, envelope) = &sent[0];
        assert_eq!(*destination, ConnectionId(1));
        assert_eq!(envelope.len(), 2);
        assert!(envelope.entries.iter().all(|e| e.message_type == MessageType(5)));
        assert_eq!(envelope.entries[0].payload, vec![1]);
        assert_eq!(envelope.entries[1].payload, vec![2]);
        assert_eq!(batcher.last_flush_trigger(Priority::Critical), Some(FlushTrigger::Age));
    }

    #[test]
    fn does_not_flush_before_any_trigger() {
        let (mut batcher, transport, clock) = batcher();
        raw(&batcher, 1, vec![1], Priority::Low);
        clock.advance(Duration::from_millis(499));
        assert_eq!(batcher.tick(), 0);
        assert!(transport.sent().is_empty());
        assert_eq!(batcher.bucket_state(Priority::Low), BucketState::Accumulating);
        assert_eq!(batcher.pending(Priority::Low), 1);

        clock.advance(Duration::from_millis(1));
        assert_eq!(batcher.tick(), 1);
        assert_eq!(batcher.bucket_state(Priority::Low), BucketState::Idle);
        assert_eq!(batcher.pending(Priority::Low), 0);
    }

    #[test]
    fn count_trigger_flushes_without_waiting() {
        let config = BatchingConfig {
            max_messages_per_batch: 3,
            ..Default::default()
        };
        let (mut batcher, transport, _clock) = batcher_with(config);
        for i in 0..3 {
            raw(&batcher, 1, vec![i], Priority::Low);
        }
        assert_eq!(batcher.tick(), 1);
        assert_eq!(batcher.last_flush_trigger(Priority::Low), Some(FlushTrigger::Count));
        assert_eq!(decode_all(&transport)[0].1.len(), 3);
    }

    #[test]
    fn size_trigger_splits_envelopes_in_order() {
        let config = BatchingConfig {
            max_batch_bytes: 300,
            ..Default::default()
        };
        let (mut batcher, transport, _clock) = batcher_with(config);
        for i in 0..4u8 {
            raw(&batcher, 1, vec![i; 100], Priority::Medium);
        }
        assert_eq!(batcher.tick(), 2);
        assert_eq!(batcher.last_flush_trigger(Priority::Medium), Some(FlushTrigger::Size));

        let sent = decode_all(&transport);
        let firsts: Vec<u8> = sent
            .iter()
            .flat_map(|(_, e)| e.entries.iter().map(|entry| entry.payload[0]))
            .collect();
        assert_eq!(firsts, vec![0, 1, 2, 3]);
        for (_, envelope) in &sent {
            assert!(envelope.encode().unwrap().len() <= 300);
        }
    }

    #[test]
    fn forced_flush_ignores_timing() {
        let (mut batcher, transport, _clock) = batcher();
        raw(&batcher, 1, vec![1], Priority::Low);
        raw(&batcher, 1, vec![2], Priority::High);
        assert_eq!(batcher.flush_priority(Priority::Low), 1);
        assert_eq!(batcher.last_flush_trigger(Priority::Low), Some(FlushTrigger::Forced));
        assert_eq!(batcher.pending(Priority::High), 1);
        assert_eq!(batcher.flush_all(), 1);
        assert_eq!(transport.sent().len(), 2);
    }

    #[test]
    fn destinations_never_share_an_envelope() {
        let (mut batcher, transport, _clock) = batcher();
        raw(&batcher, 1, vec![1], Priority::High);
        raw(&batcher, 2, vec![2], Priority::High);
        raw(&batcher, 1, vec![3], Priority::High);
        assert_eq!(batcher.flush_all(), 2);

        let sent = decode_all(&transport);
        assert_eq!(sent[0].0, ConnectionId(1));
        let payloads: Vec<_> = sent[0].1.entries.iter().map(|e| e.payload[0]).collect();
        assert_eq!(payloads, vec![1, 3]);
        assert_eq!(sent[1].0, ConnectionId(2));
        assert_eq!(sent[1].1.len(), 1);
    }

    #[test]
    fn envelope_delivery_is_strongest_requested() {
        let (mut batcher, transport, _clock) = batcher();
        batcher
            .queue_raw_message(
                ConnectionId(1),
                DeliveryMethod::Unreliable,
                MessageType(1),
                vec![],
                Priority::Low,
            )
            .unwrap();
        batcher
            .queue_raw_message(
                ConnectionId(1),
                DeliveryMethod::ReliableUnordered,
                MessageType(1),
                vec![],
                Priority::Low,
            )
            .unwrap();
        batcher
            .queue_raw_message(
                ConnectionId(2),
                DeliveryMethod::Unreliable,
                MessageType(1),
                vec![],
                Priority::Critical,
            )
            .unwrap();
        batcher.flush_all();

        let sent = transport.drain();
        assert_eq!(sent[0].delivery, DeliveryMethod::ReliableOrdered);
        assert_eq!(sent[1].delivery, DeliveryMethod::ReliableUnordered);
    }

    #[test]
    fn batch_ids_start_at_one_and_increment() {
        let (mut batcher, transport, _clock) = batcher();
        raw(&batcher, 1, vec![1], Priority::Low);
        raw(&batcher, 2, vec![1], Priority::Low);
        batcher.flush_all();
        let ids: Vec<u32> = decode_all(&transport).iter().map(|(_, e)| e.batch_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn batch_ids_wrap_around() {
        let (mut batcher, transport, _clock) = batcher();
        batcher.set_next_batch_id(u32::MAX);
        raw(&batcher, 1, vec![1], Priority::Low);
        raw(&batcher, 2, vec![1], Priority::Low);
        raw(&batcher, 3, vec![1], Priority::Low);
        batcher.flush_all();
        let ids: Vec<u32> = decode_all(&transport).iter().map(|(_, e)| e.batch_id).collect();
        assert_eq!(ids, vec![u32::MAX, 0, 1]);
    }

    #[test]
    fn not_ready_transport_keeps_messages_queued() {
        let (mut batcher, transport, clock) = batcher();
        transport.set_ready(false);
        raw(&batcher, 1, vec![1], Priority::Critical);
        clock.advance(Duration::from_secs(1));
        assert_eq!(batcher.tick(), 0);
        assert_eq!(batcher.flush_all(), 0);
        assert_eq!(batcher.pending(Priority::Critical), 1);

        transport.set_ready(true);
        assert_eq!(batcher.tick(), 1);
    }

    #[test]
    fn failed_envelope_falls_back_to_unbatched_sends() {
        let (mut batcher, transport, _clock) = batcher();
        transport.fail_message_type(MessageType::BATCHED_MESSAGE);
        raw(&batcher, 1, vec![1], Priority::High);
        raw(&batcher, 1, vec![2], Priority::High);
        batcher.flush_all();

        let sent = transport.drain();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|s| s.message_type == MessageType(5)));
        assert!(sent.iter().all(|s| s.delivery == DeliveryMethod::ReliableOrdered));
        assert_eq!(sent[0].payload, vec![1]);

        let stats = batcher.stats();
        assert_eq!(stats.send_failures, 1);
        assert_eq!(stats.fallback_messages, 2);
        assert_eq!(stats.batches_sent, 0);
    }

    #[test]
    fn overflow_drop_oldest_and_reject() {
        let config = BatchingConfig {
            queue_capacity: 2,
            ..Default::default()
        };
        let (mut batcher, transport, _clock) = batcher_with(config);
        for i in 0..3 {
            raw(&batcher, 1, vec![i], Priority::Low);
        }
        batcher.flush_all();
        let payloads: Vec<_> = decode_all(&transport)[0]
            .1
            .entries
            .iter()
            .map(|e| e.payload[0])
            .collect();
        assert_eq!(payloads, vec![1, 2]);
        assert_eq!(batcher.stats().messages_dropped, 1);

        let config = BatchingConfig {
            queue_capacity: 1,
            overflow_policy: OverflowPolicy::Reject,
            ..Default::default()
        };
        let (batcher, _transport, _clock) = batcher_with(config);
        raw(&batcher, 1, vec![0], Priority::Low);
        let result = batcher.queue_raw_message(
            ConnectionId(1),
            DeliveryMethod::Unreliable,
            MessageType(5),
            vec![1],
            Priority::Low,
        );
        assert!(matches!(result, Err(BatchError::QueueFull(Priority::Low))));
    }

    #[test]
    fn disabled_batching_sends_directly() {
        let config = BatchingConfig {
            enabled: false,
            ..Default::default()
        };
        let (batcher, transport, _clock) = batcher_with(config);
        batcher
            .queue_message(
                ConnectionId(3),
                DeliveryMethod::Unreliable,
                MessageType(42),
                &(7u32, "hi"),
                Priority::Medium,
            )
            .unwrap();
        let sent = transport.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message_type, MessageType(42));
        assert_eq!(batcher.stats().direct_sends, 1);
    }

    #[test]
    fn disabled_batching_waits_for_ready_transport() {
        let config = BatchingConfig {
            enabled: false,
            ..Default::default()
        };
        let (mut batcher, transport, _clock) = batcher_with(config);
        transport.set_ready(false);
        batcher
            .queue_raw_message(
                ConnectionId(3),
                DeliveryMethod::Unreliable,
                MessageType(42),
                vec![1, 2],
                Priority::Critical,
            )
            .unwrap();
        assert!(transport.sent().is_empty());
        assert_eq!(batcher.tick(), 0);
        assert_eq!(batcher.pending(Priority::Critical), 1);

        transport.set_ready(true);
        batcher.tick();
        let sent = transport.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message_type, MessageType(42));
        assert_eq!(sent[0].delivery, DeliveryMethod::ReliableOrdered);
        assert_eq!(sent[0].payload, vec![1, 2]);
        assert_eq!(batcher.pending(Priority::Critical), 0);
        let stats = batcher.stats();
        assert_eq!(stats.direct_sends, 1);
        assert_eq!(stats.batches_sent, 0);
    }

    #[test]
    fn stats_track_bandwidth_and_reset() {
        let (mut batcher, _transport, _clock) = batcher();
        for i in 0..10 {
            raw(&batcher, 1, vec![i; 20], Priority::Medium);
        }
        batcher.flush_all();
        let stats = batcher.stats();
        assert_eq!(stats.messages_queued, 10);
        assert_eq!(stats.messages_batched, 10);
        assert_eq!(stats.batches_sent, 1);
        assert!(stats.bandwidth_saved > 0);
        assert_eq!(stats.priority(Priority::Medium).messages, 10);

        batcher.reset_stats();
        assert_eq!(batcher.stats(), MessageBatchStats::default());
    }

    #[test]
    fn queue_handle_enqueues_from_other_threads() {
        let (mut batcher, transport, _clock) = batcher();
        let handles: Vec<_> = (0..4u8)
            .map(|t| {
                let queue = batcher.queue();
                std::thread::spawn(move || {
                    for i in 0..25u8 {
                        queue
                            .queue_raw_message(
                                ConnectionId(t as u64),
                                DeliveryMethod::Unreliable,
                                MessageType(1),
                                vec![t, i],
                                Priority::Low,
                            )
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        batcher.flush_all();

        for (destination, envelope) in decode_all(&transport) {
            let order: Vec<u8> = envelope.entries.iter().map(|e| e.payload[1]).collect();
            let mut sorted = order.clone();
            sorted.sort_unstable();
            assert_eq!(order, sorted, "order broken for {destination}");
        }
        assert_eq!(batcher.stats().messages_batched, 100);
    }
}
