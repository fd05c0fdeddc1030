//! Receiver side: unpack envelopes and route entries by message type.

use crate::envelope::{BatchedMessage, WireError};
use crate::priority::{ConnectionId, MessageType};
use crate::stats::BatchProcessingStats;
use crate::transport::InboundMessage;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Callback receiving `(source, payload)` for one message type.
pub type MessageHandler = Box<dyn FnMut(ConnectionId, &[u8]) -> anyhow::Result<()> + Send>;

/// Routing table from message type to handler.
///
/// A failing or panicking handler never stops the rest of an envelope.
#[derive(Default)]
pub struct BatchDispatcher {
    handlers: HashMap<MessageType, MessageHandler>,
    stats: BatchProcessingStats,
}

impl BatchDispatcher {
    /// Create a dispatcher with no handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `message_type`, replacing any previous one.
    ///
    /// Returns whether a handler was replaced.
    pub fn register<F>(&mut self, message_type: MessageType, handler: F) -> bool
    where
        F: FnMut(ConnectionId, &[u8]) -> anyhow::Result<()> + Send + 'static,
    {
        if message_type == MessageType::BATCHED_MESSAGE {
            warn!("ignoring handler for {}: envelopes are unpacked internally", message_type);
            return false;
        }
        self.handlers
            .insert(message_type, Box::new(handler))
            .is_some()
    }

    /// Remove the handler of `message_type`.
    pub fn unregister(&mut self, message_type: MessageType) -> bool {
        self.handlers.remove(&message_type).is_some()
    }

    /// Whether `message_type` has a handler.
    pub fn is_registered(&self, message_type: MessageType) -> bool {
        self.handlers.contains_key(&message_type)
    }

    /// Single entry point for inbound traffic.
    ///
    /// Envelopes are unpacked; any other type (including messages the sender
    /// fell back to sending unbatched) goes straight to its handler.
    pub fn handle_message(&mut self, source: ConnectionId, message_type: MessageType, payload: &[u8]) {
        if message_type == MessageType::BATCHED_MESSAGE {
            // Already logged and counted.
            let _ = self.handle_batched_message(source, payload);
        } else {
            self.dispatch(source, message_type, payload);
        }
    }

    /// Process an inbound message from a transport.
    pub fn handle_inbound(&mut self, message: &InboundMessage) {
        self.handle_message(message.source, message.message_type, &message.payload);
    }

    /// Decode an envelope and dispatch its entries in wire order.
    ///
    /// A malformed envelope is rejected whole. Returns the number of entries
    /// a handler accepted.
    pub fn handle_batched_message(
        &mut self,
        source: ConnectionId,
        bytes: &[u8],
    ) -> Result<usize, WireError> {
        let started = Instant::now();
        let envelope = match BatchedMessage::decode(bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("malformed batch from {} ({} bytes): {}", source, bytes.len(), err);
                self.stats.malformed_batches += 1;
                return Err(err);
            }
        };

        trace!(
            "batch {} from {}: {} entries",
            envelope.batch_id,
            source,
            envelope.len()
        );
        let mut processed = 0;
        for entry in &envelope.entries {
            if entry.message_type == MessageType::BATCHED_MESSAGE {
                warn!("skipping nested envelope in batch {}", envelope.batch_id);
                self.stats.unknown_messages += 1;
                continue;
            }
            if self.dispatch(source, entry.message_type, &entry.payload) {
                processed += 1;
            }
        }

        self.stats.record_batch(envelope.len(), started.elapsed());
        Ok(processed)
    }

    /// Process everything currently waiting on `inbound` without blocking.
    ///
    /// Returns the number of messages taken from the channel.
    pub fn drain(&mut self, inbound: &mut mpsc::UnboundedReceiver<InboundMessage>) -> usize {
        let mut count = 0;
        while let Ok(message) = inbound.try_recv() {
            self.handle_inbound(&message);
            count += 1;
        }
        count
    }

    /// Processing statistics.
    pub fn stats(&self) -> &BatchProcessingStats {
        &self.stats
    }

    /// Zero the processing statistics.
    pub fn reset_stats(&mut self) {
        self.stats.reset();
    }

    fn dispatch(&mut self, source: ConnectionId, message_type: MessageType, payload: &[u8]) -> bool {
        let Some(handler) = self.handlers.get_mut(&message_type) else {
            debug!("no handler for {} from {}", message_type, source);
            self.stats.unknown_messages += 1;
            return false;
        };

        match catch_unwind(AssertUnwindSafe(|| handler(source, payload))) {
            Ok(Ok(())) => {
                self.stats.messages_processed += 1;
                true
            }
            Ok(Err(err)) => {
                warn!("handler for {} failed: {:#}", message_type, err);
                self.stats.handler_failures += 1;
                false
            }
            Err(_) => {
                warn!("handler for {} panicked", message_type);
                self.stats.handler_failures += 1;
                false
            }
        }
    }
}
