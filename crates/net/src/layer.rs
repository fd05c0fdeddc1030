//! The batching layer as a host sees it: both batchers plus the dispatcher
//! behind one tick.

use crate::batcher::{BatchQueue, MessageBatcher};
use crate::character_state::CharacterStateBatcher;
use crate::clock::Clock;
use crate::config::BatchingConfig;
use crate::dispatch::BatchDispatcher;
use crate::error::BatchError;
use crate::priority::{ConnectionId, DeliveryMethod, MessageType, Priority};
use crate::transport::Transport;
use glam::{Quat, Vec3};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// Message batcher, character state batcher and dispatcher wired to one transport.
///
/// Construction and start are separate: [`Self::configure`] builds everything,
/// [`Self::start`] succeeds once the transport is ready. Until then messages
/// can be queued but [`Self::tick`] does nothing.
pub struct BatchingLayer {
    transport: Arc<dyn Transport>,
    messages: MessageBatcher,
    states: CharacterStateBatcher,
    dispatcher: BatchDispatcher,
    started: bool,
}

impl BatchingLayer {
    /// Build the layer without touching the transport.
    pub fn configure(
        config: BatchingConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let messages = MessageBatcher::new(config, Arc::clone(&transport), Arc::clone(&clock));
        let config = messages.config();
        let states = CharacterStateBatcher::new(
            config.character_state.clone(),
            config.channel,
            Arc::clone(&transport),
            clock,
        )
        .with_batcher(messages.queue());
        Self {
            transport,
            messages,
            states,
            dispatcher: BatchDispatcher::new(),
            started: false,
        }
    }

    /// Initialize the transport and begin flushing.
    pub fn start(&mut self) -> Result<(), BatchError> {
        if self.started {
            return Ok(());
        }
        self.transport.ensure_initialized()?;
        if !self.transport.is_ready() {
            debug!("transport not ready, batching layer not started");
            return Err(BatchError::NotReady);
        }
        self.started = true;
        info!("Batching layer started");
        Ok(())
    }

    /// Wait until `ready` reports true, then [`Self::start`].
    pub async fn start_when_ready(
        &mut self,
        mut ready: watch::Receiver<bool>,
    ) -> Result<(), BatchError> {
        ready
            .wait_for(|ready| *ready)
            .await
            .map(|_| ())
            .map_err(|_| BatchError::NotReady)?;
        self.start()
    }

    /// Whether [`Self::start`] has succeeded.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Run one frame: sample character state, then flush due buckets.
    ///
    /// Returns the number of envelopes sent.
    pub fn tick(&mut self) -> usize {
        if !self.started {
            return 0;
        }
        self.states.tick();
        self.messages.tick()
    }

    /// Flush pending character state and every priority bucket.
    pub fn flush_all(&mut self) -> usize {
        if !self.started {
            return 0;
        }
        self.states.flush();
        self.messages.flush_all()
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
        self.messages
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
        self.messages
            .queue_raw_message(destination, delivery, message_type, payload, priority)
    }

    /// Record a character state sample.
    pub fn queue_character_state_update(
        &mut self,
        entity_id: &str,
        position: Vec3,
        rotation: Quat,
        destination: ConnectionId,
    ) -> bool {
        self.states
            .queue_character_state_update(entity_id, position, rotation, destination)
    }

    /// Forget an entity that left relevance.
    pub fn clear_character_state(&mut self, entity_id: &str) -> bool {
        self.states.clear_character_state(entity_id)
    }

    /// Thread-safe enqueue handle.
    pub fn queue(&self) -> BatchQueue {
        self.messages.queue()
    }

    /// Route an inbound message through the dispatcher.
    pub fn handle_message(
        &mut self,
        source: ConnectionId,
        message_type: MessageType,
        payload: &[u8],
    ) {
        self.dispatcher.handle_message(source, message_type, payload);
    }

    /// The message batcher.
    pub fn messages(&self) -> &MessageBatcher {
        &self.messages
    }

    /// Mutable access to the message batcher.
    pub fn messages_mut(&mut self) -> &mut MessageBatcher {
        &mut self.messages
    }

    /// The character state batcher.
    pub fn character_states(&self) -> &CharacterStateBatcher {
        &self.states
    }

    /// The dispatcher.
    pub fn dispatcher(&self) -> &BatchDispatcher {
        &self.dispatcher
    }

    /// Mutable access to the dispatcher, for registering handlers.
    pub fn dispatcher_mut(&mut self) -> &mut BatchDispatcher {
        &mut self.dispatcher
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::MemoryTransport;
    use std::time::Duration;

    fn layer(transport: &MemoryTransport, clock: &ManualClock) -> BatchingLayer {
        BatchingLayer::configure(
            BatchingConfig::default(),
            Arc::new(transport.clone()),
            Arc::new(clock.clone()),
        )
    }

    #[test]
    fn tick_is_inert_until_started() {
        let transport = MemoryTransport::not_ready();
        let clock = ManualClock::new();
        let mut layer = layer(&transport, &clock);

        layer
            .queue_raw_message(
                ConnectionId(1),
                DeliveryMethod::ReliableOrdered,
                MessageType(5),
                vec![1],
                Priority::Critical,
            )
            .unwrap();
        clock.advance(Duration::from_secs(1));
        assert_eq!(layer.tick(), 0);
        assert!(matches!(layer.start(), Err(BatchError::NotReady)));
        assert!(transport.is_initialized());

        transport.set_ready(true);
        layer.start().unwrap();
        assert_eq!(layer.tick(), 1);
        assert_eq!(transport.sent().len(), 1);
    }

    #[test]
    fn character_state_rides_the_medium_bucket() {
        let transport = MemoryTransport::new();
        let clock = ManualClock::new();
        let mut layer = layer(&transport, &clock);
        layer.start().unwrap();

        layer.queue_character_state_update("a", Vec3::ONE, Quat::IDENTITY, ConnectionId(2));
        clock.advance(Duration::from_millis(100));
        // Sampling hands the batch to the Medium bucket, which is not yet due.
        assert_eq!(layer.tick(), 0);
        assert_eq!(layer.messages().pending(Priority::Medium), 1);
        clock.advance(Duration::from_millis(100));
        assert_eq!(layer.tick(), 1);
    }

    #[tokio::test]
    async fn start_when_ready_waits_for_signal() {
        let transport = MemoryTransport::not_ready();
        let clock = ManualClock::new();
        let mut layer = layer(&transport, &clock);
        let (tx, rx) = watch::channel(false);

        let ready = transport.clone();
        tokio::spawn(async move {
            ready.set_ready(true);
            tx.send(true).ok();
        });
        layer.start_when_ready(rx).await.unwrap();
        assert!(layer.is_started());
    }
}
