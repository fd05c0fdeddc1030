//! In-process transport that records every send.
//!
//! Used when sender and receiver run in the same process: tests, the headless
//! profiler, and single-process hosts that loop messages back to themselves.

use crate::error::TransportError;
use crate::lock;
use crate::priority::{ConnectionId, DeliveryMethod, MessageType};
use crate::transport::{InboundMessage, Transport};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::trace;

/// A message accepted by a [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    /// Destination connection.
    pub destination: ConnectionId,
    /// Channel passed to `send`.
    pub channel: u8,
    /// Delivery method passed to `send`.
    pub delivery: DeliveryMethod,
    /// Message type code.
    pub message_type: MessageType,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl SentMessage {
    /// View this send as the receiver sees it.
    pub fn into_inbound(self, source: ConnectionId) -> InboundMessage {
        InboundMessage {
            source,
            channel: self.channel,
            message_type: self.message_type,
            payload: self.payload,
        }
    }
}

#[derive(Default)]
struct Shared {
    ready: AtomicBool,
    initialized: AtomicBool,
    sends: AtomicU64,
    sent: Mutex<VecDeque<SentMessage>>,
    failing_types: Mutex<HashSet<MessageType>>,
    connections: Mutex<Option<HashSet<ConnectionId>>>,
}

/// Recording transport; clones share the same log and switches.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

impl MemoryTransport {
    /// A ready transport accepting any destination.
    pub fn new() -> Self {
        let transport = Self::default();
        transport.set_ready(true);
        transport
    }

    /// A transport that reports not ready until [`Self::set_ready`].
    pub fn not_ready() -> Self {
        Self::default()
    }

    /// Toggle readiness.
    pub fn set_ready(&self, ready: bool) {
        self.shared.ready.store(ready, Ordering::Release);
    }

    /// Whether [`Transport::ensure_initialized`] has been called.
    pub fn is_initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::Acquire)
    }

    /// Restrict sends to known connections; others fail with `UnknownDestination`.
    pub fn connect(&self, connection: ConnectionId) {
        lock(&self.shared.connections)
            .get_or_insert_with(HashSet::new)
            .insert(connection);
    }

    /// Forget `connection`; later sends to it fail with `UnknownDestination`.
    pub fn disconnect(&self, connection: ConnectionId) {
        if let Some(connections) = lock(&self.shared.connections).as_mut() {
            connections.remove(&connection);
        }
    }

    /// Make every send of `message_type` fail.
    pub fn fail_message_type(&self, message_type: MessageType) {
        lock(&self.shared.failing_types).insert(message_type);
    }

    /// Stop failing sends of `message_type`.
    pub fn clear_failure(&self, message_type: MessageType) {
        lock(&self.shared.failing_types).remove(&message_type);
    }

    /// Copy of the send log.
    pub fn sent(&self) -> Vec<SentMessage> {
        lock(&self.shared.sent).iter().cloned().collect()
    }

    /// Take and clear the send log.
    pub fn drain(&self) -> Vec<SentMessage> {
        lock(&self.shared.sent).drain(..).collect()
    }

    /// Successful sends since creation.
    pub fn send_count(&self) -> u64 {
        self.shared.sends.load(Ordering::Relaxed)
    }
}

impl Transport for MemoryTransport {
    fn ensure_initialized(&self) -> Result<(), TransportError> {
        self.shared.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::Acquire)
    }

    fn send(
        &self,
        destination: ConnectionId,
        channel: u8,
        delivery: DeliveryMethod,
        message_type: MessageType,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        if !self.is_ready() {
            return Err(TransportError::NotReady);
        }
        if let Some(connections) = lock(&self.shared.connections).as_ref() {
            if !connections.contains(&destination) {
                return Err(TransportError::UnknownDestination(destination));
            }
        }
        if lock(&self.shared.failing_types).contains(&message_type) {
            return Err(TransportError::Send(format!(
                "injected failure for {message_type}"
            )));
        }

        trace!(
            "{} <- {} bytes of {} ({:?})",
            destination,
            payload.len(),
            message_type,
            delivery
        );
        lock(&self.shared.sent).push_back(SentMessage {
            destination,
            channel,
            delivery,
            message_type,
            payload: payload.to_vec(),
        });
        self.shared.sends.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_drains_sends() {
        let transport = MemoryTransport::new();
        transport
            .send(
                ConnectionId(1),
                2,
                DeliveryMethod::ReliableOrdered,
                MessageType(5),
                &[1, 2],
            )
            .unwrap();
        assert_eq!(transport.sent().len(), 1);
        let drained = transport.drain();
        assert_eq!(drained[0].payload, vec![1, 2]);
        assert_eq!(drained[0].channel, 2);
        assert!(transport.sent().is_empty());
        assert_eq!(transport.send_count(), 1);
    }

    #[test]
    fn not_ready_rejects() {
        let transport = MemoryTransport::not_ready();
        let result = transport.send(
            ConnectionId(1),
            0,
            DeliveryMethod::Unreliable,
            MessageType(1),
            &[],
        );
        assert!(matches!(result, Err(TransportError::NotReady)));
    }

    #[test]
    fn injected_failures_and_unknown_destinations() {
        let transport = MemoryTransport::new();
        transport.fail_message_type(MessageType(7));
        assert!(transport
            .send(ConnectionId(1), 0, DeliveryMethod::Unreliable, MessageType(7), &[])
            .is_err());
        transport.clear_failure(MessageType(7));

        transport.connect(ConnectionId(2));
        assert!(matches!(
            transport.send(ConnectionId(1), 0, DeliveryMethod::Unreliable, MessageType(7), &[]),
            Err(TransportError::UnknownDestination(ConnectionId(1)))
        ));
        assert!(transport
            .send(ConnectionId(2), 0, DeliveryMethod::Unreliable, MessageType(7), &[])
            .is_ok());
    }

    #[test]
    fn clones_share_state() {
        let transport = MemoryTransport::not_ready();
        let clone = transport.clone();
        clone.set_ready(true);
        assert!(transport.is_ready());
        clone.ensure_initialized().unwrap();
        assert!(transport.is_initialized());
    }
}
