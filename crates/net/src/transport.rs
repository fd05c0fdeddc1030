//! The send primitive the batching layer is built on.

use crate::error::TransportError;
use crate::priority::{ConnectionId, DeliveryMethod, MessageType};

/// Connection-oriented message transport.
///
/// Implementations own handshakes, encryption and retransmission; the batching
/// layer only hands them framed payloads.
pub trait Transport: Send + Sync {
    /// Bring up internal state before the first send.
    ///
    /// Called by [`crate::BatchingLayer::start`]; the default does nothing.
    fn ensure_initialized(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Whether sends can currently succeed.
    fn is_ready(&self) -> bool;

    /// Send one message to `destination`.
    fn send(
        &self,
        destination: ConnectionId,
        channel: u8,
        delivery: DeliveryMethod,
        message_type: MessageType,
        payload: &[u8],
    ) -> Result<(), TransportError>;
}

/// Message received from a peer, ready for [`crate::BatchDispatcher::handle_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Peer that sent the message.
    pub source: ConnectionId,
    /// Transport channel it arrived on.
    pub channel: u8,
    /// Message type code.
    pub message_type: MessageType,
    /// Raw payload.
    pub payload: Vec<u8>,
}
