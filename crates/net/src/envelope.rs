//! Batched message envelope and its wire encoding.
//!
//! Frame layout (postcard):
//! `[batch_id: varint u32][timestamp: f32][entry_count: varint]`
//! followed by entries `[message_type: varint u16][payload_len: varint][payload][priority: u8]`.

use crate::priority::{MessageType, Priority};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Estimated per-send overhead paid by the transport (packet header plus message type code).
pub const PER_SEND_OVERHEAD: usize = 8;

/// Upper bound of the envelope header (batch id, timestamp, entry count).
pub const ENVELOPE_HEADER_ESTIMATE: usize = 5 + 4 + 5;

/// Encoding failures of wire structures.
#[derive(Debug, Error)]
pub enum WireError {
    /// Serialization failed.
    #[error("failed to encode {what}: {source}")]
    Encode {
        /// Structure being encoded.
        what: &'static str,
        /// Underlying codec error.
        #[source]
        source: postcard::Error,
    },
    /// Input was not a valid frame.
    #[error("failed to decode {what}: {source}")]
    Decode {
        /// Structure being decoded.
        what: &'static str,
        /// Underlying codec error.
        #[source]
        source: postcard::Error,
    },
    /// A frame decoded but left unread bytes behind.
    #[error("{what} has {remaining} trailing bytes")]
    TrailingBytes {
        /// Structure being decoded.
        what: &'static str,
        /// Number of unread bytes.
        remaining: usize,
    },
}

/// Encode any wire structure with postcard.
pub(crate) fn encode_frame<T: Serialize + ?Sized>(
    what: &'static str,
    value: &T,
) -> Result<Vec<u8>, WireError> {
    postcard::to_allocvec(value).map_err(|source| WireError::Encode { what, source })
}

/// Decode a wire structure, rejecting trailing garbage.
pub(crate) fn decode_frame<'a, T: Deserialize<'a>>(
    what: &'static str,
    bytes: &'a [u8],
) -> Result<T, WireError> {
    let (value, rest) =
        postcard::take_from_bytes(bytes).map_err(|source| WireError::Decode { what, source })?;
    if !rest.is_empty() {
        return Err(WireError::TrailingBytes {
            what,
            remaining: rest.len(),
        });
    }
    Ok(value)
}

/// One message folded into an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEntry {
    /// Code selecting the receiver's handler.
    pub message_type: MessageType,
    /// Opaque, already serialized message.
    pub payload: Vec<u8>,
    /// Priority the message was queued with.
    pub priority: Priority,
}

impl BatchEntry {
    /// Upper bound of this entry's encoded size.
    pub fn estimated_size(&self) -> usize {
        estimated_entry_size(self.payload.len())
    }
}

/// Upper bound of an entry's encoded size for a payload of `payload_len` bytes.
pub fn estimated_entry_size(payload_len: usize) -> usize {
    3 + varint_len(payload_len) + payload_len + 1
}

fn varint_len(mut value: usize) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Container bundling several messages for one transport send.
///
/// Entry order is wire order and processing order at the receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchedMessage {
    /// Diagnostic id, wraps per batcher instance.
    pub batch_id: u32,
    /// Creation time in seconds on the sender's clock.
    pub timestamp: f32,
    /// Messages in enqueue order.
    pub entries: Vec<BatchEntry>,
}

impl BatchedMessage {
    /// Create an empty envelope.
    pub fn new(batch_id: u32, timestamp: f32) -> Self {
        Self {
            batch_id,
            timestamp,
            entries: Vec::new(),
        }
    }

    /// Append an entry.
    pub fn push(&mut self, message_type: MessageType, payload: Vec<u8>, priority: Priority) {
        self.entries.push(BatchEntry {
            message_type,
            payload,
            priority,
        });
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the envelope has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total payload bytes carried.
    pub fn payload_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.payload.len()).sum()
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        encode_frame("batched message", self)
    }

    /// Parse wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        decode_frame("batched message", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BatchedMessage {
        let mut envelope = BatchedMessage::new(7, 1.25);
        envelope.push(MessageType(5), vec![1, 2, 3], Priority::Critical);
        envelope.push(MessageType(300), vec![], Priority::Critical);
        envelope.push(MessageType(5), vec![9; 200], Priority::Critical);
        envelope
    }

    #[test]
    fn encode_decode_preserves_entry_order() {
        let envelope = sample();
        let bytes = envelope.encode().unwrap();
        let decoded = BatchedMessage::decode(&bytes).unwrap();
        assert_eq!(decoded, envelope);
        let types: Vec<u16> = decoded.entries.iter().map(|e| e.message_type.0).collect();
        assert_eq!(types, vec![5, 300, 5]);
    }

    #[test]
    fn header_layout() {
        let mut envelope = BatchedMessage::new(1, 0.5);
        envelope.push(MessageType(5), vec![0xAA], Priority::High);
        let bytes = envelope.encode().unwrap();
        // batch id varint, f32 LE, entry count, type varint, len, payload, priority
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..5], &0.5f32.to_le_bytes());
        assert_eq!(bytes[5], 1);
        assert_eq!(bytes[6], 5);
        assert_eq!(bytes[7], 1);
        assert_eq!(bytes[8], 0xAA);
        assert_eq!(bytes[9], Priority::High as u8);
        assert_eq!(bytes.len(), 10);
    }

    #[test]
    fn estimate_is_an_upper_bound() {
        let envelope = sample();
        let bytes = envelope.encode().unwrap();
        let estimate: usize = ENVELOPE_HEADER_ESTIMATE
            + envelope
                .entries
                .iter()
                .map(BatchEntry::estimated_size)
                .sum::<usize>();
        assert!(bytes.len() <= estimate);
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let bytes = sample().encode().unwrap();
        assert!(BatchedMessage::decode(&bytes[..bytes.len() - 4]).is_err());
        assert!(BatchedMessage::decode(&[]).is_err());
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = sample().encode().unwrap();
        bytes.push(0);
        assert!(matches!(
            BatchedMessage::decode(&bytes),
            Err(WireError::TrailingBytes { remaining: 1, .. })
        ));
    }

    #[test]
    fn varint_lengths() {
        assert_eq!(varint_len(0), 1);
        assert_eq!(varint_len(127), 1);
        assert_eq!(varint_len(128), 2);
        assert_eq!(varint_len(16_384), 3);
    }
}
