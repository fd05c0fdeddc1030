//! Priorities, delivery methods and the identifiers carried by every queued message.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Urgency of a queued message.
///
/// Ordering is fixed: it decides both how often a bucket flushes and which
/// delivery method the flushed envelope defaults to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Priority {
    /// Combat results, state corrections (16 ms).
    Critical = 0,
    /// Ability casts and other gameplay-visible events (33 ms).
    High = 1,
    /// Movement and ambient state (100 ms).
    Medium = 2,
    /// Chat, social and bookkeeping traffic (500 ms).
    Low = 3,
}

impl Priority {
    /// All priorities, most urgent first.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    /// Index into per-priority arrays.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Flush interval used when no configuration overrides it.
    pub fn default_flush_interval(self) -> Duration {
        match self {
            Priority::Critical => Duration::from_millis(16),
            Priority::High => Duration::from_millis(33),
            Priority::Medium => Duration::from_millis(100),
            Priority::Low => Duration::from_millis(500),
        }
    }

    /// Delivery method an envelope of this priority is sent with.
    ///
    /// Critical and High are always reliable-ordered; callers may only
    /// strengthen Medium and Low through the per-message delivery argument.
    pub fn default_delivery(self) -> DeliveryMethod {
        match self {
            Priority::Critical | Priority::High => DeliveryMethod::ReliableOrdered,
            Priority::Medium | Priority::Low => DeliveryMethod::Unreliable,
        }
    }
}

impl TryFrom<u8> for Priority {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Priority::Critical),
            1 => Ok(Priority::High),
            2 => Ok(Priority::Medium),
            3 => Ok(Priority::Low),
            _ => Err(anyhow::anyhow!("Invalid priority: {}", value)),
        }
    }
}

/// Delivery guarantees offered by the underlying transport.
///
/// Variants are declared weakest first, so `max` picks the stronger guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMethod {
    /// Fire and forget.
    Unreliable,
    /// Unreliable, stale packets dropped.
    Sequenced,
    /// Reliable, any order.
    ReliableUnordered,
    /// Reliable, only the latest packet matters.
    ReliableSequenced,
    /// Reliable and ordered.
    ReliableOrdered,
}

impl DeliveryMethod {
    /// Whether the transport retransmits lost packets for this method.
    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            DeliveryMethod::ReliableUnordered
                | DeliveryMethod::ReliableSequenced
                | DeliveryMethod::ReliableOrdered
        )
    }
}

/// Code identifying how a payload should be decoded by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageType(pub u16);

impl MessageType {
    /// A [`crate::BatchedMessage`] envelope.
    pub const BATCHED_MESSAGE: Self = Self(9000);
    /// A [`crate::CompressedCharacterStateBatch`].
    pub const CHARACTER_STATE_BATCH: Self = Self(9001);

    /// Codes at or above this value are reserved for the batching layer.
    pub const RESERVED_START: u16 = 9000;

    /// Whether this code belongs to the batching layer itself.
    pub fn is_reserved(self) -> bool {
        self.0 >= Self::RESERVED_START
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque identifier of a remote peer (destination when sending, source when receiving).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_and_high_are_always_reliable() {
        assert_eq!(
            Priority::Critical.default_delivery(),
            DeliveryMethod::ReliableOrdered
        );
        assert_eq!(
            Priority::High.default_delivery(),
            DeliveryMethod::ReliableOrdered
        );
        assert!(!Priority::Medium.default_delivery().is_reliable());
        assert!(!Priority::Low.default_delivery().is_reliable());
    }

    #[test]
    fn default_intervals_increase_with_priority() {
        let intervals: Vec<_> = Priority::ALL
            .iter()
            .map(|p| p.default_flush_interval())
            .collect();
        assert_eq!(intervals[0], Duration::from_millis(16));
        assert_eq!(intervals[3], Duration::from_millis(500));
        assert!(intervals.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn stronger_delivery_wins() {
        let resolved = DeliveryMethod::Unreliable.max(DeliveryMethod::ReliableOrdered);
        assert_eq!(resolved, DeliveryMethod::ReliableOrdered);
        assert!(DeliveryMethod::Sequenced < DeliveryMethod::ReliableUnordered);
    }

    #[test]
    fn priority_byte_roundtrip() {
        for priority in Priority::ALL {
            assert_eq!(Priority::try_from(priority as u8).unwrap(), priority);
        }
        assert!(Priority::try_from(4).is_err());
    }

    #[test]
    fn priority_encodes_as_single_byte() {
        let bytes = postcard::to_allocvec(&Priority::Low).unwrap();
        assert_eq!(bytes, vec![3]);
    }
}
