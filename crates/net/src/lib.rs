#![warn(missing_docs)]
//! Message batching and delta compression for MMO network traffic.
//!
//! Producers queue small, prioritized messages; the [`MessageBatcher`] folds
//! them into one [`BatchedMessage`] per destination on priority-specific
//! timers. Character movement goes through the [`CharacterStateBatcher`],
//! which samples, filters and delta-compresses it. On the receiving side the
//! [`BatchDispatcher`] unpacks envelopes and routes entries to handlers.

mod batcher;
mod character_state;
mod clock;
mod compression;
mod config;
mod dispatch;
mod endpoint;
mod envelope;
mod error;
mod layer;
mod memory;
mod priority;
mod quic;
mod stats;
mod transport;

pub use batcher::{BatchQueue, BucketState, FlushTrigger, MessageBatcher, PendingMessage};
pub use character_state::{
    CharacterStateBatcher, CharacterStateMirror, CharacterStateRecord, CharacterStateSnapshot,
    CompressedCharacterStateBatch, CompressedCharacterStateUpdate,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use compression::{
    compress_position, compress_rotation, encode_position, encode_rotation,
    rotation_angle_degrees, DeltaTag, PositionDelta, RotationDelta,
};
pub use config::{BatchingConfig, CharacterStateConfig, OverflowPolicy};
pub use dispatch::{BatchDispatcher, MessageHandler};
pub use endpoint::{ClientEndpoint, QuicSettings, ServerEndpoint, ALPN};
pub use envelope::{
    estimated_entry_size, BatchEntry, BatchedMessage, WireError, ENVELOPE_HEADER_ESTIMATE,
    PER_SEND_OVERHEAD,
};
pub use error::{BatchError, TransportError};
pub use layer::BatchingLayer;
pub use memory::{MemoryTransport, SentMessage};
pub use priority::{ConnectionId, DeliveryMethod, MessageType, Priority};
pub use quic::{decode_datagram, encode_datagram, encode_stream_frame, QuicTransport, MAX_FRAME_LEN};
pub use stats::{BatchProcessingStats, CompressionStats, MessageBatchStats, PriorityCounters};
pub use transport::{InboundMessage, Transport};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
