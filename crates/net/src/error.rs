//! Error types surfaced by the batching layer.

use crate::envelope::WireError;
use crate::priority::{ConnectionId, Priority};
use thiserror::Error;

/// Failures reported by a [`crate::Transport`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// No connection is established yet.
    #[error("transport is not ready")]
    NotReady,
    /// The destination is not connected.
    #[error("unknown destination {0}")]
    UnknownDestination(ConnectionId),
    /// The destination's connection has been closed.
    #[error("connection {0} is closed")]
    Closed(ConnectionId),
    /// The transport rejected the send.
    #[error("send failed: {0}")]
    Send(String),
}

/// Failures of batching operations.
#[derive(Debug, Error)]
pub enum BatchError {
    /// The priority queue is full and configured to reject.
    #[error("{0:?} queue is full")]
    QueueFull(Priority),
    /// The layer cannot start until the transport is ready.
    #[error("transport is not ready")]
    NotReady,
    /// A payload could not be serialized.
    #[error(transparent)]
    Wire(#[from] WireError),
    /// A direct send failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}
