//! [`Transport`] over QUIC connections.
//!
//! Reliable delivery methods share one long-lived unidirectional stream per
//! connection, so they arrive in send order. Unreliable methods use datagrams
//! and fall back to the stream when the peer does not accept datagrams or the
//! payload is too large for one.
//!
//! Stream frame: `[channel u8][message_type u16 LE][len u32 LE][payload]`.
//! Datagram: `[channel u8][message_type u16 LE][payload]`.

use crate::error::TransportError;
use crate::lock;
use crate::priority::{ConnectionId, DeliveryMethod, MessageType};
use crate::transport::{InboundMessage, Transport};
use anyhow::{bail, Context, Result};
use quinn::{Connection, RecvStream};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

const DATAGRAM_HEADER: usize = 1 + 2;
const STREAM_HEADER: usize = DATAGRAM_HEADER + 4;

/// Largest stream frame payload; larger sends are refused.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Build a reliable stream frame.
pub fn encode_stream_frame(channel: u8, message_type: MessageType, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(STREAM_HEADER + payload.len());
    frame.push(channel);
    frame.extend_from_slice(&message_type.0.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Build an unreliable datagram.
pub fn encode_datagram(channel: u8, message_type: MessageType, payload: &[u8]) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(DATAGRAM_HEADER + payload.len());
    datagram.push(channel);
    datagram.extend_from_slice(&message_type.0.to_le_bytes());
    datagram.extend_from_slice(payload);
    datagram
}

/// Split a datagram into channel, message type and payload.
pub fn decode_datagram(datagram: &[u8]) -> Result<(u8, MessageType, &[u8])> {
    if datagram.len() < DATAGRAM_HEADER {
        bail!("Datagram too short: {} bytes", datagram.len());
    }
    let message_type = MessageType(u16::from_le_bytes([datagram[1], datagram[2]]));
    Ok((datagram[0], message_type, &datagram[DATAGRAM_HEADER..]))
}

/// Read one frame; `Ok(None)` when the stream finished on a frame boundary.
async fn read_stream_frame(recv: &mut RecvStream) -> Result<Option<(u8, MessageType, Vec<u8>)>> {
    let mut header = [0u8; STREAM_HEADER];
    match recv.read_exact(&mut header).await {
        Ok(()) => {}
        Err(quinn::ReadExactError::FinishedEarly(0)) => return Ok(None),
        Err(err) => return Err(err).context("Failed to read frame header"),
    }
    let message_type = MessageType(u16::from_le_bytes([header[1], header[2]]));
    let len = u32::from_le_bytes([header[3], header[4], header[5], header[6]]) as usize;
    if len > MAX_FRAME_LEN {
        bail!("Frame of {} bytes exceeds limit", len);
    }
    let mut payload = vec![0u8; len];
    recv.read_exact(&mut payload)
        .await
        .context("Failed to read frame payload")?;
    Ok(Some((header[0], message_type, payload)))
}

struct PeerLink {
    connection: Connection,
    reliable: mpsc::UnboundedSender<Vec<u8>>,
}

impl PeerLink {
    /// The connection is up and its stream writer is still running.
    fn is_open(&self) -> bool {
        self.connection.close_reason().is_none() && !self.reliable.is_closed()
    }
}

/// QUIC transport multiplexing many peer connections.
pub struct QuicTransport {
    runtime: Handle,
    peers: Mutex<HashMap<ConnectionId, PeerLink>>,
    next_id: AtomicU64,
    inbound: mpsc::UnboundedSender<InboundMessage>,
}

impl QuicTransport {
    /// Create a transport spawning its tasks on `runtime`.
    ///
    /// Everything received on any connection is delivered to the returned receiver.
    pub fn new(runtime: Handle) -> (Self, mpsc::UnboundedReceiver<InboundMessage>) {
        let (inbound, rx) = mpsc::unbounded_channel();
        let transport = Self {
            runtime,
            peers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            inbound,
        };
        (transport, rx)
    }

    /// Start sending to and receiving from an established connection.
    pub fn add_connection(&self, connection: Connection) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (reliable, frames) = mpsc::unbounded_channel();
        info!("{} attached ({})", id, connection.remote_address());

        let writer = connection.clone();
        self.runtime.spawn(async move {
            if let Err(err) = write_stream(writer, frames).await {
                debug!("{} writer stopped: {:#}", id, err);
            }
        });

        let streams = connection.clone();
        let inbound = self.inbound.clone();
        self.runtime.spawn(async move {
            if let Err(err) = accept_streams(streams, id, inbound).await {
                debug!("{} stream pump stopped: {:#}", id, err);
            }
        });

        let datagrams = connection.clone();
        let inbound = self.inbound.clone();
        self.runtime.spawn(async move {
            if let Err(err) = read_datagrams(datagrams, id, inbound).await {
                debug!("{} datagram pump stopped: {:#}", id, err);
            }
        });

        lock(&self.peers).insert(
            id,
            PeerLink {
                connection,
                reliable,
            },
        );
        id
    }

    /// Close and forget a connection.
    pub fn remove_connection(&self, id: ConnectionId) -> bool {
        match lock(&self.peers).remove(&id) {
            Some(link) => {
                link.connection.close(0u32.into(), b"closed");
                info!("{} detached", id);
                true
            }
            None => false,
        }
    }

    /// Number of attached connections.
    pub fn connection_count(&self) -> usize {
        lock(&self.peers).len()
    }
}

impl Transport for QuicTransport {
    fn ensure_initialized(&self) -> Result<(), TransportError> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        Ok(())
    }

    fn is_ready(&self) -> bool {
        lock(&self.peers).values().any(PeerLink::is_open)
    }

    fn send(
        &self,
        destination: ConnectionId,
        channel: u8,
        delivery: DeliveryMethod,
        message_type: MessageType,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let peers = lock(&self.peers);
        let link = peers
            .get(&destination)
            .ok_or(TransportError::UnknownDestination(destination))?;
        if let Some(reason) = link.connection.close_reason() {
            return Err(TransportError::Send(format!("{destination} closed: {reason}")));
        }
        if link.reliable.is_closed() {
            return Err(TransportError::Closed(destination));
        }
        if payload.len() > MAX_FRAME_LEN {
            return Err(TransportError::Send(format!(
                "{} byte payload exceeds the {} byte frame limit",
                payload.len(),
                MAX_FRAME_LEN
            )));
        }

        if !delivery.is_reliable() {
            let fits = link
                .connection
                .max_datagram_size()
                .is_some_and(|max| DATAGRAM_HEADER + payload.len() <= max);
            if fits {
                let datagram = encode_datagram(channel, message_type, payload);
                match link.connection.send_datagram(datagram.into()) {
                    Ok(()) => {
                        trace!("{} datagram {} ({} bytes)", destination, message_type, payload.len());
                        return Ok(());
                    }
                    Err(err) => warn!("{} datagram failed ({}), using stream", destination, err),
                }
            }
        }

        link.reliable
            .send(encode_stream_frame(channel, message_type, payload))
            .map_err(|_| TransportError::Closed(destination))?;
        trace!("{} stream {} ({} bytes)", destination, message_type, payload.len());
        Ok(())
    }
}

async fn write_stream(
    connection: Connection,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
) -> Result<()> {
    let mut stream = connection
        .open_uni()
        .await
        .context("Failed to open unidirectional stream")?;
    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => stream
                    .write_all(&frame)
                    .await
                    .context("Failed to write frame")?,
                None => break,
            },
            reason = connection.closed() => bail!("Connection closed: {}", reason),
        }
    }
    stream.finish().context("Failed to finish stream")?;
    Ok(())
}

async fn accept_streams(
    connection: Connection,
    source: ConnectionId,
    inbound: mpsc::UnboundedSender<InboundMessage>,
) -> Result<()> {
    loop {
        let mut recv = connection
            .accept_uni()
            .await
            .context("Failed to accept unidirectional stream")?;
        let inbound = inbound.clone();
        tokio::spawn(async move {
            loop {
                match read_stream_frame(&mut recv).await {
                    Ok(Some((channel, message_type, payload))) => {
                        let message = InboundMessage {
                            source,
                            channel,
                            message_type,
                            payload,
                        };
                        if inbound.send(message).is_err() {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(err) => {
                        debug!("{} stream closed: {:#}", source, err);
                        return;
                    }
                }
            }
        });
    }
}

async fn read_datagrams(
    connection: Connection,
    source: ConnectionId,
    inbound: mpsc::UnboundedSender<InboundMessage>,
) -> Result<()> {
    loop {
        let datagram = connection
            .read_datagram()
            .await
            .context("Failed to read datagram")?;
        match decode_datagram(&datagram) {
            Ok((channel, message_type, payload)) => {
                let message = InboundMessage {
                    source,
                    channel,
                    message_type,
                    payload: payload.to_vec(),
                };
                if inbound.send(message).is_err() {
                    return Ok(());
                }
            }
            Err(err) => warn!("{} sent a bad datagram: {:#}", source, err),
        }
    }
}
