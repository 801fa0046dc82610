//! ---
//! ddp_section: "02-wire-protocol"
//! ddp_subsection: "module"
//! ddp_type: "source"
//! ddp_scope: "code"
//! ddp_description: "Message model, fixed-width codec, and framed transports."
//! ddp_version: "v0.0.0-prealpha"
//! ddp_owner: "tbd"
//! ---
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::codec::WireFormat;
use crate::logging::{log_message, MessageDirection};
use crate::types::{Message, MessageKind};
use crate::CodecError;

/// Failures raised by a connection while moving frames.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The bytes received do not form a valid message.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// Underlying socket failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The remote end is gone.
    #[error("connection closed by peer")]
    Closed,
}

/// Message-level view of one physical-device link.
#[async_trait]
pub trait Connection: Send {
    /// Receive the next message. `Ok(None)` signals a clean close on a
    /// message boundary.
    async fn recv(&mut self) -> Result<Option<Message>, TransportError>;
    /// Send one message as a single frame.
    async fn send(&mut self, message: Message) -> Result<(), TransportError>;
    /// Human-readable peer label for logging.
    fn peer(&self) -> &str;
}

/// Frames messages over a byte stream without a length prefix: the selector
/// byte and the configured widths determine how many bytes follow.
#[derive(Debug)]
pub struct FramedConnection<S> {
    stream: S,
    format: WireFormat,
    peer: String,
}

impl<S> FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap a stream using the provided wire format.
    pub fn new(stream: S, format: WireFormat, peer: impl Into<String>) -> Self {
        Self {
            stream,
            format,
            peer: peer.into(),
        }
    }

    /// Wire format used by this connection.
    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Release the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

#[async_trait]
impl<S> Connection for FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Option<Message>, TransportError> {
        let selector = match self.stream.read_u8().await {
            Ok(byte) => byte,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let kind =
            MessageKind::from_u8(selector).ok_or(CodecError::UnknownMessageType(selector))?;
        let expected = self.format.frame_len(kind);
        let mut frame = vec![0u8; expected];
        frame[0] = selector;

        let mut filled = 1;
        while filled < expected {
            let read = self.stream.read(&mut frame[filled..]).await?;
            if read == 0 {
                return Err(CodecError::MalformedMessage {
                    kind: Some(kind),
                    expected,
                    actual: filled,
                }
                .into());
            }
            filled += read;
        }

        let message = self.format.decode(&frame)?;
        log_message(MessageDirection::Inbound, &self.peer, &message);
        Ok(Some(message))
    }

    async fn send(&mut self, message: Message) -> Result<(), TransportError> {
        let frame = self.format.encode(&message)?;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        log_message(MessageDirection::Outbound, &self.peer, &message);
        Ok(())
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}

/// Message-level in-memory link, primarily for tests and in-process
/// simulation. The platform holds the [`InMemoryConnection`]; the simulated
/// device holds the [`PeerEndpoint`].
#[derive(Debug)]
pub struct InMemoryConnection {
    inbound: mpsc::Receiver<Message>,
    outbound: mpsc::Sender<Message>,
    peer: String,
}

/// Device side of an [`InMemoryConnection`].
#[derive(Debug)]
pub struct PeerEndpoint {
    to_platform: mpsc::Sender<Message>,
    from_platform: mpsc::Receiver<Message>,
}

impl InMemoryConnection {
    /// Create a connected pair with the given per-direction buffer.
    pub fn pair(peer: impl Into<String>, capacity: usize) -> (Self, PeerEndpoint) {
        let (to_platform, inbound) = mpsc::channel(capacity.max(1));
        let (outbound, from_platform) = mpsc::channel(capacity.max(1));
        (
            Self {
                inbound,
                outbound,
                peer: peer.into(),
            },
            PeerEndpoint {
                to_platform,
                from_platform,
            },
        )
    }
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn recv(&mut self) -> Result<Option<Message>, TransportError> {
        Ok(self.inbound.recv().await)
    }

    async fn send(&mut self, message: Message) -> Result<(), TransportError> {
        log_message(MessageDirection::Outbound, &self.peer, &message);
        self.outbound
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}

impl PeerEndpoint {
    /// Send a message towards the platform.
    pub async fn send(&self, message: Message) -> Result<(), TransportError> {
        self.to_platform
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Receive the platform's next reply; `None` once the platform closed
    /// the connection.
    pub async fn recv(&mut self) -> Option<Message> {
        self.from_platform.recv().await
    }
}
