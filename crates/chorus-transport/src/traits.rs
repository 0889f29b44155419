//! Transport abstraction traits for Chorus.
//!
//! These traits define the interface the relay core consumes, allowing the
//! pumps to be transport-agnostic.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// WebSocket close codes the relay cares about (RFC 6455 section 7.4.1).
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// The endpoint is going away (server shutdown, page navigation).
    pub const GOING_AWAY: u16 = 1001;
    /// The connection dropped without a close frame.
    pub const ABNORMAL: u16 = 1006;
}

/// A discrete message on a framed transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text payload.
    Text(Bytes),
    /// Binary payload.
    Binary(Bytes),
    /// Liveness probe.
    Ping(Bytes),
    /// Liveness acknowledgment.
    Pong(Bytes),
    /// Close notification with an optional status code.
    Close(Option<u16>),
}

impl Frame {
    /// Create a text frame.
    #[must_use]
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::Text(payload.into())
    }

    /// Create an empty ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Self::Ping(Bytes::new())
    }

    /// Create an empty pong frame.
    #[must_use]
    pub fn pong() -> Self {
        Self::Pong(Bytes::new())
    }

    /// Create a close frame carrying `code`.
    #[must_use]
    pub fn close(code: u16) -> Self {
        Self::Close(Some(code))
    }

    /// Whether this is a close frame.
    #[must_use]
    pub fn is_close(&self) -> bool {
        matches!(self, Self::Close(_))
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection is closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A close frame was already sent on this connection.
    #[error("Close frame already sent")]
    CloseSent,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
}

/// The outbound half of a connection.
///
/// Only one task may own a sink, so there is never more than one writer.
#[async_trait]
pub trait FrameSink: Send {
    /// Send a frame to the peer.
    ///
    /// Once a close frame has been sent, every later send fails with
    /// [`TransportError::CloseSent`].
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Release the outbound half of the connection.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// The inbound half of a connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next frame.
    ///
    /// Returns `None` when the stream ends without a close frame.
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>>;
}

/// A bidirectional framed connection that can be split into owned halves.
pub trait Connection: Send + 'static {
    /// Outbound half.
    type Sink: FrameSink + 'static;
    /// Inbound half.
    type Source: FrameSource + 'static;

    /// Split the connection so reads and writes can proceed independently.
    fn split(self) -> (Self::Sink, Self::Source);
}
