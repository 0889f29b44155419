//! In-memory transport.
//!
//! A bounded, channel-backed connection pair. The server side is a regular
//! [`Connection`]; the other side is a [`MemoryPeer`] that plays the remote
//! client. Both directions are bounded, so a peer that stops reading pushes
//! back on the writer exactly like a stalled socket would.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::traits::{Connection, Frame, FrameSink, FrameSource, TransportError};

/// Create a connected pair with `buffer` frames of capacity per direction.
///
/// # Panics
///
/// Panics if `buffer` is zero.
#[must_use]
pub fn pair(buffer: usize) -> (MemoryConnection, MemoryPeer) {
    let (to_peer, from_server) = mpsc::channel(buffer);
    let (to_server, from_peer) = mpsc::channel(buffer);

    let conn = MemoryConnection {
        sink: MemorySink {
            tx: Some(to_peer),
            close_sent: false,
        },
        source: MemorySource { rx: from_peer },
    };
    let peer = MemoryPeer {
        tx: Some(to_server),
        rx: from_server,
    };
    (conn, peer)
}

/// Server side of an in-memory connection.
pub struct MemoryConnection {
    sink: MemorySink,
    source: MemorySource,
}

impl Connection for MemoryConnection {
    type Sink = MemorySink;
    type Source = MemorySource;

    fn split(self) -> (MemorySink, MemorySource) {
        (self.sink, self.source)
    }
}

/// Outbound half of a [`MemoryConnection`].
pub struct MemorySink {
    tx: Option<mpsc::Sender<Frame>>,
    close_sent: bool,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.close_sent {
            return Err(TransportError::CloseSent);
        }
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;

        let is_close = frame.is_close();
        tx.send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;
        if is_close {
            self.close_sent = true;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

/// Inbound half of a [`MemoryConnection`].
pub struct MemorySource {
    rx: mpsc::Receiver<Frame>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        self.rx.recv().await.map(Ok)
    }
}

/// The remote end of an in-memory connection.
pub struct MemoryPeer {
    tx: Option<mpsc::Sender<Frame>>,
    rx: mpsc::Receiver<Frame>,
}

impl MemoryPeer {
    /// Send a frame to the server side.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer disconnected or the server side dropped
    /// its inbound half.
    pub async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Send a text frame to the server side.
    ///
    /// # Errors
    ///
    /// See [`MemoryPeer::send`].
    pub async fn send_text(&mut self, text: impl Into<String>) -> Result<(), TransportError> {
        self.send(Frame::Text(Bytes::from(text.into()))).await
    }

    /// Receive the next frame sent by the server side.
    ///
    /// Returns `None` once the server released its outbound half.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Receive the next text payload, skipping liveness probes.
    ///
    /// Returns `None` on a close frame or when the server side is gone.
    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            match self.rx.recv().await? {
                Frame::Text(payload) | Frame::Binary(payload) => {
                    return Some(String::from_utf8_lossy(&payload).into_owned())
                }
                Frame::Ping(_) | Frame::Pong(_) => continue,
                Frame::Close(_) => return None,
            }
        }
    }

    /// Drop the peer's outbound half without sending a close frame.
    pub fn disconnect(&mut self) {
        self.tx = None;
    }
}
