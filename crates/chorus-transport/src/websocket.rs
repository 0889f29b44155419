//! WebSocket transport implementation.
//!
//! Adapts axum's upgraded [`WebSocket`] to the [`Connection`] traits. The
//! protocol layer answers pings on its own, so the relay only ever sees the
//! pongs that answer its own probes.

use std::borrow::Cow;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::trace;

use crate::traits::{Connection, Frame, FrameSink, FrameSource, TransportError};

impl Connection for WebSocket {
    type Sink = WebSocketSink;
    type Source = WebSocketSource;

    fn split(self) -> (WebSocketSink, WebSocketSource) {
        let (sink, stream) = StreamExt::split(self);
        (
            WebSocketSink {
                inner: sink,
                close_sent: false,
            },
            WebSocketSource { inner: stream },
        )
    }
}

/// Outbound half of an upgraded WebSocket.
pub struct WebSocketSink {
    inner: SplitSink<WebSocket, Message>,
    close_sent: bool,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.close_sent {
            return Err(TransportError::CloseSent);
        }

        let is_close = frame.is_close();
        self.inner
            .send(to_message(frame))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        if is_close {
            self.close_sent = true;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner
            .close()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

/// Inbound half of an upgraded WebSocket.
pub struct WebSocketSource {
    inner: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameSource for WebSocketSource {
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        let message = match self.inner.next().await? {
            Ok(message) => message,
            Err(e) => return Some(Err(TransportError::ReceiveFailed(e.to_string()))),
        };
        trace!(?message, "WebSocket message");
        Some(Ok(from_message(message)))
    }
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(payload) => Message::Text(String::from_utf8_lossy(&payload).into_owned()),
        Frame::Binary(payload) => Message::Binary(payload.to_vec()),
        Frame::Ping(payload) => Message::Ping(payload.to_vec()),
        Frame::Pong(payload) => Message::Pong(payload.to_vec()),
        Frame::Close(code) => Message::Close(code.map(|code| CloseFrame {
            code,
            reason: Cow::Borrowed(""),
        })),
    }
}

fn from_message(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Text(Bytes::from(text)),
        Message::Binary(data) => Frame::Binary(Bytes::from(data)),
        Message::Ping(data) => Frame::Ping(Bytes::from(data)),
        Message::Pong(data) => Frame::Pong(Bytes::from(data)),
        Message::Close(close) => Frame::Close(close.map(|c| c.code)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::close_code;

    #[test]
    fn test_text_maps_both_ways() {
        let message = to_message(Frame::text("hello world"));
        assert!(matches!(&message, Message::Text(t) if t == "hello world"));
        assert_eq!(from_message(message), Frame::text("hello world"));
    }

    #[test]
    fn test_close_code_is_preserved() {
        let message = to_message(Frame::close(close_code::GOING_AWAY));
        match &message {
            Message::Close(Some(frame)) => assert_eq!(frame.code, close_code::GOING_AWAY),
            other => panic!("unexpected message: {other:?}"),
        }
        assert_eq!(
            from_message(message),
            Frame::Close(Some(close_code::GOING_AWAY))
        );
        assert_eq!(from_message(Message::Close(None)), Frame::Close(None));
    }

    #[test]
    fn test_invalid_utf8_text_is_replaced() {
        let message = to_message(Frame::Text(Bytes::from_static(b"ok\xff")));
        assert!(matches!(message, Message::Text(t) if t.starts_with("ok")));
    }

    #[test]
    fn test_control_frames() {
        assert_eq!(from_message(Message::Pong(vec![1])), Frame::Pong(Bytes::from_static(&[1])));
        assert!(matches!(to_message(Frame::ping()), Message::Ping(d) if d.is_empty()));
    }
}
