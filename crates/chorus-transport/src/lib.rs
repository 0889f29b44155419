//! # chorus-transport
//!
//! Framed message transport layer for the Chorus broadcast relay.
//!
//! The relay core never talks to a socket directly. It consumes a
//! [`Connection`] that can be split into two independently owned halves:
//!
//! - **[`FrameSource`]** - the inbound half, read by exactly one reader pump
//! - **[`FrameSink`]** - the outbound half, owned by exactly one writer pump
//!
//! Owning the sink is what makes a pump the single writer of a connection.
//!
//! Two implementations ship with the crate:
//!
//! - **WebSocket** - axum's upgraded `WebSocket` (feature `websocket`)
//! - **Memory** - a bounded in-process pair, used for tests and embedding
//!
//! ```rust,ignore
//! use chorus_transport::{Connection, Frame, FrameSink, FrameSource};
//!
//! async fn echo(conn: impl Connection) {
//!     let (mut sink, mut source) = conn.split();
//!     while let Some(Ok(Frame::Text(text))) = source.recv().await {
//!         if sink.send(Frame::Text(text)).await.is_err() {
//!             break;
//!         }
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::{MemoryConnection, MemoryPeer};
pub use traits::{close_code, Connection, Frame, FrameSink, FrameSource, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketSink, WebSocketSource};
