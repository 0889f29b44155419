//! Client pumps.
//!
//! Every accepted connection becomes a [`Client`] served by two tasks:
//!
//! - the **reader** pulls inbound frames, enforces the size limit and the
//!   liveness deadline, and forwards normalized payloads to the hub
//! - the **writer** owns the outbound half, drains the client's queue
//!   (coalescing whatever is already buffered) and sends liveness probes
//!
//! The reader never writes and the writer never reads. They stop each other
//! through a per-client cancellation token, and the hub stops the writer by
//! closing its queue.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chorus_transport::{close_code, Connection, Frame, FrameSink, FrameSource, TransportError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::hub::{HubError, HubHandle};
use crate::message;
use crate::metrics;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique client identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    /// Allocate the next identity.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The numeric value of the identity.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Invalid pump configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A size or duration that must be positive is zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    /// Probes would not arrive before the peer's liveness window closes.
    #[error("ping period ({ping_period:?}) must be shorter than pong wait ({pong_wait:?})")]
    PingPeriodTooLong {
        ping_period: Duration,
        pong_wait: Duration,
    },
}

/// Pump configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PumpConfig {
    /// Largest inbound payload accepted, in bytes.
    pub max_message_size: usize,
    /// Capacity of each client's outbound queue.
    pub send_buffer: usize,
    /// Liveness window: how long the reader waits for the next pong.
    pub pong_wait: Duration,
    /// Interval between liveness probes.
    pub ping_period: Duration,
    /// Time allowed for a single write.
    pub write_wait: Duration,
}

impl Default for PumpConfig {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(60);
        Self {
            max_message_size: 512,
            send_buffer: 256,
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            write_wait: Duration::from_secs(10),
        }
    }
}

impl PumpConfig {
    /// Check the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a limit is zero or the ping period is not
    /// strictly shorter than the pong wait.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_message_size == 0 {
            return Err(ConfigError::Zero("max_message_size"));
        }
        if self.send_buffer == 0 {
            return Err(ConfigError::Zero("send_buffer"));
        }
        if self.ping_period.is_zero() {
            return Err(ConfigError::Zero("ping_period"));
        }
        if self.write_wait.is_zero() {
            return Err(ConfigError::Zero("write_wait"));
        }
        if self.ping_period >= self.pong_wait {
            return Err(ConfigError::PingPeriodTooLong {
                ping_period: self.ping_period,
                pong_wait: self.pong_wait,
            });
        }
        Ok(())
    }
}

/// Why a pump stopped.
#[derive(Debug, Error)]
pub enum PumpError {
    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// No pong arrived within the liveness window.
    #[error("No pong within {0:?}")]
    ReadTimeout(Duration),

    /// A write did not complete in time.
    #[error("Write timed out after {0:?}")]
    WriteTimeout(Duration),

    /// The peer sent a payload over the limit.
    #[error("Message of {size} bytes exceeds limit of {limit}")]
    MessageTooLarge { size: usize, limit: usize },

    /// The peer closed the connection.
    #[error("Peer closed connection (code {})", describe_code(.0))]
    Closed(Option<u16>),

    /// The hub loop has stopped.
    #[error("Hub is closed")]
    HubClosed,
}

impl From<HubError> for PumpError {
    fn from(_: HubError) -> Self {
        Self::HubClosed
    }
}

impl PumpError {
    /// Whether this is an ordinary disconnect that is not worth reporting.
    ///
    /// Only going-away and abnormal closure count as ordinary.
    #[must_use]
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::Closed(Some(close_code::GOING_AWAY | close_code::ABNORMAL))
        )
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::ReadTimeout(_) => "read_timeout",
            Self::WriteTimeout(_) => "write_timeout",
            Self::MessageTooLarge { .. } => "too_large",
            Self::Closed(_) => "closed",
            Self::HubClosed => "hub_closed",
        }
    }
}

fn describe_code(code: &Option<u16>) -> String {
    code.map_or_else(|| "none".to_string(), |c| c.to_string())
}

/// A connected peer served by a reader and a writer pump.
///
/// The pumps own the connection; this handle only observes and ends it.
#[derive(Debug, Clone)]
pub struct Client {
    id: ClientId,
    closed: CancellationToken,
}

impl Client {
    /// Accept a connection: register it with the hub and start its pumps.
    ///
    /// Both pumps are spawned on `tracker` before this returns. They stop on
    /// their own failure, on the peer going away, on eviction by the hub, or
    /// when `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub is no longer running, in
    /// which case nothing is spawned.
    pub async fn start<C: Connection>(
        conn: C,
        hub: &HubHandle,
        config: Arc<PumpConfig>,
        shutdown: &CancellationToken,
        tracker: &TaskTracker,
    ) -> Result<Self, HubError> {
        let id = ClientId::next();
        let (queue_tx, queue_rx) = mpsc::channel(config.send_buffer);
        hub.register(id, queue_tx).await?;

        let (sink, source) = conn.split();
        let closed = shutdown.child_token();

        tracker.spawn(write_pump(
            sink,
            id,
            queue_rx,
            Arc::clone(&config),
            closed.clone(),
        ));
        tracker.spawn(read_pump(source, id, hub.clone(), config, closed.clone()));

        debug!(client = %id, "Client started");
        Ok(Self { id, closed })
    }

    /// The client's identity.
    #[must_use]
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Ask both pumps to stop. The writer sends a close frame.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether the pumps have been told to stop.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Wait until either pump stops or the client is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

/// Read inbound frames and forward them to the hub until the connection
/// ends, then unregister.
pub async fn read_pump<S: FrameSource>(
    mut source: S,
    id: ClientId,
    hub: HubHandle,
    config: Arc<PumpConfig>,
    closed: CancellationToken,
) {
    match read_loop(&mut source, id, &hub, &config, &closed).await {
        Ok(()) => debug!(client = %id, "Reader stopped"),
        Err(e) if e.is_expected() => debug!(client = %id, reason = %e, "Reader stopped"),
        Err(e) => {
            metrics::record_error(e.kind());
            warn!(client = %id, error = %e, "Reader failed");
        }
    }

    let _ = hub.unregister(id).await;
    closed.cancel();
}

async fn read_loop<S: FrameSource>(
    source: &mut S,
    id: ClientId,
    hub: &HubHandle,
    config: &PumpConfig,
    closed: &CancellationToken,
) -> Result<(), PumpError> {
    let mut deadline = Instant::now() + config.pong_wait;

    loop {
        let frame = tokio::select! {
            biased;

            () = closed.cancelled() => return Ok(()),

            next = time::timeout_at(deadline, source.recv()) => match next {
                Err(_) => return Err(PumpError::ReadTimeout(config.pong_wait)),
                Ok(None) => return Err(PumpError::Closed(Some(close_code::ABNORMAL))),
                Ok(Some(frame)) => frame?,
            },
        };

        match frame {
            Frame::Text(payload) | Frame::Binary(payload) => {
                if payload.len() > config.max_message_size {
                    return Err(PumpError::MessageTooLarge {
                        size: payload.len(),
                        limit: config.max_message_size,
                    });
                }
                metrics::record_inbound(payload.len());
                hub.broadcast(message::normalize(&payload)).await?;
            }
            Frame::Pong(_) => {
                deadline = Instant::now() + config.pong_wait;
                debug!(client = %id, "Pong received");
            }
            Frame::Ping(_) => {}
            Frame::Close(code) => return Err(PumpError::Closed(code)),
        }
    }
}

/// Drain the outbound queue to the connection and send liveness probes
/// until the queue closes or a write fails, then release the connection.
pub async fn write_pump<K: FrameSink>(
    mut sink: K,
    id: ClientId,
    mut queue: mpsc::Receiver<Bytes>,
    config: Arc<PumpConfig>,
    closed: CancellationToken,
) {
    match write_loop(&mut sink, &mut queue, &config, &closed).await {
        Ok(()) => debug!(client = %id, "Writer stopped"),
        Err(e) => {
            metrics::record_error(e.kind());
            warn!(client = %id, error = %e, "Writer failed");
        }
    }

    closed.cancel();
    let _ = sink.close().await;
}

async fn write_loop<K: FrameSink>(
    sink: &mut K,
    queue: &mut mpsc::Receiver<Bytes>,
    config: &PumpConfig,
    closed: &CancellationToken,
) -> Result<(), PumpError> {
    let mut ticker = time::interval_at(Instant::now() + config.ping_period, config.ping_period);

    loop {
        tokio::select! {
            next = queue.recv() => match next {
                Some(first) => {
                    // Only what is buffered right now joins this frame
                    let pending = queue.len();
                    let rest: Vec<Bytes> = std::iter::from_fn(|| queue.try_recv().ok())
                        .take(pending)
                        .collect();
                    let payloads = 1 + rest.len();
                    let body = message::coalesce(first, rest);
                    write(sink, Frame::Text(body), config.write_wait).await?;
                    metrics::record_outbound(payloads);
                }
                None => return send_close(sink, config.write_wait).await,
            },

            _ = ticker.tick() => {
                write(sink, Frame::ping(), config.write_wait).await?;
                metrics::record_ping();
            }

            () = closed.cancelled() => return send_close(sink, config.write_wait).await,
        }
    }
}

async fn write<K: FrameSink>(sink: &mut K, frame: Frame, wait: Duration) -> Result<(), PumpError> {
    time::timeout(wait, sink.send(frame))
        .await
        .map_err(|_| PumpError::WriteTimeout(wait))??;
    Ok(())
}

// A close frame that was already sent is not an error.
async fn send_close<K: FrameSink>(sink: &mut K, wait: Duration) -> Result<(), PumpError> {
    match write(sink, Frame::close(close_code::NORMAL), wait).await {
        Err(PumpError::Transport(TransportError::CloseSent)) => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_transport::memory;

    fn test_config() -> Arc<PumpConfig> {
        Arc::new(PumpConfig::default())
    }

    #[test]
    fn test_client_ids_are_unique() {
        let a = ClientId::next();
        let b = ClientId::next();
        assert_ne!(a, b);
        assert!(b > a);
        assert_eq!(a.to_string(), format!("client-{}", a.as_u64()));
    }

    #[test]
    fn test_default_config() {
        let config = PumpConfig::default();
        assert_eq!(config.max_message_size, 512);
        assert_eq!(config.send_buffer, 256);
        assert_eq!(config.pong_wait, Duration::from_secs(60));
        assert_eq!(config.ping_period, Duration::from_secs(54));
        assert_eq!(config.write_wait, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let config = PumpConfig {
            ping_period: Duration::from_secs(60),
            ..PumpConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PingPeriodTooLong { .. })
        ));

        let config = PumpConfig {
            send_buffer: 0,
            ..PumpConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Zero("send_buffer")));
    }

    #[test]
    fn test_expected_close_codes() {
        assert!(PumpError::Closed(Some(close_code::GOING_AWAY)).is_expected());
        assert!(PumpError::Closed(Some(close_code::ABNORMAL)).is_expected());
        assert!(!PumpError::Closed(Some(close_code::NORMAL)).is_expected());
        assert!(!PumpError::Closed(None).is_expected());
        assert!(!PumpError::ReadTimeout(Duration::from_secs(1)).is_expected());
        assert!(!PumpError::MessageTooLarge { size: 513, limit: 512 }.is_expected());
    }

    #[test]
    fn test_pump_error_display() {
        assert_eq!(
            PumpError::Closed(None).to_string(),
            "Peer closed connection (code none)"
        );
        assert_eq!(
            PumpError::Closed(Some(1008)).to_string(),
            "Peer closed connection (code 1008)"
        );
    }

    #[tokio::test]
    async fn test_writer_coalesces_buffered_payloads() {
        let (conn, mut peer) = memory::pair(8);
        let (sink, _source) = conn.split();
        let (tx, rx) = mpsc::channel(8);

        for payload in ["a", "b", "c"] {
            tx.try_send(Bytes::from(payload)).unwrap();
        }

        let closed = CancellationToken::new();
        let writer = tokio::spawn(write_pump(sink, ClientId::next(), rx, test_config(), closed));

        assert_eq!(peer.recv_text().await.as_deref(), Some("a\nb\nc"));

        drop(tx);
        assert_eq!(peer.recv().await, Some(Frame::close(close_code::NORMAL)));
        assert!(peer.recv().await.is_none());
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_writer_closes_on_cancel() {
        let (conn, mut peer) = memory::pair(8);
        let (sink, _source) = conn.split();
        let (_tx, rx) = mpsc::channel(8);

        let closed = CancellationToken::new();
        let writer = tokio::spawn(write_pump(
            sink,
            ClientId::next(),
            rx,
            test_config(),
            closed.clone(),
        ));

        closed.cancel();
        writer.await.unwrap();
        assert_eq!(peer.recv().await, Some(Frame::close(close_code::NORMAL)));
        assert!(peer.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_sends_pings() {
        let (conn, mut peer) = memory::pair(8);
        let (sink, _source) = conn.split();
        let (_tx, rx) = mpsc::channel::<Bytes>(8);
        let config = test_config();

        let closed = CancellationToken::new();
        let _writer = tokio::spawn(write_pump(
            sink,
            ClientId::next(),
            rx,
            Arc::clone(&config),
            closed.clone(),
        ));

        let start = Instant::now();
        assert_eq!(peer.recv().await, Some(Frame::ping()));
        assert!(start.elapsed() >= config.ping_period);
        assert_eq!(peer.recv().await, Some(Frame::ping()));
        assert!(start.elapsed() >= config.ping_period * 2);
        closed.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_fails_on_stalled_peer() {
        let (conn, mut peer) = memory::pair(1);
        let (sink, _source) = conn.split();
        let (tx, rx) = mpsc::channel(8);
        let closed = CancellationToken::new();

        let writer = tokio::spawn(write_pump(
            sink,
            ClientId::next(),
            rx,
            test_config(),
            closed.clone(),
        ));

        // The first frame fills the peer buffer, the second never fits
        tx.send(Bytes::from_static(b"one")).await.unwrap();
        time::sleep(Duration::from_millis(1)).await;
        tx.send(Bytes::from_static(b"two")).await.unwrap();

        writer.await.unwrap();
        assert!(closed.is_cancelled());
        assert_eq!(peer.recv_text().await.as_deref(), Some("one"));
    }

    #[tokio::test]
    async fn test_reader_rejects_oversized_message() {
        let (handle, mut commands) = crate::hub::channel(8);
        let (conn, mut peer) = memory::pair(8);
        let (_sink, source) = conn.split();
        let id = ClientId::next();
        let closed = CancellationToken::new();

        let reader = tokio::spawn(read_pump(source, id, handle, test_config(), closed.clone()));
        peer.send_text("x".repeat(513)).await.unwrap();
        reader.await.unwrap();

        assert!(closed.is_cancelled());
        match commands.recv().await {
            Some(crate::hub::Command::Unregister(unregistered)) => assert_eq!(unregistered, id),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reader_forwards_normalized_payload() {
        let (handle, mut commands) = crate::hub::channel(8);
        let (conn, mut peer) = memory::pair(8);
        let (_sink, source) = conn.split();
        let id = ClientId::next();
        let closed = CancellationToken::new();

        let reader = tokio::spawn(read_pump(source, id, handle, test_config(), closed.clone()));
        peer.send_text("  hello\nworld  ").await.unwrap();
        peer.send(Frame::close(close_code::GOING_AWAY)).await.unwrap();
        reader.await.unwrap();

        match commands.recv().await {
            Some(crate::hub::Command::Broadcast(payload)) => {
                assert_eq!(&payload[..], b"hello world");
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(matches!(
            commands.recv().await,
            Some(crate::hub::Command::Unregister(_))
        ));
    }
}
