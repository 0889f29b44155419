//! Connection handlers for the Chorus server.
//!
//! This module wires the HTTP surface to the relay core: the WebSocket
//! upgrade endpoint, the landing page and static assets, and a health probe.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::shutdown::{self, ShutdownCoordinator};
use anyhow::{ensure, Context, Result};
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chorus_core::{hub, Client, Hub, HubHandle, PumpConfig};
use serde_json::{json, Value};
use std::future::IntoFuture;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{self, Instant};
use tower_http::services::{ServeDir, ServeFile};
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Front door to the hub loop.
    pub hub: HubHandle,
    /// Pump settings shared by every client.
    pub pump: Arc<PumpConfig>,
    /// Server configuration.
    pub config: Config,
    /// Process-wide cancellation and task tracking.
    pub shutdown: ShutdownCoordinator,
}

impl AppState {
    /// Create app state and spawn the hub loop on the shutdown tracker.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is inconsistent.
    pub fn new(config: Config, shutdown: ShutdownCoordinator) -> Result<Self> {
        let pump = Arc::new(config.pump_config()?);
        ensure!(
            config.limits.hub_capacity > 0,
            "limits.hub_capacity must be greater than zero"
        );

        let (hub, commands) = hub::channel(config.limits.hub_capacity);
        let token = shutdown.token().clone();
        shutdown.tracker().spawn(async move {
            Hub::new().run_until(commands, token).await;
        });

        Ok(Self {
            hub,
            pump,
            config,
            shutdown,
        })
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    let static_dir = &state.config.static_dir;

    Router::new()
        .route(&state.config.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route_service("/", ServeFile::new(static_dir.join("index.html")))
        .nest_service("/static", ServeDir::new(static_dir))
        .with_state(Arc::clone(&state))
}

/// Run the HTTP/WebSocket server until SIGINT or SIGTERM.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the server fails to
/// start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(&config.host, config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let coordinator = ShutdownCoordinator::new();
    let state = Arc::new(AppState::new(config, coordinator.clone())?);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Chorus server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, state.config.websocket_path
    );

    tokio::spawn(async move {
        shutdown::wait_for_signal().await;
        coordinator.shutdown();
    });

    serve(listener, state).await
}

/// Serve on `listener` until the shutdown token is cancelled, then drain.
///
/// One deadline, the configured shutdown timeout, starts at cancellation
/// and covers both in-flight HTTP requests and the tracked pumps and hub
/// loop. Whatever is still running when it passes is abandoned.
///
/// # Errors
///
/// Returns an error if the HTTP server fails.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    let coordinator = state.shutdown.clone();
    let timeout = state.config.shutdown_timeout();
    let token = coordinator.token().clone();

    let app = router(state);
    let stop = token.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .into_future();
    tokio::pin!(server);

    let http_drained = tokio::select! {
        result = &mut server => {
            result.context("HTTP server failed")?;
            true
        }
        () = token.cancelled() => false,
    };

    let deadline = Instant::now() + timeout;
    info!("Stopped accepting connections, draining clients");
    if !http_drained {
        match time::timeout_at(deadline, &mut server).await {
            Ok(result) => result.context("HTTP server failed")?,
            Err(_) => warn!("HTTP requests still in flight after {timeout:?}, abandoning them"),
        }
    }

    let remaining = deadline.saturating_duration_since(Instant::now());
    if coordinator.graceful_shutdown(remaining).await {
        info!("Chorus server stopped");
    } else {
        warn!("Chorus server stopped before every connection drained");
    }
    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let clients = state.hub.stats().await.ok().map(|stats| stats.clients);
    let status = if clients.is_some() && !state.shutdown.is_shutting_down() {
        "ok"
    } else {
        "stopping"
    };

    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "clients": clients,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    if state.shutdown.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let limit = state.pump.max_message_size;
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_failed_upgrade(|e| warn!(error = %e, "WebSocket upgrade failed"))
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle an upgraded WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    if state.shutdown.is_shutting_down() {
        debug!("Shutdown in progress, dropping upgraded connection");
        return;
    }

    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let client = match Client::start(
        socket,
        &state.hub,
        Arc::clone(&state.pump),
        state.shutdown.token(),
        state.shutdown.tracker(),
    )
    .await
    {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "Failed to register connection");
            return;
        }
    };

    debug!(client = %client.id(), "WebSocket connected");
    client.closed().await;
    debug!(client = %client.id(), "WebSocket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::{connect_async, tungstenite::Message};

    const TIMEOUT: Duration = Duration::from_secs(5);

    type WsStream =
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

    fn test_config() -> Config {
        Config {
            host: "127.0.0.1".into(),
            port: 0,
            static_dir: concat!(env!("CARGO_MANIFEST_DIR"), "/../../static").into(),
            ..Config::default()
        }
    }

    /// Boot a server on an ephemeral port.
    async fn boot_server() -> (SocketAddr, Arc<AppState>, tokio::task::JoinHandle<Result<()>>) {
        boot_server_with(test_config()).await
    }

    async fn boot_server_with(
        config: Config,
    ) -> (SocketAddr, Arc<AppState>, tokio::task::JoinHandle<Result<()>>) {
        let state = Arc::new(AppState::new(config, ShutdownCoordinator::new()).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(listener, Arc::clone(&state)));
        (addr, state, server)
    }

    async fn connect(addr: SocketAddr) -> WsStream {
        let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        ws
    }

    async fn wait_for_clients(state: &AppState, expected: usize) {
        tokio::time::timeout(TIMEOUT, async {
            while state.hub.stats().await.unwrap().clients != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("client count never reached the expected value");
    }

    async fn next_text(ws: &mut WsStream) -> String {
        tokio::time::timeout(TIMEOUT, async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => return text,
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    other => panic!("unexpected message: {other:?}"),
                }
            }
        })
        .await
        .expect("no text message within timeout")
    }

    #[tokio::test]
    async fn test_health_reports_clients() {
        let state = Arc::new(AppState::new(test_config(), ShutdownCoordinator::new()).unwrap());

        let Json(body) = health_handler(State(Arc::clone(&state))).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["clients"], 0);
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));

        state.shutdown.shutdown();
        let Json(body) = health_handler(State(state)).await;
        assert_eq!(body["status"], "stopping");
    }

    #[test]
    fn test_app_state_rejects_bad_heartbeat() {
        let mut config = test_config();
        config.heartbeat.ping_period_ms = config.heartbeat.pong_wait_ms + 1;
        assert!(AppState::new(config, ShutdownCoordinator::new()).is_err());
    }

    #[tokio::test]
    async fn test_relay_between_websocket_clients() {
        let (addr, state, server) = boot_server().await;

        let mut alice = connect(addr).await;
        let mut bob = connect(addr).await;
        wait_for_clients(&state, 2).await;

        alice
            .send(Message::Text("  hello\nworld  ".into()))
            .await
            .unwrap();

        assert_eq!(next_text(&mut bob).await, "hello world");
        assert_eq!(next_text(&mut alice).await, "hello world");

        alice.close(None).await.unwrap();
        wait_for_clients(&state, 1).await;

        state.shutdown.shutdown();
        let closed = tokio::time::timeout(TIMEOUT, async {
            loop {
                match bob.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "client was not closed on shutdown");

        tokio::time::timeout(TIMEOUT, server)
            .await
            .expect("server did not stop within the shutdown window")
            .unwrap()
            .unwrap();
        assert!(state.hub.is_closed());
    }

    #[tokio::test]
    async fn test_oversized_message_closes_connection() {
        let (addr, state, _server) = boot_server().await;

        let mut big = connect(addr).await;
        let mut small = connect(addr).await;
        wait_for_clients(&state, 2).await;

        big.send(Message::Text("x".repeat(1024))).await.unwrap();
        wait_for_clients(&state, 1).await;

        small.send(Message::Text("fits".into())).await.unwrap();
        assert_eq!(next_text(&mut small).await, "fits");
    }

    #[tokio::test]
    async fn test_landing_page_is_served() {
        let (addr, _state, _server) = boot_server().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let mut response = String::new();
        tokio::time::timeout(TIMEOUT, stream.read_to_string(&mut response))
            .await
            .unwrap()
            .unwrap();

        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("<title>Chorus</title>"));
    }

    #[tokio::test]
    async fn test_shutdown_is_bounded_by_stalled_http_download() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.bin"), vec![0u8; 64 * 1024 * 1024]).unwrap();

        let mut config = test_config();
        config.static_dir = dir.path().to_path_buf();
        config.shutdown.timeout_ms = 500;
        let (addr, state, server) = boot_server_with(config).await;

        // Start a large download, then stop reading it
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /static/big.bin HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut head = [0u8; 16];
        tokio::time::timeout(TIMEOUT, stream.read_exact(&mut head))
            .await
            .unwrap()
            .unwrap();
        assert!(head.starts_with(b"HTTP/1.1 200"));

        let started = Instant::now();
        state.shutdown.shutdown();
        tokio::time::timeout(Duration::from_secs(3), server)
            .await
            .expect("serve() did not return within the shutdown window")
            .unwrap()
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(3));

        drop(stream);
    }

    #[tokio::test]
    async fn test_upgrade_refused_after_shutdown() {
        let state = Arc::new(AppState::new(test_config(), ShutdownCoordinator::new()).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Without graceful shutdown the listener stays open, so the request
        // reaches the upgrade handler after cancellation.
        let app = router(Arc::clone(&state));
        tokio::spawn(async move { axum::serve(listener, app).await });
        state.shutdown.shutdown();

        match connect_async(format!("ws://{addr}/ws")).await {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status().as_u16(), 503);
            }
            Err(e) => panic!("unexpected handshake error: {e}"),
            Ok(_) => panic!("upgrade accepted after shutdown"),
        }

        let clients = state.hub.stats().await.map_or(0, |stats| stats.clients);
        assert_eq!(clients, 0);
    }
}
