//! Broker runtime: UDP ingest plus the WebSocket subscriber server.
//!
//! # Architecture
//!
//! ```text
//! ESP32 ──UDP──→ IngestPipeline ──→ SourceRegistry
//!                      │
//!                      ▼
//!                 Broadcaster ──→ per-connection queue ──→ WebSocket
//!                                                            │
//!            SourceRegistry ←── CommandServer ←── commands ──┘
//! ```
//!
//! Each subscriber connection runs a reader loop (commands) and a writer task
//! that drains its bounded outbound queue into the socket. Every socket write
//! is bounded by the configured send timeout.

use crate::broadcast::{Broadcaster, OutboundMessage};
use crate::config::{Config, ConfigError};
use crate::core::epoch_seconds;
use crate::counters::{BrokerCounters, SharedCounters};
use crate::ingest::{run_udp_listener, IngestPipeline};
use crate::protocol::{Command, Outbound, Reply};
use crate::registry::SourceRegistry;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// How long shutdown waits for each background task.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Sent to each subscriber after the initial replay.
const CONNECTED_MESSAGE: &str = "Connected to BPM Broker";

/// Startup failures. Everything after startup is logged, never returned.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared broker state.
pub struct BrokerState {
    pub config: Config,
    pub registry: Arc<SourceRegistry>,
    pub broadcaster: Arc<Broadcaster>,
    pub pipeline: Arc<IngestPipeline>,
    pub counters: SharedCounters,
    shutdown: watch::Receiver<bool>,
}

impl BrokerState {
    /// Wire up registry, broadcaster and pipeline for one broker instance.
    pub fn new(config: Config, shutdown: watch::Receiver<bool>) -> Self {
        let counters: SharedCounters = Arc::new(BrokerCounters::new());
        let registry = Arc::new(SourceRegistry::new(config.clone()));
        let broadcaster = Arc::new(Broadcaster::new(counters.clone()));
        let pipeline = Arc::new(IngestPipeline::new(
            registry.clone(),
            broadcaster.clone(),
            counters.clone(),
        ));

        Self {
            config,
            registry,
            broadcaster,
            pipeline,
            counters,
            shutdown,
        }
    }

    /// Decode and answer one inbound text message.
    pub fn handle_message(&self, text: &str) -> Outbound {
        match Command::parse(text) {
            Ok(command) => self.execute(command),
            Err(e) => {
                tracing::warn!(error = %e, "Rejected subscriber command");
                Reply::error(e.to_string()).into()
            }
        }
    }

    /// Answer a decoded command from registry state.
    pub fn execute(&self, command: Command) -> Outbound {
        let timestamp = epoch_seconds(Utc::now());
        match command {
            Command::GetStatus => {
                let latest_data = self.registry.all_latest();
                Reply::StatusResponse {
                    active_devices: latest_data.keys().copied().collect(),
                    connected_clients: self.broadcaster.subscriber_count(),
                    latest_data,
                    smoothing_enabled: self.config.smoothing.enabled,
                    smoothing_config: (&self.config).into(),
                    counters: self.counters.snapshot(),
                    timestamp,
                }
                .into()
            }
            Command::GetLatest { source_id } => match self.registry.latest(source_id) {
                Some(reading) => Outbound::Reading(reading),
                None => Reply::error("Source not found").into(),
            },
            Command::GetSignalHistory { source_id } => match self.registry.history(source_id) {
                Some(history) if !history.history.is_empty() => Reply::SignalHistoryResponse {
                    user_id: source_id,
                    history: history.history,
                    statistics: history.statistics,
                    timestamp,
                }
                .into(),
                _ => Reply::error("Source not found or no signal data").into(),
            },
            Command::GetAllStatistics => Reply::AllStatisticsResponse {
                user_statistics: self.registry.all_statistics(),
                timestamp,
            }
            .into(),
        }
    }
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub sources: usize,
    pub subscribers: usize,
}

/// GET /health
async fn health(State(state): State<Arc<BrokerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        sources: state.registry.len(),
        subscribers: state.broadcaster.subscriber_count(),
    })
}

/// WebSocket upgrade on any path other than /health.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<Arc<BrokerState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, remote, state))
}

/// Build the subscriber router.
pub fn router(state: Arc<BrokerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(ws_handler)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Per-connection protocol loop.
async fn handle_connection(socket: WebSocket, remote: SocketAddr, state: Arc<BrokerState>) {
    state.counters.record_connection();
    tracing::info!(remote = %remote, "Subscriber connected");

    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::channel::<OutboundMessage>(state.config.subscriber_queue_capacity);
    let mut writer = tokio::spawn(write_loop(sink, rx, state.config.send_timeout, remote));
    let mut writer_finished = false;

    let id = state.broadcaster.register(remote, tx.clone());

    let mut shutdown = state.shutdown.clone();
    let mut connected = replay_latest(&state, &tx).await;
    if connected {
        let status = Reply::Status {
            message: CONNECTED_MESSAGE.to_string(),
            active_devices: state.registry.source_ids(),
            timestamp: epoch_seconds(Utc::now()),
        };
        connected = enqueue(&tx, status.into()).await;
    }

    if connected {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::debug!(remote = %remote, "Closing subscriber for shutdown");
                    break;
                }
                _ = &mut writer, if !writer_finished => {
                    writer_finished = true;
                    break;
                }
                msg = stream.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                            Ok(text) => text,
                            Err(_) => {
                                enqueue(&tx, Reply::error("Binary message is not valid UTF-8").into()).await;
                                continue;
                            }
                        },
                        Some(Ok(Message::Close(_))) | None => {
                            tracing::debug!(remote = %remote, "Subscriber closed connection");
                            break;
                        }
                        // Pings are answered by axum
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            tracing::debug!(remote = %remote, error = %e, "Subscriber read error");
                            break;
                        }
                    };

                    if text.trim().is_empty() {
                        continue;
                    }
                    let reply = state.handle_message(&text);
                    if !enqueue(&tx, reply).await {
                        break;
                    }
                }
            }
        }
    }

    state.broadcaster.unregister(id);
    drop(tx);

    if !writer_finished && tokio::time::timeout(SHUTDOWN_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }
    tracing::info!(remote = %remote, "Subscriber disconnected");
}

/// Queue the latest reading of every known source, one message each.
///
/// Each reading waits for a free queue slot before its source is locked, so
/// nothing is dropped and live readings for that source queue up behind it.
/// Returns false once the writer is gone.
async fn replay_latest(state: &BrokerState, tx: &mpsc::Sender<OutboundMessage>) -> bool {
    for source in state.registry.source_ids() {
        let Ok(permit) = tx.reserve().await else {
            return false;
        };
        state.registry.with_latest(source, |reading| match serde_json::to_string(reading) {
            Ok(json) => permit.send(json.into()),
            Err(e) => tracing::error!(error = %e, source = %source, "Failed to serialize replay reading"),
        });
    }
    true
}

/// Queue a reply for this connection. Returns false once the writer is gone.
async fn enqueue(tx: &mpsc::Sender<OutboundMessage>, outbound: Outbound) -> bool {
    match outbound.to_message() {
        Ok(message) => tx.send(message).await.is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize reply");
            true
        }
    }
}

/// Drain the outbound queue into the socket, then close it.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<OutboundMessage>,
    send_timeout: Duration,
    remote: SocketAddr,
) {
    while let Some(message) = rx.recv().await {
        match tokio::time::timeout(send_timeout, sink.send(Message::Text(message.to_string()))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(remote = %remote, error = %e, "Send to subscriber failed");
                return;
            }
            Err(_) => {
                tracing::warn!(remote = %remote, "Send to subscriber timed out");
                return;
            }
        }
    }
    let _ = tokio::time::timeout(send_timeout, sink.send(Message::Close(None))).await;
}

/// Handle to a running broker.
pub struct BrokerHandle {
    pub ingest_addr: SocketAddr,
    pub subscriber_addr: SocketAddr,
    state: Arc<BrokerState>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl BrokerHandle {
    pub fn state(&self) -> &Arc<BrokerState> {
        &self.state
    }

    /// Stop the UDP listener, close every subscriber and wait for the servers to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                tracing::warn!("Background task did not stop in time");
            }
        }
        tracing::info!("Broker stopped");
    }
}

/// Bind both listeners and start serving.
pub async fn run(config: Config) -> Result<BrokerHandle, ServerError> {
    config.validate()?;

    let ingest_bind = config.ingest.bind_addr();
    let udp = UdpSocket::bind(&ingest_bind)
        .await
        .map_err(|source| ServerError::Bind {
            addr: ingest_bind.clone(),
            source,
        })?;
    let subscriber_bind = config.subscriber.bind_addr();
    let listener = TcpListener::bind(&subscriber_bind)
        .await
        .map_err(|source| ServerError::Bind {
            addr: subscriber_bind.clone(),
            source,
        })?;

    let ingest_addr = udp.local_addr()?;
    let subscriber_addr = listener.local_addr()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = Arc::new(BrokerState::new(config, shutdown_rx.clone()));

    let udp_task = tokio::spawn(run_udp_listener(
        udp,
        state.pipeline.clone(),
        state.config.max_datagram_size,
        shutdown_rx.clone(),
    ));

    let app = router(state.clone());
    let mut http_shutdown = shutdown_rx;
    let http_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = http_shutdown.changed().await;
            tracing::info!("Subscriber server shutdown signal received");
        })
        .await
        {
            tracing::error!(error = %e, "Subscriber server error");
        }
    });

    tracing::info!(udp = %ingest_addr, "Ingest listening for device datagrams");
    tracing::info!(ws = %format!("ws://{subscriber_addr}"), "Subscriber server listening");

    Ok(BrokerHandle {
        ingest_addr,
        subscriber_addr,
        state,
        shutdown_tx,
        tasks: vec![udp_task, http_task],
    })
}
