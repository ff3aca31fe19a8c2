use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::registry::RelayRegistry;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("relay server failed: {0}")]
    Serve(#[source] std::io::Error),
}

pub struct AppState {
    registry: RelayRegistry,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(registry: RelayRegistry, metrics: Option<PrometheusHandle>) -> Self {
        Self { registry, metrics }
    }

    fn render_metrics(&self) -> Option<String> {
        self.metrics.as_ref().map(PrometheusHandle::render)
    }
}

pub struct RelayServer {
    listener: TcpListener,
    state: Arc<AppState>,
}

impl RelayServer {
    pub async fn bind(
        config: &RelayConfig,
        metrics: Option<PrometheusHandle>,
    ) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: config.listen_addr,
                source,
            })?;
        let registry = RelayRegistry::new(config.channel_depth);
        Ok(Self {
            listener,
            state: Arc::new(AppState::new(registry, metrics)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        self.listener.local_addr().map_err(RelayError::Serve)
    }

    pub fn registry(&self) -> RelayRegistry {
        self.state.registry.clone()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Ok(addr) = self.listener.local_addr() {
            info!("duet-relay listening on {addr}");
        }
        axum::serve(self.listener, router(self.state))
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(RelayError::Serve)
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/healthz", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.stats())
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

async fn ws_handler(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let registration = state.registry.register();
    let connection_id = registration.id;
    let mut outbound = registration.receiver;
    info!(
        connection_id = %connection_id,
        active = registration.active_connections,
        "relay connection established"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if let Err(err) = ws_tx.send(message).await {
                debug!(connection_id = %connection_id, error = %err, "socket write failed");
                return;
            }
        }
        // The registry dropped our sender: this connection was evicted.
        let _ = ws_tx.close().await;
    });

    loop {
        tokio::select! {
            _ = &mut writer => {
                debug!(connection_id = %connection_id, "writer task finished");
                break;
            }
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Close(frame))) => {
                    info!(
                        connection_id = %connection_id,
                        reason = ?frame.map(|f| f.reason.to_string()),
                        "client closed websocket"
                    );
                    break;
                }
                Some(Ok(message @ (Message::Text(_) | Message::Binary(_)))) => {
                    let outcome = state.registry.broadcast(connection_id, message);
                    debug!(
                        connection_id = %connection_id,
                        delivered = outcome.delivered,
                        evicted = outcome.evicted,
                        "frame forwarded"
                    );
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    warn!(
                        connection_id = %connection_id,
                        error = %err,
                        "error receiving message"
                    );
                    break;
                }
                None => break,
            },
        }
    }

    state.registry.unregister(connection_id);
    writer.abort();
    info!(
        connection_id = %connection_id,
        active = state.registry.len(),
        "relay connection closed"
    );
}
