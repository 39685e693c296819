use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use helm_hub::SessionHub;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::client::{self, ClientRegistry};
use crate::handlers::HandlerState;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    /// `0` picks a free port.
    pub port: u16,
    pub max_send_queue: usize,
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 31822,
            max_send_queue: 256,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub handlers: Arc<HandlerState>,
    pub max_message_size: usize,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve. The returned handle stops the listener on `shutdown`.
pub async fn start(config: ServerConfig, hub: SessionHub) -> Result<ServerHandle, std::io::Error> {
    let registry = Arc::new(ClientRegistry::new(config.max_send_queue));
    let cleanup = client::start_cleanup_task(Arc::clone(&registry), CLEANUP_INTERVAL);

    let state = AppState {
        handlers: Arc::new(HandlerState::new(hub, registry)),
        max_message_size: config.max_message_size,
    };
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;
    info!(%addr, "helm server listening");

    let stop = CancellationToken::new();
    let serve_stop = stop.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(serve_stop.cancelled_owned())
            .await
        {
            warn!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        addr,
        stop,
        server,
        cleanup,
    })
}

pub struct ServerHandle {
    pub addr: SocketAddr,
    stop: CancellationToken,
    server: JoinHandle<()>,
    cleanup: JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting connections and wait for the listener to close.
    /// Open WebSocket connections are dropped with the runtime.
    pub async fn shutdown(self) {
        self.stop.cancel();
        self.cleanup.abort();
        if let Err(e) = self.server.await {
            warn!(error = %e, "server task failed");
        }
        info!("helm server stopped");
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (client_id, rx) = state.handlers.registry.register();
    info!(client_id = %client_id, "client connected");
    client::handle_ws_connection(socket, client_id, rx, state.handlers).await;
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.handlers.health())
}

#[cfg(test)]
mod tests {
    use super::*;
    use helm_agent::ScriptedAgent;
    use helm_hub::HubConfig;
    use helm_store::{Database, SqlitePersistence};

    fn hub() -> SessionHub {
        SessionHub::new(
            Arc::new(ScriptedAgent::new(vec![])),
            Arc::new(SqlitePersistence::new(Database::in_memory().unwrap())),
            HubConfig::default(),
        )
    }

    #[tokio::test]
    async fn serves_health() {
        let config = ServerConfig {
            port: 0,
            ..Default::default()
        };
        let handle = start(config, hub()).await.unwrap();
        assert!(handle.port() > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port());
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["loadedSessions"], 0);

        handle.shutdown().await;
    }
}
