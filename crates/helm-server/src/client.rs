use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use helm_core::ids::SessionId;
use helm_hub::Subscription;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::compat;
use crate::handlers::{self, HandlerState};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientId(pub String);

impl Default for ClientId {
    fn default() -> Self {
        Self(format!("client_{}", Uuid::now_v7()))
    }
}

impl ClientId {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A connected WebSocket client and the session feeds forwarded to it.
pub struct Client {
    pub id: ClientId,
    tx: mpsc::Sender<String>,
    forwards: Mutex<HashMap<SessionId, JoinHandle<()>>>,
    last_pong: AtomicU64,
}

impl Client {
    fn new(id: ClientId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            tx,
            forwards: Mutex::new(HashMap::new()),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < CLIENT_TIMEOUT.as_secs()
    }

    fn abort_forwards(&self) {
        for (_, task) in self.forwards.lock().drain() {
            task.abort();
        }
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of connected clients. Removing a client aborts its forwarding
/// tasks; turns keep running in the hub.
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<Client>>,
    max_send_queue: usize,
}

impl ClientRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            clients: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a new client and return its id plus the outbound queue.
    pub fn register(&self) -> (ClientId, mpsc::Receiver<String>) {
        let id = ClientId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        self.clients
            .insert(id.clone(), Arc::new(Client::new(id.clone(), tx)));
        (id, rx)
    }

    pub fn unregister(&self, id: &ClientId) {
        if let Some((_, client)) = self.clients.remove(id) {
            client.abort_forwards();
        }
    }

    /// Queue a response for a client. Drops the message when the queue is full.
    pub fn send_to(&self, client_id: &ClientId, message: String) -> bool {
        let Some(tx) = self.clients.get(client_id).map(|c| c.tx.clone()) else {
            return false;
        };
        match tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                warn!(client_id = %client_id, msg_len = msg.len(), "send queue full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Forward a hub subscription to the client, replacing any earlier feed
    /// for the same session. `false` when the client is gone.
    pub fn attach(&self, client_id: &ClientId, session_id: SessionId, subscription: Subscription) -> bool {
        let Some(client) = self.clients.get(client_id).map(|c| Arc::clone(c.value())) else {
            return false;
        };
        let task = tokio::spawn(forward(
            session_id.clone(),
            subscription,
            client.tx.clone(),
        ));
        if let Some(old) = client.forwards.lock().insert(session_id, task) {
            old.abort();
        }
        true
    }

    /// Stop forwarding a session. `false` when it was not being forwarded.
    pub fn detach(&self, client_id: &ClientId, session_id: &SessionId) -> bool {
        let Some(client) = self.clients.get(client_id) else {
            return false;
        };
        let task = client.forwards.lock().remove(session_id);
        match task {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    /// Number of sessions forwarded to a client.
    pub fn forward_count(&self, client_id: &ClientId) -> usize {
        self.clients
            .get(client_id)
            .map(|c| c.forwards.lock().len())
            .unwrap_or(0)
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    fn record_pong(&self, client_id: &ClientId) {
        if let Some(client) = self.clients.get(client_id) {
            client.record_pong();
        }
    }

    /// Remove clients that have not answered a ping within the timeout.
    pub fn cleanup_dead_clients(&self) -> usize {
        let dead: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|entry| !entry.value().is_alive())
            .map(|entry| entry.key().clone())
            .collect();
        for id in &dead {
            self.unregister(id);
            info!(client_id = %id, "cleaned up dead client");
        }
        dead.len()
    }
}

async fn forward(session_id: SessionId, mut subscription: Subscription, tx: mpsc::Sender<String>) {
    while let Some(event) = subscription.recv().await {
        let text = match compat::session_event(&session_id, &event) {
            Ok(text) => text,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "failed to encode session event");
                continue;
            }
        };
        if tx.send(text).await.is_err() {
            break;
        }
    }
    debug!(session_id = %session_id, "session feed ended");
}

/// Drive one WebSocket connection: a writer task draining the outbound
/// queue with periodic pings, and a reader that handles requests in order.
pub async fn handle_ws_connection(
    socket: WebSocket,
    client_id: ClientId,
    mut rx: mpsc::Receiver<String>,
    state: Arc<HandlerState>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_cid = client_id.clone();
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    trace!(client_id = %writer_cid, "sent ping");
                }
            }
        }
    });

    let reader_cid = client_id.clone();
    let reader_state = Arc::clone(&state);
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    let reply = handlers::handle_text(&reader_state, &reader_cid, text.as_str()).await;
                    let _ = reader_state.registry.send_to(&reader_cid, reply);
                }
                WsMessage::Pong(_) => reader_state.registry.record_pong(&reader_cid),
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    let writer_abort = writer.abort_handle();
    let reader_abort = reader.abort_handle();
    tokio::select! {
        _ = writer => reader_abort.abort(),
        _ = reader => writer_abort.abort(),
    }

    state.registry.unregister(&client_id);
    info!(client_id = %client_id, "client disconnected");
}

/// Periodically remove clients that stopped answering pings.
pub fn start_cleanup_task(registry: Arc<ClientRegistry>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = registry.cleanup_dead_clients();
            if removed > 0 {
                info!(removed, "dead client cleanup");
            }
        }
    })
}
