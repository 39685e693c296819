//! RPC method handlers. Each one maps a request onto a hub operation.

use std::sync::Arc;
use std::time::Instant;

use helm_core::ids::{QueuedMessageId, SessionId};
use helm_core::messages::MessagePart;
use helm_core::persistence::NewSession;
use helm_hub::{SendRequest, SessionHub};
use serde_json::{json, Value};
use tracing::debug;

use crate::client::{ClientId, ClientRegistry};
use crate::compat;
use crate::rpc::{self, RpcError, RpcRequest, RpcResponse};

const DEFAULT_LIST_LIMIT: u32 = 50;

/// Shared state available to all handlers.
pub struct HandlerState {
    pub hub: SessionHub,
    pub registry: Arc<ClientRegistry>,
    pub started_at: Instant,
}

impl HandlerState {
    pub fn new(hub: SessionHub, registry: Arc<ClientRegistry>) -> Self {
        Self {
            hub,
            registry,
            started_at: Instant::now(),
        }
    }

    /// Body of `system.ping` and `/health`.
    pub fn health(&self) -> Value {
        json!({
            "status": "healthy",
            "uptimeSecs": self.started_at.elapsed().as_secs(),
            "loadedSessions": self.hub.loaded_sessions(),
            "streamingSessions": self.hub.streaming_sessions(),
            "clients": self.registry.count(),
        })
    }
}

/// Parse one text frame and produce the serialized response.
pub async fn handle_text(state: &Arc<HandlerState>, client_id: &ClientId, raw: &str) -> String {
    let response = match serde_json::from_str::<RpcRequest>(raw) {
        Ok(request) => {
            let params = request.params.unwrap_or_else(|| json!({}));
            dispatch(state, client_id, &request.method, &params, request.id).await
        }
        Err(e) => RpcResponse::failure(None, &RpcError::Parse(e.to_string())),
    };
    serde_json::to_string(&response).unwrap_or_else(|e| {
        format!(r#"{{"id":null,"success":false,"error":{{"code":"INTERNAL_ERROR","message":"{e}"}}}}"#)
    })
}

/// Route a method to its handler. camelCase params are normalized first.
pub async fn dispatch(
    state: &Arc<HandlerState>,
    client_id: &ClientId,
    method: &str,
    params: &Value,
    id: Option<Value>,
) -> RpcResponse {
    let params = compat::normalize_params(params);
    debug!(client_id = %client_id, method, "rpc call");

    let result = match method {
        "session.create" => session_create(state, &params).await,
        "session.list" => session_list(state, &params).await,
        "session.send" => session_send(state, &params).await,
        "session.subscribe" => session_subscribe(state, client_id, &params).await,
        "session.unsubscribe" => session_unsubscribe(state, client_id, &params),
        "session.interrupt" => session_interrupt(state, &params).await,
        "session.dequeue" => session_dequeue(state, &params).await,
        "session.getState" => session_get_state(state, &params).await,
        "session.respond" => session_respond(state, &params).await,
        "session.delete" => session_delete(state, &params).await,
        "session.history" => session_history(state, &params).await,
        "system.ping" => Ok(state.health()),
        _ => Err(RpcError::MethodNotFound(method.to_string())),
    };
    RpcResponse::from_result(id, result)
}

fn session_id(params: &Value) -> Result<SessionId, RpcError> {
    rpc::require_str(params, "session_id").map(SessionId::from_raw)
}

async fn session_create(state: &HandlerState, params: &Value) -> Result<Value, RpcError> {
    let cwd = rpc::optional_str(params, "cwd")
        .or_else(|| rpc::optional_str(params, "working_directory"))
        .unwrap_or_default();
    let record = state
        .hub
        .create_session(NewSession {
            title: rpc::optional_str(params, "title").map(String::from),
            cwd: cwd.to_string(),
        })
        .await?;
    Ok(serde_json::to_value(record)?)
}

async fn session_list(state: &HandlerState, params: &Value) -> Result<Value, RpcError> {
    let limit = rpc::optional_u32(params, "limit")?.unwrap_or(DEFAULT_LIST_LIMIT);
    let offset = rpc::optional_u32(params, "offset")?.unwrap_or(0);
    // One extra row tells whether another page exists.
    let mut sessions = state
        .hub
        .list_sessions(limit.saturating_add(1), offset)
        .await?;
    let has_more = sessions.len() > limit as usize;
    sessions.truncate(limit as usize);
    Ok(json!({ "sessions": sessions, "hasMore": has_more }))
}

async fn session_send(state: &HandlerState, params: &Value) -> Result<Value, RpcError> {
    let id = session_id(params)?;
    let content = rpc::require_str(params, "content")?;
    let parts = match params.get("parts") {
        None | Some(Value::Null) => Vec::new(),
        Some(raw) => serde_json::from_value::<Vec<MessagePart>>(raw.clone())
            .map_err(|e| RpcError::InvalidParams(format!("invalid parts: {e}")))?,
    };
    let outcome = state
        .hub
        .send(
            &id,
            SendRequest {
                content: content.to_string(),
                client_message_id: rpc::optional_str(params, "client_message_id").map(String::from),
                parts,
            },
        )
        .await?;
    Ok(serde_json::to_value(outcome)?)
}

async fn session_subscribe(
    state: &HandlerState,
    client_id: &ClientId,
    params: &Value,
) -> Result<Value, RpcError> {
    let id = session_id(params)?;
    let subscription = state.hub.subscribe(&id).await?;
    if !state.registry.attach(client_id, id, subscription) {
        return Err(RpcError::Internal(format!("client {client_id} is not connected")));
    }
    Ok(json!({ "subscribed": true }))
}

fn session_unsubscribe(
    state: &HandlerState,
    client_id: &ClientId,
    params: &Value,
) -> Result<Value, RpcError> {
    let id = session_id(params)?;
    Ok(json!({ "unsubscribed": state.registry.detach(client_id, &id) }))
}

async fn session_interrupt(state: &HandlerState, params: &Value) -> Result<Value, RpcError> {
    let id = session_id(params)?;
    let interrupted = state.hub.interrupt(&id).await?;
    Ok(json!({ "interrupted": interrupted }))
}

async fn session_dequeue(state: &HandlerState, params: &Value) -> Result<Value, RpcError> {
    let id = session_id(params)?;
    let queued = rpc::optional_str(params, "queued_id")
        .or_else(|| rpc::optional_str(params, "message_id"))
        .ok_or_else(|| RpcError::InvalidParams("missing required parameter: queued_id".into()))?;
    let removed = state
        .hub
        .dequeue_message(&id, &QueuedMessageId::from_raw(queued))
        .await?;
    Ok(json!({ "removed": removed }))
}

async fn session_get_state(state: &HandlerState, params: &Value) -> Result<Value, RpcError> {
    let id = session_id(params)?;
    Ok(serde_json::to_value(state.hub.get_state(&id).await?)?)
}

async fn session_respond(state: &HandlerState, params: &Value) -> Result<Value, RpcError> {
    let id = session_id(params)?;
    let tool_call_id = rpc::require_str(params, "tool_call_id")?;
    let response = params
        .get("response")
        .cloned()
        .ok_or_else(|| RpcError::InvalidParams("missing required parameter: response".into()))?;
    state.hub.respond(&id, tool_call_id, response).await?;
    Ok(json!({ "resolved": true }))
}

async fn session_delete(state: &HandlerState, params: &Value) -> Result<Value, RpcError> {
    let id = session_id(params)?;
    let deleted = state.hub.delete_session(&id).await?;
    Ok(json!({ "deleted": deleted }))
}

async fn session_history(state: &HandlerState, params: &Value) -> Result<Value, RpcError> {
    let id = session_id(params)?;
    let messages = state.hub.history(&id).await?;
    Ok(json!({ "messages": messages }))
}
