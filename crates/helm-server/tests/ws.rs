use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use helm_agent::{ScriptStep, ScriptedAgent, ScriptedResponse};
use helm_core::events::AgentEvent;
use helm_hub::{HubConfig, SessionHub};
use helm_server::{start, ServerConfig, ServerHandle};
use helm_store::{Database, SqlitePersistence};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Conn {
    socket: Socket,
    next_id: u64,
}

impl Conn {
    async fn open(handle: &ServerHandle) -> Self {
        let url = format!("ws://127.0.0.1:{}/ws", handle.port());
        let (socket, _) = connect_async(url).await.unwrap();
        Self { socket, next_id: 1 }
    }

    async fn send_raw(&mut self, text: &str) {
        self.socket.send(Message::text(text.to_string())).await.unwrap();
    }

    async fn next_json(&mut self) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.socket.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("socket closed")
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    /// Call a method and return its response, collecting any notifications
    /// that arrive before it.
    async fn call(&mut self, method: &str, params: Value) -> (Value, Vec<Value>) {
        let id = self.next_id;
        self.next_id += 1;
        let request = json!({"id": id, "method": method, "params": params});
        self.send_raw(&request.to_string()).await;
        let mut notes = Vec::new();
        loop {
            let frame = self.next_json().await;
            if frame["id"] == json!(id) {
                return (frame, notes);
            }
            notes.push(frame);
        }
    }

    async fn event_until(&mut self, mut seen: Vec<Value>, kind: &str) -> Vec<Value> {
        while !seen.iter().any(|n| n["event"]["type"] == kind) {
            seen.push(self.next_json().await);
        }
        seen
    }
}

async fn server(responses: Vec<ScriptedResponse>) -> ServerHandle {
    let hub = SessionHub::new(
        Arc::new(ScriptedAgent::new(responses)),
        Arc::new(SqlitePersistence::new(Database::in_memory().unwrap())),
        HubConfig::default(),
    );
    let config = ServerConfig {
        port: 0,
        ..Default::default()
    };
    start(config, hub).await.unwrap()
}

async fn create_session(conn: &mut Conn) -> String {
    let (resp, _) = conn
        .call("session.create", json!({"title": "ws", "workingDirectory": "/tmp"}))
        .await;
    assert_eq!(resp["success"], true);
    resp["result"]["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn subscriber_sees_the_whole_turn() {
    let handle = server(vec![ScriptedResponse::text("hi there")]).await;
    let mut conn = Conn::open(&handle).await;
    let session_id = create_session(&mut conn).await;

    let (resp, notes) = conn
        .call("session.subscribe", json!({"sessionId": session_id}))
        .await;
    assert_eq!(resp["result"]["subscribed"], true);
    let notes = conn.event_until(notes, "initial-state").await;
    assert_eq!(notes[0]["type"], "session.event");
    assert_eq!(notes[0]["sessionId"], session_id);

    let (resp, notes) = conn
        .call(
            "session.send",
            json!({"sessionId": session_id, "content": "hello", "clientMessageId": "c-1"}),
        )
        .await;
    assert_eq!(resp["result"]["status"], "started");

    let events = conn.event_until(notes, "session-stopped").await;
    let kinds: Vec<&str> = events
        .iter()
        .map(|n| n["event"]["type"].as_str().unwrap())
        .collect();
    assert_eq!(kinds[0], "user-message");
    assert_eq!(kinds[1], "session-started");
    assert!(kinds.contains(&"stream-event"));
    let stopped = events.last().unwrap();
    assert_eq!(stopped["event"]["reason"], "completed");

    let (resp, _) = conn
        .call("session.history", json!({"sessionId": session_id}))
        .await;
    assert_eq!(resp["result"]["messages"].as_array().unwrap().len(), 2);

    handle.shutdown().await;
}

#[tokio::test]
async fn errors_come_back_as_failed_responses() {
    let handle = server(vec![]).await;
    let mut conn = Conn::open(&handle).await;

    conn.send_raw("not json").await;
    let frame = conn.next_json().await;
    assert_eq!(frame["success"], false);
    assert_eq!(frame["error"]["code"], "PARSE_ERROR");

    let (resp, _) = conn.call("agent.prompt", json!({})).await;
    assert_eq!(resp["error"]["code"], "METHOD_NOT_FOUND");

    let (resp, _) = conn
        .call("session.getState", json!({"sessionId": "sess_missing"}))
        .await;
    assert_eq!(resp["error"]["code"], "SESSION_NOT_FOUND");

    handle.shutdown().await;
}

#[tokio::test]
async fn closing_the_socket_does_not_cancel_the_turn() {
    let slow = ScriptedResponse::Steps(vec![
        ScriptStep::Event(AgentEvent::Start {
            message_id: None,
            message_metadata: None,
        }),
        ScriptStep::Event(AgentEvent::TextStart { id: "t0".into() }),
        ScriptStep::Event(AgentEvent::TextDelta {
            id: "t0".into(),
            delta: "done".into(),
        }),
        ScriptStep::Sleep(Duration::from_millis(200)),
        ScriptStep::Event(AgentEvent::TextEnd { id: "t0".into() }),
        ScriptStep::Event(AgentEvent::Finish {
            message_metadata: None,
        }),
    ]);
    let handle = server(vec![slow]).await;
    let mut first = Conn::open(&handle).await;
    let session_id = create_session(&mut first).await;
    first
        .call("session.subscribe", json!({"sessionId": session_id}))
        .await;
    let (resp, _) = first
        .call("session.send", json!({"sessionId": session_id, "content": "work"}))
        .await;
    assert_eq!(resp["result"]["status"], "started");
    first.socket.close(None).await.unwrap();
    drop(first);

    let mut second = Conn::open(&handle).await;
    let (resp, notes) = second
        .call("session.subscribe", json!({"sessionId": session_id}))
        .await;
    assert_eq!(resp["success"], true);
    let notes = second.event_until(notes, "initial-state").await;
    let initial = notes.iter().find(|n| n["event"]["type"] == "initial-state").unwrap();
    let status = initial["event"]["snapshot"]["status"].as_str().unwrap();
    if status == "streaming" {
        let events = second.event_until(notes, "session-stopped").await;
        assert_eq!(events.last().unwrap()["event"]["reason"], "completed");
    } else {
        assert_eq!(status, "idle");
    }

    let (resp, _) = second
        .call("session.history", json!({"sessionId": session_id}))
        .await;
    assert_eq!(resp["result"]["messages"].as_array().unwrap().len(), 2);

    handle.shutdown().await;
}

#[tokio::test]
async fn health_and_ping_agree() {
    let handle = server(vec![]).await;
    let mut conn = Conn::open(&handle).await;

    let (resp, _) = conn.call("system.ping", json!({})).await;
    assert_eq!(resp["result"]["status"], "healthy");
    assert_eq!(resp["result"]["clients"], 1);

    let body: Value = reqwest::get(format!("http://127.0.0.1:{}/health", handle.port()))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "healthy");

    handle.shutdown().await;
}
