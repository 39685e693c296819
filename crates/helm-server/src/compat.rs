//! Wire-format shims: camelCase param keys and the notification envelope.

use helm_core::ids::SessionId;
use helm_hub::SessionEvent;
use serde::Serialize;

/// camelCase keys accepted from clients, mapped to the snake_case keys
/// handlers read.
const CAMEL_TO_SNAKE: &[(&str, &str)] = &[
    ("sessionId", "session_id"),
    ("clientMessageId", "client_message_id"),
    ("queuedId", "queued_id"),
    ("messageId", "message_id"),
    ("toolCallId", "tool_call_id"),
    ("workingDirectory", "working_directory"),
];

/// Rewrite camelCase keys to snake_case. An existing snake_case key wins.
pub fn normalize_params(params: &serde_json::Value) -> serde_json::Value {
    let Some(obj) = params.as_object() else {
        return params.clone();
    };
    let mut result = obj.clone();
    for &(camel, snake) in CAMEL_TO_SNAKE {
        if result.contains_key(snake) {
            result.remove(camel);
        } else if let Some(val) = result.remove(camel) {
            result.insert(snake.to_string(), val);
        }
    }
    serde_json::Value::Object(result)
}

pub const SESSION_EVENT: &str = "session.event";

/// Server-pushed notification: `{ type: "session.event", sessionId, event }`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub session_id: &'a SessionId,
    pub event: &'a SessionEvent,
}

pub fn session_event(session_id: &SessionId, event: &SessionEvent) -> serde_json::Result<String> {
    serde_json::to_string(&Notification {
        kind: SESSION_EVENT,
        session_id,
        event,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn camel_keys_become_snake() {
        let out = normalize_params(&json!({
            "sessionId": "sess_1",
            "clientMessageId": "c1",
            "toolCallId": "call_1",
            "content": "hi"
        }));
        assert_eq!(out["session_id"], "sess_1");
        assert_eq!(out["client_message_id"], "c1");
        assert_eq!(out["tool_call_id"], "call_1");
        assert_eq!(out["content"], "hi");
        assert!(out.get("sessionId").is_none());
    }

    #[test]
    fn snake_key_takes_precedence() {
        let out = normalize_params(&json!({"sessionId": "camel", "session_id": "snake"}));
        assert_eq!(out["session_id"], "snake");
        assert!(out.get("sessionId").is_none());
    }

    #[test]
    fn non_object_passes_through() {
        assert_eq!(normalize_params(&json!(null)), json!(null));
        assert_eq!(normalize_params(&json!([1, 2])), json!([1, 2]));
    }

    #[test]
    fn notification_envelope() {
        let id = SessionId::from_raw("sess_abc");
        let text = session_event(&id, &SessionEvent::SessionDeleted).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["type"], "session.event");
        assert_eq!(json["sessionId"], "sess_abc");
        assert_eq!(json["event"]["type"], "session-deleted");
    }
}
