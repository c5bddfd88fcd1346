//! Envelope codec for bus payloads.
//!
//! Inbound payloads are normalised here, at the boundary, so the rest of the
//! crate only ever sees a well-formed [`Message`]:
//!
//! - `context_ids` may arrive as a JSON array or as a string containing a
//!   JSON array; both become a `Vec<String>`. An unparseable value becomes
//!   an empty list and a warning is logged.
//! - `content` may be a nested JSON structure; it is kept as its JSON text.
//! - `timestamp` may be unix milliseconds, a numeric string, or RFC 3339.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::{Result, TachikomaError};
use crate::session::{Message, Role, SystemEvent, ToolCall};

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    speaker_id: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Value,
    #[serde(default)]
    context_ids: Value,
    #[serde(default)]
    timestamp: Value,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

/// Decode a chat envelope.
///
/// # Errors
///
/// Returns [`TachikomaError::Codec`] when the payload is not a JSON object
/// or names an unknown role. A bad `context_ids` field is not an error.
pub fn decode_payload(raw: &[u8]) -> Result<Message> {
    let wire: WireMessage = serde_json::from_slice(raw)
        .map_err(|e| TachikomaError::Codec(format!("invalid message payload: {}", e)))?;

    let role = match wire.role.as_deref() {
        Some(role) if !role.is_empty() => role.parse::<Role>()?,
        _ => Role::User,
    };

    Ok(Message {
        id: wire.id.unwrap_or_default(),
        speaker_id: wire.speaker_id.unwrap_or_default(),
        role,
        content: normalize_content(wire.content),
        context_ids: normalize_context_ids(wire.context_ids),
        timestamp: normalize_timestamp(&wire.timestamp),
        tool_calls: wire.tool_calls,
    })
}

/// Encode a chat envelope. `context_ids`, when present, is written as an array.
pub fn encode_payload(message: &Message) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

/// Decode a lifecycle announcement.
pub fn decode_system_event(raw: &[u8]) -> Result<SystemEvent> {
    serde_json::from_slice(raw)
        .map_err(|e| TachikomaError::Codec(format!("invalid system event: {}", e)))
}

pub fn encode_system_event(event: &SystemEvent) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(event)?)
}

/// Normalise the `context_ids` field to an ordered list of ids.
pub fn normalize_context_ids(value: Value) -> Vec<String> {
    match value {
        Value::Null => Vec::new(),
        Value::Array(items) => strings_only(items),
        Value::String(text) if text.trim().is_empty() => Vec::new(),
        Value::String(text) => match serde_json::from_str::<Value>(&text) {
            Ok(Value::Array(items)) => strings_only(items),
            Ok(other) => {
                warn!(value = %other, "context_ids string is not an array, using []");
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "Failed to parse context_ids string, using []");
                Vec::new()
            }
        },
        other => {
            warn!(value = %other, "Unexpected context_ids type, using []");
            Vec::new()
        }
    }
}

fn strings_only(items: Vec<Value>) -> Vec<String> {
    items
        .into_iter()
        .filter_map(|item| match item {
            Value::String(id) => Some(id),
            _ => None,
        })
        .collect()
}

fn normalize_content(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text,
        other => other.to_string(),
    }
}

fn normalize_timestamp(value: &Value) -> DateTime<Utc> {
    let millis = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse::<i64>().ok().or_else(|| {
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|t| t.timestamp_millis())
        }),
        _ => None,
    };
    millis
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Action;
    use serde_json::json;

    fn decode(value: Value) -> Message {
        decode_payload(value.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn test_context_ids_array() {
        let msg = decode(json!({"id": "m", "speaker_id": "b", "role": "user", "content": "hi", "context_ids": ["a", "b"]}));
        assert_eq!(msg.context_ids, vec!["a", "b"]);
    }

    #[test]
    fn test_context_ids_double_encoded() {
        let msg = decode(json!({"id": "m", "content": "hi", "context_ids": "[\"a\",\"b\"]"}));
        assert_eq!(msg.context_ids, vec!["a", "b"]);
    }

    #[test]
    fn test_context_ids_invalid_json_is_empty() {
        let msg = decode(json!({"id": "m", "content": "hi", "context_ids": "[\"a\","}));
        assert!(msg.context_ids.is_empty());
        let msg = decode(json!({"id": "m", "content": "hi", "context_ids": 42}));
        assert!(msg.context_ids.is_empty());
        let msg = decode(json!({"id": "m", "content": "hi", "context_ids": "{\"a\": 1}"}));
        assert!(msg.context_ids.is_empty());
    }

    #[test]
    fn test_missing_fields_default() {
        let msg = decode(json!({"content": "hi"}));
        assert_eq!(msg.id, "");
        assert_eq!(msg.speaker_id, "");
        assert_eq!(msg.role, Role::User);
        assert!(msg.context_ids.is_empty());
    }

    #[test]
    fn test_structured_content_kept_as_json() {
        let msg = decode(json!({"id": "m", "content": {"kind": "vote", "value": 3}}));
        let parsed: Value = serde_json::from_str(&msg.content).unwrap();
        assert_eq!(parsed["value"], 3);
    }

    #[test]
    fn test_timestamp_forms() {
        let msg = decode(json!({"content": "a", "timestamp": 1_700_000_000_000i64}));
        assert_eq!(msg.timestamp.timestamp_millis(), 1_700_000_000_000);
        let msg = decode(json!({"content": "a", "timestamp": "2024-01-02T03:04:05Z"}));
        assert_eq!(msg.timestamp.timestamp(), 1_704_164_645);
        let msg = decode(json!({"content": "a", "timestamp": "1700000000000"}));
        assert_eq!(msg.timestamp.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_malformed_payloads_error() {
        assert!(decode_payload(b"plain text").is_err());
        assert!(decode_payload(b"[1,2]").is_err());
        assert!(decode_payload(json!({"role": "self"}).to_string().as_bytes()).is_err());
    }

    #[test]
    fn test_encode_then_decode_reply() {
        let mut reply = Message::assistant("agent-a", "hello");
        reply.context_ids = vec!["b-1".into()];
        let decoded = decode_payload(&encode_payload(&reply).unwrap()).unwrap();
        assert_eq!(decoded.id, reply.id);
        assert_eq!(decoded.context_ids, reply.context_ids);
        assert_eq!(decoded.role, Role::Assistant);
    }

    #[test]
    fn test_system_event_decode() {
        let raw = json!({"speaker_id": "u", "action": "leave", "role": "user", "topic": "lobby"});
        let event = decode_system_event(raw.to_string().as_bytes()).unwrap();
        assert_eq!(event.action, Action::Leave);
        assert!(event.id.is_none());
        assert!(decode_system_event(b"{\"speaker_id\": \"u\"}").is_err());
    }
}
