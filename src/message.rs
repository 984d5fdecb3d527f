//! JSON-RPC 2.0 envelope shared by every transport.
//!
//! A [`Message`] is immutable once built. On the wire it is a JSON object that
//! always carries `"jsonrpc":"2.0"`; fields that do not belong to the message
//! kind are omitted entirely rather than serialized as `null`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::ParseError;

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INTERNAL_ERROR: i64 = -32603;

// ── Correlation id ──────────────────────────────────────────────────────────

/// Opaque correlation token. Peers may use numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Number(i64),
    String(String),
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Number(n) => write!(f, "{n}"),
            MessageId::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for MessageId {
    fn from(n: i64) -> Self {
        MessageId::Number(n)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        MessageId::String(s.to_string())
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        MessageId::String(s)
    }
}

// ── Error payload ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
}

// ── Message ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Response,
    Notification,
    Error,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Request => "request",
            MessageKind::Response => "response",
            MessageKind::Notification => "notification",
            MessageKind::Error => "error",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One protocol envelope.
///
/// A method-bearing object without an `id` is a notification; a reply without
/// an `id` is accepted and keeps `id = None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMessage", into = "RawMessage")]
pub enum Message {
    Request {
        id: MessageId,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
    Response {
        id: Option<MessageId>,
        result: Value,
    },
    Error {
        id: Option<MessageId>,
        error: ErrorObject,
    },
}

impl Message {
    pub fn request(id: impl Into<MessageId>, method: impl Into<String>, params: Value) -> Self {
        Message::Request {
            id: id.into(),
            method: method.into(),
            params: normalize_params(params),
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Message::Notification {
            method: method.into(),
            params: normalize_params(params),
        }
    }

    pub fn response(id: Option<MessageId>, result: Value) -> Self {
        Message::Response { id, result }
    }

    pub fn error(id: Option<MessageId>, code: i64, message: impl Into<String>) -> Self {
        Message::Error {
            id,
            error: ErrorObject {
                code,
                message: message.into(),
            },
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Request { .. } => MessageKind::Request,
            Message::Notification { .. } => MessageKind::Notification,
            Message::Response { .. } => MessageKind::Response,
            Message::Error { .. } => MessageKind::Error,
        }
    }

    pub fn id(&self) -> Option<&MessageId> {
        match self {
            Message::Request { id, .. } => Some(id),
            Message::Notification { .. } => None,
            Message::Response { id, .. } | Message::Error { id, .. } => id.as_ref(),
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request { method, .. } | Message::Notification { method, .. } => Some(method),
            _ => None,
        }
    }

    pub fn params(&self) -> Option<&Value> {
        match self {
            Message::Request { params, .. } | Message::Notification { params, .. } => Some(params),
            _ => None,
        }
    }

    pub fn result(&self) -> Option<&Value> {
        match self {
            Message::Response { result, .. } => Some(result),
            _ => None,
        }
    }

    pub fn error_object(&self) -> Option<&ErrorObject> {
        match self {
            Message::Error { error, .. } => Some(error),
            _ => None,
        }
    }

    /// `true` for responses and errors, i.e. messages that answer something.
    pub fn is_reply(&self) -> bool {
        matches!(self, Message::Response { .. } | Message::Error { .. })
    }

    /// Serialize to a single-line JSON string (no trailing newline).
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ParseError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl FromStr for Message {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(serde_json::from_str(s)?)
    }
}

fn normalize_params(params: Value) -> Value {
    match params {
        Value::Null => Value::Object(Map::new()),
        other => other,
    }
}

// ── Wire form ───────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct RawMessage {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
    // `"result": null` is a valid response, so presence is tracked separately from value.
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorObject>,
}

fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl TryFrom<RawMessage> for Message {
    type Error = ParseError;

    fn try_from(raw: RawMessage) -> Result<Self, ParseError> {
        if let Some(version) = raw.jsonrpc.as_deref() {
            if version != JSONRPC_VERSION {
                return Err(ParseError::Envelope(format!(
                    "unsupported jsonrpc version '{version}'"
                )));
            }
        }

        match (raw.method, raw.result, raw.error) {
            (Some(method), None, None) => {
                let params = normalize_params(raw.params.unwrap_or(Value::Null));
                Ok(match raw.id {
                    Some(id) => Message::Request { id, method, params },
                    None => Message::Notification { method, params },
                })
            }
            (None, Some(result), None) => Ok(Message::Response { id: raw.id, result }),
            (None, None, Some(error)) => Ok(Message::Error { id: raw.id, error }),
            _ => Err(ParseError::Envelope(
                "expected exactly one of 'method', 'result' or 'error'".to_string(),
            )),
        }
    }
}

impl From<Message> for RawMessage {
    fn from(message: Message) -> Self {
        let mut raw = RawMessage {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
        };
        match message {
            Message::Request { id, method, params } => {
                raw.id = Some(id);
                raw.method = Some(method);
                raw.params = Some(params);
            }
            Message::Notification { method, params } => {
                raw.method = Some(method);
                raw.params = Some(params);
            }
            Message::Response { id, result } => {
                raw.id = id;
                raw.result = Some(result);
            }
            Message::Error { id, error } => {
                raw.id = id;
                raw.error = Some(error);
            }
        }
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wire(message: &Message) -> Value {
        serde_json::to_value(message).unwrap()
    }

    #[test]
    fn request_serializes_method_and_params() {
        let msg = Message::request("1", "echo", json!({"foo": "bar"}));
        assert_eq!(
            wire(&msg),
            json!({"jsonrpc": "2.0", "id": "1", "method": "echo", "params": {"foo": "bar"}})
        );
    }

    #[test]
    fn response_omits_method_and_error() {
        let msg = Message::response(Some(MessageId::Number(7)), json!({"ok": true}));
        let value = wire(&msg);
        assert_eq!(value, json!({"jsonrpc": "2.0", "id": 7, "result": {"ok": true}}));
        assert!(value.get("method").is_none());
        assert!(value.get("error").is_none());
    }

    #[test]
    fn error_omits_result() {
        let msg = Message::error(Some("3".into()), METHOD_NOT_FOUND, "Method not found: nope");
        let value = wire(&msg);
        assert_eq!(value["error"]["code"], -32601);
        assert!(value.get("result").is_none());
        assert!(value.get("params").is_none());
    }

    #[test]
    fn null_result_is_preserved() {
        let msg: Message = r#"{"jsonrpc":"2.0","id":1,"result":null}"#.parse().unwrap();
        assert_eq!(msg, Message::response(Some(MessageId::Number(1)), Value::Null));
        assert_eq!(wire(&msg)["result"], Value::Null);
        assert!(wire(&msg).as_object().unwrap().contains_key("result"));
    }

    #[test]
    fn missing_id_yields_notification() {
        let msg: Message = r#"{"jsonrpc":"2.0","method":"log","params":{"level":"info"}}"#
            .parse()
            .unwrap();
        assert_eq!(msg.kind(), MessageKind::Notification);
        assert_eq!(msg.id(), None);
    }

    #[test]
    fn missing_id_on_reply_is_not_an_error() {
        let msg: Message = r#"{"jsonrpc":"2.0","result":{}}"#.parse().unwrap();
        assert_eq!(msg.kind(), MessageKind::Response);
        assert_eq!(msg.id(), None);
    }

    #[test]
    fn missing_params_default_to_empty_mapping() {
        let msg: Message = r#"{"jsonrpc":"2.0","id":"9","method":"ping"}"#.parse().unwrap();
        assert_eq!(msg.params(), Some(&json!({})));
    }

    #[test]
    fn round_trip_preserves_every_kind() {
        let cases = [
            Message::request("42", "tools/list", json!({"cursor": null})),
            Message::notification("notifications/initialized", json!({})),
            Message::response(Some("42".into()), json!([1, 2, 3])),
            Message::error(None, PARSE_ERROR, "Parse error"),
        ];
        for msg in cases {
            let encoded = msg.encode().unwrap();
            let decoded: Message = encoded.parse().unwrap();
            assert_eq!(decoded, msg, "round trip of {encoded}");
        }
    }

    #[test]
    fn malformed_bytes_fail_with_parse_error() {
        assert!(matches!(
            Message::from_slice(b"{not json"),
            Err(ParseError::Json(_))
        ));
    }

    #[test]
    fn ambiguous_envelope_is_rejected() {
        let err = r#"{"jsonrpc":"2.0","id":1,"result":1,"error":{"code":1,"message":"x"}}"#
            .parse::<Message>()
            .unwrap_err();
        assert!(err.to_string().contains("exactly one"));

        assert!(r#"{"jsonrpc":"2.0","id":1}"#.parse::<Message>().is_err());
    }

    #[test]
    fn wrong_protocol_version_is_rejected() {
        assert!(
            r#"{"jsonrpc":"1.0","id":1,"method":"ping"}"#
                .parse::<Message>()
                .is_err()
        );
    }
}
