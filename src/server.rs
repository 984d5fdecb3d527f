//! Built-in protocol methods served by the `mcp-relay` binary.
//!
//! - `initialize` -- server info + capabilities
//! - `notifications/initialized` -- client ack (no-op)
//! - `ping` -- liveness
//! - `echo` -- returns its params under `echo`

use serde_json::{Value, json};

use crate::protocol::ProtocolHandler;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub fn register_builtin_methods(handler: &ProtocolHandler) {
    handler.register_handler("initialize", |params: Value| async move {
        if let Some(client) = params.get("clientInfo") {
            tracing::info!(
                client = %client.get("name").and_then(|v| v.as_str()).unwrap_or("unknown"),
                "server: initialize"
            );
        }
        Ok(initialize_result())
    });
    handler.register_handler("notifications/initialized", |_params: Value| async move {
        tracing::debug!("server: client initialized");
        Ok(Value::Null)
    });
    handler.register_handler("ping", |_params: Value| async move { Ok(json!({})) });
    handler.register_handler("echo", |params: Value| async move { Ok(json!({ "echo": params })) });
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {
            "tools": { "listChanged": false },
        },
        "serverInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, MessageId};

    fn handler() -> ProtocolHandler {
        let handler = ProtocolHandler::new();
        register_builtin_methods(&handler);
        handler
    }

    #[tokio::test]
    async fn initialize_reports_server_info() {
        let reply = handler()
            .handle_message(Message::request(1i64, "initialize", json!({"clientInfo": {"name": "t"}})))
            .await
            .unwrap();
        let result = reply.result().unwrap();
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], env!("CARGO_PKG_NAME"));
        assert_eq!(reply.id(), Some(&MessageId::Number(1)));
    }

    #[tokio::test]
    async fn ping_returns_empty_object() {
        let reply = handler()
            .handle_message(Message::request("p", "ping", Value::Null))
            .await
            .unwrap();
        assert_eq!(reply.result(), Some(&json!({})));
    }

    #[tokio::test]
    async fn initialized_notification_is_silent() {
        assert!(
            handler()
                .handle_message(Message::notification("notifications/initialized", json!({})))
                .await
                .is_none()
        );
    }

    #[test]
    fn every_builtin_is_registered() {
        assert_eq!(
            handler().methods(),
            vec!["echo", "initialize", "notifications/initialized", "ping"]
        );
    }
}
