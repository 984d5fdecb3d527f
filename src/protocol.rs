//! Method dispatch: turns inbound messages into replies.
//!
//! Handlers are registered by method name. Requests always get exactly one
//! reply (result or error); notifications never get one. Handler failures and
//! panics are converted into `-32603` error messages and never escape
//! [`ProtocolHandler::handle_message`].

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::Value;

use crate::error::ProtocolError;
use crate::message::{Message, MessageId};
use crate::transport::{MessageHandler, message_handler};

/// One registered protocol method.
///
/// Implemented for any `Fn(Value) -> impl Future<Output = anyhow::Result<Value>>`,
/// so plain async closures can be registered directly.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn call(&self, params: Value) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> MethodHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn call(&self, params: Value) -> anyhow::Result<Value> {
        (self)(params).await
    }
}

pub struct ProtocolHandler {
    handlers: RwLock<HashMap<String, Arc<dyn MethodHandler>>>,
    next_request_id: AtomicU64,
}

impl Default for ProtocolHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolHandler {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
        }
    }

    /// Register (or replace) the handler for `method`.
    pub fn register_handler(&self, method: impl Into<String>, handler: impl MethodHandler + 'static) {
        let method = method.into();
        let mut handlers = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        if handlers.insert(method.clone(), Arc::new(handler)).is_some() {
            tracing::warn!(method = %method, "protocol: replacing existing handler");
        } else {
            tracing::debug!(method = %method, "protocol: handler registered");
        }
    }

    pub fn has_handler(&self, method: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(method)
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<String> {
        let handlers = self.handlers.read().unwrap_or_else(|p| p.into_inner());
        let mut names: Vec<String> = handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Build an outgoing request with the next id of this handler's counter.
    pub fn create_request(&self, method: impl Into<String>, params: Value) -> Message {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        Message::request(MessageId::String(id.to_string()), method, params)
    }

    pub fn create_notification(&self, method: impl Into<String>, params: Value) -> Message {
        Message::notification(method, params)
    }

    fn lookup(&self, method: &str) -> Option<Arc<dyn MethodHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(method)
            .cloned()
    }

    /// Dispatch one inbound message.
    ///
    /// Returns the reply for requests (and for misdirected replies), `None` for
    /// notifications. A notification's handler has finished by the time this
    /// returns.
    pub async fn handle_message(&self, message: Message) -> Option<Message> {
        match message {
            Message::Request { id, method, params } => {
                let Some(handler) = self.lookup(&method) else {
                    tracing::debug!(method = %method, "protocol: method not found");
                    return Some(ProtocolError::MethodNotFound(method).into_message(Some(id)));
                };
                match invoke(handler.as_ref(), params).await {
                    Ok(result) => Some(Message::response(Some(id), result)),
                    Err(e) => {
                        tracing::warn!(method = %method, "protocol: handler failed: {}", e);
                        Some(ProtocolError::HandlerExecution(e).into_message(Some(id)))
                    }
                }
            }
            Message::Notification { method, params } => {
                match self.lookup(&method) {
                    Some(handler) => {
                        if let Err(e) = invoke(handler.as_ref(), params).await {
                            tracing::warn!(method = %method, "protocol: notification handler failed: {}", e);
                        }
                    }
                    None => {
                        tracing::debug!(method = %method, "protocol: no handler for notification");
                    }
                }
                None
            }
            other => {
                tracing::warn!(kind = %other.kind(), "protocol: inbound message is not a request");
                let id = other.id().cloned();
                Some(ProtocolError::UnsupportedKind(other.kind()).into_message(id))
            }
        }
    }

    /// Adapt this handler into the callback shape transports expect.
    pub fn as_message_handler(self: &Arc<Self>) -> MessageHandler {
        let this = Arc::clone(self);
        message_handler(move |message: Message| {
            let this = Arc::clone(&this);
            async move { this.handle_message(message).await }
        })
    }
}

async fn invoke(handler: &dyn MethodHandler, params: Value) -> Result<Value, String> {
    match AssertUnwindSafe(handler.call(params)).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(format!("handler panicked: {detail}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{INTERNAL_ERROR, METHOD_NOT_FOUND, MessageKind};
    use serde_json::json;
    use std::sync::Mutex;

    fn echo_handler() -> ProtocolHandler {
        let handler = ProtocolHandler::new();
        handler.register_handler("echo", |params: Value| async move { Ok(json!({ "echo": params })) });
        handler
    }

    #[tokio::test]
    async fn echo_request_returns_result() {
        let handler = echo_handler();
        let reply = handler
            .handle_message(Message::request("1", "echo", json!({"foo": "bar"})))
            .await
            .unwrap();
        assert_eq!(
            reply,
            Message::response(Some("1".into()), json!({"echo": {"foo": "bar"}}))
        );
    }

    #[tokio::test]
    async fn unknown_method_yields_method_not_found() {
        let handler = echo_handler();
        let reply = handler
            .handle_message(Message::request("2", "does/not/exist", json!({})))
            .await
            .unwrap();
        let error = reply.error_object().unwrap();
        assert_eq!(error.code, METHOD_NOT_FOUND);
        assert_eq!(error.message, "Method not found: does/not/exist");
        assert_eq!(reply.id(), Some(&MessageId::from("2")));
    }

    #[tokio::test]
    async fn failing_handler_yields_internal_error() {
        let handler = ProtocolHandler::new();
        handler.register_handler("boom", |_params: Value| async move {
            Err::<Value, _>(anyhow::anyhow!("disk on fire"))
        });
        let reply = handler
            .handle_message(Message::request("3", "boom", json!({})))
            .await
            .unwrap();
        let error = reply.error_object().unwrap();
        assert_eq!(error.code, INTERNAL_ERROR);
        assert!(error.message.contains("disk on fire"));
    }

    #[tokio::test]
    async fn panicking_handler_yields_internal_error() {
        let handler = ProtocolHandler::new();
        handler.register_handler("panic", |_params: Value| async move {
            if true {
                panic!("kaboom");
            }
            Ok(Value::Null)
        });
        let reply = handler
            .handle_message(Message::request("4", "panic", json!({})))
            .await
            .unwrap();
        let error = reply.error_object().unwrap();
        assert_eq!(error.code, INTERNAL_ERROR);
        assert!(error.message.contains("kaboom"));
    }

    #[tokio::test]
    async fn notification_runs_handler_once_and_returns_none() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = ProtocolHandler::new();
        let sink = Arc::clone(&seen);
        handler.register_handler("log", move |params: Value| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(params);
                Ok(json!("ignored"))
            }
        });

        let reply = handler
            .handle_message(Message::notification("log", json!({"level": "info"})))
            .await;
        assert!(reply.is_none());
        assert_eq!(*seen.lock().unwrap(), vec![json!({"level": "info"})]);
    }

    #[tokio::test]
    async fn notification_for_unknown_method_is_silent() {
        let handler = ProtocolHandler::new();
        assert!(
            handler
                .handle_message(Message::notification("nobody/home", json!({})))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn inbound_reply_is_rejected_as_request() {
        let handler = echo_handler();
        let reply = handler
            .handle_message(Message::error(Some("5".into()), -1, "oops"))
            .await
            .unwrap();
        assert_eq!(reply.kind(), MessageKind::Error);
        assert_eq!(reply.error_object().unwrap().code, METHOD_NOT_FOUND);
        assert_eq!(reply.id(), Some(&MessageId::from("5")));
    }

    #[test]
    fn request_ids_increase_per_instance() {
        let a = ProtocolHandler::new();
        let b = ProtocolHandler::new();
        assert_eq!(a.create_request("x", json!({})).id(), Some(&MessageId::from("1")));
        assert_eq!(a.create_request("x", json!({})).id(), Some(&MessageId::from("2")));
        assert_eq!(b.create_request("x", json!({})).id(), Some(&MessageId::from("1")));
    }

    #[test]
    fn duplicate_registration_replaces_handler() {
        let handler = echo_handler();
        handler.register_handler("echo", |_params: Value| async move { Ok(json!("second")) });
        assert_eq!(handler.methods(), vec!["echo".to_string()]);
    }

    #[tokio::test]
    async fn concurrent_requests_are_independent() {
        let handler = Arc::new(ProtocolHandler::new());
        handler.register_handler("sleep", |params: Value| async move {
            let ms = params["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
            Ok(params)
        });

        let slow = handler.handle_message(Message::request("slow", "sleep", json!({"ms": 50})));
        let fast = handler.handle_message(Message::request("fast", "sleep", json!({"ms": 1})));
        let (slow, fast) = tokio::join!(slow, fast);
        assert_eq!(slow.unwrap().id(), Some(&MessageId::from("slow")));
        assert_eq!(fast.unwrap().id(), Some(&MessageId::from("fast")));
    }
}
