//! Pluggable transports.
//!
//! Every transport implements [`Transport`]: connect/disconnect lifecycle, an
//! outbound `send_message`, an inbound receive loop that feeds each message to
//! the registered [`MessageHandler`], and a cheap `health_check`.
//!
//! - [`stream::StreamTransport`] -- duplex, one JSON object per line (stdio,
//!   child process, any reader/writer pair).
//! - [`http::RequestTransport`] -- single-shot HTTP request/response.
//! - [`socket::SocketTransport`] -- WebSocket server multiplexing many peers,
//!   each with a bounded, rate-limited outbound queue.
//! - [`socket_client::SocketClient`] -- dials a socket transport's `/ws` route.
//! - [`sse::PushTransport`] -- client-only server-sent-events stream.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConfigError, TransportError};
use crate::message::Message;

pub mod http;
pub mod queue;
pub mod socket;
pub mod socket_client;
pub mod sse;
pub mod stream;

pub use http::{HttpOptions, HttpRateLimit, RequestTransport};
pub use queue::{Enqueued, OverflowPolicy, PeerQueue};
pub use socket::{SocketOptions, SocketTransport};
pub use socket_client::SocketClient;
pub use sse::{PushOptions, PushTransport, SseParser};
pub use stream::StreamTransport;

// ── Kinds and states ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Http,
    Websocket,
    Sse,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Http => "http",
            TransportKind::Websocket => "websocket",
            TransportKind::Sse => "sse",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdio" => Ok(TransportKind::Stdio),
            "http" => Ok(TransportKind::Http),
            "websocket" | "ws" => Ok(TransportKind::Websocket),
            "sse" => Ok(TransportKind::Sse),
            _ => Err(ConfigError::Invalid {
                key: "transport",
                value: s.to_string(),
            }),
        }
    }
}

/// `Disconnected -> Connected -> Disconnected`, or `-> Error` on a failed
/// connect or an unrecoverable I/O fault. `Error` sticks until the next
/// `connect()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Error,
}

/// Lock-free cell holding a [`ConnectionState`].
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    const DISCONNECTED: u8 = 0;
    const CONNECTED: u8 = 1;
    const ERROR: u8 = 2;

    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(Self::DISCONNECTED))
    }

    pub(crate) fn get(&self) -> ConnectionState {
        Self::decode(self.0.load(Ordering::Acquire))
    }

    /// Store `state`, returning the previous one.
    pub(crate) fn set(&self, state: ConnectionState) -> ConnectionState {
        let raw = match state {
            ConnectionState::Disconnected => Self::DISCONNECTED,
            ConnectionState::Connected => Self::CONNECTED,
            ConnectionState::Error => Self::ERROR,
        };
        Self::decode(self.0.swap(raw, Ordering::AcqRel))
    }

    fn decode(raw: u8) -> ConnectionState {
        match raw {
            Self::CONNECTED => ConnectionState::Connected,
            Self::ERROR => ConnectionState::Error,
            _ => ConnectionState::Disconnected,
        }
    }
}

// ── Message handler callback ────────────────────────────────────────────────

/// Callback invoked for every inbound message; returns the reply to send, if any.
///
/// Usually built with [`crate::protocol::ProtocolHandler::as_message_handler`].
pub type MessageHandler =
    Arc<dyn Fn(Message) -> BoxFuture<'static, Option<Message>> + Send + Sync>;

pub fn message_handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Message>> + Send + 'static,
{
    Arc::new(move |message: Message| -> BoxFuture<'static, Option<Message>> { Box::pin(f(message)) })
}

#[derive(Default)]
pub(crate) struct HandlerSlot(RwLock<Option<MessageHandler>>);

impl HandlerSlot {
    pub(crate) fn get(&self) -> Option<MessageHandler> {
        self.0.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub(crate) fn set(&self, handler: MessageHandler) {
        *self.0.write().unwrap_or_else(|p| p.into_inner()) = Some(handler);
    }
}

// ── Transport capability ────────────────────────────────────────────────────

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Perform whatever handshake the transport needs. On failure the state
    /// becomes [`ConnectionState::Error`].
    async fn connect(&self) -> Result<(), TransportError>;

    /// Release resources. Idempotent.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Deliver `message` to the peer. Transports that can correlate a reply
    /// return it; otherwise `Ok(None)`.
    async fn send_message(&self, message: Message) -> Result<Option<Message>, TransportError>;

    /// Read one inbound message without dispatching it. `Ok(None)` once the
    /// inbound side is exhausted.
    async fn receive_message(&self) -> Result<Option<Message>, TransportError>;

    /// Long-running inbound loop. Run it as a background task while
    /// connected; it returns once the transport disconnects.
    async fn receive_messages(&self) -> Result<(), TransportError>;

    fn set_message_handler(&self, handler: MessageHandler);

    /// Side-effect-free liveness probe; always contains `"transport": <kind>`.
    async fn health_check(&self) -> Value;
}

/// Spawn `transport.receive_messages()` on the runtime.
pub fn spawn_receiver(
    transport: Arc<dyn Transport>,
) -> tokio::task::JoinHandle<Result<(), TransportError>> {
    tokio::spawn(async move {
        let result = transport.receive_messages().await;
        if let Err(e) = &result {
            tracing::warn!("transport[{}]: receive loop ended: {}", transport.kind(), e);
        }
        result
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_kind_parses_aliases() {
        assert_eq!("ws".parse::<TransportKind>().unwrap(), TransportKind::Websocket);
        assert_eq!(" HTTP ".parse::<TransportKind>().unwrap(), TransportKind::Http);
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }

    #[test]
    fn state_cell_reports_previous_state() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), ConnectionState::Disconnected);
        assert_eq!(cell.set(ConnectionState::Connected), ConnectionState::Disconnected);
        assert_eq!(cell.set(ConnectionState::Error), ConnectionState::Connected);
        assert_eq!(cell.get(), ConnectionState::Error);
    }
}
