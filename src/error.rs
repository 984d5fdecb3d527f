//! Error taxonomy for the protocol core.
//!
//! Protocol-level failures never leave `ProtocolHandler::handle_message`: they
//! are turned into JSON-RPC error messages. Everything else (transport, pool,
//! breaker) is a typed error meant for the owning service to act on.

use std::time::Duration;

use uuid::Uuid;

use crate::message::{INTERNAL_ERROR, METHOD_NOT_FOUND, Message, MessageId, MessageKind};
use crate::transport::TransportKind;

/// Inbound bytes could not be turned into a [`Message`].
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid envelope: {0}")]
    Envelope(String),
}

/// Failures that are reported to the peer as JSON-RPC error messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Unsupported message kind: {0}")]
    UnsupportedKind(MessageKind),

    #[error("Internal error: {0}")]
    HandlerExecution(String),
}

impl ProtocolError {
    pub fn code(&self) -> i64 {
        match self {
            ProtocolError::MethodNotFound(_) | ProtocolError::UnsupportedKind(_) => {
                METHOD_NOT_FOUND
            }
            ProtocolError::HandlerExecution(_) => INTERNAL_ERROR,
        }
    }

    pub fn into_message(self, id: Option<MessageId>) -> Message {
        Message::error(id, self.code(), self.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport is not connected")]
    NotConnected,

    #[error("{0} transport does not support {1}")]
    Unsupported(TransportKind, &'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("peer answered HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("connection closed before a reply arrived")]
    Closed,

    #[error("unknown peer {0}")]
    UnknownPeer(Uuid),

    #[error("event grew past {0} bytes without a terminating blank line")]
    EventTooLarge(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionPoolError {
    #[error("no connection configs registered")]
    NoConfigs,

    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    CircuitOpen(#[from] CircuitBreakerOpenError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("connection pool is closed")]
    Closed,
}

/// Raised instead of running the protected operation while the circuit is open.
#[derive(Debug, Clone, thiserror::Error)]
#[error("circuit breaker '{name}' is open; retry in {retry_in:?}")]
pub struct CircuitBreakerOpenError {
    pub name: String,
    pub retry_in: Duration,
}

/// Outcome of a call routed through a circuit breaker.
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error(transparent)]
    Open(#[from] CircuitBreakerOpenError),

    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitBreakerError::Open(_))
    }

    /// The wrapped operation's error, if the operation actually ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitBreakerError::Inner(e) => Some(e),
            CircuitBreakerError::Open(_) => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}")]
    Invalid { key: &'static str, value: String },
}
