//! Client side of the WebSocket transport.
//!
//! Dials a [`super::SocketTransport`] (or any peer speaking the same framing) at
//! `ws://host:port/ws`. A background reader started by `connect()` owns the
//! inbound half: replies resolve the request waiting on them, and requests or
//! notifications go to the handler, or to the `receive_message` inbox when no
//! handler is set.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{ConnectionState, HandlerSlot, MessageHandler, StateCell, Transport, TransportKind};
use crate::error::TransportError;
use crate::message::{Message, MessageId, PARSE_ERROR};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, WsMessage>;
type WsReader = SplitStream<WsStream>;

const INBOX_CAPACITY: usize = 64;
const CLOSE_GRACE: Duration = Duration::from_secs(1);

struct Inner {
    url: Url,
    state: StateCell,
    handler: HandlerSlot,
    writer: tokio::sync::Mutex<Option<WsWriter>>,
    pending: Mutex<HashMap<MessageId, oneshot::Sender<Message>>>,
    inbox: tokio::sync::Mutex<Option<mpsc::Receiver<Message>>>,
    reader: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    shutdown: Mutex<CancellationToken>,
}

pub struct SocketClient {
    inner: Arc<Inner>,
}

impl SocketClient {
    pub fn new(url: &str) -> Result<Self, TransportError> {
        let url = Url::parse(url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TransportError::Connect(format!(
                "unsupported WebSocket scheme '{}'",
                url.scheme()
            )));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                url,
                state: StateCell::new(),
                handler: HandlerSlot::default(),
                writer: tokio::sync::Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                inbox: tokio::sync::Mutex::new(None),
                reader: tokio::sync::Mutex::new(None),
                shutdown: Mutex::new(CancellationToken::new()),
            }),
        })
    }

    /// Client for the `/ws` route a [`super::SocketTransport`] serves on `host:port`.
    pub fn for_endpoint(host: &str, port: u16) -> Result<Self, TransportError> {
        Self::new(&format!("ws://{host}:{port}/ws"))
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl Inner {
    fn token(&self) -> CancellationToken {
        self.shutdown.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    async fn write(&self, message: &Message) -> Result<(), TransportError> {
        let frame = message.encode()?;
        let token = self.token();
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;
        let sent = tokio::select! {
            _ = token.cancelled() => return Err(TransportError::Closed),
            sent = writer.send(WsMessage::text(frame)) => sent,
        };
        sent.map_err(|e| {
            tracing::error!("transport[websocket]: write to {} failed: {}", self.url, e);
            self.state.set(ConnectionState::Error);
            TransportError::Io(std::io::Error::other(e))
        })
    }

    fn resolve_pending(&self, reply: Message) {
        let waiter = reply
            .id()
            .and_then(|id| self.pending.lock().unwrap_or_else(|p| p.into_inner()).remove(id));
        match waiter {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => {
                tracing::warn!(
                    kind = %reply.kind(),
                    id = ?reply.id(),
                    "transport[websocket]: dropping reply with no pending request"
                );
            }
        }
    }

    fn forget_pending(&self, id: &MessageId) {
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).remove(id);
    }

    /// Owns the inbound half until the socket closes or the client disconnects.
    async fn read_loop(self: Arc<Self>, mut reader: WsReader, inbox: mpsc::Sender<Message>, token: CancellationToken) {
        let mut tasks = JoinSet::new();

        loop {
            let frame = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                frame = reader.next() => frame,
            };
            let text = match frame {
                Some(Ok(WsMessage::Text(text))) => text.as_str().to_owned(),
                Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!("transport[websocket]: dropping non-UTF-8 frame: {}", e);
                        continue;
                    }
                },
                Some(Ok(WsMessage::Close(_))) | None => {
                    tracing::info!("transport[websocket]: {} closed the connection", self.url);
                    self.state.set(ConnectionState::Disconnected);
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::error!("transport[websocket]: read from {} failed: {}", self.url, e);
                    self.state.set(ConnectionState::Error);
                    break;
                }
            };

            for line in text.lines().filter(|line| !line.trim().is_empty()) {
                let message = match line.parse::<Message>() {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!("transport[websocket]: unparseable frame: {}", e);
                        let reply = Message::error(None, PARSE_ERROR, format!("Parse error: {e}"));
                        if let Err(e) = self.write(&reply).await {
                            tracing::warn!("transport[websocket]: failed to write parse error: {}", e);
                        }
                        continue;
                    }
                };
                if message.is_reply() {
                    self.resolve_pending(message);
                    continue;
                }
                let Some(handler) = self.handler.get() else {
                    if let Err(e) = inbox.try_send(message) {
                        tracing::warn!("transport[websocket]: inbox full, dropping message: {}", e);
                    }
                    continue;
                };
                let inner = Arc::clone(&self);
                tasks.spawn(async move {
                    if let Some(reply) = handler(message).await {
                        if let Err(e) = inner.write(&reply).await {
                            tracing::warn!("transport[websocket]: failed to write reply: {}", e);
                        }
                    }
                });
            }

            while let Some(finished) = tasks.try_join_next() {
                if let Err(e) = finished {
                    tracing::warn!("transport[websocket]: dispatch task failed: {}", e);
                }
            }
        }

        tasks.abort_all();
        // Wakes every waiting `send_message` and the `receive_messages` parker.
        token.cancel();
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

#[async_trait]
impl Transport for SocketClient {
    fn kind(&self) -> TransportKind {
        TransportKind::Websocket
    }

    fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    async fn connect(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }
        let stream = match connect_async(self.inner.url.as_str()).await {
            Ok((stream, _response)) => stream,
            Err(e) => {
                tracing::error!("transport[websocket]: connect to {} failed: {}", self.inner.url, e);
                self.inner.state.set(ConnectionState::Error);
                return Err(TransportError::Connect(format!(
                    "WebSocket connect to {} failed: {e}",
                    self.inner.url
                )));
            }
        };
        let (writer, reader) = stream.split();
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);

        let token = CancellationToken::new();
        *self.inner.shutdown.lock().unwrap_or_else(|p| p.into_inner()) = token.clone();
        *self.inner.writer.lock().await = Some(writer);
        *self.inner.inbox.lock().await = Some(inbox_rx);
        self.inner.state.set(ConnectionState::Connected);

        let reader = tokio::spawn(Arc::clone(&self.inner).read_loop(reader, inbox_tx, token));
        *self.inner.reader.lock().await = Some(reader);

        tracing::info!("transport[websocket]: connected to {}", self.inner.url);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let previous = self.inner.state.set(ConnectionState::Disconnected);
        self.inner.token().cancel();
        self.inner.pending.lock().unwrap_or_else(|p| p.into_inner()).clear();

        if let Some(reader) = self.inner.reader.lock().await.take() {
            if let Err(e) = reader.await {
                tracing::warn!("transport[websocket]: reader task failed: {}", e);
            }
        }
        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            if tokio::time::timeout(CLOSE_GRACE, writer.close()).await.is_err() {
                tracing::debug!("transport[websocket]: close handshake to {} timed out", self.inner.url);
            }
        }
        self.inner.inbox.lock().await.take();

        if previous != ConnectionState::Disconnected {
            tracing::info!("transport[websocket]: disconnected from {}", self.inner.url);
        }
        Ok(())
    }

    /// Send one frame. For a request, waits for the reply with the same id.
    async fn send_message(&self, message: Message) -> Result<Option<Message>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let Message::Request { id, .. } = &message else {
            self.inner.write(&message).await?;
            return Ok(None);
        };

        let id = id.clone();
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id.clone(), tx);

        if let Err(e) = self.inner.write(&message).await {
            self.inner.forget_pending(&id);
            return Err(e);
        }

        let token = self.inner.token();
        tokio::select! {
            reply = rx => reply.map(Some).map_err(|_| TransportError::Closed),
            _ = token.cancelled() => {
                self.inner.forget_pending(&id);
                Err(TransportError::Closed)
            }
        }
    }

    /// Next inbound request or notification that no handler consumed.
    async fn receive_message(&self) -> Result<Option<Message>, TransportError> {
        let token = self.inner.token();
        let mut guard = self.inner.inbox.lock().await;
        let inbox = guard.as_mut().ok_or(TransportError::NotConnected)?;
        tokio::select! {
            _ = token.cancelled() => Ok(None),
            message = inbox.recv() => Ok(message),
        }
    }

    /// Inbound frames are read by the task `connect()` starts; this parks
    /// until the connection ends.
    async fn receive_messages(&self) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.inner.token().cancelled().await;
        match self.state() {
            ConnectionState::Error => Err(TransportError::Closed),
            _ => Ok(()),
        }
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        self.inner.handler.set(handler);
    }

    async fn health_check(&self) -> Value {
        json!({
            "transport": self.kind().as_str(),
            "connected": self.is_connected(),
            "url": self.inner.url.as_str(),
            "pending_requests": self.pending_requests(),
        })
    }
}
