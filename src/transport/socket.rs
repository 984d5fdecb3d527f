//! Multiplexed WebSocket transport.
//!
//! Each connected peer gets two tasks: an inbound loop that parses
//! line-delimited frames and (optionally rate-limited) dispatches them to the
//! handler, and a sender loop that drains the peer's bounded [`PeerQueue`] at
//! the configured send rate. Handler replies go through the same queue, so
//! every frame a peer receives is serialized by its single sender loop.

use std::collections::HashMap;
use std::fmt;
use std::future::ready;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::queue::{Enqueued, OverflowPolicy, PeerQueue};
use super::{ConnectionState, HandlerSlot, MessageHandler, StateCell, Transport, TransportKind};
use crate::error::TransportError;
use crate::message::{Message, PARSE_ERROR};
use crate::rate_limit::RateLimiter;

#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Outbound messages per second, per peer. `None` sends as fast as the
    /// socket accepts.
    pub send_rate: Option<f64>,
    /// Inbound messages per second, per peer.
    pub receive_rate: Option<f64>,
    pub send_queue_limit: usize,
    pub overflow_policy: OverflowPolicy,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            send_rate: None,
            receive_rate: None,
            send_queue_limit: 100,
            overflow_policy: OverflowPolicy::default(),
        }
    }
}

struct Peer {
    id: Uuid,
    queue: PeerQueue,
    token: CancellationToken,
}

impl Peer {
    async fn enqueue(&self, message: Message) -> Enqueued {
        let outcome = self.queue.push(message).await;
        match outcome {
            Enqueued::DroppedNewest => {
                tracing::warn!("transport[websocket]: peer {} queue full, dropped newest message", self.id)
            }
            Enqueued::DroppedOldest => {
                tracing::warn!("transport[websocket]: peer {} queue full, dropped oldest message", self.id)
            }
            Enqueued::Closed => {
                tracing::debug!("transport[websocket]: peer {} queue closed, message discarded", self.id)
            }
            Enqueued::Queued => {}
        }
        outcome
    }
}

struct Inner {
    host: String,
    port: u16,
    options: SocketOptions,
    state: StateCell,
    handler: HandlerSlot,
    peers: RwLock<HashMap<Uuid, Arc<Peer>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: Mutex<CancellationToken>,
    server: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

pub struct SocketTransport {
    inner: Arc<Inner>,
}

impl SocketTransport {
    /// Accept WebSocket peers at `ws://host:port/ws` once connected. Port `0`
    /// picks an ephemeral port.
    pub fn new(host: impl Into<String>, port: u16, options: SocketOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                host: host.into(),
                port,
                options,
                state: StateCell::new(),
                handler: HandlerSlot::default(),
                peers: RwLock::new(HashMap::new()),
                local_addr: Mutex::new(None),
                shutdown: Mutex::new(CancellationToken::new()),
                server: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn options(&self) -> &SocketOptions {
        &self.inner.options
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_upgrade))
            .route("/health", get(health))
            .with_state(Arc::clone(&self.inner))
    }

    /// Attach a peer from any frame stream/sink pair. Each inbound item may
    /// hold one or more newline-separated messages; each outbound item is one
    /// encoded message.
    pub fn attach_peer<S, K>(&self, inbound: S, outbound: K) -> Result<Uuid, TransportError>
    where
        S: Stream<Item = String> + Send + 'static,
        K: Sink<String> + Send + 'static,
        K::Error: fmt::Display + Send,
    {
        self.inner.attach(inbound, outbound)
    }

    pub fn peer_ids(&self) -> Vec<Uuid> {
        self.inner.peers.read().unwrap_or_else(|p| p.into_inner()).keys().copied().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Messages waiting in `peer`'s outbound queue.
    pub fn queue_len(&self, peer: Uuid) -> Option<usize> {
        self.inner.peer(peer).map(|p| p.queue.len())
    }

    /// Queue `message` for one peer only.
    pub async fn send_to(&self, peer: Uuid, message: Message) -> Result<Enqueued, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let peer = self.inner.peer(peer).ok_or(TransportError::UnknownPeer(peer))?;
        Ok(peer.enqueue(message).await)
    }

    /// Drop one peer, closing its socket.
    pub fn detach_peer(&self, peer: Uuid) -> bool {
        match self.inner.remove_peer(peer) {
            Some(peer) => {
                peer.token.cancel();
                peer.queue.close();
                true
            }
            None => false,
        }
    }
}

impl Inner {
    fn token(&self) -> CancellationToken {
        self.shutdown.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn peer(&self, id: Uuid) -> Option<Arc<Peer>> {
        self.peers.read().unwrap_or_else(|p| p.into_inner()).get(&id).cloned()
    }

    fn remove_peer(&self, id: Uuid) -> Option<Arc<Peer>> {
        self.peers.write().unwrap_or_else(|p| p.into_inner()).remove(&id)
    }

    fn health(&self) -> Value {
        let address = *self.local_addr.lock().unwrap_or_else(|p| p.into_inner());
        json!({
            "transport": TransportKind::Websocket.as_str(),
            "connected": self.state.get() == ConnectionState::Connected,
            "peers": self.peers.read().unwrap_or_else(|p| p.into_inner()).len(),
            "address": address.map(|a| a.to_string()),
        })
    }

    fn attach<S, K>(self: &Arc<Self>, inbound: S, outbound: K) -> Result<Uuid, TransportError>
    where
        S: Stream<Item = String> + Send + 'static,
        K: Sink<String> + Send + 'static,
        K::Error: fmt::Display + Send,
    {
        if self.state.get() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        let peer = Arc::new(Peer {
            id: Uuid::new_v4(),
            queue: PeerQueue::new(self.options.send_queue_limit, self.options.overflow_policy),
            token: self.token().child_token(),
        });
        let id = peer.id;
        self.peers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, Arc::clone(&peer));
        tracing::info!("transport[websocket]: peer {} connected", id);

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::join!(
                inner.receive_loop(&peer, inbound),
                inner.send_loop(&peer, outbound),
            );
            inner.remove_peer(peer.id);
            tracing::info!("transport[websocket]: peer {} disconnected", peer.id);
        });
        Ok(id)
    }

    async fn receive_loop<S>(&self, peer: &Arc<Peer>, inbound: S)
    where
        S: Stream<Item = String> + Send,
    {
        let mut inbound = pin!(inbound);
        let mut limiter = self.options.receive_rate.map(RateLimiter::per_second);
        let mut tasks = JoinSet::new();

        loop {
            let frame = tokio::select! {
                biased;
                _ = peer.token.cancelled() => break,
                frame = inbound.next() => frame,
            };
            let Some(frame) = frame else { break };

            for line in frame.lines().filter(|line| !line.trim().is_empty()) {
                let message = match line.parse::<Message>() {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!("transport[websocket]: peer {} sent unparseable frame: {}", peer.id, e);
                        let reply = Message::error(None, PARSE_ERROR, format!("Parse error: {e}"));
                        tokio::select! {
                            _ = peer.token.cancelled() => break,
                            _ = peer.enqueue(reply) => {}
                        }
                        continue;
                    }
                };
                if message.is_reply() {
                    tracing::warn!(
                        kind = %message.kind(),
                        "transport[websocket]: peer {} sent unsolicited reply, dropping",
                        peer.id
                    );
                    continue;
                }
                if let Some(limiter) = limiter.as_mut() {
                    tokio::select! {
                        _ = peer.token.cancelled() => break,
                        _ = limiter.acquire() => {}
                    }
                }
                let Some(handler) = self.handler.get() else {
                    tracing::warn!("transport[websocket]: no message handler set, dropping message");
                    continue;
                };
                let peer = Arc::clone(peer);
                tasks.spawn(async move {
                    if let Some(reply) = handler(message).await {
                        peer.enqueue(reply).await;
                    }
                });
            }

            while let Some(finished) = tasks.try_join_next() {
                if let Err(e) = finished {
                    tracing::warn!("transport[websocket]: dispatch task failed: {}", e);
                }
            }
        }

        if peer.token.is_cancelled() {
            tasks.abort_all();
        }
        while let Some(finished) = tasks.join_next().await {
            if let Err(e) = finished {
                if !e.is_cancelled() {
                    tracing::warn!("transport[websocket]: dispatch task failed: {}", e);
                }
            }
        }
        // Lets the sender flush what is left, then stop.
        peer.queue.close();
    }

    async fn send_loop<K>(&self, peer: &Peer, outbound: K)
    where
        K: Sink<String> + Send,
        K::Error: fmt::Display + Send,
    {
        let mut outbound = pin!(outbound);
        let mut limiter = self.options.send_rate.map(RateLimiter::per_second);

        loop {
            let message = tokio::select! {
                _ = peer.token.cancelled() => break,
                message = peer.queue.pop() => message,
            };
            let Some(message) = message else { break };

            if let Some(limiter) = limiter.as_mut() {
                tokio::select! {
                    _ = peer.token.cancelled() => break,
                    _ = limiter.acquire() => {}
                }
            }
            let frame = match message.encode() {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!("transport[websocket]: failed to encode message: {}", e);
                    continue;
                }
            };
            let sent = tokio::select! {
                _ = peer.token.cancelled() => break,
                sent = outbound.send(frame) => sent,
            };
            if let Err(e) = sent {
                let reason = e.to_string();
                tracing::warn!("transport[websocket]: send to peer {} failed: {}", peer.id, reason);
                peer.token.cancel();
                break;
            }
        }

        // A cancelled peer's sink is dropped as is; a stalled one would never close.
        if peer.token.is_cancelled() {
            return;
        }
        let closed = tokio::select! {
            _ = peer.token.cancelled() => return,
            closed = outbound.close() => closed,
        };
        if let Err(e) = closed {
            let reason = e.to_string();
            tracing::debug!("transport[websocket]: closing peer {} sink: {}", peer.id, reason);
        }
    }
}

// ── Routes ──────────────────────────────────────────────────────────────────

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(inner): State<Arc<Inner>>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        tracing::debug!("transport[websocket]: upgrade from {}", remote);
        attach_websocket(inner, socket);
    })
}

fn attach_websocket(inner: Arc<Inner>, socket: WebSocket) {
    let (sink, stream) = socket.split();
    let inbound = stream
        .take_while(|frame| ready(matches!(frame, Ok(frame) if !matches!(frame, WsMessage::Close(_)))))
        .filter_map(|frame| {
            ready(match frame {
                Ok(WsMessage::Text(text)) => Some(text.as_str().to_owned()),
                Ok(WsMessage::Binary(bytes)) => String::from_utf8(bytes.to_vec()).ok(),
                _ => None,
            })
        });
    let outbound = sink.with(|frame: String| ready(Ok::<_, axum::Error>(WsMessage::Text(frame.into()))));

    if let Err(e) = inner.attach(inbound, outbound) {
        tracing::warn!("transport[websocket]: refusing peer: {}", e);
    }
}

async fn health(State(inner): State<Arc<Inner>>) -> Json<Value> {
    Json(inner.health())
}

// ── Transport impl ──────────────────────────────────────────────────────────

#[async_trait]
impl Transport for SocketTransport {
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
        let listener = match TcpListener::bind((self.inner.host.as_str(), self.inner.port)).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(
                    "transport[websocket]: failed to bind {}:{}: {}",
                    self.inner.host,
                    self.inner.port,
                    e
                );
                self.inner.state.set(ConnectionState::Error);
                return Err(TransportError::Connect(format!(
                    "failed to bind {}:{}: {e}",
                    self.inner.host, self.inner.port
                )));
            }
        };
        let addr = listener.local_addr()?;

        let token = CancellationToken::new();
        *self.inner.shutdown.lock().unwrap_or_else(|p| p.into_inner()) = token.clone();
        *self.inner.local_addr.lock().unwrap_or_else(|p| p.into_inner()) = Some(addr);
        self.inner.state.set(ConnectionState::Connected);

        let app = self.router().layer(TraceLayer::new_for_http());
        let server = tokio::spawn(async move {
            let result = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(token.cancelled_owned())
                .await;
            if let Err(e) = result {
                tracing::error!("transport[websocket]: server stopped: {}", e);
            }
        });
        *self.inner.server.lock().await = Some(server);

        tracing::info!("transport[websocket]: listening on ws://{}/ws", addr);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let previous = self.inner.state.set(ConnectionState::Disconnected);
        self.inner.token().cancel();

        let peers: Vec<Arc<Peer>> = self
            .inner
            .peers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .drain()
            .map(|(_, peer)| peer)
            .collect();
        for peer in peers {
            peer.token.cancel();
            peer.queue.close();
        }

        if let Some(server) = self.inner.server.lock().await.take() {
            if let Err(e) = server.await {
                tracing::warn!("transport[websocket]: server task failed: {}", e);
            }
        }
        self.inner.local_addr.lock().unwrap_or_else(|p| p.into_inner()).take();
        if previous != ConnectionState::Disconnected {
            tracing::info!("transport[websocket]: disconnected");
        }
        Ok(())
    }

    /// Queue `message` for every connected peer. Never returns a reply.
    async fn send_message(&self, message: Message) -> Result<Option<Message>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let peers: Vec<Arc<Peer>> = self
            .inner
            .peers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        if peers.is_empty() {
            tracing::debug!("transport[websocket]: no peers connected, message not delivered");
        }
        for peer in peers {
            peer.enqueue(message.clone()).await;
        }
        Ok(None)
    }

    async fn receive_message(&self) -> Result<Option<Message>, TransportError> {
        Err(TransportError::Unsupported(TransportKind::Websocket, "receive_message"))
    }

    /// Peers are served by their own tasks; this parks until disconnect.
    async fn receive_messages(&self) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.inner.token().cancelled().await;
        Ok(())
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        self.inner.handler.set(handler);
    }

    async fn health_check(&self) -> Value {
        self.inner.health()
    }
}
