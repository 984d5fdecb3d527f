//! Single-shot request/response transport over HTTP.
//!
//! A `RequestTransport` plays one of two roles:
//!
//! * **serve** -- binds an axum server exposing `POST /mcp` (submit one
//!   message, get the handler's reply back in the response body), `GET /health`
//!   and `GET /info`. A notification is acknowledged with `202 Accepted` and an
//!   empty body.
//! * **remote** -- the client side of the same contract, for peers that cannot
//!   hold a long-lived connection.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_governor::{GovernorLayer, governor::GovernorConfigBuilder};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use url::Url;

use super::{ConnectionState, HandlerSlot, MessageHandler, StateCell, Transport, TransportKind};
use crate::error::TransportError;
use crate::message::{Message, PARSE_ERROR};

/// Per-IP limit applied to the served router with `tower_governor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpRateLimit {
    /// Seconds between replenishing one request slot.
    pub per_second: u64,
    pub burst: u32,
}

#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub rate_limit: Option<HttpRateLimit>,
    pub body_limit: usize,
    pub request_timeout: Duration,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            rate_limit: None,
            body_limit: 10 * 1024 * 1024,
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
enum Endpoint {
    Serve { host: String, port: u16 },
    Remote { base: Url, client: reqwest::Client },
}

struct Inner {
    endpoint: Endpoint,
    options: HttpOptions,
    state: StateCell,
    handler: HandlerSlot,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: Mutex<CancellationToken>,
    server: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

pub struct RequestTransport {
    inner: Arc<Inner>,
}

impl RequestTransport {
    /// Serve the submit/health/info endpoints on `host:port` once connected.
    /// Port `0` picks an ephemeral port; see [`RequestTransport::local_addr`].
    pub fn serve(host: impl Into<String>, port: u16, options: HttpOptions) -> Self {
        Self::build(
            Endpoint::Serve {
                host: host.into(),
                port,
            },
            options,
        )
    }

    /// Client for a peer serving the same endpoints under `base_url`.
    pub fn remote(base_url: &str, options: HttpOptions) -> Result<Self, TransportError> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .build()?;
        Ok(Self::build(Endpoint::Remote { base, client }, options))
    }

    fn build(endpoint: Endpoint, options: HttpOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                endpoint,
                options,
                state: StateCell::new(),
                handler: HandlerSlot::default(),
                local_addr: Mutex::new(None),
                shutdown: Mutex::new(CancellationToken::new()),
                server: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Address the server is bound to while serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// The submit/health/info routes, without rate limiting or tracing layers.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/mcp", post(submit))
            .route("/health", get(health))
            .route("/info", get(info))
            .layer(RequestBodyLimitLayer::new(self.inner.options.body_limit))
            .with_state(Arc::clone(&self.inner))
    }

    async fn start_server(&self, host: &str, port: u16) -> Result<(), TransportError> {
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| TransportError::Connect(format!("failed to bind {host}:{port}: {e}")))?;
        let addr = listener.local_addr()?;

        let mut app = self.router().layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                )
            }),
        );
        if let Some(limit) = self.inner.options.rate_limit {
            let governor_conf = GovernorConfigBuilder::default()
                .per_second(limit.per_second)
                .burst_size(limit.burst)
                .finish()
                .ok_or_else(|| TransportError::Connect(format!("invalid HTTP rate limit {limit:?}")))?;
            app = app.layer(GovernorLayer::new(governor_conf));
        }

        let token = CancellationToken::new();
        *self.inner.shutdown.lock().unwrap_or_else(|p| p.into_inner()) = token.clone();
        *self.inner.local_addr.lock().unwrap_or_else(|p| p.into_inner()) = Some(addr);

        let server = tokio::spawn(async move {
            let result = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(token.cancelled_owned())
                .await;
            if let Err(e) = result {
                tracing::error!("transport[http]: server stopped: {}", e);
            }
        });
        *self.inner.server.lock().await = Some(server);

        tracing::info!("transport[http]: listening on http://{}", addr);
        Ok(())
    }

    async fn probe_remote(&self, base: &Url, client: &reqwest::Client) -> Result<(), TransportError> {
        let response = client.get(base.join("health")?).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }
        *self.inner.shutdown.lock().unwrap_or_else(|p| p.into_inner()) = CancellationToken::new();
        tracing::info!("transport[http]: remote {} is reachable", base);
        Ok(())
    }

    async fn post_message(
        &self,
        base: &Url,
        client: &reqwest::Client,
        message: &Message,
    ) -> Result<Option<Message>, TransportError> {
        let body = message.encode()?;
        let response = client
            .post(base.join("mcp")?)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        if status == reqwest::StatusCode::ACCEPTED || bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        Ok(Some(Message::from_slice(&bytes)?))
    }
}

impl Inner {
    fn health(&self) -> Value {
        let mut report = json!({
            "transport": TransportKind::Http.as_str(),
            "connected": self.state.get() == ConnectionState::Connected,
        });
        match &self.endpoint {
            Endpoint::Serve { .. } => {
                report["mode"] = json!("serve");
                let addr = *self.local_addr.lock().unwrap_or_else(|p| p.into_inner());
                report["address"] = json!(addr.map(|a| a.to_string()));
            }
            Endpoint::Remote { base, .. } => {
                report["mode"] = json!("remote");
                report["url"] = json!(base.as_str());
            }
        }
        report
    }

    fn token(&self) -> CancellationToken {
        self.shutdown.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

// ── Routes ──────────────────────────────────────────────────────────────────

async fn submit(State(inner): State<Arc<Inner>>, body: Bytes) -> Response {
    let message = match Message::from_slice(&body) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!("transport[http]: rejecting malformed body: {}", e);
            let reply = Message::error(None, PARSE_ERROR, format!("Parse error: {e}"));
            return (StatusCode::BAD_REQUEST, Json(reply)).into_response();
        }
    };

    if message.is_reply() {
        tracing::warn!(kind = %message.kind(), "transport[http]: dropping unsolicited reply");
        return StatusCode::ACCEPTED.into_response();
    }

    let Some(handler) = inner.handler.get() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "no message handler registered" })),
        )
            .into_response();
    };

    match handler(message).await {
        Some(reply) => Json(reply).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

async fn health(State(inner): State<Arc<Inner>>) -> Json<Value> {
    Json(inner.health())
}

async fn info() -> Json<Value> {
    Json(json!({
        "transport": TransportKind::Http.as_str(),
        "protocol": "jsonrpc-2.0",
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "submit": "POST /mcp",
            "health": "GET /health",
            "info": "GET /info",
        },
    }))
}

// ── Transport impl ──────────────────────────────────────────────────────────

#[async_trait]
impl Transport for RequestTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    async fn connect(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }
        let endpoint = self.inner.endpoint.clone();
        let result = match &endpoint {
            Endpoint::Serve { host, port } => self.start_server(host, *port).await,
            Endpoint::Remote { base, client } => self.probe_remote(base, client).await,
        };
        match result {
            Ok(()) => {
                self.inner.state.set(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                tracing::error!("transport[http]: connect failed: {}", e);
                self.inner.state.set(ConnectionState::Error);
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let previous = self.inner.state.set(ConnectionState::Disconnected);
        self.inner.token().cancel();
        if let Some(server) = self.inner.server.lock().await.take() {
            if let Err(e) = server.await {
                tracing::warn!("transport[http]: server task failed: {}", e);
            }
        }
        self.inner.local_addr.lock().unwrap_or_else(|p| p.into_inner()).take();
        if previous != ConnectionState::Disconnected {
            tracing::info!("transport[http]: disconnected");
        }
        Ok(())
    }

    /// POST `message` to the remote peer. Returns the reply body, or `None`
    /// when the peer acknowledged a notification.
    async fn send_message(&self, message: Message) -> Result<Option<Message>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        match &self.inner.endpoint {
            Endpoint::Remote { base, client } => self.post_message(base, client, &message).await,
            Endpoint::Serve { .. } => Err(TransportError::Unsupported(
                TransportKind::Http,
                "server-initiated messages",
            )),
        }
    }

    async fn receive_message(&self) -> Result<Option<Message>, TransportError> {
        Err(TransportError::Unsupported(TransportKind::Http, "receive_message"))
    }

    /// Inbound requests are dispatched by the server as they arrive; this just
    /// parks until the transport disconnects.
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
