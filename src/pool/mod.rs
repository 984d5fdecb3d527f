//! Connection pool over pluggable transports.
//!
//! The pool keeps up to `max_connections` connected transports, drawn
//! round-robin from the registered [`ConnectionConfig`]s. Callers check a
//! connection out with [`ConnectionPool::acquire`] and give it back by dropping
//! the returned [`PooledConnection`]. Every endpoint has its own
//! [`CircuitBreaker`] guarding both connection creation and sends.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::error::{CircuitBreakerError, ConnectionPoolError, TransportError};
use crate::message::Message;
use crate::transport::{
    HttpOptions, PushOptions, PushTransport, RequestTransport, SocketClient, Transport, TransportKind,
};

pub mod watchdog;

// ── Configuration ───────────────────────────────────────────────────────────

/// One endpoint the pool may connect to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub transport_kind: TransportKind,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16, transport_kind: TransportKind) -> Self {
        Self {
            host: host.into(),
            port,
            transport_kind,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}://{}:{}", self.transport_kind, self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_connections: usize,
    pub health_check_interval: Duration,
    /// Upper bound for one connection's health probe.
    pub health_check_timeout: Duration,
    pub breaker: CircuitBreakerConfig,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

// ── Transport construction ──────────────────────────────────────────────────

/// Builds an unconnected transport for a config; the pool connects it.
pub trait TransportFactory: Send + Sync {
    fn create(&self, config: &ConnectionConfig) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Maps each kind to its client-side transport: `http` to a remote
/// [`RequestTransport`], `sse` to a [`PushTransport`] on `/sse`, `websocket`
/// to a [`SocketClient`] dialing `/ws`. Stream transports cannot be pooled.
#[derive(Debug, Clone, Default)]
pub struct DefaultTransportFactory {
    pub http: HttpOptions,
    pub push: PushOptions,
}

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, config: &ConnectionConfig) -> Result<Arc<dyn Transport>, TransportError> {
        let transport: Arc<dyn Transport> = match config.transport_kind {
            TransportKind::Http => Arc::new(RequestTransport::remote(
                &format!("http://{}:{}/", config.host, config.port),
                self.http.clone(),
            )?),
            TransportKind::Sse => Arc::new(PushTransport::new(
                &format!("http://{}:{}/sse", config.host, config.port),
                self.push.clone(),
            )?),
            TransportKind::Websocket => Arc::new(SocketClient::for_endpoint(&config.host, config.port)?),
            TransportKind::Stdio => {
                return Err(TransportError::Unsupported(TransportKind::Stdio, "pooling"));
            }
        };
        Ok(transport)
    }
}

// ── Pool state ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolState {
    Initializing,
    Ready,
    Closed,
}

impl PoolState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => PoolState::Ready,
            2 => PoolState::Closed,
            _ => PoolState::Initializing,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            PoolState::Initializing => 0,
            PoolState::Ready => 1,
            PoolState::Closed => 2,
        }
    }
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PoolState::Initializing => "initializing",
            PoolState::Ready => "ready",
            PoolState::Closed => "closed",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub state: PoolState,
    pub total_connections: usize,
    pub in_use: usize,
    pub connection_configs: usize,
    pub max_connections: usize,
    pub total_created: u64,
    pub total_failures: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub checked: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub endpoint: String,
    pub transport: TransportKind,
    pub connected: bool,
    pub in_use: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub last_health_check_at: Option<DateTime<Utc>>,
}

/// A connected transport owned by the pool.
pub struct PoolConnection {
    id: Uuid,
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    created_at: DateTime<Utc>,
    last_used_at: Mutex<DateTime<Utc>>,
    last_health_check_at: Mutex<Option<DateTime<Utc>>>,
    in_use: AtomicBool,
}

impl PoolConnection {
    fn new(config: ConnectionConfig, transport: Arc<dyn Transport>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            config,
            transport,
            created_at: now,
            last_used_at: Mutex::new(now),
            last_health_check_at: Mutex::new(None),
            in_use: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    /// Mark this connection checked out. `false` if someone else holds it.
    fn claim(&self) -> bool {
        self.in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release(&self) {
        *self.last_used_at.lock().unwrap_or_else(|p| p.into_inner()) = Utc::now();
        self.in_use.store(false, Ordering::Release);
    }

    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            endpoint: self.config.endpoint(),
            transport: self.config.transport_kind,
            connected: self.transport.is_connected(),
            in_use: self.in_use(),
            created_at: self.created_at,
            last_used_at: *self.last_used_at.lock().unwrap_or_else(|p| p.into_inner()),
            last_health_check_at: *self.last_health_check_at.lock().unwrap_or_else(|p| p.into_inner()),
        }
    }
}

// ── Pool ────────────────────────────────────────────────────────────────────

struct PoolInner {
    settings: PoolSettings,
    factory: Arc<dyn TransportFactory>,
    configs: RwLock<Vec<ConnectionConfig>>,
    connections: Mutex<Vec<Arc<PoolConnection>>>,
    permits: Arc<Semaphore>,
    breakers: Mutex<HashMap<ConnectionConfig, Arc<CircuitBreaker>>>,
    cursor: AtomicUsize,
    total_created: AtomicU64,
    total_failures: AtomicU64,
    state: AtomicU8,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(settings: PoolSettings, factory: Arc<dyn TransportFactory>) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_connections.max(1)));
        Self {
            inner: Arc::new(PoolInner {
                settings,
                factory,
                configs: RwLock::new(Vec::new()),
                connections: Mutex::new(Vec::new()),
                permits,
                breakers: Mutex::new(HashMap::new()),
                cursor: AtomicUsize::new(0),
                total_created: AtomicU64::new(0),
                total_failures: AtomicU64::new(0),
                state: AtomicU8::new(PoolState::Initializing.as_u8()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Pool backed by [`DefaultTransportFactory`].
    pub fn with_default_factory(settings: PoolSettings) -> Self {
        Self::new(settings, Arc::new(DefaultTransportFactory::default()))
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    pub fn state(&self) -> PoolState {
        PoolState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Register an endpoint. Nothing is connected until a caller acquires.
    pub fn add_connection_config(&self, config: ConnectionConfig) {
        tracing::info!("pool: registered endpoint {}", config.endpoint());
        self.inner
            .configs
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(config);
    }

    pub fn connection_configs(&self) -> Vec<ConnectionConfig> {
        self.inner.configs.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// The breaker guarding `config`'s endpoint.
    pub fn circuit_breaker(&self, config: &ConnectionConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.inner.breakers.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(breakers.entry(config.clone()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(
                config.endpoint(),
                self.inner.settings.breaker.clone(),
            ))
        }))
    }

    /// Check out a connection, reusing an idle one or creating a new one.
    /// Waits while all `max_connections` are checked out.
    ///
    /// A failed connection attempt is counted and returned; the pool does not
    /// retry it.
    pub async fn acquire(&self) -> Result<PooledConnection, ConnectionPoolError> {
        if self.state() == PoolState::Closed {
            return Err(ConnectionPoolError::Closed);
        }
        if self.inner.configs.read().unwrap_or_else(|p| p.into_inner()).is_empty() {
            return Err(ConnectionPoolError::NoConfigs);
        }

        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| ConnectionPoolError::Closed)?;

        if let Some(connection) = self.claim_idle() {
            return Ok(self.checkout(connection, permit));
        }

        let config = self.next_config().ok_or(ConnectionPoolError::NoConfigs)?;
        let breaker = self.circuit_breaker(&config);
        let connection = breaker
            .call(|| self.create_connection(&config))
            .await
            .map_err(|e| match e {
                CircuitBreakerError::Open(open) => ConnectionPoolError::CircuitOpen(open),
                CircuitBreakerError::Inner(e) => e,
            })?;

        if self.state() == PoolState::Closed {
            let _ = connection.transport.disconnect().await;
            return Err(ConnectionPoolError::Closed);
        }
        connection.claim();
        self.inner
            .connections
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Arc::clone(&connection));
        Ok(self.checkout(connection, permit))
    }

    /// Give a connection back early; same as dropping it.
    pub fn release(&self, connection: PooledConnection) {
        drop(connection);
    }

    pub fn get_pool_stats(&self) -> PoolStats {
        let connections = self.inner.connections.lock().unwrap_or_else(|p| p.into_inner());
        PoolStats {
            state: self.state(),
            total_connections: connections.len(),
            in_use: connections.iter().filter(|c| c.in_use()).count(),
            connection_configs: self.inner.configs.read().unwrap_or_else(|p| p.into_inner()).len(),
            max_connections: self.inner.settings.max_connections,
            total_created: self.inner.total_created.load(Ordering::Relaxed),
            total_failures: self.inner.total_failures.load(Ordering::Relaxed),
        }
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.inner
            .connections
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|c| c.info())
            .collect()
    }

    /// Spawn the periodic health check. It stops when the pool is closed.
    pub fn start_health_checks(&self) -> JoinHandle<()> {
        watchdog::spawn(self.clone())
    }

    /// Probe every idle connection once; unhealthy ones are disconnected and
    /// removed so the next `acquire` recreates them. Checked-out connections
    /// are left alone.
    pub async fn run_health_check(&self) -> HealthReport {
        let idle: Vec<Arc<PoolConnection>> = self
            .inner
            .connections
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|c| !c.in_use())
            .cloned()
            .collect();

        let mut report = HealthReport::default();
        for connection in idle {
            report.checked += 1;
            let healthy = self.probe(&connection).await;
            *connection
                .last_health_check_at
                .lock()
                .unwrap_or_else(|p| p.into_inner()) = Some(Utc::now());
            if healthy {
                continue;
            }
            // Skip connections acquired while the probe ran.
            if !connection.claim() {
                continue;
            }
            self.remove(&connection);
            if let Err(e) = connection.transport.disconnect().await {
                tracing::warn!("pool: disconnect of {} failed: {}", connection.config.endpoint(), e);
            }
            tracing::warn!(
                "pool: removed unhealthy connection {} to {}",
                connection.id,
                connection.config.endpoint()
            );
            report.removed += 1;
        }
        report
    }

    /// Stop the health checks, disconnect everything and refuse further
    /// acquisitions. Idempotent.
    pub async fn close(&self) {
        let previous = self.inner.state.swap(PoolState::Closed.as_u8(), Ordering::AcqRel);
        self.inner.shutdown.cancel();
        self.inner.permits.close();

        let connections: Vec<Arc<PoolConnection>> = self
            .inner
            .connections
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for connection in &connections {
            if let Err(e) = connection.transport.disconnect().await {
                tracing::warn!("pool: disconnect of {} failed: {}", connection.config.endpoint(), e);
            }
        }
        if PoolState::from_u8(previous) != PoolState::Closed {
            tracing::info!("pool: closed ({} connections released)", connections.len());
        }
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    fn claim_idle(&self) -> Option<Arc<PoolConnection>> {
        let mut connections = self.inner.connections.lock().unwrap_or_else(|p| p.into_inner());
        // Idle connections that dropped since their last use would otherwise
        // hold a slot without a permit.
        connections.retain(|c| c.in_use() || c.transport.is_connected());
        connections.iter().find(|c| c.claim()).cloned()
    }

    fn next_config(&self) -> Option<ConnectionConfig> {
        let configs = self.inner.configs.read().unwrap_or_else(|p| p.into_inner());
        if configs.is_empty() {
            return None;
        }
        let index = self.inner.cursor.fetch_add(1, Ordering::Relaxed) % configs.len();
        Some(configs[index].clone())
    }

    async fn create_connection(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Arc<PoolConnection>, ConnectionPoolError> {
        let endpoint = config.endpoint();
        let connected = match self.inner.factory.create(config) {
            Ok(transport) => match transport.connect().await {
                Ok(()) => Ok(transport),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        let transport = match connected {
            Ok(transport) => transport,
            Err(source) => {
                self.inner.total_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("pool: connection to {} failed: {}", endpoint, source);
                return Err(ConnectionPoolError::Connect { endpoint, source });
            }
        };

        self.inner.total_created.fetch_add(1, Ordering::Relaxed);
        let _ = self.inner.state.compare_exchange(
            PoolState::Initializing.as_u8(),
            PoolState::Ready.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        tracing::info!("pool: opened connection to {}", endpoint);
        Ok(Arc::new(PoolConnection::new(config.clone(), transport)))
    }

    async fn probe(&self, connection: &PoolConnection) -> bool {
        if !connection.transport.is_connected() {
            return false;
        }
        match tokio::time::timeout(
            self.inner.settings.health_check_timeout,
            connection.transport.health_check(),
        )
        .await
        {
            Ok(report) => report.get("connected").and_then(|v| v.as_bool()).unwrap_or(true),
            Err(_) => {
                tracing::warn!(
                    "pool: health check of {} timed out after {}s",
                    connection.config.endpoint(),
                    self.inner.settings.health_check_timeout.as_secs()
                );
                false
            }
        }
    }

    fn remove(&self, connection: &Arc<PoolConnection>) {
        self.inner
            .connections
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|c| !Arc::ptr_eq(c, connection));
    }

    fn checkout(&self, connection: Arc<PoolConnection>, permit: OwnedSemaphorePermit) -> PooledConnection {
        let breaker = self.circuit_breaker(&connection.config);
        PooledConnection {
            connection,
            breaker,
            _permit: permit,
        }
    }
}

// ── Checked-out connection ──────────────────────────────────────────────────

/// A connection on loan from the pool. Dropping it returns the connection.
pub struct PooledConnection {
    connection: Arc<PoolConnection>,
    breaker: Arc<CircuitBreaker>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn id(&self) -> Uuid {
        self.connection.id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.connection.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.connection.transport
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Send through the endpoint's circuit breaker. Operations the transport
    /// does not support do not count as failures.
    pub async fn send(&self, message: Message) -> Result<Option<Message>, ConnectionPoolError> {
        self.breaker
            .call_when(
                || self.connection.transport.send_message(message),
                |e: &TransportError| !matches!(e, TransportError::Unsupported(..)),
            )
            .await
            .map_err(|e| match e {
                CircuitBreakerError::Open(open) => ConnectionPoolError::CircuitOpen(open),
                CircuitBreakerError::Inner(e) => ConnectionPoolError::Transport(e),
            })
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.connection.release();
    }
}
