// Connection pool behaviour against scripted in-memory transports.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mcp_relay::circuit_breaker::{CircuitBreakerConfig, CircuitState};
use mcp_relay::message::Message;
use mcp_relay::pool::{
    ConnectionConfig, ConnectionPool, DefaultTransportFactory, PoolSettings, PoolState, TransportFactory,
};
use mcp_relay::protocol::ProtocolHandler;
use mcp_relay::server::register_builtin_methods;
use mcp_relay::transport::{
    ConnectionState, MessageHandler, SocketOptions, SocketTransport, Transport, TransportKind,
};
use mcp_relay::{ConnectionPoolError, TransportError};
use serde_json::{Value, json};

// ── Test doubles ────────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeTransport {
    connected: AtomicBool,
    refuse_connect: bool,
    fail_sends: AtomicBool,
    disconnects: AtomicUsize,
}

#[async_trait]
impl Transport for FakeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    fn state(&self) -> ConnectionState {
        if self.connected.load(Ordering::SeqCst) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    async fn connect(&self) -> Result<(), TransportError> {
        if self.refuse_connect {
            return Err(TransportError::Connect("refused".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_message(&self, message: Message) -> Result<Option<Message>, TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(message.id().cloned().map(|id| Message::response(Some(id), json!("ok"))))
    }

    async fn receive_message(&self) -> Result<Option<Message>, TransportError> {
        Ok(None)
    }

    async fn receive_messages(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn set_message_handler(&self, _handler: MessageHandler) {}

    async fn health_check(&self) -> Value {
        json!({ "transport": "http", "connected": self.connected.load(Ordering::SeqCst) })
    }
}

/// Hands out `FakeTransport`s; ports listed in `refused` fail to connect.
#[derive(Default)]
struct FakeFactory {
    refused: Vec<u16>,
    created: Mutex<Vec<(u16, Arc<FakeTransport>)>>,
}

impl FakeFactory {
    fn refusing(ports: &[u16]) -> Self {
        Self {
            refused: ports.to_vec(),
            ..Self::default()
        }
    }

    fn created(&self) -> Vec<(u16, Arc<FakeTransport>)> {
        self.created.lock().unwrap().clone()
    }
}

impl TransportFactory for FakeFactory {
    fn create(&self, config: &ConnectionConfig) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = Arc::new(FakeTransport {
            refuse_connect: self.refused.contains(&config.port),
            ..FakeTransport::default()
        });
        self.created.lock().unwrap().push((config.port, Arc::clone(&transport)));
        Ok(transport)
    }
}

fn endpoint(port: u16) -> ConnectionConfig {
    ConnectionConfig::new("127.0.0.1", port, TransportKind::Http)
}

fn pool_with(settings: PoolSettings, factory: &Arc<FakeFactory>) -> ConnectionPool {
    ConnectionPool::new(settings, Arc::clone(factory) as Arc<dyn TransportFactory>)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn acquire_without_configs_fails() {
    let factory = Arc::new(FakeFactory::default());
    let pool = pool_with(PoolSettings::default(), &factory);
    assert!(matches!(pool.acquire().await, Err(ConnectionPoolError::NoConfigs)));
    assert!(factory.created().is_empty());
}

#[tokio::test]
async fn first_connection_moves_pool_to_ready() {
    let factory = Arc::new(FakeFactory::default());
    let pool = pool_with(PoolSettings::default(), &factory);
    pool.add_connection_config(endpoint(9001));

    let stats = pool.get_pool_stats();
    assert_eq!(stats.state, PoolState::Initializing);
    assert_eq!(stats.total_connections, 0);
    assert_eq!(stats.connection_configs, 1);

    let connection = pool.acquire().await.unwrap();
    assert!(connection.transport().is_connected());
    assert_eq!(connection.config(), &endpoint(9001));

    let stats = pool.get_pool_stats();
    assert_eq!(stats.state, PoolState::Ready);
    assert_eq!((stats.total_connections, stats.in_use), (1, 1));
    assert_eq!(stats.total_created, 1);

    drop(connection);
    assert_eq!(pool.get_pool_stats().in_use, 0);
}

#[tokio::test]
async fn released_connection_is_reused() {
    let factory = Arc::new(FakeFactory::default());
    let pool = pool_with(PoolSettings::default(), &factory);
    pool.add_connection_config(endpoint(9001));

    let first = pool.acquire().await.unwrap();
    let first_id = first.id();
    pool.release(first);

    let second = pool.acquire().await.unwrap();
    assert_eq!(second.id(), first_id);
    assert_eq!(factory.created().len(), 1);
}

#[tokio::test]
async fn configs_are_used_round_robin() {
    let factory = Arc::new(FakeFactory::default());
    let pool = pool_with(PoolSettings::default(), &factory);
    pool.add_connection_config(endpoint(9001));
    pool.add_connection_config(endpoint(9002));

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    let mut ports = vec![a.config().port, b.config().port];
    ports.sort();
    assert_eq!(ports, vec![9001, 9002]);
}

#[tokio::test]
async fn failed_connect_is_counted_and_not_retried() {
    let factory = Arc::new(FakeFactory::refusing(&[9001]));
    let pool = pool_with(PoolSettings::default(), &factory);
    pool.add_connection_config(endpoint(9001));

    let err = pool.acquire().await.err().expect("connect is refused");
    match err {
        ConnectionPoolError::Connect { endpoint, .. } => assert_eq!(endpoint, "http://127.0.0.1:9001"),
        other => panic!("unexpected error: {other}"),
    }

    let stats = pool.get_pool_stats();
    assert_eq!(stats.total_failures, 1);
    assert_eq!(stats.total_connections, 0);
    assert_eq!(stats.state, PoolState::Initializing);
    assert_eq!(factory.created().len(), 1);
}

#[tokio::test]
async fn acquire_waits_while_pool_is_exhausted() {
    let factory = Arc::new(FakeFactory::default());
    let settings = PoolSettings {
        max_connections: 1,
        ..PoolSettings::default()
    };
    let pool = pool_with(settings, &factory);
    pool.add_connection_config(endpoint(9001));

    let held = pool.acquire().await.unwrap();
    let held_id = held.id();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await.map(|c| c.id()) })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    drop(held);
    let reused = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter is released")
        .unwrap()
        .unwrap();
    assert_eq!(reused, held_id);
    assert_eq!(factory.created().len(), 1);
}

#[tokio::test]
async fn health_check_removes_dead_connections_and_acquire_recreates() {
    let factory = Arc::new(FakeFactory::default());
    let pool = pool_with(PoolSettings::default(), &factory);
    pool.add_connection_config(endpoint(9001));

    let connection = pool.acquire().await.unwrap();
    let dead_id = connection.id();
    drop(connection);

    let (_, transport) = factory.created().remove(0);
    transport.connected.store(false, Ordering::SeqCst);

    let report = pool.run_health_check().await;
    assert_eq!((report.checked, report.removed), (1, 1));
    assert_eq!(pool.get_pool_stats().total_connections, 0);
    assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);

    let fresh = pool.acquire().await.unwrap();
    assert_ne!(fresh.id(), dead_id);
    assert_eq!(pool.get_pool_stats().total_created, 2);
}

#[tokio::test]
async fn health_check_skips_checked_out_connections() {
    let factory = Arc::new(FakeFactory::default());
    let pool = pool_with(PoolSettings::default(), &factory);
    pool.add_connection_config(endpoint(9001));

    let held = pool.acquire().await.unwrap();
    factory.created()[0].1.connected.store(false, Ordering::SeqCst);

    let report = pool.run_health_check().await;
    assert_eq!((report.checked, report.removed), (0, 0));
    assert_eq!(pool.get_pool_stats().total_connections, 1);

    let infos = pool.connections();
    assert_eq!(infos.len(), 1);
    assert!(infos[0].in_use);
    assert_eq!(infos[0].id, held.id());
    assert!(infos[0].last_health_check_at.is_none());
}

#[tokio::test]
async fn healthy_connection_records_check_time() {
    let factory = Arc::new(FakeFactory::default());
    let pool = pool_with(PoolSettings::default(), &factory);
    pool.add_connection_config(endpoint(9001));
    drop(pool.acquire().await.unwrap());

    let report = pool.run_health_check().await;
    assert_eq!((report.checked, report.removed), (1, 0));
    assert!(pool.connections()[0].last_health_check_at.is_some());
}

#[tokio::test]
async fn open_breaker_short_circuits_connection_attempts() {
    let factory = Arc::new(FakeFactory::refusing(&[9001]));
    let settings = PoolSettings {
        breaker: CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
        },
        ..PoolSettings::default()
    };
    let pool = pool_with(settings, &factory);
    pool.add_connection_config(endpoint(9001));

    for _ in 0..2 {
        assert!(matches!(
            pool.acquire().await,
            Err(ConnectionPoolError::Connect { .. })
        ));
    }
    assert_eq!(pool.circuit_breaker(&endpoint(9001)).state(), CircuitState::Open);

    assert!(matches!(
        pool.acquire().await,
        Err(ConnectionPoolError::CircuitOpen(_))
    ));
    // The open breaker kept the factory from being called a third time.
    assert_eq!(factory.created().len(), 2);
    assert_eq!(pool.get_pool_stats().total_failures, 2);
}

#[tokio::test]
async fn send_failures_trip_the_endpoint_breaker() {
    let factory = Arc::new(FakeFactory::default());
    let settings = PoolSettings {
        breaker: CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        },
        ..PoolSettings::default()
    };
    let pool = pool_with(settings, &factory);
    pool.add_connection_config(endpoint(9001));

    let connection = pool.acquire().await.unwrap();
    let reply = connection
        .send(Message::request(1i64, "ping", Value::Null))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.result(), Some(&json!("ok")));

    factory.created()[0].1.fail_sends.store(true, Ordering::SeqCst);
    assert!(matches!(
        connection.send(Message::request(2i64, "ping", Value::Null)).await,
        Err(ConnectionPoolError::Transport(TransportError::Closed))
    ));
    assert_eq!(connection.circuit_breaker().state(), CircuitState::Open);
    assert!(matches!(
        connection.send(Message::request(3i64, "ping", Value::Null)).await,
        Err(ConnectionPoolError::CircuitOpen(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn watchdog_probes_on_interval_until_close() {
    let factory = Arc::new(FakeFactory::default());
    let settings = PoolSettings {
        health_check_interval: Duration::from_secs(30),
        ..PoolSettings::default()
    };
    let pool = pool_with(settings, &factory);
    pool.add_connection_config(endpoint(9001));
    drop(pool.acquire().await.unwrap());

    let watchdog = pool.start_health_checks();
    factory.created()[0].1.connected.store(false, Ordering::SeqCst);

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(pool.get_pool_stats().total_connections, 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(pool.get_pool_stats().total_connections, 0);

    pool.close().await;
    tokio::time::timeout(Duration::from_secs(1), watchdog)
        .await
        .expect("watchdog stops after close")
        .unwrap();
}

#[tokio::test]
async fn close_disconnects_and_refuses_new_work() {
    let factory = Arc::new(FakeFactory::default());
    let pool = pool_with(PoolSettings::default(), &factory);
    pool.add_connection_config(endpoint(9001));
    drop(pool.acquire().await.unwrap());

    pool.close().await;
    pool.close().await;

    assert_eq!(pool.state(), PoolState::Closed);
    assert_eq!(pool.get_pool_stats().total_connections, 0);
    assert!(!factory.created()[0].1.connected.load(Ordering::SeqCst));
    assert!(matches!(pool.acquire().await, Err(ConnectionPoolError::Closed)));
}

#[test]
fn default_factory_refuses_stream_transports() {
    let factory = DefaultTransportFactory::default();
    let stdio = ConnectionConfig::new("localhost", 0, TransportKind::Stdio);
    assert!(matches!(
        factory.create(&stdio),
        Err(TransportError::Unsupported(TransportKind::Stdio, _))
    ));

    let http = factory
        .create(&ConnectionConfig::new("localhost", 8080, TransportKind::Http))
        .unwrap();
    assert_eq!(http.kind(), TransportKind::Http);
    let sse = factory
        .create(&ConnectionConfig::new("localhost", 8080, TransportKind::Sse))
        .unwrap();
    assert_eq!(sse.kind(), TransportKind::Sse);
    assert!(!sse.is_connected());
    let websocket = factory
        .create(&ConnectionConfig::new("localhost", 8080, TransportKind::Websocket))
        .unwrap();
    assert_eq!(websocket.kind(), TransportKind::Websocket);
    assert!(!websocket.is_connected());
}

#[tokio::test]
async fn pooled_websocket_dials_a_live_socket_transport() {
    let server = SocketTransport::new("127.0.0.1", 0, SocketOptions::default());
    let protocol = Arc::new(ProtocolHandler::new());
    register_builtin_methods(&protocol);
    server.set_message_handler(protocol.as_message_handler());
    server.connect().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let pool = ConnectionPool::with_default_factory(PoolSettings::default());
    pool.add_connection_config(ConnectionConfig::new("127.0.0.1", port, TransportKind::Websocket));

    let conn = pool.acquire().await.unwrap();
    assert!(conn.transport().is_connected());
    let reply = conn
        .send(Message::request(7i64, "echo", json!({"via": "pool"})))
        .await
        .unwrap()
        .expect("request gets a reply");
    assert_eq!(reply.result(), Some(&json!({"echo": {"via": "pool"}})));

    // The pooled side is a client: the server sees it as one peer.
    assert_eq!(server.peer_count(), 1);
    let health = conn.transport().health_check().await;
    assert_eq!(health["transport"], "websocket");
    assert_eq!(health["url"], format!("ws://127.0.0.1:{port}/ws"));
    drop(conn);

    pool.close().await;
    server.disconnect().await.unwrap();
}

#[tokio::test]
async fn pooled_websocket_fails_when_nobody_listens() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let pool = ConnectionPool::with_default_factory(PoolSettings::default());
    pool.add_connection_config(ConnectionConfig::new("127.0.0.1", port, TransportKind::Websocket));

    assert!(matches!(
        pool.acquire().await,
        Err(ConnectionPoolError::Connect { .. })
    ));
    assert_eq!(pool.get_pool_stats().total_connections, 0);
}

#[test]
fn endpoint_names_include_transport_kind() {
    assert_eq!(
        ConnectionConfig::new("db", 5432, TransportKind::Websocket).endpoint(),
        "websocket://db:5432"
    );
}
