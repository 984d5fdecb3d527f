pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod message;
pub mod pool;
pub mod protocol;
pub mod rate_limit;
pub mod server;
pub mod transport;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use error::{
    CircuitBreakerError, CircuitBreakerOpenError, ConfigError, ConnectionPoolError, ParseError,
    ProtocolError, TransportError,
};
pub use message::{Message, MessageId, MessageKind};
pub use pool::{ConnectionConfig, ConnectionPool, PoolSettings, PooledConnection};
pub use protocol::ProtocolHandler;
pub use transport::{ConnectionState, MessageHandler, Transport, TransportKind};
