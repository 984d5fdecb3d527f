//! Environment-driven configuration.
//!
//! Values are read from the process environment (the binary loads `.env`
//! first with `dotenvy`). Unset variables fall back to defaults; set but
//! malformed ones are an error.

use std::str::FromStr;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::ConfigError;
use crate::pool::PoolSettings;
use crate::transport::{HttpOptions, HttpRateLimit, OverflowPolicy, PushOptions, SocketOptions, TransportKind};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8765;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub transport: TransportKind,
    pub host: String,
    pub port: u16,
    pub http: HttpOptions,
    pub socket: SocketOptions,
    pub push: PushOptions,
    pub pool: PoolSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Stdio,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            http: HttpOptions::default(),
            socket: SocketOptions::default(),
            push: PushOptions::default(),
            pool: PoolSettings::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let defaults = Self::default();

        let receive_rate = env.rate("MCP_RECEIVE_RATE")?;
        let http_rate_limit = match (
            env.parse::<u64>("MCP_HTTP_RATE_PER_SECOND")?,
            env.parse::<u32>("MCP_HTTP_BURST")?,
        ) {
            (None, None) => None,
            (per_second, burst) => Some(HttpRateLimit {
                per_second: per_second.unwrap_or(2),
                burst: burst.unwrap_or(30),
            }),
        };

        Ok(Self {
            transport: env.parse("MCP_TRANSPORT")?.unwrap_or(defaults.transport),
            host: env.get("MCP_HOST").unwrap_or(defaults.host),
            port: env.parse("MCP_PORT")?.unwrap_or(defaults.port),
            http: HttpOptions {
                rate_limit: http_rate_limit,
                ..defaults.http
            },
            socket: SocketOptions {
                send_rate: env.rate("MCP_SEND_RATE")?,
                receive_rate,
                send_queue_limit: env
                    .parse("MCP_SEND_QUEUE_LIMIT")?
                    .unwrap_or(defaults.socket.send_queue_limit),
                overflow_policy: env
                    .parse::<OverflowPolicy>("MCP_OVERFLOW_POLICY")?
                    .unwrap_or(defaults.socket.overflow_policy),
            },
            push: PushOptions {
                receive_rate,
                ..defaults.push
            },
            pool: PoolSettings {
                max_connections: env
                    .parse("MCP_POOL_MAX_CONNECTIONS")?
                    .unwrap_or(defaults.pool.max_connections),
                health_check_interval: env
                    .parse("MCP_POOL_HEALTH_INTERVAL_SECS")?
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.pool.health_check_interval),
                breaker: CircuitBreakerConfig {
                    failure_threshold: env
                        .parse("MCP_BREAKER_FAILURE_THRESHOLD")?
                        .unwrap_or(defaults.pool.breaker.failure_threshold),
                    recovery_timeout: env
                        .parse("MCP_BREAKER_RECOVERY_SECS")?
                        .map(Duration::from_secs)
                        .unwrap_or(defaults.pool.breaker.recovery_timeout),
                    half_open_max_calls: env
                        .parse("MCP_BREAKER_HALF_OPEN_CALLS")?
                        .unwrap_or(defaults.pool.breaker.half_open_max_calls),
                },
                ..defaults.pool
            },
        })
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &'static str) -> Result<Option<T>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::Invalid { key, value }),
        }
    }

    /// A positive messages-per-second rate.
    fn rate(&self, key: &'static str) -> Result<Option<f64>, ConfigError> {
        match self.parse::<f64>(key)? {
            Some(rate) if !(rate.is_finite() && rate > 0.0) => Err(ConfigError::Invalid {
                key,
                value: rate.to_string(),
            }),
            rate => Ok(rate),
        }
    }
}
