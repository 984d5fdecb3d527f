use std::sync::Arc;

use anyhow::Context;

use mcp_relay::config::ServerConfig;
use mcp_relay::protocol::ProtocolHandler;
use mcp_relay::server;
use mcp_relay::transport::{RequestTransport, SocketTransport, StreamTransport, Transport, TransportKind};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    dotenvy::dotenv().ok();

    // stdout carries protocol frames when serving over stdio, so logs go to stderr.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    if std::env::var("RUST_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let config = ServerConfig::from_env().context("invalid configuration")?;

    let protocol = Arc::new(ProtocolHandler::new());
    server::register_builtin_methods(&protocol);

    let transport: Arc<dyn Transport> = match config.transport {
        TransportKind::Stdio => Arc::new(StreamTransport::stdio()),
        TransportKind::Http => Arc::new(RequestTransport::serve(
            config.host.clone(),
            config.port,
            config.http.clone(),
        )),
        TransportKind::Websocket => Arc::new(SocketTransport::new(
            config.host.clone(),
            config.port,
            config.socket.clone(),
        )),
        TransportKind::Sse => anyhow::bail!("the sse transport is client-only and cannot be served"),
    };
    transport.set_message_handler(protocol.as_message_handler());
    transport
        .connect()
        .await
        .with_context(|| format!("failed to start {} transport", config.transport))?;

    tracing::info!(
        "{} v{} serving over {} ({} methods)",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        config.transport,
        protocol.methods().len()
    );

    tokio::select! {
        result = transport.receive_messages() => {
            if let Err(e) = result {
                tracing::error!("receive loop failed: {}", e);
            }
        }
        _ = shutdown_signal() => {}
    }

    transport.disconnect().await?;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!("failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
