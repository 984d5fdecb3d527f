//! Line-delimited duplex transport.
//!
//! One JSON object per line in each direction. Works over the process's own
//! stdin/stdout, a spawned child process, or any `AsyncRead`/`AsyncWrite` pair.
//! Requests get exactly one reply line; notifications produce no output.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{ConnectionState, HandlerSlot, MessageHandler, StateCell, Transport, TransportKind};
use crate::error::TransportError;
use crate::message::{Message, MessageId, PARSE_ERROR};

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

enum Source {
    /// Caller-supplied pipe pair; consumed by the first `connect()`.
    Io(Mutex<Option<(BoxReader, BoxWriter)>>),
    Stdio,
    Command { program: String, args: Vec<String> },
}

struct Inner {
    source: Source,
    reader: tokio::sync::Mutex<Option<Lines<BufReader<BoxReader>>>>,
    writer: tokio::sync::Mutex<Option<BoxWriter>>,
    child: tokio::sync::Mutex<Option<Child>>,
    pending: Mutex<HashMap<MessageId, oneshot::Sender<Message>>>,
    state: StateCell,
    handler: HandlerSlot,
    shutdown: Mutex<CancellationToken>,
}

pub struct StreamTransport {
    inner: Arc<Inner>,
}

impl StreamTransport {
    /// Talk over an arbitrary reader/writer pair (pipes, sockets, `tokio::io::duplex`).
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pair: (BoxReader, BoxWriter) = (Box::new(reader), Box::new(writer));
        Self::from_source(Source::Io(Mutex::new(Some(pair))))
    }

    /// Talk over this process's stdin/stdout.
    pub fn stdio() -> Self {
        Self::from_source(Source::Stdio)
    }

    /// Spawn `program` on `connect()` and talk over its stdin/stdout. The child
    /// is killed on `disconnect()`.
    pub fn command(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::from_source(Source::Command {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        })
    }

    fn from_source(source: Source) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                reader: tokio::sync::Mutex::new(None),
                writer: tokio::sync::Mutex::new(None),
                child: tokio::sync::Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                state: StateCell::new(),
                handler: HandlerSlot::default(),
                shutdown: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Number of outbound requests still waiting for their reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    async fn open(&self) -> Result<(), TransportError> {
        let (reader, writer, child): (BoxReader, BoxWriter, Option<Child>) = match &self.inner.source {
            Source::Io(pair) => {
                let pair = pair.lock().unwrap_or_else(|p| p.into_inner()).take();
                let (reader, writer) = pair.ok_or_else(|| {
                    TransportError::Connect("stream was already consumed by an earlier connection".to_string())
                })?;
                (reader, writer, None)
            }
            Source::Stdio => (
                Box::new(tokio::io::stdin()) as BoxReader,
                Box::new(tokio::io::stdout()) as BoxWriter,
                None,
            ),
            Source::Command { program, args } => {
                tracing::info!("transport[stdio]: spawning {} {:?}", program, args);
                let mut child = Command::new(program)
                    .args(args)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::inherit())
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| TransportError::Connect(format!("failed to spawn '{program}': {e}")))?;
                let stdin = child
                    .stdin
                    .take()
                    .ok_or_else(|| TransportError::Connect("child stdin was not captured".to_string()))?;
                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| TransportError::Connect("child stdout was not captured".to_string()))?;
                (Box::new(stdout) as BoxReader, Box::new(stdin) as BoxWriter, Some(child))
            }
        };

        *self.inner.reader.lock().await = Some(BufReader::new(reader).lines());
        *self.inner.writer.lock().await = Some(writer);
        *self.inner.child.lock().await = child;
        Ok(())
    }
}

impl Inner {
    fn token(&self) -> CancellationToken {
        self.shutdown.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Next non-blank line, or `None` at end of input.
    async fn read_line(&self) -> Result<Option<String>, TransportError> {
        let mut guard = self.reader.lock().await;
        let lines = guard.as_mut().ok_or(TransportError::NotConnected)?;
        loop {
            match lines.next_line().await? {
                Some(line) if line.trim().is_empty() => continue,
                other => return Ok(other),
            }
        }
    }

    async fn write_line(&self, message: &Message) -> Result<(), TransportError> {
        let mut line = message.encode()?;
        line.push('\n');

        let token = self.token();
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;
        // A peer that stops reading must not pin the writer lock past disconnect.
        let written = tokio::select! {
            _ = token.cancelled() => return Err(TransportError::Closed),
            written = async {
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await
            } => written,
        };
        if let Err(e) = written {
            tracing::error!("transport[stdio]: write failed: {}", e);
            self.state.set(ConnectionState::Error);
            return Err(e.into());
        }
        Ok(())
    }

    /// Hand an inbound reply to the request waiting for it.
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
                    "transport[stdio]: dropping reply with no pending request"
                );
            }
        }
    }

    fn forget_pending(&self, id: &MessageId) {
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).remove(id);
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    async fn connect(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }
        if let Err(e) = self.open().await {
            tracing::error!("transport[stdio]: connect failed: {}", e);
            self.inner.state.set(ConnectionState::Error);
            return Err(e);
        }
        *self.inner.shutdown.lock().unwrap_or_else(|p| p.into_inner()) = CancellationToken::new();
        self.inner.state.set(ConnectionState::Connected);
        tracing::info!("transport[stdio]: connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let previous = self.inner.state.set(ConnectionState::Disconnected);
        self.inner.token().cancel();
        // Dropping the senders wakes every waiting `send_message` with `Closed`.
        self.inner.pending.lock().unwrap_or_else(|p| p.into_inner()).clear();

        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.inner.reader.lock().await.take();
        if let Some(mut child) = self.inner.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                tracing::warn!("transport[stdio]: failed to kill child: {}", e);
            }
        }

        if previous != ConnectionState::Disconnected {
            tracing::info!("transport[stdio]: disconnected");
        }
        Ok(())
    }

    /// Write `message` as one line. For a request, waits for the reply with the
    /// same id, which the running receive loop delivers.
    async fn send_message(&self, message: Message) -> Result<Option<Message>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let Message::Request { id, .. } = &message else {
            self.inner.write_line(&message).await?;
            return Ok(None);
        };

        let id = id.clone();
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id.clone(), tx);

        if let Err(e) = self.inner.write_line(&message).await {
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

    async fn receive_message(&self) -> Result<Option<Message>, TransportError> {
        let token = self.inner.token();
        let line = tokio::select! {
            _ = token.cancelled() => return Ok(None),
            line = self.inner.read_line() => line?,
        };
        match line {
            Some(line) => Ok(Some(line.parse()?)),
            None => Ok(None),
        }
    }

    async fn receive_messages(&self) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let token = self.inner.token();
        let mut tasks = JoinSet::new();

        loop {
            let line = tokio::select! {
                _ = token.cancelled() => {
                    tasks.abort_all();
                    return Ok(());
                }
                line = self.inner.read_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => {
                    tracing::info!("transport[stdio]: input closed");
                    break;
                }
                Err(e) => {
                    tracing::error!("transport[stdio]: read failed: {}", e);
                    self.inner.state.set(ConnectionState::Error);
                    tasks.abort_all();
                    return Err(e);
                }
            };

            match line.parse::<Message>() {
                Err(e) => {
                    tracing::warn!("transport[stdio]: unparseable frame: {}", e);
                    let reply = Message::error(None, PARSE_ERROR, format!("Parse error: {e}"));
                    self.inner.write_line(&reply).await?;
                }
                Ok(message) if message.is_reply() => self.inner.resolve_pending(message),
                Ok(message) => {
                    let Some(handler) = self.inner.handler.get() else {
                        tracing::warn!(
                            method = ?message.method(),
                            "transport[stdio]: no message handler set, dropping message"
                        );
                        continue;
                    };
                    let inner = Arc::clone(&self.inner);
                    tasks.spawn(async move {
                        if let Some(reply) = handler(message).await {
                            if let Err(e) = inner.write_line(&reply).await {
                                tracing::warn!("transport[stdio]: failed to write reply: {}", e);
                            }
                        }
                    });
                }
            }

            while let Some(finished) = tasks.try_join_next() {
                if let Err(e) = finished {
                    tracing::warn!("transport[stdio]: dispatch task failed: {}", e);
                }
            }
        }

        // Let in-flight requests answer before the writer goes away.
        while let Some(finished) = tasks.join_next().await {
            if let Err(e) = finished {
                tracing::warn!("transport[stdio]: dispatch task failed: {}", e);
            }
        }
        self.disconnect().await
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        self.inner.handler.set(handler);
    }

    async fn health_check(&self) -> Value {
        json!({
            "transport": self.kind().as_str(),
            "connected": self.is_connected(),
            "pending_requests": self.pending_requests(),
        })
    }
}
