//! Client-only push transport over server-sent events.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{ConnectionState, HandlerSlot, MessageHandler, StateCell, Transport, TransportKind};
use crate::error::TransportError;
use crate::message::Message;
use crate::rate_limit::RateLimiter;

// ── Event framing ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

pub const DEFAULT_MAX_EVENT_BYTES: usize = 1024 * 1024;

/// Incremental SSE decoder. Events are separated by a blank line; `data:`
/// lines of one event are joined with `\n`; `:` comment lines are skipped.
#[derive(Debug)]
pub struct SseParser {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already searched for a separator.
    scanned: usize,
    max_event_bytes: usize,
}

impl Default for SseParser {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_EVENT_BYTES)
    }
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parser that rejects an unterminated event longer than `max_event_bytes`.
    pub fn with_limit(max_event_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_event_bytes,
        }
    }

    /// Append a chunk and return every event it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>, TransportError> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        let mut start = 0;
        // A separator may straddle the previous chunk boundary.
        let mut from = self.scanned.saturating_sub(1);
        while let Some(pos) = self.buffer[from..].windows(2).position(|w| w == b"\n\n") {
            let end = from + pos;
            events.extend(Self::parse_block(&self.buffer[start..end]));
            start = end + 2;
            from = start;
        }
        self.buffer.drain(..start);
        self.scanned = self.buffer.len();

        if self.buffer.len() > self.max_event_bytes {
            self.buffer.clear();
            self.scanned = 0;
            return Err(TransportError::EventTooLarge(self.max_event_bytes));
        }
        Ok(events)
    }

    /// Decode whatever is left once the stream has ended.
    pub fn flush(&mut self) -> Vec<SseEvent> {
        let block = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        Self::parse_block(&block).into_iter().collect()
    }

    fn parse_block(block: &[u8]) -> Option<SseEvent> {
        let text = String::from_utf8_lossy(block);
        let mut data: Vec<&str> = Vec::new();
        let mut event = None;
        let mut id = None;

        for line in text.lines() {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "data" => data.push(value),
                "event" => event = Some(value.to_string()),
                "id" => id = Some(value.to_string()),
                _ => {}
            }
        }

        if data.is_empty() {
            return None;
        }
        Some(SseEvent {
            event,
            id,
            data: data.join("\n"),
        })
    }
}

// ── Transport ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PushOptions {
    pub receive_rate: Option<f64>,
    pub connect_timeout: Duration,
    pub max_event_bytes: usize,
}

impl Default for PushOptions {
    fn default() -> Self {
        Self {
            receive_rate: None,
            connect_timeout: Duration::from_secs(10),
            max_event_bytes: DEFAULT_MAX_EVENT_BYTES,
        }
    }
}

struct EventStream {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    parser: SseParser,
    ready: VecDeque<SseEvent>,
    finished: bool,
}

impl EventStream {
    async fn next_event(&mut self) -> Result<Option<SseEvent>, TransportError> {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return Ok(Some(event));
            }
            if self.finished {
                return Ok(None);
            }
            match self.body.next().await {
                Some(Ok(chunk)) => {
                    let events = self.parser.feed(&chunk)?;
                    self.ready.extend(events);
                }
                Some(Err(e)) => return Err(e.into()),
                None => {
                    self.finished = true;
                    self.ready.extend(self.parser.flush());
                }
            }
        }
    }
}

pub struct PushTransport {
    url: Url,
    options: PushOptions,
    client: reqwest::Client,
    state: StateCell,
    handler: HandlerSlot,
    stream: tokio::sync::Mutex<Option<EventStream>>,
    shutdown: Mutex<CancellationToken>,
}

impl PushTransport {
    pub fn new(url: &str, options: PushOptions) -> Result<Self, TransportError> {
        let url = Url::parse(url)?;
        let client = reqwest::Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()?;
        Ok(Self {
            url,
            options,
            client,
            state: StateCell::new(),
            handler: HandlerSlot::default(),
            stream: tokio::sync::Mutex::new(None),
            shutdown: Mutex::new(CancellationToken::new()),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn token(&self) -> CancellationToken {
        self.shutdown.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    async fn open(&self) -> Result<EventStream, TransportError> {
        let response = self
            .client
            .get(self.url.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(EventStream {
            body: response.bytes_stream().boxed(),
            parser: SseParser::with_limit(self.options.max_event_bytes),
            ready: VecDeque::new(),
            finished: false,
        })
    }

    /// Next message-bearing event, parsed. Non-message events (such as the
    /// `endpoint` announcement some servers send first) are skipped.
    async fn next_message(&self) -> Result<Option<Message>, TransportError> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(TransportError::NotConnected)?;
        loop {
            let Some(event) = stream.next_event().await? else {
                return Ok(None);
            };
            if event.event.as_deref().is_some_and(|name| name != "message") {
                tracing::debug!(event = ?event.event, "transport[sse]: skipping non-message event");
                continue;
            }
            if event.data.trim() == "[DONE]" {
                continue;
            }
            return Ok(Some(event.data.parse()?));
        }
    }
}

#[async_trait]
impl Transport for PushTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    async fn connect(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }
        match self.open().await {
            Ok(stream) => {
                *self.stream.lock().await = Some(stream);
                *self.shutdown.lock().unwrap_or_else(|p| p.into_inner()) = CancellationToken::new();
                self.state.set(ConnectionState::Connected);
                tracing::info!("transport[sse]: subscribed to {}", self.url);
                Ok(())
            }
            Err(e) => {
                tracing::error!("transport[sse]: connect to {} failed: {}", self.url, e);
                self.state.set(ConnectionState::Error);
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let previous = self.state.set(ConnectionState::Disconnected);
        self.token().cancel();
        self.stream.lock().await.take();
        if previous != ConnectionState::Disconnected {
            tracing::info!("transport[sse]: disconnected from {}", self.url);
        }
        Ok(())
    }

    async fn send_message(&self, _message: Message) -> Result<Option<Message>, TransportError> {
        Err(TransportError::Unsupported(TransportKind::Sse, "send_message"))
    }

    async fn receive_message(&self) -> Result<Option<Message>, TransportError> {
        let token = self.token();
        tokio::select! {
            _ = token.cancelled() => Ok(None),
            message = self.next_message() => message,
        }
    }

    async fn receive_messages(&self) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let token = self.token();
        let mut limiter = self.options.receive_rate.map(RateLimiter::per_second);

        loop {
            let next = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                next = self.next_message() => next,
            };
            let message = match next {
                Ok(Some(message)) => message,
                Ok(None) => {
                    tracing::info!("transport[sse]: event stream ended");
                    return self.disconnect().await;
                }
                Err(TransportError::Parse(e)) => {
                    tracing::warn!("transport[sse]: unparseable event: {}", e);
                    continue;
                }
                Err(e) => {
                    tracing::error!("transport[sse]: stream failed: {}", e);
                    self.state.set(ConnectionState::Error);
                    return Err(e);
                }
            };

            if message.is_reply() {
                tracing::warn!(kind = %message.kind(), "transport[sse]: dropping unsolicited reply");
                continue;
            }
            if let Some(limiter) = limiter.as_mut() {
                limiter.acquire().await;
            }
            let Some(handler) = self.handler.get() else {
                tracing::warn!("transport[sse]: no message handler set, dropping message");
                continue;
            };
            if let Some(reply) = handler(message).await {
                tracing::debug!(
                    kind = %reply.kind(),
                    "transport[sse]: no outbound channel, discarding reply"
                );
            }
        }
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        self.handler.set(handler);
    }

    async fn health_check(&self) -> Value {
        json!({
            "transport": self.kind().as_str(),
            "connected": self.is_connected(),
            "url": self.url.as_str(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_split_on_blank_line() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: {\"a\":1}\n\ndata: {\"b\":2}\n\n").unwrap();
        let data: Vec<_> = events.iter().map(|e| e.data.as_str()).collect();
        assert_eq!(data, vec![r#"{"a":1}"#, r#"{"b":2}"#]);
    }

    #[test]
    fn partial_chunks_are_buffered() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"event: message\r\nda").unwrap().is_empty());
        assert!(parser.feed(b"ta: hello\r\n").unwrap().is_empty());
        let events = parser.feed(b"\r\n").unwrap();
        assert_eq!(
            events,
            vec![SseEvent {
                event: Some("message".to_string()),
                id: None,
                data: "hello".to_string(),
            }]
        );
    }

    #[test]
    fn multi_line_data_is_joined_and_comments_skipped() {
        let mut parser = SseParser::new();
        let events = parser.feed(b": keep-alive\ndata: one\ndata:two\nid: 7\n\n").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "one\ntwo");
        assert_eq!(events[0].id.as_deref(), Some("7"));
    }

    #[test]
    fn comment_only_block_yields_nothing() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b": ping\n\n").unwrap().is_empty());
    }

    #[test]
    fn flush_emits_trailing_event() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: tail").unwrap().is_empty());
        assert_eq!(parser.flush()[0].data, "tail");
        assert!(parser.flush().is_empty());
    }

    #[test]
    fn separator_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: first\n").unwrap().is_empty());
        let events = parser.feed(b"\ndata: second\n").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "first");
        assert_eq!(parser.feed(b"\n").unwrap()[0].data, "second");
    }

    #[test]
    fn unterminated_event_past_limit_is_rejected() {
        let mut parser = SseParser::with_limit(32);
        assert!(parser.feed(b"data: short\n\ndata: ").unwrap().len() == 1);
        assert!(parser.feed(&[b'x'; 16]).unwrap().is_empty());
        assert!(matches!(
            parser.feed(&[b'x'; 16]),
            Err(TransportError::EventTooLarge(32))
        ));
        // The oversized event is discarded; the parser keeps working.
        assert_eq!(parser.feed(b"data: next\n\n").unwrap()[0].data, "next");
    }
}
