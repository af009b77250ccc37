//! Server-sent event and WebSocket subscriptions
//!
//! Streams bypass the cache and the deduplicator. Each subscription owns a
//! background task that holds the connection and forwards typed events over a
//! bounded channel. Dropping or closing the [`Subscription`] aborts that task,
//! which tears the connection down.

use crate::error::{ClientError, Result};
use crate::transport::HttpRequest;
use async_trait::async_trait;
use futures::{SinkExt, Stream, StreamExt};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Reconnect schedule for dropped streams
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Random extra delay added to every wait, up to this much
    pub jitter: Duration,
    /// Give up after this many consecutive failed sessions
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: Duration::ZERO,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Wait before reconnect number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let base = if !millis.is_finite() || millis >= self.max_delay.as_millis() as f64 {
            self.max_delay
        } else {
            Duration::from_millis(millis as u64)
        };

        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Subscription settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamOptions {
    /// Events buffered before the connection task waits on the consumer
    pub buffer: usize,
    /// Reconnect after the connection drops; `None` ends the subscription
    pub reconnect: Option<ReconnectPolicy>,
    /// Extra headers for event-stream requests
    pub headers: BTreeMap<String, String>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            buffer: 256,
            reconnect: None,
            headers: BTreeMap::new(),
        }
    }
}

impl StreamOptions {
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = Some(policy);
        self
    }

    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// One dispatched server-sent event
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

impl SseEvent {
    /// Event type, `message` when the server sent none
    pub fn event_type(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.data).map_err(ClientError::from)
    }
}

/// Payload delivered by a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMessage {
    Event(SseEvent),
    Text(String),
    Binary(Vec<u8>),
}

impl StreamMessage {
    /// Text payload; event data for SSE, lossy UTF-8 for binary frames
    pub fn text(&self) -> String {
        match self {
            StreamMessage::Event(event) => event.data.clone(),
            StreamMessage::Text(text) => text.clone(),
            StreamMessage::Binary(data) => String::from_utf8_lossy(data).into_owned(),
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        match self {
            StreamMessage::Event(event) => event.json(),
            StreamMessage::Text(text) => serde_json::from_str(text).map_err(ClientError::from),
            StreamMessage::Binary(data) => serde_json::from_slice(data).map_err(ClientError::from),
        }
    }
}

/// Lifecycle and data events of a subscription
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Opened { url: String },
    Message(StreamMessage),
    Error(ClientError),
    Closed { reason: String },
}

/// Outbound WebSocket frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl SocketMessage {
    fn into_frame(self) -> Message {
        match self {
            SocketMessage::Text(text) => Message::Text(text),
            SocketMessage::Binary(data) => Message::Binary(data),
        }
    }
}

/// A live stream or socket
///
/// Implements [`Stream`] over [`StreamEvent`]. The stream ends once the
/// connection closes for good or [`Subscription::close`] is called.
#[derive(Debug)]
pub struct Subscription {
    url: String,
    events: mpsc::Receiver<StreamEvent>,
    outbound: Option<mpsc::Sender<SocketMessage>>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Next lifecycle or data event
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Next data payload, skipping lifecycle events
    pub async fn next_message(&mut self) -> Option<StreamMessage> {
        while let Some(event) = self.events.recv().await {
            if let StreamEvent::Message(message) = event {
                return Some(message);
            }
        }
        None
    }

    /// Send a frame over a WebSocket subscription
    pub async fn send(&self, message: SocketMessage) -> Result<()> {
        let outbound = self.outbound.as_ref().ok_or_else(|| {
            ClientError::StreamError("event streams are receive-only".to_string())
        })?;

        outbound
            .send(message)
            .await
            .map_err(|_| ClientError::StreamError("socket is closed".to_string()))
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(SocketMessage::Text(text.into())).await
    }

    /// Tear down the connection; already buffered events can still be drained
    pub fn close(&mut self) {
        debug!("Closing subscription to {}", self.url);
        self.task.abort();
        self.events.close();
        self.outbound = None;
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_finished()
    }
}

impl Stream for Subscription {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Open a server-sent event stream
pub fn open_event_stream(
    client: reqwest::Client,
    request: HttpRequest,
    options: StreamOptions,
) -> Subscription {
    let url = request.url.to_string();
    let (tx, rx) = mpsc::channel(options.buffer.max(1));
    let source = EventSource {
        client,
        request,
        headers: options.headers,
        last_event_id: None,
    };

    info!("Opening event stream {}", url);
    let task = tokio::spawn(drive(source, options.reconnect, tx));

    Subscription {
        url,
        events: rx,
        outbound: None,
        task,
    }
}

/// Open a WebSocket connection
pub fn open_socket(url: reqwest::Url, options: StreamOptions) -> Subscription {
    let url = url.to_string();
    let (tx, rx) = mpsc::channel(options.buffer.max(1));
    let (outbound_tx, outbound_rx) = mpsc::channel(options.buffer.max(1));
    let source = SocketSource {
        url: url.clone(),
        outbound: outbound_rx,
    };

    info!("Opening socket {}", url);
    let task = tokio::spawn(drive(source, options.reconnect, tx));

    Subscription {
        url,
        events: rx,
        outbound: Some(outbound_tx),
        task,
    }
}

enum SessionEnd {
    /// The subscriber is gone; stop without reconnecting
    ReceiverGone,
    Closed(String),
    Failed(ClientError),
}

struct SessionOutcome {
    opened: bool,
    end: SessionEnd,
}

impl SessionOutcome {
    fn failed(err: ClientError) -> Self {
        Self {
            opened: false,
            end: SessionEnd::Failed(err),
        }
    }
}

/// One kind of connection a subscription can hold
#[async_trait]
trait StreamSource: Send {
    fn describe(&self) -> &str;

    /// Connect and forward events until the connection ends
    async fn run_session(&mut self, events: &mpsc::Sender<StreamEvent>) -> SessionOutcome;
}

async fn drive<S: StreamSource>(
    mut source: S,
    reconnect: Option<ReconnectPolicy>,
    events: mpsc::Sender<StreamEvent>,
) {
    let mut failures = 0u32;

    loop {
        let outcome = source.run_session(&events).await;
        if outcome.opened {
            failures = 0;
        }

        let reason = match outcome.end {
            SessionEnd::ReceiverGone => {
                debug!("Subscriber for {} went away", source.describe());
                return;
            }
            SessionEnd::Closed(reason) => reason,
            SessionEnd::Failed(err) => {
                warn!("Stream {} failed: {}", source.describe(), err);
                let reason = err.to_string();
                if events.send(StreamEvent::Error(err)).await.is_err() {
                    return;
                }
                reason
            }
        };

        if events.send(StreamEvent::Closed { reason }).await.is_err() {
            return;
        }

        let Some(policy) = &reconnect else {
            return;
        };

        failures += 1;
        if policy.max_attempts.is_some_and(|max| failures > max) {
            warn!(
                "Giving up on {} after {} reconnect attempts",
                source.describe(),
                failures - 1
            );
            return;
        }

        let delay = policy.delay(failures);
        info!("Reconnecting to {} in {:?}", source.describe(), delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = events.closed() => return,
        }
    }
}

struct EventSource {
    client: reqwest::Client,
    request: HttpRequest,
    headers: BTreeMap<String, String>,
    last_event_id: Option<String>,
}

#[async_trait]
impl StreamSource for EventSource {
    fn describe(&self) -> &str {
        self.request.url.as_str()
    }

    async fn run_session(&mut self, events: &mpsc::Sender<StreamEvent>) -> SessionOutcome {
        let mut builder = self
            .client
            .request(self.request.method.clone(), self.request.url.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream");
        for (name, value) in self.request.headers.iter().chain(self.headers.iter()) {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(id) = &self.last_event_id {
            builder = builder.header("Last-Event-ID", id.as_str());
        }
        if let Some(body) = &self.request.body {
            builder = builder.body(body.clone());
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => return SessionOutcome::failed(e.into()),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return SessionOutcome::failed(ClientError::ApplicationError {
                status: status.as_u16(),
                body,
            });
        }

        let opened = StreamEvent::Opened {
            url: self.request.url.to_string(),
        };
        if events.send(opened).await.is_err() {
            return SessionOutcome {
                opened: true,
                end: SessionEnd::ReceiverGone,
            };
        }

        let mut parser = SseParser::new();
        let mut body = Box::pin(response.bytes_stream());
        let end = loop {
            match body.next().await {
                Some(Ok(chunk)) => {
                    let parsed = match parser.feed(&chunk) {
                        Ok(parsed) => parsed,
                        Err(e) => break SessionEnd::Failed(e),
                    };
                    let mut gone = false;
                    for event in parsed {
                        if let Some(id) = &event.id {
                            self.last_event_id = Some(id.clone());
                        }
                        if events
                            .send(StreamEvent::Message(StreamMessage::Event(event)))
                            .await
                            .is_err()
                        {
                            gone = true;
                            break;
                        }
                    }
                    if gone {
                        break SessionEnd::ReceiverGone;
                    }
                }
                Some(Err(e)) => break SessionEnd::Failed(e.into()),
                None => break SessionEnd::Closed("stream ended".to_string()),
            }
        };

        SessionOutcome { opened: true, end }
    }
}

struct SocketSource {
    url: String,
    outbound: mpsc::Receiver<SocketMessage>,
}

#[async_trait]
impl StreamSource for SocketSource {
    fn describe(&self) -> &str {
        &self.url
    }

    async fn run_session(&mut self, events: &mpsc::Sender<StreamEvent>) -> SessionOutcome {
        let (socket, _) = match tokio_tungstenite::connect_async(self.url.as_str()).await {
            Ok(connected) => connected,
            Err(e) => return SessionOutcome::failed(e.into()),
        };

        if events
            .send(StreamEvent::Opened {
                url: self.url.clone(),
            })
            .await
            .is_err()
        {
            return SessionOutcome {
                opened: true,
                end: SessionEnd::ReceiverGone,
            };
        }

        let (mut sink, mut incoming) = socket.split();
        let end = loop {
            tokio::select! {
                frame = incoming.next() => {
                    let message = match frame {
                        Some(Ok(Message::Text(text))) => StreamMessage::Text(text),
                        Some(Ok(Message::Binary(data))) => StreamMessage::Binary(data),
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame
                                .map(|f| f.reason.to_string())
                                .filter(|r| !r.is_empty())
                                .unwrap_or_else(|| "closed by server".to_string());
                            break SessionEnd::Closed(reason);
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => break SessionEnd::Failed(e.into()),
                        None => break SessionEnd::Closed("connection closed".to_string()),
                    };
                    if events.send(StreamEvent::Message(message)).await.is_err() {
                        let _ = sink.send(Message::Close(None)).await;
                        break SessionEnd::ReceiverGone;
                    }
                }
                outgoing = self.outbound.recv() => match outgoing {
                    Some(message) => {
                        if let Err(e) = sink.send(message.into_frame()).await {
                            break SessionEnd::Failed(e.into());
                        }
                    }
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break SessionEnd::ReceiverGone;
                    }
                },
            }
        };

        SessionOutcome { opened: true, end }
    }
}

/// Longest line [`SseParser::new`] will buffer before giving up
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// Incremental `text/event-stream` parser
///
/// Bytes may arrive split anywhere, including inside a UTF-8 sequence or
/// between `\r` and `\n`; incomplete lines stay buffered until the next chunk.
/// A line longer than the configured limit fails the parse.
#[derive(Debug)]
pub struct SseParser {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to hold no newline
    scanned: usize,
    max_line: usize,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
    retry: Option<u64>,
}

impl Default for SseParser {
    fn default() -> Self {
        Self::with_max_line(DEFAULT_MAX_LINE_BYTES)
    }
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_line: max_line.max(1),
            event: None,
            data: Vec::new(),
            id: None,
            retry: None,
        }
    }

    /// Consume a chunk, returning every event it completes
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>> {
        self.buffer.extend_from_slice(chunk);
        let mut dispatched = Vec::new();
        let mut start = 0;

        while let Some(offset) = self.buffer[start + self.scanned..]
            .iter()
            .position(|b| *b == b'\n')
        {
            let end = start + self.scanned + offset;
            self.scanned = 0;

            let mut line = &self.buffer[start..end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            let line = String::from_utf8_lossy(line).into_owned();
            start = end + 1;

            if let Some(event) = self.process_line(&line) {
                dispatched.push(event);
            }
        }

        self.buffer.drain(..start);
        self.scanned = self.buffer.len();

        if self.buffer.len() > self.max_line {
            let pending = self.buffer.len();
            self.buffer.clear();
            self.scanned = 0;
            return Err(ClientError::StreamError(format!(
                "event stream line exceeds {} bytes ({} buffered)",
                self.max_line, pending
            )));
        }

        Ok(dispatched)
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }

        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" if !value.contains('\0') => self.id = Some(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.parse() {
                    self.retry = Some(ms);
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        let id = self.id.take();
        let retry = self.retry.take();

        if self.data.is_empty() {
            return None;
        }

        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event,
            data,
            id,
            retry,
        })
    }
}
