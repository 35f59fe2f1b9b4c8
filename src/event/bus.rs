//! Internal event bus clients
//!
//! The bus speaks JSON frames over a WebSocket:
//!
//! - writer: `{"msgs":[...]}` -> `{"ackCount":n}` or `{"error":{...}}`
//! - queue: `{"start":{...}}`, then `{"msgs":[...]}` batches answered with `{"ack":{"count":n}}`

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::CloudEvent;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const GROUP_ID_HEADER: &str = "x-group-id";
pub const USER_ID_HEADER: &str = "x-user-id";

/// Failure reported by the bus or its transport
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("limit reached")]
    LimitReached,
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("resolver internal failure")]
    ResolverInternal,
    #[error("stream closed")]
    Eof,
    #[error("not found")]
    NotFound,
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("{0}")]
    Transient(String),
    #[error("cancelled")]
    Canceled,
}

impl BusError {
    /// The stream is unusable after this error and must be reopened.
    pub fn requires_reopen(&self) -> bool {
        matches!(
            self,
            Self::LimitReached | Self::Unavailable(_) | Self::ResolverInternal | Self::Eof
        )
    }

    fn from_fault(fault: BusFault) -> Self {
        match fault.code.as_str() {
            "RESOURCE_EXHAUSTED" => Self::LimitReached,
            "UNAVAILABLE" => Self::Unavailable(fault.message),
            "INTERNAL" => Self::ResolverInternal,
            "NOT_FOUND" => Self::NotFound,
            "INVALID_ARGUMENT" | "PERMISSION_DENIED" | "FAILED_PRECONDITION" => {
                Self::Rejected(fault.message)
            }
            _ => Self::Transient(format!("{}: {}", fault.code, fault.message)),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BusError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => Self::Eof,
            WsError::Io(e) => Self::Unavailable(e.to_string()),
            other => Self::Transient(other.to_string()),
        }
    }
}

// =============================================================================
// Traits
// =============================================================================

/// Opens per-tenant writers on the bus
#[async_trait]
pub trait WriterClient: Send + Sync {
    async fn open_writer(
        &self,
        cancel: &CancellationToken,
        group_id: &str,
        user_id: &str,
    ) -> Result<Arc<dyn EventWriter>, BusError>;
}

/// One open writer stream
#[async_trait]
pub trait EventWriter: Send + Sync {
    /// Publish a batch, returning the number of acknowledged events
    async fn write_batch(
        &self,
        cancel: &CancellationToken,
        events: &[CloudEvent],
    ) -> Result<u32, BusError>;

    async fn close(&self);
}

/// Starts queue subscriptions
#[async_trait]
pub trait QueueClient: Send + Sync {
    async fn subscribe(
        &self,
        cancel: &CancellationToken,
        queue: &str,
        subject: &str,
        batch_size: u32,
    ) -> Result<Box<dyn QueueSubscription>, BusError>;
}

/// An open queue stream
#[async_trait]
pub trait QueueSubscription: Send {
    /// Next batch of events; `BusError::Eof` when the bus ends the stream
    async fn next_batch(&mut self, cancel: &CancellationToken) -> Result<Vec<CloudEvent>, BusError>;

    async fn ack(&mut self, cancel: &CancellationToken, count: u32) -> Result<(), BusError>;
}

// =============================================================================
// Wire frames
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BusFault {
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Serialize)]
struct WriteRequest<'a> {
    msgs: &'a [CloudEvent],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteResponse {
    #[serde(default)]
    ack_count: u32,
    #[serde(default)]
    error: Option<BusFault>,
}

#[derive(Serialize)]
#[serde(rename_all = "lowercase")]
enum QueueRequest<'a> {
    Start(StartRequest<'a>),
    Ack(AckRequest),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest<'a> {
    queue: &'a str,
    subject: &'a str,
    batch_size: u32,
}

#[derive(Serialize)]
struct AckRequest {
    count: u32,
}

#[derive(Debug, Deserialize)]
struct QueueResponse {
    #[serde(default)]
    msgs: Vec<CloudEvent>,
    #[serde(default)]
    error: Option<BusFault>,
}

// =============================================================================
// WebSocket transport
// =============================================================================

async fn connect(
    cancel: &CancellationToken,
    uri: &str,
    tenant: Option<(&str, &str)>,
) -> Result<WsStream, BusError> {
    let mut request = uri
        .into_client_request()
        .map_err(|e| BusError::Transient(format!("invalid bus uri {}: {}", uri, e)))?;
    if let Some((group_id, user_id)) = tenant {
        let headers = request.headers_mut();
        for (name, value) in [(GROUP_ID_HEADER, group_id), (USER_ID_HEADER, user_id)] {
            let value = HeaderValue::from_str(value)
                .map_err(|_| BusError::Rejected(format!("invalid {} header", name)))?;
            headers.insert(name, value);
        }
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BusError::Canceled),
        result = tokio_tungstenite::connect_async(request) => {
            let (ws, _) = result.map_err(|e| BusError::Unavailable(e.to_string()))?;
            Ok(ws)
        }
    }
}

async fn send_json<T: Serialize>(ws: &mut WsStream, frame: &T) -> Result<(), BusError> {
    let json = serde_json::to_string(frame).map_err(|e| BusError::Transient(e.to_string()))?;
    ws.send(Message::Text(json)).await?;
    Ok(())
}

/// Next text frame, answering pings on the way
async fn recv_text(cancel: &CancellationToken, ws: &mut WsStream) -> Result<String, BusError> {
    loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BusError::Canceled),
            msg = ws.next() => msg,
        };
        match msg {
            None => return Err(BusError::Eof),
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(Message::Text(text))) => return Ok(text),
            Some(Ok(Message::Binary(bytes))) => {
                return String::from_utf8(bytes).map_err(|e| BusError::Transient(e.to_string()));
            }
            Some(Ok(Message::Ping(payload))) => ws.send(Message::Pong(payload)).await?,
            Some(Ok(Message::Close(_))) => return Err(BusError::Eof),
            Some(Ok(_)) => continue,
        }
    }
}

/// Opens WebSocket writers against `API_WRITER_URI`
pub struct WsWriterClient {
    uri: String,
}

impl WsWriterClient {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

#[async_trait]
impl WriterClient for WsWriterClient {
    async fn open_writer(
        &self,
        cancel: &CancellationToken,
        group_id: &str,
        user_id: &str,
    ) -> Result<Arc<dyn EventWriter>, BusError> {
        let ws = connect(cancel, &self.uri, Some((group_id, user_id))).await?;
        tracing::debug!(group_id = %group_id, user_id = %user_id, "Opened bus writer");
        Ok(Arc::new(WsEventWriter {
            ws: Mutex::new(ws),
        }))
    }
}

struct WsEventWriter {
    ws: Mutex<WsStream>,
}

#[async_trait]
impl EventWriter for WsEventWriter {
    async fn write_batch(
        &self,
        cancel: &CancellationToken,
        events: &[CloudEvent],
    ) -> Result<u32, BusError> {
        let mut ws = self.ws.lock().await;
        send_json(&mut ws, &WriteRequest { msgs: events }).await?;

        let text = recv_text(cancel, &mut ws).await?;
        let response: WriteResponse =
            serde_json::from_str(&text).map_err(|e| BusError::Transient(e.to_string()))?;
        match response.error {
            Some(fault) => Err(BusError::from_fault(fault)),
            None => Ok(response.ack_count),
        }
    }

    async fn close(&self) {
        let mut ws = self.ws.lock().await;
        if let Err(e) = ws.close(None).await {
            tracing::debug!(error = %e, "Bus writer close failed");
        }
    }
}

/// Subscribes to queues against `API_QUEUE_URI`
pub struct WsQueueClient {
    uri: String,
}

impl WsQueueClient {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

#[async_trait]
impl QueueClient for WsQueueClient {
    async fn subscribe(
        &self,
        cancel: &CancellationToken,
        queue: &str,
        subject: &str,
        batch_size: u32,
    ) -> Result<Box<dyn QueueSubscription>, BusError> {
        let mut ws = connect(cancel, &self.uri, None).await?;
        let start = QueueRequest::Start(StartRequest {
            queue,
            subject,
            batch_size,
        });
        send_json(&mut ws, &start).await?;
        Ok(Box::new(WsQueueSubscription { ws }))
    }
}

struct WsQueueSubscription {
    ws: WsStream,
}

#[async_trait]
impl QueueSubscription for WsQueueSubscription {
    async fn next_batch(&mut self, cancel: &CancellationToken) -> Result<Vec<CloudEvent>, BusError> {
        let text = recv_text(cancel, &mut self.ws).await?;
        let response: QueueResponse =
            serde_json::from_str(&text).map_err(|e| BusError::Transient(e.to_string()))?;
        match response.error {
            Some(fault) => Err(BusError::from_fault(fault)),
            None => Ok(response.msgs),
        }
    }

    async fn ack(&mut self, cancel: &CancellationToken, count: u32) -> Result<(), BusError> {
        if cancel.is_cancelled() {
            return Err(BusError::Canceled);
        }
        send_json(&mut self.ws, &QueueRequest::Ack(AckRequest { count })).await
    }
}
