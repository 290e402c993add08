//! Push transports: the injected capability a [`ChannelManager`](super::ChannelManager)
//! opens channels on.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use super::sse::{SseFrame, decode_stream};
use crate::error::ConnectionError;

/// Stream of decoded frames for one connection
pub type FrameStream = BoxStream<'static, Result<SseFrame, ConnectionError>>;

/// A source of push connections
///
/// Implementations only connect and decode; closing, error policy and event
/// interpretation belong to the channel that owns the stream.
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Open one connection
    async fn connect(&self) -> Result<FrameStream, ConnectionError>;

    /// Endpoint description for logs
    fn endpoint(&self) -> String;
}

/// Server-Sent Events over HTTP
#[derive(Clone, Debug)]
pub struct HttpPushTransport {
    client: reqwest::Client,
    url: url::Url,
}

impl HttpPushTransport {
    /// Create a transport for the given events URL
    pub fn new(client: reqwest::Client, url: url::Url) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl PushTransport for HttpPushTransport {
    async fn connect(&self) -> Result<FrameStream, ConnectionError> {
        let response = self
            .client
            .get(self.url.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| ConnectionError::Connect {
                url: self.url.to_string(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(ConnectionError::Status {
                url: self.url.to_string(),
                status: response.status().as_u16(),
            });
        }

        Ok(decode_stream(response.bytes_stream()))
    }

    fn endpoint(&self) -> String {
        self.url.to_string()
    }
}

#[derive(Clone, Debug)]
enum Broadcast {
    Frame(SseFrame),
    Fail(String),
    Close,
}

/// In-process push backend with server-style fan-out
///
/// Every frame published reaches every connected stream, the way the real backend
/// broadcasts to all listeners of `/api/events`.
#[derive(Clone)]
pub struct MemoryTransport {
    tx: broadcast::Sender<Broadcast>,
    accepting: Arc<AtomicBool>,
}

impl MemoryTransport {
    /// Create a transport buffering up to `capacity` frames per listener
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            accepting: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Publish a frame to every connected listener; returns how many received it
    pub fn publish(&self, frame: SseFrame) -> usize {
        self.tx.send(Broadcast::Frame(frame)).unwrap_or(0)
    }

    /// Publish an unlabeled readiness message
    pub fn publish_ready(&self, ready: bool) -> usize {
        self.publish(SseFrame::message(if ready { "ready" } else { "not_ready" }))
    }

    /// Drop every connection with a transport error
    pub fn fail_all(&self, reason: impl Into<String>) {
        self.tx.send(Broadcast::Fail(reason.into())).ok();
    }

    /// End every connection as if the server closed the stream
    pub fn close_all(&self) {
        self.tx.send(Broadcast::Close).ok();
    }

    /// Refuse (or accept again) new connections
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Number of currently connected listeners
    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl PushTransport for MemoryTransport {
    async fn connect(&self) -> Result<FrameStream, ConnectionError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(ConnectionError::Connect {
                url: self.endpoint(),
                message: "connection refused".to_string(),
            });
        }

        let stream = BroadcastStream::new(self.tx.subscribe())
            .map(|item| match item {
                Ok(Broadcast::Frame(frame)) => Some(Ok(frame)),
                Ok(Broadcast::Fail(reason)) => Some(Err(ConnectionError::Dropped(reason))),
                Ok(Broadcast::Close) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "memory push listener lagged");
                    Some(Err(ConnectionError::Dropped(format!(
                        "listener lagged, skipped {skipped} events"
                    ))))
                }
            })
            .take_while(|item| futures::future::ready(item.is_some()))
            .filter_map(futures::future::ready);

        Ok(stream.boxed())
    }

    fn endpoint(&self) -> String {
        "memory://events".to_string()
    }
}
