//! Push channel management.
//!
//! A [`Channel`] is one persistent connection owned by one mounted consumer. Its driver
//! task connects through the injected [`PushTransport`], interprets each frame as a
//! [`ChannelEvent`] and forwards it in transport order. On any transport error (including
//! a failed connect or the server ending the stream) the channel closes itself and
//! delivers exactly one [`ChannelMessage::Error`]. There is no automatic reconnect.

mod sse;
mod transport;

pub use sse::{SseFrame, decode_stream};
pub use transport::{FrameStream, HttpPushTransport, MemoryTransport, PushTransport};

use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ChannelConfig;
use crate::error::{ConnectionError, Error, Result};
use crate::types::ChannelEvent;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Item delivered to the owner of a channel
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelMessage {
    /// An inbound event (malformed ones arrive as [`ChannelEvent::Unparseable`])
    Event(ChannelEvent),
    /// The channel failed and is now closed; delivered at most once per channel
    Error(ConnectionError),
}

/// Opens channels on a shared transport
#[derive(Clone)]
pub struct ChannelManager {
    transport: Arc<dyn PushTransport>,
    config: ChannelConfig,
}

impl ChannelManager {
    /// Create a manager for the given transport
    pub fn new(transport: Arc<dyn PushTransport>, config: ChannelConfig) -> Self {
        Self { transport, config }
    }

    /// Open a new channel
    ///
    /// Connecting happens on the channel's driver task; a failed connect is reported as the
    /// channel's single [`ChannelMessage::Error`]. Must be called inside a tokio runtime.
    pub fn open(&self) -> Channel {
        let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.event_buffer.max(1));
        let cancel = CancellationToken::new();
        let open = Arc::new(AtomicBool::new(true));
        let errors = Arc::new(AtomicU32::new(0));

        let driver = Driver {
            id,
            transport: self.transport.clone(),
            connect_timeout: self.config.connect_timeout,
            tx,
            cancel: cancel.clone(),
            open: open.clone(),
            errors: errors.clone(),
        };
        let handle = tokio::spawn(driver.run());

        tracing::debug!(channel = id, endpoint = %self.transport.endpoint(), "opening push channel");

        Channel {
            id,
            rx,
            cancel,
            open,
            errors,
            driver: Some(handle),
        }
    }
}

/// One open push connection
///
/// Dropping a channel closes it.
pub struct Channel {
    id: u64,
    rx: mpsc::Receiver<ChannelMessage>,
    cancel: CancellationToken,
    open: Arc<AtomicBool>,
    errors: Arc<AtomicU32>,
    driver: Option<JoinHandle<()>>,
}

impl Channel {
    /// Process-unique channel id (for logs)
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Receive the next message; `None` once the channel is closed and drained
    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        self.rx.recv().await
    }

    /// Whether the connection is still open
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.cancel.is_cancelled()
    }

    /// Number of transport errors seen by this channel
    pub fn error_count(&self) -> u32 {
        self.errors.load(Ordering::SeqCst)
    }

    /// Close the channel; closing an already-closed channel is a no-op
    pub fn close(&mut self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.open.store(false, Ordering::SeqCst);
        // Discard anything buffered so a closed channel never yields stale events
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
        tracing::debug!(channel = self.id, "push channel closed");
    }

    /// Close and wait for the driver task to finish
    pub async fn shutdown(mut self) {
        self.close();
        if let Some(handle) = self.driver.take() {
            if let Err(e) = handle.await {
                tracing::warn!(channel = self.id, error = %e, "push channel driver ended abnormally");
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.open.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .field("errors", &self.error_count())
            .finish()
    }
}

struct Driver {
    id: u64,
    transport: Arc<dyn PushTransport>,
    connect_timeout: std::time::Duration,
    tx: mpsc::Sender<ChannelMessage>,
    cancel: CancellationToken,
    open: Arc<AtomicBool>,
    errors: Arc<AtomicU32>,
}

impl Driver {
    async fn run(self) {
        let connect = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = tokio::time::timeout(self.connect_timeout, self.transport.connect()) => result,
        };

        let mut frames = match connect {
            Ok(Ok(frames)) => frames,
            Ok(Err(e)) => return self.fail(e).await,
            Err(_) => {
                let err = ConnectionError::Connect {
                    url: self.transport.endpoint(),
                    message: format!("timed out after {:?}", self.connect_timeout),
                };
                return self.fail(err).await;
            }
        };
        tracing::info!(channel = self.id, endpoint = %self.transport.endpoint(), "push channel open");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = frames.next() => next,
            };

            match next {
                Some(Ok(frame)) => {
                    let event = ChannelEvent::from_frame(&frame);
                    if let ChannelEvent::Unparseable { label, error, .. } = &event {
                        tracing::warn!(channel = self.id, label = %label, error = %error, "malformed push event");
                    }
                    if !self.forward(ChannelMessage::Event(event)).await {
                        break;
                    }
                }
                Some(Err(e)) => return self.fail(e).await,
                None => return self.fail(ConnectionError::Closed).await,
            }
        }

        self.open.store(false, Ordering::SeqCst);
    }

    async fn fail(self, error: ConnectionError) {
        self.open.store(false, Ordering::SeqCst);
        if self.cancel.is_cancelled() {
            return;
        }
        self.errors.fetch_add(1, Ordering::SeqCst);
        tracing::warn!(channel = self.id, error = %error, "push channel failed, closing");
        self.forward(ChannelMessage::Error(error)).await;
    }

    async fn forward(&self, message: ChannelMessage) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(message) => sent.is_ok(),
        }
    }
}

/// Holds the single channel a consumer may have open
#[derive(Debug, Default)]
pub struct ChannelSlot {
    current: Option<Channel>,
}

impl ChannelSlot {
    /// Create an empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a channel into this slot
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelAlreadyOpen`] if the slot still holds an open channel.
    pub fn open(&mut self, manager: &ChannelManager) -> Result<&mut Channel> {
        if self.current.as_ref().is_some_and(Channel::is_open) {
            return Err(Error::ChannelAlreadyOpen);
        }
        Ok(self.current.insert(manager.open()))
    }

    /// The held channel, if any
    pub fn channel_mut(&mut self) -> Option<&mut Channel> {
        self.current.as_mut()
    }

    /// Whether an open channel is held
    pub fn is_open(&self) -> bool {
        self.current.as_ref().is_some_and(Channel::is_open)
    }

    /// Receive from the held channel; pends forever when the slot is empty or drained
    pub async fn recv(&mut self) -> ChannelMessage {
        match self.current.as_mut() {
            Some(channel) => match channel.recv().await {
                Some(message) => message,
                None => std::future::pending().await,
            },
            None => std::future::pending().await,
        }
    }

    /// Close the held channel (idempotent)
    pub fn close(&mut self) {
        if let Some(channel) = self.current.as_mut() {
            channel.close();
        }
    }

    /// Close and wait for the driver
    pub async fn shutdown(&mut self) {
        if let Some(channel) = self.current.take() {
            channel.shutdown().await;
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn manager(transport: &MemoryTransport) -> ChannelManager {
        ChannelManager::new(Arc::new(transport.clone()), ChannelConfig::default())
    }

    async fn wait_for_listeners(transport: &MemoryTransport, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while transport.listener_count() != count {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("listeners did not connect");
    }

    #[tokio::test]
    async fn delivers_events_in_transport_order() {
        let transport = MemoryTransport::new(16);
        let mut channel = manager(&transport).open();
        wait_for_listeners(&transport, 1).await;

        transport.publish_ready(false);
        transport.publish_ready(true);
        transport.publish(SseFrame::named("job_update", "{broken"));

        assert_eq!(
            channel.recv().await,
            Some(ChannelMessage::Event(ChannelEvent::Readiness { ready: false }))
        );
        assert_eq!(
            channel.recv().await,
            Some(ChannelMessage::Event(ChannelEvent::Readiness { ready: true }))
        );
        assert!(matches!(
            channel.recv().await,
            Some(ChannelMessage::Event(ChannelEvent::Unparseable { .. }))
        ));
        assert!(channel.is_open(), "malformed events never close the channel");
    }

    #[tokio::test]
    async fn transport_error_closes_and_reports_once() {
        let transport = MemoryTransport::new(16);
        let mut channel = manager(&transport).open();
        wait_for_listeners(&transport, 1).await;

        transport.fail_all("reset by peer");

        assert_eq!(
            channel.recv().await,
            Some(ChannelMessage::Error(ConnectionError::Dropped(
                "reset by peer".to_string()
            )))
        );
        assert_eq!(channel.recv().await, None, "nothing follows the error");
        assert!(!channel.is_open());
        assert_eq!(channel.error_count(), 1);
    }

    #[tokio::test]
    async fn refused_connect_is_reported_as_channel_error() {
        let transport = MemoryTransport::new(16);
        transport.set_accepting(false);
        let mut channel = manager(&transport).open();

        assert!(matches!(
            channel.recv().await,
            Some(ChannelMessage::Error(ConnectionError::Connect { .. }))
        ));
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn server_closing_stream_is_an_error() {
        let transport = MemoryTransport::new(16);
        let mut channel = manager(&transport).open();
        wait_for_listeners(&transport, 1).await;

        transport.close_all();

        assert_eq!(
            channel.recv().await,
            Some(ChannelMessage::Error(ConnectionError::Closed))
        );
    }

    #[tokio::test]
    async fn close_is_idempotent_and_disconnects() {
        let transport = MemoryTransport::new(16);
        let mut channel = manager(&transport).open();
        wait_for_listeners(&transport, 1).await;

        channel.close();
        channel.close();
        assert!(!channel.is_open());

        channel.shutdown().await;
        assert_eq!(transport.listener_count(), 0);
    }

    #[tokio::test]
    async fn closed_channel_reports_no_error() {
        let transport = MemoryTransport::new(16);
        let mut channel = manager(&transport).open();
        wait_for_listeners(&transport, 1).await;

        channel.close();
        transport.fail_all("late failure");

        assert_eq!(channel.recv().await, None);
        assert_eq!(channel.error_count(), 0);
    }

    #[tokio::test]
    async fn slot_rejects_second_open_channel() {
        let transport = MemoryTransport::new(16);
        let manager = manager(&transport);
        let mut slot = ChannelSlot::new();

        slot.open(&manager).unwrap();
        assert!(matches!(slot.open(&manager), Err(Error::ChannelAlreadyOpen)));

        slot.close();
        slot.open(&manager).expect("re-open after close is allowed");
        slot.shutdown().await;
    }
}
