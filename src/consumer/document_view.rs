use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::channel::{ChannelManager, ChannelMessage, ChannelSlot, PushTransport};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fetcher::{Artifact, ArtifactSource, FetchOutcome, FetchSlot};
use crate::lifetime::Lifetime;
use crate::notify::{Notification, Notifier};
use crate::readiness::{PingOutcome, ReadinessMachine};
use crate::resource::{ResourceHandle, ResourceKind, ResourceSlot, ResourceStore};
use crate::types::ConsumerState;

use super::{ReopenBudget, handle_channel_error};

/// What a [`DocumentView`] currently shows
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DocumentSnapshot {
    /// Readiness state
    pub state: ConsumerState,
    /// Local handle of the latest binary rendering
    pub handle: Option<ResourceHandle>,
    /// Latest source text, for textual artifacts
    pub text: Option<String>,
}

enum Command {
    Refresh,
}

/// Keeps a local copy of a compiled document in sync with the backend
///
/// Every `ready=true` ping that finds the view awaiting readiness triggers exactly one
/// fetch; `ready=false` invalidates the current copy. Binary renderings are materialized
/// through a [`ResourceStore`] and the previous handle is released once the new one
/// exists.
pub struct DocumentView {
    lifetime: Lifetime,
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<DocumentSnapshot>,
    notifier: Notifier,
    driver: Option<JoinHandle<usize>>,
}

impl DocumentView {
    /// Mount the view: open its channel and start waiting for readiness
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config` does not validate.
    pub fn start(
        config: &Config,
        transport: Arc<dyn PushTransport>,
        source: Arc<dyn ArtifactSource>,
        store: Arc<dyn ResourceStore>,
    ) -> Result<Self> {
        config.validate()?;

        let lifetime = Lifetime::new();
        let notifier = Notifier::new(config.notifications.clone());
        let manager = ChannelManager::new(transport, config.channel.clone());
        let mut channels = ChannelSlot::new();
        channels.open(&manager)?;

        let mut readiness = ReadinessMachine::new();
        readiness.start();

        let (snapshot_tx, snapshot) = watch::channel(DocumentSnapshot {
            state: readiness.state().clone(),
            ..DocumentSnapshot::default()
        });
        let (commands, command_rx) = mpsc::unbounded_channel();

        tracing::info!(source = %source.describe(), "document view started");

        let driver = Driver {
            lifetime: lifetime.clone(),
            commands: command_rx,
            reopen: ReopenBudget::new(config.channel.on_error),
            manager,
            channels,
            readiness,
            fetches: FetchSlot::new(source, lifetime.clone()),
            resources: ResourceSlot::new(store),
            text: None,
            snapshot: snapshot_tx,
            notifier: notifier.clone(),
        };

        Ok(Self {
            lifetime,
            commands,
            snapshot,
            notifier,
            driver: Some(tokio::spawn(driver.run())),
        })
    }

    /// Current snapshot
    pub fn snapshot(&self) -> DocumentSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Current readiness state
    pub fn state(&self) -> ConsumerState {
        self.snapshot.borrow().state.clone()
    }

    /// Receiver that observes every published snapshot
    pub fn watch(&self) -> watch::Receiver<DocumentSnapshot> {
        self.snapshot.clone()
    }

    /// Subscribe to the view's notifications
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifier.subscribe()
    }

    /// Force a re-fetch, as after the document source was edited
    ///
    /// # Errors
    ///
    /// Returns [`Error::Stopped`] once the view has stopped.
    pub fn refresh(&self) -> Result<()> {
        if !self.lifetime.is_live() {
            return Err(Error::Stopped);
        }
        self.commands
            .send(Command::Refresh)
            .map_err(|_| Error::Stopped)
    }

    /// Unmount: close the channel, drop late results and release local resources
    ///
    /// Returns how many resource handles were released.
    pub async fn stop(mut self) -> usize {
        self.lifetime.end();
        let Some(driver) = self.driver.take() else {
            return 0;
        };
        match driver.await {
            Ok(released) => released,
            Err(e) => {
                tracing::warn!(error = %e, "document view driver ended abnormally");
                0
            }
        }
    }
}

impl Drop for DocumentView {
    fn drop(&mut self) {
        // The driver notices and cleans up on its own
        self.lifetime.end();
    }
}

struct Driver {
    lifetime: Lifetime,
    commands: mpsc::UnboundedReceiver<Command>,
    reopen: ReopenBudget,
    manager: ChannelManager,
    channels: ChannelSlot,
    readiness: ReadinessMachine,
    fetches: FetchSlot,
    resources: ResourceSlot,
    text: Option<String>,
    snapshot: watch::Sender<DocumentSnapshot>,
    notifier: Notifier,
}

impl Driver {
    async fn run(mut self) -> usize {
        loop {
            tokio::select! {
                biased;
                _ = self.lifetime.ended() => break,
                command = self.commands.recv() => match command {
                    Some(Command::Refresh) => {
                        let outcome = self.readiness.refresh();
                        self.apply(outcome);
                    }
                    None => break,
                },
                message = self.channels.recv() => self.on_message(message).await,
                outcome = self.fetches.next() => self.on_fetch(outcome).await,
            }
        }
        self.tear_down().await
    }

    fn apply(&mut self, outcome: PingOutcome) {
        match outcome {
            PingOutcome::Fetch(ticket) => self.fetches.start(ticket),
            PingOutcome::Reset { superseded } => {
                if superseded.is_some() {
                    self.fetches.cancel();
                }
            }
            PingOutcome::Ignored => return,
        }
        self.publish();
    }

    async fn on_message(&mut self, message: ChannelMessage) {
        match message {
            ChannelMessage::Event(event) => {
                let outcome = self.readiness.on_event(&event);
                self.apply(outcome);
            }
            ChannelMessage::Error(error) => {
                if self.readiness.fail(error.to_string()).is_some() {
                    self.fetches.cancel();
                }
                handle_channel_error(
                    &error,
                    &mut self.channels,
                    &self.manager,
                    &mut self.reopen,
                    &self.notifier,
                )
                .await;
                self.publish();
            }
        }
    }

    async fn on_fetch(&mut self, outcome: FetchOutcome) {
        let FetchOutcome { ticket, result } = outcome;
        let applied = match result {
            Ok(artifact) => match self.materialize(artifact).await {
                Ok(()) => self.readiness.on_fetch_result(ticket, Ok(())),
                Err(e) => {
                    let message = e.user_message();
                    let applied = self.readiness.on_fetch_result(ticket, Err(message.clone()));
                    if applied {
                        self.notifier.error("Error", message);
                    }
                    applied
                }
            },
            Err(e) => {
                let message = e.user_message();
                let applied = self.readiness.on_fetch_result(ticket, Err(message.clone()));
                if applied {
                    self.notifier.error("Error", message);
                }
                applied
            }
        };

        if applied {
            tracing::debug!(fetch = ticket.sequence(), state = ?self.readiness.state(), "fetch applied");
            self.publish();
        }
    }

    async fn materialize(&mut self, artifact: Artifact) -> Result<()> {
        if !self.lifetime.is_live() {
            return Err(Error::Stopped);
        }
        match artifact {
            Artifact::Binary {
                bytes,
                content_type,
            } => {
                self.resources
                    .adopt(ResourceKind::Document, &bytes, content_type.as_deref())
                    .await?;
            }
            Artifact::Source(text) => self.text = Some(text),
            Artifact::Json(value) => self.text = Some(value.to_string()),
        }
        Ok(())
    }

    fn publish(&self) {
        self.snapshot.send_replace(DocumentSnapshot {
            state: self.readiness.state().clone(),
            handle: self.resources.current(ResourceKind::Document).cloned(),
            text: self.text.clone(),
        });
    }

    async fn tear_down(mut self) -> usize {
        self.readiness.tear_down();
        self.fetches.cancel();
        self.channels.shutdown().await;
        let released = self.resources.release_all().await;
        tracing::info!(released, fetches = self.readiness.fetches_issued(), "document view stopped");
        released
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{MemoryTransport, SseFrame};
    use crate::config::ConnectionPolicy;
    use crate::error::FetchError;
    use crate::notify::NotificationLevel;
    use crate::resource::BlobRegistry;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Source that counts calls and can hold fetches until released
    struct ScriptedSource {
        calls: AtomicUsize,
        hold: AtomicBool,
        gate: Semaphore,
        fail: AtomicBool,
    }

    impl ScriptedSource {
        fn open() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                hold: AtomicBool::new(false),
                gate: Semaphore::new(0),
                fail: AtomicBool::new(false),
            })
        }

        fn gated() -> Arc<Self> {
            let source = Self::open();
            source.hold.store(true, Ordering::SeqCst);
            source
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ArtifactSource for ScriptedSource {
        async fn fetch(&self) -> std::result::Result<Artifact, FetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.hold.load(Ordering::SeqCst) {
                self.gate.acquire().await.unwrap().forget();
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(FetchError::Status {
                    url: "memory://doc".into(),
                    status: 503,
                });
            }
            Ok(Artifact::Binary {
                bytes: format!("%PDF-{n}").into_bytes(),
                content_type: Some("application/pdf".into()),
            })
        }

        fn describe(&self) -> String {
            "memory://doc".into()
        }
    }

    struct Fixture {
        transport: MemoryTransport,
        source: Arc<ScriptedSource>,
        registry: Arc<BlobRegistry>,
        view: DocumentView,
    }

    async fn mount(source: Arc<ScriptedSource>, config: Config) -> Fixture {
        let transport = MemoryTransport::default();
        let registry = Arc::new(BlobRegistry::new());
        let view = DocumentView::start(
            &config,
            Arc::new(transport.clone()),
            source.clone(),
            registry.clone(),
        )
        .unwrap();
        wait_for_listeners(&transport, 1).await;
        Fixture {
            transport,
            source,
            registry,
            view,
        }
    }

    async fn wait_for_listeners(transport: &MemoryTransport, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while transport.listener_count() != n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("listener never connected");
    }

    async fn wait_for_state(view: &DocumentView, wanted: impl Fn(&ConsumerState) -> bool) {
        let mut rx = view.watch();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| wanted(&s.state)))
            .await
            .expect("state never reached")
            .unwrap();
    }

    #[tokio::test]
    async fn starts_awaiting_ready() {
        let fx = mount(ScriptedSource::open(), Config::default()).await;

        assert_eq!(fx.view.state(), ConsumerState::AwaitingReady);
        assert_eq!(fx.source.calls(), 0);
        fx.view.stop().await;
    }

    #[tokio::test]
    async fn repeated_ready_pings_fetch_once() {
        let fx = mount(ScriptedSource::gated(), Config::default()).await;

        for _ in 0..3 {
            fx.transport.publish_ready(true);
        }
        wait_for_state(&fx.view, |s| *s == ConsumerState::Fetching).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.source.calls(), 1);

        fx.source.gate.add_permits(1);
        wait_for_state(&fx.view, |s| *s == ConsumerState::Ready).await;
        fx.transport.publish_ready(true);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(fx.source.calls(), 1);
        assert!(fx.view.snapshot().handle.is_some());
        assert_eq!(fx.registry.live_count().await, 1);
        fx.view.stop().await;
    }

    #[tokio::test]
    async fn invalidation_then_ready_replaces_handle() {
        let fx = mount(ScriptedSource::open(), Config::default()).await;

        fx.transport.publish_ready(true);
        wait_for_state(&fx.view, |s| *s == ConsumerState::Ready).await;
        let first = fx.view.snapshot().handle.unwrap();

        fx.transport.publish_ready(false);
        wait_for_state(&fx.view, |s| *s == ConsumerState::AwaitingReady).await;
        assert_eq!(fx.view.snapshot().handle.as_ref(), Some(&first));

        fx.transport.publish_ready(true);
        let mut rx = fx.view.watch();
        let snapshot = rx
            .wait_for(|s| s.state == ConsumerState::Ready && s.handle.as_ref() != Some(&first))
            .await
            .unwrap()
            .clone();

        let second = snapshot.handle.unwrap();
        assert_eq!(fx.source.calls(), 2);
        assert_eq!(fx.registry.live_count().await, 1);
        assert!(fx.registry.resolve(&first.uri).await.is_none());
        assert_eq!(&*fx.registry.resolve(&second.uri).await.unwrap(), b"%PDF-2");
        fx.view.stop().await;
    }

    #[tokio::test]
    async fn stop_during_fetch_discards_result_and_releases_once() {
        let fx = mount(ScriptedSource::open(), Config::default()).await;
        fx.transport.publish_ready(true);
        wait_for_state(&fx.view, |s| *s == ConsumerState::Ready).await;

        fx.source.hold.store(true, Ordering::SeqCst);
        fx.view.refresh().unwrap();
        wait_for_state(&fx.view, |s| *s == ConsumerState::Fetching).await;

        let released = fx.view.stop().await;
        fx.source.gate.add_permits(1);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(released, 1);
        assert_eq!(fx.registry.live_count().await, 0);
        assert_eq!(fx.registry.released_count(), 1);
        assert_eq!(fx.transport.listener_count(), 0);
    }

    #[tokio::test]
    async fn fetch_failure_enters_error_and_notifies_once() {
        let source = ScriptedSource::open();
        source.fail.store(true, Ordering::SeqCst);
        let fx = mount(source, Config::default()).await;
        let mut notifications = fx.view.subscribe_notifications();

        fx.transport.publish_ready(true);
        wait_for_state(&fx.view, ConsumerState::is_error).await;

        let notification = notifications.recv().await.unwrap();
        assert_eq!(notification.level, NotificationLevel::Error);
        assert!(notification.description.contains("503"));
        assert!(notifications.try_recv().is_err());

        // A later ready ping retries
        fx.source.fail.store(false, Ordering::SeqCst);
        fx.transport.publish_ready(true);
        wait_for_state(&fx.view, |s| *s == ConsumerState::Ready).await;
        fx.view.stop().await;
    }

    #[tokio::test]
    async fn connection_error_closes_without_reconnect() {
        let fx = mount(ScriptedSource::open(), Config::default()).await;
        let mut notifications = fx.view.subscribe_notifications();

        fx.transport.fail_all("connection reset");
        wait_for_state(&fx.view, ConsumerState::is_error).await;

        let notification = notifications.recv().await.unwrap();
        assert_eq!(notification.title, "Connection Error");
        assert_eq!(fx.transport.listener_count(), 0);
        assert_eq!(fx.source.calls(), 0);
        fx.view.stop().await;
    }

    #[tokio::test]
    async fn reopen_policy_recovers_on_next_ready() {
        let mut config = Config::default();
        config.channel.on_error = ConnectionPolicy::Reopen { max_attempts: 1 };
        let fx = mount(ScriptedSource::open(), config).await;
        let mut notifications = fx.view.subscribe_notifications();

        fx.transport.fail_all("connection reset");
        notifications.recv().await.unwrap();
        wait_for_state(&fx.view, ConsumerState::is_error).await;
        wait_for_listeners(&fx.transport, 1).await;

        fx.transport.publish_ready(true);
        wait_for_state(&fx.view, |s| *s == ConsumerState::Ready).await;
        assert_eq!(fx.source.calls(), 1);
        fx.view.stop().await;
    }

    #[tokio::test]
    async fn source_artifacts_update_text() {
        struct TexSource;

        #[async_trait]
        impl ArtifactSource for TexSource {
            async fn fetch(&self) -> std::result::Result<Artifact, FetchError> {
                Ok(Artifact::Source("\\documentclass{letter}".into()))
            }

            fn describe(&self) -> String {
                "memory://tex".into()
            }
        }

        let transport = MemoryTransport::default();
        let registry = Arc::new(BlobRegistry::new());
        let view = DocumentView::start(
            &Config::default(),
            Arc::new(transport.clone()),
            Arc::new(TexSource),
            registry.clone(),
        )
        .unwrap();
        wait_for_listeners(&transport, 1).await;

        transport.publish(SseFrame::message("ready"));
        wait_for_state(&view, |s| *s == ConsumerState::Ready).await;

        assert_eq!(view.snapshot().text.as_deref(), Some("\\documentclass{letter}"));
        assert_eq!(registry.live_count().await, 0);
        assert_eq!(view.stop().await, 0);
    }

    #[tokio::test]
    async fn refresh_after_stop_is_rejected() {
        let fx = mount(ScriptedSource::open(), Config::default()).await;
        let lifetime = fx.view.lifetime.clone();
        lifetime.end();

        assert!(matches!(fx.view.refresh(), Err(Error::Stopped)));
        fx.view.stop().await;
    }
}
