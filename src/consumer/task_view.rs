use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::backend::TaskStarter;
use crate::cache::EphemeralCache;
use crate::channel::{ChannelManager, ChannelMessage, ChannelSlot, PushTransport};
use crate::config::Config;
use crate::correlator::{Correlation, TaskCorrelator};
use crate::error::{Error, Result, TaskFailure};
use crate::lifetime::Lifetime;
use crate::notify::{Notification, Notifier};
use crate::types::{ChannelEvent, TaskId, TaskKind};

use super::{ReopenBudget, handle_channel_error};

/// Progress of the view's current operation
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum TaskState {
    /// Nothing started yet
    #[default]
    Idle,
    /// Waiting for the completion of `task_id`
    Running {
        /// Correlation token held
        task_id: TaskId,
    },
    /// The latest operation succeeded (or was served from cache)
    Completed,
    /// The latest operation failed
    Failed(String),
}

/// What a [`TaskView`] currently shows
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TaskSnapshot {
    /// Current operation state
    pub state: TaskState,
    /// Payload of the last successful operation; kept when a later one fails
    pub last_result: Option<Value>,
    /// Whether `last_result` came from the cache
    pub from_cache: bool,
    /// Set while the push channel is down
    pub connection_error: Option<String>,
}

/// How [`TaskView::begin`] was satisfied
#[derive(Clone, Debug, PartialEq)]
pub enum BeginOutcome {
    /// The backend accepted the operation
    Started(TaskId),
    /// A fresh cached result was used instead
    Cached(Value),
}

enum Command {
    UseCache {
        cache: Arc<EphemeralCache<Value>>,
        key: String,
    },
    Begin {
        starter: Arc<dyn TaskStarter>,
        reply: oneshot::Sender<Result<BeginOutcome>>,
    },
}

/// Starts background operations of one kind and tracks their completion
///
/// Only the completion whose `task_id` matches the most recently started operation is
/// applied; everything else on the channel is ignored.
pub struct TaskView {
    kind: TaskKind,
    lifetime: Lifetime,
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<TaskSnapshot>,
    notifier: Notifier,
    driver: Option<JoinHandle<()>>,
}

impl TaskView {
    /// Mount the view for operations of `kind`
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(
        config: &Config,
        transport: Arc<dyn PushTransport>,
        kind: TaskKind,
    ) -> Result<Self> {
        config.validate()?;

        let lifetime = Lifetime::new();
        let notifier = Notifier::new(config.notifications.clone());
        let manager = ChannelManager::new(transport, config.channel.clone());
        let mut channels = ChannelSlot::new();
        channels.open(&manager)?;

        let (snapshot_tx, snapshot) = watch::channel(TaskSnapshot::default());
        let (commands, command_rx) = mpsc::unbounded_channel();

        tracing::info!(kind = %kind, "task view started");

        let driver = Driver {
            kind: kind.clone(),
            lifetime: lifetime.clone(),
            commands: command_rx,
            reopen: ReopenBudget::new(config.channel.on_error),
            manager,
            channels,
            correlator: TaskCorrelator::new(config.tasks.completion_timeout),
            cache: None,
            current: TaskSnapshot::default(),
            snapshot: snapshot_tx,
            notifier: notifier.clone(),
        };

        Ok(Self {
            kind,
            lifetime,
            commands,
            snapshot,
            notifier,
            driver: Some(tokio::spawn(driver.run())),
        })
    }

    /// Serve `begin` from `cache` under `key` while the entry is fresh, and store
    /// successful results there
    pub fn with_cache(self, cache: Arc<EphemeralCache<Value>>, key: impl Into<String>) -> Self {
        let key = key.into();
        if self.commands.send(Command::UseCache { cache, key }).is_err() {
            tracing::warn!(kind = %self.kind, "task view already stopped, cache not attached");
        }
        self
    }

    /// Kind of operation this view tracks
    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    /// Current snapshot
    pub fn snapshot(&self) -> TaskSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that observes every published snapshot
    pub fn watch(&self) -> watch::Receiver<TaskSnapshot> {
        self.snapshot.clone()
    }

    /// Subscribe to the view's notifications
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifier.subscribe()
    }

    /// Start an operation, or use a fresh cached result
    ///
    /// Starting while another operation is running abandons the earlier one.
    ///
    /// # Errors
    ///
    /// Returns [`TaskFailure::StartFailed`] if the backend rejects the request (also
    /// when `starter` is of another kind) and [`Error::Stopped`] once the view is stopped.
    pub async fn begin(&self, starter: Arc<dyn TaskStarter>) -> Result<BeginOutcome> {
        if !self.lifetime.is_live() {
            return Err(Error::Stopped);
        }
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Begin { starter, reply })
            .map_err(|_| Error::Stopped)?;
        rx.await.map_err(|_| Error::Stopped)?
    }

    /// Unmount: close the channel and forget held tokens
    ///
    /// Operations already submitted keep running on the backend; their completions are
    /// simply never applied.
    pub async fn stop(mut self) {
        self.lifetime.end();
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.await {
                tracing::warn!(kind = %self.kind, error = %e, "task view driver ended abnormally");
            }
        }
    }
}

impl Drop for TaskView {
    fn drop(&mut self) {
        self.lifetime.end();
    }
}

struct Driver {
    kind: TaskKind,
    lifetime: Lifetime,
    commands: mpsc::UnboundedReceiver<Command>,
    reopen: ReopenBudget,
    manager: ChannelManager,
    channels: ChannelSlot,
    correlator: TaskCorrelator,
    cache: Option<(Arc<EphemeralCache<Value>>, String)>,
    current: TaskSnapshot,
    snapshot: watch::Sender<TaskSnapshot>,
    notifier: Notifier,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let deadline = self.correlator.next_deadline();
            tokio::select! {
                biased;
                _ = self.lifetime.ended() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                message = self.channels.recv() => self.on_message(message).await,
                _ = sleep_until(deadline) => self.on_deadline(),
            }
        }

        let abandoned = self.correlator.clear();
        self.channels.shutdown().await;
        tracing::info!(kind = %self.kind, abandoned, "task view stopped");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::UseCache { cache, key } => self.cache = Some((cache, key)),
            Command::Begin { starter, reply } => {
                let result = self.begin(starter).await;
                // The caller may have given up waiting
                let _ = reply.send(result);
            }
        }
    }

    async fn begin(&mut self, starter: Arc<dyn TaskStarter>) -> Result<BeginOutcome> {
        if starter.kind() != self.kind {
            return Err(TaskFailure::StartFailed {
                kind: starter.kind(),
                message: format!("this view tracks {} operations", self.kind),
            }
            .into());
        }

        if let Some((cache, key)) = &self.cache {
            if let Some(cached) = cache.get(key).await {
                tracing::debug!(kind = %self.kind, key = %key, "serving cached result");
                self.current.state = TaskState::Completed;
                self.current.last_result = Some(cached.clone());
                self.current.from_cache = true;
                self.publish();
                return Ok(BeginOutcome::Cached(cached));
            }
        }

        let started = tokio::select! {
            _ = self.lifetime.ended() => return Err(Error::Stopped),
            started = starter.start() => started,
        };

        match started {
            Ok(task_id) => {
                let handle = self.correlator.begin(self.kind.clone(), task_id.clone());
                tracing::debug!(kind = %handle.kind, task_id = %handle.task_id, "awaiting completion");
                self.current.state = TaskState::Running {
                    task_id: task_id.clone(),
                };
                self.publish();
                Ok(BeginOutcome::Started(task_id))
            }
            Err(e) => {
                self.correlator.abandon(&self.kind);
                let message = e.user_message();
                self.current.state = TaskState::Failed(message.clone());
                self.publish();
                self.notifier.error(failure_title(&self.kind), message);
                Err(e)
            }
        }
    }

    async fn on_message(&mut self, message: ChannelMessage) {
        match message {
            ChannelMessage::Event(ChannelEvent::TaskCompletion(completion)) => {
                match self.correlator.on_completion(&completion) {
                    Correlation::Ignored => {}
                    Correlation::Succeeded { handle, payload } => {
                        let description = success_message(&handle.kind, &payload);
                        let result = Value::Object(payload);
                        if let Some((cache, key)) = &self.cache {
                            cache.put(key.clone(), result.clone()).await;
                        }
                        tracing::info!(kind = %handle.kind, task_id = %handle.task_id, "task completed");
                        self.current.state = TaskState::Completed;
                        self.current.last_result = Some(result);
                        self.current.from_cache = false;
                        self.publish();
                        self.notifier.success("Success", description);
                    }
                    Correlation::Failed { handle, failure } => {
                        tracing::warn!(kind = %handle.kind, task_id = %handle.task_id, error = %failure, "task failed");
                        self.fail(failure);
                    }
                }
            }
            ChannelMessage::Event(_) => {}
            ChannelMessage::Error(error) => {
                handle_channel_error(
                    &error,
                    &mut self.channels,
                    &self.manager,
                    &mut self.reopen,
                    &self.notifier,
                )
                .await;
                self.current.connection_error = if self.channels.is_open() {
                    None
                } else {
                    Some(error.to_string())
                };
                self.publish();
            }
        }
    }

    fn on_deadline(&mut self) {
        for failure in self.correlator.expire(Instant::now()) {
            self.fail(failure);
        }
    }

    fn fail(&mut self, failure: TaskFailure) {
        let message = Error::from(failure).user_message();
        self.current.state = TaskState::Failed(message.clone());
        self.publish();
        self.notifier.error(failure_title(&self.kind), message);
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.current.clone());
    }
}

fn sleep_until(deadline: Option<Instant>) -> impl Future<Output = ()> {
    async move {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}

fn failure_title(kind: &TaskKind) -> &'static str {
    match kind {
        TaskKind::CoverLetter => "Generation Failed",
        TaskKind::JobSearch => "Search Failed",
        TaskKind::Other(_) => "Task Failed",
    }
}

fn success_message(kind: &TaskKind, payload: &serde_json::Map<String, Value>) -> String {
    match kind {
        TaskKind::CoverLetter => "Cover letter generated successfully!".to_string(),
        TaskKind::JobSearch => {
            let total = payload
                .get("total_jobs")
                .and_then(Value::as_u64)
                .or_else(|| {
                    payload
                        .get("jobs")
                        .and_then(Value::as_array)
                        .map(|jobs| jobs.len() as u64)
                })
                .unwrap_or(0);
            format!("Found {total} jobs matching your skills!")
        }
        TaskKind::Other(label) => format!("{label} completed"),
    }
}
