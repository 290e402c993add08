//! Transient user notifications.
//!
//! Every failure (and every completed operation) is reported once as a [`Notification`]
//! broadcast to all subscribers, which typically render it as a toast.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::NotificationConfig;

/// Severity of a notification
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    /// Operation completed
    Success,
    /// Operation or connection failed
    Error,
}

/// One transient notification
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Severity
    pub level: NotificationLevel,
    /// Short title
    pub title: String,
    /// Longer description
    pub description: String,
    /// How long to display it, in milliseconds
    pub duration_ms: u64,
    /// When it was raised
    pub timestamp: DateTime<Utc>,
}

/// Broadcasts notifications to any number of subscribers
#[derive(Clone, Debug)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
    config: NotificationConfig,
}

impl Notifier {
    /// Create a notifier
    pub fn new(config: NotificationConfig) -> Self {
        let (tx, _) = broadcast::channel(config.buffer.max(1));
        Self { tx, config }
    }

    /// Subscribe to notifications raised from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Raise a success notification
    pub fn success(&self, title: impl Into<String>, description: impl Into<String>) {
        let duration = self.config.success_duration;
        self.emit(NotificationLevel::Success, title.into(), description.into(), duration);
    }

    /// Raise an error notification
    pub fn error(&self, title: impl Into<String>, description: impl Into<String>) {
        let duration = self.config.error_duration;
        self.emit(NotificationLevel::Error, title.into(), description.into(), duration);
    }

    fn emit(
        &self,
        level: NotificationLevel,
        title: String,
        description: String,
        duration: std::time::Duration,
    ) {
        match level {
            NotificationLevel::Success => tracing::info!(title = %title, description = %description, "notification"),
            NotificationLevel::Error => tracing::warn!(title = %title, description = %description, "notification"),
        }
        // No subscribers is fine: notifications are fire-and-forget
        let _ = self.tx.send(Notification {
            level,
            title,
            description,
            duration_ms: duration.as_millis() as u64,
            timestamp: Utc::now(),
        });
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(NotificationConfig::default())
    }
}
