//! Configuration types for artifact-sync

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable overriding [`ApiConfig::base_url`]
pub const API_BASE_URL_ENV: &str = "ARTIFACT_SYNC_API_BASE_URL";

/// Backend endpoint configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Backend origin, without a trailing `/api` (default: "http://localhost:8000")
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Push channel path (default: "/api/events")
    #[serde(default = "default_events_path")]
    pub events_path: String,

    /// Timeout for request/response calls (default: 30 seconds)
    ///
    /// Does not apply to the push channel, which is long-lived.
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            events_path: default_events_path(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl ApiConfig {
    /// Defaults, with the base URL taken from `ARTIFACT_SYNC_API_BASE_URL` when set
    pub fn from_env() -> Self {
        match std::env::var(API_BASE_URL_ENV) {
            Ok(url) if !url.trim().is_empty() => {
                tracing::debug!(base_url = %url, "using API base URL from environment");
                Self {
                    base_url: url.trim().trim_end_matches('/').to_string(),
                    ..Self::default()
                }
            }
            _ => Self::default(),
        }
    }

    /// Absolute URL of the push channel
    pub fn events_url(&self) -> Result<url::Url> {
        self.endpoint(&self.events_path)
    }

    /// Join a path onto the base URL
    pub fn endpoint(&self, path: &str) -> Result<url::Url> {
        let base = url::Url::parse(&self.base_url).map_err(|e| Error::Config {
            message: format!("invalid base URL '{}': {}", self.base_url, e),
            key: Some("api.base_url".to_string()),
        })?;
        Ok(base.join(path)?)
    }
}

/// What a consumer does after its push channel fails
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ConnectionPolicy {
    /// Close and surface the error (no reconnect)
    #[default]
    Close,
    /// Re-open explicitly, up to `max_attempts` times per consumer lifetime
    Reopen {
        /// Maximum number of re-open attempts
        max_attempts: u32,
    },
}

/// Push channel configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Timeout for establishing the connection (default: 10 seconds)
    #[serde(default = "default_connect_timeout", with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Buffered events per consumer before the driver applies backpressure (default: 64)
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Behaviour after a transport error
    #[serde(default)]
    pub on_error: ConnectionPolicy,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            event_buffer: default_event_buffer(),
            on_error: ConnectionPolicy::default(),
        }
    }
}

/// Background task configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskConfig {
    /// How long to wait for a completion event before failing the task (default: 5 minutes)
    #[serde(default = "default_completion_timeout", with = "duration_serde")]
    pub completion_timeout: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            completion_timeout: default_completion_timeout(),
        }
    }
}

/// Ephemeral result cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Time-to-live of cached query results (default: 5 minutes)
    #[serde(default = "default_cache_ttl", with = "duration_serde")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: default_cache_ttl(),
        }
    }
}

/// Transient notification configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Display duration of success notifications in milliseconds (default: 3000)
    #[serde(default = "default_success_duration", with = "millis_serde")]
    pub success_duration: Duration,

    /// Display duration of error notifications in milliseconds (default: 5000)
    #[serde(default = "default_error_duration", with = "millis_serde")]
    pub error_duration: Duration,

    /// Broadcast buffer for notification subscribers (default: 32)
    #[serde(default = "default_notification_buffer")]
    pub buffer: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            success_duration: default_success_duration(),
            error_duration: default_error_duration(),
            buffer: default_notification_buffer(),
        }
    }
}

/// Main configuration for artifact-sync consumers
///
/// Every section has sensible defaults, so `Config::default()` talks to a backend on
/// `http://localhost:8000`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Backend endpoints
    #[serde(default)]
    pub api: ApiConfig,

    /// Push channel behaviour
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Background task correlation
    #[serde(default)]
    pub tasks: TaskConfig,

    /// Ephemeral result cache
    #[serde(default)]
    pub cache: CacheConfig,

    /// Transient notifications
    #[serde(default)]
    pub notifications: NotificationConfig,
}

impl Config {
    /// Configuration pointing at the given backend origin
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            api: ApiConfig {
                base_url: base_url.into(),
                ..ApiConfig::default()
            },
            ..Self::default()
        }
    }

    /// Check that the configuration is usable
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        self.api.events_url()?;

        let zero_checks = [
            (self.api.request_timeout.is_zero(), "api.request_timeout"),
            (self.channel.connect_timeout.is_zero(), "channel.connect_timeout"),
            (self.tasks.completion_timeout.is_zero(), "tasks.completion_timeout"),
            (self.cache.ttl.is_zero(), "cache.ttl"),
        ];
        for (is_zero, key) in zero_checks {
            if is_zero {
                return Err(Error::Config {
                    message: format!("{key} must be greater than zero"),
                    key: Some(key.to_string()),
                });
            }
        }

        if self.channel.event_buffer == 0 {
            return Err(Error::Config {
                message: "channel.event_buffer must be at least 1".to_string(),
                key: Some("channel.event_buffer".to_string()),
            });
        }
        if self.notifications.buffer == 0 {
            return Err(Error::Config {
                message: "notifications.buffer must be at least 1".to_string(),
                key: Some("notifications.buffer".to_string()),
            });
        }

        Ok(())
    }
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_events_path() -> String {
    "/api/events".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_event_buffer() -> usize {
    64
}

fn default_completion_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_success_duration() -> Duration {
    Duration::from_millis(3000)
}

fn default_error_duration() -> Duration {
    Duration::from_millis(5000)
}

fn default_notification_buffer() -> usize {
    32
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Duration serialization helper (milliseconds)
mod millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
