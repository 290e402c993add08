//! Error types for artifact-sync
//!
//! This module groups failures by where they surface:
//! - [`ConnectionError`] - the push channel failed to open or dropped
//! - [`FetchError`] - artifact retrieval failed (network vs. non-success status)
//! - [`TaskFailure`] - the backend reported that an asynchronous operation failed
//! - [`ParseError`] - a malformed channel event (logged and dropped, never fatal)
//!
//! [`Error`] wraps all of them plus the lower-level failures of the HTTP, JSON and I/O
//! layers.

use crate::types::TaskKind;
use thiserror::Error;

/// Result type alias for artifact-sync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for artifact-sync
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "api.base_url")
        key: Option<String>,
    },

    /// Push channel error
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Artifact retrieval error
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Asynchronous backend operation failed
    #[error("task failed: {0}")]
    Task(#[from] TaskFailure),

    /// Malformed channel event
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// Local resource could not be created
    #[error("resource error: {0}")]
    Resource(String),

    /// A consumer tried to open a second channel without closing the first
    #[error("a push channel is already open for this consumer")]
    ChannelAlreadyOpen,

    /// The consumer has been stopped and no longer accepts work
    #[error("consumer has been stopped")]
    Stopped,

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid endpoint URL
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

impl Error {
    /// Message shown to the user in a transient notification.
    ///
    /// Reported and start failures carry their own message verbatim; everything else
    /// uses the `Display` output.
    pub fn user_message(&self) -> String {
        match self {
            Error::Task(
                TaskFailure::Reported { message, .. } | TaskFailure::StartFailed { message, .. },
            ) => message.clone(),
            Error::Fetch(e) => e.user_message(),
            other => other.to_string(),
        }
    }
}

/// Push channel errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// The connection could not be established
    #[error("failed to connect to {url}: {message}")]
    Connect {
        /// Endpoint that was being opened
        url: String,
        /// Transport-level reason
        message: String,
    },

    /// The endpoint answered with a non-success status
    #[error("push endpoint {url} returned status {status}")]
    Status {
        /// Endpoint that was being opened
        url: String,
        /// HTTP status code
        status: u16,
    },

    /// The connection dropped while streaming
    #[error("push channel dropped: {0}")]
    Dropped(String),

    /// The server ended the stream
    #[error("push channel closed by server")]
    Closed,
}

/// Artifact retrieval errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Transport failure before a response arrived
    #[error("failed to fetch {url}: {message}")]
    Network {
        /// Artifact URL
        url: String,
        /// Transport-level reason
        message: String,
    },

    /// Response with a non-2xx status
    #[error("fetching {url} returned status {status}")]
    Status {
        /// Artifact URL
        url: String,
        /// HTTP status code
        status: u16,
    },

    /// Response body did not have the expected shape
    #[error("could not decode artifact from {url}: {message}")]
    Decode {
        /// Artifact URL
        url: String,
        /// Decoder message
        message: String,
    },
}

impl FetchError {
    /// Short cause suitable for an error banner
    pub fn user_message(&self) -> String {
        match self {
            FetchError::Network { message, .. } => format!("Failed to load artifact: {message}"),
            FetchError::Status { status, .. } => {
                format!("Failed to load artifact (status {status})")
            }
            FetchError::Decode { message, .. } => format!("Failed to read artifact: {message}"),
        }
    }
}

/// Failures of asynchronous backend operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskFailure {
    /// The backend reported `success: false`
    #[error("{kind} failed: {message}")]
    Reported {
        /// Operation kind
        kind: TaskKind,
        /// Message from the completion event (or the kind's default)
        message: String,
    },

    /// No completion arrived before the deadline
    #[error("{kind} task {task_id} timed out")]
    TimedOut {
        /// Operation kind
        kind: TaskKind,
        /// Correlation token that never resolved
        task_id: String,
    },

    /// The start request itself failed
    #[error("could not start {kind}: {message}")]
    StartFailed {
        /// Operation kind
        kind: TaskKind,
        /// Reason reported by the starter
        message: String,
    },
}

/// Malformed channel events
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    /// Body of a labeled event was not valid JSON
    #[error("event '{label}' carried invalid JSON: {message}")]
    InvalidJson {
        /// SSE event label
        label: String,
        /// Parser message
        message: String,
    },

    /// Body parsed but had no usable `task_id`
    #[error("event '{label}' has no task_id")]
    MissingTaskId {
        /// SSE event label
        label: String,
    },
}
