//! Core types for artifact-sync

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::channel::SseFrame;
use crate::error::ParseError;

/// Correlation token issued by the backend when an operation starts
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Create a new TaskId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the inner token
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of background operation a consumer can start
///
/// Each kind owns one labeled event on the push channel. Unknown labels that still carry
/// a completion body map to [`TaskKind::Other`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// AI cover letter generation (`cover_letter_update`)
    CoverLetter,
    /// Job search (`job_update`)
    JobSearch,
    /// Any other labeled completion
    Other(String),
}

impl TaskKind {
    /// SSE event label announcing completion of this kind
    pub fn event_label(&self) -> &str {
        match self {
            TaskKind::CoverLetter => "cover_letter_update",
            TaskKind::JobSearch => "job_update",
            TaskKind::Other(label) => label,
        }
    }

    /// Map an SSE event label back to a known kind
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "cover_letter_update" => Some(TaskKind::CoverLetter),
            "job_update" => Some(TaskKind::JobSearch),
            _ => None,
        }
    }

    /// Message used when a failed completion carries no `error`
    pub fn default_failure_message(&self) -> String {
        match self {
            TaskKind::CoverLetter => "Could not generate cover letter".to_string(),
            TaskKind::JobSearch => "Job search failed.".to_string(),
            TaskKind::Other(label) => format!("Task '{label}' failed"),
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::CoverLetter => f.write_str("cover letter"),
            TaskKind::JobSearch => f.write_str("job search"),
            TaskKind::Other(label) => f.write_str(label),
        }
    }
}

/// Result of a named asynchronous operation, as announced on the push channel
#[derive(Clone, Debug, PartialEq)]
pub struct TaskCompletion {
    /// Operation kind (derived from the event label)
    pub kind: TaskKind,
    /// Correlation token
    pub task_id: TaskId,
    /// Whether the operation succeeded
    pub success: bool,
    /// Failure message, if any
    pub error: Option<String>,
    /// Remaining domain fields (`jobs`, `total_jobs`, ...)
    pub payload: Map<String, Value>,
}

impl TaskCompletion {
    /// Parse a labeled event body
    pub fn parse(kind: TaskKind, data: &str) -> Result<Self, ParseError> {
        let label = kind.event_label().to_string();
        let value: Value = serde_json::from_str(data).map_err(|e| ParseError::InvalidJson {
            label: label.clone(),
            message: e.to_string(),
        })?;
        let Value::Object(mut body) = value else {
            return Err(ParseError::InvalidJson {
                label,
                message: "expected a JSON object".to_string(),
            });
        };

        let task_id = match body.remove("task_id") {
            Some(Value::String(id)) => TaskId(id),
            Some(Value::Number(n)) => TaskId(n.to_string()),
            _ => return Err(ParseError::MissingTaskId { label }),
        };
        let success = body
            .remove("success")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let error = match body.remove("error") {
            Some(Value::String(message)) => Some(message),
            _ => None,
        };

        Ok(Self {
            kind,
            task_id,
            success,
            error,
            payload: body,
        })
    }
}

/// Event delivered over a push channel
///
/// Every inbound frame maps to exactly one variant; nothing here panics or errors.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelEvent {
    /// Unlabeled readiness message
    Readiness {
        /// Whether the server-side artifact is currently valid
        ready: bool,
    },

    /// Labeled completion of a background operation
    TaskCompletion(TaskCompletion),

    /// Labeled event whose body could not be parsed
    Unparseable {
        /// SSE event label
        label: String,
        /// Raw body
        data: String,
        /// What went wrong
        error: ParseError,
    },

    /// Unknown label with no recognizable shape
    Ignored {
        /// SSE event label
        label: String,
    },
}

impl ChannelEvent {
    /// Interpret a decoded SSE frame
    pub fn from_frame(frame: &SseFrame) -> Self {
        match frame.event.as_deref() {
            None | Some("message") => ChannelEvent::Readiness {
                ready: readiness_flag(&frame.data),
            },
            Some(label) => match TaskKind::from_label(label) {
                Some(kind) => match TaskCompletion::parse(kind, &frame.data) {
                    Ok(completion) => ChannelEvent::TaskCompletion(completion),
                    Err(error) => ChannelEvent::Unparseable {
                        label: label.to_string(),
                        data: frame.data.clone(),
                        error,
                    },
                },
                // Unknown labels are only interesting when they look like a completion
                None => match TaskCompletion::parse(TaskKind::Other(label.to_string()), &frame.data)
                {
                    Ok(completion) => ChannelEvent::TaskCompletion(completion),
                    Err(_) => ChannelEvent::Ignored {
                        label: label.to_string(),
                    },
                },
            },
        }
    }
}

fn readiness_flag(data: &str) -> bool {
    let data = data.trim();
    if data.eq_ignore_ascii_case("ready") || data == "true" {
        return true;
    }
    match serde_json::from_str::<Value>(data) {
        Ok(Value::Bool(ready)) => ready,
        Ok(Value::Object(body)) => body.get("ready").and_then(Value::as_bool).unwrap_or(false),
        _ => false,
    }
}

/// Per-consumer readiness state
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum ConsumerState {
    /// Not yet started
    #[default]
    Idle,
    /// Waiting for a ready ping
    AwaitingReady,
    /// A fetch is in flight
    Fetching,
    /// Latest artifact is loaded
    Ready,
    /// The last fetch or the channel failed
    Error(String),
}

impl ConsumerState {
    /// Whether the consumer is in the terminal error state
    pub fn is_error(&self) -> bool {
        matches!(self, ConsumerState::Error(_))
    }
}
