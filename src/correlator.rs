//! Task correlation
//!
//! The push channel carries completions for every consumer in the session. A consumer
//! only acts on a completion whose `task_id` matches the token it holds for that kind of
//! operation. Starting a second operation of the same kind abandons the first: its
//! completion, when it arrives, no longer matches and is dropped.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::TaskFailure;
use crate::types::{TaskCompletion, TaskId, TaskKind};

/// Token for one in-flight operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskHandle {
    /// Operation kind
    pub kind: TaskKind,
    /// Correlation token from the backend's start acknowledgment
    pub task_id: TaskId,
    /// When the operation was started
    pub started_at: Instant,
    /// When the operation is considered lost
    pub deadline: Instant,
}

/// Outcome of matching a completion against held tokens
#[derive(Clone, Debug, PartialEq)]
pub enum Correlation {
    /// Stale or foreign completion; nothing changes
    Ignored,
    /// The held operation succeeded
    Succeeded {
        /// The resolved handle
        handle: TaskHandle,
        /// Domain fields of the completion
        payload: Map<String, Value>,
    },
    /// The held operation failed
    Failed {
        /// The resolved handle
        handle: TaskHandle,
        /// Failure to surface
        failure: TaskFailure,
    },
}

/// Matches completions to the operations a consumer started
#[derive(Debug)]
pub struct TaskCorrelator {
    timeout: Duration,
    held: HashMap<TaskKind, TaskHandle>,
}

impl TaskCorrelator {
    /// Create a correlator whose tokens expire after `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            held: HashMap::new(),
        }
    }

    /// Record the token for a newly started operation
    ///
    /// Replaces any token already held for `kind`.
    pub fn begin(&mut self, kind: TaskKind, task_id: impl Into<TaskId>) -> TaskHandle {
        let now = Instant::now();
        let handle = TaskHandle {
            kind: kind.clone(),
            task_id: task_id.into(),
            started_at: now,
            deadline: now + self.timeout,
        };

        if let Some(previous) = self.held.insert(kind, handle.clone()) {
            tracing::debug!(
                kind = %previous.kind,
                abandoned = %previous.task_id,
                task_id = %handle.task_id,
                "new operation abandons correlation with previous task"
            );
        }
        handle
    }

    /// Token currently held for `kind`
    pub fn pending(&self, kind: &TaskKind) -> Option<&TaskHandle> {
        self.held.get(kind)
    }

    /// Whether no operation is outstanding
    pub fn is_idle(&self) -> bool {
        self.held.is_empty()
    }

    /// Match a completion event
    pub fn on_completion(&mut self, completion: &TaskCompletion) -> Correlation {
        let matches = self
            .held
            .get(&completion.kind)
            .is_some_and(|held| held.task_id == completion.task_id);
        if !matches {
            tracing::debug!(
                kind = %completion.kind,
                task_id = %completion.task_id,
                "dropping uncorrelated task completion"
            );
            return Correlation::Ignored;
        }

        let Some(handle) = self.held.remove(&completion.kind) else {
            return Correlation::Ignored;
        };

        if completion.success {
            Correlation::Succeeded {
                handle,
                payload: completion.payload.clone(),
            }
        } else {
            let message = completion
                .error
                .clone()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| completion.kind.default_failure_message());
            Correlation::Failed {
                failure: TaskFailure::Reported {
                    kind: handle.kind.clone(),
                    message,
                },
                handle,
            }
        }
    }

    /// Earliest deadline among held tokens
    pub fn next_deadline(&self) -> Option<Instant> {
        self.held.values().map(|h| h.deadline).min()
    }

    /// Remove every token whose deadline has passed
    pub fn expire(&mut self, now: Instant) -> Vec<TaskFailure> {
        let overdue: Vec<TaskKind> = self
            .held
            .iter()
            .filter(|(_, handle)| handle.deadline <= now)
            .map(|(kind, _)| kind.clone())
            .collect();

        overdue
            .into_iter()
            .filter_map(|kind| self.held.remove(&kind))
            .map(|handle| {
                tracing::warn!(kind = %handle.kind, task_id = %handle.task_id, "task completion timed out");
                TaskFailure::TimedOut {
                    kind: handle.kind,
                    task_id: handle.task_id.0,
                }
            })
            .collect()
    }

    /// Drop the token held for `kind`, if any
    ///
    /// Used when a replacement operation could not be started: the earlier one is
    /// abandoned all the same.
    pub fn abandon(&mut self, kind: &TaskKind) -> Option<TaskHandle> {
        let handle = self.held.remove(kind)?;
        tracing::debug!(kind = %handle.kind, abandoned = %handle.task_id, "abandoned held task");
        Some(handle)
    }

    /// Discard every token (consumer unmount); the backend keeps running them
    pub fn clear(&mut self) -> usize {
        let count = self.held.len();
        self.held.clear();
        count
    }
}
