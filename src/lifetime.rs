//! Consumer lifetime token.
//!
//! One [`Lifetime`] exists per mounted consumer. Every asynchronous result (fetch
//! response, channel event, task completion) passes through [`Lifetime::admit`] before it
//! touches consumer state, so nothing is applied after teardown.

use tokio_util::sync::CancellationToken;

/// Cancellation token scoped to one consumer mount
#[derive(Clone, Debug, Default)]
pub struct Lifetime {
    token: CancellationToken,
}

impl Lifetime {
    /// Begin a new lifetime
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the consumer is still mounted
    pub fn is_live(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// End the lifetime; idempotent
    pub fn end(&self) {
        self.token.cancel();
    }

    /// Pass `value` through only while the consumer is mounted
    pub fn admit<T>(&self, value: T) -> Option<T> {
        self.is_live().then_some(value)
    }

    /// Resolves when the lifetime ends
    pub async fn ended(&self) {
        self.token.cancelled().await
    }

    /// Underlying token, for `select!` loops and child tasks
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
