//! Mounted consumers of the push channel.
//!
//! Each consumer is driven by a single spawned task with one `select!` loop, so all of its
//! state is mutated from one place. Consumers have an explicit lifecycle: `start` opens
//! the channel and spawns the driver; `stop` ends the [`Lifetime`](crate::Lifetime),
//! closes the channel, releases local resources and waits for the driver to finish.
//!
//! - [`DocumentView`] re-fetches a compiled document whenever the backend announces it is
//!   ready.
//! - [`TaskView`] starts background operations and matches their completion events.

mod document_view;
mod task_view;

pub use document_view::{DocumentSnapshot, DocumentView};
pub use task_view::{BeginOutcome, TaskSnapshot, TaskState, TaskView};

use crate::channel::{ChannelManager, ChannelSlot};
use crate::config::ConnectionPolicy;
use crate::error::ConnectionError;
use crate::notify::Notifier;

/// Tracks how many explicit re-opens a consumer has left
#[derive(Debug)]
struct ReopenBudget {
    policy: ConnectionPolicy,
    used: u32,
}

impl ReopenBudget {
    fn new(policy: ConnectionPolicy) -> Self {
        Self { policy, used: 0 }
    }

    fn try_take(&mut self) -> bool {
        match self.policy {
            ConnectionPolicy::Close => false,
            ConnectionPolicy::Reopen { max_attempts } if self.used < max_attempts => {
                self.used += 1;
                true
            }
            ConnectionPolicy::Reopen { .. } => false,
        }
    }
}

/// Retire a failed channel, re-open if the policy allows it, and report the failure once
async fn handle_channel_error(
    error: &ConnectionError,
    channels: &mut ChannelSlot,
    manager: &ChannelManager,
    budget: &mut ReopenBudget,
    notifier: &Notifier,
) {
    channels.shutdown().await;

    if budget.try_take() {
        match channels.open(manager) {
            Ok(channel) => {
                tracing::info!(channel = channel.id(), attempt = budget.used, "re-opened push channel")
            }
            Err(e) => tracing::warn!(error = %e, "could not re-open push channel"),
        }
    }
    notifier.error("Connection Error", error.to_string());
}
