//! Readiness state machine
//!
//! Gates when a consumer may fetch its artifact:
//!
//! ```text
//! Idle --start--> AwaitingReady --ready=true--> Fetching --ok--> Ready
//!                      ^                            |
//!                      |                            +--err--> Error
//!                      +------- ready=false (from any state) --+
//! ```
//!
//! The machine is pure: it never performs I/O. A transition into `Fetching` hands back a
//! [`FetchTicket`]; the caller runs the fetch and reports the outcome with that ticket.
//! Outcomes carrying a stale ticket, or arriving after [`ReadinessMachine::tear_down`],
//! are discarded.

use crate::types::{ChannelEvent, ConsumerState};

/// Identifies one issued fetch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FetchTicket(u64);

impl FetchTicket {
    /// Sequence number of the fetch within this consumer's lifetime
    pub fn sequence(&self) -> u64 {
        self.0
    }
}

/// What the caller must do after feeding a readiness ping
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PingOutcome {
    /// Issue exactly one fetch for this ticket
    Fetch(FetchTicket),
    /// The artifact was invalidated; an in-flight fetch, if any, is now stale
    Reset {
        /// Ticket of the fetch that was in flight
        superseded: Option<FetchTicket>,
    },
    /// Nothing to do
    Ignored,
}

/// Per-consumer readiness state
#[derive(Debug, Default)]
pub struct ReadinessMachine {
    state: ConsumerState,
    triggered: bool,
    in_flight: Option<FetchTicket>,
    issued: u64,
    torn_down: bool,
}

impl ReadinessMachine {
    /// Create a machine in `Idle`
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state
    pub fn state(&self) -> &ConsumerState {
        &self.state
    }

    /// Ticket of the fetch currently in flight
    pub fn in_flight(&self) -> Option<FetchTicket> {
        self.in_flight
    }

    /// Number of fetches issued so far
    pub fn fetches_issued(&self) -> u64 {
        self.issued
    }

    /// Whether [`tear_down`](Self::tear_down) has been called
    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Advance `Idle` to `AwaitingReady` on mount
    pub fn start(&mut self) {
        if !self.torn_down && self.state == ConsumerState::Idle {
            self.state = ConsumerState::AwaitingReady;
        }
    }

    /// Feed a channel event; only readiness pings matter here
    pub fn on_event(&mut self, event: &ChannelEvent) -> PingOutcome {
        match event {
            ChannelEvent::Readiness { ready } => self.on_ping(*ready),
            ChannelEvent::TaskCompletion(_)
            | ChannelEvent::Unparseable { .. }
            | ChannelEvent::Ignored { .. } => PingOutcome::Ignored,
        }
    }

    /// Feed a readiness ping
    pub fn on_ping(&mut self, ready: bool) -> PingOutcome {
        if self.torn_down {
            return PingOutcome::Ignored;
        }

        if !ready {
            self.state = ConsumerState::AwaitingReady;
            self.triggered = false;
            return PingOutcome::Reset {
                superseded: self.in_flight.take(),
            };
        }

        let may_fetch = matches!(
            self.state,
            ConsumerState::AwaitingReady | ConsumerState::Error(_)
        );
        if !may_fetch || self.triggered {
            return PingOutcome::Ignored;
        }

        self.issued += 1;
        let ticket = FetchTicket(self.issued);
        self.triggered = true;
        self.in_flight = Some(ticket);
        self.state = ConsumerState::Fetching;
        PingOutcome::Fetch(ticket)
    }

    /// Force a re-fetch, as after a manual update of the source document
    ///
    /// Equivalent to `ready=false` followed by `ready=true`.
    pub fn refresh(&mut self) -> PingOutcome {
        self.on_ping(false);
        self.on_ping(true)
    }

    /// Report a fetch outcome; returns `true` if it was applied
    pub fn on_fetch_result(&mut self, ticket: FetchTicket, outcome: Result<(), String>) -> bool {
        if self.torn_down || self.in_flight != Some(ticket) {
            return false;
        }

        self.in_flight = None;
        match outcome {
            Ok(()) => self.state = ConsumerState::Ready,
            Err(message) => {
                self.state = ConsumerState::Error(message);
                self.triggered = false;
            }
        }
        true
    }

    /// Enter `Error` because the channel failed
    ///
    /// Any in-flight fetch becomes stale. The guard is cleared so that a re-opened
    /// channel's first ready ping fetches again.
    pub fn fail(&mut self, message: impl Into<String>) -> Option<FetchTicket> {
        if self.torn_down {
            return None;
        }
        self.state = ConsumerState::Error(message.into());
        self.triggered = false;
        self.in_flight.take()
    }

    /// Stop reacting to anything; returns the ticket that was in flight
    pub fn tear_down(&mut self) -> Option<FetchTicket> {
        self.torn_down = true;
        self.triggered = false;
        self.in_flight.take()
    }
}
