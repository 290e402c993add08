//! # artifact-sync
//!
//! Live synchronization of server-compiled artifacts over a push channel.
//!
//! A backend compiles documents and runs long operations in the background. It announces
//! progress on a single Server-Sent Events stream: unlabeled readiness pings say whether
//! the compiled document is valid, and labeled events report the completion of a named
//! operation. This crate keeps local views consistent with that stream.
//!
//! ## Design Philosophy
//!
//! - **One channel per mounted consumer** - opened on `start`, closed on `stop`, never
//!   reconnected behind the consumer's back
//! - **At most one fetch in flight** - repeated readiness pings never stack requests
//! - **Late results are ignored** - nothing is applied after a consumer stops
//! - **Pluggable seams** - transport, artifact source, resource store and task starter are
//!   traits, with in-memory implementations for tests
//!
//! ## Quick Start
//!
//! ```no_run
//! use artifact_sync::{BackendClient, BlobRegistry, Config, DocumentParams, DocumentView};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::with_base_url("http://localhost:8000");
//!     let backend = BackendClient::new(config.api.clone())?;
//!
//!     let view = DocumentView::start(
//!         &config,
//!         Arc::new(backend.push_transport()?),
//!         Arc::new(backend.document_source(DocumentParams::resume_pdf())?),
//!         Arc::new(BlobRegistry::new()),
//!     )?;
//!
//!     let mut snapshots = view.watch();
//!     while snapshots.changed().await.is_ok() {
//!         println!("{:?}", snapshots.borrow().state);
//!     }
//!
//!     view.stop().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Typed client for the backend's endpoints
pub mod backend;
/// Time-boxed result cache
pub mod cache;
/// Push channel and transports
pub mod channel;
/// Configuration types
pub mod config;
/// Mounted consumers
pub mod consumer;
/// Completion correlation
pub mod correlator;
/// Error types
pub mod error;
/// Artifact retrieval
pub mod fetcher;
/// Consumer lifetimes
pub mod lifetime;
/// User notifications
pub mod notify;
/// Readiness state machine
pub mod readiness;
/// Local resource handles
pub mod resource;
/// Core types
pub mod types;

// Re-export commonly used types
pub use backend::{
    BackendClient, CoverLetterRequest, CoverLetterTask, DocumentParams, FileType,
    JobSearchRequest, JobSearchTask, TaskStarter,
};
pub use cache::EphemeralCache;
pub use channel::{
    Channel, ChannelManager, ChannelMessage, HttpPushTransport, MemoryTransport, PushTransport,
};
pub use config::{Config, ConnectionPolicy};
pub use consumer::{BeginOutcome, DocumentSnapshot, DocumentView, TaskSnapshot, TaskState, TaskView};
pub use error::{ConnectionError, Error, FetchError, ParseError, Result, TaskFailure};
pub use fetcher::{Artifact, ArtifactFormat, ArtifactSource, HttpArtifactSource};
pub use lifetime::Lifetime;
pub use notify::{Notification, NotificationLevel, Notifier};
pub use readiness::{FetchTicket, PingOutcome, ReadinessMachine};
pub use resource::{BlobRegistry, FileStore, ResourceHandle, ResourceKind, ResourceStore};
pub use types::{ChannelEvent, ConsumerState, TaskCompletion, TaskId, TaskKind};
