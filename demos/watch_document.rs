//! Watch a compiled document and generate a cover letter
//!
//! This example demonstrates the two consumer kinds:
//! - Mounting a `DocumentView` that re-fetches the resume PDF whenever the backend says
//!   it is ready
//! - Mounting a `TaskView` and starting a cover letter generation
//! - Printing notifications as they arrive
//! - Stopping both consumers cleanly
//!
//! Point `ARTIFACT_SYNC_API_BASE_URL` at a running backend (default
//! `http://localhost:8000`).

use std::sync::Arc;
use std::time::Duration;

use artifact_sync::config::ApiConfig;
use artifact_sync::{
    BackendClient, BlobRegistry, Config, CoverLetterRequest, CoverLetterTask, DocumentParams,
    DocumentView, TaskKind, TaskView,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing for logging (optional)
    // Uncomment if you add tracing-subscriber to your dependencies:
    // tracing_subscriber::fmt::init();

    let config = Config {
        api: ApiConfig::from_env(),
        ..Default::default()
    };
    let backend = BackendClient::new(config.api.clone())?;

    // Resume preview, kept in sync with the backend
    let document = DocumentView::start(
        &config,
        Arc::new(backend.push_transport()?),
        Arc::new(backend.document_source(DocumentParams::resume_pdf())?),
        Arc::new(BlobRegistry::new()),
    )?;

    let mut snapshots = document.watch();
    tokio::spawn(async move {
        while snapshots.changed().await.is_ok() {
            let snapshot = snapshots.borrow_and_update().clone();
            println!("document: {:?} ({:?})", snapshot.state, snapshot.handle.map(|h| h.uri));
        }
    });

    // Cover letter generation, matched by task id
    let letters = TaskView::start(
        &config,
        Arc::new(backend.push_transport()?),
        TaskKind::CoverLetter,
    )?;
    let mut notifications = letters.subscribe_notifications();
    tokio::spawn(async move {
        while let Ok(notification) = notifications.recv().await {
            println!("[{}] {}", notification.title, notification.description);
        }
    });

    let request = CoverLetterRequest::for_job(
        Some("Build reliable backend services in Rust."),
        Some("Acme Corp"),
        Some("Backend Engineer"),
        None,
    );
    let outcome = letters
        .begin(Arc::new(CoverLetterTask::new(backend.clone(), request)))
        .await?;
    println!("started: {outcome:?}");

    tokio::time::sleep(Duration::from_secs(60)).await;

    letters.stop().await;
    let released = document.stop().await;
    println!("released {released} local resource(s)");

    Ok(())
}
