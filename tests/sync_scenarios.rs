//! End-to-end synchronization scenarios
//!
//! These tests drive the consumers against a mocked backend:
//! - Readiness-driven document refresh with files materialized on disk
//! - The HTTP push channel decoding a real SSE body
//! - Correlated background operations started through the backend client
//! - Teardown of one consumer leaving others on the same transport untouched

mod common;

use std::sync::Arc;

use artifact_sync::config::ChannelConfig;
use artifact_sync::{
    BeginOutcome, BlobRegistry, Channel, ChannelEvent, ChannelManager, ChannelMessage, ConnectionError,
    ConsumerState, CoverLetterRequest, CoverLetterTask, DocumentParams, DocumentView,
    EphemeralCache, FileStore, JobSearchRequest, JobSearchTask, MemoryTransport,
    NotificationLevel, TaskId, TaskKind, TaskState, TaskView,
};
use artifact_sync::channel::SseFrame;
use common::{WAIT, backend_for, file_count, pdf_body, wait_for_listeners, wait_until};
use serde_json::json;
use tempfile::tempdir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_pdf_revisions(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/serve_pdf"))
        .and(query_param("file_type", "pdf"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/pdf")
                .set_body_bytes(pdf_body(1)),
        )
        .up_to_n_times(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/serve_pdf"))
        .and(query_param("file_type", "pdf"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/pdf")
                .set_body_bytes(pdf_body(2)),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn document_view_rotates_files_on_disk() {
    let server = MockServer::start().await;
    mount_pdf_revisions(&server).await;
    let (backend, config) = backend_for(&server);
    let dir = tempdir().unwrap();
    let transport = MemoryTransport::default();

    let view = DocumentView::start(
        &config,
        Arc::new(transport.clone()),
        Arc::new(backend.document_source(DocumentParams::resume_pdf()).unwrap()),
        Arc::new(FileStore::new(dir.path())),
    )
    .unwrap();
    wait_for_listeners(&transport, 1).await;
    let mut snapshots = view.watch();

    transport.publish_ready(true);
    let first = wait_until(&mut snapshots, |s| s.state == ConsumerState::Ready)
        .await
        .handle
        .unwrap();
    assert!(first.uri.ends_with(".pdf"));
    assert_eq!(std::fs::read(&first.uri).unwrap(), pdf_body(1));

    transport.publish_ready(false);
    wait_until(&mut snapshots, |s| s.state == ConsumerState::AwaitingReady).await;
    transport.publish_ready(true);
    let second = wait_until(&mut snapshots, |s| {
        s.state == ConsumerState::Ready && s.handle.as_ref() != Some(&first)
    })
    .await
    .handle
    .unwrap();

    assert_eq!(std::fs::read(&second.uri).unwrap(), pdf_body(2));
    assert!(!std::path::Path::new(&first.uri).exists());
    assert_eq!(file_count(dir.path()), 1);

    assert_eq!(view.stop().await, 1);
    assert_eq!(file_count(dir.path()), 0);
}

async fn next(channel: &mut Channel) -> Option<ChannelMessage> {
    tokio::time::timeout(WAIT, channel.recv()).await.unwrap()
}

#[tokio::test]
async fn http_push_channel_delivers_events_then_reports_close() {
    let server = MockServer::start().await;
    let body = concat!(
        ": keep-alive\n\n",
        "data: ready\n\n",
        "event: job_update\n",
        "data: {\"task_id\": \"S1\", \"success\": true, \"total_jobs\": 0}\n\n",
    );
    Mock::given(method("GET"))
        .and(path("/api/events"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(body),
        )
        .mount(&server)
        .await;
    let (backend, _) = backend_for(&server);

    let manager = ChannelManager::new(
        Arc::new(backend.push_transport().unwrap()),
        ChannelConfig::default(),
    );
    let mut channel = manager.open();

    assert_eq!(
        next(&mut channel).await,
        Some(ChannelMessage::Event(ChannelEvent::Readiness { ready: true }))
    );
    match next(&mut channel).await {
        Some(ChannelMessage::Event(ChannelEvent::TaskCompletion(completion))) => {
            assert_eq!(completion.kind, TaskKind::JobSearch);
            assert_eq!(completion.task_id, TaskId::from("S1"));
            assert!(completion.success);
        }
        other => panic!("expected a job completion, got {other:?}"),
    }
    assert_eq!(
        next(&mut channel).await,
        Some(ChannelMessage::Error(ConnectionError::Closed))
    );
    assert_eq!(next(&mut channel).await, None);
    assert!(!channel.is_open());
    assert_eq!(channel.error_count(), 1);
}

#[tokio::test]
async fn rejected_push_endpoint_puts_view_in_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/events"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let (backend, config) = backend_for(&server);

    let view = DocumentView::start(
        &config,
        Arc::new(backend.push_transport().unwrap()),
        Arc::new(backend.document_source(DocumentParams::resume_pdf()).unwrap()),
        Arc::new(BlobRegistry::new()),
    )
    .unwrap();
    let mut notifications = view.subscribe_notifications();
    let mut snapshots = view.watch();

    let snapshot = wait_until(&mut snapshots, |s| s.state.is_error()).await;
    assert!(snapshot.handle.is_none());

    let notification = tokio::time::timeout(WAIT, notifications.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notification.level, NotificationLevel::Error);
    assert!(notification.description.contains("503"));
    view.stop().await;
}

#[tokio::test]
async fn job_search_result_is_cached_for_the_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/jobs/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "task_id": "S1" })))
        .expect(1)
        .mount(&server)
        .await;
    let (backend, config) = backend_for(&server);
    let transport = MemoryTransport::default();
    let cache = Arc::new(EphemeralCache::from_config(&config.cache));

    let view = TaskView::start(&config, Arc::new(transport.clone()), TaskKind::JobSearch)
        .unwrap()
        .with_cache(cache.clone(), "job_search_cache");
    wait_for_listeners(&transport, 1).await;
    let starter = Arc::new(JobSearchTask::new(backend, JobSearchRequest::default()));

    let outcome = view.begin(starter.clone()).await.unwrap();
    assert_eq!(outcome, BeginOutcome::Started(TaskId::from("S1")));

    transport.publish(SseFrame::named(
        "job_update",
        json!({ "task_id": "S1", "success": true, "jobs": [{"title": "Rust Engineer"}], "total_jobs": 1 })
            .to_string(),
    ));
    let mut snapshots = view.watch();
    wait_until(&mut snapshots, |s| s.state == TaskState::Completed).await;

    let outcome = view.begin(starter).await.unwrap();
    let BeginOutcome::Cached(result) = outcome else {
        panic!("expected a cached result, got {outcome:?}");
    };
    assert_eq!(result["jobs"][0]["title"], "Rust Engineer");
    assert!(cache.get("job_search_cache").await.is_some());
    view.stop().await;
}

#[tokio::test]
async fn cover_letter_failure_is_reported_verbatim() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/cover-letter/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "task_id": "T1" })))
        .mount(&server)
        .await;
    let (backend, config) = backend_for(&server);
    let transport = MemoryTransport::default();

    let view = TaskView::start(&config, Arc::new(transport.clone()), TaskKind::CoverLetter).unwrap();
    wait_for_listeners(&transport, 1).await;
    let mut notifications = view.subscribe_notifications();

    let request = CoverLetterRequest::for_job(Some("Rust"), Some("Acme"), Some("Engineer"), None);
    view.begin(Arc::new(CoverLetterTask::new(backend, request)))
        .await
        .unwrap();

    transport.publish(SseFrame::named(
        "cover_letter_update",
        json!({ "task_id": "T0", "success": false, "error": "someone else's failure" }).to_string(),
    ));
    transport.publish(SseFrame::named(
        "cover_letter_update",
        json!({ "task_id": "T1", "success": false, "error": "LLM quota exceeded" }).to_string(),
    ));

    let mut snapshots = view.watch();
    let snapshot = wait_until(&mut snapshots, |s| matches!(s.state, TaskState::Failed(_))).await;
    assert_eq!(snapshot.state, TaskState::Failed("LLM quota exceeded".into()));

    let notification = tokio::time::timeout(WAIT, notifications.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notification.title, "Generation Failed");
    assert_eq!(notification.description, "LLM quota exceeded");
    view.stop().await;
}

#[tokio::test]
async fn stopping_one_consumer_leaves_others_running() {
    let server = MockServer::start().await;
    mount_pdf_revisions(&server).await;
    let (backend, config) = backend_for(&server);
    let transport = MemoryTransport::default();
    let registry = Arc::new(BlobRegistry::new());

    let document = DocumentView::start(
        &config,
        Arc::new(transport.clone()),
        Arc::new(backend.document_source(DocumentParams::resume_pdf()).unwrap()),
        registry.clone(),
    )
    .unwrap();
    let letters = TaskView::start(&config, Arc::new(transport.clone()), TaskKind::CoverLetter).unwrap();
    wait_for_listeners(&transport, 2).await;

    transport.publish_ready(true);
    let mut snapshots = document.watch();
    wait_until(&mut snapshots, |s| s.state == ConsumerState::Ready).await;

    assert_eq!(document.stop().await, 1);
    assert_eq!(registry.live_count().await, 0);
    wait_for_listeners(&transport, 1).await;

    // Still listening: a ready ping no longer fetches anything, but completions flow
    transport.publish_ready(true);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
    assert_eq!(letters.snapshot().state, TaskState::Idle);
    letters.stop().await;
    wait_for_listeners(&transport, 0).await;
}
