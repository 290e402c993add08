//! Server-sent event frames decoded from a `text/event-stream` body.

use eventsource_stream::{Event, Eventsource};
use futures::future;
use futures::stream::{BoxStream, Stream, StreamExt};

use crate::error::ConnectionError;

/// One dispatched server-sent event
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SseFrame {
    /// `event:` field; `None` for unlabeled messages
    pub event: Option<String>,
    /// `data:` lines joined with `\n`
    pub data: String,
    /// `id:` field
    pub id: Option<String>,
}

impl SseFrame {
    /// Unlabeled message
    pub fn message(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
            id: None,
        }
    }

    /// Labeled event
    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
            id: None,
        }
    }
}

impl From<Event> for SseFrame {
    // The decoder labels unlabeled messages "message"; frames keep them unlabeled
    fn from(event: Event) -> Self {
        Self {
            event: Some(event.event).filter(|e| !e.is_empty() && e != "message"),
            data: event.data,
            id: Some(event.id).filter(|id| !id.is_empty()),
        }
    }
}

/// Decode a byte stream into frames
///
/// The first stream or parse error is yielded once as [`ConnectionError::Dropped`] and
/// ends the output. Retry hints in the body are ignored.
pub fn decode_stream<S, B, E>(bytes: S) -> BoxStream<'static, Result<SseFrame, ConnectionError>>
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    bytes
        .boxed()
        .eventsource()
        .scan(false, |failed, item| {
            if *failed {
                return future::ready(None);
            }
            let item = item.map(SseFrame::from).map_err(|e| {
                *failed = true;
                ConnectionError::Dropped(e.to_string())
            });
            future::ready(Some(item))
        })
        .boxed()
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: &[&str]) -> Vec<Result<Vec<u8>, String>> {
        parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect()
    }

    #[tokio::test]
    async fn unlabeled_message_has_no_event_name() {
        let items: Vec<_> = decode_stream(futures::stream::iter(chunks(&["data: ready\n\n"])))
            .collect()
            .await;

        assert_eq!(items, vec![Ok(SseFrame::message("ready"))]);
    }

    #[tokio::test]
    async fn labeled_event_keeps_name_and_id() {
        let body = "id: 7\nevent: job_update\ndata: {\"task_id\":\"T1\"}\n\n";

        let items: Vec<_> = decode_stream(futures::stream::iter(chunks(&[body])))
            .collect()
            .await;

        let frame = items[0].as_ref().unwrap();
        assert_eq!(frame.event.as_deref(), Some("job_update"));
        assert_eq!(frame.data, r#"{"task_id":"T1"}"#);
        assert_eq!(frame.id.as_deref(), Some("7"));
    }

    #[tokio::test]
    async fn keep_alive_comments_are_skipped() {
        let parts = [": keep-alive\n\n", "event: cover_le", "tter_update\r\ndata: {}\r\n\r\n"];

        let items: Vec<_> = decode_stream(futures::stream::iter(chunks(&parts)))
            .collect()
            .await;

        assert_eq!(items, vec![Ok(SseFrame::named("cover_letter_update", "{}"))]);
    }

    #[tokio::test]
    async fn yields_frames_then_single_error() {
        let parts: Vec<Result<Vec<u8>, String>> = vec![
            Ok(b"data: ready\n\nda".to_vec()),
            Ok(b"ta: compiling\n\n".to_vec()),
            Err("connection reset".to_string()),
            Ok(b"data: never\n\n".to_vec()),
        ];

        let items: Vec<_> = decode_stream(futures::stream::iter(parts)).collect().await;

        assert_eq!(items.len(), 3);
        assert_eq!(items[0], Ok(SseFrame::message("ready")));
        assert_eq!(items[1], Ok(SseFrame::message("compiling")));
        assert!(
            matches!(&items[2], Err(ConnectionError::Dropped(reason)) if reason.contains("connection reset"))
        );
    }
}
