//! Artifact retrieval
//!
//! [`ArtifactSource`] performs one retrieval. [`FetchSlot`] runs at most one retrieval at
//! a time for a consumer, tags each with the [`FetchTicket`] the readiness machine
//! issued, and only hands back results that are still wanted: the consumer's
//! [`Lifetime`] must be live and the ticket must be the current one.
//!
//! There are no automatic retries; a retry is a new ticket.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::FetchError;
use crate::lifetime::Lifetime;
use crate::readiness::FetchTicket;

/// How a response body is interpreted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ArtifactFormat {
    /// Raw bytes (compiled PDF)
    #[default]
    Binary,
    /// JSON envelope `{ "code": "..." }` holding document source
    SourceJson,
    /// Arbitrary JSON (query results)
    Json,
}

/// A retrieved artifact
#[derive(Clone, Debug, PartialEq)]
pub enum Artifact {
    /// Binary rendering
    Binary {
        /// Response body
        bytes: Vec<u8>,
        /// `Content-Type` header, if present
        content_type: Option<String>,
    },
    /// Document source text
    Source(String),
    /// JSON document
    Json(Value),
}

impl Artifact {
    /// Raw bytes of the artifact, for materializing as a local resource
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Artifact::Binary { bytes, .. } => bytes.clone(),
            Artifact::Source(text) => text.as_bytes().to_vec(),
            Artifact::Json(value) => value.to_string().into_bytes(),
        }
    }

    /// Text form, when the artifact is textual
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Artifact::Source(text) => Some(text),
            Artifact::Binary { .. } | Artifact::Json(_) => None,
        }
    }
}

/// Performs one artifact retrieval
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Retrieve the artifact
    async fn fetch(&self) -> Result<Artifact, FetchError>;

    /// Source description for logs
    fn describe(&self) -> String;
}

#[derive(Deserialize)]
struct SourceEnvelope {
    code: String,
}

/// Retrieves an artifact with an uncached HTTP `GET`
#[derive(Clone, Debug)]
pub struct HttpArtifactSource {
    client: reqwest::Client,
    url: url::Url,
    format: ArtifactFormat,
}

impl HttpArtifactSource {
    /// Create a source for `url`
    pub fn new(client: reqwest::Client, url: url::Url, format: ArtifactFormat) -> Self {
        Self {
            client,
            url,
            format,
        }
    }

    /// The artifact URL
    pub fn url(&self) -> &url::Url {
        &self.url
    }
}

#[async_trait]
impl ArtifactSource for HttpArtifactSource {
    async fn fetch(&self) -> Result<Artifact, FetchError> {
        let url = self.url.to_string();
        let network = |e: reqwest::Error| FetchError::Network {
            url: url.clone(),
            message: e.to_string(),
        };

        let response = self
            .client
            .get(self.url.clone())
            .header(reqwest::header::CACHE_CONTROL, "no-store")
            .send()
            .await
            .map_err(network)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.clone(),
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await.map_err(network)?;
        let decode = |e: serde_json::Error| FetchError::Decode {
            url: url.clone(),
            message: e.to_string(),
        };

        let artifact = match self.format {
            ArtifactFormat::Binary => Artifact::Binary {
                bytes: bytes.to_vec(),
                content_type,
            },
            ArtifactFormat::SourceJson => {
                let envelope: SourceEnvelope = serde_json::from_slice(&bytes).map_err(decode)?;
                Artifact::Source(envelope.code)
            }
            ArtifactFormat::Json => Artifact::Json(serde_json::from_slice(&bytes).map_err(decode)?),
        };

        tracing::debug!(url = %self.url, bytes = bytes.len(), "artifact fetched");
        Ok(artifact)
    }

    fn describe(&self) -> String {
        self.url.to_string()
    }
}

/// Result of one fetch
#[derive(Debug)]
pub struct FetchOutcome {
    /// Ticket the fetch was issued under
    pub ticket: FetchTicket,
    /// What the source returned
    pub result: Result<Artifact, FetchError>,
}

/// Runs a consumer's fetches one at a time
pub struct FetchSlot {
    source: Arc<dyn ArtifactSource>,
    lifetime: Lifetime,
    tx: mpsc::UnboundedSender<FetchOutcome>,
    rx: mpsc::UnboundedReceiver<FetchOutcome>,
    in_flight: Option<(FetchTicket, JoinHandle<()>)>,
}

impl FetchSlot {
    /// Create a slot bound to a consumer lifetime
    pub fn new(source: Arc<dyn ArtifactSource>, lifetime: Lifetime) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            source,
            lifetime,
            tx,
            rx,
            in_flight: None,
        }
    }

    /// Ticket of the fetch in flight
    pub fn in_flight(&self) -> Option<FetchTicket> {
        self.in_flight.as_ref().map(|(ticket, _)| *ticket)
    }

    /// Start a fetch under `ticket`, aborting any fetch still in flight
    pub fn start(&mut self, ticket: FetchTicket) {
        self.cancel();
        if !self.lifetime.is_live() {
            return;
        }

        let source = self.source.clone();
        let lifetime = self.lifetime.clone();
        let tx = self.tx.clone();
        tracing::debug!(
            fetch = ticket.sequence(),
            source = %source.describe(),
            "fetching artifact"
        );

        let handle = tokio::spawn(async move {
            let result = source.fetch().await;
            if let Some(outcome) = lifetime.admit(FetchOutcome { ticket, result }) {
                tx.send(outcome).ok();
            }
        });
        self.in_flight = Some((ticket, handle));
    }

    /// Abort the fetch in flight, if any
    pub fn cancel(&mut self) {
        if let Some((ticket, handle)) = self.in_flight.take() {
            handle.abort();
            tracing::debug!(fetch = ticket.sequence(), "fetch superseded");
        }
    }

    /// Wait for the next outcome that is still wanted
    ///
    /// Outcomes for superseded tickets, or any outcome after the lifetime ended, are
    /// dropped here. Pends forever when nothing is in flight.
    pub async fn next(&mut self) -> FetchOutcome {
        loop {
            let Some(outcome) = self.rx.recv().await else {
                return std::future::pending().await;
            };
            if let Some(outcome) = self.accept(outcome) {
                return outcome;
            }
        }
    }

    fn accept(&mut self, outcome: FetchOutcome) -> Option<FetchOutcome> {
        let outcome = self.lifetime.admit(outcome)?;
        if self.in_flight() != Some(outcome.ticket) {
            tracing::debug!(fetch = outcome.ticket.sequence(), "discarding stale fetch result");
            return None;
        }
        self.in_flight = None;
        Some(outcome)
    }
}

impl Drop for FetchSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}
