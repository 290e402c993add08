//! Typed client for the resume backend.
//!
//! Wraps the request/response endpoints the synchronization subsystem consumes: the push
//! channel, compiled documents, and the start calls of background operations.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::channel::HttpPushTransport;
use crate::config::ApiConfig;
use crate::error::{Error, FetchError, Result, TaskFailure};
use crate::fetcher::{ArtifactFormat, HttpArtifactSource};
use crate::types::{TaskId, TaskKind};

#[allow(clippy::expect_used)]
static WHITESPACE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("literal pattern compiles"));

/// Representation of a compiled document
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    /// Rendered PDF
    Pdf,
    /// TeX source
    Tex,
}

impl FileType {
    /// Query-string value and file extension
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Pdf => "pdf",
            FileType::Tex => "tex",
        }
    }
}

/// Which compiled document to retrieve
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DocumentParams {
    /// PDF or TeX
    pub file_type: FileType,
    /// The cover letter rather than the resume
    pub cover_letter: bool,
    /// Ask for the raw file as an attachment
    pub download: bool,
}

impl DocumentParams {
    /// The resume rendered as PDF
    pub fn resume_pdf() -> Self {
        Self {
            file_type: FileType::Pdf,
            cover_letter: false,
            download: false,
        }
    }

    /// The resume's TeX source
    pub fn resume_tex() -> Self {
        Self {
            file_type: FileType::Tex,
            ..Self::resume_pdf()
        }
    }

    /// The cover letter in the given representation
    pub fn cover_letter(file_type: FileType) -> Self {
        Self {
            file_type,
            cover_letter: true,
            download: false,
        }
    }

    /// Same document, as a downloadable attachment
    pub fn as_download(self) -> Self {
        Self {
            download: true,
            ..self
        }
    }

    /// How the response body should be decoded
    pub fn format(&self) -> ArtifactFormat {
        match (self.file_type, self.download) {
            (FileType::Tex, false) => ArtifactFormat::SourceJson,
            _ => ArtifactFormat::Binary,
        }
    }
}

/// Body of `POST /api/cover-letter/generate`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverLetterRequest {
    /// Full job description
    pub job_description: String,
    /// Hiring company
    pub company: String,
    /// Position title
    pub title: String,
    /// Posting URL
    pub job_url: String,
}

impl CoverLetterRequest {
    /// Build a request, filling the same placeholders the web client uses for gaps
    pub fn for_job(
        description: Option<&str>,
        company: Option<&str>,
        title: Option<&str>,
        job_url: Option<&str>,
    ) -> Self {
        let non_empty = |s: Option<&str>| s.filter(|s| !s.trim().is_empty()).map(str::to_string);
        Self {
            job_description: non_empty(description).unwrap_or_default(),
            company: non_empty(company).unwrap_or_else(|| "the company".to_string()),
            title: non_empty(title).unwrap_or_else(|| "this position".to_string()),
            job_url: non_empty(job_url).unwrap_or_default(),
        }
    }
}

/// Body of `POST /api/jobs/search`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSearchRequest {
    /// Location filter
    pub location: String,
    /// Title to search for
    pub job_title: String,
    /// Maximum results
    pub max_results: u32,
    /// Job boards to query
    pub sites: Vec<String>,
}

impl Default for JobSearchRequest {
    fn default() -> Self {
        Self {
            location: "United States".to_string(),
            job_title: "software engineer".to_string(),
            max_results: 50,
            sites: ["indeed", "linkedin", "zip_recruiter", "google"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }
}

#[derive(Deserialize)]
struct TaskAck {
    task_id: TaskId,
}

#[derive(Deserialize)]
struct SkillsResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    skills: Vec<String>,
}

#[derive(Serialize)]
struct CoverLetterUpdate<'a> {
    tex_content: &'a str,
}

/// Starts a background operation and returns its correlation token
#[async_trait]
pub trait TaskStarter: Send + Sync {
    /// Kind of operation this starter launches
    fn kind(&self) -> TaskKind;

    /// Submit the operation
    async fn start(&self) -> Result<TaskId>;
}

/// HTTP client for the backend
#[derive(Clone, Debug)]
pub struct BackendClient {
    client: reqwest::Client,
    api: ApiConfig,
}

impl BackendClient {
    /// Create a client for the configured backend
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the base URL is invalid.
    pub fn new(api: ApiConfig) -> Result<Self> {
        api.events_url()?;
        Ok(Self {
            client: reqwest::Client::new(),
            api,
        })
    }

    /// Underlying HTTP client
    pub fn http(&self) -> &reqwest::Client {
        &self.client
    }

    /// Transport for the push channel
    pub fn push_transport(&self) -> Result<HttpPushTransport> {
        Ok(HttpPushTransport::new(
            self.client.clone(),
            self.api.events_url()?,
        ))
    }

    /// URL of a compiled document
    pub fn document_url(&self, params: DocumentParams) -> Result<url::Url> {
        let mut url = self.api.endpoint("/api/serve_pdf")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("file_type", params.file_type.as_str());
            if params.cover_letter {
                query.append_pair("cover_letter", "true");
            }
            if params.download {
                query.append_pair("download", "true");
            }
        }
        Ok(url)
    }

    /// Artifact source for a compiled document
    pub fn document_source(&self, params: DocumentParams) -> Result<HttpArtifactSource> {
        Ok(HttpArtifactSource::new(
            self.client.clone(),
            self.document_url(params)?,
            params.format(),
        ))
    }

    /// Start cover letter generation
    pub async fn generate_cover_letter(&self, request: &CoverLetterRequest) -> Result<TaskId> {
        self.start_task(TaskKind::CoverLetter, "/api/cover-letter/generate", request)
            .await
    }

    /// Replace the cover letter source and recompile it
    pub async fn update_cover_letter(&self, tex_content: &str) -> Result<()> {
        let url = self.api.endpoint("/api/cover-letter/update")?;
        let response = self
            .client
            .post(url.clone())
            .json(&CoverLetterUpdate { tex_content })
            .timeout(self.api.request_timeout)
            .send()
            .await?;
        ensure_success(&url, response.status())?;
        Ok(())
    }

    /// Start a job search
    pub async fn start_job_search(&self, request: &JobSearchRequest) -> Result<TaskId> {
        self.start_task(TaskKind::JobSearch, "/api/jobs/search", request)
            .await
    }

    /// Skills extracted from the current resume
    pub async fn resume_skills(&self) -> Result<Vec<String>> {
        let url = self.api.endpoint("/api/jobs/skills")?;
        let response = self
            .client
            .get(url.clone())
            .timeout(self.api.request_timeout)
            .send()
            .await?;
        ensure_success(&url, response.status())?;

        let body: SkillsResponse = response.json().await?;
        Ok(if body.success { body.skills } else { Vec::new() })
    }

    /// Download a compiled document into `dir`
    ///
    /// The file is named like the web client names downloads, e.g.
    /// `cover_letter_Acme_Corp.pdf`.
    pub async fn download_to(
        &self,
        params: DocumentParams,
        dir: &Path,
        company: Option<&str>,
    ) -> Result<PathBuf> {
        let url = self.document_url(params.as_download())?;
        let response = self
            .client
            .get(url.clone())
            .timeout(self.api.request_timeout)
            .send()
            .await?;
        ensure_success(&url, response.status())?;
        let bytes = response.bytes().await?;

        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(download_file_name(params, company));
        tokio::fs::write(&path, &bytes).await?;
        tracing::info!(path = %path.display(), bytes = bytes.len(), "document downloaded");
        Ok(path)
    }

    async fn start_task<B: Serialize + ?Sized>(
        &self,
        kind: TaskKind,
        path: &str,
        body: &B,
    ) -> Result<TaskId> {
        let url = self.api.endpoint(path)?;
        let start_failed = |message: String| {
            Error::Task(TaskFailure::StartFailed {
                kind: kind.clone(),
                message,
            })
        };

        let response = self
            .client
            .post(url)
            .json(body)
            .timeout(self.api.request_timeout)
            .send()
            .await
            .map_err(|e| start_failed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(start_failed(format!(
                "backend returned status {}",
                response.status()
            )));
        }

        let ack: TaskAck = response
            .json()
            .await
            .map_err(|e| start_failed(format!("invalid acknowledgment: {e}")))?;
        tracing::info!(kind = %kind, task_id = %ack.task_id, "background task submitted");
        Ok(ack.task_id)
    }
}

fn ensure_success(url: &url::Url, status: reqwest::StatusCode) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else {
        Err(FetchError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        }
        .into())
    }
}

/// File name for a downloaded document
pub fn download_file_name(params: DocumentParams, company: Option<&str>) -> String {
    let ext = params.file_type.as_str();
    if !params.cover_letter {
        return format!("resume.{ext}");
    }
    let company = company
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(|c| WHITESPACE_RUN.replace_all(c, "_").into_owned())
        .unwrap_or_else(|| "job".to_string());
    format!("cover_letter_{company}.{ext}")
}

/// Starts cover letter generation for one job
pub struct CoverLetterTask {
    client: BackendClient,
    request: CoverLetterRequest,
}

impl CoverLetterTask {
    /// Create a starter
    pub fn new(client: BackendClient, request: CoverLetterRequest) -> Self {
        Self { client, request }
    }
}

#[async_trait]
impl TaskStarter for CoverLetterTask {
    fn kind(&self) -> TaskKind {
        TaskKind::CoverLetter
    }

    async fn start(&self) -> Result<TaskId> {
        self.client.generate_cover_letter(&self.request).await
    }
}

/// Starts a job search
pub struct JobSearchTask {
    client: BackendClient,
    request: JobSearchRequest,
}

impl JobSearchTask {
    /// Create a starter
    pub fn new(client: BackendClient, request: JobSearchRequest) -> Self {
        Self { client, request }
    }
}

#[async_trait]
impl TaskStarter for JobSearchTask {
    fn kind(&self) -> TaskKind {
        TaskKind::JobSearch
    }

    async fn start(&self) -> Result<TaskId> {
        self.client.start_job_search(&self.request).await
    }
}
