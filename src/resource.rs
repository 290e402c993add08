//! Local resource handles for fetched binary artifacts
//!
//! A [`ResourceStore`] turns a payload into a locally addressable handle and releases it
//! again. [`ResourceSlot`] enforces the per-consumer rules:
//! - at most one valid handle per [`ResourceKind`]
//! - a replacement is created before the previous handle is released, so there is never
//!   a moment with zero valid handles
//! - every handle is released exactly once, on replacement or on teardown

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// What a handle is used for; a consumer holds at most one handle per kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Rendered document (PDF)
    Document,
    /// Document source (TeX)
    Source,
    /// One-off download
    Download,
}

impl ResourceKind {
    fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Document => "document",
            ResourceKind::Source => "source",
            ResourceKind::Download => "download",
        }
    }
}

/// Opaque reference to a materialized payload
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceHandle {
    /// Kind of resource
    pub kind: ResourceKind,
    /// Locally resolvable address (`blob:` URI or file path)
    pub uri: String,
    /// Payload size in bytes
    pub size: usize,
}

/// Creates and releases local handles
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Materialize `payload` and return a handle to it
    async fn create(
        &self,
        kind: ResourceKind,
        payload: &[u8],
        content_type: Option<&str>,
    ) -> Result<ResourceHandle>;

    /// Release a handle; releasing an unknown or already-released handle is an error
    async fn release(&self, handle: &ResourceHandle) -> Result<()>;
}

/// In-memory registry of `blob:` URIs
#[derive(Debug, Default)]
pub struct BlobRegistry {
    next_id: AtomicU64,
    blobs: Mutex<HashMap<String, Arc<[u8]>>>,
    released: AtomicU64,
}

impl BlobRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Payload behind a live URI
    pub async fn resolve(&self, uri: &str) -> Option<Arc<[u8]>> {
        self.blobs.lock().await.get(uri).cloned()
    }

    /// Number of handles currently valid
    pub async fn live_count(&self) -> usize {
        self.blobs.lock().await.len()
    }

    /// Number of successful releases so far
    pub fn released_count(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceStore for BlobRegistry {
    async fn create(
        &self,
        kind: ResourceKind,
        payload: &[u8],
        _content_type: Option<&str>,
    ) -> Result<ResourceHandle> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let uri = format!("blob:artifact-sync/{}/{}", kind.as_str(), id);
        self.blobs
            .lock()
            .await
            .insert(uri.clone(), Arc::from(payload));
        Ok(ResourceHandle {
            kind,
            uri,
            size: payload.len(),
        })
    }

    async fn release(&self, handle: &ResourceHandle) -> Result<()> {
        if self.blobs.lock().await.remove(&handle.uri).is_none() {
            return Err(Error::Resource(format!(
                "handle {} is not live (double release?)",
                handle.uri
            )));
        }
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Materializes payloads as files in a directory
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    next_id: AtomicU64,
}

impl FileStore {
    /// Create a store writing into `dir` (created on first use)
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Directory the store writes into
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn extension_for(content_type: Option<&str>) -> &'static str {
    let essence = content_type
        .and_then(|ct| ct.split(';').next())
        .map(str::trim)
        .unwrap_or_default();
    match essence {
        "application/pdf" => "pdf",
        "application/x-tex" | "text/x-tex" => "tex",
        "application/json" => "json",
        e if e.starts_with("text/") => "txt",
        _ => "bin",
    }
}

#[async_trait]
impl ResourceStore for FileStore {
    async fn create(
        &self,
        kind: ResourceKind,
        payload: &[u8],
        content_type: Option<&str>,
    ) -> Result<ResourceHandle> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let path = self.dir.join(format!(
            "{}-{}.{}",
            kind.as_str(),
            id,
            extension_for(content_type)
        ));
        tokio::fs::write(&path, payload).await?;

        Ok(ResourceHandle {
            kind,
            uri: path.to_string_lossy().into_owned(),
            size: payload.len(),
        })
    }

    async fn release(&self, handle: &ResourceHandle) -> Result<()> {
        tokio::fs::remove_file(&handle.uri).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::Resource(format!("handle {} is not live (double release?)", handle.uri))
            } else {
                Error::Io(e)
            }
        })
    }
}

/// The handles one consumer currently holds
pub struct ResourceSlot {
    store: Arc<dyn ResourceStore>,
    held: HashMap<ResourceKind, ResourceHandle>,
    closed: bool,
}

impl ResourceSlot {
    /// Create an empty slot over `store`
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self {
            store,
            held: HashMap::new(),
            closed: false,
        }
    }

    /// Handle currently held for `kind`
    pub fn current(&self, kind: ResourceKind) -> Option<&ResourceHandle> {
        self.held.get(&kind)
    }

    /// Materialize `payload` as the new handle for `kind`
    ///
    /// The previous handle of that kind is released only after the new one exists. If
    /// creation fails the previous handle stays valid and is returned untouched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Stopped`] after [`release_all`](Self::release_all), or the
    /// store's error if creation fails.
    pub async fn adopt(
        &mut self,
        kind: ResourceKind,
        payload: &[u8],
        content_type: Option<&str>,
    ) -> Result<ResourceHandle> {
        if self.closed {
            return Err(Error::Stopped);
        }

        let fresh = self.store.create(kind, payload, content_type).await?;
        if let Some(previous) = self.held.insert(kind, fresh.clone()) {
            if let Err(e) = self.store.release(&previous).await {
                tracing::warn!(uri = %previous.uri, error = %e, "failed to release superseded resource");
            }
        }
        tracing::debug!(uri = %fresh.uri, size = fresh.size, "resource adopted");
        Ok(fresh)
    }

    /// Release every held handle exactly once; later calls do nothing
    pub async fn release_all(&mut self) -> usize {
        self.closed = true;
        let mut released = 0;
        for (_, handle) in self.held.drain() {
            match self.store.release(&handle).await {
                Ok(()) => released += 1,
                Err(e) => {
                    tracing::warn!(uri = %handle.uri, error = %e, "failed to release resource")
                }
            }
        }
        released
    }
}
