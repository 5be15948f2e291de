use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;

use crate::{FileError, Result};

/// Result of handing a payload to the file handler.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadReceipt {
    pub url: String,
    #[serde(default)]
    pub gcs: Option<String>,
    pub hash: String,
}

/// Moves file payloads to and from storage.
///
/// The production implementation talks to the file-handler collaborator;
/// tests use [`MemoryTransfer`].
#[async_trait]
pub trait FileTransfer: Send + Sync {
    /// Upload content, returning where it landed.
    async fn upload(&self, content: &str, filename: &str, hash: &str, context_id: Option<&str>)
    -> Result<UploadReceipt>;

    /// Fetch content back by URL.
    async fn download(&self, url: &str) -> Result<String>;

    /// Remove content by URL. Best effort; failures are logged by callers.
    async fn delete(&self, url: &str) -> Result<()>;
}

/// Client for the `POST /api/CortexFileHandler` collaborator protocol:
/// multipart upload with `file`, optional `hash` and `contextId`, answered
/// by `{url, gcs?, hash}`.
pub struct FileHandlerClient {
    base_url: String,
    client: reqwest::Client,
}

impl FileHandlerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl FileTransfer for FileHandlerClient {
    async fn upload(
        &self,
        content: &str,
        filename: &str,
        hash: &str,
        context_id: Option<&str>,
    ) -> Result<UploadReceipt> {
        let part = reqwest::multipart::Part::bytes(content.as_bytes().to_vec()).file_name(filename.to_string());

        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("hash", hash.to_string());

        if let Some(context_id) = context_id {
            form = form.text("contextId", context_id.to_string());
        }

        let response = self
            .client
            .post(&self.base_url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| FileError::Handler(format!("upload failed: {e}")))?;

        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "<empty response>".to_string());
            log::error!("file handler upload failed ({status}): {body}");
            return Err(FileError::Handler(format!("upload failed with status {status}")));
        }

        response
            .json()
            .await
            .map_err(|e| FileError::Handler(format!("malformed upload response: {e}")))
    }

    async fn download(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FileError::Handler(format!("download failed: {e}")))?;

        if !response.status().is_success() {
            return Err(FileError::Handler(format!(
                "download failed with status {}",
                response.status()
            )));
        }

        response
            .text()
            .await
            .map_err(|e| FileError::Handler(format!("download failed: {e}")))
    }

    async fn delete(&self, url: &str) -> Result<()> {
        self.client
            .delete(url)
            .send()
            .await
            .map_err(|e| FileError::Handler(format!("delete failed: {e}")))?;

        Ok(())
    }
}

/// In-memory transfer for tests: URLs are synthetic, payloads live in a map.
#[derive(Debug, Default)]
pub struct MemoryTransfer {
    payloads: DashMap<String, String>,
    counter: std::sync::atomic::AtomicU64,
    /// When set, the next upload fails; used to exercise the
    /// upload-new-then-delete-old protocol.
    fail_next_upload: std::sync::atomic::AtomicBool,
}

impl MemoryTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next upload fail.
    pub fn fail_next_upload(&self) {
        self.fail_next_upload.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Whether a payload is still reachable at the URL.
    pub fn contains(&self, url: &str) -> bool {
        self.payloads.contains_key(url)
    }
}

#[async_trait]
impl FileTransfer for MemoryTransfer {
    async fn upload(
        &self,
        content: &str,
        filename: &str,
        hash: &str,
        _context_id: Option<&str>,
    ) -> Result<UploadReceipt> {
        if self.fail_next_upload.swap(false, std::sync::atomic::Ordering::SeqCst) {
            return Err(FileError::Handler("simulated upload failure".to_string()));
        }

        let serial = self.counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let url = format!("memory://{serial}/{filename}");
        self.payloads.insert(url.clone(), content.to_string());

        Ok(UploadReceipt {
            url,
            gcs: None,
            hash: hash.to_string(),
        })
    }

    async fn download(&self, url: &str) -> Result<String> {
        self.payloads
            .get(url)
            .map(|payload| payload.clone())
            .ok_or_else(|| FileError::NotFound(url.to_string()))
    }

    async fn delete(&self, url: &str) -> Result<()> {
        self.payloads.remove(url);
        Ok(())
    }
}
