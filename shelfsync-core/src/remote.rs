//! Thin, retry-naive contract over the managed search backend.
//!
//! Retries live in the Orchestrator, not here: every method either succeeds
//! or returns a [`CoreError`] classified as transient or permanent, and the
//! caller decides what to do about it.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::{CoreError, Result};

/// A document reference as returned by [`RemoteClient::list_store_documents`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub doc_id: String,
    pub display_name: String,
}

/// Outcome of a document visibility probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStatus {
    Present,
    NotFound,
}

/// Handle to an in-flight import operation, returned by
/// [`RemoteClient::import_into_store`] and polled by
/// [`RemoteClient::await_operation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationHandle(pub String);

/// Contract over the remote search backend. Implementations must satisfy:
/// `display_name` is echoed verbatim (leading whitespace trimmed by the
/// caller before the call reaches here),
/// deletes are idempotent (404-equivalent counts as success), and document
/// identifiers follow the `<12-char-prefix>-<suffix>` form.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteClient: Send + Sync + std::fmt::Debug {
    async fn upload_raw(&self, bytes: Vec<u8>, display_name: &str) -> Result<String>;

    async fn import_into_store(&self, raw_id: &str, store: &str) -> Result<OperationHandle>;

    async fn await_operation(&self, op: &OperationHandle, timeout: Duration) -> Result<String>;

    async fn get_document(&self, store: &str, doc_id: &str) -> Result<DocumentStatus>;

    async fn list_store_documents(&self, store: &str) -> Result<Vec<DocumentRef>>;

    async fn delete_document(&self, store: &str, doc_name: &str) -> Result<()>;

    async fn delete_raw(&self, raw_id: &str) -> Result<()>;

    async fn resolve_store(&self, name_or_resource: &str) -> Result<String>;
}

/// A retrieved document identifier embeds the raw-artifact id as its first
/// 12 characters, `-`-separated from a backend-assigned suffix. Every
/// lookup that needs this derivation must call this helper rather than
/// re-deriving the split locally.
pub fn split_doc_id(remote_doc_id: &str) -> (&str, &str) {
    match remote_doc_id.split_once('-') {
        Some((prefix, suffix)) => (prefix, suffix),
        None => (remote_doc_id, ""),
    }
}

/// HTTPS client SDK implementation, speaking a generic JSON HTTP API against
/// the configured backend base URL.
#[derive(Debug, Clone)]
pub struct HttpRemoteClient {
    http: Client,
    base_url: String,
    api_key: String,
}

#[derive(Serialize)]
struct ImportRequest<'a> {
    raw_id: &'a str,
    store: &'a str,
}

#[derive(Deserialize)]
struct ImportResponse {
    operation_name: String,
}

#[derive(Deserialize)]
struct OperationStatus {
    done: bool,
    #[serde(default)]
    response: Option<OperationResult>,
}

#[derive(Deserialize)]
struct OperationResult {
    document_name: String,
}

#[derive(Deserialize)]
struct ListDocumentsResponse {
    #[serde(default)]
    documents: Vec<RawDocument>,
}

#[derive(Deserialize)]
struct RawDocument {
    name: String,
    display_name: String,
}

impl HttpRemoteClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
        })
    }

    fn classify_status(&self, status: StatusCode, body: String) -> CoreError {
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            CoreError::RemoteTransient {
                status: status.as_u16(),
                body,
            }
        } else {
            CoreError::RemotePermanent {
                status: status.as_u16(),
                body,
            }
        }
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    #[instrument(skip(self, bytes))]
    async fn upload_raw(&self, bytes: Vec<u8>, display_name: &str) -> Result<String> {
        // Leading whitespace on display_name has been observed to hang the
        // backend; trailing whitespace is safe and left alone.
        let trimmed = display_name.trim_start();
        let response = self
            .http
            .post(format!("{}/v1/raw:upload", self.base_url))
            .bearer_auth(&self.api_key)
            .query(&[("display_name", trimmed)])
            .body(bytes)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.classify_status(status, body));
        }
        #[derive(Deserialize)]
        struct UploadResponse {
            name: String,
        }
        let parsed: UploadResponse = response.json().await?;
        Ok(parsed.name)
    }

    #[instrument(skip(self))]
    async fn import_into_store(&self, raw_id: &str, store: &str) -> Result<OperationHandle> {
        let response = self
            .http
            .post(format!("{}/v1/{store}/documents:import", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&ImportRequest { raw_id, store })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.classify_status(status, body));
        }
        let parsed: ImportResponse = response.json().await?;
        Ok(OperationHandle(parsed.operation_name))
    }

    #[instrument(skip(self))]
    async fn await_operation(&self, op: &OperationHandle, timeout: Duration) -> Result<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut backoff = Duration::from_millis(500);
        loop {
            let response = self
                .http
                .get(format!("{}/v1/{}", self.base_url, op.0))
                .bearer_auth(&self.api_key)
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(self.classify_status(status, body));
            }
            let parsed: OperationStatus = response.json().await?;
            if parsed.done {
                return parsed
                    .response
                    .map(|r| r.document_name)
                    .ok_or_else(|| CoreError::Internal(format!("operation {} done with no result", op.0)));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CoreError::Timeout(format!("operation {} did not complete in time", op.0)));
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff.mul_f32(1.5)).min(Duration::from_secs(10));
        }
    }

    #[instrument(skip(self))]
    async fn get_document(&self, store: &str, doc_id: &str) -> Result<DocumentStatus> {
        let response = self
            .http
            .get(format!("{}/v1/{store}/documents/{doc_id}", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        match response.status() {
            StatusCode::OK => Ok(DocumentStatus::Present),
            StatusCode::NOT_FOUND => Ok(DocumentStatus::NotFound),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(self.classify_status(status, body))
            }
        }
    }

    #[instrument(skip(self))]
    async fn list_store_documents(&self, store: &str) -> Result<Vec<DocumentRef>> {
        let response = self
            .http
            .get(format!("{}/v1/{store}/documents", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.classify_status(status, body));
        }
        let parsed: ListDocumentsResponse = response.json().await?;
        Ok(parsed
            .documents
            .into_iter()
            .map(|d| DocumentRef {
                doc_id: d.name,
                display_name: d.display_name,
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn delete_document(&self, store: &str, doc_name: &str) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/v1/{store}/documents/{doc_name}", self.base_url))
            .query(&[("force", "true")])
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            debug!(doc_name, "document delete idempotent success");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(self.classify_status(status, body))
    }

    #[instrument(skip(self))]
    async fn delete_raw(&self, raw_id: &str) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/v1/{raw_id}", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(self.classify_status(status, body))
    }

    #[instrument(skip(self))]
    async fn resolve_store(&self, name_or_resource: &str) -> Result<String> {
        if name_or_resource.starts_with("stores/") {
            return Ok(name_or_resource.to_string());
        }
        Ok(format!("stores/{name_or_resource}"))
    }
}
