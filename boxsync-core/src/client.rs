use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://api.boxsync.io";

/// Payloads at or above this size go through an upload session instead of a
/// single request.
const DEFAULT_SESSION_THRESHOLD: u64 = 150 * 1024 * 1024;
const SESSION_CHUNK_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

impl RemoteError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            RemoteError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Api { .. } => matches!(
                self.classification(),
                Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
            ),
            // Connection-level failures are worth another attempt.
            RemoteError::Request(_) => true,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RemoteError::Api {
                status: StatusCode::NOT_FOUND,
                ..
            }
        )
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(status, StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT)
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

/// One entry in a listing or change feed. The wire form is a tagged union;
/// deleted markers only appear in change feeds.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RemoteEntry {
    File {
        id: String,
        path: String,
        name: String,
        size: u64,
        modified: String,
    },
    Folder {
        id: String,
        path: String,
        name: String,
    },
    Deleted {
        path: String,
    },
}

impl RemoteEntry {
    pub fn path(&self) -> &str {
        match self {
            RemoteEntry::File { path, .. }
            | RemoteEntry::Folder { path, .. }
            | RemoteEntry::Deleted { path } => path,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            RemoteEntry::File { id, .. } | RemoteEntry::Folder { id, .. } => Some(id),
            RemoteEntry::Deleted { .. } => None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ListPage {
    pub entries: Vec<RemoteEntry>,
    pub cursor: String,
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct SpaceUsage {
    pub total: u64,
    pub used: u64,
}

#[derive(Debug, Deserialize)]
struct UploadSession {
    session_id: String,
}

#[derive(Clone)]
pub struct RemoteClient {
    http: Client,
    base_url: Url,
    token: String,
    session_threshold: u64,
}

impl RemoteClient {
    pub fn new(token: impl Into<String>) -> Result<Self, RemoteError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, RemoteError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
            session_threshold: DEFAULT_SESSION_THRESHOLD,
        })
    }

    /// Lowers the session threshold; used by tests to exercise chunked uploads
    /// without multi-gigabyte fixtures.
    pub fn with_session_threshold(mut self, threshold: u64) -> Self {
        self.session_threshold = threshold;
        self
    }

    pub async fn list_folder(&self, path: &str, recursive: bool) -> Result<ListPage, RemoteError> {
        let mut url = self.endpoint("/v1/files/list")?;
        url.query_pairs_mut()
            .append_pair("path", path)
            .append_pair("recursive", if recursive { "true" } else { "false" });
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn get_changes(&self, cursor: &str) -> Result<ListPage, RemoteError> {
        let mut url = self.endpoint("/v1/files/changes")?;
        url.query_pairs_mut().append_pair("cursor", cursor);
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn get_metadata(&self, path: &str) -> Result<RemoteEntry, RemoteError> {
        let mut url = self.endpoint("/v1/files/metadata")?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Streams a file's content to `target`, writing through a `.partial`
    /// sibling so a failed transfer never leaves a torn file behind.
    pub async fn download(&self, remote_path: &str, target: &Path) -> Result<(), RemoteError> {
        let mut url = self.endpoint("/v1/files/content")?;
        url.query_pairs_mut().append_pair("path", remote_path);
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Api { status, body });
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(target);
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        tokio::fs::rename(partial, target).await?;
        Ok(())
    }

    /// Uploads `source` to `remote_path`. Large payloads are sent through an
    /// upload session in fixed-size chunks; the split is invisible to callers.
    pub async fn upload(
        &self,
        source: &Path,
        remote_path: &str,
        overwrite: bool,
    ) -> Result<RemoteEntry, RemoteError> {
        let size = tokio::fs::metadata(source).await?.len();
        if size >= self.session_threshold {
            return self.upload_session(source, remote_path, overwrite).await;
        }

        let mut url = self.endpoint("/v1/files/content")?;
        url.query_pairs_mut()
            .append_pair("path", remote_path)
            .append_pair("overwrite", if overwrite { "true" } else { "false" });
        let file = tokio::fs::File::open(source).await?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let response = self
            .http
            .put(url)
            .header("Authorization", self.auth_header_value())
            .body(body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn upload_session(
        &self,
        source: &Path,
        remote_path: &str,
        overwrite: bool,
    ) -> Result<RemoteEntry, RemoteError> {
        let url = self.endpoint("/v1/files/sessions")?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        let session: UploadSession = Self::handle_response(response).await?;

        let mut file = tokio::fs::File::open(source).await?;
        let mut offset = 0u64;
        let mut buf = vec![0u8; SESSION_CHUNK_SIZE];
        loop {
            let read = file.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            let mut url =
                self.endpoint(&format!("/v1/files/sessions/{}", session.session_id))?;
            url.query_pairs_mut()
                .append_pair("offset", &offset.to_string());
            let response = self
                .http
                .put(url)
                .header("Authorization", self.auth_header_value())
                .body(buf[..read].to_vec())
                .send()
                .await?;
            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(RemoteError::Api { status, body });
            }
            offset += read as u64;
        }

        let mut url =
            self.endpoint(&format!("/v1/files/sessions/{}/commit", session.session_id))?;
        url.query_pairs_mut()
            .append_pair("path", remote_path)
            .append_pair("overwrite", if overwrite { "true" } else { "false" });
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn create_folder(&self, path: &str) -> Result<RemoteEntry, RemoteError> {
        let mut url = self.endpoint("/v1/folders")?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self
            .http
            .put(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), RemoteError> {
        let mut url = self.endpoint("/v1/files")?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self
            .http
            .delete(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::Api { status, body })
    }

    pub async fn move_entry(&self, from: &str, to: &str) -> Result<RemoteEntry, RemoteError> {
        let mut url = self.endpoint("/v1/files/move")?;
        url.query_pairs_mut()
            .append_pair("from", from)
            .append_pair("path", to);
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn space_usage(&self) -> Result<SpaceUsage, RemoteError> {
        let url = self.endpoint("/v1/space")?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, RemoteError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(RemoteError::Api { status, body })
        }
    }
}

fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}
