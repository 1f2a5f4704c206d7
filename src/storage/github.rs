//! Blob store backed by a directory of a GitHub repository, driven through
//! the repository contents REST API.
//!
//! Reads (directory listing, file metadata, raw content) are idempotent and
//! retried with exponential backoff on transient failures. Writes are sent
//! exactly once.

use std::time::Duration;

use base64::Engine;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, header};
use serde::Deserialize;
use serde_json::json;
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

use crate::config::GitHubConfig;
use crate::error::StoreError;
use crate::storage::{BlobEntry, BlobRemoval, BlobStore};

const USER_AGENT: &str = concat!("image-host/", env!("CARGO_PKG_VERSION"));
const ACCEPT_JSON: &str = "application/vnd.github+json";
const ACCEPT_RAW: &str = "application/vnd.github.raw+json";
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Deserialize)]
struct ContentEntry {
    name: String,
    sha: String,
    #[serde(default)]
    size: u64,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    html_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    content: Option<CommittedFile>,
}

#[derive(Debug, Deserialize)]
struct CommittedFile {
    #[serde(default)]
    html_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitHubErrorBody {
    message: Option<String>,
}

pub struct GitHubStorage {
    client: Client,
    api_url: Url,
    raw_url: String,
    owner: String,
    repo: String,
    path: String,
    branch: String,
    token: Option<String>,
    timeout: Duration,
    retries: u32,
}

impl GitHubStorage {
    pub fn new(config: &GitHubConfig, timeout: Duration, retries: u32) -> Result<Self, StoreError> {
        if config.api_url.cannot_be_a_base() {
            return Err(StoreError::Unexpected(format!(
                "GitHub API URL cannot be a base: {}",
                config.api_url
            )));
        }
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            raw_url: config.raw_url.as_str().trim_end_matches('/').to_string(),
            owner: config.owner.clone(),
            repo: config.repo.clone(),
            path: config.path.trim_matches('/').to_string(),
            branch: config.branch.clone(),
            token: config.token.clone(),
            timeout,
            retries,
        })
    }

    fn contents_url(&self, key: Option<&str>) -> Result<Url, StoreError> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::Unexpected("GitHub API URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(["repos", self.owner.as_str(), self.repo.as_str(), "contents"])
            .extend(self.path.split('/').filter(|segment| !segment.is_empty()))
            .extend(key);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url, accept: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header(header::ACCEPT, accept);
        match self.token.as_deref() {
            Some(token) => builder.header(header::AUTHORIZATION, format!("token {token}")),
            None => builder,
        }
    }

    fn transport_error(&self, err: reqwest::Error) -> StoreError {
        if err.is_timeout() {
            StoreError::Timeout(self.timeout)
        } else {
            StoreError::Http(err.without_url())
        }
    }

    /// Sends an idempotent request, retrying timeouts, connection failures,
    /// 429 and 5xx responses.
    async fn send_idempotent(&self, request: RequestBuilder) -> Result<Response, StoreError> {
        let mut attempt = 0u32;
        loop {
            let cloned = request
                .try_clone()
                .ok_or_else(|| StoreError::Unexpected("request is not retryable".to_string()))?;
            let err = match cloned.send().await {
                Ok(response) if !is_retryable_status(response.status()) => return Ok(response),
                Ok(response) => status_error(response).await,
                Err(err) => self.transport_error(err),
            };
            if attempt >= self.retries || !err.is_transient() {
                return Err(err);
            }
            let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
            attempt += 1;
            warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "GitHub request failed, retrying");
            sleep(delay).await;
        }
    }

    async fn file_sha(&self, key: &str) -> Result<Option<String>, StoreError> {
        let url = self.contents_url(Some(key))?;
        let request = self
            .request(Method::GET, url, ACCEPT_JSON)
            .query(&[("ref", self.branch.as_str())]);
        let response = self.send_idempotent(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = assert_ok_response(response).await?;
        let text = response.text().await.map_err(|err| self.transport_error(err))?;
        let entry: ContentEntry = serde_json::from_str(&text)?;
        if entry.kind != "file" {
            return Ok(None);
        }
        Ok(Some(entry.sha))
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

async fn status_error(response: Response) -> StoreError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<GitHubErrorBody>(&text)
        .ok()
        .and_then(|body| body.message)
        .unwrap_or(text);
    StoreError::Status {
        status: status.as_u16(),
        message,
    }
}

async fn assert_ok_response(response: Response) -> Result<Response, StoreError> {
    if response.status().is_success() {
        return Ok(response);
    }
    Err(status_error(response).await)
}

#[async_trait::async_trait]
impl BlobStore for GitHubStorage {
    fn backend(&self) -> &'static str {
        "github"
    }

    async fn put(&self, key: &str, data: &[u8], label: &str) -> Result<BlobEntry, StoreError> {
        let url = self.contents_url(Some(key))?;
        let content = base64::engine::general_purpose::STANDARD.encode(data);
        let response = self
            .request(Method::PUT, url, ACCEPT_JSON)
            .json(&json!({
                "message": format!("upload image: {label}"),
                "content": content,
                "branch": self.branch,
            }))
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;
        let response = assert_ok_response(response).await?;
        // The commit is done; a response without a page link is not a failure.
        let page_url = response
            .json::<CommitResponse>()
            .await
            .ok()
            .and_then(|commit| commit.content)
            .and_then(|file| file.html_url);
        debug!(key, size = data.len(), "committed blob to GitHub");
        Ok(BlobEntry {
            key: key.to_string(),
            size: data.len() as u64,
            url: self.public_url(key),
            page_url,
        })
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let url = self.contents_url(Some(key))?;
        let request = self
            .request(Method::GET, url, ACCEPT_RAW)
            .query(&[("ref", self.branch.as_str())]);
        let response = self.send_idempotent(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = assert_ok_response(response).await?;
        let bytes = response.bytes().await.map_err(|err| self.transport_error(err))?;
        Ok(Some(bytes.to_vec()))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.file_sha(key).await?.is_some())
    }

    async fn delete(&self, key: &str) -> Result<BlobRemoval, StoreError> {
        let Some(sha) = self.file_sha(key).await? else {
            return Ok(BlobRemoval::AlreadyMissing);
        };
        let url = self.contents_url(Some(key))?;
        let response = self
            .request(Method::DELETE, url, ACCEPT_JSON)
            .json(&json!({
                "message": format!("delete image: {key}"),
                "sha": sha,
                "branch": self.branch,
            }))
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(BlobRemoval::AlreadyMissing);
        }
        assert_ok_response(response).await?;
        Ok(BlobRemoval::Deleted)
    }

    async fn listing(&self) -> Result<Vec<BlobEntry>, StoreError> {
        let url = self.contents_url(None)?;
        let request = self
            .request(Method::GET, url, ACCEPT_JSON)
            .query(&[("ref", self.branch.as_str())]);
        let response = self.send_idempotent(request).await?;
        // Git has no empty directories; a missing one just holds no images yet.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let response = assert_ok_response(response).await?;
        let text = response.text().await.map_err(|err| self.transport_error(err))?;
        let entries: Vec<ContentEntry> = serde_json::from_str(&text).map_err(|_| {
            StoreError::Unexpected(format!("{} is not a directory", self.path))
        })?;
        Ok(entries
            .into_iter()
            .filter(|entry| entry.kind == "file")
            .map(|entry| BlobEntry {
                url: self.public_url(&entry.name),
                key: entry.name,
                size: entry.size,
                page_url: entry.html_url,
            })
            .collect())
    }

    fn public_url(&self, key: &str) -> String {
        let mut url = format!("{}/{}/{}/{}", self.raw_url, self.owner, self.repo, self.branch);
        if !self.path.is_empty() {
            url.push('/');
            url.push_str(&self.path);
        }
        url.push('/');
        url.push_str(key.trim_start_matches('/'));
        url
    }
}
