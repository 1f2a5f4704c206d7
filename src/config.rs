//! Process configuration, read from the environment (after `.env` is loaded).

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use url::Url;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RETRIES: u32 = 2;
const DEFAULT_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;
const INDEX_FILE_NAME: &str = "images.json";
const BLOB_DIR_NAME: &str = "images";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    GitHub,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "local" | "fs" | "disk" => Ok(Self::Local),
            "github" | "remote" => Ok(Self::GitHub),
            other => Err(anyhow!("unknown storage backend: {other}")),
        }
    }
}

#[derive(Clone)]
pub struct GitHubConfig {
    pub owner: String,
    pub repo: String,
    pub path: String,
    pub branch: String,
    pub token: Option<String>,
    pub api_url: Url,
    pub raw_url: Url,
}

impl fmt::Debug for GitHubConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitHubConfig")
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .field("path", &self.path)
            .field("branch", &self.branch)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("api_url", &self.api_url.as_str())
            .field("raw_url", &self.raw_url.as_str())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub backend: BackendKind,
    pub data_dir: PathBuf,
    /// Base for local blob URLs, e.g. `https://img.example.com/files` or `/files`.
    pub files_base_url: String,
    pub github: Option<GitHubConfig>,
    pub storage_timeout: Duration,
    pub storage_retries: u32,
    pub max_upload_bytes: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let port = parse_or(var("PORT"), DEFAULT_PORT).context("invalid PORT")?;
        let backend = match var("STORAGE_BACKEND") {
            Some(value) => value.parse()?,
            None => BackendKind::Local,
        };
        let data_dir = resolve_data_dir(var("DATA_DIR"));
        let files_base_url = resolve_files_base_url(var("PUBLIC_URL").or_else(|| var("DOMAIN")));
        let storage_timeout = Duration::from_secs(
            parse_or(var("STORAGE_TIMEOUT_SECS"), DEFAULT_TIMEOUT_SECS)
                .context("invalid STORAGE_TIMEOUT_SECS")?,
        );
        let storage_retries =
            parse_or(var("STORAGE_RETRIES"), DEFAULT_RETRIES).context("invalid STORAGE_RETRIES")?;
        let max_upload_bytes = parse_or(var("MAX_UPLOAD_BYTES"), DEFAULT_MAX_UPLOAD_BYTES)
            .context("invalid MAX_UPLOAD_BYTES")?;

        let github = match backend {
            BackendKind::GitHub => Some(GitHubConfig {
                owner: var("GITHUB_OWNER").context("GITHUB_OWNER is required for the github backend")?,
                repo: var("GITHUB_REPO").context("GITHUB_REPO is required for the github backend")?,
                path: var("GITHUB_PATH").unwrap_or_else(|| "images".to_string()),
                branch: var("GITHUB_BRANCH").unwrap_or_else(|| "main".to_string()),
                token: var("GITHUB_TOKEN"),
                api_url: validate_http_url(
                    var("GITHUB_API_URL").as_deref().unwrap_or("https://api.github.com"),
                )
                .context("invalid GITHUB_API_URL")?,
                raw_url: validate_http_url(
                    var("GITHUB_RAW_URL")
                        .as_deref()
                        .unwrap_or("https://raw.githubusercontent.com"),
                )
                .context("invalid GITHUB_RAW_URL")?,
            }),
            BackendKind::Local => None,
        };

        Ok(Self {
            port,
            backend,
            data_dir,
            files_base_url,
            github,
            storage_timeout,
            storage_retries,
            max_upload_bytes,
        })
    }

    /// Local backend rooted at `data_dir`, with relative blob URLs.
    pub fn local(data_dir: PathBuf) -> Self {
        Self {
            port: DEFAULT_PORT,
            backend: BackendKind::Local,
            data_dir,
            files_base_url: resolve_files_base_url(None),
            github: None,
            storage_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            storage_retries: DEFAULT_RETRIES,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }

    pub fn bind_address(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }

    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(INDEX_FILE_NAME)
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.data_dir.join(BLOB_DIR_NAME)
    }
}

fn parse_or<T>(value: Option<String>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(value) => Ok(value.trim().parse()?),
        None => Ok(default),
    }
}

fn resolve_data_dir(configured: Option<String>) -> PathBuf {
    if let Some(dir) = configured {
        return PathBuf::from(dir);
    }
    match dirs::data_dir() {
        Some(mut base) => {
            base.push("image-host");
            base
        }
        None => PathBuf::from("data"),
    }
}

fn resolve_files_base_url(public_url: Option<String>) -> String {
    let Some(raw_domain) = public_url else {
        return "/files".to_string();
    };
    let trimmed = raw_domain.trim();
    let mut base = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", trimmed.trim_end_matches('/'))
    };
    while base.starts_with("http://http://") {
        base = base.replacen("http://http://", "http://", 1);
    }
    while base.starts_with("https://https://") {
        base = base.replacen("https://https://", "https://", 1);
    }
    while base.starts_with("http://https://") {
        base = base.replacen("http://https://", "https://", 1);
    }
    while base.starts_with("https://http://") {
        base = base.replacen("https://http://", "http://", 1);
    }
    format!("{base}/files")
}

pub fn validate_http_url(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        bail!("url must not be empty");
    }
    let parsed = Url::parse(trimmed).with_context(|| format!("malformed url: {trimmed}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => bail!("only http and https urls are allowed, got {scheme}"),
    }
}
