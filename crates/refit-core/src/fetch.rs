use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, info, warn};
use reqwest::header::{CONTENT_TYPE, LOCATION};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use url::Url;

use crate::bypass;
use crate::validate::{ArchiveKind, is_archive_path, looks_like_html};

pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Only known when the server announced a length.
    pub percent: Option<u8>,
    pub downloaded: u64,
    pub total: Option<u64>,
}

impl DownloadProgress {
    fn new(downloaded: u64, total: Option<u64>) -> Self {
        let percent = total.map(|total| {
            let ratio = downloaded.min(total) * 100 / total.max(1);
            u8::try_from(ratio).unwrap_or(100)
        });
        Self {
            percent,
            downloaded,
            total,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadResult {
    pub local_path: PathBuf,
    pub byte_size: u64,
    pub succeeded: bool,
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("failed to build download client: {0}")]
    ClientBuild(#[source] reqwest::Error),
    #[error("invalid download URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("download request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("download failed with HTTP {status} for {url}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("redirect from {url} has no usable Location header")]
    MissingLocation { url: String },
    #[error("redirect loop detected at {url}")]
    RedirectLoop { url: String },
    #[error("server returned an empty body for {url}")]
    EmptyBody { url: String },
    #[error("downloaded file is empty")]
    EmptyFile,
    #[error("download timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("received an HTML page from {url} and no download link could be recovered")]
    BypassFailed { url: String },
    #[error("downloaded file is not an archive")]
    NotAnArchive,
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl DownloadError {
    fn io_with_path(context: &'static str, path: &Path, source: &std::io::Error) -> Self {
        Self::Io {
            context,
            source: std::io::Error::new(source.kind(), format!("{}: {source}", path.display())),
        }
    }

    fn request(url: &Url, source: reqwest::Error) -> Self {
        Self::Request {
            url: url.to_string(),
            source,
        }
    }

    /// Failures a fresh attempt may cure: connection trouble, server-side
    /// errors, truncated bodies and timeouts.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request { .. }
            | Self::Timeout(_)
            | Self::EmptyBody { .. }
            | Self::EmptyFile => true,
            Self::Status { status, .. } => {
                status.is_server_error() || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }

    /// Short stable identifier for the failure, suitable for UI and logs.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::ClientBuild(_) => "client-build",
            Self::InvalidUrl { .. } => "invalid-url",
            Self::Request { .. } => "network",
            Self::Status { .. } => "http-status",
            Self::MissingLocation { .. } => "missing-location",
            Self::RedirectLoop { .. } => "redirect-loop",
            Self::EmptyBody { .. } => "empty-body",
            Self::EmptyFile => "empty-file",
            Self::Timeout(_) => "timeout",
            Self::BypassFailed { .. } => "bypass-failed",
            Self::NotAnArchive => "not-an-archive",
            Self::Io { .. } => "io",
        }
    }
}

/// Anything that can put a remote archive on disk. The orchestrator is
/// written against this so tests can substitute a local source.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn download(
        &self,
        url: &str,
        destination: &Path,
        on_progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> Result<DownloadResult, DownloadError>;
}

enum Hop {
    Redirect(Url),
    Interstitial(String),
    Complete(u64),
}

#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl Fetcher {
    /// Build a fetcher whose whole download, redirects included, must finish
    /// within `timeout`.
    ///
    /// # Errors
    /// Returns an error when the HTTP client cannot be constructed.
    pub fn new(timeout: Duration) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(format!("refit/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(DownloadError::ClientBuild)?;
        Ok(Self { client, timeout })
    }

    /// Stream `url` into `destination`.
    ///
    /// Redirects are followed hop by hop so an HTML interstitial at any point
    /// of the chain can be recognized and bypassed. The destination file is
    /// removed on every failure path.
    ///
    /// # Errors
    /// Returns an error on network failure, a non-success status, an empty
    /// payload, an unrecoverable interstitial page, a payload that is not an
    /// archive when the destination is archive-typed, or timeout.
    pub async fn download(
        &self,
        url: &str,
        destination: &Path,
        on_progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> Result<DownloadResult, DownloadError> {
        let attempt = self.follow_chain(url, destination, on_progress);
        let result = match tokio::time::timeout(self.timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(DownloadError::Timeout(self.timeout)),
        };

        if let Err(error) = &result {
            warn!("Download of {url} failed: {error}");
            remove_partial(destination).await;
        }
        result
    }

    async fn follow_chain(
        &self,
        url: &str,
        destination: &Path,
        on_progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> Result<DownloadResult, DownloadError> {
        let original = Url::parse(url).map_err(|source| DownloadError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
        let mut current = original.clone();
        let mut visited = HashSet::new();

        loop {
            if !visited.insert(current.to_string()) {
                return Err(DownloadError::RedirectLoop {
                    url: current.to_string(),
                });
            }

            match self.fetch_once(&current, destination, on_progress).await? {
                Hop::Redirect(next) => {
                    debug!("Following redirect {current} -> {next}");
                    current = next;
                }
                Hop::Interstitial(html) => {
                    let found = bypass::resolve(&html, &current, &original);
                    let Some(next) = found
                        .url()
                        .filter(|next| !visited.contains(next.as_str()))
                        .cloned()
                    else {
                        return Err(DownloadError::BypassFailed {
                            url: current.to_string(),
                        });
                    };
                    info!(
                        "Received an HTML page instead of the archive, retrying via {} link {next}",
                        found.label()
                    );
                    current = next;
                }
                Hop::Complete(byte_size) => {
                    return finish(destination, byte_size).await;
                }
            }
        }
    }

    async fn fetch_once(
        &self,
        url: &Url,
        destination: &Path,
        on_progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> Result<Hop, DownloadError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|source| DownloadError::request(url, source))?;
        let status = response.status();

        if status.is_redirection() {
            let next = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|location| url.join(location).ok())
                .ok_or_else(|| DownloadError::MissingLocation {
                    url: url.to_string(),
                })?;
            return Ok(Hop::Redirect(next));
        }

        if !status.is_success() {
            return Err(DownloadError::Status {
                url: url.to_string(),
                status,
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if is_textual(&content_type) {
            let body = response
                .bytes()
                .await
                .map_err(|source| DownloadError::request(url, source))?;
            if body.is_empty() {
                return Err(DownloadError::EmptyBody {
                    url: url.to_string(),
                });
            }
            if content_type.contains("html") || looks_like_html(&body) {
                return Ok(Hop::Interstitial(String::from_utf8_lossy(&body).into_owned()));
            }
            tokio::fs::write(destination, &body).await.map_err(|error| {
                DownloadError::io_with_path("failed to write download data", destination, &error)
            })?;
            let size = body.len() as u64;
            on_progress(DownloadProgress::new(size, Some(size)));
            return Ok(Hop::Complete(size));
        }

        stream_to_file(response, url, destination, on_progress)
            .await
            .map(Hop::Complete)
    }
}

#[async_trait]
impl Fetch for Fetcher {
    async fn download(
        &self,
        url: &str,
        destination: &Path,
        on_progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> Result<DownloadResult, DownloadError> {
        Fetcher::download(self, url, destination, on_progress).await
    }
}

fn is_textual(content_type: &str) -> bool {
    content_type.starts_with("text/")
        || content_type.contains("html")
        || content_type.contains("xml")
        || content_type.contains("json")
}

async fn stream_to_file(
    response: reqwest::Response,
    url: &Url,
    destination: &Path,
    on_progress: &(dyn Fn(DownloadProgress) + Send + Sync),
) -> Result<u64, DownloadError> {
    let total = response.content_length().filter(|length| *length > 0);
    let mut file = tokio::fs::File::create(destination).await.map_err(|error| {
        DownloadError::io_with_path("failed to create download file", destination, &error)
    })?;

    let mut downloaded: u64 = 0;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|source| DownloadError::request(url, source))?;
        file.write_all(&chunk).await.map_err(|error| {
            DownloadError::io_with_path("failed to write download data", destination, &error)
        })?;
        downloaded += chunk.len() as u64;
        on_progress(DownloadProgress::new(downloaded, total));
    }

    file.flush().await.map_err(|error| {
        DownloadError::io_with_path("failed to flush download file", destination, &error)
    })?;
    Ok(downloaded)
}

async fn finish(destination: &Path, streamed: u64) -> Result<DownloadResult, DownloadError> {
    let byte_size = tokio::fs::metadata(destination)
        .await
        .map(|metadata| metadata.len())
        .map_err(|error| {
            DownloadError::io_with_path("failed to inspect download file", destination, &error)
        })?;
    if streamed == 0 || byte_size == 0 {
        return Err(DownloadError::EmptyFile);
    }

    if is_archive_path(destination) {
        let mut header = [0_u8; 4];
        let mut file = tokio::fs::File::open(destination).await.map_err(|error| {
            DownloadError::io_with_path("failed to reopen download file", destination, &error)
        })?;
        let complete = file.read_exact(&mut header).await.is_ok();
        if !complete || ArchiveKind::from_signature(&header).is_none() {
            return Err(DownloadError::NotAnArchive);
        }
    }

    info!("Download complete: {byte_size} bytes");
    Ok(DownloadResult {
        local_path: destination.to_path_buf(),
        byte_size,
        succeeded: true,
    })
}

async fn remove_partial(destination: &Path) {
    match tokio::fs::remove_file(destination).await {
        Ok(()) => debug!("Removed partial download {}", destination.display()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => warn!(
            "Failed to remove partial download {}: {error}",
            destination.display()
        ),
    }
}
