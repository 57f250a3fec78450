use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::debug;
use semver::Version;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_MANIFEST_TTL: Duration = Duration::from_secs(3600);

/// The version-check payload published next to each release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseInfo {
    pub version: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
}

impl ReleaseInfo {
    #[must_use]
    pub fn normalized_version(&self) -> &str {
        self.version.strip_prefix('v').unwrap_or(&self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePackage {
    pub download_url: String,
    pub target_version: String,
}

impl UpdatePackage {
    #[must_use]
    pub fn new(download_url: impl Into<String>, target_version: impl Into<String>) -> Self {
        Self {
            download_url: download_url.into(),
            target_version: target_version.into(),
        }
    }

    /// Derive the archive URL for `release` from a template containing
    /// `{version}` and optionally `{platform}`.
    #[must_use]
    pub fn for_release(template: &str, release: &ReleaseInfo) -> Self {
        let version = release.normalized_version();
        let download_url = template
            .replace("{version}", version)
            .replace("{platform}", platform_tag());
        Self::new(download_url, version)
    }
}

/// Platform component used in release archive names.
#[must_use]
pub fn platform_tag() -> &'static str {
    if cfg!(target_os = "macos") && cfg!(target_arch = "aarch64") {
        "macos-arm64"
    } else if cfg!(target_os = "macos") {
        "macos-x64"
    } else if cfg!(target_os = "linux") && cfg!(target_arch = "aarch64") {
        "linux-arm64"
    } else if cfg!(target_os = "linux") {
        "linux-x64"
    } else if cfg!(target_os = "windows") && cfg!(target_arch = "aarch64") {
        "windows-arm64"
    } else if cfg!(target_os = "windows") {
        "windows-x64"
    } else {
        std::env::consts::OS
    }
}

#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("failed to build release client: {0}")]
    ClientBuild(#[source] reqwest::Error),
    #[error("failed to fetch release manifest: {0}")]
    Request(#[source] reqwest::Error),
    #[error("release manifest request failed with HTTP {status}{body_snippet}")]
    HttpStatus {
        status: reqwest::StatusCode,
        body_snippet: String,
    },
    #[error("failed to parse release manifest: {0}")]
    Parse(#[source] reqwest::Error),
}

/// Last fetched manifest, valid for a bounded time.
#[derive(Debug)]
pub struct ManifestCache {
    ttl: Duration,
    entry: Mutex<Option<(Instant, ReleaseInfo)>>,
}

impl Default for ManifestCache {
    fn default() -> Self {
        Self::new(DEFAULT_MANIFEST_TTL)
    }
}

impl ManifestCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn get(&self) -> Option<ReleaseInfo> {
        let mut entry = self.entry.lock().unwrap_or_else(PoisonError::into_inner);
        match entry.as_ref() {
            Some((stored_at, info)) if stored_at.elapsed() < self.ttl => Some(info.clone()),
            Some(_) => {
                *entry = None;
                None
            }
            None => None,
        }
    }

    pub fn store(&self, info: ReleaseInfo) {
        let mut entry = self.entry.lock().unwrap_or_else(PoisonError::into_inner);
        *entry = Some((Instant::now(), info));
    }

    pub fn clear(&self) {
        let mut entry = self.entry.lock().unwrap_or_else(PoisonError::into_inner);
        *entry = None;
    }
}

#[derive(Debug, Clone)]
pub struct ReleaseChecker {
    client: reqwest::Client,
    manifest_url: String,
    cache: Arc<ManifestCache>,
}

impl ReleaseChecker {
    /// # Errors
    /// Returns an error when the HTTP client cannot be constructed.
    pub fn new(manifest_url: impl Into<String>, cache: Arc<ManifestCache>) -> Result<Self, ReleaseError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(30))
            .user_agent(format!("refit/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ReleaseError::ClientBuild)?;
        Ok(Self {
            client,
            manifest_url: manifest_url.into(),
            cache,
        })
    }

    /// The latest published release, served from the cache while it is fresh.
    ///
    /// # Errors
    /// Returns an error when the manifest request fails or the response
    /// cannot be parsed.
    pub async fn latest(&self) -> Result<ReleaseInfo, ReleaseError> {
        if let Some(cached) = self.cache.get() {
            debug!("Using cached release manifest for {}", cached.version);
            return Ok(cached);
        }

        let response = self
            .client
            .get(&self.manifest_url)
            .send()
            .await
            .map_err(ReleaseError::Request)?;

        if !response.status().is_success() {
            let status = response.status();
            let body_snippet = response
                .text()
                .await
                .ok()
                .map(|body| response_snippet(&body, 160))
                .unwrap_or_default();
            return Err(ReleaseError::HttpStatus {
                status,
                body_snippet,
            });
        }

        let release: ReleaseInfo = response.json().await.map_err(ReleaseError::Parse)?;
        self.cache.store(release.clone());
        Ok(release)
    }

    /// The latest release when it is newer than `current_version`.
    ///
    /// # Errors
    /// Returns an error when the manifest cannot be fetched.
    pub async fn check(&self, current_version: &str) -> Result<Option<ReleaseInfo>, ReleaseError> {
        let release = self.latest().await?;
        let current = current_version.strip_prefix('v').unwrap_or(current_version);
        if is_newer_version(release.normalized_version(), current) {
            Ok(Some(release))
        } else {
            Ok(None)
        }
    }
}

fn response_snippet(body: &str, max_chars: usize) -> String {
    let snippet: String = body.chars().take(max_chars).collect();
    if snippet.is_empty() {
        String::new()
    } else {
        format!(": {snippet}")
    }
}

#[must_use]
pub fn is_newer_version(latest: &str, current: &str) -> bool {
    match (parse_semver(latest), parse_semver(current)) {
        (Some(latest), Some(current)) => latest > current,
        _ => latest != current,
    }
}

fn parse_semver(version: &str) -> Option<Version> {
    if let Ok(parsed) = Version::parse(version) {
        return Some(parsed);
    }

    let suffix_idx = version.find(['-', '+']).unwrap_or(version.len());
    let (core, suffix) = version.split_at(suffix_idx);
    let mut parts = core.split('.');
    let major = parts.next()?.parse::<u64>().ok()?;
    let minor = parts.next().map(str::parse::<u64>).transpose().ok()?;
    let patch = parts.next().map(str::parse::<u64>).transpose().ok()?;
    if parts.next().is_some() {
        return None;
    }

    let normalized = format!(
        "{major}.{}.{}{suffix}",
        minor.unwrap_or(0),
        patch.unwrap_or(0)
    );
    Version::parse(&normalized).ok()
}
