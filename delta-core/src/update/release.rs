//! Release discovery and asset download.
//!
//! Talks HTTPS to the configured release host, which returns a JSON array of
//! release descriptors. Requests go through a local token bucket so an
//! exhausted rate limit is reported without touching the network, and the
//! listing is cached with a TTL.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use semver::Version;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::update::UpdateError;

/// One release as observed from the remote; immutable once fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseDescriptor {
    #[serde(rename = "tag_name")]
    pub tag: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

impl ReleaseDescriptor {
    /// Parsed semantic version, tolerating a leading `v`.
    pub fn version(&self) -> Option<Version> {
        Version::parse(self.tag.trim_start_matches('v')).ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub size: u64,
    #[serde(rename = "browser_download_url")]
    pub download_url: String,
    /// Filled in after the release's checksum file is fetched and matched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_sha256: Option<String>,
}

/// Reports download progress to the caller.
pub trait ProgressReporter: Send + Sync {
    fn on_progress(&self, downloaded: u64, total: Option<u64>);
}

/// Reporter for non-interactive contexts.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn on_progress(&self, _downloaded: u64, _total: Option<u64>) {}
}

/// Fixed-window token bucket tracking `remaining` and `reset_time`.
struct TokenBucket {
    capacity: u32,
    remaining: u32,
    window: Duration,
    window_started: Instant,
    reset_time: DateTime<Utc>,
}

impl TokenBucket {
    fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity,
            remaining: capacity,
            window,
            window_started: Instant::now(),
            reset_time: Utc::now() + chrono::Duration::from_std(window).unwrap_or_default(),
        }
    }

    fn try_acquire(&mut self) -> Result<(), UpdateError> {
        if self.window_started.elapsed() >= self.window {
            self.window_started = Instant::now();
            self.remaining = self.capacity;
            self.reset_time =
                Utc::now() + chrono::Duration::from_std(self.window).unwrap_or_default();
        }
        if self.remaining == 0 {
            return Err(UpdateError::RateLimited {
                reset_time: self.reset_time,
            });
        }
        self.remaining -= 1;
        Ok(())
    }
}

/// Client for the release host.
pub struct ReleaseClient {
    http: reqwest::Client,
    releases_url: String,
    bearer_token: Option<String>,
    bucket: Mutex<TokenBucket>,
    cache: Mutex<Option<(Instant, Vec<ReleaseDescriptor>)>>,
    cache_ttl: Duration,
    download_timeout: Duration,
}

impl ReleaseClient {
    pub fn new(
        releases_url: impl Into<String>,
        bearer_token: Option<String>,
        rate_limit_per_hour: u32,
        cache_ttl: Duration,
        download_timeout: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(concat!("delta-updater/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            releases_url: releases_url.into(),
            bearer_token,
            bucket: Mutex::new(TokenBucket::new(
                rate_limit_per_hour,
                Duration::from_secs(3_600),
            )),
            cache: Mutex::new(None),
            cache_ttl,
            download_timeout,
        }
    }

    /// Rate-limit state: (remaining, reset_time).
    pub fn rate_limit_state(&self) -> (u32, DateTime<Utc>) {
        let bucket = self.bucket.lock();
        (bucket.remaining, bucket.reset_time)
    }

    /// List releases, newest first. Repeated calls within the TTL return the
    /// cached listing without consuming a rate-limit token.
    pub async fn list_releases(&self) -> Result<Vec<ReleaseDescriptor>, UpdateError> {
        if let Some((fetched_at, cached)) = self.cache.lock().as_ref() {
            if fetched_at.elapsed() < self.cache_ttl {
                debug!("returning cached release listing");
                return Ok(cached.clone());
            }
        }

        self.bucket.lock().try_acquire()?;

        let mut request = self.http.get(&self.releases_url);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|err| UpdateError::Network(err.to_string()))?
            .error_for_status()
            .map_err(|err| UpdateError::Network(err.to_string()))?;

        let releases: Vec<ReleaseDescriptor> = response
            .json()
            .await
            .map_err(|err| UpdateError::Network(format!("malformed release listing: {err}")))?;

        *self.cache.lock() = Some((Instant::now(), releases.clone()));
        Ok(releases)
    }

    /// The latest non-draft release visible to the channel policy.
    pub async fn latest_release(
        &self,
        allow_prerelease: bool,
    ) -> Result<Option<ReleaseDescriptor>, UpdateError> {
        let releases = self.list_releases().await?;
        let mut candidates: Vec<(Version, ReleaseDescriptor)> = releases
            .into_iter()
            .filter(|release| !release.draft)
            .filter(|release| allow_prerelease || !release.prerelease)
            .filter_map(|release| release.version().map(|version| (version, release)))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(candidates.into_iter().next().map(|(_, release)| release))
    }

    /// Download the release's checksum file, if it publishes one.
    pub async fn fetch_checksums(
        &self,
        release: &ReleaseDescriptor,
    ) -> Result<Option<Vec<ChecksumEntry>>, UpdateError> {
        let Some(asset) = release.assets.iter().find(|asset| is_checksum_asset(&asset.name))
        else {
            return Ok(None);
        };

        let text = self
            .http
            .get(&asset.download_url)
            .send()
            .await
            .map_err(|err| UpdateError::Network(err.to_string()))?
            .error_for_status()
            .map_err(|err| UpdateError::Network(err.to_string()))?
            .text()
            .await
            .map_err(|err| UpdateError::Network(err.to_string()))?;

        Ok(Some(parse_checksum_file(&text)))
    }

    /// Stream an asset into the download directory. The partial file is
    /// removed on any failure or cancellation.
    pub async fn download_asset(
        &self,
        asset: &ReleaseAsset,
        download_dir: &Path,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, UpdateError> {
        tokio::fs::create_dir_all(download_dir).await?;
        let dest = download_dir.join(&asset.name);

        let result = tokio::time::timeout(
            self.download_timeout,
            self.stream_to_file(asset, &dest, progress, cancel),
        )
        .await;

        match result {
            Ok(Ok(())) => Ok(dest),
            Ok(Err(err)) => {
                let _ = tokio::fs::remove_file(&dest).await;
                Err(err)
            }
            Err(_) => {
                let _ = tokio::fs::remove_file(&dest).await;
                Err(UpdateError::Network(format!(
                    "download of {} timed out",
                    asset.name
                )))
            }
        }
    }

    async fn stream_to_file(
        &self,
        asset: &ReleaseAsset,
        dest: &Path,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<(), UpdateError> {
        let response = self
            .http
            .get(&asset.download_url)
            .send()
            .await
            .map_err(|err| UpdateError::Network(err.to_string()))?
            .error_for_status()
            .map_err(|err| UpdateError::Network(err.to_string()))?;

        let total = response.content_length();
        let mut stream = response.bytes_stream();
        let mut file = tokio::fs::File::create(dest).await?;
        let mut downloaded = 0u64;

        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(UpdateError::Network("download cancelled".to_string()));
            }
            let chunk = chunk.map_err(|err| UpdateError::Network(err.to_string()))?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            progress.on_progress(downloaded, total);
        }
        file.sync_all().await?;
        Ok(())
    }
}

/// One `<hex>  <filename>` line from a sha256sum-style file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumEntry {
    pub sha256: String,
    pub filename: String,
}

pub fn parse_checksum_file(text: &str) -> Vec<ChecksumEntry> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let hex = parts.next()?;
            let filename = parts.next()?;
            if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                warn!(line, "skipping malformed checksum line");
                return None;
            }
            Some(ChecksumEntry {
                sha256: hex.to_ascii_lowercase(),
                // sha256sum marks binary mode with a leading '*'.
                filename: filename.trim_start_matches('*').to_string(),
            })
        })
        .collect()
}

/// Find the checksum for an asset: exact name, `./name`, or path-suffix
/// `/name`.
pub fn find_checksum<'a>(entries: &'a [ChecksumEntry], asset_name: &str) -> Option<&'a str> {
    entries
        .iter()
        .find(|entry| {
            entry.filename == asset_name
                || entry.filename == format!("./{asset_name}")
                || entry.filename.ends_with(&format!("/{asset_name}"))
        })
        .map(|entry| entry.sha256.as_str())
}

fn is_checksum_asset(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.contains("checksum")
        || lower.contains("sha256sums")
        || lower.ends_with(".sha256")
        || lower == "shasums"
}

/// SHA-256 of a file on disk, as lowercase hex.
pub fn sha256_file(path: &Path) -> Result<String, UpdateError> {
    let bytes = std::fs::read(path)?;
    let digest = Sha256::digest(&bytes);
    Ok(format!("{digest:x}"))
}
