//! Self-update subsystem.
//!
//! Release discovery, checksum-verified download, atomic install with a
//! pre-install backup, post-install validation, and rollback. A failed
//! update always leaves the previous binary in place.

pub mod assets;
pub mod channel;
pub mod engine;
pub mod history;
pub mod release;
pub mod scheduler;
pub mod validate;

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;

pub use channel::{ChannelKind, ChannelPolicy, UpdateSettings};
pub use engine::{UpdateEngine, UpdateState};
pub use history::{UpdateHistory, UpdateRecord, UpdateStatus, UpdateType};
pub use release::{ProgressReporter, ReleaseAsset, ReleaseClient, ReleaseDescriptor};
pub use scheduler::{ScheduleStatus, ScheduledUpdate, UpdateScheduler};

#[derive(Debug, Error)]
pub enum UpdateError {
    /// The local token bucket is exhausted; the remote was not contacted.
    #[error("release API rate limit exhausted; retry after {reset_time}")]
    RateLimited { reset_time: DateTime<Utc> },

    /// Transient network failure; retried with bounded backoff by callers.
    #[error("network error: {0}")]
    Network(String),

    #[error("no release asset matches this platform")]
    NoMatchingAsset,

    /// Integrity failure: the download is quarantined and never installed.
    #[error("checksum mismatch for {asset}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        asset: String,
        expected: String,
        actual: String,
    },

    #[error("unverified install denied by {channel} channel policy")]
    UnverifiedDenied { channel: String },

    #[error("install failed: {0}")]
    InstallFailed(String),

    #[error("post-install validation failed: {0}")]
    ValidationFailed(String),

    #[error("rollback failed: {0}")]
    RollbackFailed(String),

    #[error("another update attempt is already in flight")]
    InProgress,

    #[error("already on the latest version")]
    UpToDate,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl UpdateError {
    /// Transient errors are worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Http(_))
    }
}

/// Retry `operation` up to `attempts` times with doubling backoff, but only
/// for transient failures.
pub async fn with_retries<T, F, Fut>(
    attempts: u32,
    base_delay: Duration,
    mut operation: F,
) -> Result<T, UpdateError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, UpdateError>>,
{
    let mut delay = base_delay;
    let mut last_error = None;
    for attempt in 1..=attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts => {
                warn!(attempt, %err, "transient update error; backing off");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                last_error = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_error.unwrap_or_else(|| UpdateError::Network("retries exhausted".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_stop_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(UpdateError::UpToDate) }
        })
        .await;
        assert!(matches!(result, Err(UpdateError::UpToDate)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result = with_retries(3, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(UpdateError::Network("flaky".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
