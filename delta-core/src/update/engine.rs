//! The update state machine.
//!
//! ```text
//! Idle → Checking → UpdateAvailable → Downloading → Verifying → BackingUp
//!       → Installing → Validating → [Success | RollingBack → [Recovered | Failed]]
//! ```
//!
//! Exactly one attempt may be in flight; read-only inspections share the
//! state lock. A failed attempt always leaves the previous binary in place.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use semver::Version;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::update::assets::select_asset_for_current;
use crate::update::channel::UpdateSettings;
use crate::update::history::{UpdateHistory, UpdateRecord, UpdateStatus, UpdateType};
use crate::update::release::{
    find_checksum, sha256_file, ProgressReporter, ReleaseClient, ReleaseDescriptor, SilentProgress,
};
use crate::update::validate::InstallValidator;
use crate::update::{with_retries, UpdateError};
use crate::utils::fs::copy_preserving_permissions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    Checking,
    UpdateAvailable,
    Downloading,
    Verifying,
    BackingUp,
    Installing,
    Validating,
    RollingBack,
    Recovered,
    Failed,
    Success,
}

pub struct UpdateEngine {
    settings: UpdateSettings,
    client: ReleaseClient,
    history: UpdateHistory,
    validator: Arc<dyn InstallValidator>,
    downloads_dir: PathBuf,
    backups_dir: PathBuf,
    /// The live binary this engine maintains.
    binary_path: PathBuf,
    current_version: Version,
    state: RwLock<UpdateState>,
    attempt_lock: Mutex<()>,
}

impl UpdateEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: UpdateSettings,
        history: UpdateHistory,
        validator: Arc<dyn InstallValidator>,
        downloads_dir: PathBuf,
        backups_dir: PathBuf,
        binary_path: PathBuf,
        current_version: Version,
    ) -> Self {
        let client = ReleaseClient::new(
            settings.effective_releases_url().to_string(),
            settings.bearer_token.clone(),
            settings.rate_limit_per_hour,
            Duration::from_secs(settings.cache_ttl_secs),
            Duration::from_secs(settings.download_timeout_secs),
        );
        Self {
            settings,
            client,
            history,
            validator,
            downloads_dir,
            backups_dir,
            binary_path,
            current_version,
            state: RwLock::new(UpdateState::Idle),
            attempt_lock: Mutex::new(()),
        }
    }

    pub fn current_version(&self) -> &Version {
        &self.current_version
    }

    pub fn settings(&self) -> &UpdateSettings {
        &self.settings
    }

    pub fn history(&self) -> &UpdateHistory {
        &self.history
    }

    /// Read-only state inspection.
    pub async fn state(&self) -> UpdateState {
        *self.state.read().await
    }

    async fn set_state(&self, state: UpdateState) {
        *self.state.write().await = state;
    }

    /// Query the channel for a newer release. Cached within the client TTL.
    pub async fn check(&self) -> Result<Option<ReleaseDescriptor>, UpdateError> {
        self.set_state(UpdateState::Checking).await;
        let result = self.check_inner().await;
        match &result {
            Ok(Some(_)) => self.set_state(UpdateState::UpdateAvailable).await,
            _ => self.set_state(UpdateState::Idle).await,
        }
        result
    }

    async fn check_inner(&self) -> Result<Option<ReleaseDescriptor>, UpdateError> {
        let latest = self
            .client
            .latest_release(self.settings.policy.allow_prerelease)
            .await?;
        let Some(release) = latest else {
            return Ok(None);
        };
        let Some(version) = release.version() else {
            return Ok(None);
        };
        if let Some(range) = &self.settings.policy.allowed_versions {
            if !range.matches(&version) {
                info!(%version, "latest release is outside the allowed version range");
                return Ok(None);
            }
        }
        if version > self.current_version {
            Ok(Some(release))
        } else {
            Ok(None)
        }
    }

    /// Full attempt: check, download, verify, back up, install, validate.
    pub async fn install_latest(
        &self,
        update_type: UpdateType,
        trigger: &str,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<UpdateRecord, UpdateError> {
        let _guard = self
            .attempt_lock
            .try_lock()
            .map_err(|_| UpdateError::InProgress)?;
        let started = Instant::now();

        let release = self.check().await?.ok_or(UpdateError::UpToDate)?;
        let to_version = release.version().ok_or_else(|| {
            UpdateError::Other(anyhow::anyhow!("release {} has no parseable version", release.tag))
        })?;

        let mut record = UpdateRecord::new(
            update_type,
            &self.current_version.to_string(),
            &to_version.to_string(),
            self.settings.channel.label(),
            trigger,
        );

        let outcome = self
            .download_verify_install(&release, &to_version, &mut record, progress, cancel)
            .await;
        record.duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => {
                record.status = UpdateStatus::Success;
                self.history.append(&record).map_err(UpdateError::Other)?;
                self.set_state(UpdateState::Success).await;
                Ok(record)
            }
            Err(err) => {
                record.status = UpdateStatus::Failed;
                record.error_message = Some(err.to_string());
                self.history.append(&record).map_err(UpdateError::Other)?;
                if self.state().await != UpdateState::Recovered {
                    self.set_state(UpdateState::Failed).await;
                }
                Err(err)
            }
        }
    }

    async fn download_verify_install(
        &self,
        release: &ReleaseDescriptor,
        to_version: &Version,
        record: &mut UpdateRecord,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<(), UpdateError> {
        self.set_state(UpdateState::Downloading).await;
        let asset = select_asset_for_current(&release.assets)
            .ok_or(UpdateError::NoMatchingAsset)?
            .clone();

        let download_started = Instant::now();
        let staged = with_retries(3, Duration::from_millis(500), || {
            self.client
                .download_asset(&asset, &self.downloads_dir, progress, cancel)
        })
        .await?;
        record.download_time_ms = download_started.elapsed().as_millis() as u64;

        self.set_state(UpdateState::Verifying).await;
        self.verify_download(release, &asset.name, &staged, record)
            .await?;

        self.install_from_file(&staged, to_version, record).await
    }

    async fn verify_download(
        &self,
        release: &ReleaseDescriptor,
        asset_name: &str,
        staged: &Path,
        record: &mut UpdateRecord,
    ) -> Result<(), UpdateError> {
        let checksums = self.client.fetch_checksums(release).await?;
        match checksums
            .as_deref()
            .and_then(|entries| find_checksum(entries, asset_name))
        {
            Some(expected) => {
                let actual = sha256_file(staged)?;
                if actual != expected {
                    // Quarantine: keep the bytes for inspection, never install.
                    let quarantined = staged.with_extension("quarantined");
                    let _ = std::fs::rename(staged, &quarantined);
                    warn!(asset = asset_name, "checksum mismatch; download quarantined");
                    return Err(UpdateError::ChecksumMismatch {
                        asset: asset_name.to_string(),
                        expected: expected.to_string(),
                        actual,
                    });
                }
                record
                    .metadata
                    .insert("verification".into(), "sha256".into());
                Ok(())
            }
            None => {
                if !self.settings.policy.allow_unverified {
                    return Err(UpdateError::UnverifiedDenied {
                        channel: self.settings.channel.label().to_string(),
                    });
                }
                record
                    .metadata
                    .insert("verification".into(), "unverified".into());
                Ok(())
            }
        }
    }

    /// Install a staged binary file: back up the live binary, swap the new
    /// one in atomically, then run the post-install validation suite. Public
    /// so a locally downloaded file can be installed directly.
    pub async fn install_from_file(
        &self,
        staged: &Path,
        to_version: &Version,
        record: &mut UpdateRecord,
    ) -> Result<(), UpdateError> {
        self.set_state(UpdateState::BackingUp).await;
        let backup = self.backup_current()?;
        info!(backup = %backup.display(), "current binary backed up");

        self.set_state(UpdateState::Installing).await;
        let install_started = Instant::now();
        self.atomic_swap(staged)?;
        record.install_time_ms = install_started.elapsed().as_millis() as u64;

        self.set_state(UpdateState::Validating).await;
        let report = self
            .validator
            .validate(&self.binary_path, &to_version.to_string())
            .await;
        record.validation_results = report.summaries();

        if report.passed() {
            self.prune_backups();
            return Ok(());
        }

        let failure = report
            .first_failure()
            .map(|outcome| outcome.detail.clone())
            .unwrap_or_else(|| "validation suite failed".to_string());

        self.set_state(UpdateState::RollingBack).await;
        match self.restore_backup(&backup).await {
            Ok(()) => {
                self.set_state(UpdateState::Recovered).await;
                Err(UpdateError::ValidationFailed(failure))
            }
            Err(rollback_err) => {
                self.set_state(UpdateState::Failed).await;
                Err(UpdateError::RollbackFailed(format!(
                    "{failure}; rollback also failed: {rollback_err}"
                )))
            }
        }
    }

    /// Copy the live binary into `backups/<version>-<timestamp>`.
    fn backup_current(&self) -> Result<PathBuf, UpdateError> {
        std::fs::create_dir_all(&self.backups_dir)?;
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let backup = self
            .backups_dir
            .join(format!("{}-{stamp}", self.current_version));
        copy_preserving_permissions(&self.binary_path, &backup)
            .map_err(|err| UpdateError::InstallFailed(format!("backup failed: {err}")))?;
        Ok(backup)
    }

    /// Atomic swap: write the new binary to a sibling path, fsync, rename
    /// into place. On any error before the rename the live binary is
    /// untouched.
    fn atomic_swap(&self, staged: &Path) -> Result<(), UpdateError> {
        let sibling = self.binary_path.with_extension("new");
        copy_preserving_permissions(staged, &sibling)
            .map_err(|err| UpdateError::InstallFailed(format!("staging failed: {err}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&sibling, std::fs::Permissions::from_mode(0o755))
                .map_err(|err| {
                    let _ = std::fs::remove_file(&sibling);
                    UpdateError::InstallFailed(format!("chmod failed: {err}"))
                })?;
        }

        let file = std::fs::File::open(&sibling)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&sibling, &self.binary_path).map_err(|err| {
            let _ = std::fs::remove_file(&sibling);
            UpdateError::InstallFailed(format!("rename failed: {err}"))
        })
    }

    /// Reinstate a specific backup by the same sibling-write-and-rename.
    async fn restore_backup(&self, backup: &Path) -> Result<(), UpdateError> {
        if !backup.exists() {
            return Err(UpdateError::RollbackFailed(format!(
                "backup {} is gone",
                backup.display()
            )));
        }
        self.atomic_swap(backup)
            .map_err(|err| UpdateError::RollbackFailed(err.to_string()))?;

        let report = self
            .validator
            .validate(&self.binary_path, &self.current_version.to_string())
            .await;
        if !report.passed() {
            return Err(UpdateError::RollbackFailed(
                "restored binary failed validation".to_string(),
            ));
        }
        Ok(())
    }

    /// Roll back to the most recent backup, recording the attempt.
    pub async fn rollback(&self, trigger: &str) -> Result<UpdateRecord, UpdateError> {
        let _guard = self
            .attempt_lock
            .try_lock()
            .map_err(|_| UpdateError::InProgress)?;
        let started = Instant::now();

        self.set_state(UpdateState::RollingBack).await;
        let backup = self.latest_backup().ok_or_else(|| {
            UpdateError::RollbackFailed("backup directory is empty".to_string())
        })?;
        let backup_version = backup
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(parse_backup_version)
            .unwrap_or_else(|| "unknown".to_string());

        let mut record = UpdateRecord::new(
            UpdateType::Rollback,
            &self.current_version.to_string(),
            &backup_version,
            self.settings.channel.label(),
            trigger,
        );

        let outcome = self.restore_backup(&backup).await;
        record.duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(()) => {
                record.status = UpdateStatus::Success;
                self.history.append(&record).map_err(UpdateError::Other)?;
                self.set_state(UpdateState::Recovered).await;
                Ok(record)
            }
            Err(err) => {
                record.status = UpdateStatus::Failed;
                record.error_message = Some(err.to_string());
                self.history.append(&record).map_err(UpdateError::Other)?;
                self.set_state(UpdateState::Failed).await;
                Err(err)
            }
        }
    }

    /// Most recent backup by modification time.
    pub fn latest_backup(&self) -> Option<PathBuf> {
        let mut backups = self.list_backups();
        backups.pop()
    }

    pub fn backup_count(&self) -> usize {
        self.list_backups().len()
    }

    /// Backups sorted oldest first.
    fn list_backups(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.backups_dir) else {
            return Vec::new();
        };
        let mut backups: Vec<(std::time::SystemTime, PathBuf)> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| {
                let modified = entry.metadata().ok()?.modified().ok()?;
                Some((modified, entry.path()))
            })
            .collect();
        backups.sort_by_key(|(modified, _)| *modified);
        backups.into_iter().map(|(_, path)| path).collect()
    }

    /// Retain the most recent `keep_backups`; oldest pruned first.
    fn prune_backups(&self) {
        let backups = self.list_backups();
        let keep = self.settings.keep_backups.max(1);
        if backups.len() <= keep {
            return;
        }
        for stale in &backups[..backups.len() - keep] {
            if let Err(err) = std::fs::remove_file(stale) {
                warn!(path = %stale.display(), %err, "failed to prune backup");
            }
        }
    }
}

/// `1.2.3-20260801120000` → `1.2.3`.
fn parse_backup_version(file_name: &str) -> Option<String> {
    let (version, _stamp) = file_name.rsplit_once('-')?;
    Some(version.to_string())
}

/// Convenience wrapper used by the CLI: silent progress, no cancellation.
pub async fn install_latest_simple(
    engine: &UpdateEngine,
    update_type: UpdateType,
    trigger: &str,
) -> Result<UpdateRecord, UpdateError> {
    engine
        .install_latest(update_type, trigger, &SilentProgress, &CancellationToken::new())
        .await
}
