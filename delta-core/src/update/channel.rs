//! Release channels and update policy.
//!
//! A channel is a named policy bundle; switching channels is recorded, and
//! enterprise mode can restrict or force the channel per user.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use semver::VersionReq;
use serde::{Deserialize, Serialize};

use crate::config::ENV_UPDATE_ENABLED;
use crate::utils::fs::{atomic_write, read_file_with_context};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    #[default]
    Stable,
    Beta,
    Alpha,
    Nightly,
    Custom,
}

impl ChannelKind {
    pub fn label(self) -> &'static str {
        match self {
            ChannelKind::Stable => "stable",
            ChannelKind::Beta => "beta",
            ChannelKind::Alpha => "alpha",
            ChannelKind::Nightly => "nightly",
            ChannelKind::Custom => "custom",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "stable" => Some(Self::Stable),
            "beta" => Some(Self::Beta),
            "alpha" => Some(Self::Alpha),
            "nightly" => Some(Self::Nightly),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Policy attached to a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelPolicy {
    pub allow_prerelease: bool,
    pub auto_install: bool,
    pub require_approval: bool,
    /// Optional constraint on installable versions.
    pub allowed_versions: Option<VersionReq>,
    /// How often scheduled checks run for this channel.
    pub update_frequency_hours: u64,
    /// Override for the release listing URL.
    pub custom_update_url: Option<String>,
    /// Optional key identifier for signature verification, carried through
    /// and recorded; checksum verification is the implemented scheme.
    pub verification_key: Option<String>,
    /// Whether assets without a published checksum may be installed.
    pub allow_unverified: bool,
}

impl Default for ChannelPolicy {
    fn default() -> Self {
        Self::for_channel(ChannelKind::Stable)
    }
}

impl ChannelPolicy {
    pub fn for_channel(channel: ChannelKind) -> Self {
        match channel {
            ChannelKind::Stable => Self {
                allow_prerelease: false,
                auto_install: false,
                require_approval: true,
                allowed_versions: None,
                update_frequency_hours: 24,
                custom_update_url: None,
                verification_key: None,
                // Unverified installs are denied on the stable channel.
                allow_unverified: false,
            },
            ChannelKind::Beta => Self {
                allow_prerelease: true,
                auto_install: false,
                require_approval: true,
                allowed_versions: None,
                update_frequency_hours: 12,
                custom_update_url: None,
                verification_key: None,
                allow_unverified: true,
            },
            ChannelKind::Alpha | ChannelKind::Nightly => Self {
                allow_prerelease: true,
                auto_install: true,
                require_approval: false,
                allowed_versions: None,
                update_frequency_hours: 6,
                custom_update_url: None,
                verification_key: None,
                allow_unverified: true,
            },
            ChannelKind::Custom => Self {
                allow_prerelease: true,
                auto_install: false,
                require_approval: true,
                allowed_versions: None,
                update_frequency_hours: 24,
                custom_update_url: None,
                verification_key: None,
                allow_unverified: true,
            },
        }
    }
}

/// A recorded channel switch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelChange {
    pub timestamp: DateTime<Utc>,
    pub from: ChannelKind,
    pub to: ChannelKind,
}

/// Enterprise restrictions layered over user choice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnterprisePolicy {
    pub enabled: bool,
    /// Channels the user may select; empty means all.
    pub allowed_channels: Vec<ChannelKind>,
    /// When set, the channel is pinned regardless of user choice.
    pub forced_channel: Option<ChannelKind>,
}

/// Persisted update policy and channel state (`updates/config.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateSettings {
    pub enabled: bool,
    pub channel: ChannelKind,
    pub policy: ChannelPolicy,
    /// Backups retained past each successful install.
    pub keep_backups: usize,
    pub releases_url: String,
    pub bearer_token: Option<String>,
    pub rate_limit_per_hour: u32,
    pub cache_ttl_secs: u64,
    pub download_timeout_secs: u64,
    pub enterprise: EnterprisePolicy,
    pub channel_changes: Vec<ChannelChange>,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            channel: ChannelKind::Stable,
            policy: ChannelPolicy::for_channel(ChannelKind::Stable),
            keep_backups: 5,
            releases_url: "https://api.github.com/repos/delta-cli/delta/releases".to_string(),
            bearer_token: None,
            rate_limit_per_hour: 30,
            cache_ttl_secs: 300,
            download_timeout_secs: 600,
            enterprise: EnterprisePolicy::default(),
            channel_changes: Vec::new(),
        }
    }
}

impl UpdateSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let mut settings = if path.exists() {
            let text = read_file_with_context(path, "update settings")?;
            serde_json::from_str(&text).context("Malformed updates/config.json")?
        } else {
            Self::default()
        };
        settings.apply_env_overrides();
        settings.enforce_enterprise();
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json =
            serde_json::to_string_pretty(self).context("Failed to serialize update settings")?;
        atomic_write(path, json.as_bytes())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var(ENV_UPDATE_ENABLED) {
            match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => self.enabled = true,
                "0" | "false" | "no" => self.enabled = false,
                _ => {}
            }
        }
    }

    fn enforce_enterprise(&mut self) {
        if !self.enterprise.enabled {
            return;
        }
        if let Some(forced) = self.enterprise.forced_channel {
            if self.channel != forced {
                self.record_change(forced);
            }
        }
    }

    /// The URL releases are listed from, honouring the channel override.
    pub fn effective_releases_url(&self) -> &str {
        self.policy
            .custom_update_url
            .as_deref()
            .unwrap_or(&self.releases_url)
    }

    /// Switch channels. Enterprise mode restricts the selectable set and may
    /// pin the channel outright.
    pub fn switch_channel(&mut self, to: ChannelKind) -> Result<()> {
        if self.enterprise.enabled {
            if let Some(forced) = self.enterprise.forced_channel {
                anyhow::bail!("channel is pinned to {forced} by enterprise policy");
            }
            if !self.enterprise.allowed_channels.is_empty()
                && !self.enterprise.allowed_channels.contains(&to)
            {
                anyhow::bail!("channel {to} is not allowed by enterprise policy");
            }
        }
        if self.channel != to {
            self.record_change(to);
        }
        Ok(())
    }

    fn record_change(&mut self, to: ChannelKind) {
        self.channel_changes.push(ChannelChange {
            timestamp: Utc::now(),
            from: self.channel,
            to,
        });
        self.channel = to;
        self.policy = ChannelPolicy::for_channel(to);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn stable_denies_unverified_other_channels_allow() {
        assert!(!ChannelPolicy::for_channel(ChannelKind::Stable).allow_unverified);
        assert!(ChannelPolicy::for_channel(ChannelKind::Beta).allow_unverified);
        assert!(ChannelPolicy::for_channel(ChannelKind::Nightly).allow_unverified);
    }

    #[test]
    fn switch_records_a_change_entry() {
        let mut settings = UpdateSettings::default();
        settings.switch_channel(ChannelKind::Beta).unwrap();
        assert_eq!(settings.channel, ChannelKind::Beta);
        assert!(settings.policy.allow_prerelease);
        assert_eq!(settings.channel_changes.len(), 1);
        assert_eq!(settings.channel_changes[0].from, ChannelKind::Stable);
        assert_eq!(settings.channel_changes[0].to, ChannelKind::Beta);
    }

    #[test]
    fn switching_to_current_channel_records_nothing() {
        let mut settings = UpdateSettings::default();
        settings.switch_channel(ChannelKind::Stable).unwrap();
        assert!(settings.channel_changes.is_empty());
    }

    #[test]
    fn enterprise_allowed_set_is_enforced() {
        let mut settings = UpdateSettings {
            enterprise: EnterprisePolicy {
                enabled: true,
                allowed_channels: vec![ChannelKind::Stable, ChannelKind::Beta],
                forced_channel: None,
            },
            ..UpdateSettings::default()
        };
        assert!(settings.switch_channel(ChannelKind::Beta).is_ok());
        assert!(settings.switch_channel(ChannelKind::Nightly).is_err());
    }

    #[test]
    fn enterprise_forced_channel_blocks_switching() {
        let mut settings = UpdateSettings {
            enterprise: EnterprisePolicy {
                enabled: true,
                allowed_channels: vec![],
                forced_channel: Some(ChannelKind::Stable),
            },
            ..UpdateSettings::default()
        };
        assert!(settings.switch_channel(ChannelKind::Beta).is_err());
    }

    #[test]
    fn settings_round_trip_through_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let mut settings = UpdateSettings::default();
        settings.switch_channel(ChannelKind::Alpha).unwrap();
        settings.save(&path).unwrap();

        let loaded = UpdateSettings::load(&path).unwrap();
        assert_eq!(loaded.channel, ChannelKind::Alpha);
        assert_eq!(loaded.channel_changes.len(), 1);
        assert!(loaded.policy.auto_install);
    }
}
