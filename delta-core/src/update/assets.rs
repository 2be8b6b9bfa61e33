//! Platform-aware release asset selection.
//!
//! Scores each asset name against the running platform; deterministic ties
//! are broken by first-seen order in the release's asset list.

use crate::update::release::ReleaseAsset;

const PLATFORM_MATCH: i32 = 10;
const ARCH_MATCH: i32 = 5;
const ARCHIVE_PREFERENCE: i32 = 2;
const SOURCE_PENALTY: i32 = -8;

/// Pick the best asset for `(os, arch)`, e.g. `("linux", "x86_64")`.
pub fn select_asset<'a>(
    assets: &'a [ReleaseAsset],
    os: &str,
    arch: &str,
) -> Option<&'a ReleaseAsset> {
    let mut best: Option<(&ReleaseAsset, i32)> = None;
    for asset in assets {
        let score = score_asset(&asset.name, os, arch);
        if score <= 0 {
            continue;
        }
        match best {
            // Strictly-greater keeps the first seen on ties.
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((asset, score)),
        }
    }
    best.map(|(asset, _)| asset)
}

/// Pick for the compile-time platform.
pub fn select_asset_for_current<'a>(assets: &'a [ReleaseAsset]) -> Option<&'a ReleaseAsset> {
    select_asset(assets, std::env::consts::OS, std::env::consts::ARCH)
}

fn score_asset(name: &str, os: &str, arch: &str) -> i32 {
    let lower = name.to_ascii_lowercase();
    let mut score = 0;

    if platform_tokens(os).iter().any(|token| lower.contains(token)) {
        score += PLATFORM_MATCH;
    }
    if arch_tokens(arch).iter().any(|token| lower.contains(token)) {
        score += ARCH_MATCH;
    }
    if [".tar.gz", ".tgz", ".zip", ".tar.xz"]
        .iter()
        .any(|ext| lower.ends_with(ext))
    {
        score += ARCHIVE_PREFERENCE;
    }
    if lower.contains("source") || lower.contains("src") {
        score += SOURCE_PENALTY;
    }
    score
}

fn platform_tokens(os: &str) -> &'static [&'static str] {
    match os {
        "macos" => &["darwin", "macos", "apple", "osx"],
        "linux" => &["linux"],
        "windows" => &["windows", "win64", "win32"],
        _ => &[],
    }
}

fn arch_tokens(arch: &str) -> &'static [&'static str] {
    match arch {
        "x86_64" => &["x86_64", "amd64", "x64"],
        "aarch64" => &["aarch64", "arm64"],
        "arm" => &["armv7", "arm"],
        _ => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asset(name: &str) -> ReleaseAsset {
        ReleaseAsset {
            name: name.to_string(),
            content_type: "application/octet-stream".to_string(),
            size: 0,
            download_url: format!("https://example.com/{name}"),
            expected_sha256: None,
        }
    }

    #[test]
    fn picks_matching_platform_and_arch() {
        let assets = vec![
            asset("delta-v1.0.0-x86_64-apple-darwin.tar.gz"),
            asset("delta-v1.0.0-x86_64-unknown-linux-musl.tar.gz"),
            asset("delta-v1.0.0-aarch64-unknown-linux-gnu.tar.gz"),
        ];
        let chosen = select_asset(&assets, "linux", "x86_64").unwrap();
        assert!(chosen.name.contains("linux") && chosen.name.contains("x86_64"));

        let chosen = select_asset(&assets, "macos", "x86_64").unwrap();
        assert!(chosen.name.contains("darwin"));

        let chosen = select_asset(&assets, "linux", "aarch64").unwrap();
        assert!(chosen.name.contains("aarch64"));
    }

    #[test]
    fn amd64_alias_matches_x86_64() {
        let assets = vec![asset("delta_linux_amd64.tar.gz")];
        assert!(select_asset(&assets, "linux", "x86_64").is_some());
    }

    #[test]
    fn source_archives_are_penalised() {
        let assets = vec![
            asset("delta-v1.0.0-source.tar.gz"),
            asset("delta-v1.0.0-linux-x86_64.tar.gz"),
        ];
        let chosen = select_asset(&assets, "linux", "x86_64").unwrap();
        assert!(!chosen.name.contains("source"));
    }

    #[test]
    fn no_match_returns_none() {
        let assets = vec![asset("delta-v1.0.0-windows-x64.zip")];
        assert!(select_asset(&assets, "linux", "x86_64").is_none());
    }

    #[test]
    fn ties_break_first_seen() {
        let assets = vec![
            asset("delta-linux-x86_64.tar.gz"),
            asset("delta-x86_64-linux.tar.gz"),
        ];
        let chosen = select_asset(&assets, "linux", "x86_64").unwrap();
        assert_eq!(chosen.name, "delta-linux-x86_64.tar.gz");
    }
}
