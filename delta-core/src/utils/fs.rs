//! Filesystem helpers with contextual error reporting.

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

/// Create a directory (and parents) if it does not already exist.
pub fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory {}", path.display()))?;
    }
    Ok(())
}

/// Write file contents, describing what the file holds on failure.
pub fn write_file_with_context(path: &Path, contents: &str, description: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir_exists(parent)?;
    }
    fs::write(path, contents)
        .with_context(|| format!("Failed to write {} to {}", description, path.display()))
}

/// Read a file to a string, describing what the file holds on failure.
pub fn read_file_with_context(path: &Path, description: &str) -> Result<String> {
    fs::read_to_string(path)
        .with_context(|| format!("Failed to read {} from {}", description, path.display()))
}

/// Write `contents` to `path` atomically: write a sibling temp file, fsync,
/// then rename into place. The rename is the commit point.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    ensure_dir_exists(parent)?;

    let staged = parent.join(format!(
        ".{}.tmp",
        path.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("staged")
    ));

    {
        let mut file = fs::File::create(&staged)
            .with_context(|| format!("Failed to create staging file {}", staged.display()))?;
        file.write_all(contents)
            .with_context(|| format!("Failed to write staging file {}", staged.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync staging file {}", staged.display()))?;
    }

    fs::rename(&staged, path).with_context(|| {
        let _ = fs::remove_file(&staged);
        format!("Failed to move staged file into {}", path.display())
    })
}

/// Copy a file preserving its permission bits (notably the executable bit).
pub fn copy_preserving_permissions(from: &Path, to: &Path) -> Result<u64> {
    if let Some(parent) = to.parent() {
        ensure_dir_exists(parent)?;
    }
    // std::fs::copy carries permissions on unix; assert it explicitly so a
    // future refactor cannot silently lose the executable bit.
    let copied = fs::copy(from, to)
        .with_context(|| format!("Failed to copy {} to {}", from.display(), to.display()))?;

    #[cfg(unix)]
    {
        let perms = fs::metadata(from)
            .with_context(|| format!("Failed to stat {}", from.display()))?
            .permissions();
        fs::set_permissions(to, perms)
            .with_context(|| format!("Failed to set permissions on {}", to.display()))?;
    }

    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_creates_and_replaces() -> Result<()> {
        let dir = TempDir::new()?;
        let target = dir.path().join("out.json");

        atomic_write(&target, b"first")?;
        assert_eq!(fs::read(&target)?, b"first");

        atomic_write(&target, b"second")?;
        assert_eq!(fs::read(&target)?, b"second");

        // No staging file left behind.
        let leftovers: Vec<_> = fs::read_dir(dir.path())?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn copy_keeps_executable_bit() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new()?;
        let src = dir.path().join("bin");
        fs::write(&src, b"#!/bin/sh\n")?;
        fs::set_permissions(&src, fs::Permissions::from_mode(0o755))?;

        let dst = dir.path().join("bin-copy");
        copy_preserving_permissions(&src, &dst)?;

        let mode = fs::metadata(&dst)?.permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
        Ok(())
    }
}
