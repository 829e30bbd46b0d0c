//! Temp-file-then-rename writes and relative path validation.

use serde::Serialize;
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use tracing::warn;

/// Sibling scratch path used while `path` is being written.
pub fn temp_sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Best-effort removal of scratch output. A missing file is fine,
/// anything else is logged.
pub fn discard_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove {:?}: {}", path, e);
        }
    }
}

pub async fn discard_file_async(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove {:?}: {}", path, e);
        }
    }
}

/// Move `source` over `dest`. Readers see either the old or the new file.
pub fn replace_file(source: &Path, dest: &Path) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    match fs::rename(source, dest) {
        Ok(()) => Ok(()),
        Err(_) if dest.exists() => {
            // Some platforms refuse to rename over an existing file
            fs::remove_file(dest)?;
            fs::rename(source, dest)
        }
        Err(e) => Err(e),
    }
}

/// Write `bytes` to `dest` through a `.tmp` sibling.
pub fn write_atomic(dest: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = temp_sibling(dest, ".tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    replace_file(&tmp, dest)
}

pub fn write_json_atomic<T: Serialize>(dest: &Path, value: &T) -> io::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    write_atomic(dest, &bytes)
}

/// A relative path with no root, prefix or `..` components.
pub fn is_safe_relative_path(raw: &str) -> bool {
    let normalized = raw.replace('\\', "/");
    if normalized.is_empty() || normalized.starts_with('/') {
        return false;
    }
    // Drive letters such as `C:` on a non-Windows host
    if normalized.as_bytes().get(1) == Some(&b':') {
        return false;
    }
    let path = Path::new(&normalized);
    path.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Lexically resolve `.` and `..` without touching the file system.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discard_file_tolerates_missing() -> io::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("scratch.tmp");
        fs::write(&path, b"x")?;
        discard_file(&path);
        assert!(!path.exists());
        discard_file(&path);
        Ok(())
    }
    use tempfile::TempDir;

    #[test]
    fn test_safe_relative_paths() {
        assert!(is_safe_relative_path("bin/game.exe"));
        assert!(is_safe_relative_path("./data/a.pak"));
        assert!(!is_safe_relative_path("../../evil.txt"));
        assert!(!is_safe_relative_path("data/../../evil.txt"));
        assert!(!is_safe_relative_path("/etc/passwd"));
        assert!(!is_safe_relative_path("..\\windows\\evil.dll"));
        assert!(!is_safe_relative_path("C:/evil.dll"));
        assert!(!is_safe_relative_path(""));
    }

    #[test]
    fn test_normalize_lexically() {
        assert_eq!(
            normalize_lexically(Path::new("/root/a/./b/../c")),
            PathBuf::from("/root/a/c")
        );
    }

    #[test]
    fn test_write_atomic_replaces() -> io::Result<()> {
        let dir = TempDir::new()?;
        let dest = dir.path().join("nested/state.json");
        write_atomic(&dest, b"one")?;
        write_atomic(&dest, b"two")?;
        assert_eq!(fs::read(&dest)?, b"two");
        assert!(!temp_sibling(&dest, ".tmp").exists());
        Ok(())
    }
}
