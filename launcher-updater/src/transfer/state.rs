//! Persisted resume state for an in-flight download.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::fs::atomic::{temp_sibling, write_json_atomic};
use crate::Result;

pub const READ_CHUNK_SIZE: usize = 8192;

/// Sidecar describing how far a `<dest>.tmp` file has progressed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferState {
    pub url: String,
    pub dest_path: PathBuf,
    pub total_size: Option<u64>,
    pub downloaded_size: u64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub supports_resume: bool,
    /// Read size used while streaming the body
    pub chunk_size: usize,
}

impl TransferState {
    pub fn new(url: &str, dest: &Path) -> Self {
        Self {
            url: url.to_string(),
            dest_path: dest.to_path_buf(),
            total_size: None,
            downloaded_size: 0,
            etag: None,
            last_modified: None,
            supports_resume: false,
            chunk_size: READ_CHUNK_SIZE,
        }
    }

    /// `<dest>.tmp`
    pub fn temp_path(dest: &Path) -> PathBuf {
        temp_sibling(dest, ".tmp")
    }

    /// `<dest>.state`
    pub fn state_path(dest: &Path) -> PathBuf {
        temp_sibling(dest, ".state")
    }

    /// Load the state for `dest`, treating a corrupt sidecar as absent.
    pub fn load(dest: &Path) -> Option<Self> {
        let raw = std::fs::read(Self::state_path(dest)).ok()?;
        match serde_json::from_slice(&raw) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!("Ignoring unreadable transfer state for {:?}: {}", dest, e);
                None
            }
        }
    }

    pub fn save(&self, dest: &Path) -> Result<()> {
        write_json_atomic(&Self::state_path(dest), self)?;
        Ok(())
    }

    /// Delete both sidecar files for `dest`.
    pub fn discard(dest: &Path) {
        for path in [Self::temp_path(dest), Self::state_path(dest)] {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Failed to remove {:?}: {}", path, e);
                }
            }
        }
    }

    /// Whether the remote resource is provably unchanged since this state was written.
    pub fn validators_match(&self, etag: Option<&str>, last_modified: Option<&str>) -> bool {
        let mut compared = false;
        if let (Some(ours), Some(theirs)) = (self.etag.as_deref(), etag) {
            if ours != theirs {
                return false;
            }
            compared = true;
        }
        if let (Some(ours), Some(theirs)) = (self.last_modified.as_deref(), last_modified) {
            if ours != theirs {
                return false;
            }
            compared = true;
        }
        compared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_state_paths() {
        let dest = Path::new("/data/downloads/files_list_v1.0.3.zip");
        assert_eq!(
            TransferState::temp_path(dest),
            Path::new("/data/downloads/files_list_v1.0.3.zip.tmp")
        );
        assert_eq!(
            TransferState::state_path(dest),
            Path::new("/data/downloads/files_list_v1.0.3.zip.state")
        );
    }

    #[test]
    fn test_save_and_load() -> Result<()> {
        let dir = TempDir::new()?;
        let dest = dir.path().join("archive.zip");
        let mut state = TransferState::new("https://cdn.example.com/archive.zip", &dest);
        state.total_size = Some(4096);
        state.downloaded_size = 1024;
        state.etag = Some("\"abc\"".to_string());
        state.save(&dest)?;

        assert_eq!(TransferState::load(&dest), Some(state));

        TransferState::discard(&dest);
        assert!(TransferState::load(&dest).is_none());
        Ok(())
    }

    #[test]
    fn test_corrupt_state_ignored() -> Result<()> {
        let dir = TempDir::new()?;
        let dest = dir.path().join("archive.zip");
        std::fs::write(TransferState::state_path(&dest), b"{not json")?;
        assert!(TransferState::load(&dest).is_none());
        Ok(())
    }

    #[test]
    fn test_validators() {
        let mut state = TransferState::new("https://cdn.example.com/a", Path::new("a"));
        assert!(!state.validators_match(None, None));

        state.etag = Some("v1".to_string());
        assert!(state.validators_match(Some("v1"), None));
        assert!(!state.validators_match(Some("v2"), None));

        state.last_modified = Some("Mon, 01 Jan 2024 00:00:00 GMT".to_string());
        assert!(!state.validators_match(Some("v1"), Some("Tue, 02 Jan 2024 00:00:00 GMT")));
        assert!(state.validators_match(None, Some("Mon, 01 Jan 2024 00:00:00 GMT")));
    }
}
