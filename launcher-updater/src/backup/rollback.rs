//! Restoring the install tree from a backup.

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use zip::ZipArchive;

use super::{BackupManifest, BackupRecord, BackupVault, BACKUP_MANIFEST_NAME};
use crate::fs::atomic::{discard_file, is_safe_relative_path, replace_file, temp_sibling};
use crate::utils::errors::{Result, UpdateError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackReport {
    pub version: String,
    pub restored: usize,
    pub total: usize,
    /// Original paths that could not be restored
    pub failed: Vec<PathBuf>,
}

#[derive(Clone)]
pub struct RollbackManager {
    vault: Arc<BackupVault>,
}

impl RollbackManager {
    pub fn new(vault: Arc<BackupVault>) -> Self {
        Self { vault }
    }

    pub fn vault(&self) -> &Arc<BackupVault> {
        &self.vault
    }

    /// Snapshot `files` so that `version` can be restored later.
    pub fn prepare_rollback(&self, version: &str, files: &[PathBuf]) -> Result<BackupRecord> {
        self.vault
            .create_backup(version, files, &format!("Rollback point for {}", version))
    }

    /// Snapshot the current state before rolling back over it.
    pub fn create_pre_rollback_backup(&self, current_version: &str, files: &[PathBuf]) -> Result<BackupRecord> {
        let tag = format!("{}_pre_rollback", current_version);
        self.vault.create_backup(
            &tag,
            files,
            &format!("State of {} before rollback", current_version),
        )
    }

    pub fn rollback_options(&self) -> Result<Vec<BackupRecord>> {
        self.vault.list_backups()
    }

    /// Restore every file captured for `version` to its original location.
    ///
    /// Individual failures are logged and skipped; the rollback fails only
    /// when nothing could be restored.
    pub fn perform_rollback(&self, version: &str) -> Result<RollbackReport> {
        let record = self
            .vault
            .get_backup(version)?
            .ok_or_else(|| UpdateError::RollbackFailure(format!("no backup for version {}", version)))?;

        info!("Rolling back to {} from {}", version, record.filename);

        let scratch = tempfile::Builder::new()
            .prefix(".rollback-")
            .tempdir_in(self.vault.dir())
            .map_err(|e| UpdateError::RollbackFailure(format!("scratch area: {}", e)))?;

        let (manifest, extracted) = extract_backup(&self.vault.archive_path(&record), scratch.path())
            .map_err(|e| UpdateError::RollbackFailure(format!("{}: {}", record.filename, e)))?;

        let total = manifest.files.len();
        let mut restored = 0;
        let mut failed = Vec::new();

        for (entry, source) in manifest.files.iter().zip(extracted) {
            let Some(source) = source else {
                failed.push(entry.original_path.clone());
                continue;
            };
            match restore_file(&source, &entry.original_path) {
                Ok(()) => restored += 1,
                Err(e) => {
                    warn!("Failed to restore {}: {}", entry.original_path.display(), e);
                    failed.push(entry.original_path.clone());
                }
            }
        }

        if restored == 0 {
            error!("Rollback to {} restored nothing", version);
            return Err(UpdateError::RollbackFailure(format!(
                "restored 0 of {} files for version {}",
                total, version
            )));
        }

        info!("Rollback to {} restored {}/{} files", version, restored, total);
        Ok(RollbackReport {
            version: version.to_string(),
            restored,
            total,
            failed,
        })
    }

    pub async fn perform_rollback_async(&self, version: String) -> Result<RollbackReport> {
        let manager = self.clone();
        tokio::task::spawn_blocking(move || manager.perform_rollback(&version))
            .await
            .map_err(|e| UpdateError::RollbackFailure(e.to_string()))?
    }
}

/// Unpack the archive into `scratch`, one slot per manifest entry.
fn extract_backup(archive_path: &Path, scratch: &Path) -> Result<(BackupManifest, Vec<Option<PathBuf>>)> {
    let mut archive = ZipArchive::new(File::open(archive_path)?)?;
    let manifest: BackupManifest = {
        let mut entry = archive.by_name(BACKUP_MANIFEST_NAME)?;
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes)?;
        serde_json::from_slice(&bytes)?
    };

    let mut extracted = Vec::with_capacity(manifest.files.len());
    for (index, file) in manifest.files.iter().enumerate() {
        if !is_safe_relative_path(&file.path) {
            warn!("Backup entry has unsafe name '{}'", file.path);
            extracted.push(None);
            continue;
        }
        let dest = scratch.join(index.to_string());
        let result = archive
            .by_name(&file.path)
            .map_err(UpdateError::from)
            .and_then(|mut entry| {
                let mut out = File::create(&dest)?;
                io::copy(&mut entry, &mut out)?;
                Ok(())
            });
        match result {
            Ok(()) => extracted.push(Some(dest)),
            Err(e) => {
                warn!("Cannot extract '{}' from backup: {}", file.path, e);
                extracted.push(None);
            }
        }
    }
    Ok((manifest, extracted))
}

fn restore_file(source: &Path, original: &Path) -> io::Result<()> {
    if let Some(parent) = original.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_sibling(original, ".restore.tmp");
    fs::copy(source, &tmp)?;
    replace_file(&tmp, original).inspect_err(|_| {
        discard_file(&tmp);
    })
}
