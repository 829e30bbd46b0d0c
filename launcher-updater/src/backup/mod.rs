//! Versioned backups of the install tree.
//!
//! Each backup is a zip archive holding the captured files plus a
//! `backup_manifest.json` describing where every file came from. A JSON
//! index keyed by version tag lists the archives in the vault.

pub mod rollback;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::fs::atomic::{discard_file, replace_file, temp_sibling, write_json_atomic};
use crate::fs::walker::{normalize_relative, walk_directory, WalkOptions};
use crate::utils::errors::{Result, UpdateError};

pub use rollback::{RollbackManager, RollbackReport};

pub const INDEX_FILE: &str = "backup_index.json";
pub const BACKUP_MANIFEST_NAME: &str = "backup_manifest.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub filename: String,
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub description: String,
    pub files_count: usize,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupFileEntry {
    /// Name inside the archive
    pub path: String,
    pub size: u64,
    pub original_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub files: Vec<BackupFileEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageStats {
    pub total_backups: usize,
    pub total_size_bytes: u64,
    pub backup_dir: PathBuf,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

pub struct BackupVault {
    dir: PathBuf,
    /// Paths inside this root are archived relative to it
    root: PathBuf,
    index: Mutex<BTreeMap<String, BackupRecord>>,
}

impl BackupVault {
    /// Open (or create) a vault in `dir` for files under `root`.
    pub fn open(dir: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let index_path = dir.join(INDEX_FILE);
        let index = if index_path.exists() {
            match fs::read(&index_path).map(|b| serde_json::from_slice(&b)) {
                Ok(Ok(index)) => index,
                Ok(Err(e)) => {
                    warn!("Backup index is corrupt, starting empty: {}", e);
                    BTreeMap::new()
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            dir,
            root: root.into(),
            index: Mutex::new(index),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn archive_path(&self, record: &BackupRecord) -> PathBuf {
        self.dir.join(&record.filename)
    }

    fn lock_index(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, BackupRecord>>> {
        self.index
            .lock()
            .map_err(|_| UpdateError::BackupFailure("backup index lock poisoned".to_string()))
    }

    fn save_index(&self, index: &BTreeMap<String, BackupRecord>) -> Result<()> {
        write_json_atomic(&self.dir.join(INDEX_FILE), index)?;
        Ok(())
    }

    fn archive_name_for(&self, file: &Path) -> String {
        match file.strip_prefix(&self.root) {
            Ok(relative) if !relative.as_os_str().is_empty() => normalize_relative(relative),
            _ => file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unnamed".to_string()),
        }
    }

    /// Archive `files` under `version`, replacing any earlier backup with
    /// the same tag. Missing files are skipped.
    pub fn create_backup(&self, version: &str, files: &[PathBuf], description: &str) -> Result<BackupRecord> {
        let existing: Vec<&PathBuf> = files.iter().filter(|f| f.is_file()).collect();
        if existing.is_empty() {
            return Err(UpdateError::BackupFailure(format!(
                "no files to back up for version {}",
                version
            )));
        }

        let created_at = Utc::now();
        let filename = format!(
            "backup_v{}_{}.zip",
            version,
            created_at.format("%Y%m%d_%H%M%S_%3f")
        );
        let archive_path = self.dir.join(&filename);
        let tmp_path = temp_sibling(&archive_path, ".tmp");

        let result = (|| -> Result<Vec<BackupFileEntry>> {
            let mut writer = ZipWriter::new(File::create(&tmp_path)?);
            let options =
                SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
            let mut entries = Vec::with_capacity(existing.len());
            let mut used_names = HashSet::new();

            for file in existing {
                let mut name = self.archive_name_for(file);
                if !used_names.insert(name.clone()) {
                    name = format!("{}_{}", entries.len(), name);
                    used_names.insert(name.clone());
                }
                let original_path = fs::canonicalize(file)?;
                writer.start_file(name.as_str(), options)?;
                let size = io::copy(&mut File::open(file)?, &mut writer)?;
                entries.push(BackupFileEntry {
                    path: name,
                    size,
                    original_path,
                });
            }

            let manifest = BackupManifest {
                version: version.to_string(),
                created_at,
                files: entries.clone(),
            };
            writer.start_file(BACKUP_MANIFEST_NAME, options)?;
            writer.write_all(&serde_json::to_vec_pretty(&manifest)?)?;
            writer.finish()?;
            replace_file(&tmp_path, &archive_path)?;
            Ok(entries)
        })();

        let entries = match result {
            Ok(entries) => entries,
            Err(e) => {
                discard_file(&tmp_path);
                return Err(UpdateError::BackupFailure(e.to_string()));
            }
        };

        let record = BackupRecord {
            filename,
            version: version.to_string(),
            created_at,
            description: description.to_string(),
            files_count: entries.len(),
            size_bytes: fs::metadata(&archive_path)?.len(),
        };

        let mut index = self.lock_index()?;
        if let Some(previous) = index.insert(version.to_string(), record.clone()) {
            if previous.filename != record.filename {
                discard_file(&self.dir.join(&previous.filename));
            }
        }
        self.save_index(&index)?;

        info!(
            "Created backup {} ({} files, {} bytes)",
            record.filename, record.files_count, record.size_bytes
        );
        Ok(record)
    }

    /// Newest first.
    pub fn list_backups(&self) -> Result<Vec<BackupRecord>> {
        let index = self.lock_index()?;
        let mut records: Vec<BackupRecord> = index.values().cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    pub fn get_backup(&self, version: &str) -> Result<Option<BackupRecord>> {
        Ok(self.lock_index()?.get(version).cloned())
    }

    pub fn latest_backup(&self) -> Result<Option<BackupRecord>> {
        Ok(self.list_backups()?.into_iter().next())
    }

    pub fn delete_backup(&self, version: &str) -> Result<bool> {
        let mut index = self.lock_index()?;
        let Some(record) = index.remove(version) else {
            return Ok(false);
        };
        let archive = self.dir.join(&record.filename);
        if archive.exists() {
            fs::remove_file(&archive)?;
        }
        self.save_index(&index)?;
        info!("Deleted backup {}", record.filename);
        Ok(true)
    }

    /// Keep only the `keep_count` most recent backups. Returns how many went.
    pub fn cleanup_old_backups(&self, keep_count: usize) -> Result<usize> {
        let stale: Vec<String> = self
            .list_backups()?
            .into_iter()
            .skip(keep_count)
            .map(|r| r.version)
            .collect();
        let mut removed = 0;
        for version in stale {
            if self.delete_backup(&version)? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Removed {} old backups", removed);
        }
        Ok(removed)
    }

    pub fn storage_stats(&self) -> Result<StorageStats> {
        let records = self.list_backups()?;
        Ok(StorageStats {
            total_backups: records.len(),
            total_size_bytes: records.iter().map(|r| r.size_bytes).sum(),
            backup_dir: self.dir.clone(),
            oldest: records.last().map(|r| r.created_at),
            newest: records.first().map(|r| r.created_at),
        })
    }
}

/// Every installed file worth capturing before an update.
pub fn collect_install_files(install_dir: &Path) -> io::Result<Vec<PathBuf>> {
    Ok(walk_directory(install_dir, WalkOptions::default())?
        .into_iter()
        .map(|f| f.path)
        .collect())
}
