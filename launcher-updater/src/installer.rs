//! Safe extraction of update archives into the install tree.
//!
//! Every entry is checked before any byte is written: absolute names and
//! `..` segments are skipped, extensions must be on the allow-list, the
//! resolved destination must stay under the target root, and the running
//! total of extracted bytes is capped. Each file lands through a temp file
//! and an atomic rename.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use zip::ZipArchive;

use crate::fs::atomic::{
    discard_file, is_safe_relative_path, normalize_lexically, replace_file, temp_sibling,
};
use crate::utils::errors::{Result, UpdateError};

/// Ceiling on the archive file itself (1GB)
pub const DEFAULT_MAX_ARCHIVE_SIZE: u64 = 1024 * 1024 * 1024;

/// Ceiling on the sum of extracted bytes (4GB)
pub const DEFAULT_MAX_EXTRACTED_SIZE: u64 = 4 * 1024 * 1024 * 1024;

const DEFAULT_ALLOWED_EXTENSIONS: &[&str] = &[
    "exe", "dll", "so", "dylib", "bin", "dat", "pak", "pck", "json", "txt", "cfg", "ini", "xml",
    "yaml", "yml", "toml", "png", "jpg", "jpeg", "gif", "bmp", "ico", "svg", "webp", "wav", "ogg",
    "mp3", "flac", "mp4", "webm", "ttf", "otf", "woff", "woff2", "lua", "js", "css", "html",
    "csv", "db", "manifest", "sig", "pem", "md",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallerLimits {
    pub max_archive_size: u64,
    pub max_extracted_size: u64,
    /// Lower-case extensions without the dot
    pub allowed_extensions: HashSet<String>,
}

impl Default for InstallerLimits {
    fn default() -> Self {
        Self {
            max_archive_size: DEFAULT_MAX_ARCHIVE_SIZE,
            max_extracted_size: DEFAULT_MAX_EXTRACTED_SIZE,
            allowed_extensions: DEFAULT_ALLOWED_EXTENSIONS
                .iter()
                .map(|e| e.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    PathTraversal,
    DisallowedExtension,
    EscapesTarget,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractReport {
    /// `/`-separated names of the files written
    pub extracted: Vec<String>,
    pub skipped: Vec<(String, SkipReason)>,
    pub bytes_written: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SafeArchiveInstaller {
    limits: InstallerLimits,
}

impl SafeArchiveInstaller {
    pub fn new(limits: InstallerLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &InstallerLimits {
        &self.limits
    }

    /// Extract on the blocking pool.
    pub async fn extract_async(&self, archive: PathBuf, target_dir: PathBuf) -> Result<ExtractReport> {
        let installer = self.clone();
        tokio::task::spawn_blocking(move || installer.extract(&archive, &target_dir))
            .await
            .map_err(|e| UpdateError::Io(io::Error::other(e)))?
    }

    pub fn extract(&self, archive_path: &Path, target_dir: &Path) -> Result<ExtractReport> {
        let archive_size = fs::metadata(archive_path)?.len();
        if archive_size > self.limits.max_archive_size {
            return Err(UpdateError::SizeLimitExceeded {
                what: archive_path.display().to_string(),
                size: archive_size,
                limit: self.limits.max_archive_size,
            });
        }

        fs::create_dir_all(target_dir)?;
        let root = fs::canonicalize(target_dir)?;

        let mut archive = ZipArchive::new(File::open(archive_path)?)?;
        let mut report = ExtractReport::default();

        for index in 0..archive.len() {
            let mut entry = archive.by_index(index)?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().replace('\\', "/");

            if let Err(reason) = self.check_entry(&name) {
                warn!("Skipping archive entry '{}': {:?}", name, reason);
                report.skipped.push((name, reason));
                continue;
            }

            let dest = normalize_lexically(&root.join(&name));
            if !dest.starts_with(&root) || dest == root {
                warn!("Skipping archive entry '{}': resolves outside target", name);
                report.skipped.push((name, SkipReason::EscapesTarget));
                continue;
            }

            let remaining = self
                .limits
                .max_extracted_size
                .saturating_sub(report.bytes_written);
            let written = write_entry(&mut entry, &dest, remaining).map_err(|e| match e {
                EntryError::TooLarge => UpdateError::SizeLimitExceeded {
                    what: format!("extracted contents of {}", archive_path.display()),
                    size: report.bytes_written + remaining + 1,
                    limit: self.limits.max_extracted_size,
                },
                EntryError::Io(e) => UpdateError::Io(e),
            })?;

            report.bytes_written += written;
            report.extracted.push(name);
        }

        info!(
            "Extracted {} files ({} bytes) from {}, skipped {}",
            report.extracted.len(),
            report.bytes_written,
            archive_path.display(),
            report.skipped.len()
        );
        Ok(report)
    }

    fn check_entry(&self, name: &str) -> std::result::Result<(), SkipReason> {
        if !is_safe_relative_path(name) {
            return Err(SkipReason::PathTraversal);
        }
        let extension = Path::new(name)
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase());
        match extension {
            Some(ext) if self.limits.allowed_extensions.contains(&ext) => Ok(()),
            _ => Err(SkipReason::DisallowedExtension),
        }
    }
}

enum EntryError {
    TooLarge,
    Io(io::Error),
}

impl From<io::Error> for EntryError {
    fn from(e: io::Error) -> Self {
        EntryError::Io(e)
    }
}

/// Copy at most `remaining` bytes into a temp sibling, then rename it over
/// `dest`. Declared entry sizes are not trusted; the copy itself is bounded.
fn write_entry<R: Read>(reader: &mut R, dest: &Path, remaining: u64) -> std::result::Result<u64, EntryError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_sibling(dest, ".tmp");
    let result = (|| -> std::result::Result<u64, EntryError> {
        let mut out = File::create(&tmp)?;
        let mut bounded = (&mut *reader).take(remaining.saturating_add(1));
        let copied = io::copy(&mut bounded, &mut out)?;
        if copied > remaining {
            return Err(EntryError::TooLarge);
        }
        out.flush()?;
        drop(out);
        replace_file(&tmp, dest)?;
        Ok(copied)
    })();
    if result.is_err() {
        discard_file(&tmp);
    }
    result
}
