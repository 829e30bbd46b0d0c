//! Delta package generation and transactional application.
//!
//! Package layout (zip, deflate):
//!
//! ```text
//! delta_manifest.json        {source_version, target_version, changes, created_at}
//! files/<path>               full payload for add/replace
//! deltas/<path>.delta        binary patch for modify
//! ```
//!
//! Applying stages every output inside the target tree first, then commits
//! with renames. Originals are parked in the staging area during the commit
//! so that a failure part-way can be undone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::binary::{apply_delta, compute_delta, delta_compression_ratio};
use super::manifest::{build_manifest, diff, ChangeKind, FileChange};
use crate::fs::atomic::{discard_file, is_safe_relative_path, replace_file};
use crate::integrity::hash::{sha256_bytes, sha256_file};
use crate::utils::errors::{Result, UpdateError};

pub const DELTA_MANIFEST_NAME: &str = "delta_manifest.json";

/// Patches larger than this share of the new file are replaced by the file
const REPLACE_RATIO: f64 = 0.8;

/// A delta is only worth shipping below this share of the new size
const BENEFICIAL_RATIO: f64 = 0.7;

/// Upper bound on a patched file when the manifest omits its size
const DEFAULT_PATCH_OUTPUT_LIMIT: usize = 2 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaPackageManifest {
    pub source_version: String,
    pub target_version: String,
    pub changes: Vec<FileChange>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaInfo {
    pub source_version: String,
    pub target_version: String,
    /// Size of the package file
    pub delta_size: u64,
    /// Size of the full target tree
    pub original_size: u64,
    pub compression_ratio: f64,
    pub files_count: usize,
    pub created_at: DateTime<Utc>,
    pub package_path: PathBuf,
}

pub fn delta_package_name(source_version: &str, target_version: &str) -> String {
    format!("delta_{}_to_{}.zip", source_version, target_version)
}

fn payload_name(path: &str) -> String {
    format!("files/{}", path)
}

fn patch_name(path: &str) -> String {
    format!("deltas/{}.delta", path)
}

/// True iff both sizes are non-zero and `delta_size / new_size < 0.7`.
pub fn is_delta_beneficial(old_size: u64, new_size: u64, delta_size: u64) -> bool {
    if old_size == 0 || new_size == 0 {
        return false;
    }
    (delta_size as f64 / new_size as f64) < BENEFICIAL_RATIO
}

/// Build `delta_<old>_to_<new>.zip` in `output_dir`.
///
/// Returns None when the trees are identical; no package is written then.
pub fn generate_delta(
    old_dir: &Path,
    new_dir: &Path,
    old_version: &str,
    new_version: &str,
    output_dir: &Path,
) -> Result<Option<DeltaInfo>> {
    let old_manifest = build_manifest(old_dir)?;
    let new_manifest = build_manifest(new_dir)?;
    let mut changes = diff(&old_manifest, &new_manifest);

    if changes.is_empty() {
        info!("No changes between {} and {}", old_version, new_version);
        return Ok(None);
    }

    fs::create_dir_all(output_dir)?;
    let package_path = output_dir.join(delta_package_name(old_version, new_version));
    let mut writer = ZipWriter::new(File::create(&package_path)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for change in changes.iter_mut() {
        match change.kind {
            ChangeKind::Add | ChangeKind::Replace => {
                writer.start_file(payload_name(&change.path), options)?;
                io::copy(&mut File::open(new_dir.join(&change.path))?, &mut writer)?;
            }
            ChangeKind::Modify => {
                let old_data = fs::read(old_dir.join(&change.path))?;
                let new_data = fs::read(new_dir.join(&change.path))?;
                let patch = compute_delta(&old_data, &new_data)?;
                let ratio = delta_compression_ratio(patch.len() as u64, new_data.len() as u64);

                if new_data.is_empty() || ratio > REPLACE_RATIO {
                    debug!(
                        "Patch for {} is {:.0}% of the file, shipping it whole",
                        change.path,
                        ratio * 100.0
                    );
                    change.kind = ChangeKind::Replace;
                    writer.start_file(payload_name(&change.path), options)?;
                    writer.write_all(&new_data)?;
                } else {
                    change.delta_size = Some(patch.len() as u64);
                    writer.start_file(patch_name(&change.path), options)?;
                    writer.write_all(&patch)?;
                }
            }
            ChangeKind::Delete => {}
        }
    }

    let manifest = DeltaPackageManifest {
        source_version: old_version.to_string(),
        target_version: new_version.to_string(),
        changes,
        created_at: Utc::now(),
    };
    writer.start_file(DELTA_MANIFEST_NAME, options)?;
    writer.write_all(&serde_json::to_vec_pretty(&manifest)?)?;
    writer.finish()?;

    let delta_size = fs::metadata(&package_path)?.len();
    let original_size: u64 = new_manifest.values().map(|s| s.size).sum();
    let delta_info = DeltaInfo {
        source_version: manifest.source_version,
        target_version: manifest.target_version,
        delta_size,
        original_size,
        compression_ratio: delta_compression_ratio(delta_size, original_size),
        files_count: manifest.changes.len(),
        created_at: manifest.created_at,
        package_path,
    };

    info!(
        "Created delta {} -> {}: {} changes, {} bytes ({:.1}% of full tree)",
        old_version,
        new_version,
        delta_info.files_count,
        delta_size,
        delta_info.compression_ratio * 100.0
    );
    Ok(Some(delta_info))
}

/// Read only the change manifest from a package.
pub fn read_package_manifest(package: &Path) -> Result<DeltaPackageManifest> {
    let mut archive = ZipArchive::new(File::open(package)?)?;
    let mut entry = archive.by_name(DELTA_MANIFEST_NAME)?;
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Progress callback: (changes done, total changes)
pub type ApplyProgress<'a> = &'a (dyn Fn(usize, usize) + Send + Sync);

/// Apply a package to `target_dir`. Either every change lands or none does.
///
/// With `expected_source` set, a package built from another version is
/// rejected up front.
pub fn apply_delta_package(
    package: &Path,
    target_dir: &Path,
    expected_source: Option<&str>,
    progress: Option<ApplyProgress<'_>>,
) -> Result<usize> {
    apply_inner(package, target_dir, expected_source, progress)
        .map_err(|e| match e {
            UpdateError::DeltaApplyFailure(_) => e,
            other => UpdateError::DeltaApplyFailure(other.to_string()),
        })
}

fn apply_inner(
    package: &Path,
    target_dir: &Path,
    expected_source: Option<&str>,
    progress: Option<ApplyProgress<'_>>,
) -> Result<usize> {
    let mut archive = ZipArchive::new(File::open(package)?)?;
    let manifest: DeltaPackageManifest = {
        let mut entry = archive.by_name(DELTA_MANIFEST_NAME)?;
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes)?;
        serde_json::from_slice(&bytes)?
    };

    if let Some(expected) = expected_source {
        if manifest.source_version != expected {
            return Err(UpdateError::DeltaApplyFailure(format!(
                "package is based on {}, installed version is {}",
                manifest.source_version, expected
            )));
        }
    }

    for change in &manifest.changes {
        if !is_safe_relative_path(&change.path) {
            return Err(UpdateError::PathTraversalAttempt(change.path.clone()));
        }
    }

    fs::create_dir_all(target_dir)?;
    let staging = tempfile::Builder::new()
        .prefix(".delta-staging-")
        .tempdir_in(target_dir)?;

    // Phase 1: stage every output without touching the tree
    let total = manifest.changes.len();
    let mut staged: Vec<Option<PathBuf>> = Vec::with_capacity(total);
    for (index, change) in manifest.changes.iter().enumerate() {
        let staged_path = staging.path().join(format!("{}.new", index));
        let output = match change.kind {
            ChangeKind::Delete => None,
            ChangeKind::Add | ChangeKind::Replace => {
                let mut entry = archive.by_name(&payload_name(&change.path))?;
                let mut out = File::create(&staged_path)?;
                io::copy(&mut entry, &mut out)?;
                out.flush()?;
                Some(staged_path)
            }
            ChangeKind::Modify => {
                let base_path = target_dir.join(&change.path);
                let base = fs::read(&base_path).map_err(|e| {
                    UpdateError::DeltaApplyFailure(format!("missing base file {}: {}", change.path, e))
                })?;
                if let Some(old_hash) = &change.old_hash {
                    if sha256_bytes(&base) != *old_hash {
                        return Err(UpdateError::DeltaApplyFailure(format!(
                            "base file {} does not match the package source",
                            change.path
                        )));
                    }
                }
                let mut patch = Vec::new();
                archive
                    .by_name(&patch_name(&change.path))?
                    .read_to_end(&mut patch)?;
                let limit = change
                    .new_size
                    .map(|s| s as usize)
                    .unwrap_or(DEFAULT_PATCH_OUTPUT_LIMIT);
                let patched = apply_delta(&base, &patch, limit)?;
                fs::write(&staged_path, &patched)?;
                Some(staged_path)
            }
        };

        if let (Some(path), Some(expected)) = (&output, &change.new_hash) {
            let actual = sha256_file(path)?;
            if actual != *expected {
                return Err(UpdateError::DeltaApplyFailure(format!(
                    "staged {} hashes to {}, expected {}",
                    change.path, actual, expected
                )));
            }
        }
        staged.push(output);
    }

    // Phase 2: commit with renames, journaling what moved
    let mut journal: Vec<(PathBuf, Option<PathBuf>)> = Vec::new();
    let commit = (|| -> io::Result<()> {
        for (index, (change, output)) in manifest.changes.iter().zip(&staged).enumerate() {
            let dest = target_dir.join(&change.path);
            let parked = if dest.exists() {
                let parked = staging.path().join(format!("{}.old", index));
                fs::rename(&dest, &parked)?;
                Some(parked)
            } else {
                None
            };
            journal.push((dest.clone(), parked));

            if let Some(output) = output {
                replace_file(output, &dest)?;
            }
            if let Some(report) = progress {
                report(index + 1, total);
            }
        }
        Ok(())
    })();

    if let Err(e) = commit {
        warn!("Delta commit failed, restoring originals: {}", e);
        for (dest, parked) in journal.into_iter().rev() {
            discard_file(&dest);
            if let Some(parked) = parked {
                if let Err(restore) = fs::rename(&parked, &dest) {
                    warn!("Could not restore {}: {}", dest.display(), restore);
                }
            }
        }
        return Err(UpdateError::DeltaApplyFailure(e.to_string()));
    }

    info!(
        "Applied delta {} -> {} ({} changes)",
        manifest.source_version, manifest.target_version, total
    );
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::manifest::{build_manifest, TreeManifest};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, data: &[u8]) -> io::Result<()> {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, data)
    }

    fn large_pattern(seed: u8) -> Vec<u8> {
        (0..300_000u32).map(|i| ((i % 253) as u8).wrapping_add(seed)).collect()
    }

    struct Trees {
        _work: TempDir,
        old: PathBuf,
        new: PathBuf,
        out: PathBuf,
    }

    fn build_trees() -> io::Result<Trees> {
        let work = TempDir::new()?;
        let old = work.path().join("old");
        let new = work.path().join("new");
        let out = work.path().join("out");

        let big = large_pattern(0);
        let mut big_edited = big.clone();
        big_edited[150_000..150_010].copy_from_slice(b"0123456789");

        write(&old, "bin/engine.dat", &big)?;
        write(&old, "config.ini", b"volume=5")?;
        write(&old, "old_only.txt", b"bye")?;
        write(&old, "unchanged.txt", b"same")?;

        write(&new, "bin/engine.dat", &big_edited)?;
        write(&new, "config.ini", b"volume=7 and completely different")?;
        write(&new, "levels/new.pak", b"fresh level")?;
        write(&new, "unchanged.txt", b"same")?;

        Ok(Trees {
            _work: work,
            old,
            new,
            out,
        })
    }

    #[test]
    fn test_is_delta_beneficial_boundary() {
        assert!(!is_delta_beneficial(1_000_000, 1_000_000, 700_000));
        assert!(is_delta_beneficial(1_000_000, 1_000_000, 699_999));
        assert!(!is_delta_beneficial(0, 1_000_000, 1));
        assert!(!is_delta_beneficial(1_000_000, 0, 0));
    }

    #[test]
    fn test_generate_and_apply_round_trip() -> Result<()> {
        let trees = build_trees()?;
        let info = generate_delta(&trees.old, &trees.new, "1.0.0", "1.0.1", &trees.out)?
            .expect("trees differ");

        assert_eq!(info.files_count, 4);
        assert!(info.package_path.ends_with("delta_1.0.0_to_1.0.1.zip"));

        let manifest = read_package_manifest(&info.package_path)?;
        let kind_of = |p: &str| manifest.changes.iter().find(|c| c.path == p).map(|c| c.kind);
        assert_eq!(kind_of("bin/engine.dat"), Some(ChangeKind::Modify));
        assert_eq!(kind_of("config.ini"), Some(ChangeKind::Replace));
        assert_eq!(kind_of("levels/new.pak"), Some(ChangeKind::Add));
        assert_eq!(kind_of("old_only.txt"), Some(ChangeKind::Delete));

        let calls = AtomicUsize::new(0);
        let report = |_done: usize, _total: usize| {
            calls.fetch_add(1, Ordering::Relaxed);
        };
        let applied = apply_delta_package(&info.package_path, &trees.old, Some("1.0.0"), Some(&report))?;
        assert_eq!(applied, 4);
        assert_eq!(calls.load(Ordering::Relaxed), 4);

        let patched: Vec<(String, String)> = build_manifest(&trees.old)?
            .into_iter()
            .map(|(k, v)| (k, v.hash))
            .collect();
        let expected: Vec<(String, String)> = build_manifest(&trees.new)?
            .into_iter()
            .map(|(k, v)| (k, v.hash))
            .collect();
        assert_eq!(patched, expected);

        // No staging leftovers
        let leftovers = fs::read_dir(&trees.old)?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".delta-staging"))
            .count();
        assert_eq!(leftovers, 0);
        Ok(())
    }

    #[test]
    fn test_identical_trees_produce_nothing() -> Result<()> {
        let work = TempDir::new()?;
        write(&work.path().join("a"), "x.txt", b"same")?;
        write(&work.path().join("b"), "x.txt", b"same")?;
        let result = generate_delta(
            &work.path().join("a"),
            &work.path().join("b"),
            "1.0.0",
            "1.0.1",
            &work.path().join("out"),
        )?;
        assert!(result.is_none());
        assert!(!work.path().join("out/delta_1.0.0_to_1.0.1.zip").exists());
        Ok(())
    }

    #[test]
    fn test_failed_change_leaves_tree_untouched() -> Result<()> {
        let trees = build_trees()?;
        let info = generate_delta(&trees.old, &trees.new, "1.0.0", "1.0.1", &trees.out)?
            .expect("trees differ");

        // Corrupt the base of the modified file so staging fails
        write(&trees.old, "bin/engine.dat", b"not the expected base")?;
        let before = build_manifest(&trees.old)?;

        let err = apply_delta_package(&info.package_path, &trees.old, None, None).unwrap_err();
        assert!(matches!(err, UpdateError::DeltaApplyFailure(_)));

        let after = build_manifest(&trees.old)?;
        let hashes = |m: &TreeManifest| {
            m.iter().map(|(k, v)| (k.clone(), v.hash.clone())).collect::<Vec<_>>()
        };
        assert_eq!(hashes(&before), hashes(&after));
        assert!(!trees.old.join("levels/new.pak").exists());
        Ok(())
    }

    #[test]
    fn test_wrong_source_version_rejected() -> Result<()> {
        let trees = build_trees()?;
        let info = generate_delta(&trees.old, &trees.new, "1.0.0", "1.0.1", &trees.out)?
            .expect("trees differ");
        let err = apply_delta_package(&info.package_path, &trees.old, Some("0.9.9"), None).unwrap_err();
        assert!(matches!(err, UpdateError::DeltaApplyFailure(_)));
        Ok(())
    }
}
