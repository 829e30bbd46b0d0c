//! Read-only view over a release directory.

use launcher_updater::integrity::hash::read_hash_sidecar;
use launcher_updater::integrity::{artifact_hash_path, artifact_manifest_path};
use launcher_updater::manifest::FileListManifest;
use launcher_updater::version::{Version, VersionInfo};
use serde::Serialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize)]
pub struct ReleaseSummary {
    pub version: String,
    pub files: usize,
    pub total_size: u64,
    pub archive_size: Option<u64>,
    pub archive_hash: Option<String>,
    pub signed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeltaSummary {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Catalog {
    pub current: Option<String>,
    pub launcher_version: Option<String>,
    pub releases: Vec<ReleaseSummary>,
    pub deltas: Vec<DeltaSummary>,
}

/// Scan `release_dir` for published versions, oldest first.
pub fn load_catalog(release_dir: &Path, prefix: &str) -> anyhow::Result<Catalog> {
    let info = fs::read_to_string(release_dir.join("version.txt"))
        .map(|text| VersionInfo::parse(&text))
        .unwrap_or_default();

    let mut releases = Vec::new();
    let mut deltas = Vec::new();
    if release_dir.is_dir() {
        for entry in fs::read_dir(release_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("delta_") && name.ends_with(".zip") {
                deltas.push(DeltaSummary {
                    name,
                    size: entry.metadata()?.len(),
                });
                continue;
            }
            let Some(version) = name
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_suffix(".txt"))
            else {
                continue;
            };
            match release_summary(release_dir, prefix, version) {
                Ok(Some(summary)) => releases.push(summary),
                Ok(None) => {}
                Err(e) => tracing::warn!("Skipping release {}: {}", version, e),
            }
        }
    }

    releases.sort_by_key(|r| Version::extract(&r.version));
    deltas.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(Catalog {
        current: info.content_version,
        launcher_version: info.launcher_version,
        releases,
        deltas,
    })
}

/// Summary of one published version, `None` when it was never published.
pub fn release_summary(
    release_dir: &Path,
    prefix: &str,
    version: &str,
) -> anyhow::Result<Option<ReleaseSummary>> {
    let list_path = release_dir.join(format!("{}{}.txt", prefix, version));
    if !list_path.is_file() {
        return Ok(None);
    }
    let list = FileListManifest::parse(&fs::read_to_string(&list_path)?)?;

    let archive = release_dir.join(format!("{}{}.zip", prefix, version));
    let archive_size = fs::metadata(&archive).ok().map(|m| m.len());
    let archive_hash = read_hash_sidecar(&artifact_hash_path(&archive)).ok().flatten();
    let signed = artifact_manifest_path(&archive).is_file();

    Ok(Some(ReleaseSummary {
        version: list.version.clone(),
        files: list.entries.len(),
        total_size: list.total_size(),
        archive_size,
        archive_hash,
        signed,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::publish::{publish_delta, publish_release, set_current_version};
    use tempfile::TempDir;

    #[test]
    fn test_catalog_lists_releases_in_version_order() -> anyhow::Result<()> {
        let work = TempDir::new()?;
        let (v9, v10) = (work.path().join("v9"), work.path().join("v10"));
        fs::create_dir_all(&v9)?;
        fs::create_dir_all(&v10)?;
        fs::write(v9.join("game.exe"), b"nine")?;
        fs::write(v10.join("game.exe"), b"ten, a bit longer")?;
        let out = work.path().join("out");

        publish_release(&v10, "1.0.10", &out, "files_list_v", None)?;
        publish_release(&v9, "1.0.9", &out, "files_list_v", None)?;
        publish_delta(&v9, &v10, "1.0.9", "1.0.10", &out, None)?;
        set_current_version(&out, "1.0.10", None)?;

        let catalog = load_catalog(&out, "files_list_v")?;
        assert_eq!(catalog.current.as_deref(), Some("1.0.10"));
        let versions: Vec<&str> = catalog.releases.iter().map(|r| r.version.as_str()).collect();
        assert_eq!(versions, vec!["1.0.9", "1.0.10"]);
        assert!(catalog.releases[0].archive_hash.is_some());
        assert!(!catalog.releases[0].signed);
        Ok(())
    }

    #[test]
    fn test_missing_release_is_none() -> anyhow::Result<()> {
        let work = TempDir::new()?;
        assert!(release_summary(work.path(), "files_list_v", "3.0.0")?.is_none());
        assert!(load_catalog(work.path(), "files_list_v")?.releases.is_empty());
        Ok(())
    }
}
