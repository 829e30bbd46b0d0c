//! Turning a release tree into the artifacts launchers download.
//!
//! For version V and prefix P the release directory receives:
//! `P<V>.txt` (file list), `P<V>.zip` (full archive), `P<V>.zip.hash`
//! and, with a signing key, `P<V>.zip.manifest` plus its `.sig`.

use anyhow::{bail, Context};
use launcher_updater::delta::{generate_delta, DeltaInfo};
use launcher_updater::fs::atomic::{replace_file, temp_sibling, write_atomic};
use launcher_updater::fs::walker::{walk_directory, WalkOptions};
use launcher_updater::integrity::hash::sha256_file;
use launcher_updater::integrity::signing::Signer;
use launcher_updater::integrity::{artifact_hash_path, artifact_manifest_path};
use launcher_updater::manifest::{FileListManifest, ManifestEntry};
use launcher_updater::version::Version;
use serde::Serialize;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

#[derive(Debug, Clone, Serialize)]
pub struct PublishReport {
    pub version: String,
    pub files: usize,
    pub total_size: u64,
    pub archive: PathBuf,
    pub archive_size: u64,
    pub signed: bool,
}

fn check_version(version: &str) -> anyhow::Result<()> {
    match Version::extract(version) {
        Some(v) if v.to_string() == version => Ok(()),
        _ => bail!("'{}' is not a major.minor.patch version", version),
    }
}

/// Build every artifact for `version` from the tree at `source_dir`.
pub fn publish_release(
    source_dir: &Path,
    version: &str,
    release_dir: &Path,
    prefix: &str,
    signer: Option<&Signer>,
) -> anyhow::Result<PublishReport> {
    check_version(version)?;
    let mut files = walk_directory(source_dir, WalkOptions::default())
        .with_context(|| format!("cannot read {}", source_dir.display()))?;
    if files.is_empty() {
        bail!("{} contains no files", source_dir.display());
    }
    files.sort_by_key(|f| f.relative_key());
    fs::create_dir_all(release_dir)?;

    let mut list = FileListManifest::new(version);
    for file in &files {
        list.entries.push(ManifestEntry {
            relative_path: file.relative_key(),
            sha256_hash: sha256_file(&file.path)?,
            size_bytes: file.size,
        });
    }
    write_atomic(&release_dir.join(format!("{}{}.txt", prefix, version)), list.render().as_bytes())?;

    let archive = release_dir.join(format!("{}{}.zip", prefix, version));
    let tmp = temp_sibling(&archive, ".tmp");
    {
        let mut writer = ZipWriter::new(File::create(&tmp)?);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        for file in &files {
            writer.start_file(file.relative_key(), options)?;
            io::copy(&mut File::open(&file.path)?, &mut writer)?;
        }
        writer.finish()?;
    }
    replace_file(&tmp, &archive)?;

    let signed = seal_artifact(&archive, version, release_dir, signer)?;
    let report = PublishReport {
        version: version.to_string(),
        files: list.entries.len(),
        total_size: list.total_size(),
        archive_size: fs::metadata(&archive)?.len(),
        archive,
        signed,
    };
    tracing::info!(
        "Published {}: {} files, archive {} bytes{}",
        version,
        report.files,
        report.archive_size,
        if signed { ", signed" } else { "" }
    );
    Ok(report)
}

/// Build `delta_<from>_to_<to>.zip` between two release trees.
pub fn publish_delta(
    old_dir: &Path,
    new_dir: &Path,
    from: &str,
    to: &str,
    release_dir: &Path,
    signer: Option<&Signer>,
) -> anyhow::Result<Option<DeltaInfo>> {
    check_version(from)?;
    check_version(to)?;
    let Some(info) = generate_delta(old_dir, new_dir, from, to, release_dir)? else {
        return Ok(None);
    };
    seal_artifact(&info.package_path, to, release_dir, signer)?;
    Ok(Some(info))
}

/// Write the `.hash` sidecar and, when a key is available, the signed
/// manifest for one artifact. Returns whether it was signed.
fn seal_artifact(
    artifact: &Path,
    version: &str,
    release_dir: &Path,
    signer: Option<&Signer>,
) -> anyhow::Result<bool> {
    write_atomic(&artifact_hash_path(artifact), sha256_file(artifact)?.as_bytes())?;

    let Some(signer) = signer else {
        return Ok(false);
    };
    let manifest = signer.sign_files(version, release_dir, &[artifact.to_path_buf()])?;
    signer.write_signed_manifest(&manifest, &artifact_manifest_path(artifact))?;
    Ok(true)
}

/// Point launchers at `version` by rewriting `version.txt`.
pub fn set_current_version(
    release_dir: &Path,
    version: &str,
    launcher_version: Option<&str>,
) -> anyhow::Result<()> {
    check_version(version)?;
    let mut content = format!("Version={}\n", version);
    if let Some(launcher) = launcher_version {
        content.push_str(&format!("LauncherVersion={}\n", launcher));
    }
    write_atomic(&release_dir.join("version.txt"), content.as_bytes())?;
    Ok(())
}
