//! Remote metadata and artifact retrieval through the mirror pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::services::UpdateServices;
use crate::integrity::hash::read_hash_sidecar;
use crate::integrity::{artifact_hash_path, artifact_manifest_path, signing::signature_path};
use crate::manifest::FileListManifest;
use crate::utils::errors::{Result, UpdateError};
use crate::version::VersionInfo;

pub struct RemoteMetadata {
    services: Arc<UpdateServices>,
    staging_dir: PathBuf,
}

impl RemoteMetadata {
    pub fn new(services: Arc<UpdateServices>) -> Self {
        let staging_dir = services.config.downloads_dir();
        Self {
            services,
            staging_dir,
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    fn server_url(&self) -> &str {
        &self.services.config.updater.base_url
    }

    pub fn files_list_name(&self, version: &str) -> String {
        format!("{}{}.txt", self.services.config.updater.files_list_prefix, version)
    }

    pub fn archive_name(&self, version: &str) -> String {
        format!("{}{}.zip", self.services.config.updater.files_list_prefix, version)
    }

    /// Remote `version.txt`, from the cache when `use_cache` and still fresh.
    pub async fn version_info(&self, use_cache: bool) -> Result<VersionInfo> {
        if use_cache {
            if let Some(info) = self.services.cache.as_ref().and_then(|c| c.version_info(self.server_url())) {
                return Ok(info);
            }
        }

        let name = self.services.config.updater.version_file.clone();
        let info = VersionInfo::parse(&self.fetch_text(&name).await?);
        if info.content_version.is_none() {
            return Err(UpdateError::Version(format!("no version found in {}", name)));
        }
        if let Some(cache) = &self.services.cache {
            cache.set_version_info(self.server_url(), &info)?;
        }
        Ok(info)
    }

    /// The file list for `version`, cache first.
    pub async fn files_list(&self, version: &str) -> Result<FileListManifest> {
        if let Some(list) = self
            .services
            .cache
            .as_ref()
            .and_then(|c| c.files_list(self.server_url(), version))
        {
            return Ok(list);
        }

        let list = FileListManifest::parse(&self.fetch_text(&self.files_list_name(version)).await?)?;
        if list.version != version {
            return Err(UpdateError::Version(format!(
                "files list for {} declares version {}",
                version, list.version
            )));
        }
        if let Some(cache) = &self.services.cache {
            cache.set_files_list(self.server_url(), version, &list)?;
        }
        Ok(list)
    }

    async fn fetch_text(&self, name: &str) -> Result<String> {
        let dest = self.staging_dir.join(name);
        self.services
            .sources
            .download_with_fallback(&self.services.downloads, name, &dest, None)
            .await?;
        Ok(tokio::fs::read_to_string(&dest).await?)
    }

    /// Fetch `name` together with whatever verification sidecars the
    /// mirrors publish for it. Missing sidecars are not an error.
    pub async fn fetch_artifact(&self, name: &str) -> Result<PathBuf> {
        let artifact = self.staging_dir.join(name);
        let manifest = artifact_manifest_path(&artifact);
        let sidecars = [artifact_hash_path(&artifact), signature_path(&manifest), manifest];

        for sidecar in &sidecars {
            remove_stale(sidecar).await?;
        }
        for sidecar in &sidecars {
            let Some(sidecar_name) = sidecar.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Err(e) = self
                .services
                .sources
                .download_with_fallback(&self.services.downloads, sidecar_name, sidecar, None)
                .await
            {
                if e.is_cancelled() {
                    return Err(e);
                }
                debug!("No {} published: {}", sidecar_name, e);
            }
        }

        let expected_hash = read_hash_sidecar(&sidecars[0]).ok().flatten();
        self.services
            .sources
            .download_with_fallback(
                &self.services.downloads,
                name,
                &artifact,
                expected_hash.as_deref(),
            )
            .await?;
        Ok(artifact)
    }
}

async fn remove_stale(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
