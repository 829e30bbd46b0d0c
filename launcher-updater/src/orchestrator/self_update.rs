//! Self-update of the launcher package.
//!
//! The remote `version.txt` advertises the launcher version on its
//! `LauncherVersion=` line. A newer package is downloaded, checked against
//! its `.hash` sidecar when one is published, and extracted over the
//! install directory. The new version takes effect on the next start.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::remote::RemoteMetadata;
use super::services::UpdateServices;
use super::state::InstallState;
use crate::fs::atomic::discard_file_async;
use crate::integrity::{artifact_hash_path, verify_against_sidecar, VerificationOutcome};
use crate::transfer::join_url;
use crate::utils::errors::{Result, UpdateError};
use crate::version::is_newer;

#[derive(Debug, Clone, Serialize)]
pub struct LauncherCheck {
    pub current: String,
    pub latest: Option<String>,
    pub update_available: bool,
}

pub struct SelfUpdater {
    services: Arc<UpdateServices>,
    remote: RemoteMetadata,
}

impl SelfUpdater {
    pub fn new(services: Arc<UpdateServices>) -> Self {
        let remote = RemoteMetadata::new(services.clone());
        Self { services, remote }
    }

    /// Launcher version recorded in the install state, else the build's own.
    pub fn current_version(&self) -> Result<String> {
        let config = &self.services.config;
        let state = InstallState::load(&config.install_state_path(), &config.updater.initial_version)?;
        Ok(state
            .launcher_version
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()))
    }

    pub async fn check(&self) -> Result<LauncherCheck> {
        let current = self.current_version()?;
        let latest = self.remote.version_info(false).await?.launcher_version;
        let update_available = latest.as_deref().is_some_and(|l| is_newer(l, &current));
        Ok(LauncherCheck {
            current,
            latest,
            update_available,
        })
    }

    /// Download and install the newer launcher package, if there is one.
    /// Returns the installed version.
    pub async fn apply(&self) -> Result<Option<String>> {
        let check = self.check().await?;
        let Some(latest) = check.latest.filter(|_| check.update_available) else {
            info!("Launcher {} is up to date", check.current);
            return Ok(None);
        };

        let config = &self.services.config;
        let base = config
            .updater
            .launcher_update_url
            .as_deref()
            .ok_or_else(|| UpdateError::Config("updater.launcher_update_url is not set".to_string()))?;
        let filename = &config.updater.launcher_update_filename;
        let package = self.remote.staging_dir().join(filename);

        info!("Updating launcher {} -> {}", check.current, latest);

        let hash_path = artifact_hash_path(&package);
        discard_file_async(&hash_path).await;
        let hash_url = join_url(base, &format!("{}.hash", filename));
        if let Err(e) = self.services.downloads.fetch(&hash_url, &hash_path).await {
            debug!("No hash published for launcher package: {}", e);
        }

        self.services
            .downloads
            .fetch(&join_url(base, filename), &package)
            .await?;

        if hash_path.exists() {
            if let VerificationOutcome::Failed(reason) = verify_against_sidecar(&package, &hash_path).await {
                return Err(UpdateError::IntegrityFailure(reason));
            }
        } else if config.integrity.require_signatures {
            return Err(UpdateError::IntegrityFailure(
                "launcher package has no published hash".to_string(),
            ));
        } else {
            warn!("Installing unverified launcher package {}", filename);
        }

        let report = self
            .services
            .installer
            .extract_async(package, config.updater.install_dir.clone())
            .await?;
        info!(
            "Launcher package extracted: {} files, {} skipped",
            report.extracted.len(),
            report.skipped.len()
        );

        let state_path = config.install_state_path();
        let mut state = InstallState::load(&state_path, &config.updater.initial_version)?;
        state.launcher_version = Some(latest.clone());
        state.save(&state_path)?;

        info!("Launcher updated to {}; restart to use it", latest);
        Ok(Some(latest))
    }
}
