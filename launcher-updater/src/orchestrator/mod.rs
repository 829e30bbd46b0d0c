//! The update state machine.
//!
//! One run resolves the plan from the installed version to the remote one
//! and applies each planned version strictly in order. A version is only
//! committed once its files are installed and re-hashed. Any failure while
//! applying a version triggers a rollback to the backup taken just before
//! it, and the run ends with a single success flag and status message.

pub mod remote;
pub mod self_update;
pub mod services;
pub mod state;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backup::{collect_install_files, BackupRecord, RollbackReport};
use crate::events::{EventBus, UpdateEvent};
use crate::integrity::hash::sha256_file;
use crate::integrity::{artifact_hash_path, verify_against_sidecar, VerificationOutcome};
use crate::manifest::FileListManifest;
use crate::utils::errors::{Result, UpdateError};
use crate::version::resolve_plan;

pub use remote::RemoteMetadata;
pub use self_update::{LauncherCheck, SelfUpdater};
pub use services::UpdateServices;
pub use state::InstallState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePhase {
    Idle,
    ResolvingVersions,
    BackingUp,
    SelectingSource,
    Transferring,
    Verifying,
    Installing,
    Committing,
    Done,
    Failed,
}

impl UpdatePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UpdatePhase::Done | UpdatePhase::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateCheck {
    pub current: String,
    pub latest: String,
    pub plan: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateOutcome {
    pub success: bool,
    pub message: String,
    /// Installed version when the run ended
    pub version: Option<String>,
    pub applied: Vec<String>,
    pub rollback: Option<RollbackReport>,
}

/// How a version's content reached the install tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InstallMethod {
    Delta,
    Full,
}

pub struct UpdateOrchestrator {
    services: Arc<UpdateServices>,
    remote: RemoteMetadata,
    cancel: CancellationToken,
}

impl UpdateOrchestrator {
    pub fn new(services: Arc<UpdateServices>) -> Self {
        Self {
            remote: RemoteMetadata::new(services.clone()),
            services,
            cancel: CancellationToken::new(),
        }
    }

    pub fn services(&self) -> &Arc<UpdateServices> {
        &self.services
    }

    pub fn events(&self) -> &EventBus {
        &self.services.events
    }

    /// Stop the run: active transfers are cancelled and no further
    /// version is started.
    pub async fn cancel(&self) {
        self.cancel.cancel();
        for transfer in self.services.downloads.list_active().await {
            self.services.downloads.cancel(&transfer.id).await;
        }
    }

    pub async fn pause(&self) {
        for transfer in self.services.downloads.list_active().await {
            self.services.downloads.pause(&transfer.id).await;
        }
    }

    pub async fn resume(&self) {
        for transfer in self.services.downloads.list_active().await {
            self.services.downloads.resume(&transfer.id).await;
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn state_path(&self) -> PathBuf {
        self.services.config.install_state_path()
    }

    fn install_dir(&self) -> &Path {
        &self.services.config.updater.install_dir
    }

    pub fn install_state(&self) -> Result<InstallState> {
        InstallState::load(&self.state_path(), &self.services.config.updater.initial_version)
    }

    fn phase(&self, version: Option<&str>, phase: UpdatePhase) {
        self.services.events.emit(UpdateEvent::PhaseChanged {
            version: version.map(str::to_string),
            phase,
        });
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }
        Ok(())
    }

    /// Resolve the plan without changing anything.
    pub async fn check(&self) -> Result<UpdateCheck> {
        let current = self.install_state()?.current_version;
        let info = self.remote.version_info(true).await?;
        let latest = info.content_version.unwrap_or_default();
        let plan = resolve_plan(&current, &latest);
        Ok(UpdateCheck {
            current,
            latest,
            plan,
        })
    }

    /// Run a full update and report the outcome. Never panics on failure.
    pub async fn run(&self) -> UpdateOutcome {
        self.phase(None, UpdatePhase::Idle);
        let outcome = self.run_inner().await;

        let phase = if outcome.success {
            UpdatePhase::Done
        } else {
            UpdatePhase::Failed
        };
        self.phase(outcome.version.as_deref(), phase);
        self.services.events.emit(UpdateEvent::Completed {
            success: outcome.success,
            message: outcome.message.clone(),
            version: outcome.version.clone(),
        });
        outcome
    }

    async fn run_inner(&self) -> UpdateOutcome {
        let mut state = match self.install_state() {
            Ok(state) => state,
            Err(e) => return failure(format!("Cannot read install state: {}", e), None),
        };

        self.phase(None, UpdatePhase::ResolvingVersions);
        let check = match self.check().await {
            Ok(check) => check,
            Err(e) if e.is_offline() => {
                warn!("Update server unreachable, staying offline: {}", e);
                return failure(
                    "Offline mode: update server is unreachable".to_string(),
                    Some(state.current_version),
                );
            }
            Err(e) => {
                error!("Version check failed: {}", e);
                return failure(format!("Update check failed: {}", e), Some(state.current_version));
            }
        };

        self.services.events.emit(UpdateEvent::PlanResolved {
            current: check.current.clone(),
            latest: check.latest.clone(),
            versions: check.plan.clone(),
        });

        if check.plan.is_empty() {
            info!("Already at {} (remote {})", check.current, check.latest);
            return UpdateOutcome {
                success: true,
                message: "Already up to date".to_string(),
                version: Some(check.current),
                applied: Vec::new(),
                rollback: None,
            };
        }

        info!("Update plan {} -> {}: {:?}", check.current, check.latest, check.plan);
        let mut applied = Vec::new();

        for version in &check.plan {
            let previous = state.current_version.clone();
            let backup = self.backup(&previous, version).await;

            match self.apply_version(&previous, version, &mut state).await {
                Ok(()) => applied.push(version.clone()),
                Err(UpdateError::Cancelled) => {
                    info!("Update cancelled before {}", version);
                    return UpdateOutcome {
                        success: false,
                        message: "Update cancelled".to_string(),
                        version: Some(previous),
                        applied,
                        rollback: None,
                    };
                }
                Err(e) => {
                    error!("Applying {} failed: {}", version, e);
                    self.phase(Some(version), UpdatePhase::Failed);
                    return self.recover(&previous, version, backup, e, applied).await;
                }
            }
        }

        UpdateOutcome {
            success: true,
            message: format!("Updated to {}", state.current_version),
            version: Some(state.current_version),
            applied,
            rollback: None,
        }
    }

    /// Best-effort snapshot of the tree before `target` touches it.
    async fn backup(&self, current: &str, target: &str) -> Option<BackupRecord> {
        let rollback = self.services.rollback.clone()?;
        self.phase(Some(target), UpdatePhase::BackingUp);

        let install_dir = self.install_dir().to_path_buf();
        let current = current.to_string();
        let result = tokio::task::spawn_blocking(move || {
            let files = collect_install_files(&install_dir)?;
            rollback.prepare_rollback(&current, &files)
        })
        .await;

        match result {
            Ok(Ok(record)) => Some(record),
            Ok(Err(e)) => {
                warn!("Backup before {} failed, continuing without one: {}", target, e);
                None
            }
            Err(e) => {
                warn!("Backup task before {} failed: {}", target, e);
                None
            }
        }
    }

    async fn apply_version(&self, previous: &str, version: &str, state: &mut InstallState) -> Result<()> {
        self.checkpoint()?;
        self.phase(Some(version), UpdatePhase::SelectingSource);
        let files_list = self.remote.files_list(version).await?;

        let mut method = None;
        if self.services.delta.is_some() {
            match self.install_delta(previous, version).await {
                Ok(()) => method = Some(InstallMethod::Delta),
                Err(UpdateError::Cancelled) => return Err(UpdateError::Cancelled),
                Err(e) => info!("Delta {} -> {} not used, falling back to full archive: {}", previous, version, e),
            }
        }
        if method.is_none() {
            self.checkpoint()?;
            self.install_full(version).await?;
        }

        self.verify_installed(version, &files_list).await?;

        self.phase(Some(version), UpdatePhase::Committing);
        state.commit(version, &self.state_path())?;
        if let Some(cache) = &self.services.cache {
            if let Err(e) = cache.invalidate_version(&self.services.config.updater.base_url, Some(version)) {
                warn!("Failed to invalidate cached metadata for {}: {}", version, e);
            }
        }
        info!("Committed version {}", version);
        Ok(())
    }

    async fn install_delta(&self, previous: &str, version: &str) -> Result<()> {
        let Some(delta) = &self.services.delta else {
            return Err(UpdateError::DeltaApplyFailure("delta updates disabled".to_string()));
        };
        let name = delta.package_name(previous, version);

        self.phase(Some(version), UpdatePhase::Transferring);
        let package = self.remote.fetch_artifact(&name).await?;

        self.phase(Some(version), UpdatePhase::Verifying);
        self.accept_artifact(&package).await?;

        self.phase(Some(version), UpdatePhase::Installing);
        let applied = delta
            .apply(package, self.install_dir().to_path_buf(), Some(previous.to_string()))
            .await?;
        info!("Applied {} delta change(s) for {}", applied, version);
        Ok(())
    }

    async fn install_full(&self, version: &str) -> Result<()> {
        self.phase(Some(version), UpdatePhase::Transferring);
        let archive = self.remote.fetch_artifact(&self.remote.archive_name(version)).await?;

        self.phase(Some(version), UpdatePhase::Verifying);
        self.accept_artifact(&archive).await?;

        self.phase(Some(version), UpdatePhase::Installing);
        let report = self
            .services
            .installer
            .extract_async(archive, self.install_dir().to_path_buf())
            .await?;
        info!(
            "Extracted {} file(s) for {} ({} skipped)",
            report.extracted.len(),
            version,
            report.skipped.len()
        );
        Ok(())
    }

    /// Verify an artifact and apply the configured policy to the result.
    async fn accept_artifact(&self, artifact: &Path) -> Result<()> {
        let outcome = match &self.services.verifier {
            Some(verifier) => verifier.verify_artifact(artifact).await,
            None => {
                let hash_path = artifact_hash_path(artifact);
                if hash_path.exists() {
                    verify_against_sidecar(artifact, &hash_path).await
                } else {
                    VerificationOutcome::Unavailable
                }
            }
        };
        self.services.events.emit(UpdateEvent::Verification {
            artifact: artifact.display().to_string(),
            outcome: outcome.clone(),
        });

        let integrity = &self.services.config.integrity;
        match outcome {
            VerificationOutcome::Verified(method) => {
                info!("Verified {} ({:?})", artifact.display(), method);
                Ok(())
            }
            VerificationOutcome::Failed(reason) if integrity.tolerate_failures => {
                warn!("VERIFICATION FAILED for {}, continuing anyway: {}", artifact.display(), reason);
                Ok(())
            }
            VerificationOutcome::Failed(reason) => Err(UpdateError::IntegrityFailure(reason)),
            VerificationOutcome::Unavailable if integrity.require_signatures => Err(UpdateError::IntegrityFailure(
                format!("no signature or hash published for {}", artifact.display()),
            )),
            VerificationOutcome::Unavailable => {
                warn!("No verification data for {}, installing unverified", artifact.display());
                Ok(())
            }
        }
    }

    /// Re-hash installed files against the version's list. Mismatches are
    /// reported but do not fail the version.
    async fn verify_installed(&self, version: &str, files_list: &FileListManifest) -> Result<usize> {
        self.phase(Some(version), UpdatePhase::Verifying);
        let install_dir = self.install_dir().to_path_buf();
        let list = files_list.clone();

        let mismatched = tokio::task::spawn_blocking(move || {
            let mut mismatched = Vec::new();
            for entry in &list.entries {
                let path = install_dir.join(&entry.relative_path);
                match sha256_file(&path) {
                    Ok(hash) if hash == entry.sha256_hash => {}
                    Ok(_) => mismatched.push(entry.relative_path.clone()),
                    Err(_) => mismatched.push(entry.relative_path.clone()),
                }
            }
            mismatched
        })
        .await
        .map_err(|e| UpdateError::Io(std::io::Error::other(e)))?;

        for path in &mismatched {
            warn!("Installed file {} does not match the {} file list", path, version);
        }
        self.services.events.emit(UpdateEvent::InstallSummary {
            version: version.to_string(),
            files_checked: files_list.entries.len(),
            mismatched: mismatched.len(),
        });
        Ok(mismatched.len())
    }

    /// Roll back after `target` failed on top of `previous`.
    async fn recover(
        &self,
        previous: &str,
        target: &str,
        backup: Option<BackupRecord>,
        cause: UpdateError,
        applied: Vec<String>,
    ) -> UpdateOutcome {
        let Some(rollback) = &self.services.rollback else {
            return UpdateOutcome {
                rollback: None,
                applied,
                ..failure(
                    format!("Update to {} failed: {}; backups are disabled", target, cause),
                    Some(previous.to_string()),
                )
            };
        };

        let tag = match backup {
            Some(record) => Some(record.version),
            None => match rollback.vault().latest_backup() {
                Ok(latest) => latest.map(|r| r.version),
                Err(e) => {
                    warn!("Cannot read backup index: {}", e);
                    None
                }
            },
        };
        let Some(tag) = tag else {
            return UpdateOutcome {
                applied,
                ..failure(
                    format!("Update to {} failed: {}; no backup to roll back to", target, cause),
                    Some(previous.to_string()),
                )
            };
        };

        match rollback.perform_rollback_async(tag.clone()).await {
            Ok(report) => {
                self.services.events.emit(UpdateEvent::Rollback {
                    version: tag.clone(),
                    success: true,
                    restored: report.restored,
                    total: report.total,
                });
                UpdateOutcome {
                    success: false,
                    message: format!(
                        "Update to {} failed: {}; rolled back to {} ({}/{} files restored)",
                        target, cause, tag, report.restored, report.total
                    ),
                    version: Some(previous.to_string()),
                    applied,
                    rollback: Some(report),
                }
            }
            Err(rollback_error) => {
                error!("Rollback to {} failed: {}", tag, rollback_error);
                self.services.events.emit(UpdateEvent::Rollback {
                    version: tag.clone(),
                    success: false,
                    restored: 0,
                    total: 0,
                });
                UpdateOutcome {
                    applied,
                    ..failure(
                        format!(
                            "Update to {} failed: {}; rollback to {} also failed: {}",
                            target, cause, tag, rollback_error
                        ),
                        Some(previous.to_string()),
                    )
                }
            }
        }
    }

    /// Restore a backup chosen by the operator, keeping a pre-rollback
    /// snapshot of the current tree.
    pub async fn rollback(&self, version: &str) -> Result<RollbackReport> {
        let rollback = self
            .services
            .rollback
            .clone()
            .ok_or_else(|| UpdateError::RollbackFailure("backups are disabled".to_string()))?;
        let current = self.install_state()?.current_version;

        let install_dir = self.install_dir().to_path_buf();
        let snapshot_rollback = rollback.clone();
        let snapshot_version = current.clone();
        let snapshot = tokio::task::spawn_blocking(move || {
            let files = collect_install_files(&install_dir)?;
            snapshot_rollback.create_pre_rollback_backup(&snapshot_version, &files)
        })
        .await;
        match snapshot {
            Ok(Ok(record)) => info!("Saved pre-rollback snapshot {}", record.version),
            Ok(Err(e)) => warn!("Pre-rollback snapshot of {} failed: {}", current, e),
            Err(e) => warn!("Pre-rollback snapshot task failed: {}", e),
        }

        let report = rollback.perform_rollback_async(version.to_string()).await?;
        self.services.events.emit(UpdateEvent::Rollback {
            version: version.to_string(),
            success: true,
            restored: report.restored,
            total: report.total,
        });

        // Only plain version tags move the marker
        if crate::version::Version::extract(version).map(|v| v.to_string()).as_deref() == Some(version) {
            let mut state = self.install_state()?;
            state.commit(version, &self.state_path())?;
        }
        Ok(report)
    }
}

fn failure(message: String, version: Option<String>) -> UpdateOutcome {
    UpdateOutcome {
        success: false,
        message,
        version,
        applied: Vec::new(),
        rollback: None,
    }
}
