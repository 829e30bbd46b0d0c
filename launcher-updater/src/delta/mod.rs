//! Binary delta updates between two versions of the install tree.

pub mod binary;
pub mod manifest;
pub mod package;

use std::io;
use std::path::PathBuf;

pub use manifest::{build_manifest, diff, ChangeKind, FileChange, FileState, TreeManifest};
pub use package::{
    apply_delta_package, delta_package_name, generate_delta, is_delta_beneficial, DeltaInfo,
    DeltaPackageManifest,
};

use crate::utils::errors::{Result, UpdateError};

/// Delta subsystem handle. Runs the CPU-heavy work on the blocking pool.
#[derive(Debug, Clone, Default)]
pub struct DeltaEngine;

impl DeltaEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn package_name(&self, source_version: &str, target_version: &str) -> String {
        delta_package_name(source_version, target_version)
    }

    pub async fn build_manifest(&self, dir: PathBuf) -> Result<TreeManifest> {
        tokio::task::spawn_blocking(move || build_manifest(&dir))
            .await
            .map_err(|e| UpdateError::Io(io::Error::other(e)))?
            .map_err(UpdateError::from)
    }

    pub async fn generate(
        &self,
        old_dir: PathBuf,
        new_dir: PathBuf,
        old_version: String,
        new_version: String,
        output_dir: PathBuf,
    ) -> Result<Option<DeltaInfo>> {
        tokio::task::spawn_blocking(move || {
            generate_delta(&old_dir, &new_dir, &old_version, &new_version, &output_dir)
        })
        .await
        .map_err(|e| UpdateError::Io(io::Error::other(e)))?
    }

    /// Apply a package; any failure leaves the tree as it was.
    pub async fn apply(
        &self,
        package: PathBuf,
        target_dir: PathBuf,
        expected_source: Option<String>,
    ) -> Result<usize> {
        tokio::task::spawn_blocking(move || {
            apply_delta_package(&package, &target_dir, expected_source.as_deref(), None)
        })
        .await
        .map_err(|e| UpdateError::DeltaApplyFailure(e.to_string()))?
    }

    pub fn is_beneficial(&self, old_size: u64, new_size: u64, delta_size: u64) -> bool {
        is_delta_beneficial(old_size, new_size, delta_size)
    }
}
