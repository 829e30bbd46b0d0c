//! The persisted "current version" marker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use crate::fs::atomic::write_json_atomic;
use crate::utils::errors::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallState {
    pub current_version: String,
    #[serde(default)]
    pub launcher_version: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl InstallState {
    pub fn new(current_version: impl Into<String>) -> Self {
        Self {
            current_version: current_version.into(),
            launcher_version: None,
            updated_at: None,
        }
    }

    /// Read the state file, starting from `initial_version` when it does
    /// not exist yet. A corrupt file is treated the same way.
    pub fn load(path: &Path, initial_version: &str) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new(initial_version));
        }
        let bytes = std::fs::read(path)?;
        match serde_json::from_slice(&bytes) {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!("Install state {} is corrupt, assuming {}: {}", path.display(), initial_version, e);
                Ok(Self::new(initial_version))
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)?;
        Ok(())
    }

    /// Record `version` as installed and persist immediately.
    pub fn commit(&mut self, version: &str, path: &Path) -> Result<()> {
        self.current_version = version.to_string();
        self.updated_at = Some(Utc::now());
        self.save(path)
    }
}
