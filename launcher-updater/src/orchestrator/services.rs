//! Explicitly constructed collaborators of an update run.
//!
//! Optional subsystems are `Option`s resolved once from [`Capabilities`].
//! A subsystem that is enabled but fails to open is logged and left out.

use std::sync::Arc;
use tracing::{info, warn};

use crate::backup::{BackupVault, RollbackManager};
use crate::cache::MetadataCache;
use crate::config::{Capabilities, Config};
use crate::delta::DeltaEngine;
use crate::events::EventBus;
use crate::installer::SafeArchiveInstaller;
use crate::integrity::keys::PublicKeyStore;
use crate::integrity::Verifier;
use crate::sources::{PeerDirectory, SelectorOptions, SourceSelector};
use crate::transfer::{build_client, DownloadManager};
use crate::utils::errors::Result;

pub struct UpdateServices {
    pub config: Config,
    pub client: reqwest::Client,
    pub events: EventBus,
    pub downloads: DownloadManager,
    pub sources: SourceSelector,
    pub installer: SafeArchiveInstaller,
    pub delta: Option<DeltaEngine>,
    pub rollback: Option<RollbackManager>,
    pub verifier: Option<Verifier>,
    pub cache: Option<MetadataCache>,
    pub peers: Option<Arc<PeerDirectory>>,
}

impl UpdateServices {
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = build_client(&config.transfer)?;
        let events = EventBus::new();
        let caps = config.capabilities;

        let downloads =
            DownloadManager::from_config(client.clone(), &config.transfer).with_events(events.clone());

        let peers = caps
            .p2p
            .then(|| {
                Arc::new(
                    PeerDirectory::new(client.clone(), &config.p2p)
                        .with_max_file_size(config.transfer.max_file_size),
                )
            });

        let mut sources = SourceSelector::new(
            client.clone(),
            &config.mirror_definitions(),
            SelectorOptions::from_config(config),
        );
        if let Some(peers) = &peers {
            sources = sources.with_peers(peers.clone());
        }

        let verifier = caps.signatures.then(|| {
            Verifier::new(PublicKeyStore::new(
                config.integrity.keys_dir.clone(),
                config.integrity.public_key_url.clone(),
                config.transfer.allow_insecure_loopback,
                client.clone(),
            ))
        });

        let rollback = if caps.backup {
            match BackupVault::open(&config.backup.dir, &config.updater.install_dir) {
                Ok(vault) => Some(RollbackManager::new(Arc::new(vault))),
                Err(e) => {
                    warn!("Backups disabled, vault could not be opened: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let cache = if caps.cache {
            match MetadataCache::open(&config.cache) {
                Ok(cache) => Some(cache),
                Err(e) => {
                    warn!("Metadata cache disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let services = Self {
            config: config.clone(),
            client,
            events,
            downloads,
            sources,
            installer: SafeArchiveInstaller::default(),
            delta: caps.delta.then(DeltaEngine::new),
            rollback,
            verifier,
            cache,
            peers,
        };
        info!("Update services ready: {:?}", services.capabilities());
        Ok(services)
    }

    /// What actually came up, which may be less than what was asked for.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            delta: self.delta.is_some(),
            backup: self.rollback.is_some(),
            signatures: self.verifier.is_some(),
            cache: self.cache.is_some(),
            p2p: self.peers.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.updater.install_dir = dir.path().join("game");
        config.updater.data_dir = dir.path().join("data");
        config.backup.dir = dir.path().join("backups");
        config.cache.dir = dir.path().join("cache");
        config.integrity.keys_dir = dir.path().join("keys");
        config
    }

    #[test]
    fn test_default_capabilities() -> Result<()> {
        let dir = TempDir::new()?;
        let services = UpdateServices::from_config(&config(&dir))?;
        let caps = services.capabilities();
        assert!(caps.delta && caps.backup && caps.signatures && caps.cache);
        assert!(!caps.p2p);
        Ok(())
    }

    #[test]
    fn test_disabled_subsystems_are_absent() -> Result<()> {
        let dir = TempDir::new()?;
        let mut config = config(&dir);
        config.capabilities = Capabilities {
            delta: false,
            backup: false,
            signatures: false,
            cache: false,
            p2p: true,
        };
        let services = UpdateServices::from_config(&config)?;
        assert!(services.delta.is_none());
        assert!(services.rollback.is_none());
        assert!(services.verifier.is_none());
        assert!(services.cache.is_none());
        assert!(services.peers.is_some());
        assert!(!dir.path().join("backups").exists());
        Ok(())
    }
}
