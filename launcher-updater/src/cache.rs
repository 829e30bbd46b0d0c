//! On-disk cache for remote metadata.
//!
//! Values live in `<dir>/<key>.json`, where the key is the SHA-256 of the
//! request URL plus its sorted parameters. `cache_index.json` records when
//! each entry was written and how long it stays valid.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::fs::atomic::write_json_atomic;
use crate::integrity::hash::sha256_bytes;
use crate::integrity::signing::SignedManifest;
use crate::manifest::FileListManifest;
use crate::utils::errors::{Result, UpdateError};
use crate::version::VersionInfo;

pub const INDEX_FILE: &str = "cache_index.json";

pub type CacheParams = BTreeMap<String, String>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub url: String,
    #[serde(default)]
    pub params: CacheParams,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: u64,
    pub size: u64,
}

impl CacheEntry {
    fn is_valid(&self, now: DateTime<Utc>) -> bool {
        let age = (now - self.created_at).num_milliseconds();
        age >= 0 && (age as u64) < self.ttl_secs.saturating_mul(1000)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub expired_entries: usize,
    pub total_size_bytes: u64,
    pub cache_dir: PathBuf,
}

#[derive(Debug, Clone, Copy)]
struct Ttls {
    default: u64,
    version: u64,
    files_list: u64,
    manifest: u64,
}

pub struct MetadataCache {
    dir: PathBuf,
    ttls: Ttls,
    index: Mutex<BTreeMap<String, CacheEntry>>,
}

impl MetadataCache {
    pub fn open(config: &CacheConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        let index_path = config.dir.join(INDEX_FILE);
        let index = if index_path.exists() {
            match fs::read(&index_path).map(|b| serde_json::from_slice(&b)) {
                Ok(Ok(index)) => index,
                Ok(Err(e)) => {
                    warn!("Cache index is corrupt, starting empty: {}", e);
                    BTreeMap::new()
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            dir: config.dir.clone(),
            ttls: Ttls {
                default: config.default_ttl_secs,
                version: config.version_ttl_secs,
                files_list: config.files_list_ttl_secs,
                manifest: config.manifest_ttl_secs,
            },
            index: Mutex::new(index),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stable key for a request: parameters are hashed in sorted order.
    pub fn cache_key(url: &str, params: &CacheParams) -> String {
        let mut material = url.to_string();
        for (key, value) in params {
            material.push('&');
            material.push_str(key);
            material.push('=');
            material.push_str(value);
        }
        sha256_bytes(material.as_bytes())
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    fn lock_index(&self) -> Result<MutexGuard<'_, BTreeMap<String, CacheEntry>>> {
        self.index
            .lock()
            .map_err(|_| UpdateError::Config("cache index lock poisoned".to_string()))
    }

    fn save_index(&self, index: &BTreeMap<String, CacheEntry>) -> Result<()> {
        write_json_atomic(&self.dir.join(INDEX_FILE), index)?;
        Ok(())
    }

    /// A cached value, if present, unexpired and readable as `T`.
    pub fn get<T: DeserializeOwned>(&self, url: &str, params: &CacheParams) -> Option<T> {
        let key = Self::cache_key(url, params);
        let valid = {
            let index = self.lock_index().ok()?;
            index.get(&key).map(|e| e.is_valid(Utc::now()))
        };

        match valid {
            None => None,
            Some(false) => {
                debug!("Cache entry for {} expired", url);
                if let Err(e) = self.delete_key(&key) {
                    warn!("Failed to drop expired cache entry {}: {}", key, e);
                }
                None
            }
            Some(true) => {
                let bytes = fs::read(self.entry_path(&key)).ok()?;
                match serde_json::from_slice(&bytes) {
                    Ok(value) => {
                        debug!("Cache hit for {}", url);
                        Some(value)
                    }
                    Err(e) => {
                        warn!("Unreadable cache entry for {}: {}", url, e);
                        None
                    }
                }
            }
        }
    }

    /// Store `value`. `ttl_secs` falls back to the configured default.
    pub fn set<T: Serialize>(
        &self,
        url: &str,
        params: &CacheParams,
        value: &T,
        ttl_secs: Option<u64>,
    ) -> Result<()> {
        let key = Self::cache_key(url, params);
        let bytes = serde_json::to_vec_pretty(value)?;
        crate::fs::atomic::write_atomic(&self.entry_path(&key), &bytes)?;

        let mut index = self.lock_index()?;
        index.insert(
            key,
            CacheEntry {
                url: url.to_string(),
                params: params.clone(),
                created_at: Utc::now(),
                ttl_secs: ttl_secs.unwrap_or(self.ttls.default),
                size: bytes.len() as u64,
            },
        );
        self.save_index(&index)
    }

    pub fn delete(&self, url: &str, params: &CacheParams) -> Result<bool> {
        self.delete_key(&Self::cache_key(url, params))
    }

    fn delete_key(&self, key: &str) -> Result<bool> {
        let mut index = self.lock_index()?;
        let existed = index.remove(key).is_some();
        remove_if_present(&self.entry_path(key))?;
        if existed {
            self.save_index(&index)?;
        }
        Ok(existed)
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn clear_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut index = self.lock_index()?;
        let expired: Vec<String> = index
            .iter()
            .filter(|(_, entry)| !entry.is_valid(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            index.remove(key);
            remove_if_present(&self.entry_path(key))?;
        }
        if !expired.is_empty() {
            self.save_index(&index)?;
            info!("Removed {} expired cache entries", expired.len());
        }
        Ok(expired.len())
    }

    pub fn clear_all(&self) -> Result<()> {
        let mut index = self.lock_index()?;
        for key in index.keys() {
            remove_if_present(&self.entry_path(key))?;
        }
        index.clear();
        self.save_index(&index)?;
        info!("Cache cleared");
        Ok(())
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let now = Utc::now();
        let index = self.lock_index()?;
        let valid_entries = index.values().filter(|e| e.is_valid(now)).count();
        Ok(CacheStats {
            total_entries: index.len(),
            valid_entries,
            expired_entries: index.len() - valid_entries,
            total_size_bytes: index.values().map(|e| e.size).sum(),
            cache_dir: self.dir.clone(),
        })
    }

    // Typed metadata

    pub fn version_info(&self, server_url: &str) -> Option<VersionInfo> {
        self.get(&version_url(server_url), &CacheParams::new())
    }

    pub fn set_version_info(&self, server_url: &str, info: &VersionInfo) -> Result<()> {
        self.set(&version_url(server_url), &CacheParams::new(), info, Some(self.ttls.version))
    }

    pub fn files_list(&self, server_url: &str, version: &str) -> Option<FileListManifest> {
        self.get(&files_list_url(server_url), &version_params(version))
    }

    pub fn set_files_list(&self, server_url: &str, version: &str, list: &FileListManifest) -> Result<()> {
        self.set(
            &files_list_url(server_url),
            &version_params(version),
            list,
            Some(self.ttls.files_list),
        )
    }

    pub fn manifest(&self, manifest_url: &str) -> Option<SignedManifest> {
        self.get(manifest_url, &CacheParams::new())
    }

    pub fn set_manifest(&self, manifest_url: &str, manifest: &SignedManifest) -> Result<()> {
        self.set(manifest_url, &CacheParams::new(), manifest, Some(self.ttls.manifest))
    }

    /// Forget the remote version and, when given, the files list of
    /// `version` so the next check goes to the network.
    pub fn invalidate_version(&self, server_url: &str, version: Option<&str>) -> Result<()> {
        self.delete(&version_url(server_url), &CacheParams::new())?;
        if let Some(version) = version {
            self.delete(&files_list_url(server_url), &version_params(version))?;
        }
        Ok(())
    }
}

fn version_url(server_url: &str) -> String {
    format!("{}/version", server_url.trim_end_matches('/'))
}

fn files_list_url(server_url: &str) -> String {
    format!("{}/files", server_url.trim_end_matches('/'))
}

fn version_params(version: &str) -> CacheParams {
    let mut params = CacheParams::new();
    params.insert("version".to_string(), version.to_string());
    params
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
