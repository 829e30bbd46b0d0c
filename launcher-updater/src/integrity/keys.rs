//! Public key discovery and caching for signature verification.

use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::RsaPublicKey;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::signing::PUBLIC_KEY_FILE;
use crate::transfer::secure_url;
use crate::utils::errors::{Result, UpdateError};

pub const CACHED_KEY_FILE: &str = "cached_public_key.pem";
const PEM_PUBLIC_KEY_HEADER: &str = "-----BEGIN PUBLIC KEY-----";
const KEY_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = "GameLauncher/1.0";

/// Resolves the release public key: memory, then the download cache, then a
/// locally provisioned key, then the configured URL.
pub struct PublicKeyStore {
    keys_dir: PathBuf,
    key_url: Option<String>,
    allow_insecure_loopback: bool,
    client: reqwest::Client,
    key: RwLock<Option<RsaPublicKey>>,
}

impl PublicKeyStore {
    pub fn new(
        keys_dir: PathBuf,
        key_url: Option<String>,
        allow_insecure_loopback: bool,
        client: reqwest::Client,
    ) -> Self {
        Self {
            keys_dir,
            key_url,
            allow_insecure_loopback,
            client,
            key: RwLock::new(None),
        }
    }

    /// A store that only ever uses the given key.
    pub fn with_key(key: RsaPublicKey) -> Self {
        Self {
            keys_dir: PathBuf::new(),
            key_url: None,
            allow_insecure_loopback: false,
            client: reqwest::Client::new(),
            key: RwLock::new(Some(key)),
        }
    }

    /// The public key, or None when none can be found anywhere.
    pub async fn get(&self) -> Option<RsaPublicKey> {
        if let Some(key) = self.key.read().await.clone() {
            return Some(key);
        }

        let mut slot = self.key.write().await;
        if let Some(key) = slot.clone() {
            return Some(key);
        }

        let loaded = match self.load_from_disk() {
            Some(key) => Some(key),
            None => match self.download().await {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!("Public key unavailable: {}", e);
                    None
                }
            },
        };
        *slot = loaded.clone();
        loaded
    }

    /// Drop the cached key and download a fresh one.
    pub async fn refresh(&self) -> Result<RsaPublicKey> {
        let mut slot = self.key.write().await;
        *slot = None;
        let cached = self.keys_dir.join(CACHED_KEY_FILE);
        if cached.exists() {
            std::fs::remove_file(&cached)?;
        }
        let key = self.download().await?;
        *slot = Some(key.clone());
        Ok(key)
    }

    fn load_from_disk(&self) -> Option<RsaPublicKey> {
        for name in [CACHED_KEY_FILE, PUBLIC_KEY_FILE] {
            let path = self.keys_dir.join(name);
            if !path.exists() {
                continue;
            }
            match read_public_key(&path) {
                Ok(key) => {
                    debug!("Loaded public key from {}", path.display());
                    return Some(key);
                }
                Err(e) => warn!("Ignoring unreadable public key {}: {}", path.display(), e),
            }
        }
        None
    }

    async fn download(&self) -> Result<RsaPublicKey> {
        let url = self
            .key_url
            .as_deref()
            .ok_or_else(|| UpdateError::Config("no public key URL configured".to_string()))?;
        let url = secure_url(url, self.allow_insecure_loopback)?;

        info!("Downloading public key from {}", url);
        let response = self
            .client
            .get(&url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .timeout(KEY_FETCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| UpdateError::from_request(&url, e))?;

        if !response.status().is_success() {
            return Err(UpdateError::HttpStatus {
                url,
                status: response.status().as_u16(),
            });
        }

        let text = response.text().await?;
        let key = parse_public_key_pem(&text)?;

        if let Err(e) = self.cache_key(&key) {
            warn!("Failed to cache public key: {}", e);
        }
        Ok(key)
    }

    fn cache_key(&self, key: &RsaPublicKey) -> Result<()> {
        let pem = key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| UpdateError::Crypto(e.to_string()))?;
        crate::fs::atomic::write_atomic(&self.keys_dir.join(CACHED_KEY_FILE), pem.as_bytes())?;
        Ok(())
    }
}

/// Parse PEM text that must begin with the public-key header.
pub fn parse_public_key_pem(text: &str) -> Result<RsaPublicKey> {
    let text = text.trim_start();
    if !text.starts_with(PEM_PUBLIC_KEY_HEADER) {
        return Err(UpdateError::IntegrityFailure(
            "downloaded key is not a PEM public key".to_string(),
        ));
    }
    RsaPublicKey::from_public_key_pem(text)
        .map_err(|e| UpdateError::Crypto(format!("invalid public key: {}", e)))
}

pub fn read_public_key(path: &Path) -> Result<RsaPublicKey> {
    parse_public_key_pem(&std::fs::read_to_string(path)?)
}
