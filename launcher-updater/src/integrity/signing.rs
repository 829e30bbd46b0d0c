//! RSA-PSS signing of release files and manifests.
//!
//! Signatures cover the UTF-8 bytes of a file's SHA-256 hex digest, using
//! PSS with MGF1-SHA256 and the maximal salt length for the key size.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Pss, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use super::hash::sha256_file;
use crate::fs::walker::{walk_directory, WalkOptions};
use crate::utils::errors::{Result, UpdateError};

pub const SIGNATURE_ALGORITHM: &str = "RSA-PSS-SHA256";
pub const DEFAULT_KEY_BITS: usize = 2048;
pub const PRIVATE_KEY_FILE: &str = "private_key.pem";
pub const PUBLIC_KEY_FILE: &str = "public_key.pem";

/// Detached signature for one file (`<file>.sig`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRecord {
    pub file_hash: String,
    pub signature: String,
    pub algorithm: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedFileEntry {
    pub size: u64,
    pub hash: String,
    pub signature: String,
    pub algorithm: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedManifest {
    pub version: String,
    pub files: BTreeMap<String, SignedFileEntry>,
    pub created_at: DateTime<Utc>,
}

impl SignedManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read(path)?;
        Ok(serde_json::from_slice(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        crate::fs::atomic::write_json_atomic(path, self)?;
        Ok(())
    }
}

/// Largest PSS salt that fits the key: emLen - hLen - 2.
pub(crate) fn max_salt_len(key: &RsaPublicKey) -> usize {
    key.size().saturating_sub(Sha256::output_size() + 2)
}

pub(crate) fn pss_scheme(key: &RsaPublicKey) -> Pss {
    Pss::new_with_salt::<Sha256>(max_salt_len(key))
}

/// Sidecar path for a detached signature.
pub fn signature_path(path: &Path) -> PathBuf {
    crate::fs::atomic::temp_sibling(path, ".sig")
}

/// Holds the offline private key. Only the publisher side constructs one.
pub struct Signer {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl Signer {
    pub fn generate(bits: usize) -> Result<Self> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| UpdateError::Crypto(format!("key generation failed: {}", e)))?;
        Ok(Self::from_private_key(private_key))
    }

    pub fn from_private_key(private_key: RsaPrivateKey) -> Self {
        let public_key = RsaPublicKey::from(&private_key);
        Self {
            private_key,
            public_key,
        }
    }

    pub fn from_pem(pem: &str) -> Result<Self> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| UpdateError::Crypto(format!("invalid private key: {}", e)))?;
        Ok(Self::from_private_key(private_key))
    }

    /// Load `private_key.pem` from a key directory.
    pub fn load(keys_dir: &Path) -> Result<Self> {
        let pem = fs::read_to_string(keys_dir.join(PRIVATE_KEY_FILE))?;
        Self::from_pem(&pem)
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    pub fn public_key_pem(&self) -> Result<String> {
        self.public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| UpdateError::Crypto(format!("public key encoding failed: {}", e)))
    }

    /// Write the PKCS#8 private key and SPKI public key into `keys_dir`.
    pub fn save_keys(&self, keys_dir: &Path) -> Result<()> {
        fs::create_dir_all(keys_dir)?;
        let private_pem = self
            .private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| UpdateError::Crypto(format!("private key encoding failed: {}", e)))?;
        crate::fs::atomic::write_atomic(&keys_dir.join(PRIVATE_KEY_FILE), private_pem.as_bytes())?;
        crate::fs::atomic::write_atomic(
            &keys_dir.join(PUBLIC_KEY_FILE),
            self.public_key_pem()?.as_bytes(),
        )?;
        info!("Saved signing keys to {}", keys_dir.display());
        Ok(())
    }

    /// Sign a hex digest string, returning base64.
    pub fn sign_hash(&self, file_hash: &str) -> Result<String> {
        let hashed = Sha256::digest(file_hash.as_bytes());
        let mut rng = rand::thread_rng();
        let signature = self
            .private_key
            .sign_with_rng(&mut rng, pss_scheme(&self.public_key), &hashed)
            .map_err(|e| UpdateError::Crypto(format!("signing failed: {}", e)))?;
        Ok(BASE64.encode(signature))
    }

    pub fn sign_file(&self, path: &Path) -> Result<SignatureRecord> {
        let file_hash = sha256_file(path)?;
        let signature = self.sign_hash(&file_hash)?;
        Ok(SignatureRecord {
            file_hash,
            signature,
            algorithm: SIGNATURE_ALGORITHM.to_string(),
        })
    }

    /// Sign `path` and write the `<path>.sig` sidecar.
    pub fn write_signature_file(&self, path: &Path) -> Result<PathBuf> {
        let record = self.sign_file(path)?;
        let sig_path = signature_path(path);
        crate::fs::atomic::write_json_atomic(&sig_path, &record)?;
        Ok(sig_path)
    }

    /// Manifest covering the listed files, keyed by `/`-separated paths
    /// relative to `root`.
    pub fn sign_files(&self, version: &str, root: &Path, files: &[PathBuf]) -> Result<SignedManifest> {
        let mut entries = BTreeMap::new();
        for path in files {
            let relative = path.strip_prefix(root).unwrap_or(path);
            let record = self.sign_file(path)?;
            entries.insert(
                crate::fs::walker::normalize_relative(relative),
                SignedFileEntry {
                    size: fs::metadata(path)?.len(),
                    hash: record.file_hash,
                    signature: record.signature,
                    algorithm: record.algorithm,
                },
            );
        }
        Ok(SignedManifest {
            version: version.to_string(),
            files: entries,
            created_at: Utc::now(),
        })
    }

    /// Manifest covering every file of a release tree.
    pub fn create_signed_manifest(&self, version: &str, dir: &Path) -> Result<SignedManifest> {
        let files: Vec<PathBuf> = walk_directory(dir, WalkOptions::default())?
            .into_iter()
            .map(|f| f.path)
            .collect();
        let manifest = self.sign_files(version, dir, &files)?;
        info!("Signed {} files for version {}", manifest.files.len(), version);
        Ok(manifest)
    }

    /// Save a manifest and its detached signature.
    pub fn write_signed_manifest(&self, manifest: &SignedManifest, path: &Path) -> Result<()> {
        manifest.save(path)?;
        self.write_signature_file(path)?;
        Ok(())
    }
}
