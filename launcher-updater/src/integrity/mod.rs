//! Integrity verification of downloaded artifacts.
//!
//! Verification fails closed: any decoding or signature error is a failure.
//! When neither a signed manifest nor a hash sidecar exists the outcome is
//! `Unavailable`, which callers must not confuse with `Verified`.

pub mod hash;
pub mod keys;
pub mod signing;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use hash::{read_hash_sidecar, sha256_file_async};
use keys::PublicKeyStore;
use signing::{pss_scheme, signature_path, SignatureRecord, SignedManifest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMethod {
    Signature,
    HashSidecar,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum VerificationOutcome {
    Verified(VerificationMethod),
    Failed(String),
    Unavailable,
}

impl VerificationOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, VerificationOutcome::Failed(_))
    }
}

/// Verify raw signature bytes over a hex digest.
pub fn verify_hash_signature(key: &RsaPublicKey, file_hash: &str, signature_b64: &str) -> bool {
    let Ok(signature) = BASE64.decode(signature_b64.trim()) else {
        return false;
    };
    let hashed = Sha256::digest(file_hash.as_bytes());
    key.verify(pss_scheme(key), &hashed, &signature).is_ok()
}

pub struct Verifier {
    keys: PublicKeyStore,
}

impl Verifier {
    pub fn new(keys: PublicKeyStore) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &PublicKeyStore {
        &self.keys
    }

    /// Recompute the hash of `path`, compare with the record, and check the
    /// signature over the fresh hash.
    pub async fn verify_file(&self, path: &Path, record: &SignatureRecord) -> bool {
        let Some(key) = self.keys.get().await else {
            warn!("No public key available to verify {}", path.display());
            return false;
        };
        self.verify_file_with(&key, path, &record.file_hash, &record.signature)
            .await
    }

    async fn verify_file_with(
        &self,
        key: &RsaPublicKey,
        path: &Path,
        expected_hash: &str,
        signature: &str,
    ) -> bool {
        let actual = match sha256_file_async(path.to_path_buf()).await {
            Ok(hash) => hash,
            Err(e) => {
                warn!("Cannot hash {}: {}", path.display(), e);
                return false;
            }
        };
        if !actual.eq_ignore_ascii_case(expected_hash) {
            warn!("Hash mismatch for {}", path.display());
            return false;
        }
        if !verify_hash_signature(key, &actual, signature) {
            warn!("Invalid signature for {}", path.display());
            return false;
        }
        true
    }

    /// Verify the manifest's own detached signature (when present), then
    /// every listed file under `files_dir`. One failure fails everything.
    pub async fn verify_manifest(&self, manifest_path: &Path, files_dir: &Path) -> bool {
        let Some(key) = self.keys.get().await else {
            warn!("No public key available to verify {}", manifest_path.display());
            return false;
        };

        let sig_path = signature_path(manifest_path);
        if sig_path.exists() {
            let record: SignatureRecord = match std::fs::read(&sig_path)
                .map_err(|e| e.to_string())
                .and_then(|bytes| serde_json::from_slice(&bytes).map_err(|e| e.to_string()))
            {
                Ok(record) => record,
                Err(e) => {
                    warn!("Unreadable manifest signature {}: {}", sig_path.display(), e);
                    return false;
                }
            };
            if !self
                .verify_file_with(&key, manifest_path, &record.file_hash, &record.signature)
                .await
            {
                warn!("Manifest signature check failed for {}", manifest_path.display());
                return false;
            }
        }

        let manifest = match SignedManifest::load(manifest_path) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("Unreadable manifest {}: {}", manifest_path.display(), e);
                return false;
            }
        };

        for (relative, entry) in &manifest.files {
            if !crate::fs::atomic::is_safe_relative_path(relative) {
                warn!("Manifest lists unsafe path '{}'", relative);
                return false;
            }
            let path = files_dir.join(relative);
            let size = match std::fs::metadata(&path) {
                Ok(meta) => meta.len(),
                Err(_) => {
                    warn!("Manifest file missing: {}", path.display());
                    return false;
                }
            };
            if size != entry.size {
                warn!(
                    "Size mismatch for {}: expected {}, got {}",
                    relative, entry.size, size
                );
                return false;
            }
            if !self
                .verify_file_with(&key, &path, &entry.hash, &entry.signature)
                .await
            {
                return false;
            }
        }

        info!(
            "Verified manifest {} ({} files)",
            manifest_path.display(),
            manifest.files.len()
        );
        true
    }

    /// Verify a downloaded artifact using whatever evidence exists next to
    /// it: `<artifact>.manifest` first, then `<artifact>.hash`.
    pub async fn verify_artifact(&self, artifact: &Path) -> VerificationOutcome {
        let manifest_path = artifact_manifest_path(artifact);
        let hash_path = artifact_hash_path(artifact);

        if manifest_path.exists() {
            if self.keys.get().await.is_some() {
                let files_dir = artifact.parent().unwrap_or(Path::new("."));
                return if self.verify_manifest(&manifest_path, files_dir).await {
                    VerificationOutcome::Verified(VerificationMethod::Signature)
                } else {
                    VerificationOutcome::Failed(format!(
                        "signed manifest rejected for {}",
                        artifact.display()
                    ))
                };
            }
            debug!("Manifest present but no key; trying hash sidecar");
        }

        if hash_path.exists() {
            return verify_against_sidecar(artifact, &hash_path).await;
        }

        VerificationOutcome::Unavailable
    }
}

/// Compare a file against a plain `.hash` sidecar.
pub async fn verify_against_sidecar(artifact: &Path, hash_path: &Path) -> VerificationOutcome {
    let expected = match read_hash_sidecar(hash_path) {
        Ok(Some(expected)) => expected,
        Ok(None) => return VerificationOutcome::Failed("malformed hash sidecar".to_string()),
        Err(e) => return VerificationOutcome::Failed(format!("unreadable hash sidecar: {}", e)),
    };
    match sha256_file_async(artifact.to_path_buf()).await {
        Ok(actual) if actual == expected => {
            VerificationOutcome::Verified(VerificationMethod::HashSidecar)
        }
        Ok(actual) => VerificationOutcome::Failed(format!(
            "hash mismatch for {}: expected {}, got {}",
            artifact.display(),
            expected,
            actual
        )),
        Err(e) => VerificationOutcome::Failed(format!("cannot hash {}: {}", artifact.display(), e)),
    }
}

pub fn artifact_manifest_path(artifact: &Path) -> PathBuf {
    crate::fs::atomic::temp_sibling(artifact, ".manifest")
}

pub fn artifact_hash_path(artifact: &Path) -> PathBuf {
    crate::fs::atomic::temp_sibling(artifact, ".hash")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::errors::Result;
    use signing::Signer;
    use std::fs;
    use tempfile::TempDir;

    fn verifier_for(signer: &Signer) -> Verifier {
        Verifier::new(PublicKeyStore::with_key(signer.public_key().clone()))
    }

    #[tokio::test]
    async fn test_sign_and_verify_file() -> Result<()> {
        let dir = TempDir::new()?;
        let file = dir.path().join("game.pak");
        fs::write(&file, b"level data")?;

        let signer = Signer::generate(1024)?;
        let record = signer.sign_file(&file)?;
        let verifier = verifier_for(&signer);

        assert!(verifier.verify_file(&file, &record).await);
        Ok(())
    }

    #[tokio::test]
    async fn test_flipped_file_byte_fails() -> Result<()> {
        let dir = TempDir::new()?;
        let file = dir.path().join("game.pak");
        fs::write(&file, b"level data")?;

        let signer = Signer::generate(1024)?;
        let record = signer.sign_file(&file)?;
        fs::write(&file, b"level dbta")?;

        assert!(!verifier_for(&signer).verify_file(&file, &record).await);
        Ok(())
    }

    #[tokio::test]
    async fn test_flipped_signature_byte_fails() -> Result<()> {
        let dir = TempDir::new()?;
        let file = dir.path().join("game.pak");
        fs::write(&file, b"level data")?;

        let signer = Signer::generate(1024)?;
        let mut record = signer.sign_file(&file)?;
        let mut raw = BASE64.decode(&record.signature).unwrap();
        raw[10] ^= 0x01;
        record.signature = BASE64.encode(raw);

        assert!(!verifier_for(&signer).verify_file(&file, &record).await);
        Ok(())
    }

    #[tokio::test]
    async fn test_wrong_key_fails() -> Result<()> {
        let dir = TempDir::new()?;
        let file = dir.path().join("game.pak");
        fs::write(&file, b"level data")?;

        let signer = Signer::generate(1024)?;
        let other = Signer::generate(1024)?;
        let record = signer.sign_file(&file)?;

        assert!(!verifier_for(&other).verify_file(&file, &record).await);
        Ok(())
    }

    #[tokio::test]
    async fn test_verify_manifest_tree() -> Result<()> {
        let release = TempDir::new()?;
        fs::create_dir_all(release.path().join("bin"))?;
        fs::write(release.path().join("bin/game.exe"), b"binary")?;
        fs::write(release.path().join("readme.txt"), b"hello")?;

        let signer = Signer::generate(1024)?;
        let manifest = signer.create_signed_manifest("1.0.3", release.path())?;
        assert_eq!(manifest.files.len(), 2);

        let out = TempDir::new()?;
        let manifest_path = out.path().join("release.manifest");
        signer.write_signed_manifest(&manifest, &manifest_path)?;

        let verifier = verifier_for(&signer);
        assert!(verifier.verify_manifest(&manifest_path, release.path()).await);

        // Size change in one file aborts the whole verification
        fs::write(release.path().join("readme.txt"), b"hello!")?;
        assert!(!verifier.verify_manifest(&manifest_path, release.path()).await);
        Ok(())
    }

    #[tokio::test]
    async fn test_tampered_manifest_fails_sidecar() -> Result<()> {
        let release = TempDir::new()?;
        fs::write(release.path().join("a.txt"), b"a")?;

        let signer = Signer::generate(1024)?;
        let manifest = signer.create_signed_manifest("1.0.0", release.path())?;
        let out = TempDir::new()?;
        let manifest_path = out.path().join("m.manifest");
        signer.write_signed_manifest(&manifest, &manifest_path)?;

        let mut text = fs::read_to_string(&manifest_path)?;
        text = text.replace("1.0.0", "9.9.9");
        fs::write(&manifest_path, text)?;

        assert!(!verifier_for(&signer).verify_manifest(&manifest_path, release.path()).await);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_manifest_file_fails() -> Result<()> {
        let release = TempDir::new()?;
        fs::write(release.path().join("a.txt"), b"a")?;
        let signer = Signer::generate(1024)?;
        let manifest = signer.create_signed_manifest("1.0.0", release.path())?;
        let out = TempDir::new()?;
        let manifest_path = out.path().join("m.manifest");
        manifest.save(&manifest_path)?;
        fs::remove_file(release.path().join("a.txt"))?;

        assert!(!verifier_for(&signer).verify_manifest(&manifest_path, release.path()).await);
        Ok(())
    }

    #[tokio::test]
    async fn test_artifact_outcomes() -> Result<()> {
        let dir = TempDir::new()?;
        let artifact = dir.path().join("files_list_v1.0.1.zip");
        fs::write(&artifact, b"zip bytes")?;

        let signer = Signer::generate(1024)?;
        let verifier = verifier_for(&signer);

        assert_eq!(verifier.verify_artifact(&artifact).await, VerificationOutcome::Unavailable);

        fs::write(artifact_hash_path(&artifact), hash::sha256_bytes(b"zip bytes"))?;
        assert_eq!(
            verifier.verify_artifact(&artifact).await,
            VerificationOutcome::Verified(VerificationMethod::HashSidecar)
        );

        fs::write(artifact_hash_path(&artifact), hash::sha256_bytes(b"other"))?;
        assert!(verifier.verify_artifact(&artifact).await.is_failed());

        let manifest = signer.sign_files("1.0.1", dir.path(), &[artifact.clone()])?;
        signer.write_signed_manifest(&manifest, &artifact_manifest_path(&artifact))?;
        assert_eq!(
            verifier.verify_artifact(&artifact).await,
            VerificationOutcome::Verified(VerificationMethod::Signature)
        );
        Ok(())
    }
}
