//! SHA-256 helpers.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Files are hashed in fixed 4KB blocks
const HASH_BLOCK_SIZE: usize = 4096;

/// Hex SHA-256 of a file, streamed in fixed-size blocks.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; HASH_BLOCK_SIZE];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hash on the blocking pool so large files do not stall the runtime.
pub async fn sha256_file_async(path: PathBuf) -> io::Result<String> {
    tokio::task::spawn_blocking(move || sha256_file(&path))
        .await
        .map_err(io::Error::other)?
}

/// Read a `<file>.hash` sidecar: the first whitespace-separated token.
pub fn read_hash_sidecar(path: &Path) -> io::Result<Option<String>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .split_whitespace()
        .next()
        .filter(|token| token.len() == 64 && token.bytes().all(|b| b.is_ascii_hexdigit()))
        .map(str::to_ascii_lowercase))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_sha256_bytes() {
        assert_eq!(sha256_bytes(b"hello"), HELLO_SHA256);
    }

    #[test]
    fn test_sha256_file_spans_blocks() -> io::Result<()> {
        let mut file = NamedTempFile::new()?;
        let data = vec![7u8; HASH_BLOCK_SIZE * 3 + 17];
        file.write_all(&data)?;
        file.flush()?;
        assert_eq!(sha256_file(file.path())?, sha256_bytes(&data));
        Ok(())
    }

    #[test]
    fn test_read_hash_sidecar() -> io::Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "{}  files_list_v1.0.3.zip", HELLO_SHA256.to_uppercase())?;
        assert_eq!(read_hash_sidecar(file.path())?.as_deref(), Some(HELLO_SHA256));

        let mut junk = NamedTempFile::new()?;
        writeln!(junk, "not-a-hash")?;
        assert_eq!(read_hash_sidecar(junk.path())?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_sha256_file_async() -> io::Result<()> {
        let mut file = NamedTempFile::new()?;
        file.write_all(b"hello")?;
        file.flush()?;
        assert_eq!(sha256_file_async(file.path().to_path_buf()).await?, HELLO_SHA256);
        Ok(())
    }
}
