//! Per-version file lists (`files_list_v<version>.txt`).
//!
//! ```text
//! version 1.0.3
//! bin/game.exe 9f86d08... 1048576
//! data/levels.pak 2c26b46... 52428800
//! ```

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::utils::errors::{Result, UpdateError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// `/`-separated path relative to the install root
    pub relative_path: String,
    pub sha256_hash: String,
    pub size_bytes: u64,
}

/// What should exist on disk for one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileListManifest {
    pub version: String,
    pub entries: Vec<ManifestEntry>,
}

impl FileListManifest {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            entries: Vec::new(),
        }
    }

    /// Parse the text format. Malformed entry lines are skipped.
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());

        let header = lines
            .next()
            .ok_or_else(|| UpdateError::Version("empty files list".to_string()))?;
        let version = header
            .strip_prefix("version")
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| UpdateError::Version(format!("missing version header: '{}'", header)))?;

        let mut manifest = FileListManifest::new(version);
        for (index, line) in lines.enumerate() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 3 {
                warn!("Skipping malformed files list line {}: '{}'", index + 2, line);
                continue;
            }
            let Ok(size_bytes) = fields[2].parse::<u64>() else {
                warn!("Skipping files list line {} with bad size: '{}'", index + 2, line);
                continue;
            };
            manifest.entries.push(ManifestEntry {
                relative_path: fields[0].replace('\\', "/"),
                sha256_hash: fields[1].to_ascii_lowercase(),
                size_bytes,
            });
        }

        Ok(manifest)
    }

    pub fn render(&self) -> String {
        let mut out = format!("version {}\n", self.version);
        for entry in &self.entries {
            out.push_str(&format!(
                "{} {} {}\n",
                entry.relative_path, entry.sha256_hash, entry.size_bytes
            ));
        }
        out
    }

    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size_bytes).sum()
    }

    pub fn get(&self, relative_path: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.relative_path == relative_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_files_list() -> Result<()> {
        let text = "version 1.0.3\nbin/game.exe abc123 100\ndata/a.pak def456 2048\n";
        let manifest = FileListManifest::parse(text)?;
        assert_eq!(manifest.version, "1.0.3");
        assert_eq!(manifest.entries.len(), 2);
        assert_eq!(manifest.entries[1].relative_path, "data/a.pak");
        assert_eq!(manifest.entries[1].size_bytes, 2048);
        assert_eq!(manifest.total_size(), 2148);
        Ok(())
    }

    #[test]
    fn test_malformed_lines_skipped() -> Result<()> {
        let text = "version 2.0.0\nonly_two fields\nok.txt aaa 1\nbad.txt bbb notanumber\nx y z w\n";
        let manifest = FileListManifest::parse(text)?;
        assert_eq!(manifest.entries.len(), 1);
        assert_eq!(manifest.entries[0].relative_path, "ok.txt");
        Ok(())
    }

    #[test]
    fn test_missing_header_rejected() {
        assert!(FileListManifest::parse("bin/game.exe abc 1\n").is_err());
        assert!(FileListManifest::parse("").is_err());
    }

    #[test]
    fn test_render_parses_back() -> Result<()> {
        let mut manifest = FileListManifest::new("1.2.3");
        manifest.entries.push(ManifestEntry {
            relative_path: "a/b.txt".to_string(),
            sha256_hash: "00ff".to_string(),
            size_bytes: 7,
        });
        let parsed = FileListManifest::parse(&manifest.render())?;
        assert_eq!(parsed, manifest);
        assert!(parsed.get("a/b.txt").is_some());
        Ok(())
    }
}
