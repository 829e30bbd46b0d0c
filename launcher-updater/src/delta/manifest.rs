//! Tree manifests and change detection between two trees.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::Path;

use crate::fs::walker::{walk_directory, WalkOptions};
use crate::integrity::hash::sha256_file;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileState {
    pub hash: String,
    pub size: u64,
    pub mtime: f64,
}

/// Relative `/`-separated path to file state, ordered by path.
pub type TreeManifest = BTreeMap<String, FileState>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Add,
    Delete,
    Modify,
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_size: Option<u64>,
}

/// Hash every file of `dir`, skipping hidden and launcher-internal entries.
pub fn build_manifest(dir: &Path) -> io::Result<TreeManifest> {
    let mut manifest = TreeManifest::new();
    for file in walk_directory(dir, WalkOptions::default())? {
        manifest.insert(
            file.relative_key(),
            FileState {
                hash: sha256_file(&file.path)?,
                size: file.size,
                mtime: file.modified,
            },
        );
    }
    Ok(manifest)
}

/// Changes turning `old` into `new`, ordered by path.
pub fn diff(old: &TreeManifest, new: &TreeManifest) -> Vec<FileChange> {
    let paths: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    let mut changes = Vec::new();

    for path in paths {
        let change = match (old.get(path), new.get(path)) {
            (None, Some(n)) => FileChange {
                path: path.clone(),
                kind: ChangeKind::Add,
                old_hash: None,
                new_hash: Some(n.hash.clone()),
                old_size: None,
                new_size: Some(n.size),
                delta_size: None,
            },
            (Some(o), None) => FileChange {
                path: path.clone(),
                kind: ChangeKind::Delete,
                old_hash: Some(o.hash.clone()),
                new_hash: None,
                old_size: Some(o.size),
                new_size: None,
                delta_size: None,
            },
            (Some(o), Some(n)) if o.hash != n.hash => FileChange {
                path: path.clone(),
                kind: ChangeKind::Modify,
                old_hash: Some(o.hash.clone()),
                new_hash: Some(n.hash.clone()),
                old_size: Some(o.size),
                new_size: Some(n.size),
                delta_size: None,
            },
            _ => continue,
        };
        changes.push(change);
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_build_manifest() -> io::Result<()> {
        let dir = TempDir::new()?;
        fs::create_dir_all(dir.path().join("data"))?;
        fs::write(dir.path().join("data/a.pak"), b"hello")?;
        fs::write(dir.path().join(".cache"), b"skip")?;

        let manifest = build_manifest(dir.path())?;
        assert_eq!(manifest.len(), 1);
        let state = &manifest["data/a.pak"];
        assert_eq!(state.size, 5);
        assert_eq!(
            state.hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        Ok(())
    }

    #[test]
    fn test_diff_kinds() {
        let state = |hash: &str| FileState {
            hash: hash.to_string(),
            size: 1,
            mtime: 0.0,
        };
        let old: TreeManifest = [
            ("same.txt".to_string(), state("a")),
            ("changed.txt".to_string(), state("b")),
            ("gone.txt".to_string(), state("c")),
        ]
        .into_iter()
        .collect();
        let new: TreeManifest = [
            ("same.txt".to_string(), state("a")),
            ("changed.txt".to_string(), state("b2")),
            ("fresh.txt".to_string(), state("d")),
        ]
        .into_iter()
        .collect();

        let changes = diff(&old, &new);
        let summary: Vec<(&str, ChangeKind)> =
            changes.iter().map(|c| (c.path.as_str(), c.kind)).collect();
        assert_eq!(
            summary,
            vec![
                ("changed.txt", ChangeKind::Modify),
                ("fresh.txt", ChangeKind::Add),
                ("gone.txt", ChangeKind::Delete),
            ]
        );
    }

    #[test]
    fn test_change_serialization_uses_type_field() -> serde_json::Result<()> {
        let change = FileChange {
            path: "a.txt".to_string(),
            kind: ChangeKind::Replace,
            old_hash: None,
            new_hash: Some("ff".to_string()),
            old_size: None,
            new_size: Some(3),
            delta_size: None,
        };
        let json = serde_json::to_string(&change)?;
        assert!(json.contains(r#""type":"replace""#));
        assert!(!json.contains("old_hash"));
        Ok(())
    }
}
