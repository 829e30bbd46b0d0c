//! Directory traversal for install trees.
//!
//! Hidden entries, launcher bookkeeping directories and scratch files are
//! pruned so that manifests and backups describe only installed content.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,

    /// Skip any entry whose name starts with `.`
    pub skip_hidden: bool,

    /// Directory names pruned from the walk
    pub exclude_dirs: Vec<String>,

    /// File name suffixes that are never collected
    pub exclude_suffixes: Vec<String>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            follow_links: false,
            max_depth: None,
            skip_hidden: true,
            exclude_dirs: vec![
                "logs".to_string(),
                "launcher_data".to_string(),
                "launcher_backups".to_string(),
                "launcher_cache".to_string(),
                "__pycache__".to_string(),
            ],
            exclude_suffixes: vec![".tmp".to_string(), ".log".to_string(), ".pyc".to_string()],
        }
    }
}

/// One regular file of an install tree.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: PathBuf,
    /// Path below the walk root
    pub relative_path: PathBuf,
    pub size: u64,
    /// Seconds since the Unix epoch
    pub modified: f64,
}

impl FileInfo {
    /// Links resolve to their target; links to directories and dangling
    /// links are not files and yield `None`.
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        let path = entry.path().to_path_buf();
        let metadata = if entry.path_is_symlink() {
            match std::fs::metadata(&path) {
                Ok(target) if target.is_file() => target,
                _ => return Ok(None),
            }
        } else {
            entry.metadata()?
        };

        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0.0, |d| d.as_secs_f64());

        Ok(Some(Self {
            relative_path: path.strip_prefix(root).unwrap_or(&path).to_path_buf(),
            path,
            size: metadata.len(),
            modified,
        }))
    }

    /// Manifest key for this file, see [`normalize_relative`].
    pub fn relative_key(&self) -> String {
        normalize_relative(&self.relative_path)
    }
}

/// `/`-joined components, the key format shared by file lists, backups
/// and signed manifests on every platform.
pub fn normalize_relative(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Every file below `root` that survives `options`, in file-name order.
///
/// ```no_run
/// use launcher_updater::fs::walker::{walk_directory, WalkOptions};
/// use std::path::Path;
///
/// let files = walk_directory(Path::new("/opt/game"), WalkOptions::default()).unwrap();
/// println!("{} files", files.len());
/// ```
pub fn walk_directory(root: &Path, options: WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .sort_by_file_name();
    if let Some(depth) = options.max_depth {
        walker = walker.max_depth(depth);
    }

    let mut files = Vec::new();
    for entry in walker
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_excluded(e, &options))
    {
        let entry = entry?;
        if entry.file_type().is_dir() {
            continue;
        }
        files.extend(FileInfo::from_entry(&entry, root)?);
    }
    Ok(files)
}

fn is_excluded(entry: &DirEntry, options: &WalkOptions) -> bool {
    let name = entry.file_name().to_string_lossy();
    if options.skip_hidden && name.starts_with('.') {
        return true;
    }
    if entry.file_type().is_dir() {
        options.exclude_dirs.iter().any(|d| *d == name)
    } else {
        options.exclude_suffixes.iter().any(|s| name.ends_with(s.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_max_depth_limits_walk() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir_all(temp_dir.path().join("a/b"))?;
        fs::write(temp_dir.path().join("top.bin"), b"1")?;
        fs::write(temp_dir.path().join("a/b/deep.bin"), b"2")?;

        let options = WalkOptions {
            max_depth: Some(1),
            ..WalkOptions::default()
        };
        let files = walk_directory(temp_dir.path(), options)?;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].size, 1);
        Ok(())
    }

    #[test]
    fn test_walk_with_subdirectories() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("subdir"))?;
        fs::write(temp_dir.path().join("file1.txt"), b"content1")?;
        fs::write(temp_dir.path().join("subdir/file2.txt"), b"content2")?;

        let files = walk_directory(temp_dir.path(), WalkOptions::default())?;
        let keys: Vec<String> = files.iter().map(|f| f.relative_key()).collect();
        assert_eq!(keys, vec!["file1.txt", "subdir/file2.txt"]);
        assert!(files[0].modified > 0.0);

        Ok(())
    }

    #[test]
    fn test_hidden_and_system_entries_skipped() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        fs::create_dir_all(root.join(".git/objects"))?;
        fs::create_dir_all(root.join("logs"))?;
        fs::create_dir_all(root.join("__pycache__"))?;
        fs::write(root.join(".git/objects/blob"), b"x")?;
        fs::write(root.join("logs/today.txt"), b"x")?;
        fs::write(root.join("__pycache__/m.pyc"), b"x")?;
        fs::write(root.join(".hidden"), b"x")?;
        fs::write(root.join("download.tmp"), b"x")?;
        fs::write(root.join("run.log"), b"x")?;
        fs::write(root.join("game.pak"), b"keep")?;

        let files = walk_directory(root, WalkOptions::default())?;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_key(), "game.pak");

        Ok(())
    }
}
