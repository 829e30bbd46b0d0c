//! Configuration management for the launcher updater.
//!
//! Loads configuration from a TOML file with `LAUNCHER__SECTION__KEY`
//! environment variable overrides.

use crate::sources::strategy::StrategyKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub updater: UpdaterConfig,

    #[serde(default)]
    pub transfer: TransferConfig,

    /// Mirror definitions; seeded from `updater.base_url` when empty
    #[serde(default)]
    pub mirrors: Vec<MirrorConfig>,

    #[serde(default)]
    pub integrity: IntegrityConfig,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub p2p: P2pConfig,

    #[serde(default)]
    pub capabilities: Capabilities,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// Update base URL (trailing slash optional)
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Name of the remote version file
    #[serde(default = "default_version_file")]
    pub version_file: String,

    /// Prefix of per-version file lists and archives
    #[serde(default = "default_files_list_prefix")]
    pub files_list_prefix: String,

    /// Root of the installed file tree
    #[serde(default = "default_install_dir")]
    pub install_dir: PathBuf,

    /// Working directory for downloads and install state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Version assumed when no install state has been recorded yet
    #[serde(default = "default_initial_version")]
    pub initial_version: String,

    /// Where launcher self-update packages are published
    #[serde(default)]
    pub launcher_update_url: Option<String>,

    #[serde(default = "default_launcher_update_filename")]
    pub launcher_update_filename: String,

    /// Client region used by the geographic strategy
    #[serde(default)]
    pub region: Option<String>,

    #[serde(default)]
    pub strategy: StrategyKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Hard ceiling on any single download
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Files at least this large are fetched as parallel range chunks
    #[serde(default = "default_parallel_threshold")]
    pub parallel_threshold: u64,

    /// Permit plain http against loopback hosts (local mirrors, tests)
    #[serde(default)]
    pub allow_insecure_loopback: bool,

    /// Run the network calibration before the first parallel transfer
    #[serde(default)]
    pub calibrate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    pub url: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_region")]
    pub region: String,

    /// 1 is best
    #[serde(default = "default_priority")]
    pub priority: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityConfig {
    /// HTTPS endpoint serving the release public key (PEM)
    #[serde(default)]
    pub public_key_url: Option<String>,

    #[serde(default = "default_keys_dir")]
    pub keys_dir: PathBuf,

    /// Treat "verification unavailable" as fatal
    #[serde(default)]
    pub require_signatures: bool,

    /// Proceed past a failed verification with a warning
    #[serde(default)]
    pub tolerate_failures: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_backup_dir")]
    pub dir: PathBuf,

    /// Number of backups retained by cleanup
    #[serde(default = "default_keep_count")]
    pub keep_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_cache_ttl")]
    pub default_ttl_secs: u64,

    #[serde(default = "default_version_ttl")]
    pub version_ttl_secs: u64,

    #[serde(default = "default_files_list_ttl")]
    pub files_list_ttl_secs: u64,

    #[serde(default = "default_manifest_ttl")]
    pub manifest_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pConfig {
    /// Port the local seed server listens on
    #[serde(default = "default_p2p_port")]
    pub port: u16,

    #[serde(default)]
    pub tracker_url: Option<String>,

    /// Seconds after which a silent peer is forgotten
    #[serde(default = "default_peer_timeout")]
    pub peer_timeout_secs: u64,
}

/// Optional subsystems, resolved once at startup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capabilities {
    #[serde(default = "default_true")]
    pub delta: bool,

    #[serde(default = "default_true")]
    pub backup: bool,

    #[serde(default = "default_true")]
    pub signatures: bool,

    #[serde(default = "default_true")]
    pub cache: bool,

    #[serde(default)]
    pub p2p: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_base_url() -> String {
    "https://cdn.example.com/launcher/".to_string()
}

fn default_version_file() -> String {
    "version.txt".to_string()
}

fn default_files_list_prefix() -> String {
    "files_list_v".to_string()
}

fn default_install_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("launcher_data")
}

fn default_initial_version() -> String {
    "1.0.0".to_string()
}

fn default_launcher_update_filename() -> String {
    "launcher_update.zip".to_string()
}

fn default_max_file_size() -> u64 {
    2 * 1024 * 1024 * 1024 // 2GB
}

fn default_request_timeout_secs() -> u64 {
    600
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_parallel_threshold() -> u64 {
    8 * 1024 * 1024 // 8MB
}

fn default_region() -> String {
    "global".to_string()
}

fn default_priority() -> u32 {
    1
}

fn default_keys_dir() -> PathBuf {
    PathBuf::from("crypto_keys")
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("launcher_backups")
}

fn default_keep_count() -> usize {
    10
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("launcher_cache")
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_version_ttl() -> u64 {
    300
}

fn default_files_list_ttl() -> u64 {
    1800
}

fn default_manifest_ttl() -> u64 {
    3600
}

fn default_p2p_port() -> u16 {
    8080
}

fn default_peer_timeout() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            version_file: default_version_file(),
            files_list_prefix: default_files_list_prefix(),
            install_dir: default_install_dir(),
            data_dir: default_data_dir(),
            initial_version: default_initial_version(),
            launcher_update_url: None,
            launcher_update_filename: default_launcher_update_filename(),
            region: None,
            strategy: StrategyKind::default(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            parallel_threshold: default_parallel_threshold(),
            allow_insecure_loopback: false,
            calibrate: false,
        }
    }
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            public_key_url: None,
            keys_dir: default_keys_dir(),
            require_signatures: false,
            tolerate_failures: false,
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: default_backup_dir(),
            keep_count: default_keep_count(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            default_ttl_secs: default_cache_ttl(),
            version_ttl_secs: default_version_ttl(),
            files_list_ttl_secs: default_files_list_ttl(),
            manifest_ttl_secs: default_manifest_ttl(),
        }
    }
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            port: default_p2p_port(),
            tracker_url: None,
            peer_timeout_secs: default_peer_timeout(),
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            delta: true,
            backup: true,
            signatures: true,
            cache: true,
            p2p: false,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, without environment overrides
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from an optional TOML file layered with
    /// `LAUNCHER__*` environment overrides
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("LAUNCHER")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Mirror pool definitions, default-seeded from the base URL
    pub fn mirror_definitions(&self) -> Vec<MirrorConfig> {
        if !self.mirrors.is_empty() {
            return self.mirrors.clone();
        }
        vec![MirrorConfig {
            url: self.updater.base_url.clone(),
            name: Some("primary".to_string()),
            region: default_region(),
            priority: 1,
        }]
    }

    pub fn install_state_path(&self) -> PathBuf {
        self.updater.data_dir.join("install_state.json")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.updater.data_dir.join("downloads")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.updater.version_file, "version.txt");
        assert_eq!(config.updater.files_list_prefix, "files_list_v");
        assert_eq!(config.backup.keep_count, 10);
        assert_eq!(config.cache.version_ttl_secs, 300);
        assert!(config.capabilities.delta);
        assert!(!config.capabilities.p2p);
        assert!(!config.transfer.allow_insecure_loopback);
    }

    #[test]
    fn test_mirrors_seeded_from_base_url() {
        let config = Config::default();
        let mirrors = config.mirror_definitions();
        assert_eq!(mirrors.len(), 1);
        assert_eq!(mirrors[0].url, config.updater.base_url);
        assert_eq!(mirrors[0].priority, 1);
    }

    #[test]
    fn test_partial_toml() -> anyhow::Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(
            file,
            r#"
[updater]
base_url = "https://updates.example.org/game/"
strategy = "round_robin"

[[mirrors]]
url = "https://eu.example.org/game/"
region = "eu"
priority = 2

[capabilities]
delta = false
"#
        )?;

        let config = Config::from_file(file.path())?;
        assert_eq!(config.updater.base_url, "https://updates.example.org/game/");
        assert_eq!(config.updater.strategy, StrategyKind::RoundRobin);
        assert_eq!(config.updater.version_file, "version.txt");
        assert_eq!(config.mirrors.len(), 1);
        assert_eq!(config.mirrors[0].region, "eu");
        assert!(!config.capabilities.delta);
        assert!(config.capabilities.backup);
        Ok(())
    }
}
