use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub port: u16,
    /// Directory served to launchers
    pub release_dir: PathBuf,
    pub keys_dir: PathBuf,
    pub files_list_prefix: String,
    pub launcher_version: Option<String>,
    pub log_level: String,
}

impl PublisherConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Self {
            port: std::env::var("PUBLISHER_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            release_dir: PathBuf::from(
                std::env::var("PUBLISHER_RELEASE_DIR").unwrap_or_else(|_| "releases".into()),
            ),
            keys_dir: PathBuf::from(
                std::env::var("PUBLISHER_KEYS_DIR").unwrap_or_else(|_| "crypto_keys".into()),
            ),
            files_list_prefix: std::env::var("PUBLISHER_FILES_LIST_PREFIX")
                .unwrap_or_else(|_| "files_list_v".into()),
            launcher_version: std::env::var("PUBLISHER_LAUNCHER_VERSION").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
        }
    }
}
