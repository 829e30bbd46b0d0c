//! Shared fixtures: a local release server and release builders.

#![allow(dead_code)]

use launcher_updater::config::{Config, MirrorConfig};
use launcher_updater::integrity::hash::sha256_bytes;
use launcher_updater::manifest::{FileListManifest, ManifestEntry};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

pub struct TestServer {
    pub base_url: String,
    pub port: u16,
    handle: JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Serve `dir` over plain HTTP on an ephemeral loopback port.
pub async fn serve(dir: &Path) -> TestServer {
    serve_router(axum::Router::new().fallback_service(ServeDir::new(dir))).await
}

/// Serve `app` on an ephemeral loopback port.
pub async fn serve_router(app: axum::Router) -> TestServer {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    TestServer {
        base_url: format!("http://{}/", addr),
        port: addr.port(),
        handle,
    }
}

/// A loopback URL nothing listens on.
pub async fn dead_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}/", addr)
}

/// Deterministic, non-repeating test payload.
pub fn payload(len: usize) -> Vec<u8> {
    let mut state = 0x2545_f491_u32;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state & 0xff) as u8
        })
        .collect()
}

pub fn write_tree(root: &Path, files: &[(&str, &[u8])]) {
    for (name, data) in files {
        let path = root.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }
}

pub fn write_zip(path: &Path, files: &[(&str, &[u8])]) {
    let mut writer = ZipWriter::new(File::create(path).unwrap());
    for (name, data) in files {
        writer.start_file(*name, SimpleFileOptions::default()).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap();
}

/// Publish one full release into `release_dir`: files list, archive and
/// archive hash sidecar.
pub fn publish_version(release_dir: &Path, version: &str, files: &[(&str, &[u8])]) {
    let mut list = FileListManifest::new(version);
    for (name, data) in files {
        list.entries.push(ManifestEntry {
            relative_path: name.to_string(),
            sha256_hash: sha256_bytes(data),
            size_bytes: data.len() as u64,
        });
    }
    fs::write(release_dir.join(format!("files_list_v{}.txt", version)), list.render()).unwrap();

    let archive = release_dir.join(format!("files_list_v{}.zip", version));
    write_zip(&archive, files);
    let hash = sha256_bytes(&fs::read(&archive).unwrap());
    fs::write(release_dir.join(format!("files_list_v{}.zip.hash", version)), hash).unwrap();
}

pub fn set_remote_version(release_dir: &Path, version: &str) {
    fs::write(
        release_dir.join("version.txt"),
        format!("Version={}\nLauncherVersion=1.0.0\n", version),
    )
    .unwrap();
}

/// Client configuration rooted in `work`, pointed at `mirrors`.
pub fn client_config(work: &TempDir, mirrors: &[String]) -> Config {
    let mut config = Config::default();
    config.updater.base_url = mirrors[0].clone();
    config.updater.install_dir = work.path().join("game");
    config.updater.data_dir = work.path().join("data");
    config.updater.initial_version = "1.0.0".to_string();
    config.backup.dir = work.path().join("backups");
    config.cache.dir = work.path().join("cache");
    config.integrity.keys_dir = work.path().join("keys");
    config.transfer.allow_insecure_loopback = true;
    config.mirrors = mirrors
        .iter()
        .enumerate()
        .map(|(i, url)| MirrorConfig {
            url: url.clone(),
            name: Some(format!("mirror-{}", i)),
            region: "global".to_string(),
            priority: i as u32 + 1,
        })
        .collect();
    config
}
