//! Peer-to-peer artifact exchange between launcher instances.
//!
//! Peers are addressed by content hash only. Every byte a peer hands us is
//! re-hashed before it is accepted, so a peer can waste time but never
//! inject content.

use axum::{
    body::Body,
    extract::{Path as UrlPath, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::P2pConfig;
use crate::fs::atomic::{discard_file_async, replace_file, temp_sibling};
use crate::integrity::hash::{sha256_bytes, sha256_file_async};
use crate::transfer::resumable::{DEFAULT_MAX_FILE_SIZE, SIZE_SLACK_DIVISOR};
use crate::{Result, UpdateError};

const PEERS_PER_FETCH: usize = 3;
const PEER_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn default_peer_port() -> u16 {
    8080
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Another launcher instance as reported by the tracker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub peer_id: String,
    pub ip: String,
    #[serde(default = "default_peer_port")]
    pub port: u16,
    /// Content hashes the peer can serve
    #[serde(default)]
    pub files: HashSet<String>,
    #[serde(skip, default = "now")]
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub upload_speed: f64,
    #[serde(default)]
    pub download_speed: f64,
}

impl Peer {
    fn download_url(&self, hash: &str) -> String {
        format!("http://{}:{}/download/{}", self.ip, self.port, hash)
    }
}

#[derive(Debug, Serialize)]
struct Announce<'a> {
    peer_id: &'a str,
    port: u16,
    files: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TrackerResponse {
    #[serde(default)]
    peers: Vec<Peer>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerStats {
    pub total_peers: usize,
    pub local_files: usize,
    pub available_files_from_peers: usize,
    pub average_upload_speed: f64,
    pub server_port: u16,
}

/// Stable identifier for this machine's launcher.
pub fn local_peer_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    let digest = sha256_bytes(format!("{}-launcher", host).as_bytes());
    digest[..16].to_string()
}

/// Files this instance offers to peers, keyed by SHA-256
#[derive(Debug, Default)]
pub struct SeedIndex {
    files: RwLock<HashMap<String, PathBuf>>,
}

impl SeedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash `path` and offer it. Returns the content hash.
    pub async fn add_file(&self, path: &Path) -> Result<String> {
        let hash = sha256_file_async(path.to_path_buf()).await?;
        self.files.write().await.insert(hash.clone(), path.to_path_buf());
        info!("Seeding {:?} as {}", path, hash);
        Ok(hash)
    }

    pub async fn get(&self, hash: &str) -> Option<PathBuf> {
        self.files.read().await.get(&hash.to_ascii_lowercase()).cloned()
    }

    pub async fn hashes(&self) -> Vec<String> {
        let mut hashes: Vec<String> = self.files.read().await.keys().cloned().collect();
        hashes.sort();
        hashes
    }

    pub async fn len(&self) -> usize {
        self.files.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Router serving `GET /download/{hash}` from the seed index.
pub fn seed_router(index: Arc<SeedIndex>) -> Router {
    Router::new()
        .route("/download/{hash}", get(serve_download))
        .layer(TraceLayer::new_for_http())
        .with_state(index)
}

async fn serve_download(State(index): State<Arc<SeedIndex>>, UrlPath(hash): UrlPath<String>) -> Response {
    let Some(path) = index.get(&hash).await else {
        return (StatusCode::NOT_FOUND, "File not found").into_response();
    };

    // The file may have changed since it was indexed
    match sha256_file_async(path.clone()).await {
        Ok(actual) if actual.eq_ignore_ascii_case(&hash) => {}
        Ok(_) => {
            warn!("Seeded file {:?} no longer matches {}", path, hash);
            return (StatusCode::NOT_FOUND, "File not found").into_response();
        }
        Err(e) => {
            warn!("Failed to hash seeded file {:?}: {}", path, e);
            return (StatusCode::NOT_FOUND, "File not found").into_response();
        }
    }

    match tokio::fs::File::open(&path).await {
        Ok(file) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            Body::from_stream(ReaderStream::new(file)),
        )
            .into_response(),
        Err(e) => {
            warn!("Failed to open seeded file {:?}: {}", path, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Read error").into_response()
        }
    }
}

/// Known peers plus the fetch path that pulls artifacts from them
pub struct PeerDirectory {
    local_id: String,
    client: reqwest::Client,
    tracker_url: Option<String>,
    port: u16,
    peer_timeout: Duration,
    max_file_size: u64,
    peers: RwLock<HashMap<String, Peer>>,
}

impl PeerDirectory {
    pub fn new(client: reqwest::Client, config: &P2pConfig) -> Self {
        Self {
            local_id: local_peer_id(),
            client,
            tracker_url: config.tracker_url.clone(),
            port: config.port,
            peer_timeout: Duration::from_secs(config.peer_timeout_secs),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Cap on what a single peer response may deliver.
    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Merge a peer list, ignoring ourselves.
    pub async fn update_peers(&self, peers: Vec<Peer>) {
        let mut known = self.peers.write().await;
        for mut peer in peers {
            if peer.peer_id.is_empty() || peer.peer_id == self.local_id {
                continue;
            }
            peer.last_seen = Utc::now();
            peer.files = peer.files.into_iter().map(|h| h.to_ascii_lowercase()).collect();
            known.insert(peer.peer_id.clone(), peer);
        }
    }

    /// Drop peers not seen within the configured timeout.
    pub async fn cleanup_inactive(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.peer_timeout).unwrap_or(chrono::Duration::seconds(300));
        let mut known = self.peers.write().await;
        let before = known.len();
        known.retain(|id, peer| {
            let keep = peer.last_seen >= cutoff;
            if !keep {
                info!("Removing inactive peer {}", id);
            }
            keep
        });
        before - known.len()
    }

    /// Peers advertising `hash`, fastest uploader first.
    pub async fn peers_with(&self, hash: &str) -> Vec<Peer> {
        let hash = hash.to_ascii_lowercase();
        let mut peers: Vec<Peer> = self
            .peers
            .read()
            .await
            .values()
            .filter(|p| p.files.contains(&hash))
            .cloned()
            .collect();
        peers.sort_by(|a, b| b.upload_speed.total_cmp(&a.upload_speed));
        peers
    }

    /// Tell the tracker what we seed and learn about other peers.
    pub async fn announce(&self, seeds: &SeedIndex) -> Result<usize> {
        let Some(tracker) = &self.tracker_url else {
            return Err(UpdateError::Config("No P2P tracker configured".to_string()));
        };
        let body = Announce {
            peer_id: &self.local_id,
            port: self.port,
            files: seeds.hashes().await,
        };
        let response = self
            .client
            .post(tracker)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| UpdateError::from_request(tracker, e))?;
        let parsed: TrackerResponse = response
            .json()
            .await
            .map_err(|e| UpdateError::from_request(tracker, e))?;

        let count = parsed.peers.len();
        self.update_peers(parsed.peers).await;
        debug!("Tracker returned {} peer(s)", count);
        Ok(count)
    }

    /// Try up to three peers for `hash`. Writes `dest` only after the hash matches.
    pub async fn fetch(&self, hash: &str, dest: &Path) -> Result<bool> {
        let candidates = self.peers_with(hash).await;
        if candidates.is_empty() {
            return Ok(false);
        }

        for peer in candidates.iter().take(PEERS_PER_FETCH) {
            match self.fetch_from(peer, hash, dest).await {
                Ok(true) => {
                    info!("Fetched {:?} from peer {}", dest, peer.peer_id);
                    return Ok(true);
                }
                Ok(false) => {}
                Err(e) => warn!("Peer {} failed: {}", peer.peer_id, e),
            }
        }
        Ok(false)
    }

    /// Stream one peer's copy into a scratch file, hashing as it arrives.
    /// The body may not exceed the size cap, nor a declared length by more
    /// than the transfer slack.
    async fn fetch_from(&self, peer: &Peer, hash: &str, dest: &Path) -> Result<bool> {
        let url = peer.download_url(hash);
        let response = self
            .client
            .get(&url)
            .timeout(PEER_REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| UpdateError::from_request(&url, e))?;
        if !response.status().is_success() {
            warn!("Peer {} returned {}", peer.peer_id, response.status());
            return Ok(false);
        }

        let limit = match response.content_length() {
            Some(declared) if declared > self.max_file_size => {
                return Err(UpdateError::SizeLimitExceeded {
                    what: url,
                    size: declared,
                    limit: self.max_file_size,
                });
            }
            Some(declared) => declared.saturating_add(declared / SIZE_SLACK_DIVISOR).min(self.max_file_size),
            None => self.max_file_size,
        };

        let scratch = temp_sibling(dest, ".peer");
        let result = stream_verified(response, &url, hash, &scratch, limit).await;
        match result {
            Ok(true) => {
                replace_file(&scratch, dest)?;
                Ok(true)
            }
            Ok(false) => {
                warn!("Hash mismatch from peer {} for {}", peer.peer_id, hash);
                discard_file_async(&scratch).await;
                Ok(false)
            }
            Err(e) => {
                discard_file_async(&scratch).await;
                Err(e)
            }
        }
    }

    pub async fn stats(&self, seeds: &SeedIndex) -> PeerStats {
        let peers = self.peers.read().await;
        let total = peers.len();
        PeerStats {
            total_peers: total,
            local_files: seeds.len().await,
            available_files_from_peers: peers.values().map(|p| p.files.len()).sum(),
            average_upload_speed: peers.values().map(|p| p.upload_speed).sum::<f64>() / total.max(1) as f64,
            server_port: self.port,
        }
    }
}

/// Write `response` to `scratch`, returning whether its SHA-256 is `hash`.
async fn stream_verified(
    response: reqwest::Response,
    url: &str,
    hash: &str,
    scratch: &Path,
    limit: u64,
) -> Result<bool> {
    let mut file = tokio::fs::File::create(scratch).await?;
    let mut hasher = Sha256::new();
    let mut received = 0u64;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| UpdateError::from_request(url, e))?;
        received += chunk.len() as u64;
        if received > limit {
            return Err(UpdateError::SizeLimitExceeded {
                what: url.to_string(),
                size: received,
                limit,
            });
        }
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(hex::encode(hasher.finalize()).eq_ignore_ascii_case(hash))
}
