mod common;

use axum::routing::get;
use chrono::Utc;
use launcher_updater::config::{MirrorConfig, P2pConfig};
use launcher_updater::integrity::hash::sha256_bytes;
use launcher_updater::sources::p2p::{seed_router, Peer};
use launcher_updater::sources::{FetchSource, PeerDirectory, SeedIndex, SelectorOptions, SourceSelector};
use launcher_updater::transfer::{DownloadManager, TransferOptions};
use launcher_updater::Result;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn mirror(url: &str, name: &str, priority: u32) -> MirrorConfig {
    MirrorConfig {
        url: url.to_string(),
        name: Some(name.to_string()),
        region: "global".to_string(),
        priority,
    }
}

fn selector(mirrors: &[MirrorConfig]) -> SourceSelector {
    SourceSelector::new(
        reqwest::Client::new(),
        mirrors,
        SelectorOptions {
            allow_insecure_loopback: true,
            ..SelectorOptions::default()
        },
    )
}

fn downloads() -> DownloadManager {
    DownloadManager::new(
        reqwest::Client::new(),
        TransferOptions {
            allow_insecure_loopback: true,
            ..TransferOptions::default()
        },
        64 * 1024 * 1024,
    )
}

#[tokio::test]
async fn test_dead_mirror_deactivated_and_revived() -> Result<()> {
    let release = TempDir::new()?;
    fs::write(release.path().join("version.txt"), "Version=1.0.1\n")?;
    let live = common::serve(release.path()).await;
    let dead = common::dead_url().await;

    let selector = selector(&[mirror(&dead, "dead", 1), mirror(&live.base_url, "live", 2)]);

    for _ in 0..3 {
        assert_eq!(selector.check_all().await, 1);
    }
    let mirrors = selector.mirrors().await;
    let dead_mirror = mirrors.iter().find(|m| m.name == "dead").unwrap();
    assert!(!dead_mirror.active);
    assert_eq!(dead_mirror.failures, 3);

    let best = selector.select_best().await?;
    assert_eq!(best.name, "live");
    assert!(best.response_time.is_some());
    assert!(selector.fallback_mirrors(&best.url, 2).await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_download_falls_back_to_next_mirror() -> Result<()> {
    let release = TempDir::new()?;
    let data = common::payload(40_000);
    fs::write(release.path().join("files_list_v1.0.1.zip"), &data)?;
    let live = common::serve(release.path()).await;
    let dead = common::dead_url().await;

    let selector = selector(&[mirror(&dead, "dead", 1), mirror(&live.base_url, "live", 2)]);
    let work = TempDir::new()?;
    let dest = work.path().join("files_list_v1.0.1.zip");

    let outcome = selector
        .download_with_fallback(&downloads(), "files_list_v1.0.1.zip", &dest, None)
        .await?;
    assert_eq!(outcome.source, FetchSource::Mirror(live.base_url.clone()));
    assert_eq!(outcome.bytes, data.len() as u64);
    assert_eq!(fs::read(&dest)?, data);

    let stats = selector.stats().await;
    let dead_stats = stats.mirrors.iter().find(|m| m.mirror.name == "dead").unwrap();
    assert_eq!(dead_stats.mirror.failures, 1);
    Ok(())
}

#[tokio::test]
async fn test_missing_everywhere_is_an_error() -> Result<()> {
    let release = TempDir::new()?;
    let live = common::serve(release.path()).await;
    let selector = selector(&[mirror(&live.base_url, "live", 1)]);
    let work = TempDir::new()?;

    let result = selector
        .download_with_fallback(&downloads(), "nope.zip", &work.path().join("nope.zip"), None)
        .await;
    assert!(result.is_err());

    // A 404 is not a health failure
    let mirrors = selector.mirrors().await;
    assert_eq!(mirrors[0].failures, 0);
    assert!(mirrors[0].active);
    Ok(())
}

#[tokio::test]
async fn test_performance_round_trip() -> Result<()> {
    let release = TempDir::new()?;
    fs::write(release.path().join("version.txt"), "Version=1.0.1\n")?;
    let live = common::serve(release.path()).await;
    let configs = [mirror(&live.base_url, "live", 1)];

    let first = selector(&configs);
    first.check_all().await;
    let work = TempDir::new()?;
    let path = work.path().join("mirror_performance.json");
    first.save_performance(&path).await?;

    let second = selector(&configs);
    assert_eq!(second.load_performance(&path).await?, 1);
    let restored = &second.mirrors().await[0];
    assert!(restored.response_time.is_some());
    assert_eq!(restored.total_requests, 1);
    Ok(())
}

/// A peer on loopback `port` advertising `hash`.
fn seed_peer(port: u16, hash: &str) -> Peer {
    Peer {
        peer_id: "seed".to_string(),
        ip: "127.0.0.1".to_string(),
        port,
        files: [hash.to_string()].into_iter().collect(),
        last_seen: Utc::now(),
        upload_speed: 1.0,
        download_speed: 0.0,
    }
}

async fn peers(port: u16, hash: &str, max_file_size: Option<u64>) -> Arc<PeerDirectory> {
    let mut directory = PeerDirectory::new(reqwest::Client::new(), &P2pConfig::default());
    if let Some(max) = max_file_size {
        directory = directory.with_max_file_size(max);
    }
    directory.update_peers(vec![seed_peer(port, hash)]).await;
    Arc::new(directory)
}

fn is_empty_dir(dir: &Path) -> Result<bool> {
    Ok(fs::read_dir(dir)?.next().is_none())
}

#[tokio::test]
async fn test_peer_supplies_file_when_mirrors_are_down() -> Result<()> {
    let seeds = TempDir::new()?;
    let body = common::payload(32 * 1024);
    let seeded = seeds.path().join("files_list_v1.0.2.zip");
    fs::write(&seeded, &body)?;
    let index = Arc::new(SeedIndex::new());
    let hash = index.add_file(&seeded).await?;
    let seed = common::serve_router(seed_router(index)).await;

    let dead = common::dead_url().await;
    let selector = selector(&[mirror(&dead, "dead", 1)]).with_peers(peers(seed.port, &hash, None).await);
    let work = TempDir::new()?;
    let dest = work.path().join("files_list_v1.0.2.zip");

    let outcome = selector
        .download_with_fallback(&downloads(), "files_list_v1.0.2.zip", &dest, Some(&hash))
        .await?;
    assert_eq!(outcome.source, FetchSource::Peer);
    assert_eq!(outcome.bytes, body.len() as u64);
    assert_eq!(fs::read(&dest)?, body);

    // Without a known hash peers are never asked
    let unhashed = work.path().join("unhashed.zip");
    let result = selector
        .download_with_fallback(&downloads(), "files_list_v1.0.2.zip", &unhashed, None)
        .await;
    assert!(result.is_err());
    assert!(!unhashed.exists());
    Ok(())
}

#[tokio::test]
async fn test_peer_with_wrong_hash_writes_nothing() -> Result<()> {
    let seeds = TempDir::new()?;
    let seeded = seeds.path().join("archive.zip");
    fs::write(&seeded, common::payload(4096))?;
    let index = Arc::new(SeedIndex::new());
    index.add_file(&seeded).await?;
    let seed = common::serve_router(seed_router(index)).await;

    // The peer claims a hash its seed index does not hold
    let wanted = sha256_bytes(b"some other archive");
    let dead = common::dead_url().await;
    let selector = selector(&[mirror(&dead, "dead", 1)]).with_peers(peers(seed.port, &wanted, None).await);
    let work = TempDir::new()?;
    let dest = work.path().join("archive.zip");

    let result = selector
        .download_with_fallback(&downloads(), "archive.zip", &dest, Some(&wanted))
        .await;
    assert!(result.is_err());
    assert!(is_empty_dir(work.path())?);
    Ok(())
}

#[tokio::test]
async fn test_tampered_peer_body_is_discarded() -> Result<()> {
    let expected = common::payload(2048);
    let hash = sha256_bytes(&expected);
    let tampered = axum::Router::new().route("/download/{hash}", get(|| async { vec![0u8; 2048] }));
    let seed = common::serve_router(tampered).await;

    let directory = peers(seed.port, &hash, None).await;
    let work = TempDir::new()?;
    let dest = work.path().join("archive.zip");

    assert!(!directory.fetch(&hash, &dest).await?);
    assert!(is_empty_dir(work.path())?);
    Ok(())
}

#[tokio::test]
async fn test_peer_body_over_size_limit_is_rejected() -> Result<()> {
    let seeds = TempDir::new()?;
    let seeded = seeds.path().join("archive.zip");
    fs::write(&seeded, common::payload(64 * 1024))?;
    let index = Arc::new(SeedIndex::new());
    let hash = index.add_file(&seeded).await?;
    let seed = common::serve_router(seed_router(index)).await;

    let directory = peers(seed.port, &hash, Some(1024)).await;
    let work = TempDir::new()?;
    let dest = work.path().join("archive.zip");

    assert!(!directory.fetch(&hash, &dest).await?);
    assert!(is_empty_dir(work.path())?);
    Ok(())
}

#[tokio::test]
async fn test_peer_declared_length_over_size_limit_is_rejected() -> Result<()> {
    let body = common::payload(8192);
    let hash = sha256_bytes(&body);
    let oversized = axum::Router::new().route(
        "/download/{hash}",
        get(move || {
            let body = body.clone();
            async move { body }
        }),
    );
    let seed = common::serve_router(oversized).await;

    let directory = peers(seed.port, &hash, Some(4096)).await;
    let work = TempDir::new()?;
    let dest = work.path().join("archive.zip");

    assert!(!directory.fetch(&hash, &dest).await?);
    assert!(is_empty_dir(work.path())?);
    Ok(())
}
