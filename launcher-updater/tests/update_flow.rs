mod common;

use launcher_updater::config::Capabilities;
use launcher_updater::delta::generate_delta;
use launcher_updater::orchestrator::{InstallState, UpdateOrchestrator, UpdateServices};
use launcher_updater::{Result, UpdateEvent};
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

const V100: &[(&str, &[u8])] = &[
    ("bin/game.exe", b"game binary 1.0.0"),
    ("data/levels.pak", b"levels 1.0.0"),
    ("config.ini", b"volume=5"),
];

const V101: &[(&str, &[u8])] = &[
    ("bin/game.exe", b"game binary 1.0.1"),
    ("data/levels.pak", b"levels 1.0.0"),
    ("config.ini", b"volume=5"),
];

const V102: &[(&str, &[u8])] = &[
    ("bin/game.exe", b"game binary 1.0.2"),
    ("data/levels.pak", b"levels 1.0.2 with a new boss"),
    ("data/music.ogg", b"new soundtrack"),
    ("config.ini", b"volume=5"),
];

fn assert_tree(root: &std::path::Path, files: &[(&str, &[u8])]) {
    for (name, data) in files {
        assert_eq!(
            fs::read(root.join(name)).unwrap(),
            data.to_vec(),
            "content of {}",
            name
        );
    }
}

fn installed_version(config: &launcher_updater::Config) -> String {
    InstallState::load(&config.install_state_path(), "0.0.0")
        .unwrap()
        .current_version
}

#[tokio::test]
async fn test_full_update_applies_versions_in_order() -> Result<()> {
    let release = TempDir::new()?;
    common::publish_version(release.path(), "1.0.1", V101);
    common::publish_version(release.path(), "1.0.2", V102);
    common::set_remote_version(release.path(), "1.0.2");
    let server = common::serve(release.path()).await;

    let work = TempDir::new()?;
    let config = common::client_config(&work, &[server.base_url.clone()]);
    common::write_tree(&config.updater.install_dir, V100);

    let services = Arc::new(UpdateServices::from_config(&config)?);
    let mut events = services.events.subscribe();
    let orchestrator = UpdateOrchestrator::new(services);

    let check = orchestrator.check().await?;
    assert_eq!(check.plan, vec!["1.0.1", "1.0.2"]);

    let outcome = orchestrator.run().await;
    assert!(outcome.success, "{}", outcome.message);
    assert_eq!(outcome.applied, vec!["1.0.1", "1.0.2"]);
    assert_eq!(outcome.version.as_deref(), Some("1.0.2"));
    assert_tree(&config.updater.install_dir, V102);
    assert_eq!(installed_version(&config), "1.0.2");

    let mut summaries = Vec::new();
    let mut completed = None;
    while let Ok(event) = events.try_recv() {
        match event {
            UpdateEvent::InstallSummary {
                version,
                mismatched,
                ..
            } => summaries.push((version, mismatched)),
            UpdateEvent::Completed { success, .. } => completed = Some(success),
            _ => {}
        }
    }
    assert_eq!(summaries, vec![("1.0.1".to_string(), 0), ("1.0.2".to_string(), 0)]);
    assert_eq!(completed, Some(true));

    // A second run has nothing left to do
    let again = orchestrator.run().await;
    assert!(again.success);
    assert!(again.applied.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_delta_package_preferred() -> Result<()> {
    let release = TempDir::new()?;
    let trees = TempDir::new()?;
    common::write_tree(&trees.path().join("old"), V100);
    common::write_tree(&trees.path().join("new"), V101);
    let info = generate_delta(
        &trees.path().join("old"),
        &trees.path().join("new"),
        "1.0.0",
        "1.0.1",
        release.path(),
    )?;
    assert!(info.is_some());

    common::publish_version(release.path(), "1.0.1", V101);
    // Make the full archive unusable so only the delta can succeed
    fs::write(release.path().join("files_list_v1.0.1.zip"), b"not a zip")?;
    common::set_remote_version(release.path(), "1.0.1");
    let server = common::serve(release.path()).await;

    let work = TempDir::new()?;
    let config = common::client_config(&work, &[server.base_url.clone()]);
    common::write_tree(&config.updater.install_dir, V100);

    let orchestrator = UpdateOrchestrator::new(Arc::new(UpdateServices::from_config(&config)?));
    let outcome = orchestrator.run().await;
    assert!(outcome.success, "{}", outcome.message);
    assert_tree(&config.updater.install_dir, V101);
    Ok(())
}

#[tokio::test]
async fn test_integrity_failure_rolls_back() -> Result<()> {
    let release = TempDir::new()?;
    common::publish_version(release.path(), "1.0.1", V101);
    common::publish_version(release.path(), "1.0.2", V102);
    fs::write(release.path().join("files_list_v1.0.2.zip.hash"), "00".repeat(32))?;
    common::set_remote_version(release.path(), "1.0.2");
    let server = common::serve(release.path()).await;

    let work = TempDir::new()?;
    let mut config = common::client_config(&work, &[server.base_url.clone()]);
    config.capabilities.delta = false;
    common::write_tree(&config.updater.install_dir, V100);

    let orchestrator = UpdateOrchestrator::new(Arc::new(UpdateServices::from_config(&config)?));
    let outcome = orchestrator.run().await;

    assert!(!outcome.success);
    assert_eq!(outcome.applied, vec!["1.0.1"]);
    assert_eq!(outcome.version.as_deref(), Some("1.0.1"));
    let report = outcome.rollback.expect("rollback report");
    assert_eq!(report.version, "1.0.1");
    assert_eq!(report.restored, report.total);
    assert_tree(&config.updater.install_dir, V101);
    assert_eq!(installed_version(&config), "1.0.1");
    assert!(outcome.message.contains("rolled back"));
    Ok(())
}

#[tokio::test]
async fn test_tolerated_verification_failure_installs() -> Result<()> {
    let release = TempDir::new()?;
    common::publish_version(release.path(), "1.0.1", V101);
    fs::write(release.path().join("files_list_v1.0.1.zip.hash"), "00".repeat(32))?;
    common::set_remote_version(release.path(), "1.0.1");
    let server = common::serve(release.path()).await;

    let work = TempDir::new()?;
    let mut config = common::client_config(&work, &[server.base_url.clone()]);
    config.integrity.tolerate_failures = true;
    common::write_tree(&config.updater.install_dir, V100);

    let orchestrator = UpdateOrchestrator::new(Arc::new(UpdateServices::from_config(&config)?));
    let outcome = orchestrator.run().await;
    assert!(outcome.success, "{}", outcome.message);
    assert_tree(&config.updater.install_dir, V101);
    Ok(())
}

#[tokio::test]
async fn test_offline_loopback_server() -> Result<()> {
    let work = TempDir::new()?;
    let dead = common::dead_url().await;
    let config = common::client_config(&work, &[dead]);
    common::write_tree(&config.updater.install_dir, V100);

    let orchestrator = UpdateOrchestrator::new(Arc::new(UpdateServices::from_config(&config)?));
    let outcome = orchestrator.run().await;
    assert!(!outcome.success);
    assert!(outcome.message.starts_with("Offline mode"));
    assert_eq!(outcome.version.as_deref(), Some("1.0.0"));
    assert_tree(&config.updater.install_dir, V100);
    Ok(())
}

#[tokio::test]
async fn test_manual_rollback_keeps_pre_rollback_snapshot() -> Result<()> {
    let release = TempDir::new()?;
    common::publish_version(release.path(), "1.0.1", V101);
    common::set_remote_version(release.path(), "1.0.1");
    let server = common::serve(release.path()).await;

    let work = TempDir::new()?;
    let mut config = common::client_config(&work, &[server.base_url.clone()]);
    config.capabilities = Capabilities {
        delta: false,
        ..Capabilities::default()
    };
    common::write_tree(&config.updater.install_dir, V100);

    let services = Arc::new(UpdateServices::from_config(&config)?);
    let orchestrator = UpdateOrchestrator::new(services.clone());
    assert!(orchestrator.run().await.success);
    assert_tree(&config.updater.install_dir, V101);

    let report = orchestrator.rollback("1.0.0").await?;
    assert_eq!(report.restored, V100.len());
    assert_tree(&config.updater.install_dir, V100);
    assert_eq!(installed_version(&config), "1.0.0");

    let vault = services.rollback.as_ref().unwrap().vault();
    assert!(vault.get_backup("1.0.1_pre_rollback")?.is_some());
    Ok(())
}
