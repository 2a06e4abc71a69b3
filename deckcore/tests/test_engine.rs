mod common;

use std::{sync::Arc, time::Duration};

use deckcore::{
    config::{ContainerConfig, DeckConfig},
    management::{Container, DirAssetSource, HttpDownloadClient},
    runtime::ProcessState,
    DeckEngine, DeckcoreError,
};
use tempfile::tempdir;

use common::{
    fast_bootstrap_policy, fast_launch_policy, wait_for_file, ScriptChain, GUEST_IGNORE_TERM,
    GUEST_SLEEP, WINEBOOT_OK,
};

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_engine_requires_installed_runtime() -> anyhow::Result<()> {
    let home = tempdir()?;
    let engine = engine(home.path(), GUEST_SLEEP);

    assert!(!engine.is_available().await);
    assert!(matches!(
        engine.create_container("Game", None).await,
        Err(DeckcoreError::NotInitialized)
    ));
    assert!(matches!(
        engine.default_container().await,
        Err(DeckcoreError::NotInitialized)
    ));
    assert!(engine.list_containers().await?.is_empty());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_engine_foreground_replacement() -> anyhow::Result<()> {
    let home = tempdir()?;
    let engine = engine(home.path(), GUEST_SLEEP);

    let root = home.path().join("containers/c1");
    std::fs::create_dir_all(root.join("drive_c"))?;
    let exe = root.join("drive_c/game.exe");
    std::fs::write(&exe, "MZ")?;
    let container = Container::new("c1", "Test", &root, ContainerConfig::default());

    assert_eq!(engine.foreground().await, None);

    let first = engine.launch_foreground(&container, &exe, &[]).await?;
    assert_eq!(engine.foreground().await.as_ref(), Some(first.get_id()));

    let second = engine.launch_foreground(&container, &exe, &[]).await?;
    assert_ne!(first.get_id(), second.get_id());
    assert_eq!(engine.foreground().await.as_ref(), Some(second.get_id()));
    assert!(!engine.launcher().is_tracked(first.get_id()));
    assert!(engine.launcher().is_tracked(second.get_id()));

    engine.suspend_foreground().await?;
    engine.resume_foreground().await?;

    let stopped = engine.stop_foreground().await?;
    assert!(matches!(stopped, Some(ProcessState::Killed { .. })));
    assert_eq!(engine.foreground().await, None);
    assert_eq!(engine.stop_foreground().await?, None);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_interrupted_stop_keeps_foreground() -> anyhow::Result<()> {
    let home = tempdir()?;
    let engine = engine(home.path(), GUEST_IGNORE_TERM);

    let root = home.path().join("containers/c1");
    std::fs::create_dir_all(root.join("drive_c"))?;
    let exe = root.join("drive_c/game.exe");
    std::fs::write(&exe, "MZ")?;
    let container = Container::new("c1", "Test", &root, ContainerConfig::default());

    let process = engine.launch_foreground(&container, &exe, &[]).await?;
    assert!(wait_for_file(&root.join("ready")).await);

    // Cancelled while the process is still inside its graceful window.
    let interrupted =
        tokio::time::timeout(Duration::from_millis(100), engine.stop_foreground()).await;
    assert!(interrupted.is_err());
    assert_eq!(engine.foreground().await.as_ref(), Some(process.get_id()));
    assert!(engine.launcher().is_tracked(process.get_id()));

    let stopped = engine.stop_foreground().await?;
    assert!(matches!(
        stopped,
        Some(ProcessState::Killed { forced: true, .. })
    ));
    assert_eq!(engine.foreground().await, None);
    assert!(!engine.launcher().is_tracked(process.get_id()));
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn engine(home: &std::path::Path, guest: &str) -> DeckEngine {
    let config = DeckConfig::builder()
        .home(home)
        .bootstrap(fast_bootstrap_policy())
        .launch(fast_launch_policy())
        .mono_url(None)
        .build();

    DeckEngine::with_parts(
        config,
        Arc::new(DirAssetSource::new(home.join("assets"))),
        Arc::new(ScriptChain::new(WINEBOOT_OK, guest)),
        Arc::new(HttpDownloadClient::new()),
    )
}
