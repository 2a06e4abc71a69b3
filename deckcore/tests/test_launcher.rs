mod common;

use std::{path::PathBuf, sync::Arc, time::Duration};

use deckcore::{
    config::ContainerConfig,
    management::{Container, RuntimeLayout},
    runtime::{ProcessLauncher, ProcessState},
    DeckcoreError,
};
use deckutils::ProcessSampler;
use futures::StreamExt;
use nix::{
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use tempfile::{tempdir, TempDir};

use common::{fast_launch_policy, wait_for_file, ScriptChain, GUEST_IGNORE_TERM, GUEST_SLEEP};

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_launch_missing_executable() -> anyhow::Result<()> {
    let (_home, container, _exe) = setup()?;
    let launcher = launcher(GUEST_SLEEP, &container);

    let missing = container.drive_c().join("missing.exe");
    let result = launcher.launch(&container, &missing, &[]).await;

    assert!(matches!(result, Err(DeckcoreError::BinaryMissing(path)) if path == missing));
    assert!(launcher.process_ids().is_empty());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_monitor_reports_exit() -> anyhow::Result<()> {
    let (_home, container, exe) = setup()?;
    let launcher = launcher("echo hello from guest; echo 'err: bad thing' >&2; exit 3", &container);

    let process = launcher.launch(&container, &exe, &[]).await?;
    assert!(process.get_id().ends_with(&format!("-{}", process.get_native_pid())));
    assert_eq!(process.get_container_id(), "c1");

    let statuses = launcher
        .monitor(process.get_id(), Duration::from_millis(50))
        .collect::<Vec<_>>()
        .await;

    let last = statuses.last().expect("at least one status");
    let last = last.as_ref().map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(last.get_state(), ProcessState::Exited { code: 3 });
    assert_eq!(last.get_memory_kb(), 0);
    assert!(!launcher.is_tracked(process.get_id()));

    let log = std::fs::read_to_string(container.log_dir().join("game.log"))?;
    assert!(log.contains("hello from guest"));
    assert!(log.contains("err: bad thing"));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_dropping_monitor_untracks_process() -> anyhow::Result<()> {
    let (_home, container, exe) = setup()?;
    let launcher = launcher(GUEST_SLEEP, &container);

    let process = launcher.launch(&container, &exe, &[]).await?;
    let mut statuses = Box::pin(launcher.monitor(process.get_id(), Duration::from_millis(50)));
    let first = statuses.next().await.expect("a status");
    assert!(first.map_err(|e| anyhow::anyhow!("{e}"))?.is_running());
    assert!(launcher.is_tracked(process.get_id()));

    drop(statuses);
    assert!(!launcher.is_tracked(process.get_id()));

    // The game itself keeps running when the observer goes away.
    killpg(Pid::from_raw(process.get_native_pid() as i32), Signal::SIGKILL)?;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_unpolled_monitor_untracks_process() -> anyhow::Result<()> {
    let (_home, container, exe) = setup()?;
    let launcher = launcher(GUEST_SLEEP, &container);

    let process = launcher.launch(&container, &exe, &[]).await?;
    drop(launcher.monitor(process.get_id(), Duration::from_millis(50)));

    assert!(!launcher.is_tracked(process.get_id()));
    assert!(matches!(
        launcher.get_status(process.get_id()).await,
        Err(DeckcoreError::NotFound { .. })
    ));

    killpg(Pid::from_raw(process.get_native_pid() as i32), Signal::SIGKILL)?;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_graceful_kill() -> anyhow::Result<()> {
    let (_home, container, exe) = setup()?;
    let launcher = launcher(GUEST_SLEEP, &container);

    let process = launcher.launch(&container, &exe, &[]).await?;
    let status = launcher.get_status(process.get_id()).await?;
    assert!(status.is_running());

    let state = launcher.kill(process.get_id(), false).await?;
    assert_eq!(
        state,
        ProcessState::Killed {
            signal: Signal::SIGTERM as i32,
            forced: false
        }
    );
    assert!(!launcher.is_tracked(process.get_id()));
    assert!(matches!(
        launcher.kill(process.get_id(), false).await,
        Err(DeckcoreError::NotFound { .. })
    ));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_graceful_kill_escalates() -> anyhow::Result<()> {
    let (_home, container, exe) = setup()?;
    let launcher = launcher(GUEST_IGNORE_TERM, &container);

    let process = launcher.launch(&container, &exe, &[]).await?;
    assert!(wait_for_file(&container.get_root_path().join("ready")).await);

    let state = launcher.kill(process.get_id(), false).await?;
    assert_eq!(
        state,
        ProcessState::Killed {
            signal: Signal::SIGKILL as i32,
            forced: true
        }
    );
    assert!(!launcher.is_tracked(process.get_id()));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_force_kill() -> anyhow::Result<()> {
    let (_home, container, exe) = setup()?;
    let launcher = launcher(GUEST_SLEEP, &container);

    let process = launcher.launch(&container, &exe, &[]).await?;
    let state = launcher.kill(process.get_id(), true).await?;
    assert_eq!(
        state,
        ProcessState::Killed {
            signal: Signal::SIGKILL as i32,
            forced: true
        }
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_suspend_and_resume() -> anyhow::Result<()> {
    let (_home, container, exe) = setup()?;
    let launcher = launcher(GUEST_SLEEP, &container);

    let process = launcher.launch(&container, &exe, &[]).await?;
    launcher.suspend(process.get_id())?;
    assert!(launcher.get_status(process.get_id()).await?.is_running());
    launcher.resume(process.get_id())?;
    assert!(launcher.get_status(process.get_id()).await?.is_running());

    launcher.kill(process.get_id(), true).await?;
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn setup() -> anyhow::Result<(TempDir, Container, PathBuf)> {
    let home = tempdir()?;
    let root = home.path().join("containers/c1");
    std::fs::create_dir_all(root.join("drive_c"))?;

    let exe = root.join("drive_c/game.exe");
    std::fs::write(&exe, "MZ")?;

    let container = Container::new("c1", "Test", root, ContainerConfig::default());
    Ok((home, container, exe))
}

fn launcher(guest: &str, container: &Container) -> ProcessLauncher {
    let home = container
        .get_root_path()
        .parent()
        .and_then(|p| p.parent())
        .map(PathBuf::from)
        .unwrap_or_default();
    let layout = RuntimeLayout::new(home);

    ProcessLauncher::new(
        Arc::new(ScriptChain::new(common::WINEBOOT_OK, guest)),
        layout.environment_builder(),
        fast_launch_policy(),
        ProcessSampler::new(),
    )
}
