use std::{
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::Arc,
};

use deckutils::ProcessLog;
use getset::CopyGetters;
use nix::{sys::signal::Signal, unistd::getuid};
use tokio::{fs, process::Child};

use crate::{
    config::{BootstrapPolicy, ContainerConfig},
    environment::{EnvTier, EnvironmentBuilder},
    runtime::{signal_group, spawn_drain, DrainOptions, DrainSummary, SandboxChain},
    utils::{CONTAINER_LOG_SUBDIR, CONTAINER_TMP_SUBDIR, REGISTRY_HIVES},
    DeckcoreError, DeckcoreResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Exit code of a sandboxed process killed by `SIGSEGV`, usually a sandbox crash.
pub const SANDBOX_CRASH_EXIT_CODE: i32 = 139;

/// Output of a bootstrap that exited cleanly without a usable prefix.
pub const KERNEL32_FAILURE_SIGNATURE: &str = "could not load kernel32.dll";

/// Lines of each bootstrap attempt's output traced in full.
const TRACED_LINES: usize = 20;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Runs the first-run initialization of a container.
///
/// Attempts run strictly one after the other. Attempt `n` uses the translator settings for
/// [`EnvTier::Attempt`] with index `n`, which get more conservative with every retry, and a timeout that
/// is short for the first attempt and long for the rest. An attempt succeeds only once its
/// process exited with code 0 and all registry hives exist.
#[derive(Debug, Clone)]
pub struct Bootstrapper {
    chain: Arc<dyn SandboxChain>,
    env: EnvironmentBuilder,
    policy: BootstrapPolicy,
}

/// The result of a successful bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub with_prefix")]
pub struct BootstrapReport {
    /// How many attempts ran, including the successful one.
    attempts: u32,

    /// Whether the compatibility layer's service socket appeared before the first attempt.
    service_ready: bool,
}

/// Why a single attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AttemptFailure {
    TimedOut,
    MissingHives,
    Exited(Option<i32>),
}

/// The service process kept alive for the duration of a bootstrap.
struct ServiceGuard {
    child: Option<Child>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Bootstrapper {
    /// Creates a bootstrapper.
    pub fn new(chain: Arc<dyn SandboxChain>, env: EnvironmentBuilder, policy: BootstrapPolicy) -> Self {
        Self { chain, env, policy }
    }

    /// Bootstraps the container at `root`.
    ///
    /// ## Errors
    ///
    /// Returns [`DeckcoreError::BootstrapFailure`] carrying the last exit code and output once
    /// every attempt failed, or [`DeckcoreError::LaunchFailure`] if the bootstrap command cannot
    /// be spawned at all.
    pub async fn run(
        &self,
        container_id: &str,
        root: &Path,
        config: &ContainerConfig,
    ) -> DeckcoreResult<BootstrapReport> {
        let mut service = self.start_service(root, config);
        let service_ready = if service.child.is_some() {
            self.wait_for_service_socket(root).await
        } else {
            false
        };

        if !service_ready {
            tracing::warn!(
                %container_id,
                attempts = self.policy.get_socket_poll_attempts(),
                "wineserver socket did not appear, continuing without it"
            );
        }

        let attempts = self.policy.get_attempts();
        let mut last_exit_code = None;
        let mut last_tail = String::new();

        for attempt in 0..attempts {
            tracing::info!(%container_id, attempt, "bootstrap attempt starting");

            let (failure, summary) = self.attempt(container_id, root, config, attempt).await?;
            let Some(failure) = failure else {
                tracing::info!(%container_id, attempts = attempt + 1, "bootstrap succeeded");
                service.stop().await;
                return Ok(BootstrapReport {
                    attempts: attempt + 1,
                    service_ready,
                });
            };

            last_tail = summary.tail_text();
            last_exit_code = match failure {
                AttemptFailure::Exited(code) => code,
                AttemptFailure::MissingHives => Some(0),
                AttemptFailure::TimedOut => None,
            };

            match failure {
                AttemptFailure::TimedOut => tracing::warn!(
                    %container_id,
                    attempt,
                    timeout = ?self.policy.attempt_timeout(attempt),
                    "bootstrap attempt timed out"
                ),
                AttemptFailure::MissingHives => {
                    if summary.contains(KERNEL32_FAILURE_SIGNATURE) {
                        tracing::error!(
                            %container_id,
                            attempt,
                            "compatibility layer could not load kernel32.dll"
                        );
                    }
                    tracing::warn!(
                        %container_id,
                        attempt,
                        "bootstrap exited cleanly but registry hives never appeared"
                    );
                }
                AttemptFailure::Exited(Some(SANDBOX_CRASH_EXIT_CODE)) => tracing::error!(
                    %container_id,
                    attempt,
                    "sandbox crashed with SIGSEGV during bootstrap"
                ),
                AttemptFailure::Exited(code) => tracing::warn!(
                    %container_id,
                    attempt,
                    ?code,
                    "bootstrap attempt failed"
                ),
            }

            remove_hives(root).await;

            if attempt + 1 < attempts {
                let backoff = self.policy.backoff(attempt);
                tracing::info!(%container_id, ?backoff, "retrying bootstrap after backoff");
                tokio::time::sleep(backoff).await;
            }
        }

        service.stop().await;
        tracing::error!(%container_id, attempts, "bootstrap failed");

        Err(DeckcoreError::BootstrapFailure {
            container_id: container_id.to_string(),
            attempts,
            last_exit_code,
            output_tail: last_tail,
        })
    }

    async fn attempt(
        &self,
        container_id: &str,
        root: &Path,
        config: &ContainerConfig,
        attempt: u32,
    ) -> DeckcoreResult<(Option<AttemptFailure>, DrainSummary)> {
        let tier = EnvTier::Attempt {
            index: attempt,
            last: self.policy.get_attempts().saturating_sub(1),
        };
        let env = self.env.build(root, tier, config);
        let mut command = self.chain.wineboot(root, &env);
        command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        tracing::debug!(command = ?command.as_std(), "spawning bootstrap");

        let mut child = command
            .spawn()
            .map_err(|e| DeckcoreError::launch("wineboot", e.to_string()))?;

        let log = ProcessLog::create(
            root.join(CONTAINER_LOG_SUBDIR),
            &format!("wineboot-{attempt}"),
        )
        .await
        .ok();

        // Draining starts before the wait so a chatty child never blocks on a full pipe.
        let drain = spawn_drain(
            child.stdout.take(),
            child.stderr.take(),
            DrainOptions {
                label: format!("{container_id}/wineboot#{attempt}"),
                full_log_lines: TRACED_LINES,
                tail_lines: self.policy.get_output_tail_lines(),
                log,
            },
        );

        let waited = tokio::time::timeout(self.policy.attempt_timeout(attempt), child.wait()).await;
        let status = match waited {
            Ok(status) => Some(status?),
            Err(_) => {
                kill_child(&mut child).await;
                None
            }
        };

        let summary = drain.finish(self.policy.drain_grace()).await;
        let failure = match status {
            None => Some(AttemptFailure::TimedOut),
            Some(status) if status.success() => {
                if self.wait_for_hives(root).await {
                    None
                } else {
                    Some(AttemptFailure::MissingHives)
                }
            }
            Some(status) => Some(AttemptFailure::Exited(exit_code(status))),
        };

        Ok((failure, summary))
    }

    /// Starts the compatibility layer's service, which the guest cannot start itself under
    /// translation.
    fn start_service(&self, root: &Path, config: &ContainerConfig) -> ServiceGuard {
        let tier = EnvTier::Attempt {
            index: 0,
            last: self.policy.get_attempts().saturating_sub(1),
        };
        let env = self.env.build(root, tier, config);
        let mut command = self.chain.wineserver(root, &env);
        command
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(true);

        match command.spawn() {
            Ok(child) => ServiceGuard { child: Some(child) },
            Err(e) => {
                tracing::warn!(error = %e, "failed to start wineserver");
                ServiceGuard { child: None }
            }
        }
    }

    async fn wait_for_service_socket(&self, root: &Path) -> bool {
        let dir = socket_dir(root);
        for _ in 0..self.policy.get_socket_poll_attempts() {
            if find_socket(&dir).await.is_some() {
                return true;
            }
            tokio::time::sleep(self.policy.socket_poll_delay()).await;
        }

        find_socket(&dir).await.is_some()
    }

    /// Waits for the registry hives after a clean exit.
    ///
    /// The service writes the hives after the bootstrap process has exited. If the
    /// compatibility layer ever writes them before exiting, the first check succeeds and the
    /// poll does nothing.
    async fn wait_for_hives(&self, root: &Path) -> bool {
        for _ in 0..self.policy.get_hive_poll_attempts() {
            if hives_present(root).await {
                return true;
            }
            tokio::time::sleep(self.policy.hive_poll_delay()).await;
        }

        hives_present(root).await
    }
}

impl ServiceGuard {
    async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            kill_child(&mut child).await;
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The directory the service creates its socket under: `<root>/tmp/.wine-<uid>`.
pub fn socket_dir(root: &Path) -> PathBuf {
    root.join(CONTAINER_TMP_SUBDIR)
        .join(format!(".wine-{}", getuid().as_raw()))
}

/// Finds `server-*/socket` under `dir`.
async fn find_socket(dir: &Path) -> Option<PathBuf> {
    let mut entries = fs::read_dir(dir).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if !entry.file_name().to_string_lossy().starts_with("server-") {
            continue;
        }

        let socket = entry.path().join("socket");
        if fs::try_exists(&socket).await.unwrap_or(false) {
            return Some(socket);
        }
    }

    None
}

/// Whether all registry hives exist, which marks a container as bootstrapped.
pub(crate) async fn hives_present(root: &Path) -> bool {
    for hive in REGISTRY_HIVES {
        if !fs::try_exists(root.join(hive)).await.unwrap_or(false) {
            return false;
        }
    }
    true
}

/// Removes hives a failed attempt may have left half written.
async fn remove_hives(root: &Path) {
    for hive in REGISTRY_HIVES {
        let path = root.join(hive);
        match fs::remove_file(&path).await {
            Ok(()) => tracing::debug!(hive = %path.display(), "removed partial registry hive"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(hive = %path.display(), error = %e, "failed to remove hive"),
        }
    }
}

async fn kill_child(child: &mut Child) {
    if let Some(pid) = child.id() {
        signal_group(pid, Signal::SIGKILL);
    }
    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "failed to kill child");
    }
}

fn exit_code(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::os::unix::process::ExitStatusExt;

    use super::*;

    #[test]
    fn test_exit_code_maps_signals() {
        assert_eq!(exit_code(ExitStatus::from_raw(1 << 8)), Some(1));
        assert_eq!(
            exit_code(ExitStatus::from_raw(Signal::SIGSEGV as i32)),
            Some(SANDBOX_CRASH_EXIT_CODE)
        );
    }

    #[tokio::test]
    async fn test_find_socket() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let dir = socket_dir(root.path());
        assert!(find_socket(&dir).await.is_none());

        std::fs::create_dir_all(dir.join("server-fd01-42"))?;
        assert!(find_socket(&dir).await.is_none());

        std::fs::write(dir.join("server-fd01-42/socket"), "")?;
        assert_eq!(
            find_socket(&dir).await,
            Some(dir.join("server-fd01-42/socket"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_hives() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        std::fs::write(root.path().join("system.reg"), "")?;
        std::fs::write(root.path().join("user.reg"), "")?;
        assert!(!hives_present(root.path()).await);

        std::fs::write(root.path().join("userdef.reg"), "")?;
        assert!(hives_present(root.path()).await);

        remove_hives(root.path()).await;
        assert!(!root.path().join("system.reg").exists());
        assert!(!hives_present(root.path()).await);
        Ok(())
    }
}
