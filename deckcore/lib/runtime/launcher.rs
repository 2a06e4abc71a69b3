use std::{
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::Utc;
use deckutils::{ProcessLog, ProcessSampler};
use futures::Stream;
use nix::{
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use tokio::{fs, process::Child, time::Instant};

use crate::{
    config::LaunchPolicy,
    environment::{prepend_dll_path, EnvTier, EnvironmentBuilder},
    management::Container,
    utils::{CONTAINER_LOG_SUBDIR, DRIVE_C_SUBDIR},
    DeckcoreError, DeckcoreResult,
};

use super::{
    spawn_drain, DrainOptions, GuestLaunch, GuestProcess, OutputDrain, ProcessState,
    ProcessStatus, ProcessTable, SandboxChain,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Launches guest executables through a sandbox chain and tracks them until they are reaped.
///
/// Every launched process has an entry in a shared [`ProcessTable`] keyed by its id. The entry
/// is removed exactly once, either by [`ProcessLauncher::kill`] or when a
/// [`ProcessLauncher::monitor`] stream ends.
///
/// Cloning is cheap and clones share the same table.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    chain: Arc<dyn SandboxChain>,
    env: EnvironmentBuilder,
    policy: LaunchPolicy,
    sampler: ProcessSampler,
    table: Arc<ProcessTable<Arc<ProcessEntry>>>,
}

/// A live table entry.
#[derive(Debug)]
pub struct ProcessEntry {
    process: GuestProcess,
    child: tokio::sync::Mutex<Child>,
    drain: Mutex<Option<OutputDrain>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ProcessLauncher {
    /// Creates a launcher with an empty process table.
    pub fn new(
        chain: Arc<dyn SandboxChain>,
        env: EnvironmentBuilder,
        policy: LaunchPolicy,
        sampler: ProcessSampler,
    ) -> Self {
        Self {
            chain,
            env,
            policy,
            sampler,
            table: Arc::new(ProcessTable::new()),
        }
    }

    /// The ids of all tracked processes.
    pub fn process_ids(&self) -> Vec<String> {
        self.table.ids()
    }

    /// Whether a process id is tracked.
    pub fn is_tracked(&self, id: &str) -> bool {
        self.table.contains(id)
    }

    /// Starts `executable` inside `container`.
    ///
    /// ## Errors
    ///
    /// Returns [`DeckcoreError::BinaryMissing`] if the executable or any binary of the sandbox
    /// chain is absent and [`DeckcoreError::LaunchFailure`] if spawning fails. Nothing is spawned
    /// or recorded in either case.
    pub async fn launch(
        &self,
        container: &Container,
        executable: impl AsRef<Path>,
        args: &[String],
    ) -> DeckcoreResult<GuestProcess> {
        let executable = executable.as_ref();
        if !is_file(executable).await {
            return Err(DeckcoreError::BinaryMissing(executable.to_path_buf()));
        }

        for binary in self.chain.required_binaries() {
            if !is_file(&binary).await {
                return Err(DeckcoreError::BinaryMissing(binary));
            }
        }

        let root = container.get_root_path();
        let config = container.get_config();
        let working_dir = working_dir(executable, root).await;

        let mut env = self.env.build(root, EnvTier::SteadyState, config);
        if let Some(dir) = executable.parent() {
            prepend_dll_path(&mut env, dir);
        }

        let mut all_args = args.to_vec();
        all_args.extend(config.get_custom_args().iter().cloned());

        let mut command = self.chain.guest(
            root,
            &env,
            GuestLaunch {
                executable,
                args: &all_args,
                working_dir: &working_dir,
                resolution: config.get_screen_resolution(),
            },
        );
        command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        tracing::debug!(command = ?command.as_std(), "spawning guest process");

        let mut child = command
            .spawn()
            .map_err(|e| DeckcoreError::launch(executable, e.to_string()))?;

        let Some(pid) = child.id() else {
            return Err(DeckcoreError::launch(
                executable,
                "process exited before its pid could be read",
            ));
        };

        let started_at = Utc::now();
        let id = format!("{}-{pid}", started_at.timestamp_millis());
        let log = match ProcessLog::create(root.join(CONTAINER_LOG_SUBDIR), &log_name(executable))
            .await
        {
            Ok(log) => Some(log),
            Err(e) => {
                tracing::warn!(process_id = %id, error = %e, "failed to open process log");
                None
            }
        };

        let drain = spawn_drain(
            child.stdout.take(),
            child.stderr.take(),
            DrainOptions {
                label: id.clone(),
                full_log_lines: self.policy.get_full_log_lines(),
                tail_lines: 0,
                log,
            },
        );

        let process = GuestProcess {
            id: id.clone(),
            container_id: container.get_id().clone(),
            executable_path: executable.to_path_buf(),
            started_at,
            native_pid: pid,
        };

        self.table.insert(
            id.clone(),
            Arc::new(ProcessEntry {
                process: process.clone(),
                child: tokio::sync::Mutex::new(child),
                drain: Mutex::new(Some(drain)),
            }),
        );

        tracing::info!(
            process_id = %id,
            container_id = %container.get_id(),
            pid,
            executable = %executable.display(),
            "guest process launched"
        );

        Ok(process)
    }

    /// The descriptor of a tracked process.
    pub fn get_process(&self, id: &str) -> DeckcoreResult<GuestProcess> {
        self.table
            .get(id)
            .map(|entry| entry.process.clone())
            .ok_or_else(|| DeckcoreError::process_not_found(id))
    }

    /// Reports liveness, exit information and a resource sample for a tracked process.
    pub async fn get_status(&self, id: &str) -> DeckcoreResult<ProcessStatus> {
        self.sample_status(id, &mut None).await
    }

    /// Reports the status of a process every `interval` until it stops running.
    ///
    /// The stream ends after the first non-running status or the first error. The table entry
    /// is removed when the stream ends or is dropped, whichever comes first, even if it was
    /// never polled.
    ///
    /// Unlike [`ProcessLauncher::get_status`], which has a single sample and reports 0% CPU,
    /// every status after the first carries the CPU usage since the previous one.
    pub fn monitor(
        &self,
        id: &str,
        interval: Duration,
    ) -> impl Stream<Item = DeckcoreResult<ProcessStatus>> + Send + 'static {
        let launcher = self.clone();
        let id = id.to_string();
        let cleanup = scopeguard::guard(
            (Arc::clone(&self.table), id.clone()),
            |(table, id)| {
                if table.remove(&id).is_some() {
                    tracing::debug!(process_id = %id, "process removed from table");
                }
            },
        );

        async_stream::stream! {
            let _cleanup = cleanup;
            let mut previous = None;

            loop {
                match launcher.sample_status(&id, &mut previous).await {
                    Ok(status) => {
                        let running = status.is_running();
                        yield Ok(status);

                        if !running {
                            if let Some(entry) = launcher.table.get(&id) {
                                entry.finish_drain(launcher.policy.drain_grace()).await;
                            }
                            break;
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }

                tokio::time::sleep(interval).await;
            }
        }
    }

    /// Terminates a tracked process and removes it from the table.
    ///
    /// A graceful kill sends `SIGTERM` to the process group and escalates to `SIGKILL` if the
    /// process is still alive after the configured window. Either way the call returns only
    /// once the process has been reaped.
    pub async fn kill(&self, id: &str, force: bool) -> DeckcoreResult<ProcessState> {
        let entry = self.entry(id)?;
        let pid = entry.process.native_pid;
        let mut forced = force;

        if entry.try_wait().await?.is_none() {
            if force {
                entry.hard_kill().await;
            } else {
                signal_group(pid, Signal::SIGTERM);
                if !self.wait_for_exit(&entry).await? {
                    tracing::warn!(
                        process_id = %id,
                        pid,
                        timeout = ?self.policy.graceful_kill_timeout(),
                        "process ignored SIGTERM, escalating to SIGKILL"
                    );
                    entry.hard_kill().await;
                    forced = true;
                }
            }
        }

        let status = entry.child.lock().await.wait().await?;

        if self.table.remove(id).is_some() {
            tracing::debug!(process_id = %id, "process removed from table");
        }
        entry.finish_drain(self.policy.drain_grace()).await;

        let state = exit_state(status, forced);
        tracing::info!(process_id = %id, pid, %state, "guest process terminated");

        Ok(state)
    }

    /// Stops a running process group with `SIGSTOP`.
    pub fn suspend(&self, id: &str) -> DeckcoreResult<()> {
        let entry = self.entry(id)?;
        signal_group(entry.process.native_pid, Signal::SIGSTOP);
        tracing::info!(process_id = %id, "guest process suspended");
        Ok(())
    }

    /// Continues a process group stopped by [`ProcessLauncher::suspend`].
    pub fn resume(&self, id: &str) -> DeckcoreResult<()> {
        let entry = self.entry(id)?;
        signal_group(entry.process.native_pid, Signal::SIGCONT);
        tracing::info!(process_id = %id, "guest process resumed");
        Ok(())
    }

    fn entry(&self, id: &str) -> DeckcoreResult<Arc<ProcessEntry>> {
        self.table
            .get(id)
            .ok_or_else(|| DeckcoreError::process_not_found(id))
    }

    /// Builds a status, diffing CPU ticks against `previous` and replacing it with this sample.
    async fn sample_status(
        &self,
        id: &str,
        previous: &mut Option<(u64, Instant)>,
    ) -> DeckcoreResult<ProcessStatus> {
        let entry = self.entry(id)?;
        let state = match entry.try_wait().await? {
            Some(status) => exit_state(status, false),
            None => ProcessState::Running,
        };

        let mut cpu_percent = 0.0;
        let mut memory_kb = 0;
        if state.is_running() {
            if let Some(metrics) = self.sampler.sample(entry.process.native_pid).await {
                let now = Instant::now();
                if let Some((ticks, at)) = *previous {
                    cpu_percent = self
                        .sampler
                        .cpu_percent(metrics.cpu_ticks.saturating_sub(ticks), now - at);
                }
                *previous = Some((metrics.cpu_ticks, now));
                memory_kb = metrics.rss_kb;
            }
        }

        Ok(ProcessStatus {
            id: id.to_string(),
            state,
            cpu_percent,
            memory_kb,
        })
    }

    /// Polls until the process exits or the graceful window elapses.
    async fn wait_for_exit(&self, entry: &ProcessEntry) -> DeckcoreResult<bool> {
        let deadline = Instant::now() + self.policy.graceful_kill_timeout();

        loop {
            if entry.try_wait().await?.is_some() {
                return Ok(true);
            }

            if Instant::now() >= deadline {
                return Ok(false);
            }

            tokio::time::sleep(self.policy.kill_poll_interval()).await;
        }
    }
}

impl ProcessEntry {
    /// The descriptor of this process.
    pub fn process(&self) -> &GuestProcess {
        &self.process
    }

    async fn try_wait(&self) -> DeckcoreResult<Option<ExitStatus>> {
        Ok(self.child.lock().await.try_wait()?)
    }

    async fn hard_kill(&self) {
        signal_group(self.process.native_pid, Signal::SIGKILL);
        if let Err(e) = self.child.lock().await.start_kill() {
            tracing::debug!(pid = self.process.native_pid, error = %e, "start_kill failed");
        }
    }

    async fn finish_drain(&self, grace: Duration) {
        let drain = self
            .drain
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(drain) = drain {
            let summary = drain.finish(grace).await;
            tracing::debug!(
                process_id = %self.process.id,
                lines = summary.lines,
                "output drain finished"
            );
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Sends `signal` to the process group led by `pid`.
///
/// Failures are logged only; the group is usually gone already.
pub(crate) fn signal_group(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };

    if let Err(e) = killpg(Pid::from_raw(raw), signal) {
        tracing::debug!(pid, %signal, error = %e, "failed to signal process group");
    }
}

fn exit_state(status: ExitStatus, forced: bool) -> ProcessState {
    match (status.code(), status.signal()) {
        (Some(code), _) => ProcessState::Exited { code },
        (None, Some(signal)) => ProcessState::Killed {
            signal,
            forced: forced || signal == Signal::SIGKILL as i32,
        },
        (None, None) => ProcessState::Exited { code: -1 },
    }
}

async fn is_file(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

/// The executable's directory when it can be read, else the container's `drive_c`.
async fn working_dir(executable: &Path, container_root: &Path) -> PathBuf {
    match executable.parent() {
        Some(dir) if fs::read_dir(dir).await.is_ok() => dir.to_path_buf(),
        _ => container_root.join(DRIVE_C_SUBDIR),
    }
}

fn log_name(executable: &Path) -> String {
    executable
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("guest")
        .to_string()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_state() {
        assert_eq!(
            exit_state(ExitStatus::from_raw(3 << 8), false),
            ProcessState::Exited { code: 3 }
        );
        assert_eq!(
            exit_state(ExitStatus::from_raw(Signal::SIGTERM as i32), false),
            ProcessState::Killed {
                signal: Signal::SIGTERM as i32,
                forced: false
            }
        );
        assert_eq!(
            exit_state(ExitStatus::from_raw(Signal::SIGKILL as i32), false),
            ProcessState::Killed {
                signal: Signal::SIGKILL as i32,
                forced: true
            }
        );
    }

    #[test]
    fn test_log_name() {
        assert_eq!(log_name(Path::new("/games/Quake/quake.exe")), "quake");
        assert_eq!(log_name(Path::new("/")), "guest");
    }

    #[tokio::test]
    async fn test_working_dir_falls_back_to_drive_c() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("game.exe");
        assert_eq!(working_dir(&exe, Path::new("/c")).await, dir.path());

        let missing = Path::new("/definitely/not/here/game.exe");
        assert_eq!(
            working_dir(missing, Path::new("/c")).await,
            Path::new("/c/drive_c")
        );
    }
}
