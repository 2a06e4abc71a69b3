#![allow(dead_code)]

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use deckcore::{
    config::{BootstrapPolicy, ContainerConfig, LaunchPolicy},
    environment::EnvMap,
    management::{
        socket_dir, Bootstrapper, ContainerManager, HttpDownloadClient, PostBootstrap,
        RuntimeLayout,
    },
    runtime::{base_command, GuestLaunch, RegistryValue, SandboxChain},
};
use tokio::process::Command;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Writes the three registry hives, like a successful first-run initialization.
pub const WINEBOOT_OK: &str =
    r#"echo "fixme:ntdll:stub"; touch "$WINEPREFIX/system.reg" "$WINEPREFIX/user.reg" "$WINEPREFIX/userdef.reg""#;

/// Hangs on the first attempt and succeeds on every later one.
pub const WINEBOOT_HANG_ONCE: &str = r#"n=$(cat "$WINEPREFIX/attempts" 2>/dev/null || echo 0)
echo $((n + 1)) > "$WINEPREFIX/attempts"
if [ "$n" = 0 ]; then exec sleep 30; fi
touch "$WINEPREFIX/system.reg" "$WINEPREFIX/user.reg" "$WINEPREFIX/userdef.reg""#;

/// Exits cleanly on the first attempt after writing only one hive and a kernel32 error.
///
/// Later attempts record whether that hive survived and which block-compilation setting they
/// ran with, then write all hives.
pub const WINEBOOT_NO_HIVES_ONCE: &str = r#"n=$(cat "$WINEPREFIX/attempts" 2>/dev/null || echo 0)
echo $((n + 1)) > "$WINEPREFIX/attempts"
if [ "$n" = 0 ]; then
  echo "err:module:load_builtin could not load kernel32.dll"
  touch "$WINEPREFIX/system.reg"
  exit 0
fi
if [ -e "$WINEPREFIX/system.reg" ]; then touch "$WINEPREFIX/stale"; fi
echo "$BOX64_DYNAREC" > "$WINEPREFIX/dynarec"
touch "$WINEPREFIX/system.reg" "$WINEPREFIX/user.reg" "$WINEPREFIX/userdef.reg""#;

/// Fails every attempt with a message on stderr.
pub const WINEBOOT_FAIL: &str = r#"echo "err:module:load_builtin could not load kernel32.dll" >&2; exit 3"#;

/// A guest that runs until it is signalled.
pub const GUEST_SLEEP: &str = "exec sleep 30";

/// A guest that ignores `SIGTERM` and marks when the trap is in place.
pub const GUEST_IGNORE_TERM: &str =
    r#"trap '' TERM; touch "$WINEPREFIX/ready"; while :; do sleep 0.1; done"#;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A sandbox chain that runs shell scripts on the host instead of the real program chain.
#[derive(Debug, Clone)]
pub struct ScriptChain {
    wineboot: String,
    guest: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ScriptChain {
    pub fn new(wineboot: &str, guest: &str) -> Self {
        Self {
            wineboot: wineboot.to_string(),
            guest: guest.to_string(),
        }
    }

    fn script(env: &EnvMap, script: impl AsRef<str>) -> Command {
        let mut command = base_command("/bin/sh", env);
        command.arg("-c").arg(script.as_ref());
        command
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl SandboxChain for ScriptChain {
    fn required_binaries(&self) -> Vec<PathBuf> {
        vec![PathBuf::from("/bin/sh")]
    }

    fn wineserver(&self, container_root: &Path, env: &EnvMap) -> Command {
        let dir = socket_dir(container_root).join("server-test");
        Self::script(
            env,
            format!(
                "mkdir -p '{0}' && touch '{0}/socket' && exec sleep 60",
                dir.display()
            ),
        )
    }

    fn wineboot(&self, _container_root: &Path, env: &EnvMap) -> Command {
        Self::script(env, &self.wineboot)
    }

    fn registry_add(
        &self,
        _container_root: &Path,
        env: &EnvMap,
        _key: &str,
        _name: &str,
        _value: &RegistryValue,
    ) -> Command {
        Self::script(env, "exit 0")
    }

    fn guest(&self, _container_root: &Path, env: &EnvMap, _launch: GuestLaunch<'_>) -> Command {
        Self::script(env, &self.guest)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

pub fn fast_bootstrap_policy() -> BootstrapPolicy {
    fast_bootstrap_policy_with_attempts(3)
}

pub fn fast_bootstrap_policy_with_attempts(attempts: u32) -> BootstrapPolicy {
    BootstrapPolicy::builder()
        .attempts(attempts)
        .first_attempt_timeout_ms(500)
        .retry_attempt_timeout_ms(10_000)
        .socket_poll_attempts(40)
        .socket_poll_delay_ms(50)
        .hive_poll_attempts(5)
        .hive_poll_delay_ms(50)
        .backoff_base_ms(10)
        .drain_grace_ms(500)
        .registry_tool_timeout_ms(5_000)
        .build()
}

pub fn fast_launch_policy() -> LaunchPolicy {
    LaunchPolicy::builder()
        .graceful_kill_timeout_ms(500)
        .kill_poll_interval_ms(20)
        .drain_grace_ms(500)
        .build()
}

pub fn bootstrapper(chain: Arc<ScriptChain>, home: &Path) -> Bootstrapper {
    bootstrapper_with_policy(chain, home, fast_bootstrap_policy())
}

pub fn bootstrapper_with_policy(
    chain: Arc<ScriptChain>,
    home: &Path,
    policy: BootstrapPolicy,
) -> Bootstrapper {
    let layout = RuntimeLayout::new(home);
    Bootstrapper::new(chain, layout.environment_builder(), policy)
}

pub fn container_manager(chain: Arc<ScriptChain>, home: &Path) -> ContainerManager {
    let layout = RuntimeLayout::new(home);
    let env = layout.environment_builder();
    let bootstrapper = Bootstrapper::new(chain.clone(), env.clone(), fast_bootstrap_policy());
    let post_bootstrap = PostBootstrap::new(
        layout.rootfs_dir(),
        layout.cache_dir(),
        chain.clone(),
        env,
        Duration::from_secs(5),
        None,
        Arc::new(HttpDownloadClient::new()),
    );

    ContainerManager::new(
        layout,
        chain,
        bootstrapper,
        post_bootstrap,
        ContainerConfig::default(),
    )
}

/// Waits up to two seconds for `path` to appear.
pub async fn wait_for_file(path: &Path) -> bool {
    for _ in 0..100 {
        if path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
