use std::{path::PathBuf, sync::LazyLock};

use crate::utils::DECK_HOME_DIR;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The rootfs image version this build expects to find installed.
pub const DEFAULT_IMAGE_VERSION: u32 = 1;

/// The bundled binary translator version.
pub const DEFAULT_BOX64_VERSION: &str = "0.3.2";

/// The dynamic linker written into the translator's `PT_INTERP` segment.
pub const DEFAULT_INTERPRETER: &str = "/system/bin/linker64";

/// The asset holding the guest root filesystem.
pub const DEFAULT_ROOTFS_ASSET: &str = "rootfs.txz";

/// The asset holding the sandbox tool and its loaders.
pub const DEFAULT_PROOT_ASSET: &str = "proot.tzst";

/// Where the .NET compatibility runtime is fetched from.
pub const DEFAULT_MONO_URL: &str =
    "https://github.com/madewokherd/wine-mono/releases/download/wine-mono-9.3.0/wine-mono-9.3.0-x86.tar.xz";

/// The default guest screen width.
pub const DEFAULT_SCREEN_WIDTH: u32 = 1280;

/// The default guest screen height.
pub const DEFAULT_SCREEN_HEIGHT: u32 = 720;

/// The number of bootstrap attempts before a container is given up on.
pub const DEFAULT_BOOTSTRAP_ATTEMPTS: u32 = 3;

/// Timeout of the first bootstrap attempt.
pub const DEFAULT_FIRST_ATTEMPT_TIMEOUT_MS: u64 = 90_000;

/// Timeout of the later, more conservative bootstrap attempts.
pub const DEFAULT_RETRY_ATTEMPT_TIMEOUT_MS: u64 = 240_000;

/// How often the wineserver socket is looked for before bootstrap proceeds anyway.
pub const DEFAULT_SOCKET_POLL_ATTEMPTS: u32 = 20;

/// Delay between wineserver socket polls.
pub const DEFAULT_SOCKET_POLL_DELAY_MS: u64 = 250;

/// How often the registry hives are looked for after a clean bootstrap exit.
pub const DEFAULT_HIVE_POLL_ATTEMPTS: u32 = 20;

/// Delay between registry hive polls.
pub const DEFAULT_HIVE_POLL_DELAY_MS: u64 = 500;

/// Base of the exponential backoff between bootstrap attempts.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;

/// How long an output drain may outlive its process before it is cancelled.
pub const DEFAULT_DRAIN_GRACE_MS: u64 = 2_000;

/// Lines of bootstrap output kept for error reports.
pub const DEFAULT_OUTPUT_TAIL_LINES: usize = 40;

/// How long a graceful kill waits before escalating.
pub const DEFAULT_GRACEFUL_KILL_TIMEOUT_MS: u64 = 5_000;

/// Liveness poll interval while waiting for a graceful kill.
pub const DEFAULT_KILL_POLL_INTERVAL_MS: u64 = 100;

/// Guest output lines logged in full before only flagged lines are logged.
pub const DEFAULT_FULL_LOG_LINES: usize = 50;

/// Timeout for a single sandboxed registry tool invocation.
pub const DEFAULT_REGISTRY_TOOL_TIMEOUT_MS: u64 = 30_000;

/// The path where all deck data is stored when `DECK_HOME` is not set.
pub static DEFAULT_DECK_HOME: LazyLock<PathBuf> = LazyLock::new(|| {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(DECK_HOME_DIR)
});
