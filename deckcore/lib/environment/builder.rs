use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use crate::{
    config::{ContainerConfig, GraphicsWrapper},
    environment::{attempt_tuning, is_interpreter_attempt, preset_tuning},
    utils::{GUEST_ROOTFS_PATH, GUEST_USER, GUEST_WINE_SUBDIR},
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Variables that custom overrides are never allowed to replace.
///
/// Changing the architecture after a container was created silently breaks 32-bit guest
/// binaries.
pub const PROTECTED_ENV_VARS: &[&str] = &["WINEARCH"];

/// The architecture every container is created with.
pub const WINE_ARCH: &str = "win64";

/// The sandbox tool's loader, shipped next to it.
pub const PROOT_LOADER_FILENAME: &str = "libproot-loader.so";

/// The sandbox tool's 32-bit loader, needed only without WoW64.
pub const PROOT_LOADER32_FILENAME: &str = "libproot-loader32.so";

/// The variable the compatibility layer searches for additional DLL directories.
pub const DLL_PATH_VAR: &str = "WINEDLLPATH";

/// Native host-architecture libraries inside the rootfs.
const NATIVE_LIB_DIRS: &[&str] = &["usr/lib/aarch64-linux-gnu", "usr/lib/arm-linux-gnueabihf"];

/// Guest-architecture libraries the translator emulates.
const EMULATED_LIB_DIRS: &[&str] = &["usr/lib/box64-x86_64-linux-gnu", "usr/lib/x86_64-linux-gnu"];

/// The compatibility layer's unix-side libraries.
const WINE_UNIX_LIB_DIR: &str = "lib/wine/x86_64-unix";

/// The compatibility layer's host-side libraries.
const WINE_LIB_DIR: &str = "lib";

/// Overrides keeping wineboot from prompting for mono and gecko installs.
const BOOTSTRAP_DLL_OVERRIDES: &str = "mscoree,mshtml=";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An environment variable map with a stable iteration order.
pub type EnvMap = BTreeMap<String, String>;

/// Which kind of process the environment is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvTier {
    /// A bootstrap attempt.
    Attempt {
        /// The attempt's index, starting at 0.
        index: u32,

        /// The index of the final attempt in the budget.
        last: u32,
    },

    /// A regular guest launch in a bootstrapped container.
    SteadyState,
}

/// Computes environments for sandboxed processes.
///
/// The builder holds the runtime-wide locations; everything container specific is passed to
/// [`EnvironmentBuilder::build`].
#[derive(Debug, Clone)]
pub struct EnvironmentBuilder {
    cache_dir: PathBuf,
    proot_dir: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl EnvironmentBuilder {
    /// Creates a builder for a runtime whose scratch space is `cache_dir` and whose sandbox tool
    /// is installed in `proot_dir`.
    pub fn new(cache_dir: impl Into<PathBuf>, proot_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            proot_dir: proot_dir.into(),
        }
    }

    /// Where the sandbox tool keeps its own temporary files.
    pub fn proot_tmp_dir(&self) -> PathBuf {
        self.cache_dir.join("proot-tmp")
    }

    /// Builds the environment for a process in the container at `container_root`.
    pub fn build(&self, container_root: &Path, tier: EnvTier, config: &ContainerConfig) -> EnvMap {
        let mut env = EnvMap::new();
        let root = container_root.display().to_string();
        let wine = format!("{GUEST_ROOTFS_PATH}/{GUEST_WINE_SUBDIR}");

        // Sandbox, home and temp.
        set(&mut env, "PROOT_TMP_DIR", self.proot_tmp_dir().display());
        set(
            &mut env,
            "PROOT_LOADER",
            self.proot_dir.join(PROOT_LOADER_FILENAME).display(),
        );
        if !config.get_wow64() {
            set(
                &mut env,
                "PROOT_LOADER_32",
                self.proot_dir.join(PROOT_LOADER32_FILENAME).display(),
            );
        }
        set(&mut env, "HOME", &root);
        set(&mut env, "WINEPREFIX", &root);
        set(&mut env, "USER", GUEST_USER);
        // The container's tmp directory is bound here by the sandbox.
        set(&mut env, "TMPDIR", "/tmp");
        set(&mut env, "LC_ALL", "en_US.utf8");
        set(&mut env, "DISPLAY", ":0");
        set(
            &mut env,
            "PATH",
            format!("{wine}/bin:/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"),
        );

        // Library search paths. Host-side lookups must still find the guest-architecture
        // libraries, so the emulated directories come before the native ones.
        let mut ld_paths = vec![format!("{wine}/{WINE_LIB_DIR}")];
        ld_paths.extend(EMULATED_LIB_DIRS.iter().map(|d| rootfs_path(d)));
        ld_paths.extend(NATIVE_LIB_DIRS.iter().map(|d| rootfs_path(d)));
        set(&mut env, "LD_LIBRARY_PATH", ld_paths.join(":"));

        let mut box64_paths = vec![format!("{wine}/{WINE_UNIX_LIB_DIR}")];
        box64_paths.extend(EMULATED_LIB_DIRS.iter().map(|d| rootfs_path(d)));
        set(&mut env, "BOX64_LD_LIBRARY_PATH", box64_paths.join(":"));

        // Translator.
        set(&mut env, "BOX64_NOBANNER", "1");
        set(&mut env, "BOX64_NORCFILES", "1");
        set(&mut env, "BOX64_AVX", "1");
        set(&mut env, "BOX64_X11GLX", "1");
        if config.get_wow64() {
            set(&mut env, "BOX64_MMAP32", "1");
        }

        let tuning = match tier {
            EnvTier::Attempt { index, last } => attempt_tuning(index, last),
            EnvTier::SteadyState => preset_tuning(config.get_performance_preset()),
        };
        for (name, value) in tuning {
            set(&mut env, name, value);
        }

        // Compatibility layer.
        set(&mut env, "WINEARCH", WINE_ARCH);
        set(
            &mut env,
            "WINEESYNC",
            if config.get_esync() { "1" } else { "0" },
        );
        let debug = match tier {
            EnvTier::Attempt { index, last } if is_interpreter_attempt(index, last) => {
                "warn+all,err+all,+loaddll"
            }
            _ => "-all",
        };
        set(&mut env, "WINEDEBUG", debug);

        let graphics = match config.get_graphics_wrapper() {
            GraphicsWrapper::Dxvk => "d3d8,d3d9,d3d10core,d3d11,dxgi=n,b",
            GraphicsWrapper::Wined3d => "d3d8,d3d9,d3d10core,d3d11,dxgi=b",
        };
        let overrides = match tier {
            EnvTier::Attempt { .. } => format!("{BOOTSTRAP_DLL_OVERRIDES};{graphics}"),
            EnvTier::SteadyState => graphics.to_string(),
        };
        set(&mut env, "WINEDLLOVERRIDES", overrides);

        // User overrides go last, and only for launches: bootstrap attempts must keep the
        // tuning they were selected for.
        if tier == EnvTier::SteadyState {
            merge_custom(&mut env, config.get_custom_env());
        }

        env
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Prepends `dir` to the DLL search path so DLLs shipped next to a guest executable win over
/// system ones.
pub fn prepend_dll_path(env: &mut EnvMap, dir: &Path) {
    let dir = dir.display().to_string();
    let value = match env.get(DLL_PATH_VAR) {
        Some(existing) if !existing.is_empty() => format!("{dir}:{existing}"),
        _ => dir,
    };
    env.insert(DLL_PATH_VAR.to_string(), value);
}

fn merge_custom(env: &mut EnvMap, custom: &BTreeMap<String, String>) {
    for (name, value) in custom {
        if PROTECTED_ENV_VARS.contains(&name.as_str()) {
            tracing::warn!(
                variable = %name,
                "ignoring custom override of a protected environment variable"
            );
            continue;
        }
        env.insert(name.clone(), value.clone());
    }
}

fn rootfs_path(relative: &str) -> String {
    format!("{GUEST_ROOTFS_PATH}/{relative}")
}

fn set(env: &mut EnvMap, name: &str, value: impl ToString) {
    env.insert(name.to_string(), value.to_string());
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
