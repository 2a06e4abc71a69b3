use std::{
    fmt::Debug,
    path::{Path, PathBuf},
    process::Stdio,
};

use tokio::process::Command;

use crate::{
    config::ScreenResolution,
    environment::EnvMap,
    utils::{CONTAINER_TMP_SUBDIR, GUEST_ROOTFS_PATH, GUEST_WINE_SUBDIR},
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A registry value written through the compatibility layer's registry tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryValue {
    /// A `REG_SZ` string.
    String(String),

    /// A `REG_DWORD`.
    Dword(u32),
}

/// A guest program to start inside a container.
#[derive(Debug, Clone, Copy)]
pub struct GuestLaunch<'a> {
    /// The executable on the host filesystem.
    pub executable: &'a Path,

    /// Arguments passed to the executable.
    pub args: &'a [String],

    /// The working directory of the sandboxed process.
    pub working_dir: &'a Path,

    /// The size of the virtual desktop the program is shown in.
    pub resolution: ScreenResolution,
}

/// Builds the commands that run programs through the sandbox, translator and compatibility
/// layer.
///
/// Implementations return commands with the given environment applied (and nothing else
/// inherited) and stdin detached; the caller decides what happens to stdout and stderr.
pub trait SandboxChain: Send + Sync + Debug {
    /// Executables that must exist before any command can run.
    fn required_binaries(&self) -> Vec<PathBuf>;

    /// The compatibility layer's background service for a container.
    fn wineserver(&self, container_root: &Path, env: &EnvMap) -> Command;

    /// The first-run initialization of a container.
    fn wineboot(&self, container_root: &Path, env: &EnvMap) -> Command;

    /// A single registry write through the compatibility layer's registry tool.
    fn registry_add(
        &self,
        container_root: &Path,
        env: &EnvMap,
        key: &str,
        name: &str,
        value: &RegistryValue,
    ) -> Command;

    /// A guest program in a bootstrapped container.
    fn guest(&self, container_root: &Path, env: &EnvMap, launch: GuestLaunch<'_>) -> Command;
}

/// The production chain: `proot` hosting `box64` hosting the compatibility layer.
#[derive(Debug, Clone)]
pub struct ProotChain {
    proot: PathBuf,
    box64: PathBuf,
    rootfs: PathBuf,
    shm_dir: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ProotChain {
    /// Creates a chain from the installed sandbox tool, translator and rootfs.
    ///
    /// `shm_dir` is bound onto `/dev/shm` when esync is enabled.
    pub fn new(
        proot: impl Into<PathBuf>,
        box64: impl Into<PathBuf>,
        rootfs: impl Into<PathBuf>,
        shm_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            proot: proot.into(),
            box64: box64.into(),
            rootfs: rootfs.into(),
            shm_dir: shm_dir.into(),
        }
    }

    /// Path of a compatibility-layer program as seen inside the sandbox.
    fn guest_wine_binary(name: &str) -> String {
        format!("{GUEST_ROOTFS_PATH}/{GUEST_WINE_SUBDIR}/bin/{name}")
    }

    /// The sandbox invocation up to and including the translator.
    fn sandboxed(&self, container_root: &Path, env: &EnvMap, working_dir: &Path) -> Command {
        let mut command = base_command(&self.proot, env);

        // The compatibility-layer binaries look for the rootfs at a fixed path, so the real
        // one is bound there.
        command
            .arg("--kill-on-exit")
            .arg("-b")
            .arg(format!("{}:{GUEST_ROOTFS_PATH}", self.rootfs.display()))
            .arg("-b")
            .arg(format!(
                "{}:/tmp",
                container_root.join(CONTAINER_TMP_SUBDIR).display()
            ))
            .arg("--bind=/dev");

        if env.get("WINEESYNC").map(String::as_str) == Some("1") {
            command.arg(format!("--bind={}:/dev/shm", self.shm_dir.display()));
        }

        command
            .arg("--bind=/proc")
            .arg("--bind=/sys")
            .arg("--bind=/system")
            .arg("-w")
            .arg(working_dir)
            .arg(&self.box64);

        command
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// A command for `program` running with exactly `env`.
pub fn base_command(program: impl AsRef<Path>, env: &EnvMap) -> Command {
    let mut command = Command::new(program.as_ref());
    command.env_clear().envs(env).stdin(Stdio::null());
    command
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl SandboxChain for ProotChain {
    fn required_binaries(&self) -> Vec<PathBuf> {
        vec![
            self.proot.clone(),
            self.box64.clone(),
            self.rootfs.join(GUEST_WINE_SUBDIR).join("bin").join("wine64"),
            self.rootfs
                .join(GUEST_WINE_SUBDIR)
                .join("bin")
                .join("wineserver"),
        ]
    }

    fn wineserver(&self, container_root: &Path, env: &EnvMap) -> Command {
        let mut command = self.sandboxed(container_root, env, container_root);
        command
            .arg(Self::guest_wine_binary("wineserver"))
            .arg("--foreground")
            .arg("--persistent");
        command
    }

    fn wineboot(&self, container_root: &Path, env: &EnvMap) -> Command {
        let mut command = self.sandboxed(container_root, env, container_root);
        command
            .arg(Self::guest_wine_binary("wine64"))
            .arg("wineboot")
            .arg("--init");
        command
    }

    fn registry_add(
        &self,
        container_root: &Path,
        env: &EnvMap,
        key: &str,
        name: &str,
        value: &RegistryValue,
    ) -> Command {
        let (kind, data) = match value {
            RegistryValue::String(s) => ("REG_SZ", s.clone()),
            RegistryValue::Dword(d) => ("REG_DWORD", d.to_string()),
        };

        let mut command = self.sandboxed(container_root, env, container_root);
        command
            .arg(Self::guest_wine_binary("wine64"))
            .args(["reg", "add", key, "/v", name, "/t", kind, "/d"])
            .arg(data)
            .arg("/f");
        command
    }

    fn guest(&self, container_root: &Path, env: &EnvMap, launch: GuestLaunch<'_>) -> Command {
        let mut command = self.sandboxed(container_root, env, launch.working_dir);
        command
            .arg(Self::guest_wine_binary("wine64"))
            .arg("explorer")
            .arg(format!("/desktop=shell,{}", launch.resolution))
            .arg(launch.executable)
            .args(launch.args);
        command
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn args(command: &Command) -> Vec<String> {
        command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    fn chain() -> ProotChain {
        ProotChain::new(
            "/deck/proot/proot",
            "/deck/box64/box64",
            "/deck/rootfs",
            "/deck/cache/shm",
        )
    }

    #[test]
    fn test_guest_command_binds_rootfs_at_fixed_path() {
        let env = EnvMap::new();
        let root = Path::new("/deck/containers/default_shared_container");
        let launch = GuestLaunch {
            executable: Path::new("/games/quake/quake.exe"),
            args: &["-fullscreen".to_string()],
            working_dir: Path::new("/games/quake"),
            resolution: ScreenResolution::new(1280, 720),
        };

        let command = chain().guest(root, &env, launch);
        let args = args(&command);

        assert_eq!(
            command.as_std().get_program().to_string_lossy(),
            "/deck/proot/proot"
        );
        assert!(args.contains(&format!("/deck/rootfs:{GUEST_ROOTFS_PATH}")));
        assert!(args.contains(&"/deck/containers/default_shared_container/tmp:/tmp".to_string()));
        assert!(!args.iter().any(|a| a.ends_with(":/dev/shm")));

        let tail: Vec<&str> = args.iter().rev().take(5).rev().map(String::as_str).collect();
        assert_eq!(
            tail,
            [
                format!("{GUEST_ROOTFS_PATH}/opt/wine/bin/wine64").as_str(),
                "explorer",
                "/desktop=shell,1280x720",
                "/games/quake/quake.exe",
                "-fullscreen",
            ]
        );
    }

    #[test]
    fn test_esync_binds_shared_memory() {
        let mut env = EnvMap::new();
        env.insert("WINEESYNC".to_string(), "1".to_string());

        let command = chain().wineboot(Path::new("/c"), &env);
        assert!(args(&command).contains(&"--bind=/deck/cache/shm:/dev/shm".to_string()));
    }

    #[test]
    fn test_registry_add_command() {
        let command = chain().registry_add(
            Path::new("/c"),
            &EnvMap::new(),
            "HKLM\\Software\\Microsoft\\Windows NT\\CurrentVersion",
            "CurrentMajorVersionNumber",
            &RegistryValue::Dword(10),
        );
        let args = args(&command);

        assert!(args.ends_with(&[
            "/v".to_string(),
            "CurrentMajorVersionNumber".to_string(),
            "/t".to_string(),
            "REG_DWORD".to_string(),
            "/d".to_string(),
            "10".to_string(),
            "/f".to_string(),
        ]));
    }
}
