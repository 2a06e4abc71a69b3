//! Best-effort steps run after a container bootstraps.
//!
//! None of these is needed for the compatibility layer to start, but each fixes a class of
//! guest programs. A step never fails container creation; it reports a [`StepOutcome`] that is
//! logged by the caller.

use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use deckutils::extract_file;
use tokio::fs;

use crate::{
    config::ContainerConfig,
    environment::{EnvTier, EnvironmentBuilder},
    runtime::{RegistryValue, SandboxChain},
    utils::{DRIVE_C_SUBDIR, GUEST_WINE_SUBDIR},
    DeckcoreError, DeckcoreResult,
};

use super::{
    download_to_file, windows10_values, DownloadClient, RegistryHive, MACHINE_HIVE,
    WINDOWS_VERSION_KEY,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Guest directories whose permissions are reset, relative to `drive_c`.
pub const REPAIRED_DIRS: [&str; 4] = [
    "windows/system32",
    "windows/syswow64",
    "windows/temp",
    "users/xuser/Temp",
];

/// 32-bit runtime libraries copied into `syswow64`.
pub const SUPPORT_LIBRARIES: [&str; 4] = [
    "vcruntime140.dll",
    "msvcp140.dll",
    "ucrtbase.dll",
    "d3dcompiler_47.dll",
];

/// Where the 32-bit libraries are taken from, relative to the rootfs.
const SUPPORT_LIBRARY_SOURCE: &str = "opt/wine/lib/wine/i386-windows";

/// Where the .NET compatibility runtime is unpacked, relative to `drive_c`.
const MONO_DIR: &str = "windows/mono";

const DIR_MODE: u32 = 0o755;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of one best-effort step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step changed something.
    Done,

    /// Nothing needed doing.
    Skipped(String),

    /// The step failed; the container is still usable.
    Failed(String),
}

/// Runs the post-bootstrap steps for new containers.
pub struct PostBootstrap {
    rootfs_dir: PathBuf,
    cache_dir: PathBuf,
    chain: Arc<dyn SandboxChain>,
    env: EnvironmentBuilder,
    registry_tool_timeout: Duration,
    mono_url: Option<String>,
    downloader: Arc<dyn DownloadClient>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PostBootstrap {
    /// Creates the step runner.
    ///
    /// `mono_url` of `None` turns the .NET runtime install into a skipped step.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rootfs_dir: impl Into<PathBuf>,
        cache_dir: impl Into<PathBuf>,
        chain: Arc<dyn SandboxChain>,
        env: EnvironmentBuilder,
        registry_tool_timeout: Duration,
        mono_url: Option<String>,
        downloader: Arc<dyn DownloadClient>,
    ) -> Self {
        Self {
            rootfs_dir: rootfs_dir.into(),
            cache_dir: cache_dir.into(),
            chain,
            env,
            registry_tool_timeout,
            mono_url,
            downloader,
        }
    }

    /// Runs every step in order and returns each outcome by step name.
    pub async fn run_all(
        &self,
        container_id: &str,
        root: &Path,
        config: &ContainerConfig,
    ) -> Vec<(&'static str, StepOutcome)> {
        let outcomes = vec![
            ("link_wine_binary", self.link_wine_binary().await),
            ("repair_permissions", self.repair_permissions(root).await),
            ("copy_support_libraries", self.copy_support_libraries(root).await),
            ("set_windows_version", self.set_windows_version(root, config).await),
            ("install_mono", self.install_mono(root).await),
        ];

        for (step, outcome) in &outcomes {
            match outcome {
                StepOutcome::Done => tracing::info!(%container_id, step, "post-bootstrap step done"),
                StepOutcome::Skipped(reason) => {
                    tracing::debug!(%container_id, step, %reason, "post-bootstrap step skipped")
                }
                StepOutcome::Failed(reason) => {
                    tracing::warn!(%container_id, step, %reason, "post-bootstrap step failed")
                }
            }
        }

        outcomes
    }

    /// Links `wine` to `wine64` in the compatibility layer for tools that call the former.
    pub async fn link_wine_binary(&self) -> StepOutcome {
        let bin = self.rootfs_dir.join(GUEST_WINE_SUBDIR).join("bin");
        let link = bin.join("wine");

        if fs::symlink_metadata(&link).await.is_ok() {
            return StepOutcome::Skipped("wine already exists".to_string());
        }

        if !fs::try_exists(bin.join("wine64")).await.unwrap_or(false) {
            return StepOutcome::Skipped("wine64 is not installed".to_string());
        }

        outcome(fs::symlink("wine64", &link).await.map_err(Into::into))
    }

    /// Creates guest system directories the minimal bootstrap leaves out and makes them
    /// writable.
    pub async fn repair_permissions(&self, root: &Path) -> StepOutcome {
        let drive_c = root.join(DRIVE_C_SUBDIR);
        outcome(
            async {
                for dir in REPAIRED_DIRS {
                    let dir = drive_c.join(dir);
                    fs::create_dir_all(&dir).await?;
                    fs::set_permissions(&dir, std::fs::Permissions::from_mode(DIR_MODE)).await?;
                }
                crate::Ok(())
            }
            .await,
        )
    }

    /// Copies [`SUPPORT_LIBRARIES`] into `syswow64`, keeping files that are already there.
    pub async fn copy_support_libraries(&self, root: &Path) -> StepOutcome {
        let source = self.rootfs_dir.join(SUPPORT_LIBRARY_SOURCE);
        let target = root.join(DRIVE_C_SUBDIR).join("windows/syswow64");

        if let Err(e) = fs::create_dir_all(&target).await {
            return StepOutcome::Failed(e.to_string());
        }

        let mut copied = 0;
        let mut missing = Vec::new();
        for library in SUPPORT_LIBRARIES {
            let dest = target.join(library);
            if fs::try_exists(&dest).await.unwrap_or(false) {
                continue;
            }

            match fs::copy(source.join(library), &dest).await {
                Ok(_) => copied += 1,
                Err(e) => {
                    tracing::debug!(library, error = %e, "support library not copied");
                    missing.push(library);
                }
            }
        }

        match (copied, missing.is_empty()) {
            (_, false) => StepOutcome::Failed(format!("could not copy {}", missing.join(", "))),
            (0, true) => StepOutcome::Skipped("all libraries present".to_string()),
            _ => StepOutcome::Done,
        }
    }

    /// Makes the guest report Windows 10.
    ///
    /// The machine hive is edited directly. Only when it lacks the version key does this fall
    /// back to the compatibility layer's registry tool, which is slow and has been seen to
    /// crash inside the sandbox.
    pub async fn set_windows_version(&self, root: &Path, config: &ContainerConfig) -> StepOutcome {
        let hive_path = root.join(MACHINE_HIVE);
        match RegistryHive::load(&hive_path).await {
            Ok(mut hive) if hive.has_key(WINDOWS_VERSION_KEY) => {
                hive.set_values(WINDOWS_VERSION_KEY, &windows10_values());
                return outcome(hive.save().await);
            }
            Ok(_) => tracing::info!("version key missing from hive, using the registry tool"),
            Err(e) => tracing::info!(error = %e, "hive unreadable, using the registry tool"),
        }

        let env = self.env.build(root, EnvTier::SteadyState, config);
        let key = format!(r"HKLM\{WINDOWS_VERSION_KEY}");
        for (name, value) in windows10_values() {
            if let Err(reason) = self.registry_add(root, &env, &key, name, &value).await {
                return StepOutcome::Failed(format!("{name}: {reason}"));
            }
        }

        StepOutcome::Done
    }

    /// Downloads and unpacks the .NET compatibility runtime into the guest.
    pub async fn install_mono(&self, root: &Path) -> StepOutcome {
        let Some(url) = self.mono_url.as_deref() else {
            return StepOutcome::Skipped("no download url configured".to_string());
        };

        let target = root.join(DRIVE_C_SUBDIR).join(MONO_DIR);
        if has_entries(&target).await {
            return StepOutcome::Skipped("already installed".to_string());
        }

        let file_name = url.rsplit('/').next().unwrap_or("wine-mono.tar.xz");
        let archive = self.cache_dir.join(file_name);

        outcome(
            async {
                if !fs::try_exists(&archive).await? {
                    download_to_file(self.downloader.as_ref(), url, &archive).await?;
                }
                extract_file(&archive, &target, |_| {}).await?;
                crate::Ok(())
            }
            .await,
        )
    }

    async fn registry_add(
        &self,
        root: &Path,
        env: &crate::environment::EnvMap,
        key: &str,
        name: &str,
        value: &RegistryValue,
    ) -> DeckcoreResult<()> {
        let mut command = self.chain.registry_add(root, env, key, name, value);
        command
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| DeckcoreError::launch("reg", e.to_string()))?;
        match tokio::time::timeout(self.registry_tool_timeout, child.wait()).await {
            Ok(status) => {
                let status = status?;
                if status.success() {
                    Ok(())
                } else {
                    Err(DeckcoreError::custom(anyhow::anyhow!(
                        "registry tool exited with {status}"
                    )))
                }
            }
            Err(_) => {
                let _ = child.kill().await;
                Err(DeckcoreError::Timeout {
                    operation: "registry tool".to_string(),
                    after: self.registry_tool_timeout,
                })
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn outcome(result: DeckcoreResult<()>) -> StepOutcome {
    match result {
        Ok(()) => StepOutcome::Done,
        Err(e) => StepOutcome::Failed(e.to_string()),
    }
}

async fn has_entries(dir: &Path) -> bool {
    match fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl std::fmt::Debug for PostBootstrap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostBootstrap")
            .field("rootfs_dir", &self.rootfs_dir)
            .field("cache_dir", &self.cache_dir)
            .field("chain", &self.chain)
            .field("mono_url", &self.mono_url)
            .finish_non_exhaustive()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::process::Command;

    use super::*;
    use crate::{
        environment::EnvMap,
        management::{Download, RuntimeLayout},
        runtime::{base_command, GuestLaunch},
    };

    struct OfflineClient;

    /// A chain whose registry tool never returns.
    #[derive(Debug)]
    struct HangingRegistryChain;

    impl SandboxChain for HangingRegistryChain {
        fn required_binaries(&self) -> Vec<PathBuf> {
            vec![PathBuf::from("/bin/sh")]
        }

        fn wineserver(&self, _root: &Path, env: &EnvMap) -> Command {
            Self::sh(env, "exit 0")
        }

        fn wineboot(&self, _root: &Path, env: &EnvMap) -> Command {
            Self::sh(env, "exit 0")
        }

        fn registry_add(
            &self,
            _root: &Path,
            env: &EnvMap,
            _key: &str,
            _name: &str,
            _value: &RegistryValue,
        ) -> Command {
            Self::sh(env, "exec sleep 30")
        }

        fn guest(&self, _root: &Path, env: &EnvMap, _launch: GuestLaunch<'_>) -> Command {
            Self::sh(env, "exit 0")
        }
    }

    impl HangingRegistryChain {
        fn sh(env: &EnvMap, script: &str) -> Command {
            let mut command = base_command("/bin/sh", env);
            command.arg("-c").arg(script);
            command
        }
    }

    #[async_trait]
    impl DownloadClient for OfflineClient {
        async fn get(&self, url: &str) -> DeckcoreResult<Download> {
            Err(DeckcoreError::Download {
                url: url.to_string(),
                reason: "offline".to_string(),
            })
        }
    }

    fn steps(home: &Path, mono_url: Option<String>) -> PostBootstrap {
        let layout = RuntimeLayout::new(home);
        PostBootstrap::new(
            layout.rootfs_dir(),
            layout.cache_dir(),
            Arc::new(layout.proot_chain()),
            layout.environment_builder(),
            Duration::from_secs(1),
            mono_url,
            Arc::new(OfflineClient),
        )
    }

    #[tokio::test]
    async fn test_repair_permissions_creates_dirs() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let root = home.path().join("containers/c1");

        let outcome = steps(home.path(), None).repair_permissions(&root).await;

        assert_eq!(outcome, StepOutcome::Done);
        let meta = std::fs::metadata(root.join("drive_c/windows/syswow64"))?;
        assert_eq!(meta.permissions().mode() & 0o777, DIR_MODE);
        assert!(root.join("drive_c/users/xuser/Temp").is_dir());
        Ok(())
    }

    #[tokio::test]
    async fn test_copy_support_libraries() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let source = home.path().join("rootfs").join(SUPPORT_LIBRARY_SOURCE);
        std::fs::create_dir_all(&source)?;
        for library in SUPPORT_LIBRARIES {
            std::fs::write(source.join(library), library)?;
        }
        let root = home.path().join("containers/c1");
        let steps = steps(home.path(), None);

        assert_eq!(steps.copy_support_libraries(&root).await, StepOutcome::Done);
        assert_eq!(
            std::fs::read_to_string(root.join("drive_c/windows/syswow64/ucrtbase.dll"))?,
            "ucrtbase.dll"
        );
        assert!(matches!(
            steps.copy_support_libraries(&root).await,
            StepOutcome::Skipped(_)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_libraries_fail_softly() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let root = home.path().join("containers/c1");

        let outcome = steps(home.path(), None).copy_support_libraries(&root).await;
        assert!(matches!(outcome, StepOutcome::Failed(reason) if reason.contains("ucrtbase.dll")));
        Ok(())
    }

    #[tokio::test]
    async fn test_set_windows_version_edits_hive() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let root = home.path().join("containers/c1");
        std::fs::create_dir_all(&root)?;
        std::fs::write(
            root.join(MACHINE_HIVE),
            "WINE REGISTRY Version 2\n\n[Software\\\\Microsoft\\\\Windows NT\\\\CurrentVersion] 1\n\"CurrentVersion\"=\"6.1\"\n",
        )?;

        let outcome = steps(home.path(), None)
            .set_windows_version(&root, &ContainerConfig::default())
            .await;

        assert_eq!(outcome, StepOutcome::Done);
        let hive = std::fs::read_to_string(root.join(MACHINE_HIVE))?;
        assert!(hive.contains("\"CurrentVersion\"=\"6.3\""));
        Ok(())
    }

    #[tokio::test]
    async fn test_registry_tool_timeout() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let root = home.path().join("containers/c1");
        std::fs::create_dir_all(&root)?;
        std::fs::write(root.join(MACHINE_HIVE), "WINE REGISTRY Version 2\n")?;

        let layout = RuntimeLayout::new(home.path());
        let steps = PostBootstrap::new(
            layout.rootfs_dir(),
            layout.cache_dir(),
            Arc::new(HangingRegistryChain),
            layout.environment_builder(),
            Duration::from_millis(100),
            None,
            Arc::new(OfflineClient),
        );

        let mut env = EnvMap::new();
        env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
        let result = steps
            .registry_add(&root, &env, "HKLM\\Software", "Name", &RegistryValue::Dword(1))
            .await;
        assert!(matches!(
            result,
            Err(DeckcoreError::Timeout { after, .. }) if after == Duration::from_millis(100)
        ));

        let outcome = steps
            .set_windows_version(&root, &ContainerConfig::default())
            .await;
        assert!(matches!(outcome, StepOutcome::Failed(reason) if reason.contains("timed out")));
        Ok(())
    }

    #[tokio::test]
    async fn test_mono_install_failure_is_soft() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let root = home.path().join("containers/c1");
        let steps = steps(home.path(), Some("https://example.org/wine-mono.tar.xz".to_string()));

        assert!(matches!(steps.install_mono(&root).await, StepOutcome::Failed(_)));
        assert!(matches!(
            self::steps(home.path(), None).install_mono(&root).await,
            StepOutcome::Skipped(_)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_link_wine_binary() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let bin = home.path().join("rootfs/opt/wine/bin");
        std::fs::create_dir_all(&bin)?;
        std::fs::write(bin.join("wine64"), "")?;
        let steps = steps(home.path(), None);

        assert_eq!(steps.link_wine_binary().await, StepOutcome::Done);
        assert_eq!(std::fs::read_link(bin.join("wine"))?, Path::new("wine64"));
        assert!(matches!(steps.link_wine_binary().await, StepOutcome::Skipped(_)));
        Ok(())
    }
}
