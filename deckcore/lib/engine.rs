use std::{path::Path, sync::Arc, time::Duration};

use deckutils::{resolve_env_path, ProcessSampler};
use futures::Stream;
use tokio::sync::Mutex;

use crate::{
    config::{ContainerConfig, DeckConfig},
    management::{
        AssetSource, Bootstrapper, Container, ContainerManager, DownloadClient,
        HttpDownloadClient, PostBootstrap, ProgressCallback, RuntimeInstaller, RuntimeLayout,
    },
    runtime::{GuestProcess, ProcessLauncher, ProcessState, ProcessStatus, ProotChain, SandboxChain},
    utils::PROOT_EXE_ENV_VAR,
    DeckcoreError, DeckcoreResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The entry point for the layer above: runtime install, containers and guest processes.
///
/// At most one guest process is the foreground process. Replacing or stopping it happens under
/// one lock, so a stop racing a launch can never lose track of a running process.
pub struct DeckEngine {
    config: DeckConfig,
    installer: RuntimeInstaller,
    containers: ContainerManager,
    launcher: ProcessLauncher,
    foreground: Mutex<Option<String>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DeckEngine {
    /// Creates an engine over the production sandbox chain.
    ///
    /// The sandbox executable can be overridden with `DECK_PROOT_EXE`.
    pub fn new(config: DeckConfig, assets: Arc<dyn AssetSource>) -> Self {
        let layout = RuntimeLayout::new(config.get_home());
        let proot = match resolve_env_path(PROOT_EXE_ENV_VAR, layout.proot_binary()) {
            Ok(path) => path,
            Err(e) => {
                tracing::debug!(error = %e, "using the bundled sandbox location");
                layout.proot_binary()
            }
        };

        let chain = ProotChain::new(
            proot,
            layout.box64_binary(),
            layout.rootfs_dir(),
            layout.shm_dir(),
        );

        Self::with_parts(config, assets, Arc::new(chain), Arc::new(HttpDownloadClient::new()))
    }

    /// Creates an engine from explicit collaborators.
    pub fn with_parts(
        config: DeckConfig,
        assets: Arc<dyn AssetSource>,
        chain: Arc<dyn SandboxChain>,
        downloader: Arc<dyn DownloadClient>,
    ) -> Self {
        let layout = RuntimeLayout::new(config.get_home());
        let env = layout.environment_builder();

        let bootstrapper = Bootstrapper::new(
            Arc::clone(&chain),
            env.clone(),
            config.get_bootstrap().clone(),
        );
        let post_bootstrap = PostBootstrap::new(
            layout.rootfs_dir(),
            layout.cache_dir(),
            Arc::clone(&chain),
            env.clone(),
            config.get_bootstrap().registry_tool_timeout(),
            config.get_mono_url().clone(),
            downloader,
        );
        let containers = ContainerManager::new(
            layout.clone(),
            Arc::clone(&chain),
            bootstrapper,
            post_bootstrap,
            config.get_container_defaults().clone(),
        );
        let launcher = ProcessLauncher::new(
            chain,
            env,
            config.get_launch().clone(),
            ProcessSampler::new(),
        );
        let installer = RuntimeInstaller::new(layout, config.get_runtime().clone(), assets);

        Self {
            config,
            installer,
            containers,
            launcher,
            foreground: Mutex::new(None),
        }
    }

    /// The configuration the engine was built from.
    pub fn config(&self) -> &DeckConfig {
        &self.config
    }

    /// The container manager.
    pub fn containers(&self) -> &ContainerManager {
        &self.containers
    }

    /// The process launcher.
    pub fn launcher(&self) -> &ProcessLauncher {
        &self.launcher
    }

    /// Whether the runtime is installed.
    pub async fn is_available(&self) -> bool {
        self.installer.is_available().await
    }

    /// Installs or updates the runtime.
    pub async fn initialize(&self, progress: ProgressCallback) -> DeckcoreResult<()> {
        self.installer.install(progress).await
    }

    /// Creates a container with `config`, or the configured defaults.
    pub async fn create_container(
        &self,
        name: &str,
        config: Option<ContainerConfig>,
    ) -> DeckcoreResult<Container> {
        self.ensure_available().await?;
        let config = config.unwrap_or_else(|| self.config.get_container_defaults().clone());
        self.containers.create(name, config).await
    }

    /// Returns the shared default container, creating it on first use.
    pub async fn default_container(&self) -> DeckcoreResult<Arc<Container>> {
        self.ensure_available().await?;
        self.containers.get_or_create_default().await
    }

    /// Lists all containers.
    pub async fn list_containers(&self) -> DeckcoreResult<Vec<Container>> {
        self.containers.list().await
    }

    /// Deletes a container.
    pub async fn delete_container(&self, id: &str) -> DeckcoreResult<()> {
        self.containers.delete(id).await
    }

    /// Launches a guest executable.
    pub async fn launch_executable(
        &self,
        container: &Container,
        executable: impl AsRef<Path>,
        args: &[String],
    ) -> DeckcoreResult<GuestProcess> {
        let process = self.launcher.launch(container, executable, args).await?;
        if let Err(e) = self.containers.touch(container.get_id()).await {
            tracing::debug!(container_id = %container.get_id(), error = %e, "failed to record launch");
        }
        Ok(process)
    }

    /// Reports the status of a guest process.
    pub async fn get_process_status(&self, id: &str) -> DeckcoreResult<ProcessStatus> {
        self.launcher.get_status(id).await
    }

    /// Streams the status of a guest process until it stops.
    pub fn monitor_process(
        &self,
        id: &str,
        interval: Duration,
    ) -> impl Stream<Item = DeckcoreResult<ProcessStatus>> + Send + 'static {
        self.launcher.monitor(id, interval)
    }

    /// Terminates a guest process.
    pub async fn kill_process(&self, id: &str, force: bool) -> DeckcoreResult<ProcessState> {
        self.launcher.kill(id, force).await
    }

    /// Stops the current foreground process, if any, and launches a new one in its place.
    pub async fn launch_foreground(
        &self,
        container: &Container,
        executable: impl AsRef<Path>,
        args: &[String],
    ) -> DeckcoreResult<GuestProcess> {
        let mut foreground = self.foreground.lock().await;
        if let Some(previous) = foreground.clone() {
            self.stop_tracked(&previous).await?;
            *foreground = None;
        }

        let process = self.launch_executable(container, executable, args).await?;
        *foreground = Some(process.get_id().clone());
        Ok(process)
    }

    /// Stops the foreground process gracefully.
    ///
    /// Returns `None` if there was no foreground process or it was already gone. The process
    /// stays the foreground process if stopping it fails or is cancelled.
    pub async fn stop_foreground(&self) -> DeckcoreResult<Option<ProcessState>> {
        let mut foreground = self.foreground.lock().await;
        let Some(id) = foreground.clone() else {
            return Ok(None);
        };

        let state = self.stop_tracked(&id).await?;
        *foreground = None;
        Ok(state)
    }

    /// The id of the foreground process.
    pub async fn foreground(&self) -> Option<String> {
        self.foreground.lock().await.clone()
    }

    /// Pauses the foreground process.
    pub async fn suspend_foreground(&self) -> DeckcoreResult<()> {
        match self.foreground.lock().await.as_deref() {
            Some(id) => self.launcher.suspend(id),
            None => Ok(()),
        }
    }

    /// Continues the foreground process.
    pub async fn resume_foreground(&self) -> DeckcoreResult<()> {
        match self.foreground.lock().await.as_deref() {
            Some(id) => self.launcher.resume(id),
            None => Ok(()),
        }
    }

    async fn stop_tracked(&self, id: &str) -> DeckcoreResult<Option<ProcessState>> {
        match self.launcher.kill(id, false).await {
            Ok(state) => Ok(Some(state)),
            Err(DeckcoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn ensure_available(&self) -> DeckcoreResult<()> {
        if self.is_available().await {
            Ok(())
        } else {
            Err(DeckcoreError::NotInitialized)
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl std::fmt::Debug for DeckEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeckEngine")
            .field("home", self.config.get_home())
            .field("containers", &self.containers)
            .field("launcher", &self.launcher)
            .finish_non_exhaustive()
    }
}
