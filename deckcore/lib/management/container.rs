use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use tokio::{fs, sync::Mutex};
use walkdir::WalkDir;

use crate::{
    config::ContainerConfig,
    runtime::SandboxChain,
    utils::{CONTAINER_LOG_SUBDIR, CONTAINER_METADATA_FILENAME, CONTAINER_TMP_SUBDIR, DRIVE_C_SUBDIR},
    DeckcoreError, DeckcoreResult,
};

use super::{
    bootstrap::hives_present, BootstrapReport, Bootstrapper, DefaultContainerCache, PostBootstrap,
    RuntimeLayout,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The reserved id of the container used when the caller does not pick one.
pub const DEFAULT_CONTAINER_ID: &str = "default_shared_container";

/// The display name of the default container.
pub const DEFAULT_CONTAINER_NAME: &str = "Default";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An isolated guest filesystem and registry.
///
/// The id is the name of the container's directory. Everything else except the root path and
/// the size is persisted in `container.json` inside that directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters, CopyGetters)]
pub struct Container {
    /// The container id.
    #[getset(get = "pub with_prefix")]
    pub(crate) id: String,

    /// A display name.
    #[getset(get = "pub with_prefix")]
    pub(crate) name: String,

    /// The container directory.
    #[serde(skip)]
    #[getset(get = "pub with_prefix")]
    pub(crate) root_path: PathBuf,

    /// Settings chosen at creation.
    #[getset(get = "pub with_prefix")]
    pub(crate) config: ContainerConfig,

    /// When the container was created.
    #[getset(get_copy = "pub with_prefix")]
    pub(crate) created_at: DateTime<Utc>,

    /// When a guest program was last launched in it.
    #[serde(default)]
    #[getset(get_copy = "pub with_prefix")]
    pub(crate) last_used_at: Option<DateTime<Utc>>,

    /// Disk usage in bytes, computed when the record is loaded.
    #[serde(skip)]
    #[getset(get_copy = "pub with_prefix")]
    pub(crate) size_bytes: u64,
}

/// Creates, lists and deletes containers under a runtime's containers directory.
pub struct ContainerManager {
    layout: RuntimeLayout,
    chain: Arc<dyn SandboxChain>,
    bootstrapper: Bootstrapper,
    post_bootstrap: PostBootstrap,
    defaults: ContainerConfig,
    cache: DefaultContainerCache,
    create_lock: Mutex<()>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Container {
    /// Creates a record for a container that was just created.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        root_path: impl Into<PathBuf>,
        config: ContainerConfig,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            root_path: root_path.into(),
            config,
            created_at: Utc::now(),
            last_used_at: None,
            size_bytes: 0,
        }
    }

    /// The guest `C:` drive.
    pub fn drive_c(&self) -> PathBuf {
        self.root_path.join(DRIVE_C_SUBDIR)
    }

    /// Where guest process logs are written.
    pub fn log_dir(&self) -> PathBuf {
        self.root_path.join(CONTAINER_LOG_SUBDIR)
    }

    /// Loads the container stored in `root`, synthesizing a record if it has no metadata.
    pub async fn load(root: &Path, defaults: &ContainerConfig) -> DeckcoreResult<Self> {
        let id = root
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| DeckcoreError::container_not_found(root.display().to_string()))?
            .to_string();

        let metadata = fs::metadata(root).await?;
        if !metadata.is_dir() {
            return Err(DeckcoreError::container_not_found(id));
        }

        let mut container = match fs::read(root.join(CONTAINER_METADATA_FILENAME)).await {
            Ok(bytes) => serde_json::from_slice::<Container>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let created_at = metadata
                    .created()
                    .or_else(|_| metadata.modified())
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());

                Container {
                    created_at,
                    ..Container::new(id.clone(), id.clone(), root, defaults.clone())
                }
            }
            Err(e) => return Err(e.into()),
        };

        container.id = id;
        container.root_path = root.to_path_buf();
        container.size_bytes = dir_size(root).await;

        Ok(container)
    }

    /// Writes `container.json`.
    pub async fn save(&self) -> DeckcoreResult<()> {
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(self.root_path.join(CONTAINER_METADATA_FILENAME), json).await?;
        Ok(())
    }
}

impl ContainerManager {
    /// Creates a manager.
    ///
    /// `defaults` is used for containers without metadata and for the default container.
    pub fn new(
        layout: RuntimeLayout,
        chain: Arc<dyn SandboxChain>,
        bootstrapper: Bootstrapper,
        post_bootstrap: PostBootstrap,
        defaults: ContainerConfig,
    ) -> Self {
        Self {
            layout,
            chain,
            bootstrapper,
            post_bootstrap,
            defaults,
            cache: DefaultContainerCache::new(),
            create_lock: Mutex::new(()),
        }
    }

    /// The default-container cache.
    pub fn cache(&self) -> &DefaultContainerCache {
        &self.cache
    }

    /// Creates and bootstraps a container with a fresh timestamp id.
    pub async fn create(&self, name: &str, config: ContainerConfig) -> DeckcoreResult<Container> {
        let _lock = self.create_lock.lock().await;
        let id = self.allocate_id().await?;
        self.create_locked(&id, name, config).await
    }

    /// Creates and bootstraps a container with the given id.
    ///
    /// ## Errors
    ///
    /// Returns [`DeckcoreError::ContainerExists`] if the id is taken,
    /// [`DeckcoreError::BinaryMissing`] if the runtime is incomplete and
    /// [`DeckcoreError::BootstrapFailure`] if every bootstrap attempt failed. The container
    /// directory is removed again on any failure.
    pub async fn create_with_id(
        &self,
        id: &str,
        name: &str,
        config: ContainerConfig,
    ) -> DeckcoreResult<Container> {
        let _lock = self.create_lock.lock().await;
        self.create_locked(id, name, config).await
    }

    /// Lists every container, skipping directories that cannot be read.
    pub async fn list(&self) -> DeckcoreResult<Vec<Container>> {
        let dir = self.layout.containers_dir();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut containers = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            match Container::load(&entry.path(), &self.defaults).await {
                Ok(container) => containers.push(container),
                Err(e) => {
                    tracing::debug!(path = %entry.path().display(), error = %e, "skipping unreadable container")
                }
            }
        }

        containers.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(containers)
    }

    /// Loads one container.
    pub async fn get(&self, id: &str) -> DeckcoreResult<Container> {
        let root = self.existing_dir(id).await?;
        Container::load(&root, &self.defaults).await
    }

    /// Deletes a container and everything in it.
    pub async fn delete(&self, id: &str) -> DeckcoreResult<()> {
        let root = self.existing_dir(id).await?;
        fs::remove_dir_all(&root).await?;
        self.cache.invalidate();

        tracing::info!(container_id = %id, "container deleted");
        Ok(())
    }

    /// Returns the default container, creating it if it does not exist.
    pub async fn get_or_create_default(&self) -> DeckcoreResult<Arc<Container>> {
        if let Some(container) = self.cache.get().await {
            return Ok(container);
        }

        let _lock = self.create_lock.lock().await;
        let root = self.layout.container_dir(DEFAULT_CONTAINER_ID);
        let container = if hives_present(&root).await {
            Container::load(&root, &self.defaults).await?
        } else {
            if fs::try_exists(&root).await? {
                tracing::warn!(
                    container_id = DEFAULT_CONTAINER_ID,
                    "removing incomplete default container"
                );
                fs::remove_dir_all(&root).await?;
            }

            self.create_locked(
                DEFAULT_CONTAINER_ID,
                DEFAULT_CONTAINER_NAME,
                self.defaults.clone(),
            )
            .await?
        };

        let container = Arc::new(container);
        self.cache.set(Arc::clone(&container));
        Ok(container)
    }

    /// Records a launch in the container's metadata.
    pub async fn touch(&self, id: &str) -> DeckcoreResult<()> {
        let mut container = self.get(id).await?;
        container.last_used_at = Some(Utc::now());
        container.save().await
    }

    async fn create_locked(
        &self,
        id: &str,
        name: &str,
        config: ContainerConfig,
    ) -> DeckcoreResult<Container> {
        if !is_valid_container_id(id) {
            return Err(DeckcoreError::InvalidConfig(format!(
                "invalid container id: {id:?}"
            )));
        }

        let root = self.layout.container_dir(id);
        if fs::try_exists(&root).await? {
            return Err(DeckcoreError::ContainerExists(id.to_string()));
        }

        for binary in self.chain.required_binaries() {
            if !fs::try_exists(&binary).await? {
                return Err(DeckcoreError::BinaryMissing(binary));
            }
        }

        tracing::info!(container_id = %id, root = %root.display(), "creating container");
        for dir in [DRIVE_C_SUBDIR, CONTAINER_TMP_SUBDIR, CONTAINER_LOG_SUBDIR] {
            fs::create_dir_all(root.join(dir)).await?;
        }

        let report = match self.bootstrapper.run(id, &root, &config).await {
            Ok(report) => report,
            Err(e) => {
                if let Err(remove) = fs::remove_dir_all(&root).await {
                    tracing::warn!(container_id = %id, error = %remove, "failed to remove container");
                }
                self.cache.invalidate();
                return Err(e);
            }
        };

        self.finish(id, name, &root, config, report).await
    }

    async fn finish(
        &self,
        id: &str,
        name: &str,
        root: &Path,
        config: ContainerConfig,
        report: BootstrapReport,
    ) -> DeckcoreResult<Container> {
        self.post_bootstrap.run_all(id, root, &config).await;

        let mut container = Container::new(id, name, root, config);
        container.save().await?;
        container.size_bytes = dir_size(root).await;
        self.cache.invalidate();

        tracing::info!(
            container_id = %id,
            attempts = report.get_attempts(),
            size_bytes = container.size_bytes,
            "container created"
        );

        Ok(container)
    }

    async fn existing_dir(&self, id: &str) -> DeckcoreResult<PathBuf> {
        if !is_valid_container_id(id) {
            return Err(DeckcoreError::container_not_found(id));
        }

        let root = self.layout.container_dir(id);
        if root.parent() != Some(self.layout.containers_dir().as_path())
            || !fs::try_exists(&root).await?
        {
            return Err(DeckcoreError::container_not_found(id));
        }
        Ok(root)
    }

    /// A timestamp id, bumped past any existing directory.
    async fn allocate_id(&self) -> DeckcoreResult<String> {
        let mut millis = Utc::now().timestamp_millis();
        loop {
            let id = millis.to_string();
            if !fs::try_exists(self.layout.container_dir(&id)).await? {
                return Ok(id);
            }
            millis += 1;
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Whether `id` names exactly one directory entry, so it cannot reach outside the containers
/// directory.
pub fn is_valid_container_id(id: &str) -> bool {
    let mut components = Path::new(id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) => name == id,
        _ => false,
    }
}

/// Total size of the regular files under `root`, ignoring unreadable entries.
async fn dir_size(root: &Path) -> u64 {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || {
        WalkDir::new(root)
            .into_iter()
            .filter_map(Result::ok)
            .filter_map(|entry| entry.metadata().ok())
            .filter(|metadata| metadata.is_file())
            .map(|metadata| metadata.len())
            .sum::<u64>()
    })
    .await
    .unwrap_or_default()
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl std::fmt::Debug for ContainerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerManager")
            .field("layout", &self.layout)
            .field("chain", &self.chain)
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
