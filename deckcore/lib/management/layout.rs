use std::path::{Path, PathBuf};

use crate::{
    environment::EnvironmentBuilder,
    runtime::ProotChain,
    utils::{
        BOX64_SUBDIR, BOX64_VERSION_FILENAME, CACHE_SUBDIR, CONTAINERS_SUBDIR,
        IMAGE_VERSION_FILENAME, MARKER_DIR, PROOT_SUBDIR, ROOTFS_SUBDIR,
    },
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// File name of the translator executable.
pub const BOX64_BINARY: &str = "box64";

/// File name of the sandbox executable.
pub const PROOT_BINARY: &str = "proot";

/// Directory under the cache bound onto `/dev/shm` when esync is on.
pub const SHM_SUBDIR: &str = "shm";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The on-disk layout of a deck home directory.
///
/// ```text
/// <home>/
/// ├── deck.yaml
/// ├── rootfs/            compatibility layer support tree
/// │   └── .deck/         image and translator version markers
/// ├── box64/box64        translator
/// ├── proot/proot        sandbox
/// ├── cache/             sandbox scratch space
/// └── containers/<id>/   one directory per container
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeLayout {
    home: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RuntimeLayout {
    /// Creates a layout rooted at `home`.
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// The deck home directory.
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// The extracted compatibility-layer support tree.
    pub fn rootfs_dir(&self) -> PathBuf {
        self.home.join(ROOTFS_SUBDIR)
    }

    /// Where the translator is installed.
    pub fn box64_dir(&self) -> PathBuf {
        self.home.join(BOX64_SUBDIR)
    }

    /// The translator executable.
    pub fn box64_binary(&self) -> PathBuf {
        self.box64_dir().join(BOX64_BINARY)
    }

    /// Where the sandbox tool is installed.
    pub fn proot_dir(&self) -> PathBuf {
        self.home.join(PROOT_SUBDIR)
    }

    /// The sandbox executable.
    pub fn proot_binary(&self) -> PathBuf {
        self.proot_dir().join(PROOT_BINARY)
    }

    /// The directory holding one subdirectory per container.
    pub fn containers_dir(&self) -> PathBuf {
        self.home.join(CONTAINERS_SUBDIR)
    }

    /// The root of the container with the given id.
    pub fn container_dir(&self, id: &str) -> PathBuf {
        self.containers_dir().join(id)
    }

    /// Scratch space shared by all containers.
    pub fn cache_dir(&self) -> PathBuf {
        self.home.join(CACHE_SUBDIR)
    }

    /// The private shared-memory directory.
    pub fn shm_dir(&self) -> PathBuf {
        self.cache_dir().join(SHM_SUBDIR)
    }

    /// The directory holding the install markers.
    pub fn marker_dir(&self) -> PathBuf {
        self.rootfs_dir().join(MARKER_DIR)
    }

    /// The marker recording the installed image version.
    pub fn image_version_file(&self) -> PathBuf {
        self.marker_dir().join(IMAGE_VERSION_FILENAME)
    }

    /// The marker recording the installed translator version.
    pub fn box64_version_file(&self) -> PathBuf {
        self.marker_dir().join(BOX64_VERSION_FILENAME)
    }

    /// An environment builder for this layout.
    pub fn environment_builder(&self) -> EnvironmentBuilder {
        EnvironmentBuilder::new(self.cache_dir(), self.proot_dir())
    }

    /// The production sandbox chain for this layout.
    pub fn proot_chain(&self) -> ProotChain {
        ProotChain::new(
            self.proot_binary(),
            self.box64_binary(),
            self.rootfs_dir(),
            self.shm_dir(),
        )
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
