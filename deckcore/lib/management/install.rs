use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use deckutils::{extract_stream, CompressionFormat, ElfPatcher, PatchOutcome, REQUIRED_TLS_ALIGNMENT};
use tokio::fs;

use crate::{config::RuntimeImage, DeckcoreError, DeckcoreResult};

use super::RuntimeLayout;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Rootfs entries that survive a re-install, relative to the rootfs.
pub const PRESERVED_ROOTFS_ENTRIES: [&str; 2] = ["home", "opt/installed-wine"];

/// Share of the install progress taken by each stage, in order.
const ROOTFS_SHARE: (f32, f32) = (0.0, 0.7);
const BOX64_SHARE: (f32, f32) = (0.7, 0.85);
const PROOT_SHARE: (f32, f32) = (0.85, 0.95);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Receives `(fraction, message)` progress updates during installation.
pub type ProgressCallback = Arc<dyn Fn(f32, &str) + Send + Sync>;

/// A source of the bundled runtime archives.
pub trait AssetSource: Send + Sync {
    /// Opens the asset called `name`, returning its bytes and its length.
    fn open(&self, name: &str) -> DeckcoreResult<(Box<dyn Read + Send>, u64)>;
}

/// Serves assets from a directory on disk.
#[derive(Debug, Clone)]
pub struct DirAssetSource {
    dir: PathBuf,
}

/// Extracts and patches the translator, sandbox and compatibility-layer binaries.
///
/// This is the one-time bring-up of the runtime itself, distinct from bootstrapping a
/// container. Re-running it is cheap: archives whose recorded version matches are skipped and
/// the binary patches only write when something differs.
pub struct RuntimeInstaller {
    layout: RuntimeLayout,
    image: RuntimeImage,
    assets: Arc<dyn AssetSource>,
    in_progress: AtomicBool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DirAssetSource {
    /// Serves assets from `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl RuntimeInstaller {
    /// Creates an installer for `image` into `layout`.
    pub fn new(layout: RuntimeLayout, image: RuntimeImage, assets: Arc<dyn AssetSource>) -> Self {
        Self {
            layout,
            image,
            assets,
            in_progress: AtomicBool::new(false),
        }
    }

    /// Whether the current image version is installed and all runtime binaries exist.
    pub async fn is_available(&self) -> bool {
        let installed = read_marker(&self.layout.image_version_file())
            .await
            .and_then(|v| v.parse::<u32>().ok());

        match installed {
            Some(version) if version >= self.image.get_image_version() => {}
            _ => return false,
        }

        for binary in [self.layout.box64_binary(), self.layout.proot_binary()] {
            if !fs::try_exists(&binary).await.unwrap_or(false) {
                return false;
            }
        }

        true
    }

    /// Installs or updates the runtime.
    ///
    /// ## Errors
    ///
    /// Returns [`DeckcoreError::InitializationInProgress`] if another call is running,
    /// [`DeckcoreError::ExtractionFailure`] for unreadable archives and
    /// [`DeckcoreError::PatchFailure`] if the translator cannot be patched.
    pub async fn install(&self, progress: ProgressCallback) -> DeckcoreResult<()> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DeckcoreError::InitializationInProgress);
        }

        let _reset = scopeguard::guard(&self.in_progress, |flag| {
            flag.store(false, Ordering::Release)
        });

        let image_current = read_marker(&self.layout.image_version_file())
            .await
            .and_then(|v| v.parse::<u32>().ok())
            .is_some_and(|v| v >= self.image.get_image_version());

        if image_current {
            tracing::info!("rootfs image is current, skipping extraction");
        } else {
            progress(ROOTFS_SHARE.0, "Preparing rootfs");
            clear_rootfs(&self.layout.rootfs_dir()).await?;
            self.extract(
                self.image.get_rootfs_asset(),
                &self.layout.rootfs_dir(),
                ROOTFS_SHARE,
                "Extracting rootfs",
                &progress,
            )
            .await?;
        }

        let box64_version = read_marker(&self.layout.box64_version_file()).await;
        if box64_version.as_deref() == Some(self.image.get_box64_version().as_str())
            && fs::try_exists(self.layout.box64_binary()).await?
        {
            tracing::info!(version = %self.image.get_box64_version(), "translator is current, skipping extraction");
        } else {
            remove_dir_if_exists(&self.layout.box64_dir()).await?;
            self.extract(
                &self.image.box64_asset(),
                &self.layout.box64_dir(),
                BOX64_SHARE,
                "Extracting box64",
                &progress,
            )
            .await?;
        }

        if !fs::try_exists(self.layout.proot_binary()).await? {
            self.extract(
                self.image.get_proot_asset(),
                &self.layout.proot_dir(),
                PROOT_SHARE,
                "Extracting proot",
                &progress,
            )
            .await?;
        }

        progress(PROOT_SHARE.1, "Patching binaries");
        self.patch_box64().await?;

        for dir in [
            self.layout.containers_dir(),
            self.layout.cache_dir(),
            self.layout.shm_dir(),
            self.layout.marker_dir(),
        ] {
            fs::create_dir_all(dir).await?;
        }

        // The image marker goes last so an interrupted install is never reported as available.
        fs::write(
            self.layout.box64_version_file(),
            self.image.get_box64_version(),
        )
        .await?;
        fs::write(
            self.layout.image_version_file(),
            self.image.get_image_version().to_string(),
        )
        .await?;

        progress(1.0, "Runtime ready");
        tracing::info!(home = %self.layout.home().display(), "runtime installed");

        Ok(())
    }

    async fn extract(
        &self,
        asset: &str,
        target: &Path,
        share: (f32, f32),
        message: &str,
        progress: &ProgressCallback,
    ) -> DeckcoreResult<()> {
        let format = CompressionFormat::from_path(asset)?;
        let (reader, total) = self.assets.open(asset)?;

        let progress = Arc::clone(progress);
        let message = message.to_string();
        let (start, end) = share;

        extract_stream(asset, reader, total, format, target, move |fraction| {
            progress(start + (end - start) * fraction, &message)
        })
        .await?;

        Ok(())
    }

    /// Re-applies the translator patches.
    async fn patch_box64(&self) -> DeckcoreResult<()> {
        let patcher = ElfPatcher::new(self.layout.box64_binary());
        let interpreter = self.image.get_interpreter().clone();

        let outcomes = tokio::task::spawn_blocking(move || {
            let pie = patcher.ensure_pie()?;
            let tls = patcher.ensure_tls_alignment(REQUIRED_TLS_ALIGNMENT)?;
            let interp = match patcher.interpreter()? {
                Some(_) => patcher.set_interpreter(&interpreter)?,
                None => PatchOutcome::NotApplicable,
            };
            deckutils::Ok((pie, tls, interp))
        })
        .await??;

        tracing::info!(
            pie = ?outcomes.0,
            tls = ?outcomes.1,
            interpreter = ?outcomes.2,
            "translator patched"
        );

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn read_marker(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .await
        .ok()
        .map(|s| s.trim().to_string())
}

async fn remove_dir_if_exists(path: &Path) -> DeckcoreResult<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Empties the rootfs except for [`PRESERVED_ROOTFS_ENTRIES`].
async fn clear_rootfs(rootfs: &Path) -> DeckcoreResult<()> {
    if !fs::try_exists(rootfs).await? {
        return Ok(());
    }

    clear_dir(rootfs, rootfs).await
}

async fn clear_dir(rootfs: &Path, dir: &Path) -> DeckcoreResult<()> {
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let relative = path.strip_prefix(rootfs).unwrap_or(&path);

        if PRESERVED_ROOTFS_ENTRIES
            .iter()
            .any(|keep| relative == Path::new(keep))
        {
            continue;
        }

        let file_type = entry.file_type().await?;
        let holds_preserved = PRESERVED_ROOTFS_ENTRIES
            .iter()
            .any(|keep| Path::new(keep).starts_with(relative));

        if file_type.is_dir() && holds_preserved {
            Box::pin(clear_dir(rootfs, &path)).await?;
        } else if file_type.is_dir() {
            fs::remove_dir_all(&path).await?;
        } else {
            fs::remove_file(&path).await?;
        }
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl AssetSource for DirAssetSource {
    fn open(&self, name: &str) -> DeckcoreResult<(Box<dyn Read + Send>, u64)> {
        let path = self.dir.join(name);
        let file = File::open(&path).map_err(|e| {
            DeckcoreError::ExtractionFailure(deckutils::DeckutilsError::Extraction {
                archive: path.display().to_string(),
                reason: e.to_string(),
            })
        })?;
        let len = file.metadata()?.len();
        Ok((Box::new(file), len))
    }
}

impl std::fmt::Debug for RuntimeInstaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeInstaller")
            .field("layout", &self.layout)
            .field("image", &self.image)
            .field("in_progress", &self.in_progress)
            .finish_non_exhaustive()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clear_rootfs_preserves_user_data() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let rootfs = dir.path().join("rootfs");
        for d in ["home/xuser", "opt/installed-wine/bin", "opt/wine/bin", "usr/lib"] {
            fs::create_dir_all(rootfs.join(d)).await?;
        }
        fs::write(rootfs.join("home/xuser/save.dat"), "save").await?;
        fs::write(rootfs.join("opt/wine/bin/wine64"), "").await?;
        fs::write(rootfs.join("opt/stale"), "").await?;
        fs::write(rootfs.join("etc-version"), "1").await?;

        clear_rootfs(&rootfs).await?;

        assert!(rootfs.join("home/xuser/save.dat").exists());
        assert!(rootfs.join("opt/installed-wine/bin").exists());
        assert!(!rootfs.join("opt/wine").exists());
        assert!(!rootfs.join("opt/stale").exists());
        assert!(!rootfs.join("usr").exists());
        assert!(!rootfs.join("etc-version").exists());

        Ok(())
    }

    #[tokio::test]
    async fn test_missing_asset_is_extraction_failure() {
        let source = DirAssetSource::new("/definitely/not/here");
        assert!(matches!(
            source.open("rootfs.txz"),
            Err(DeckcoreError::ExtractionFailure(_))
        ));
    }
}
