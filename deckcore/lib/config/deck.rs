use std::path::{Path, PathBuf};

use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use tokio::fs;
use typed_builder::TypedBuilder;

use crate::{
    config::{
        BootstrapPolicy, ContainerConfig, LaunchPolicy, DEFAULT_BOX64_VERSION,
        DEFAULT_IMAGE_VERSION, DEFAULT_INTERPRETER, DEFAULT_MONO_URL, DEFAULT_PROOT_ASSET,
        DEFAULT_ROOTFS_ASSET,
    },
    utils::{self, DECK_CONFIG_FILENAME},
    DeckcoreError, DeckcoreResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The deck runtime configuration, read from `deck.yaml` in the deck home directory.
///
/// Every field has a default, so an empty or missing file is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[serde(default)]
#[getset(get = "pub with_prefix")]
pub struct DeckConfig {
    /// The deck home directory. Not read from the file; set to the directory it was loaded from.
    #[serde(skip)]
    #[builder(default = utils::get_deck_home_path(), setter(into))]
    home: PathBuf,

    /// The bundled runtime image.
    #[builder(default)]
    runtime: RuntimeImage,

    /// Timing of container bootstrap.
    #[builder(default)]
    bootstrap: BootstrapPolicy,

    /// Timing of guest process launch and kill.
    #[builder(default)]
    launch: LaunchPolicy,

    /// Where to download the .NET compatibility runtime from. `None` skips the install.
    #[builder(default = Some(DEFAULT_MONO_URL.to_string()))]
    mono_url: Option<String>,

    /// Settings for containers created without an explicit configuration.
    #[builder(default)]
    container_defaults: ContainerConfig,
}

/// Versions and asset names of the runtime image extracted by `initialize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, Getters, CopyGetters)]
#[serde(default)]
pub struct RuntimeImage {
    /// The rootfs image version; an older installed version is replaced.
    #[builder(default = DEFAULT_IMAGE_VERSION)]
    #[getset(get_copy = "pub with_prefix")]
    image_version: u32,

    /// The translator version; its archive is named `box64-<version>.tzst`.
    #[builder(default = DEFAULT_BOX64_VERSION.to_string(), setter(into))]
    #[getset(get = "pub with_prefix")]
    box64_version: String,

    /// The dynamic linker written into the translator's `PT_INTERP` segment.
    #[builder(default = DEFAULT_INTERPRETER.to_string(), setter(into))]
    #[getset(get = "pub with_prefix")]
    interpreter: String,

    /// The rootfs asset name.
    #[builder(default = DEFAULT_ROOTFS_ASSET.to_string(), setter(into))]
    #[getset(get = "pub with_prefix")]
    rootfs_asset: String,

    /// The sandbox tool asset name.
    #[builder(default = DEFAULT_PROOT_ASSET.to_string(), setter(into))]
    #[getset(get = "pub with_prefix")]
    proot_asset: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DeckConfig {
    /// Loads the configuration from `<home>/deck.yaml`, falling back to defaults when the file
    /// does not exist.
    pub async fn load(home: impl AsRef<Path>) -> DeckcoreResult<Self> {
        let home = home.as_ref();
        let path = home.join(DECK_CONFIG_FILENAME);

        let mut config = if fs::try_exists(&path).await? {
            let contents = fs::read_to_string(&path).await?;
            if contents.trim().is_empty() {
                Self::default()
            } else {
                serde_yaml::from_str::<Self>(&contents)?
            }
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Self::default()
        };

        config.home = home.to_path_buf();
        config.validate()?;

        Ok(config)
    }

    /// Loads the configuration from the deck home directory (`$DECK_HOME` or `~/.deck`).
    pub async fn load_default() -> DeckcoreResult<Self> {
        Self::load(utils::get_deck_home_path()).await
    }

    /// Writes the configuration to `<home>/deck.yaml`.
    pub async fn save(&self) -> DeckcoreResult<()> {
        fs::create_dir_all(&self.home).await?;
        fs::write(
            self.home.join(DECK_CONFIG_FILENAME),
            serde_yaml::to_string(self)?,
        )
        .await?;
        Ok(())
    }

    fn validate(&self) -> DeckcoreResult<()> {
        if self.bootstrap.get_attempts() == 0 {
            return Err(DeckcoreError::InvalidConfig(
                "bootstrap.attempts must be at least 1".to_string(),
            ));
        }

        if self.runtime.interpreter.is_empty() {
            return Err(DeckcoreError::InvalidConfig(
                "runtime.interpreter must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl RuntimeImage {
    /// The translator archive name for the configured version.
    pub fn box64_asset(&self) -> String {
        format!("box64-{}.tzst", self.box64_version)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for DeckConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for RuntimeImage {
    fn default() -> Self {
        Self::builder().build()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use crate::config::PerformancePreset;

    use super::*;

    #[tokio::test]
    async fn test_load_missing_config_uses_defaults() -> anyhow::Result<()> {
        let home = tempdir()?;
        let config = DeckConfig::load(home.path()).await?;

        assert_eq!(config.get_home(), home.path());
        assert_eq!(config.get_runtime(), &RuntimeImage::default());
        assert_eq!(config.get_runtime().box64_asset(), "box64-0.3.2.tzst");
        assert_eq!(config.get_mono_url().as_deref(), Some(DEFAULT_MONO_URL));

        Ok(())
    }

    #[tokio::test]
    async fn test_load_partial_config() -> anyhow::Result<()> {
        let home = tempdir()?;
        std::fs::write(
            home.path().join(DECK_CONFIG_FILENAME),
            r#"
runtime:
  box64_version: "0.3.4"
bootstrap:
  attempts: 2
mono_url: null
container_defaults:
  performance_preset: stability
"#,
        )?;

        let config = DeckConfig::load(home.path()).await?;

        assert_eq!(config.get_runtime().get_box64_version(), "0.3.4");
        assert_eq!(config.get_runtime().get_image_version(), DEFAULT_IMAGE_VERSION);
        assert_eq!(config.get_bootstrap().get_attempts(), 2);
        assert_eq!(config.get_mono_url(), &None);
        assert_eq!(
            config.get_container_defaults().get_performance_preset(),
            PerformancePreset::Stability
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_load_rejects_zero_attempts() -> anyhow::Result<()> {
        let home = tempdir()?;
        std::fs::write(
            home.path().join(DECK_CONFIG_FILENAME),
            "bootstrap:\n  attempts: 0\n",
        )?;

        assert!(matches!(
            DeckConfig::load(home.path()).await,
            Err(DeckcoreError::InvalidConfig(_))
        ));

        Ok(())
    }

    #[tokio::test]
    async fn test_save_round_trips_through_load() -> anyhow::Result<()> {
        let home = tempdir()?;
        let config = DeckConfig::builder().home(home.path()).mono_url(None).build();
        config.save().await?;

        assert_eq!(DeckConfig::load(home.path()).await?, config);
        Ok(())
    }
}
