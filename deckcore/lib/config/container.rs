use std::{collections::BTreeMap, fmt, str::FromStr};

use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    config::{DEFAULT_SCREEN_HEIGHT, DEFAULT_SCREEN_WIDTH},
    DeckcoreError,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The per-container settings chosen by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, Getters, CopyGetters)]
pub struct ContainerConfig {
    /// The resolution of the guest's virtual desktop.
    #[serde(default)]
    #[builder(default)]
    #[getset(get_copy = "pub with_prefix")]
    pub(super) screen_resolution: ScreenResolution,

    /// The Direct3D implementation used by the guest.
    #[serde(default)]
    #[builder(default)]
    #[getset(get_copy = "pub with_prefix")]
    pub(super) graphics_wrapper: GraphicsWrapper,

    /// How aggressively the binary translator is tuned for steady-state launches.
    #[serde(default)]
    #[builder(default)]
    #[getset(get_copy = "pub with_prefix")]
    pub(super) performance_preset: PerformancePreset,

    /// Environment variables merged over the computed environment.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[builder(default)]
    #[getset(get = "pub with_prefix")]
    pub(super) custom_env: BTreeMap<String, String>,

    /// Arguments appended to every guest launch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    #[getset(get = "pub with_prefix")]
    pub(super) custom_args: Vec<String>,

    /// Runs 32-bit guest code through the 64-bit compatibility layer.
    #[serde(default = "default_true")]
    #[builder(default = true)]
    #[getset(get_copy = "pub with_prefix")]
    pub(super) wow64: bool,

    /// Uses eventfd-based synchronization in the compatibility layer.
    #[serde(default)]
    #[builder(default)]
    #[getset(get_copy = "pub with_prefix")]
    pub(super) esync: bool,
}

/// The resolution of a guest virtual desktop, written as `WIDTHxHEIGHT`.
///
/// ## Examples
///
/// ```
/// use deckcore::config::ScreenResolution;
///
/// let resolution = "1920x1080".parse::<ScreenResolution>().unwrap();
/// assert_eq!(resolution, ScreenResolution::new(1920, 1080));
/// assert_eq!(resolution.to_string(), "1920x1080");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenResolution {
    width: u32,
    height: u32,
}

/// The Direct3D implementation a container uses.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphicsWrapper {
    /// Direct3D over Vulkan.
    #[default]
    Dxvk,

    /// The compatibility layer's built-in Direct3D over OpenGL.
    Wined3d,
}

/// Translator tuning presets applied to steady-state launches.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformancePreset {
    /// Strict memory ordering and no unsafe shortcuts.
    Stability,

    /// Safe defaults that run most titles correctly.
    #[default]
    Compatibility,

    /// Larger translation blocks with safe flag handling.
    Intermediate,

    /// Every throughput shortcut the translator offers.
    Performance,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ContainerConfig {
    /// Merges `env` over the custom environment, replacing existing keys.
    pub fn with_custom_env(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.custom_env.extend(env);
        self
    }
}

impl ScreenResolution {
    /// Creates a new resolution.
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Returns the width in pixels.
    pub fn get_width(&self) -> u32 {
        self.width
    }

    /// Returns the height in pixels.
    pub fn get_height(&self) -> u32 {
        self.height
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for ContainerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for ScreenResolution {
    fn default() -> Self {
        Self::new(DEFAULT_SCREEN_WIDTH, DEFAULT_SCREEN_HEIGHT)
    }
}

impl FromStr for ScreenResolution {
    type Err = DeckcoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DeckcoreError::InvalidConfig(format!("invalid screen resolution: {s:?}"));

        let (width, height) = s.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
        let width: u32 = width.parse().map_err(|_| invalid())?;
        let height: u32 = height.parse().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }

        Ok(Self { width, height })
    }
}

impl fmt::Display for ScreenResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl Serialize for ScreenResolution {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ScreenResolution {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl FromStr for GraphicsWrapper {
    type Err = DeckcoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dxvk" => Ok(Self::Dxvk),
            "wined3d" => Ok(Self::Wined3d),
            _ => Err(DeckcoreError::InvalidConfig(format!(
                "unknown graphics wrapper: {s:?}"
            ))),
        }
    }
}

impl fmt::Display for GraphicsWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dxvk => write!(f, "dxvk"),
            Self::Wined3d => write!(f, "wined3d"),
        }
    }
}

impl FromStr for PerformancePreset {
    type Err = DeckcoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stability" => Ok(Self::Stability),
            "compatibility" => Ok(Self::Compatibility),
            "intermediate" => Ok(Self::Intermediate),
            "performance" => Ok(Self::Performance),
            _ => Err(DeckcoreError::InvalidConfig(format!(
                "unknown performance preset: {s:?}"
            ))),
        }
    }
}

impl fmt::Display for PerformancePreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stability => write!(f, "stability"),
            Self::Compatibility => write!(f, "compatibility"),
            Self::Intermediate => write!(f, "intermediate"),
            Self::Performance => write!(f, "performance"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
