use std::{collections::HashMap, sync::RwLock};

use crate::config::ContainerConfig;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Settings key for the default screen resolution.
pub const SCREEN_RESOLUTION_KEY: &str = "container.screen_resolution";

/// Settings key for the default graphics wrapper.
pub const GRAPHICS_WRAPPER_KEY: &str = "container.graphics_wrapper";

/// Settings key for the default performance preset.
pub const PERFORMANCE_PRESET_KEY: &str = "container.performance_preset";

/// Settings key for the default WoW64 mode.
pub const WOW64_KEY: &str = "container.wow64";

/// Settings key for the default esync mode.
pub const ESYNC_KEY: &str = "container.esync";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A persistent key/value store owned by the host application.
pub trait SettingsStore: Send + Sync {
    /// Returns the value stored under `key`.
    fn get(&self, key: &str) -> Option<String>;

    /// Stores `value` under `key`.
    fn set(&self, key: &str, value: &str);
}

/// A [`SettingsStore`] that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: RwLock<HashMap<String, String>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MemorySettings {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContainerConfig {
    /// Builds a container configuration from stored user defaults.
    ///
    /// Keys that are absent or fail to parse keep the value from `base`.
    pub fn from_settings(store: &dyn SettingsStore, base: &ContainerConfig) -> ContainerConfig {
        let mut config = base.clone();

        if let Some(value) = parse_setting(store, SCREEN_RESOLUTION_KEY) {
            config.screen_resolution = value;
        }
        if let Some(value) = parse_setting(store, GRAPHICS_WRAPPER_KEY) {
            config.graphics_wrapper = value;
        }
        if let Some(value) = parse_setting(store, PERFORMANCE_PRESET_KEY) {
            config.performance_preset = value;
        }
        if let Some(value) = parse_setting(store, WOW64_KEY) {
            config.wow64 = value;
        }
        if let Some(value) = parse_setting(store, ESYNC_KEY) {
            config.esync = value;
        }

        config
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn parse_setting<T>(store: &dyn SettingsStore, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = store.get(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "ignoring unparsable setting");
            None
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .ok()
            .and_then(|values| values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) {
        if let Ok(mut values) = self.values.write() {
            values.insert(key.to_string(), value.to_string());
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::config::{GraphicsWrapper, PerformancePreset, ScreenResolution};

    use super::*;

    #[test]
    fn test_container_config_from_settings() {
        let store = MemorySettings::new();
        store.set(SCREEN_RESOLUTION_KEY, "1920x1080");
        store.set(GRAPHICS_WRAPPER_KEY, "wined3d");
        store.set(PERFORMANCE_PRESET_KEY, "turbo");
        store.set(ESYNC_KEY, "true");

        let config = ContainerConfig::from_settings(&store, &ContainerConfig::default());

        assert_eq!(
            config.get_screen_resolution(),
            ScreenResolution::new(1920, 1080)
        );
        assert_eq!(config.get_graphics_wrapper(), GraphicsWrapper::Wined3d);
        assert_eq!(
            config.get_performance_preset(),
            PerformancePreset::Compatibility
        );
        assert!(config.get_esync());
        assert!(config.get_wow64());
    }
}
