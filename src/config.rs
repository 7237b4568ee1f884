// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Configuration consumed by the layer and its stages.
//!
//! Persistence lives outside this crate. The layer only needs typed reads,
//! change detection and default registration, which [ConfigProvider] describes.
//! [MemoryConfig] is the in-process store used by default and in tests.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

/// Keys understood by the layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Setting {
    ScalingType,
    /// Upscaling factor in percent. 150 renders the application at 2/3 of the display resolution.
    Scaling,
    /// Sharpening strength in percent.
    Sharpness,
    /// Field of view zoom in percent.
    Fov,
    /// Inter-camera distance in tenths of a millimeter. 0 means "not measured yet".
    Icd,
    /// Percentage of the runtime's predicted latency that is kept.
    PredictionDampen,
    PreProcess,
    PostProcess,
    ScreenshotEnabled,
}

impl Setting {
    pub const ALL: [Setting; 9] = [
        Setting::ScalingType,
        Setting::Scaling,
        Setting::Sharpness,
        Setting::Fov,
        Setting::Icd,
        Setting::PredictionDampen,
        Setting::PreProcess,
        Setting::PostProcess,
        Setting::ScreenshotEnabled,
    ];

    pub const fn key(self) -> &'static str {
        match self {
            Setting::ScalingType => "scaling_type",
            Setting::Scaling => "scaling",
            Setting::Sharpness => "sharpness",
            Setting::Fov => "fov",
            Setting::Icd => "icd",
            Setting::PredictionDampen => "prediction_dampen",
            Setting::PreProcess => "pre_process",
            Setting::PostProcess => "post_process",
            Setting::ScreenshotEnabled => "screenshot_enabled",
        }
    }

    pub const fn default_value(self) -> i32 {
        match self {
            Setting::ScalingType => ScalingType::None as i32,
            Setting::Scaling => 100,
            Setting::Sharpness => 20,
            Setting::Fov => 100,
            Setting::Icd => 0,
            Setting::PredictionDampen => 100,
            Setting::PreProcess => 0,
            Setting::PostProcess => 1,
            Setting::ScreenshotEnabled => 1,
        }
    }
}

/// An enum stored as an integer setting.
pub trait ConfigEnum: Copy {
    fn from_value(value: i32) -> Option<Self>;
    fn to_value(self) -> i32;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalingType {
    None = 0,
    Fsr = 1,
}

impl ScalingType {
    /// Tag used in screenshot file names.
    pub const fn name(self) -> Option<&'static str> {
        match self {
            ScalingType::None => None,
            ScalingType::Fsr => Some("FSR"),
        }
    }
}

impl ConfigEnum for ScalingType {
    fn from_value(value: i32) -> Option<Self> {
        match value {
            0 => Some(ScalingType::None),
            1 => Some(ScalingType::Fsr),
            _ => None,
        }
    }

    fn to_value(self) -> i32 {
        self as i32
    }
}

/// Key/value store with change detection.
///
/// Changes become visible through [ConfigProvider::has_changed] after the next
/// [ConfigProvider::tick], which the layer calls once per frame before
/// refreshing its stages.
pub trait ConfigProvider {
    fn value(&self, setting: Setting) -> i32;
    fn set_value(&self, setting: Setting, value: i32);
    /// Registers the value returned until one is explicitly set.
    fn set_default(&self, setting: Setting, value: i32);
    fn has_changed(&self, setting: Setting) -> bool;
    fn tick(&self);
}

/// Typed helpers available on every provider, including `dyn ConfigProvider`.
pub trait ConfigProviderExt: ConfigProvider {
    fn enum_value<T: ConfigEnum>(&self, setting: Setting) -> Option<T> {
        T::from_value(self.value(setting))
    }

    fn set_enum_default<T: ConfigEnum>(&self, setting: Setting, value: T) {
        self.set_default(setting, value.to_value())
    }

    fn flag(&self, setting: Setting) -> bool {
        self.value(setting) != 0
    }
}

impl<P: ConfigProvider + ?Sized> ConfigProviderExt for P {}

#[derive(Debug, Default)]
struct Store {
    values: HashMap<Setting, i32>,
    defaults: HashMap<Setting, i32>,
    pending: HashSet<Setting>,
    changed: HashSet<Setting>,
}

/// In-memory [ConfigProvider].
///
/// A fresh store reports every setting as changed until the first tick, so stages
/// built on the first frame see their initial values as changes.
#[derive(Debug)]
pub struct MemoryConfig {
    store: RefCell<Store>,
}

impl MemoryConfig {
    pub fn new() -> Self {
        let mut store = Store::default();
        for setting in Setting::ALL {
            store.defaults.insert(setting, setting.default_value());
            store.changed.insert(setting);
        }
        MemoryConfig {
            store: RefCell::new(store),
        }
    }

    pub fn with_values(values: &[(Setting, i32)]) -> Self {
        let config = Self::new();
        {
            let mut store = config.store.borrow_mut();
            for (setting, value) in values {
                store.values.insert(*setting, *value);
            }
        }
        config
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigProvider for MemoryConfig {
    fn value(&self, setting: Setting) -> i32 {
        let store = self.store.borrow();
        store
            .values
            .get(&setting)
            .or_else(|| store.defaults.get(&setting))
            .copied()
            .unwrap_or_else(|| setting.default_value())
    }

    fn set_value(&self, setting: Setting, value: i32) {
        let mut store = self.store.borrow_mut();
        let old = store.values.insert(setting, value);
        if old != Some(value) {
            store.pending.insert(setting);
        }
    }

    fn set_default(&self, setting: Setting, value: i32) {
        let mut store = self.store.borrow_mut();
        let old = store.defaults.insert(setting, value);
        if old != Some(value) && !store.values.contains_key(&setting) {
            store.pending.insert(setting);
        }
    }

    fn has_changed(&self, setting: Setting) -> bool {
        self.store.borrow().changed.contains(&setting)
    }

    fn tick(&self) {
        let mut store = self.store.borrow_mut();
        store.changed = std::mem::take(&mut store.pending);
    }
}

/// Settings that are not user tunables.
#[derive(Debug, Clone)]
pub struct LayerSettings {
    pub application_name: String,
    /// Directory holding `FSR.hlsl`, `preprocess.hlsl` and `postprocess.hlsl`.
    pub shader_directory: PathBuf,
    pub screenshot_directory: PathBuf,
}

impl LayerSettings {
    pub fn new(application_name: impl Into<String>) -> Self {
        let home = std::env::var_os("LOCALAPPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        LayerSettings {
            application_name: application_name.into(),
            shader_directory: PathBuf::from("shaders"),
            screenshot_directory: home,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_shipping_layer() {
        let config = MemoryConfig::new();
        assert_eq!(config.enum_value::<ScalingType>(Setting::ScalingType), Some(ScalingType::None));
        assert_eq!(config.value(Setting::Scaling), 100);
        assert_eq!(config.value(Setting::Sharpness), 20);
        assert_eq!(config.value(Setting::Fov), 100);
        assert_eq!(config.value(Setting::PredictionDampen), 100);
        assert!(config.flag(Setting::PostProcess));
        assert!(!config.flag(Setting::PreProcess));
    }

    #[test]
    fn changes_surface_after_tick() {
        let config = MemoryConfig::new();
        assert!(config.has_changed(Setting::Sharpness));
        config.tick();
        assert!(!config.has_changed(Setting::Sharpness));

        config.set_value(Setting::Sharpness, 40);
        assert!(!config.has_changed(Setting::Sharpness));
        config.tick();
        assert!(config.has_changed(Setting::Sharpness));
        assert_eq!(config.value(Setting::Sharpness), 40);
        config.tick();
        assert!(!config.has_changed(Setting::Sharpness));
    }

    #[test]
    fn writing_the_same_value_is_not_a_change() {
        let config = MemoryConfig::with_values(&[(Setting::Fov, 90)]);
        config.tick();
        config.set_value(Setting::Fov, 90);
        config.tick();
        assert!(!config.has_changed(Setting::Fov));
    }

    #[test]
    fn explicit_values_shadow_defaults() {
        let config = MemoryConfig::with_values(&[(Setting::Scaling, 150)]);
        config.set_default(Setting::Scaling, 120);
        assert_eq!(config.value(Setting::Scaling), 150);
        config.set_enum_default(Setting::ScalingType, ScalingType::Fsr);
        assert_eq!(config.enum_value::<ScalingType>(Setting::ScalingType), Some(ScalingType::Fsr));
    }
}
