// Backend settings - loaded from TOML
//
// Provides sensible defaults if the config file is missing or has errors.
// The engine's configuration loader hands this object to GfxBackend::initialize.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Root settings structure consumed by the backend
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct GfxSettings {
    pub graphics: GraphicsSettings,
    pub memory: MemorySettings,
    pub debug: DebugSettings,
}

/// Presentation and device-selection settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GraphicsSettings {
    /// Substring match against the physical-device name; empty picks the
    /// highest-scoring GPU (discrete preferred).
    pub preferred_gpu: String,
    pub vsync: bool,
    pub app_name: String,
}

impl Default for GraphicsSettings {
    fn default() -> Self {
        Self {
            preferred_gpu: String::new(),
            vsync: true,
            app_name: "GfxBackend".to_string(),
        }
    }
}

/// Arena ceilings, in megabytes. Sized once at init; exhaustion is a
/// budget-tuning problem, not a runtime retry.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MemorySettings {
    pub persistent_gpu_mb: u64,
    pub persistent_cpu_mb: u64,
    pub transient_cpu_mb: u64,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            persistent_gpu_mb: 512,
            persistent_cpu_mb: 64,
            transient_cpu_mb: 32,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DebugSettings {
    pub validation_layers: bool,
}

impl Default for DebugSettings {
    fn default() -> Self {
        Self { validation_layers: cfg!(debug_assertions) }
    }
}

impl GfxSettings {
    /// Load settings from a file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("gfx.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load gfx.toml: {}. Using defaults.", e);
            GfxSettings::default()
        })
    }

    /// Load settings from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Settings file not found at {:?}, using defaults", path);
            return Ok(GfxSettings::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {:?}", path))?;

        let settings: GfxSettings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse settings file: {:?}", path))?;

        log::info!("Loaded settings from {:?}", path);
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_file_missing() {
        let settings = GfxSettings::load_from_path("does/not/exist.toml").unwrap();
        assert!(settings.graphics.vsync);
        assert_eq!(settings.memory.persistent_gpu_mb, 512);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let settings: GfxSettings = toml::from_str(
            r#"
            [graphics]
            vsync = false

            [memory]
            transient_cpu_mb = 8
            "#,
        )
        .unwrap();
        assert!(!settings.graphics.vsync);
        assert_eq!(settings.memory.transient_cpu_mb, 8);
        assert_eq!(settings.memory.persistent_cpu_mb, 64);
    }
}
