//! Configuration module for the Vela compositor.
//!
//! Handles loading, parsing, and managing compositor configuration
//! from TOML files.

use crate::geometry::Transform;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure for the compositor
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CompositorConfig {
    /// General compositor settings
    pub general: GeneralConfig,
    /// Keyboard settings
    pub keyboard: KeyboardConfig,
    /// Mouse/pointer settings
    pub pointer: PointerConfig,
    /// Tiling and snapping settings consumed by the layout policy
    pub tiling: TilingConfig,
    /// Per-output overrides applied at hot-plug
    pub outputs: OutputsConfig,
}

/// General compositor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    pub log_level: String,
    /// Display backend: "auto", "headless"
    pub backend: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            backend: "auto".to_string(),
        }
    }
}

/// Keyboard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyboardConfig {
    /// XKB rule set
    pub rules: String,
    /// XKB model
    pub model: String,
    /// XKB layout
    pub layout: String,
    /// XKB variant
    pub variant: String,
    /// XKB options
    pub options: String,
    /// Repeat delay in ms
    pub repeat_delay: u32,
    /// Repeat rate in chars/sec
    pub repeat_rate: u32,
}

impl Default for KeyboardConfig {
    fn default() -> Self {
        Self {
            rules: "evdev".to_string(),
            model: "pc105".to_string(),
            layout: "us".to_string(),
            variant: String::new(),
            options: String::new(),
            repeat_delay: 200,
            repeat_rate: 40,
        }
    }
}

/// Pointer/mouse configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PointerConfig {
    /// Acceleration speed (-1.0 to 1.0)
    pub accel_speed: f64,
    /// Natural scrolling
    pub natural_scroll: bool,
    /// Left-handed mode
    pub left_handed: bool,
}

impl Default for PointerConfig {
    fn default() -> Self {
        Self {
            accel_speed: 0.0,
            natural_scroll: false,
            left_handed: false,
        }
    }
}

/// Tiling and snapping settings. The layout policy consumes these; the
/// compositor itself only forwards them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TilingConfig {
    /// Gap between windows and workspace edges in pixels
    pub gap: i32,
    /// Distance in pixels at which interactive moves snap
    pub snap_distance: i32,
    /// Focus follows the pointer without clicks
    pub focus_follows_mouse: bool,
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            gap: 8,
            snap_distance: 16,
            focus_follows_mouse: false,
        }
    }
}

/// Output overrides
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OutputsConfig {
    /// Default scale for outputs without an explicit entry
    pub default_scale: f64,
    /// Output-specific configurations
    pub entries: Vec<OutputEntry>,
}

/// Individual output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputEntry {
    /// Output name/identifier
    pub name: String,
    /// Enable this output
    pub enabled: bool,
    /// Position on the virtual screen
    pub position: Option<(i32, i32)>,
    /// Scale factor for this output
    pub scale: Option<f64>,
    /// Output transform
    pub transform: Option<Transform>,
}

impl CompositorConfig {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            tracing::info!("No config file found, using defaults");
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;
        self.save_to_file(&config_path)
    }

    /// Save configuration to a specific file
    pub fn save_to_file(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Get the default configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?;

        Ok(config_dir.join("vela").join("compositor.toml"))
    }

    /// Reload configuration from disk
    pub fn reload(&mut self) -> Result<()> {
        let new_config = Self::load()?;
        *self = new_config;
        Ok(())
    }

    /// The override entry for a named output, if any.
    pub fn output_entry(&self, name: &str) -> Option<&OutputEntry> {
        self.outputs.entries.iter().find(|entry| entry.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CompositorConfig::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.keyboard.layout, "us");
        assert_eq!(config.keyboard.repeat_delay, 200);
        assert_eq!(config.keyboard.repeat_rate, 40);
        assert_eq!(config.tiling.gap, 8);
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = CompositorConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: CompositorConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.keyboard.layout, parsed.keyboard.layout);
        assert_eq!(config.tiling.snap_distance, parsed.tiling.snap_distance);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let parsed: CompositorConfig = toml::from_str(
            r#"
            [keyboard]
            layout = "de"
            repeat_delay = 300
            "#,
        )
        .unwrap();
        assert_eq!(parsed.keyboard.layout, "de");
        assert_eq!(parsed.keyboard.repeat_delay, 300);
        // Untouched sections keep their defaults.
        assert_eq!(parsed.keyboard.model, "pc105");
        assert_eq!(parsed.tiling.gap, 8);
    }

    #[test]
    fn test_output_entry_lookup() {
        let parsed: CompositorConfig = toml::from_str(
            r#"
            [[outputs.entries]]
            name = "DP-1"
            enabled = true
            position = [1920, 0]
            scale = 1.5
            transform = "rotated90"
            "#,
        )
        .unwrap();
        let entry = parsed.output_entry("DP-1").unwrap();
        assert_eq!(entry.position, Some((1920, 0)));
        assert_eq!(entry.scale, Some(1.5));
        assert_eq!(entry.transform, Some(Transform::Rotated90));
        assert!(parsed.output_entry("HDMI-1").is_none());
    }
}
