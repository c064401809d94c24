// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if the config file is missing or has errors.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub pacing: PacingConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "vkframe".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub frames_in_flight: usize,
    pub msaa_samples: u32,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "auto".to_string(),
            clear_color: [0.05, 0.07, 0.12, 1.0],
            frames_in_flight: 2,
            msaa_samples: 4,
        }
    }
}

/// Frame pacing settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub target_fps: f64,
    pub uncapped: bool,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            target_fps: 240.0,
            uncapped: false,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            show_fps: true,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Requested present mode; None means let the swapchain pick.
    pub fn preferred_present_mode(&self) -> Option<ash::vk::PresentModeKHR> {
        use ash::vk::PresentModeKHR;
        match self.graphics.present_mode.to_lowercase().as_str() {
            "auto" => None,
            "immediate" => Some(PresentModeKHR::IMMEDIATE),
            "mailbox" => Some(PresentModeKHR::MAILBOX),
            "fifo" => Some(PresentModeKHR::FIFO),
            "fifo_relaxed" => Some(PresentModeKHR::FIFO_RELAXED),
            other => {
                log::warn!("Unknown present mode '{}', using automatic choice", other);
                None
            }
        }
    }

    /// Pacer rate; None means uncapped.
    pub fn target_fps(&self) -> Option<f64> {
        if self.pacing.uncapped {
            None
        } else {
            Some(self.pacing.target_fps)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.window.height, 720);
        assert_eq!(config.graphics.frames_in_flight, 2);
        assert_eq!(config.preferred_present_mode(), None);
        assert!(config.target_fps().is_some());
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: Config = toml::from_str(
            r#"
            [graphics]
            present_mode = "mailbox"
            msaa_samples = 8
            "#,
        )
        .unwrap();
        assert_eq!(
            config.preferred_present_mode(),
            Some(vk::PresentModeKHR::MAILBOX)
        );
        assert_eq!(config.graphics.msaa_samples, 8);
        assert_eq!(config.window.title, "vkframe");
    }

    #[test]
    fn present_mode_names_map_to_vulkan() {
        let mut config = Config::default();
        for (name, expected) in [
            ("immediate", vk::PresentModeKHR::IMMEDIATE),
            ("FIFO", vk::PresentModeKHR::FIFO),
            ("fifo_relaxed", vk::PresentModeKHR::FIFO_RELAXED),
        ] {
            config.graphics.present_mode = name.to_string();
            assert_eq!(config.preferred_present_mode(), Some(expected));
        }
        config.graphics.present_mode = "bogus".to_string();
        assert_eq!(config.preferred_present_mode(), None);
    }

    #[test]
    fn uncapped_pacing_disables_the_target() {
        let config: Config = toml::from_str(
            r#"
            [pacing]
            target_fps = 60.0
            uncapped = true
            "#,
        )
        .unwrap();
        assert_eq!(config.target_fps(), None);
    }
}
