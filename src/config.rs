// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::SetupError;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub assets: AssetConfig,
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
            title: "Mip Renderer".to_string(),
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
    pub max_frames_in_flight: usize,
    pub present_mode: String,
    pub clear_color: [f32; 4],
    /// Upper bound; the device limit may lower it further.
    pub msaa_samples: u32,
    pub min_sample_shading: f32,
    pub require_discrete_gpu: bool,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            max_frames_in_flight: 2,
            present_mode: "mailbox".to_string(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            msaa_samples: 8,
            min_sample_shading: 0.2,
            require_discrete_gpu: true,
        }
    }
}

/// Asset locations, relative to the working directory
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AssetConfig {
    pub model: PathBuf,
    pub texture: PathBuf,
    pub vertex_shader: PathBuf,
    pub fragment_shader: PathBuf,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            model: PathBuf::from("assets/models/viking_room.obj"),
            texture: PathBuf::from("assets/textures/viking_room.png"),
            vertex_shader: PathBuf::from("shaders/shader.vert.spv"),
            fragment_shader: PathBuf::from("shaders/shader.frag.spv"),
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "renderer.log".to_string(),
            show_fps: true,
        }
    }
}

impl Config {
    /// Load `config.toml`, falling back to defaults. A file that exists but
    /// cannot be used comes back alongside the defaults so the caller can
    /// report it once logging is up.
    pub fn load() -> (Self, Option<anyhow::Error>) {
        Self::load_or_default("config.toml")
    }

    pub fn load_or_default<P: AsRef<Path>>(path: P) -> (Self, Option<anyhow::Error>) {
        match Self::load_from_path(path) {
            Ok(config) => (config, None),
            Err(e) => (Config::default(), Some(e)),
        }
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

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Reject values the renderer cannot run with.
    pub fn validate(&self) -> Result<(), SetupError> {
        if self.graphics.max_frames_in_flight == 0 {
            return Err(SetupError::InvalidConfig(
                "graphics.max_frames_in_flight must be at least 1".into(),
            ));
        }
        if self.window.width == 0 || self.window.height == 0 {
            return Err(SetupError::InvalidConfig(format!(
                "window size {}x{} has zero area",
                self.window.width, self.window.height
            )));
        }
        if !(0.0..=1.0).contains(&self.graphics.min_sample_shading) {
            return Err(SetupError::InvalidConfig(format!(
                "graphics.min_sample_shading {} is outside [0, 1]",
                self.graphics.min_sample_shading
            )));
        }
        Ok(())
    }

    /// The low-latency mode to try first. FIFO is the fallback when the
    /// surface doesn't offer it.
    pub fn preferred_present_mode(&self) -> vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to MAILBOX",
                    self.graphics.present_mode
                );
                vk::PresentModeKHR::MAILBOX
            }
        }
    }

    /// Validation layers are only ever enabled in debug builds.
    pub fn validation_enabled(&self) -> bool {
        cfg!(debug_assertions) && self.debug.validation_layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.graphics.max_frames_in_flight, 2);
        assert_eq!(config.preferred_present_mode(), vk::PresentModeKHR::MAILBOX);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml(
            r#"
            [graphics]
            max_frames_in_flight = 3
            present_mode = "FIFO"

            [assets]
            model = "cube.obj"
            "#,
        )
        .unwrap();

        assert_eq!(config.graphics.max_frames_in_flight, 3);
        assert_eq!(config.graphics.msaa_samples, 8);
        assert_eq!(config.preferred_present_mode(), vk::PresentModeKHR::FIFO);
        assert_eq!(config.assets.model, PathBuf::from("cube.obj"));
        assert_eq!(
            config.assets.texture,
            PathBuf::from("assets/textures/viking_room.png")
        );
        assert_eq!(config.window.width, 1280);
    }

    #[test]
    fn zero_frames_in_flight_is_rejected() {
        let config = Config::from_toml("[graphics]\nmax_frames_in_flight = 0").unwrap();
        assert!(matches!(
            config.validate(),
            Err(SetupError::InvalidConfig(_))
        ));
    }

    #[test]
    fn sample_shading_out_of_range_is_rejected() {
        let config = Config::from_toml("[graphics]\nmin_sample_shading = 1.5").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_present_mode_falls_back_to_mailbox() {
        let config = Config::from_toml("[graphics]\npresent_mode = \"vsync-please\"").unwrap();
        assert_eq!(config.preferred_present_mode(), vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(Config::from_toml("[graphics\nmax_frames_in_flight = 2").is_err());
    }

    #[test]
    fn malformed_file_falls_back_to_defaults_and_keeps_the_error() {
        let dir = std::env::temp_dir().join(format!("mip-renderer-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "[graphics\nmax_frames_in_flight = 5").unwrap();

        let (config, error) = Config::load_or_default(&path);
        assert_eq!(config.graphics.max_frames_in_flight, 2);
        let message = format!("{:#}", error.unwrap());
        assert!(message.contains("Failed to parse config file"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_file_gives_defaults_without_error() {
        let (config, error) = Config::load_or_default("definitely/not/here.toml");
        assert!(error.is_none());
        assert_eq!(config.graphics.max_frames_in_flight, 2);
    }
}
