//! Project settings and shader discovery.
//!
//! Settings come from an optional YAML file; command-line flags override
//! individual fields afterwards.

use crate::audio::ReactivitySettings;
use crate::config::{ShaderConfigSet, DEFAULT_OVERSAMPLE};
use crate::pipeline::{DEFAULT_CRF, DEFAULT_RESOLUTION};
use crate::render::DEFAULT_PROGRESS_INTERVAL;
use crate::video::VideoStrategy;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Settings file picked up from the working directory when none is given.
pub const DEFAULT_SETTINGS_FILE: &str = "shadervid.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub shaders_dir: PathBuf,
    pub textures_dir: PathBuf,
    /// Shader configuration JSON; defaults to `shader_config.json` in `shaders_dir`.
    pub shader_config: Option<PathBuf>,
    pub width: u32,
    pub height: u32,
    /// Output frame rate; the input's rate when unset.
    pub frame_rate: Option<f64>,
    pub strategy: VideoStrategy,
    pub oversample: f64,
    pub progress_interval: usize,
    pub crf: u8,
    pub reactivity: ReactivitySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            shaders_dir: PathBuf::from("Shaders"),
            textures_dir: PathBuf::from("Textures"),
            shader_config: None,
            width: DEFAULT_RESOLUTION.0,
            height: DEFAULT_RESOLUTION.1,
            frame_rate: None,
            strategy: VideoStrategy::default(),
            oversample: DEFAULT_OVERSAMPLE,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            crf: DEFAULT_CRF,
            reactivity: ReactivitySettings::default(),
        }
    }
}

impl Settings {
    pub fn from_yaml(content: &str) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| anyhow!("Failed to read settings {:?}: {}", path, e))?;
        let settings = Self::from_yaml(&content).map_err(|e| anyhow!("Invalid settings {:?}: {}", path, e))?;
        info!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    /// Loads `path`, or the default settings file if it exists, or defaults.
    pub fn discover(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None if Path::new(DEFAULT_SETTINGS_FILE).is_file() => Self::load(Path::new(DEFAULT_SETTINGS_FILE)),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(anyhow!("Resolution must be non-zero, got {}x{}", self.width, self.height));
        }
        if !(self.oversample.is_finite() && self.oversample >= 1.0) {
            return Err(anyhow!("oversample must be at least 1.0, got {}", self.oversample));
        }
        if self.crf > 51 {
            return Err(anyhow!("crf must be in 0..=51, got {}", self.crf));
        }
        Ok(())
    }

    pub fn shader_config_path(&self) -> PathBuf {
        self.shader_config.clone().unwrap_or_else(|| self.shaders_dir.join("shader_config.json"))
    }

    pub fn load_shader_configs(&self) -> ShaderConfigSet {
        ShaderConfigSet::load(self.shader_config_path())
    }
}

/// Sorted file names of every `*.glsl` file directly inside `dir`.
pub fn discover_shaders(dir: &Path) -> Result<Vec<String>> {
    let entries = fs::read_dir(dir).map_err(|e| anyhow!("Failed to read shader directory {:?}: {}", dir, e))?;
    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("glsl")))
        .filter_map(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .collect();
    names.sort();
    Ok(names)
}

/// Mismatches between the configuration file and the shaders on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderInventory {
    /// Configured shaders with no `.glsl` file.
    pub missing: Vec<String>,
    /// `.glsl` files with no configuration entry.
    pub unconfigured: Vec<String>,
}

impl ShaderInventory {
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty() && self.unconfigured.is_empty()
    }
}

pub fn check_shaders(configs: &ShaderConfigSet, files: &[String]) -> ShaderInventory {
    let missing = configs.names().filter(|name| !files.iter().any(|f| f == name)).map(str::to_string).collect();
    let unconfigured = files.iter().filter(|f| !configs.contains(f)).cloned().collect();
    ShaderInventory { missing, unconfigured }
}
