//! Per-shader configuration and its resolution.
//!
//! Shader configuration lives in one JSON object keyed by shader file name.
//! Every entry is optional; missing entries and malformed files fall back to
//! defaults so a shader can always be rendered.

use crate::shader::UniformValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{error, info, warn};

/// Shaders whose camera-shake displacement needs an oversized render target.
const BUILTIN_SHAKE_SHADERS: &[&str] = &["EasyBeats.glsl", "BeatDropShake.glsl", "CameraShake.glsl"];

/// Scale factor applied to the base resolution for shake-compensated shaders.
pub const DEFAULT_OVERSAMPLE: f64 = 1.2;

/// Number of texture channels (`iChannel0`..`iChannel3`).
pub const CHANNEL_COUNT: usize = 4;

/// Channel that receives the audio-data texture.
pub const AUDIO_TEXTURE_CHANNEL: usize = 1;

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "webm", "avi", "mkv", "m4v"];

/// Which generator fills the audio-data texture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioTextureKind {
    /// Three-band energy spread across a fixed number of bins.
    #[default]
    Bands,
    /// Real FFT magnitudes, one spectrogram row per video frame.
    Fft,
}

/// Static descriptor for one shader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShaderConfig {
    pub audio_reactive: bool,
    pub needs_audio_texture: bool,
    /// Channel name (`iChannelN`) to file name under the textures directory.
    pub textures: BTreeMap<String, String>,
    /// Default uniform values, used by the preview sweep.
    pub uniforms: BTreeMap<String, UniformValue>,
    pub category: String,
    /// Channel the input video is bound to.
    pub primary_video_channel: usize,
    /// Flip the input video vertically before binding it.
    pub flip_video_channel: bool,
    /// Render oversized and downscale. `None` defers to the built-in list.
    pub shake_compensated: Option<bool>,
    pub audio_texture: AudioTextureKind,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            audio_reactive: true,
            needs_audio_texture: false,
            textures: BTreeMap::new(),
            uniforms: BTreeMap::new(),
            category: "unknown".to_string(),
            primary_video_channel: 0,
            flip_video_channel: false,
            shake_compensated: None,
            audio_texture: AudioTextureKind::Bands,
        }
    }
}

/// Where an auxiliary channel's pixels come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextureSource {
    /// A still image, decoded and uploaded once.
    Image(String),
    /// A video played forward then backward.
    PingPong(String),
}

impl TextureSource {
    fn from_file_name(name: &str) -> Self {
        let is_video = Path::new(name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_video {
            TextureSource::PingPong(name.to_string())
        } else {
            TextureSource::Image(name.to_string())
        }
    }

    pub fn file_name(&self) -> &str {
        match self {
            TextureSource::Image(name) | TextureSource::PingPong(name) => name,
        }
    }
}

impl ShaderConfig {
    pub fn is_shake_compensated(&self) -> bool {
        self.shake_compensated.unwrap_or(false)
    }

    /// Auxiliary textures ordered by channel. Entries with an unknown channel name are skipped.
    pub fn channel_textures(&self) -> Vec<(usize, TextureSource)> {
        let mut out = Vec::new();
        for (channel, file) in &self.textures {
            match parse_channel(channel) {
                Some(index) => out.push((index, TextureSource::from_file_name(file))),
                None => warn!("Ignoring texture {:?} for unknown channel {:?}", file, channel),
            }
        }
        out.sort_by_key(|(index, _)| *index);
        out
    }

    /// Resolution the shader renders at: base, or base times `oversample` when shake-compensated.
    pub fn working_resolution(&self, base: (u32, u32), oversample: f64) -> (u32, u32) {
        if self.is_shake_compensated() {
            (
                (base.0 as f64 * oversample).floor() as u32,
                (base.1 as f64 * oversample).floor() as u32,
            )
        } else {
            base
        }
    }
}

/// Parses `iChannelN` (or a bare `N`) into a channel index.
pub fn parse_channel(name: &str) -> Option<usize> {
    let digits = name.strip_prefix("iChannel").unwrap_or(name);
    let index: usize = digits.parse().ok()?;
    (index < CHANNEL_COUNT).then_some(index)
}

/// All shader configurations from one JSON file.
#[derive(Debug, Clone, Default)]
pub struct ShaderConfigSet {
    entries: BTreeMap<String, ShaderConfig>,
}

impl ShaderConfigSet {
    /// Loads the configuration file. Missing or malformed files yield an empty set.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Shader configuration {:?} not readable ({}), using defaults", path, e);
                return Self::default();
            }
        };
        match Self::from_json(&content) {
            Ok(set) => {
                info!("Loaded configuration for {} shader(s) from {:?}", set.entries.len(), path);
                set
            }
            Err(e) => {
                error!("Failed to parse shader configuration {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    pub fn from_json(content: &str) -> serde_json::Result<Self> {
        let entries: BTreeMap<String, ShaderConfig> = serde_json::from_str(content)?;
        Ok(Self { entries })
    }

    /// Resolves the descriptor for `shader_name`, filling in built-in behaviour.
    pub fn resolve(&self, shader_name: &str) -> ShaderConfig {
        let mut config = match self.entries.get(shader_name) {
            Some(config) => {
                info!("Loaded configuration for shader: {}", shader_name);
                config.clone()
            }
            None => {
                info!("No specific configuration found for shader: {}", shader_name);
                ShaderConfig::default()
            }
        };
        if config.shake_compensated.is_none() {
            config.shake_compensated = Some(BUILTIN_SHAKE_SHADERS.contains(&shader_name));
        }
        config
    }

    pub fn contains(&self, shader_name: &str) -> bool {
        self.entries.contains_key(shader_name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ShaderConfig)> {
        self.entries.iter().map(|(name, config)| (name.as_str(), config))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keeps only shaders in `category` (case-insensitive).
    pub fn filter_category(&self, category: &str) -> Self {
        let entries = self
            .entries
            .iter()
            .filter(|(_, config)| config.category.eq_ignore_ascii_case(category))
            .map(|(name, config)| (name.clone(), config.clone()))
            .collect();
        Self { entries }
    }

    /// Distinct categories, sorted.
    pub fn categories(&self) -> Vec<String> {
        let mut categories: Vec<String> = self.entries.values().map(|c| c.category.clone()).collect();
        categories.sort();
        categories.dedup();
        categories
    }
}
