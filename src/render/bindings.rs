//! Per-frame texture and uniform binding for one shader.

use crate::audio::{AudioFeatureSet, AudioSpectrum};
use crate::config::{AudioTextureKind, ShaderConfig, TextureSource, AUDIO_TEXTURE_CHANNEL};
use crate::frame::VideoFrame;
use crate::shader::{ShaderPipeline, UniformValue};
use crate::texture::{self, CachedTexture, SourceKind, TextureCache, TextureKey};
use anyhow::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Decodes a whole video at a given size, for ping-pong channels.
pub type VideoLoader = Box<dyn Fn(&Path, u32, u32) -> Result<Vec<VideoFrame>> + Send>;

/// Everything needed to set up the shader's inputs for frame `i`.
///
/// Owns the job's texture cache, so cached textures live exactly as long as the job.
pub struct FrameBinder {
    config: ShaderConfig,
    channel_textures: Vec<(usize, TextureSource)>,
    textures_dir: PathBuf,
    resolution: (u32, u32),
    frame_rate: f64,
    features: Option<AudioFeatureSet>,
    spectrum: Option<AudioSpectrum>,
    overrides: Vec<(String, Vec<f32>)>,
    cache: TextureCache,
    video_loader: VideoLoader,
}

impl FrameBinder {
    pub fn new(config: ShaderConfig, textures_dir: impl Into<PathBuf>, resolution: (u32, u32), frame_rate: f64) -> Self {
        Self {
            channel_textures: config.channel_textures(),
            config,
            textures_dir: textures_dir.into(),
            resolution,
            frame_rate,
            features: None,
            spectrum: None,
            overrides: Vec::new(),
            cache: TextureCache::new(),
            video_loader: Box::new(crate::video::decode_all),
        }
    }

    /// Per-frame audio features; without them no audio uniforms are set.
    pub fn with_features(mut self, features: AudioFeatureSet) -> Self {
        self.features = Some(features);
        self
    }

    pub fn with_spectrum(mut self, spectrum: AudioSpectrum) -> Self {
        self.spectrum = Some(spectrum);
        self
    }

    /// User uniform values applied after everything else. Non-numeric text is dropped.
    pub fn with_overrides(mut self, overrides: &BTreeMap<String, UniformValue>) -> Self {
        self.overrides = overrides
            .iter()
            .filter_map(|(name, value)| match value.components() {
                Some(components) => Some((name.clone(), components)),
                None => {
                    warn!("Ignoring non-numeric uniform override {}={:?}", name, value);
                    None
                }
            })
            .collect();
        self
    }

    pub fn with_video_loader(mut self, loader: VideoLoader) -> Self {
        self.video_loader = loader;
        self
    }

    pub fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    pub fn config(&self) -> &ShaderConfig {
        &self.config
    }

    pub fn cache(&self) -> &TextureCache {
        &self.cache
    }

    /// Binds the input frame, audio and auxiliary textures, then sets uniforms.
    pub fn bind(&mut self, pipeline: &mut dyn ShaderPipeline, index: usize, frame: &VideoFrame) -> Result<()> {
        pipeline.clear_channels();

        let primary = self.config.primary_video_channel;
        if self.config.flip_video_channel {
            pipeline.bind_frame(primary, &frame.flip_vertical())?;
        } else {
            pipeline.bind_frame(primary, frame)?;
        }

        if self.config.needs_audio_texture {
            let audio_texture = self.audio_texture(index);
            pipeline.bind_frame(AUDIO_TEXTURE_CHANNEL, &audio_texture)?;
        }

        self.bind_auxiliary(pipeline, index);
        self.set_uniforms(pipeline, index)
    }

    fn audio_texture(&self, index: usize) -> VideoFrame {
        match (&self.spectrum, self.config.audio_texture) {
            (Some(spectrum), AudioTextureKind::Fft) => texture::spectrum_texture(&spectrum.row(index)),
            _ => match &self.features {
                Some(features) => texture::band_texture(features, index),
                None => texture::band_texture(&AudioFeatureSet::zeros(0), index),
            },
        }
    }

    fn bind_auxiliary(&mut self, pipeline: &mut dyn ShaderPipeline, index: usize) {
        for (channel, source) in &self.channel_textures {
            let channel = *channel;
            // The input video and the audio texture take precedence over configured files.
            if channel == self.config.primary_video_channel {
                continue;
            }
            if channel == AUDIO_TEXTURE_CHANNEL && self.config.needs_audio_texture {
                continue;
            }

            let path = self.textures_dir.join(source.file_name());
            let result = match source {
                TextureSource::Image(name) => {
                    let key = TextureKey::new(channel, SourceKind::Static, name.as_str());
                    let entry = self.cache.get_or_load(key, || {
                        let image = VideoFrame::load(&path)?;
                        Ok(CachedTexture::Gpu(pipeline.upload_texture(&image)?))
                    });
                    match entry {
                        CachedTexture::Gpu(id) => pipeline.bind_texture(channel, *id),
                        _ => Ok(()),
                    }
                }
                TextureSource::PingPong(name) => {
                    let key = TextureKey::new(channel, SourceKind::PingPong, name.as_str());
                    let (width, height) = self.resolution;
                    let loader = &self.video_loader;
                    let entry = self.cache.get_or_load(key, || {
                        let frames = loader(&path, width, height)?;
                        Ok(CachedTexture::Frames(Arc::new(frames)))
                    });
                    match entry {
                        CachedTexture::Frames(frames) if !frames.is_empty() => {
                            let position = texture::ping_pong_index(index, frames.len());
                            pipeline.bind_frame(channel, &frames[position])
                        }
                        _ => Ok(()),
                    }
                }
            };
            if let Err(e) = result {
                warn!("Failed to bind {:?} to channel {}: {:#}", source.file_name(), channel, e);
            }
        }
    }

    fn set_uniforms(&self, pipeline: &mut dyn ShaderPipeline, index: usize) -> Result<()> {
        let (width, height) = self.resolution;
        if let Some(components) = pipeline.uniform_components("iResolution") {
            let resolution = [width as f32, height as f32, 1.0, 0.0];
            let used = (components as usize).clamp(1, resolution.len());
            pipeline.set_uniform("iResolution", &resolution[..used])?;
        }
        if pipeline.uniform_components("iTime") == Some(1) {
            pipeline.set_uniform("iTime", &[(index as f64 / self.frame_rate) as f32])?;
        }

        if let Some(features) = &self.features {
            for (name, value) in features.frame_values(index) {
                if pipeline.uniform_components(name) == Some(1) {
                    pipeline.set_uniform(name, &[value])?;
                }
            }
        }

        for (name, values) in &self.overrides {
            if let Err(e) = pipeline.set_uniform(name, values) {
                warn!("Skipping uniform override {}: {:#}", name, e);
            }
        }
        Ok(())
    }
}
