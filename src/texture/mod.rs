//! Texture provisioning: cached static images, ping-pong video and per-frame audio textures.

use crate::audio::{AudioFeatureSet, Feature, SPECTRUM_BINS};
use crate::frame::{PixelFormat, VideoFrame};
use crate::shader::TextureId;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Width of the band-distribution audio texture.
pub const BAND_TEXTURE_WIDTH: u32 = 512;

/// Which kind of source a cache entry was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Static,
    PingPong,
}

/// Cache key: a channel, the source kind and the file it came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TextureKey {
    pub channel: usize,
    pub kind: SourceKind,
    pub id: String,
}

impl TextureKey {
    pub fn new(channel: usize, kind: SourceKind, id: impl Into<String>) -> Self {
        Self { channel, kind, id: id.into() }
    }
}

/// What a cache key resolved to.
#[derive(Debug, Clone)]
pub enum CachedTexture {
    /// Image uploaded to the pipeline.
    Gpu(TextureId),
    /// Every frame of a ping-pong video, in order.
    Frames(Arc<Vec<VideoFrame>>),
    /// The load failed; remembered so it is not retried every frame.
    Missing,
}

/// Per-job texture cache. Each key is loaded at most once.
#[derive(Debug, Default)]
pub struct TextureCache {
    entries: HashMap<TextureKey, CachedTexture>,
    loads: usize,
}

impl TextureCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry for `key`, running `load` only on the first request.
    ///
    /// A failed load is logged and cached as [`CachedTexture::Missing`].
    pub fn get_or_load<F>(&mut self, key: TextureKey, load: F) -> &CachedTexture
    where
        F: FnOnce() -> Result<CachedTexture>,
    {
        let loads = &mut self.loads;
        self.entries.entry(key).or_insert_with_key(|key| {
            *loads += 1;
            match load() {
                Ok(entry) => {
                    debug!("Loaded {:?} texture {:?} for channel {}", key.kind, key.id, key.channel);
                    entry
                }
                Err(e) => {
                    warn!("Failed to load texture {:?} for channel {}: {}", key.id, key.channel, e);
                    CachedTexture::Missing
                }
            }
        })
    }

    /// Number of load attempts made.
    pub fn loads(&self) -> usize {
        self.loads
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Index into an `n`-frame sequence played forward then backward without repeating endpoints.
pub fn ping_pong_index(frame: usize, n: usize) -> usize {
    if n <= 1 {
        return 0;
    }
    let cycle = 2 * (n - 1);
    let position = frame % cycle;
    if position < n {
        position
    } else {
        cycle - position
    }
}

fn level_byte(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn gaussian(x: f32, centre: f32, width: f32) -> f32 {
    (-((x - centre) / width).powi(2)).exp()
}

/// Two-row audio texture built from one frame of features.
///
/// Row 0 is a spectrum-like curve with bass, mid and treble humps; row 1 is a
/// waveform-like line whose amplitude follows loudness.
pub fn band_texture(features: &AudioFeatureSet, frame: usize) -> VideoFrame {
    let bass = features.value(Feature::Bass, frame);
    let mid = features.value(Feature::Mid, frame);
    let treble = features.value(Feature::Treble, frame);
    let rms = features.value(Feature::Rms, frame);

    let width = BAND_TEXTURE_WIDTH;
    let mut texture = VideoFrame::new(width, 2, PixelFormat::Rgba);
    let phase = frame as f32 * 0.3;
    for x in 0..width as usize {
        let t = x as f32 / width as f32;
        let spectrum = bass * gaussian(t, 0.05, 0.08) + mid * gaussian(t, 0.3, 0.15) + treble * gaussian(t, 0.7, 0.2);
        let wave = 0.5 + 0.5 * rms.min(1.0) * (2.0 * std::f32::consts::PI * 4.0 * t + phase).sin();
        for (row, value) in [(0usize, spectrum), (1, wave)] {
            let offset = (row * width as usize + x) * 4;
            let byte = level_byte(value);
            texture.data[offset..offset + 4].copy_from_slice(&[byte, byte, byte, 255]);
        }
    }
    texture
}

/// Single-row texture holding one spectrum row.
pub fn spectrum_texture(row: &[f32; SPECTRUM_BINS]) -> VideoFrame {
    let data = row.iter().flat_map(|v| {
        let byte = level_byte(*v);
        [byte, byte, byte, 255]
    });
    VideoFrame::from_data(SPECTRUM_BINS as u32, 1, PixelFormat::Rgba, data.collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::ReactivitySettings;
    use anyhow::anyhow;

    #[test]
    fn ping_pong_reflects_without_repeating_endpoints() {
        let indices: Vec<usize> = (0..10).map(|i| ping_pong_index(i, 5)).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 3, 2, 1, 0, 1]);
    }

    #[test]
    fn ping_pong_degenerate_sequences() {
        assert!((0..6).all(|i| ping_pong_index(i, 0) == 0));
        assert!((0..6).all(|i| ping_pong_index(i, 1) == 0));
        assert_eq!((0..4).map(|i| ping_pong_index(i, 2)).collect::<Vec<_>>(), vec![0, 1, 0, 1]);
    }

    #[test]
    fn same_key_loads_once() {
        let mut cache = TextureCache::new();
        let mut calls = 0;
        for _ in 0..5 {
            let entry = cache.get_or_load(TextureKey::new(2, SourceKind::Static, "noise.png"), || {
                calls += 1;
                Ok(CachedTexture::Gpu(TextureId(7)))
            });
            assert!(matches!(entry, CachedTexture::Gpu(TextureId(7))));
        }
        assert_eq!(calls, 1);
        assert_eq!(cache.loads(), 1);
    }

    #[test]
    fn keys_differ_by_channel_and_kind() {
        let mut cache = TextureCache::new();
        cache.get_or_load(TextureKey::new(2, SourceKind::Static, "a.png"), || Ok(CachedTexture::Gpu(TextureId(0))));
        cache.get_or_load(TextureKey::new(3, SourceKind::Static, "a.png"), || Ok(CachedTexture::Gpu(TextureId(1))));
        cache.get_or_load(TextureKey::new(3, SourceKind::PingPong, "a.png"), || {
            Ok(CachedTexture::Frames(Arc::new(Vec::new())))
        });
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn failed_load_is_remembered() {
        let mut cache = TextureCache::new();
        let key = TextureKey::new(1, SourceKind::Static, "missing.png");
        assert!(matches!(cache.get_or_load(key.clone(), || Err(anyhow!("not found"))), CachedTexture::Missing));
        assert!(matches!(cache.get_or_load(key, || Ok(CachedTexture::Gpu(TextureId(0)))), CachedTexture::Missing));
        assert_eq!(cache.loads(), 1);
    }

    #[test]
    fn band_texture_follows_features() {
        let raw: [Vec<f32>; 10] = std::array::from_fn(|i| if i == 0 { vec![0.0, 1.0] } else { vec![0.0, 0.0] });
        let features = AudioFeatureSet::from_series(raw, 2, &ReactivitySettings::default());

        let quiet = band_texture(&features, 0);
        let loud = band_texture(&features, 1);
        assert_eq!((loud.width, loud.height), (BAND_TEXTURE_WIDTH, 2));
        assert_eq!(loud.data.len(), loud.expected_len());
        assert_eq!(quiet.data[0], 0);
        assert!(loud.data[4 * 25] > 200);
        // Silent waveform sits at mid grey.
        let row1 = BAND_TEXTURE_WIDTH as usize * 4;
        assert_eq!(quiet.data[row1], 128);
    }

    #[test]
    fn spectrum_texture_is_one_row() {
        let mut row = [0.0; SPECTRUM_BINS];
        row[3] = 1.0;
        let texture = spectrum_texture(&row);
        assert_eq!((texture.width, texture.height), (SPECTRUM_BINS as u32, 1));
        assert_eq!(&texture.data[12..16], &[255, 255, 255, 255]);
        assert_eq!(texture.data[0], 0);
    }
}
