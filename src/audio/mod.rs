//! Audio feature extraction.
//!
//! Turns an audio track into ten per-frame series that drive shader uniforms.
//! Extraction never fails: a track that cannot be fully analysed degrades to
//! loudness only, and a track that cannot be read at all yields silence.

pub mod analysis;
pub mod decode;
pub mod spectrum;

pub use decode::AudioTrack;
pub use spectrum::{AudioSpectrum, SPECTRUM_BINS};

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Upper clip bound of every feature value.
pub const MAX_FEATURE_LEVEL: f32 = 2.0;

/// One named per-frame audio descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    Bass,
    Mid,
    Treble,
    Beat,
    Kick,
    TempoBeat,
    Brightness,
    Energy,
    Percussive,
    Rms,
}

impl Feature {
    pub const ALL: [Feature; 10] = [
        Feature::Bass,
        Feature::Mid,
        Feature::Treble,
        Feature::Beat,
        Feature::Kick,
        Feature::TempoBeat,
        Feature::Brightness,
        Feature::Energy,
        Feature::Percussive,
        Feature::Rms,
    ];

    /// Uniform name the shader declares to receive this feature.
    pub fn uniform_name(self) -> &'static str {
        match self {
            Feature::Bass => "bassLevel",
            Feature::Mid => "midLevel",
            Feature::Treble => "trebleLevel",
            Feature::Beat => "beatLevel",
            Feature::Kick => "kickLevel",
            Feature::TempoBeat => "tempoBeatLevel",
            Feature::Brightness => "brightnessLevel",
            Feature::Energy => "energyLevel",
            Feature::Percussive => "percussiveLevel",
            Feature::Rms => "rmsLevel",
        }
    }

    pub fn from_uniform_name(name: &str) -> Option<Feature> {
        Feature::ALL.into_iter().find(|f| f.uniform_name() == name)
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Named intensity profile scaling every feature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReactivityPreset {
    None,
    Subtle,
    #[default]
    Moderate,
    Intense,
}

impl ReactivityPreset {
    pub fn scale(self) -> f32 {
        match self {
            ReactivityPreset::None => 0.0,
            ReactivityPreset::Subtle => 0.5,
            ReactivityPreset::Moderate => 1.0,
            ReactivityPreset::Intense => 1.5,
        }
    }
}

/// User sensitivity settings applied after analysis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactivitySettings {
    pub preset: ReactivityPreset,
    /// Multiplier on the beat, kick, tempo-beat and percussive series.
    pub beat_sensitivity: f32,
    pub bass_response: f32,
    pub mid_response: f32,
    pub treble_response: f32,
}

impl Default for ReactivitySettings {
    fn default() -> Self {
        Self {
            preset: ReactivityPreset::Moderate,
            beat_sensitivity: 1.0,
            bass_response: 1.0,
            mid_response: 1.0,
            treble_response: 1.0,
        }
    }
}

impl ReactivitySettings {
    /// Settings that silence every feature.
    pub fn none() -> Self {
        Self { preset: ReactivityPreset::None, ..Self::default() }
    }

    fn multiplier(&self, feature: Feature) -> f32 {
        let response = match feature {
            Feature::Bass => self.bass_response,
            Feature::Mid => self.mid_response,
            Feature::Treble => self.treble_response,
            Feature::Beat | Feature::Kick | Feature::TempoBeat | Feature::Percussive => self.beat_sensitivity,
            Feature::Brightness | Feature::Energy | Feature::Rms => 1.0,
        };
        response * self.preset.scale()
    }
}

/// Ten per-frame series, each exactly `frames` long with values in `[0, 2]`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFeatureSet {
    frames: usize,
    series: [Vec<f32>; 10],
}

impl AudioFeatureSet {
    pub fn zeros(frames: usize) -> Self {
        Self { frames, series: std::array::from_fn(|_| vec![0.0; frames]) }
    }

    /// Scales, clips and fits raw series to `frames`.
    ///
    /// Short series are right-padded with zeros, long ones truncated from the end.
    pub fn from_series(raw: [Vec<f32>; 10], frames: usize, settings: &ReactivitySettings) -> Self {
        let mut index = 0;
        let series = raw.map(|values| {
            let feature = Feature::ALL[index];
            index += 1;
            let scale = settings.multiplier(feature);
            let mut fitted: Vec<f32> = values
                .into_iter()
                .take(frames)
                .map(|v| {
                    let scaled = v * scale;
                    if scaled.is_finite() {
                        scaled.clamp(0.0, MAX_FEATURE_LEVEL)
                    } else {
                        0.0
                    }
                })
                .collect();
            fitted.resize(frames, 0.0);
            fitted
        });
        Self { frames, series }
    }

    /// Number of frames every series covers.
    pub fn len(&self) -> usize {
        self.frames
    }

    pub fn is_empty(&self) -> bool {
        self.frames == 0
    }

    pub fn series(&self, feature: Feature) -> &[f32] {
        &self.series[feature.index()]
    }

    /// Value at `frame`, zero past the end.
    pub fn value(&self, feature: Feature, frame: usize) -> f32 {
        self.series(feature).get(frame).copied().unwrap_or(0.0)
    }

    /// `(uniform name, value)` pairs for one frame.
    pub fn frame_values(&self, frame: usize) -> impl Iterator<Item = (&'static str, f32)> + '_ {
        Feature::ALL.into_iter().map(move |f| (f.uniform_name(), self.value(f, frame)))
    }
}

/// Extracts features from the audio file at `path`.
pub fn extract(path: &Path, frame_rate: f64, total_frames: usize, settings: &ReactivitySettings) -> AudioFeatureSet {
    info!("Analyzing audio: {:?}", path);
    match decode::decode(path) {
        Ok(track) => extract_from_track(&track, frame_rate, total_frames, settings),
        Err(e) => {
            warn!("Audio decode failed, using silent features: {}", e);
            AudioFeatureSet::zeros(total_frames)
        }
    }
}

/// Extracts features from decoded samples, degrading full analysis → loudness → silence.
pub fn extract_from_track(
    track: &AudioTrack,
    frame_rate: f64,
    total_frames: usize,
    settings: &ReactivitySettings,
) -> AudioFeatureSet {
    match analysis::analyze(track, frame_rate) {
        Ok(result) => {
            match result.tempo_bpm {
                Some(bpm) => info!("Audio analysis complete ({} frames, tempo {:.1} BPM)", result.bass.len(), bpm),
                None => info!("Audio analysis complete ({} frames, no tempo detected)", result.bass.len()),
            }
            let raw = [
                result.bass,
                result.mid,
                result.treble,
                result.beat,
                result.kick,
                result.tempo_beat,
                result.brightness,
                result.energy,
                result.percussive,
                result.rms,
            ];
            AudioFeatureSet::from_series(raw, total_frames, settings)
        }
        Err(e) => {
            warn!("Full audio analysis failed, falling back to loudness: {}", e);
            match analysis::loudness_only(track, frame_rate) {
                Ok(loudness) => {
                    AudioFeatureSet::from_series(std::array::from_fn(|_| loudness.clone()), total_frames, settings)
                }
                Err(e) => {
                    warn!("Loudness analysis failed, using silent features: {}", e);
                    AudioFeatureSet::zeros(total_frames)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: u32 = 22_050;

    /// 100 Hz tone whose amplitude swells and fades every half second.
    fn modulated_bass(secs: f32) -> AudioTrack {
        let n = (SR as f32 * secs) as usize;
        let samples = (0..n)
            .map(|i| {
                let t = i as f32 / SR as f32;
                let envelope = 0.5 + 0.5 * (2.0 * std::f32::consts::PI * 2.0 * t).sin();
                envelope * (2.0 * std::f32::consts::PI * 100.0 * t).sin()
            })
            .collect();
        AudioTrack::new(samples, SR)
    }

    fn assert_valid(set: &AudioFeatureSet, frames: usize) {
        assert_eq!(set.len(), frames);
        for feature in Feature::ALL {
            let series = set.series(feature);
            assert_eq!(series.len(), frames, "{}", feature.uniform_name());
            assert!(series.iter().all(|v| (0.0..=MAX_FEATURE_LEVEL).contains(v)), "{}", feature.uniform_name());
        }
    }

    #[test]
    fn feature_names_round_trip() {
        for feature in Feature::ALL {
            assert_eq!(Feature::from_uniform_name(feature.uniform_name()), Some(feature));
        }
        assert_eq!(Feature::from_uniform_name("iTime"), None);
    }

    #[test]
    fn every_series_matches_frame_count() {
        let track = modulated_bass(2.0);
        for frames in [1, 30, 60, 61, 200] {
            assert_valid(&extract_from_track(&track, 30.0, frames, &ReactivitySettings::default()), frames);
        }
    }

    #[test]
    fn silent_audio_yields_zeros() {
        let set = extract_from_track(&AudioTrack::new(vec![0.0; SR as usize], SR), 30.0, 30, &ReactivitySettings::default());
        assert_valid(&set, 30);
        assert_eq!(set, AudioFeatureSet::zeros(30));
    }

    #[test]
    fn empty_and_single_sample_audio_are_valid() {
        let settings = ReactivitySettings::default();
        assert_valid(&extract_from_track(&AudioTrack::new(Vec::new(), SR), 30.0, 12, &settings), 12);
        assert_valid(&extract_from_track(&AudioTrack::new(vec![0.3], SR), 30.0, 12, &settings), 12);
    }

    #[test]
    fn modulated_bass_varies_over_time() {
        let set = extract_from_track(&modulated_bass(1.0), 30.0, 30, &ReactivitySettings::default());
        let bass = set.series(Feature::Bass);
        let min = bass.iter().copied().fold(f32::INFINITY, f32::min);
        let max = bass.iter().copied().fold(0.0f32, f32::max);
        assert!(max - min > 0.5, "bass range {}..{}", min, max);
    }

    #[test]
    fn settings_scale_and_clip() {
        let raw: [Vec<f32>; 10] = std::array::from_fn(|_| vec![1.0, 0.5]);
        let settings = ReactivitySettings { preset: ReactivityPreset::Intense, bass_response: 2.0, ..Default::default() };
        let set = AudioFeatureSet::from_series(raw, 4, &settings);
        assert_eq!(set.series(Feature::Bass), &[2.0, 1.5, 0.0, 0.0]);
        assert_eq!(set.series(Feature::Mid), &[1.5, 0.75, 0.0, 0.0]);

        let none = AudioFeatureSet::from_series(std::array::from_fn(|_| vec![1.0; 3]), 2, &ReactivitySettings::none());
        assert_eq!(none, AudioFeatureSet::zeros(2));
    }

    #[test]
    fn broken_samples_fall_back_to_loudness() {
        let mut track = modulated_bass(1.0);
        track.samples[100] = f32::INFINITY;
        let set = extract_from_track(&track, 30.0, 30, &ReactivitySettings::default());
        assert_valid(&set, 30);
        assert_eq!(set.series(Feature::Bass), set.series(Feature::Rms));
        assert_eq!(set.series(Feature::Beat), set.series(Feature::Treble));
    }

    #[test]
    fn invalid_frame_rate_yields_zeros() {
        let set = extract_from_track(&modulated_bass(0.5), 0.0, 8, &ReactivitySettings::default());
        assert_eq!(set, AudioFeatureSet::zeros(8));
    }

    #[test]
    fn unreadable_file_yields_zeros() {
        let dir = tempfile::tempdir().unwrap();
        let set = extract(&dir.path().join("missing.mp3"), 30.0, 5, &ReactivitySettings::default());
        assert_eq!(set, AudioFeatureSet::zeros(5));
    }

    #[test]
    fn values_past_the_end_read_as_zero() {
        let set = AudioFeatureSet::zeros(3);
        assert_eq!(set.value(Feature::Kick, 10), 0.0);
        assert_eq!(set.frame_values(0).count(), 10);
    }
}
