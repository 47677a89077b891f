//! Per-frame FFT rows for shaders that sample audio as a texture.

use super::analysis::{self, Spectrogram};
use super::decode::AudioTrack;
use anyhow::Result;

/// Width of one spectrum row.
pub const SPECTRUM_BINS: usize = 256;

/// Spectrogram reduced to `SPECTRUM_BINS` bins, each normalised over time to `[0, 1]`,
/// with exactly one row per video frame.
#[derive(Debug, Clone)]
pub struct AudioSpectrum {
    rows: Vec<[f32; SPECTRUM_BINS]>,
}

impl AudioSpectrum {
    pub fn zeros(total_frames: usize) -> Self {
        Self { rows: vec![[0.0; SPECTRUM_BINS]; total_frames] }
    }

    pub fn from_track(track: &AudioTrack, frame_rate: f64, total_frames: usize) -> Result<Self> {
        let hop = analysis::hop_length(track.sample_rate, frame_rate)?;
        let spectrogram = Spectrogram::compute(&track.samples, track.sample_rate, hop);
        Ok(Self::from_spectrogram(&spectrogram, total_frames))
    }

    fn from_spectrogram(spectrogram: &Spectrogram, total_frames: usize) -> Self {
        let mut reduced: Vec<[f32; SPECTRUM_BINS]> = spectrogram.frames.iter().map(|frame| reduce(frame)).collect();

        for bin in 0..SPECTRUM_BINS {
            let mut column: Vec<f32> = reduced.iter().map(|row| row[bin]).collect();
            analysis::min_max_normalize(&mut column);
            for (row, value) in reduced.iter_mut().zip(column) {
                row[bin] = value;
            }
        }

        Self { rows: resample_rows(&reduced, total_frames) }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Row for `frame`; frames past the end read as silence.
    pub fn row(&self, frame: usize) -> [f32; SPECTRUM_BINS] {
        self.rows.get(frame).copied().unwrap_or([0.0; SPECTRUM_BINS])
    }
}

/// Averages the non-DC bins into `SPECTRUM_BINS` equal groups.
fn reduce(frame: &[f32]) -> [f32; SPECTRUM_BINS] {
    let mut out = [0.0; SPECTRUM_BINS];
    let usable = frame.len().saturating_sub(1);
    let group = (usable / SPECTRUM_BINS).max(1);
    for (i, slot) in out.iter_mut().enumerate() {
        let start = 1 + i * group;
        let end = (start + group).min(frame.len());
        if start < end {
            *slot = frame[start..end].iter().sum::<f32>() / (end - start) as f32;
        }
    }
    out
}

/// Linear interpolation across rows onto `target` evenly spaced positions.
fn resample_rows(rows: &[[f32; SPECTRUM_BINS]], target: usize) -> Vec<[f32; SPECTRUM_BINS]> {
    match rows.len() {
        0 => vec![[0.0; SPECTRUM_BINS]; target],
        1 => vec![rows[0]; target],
        n => (0..target)
            .map(|i| {
                let pos = if target > 1 { i as f32 * (n - 1) as f32 / (target - 1) as f32 } else { 0.0 };
                let lo = pos.floor() as usize;
                let hi = (lo + 1).min(n - 1);
                let frac = pos - lo as f32;
                let mut row = [0.0; SPECTRUM_BINS];
                for (b, slot) in row.iter_mut().enumerate() {
                    *slot = rows[lo][b] * (1.0 - frac) + rows[hi][b] * frac;
                }
                row
            })
            .collect(),
    }
}
