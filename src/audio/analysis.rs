//! Spectral analysis of a mono track at one analysis frame per video frame.

use super::decode::AudioTrack;
use anyhow::{anyhow, Result};
use rustfft::{num_complex::Complex, FftPlanner};

pub const FFT_SIZE: usize = 2048;

pub const BASS_RANGE: (f32, f32) = (20.0, 250.0);
pub const MID_RANGE: (f32, f32) = (250.0, 4_000.0);
pub const TREBLE_RANGE: (f32, f32) = (4_000.0, 20_000.0);

const ROLLOFF_FRACTION: f32 = 0.85;
const ONSET_THRESHOLD_STD: f32 = 0.5;
const MIN_ONSET_SPACING: usize = 3;
const MIN_BPM: f64 = 60.0;
const MAX_BPM: f64 = 200.0;

/// Exponential impulse shape `exp(-rate * i)` for `i in 0..length`.
#[derive(Debug, Clone, Copy)]
pub struct Decay {
    pub rate: f32,
    pub length: usize,
}

pub const ONSET_DECAY: Decay = Decay { rate: 0.3, length: 10 };
pub const KICK_DECAY: Decay = Decay { rate: 0.6, length: 5 };
pub const TEMPO_DECAY: Decay = Decay { rate: 0.4, length: 8 };

/// Analysis hop in samples so consecutive hops line up with video frames.
pub fn hop_length(sample_rate: u32, frame_rate: f64) -> Result<usize> {
    if sample_rate == 0 {
        return Err(anyhow!("Sample rate must be positive"));
    }
    if !frame_rate.is_finite() || frame_rate <= 0.0 {
        return Err(anyhow!("Frame rate must be positive, got {}", frame_rate));
    }
    Ok(((sample_rate as f64 / frame_rate).round() as usize).max(1))
}

/// Magnitude spectra of a centred short-time Fourier transform.
#[derive(Debug, Clone)]
pub struct Spectrogram {
    /// One magnitude vector of `FFT_SIZE / 2 + 1` bins per analysis frame.
    pub frames: Vec<Vec<f32>>,
    pub bin_hz: f32,
}

impl Spectrogram {
    /// Hann-windowed STFT with the signal zero-padded by half a window on both ends.
    pub fn compute(samples: &[f32], sample_rate: u32, hop: usize) -> Self {
        let hop = hop.max(1);
        let frame_count = 1 + samples.len() / hop;
        let window = hann_window(FFT_SIZE);
        let fft = FftPlanner::<f32>::new().plan_fft_forward(FFT_SIZE);
        let bins = FFT_SIZE / 2 + 1;

        let mut frames = Vec::with_capacity(frame_count);
        let mut buffer = vec![Complex::new(0.0f32, 0.0); FFT_SIZE];
        for t in 0..frame_count {
            for (i, slot) in buffer.iter_mut().enumerate() {
                let sample = centred_sample(samples, t * hop, i);
                *slot = Complex::new(sample * window[i], 0.0);
            }
            fft.process(&mut buffer);
            frames.push(buffer[..bins].iter().map(|c| c.norm()).collect());
        }

        Self { frames, bin_hz: sample_rate as f32 / FFT_SIZE as f32 }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    fn bin_frequency(&self, bin: usize) -> f32 {
        bin as f32 * self.bin_hz
    }

    fn bins_in(&self, range: (f32, f32)) -> Vec<usize> {
        let bins = self.frames.first().map_or(0, Vec::len);
        (0..bins)
            .filter(|&b| {
                let f = self.bin_frequency(b);
                f >= range.0 && f <= range.1
            })
            .collect()
    }

    /// Mean magnitude over the bins inside `range`, per frame.
    pub fn band_energy(&self, range: (f32, f32)) -> Vec<f32> {
        let bins = self.bins_in(range);
        self.frames
            .iter()
            .map(|frame| {
                if bins.is_empty() {
                    0.0
                } else {
                    bins.iter().map(|&b| frame[b]).sum::<f32>() / bins.len() as f32
                }
            })
            .collect()
    }

    /// Positive log-magnitude flux over bins up to `max_hz` (all bins when `None`).
    pub fn onset_envelope(&self, max_hz: Option<f32>) -> Vec<f32> {
        let bins: Vec<usize> = match max_hz {
            Some(limit) => self.bins_in((0.0, limit)),
            None => (0..self.frames.first().map_or(0, Vec::len)).collect(),
        };
        let mut envelope = vec![0.0; self.frames.len()];
        if bins.is_empty() {
            return envelope;
        }
        for t in 1..self.frames.len() {
            let (prev, cur) = (&self.frames[t - 1], &self.frames[t]);
            let flux: f32 = bins.iter().map(|&b| (cur[b].ln_1p() - prev[b].ln_1p()).max(0.0)).sum();
            envelope[t] = flux / bins.len() as f32;
        }
        envelope
    }

    pub fn spectral_centroid(&self) -> Vec<f32> {
        self.frames
            .iter()
            .map(|frame| {
                let total: f32 = frame.iter().sum();
                if total <= f32::EPSILON {
                    return 0.0;
                }
                let weighted: f32 = frame.iter().enumerate().map(|(b, m)| self.bin_frequency(b) * m).sum();
                weighted / total
            })
            .collect()
    }

    /// Frequency below which `ROLLOFF_FRACTION` of the spectral magnitude lies.
    pub fn spectral_rolloff(&self) -> Vec<f32> {
        self.frames
            .iter()
            .map(|frame| {
                let total: f32 = frame.iter().sum();
                if total <= f32::EPSILON {
                    return 0.0;
                }
                let target = total * ROLLOFF_FRACTION;
                let mut running = 0.0;
                for (b, m) in frame.iter().enumerate() {
                    running += m;
                    if running >= target {
                        return self.bin_frequency(b);
                    }
                }
                self.bin_frequency(frame.len().saturating_sub(1))
            })
            .collect()
    }
}

fn hann_window(size: usize) -> Vec<f32> {
    (0..size)
        .map(|n| 0.5 - 0.5 * (2.0 * std::f32::consts::PI * n as f32 / size as f32).cos())
        .collect()
}

/// Sample `i` of the window centred at `centre`, zero outside the signal.
fn centred_sample(samples: &[f32], centre: usize, i: usize) -> f32 {
    let index = (centre + i).checked_sub(FFT_SIZE / 2);
    index.and_then(|idx| samples.get(idx)).copied().unwrap_or(0.0)
}

/// RMS over a centred window per hop.
pub fn rms(samples: &[f32], hop: usize) -> Vec<f32> {
    let hop = hop.max(1);
    (0..1 + samples.len() / hop)
        .map(|t| {
            let energy: f32 = (0..FFT_SIZE).map(|i| centred_sample(samples, t * hop, i).powi(2)).sum();
            (energy / FFT_SIZE as f32).sqrt()
        })
        .collect()
}

/// Fraction of adjacent sample pairs that change sign, over a centred window per hop.
pub fn zero_crossing_rate(samples: &[f32], hop: usize) -> Vec<f32> {
    let hop = hop.max(1);
    (0..1 + samples.len() / hop)
        .map(|t| {
            let mut crossings = 0usize;
            let mut prev = centred_sample(samples, t * hop, 0);
            for i in 1..FFT_SIZE {
                let cur = centred_sample(samples, t * hop, i);
                if (prev >= 0.0) != (cur >= 0.0) && (prev != 0.0 || cur != 0.0) {
                    crossings += 1;
                }
                prev = cur;
            }
            crossings as f32 / FFT_SIZE as f32
        })
        .collect()
}

/// Local maxima above `mean + 0.5 * std`, at least `MIN_ONSET_SPACING` apart.
pub fn pick_onsets(envelope: &[f32]) -> Vec<usize> {
    if envelope.is_empty() {
        return Vec::new();
    }
    let n = envelope.len() as f32;
    let mean = envelope.iter().sum::<f32>() / n;
    let variance = envelope.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    let threshold = mean + ONSET_THRESHOLD_STD * variance.sqrt();

    let mut onsets: Vec<usize> = Vec::new();
    for t in 0..envelope.len() {
        let value = envelope[t];
        if value <= threshold || value <= 0.0 {
            continue;
        }
        let left = t == 0 || value >= envelope[t - 1];
        let right = t + 1 == envelope.len() || value > envelope[t + 1];
        if !(left && right) {
            continue;
        }
        if onsets.last().is_some_and(|&last| t - last < MIN_ONSET_SPACING) {
            continue;
        }
        onsets.push(t);
    }
    onsets
}

/// Decaying impulses at each event, overlaps keep the maximum, normalised by the peak.
pub fn impulse_train(len: usize, events: &[usize], decay: Decay) -> Vec<f32> {
    let mut train = vec![0.0f32; len];
    for &event in events {
        for i in 0..decay.length {
            let Some(slot) = train.get_mut(event + i) else { break };
            *slot = slot.max((-decay.rate * i as f32).exp());
        }
    }
    normalize_by_max(&mut train);
    train
}

/// Beat positions from onset-envelope autocorrelation over the 60..200 BPM range.
///
/// `frames_per_second` is the analysis frame rate. Returns no beats when the
/// envelope carries no periodic energy.
pub fn tempo_beats(envelope: &[f32], frames_per_second: f64) -> Vec<usize> {
    if envelope.len() < 2 || frames_per_second <= 0.0 {
        return Vec::new();
    }
    let min_lag = ((60.0 * frames_per_second / MAX_BPM).round() as usize).max(1);
    let max_lag = ((60.0 * frames_per_second / MIN_BPM).round() as usize).min(envelope.len() - 1);
    if min_lag > max_lag {
        return Vec::new();
    }

    let mut best_lag = 0;
    let mut best_score = 0.0f32;
    for lag in min_lag..=max_lag {
        let score: f32 = envelope.iter().zip(&envelope[lag..]).map(|(a, b)| a * b).sum::<f32>()
            / (envelope.len() - lag) as f32;
        if score > best_score {
            best_score = score;
            best_lag = lag;
        }
    }
    if best_lag == 0 {
        return Vec::new();
    }

    let mut best_phase = 0;
    let mut best_strength = f32::MIN;
    for phase in 0..best_lag {
        let strength: f32 = envelope.iter().skip(phase).step_by(best_lag).sum();
        if strength > best_strength {
            best_strength = strength;
            best_phase = phase;
        }
    }
    (best_phase..envelope.len()).step_by(best_lag).collect()
}

/// Maps a series into `[0, 1]`; a constant series becomes all zeros.
pub fn min_max_normalize(values: &mut [f32]) {
    let min = values.iter().copied().fold(f32::INFINITY, f32::min);
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;
    for v in values.iter_mut() {
        *v = if range > f32::EPSILON { (*v - min) / range } else { 0.0 };
    }
}

/// Divides by the maximum; a series with no positive maximum is left as zeros.
pub fn normalize_by_max(values: &mut [f32]) {
    let max = values.iter().copied().fold(0.0f32, f32::max);
    for v in values.iter_mut() {
        *v = if max > f32::EPSILON { *v / max } else { 0.0 };
    }
}

/// Unscaled per-frame descriptors, in analysis-frame resolution.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub bass: Vec<f32>,
    pub mid: Vec<f32>,
    pub treble: Vec<f32>,
    pub beat: Vec<f32>,
    pub kick: Vec<f32>,
    pub tempo_beat: Vec<f32>,
    pub brightness: Vec<f32>,
    pub energy: Vec<f32>,
    pub percussive: Vec<f32>,
    pub rms: Vec<f32>,
    pub tempo_bpm: Option<f64>,
}

/// Full spectral analysis. Fails on invalid rates or non-finite samples.
pub fn analyze(track: &AudioTrack, frame_rate: f64) -> Result<Analysis> {
    let hop = hop_length(track.sample_rate, frame_rate)?;
    if let Some(index) = track.samples.iter().position(|s| !s.is_finite()) {
        return Err(anyhow!("Non-finite audio sample at index {}", index));
    }

    let spectrogram = Spectrogram::compute(&track.samples, track.sample_rate, hop);
    let frames_per_second = track.sample_rate as f64 / hop as f64;

    let mut bass = spectrogram.band_energy(BASS_RANGE);
    let mut mid = spectrogram.band_energy(MID_RANGE);
    let mut treble = spectrogram.band_energy(TREBLE_RANGE);
    min_max_normalize(&mut bass);
    min_max_normalize(&mut mid);
    min_max_normalize(&mut treble);

    let onset_envelope = spectrogram.onset_envelope(None);
    let kick_envelope = spectrogram.onset_envelope(Some(BASS_RANGE.1));
    let len = spectrogram.len();
    let beat = impulse_train(len, &pick_onsets(&onset_envelope), ONSET_DECAY);
    let kick = impulse_train(len, &pick_onsets(&kick_envelope), KICK_DECAY);

    let beats = tempo_beats(&onset_envelope, frames_per_second);
    let tempo_bpm = match beats.as_slice() {
        [first, second, ..] => Some(60.0 * frames_per_second / (second - first) as f64),
        _ => None,
    };
    let tempo_beat = impulse_train(len, &beats, TEMPO_DECAY);

    let mut brightness = spectrogram.spectral_centroid();
    let mut energy = spectrogram.spectral_rolloff();
    let mut percussive = zero_crossing_rate(&track.samples, hop);
    let mut loudness = rms(&track.samples, hop);
    normalize_by_max(&mut brightness);
    normalize_by_max(&mut energy);
    normalize_by_max(&mut percussive);
    normalize_by_max(&mut loudness);

    let analysis = Analysis {
        bass,
        mid,
        treble,
        beat,
        kick,
        tempo_beat,
        brightness,
        energy,
        percussive,
        rms: loudness,
        tempo_bpm,
    };
    if analysis.all().iter().any(|series| series.iter().any(|v| !v.is_finite())) {
        return Err(anyhow!("Spectral analysis produced non-finite values"));
    }
    Ok(analysis)
}

impl Analysis {
    fn all(&self) -> [&Vec<f32>; 10] {
        [
            &self.bass,
            &self.mid,
            &self.treble,
            &self.beat,
            &self.kick,
            &self.tempo_beat,
            &self.brightness,
            &self.energy,
            &self.percussive,
            &self.rms,
        ]
    }
}

/// Loudness only, min-max normalised. Non-finite samples are treated as silence.
pub fn loudness_only(track: &AudioTrack, frame_rate: f64) -> Result<Vec<f32>> {
    let hop = hop_length(track.sample_rate, frame_rate)?;
    let samples: Vec<f32> = track.samples.iter().map(|s| if s.is_finite() { *s } else { 0.0 }).collect();
    let mut loudness = rms(&samples, hop);
    min_max_normalize(&mut loudness);
    Ok(loudness)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: u32 = 22_050;

    fn sine(freq: f32, secs: f32) -> Vec<f32> {
        let n = (SR as f32 * secs) as usize;
        (0..n).map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / SR as f32).sin()).collect()
    }

    #[test]
    fn hop_follows_frame_rate() {
        assert_eq!(hop_length(22_050, 30.0).unwrap(), 735);
        assert_eq!(hop_length(22_050, 29.97).unwrap(), 736);
        assert_eq!(hop_length(10, 1_000.0).unwrap(), 1);
        assert!(hop_length(0, 30.0).is_err());
        assert!(hop_length(22_050, 0.0).is_err());
    }

    #[test]
    fn stft_peaks_at_tone_frequency() {
        let spectrogram = Spectrogram::compute(&sine(1_000.0, 0.5), SR, 735);
        let frame = &spectrogram.frames[spectrogram.len() / 2];
        let peak = frame.iter().enumerate().fold((0, 0.0f32), |best, (b, &m)| if m > best.1 { (b, m) } else { best }).0;
        let peak_hz = peak as f32 * spectrogram.bin_hz;
        assert!((peak_hz - 1_000.0).abs() < spectrogram.bin_hz * 1.5, "peak at {} Hz", peak_hz);
    }

    #[test]
    fn low_tone_lands_in_bass_band() {
        let spectrogram = Spectrogram::compute(&sine(100.0, 0.5), SR, 735);
        let t = spectrogram.len() / 2;
        assert!(spectrogram.band_energy(BASS_RANGE)[t] > spectrogram.band_energy(TREBLE_RANGE)[t] * 10.0);
    }

    #[test]
    fn normalizers_handle_constant_series() {
        let mut constant = vec![0.4; 5];
        min_max_normalize(&mut constant);
        assert_eq!(constant, vec![0.0; 5]);

        let mut zeros = vec![0.0; 3];
        normalize_by_max(&mut zeros);
        assert_eq!(zeros, vec![0.0; 3]);

        let mut ramp = vec![1.0, 2.0, 3.0];
        min_max_normalize(&mut ramp);
        assert_eq!(ramp, vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn impulses_decay_and_keep_maximum() {
        let train = impulse_train(12, &[0, 2], KICK_DECAY);
        assert_eq!(train[0], 1.0);
        assert_eq!(train[2], 1.0);
        assert!((train[3] - (-0.6f32).exp()).abs() < 1e-6);
        assert_eq!(train[7], 0.0);
    }

    #[test]
    fn impulses_are_clipped_at_series_end() {
        let train = impulse_train(3, &[2], ONSET_DECAY);
        assert_eq!(train, vec![0.0, 0.0, 1.0]);
    }

    #[test]
    fn onsets_respect_threshold_and_spacing() {
        let mut envelope = vec![0.0f32; 20];
        envelope[5] = 1.0;
        envelope[6] = 0.9;
        envelope[7] = 1.0;
        envelope[15] = 1.0;
        assert_eq!(pick_onsets(&envelope), vec![5, 15]);
        assert!(pick_onsets(&[0.0; 8]).is_empty());
    }

    #[test]
    fn periodic_envelope_yields_regular_beats() {
        // 120 BPM at 30 frames per second is a beat every 15 frames.
        let envelope: Vec<f32> = (0..300).map(|t| if t % 15 == 4 { 1.0 } else { 0.0 }).collect();
        let beats = tempo_beats(&envelope, 30.0);
        assert_eq!(beats.first(), Some(&4));
        assert!(beats.windows(2).all(|w| w[1] - w[0] == 15));
    }

    #[test]
    fn silent_track_analyzes_to_zeros() {
        let track = AudioTrack::new(vec![0.0; SR as usize], SR);
        let analysis = analyze(&track, 30.0).unwrap();
        assert_eq!(analysis.bass.len(), 31);
        for series in analysis.all() {
            assert!(series.iter().all(|v| *v == 0.0));
        }
        assert_eq!(analysis.tempo_bpm, None);
    }

    #[test]
    fn non_finite_samples_fail_full_analysis_but_not_loudness() {
        let mut samples = sine(200.0, 0.2);
        samples[10] = f32::NAN;
        let track = AudioTrack::new(samples, SR);
        assert!(analyze(&track, 30.0).is_err());
        let loudness = loudness_only(&track, 30.0).unwrap();
        assert!(loudness.iter().all(|v| v.is_finite() && (0.0..=1.0).contains(v)));
    }
}
