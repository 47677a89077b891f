//! Audio decoding through the `ffmpeg` command-line tool.

use anyhow::{anyhow, Result};
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::info;

/// Sample rate audio is resampled to before analysis.
pub const ANALYSIS_SAMPLE_RATE: u32 = 22_050;

/// Mono PCM samples in `[-1, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioTrack {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioTrack {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Decodes any container ffmpeg understands into mono `f32` PCM.
pub fn decode(path: &Path) -> Result<AudioTrack> {
    let path_str = path.to_str().ok_or_else(|| anyhow!("Audio path is not valid UTF-8: {:?}", path))?;
    let rate = ANALYSIS_SAMPLE_RATE.to_string();

    // ffmpeg -v error -i <file> -vn -ac 1 -ar 22050 -f f32le -
    let output = Command::new("ffmpeg")
        .args(["-v", "error", "-nostdin", "-i", path_str, "-vn", "-ac", "1", "-ar", &rate, "-f", "f32le", "-"])
        .stdin(Stdio::null())
        .output()
        .map_err(|e| anyhow!("Failed to run ffmpeg: {}", e))?;

    if !output.status.success() {
        return Err(anyhow!("ffmpeg audio decode failed: {}", String::from_utf8_lossy(&output.stderr).trim()));
    }

    let samples = pcm_from_le_bytes(&output.stdout);
    let track = AudioTrack::new(samples, ANALYSIS_SAMPLE_RATE);
    info!("Audio: {:.2}s, {} Hz mono ({} samples)", track.duration_secs(), track.sample_rate, track.samples.len());
    Ok(track)
}

/// Interprets raw `f32le` bytes; a trailing partial sample is dropped.
fn pcm_from_le_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_bytes_decode_little_endian() {
        let mut bytes = Vec::new();
        for value in [0.5f32, -1.0, 0.25] {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes.push(0xff);
        assert_eq!(pcm_from_le_bytes(&bytes), vec![0.5, -1.0, 0.25]);
    }

    #[test]
    fn duration_handles_zero_rate() {
        assert_eq!(AudioTrack::new(vec![0.0; 10], 0).duration_secs(), 0.0);
        assert_eq!(AudioTrack::new(vec![0.0; 22_050], 22_050).duration_secs(), 1.0);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(decode(&dir.path().join("missing.wav")).is_err());
    }
}
