//! Video I/O through the `ffmpeg` and `ffprobe` command-line tools.
//!
//! Input frames come from a [`FrameSource`], rendered frames go to a
//! [`FrameSink`]. Two strategies implement both: a batch strategy that goes
//! through a numbered PNG sequence on disk, and a streaming strategy that
//! pipes raw frames through ffmpeg processes.

mod batch;
mod stream;

pub use batch::{extract_png_sequence, PngSequenceSink, PngSequenceSource};
pub use stream::{FfmpegEncoder, FfmpegFrameReader};

use crate::frame::VideoFrame;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{ChildStderr, Command};
use std::thread;
use tempfile::NamedTempFile;
use tracing::{error, info, warn};

/// Frame rate used when the probed rate is missing or implausible.
pub const FALLBACK_FRAME_RATE: f64 = 30.0;
const MAX_FRAME_RATE: f64 = 120.0;

/// Ordered supply of input frames.
pub trait FrameSource {
    /// Next frame, or `Ok(None)` at end of stream.
    fn next_frame(&mut self) -> Result<Option<VideoFrame>>;
}

/// Consumer of rendered frames, in order.
pub trait FrameSink {
    fn write_frame(&mut self, frame: &VideoFrame) -> Result<()>;

    /// Flushes and produces the final container.
    fn finish(&mut self) -> Result<()>;
}

/// How frames move between disk, ffmpeg and the renderer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum VideoStrategy {
    /// Decode everything to PNGs first, encode once at the end.
    #[default]
    Batch,
    /// Decode and encode concurrently through pipes.
    Streaming,
}

/// Encoder settings shared by both strategies.
#[derive(Debug, Clone)]
pub struct EncodeSettings {
    pub output: PathBuf,
    pub audio: PathBuf,
    /// Final resolution; oversized frames are scaled down to it.
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub crf: u8,
}

/// Stream properties reported by `ffprobe`.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub frame_count: Option<usize>,
    pub duration: Option<f64>,
}

impl VideoInfo {
    /// Best estimate of the number of frames at `frame_rate`.
    pub fn estimated_frames(&self, frame_rate: f64) -> Option<usize> {
        match (self.frame_count, self.duration) {
            (Some(count), _) if (frame_rate - self.frame_rate).abs() < 1e-3 => Some(count),
            (_, Some(duration)) if duration > 0.0 => Some((duration * frame_rate).round() as usize),
            (count, _) => count,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Reads width, height, frame rate and length of the first video stream.
pub fn probe(path: &Path) -> Result<VideoInfo> {
    let path_str = path.to_str().ok_or_else(|| anyhow!("Video path is not valid UTF-8: {:?}", path))?;

    // ffprobe -v error -select_streams v:0 -show_entries stream=... -of json <file>
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,r_frame_rate,avg_frame_rate,nb_frames,duration:format=duration",
            "-of",
            "json",
            path_str,
        ])
        .output()
        .map_err(|e| anyhow!("Failed to run ffprobe: {}", e))?;

    if !output.status.success() {
        return Err(anyhow!("ffprobe failed: {}", String::from_utf8_lossy(&output.stderr).trim()));
    }

    let info = parse_probe_output(&String::from_utf8_lossy(&output.stdout))?;
    info!(
        "Video: {}x{}, {:.2} fps, {} frames",
        info.width,
        info.height,
        info.frame_rate,
        info.frame_count.map_or_else(|| "unknown".to_string(), |n| n.to_string())
    );
    Ok(info)
}

fn parse_probe_output(json: &str) -> Result<VideoInfo> {
    let probe: ProbeOutput = serde_json::from_str(json).map_err(|e| anyhow!("Invalid ffprobe output: {}", e))?;
    let stream = probe.streams.into_iter().next().ok_or_else(|| anyhow!("No video stream found"))?;
    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err(anyhow!("Video stream has no dimensions")),
    };

    let raw_rate = stream
        .avg_frame_rate
        .as_deref()
        .map(parse_fps)
        .filter(|fps| *fps > 0.0)
        .or_else(|| stream.r_frame_rate.as_deref().map(parse_fps))
        .unwrap_or(0.0);

    let duration = stream
        .duration
        .or_else(|| probe.format.and_then(|f| f.duration))
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0);

    Ok(VideoInfo {
        width,
        height,
        frame_rate: sanitize_frame_rate(raw_rate),
        frame_count: stream.nb_frames.and_then(|n| n.parse().ok()).filter(|n| *n > 0),
        duration,
    })
}

/// Parses `30000/1001` or `25` style rates; malformed input gives 0.
pub fn parse_fps(s: &str) -> f64 {
    if let Some((num, den)) = s.split_once('/') {
        let n: f64 = num.trim().parse().unwrap_or(0.0);
        let d: f64 = den.trim().parse().unwrap_or(0.0);
        if d == 0.0 {
            0.0
        } else {
            n / d
        }
    } else {
        s.trim().parse().unwrap_or(0.0)
    }
}

/// Rates outside `(0, 120]` are replaced by [`FALLBACK_FRAME_RATE`].
pub fn sanitize_frame_rate(fps: f64) -> f64 {
    if fps.is_finite() && fps > 0.0 && fps <= MAX_FRAME_RATE {
        fps
    } else {
        warn!("Implausible frame rate {:.3}, using {}", fps, FALLBACK_FRAME_RATE);
        FALLBACK_FRAME_RATE
    }
}

/// Decodes every frame of `path` at `width` x `height` into memory.
pub fn decode_all(path: &Path, width: u32, height: u32) -> Result<Vec<VideoFrame>> {
    let mut reader = FfmpegFrameReader::open(path, width, height, None, None)?;
    let mut frames = Vec::new();
    while let Some(frame) = reader.next_frame()? {
        frames.push(frame);
    }
    info!("Decoded {} frames from {:?}", frames.len(), path);
    Ok(frames)
}

pub fn is_ffmpeg_on_path() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Relays error lines from an ffmpeg stderr pipe into the log.
fn drain_stderr(mut stderr: ChildStderr, label: &'static str) {
    thread::spawn(move || {
        let mut buf = [0u8; 1024];
        loop {
            match stderr.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let msg = String::from_utf8_lossy(&buf[..n]);
                    for line in msg.lines() {
                        if line.contains("Error") || line.contains("error") || line.contains("failed") {
                            error!("{}: {}", label, line);
                        }
                    }
                }
                Err(_) => break,
            }
        }
    });
}

/// Placeholder file next to `output` for ffmpeg to write into.
///
/// The output only appears once [`commit_output`] renames it into place; a
/// dropped placeholder is deleted, so an aborted encode leaves nothing behind.
fn partial_output(output: &Path) -> Result<NamedTempFile> {
    let parent = match output.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => parent,
        None => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(|e| anyhow!("Failed to create output directory {:?}: {}", parent, e))?;
    // ffmpeg picks the container from the extension.
    let suffix = output.extension().map(|ext| format!(".{}", ext.to_string_lossy())).unwrap_or_default();
    tempfile::Builder::new()
        .prefix(".shadervid-partial-")
        .suffix(&suffix)
        .tempfile_in(parent)
        .map_err(|e| anyhow!("Failed to create partial output in {:?}: {}", parent, e))
}

fn commit_output(partial: NamedTempFile, output: &Path) -> Result<()> {
    partial
        .persist(output)
        .map_err(|e| anyhow!("Failed to move encoded video to {:?}: {}", output, e.error))?;
    Ok(())
}

/// Even dimension, as required by yuv420p output.
fn even(value: u32) -> u32 {
    (value & !1).max(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fps_strings_parse() {
        assert_eq!(parse_fps("25"), 25.0);
        assert!((parse_fps("30000/1001") - 29.97).abs() < 0.01);
        assert_eq!(parse_fps("0/0"), 0.0);
        assert_eq!(parse_fps("N/A"), 0.0);
    }

    #[test]
    fn implausible_rates_fall_back() {
        assert_eq!(sanitize_frame_rate(24.0), 24.0);
        assert_eq!(sanitize_frame_rate(120.0), 120.0);
        assert_eq!(sanitize_frame_rate(0.0), FALLBACK_FRAME_RATE);
        assert_eq!(sanitize_frame_rate(90_000.0), FALLBACK_FRAME_RATE);
        assert_eq!(sanitize_frame_rate(f64::NAN), FALLBACK_FRAME_RATE);
    }

    #[test]
    fn probe_json_is_parsed() {
        let json = r#"{
            "programs": [],
            "streams": [{
                "width": 1920, "height": 1080,
                "r_frame_rate": "30/1", "avg_frame_rate": "30000/1001",
                "nb_frames": "300", "duration": "10.010000"
            }],
            "format": {"duration": "10.050000"}
        }"#;
        let info = parse_probe_output(json).unwrap();
        assert_eq!((info.width, info.height), (1920, 1080));
        assert!((info.frame_rate - 29.97).abs() < 0.01);
        assert_eq!(info.frame_count, Some(300));
        assert_eq!(info.duration, Some(10.01));
    }

    #[test]
    fn probe_falls_back_to_container_duration() {
        let json = r#"{"streams": [{"width": 640, "height": 480, "r_frame_rate": "0/0"}], "format": {"duration": "2.0"}}"#;
        let info = parse_probe_output(json).unwrap();
        assert_eq!(info.frame_rate, FALLBACK_FRAME_RATE);
        assert_eq!(info.frame_count, None);
        assert_eq!(info.estimated_frames(30.0), Some(60));
    }

    #[test]
    fn probe_without_video_stream_fails() {
        assert!(parse_probe_output(r#"{"streams": []}"#).is_err());
        assert!(parse_probe_output("not json").is_err());
    }

    #[test]
    fn frame_estimate_rescales_to_requested_rate() {
        let info = VideoInfo { width: 2, height: 2, frame_rate: 25.0, frame_count: Some(250), duration: Some(10.0) };
        assert_eq!(info.estimated_frames(25.0), Some(250));
        assert_eq!(info.estimated_frames(30.0), Some(300));
    }

    #[test]
    fn partial_output_only_lands_when_committed() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("nested").join("out.mp4");

        let abandoned = partial_output(&output).unwrap();
        assert_eq!(abandoned.path().extension().unwrap(), "mp4");
        assert_eq!(abandoned.path().parent(), output.parent());
        drop(abandoned);
        assert_eq!(std::fs::read_dir(dir.path().join("nested")).unwrap().count(), 0);

        let partial = partial_output(&output).unwrap();
        std::fs::write(partial.path(), b"encoded").unwrap();
        commit_output(partial, &output).unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), b"encoded");
        assert_eq!(std::fs::read_dir(dir.path().join("nested")).unwrap().count(), 1);
    }

    #[test]
    fn dimensions_are_made_even() {
        assert_eq!(even(1280), 1280);
        assert_eq!(even(1537), 1536);
        assert_eq!(even(1), 2);
    }
}
