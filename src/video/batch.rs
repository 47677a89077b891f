//! Batch strategy: the input is exploded into a numbered PNG sequence on disk,
//! rendered frames are written back as PNGs and muxed with audio at the end.

use super::{commit_output, drain_stderr, even, partial_output, EncodeSettings, FrameSink, FrameSource};
use crate::frame::VideoFrame;
use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::info;

const INPUT_PREFIX: &str = "frame_";
const OUTPUT_PREFIX: &str = "out_";

fn numbered(dir: &Path, prefix: &str, index: usize) -> PathBuf {
    dir.join(format!("{}{:06}.png", prefix, index + 1))
}

fn run_ffmpeg(cmd: &mut Command, what: &str) -> Result<()> {
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .map_err(|e| anyhow!("Failed to spawn ffmpeg: {}", e))?;
    if !output.status.success() {
        return Err(anyhow!("ffmpeg {} failed: {}", what, String::from_utf8_lossy(&output.stderr).trim()));
    }
    Ok(())
}

/// Decodes `video` into `dir/frame_NNNNNN.png` at the given size and rate.
///
/// Returns the number of frames written; zero frames is an error.
pub fn extract_png_sequence(
    video: &Path,
    dir: &Path,
    width: u32,
    height: u32,
    frame_rate: f64,
    max_frames: Option<usize>,
) -> Result<usize> {
    info!("Extracting frames to {:?}", dir);
    let mut cmd = Command::new("ffmpeg");
    cmd.args(["-y", "-v", "error", "-i"])
        .arg(video)
        .args(["-vf", &format!("scale={}:{}", width, height), "-r", &format!("{}", frame_rate)]);
    if let Some(limit) = max_frames {
        cmd.args(["-frames:v", &limit.to_string()]);
    }
    cmd.arg(dir.join(format!("{}%06d.png", INPUT_PREFIX)));
    run_ffmpeg(&mut cmd, "frame extraction")?;

    let count = count_sequence(dir, INPUT_PREFIX);
    if count == 0 {
        return Err(anyhow!("No frames were extracted from {:?}", video));
    }
    info!("Extracted {} frames", count);
    Ok(count)
}

/// Length of the contiguous `prefixNNNNNN.png` run starting at 1.
fn count_sequence(dir: &Path, prefix: &str) -> usize {
    let mut count = 0;
    while numbered(dir, prefix, count).is_file() {
        count += 1;
    }
    count
}

/// Reads an extracted PNG sequence in order.
pub struct PngSequenceSource {
    dir: PathBuf,
    count: usize,
    next: usize,
}

impl PngSequenceSource {
    pub fn new(dir: impl Into<PathBuf>, count: usize) -> Self {
        Self { dir: dir.into(), count, next: 0 }
    }

    /// Opens every frame already present in `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let count = count_sequence(&dir, INPUT_PREFIX);
        Self::new(dir, count)
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl FrameSource for PngSequenceSource {
    fn next_frame(&mut self) -> Result<Option<VideoFrame>> {
        if self.next >= self.count {
            return Ok(None);
        }
        let frame = VideoFrame::load(numbered(&self.dir, INPUT_PREFIX, self.next))?;
        self.next += 1;
        Ok(Some(frame))
    }
}

/// Writes rendered frames as PNGs and muxes them with audio on [`FrameSink::finish`].
pub struct PngSequenceSink {
    dir: PathBuf,
    settings: EncodeSettings,
    written: usize,
}

impl PngSequenceSink {
    pub fn new(dir: impl Into<PathBuf>, settings: EncodeSettings) -> Self {
        Self { dir: dir.into(), settings, written: 0 }
    }

    pub fn written(&self) -> usize {
        self.written
    }

    fn mux_command(&self, target: &Path) -> Command {
        let width = even(self.settings.width);
        let height = even(self.settings.height);
        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-y", "-v", "error", "-framerate", &format!("{}", self.settings.frame_rate), "-i"])
            .arg(self.dir.join(format!("{}%06d.png", OUTPUT_PREFIX)))
            .arg("-i")
            .arg(&self.settings.audio)
            .args([
                "-map",
                "0:v:0",
                "-map",
                "1:a:0?",
                "-vf",
                &format!("scale={}:{}", width, height),
                "-c:v",
                "libx264",
                "-crf",
                &self.settings.crf.to_string(),
                "-pix_fmt",
                "yuv420p",
                "-c:a",
                "aac",
                "-shortest",
                "-movflags",
                "+faststart",
            ])
            .arg(target);
        cmd
    }
}

impl FrameSink for PngSequenceSink {
    fn write_frame(&mut self, frame: &VideoFrame) -> Result<()> {
        frame.save(numbered(&self.dir, OUTPUT_PREFIX, self.written))?;
        self.written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.written == 0 {
            return Err(anyhow!("No frames were rendered"));
        }
        let partial = partial_output(&self.settings.output)?;
        info!("Combining {} frames with audio into {:?}", self.written, self.settings.output);
        let mut cmd = self.mux_command(partial.path());
        cmd.stderr(Stdio::piped()).stdout(Stdio::null());
        let mut child = cmd.spawn().map_err(|e| anyhow!("Failed to spawn ffmpeg: {}", e))?;
        if let Some(stderr) = child.stderr.take() {
            drain_stderr(stderr, "ffmpeg mux");
        }
        let status = child.wait().map_err(|e| anyhow!("Failed to wait for ffmpeg: {}", e))?;
        if !status.success() {
            return Err(anyhow!("ffmpeg mux exited with status {}", status));
        }
        commit_output(partial, &self.settings.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;

    fn settings(dir: &Path) -> EncodeSettings {
        EncodeSettings {
            output: dir.join("out.mp4"),
            audio: dir.join("audio.wav"),
            width: 1280,
            height: 720,
            frame_rate: 30.0,
            crf: 18,
        }
    }

    #[test]
    fn sink_numbers_frames_from_one() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = PngSequenceSink::new(dir.path(), settings(dir.path()));
        for shade in [10u8, 20, 30] {
            let frame = VideoFrame::from_data(2, 2, PixelFormat::Rgb, vec![shade; 12]);
            sink.write_frame(&frame).unwrap();
        }
        assert_eq!(sink.written(), 3);
        assert!(dir.path().join("out_000001.png").is_file());
        assert!(dir.path().join("out_000003.png").is_file());
        assert_eq!(count_sequence(dir.path(), OUTPUT_PREFIX), 3);
    }

    #[test]
    fn source_reads_sequence_in_order() {
        let dir = tempfile::tempdir().unwrap();
        for (i, shade) in [5u8, 6, 7].into_iter().enumerate() {
            VideoFrame::from_data(1, 1, PixelFormat::Rgb, vec![shade; 3])
                .save(numbered(dir.path(), INPUT_PREFIX, i))
                .unwrap();
        }
        let mut source = PngSequenceSource::open(dir.path());
        assert_eq!(source.len(), 3);
        let mut shades = Vec::new();
        while let Some(frame) = source.next_frame().unwrap() {
            shades.push(frame.data[0]);
        }
        assert_eq!(shades, vec![5, 6, 7]);
    }

    #[test]
    fn finishing_without_frames_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = PngSequenceSink::new(dir.path(), settings(dir.path()));
        assert!(sink.finish().is_err());
    }

    #[test]
    fn mux_scales_back_to_base_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let sink = PngSequenceSink::new(dir.path(), settings(dir.path()));
        let cmd = sink.mux_command(&dir.path().join("partial.mp4"));
        let args: Vec<String> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert!(args.contains(&"scale=1280:720".to_string()));
        assert!(args.contains(&"-shortest".to_string()));
    }
}
