//! Streaming strategy: raw frames piped through ffmpeg in both directions.

use super::{commit_output, drain_stderr, even, partial_output, EncodeSettings, FrameSink, FrameSource};
use crate::frame::{PixelFormat, VideoFrame};
use anyhow::{anyhow, Result};
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Frames are decoded ahead of the renderer by at most this many.
const DECODE_QUEUE_DEPTH: usize = 5;

/// Decodes a video into `rgb24` frames on a background thread.
pub struct FfmpegFrameReader {
    frame_rx: Receiver<Result<VideoFrame, String>>,
    child: Option<Child>,
    thread: Option<JoinHandle<()>>,
    frames_read: usize,
}

impl FfmpegFrameReader {
    /// Starts ffmpeg scaling `path` to `width` x `height`, resampled to `frame_rate` if given,
    /// stopping after `max_frames` if set.
    pub fn open(
        path: &Path,
        width: u32,
        height: u32,
        frame_rate: Option<f64>,
        max_frames: Option<usize>,
    ) -> Result<Self> {
        let path_str = path.to_str().ok_or_else(|| anyhow!("Video path is not valid UTF-8: {:?}", path))?;
        info!("Opening video via ffmpeg CLI: {:?} at {}x{}", path, width, height);

        let filter = match frame_rate {
            Some(fps) => format!("fps={},scale={}:{}", fps, width, height),
            None => format!("scale={}:{}", width, height),
        };
        let mut args: Vec<String> = ["-v", "error", "-nostdin", "-i", path_str, "-vf", &filter]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if let Some(limit) = max_frames {
            args.extend(["-frames:v".to_string(), limit.to_string()]);
        }
        args.extend(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"].iter().map(|s| s.to_string()));

        // ffmpeg -i <file> -vf scale=W:H -f rawvideo -pix_fmt rgb24 -
        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| anyhow!("Failed to spawn ffmpeg: {}", e))?;

        if let Some(stderr) = child.stderr.take() {
            drain_stderr(stderr, "ffmpeg decode");
        }
        let mut stdout = child.stdout.take().ok_or_else(|| anyhow!("Failed to open ffmpeg stdout"))?;

        let (frame_tx, frame_rx) = mpsc::sync_channel(DECODE_QUEUE_DEPTH);
        let frame_size = (width as usize) * (height as usize) * 3;
        let thread = thread::spawn(move || {
            let mut count = 0usize;
            loop {
                let mut buffer = vec![0u8; frame_size];
                match stdout.read_exact(&mut buffer) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                    Err(e) => {
                        let _ = frame_tx.send(Err(format!("Error reading from ffmpeg: {}", e)));
                        return;
                    }
                }
                count += 1;
                if frame_tx.send(Ok(VideoFrame::from_data(width, height, PixelFormat::Rgb, buffer))).is_err() {
                    // Receiver dropped
                    return;
                }
            }
            debug!("ffmpeg decode reached end of stream after {} frames", count);
        });

        Ok(Self { frame_rx, child: Some(child), thread: Some(thread), frames_read: 0 })
    }

    /// Reaps the ffmpeg process; a failed exit is an error only if it produced nothing.
    fn finish_decode(&mut self, decoded_any: bool) -> Result<()> {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child.wait().map_err(|e| anyhow!("Failed to wait for ffmpeg: {}", e))?;
        if !status.success() {
            if decoded_any {
                warn!("ffmpeg decode exited with {} after producing frames", status);
            } else {
                return Err(anyhow!("ffmpeg decode exited with {}", status));
            }
        }
        Ok(())
    }
}

impl FrameSource for FfmpegFrameReader {
    fn next_frame(&mut self) -> Result<Option<VideoFrame>> {
        match self.frame_rx.recv() {
            Ok(Ok(frame)) => {
                self.frames_read += 1;
                Ok(Some(frame))
            }
            Ok(Err(message)) => Err(anyhow!(message)),
            Err(_) => {
                // Sender dropped: decode thread finished.
                self.finish_decode(self.frames_read > 0)?;
                Ok(None)
            }
        }
    }
}

impl Drop for FfmpegFrameReader {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Encodes rendered frames to H.264 and muxes the audio track as they arrive.
///
/// The video is written next to the output and only moved into place by a
/// successful [`FrameSink::finish`].
pub struct FfmpegEncoder {
    settings: EncodeSettings,
    partial: Option<NamedTempFile>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    frames_written: usize,
}

impl FfmpegEncoder {
    pub fn new(settings: EncodeSettings) -> Result<Self> {
        let partial = partial_output(&settings.output)?;
        let width = even(settings.width);
        let height = even(settings.height);

        let mut cmd = Command::new("ffmpeg");
        cmd.stdin(Stdio::piped()).stdout(Stdio::null()).stderr(Stdio::piped());
        cmd.args([
            "-y",
            "-loglevel",
            "error",
            "-f",
            "rawvideo",
            "-pix_fmt",
            "rgb24",
            "-s",
            &format!("{}x{}", width, height),
            "-r",
            &format!("{}", settings.frame_rate),
            "-i",
            "pipe:0",
        ])
        .arg("-i")
        .arg(&settings.audio)
        .args([
            "-map",
            "0:v:0",
            "-map",
            "1:a:0?",
            "-c:v",
            "libx264",
            "-crf",
            &settings.crf.to_string(),
            "-pix_fmt",
            "yuv420p",
            "-fps_mode",
            "cfr",
            "-c:a",
            "aac",
            "-avoid_negative_ts",
            "make_zero",
            "-shortest",
            "-movflags",
            "+faststart",
        ])
        .arg(partial.path());

        let mut child = cmd.spawn().map_err(|e| anyhow!("Failed to spawn ffmpeg (is it installed and on PATH?): {}", e))?;
        if let Some(stderr) = child.stderr.take() {
            drain_stderr(stderr, "ffmpeg encode");
        }
        let stdin = child.stdin.take().ok_or_else(|| anyhow!("Failed to open ffmpeg stdin"))?;
        info!("Encoder started: {}x{} @ {:.2} fps -> {:?}", width, height, settings.frame_rate, settings.output);

        Ok(Self {
            settings: EncodeSettings { width, height, ..settings },
            partial: Some(partial),
            child: Some(child),
            stdin: Some(stdin),
            frames_written: 0,
        })
    }

    pub fn frames_written(&self) -> usize {
        self.frames_written
    }
}

impl FrameSink for FfmpegEncoder {
    fn write_frame(&mut self, frame: &VideoFrame) -> Result<()> {
        let frame = frame.resize(self.settings.width, self.settings.height)?.to_rgb();
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(anyhow!("ffmpeg encoder is already finalized"));
        };
        stdin
            .write_all(&frame.data)
            .map_err(|e| anyhow!("Failed to write frame to ffmpeg stdin: {}", e))?;
        self.frames_written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        drop(self.stdin.take());
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child.wait().map_err(|e| anyhow!("Failed to wait for ffmpeg to finish: {}", e))?;
        if !status.success() {
            return Err(anyhow!("ffmpeg exited with status {}", status));
        }
        if let Some(partial) = self.partial.take() {
            commit_output(partial, &self.settings.output)?;
        }
        info!("Encoded {} frames to {:?}", self.frames_written, self.settings.output);
        Ok(())
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::is_ffmpeg_on_path;

    #[test]
    fn abandoned_encode_leaves_no_output() {
        if !is_ffmpeg_on_path() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        let mut encoder = FfmpegEncoder::new(EncodeSettings {
            output: output.clone(),
            audio: dir.path().join("silence.wav"),
            width: 16,
            height: 16,
            frame_rate: 30.0,
            crf: 18,
        })
        .unwrap();
        let frame = VideoFrame::from_data(16, 16, PixelFormat::Rgb, vec![128; 16 * 16 * 3]);
        // ffmpeg may already have given up on the missing audio; either way nothing is finished.
        let _ = encoder.write_frame(&frame);
        drop(encoder);

        assert!(!output.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
