//! The frame production loop.
//!
//! Frames are pulled from a [`FrameSource`] strictly in order, bound to the
//! shader together with audio data and auxiliary textures, rendered, and pushed
//! to a [`FrameSink`]. A frame that fails to render is replaced by its input so
//! one bad frame never ends the job.

mod bindings;

pub use bindings::{FrameBinder, VideoLoader};

use crate::error::{PipelineError, PipelineResult};
use crate::frame::VideoFrame;
use crate::progress::ProgressReporter;
use crate::shader::ShaderPipeline;
use crate::video::{FrameSink, FrameSource};
use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Default number of frames between progress updates.
pub const DEFAULT_PROGRESS_INTERVAL: usize = 30;

/// Shared cancellation flag, checked before each frame.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of a completed render loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderStats {
    /// Frames handed to the sink.
    pub frames: usize,
    /// Frames that fell back to the unprocessed input.
    pub substituted: usize,
}

pub struct RenderLoop {
    binder: FrameBinder,
    max_frames: Option<usize>,
    expected_frames: usize,
    progress_interval: usize,
    cancel: CancelToken,
}

impl RenderLoop {
    pub fn new(binder: FrameBinder) -> Self {
        Self {
            binder,
            max_frames: None,
            expected_frames: 0,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            cancel: CancelToken::new(),
        }
    }

    /// Stops after `max_frames` frames (preview mode).
    pub fn with_frame_cap(mut self, max_frames: Option<usize>) -> Self {
        self.max_frames = max_frames;
        self
    }

    /// Frame total used for progress percentages.
    pub fn with_expected_frames(mut self, frames: usize) -> Self {
        self.expected_frames = frames;
        self
    }

    pub fn with_progress_interval(mut self, interval: usize) -> Self {
        self.progress_interval = interval.max(1);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn binder(&self) -> &FrameBinder {
        &self.binder
    }

    /// Renders every frame from `source` into `sink`. The sink is not finished here.
    pub fn run(
        &mut self,
        pipeline: &mut dyn ShaderPipeline,
        source: &mut dyn FrameSource,
        sink: &mut dyn FrameSink,
        progress: &mut ProgressReporter<'_>,
    ) -> PipelineResult<RenderStats> {
        let (width, height) = self.binder.resolution();
        let total = match (self.max_frames, self.expected_frames) {
            (Some(cap), 0) => cap,
            (Some(cap), expected) => cap.min(expected),
            (None, expected) => expected,
        };
        info!("Rendering at {}x{} ({} frames expected)", width, height, total);

        let mut stats = RenderStats::default();
        let start = Instant::now();
        loop {
            if self.max_frames.is_some_and(|cap| stats.frames >= cap) {
                break;
            }
            if self.cancel.is_cancelled() {
                warn!("Render cancelled after {} frames", stats.frames);
                return Err(PipelineError::Cancelled { frames: stats.frames });
            }

            let Some(input) = source.next_frame().map_err(|e| PipelineError::decode(format!("{:#}", e)))? else {
                break;
            };
            let input = input.resize(width, height).map_err(|e| PipelineError::decode(format!("{:#}", e)))?;

            let index = stats.frames;
            let frame_start = Instant::now();
            let output = match self.render_frame(pipeline, index, &input) {
                Ok(rendered) => rendered,
                Err(e) => {
                    error!("Error rendering frame {}: {:#}", index, e);
                    stats.substituted += 1;
                    input
                }
            };
            debug!("  [Perf] frame {} total: {:?}", index, frame_start.elapsed());

            sink.write_frame(&output).map_err(|e| PipelineError::encode(format!("{:#}", e)))?;
            stats.frames += 1;

            if stats.frames % self.progress_interval == 0 {
                progress.frames(stats.frames, total.max(stats.frames));
            }
        }

        let elapsed = start.elapsed().as_secs_f64();
        let fps = if elapsed > 0.0 { stats.frames as f64 / elapsed } else { 0.0 };
        info!(
            "Rendered {} frames ({} substituted) in {:.1}s, {:.1} fps",
            stats.frames, stats.substituted, elapsed, fps
        );
        Ok(stats)
    }

    fn render_frame(&mut self, pipeline: &mut dyn ShaderPipeline, index: usize, input: &VideoFrame) -> Result<VideoFrame> {
        self.binder.bind(pipeline, index, input)?;
        let rendered = pipeline.render()?;
        if rendered.data.len() != rendered.expected_len() {
            return Err(anyhow!("Readback returned {} bytes for {}x{}", rendered.data.len(), rendered.width, rendered.height));
        }
        Ok(rendered)
    }
}
