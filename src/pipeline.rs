//! One rendering job, end to end.
//!
//! A job probes the input video, prepares frames through the selected
//! [`VideoStrategy`], analyses the audio, compiles the shader on a private GPU
//! context, runs the [`RenderLoop`] and finally encodes the output. Every
//! fatal failure comes back as a [`PipelineError`] after a 0 % `error`
//! progress update; the job's temporary directory is removed on every path.

use crate::audio::{self, AudioFeatureSet, AudioSpectrum, AudioTrack, ReactivitySettings};
use crate::config::{AudioTextureKind, ShaderConfig, ShaderConfigSet, DEFAULT_OVERSAMPLE};
use crate::error::{PipelineError, PipelineResult};
use crate::progress::{ProgressReporter, ProgressSink, ProgressUpdate, Stage};
use crate::render::{CancelToken, FrameBinder, RenderLoop, RenderStats, DEFAULT_PROGRESS_INTERVAL};
use crate::shader::{GpuContext, ShaderPipeline, UniformValue, WgpuPipeline};
use crate::video::{
    self, EncodeSettings, FfmpegEncoder, FfmpegFrameReader, FrameSink, FrameSource, PngSequenceSink,
    PngSequenceSource, VideoStrategy,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tempfile::TempDir;
use tracing::{error, info, warn};

/// Default base resolution of the output.
pub const DEFAULT_RESOLUTION: (u32, u32) = (1280, 720);
pub const DEFAULT_CRF: u8 = 18;

/// Everything needed to render one video. Consumed by [`run_job`] or [`spawn_job`].
#[derive(Debug, Clone)]
pub struct ShaderJob {
    pub video: PathBuf,
    pub audio: PathBuf,
    /// GLSL fragment shader file; its source is read when the job starts.
    pub shader: PathBuf,
    pub output: PathBuf,
    pub uniforms: BTreeMap<String, UniformValue>,
    /// Base (output) resolution.
    pub resolution: (u32, u32),
    /// Explicit frame rate; `None` uses the probed input rate.
    pub frame_rate: Option<f64>,
    /// Preview mode: stop after this many frames.
    pub max_frames: Option<usize>,
    pub reactivity: ReactivitySettings,
    pub strategy: VideoStrategy,
    pub shader_config: ShaderConfig,
    pub textures_dir: PathBuf,
    pub oversample: f64,
    pub progress_interval: usize,
    pub crf: u8,
}

impl ShaderJob {
    /// A job with default settings and the built-in configuration for the shader's file name.
    pub fn new(
        video: impl Into<PathBuf>,
        audio: impl Into<PathBuf>,
        shader: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
    ) -> Self {
        let shader = shader.into();
        let shader_config = ShaderConfigSet::default().resolve(&shader_file_name(&shader));
        Self {
            video: video.into(),
            audio: audio.into(),
            shader,
            output: output.into(),
            uniforms: BTreeMap::new(),
            resolution: DEFAULT_RESOLUTION,
            frame_rate: None,
            max_frames: None,
            reactivity: ReactivitySettings::default(),
            strategy: VideoStrategy::default(),
            shader_config,
            textures_dir: PathBuf::from("Textures"),
            oversample: DEFAULT_OVERSAMPLE,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            crf: DEFAULT_CRF,
        }
    }

    /// Reactivity actually applied: non-reactive shaders get silent features.
    fn effective_reactivity(&self) -> ReactivitySettings {
        if self.shader_config.audio_reactive {
            self.reactivity
        } else {
            ReactivitySettings::none()
        }
    }
}

/// File name component of a shader path, used as its configuration key.
pub fn shader_file_name(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}

/// Runs `job` on the calling thread and returns the output path.
pub fn run_job(job: &ShaderJob, progress: Option<&dyn ProgressSink>, cancel: &CancelToken) -> PipelineResult<PathBuf> {
    let mut reporter = ProgressReporter::new(progress);
    match execute(job, &mut reporter, cancel) {
        Ok(stats) => {
            info!("Job complete: {} frames -> {:?}", stats.frames, job.output);
            reporter.report(100, Stage::Complete, "Processing complete", job.output.display().to_string());
            Ok(job.output.clone())
        }
        Err(e) => {
            error!("Job failed: {}", e);
            reporter.error(e.to_string());
            Err(e)
        }
    }
}

/// Frame source and sink for one strategy, plus the frame count they cover when known.
struct FrameIo {
    source: Box<dyn FrameSource>,
    sink: Box<dyn FrameSink>,
    frames: Option<usize>,
}

fn execute(job: &ShaderJob, reporter: &mut ProgressReporter<'_>, cancel: &CancelToken) -> PipelineResult<RenderStats> {
    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled { frames: 0 });
    }
    reporter.report(0, Stage::Extracting, "Starting", job.shader.display().to_string());

    let source = fs::read_to_string(&job.shader)
        .map_err(|e| PipelineError::io(format!("failed to read shader {:?}: {}", job.shader, e)))?;

    if !video::is_ffmpeg_on_path() {
        return Err(PipelineError::decode("ffmpeg was not found on PATH"));
    }
    let info = video::probe(&job.video).map_err(|e| PipelineError::decode(format!("{:#}", e)))?;
    let frame_rate = job.frame_rate.map(video::sanitize_frame_rate).unwrap_or(info.frame_rate);
    let working = job.shader_config.working_resolution(job.resolution, job.oversample);
    if working != job.resolution {
        info!(
            "Shake compensation: rendering at {}x{} for {}x{} output",
            working.0, working.1, job.resolution.0, job.resolution.1
        );
    }

    let temp = tempfile::Builder::new()
        .prefix("shadervid-")
        .tempdir()
        .map_err(|e| PipelineError::io(format!("failed to create temporary directory: {}", e)))?;
    let mut io = open_frame_io(job, &temp, working, frame_rate, info.estimated_frames(frame_rate))?;
    let detail = match io.frames {
        Some(frames) => format!("{} frames", frames),
        None => "frame count unknown".to_string(),
    };
    reporter.report(10, Stage::Extracting, "Frames ready", detail);

    reporter.report(10, Stage::Analyzing, "Analyzing audio", job.audio.display().to_string());
    let (features, spectrum) = analyze_audio(job, frame_rate, io.frames);
    let expected_frames = io.frames.or(features.as_ref().map(AudioFeatureSet::len)).unwrap_or(0);
    reporter.report(20, Stage::Analyzing, "Audio analysis complete", String::new());

    let context = GpuContext::headless().map_err(|e| PipelineError::gpu(format!("{:#}", e)))?;
    let mut pipeline = WgpuPipeline::with_context(context, working.0, working.1, &source)
        .map_err(|e| PipelineError::shader(format!("{:#}", e)))?;
    reporter.report(25, Stage::Rendering, "Shader compiled", format!("{}x{}", working.0, working.1));

    let mut binder = FrameBinder::new(job.shader_config.clone(), &job.textures_dir, working, frame_rate)
        .with_overrides(&job.uniforms);
    if let Some(features) = features {
        binder = binder.with_features(features);
    }
    if let Some(spectrum) = spectrum {
        binder = binder.with_spectrum(spectrum);
    }
    let mut render_loop = RenderLoop::new(binder)
        .with_frame_cap(job.max_frames)
        .with_expected_frames(expected_frames)
        .with_progress_interval(job.progress_interval)
        .with_cancel_token(cancel.clone());

    render_stage(&mut render_loop, &mut pipeline, io.source.as_mut(), io.sink.as_mut(), reporter)
}

/// Opens the strategy's source and sink inside `temp`.
fn open_frame_io(
    job: &ShaderJob,
    temp: &TempDir,
    (width, height): (u32, u32),
    frame_rate: f64,
    estimated: Option<usize>,
) -> PipelineResult<FrameIo> {
    let settings = EncodeSettings {
        output: job.output.clone(),
        audio: job.audio.clone(),
        width: job.resolution.0,
        height: job.resolution.1,
        frame_rate,
        crf: job.crf,
    };
    match job.strategy {
        VideoStrategy::Batch => {
            let frames_dir = temp.path().join("frames");
            let rendered_dir = temp.path().join("rendered");
            for dir in [&frames_dir, &rendered_dir] {
                fs::create_dir_all(dir).map_err(|e| PipelineError::io(format!("failed to create {:?}: {}", dir, e)))?;
            }
            let count = video::extract_png_sequence(&job.video, &frames_dir, width, height, frame_rate, job.max_frames)
                .map_err(|e| PipelineError::decode(format!("{:#}", e)))?;
            Ok(FrameIo {
                source: Box::new(PngSequenceSource::new(frames_dir, count)),
                sink: Box::new(PngSequenceSink::new(rendered_dir, settings)),
                frames: Some(count),
            })
        }
        VideoStrategy::Streaming => {
            let reader = FfmpegFrameReader::open(&job.video, width, height, Some(frame_rate), job.max_frames)
                .map_err(|e| PipelineError::decode(format!("{:#}", e)))?;
            let encoder = FfmpegEncoder::new(settings).map_err(|e| PipelineError::encode(format!("{:#}", e)))?;
            let frames = match (estimated, job.max_frames) {
                (Some(n), Some(cap)) => Some(n.min(cap)),
                (Some(n), None) => Some(n),
                (None, cap) => cap,
            };
            Ok(FrameIo { source: Box::new(reader), sink: Box::new(encoder), frames })
        }
    }
}

/// Decodes the audio once and derives whatever the shader consumes.
///
/// Never fails: decode errors degrade to silent features and an empty spectrum.
/// `frames` is the job's frame count; when the video could not tell, the
/// audio's own length at `frame_rate` is used instead.
fn analyze_audio(
    job: &ShaderJob,
    frame_rate: f64,
    frames: Option<usize>,
) -> (Option<AudioFeatureSet>, Option<AudioSpectrum>) {
    let config = &job.shader_config;
    if !config.audio_reactive && !config.needs_audio_texture {
        info!("Shader is not audio reactive, skipping audio analysis");
        return (None, None);
    }
    analyze_track(job, audio::decode::decode(&job.audio), frame_rate, frames)
}

fn analyze_track(
    job: &ShaderJob,
    track: anyhow::Result<AudioTrack>,
    frame_rate: f64,
    frames: Option<usize>,
) -> (Option<AudioFeatureSet>, Option<AudioSpectrum>) {
    let config = &job.shader_config;
    let wants_spectrum = config.needs_audio_texture && config.audio_texture == AudioTextureKind::Fft;
    let reactivity = job.effective_reactivity();

    match track {
        Ok(track) => {
            let frames = frames.unwrap_or_else(|| {
                let from_audio = (track.duration_secs() * frame_rate).ceil() as usize;
                info!("Video frame count unknown, sizing audio features from the track: {} frames", from_audio);
                from_audio
            });
            let features = audio::extract_from_track(&track, frame_rate, frames, &reactivity);
            let spectrum = wants_spectrum.then(|| {
                AudioSpectrum::from_track(&track, frame_rate, frames).unwrap_or_else(|e| {
                    warn!("Spectrum analysis failed, using a silent spectrum: {:#}", e);
                    AudioSpectrum::zeros(frames)
                })
            });
            (Some(features), spectrum)
        }
        Err(e) => {
            warn!("Audio decode failed, using silent features: {:#}", e);
            let frames = frames.unwrap_or(0);
            (Some(AudioFeatureSet::zeros(frames)), wants_spectrum.then(|| AudioSpectrum::zeros(frames)))
        }
    }
}

/// Renders every frame, then finishes the sink (25 → 85 → encoded).
fn render_stage(
    render_loop: &mut RenderLoop,
    pipeline: &mut dyn ShaderPipeline,
    source: &mut dyn FrameSource,
    sink: &mut dyn FrameSink,
    reporter: &mut ProgressReporter<'_>,
) -> PipelineResult<RenderStats> {
    let stats = render_loop.run(pipeline, source, sink, reporter)?;
    if stats.frames == 0 {
        return Err(PipelineError::decode("input video produced no frames"));
    }
    reporter.report(85, Stage::Combining, "Encoding output", format!("{} frames", stats.frames));
    sink.finish().map_err(|e| PipelineError::encode(format!("{:#}", e)))?;
    Ok(stats)
}

/// Handle to a job running on its own thread.
pub struct JobHandle {
    cancel: CancelToken,
    stage: Arc<Mutex<Stage>>,
    thread: JoinHandle<PipelineResult<PathBuf>>,
}

impl JobHandle {
    /// Requests cancellation; the job stops before its next frame.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Stage of the most recent progress update.
    pub fn state(&self) -> Stage {
        self.stage.lock().map(|s| *s).unwrap_or(Stage::Error)
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Waits for the job and returns its result.
    pub fn join(self) -> PipelineResult<PathBuf> {
        self.thread.join().unwrap_or_else(|_| Err(PipelineError::io("job thread panicked")))
    }
}

/// Tracks the current stage while forwarding updates.
struct StageTracker {
    stage: Arc<Mutex<Stage>>,
    inner: Option<Arc<dyn ProgressSink>>,
}

impl ProgressSink for StageTracker {
    fn update(&self, update: ProgressUpdate) {
        if let Ok(mut stage) = self.stage.lock() {
            *stage = update.stage;
        }
        if let Some(inner) = &self.inner {
            inner.update(update);
        }
    }
}

/// Runs `job` on a dedicated thread.
pub fn spawn_job(job: ShaderJob, progress: Option<Arc<dyn ProgressSink>>) -> PipelineResult<JobHandle> {
    let cancel = CancelToken::new();
    let stage = Arc::new(Mutex::new(Stage::Extracting));
    let tracker = StageTracker { stage: stage.clone(), inner: progress };
    let token = cancel.clone();
    let thread = thread::Builder::new()
        .name("shadervid-job".to_string())
        .spawn(move || run_job(&job, Some(&tracker), &token))
        .map_err(|e| PipelineError::io(format!("failed to spawn job thread: {}", e)))?;
    Ok(JobHandle { cancel, stage, thread })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::RecordingProgress;
    use crate::render::tests::{input_frames, FakePipeline, VecSink, VecSource};
    use crate::frame::VideoFrame;
    use anyhow::{anyhow, Result};

    fn job_in(dir: &Path) -> ShaderJob {
        let shader = dir.join("Plain.glsl");
        fs::write(&shader, "void main() { fragColor = vec4(1.0); }").unwrap();
        ShaderJob::new(dir.join("missing.mp4"), dir.join("missing.wav"), shader, dir.join("out.mp4"))
    }

    #[test]
    fn new_job_uses_builtin_shake_classification() {
        let job = ShaderJob::new("in.mp4", "in.wav", "Shaders/CameraShake.glsl", "out.mp4");
        assert!(job.shader_config.is_shake_compensated());
        assert_eq!(job.shader_config.working_resolution(job.resolution, job.oversample), (1536, 864));
        let plain = ShaderJob::new("in.mp4", "in.wav", "Shaders/Plain.glsl", "out.mp4");
        assert!(!plain.shader_config.is_shake_compensated());
    }

    #[test]
    fn missing_shader_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let job = ShaderJob::new("in.mp4", "in.wav", dir.path().join("absent.glsl"), dir.path().join("out.mp4"));
        let progress = RecordingProgress::new();
        let err = run_job(&job, Some(&progress), &CancelToken::new()).unwrap_err();
        assert!(matches!(err, PipelineError::Io(_)));
        let last = progress.last().unwrap();
        assert_eq!((last.percent, last.stage), (0, Stage::Error));
    }

    #[test]
    fn missing_video_is_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_job(&job_in(dir.path()), None, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, PipelineError::VideoDecode(_)), "{:?}", err);
        assert!(!dir.path().join("out.mp4").exists());
    }

    #[test]
    fn cancelled_job_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancelToken::new();
        token.cancel();
        let err = run_job(&job_in(dir.path()), None, &token).unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled { frames: 0 }));
    }

    #[test]
    fn non_reactive_shader_gets_silent_settings() {
        let mut job = ShaderJob::new("in.mp4", "in.wav", "Plain.glsl", "out.mp4");
        assert_eq!(job.effective_reactivity(), job.reactivity);
        job.shader_config.audio_reactive = false;
        assert_eq!(job.effective_reactivity(), ReactivitySettings::none());
        let (features, spectrum) = analyze_audio(&job, 30.0, Some(10));
        assert!(features.is_none() && spectrum.is_none());
    }

    #[test]
    fn unreadable_audio_degrades_to_silence() {
        let mut job = ShaderJob::new("in.mp4", "/nonexistent/track.wav", "Plain.glsl", "out.mp4");
        job.shader_config.needs_audio_texture = true;
        job.shader_config.audio_texture = AudioTextureKind::Fft;
        let (features, spectrum) = analyze_audio(&job, 30.0, Some(12));
        assert_eq!(features, Some(AudioFeatureSet::zeros(12)));
        assert_eq!(spectrum.map(|s| s.len()), Some(12));
    }

    #[test]
    fn unknown_frame_count_follows_audio_length() {
        let mut job = ShaderJob::new("in.mp4", "in.wav", "Plain.glsl", "out.mp4");
        job.shader_config.needs_audio_texture = true;
        job.shader_config.audio_texture = AudioTextureKind::Fft;
        let rate = 22_050;
        let samples = (0..rate * 2).map(|i| (i as f32 * 0.05).sin() * 0.5).collect();
        let track = AudioTrack::new(samples, rate as u32);

        let (features, spectrum) = analyze_track(&job, Ok(track), 30.0, None);
        assert_eq!(features.map(|f| f.len()), Some(60));
        assert_eq!(spectrum.map(|s| s.len()), Some(60));

        let (features, _) = analyze_track(&job, Err(anyhow!("no audio")), 30.0, None);
        assert_eq!(features.map(|f| f.len()), Some(0));
    }

    #[test]
    fn render_stage_finishes_sink_and_reports_combining() {
        let res = (4, 4);
        let progress = RecordingProgress::new();
        let mut reporter = ProgressReporter::new(Some(&progress));
        reporter.report(25, Stage::Rendering, "Shader compiled", "");
        let mut render_loop = RenderLoop::new(FrameBinder::new(ShaderConfig::default(), ".", res, 30.0))
            .with_expected_frames(4)
            .with_progress_interval(2);
        let mut pipeline = FakePipeline::new(res, &[]);
        let mut source = VecSource(input_frames(4, res).into_iter());
        let mut sink = VecSink::default();

        let stats = render_stage(&mut render_loop, &mut pipeline, &mut source, &mut sink, &mut reporter).unwrap();
        assert_eq!(stats.frames, 4);
        assert!(sink.finished);

        let updates = progress.updates();
        let percents: Vec<u8> = updates.iter().map(|u| u.percent).collect();
        assert_eq!(percents, vec![25, 55, 85, 85]);
        assert_eq!(updates.last().unwrap().stage, Stage::Combining);
    }

    struct BrokenSink;

    impl FrameSink for BrokenSink {
        fn write_frame(&mut self, _frame: &VideoFrame) -> Result<()> {
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            Err(anyhow!("disk full"))
        }
    }

    #[test]
    fn sink_failure_is_an_encode_error() {
        let res = (2, 2);
        let mut reporter = ProgressReporter::new(None);
        let mut render_loop = RenderLoop::new(FrameBinder::new(ShaderConfig::default(), ".", res, 30.0));
        let mut pipeline = FakePipeline::new(res, &[]);
        let mut source = VecSource(input_frames(2, res).into_iter());
        let err = render_stage(&mut render_loop, &mut pipeline, &mut source, &mut BrokenSink, &mut reporter).unwrap_err();
        assert!(matches!(err, PipelineError::Encode(ref msg) if msg.contains("disk full")));
    }

    #[test]
    fn empty_input_is_a_decode_error() {
        let res = (2, 2);
        let mut reporter = ProgressReporter::new(None);
        let mut render_loop = RenderLoop::new(FrameBinder::new(ShaderConfig::default(), ".", res, 30.0));
        let mut pipeline = FakePipeline::new(res, &[]);
        let mut source = VecSource(Vec::new().into_iter());
        let mut sink = VecSink::default();
        let err = render_stage(&mut render_loop, &mut pipeline, &mut source, &mut sink, &mut reporter).unwrap_err();
        assert!(matches!(err, PipelineError::VideoDecode(_)));
        assert!(!sink.finished);
    }

    #[test]
    fn spawned_job_reports_failure_state() {
        let dir = tempfile::tempdir().unwrap();
        let job = ShaderJob::new("in.mp4", "in.wav", dir.path().join("absent.glsl"), dir.path().join("out.mp4"));
        let progress = Arc::new(RecordingProgress::new());
        let handle = spawn_job(job, Some(progress.clone() as Arc<dyn ProgressSink>)).unwrap();
        while !handle.is_finished() {
            thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(handle.state(), Stage::Error);
        assert!(matches!(handle.join(), Err(PipelineError::Io(_))));
        assert_eq!(progress.last().map(|u| u.stage), Some(Stage::Error));
    }
}
