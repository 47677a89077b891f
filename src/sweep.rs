//! Preview sweep over every configured shader.

use crate::audio::ReactivitySettings;
use crate::config::{ShaderConfig, ShaderConfigSet};
use crate::error::PipelineResult;
use crate::pipeline::ShaderJob;
use crate::settings::Settings;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{error, info};

pub const DEFAULT_PREVIEW_FRAMES: usize = 250;

/// Shared inputs for every preview.
#[derive(Debug, Clone)]
pub struct SweepOptions {
    pub video: PathBuf,
    pub audio: PathBuf,
    pub output_dir: PathBuf,
    pub frames: usize,
}

/// Builds the preview job for one shader: its default uniforms, a frame cap,
/// and silent audio when it is not audio reactive.
pub fn preview_job(name: &str, config: &ShaderConfig, settings: &Settings, options: &SweepOptions) -> ShaderJob {
    let stem = Path::new(name).file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_else(|| name.to_string());
    let mut job = ShaderJob::new(
        &options.video,
        &options.audio,
        settings.shaders_dir.join(name),
        options.output_dir.join(format!("{}.mp4", stem)),
    );
    job.uniforms = config.uniforms.clone();
    job.shader_config = config.clone();
    job.max_frames = Some(options.frames);
    job.resolution = (settings.width, settings.height);
    job.frame_rate = settings.frame_rate;
    job.strategy = settings.strategy;
    job.textures_dir = settings.textures_dir.clone();
    job.oversample = settings.oversample;
    job.progress_interval = settings.progress_interval;
    job.crf = settings.crf;
    job.reactivity = if config.audio_reactive { ReactivitySettings::default() } else { ReactivitySettings::none() };
    job
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepResult {
    pub shader: String,
    /// Output path on success, error message on failure.
    pub outcome: Result<PathBuf, String>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub results: Vec<SweepResult>,
    pub elapsed: Duration,
}

impl SweepReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &SweepResult> {
        self.results.iter().filter(|r| r.outcome.is_ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = &SweepResult> {
        self.results.iter().filter(|r| r.outcome.is_err())
    }

    pub fn all_passed(&self) -> bool {
        self.failed().next().is_none()
    }

    pub fn summary(&self) -> String {
        let total = self.results.len();
        let ok = self.succeeded().count();
        let rate = if total == 0 { 0.0 } else { ok as f64 / total as f64 * 100.0 };
        let mut out = String::new();
        let _ = writeln!(out, "Shader sweep report");
        let _ = writeln!(out, "Total shaders tested: {}", total);
        let _ = writeln!(out, "Successful: {}", ok);
        let _ = writeln!(out, "Failed: {}", total - ok);
        let _ = writeln!(out, "Success rate: {:.1}%", rate);
        let _ = writeln!(out, "Total duration: {:.1}s", self.elapsed.as_secs_f64());
        let _ = writeln!(out, "\nSuccessful shaders:");
        for result in self.succeeded() {
            let _ = writeln!(out, "  ok    {} ({:.1}s)", result.shader, result.elapsed.as_secs_f64());
        }
        let _ = writeln!(out, "\nFailed shaders:");
        for result in self.failed() {
            if let Err(message) = &result.outcome {
                let _ = writeln!(out, "  FAIL  {}: {}", result.shader, message);
            }
        }
        out
    }
}

/// Renders a preview of every shader in `configs`, in name order, with `run`.
///
/// A failing shader is recorded and the sweep moves on.
pub fn run_sweep<F>(configs: &ShaderConfigSet, settings: &Settings, options: &SweepOptions, mut run: F) -> SweepReport
where
    F: FnMut(&ShaderJob) -> PipelineResult<PathBuf>,
{
    let start = Instant::now();
    let total = configs.len();
    let mut results = Vec::with_capacity(total);
    for (index, name) in configs.names().enumerate() {
        info!("[{}/{}] Previewing {}", index + 1, total, name);
        let job = preview_job(name, &configs.resolve(name), settings, options);
        let shader_start = Instant::now();
        let outcome = run(&job).map_err(|e| e.to_string());
        match &outcome {
            Ok(path) => info!("{} rendered to {:?}", name, path),
            Err(message) => error!("{} failed: {}", name, message),
        }
        results.push(SweepResult { shader: name.to_string(), outcome, elapsed: shader_start.elapsed() });
    }
    SweepReport { results, elapsed: start.elapsed() }
}
