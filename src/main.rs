//! shadervid: audio-reactive GLSL shader compositor CLI.

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use shadervid::audio::{ReactivityPreset, ReactivitySettings};
use shadervid::pipeline::{self, ShaderJob};
use shadervid::progress::{LogProgress, ProgressSink};
use shadervid::render::CancelToken;
use shadervid::settings::{self, Settings};
use shadervid::shader::UniformValue;
use shadervid::sweep::{self, SweepOptions, DEFAULT_PREVIEW_FRAMES};
use shadervid::video::VideoStrategy;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Audio-reactive shader compositor for video files.
#[derive(Parser, Debug)]
#[command(name = "shadervid")]
#[command(about = "Render GLSL shaders over a video, driven by an audio track")]
struct Cli {
    /// YAML settings file (defaults to ./shadervid.yaml when present)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render one shader over a video
    Render(RenderArgs),
    /// List configured shaders
    List {
        /// Only shaders in this category
        #[arg(long)]
        category: Option<String>,
    },
    /// Compare the shader configuration with the shader files on disk
    Check,
    /// Render a short preview of every configured shader
    Sweep(SweepArgs),
}

/// Flags that override the settings file.
#[derive(Args, Debug, Default)]
struct OutputArgs {
    /// Output width
    #[arg(long)]
    width: Option<u32>,

    /// Output height
    #[arg(long)]
    height: Option<u32>,

    /// Output frame rate (defaults to the input's)
    #[arg(long)]
    fps: Option<f64>,

    /// Frame I/O strategy
    #[arg(long, value_enum)]
    strategy: Option<VideoStrategy>,

    /// Directory holding auxiliary channel textures
    #[arg(long)]
    textures_dir: Option<PathBuf>,

    /// Shader configuration JSON
    #[arg(long)]
    shader_config: Option<PathBuf>,
}

impl OutputArgs {
    fn apply(&self, settings: &mut Settings) {
        if let Some(width) = self.width {
            settings.width = width;
        }
        if let Some(height) = self.height {
            settings.height = height;
        }
        if self.fps.is_some() {
            settings.frame_rate = self.fps;
        }
        if let Some(strategy) = self.strategy {
            settings.strategy = strategy;
        }
        if let Some(dir) = &self.textures_dir {
            settings.textures_dir = dir.clone();
        }
        if let Some(path) = &self.shader_config {
            settings.shader_config = Some(path.clone());
        }
    }
}

#[derive(Args, Debug)]
struct RenderArgs {
    /// Input video
    #[arg(short, long)]
    video: PathBuf,

    /// Audio track driving the shader and muxed into the output
    #[arg(short, long)]
    audio: PathBuf,

    /// GLSL fragment shader; a bare file name is looked up in the shaders directory
    #[arg(short, long)]
    shader: PathBuf,

    /// Output file
    #[arg(short, long)]
    output: PathBuf,

    /// Uniform override `name=value`; value may be a number, a JSON array or text
    #[arg(short, long = "uniform", value_parser = parse_uniform)]
    uniforms: Vec<(String, UniformValue)>,

    /// Stop after this many frames
    #[arg(long)]
    frames: Option<usize>,

    /// Reactivity preset
    #[arg(long, value_enum)]
    preset: Option<ReactivityPreset>,

    #[arg(long)]
    beat_sensitivity: Option<f32>,

    #[arg(long)]
    bass_response: Option<f32>,

    #[arg(long)]
    mid_response: Option<f32>,

    #[arg(long)]
    treble_response: Option<f32>,

    /// H.264 constant rate factor
    #[arg(long)]
    crf: Option<u8>,

    #[command(flatten)]
    output_args: OutputArgs,
}

impl RenderArgs {
    fn reactivity(&self, base: ReactivitySettings) -> ReactivitySettings {
        ReactivitySettings {
            preset: self.preset.unwrap_or(base.preset),
            beat_sensitivity: self.beat_sensitivity.unwrap_or(base.beat_sensitivity),
            bass_response: self.bass_response.unwrap_or(base.bass_response),
            mid_response: self.mid_response.unwrap_or(base.mid_response),
            treble_response: self.treble_response.unwrap_or(base.treble_response),
        }
    }
}

#[derive(Args, Debug)]
struct SweepArgs {
    /// Input video shared by every preview
    #[arg(short, long)]
    video: PathBuf,

    /// Audio track shared by every preview
    #[arg(short, long)]
    audio: PathBuf,

    /// Directory receiving `<shader>.mp4` and the report
    #[arg(long, default_value = "Outputs")]
    output_dir: PathBuf,

    /// Frames per preview
    #[arg(short, long, default_value_t = DEFAULT_PREVIEW_FRAMES)]
    frames: usize,

    /// Only shaders in this category
    #[arg(long)]
    category: Option<String>,

    #[command(flatten)]
    output_args: OutputArgs,
}

/// Parses `name=value` for `--uniform`.
fn parse_uniform(raw: &str) -> Result<(String, UniformValue), String> {
    let (name, value) = raw.split_once('=').ok_or_else(|| format!("expected name=value, got {:?}", raw))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing uniform name in {:?}", raw));
    }
    Ok((name.to_string(), UniformValue::parse(value.trim())))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut settings = Settings::discover(cli.settings.as_deref())?;

    match cli.command {
        Command::Render(args) => {
            args.output_args.apply(&mut settings);
            if let Some(crf) = args.crf {
                settings.crf = crf;
            }
            settings.validate()?;
            run_render(args, &settings)
        }
        Command::List { category } => run_list(&settings, category.as_deref()),
        Command::Check => run_check(&settings),
        Command::Sweep(args) => {
            args.output_args.apply(&mut settings);
            settings.validate()?;
            run_sweep(args, &settings)
        }
    }
}

fn install_cancel_handler(token: CancelToken) -> Result<()> {
    ctrlc::set_handler(move || {
        info!("Received interrupt signal, cancelling...");
        token.cancel();
    })?;
    Ok(())
}

fn run_render(args: RenderArgs, settings: &Settings) -> Result<()> {
    let shader = if args.shader.exists() || args.shader.components().count() > 1 {
        args.shader.clone()
    } else {
        settings.shaders_dir.join(&args.shader)
    };
    let configs = settings.load_shader_configs();
    let shader_config = configs.resolve(&pipeline::shader_file_name(&shader));

    let mut job = ShaderJob::new(&args.video, &args.audio, shader, &args.output);
    job.uniforms = args.uniforms.iter().cloned().collect::<BTreeMap<_, _>>();
    job.reactivity = args.reactivity(settings.reactivity);
    job.shader_config = shader_config;
    job.resolution = (settings.width, settings.height);
    job.frame_rate = settings.frame_rate;
    job.max_frames = args.frames;
    job.strategy = settings.strategy;
    job.textures_dir = settings.textures_dir.clone();
    job.oversample = settings.oversample;
    job.progress_interval = settings.progress_interval;
    job.crf = settings.crf;

    info!("Starting shadervid...");
    let progress: Arc<dyn ProgressSink> = Arc::new(LogProgress::new());
    let handle = pipeline::spawn_job(job, Some(progress))?;
    install_cancel_handler(handle.cancel_token())?;

    let output = handle.join()?;
    println!("{}", output.display());
    Ok(())
}

fn run_list(settings: &Settings, category: Option<&str>) -> Result<()> {
    let configs = settings.load_shader_configs();
    let configs = match category {
        Some(category) => configs.filter_category(category),
        None => configs,
    };
    if configs.is_empty() {
        println!("No configured shaders found in {:?}", settings.shader_config_path());
        return Ok(());
    }
    for (name, config) in configs.iter() {
        let audio = if config.audio_reactive { "audio" } else { "-" };
        println!("  {:<40} {:<16} {}", name, config.category, audio);
    }
    println!("{} shader(s); categories: {}", configs.len(), configs.categories().join(", "));
    Ok(())
}

fn run_check(settings: &Settings) -> Result<()> {
    let configs = settings.load_shader_configs();
    let files = settings::discover_shaders(&settings.shaders_dir)?;
    let inventory = settings::check_shaders(&configs, &files);

    println!("Configured shaders: {}", configs.len());
    println!("Shader files:       {}", files.len());
    if !inventory.unconfigured.is_empty() {
        println!("\nShader files without configuration (defaults apply):");
        for name in &inventory.unconfigured {
            println!("  {}", name);
        }
    }
    if !inventory.missing.is_empty() {
        println!("\nConfigured shaders without a file:");
        for name in &inventory.missing {
            println!("  {}", name);
        }
        return Err(anyhow!("{} configured shader(s) are missing", inventory.missing.len()));
    }
    if inventory.is_consistent() {
        println!("\nConfiguration and shader files match.");
    }
    Ok(())
}

fn run_sweep(args: SweepArgs, settings: &Settings) -> Result<()> {
    let configs = settings.load_shader_configs();
    let configs = match &args.category {
        Some(category) => configs.filter_category(category),
        None => configs,
    };
    if configs.is_empty() {
        warn!("No shaders to sweep");
        return Ok(());
    }
    fs::create_dir_all(&args.output_dir)
        .map_err(|e| anyhow!("Failed to create output directory {:?}: {}", args.output_dir, e))?;

    let cancel = CancelToken::new();
    install_cancel_handler(cancel.clone())?;
    let options = SweepOptions {
        video: args.video.clone(),
        audio: args.audio.clone(),
        output_dir: args.output_dir.clone(),
        frames: args.frames,
    };
    let progress = LogProgress::new();
    let report = sweep::run_sweep(&configs, settings, &options, |job| {
        pipeline::run_job(job, Some(&progress), &cancel)
    });

    let summary = report.summary();
    println!("{}", summary);
    let report_path = args.output_dir.join("sweep_report.txt");
    match fs::write(&report_path, &summary) {
        Ok(()) => info!("Report saved to {:?}", report_path),
        Err(e) => error!("Failed to write report {:?}: {}", report_path, e),
    }

    if report.all_passed() {
        Ok(())
    } else {
        Err(anyhow!("{} shader(s) failed", report.failed().count()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_flags_parse() {
        assert_eq!(parse_uniform("speed=1.5").unwrap(), ("speed".to_string(), UniformValue::Number(1.5)));
        assert_eq!(
            parse_uniform("tint=[1, 0.5, 0]").unwrap(),
            ("tint".to_string(), UniformValue::Vector(vec![1.0, 0.5, 0.0]))
        );
        assert_eq!(parse_uniform("mood=calm").unwrap().1, UniformValue::Text("calm".into()));
        assert!(parse_uniform("novalue").is_err());
        assert!(parse_uniform("=3").is_err());
    }

    #[test]
    fn cli_parses_render() {
        let cli = Cli::try_parse_from([
            "shadervid", "render", "-v", "in.mp4", "-a", "song.wav", "-s", "Glow.glsl", "-o", "out.mp4",
            "-u", "speed=2", "--preset", "intense", "--bass-response", "1.5", "--strategy", "streaming",
        ])
        .unwrap();
        let Command::Render(args) = cli.command else {
            panic!("expected render");
        };
        assert_eq!(args.uniforms, vec![("speed".to_string(), UniformValue::Number(2.0))]);
        let reactivity = args.reactivity(ReactivitySettings::default());
        assert_eq!(reactivity.preset, ReactivityPreset::Intense);
        assert_eq!(reactivity.bass_response, 1.5);
        assert_eq!(reactivity.mid_response, 1.0);

        let mut settings = Settings::default();
        args.output_args.apply(&mut settings);
        assert_eq!(settings.strategy, VideoStrategy::Streaming);
        assert_eq!(settings.width, 1280);
    }

    #[test]
    fn sweep_defaults_to_250_frames() {
        let cli = Cli::try_parse_from(["shadervid", "sweep", "-v", "in.mp4", "-a", "song.wav"]).unwrap();
        let Command::Sweep(args) = cli.command else {
            panic!("expected sweep");
        };
        assert_eq!(args.frames, 250);
        assert_eq!(args.output_dir, PathBuf::from("Outputs"));
    }
}
