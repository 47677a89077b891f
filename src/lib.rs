//! shadervid: audio-reactive GLSL shader compositor for video files.
//!
//! Decodes a video, analyses an audio track into per-frame features, renders a
//! fragment shader over every frame off-screen on the GPU, and encodes the
//! result with the audio muxed back in.

pub mod audio;
pub mod config;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod progress;
pub mod render;
pub mod settings;
pub mod shader;
pub mod sweep;
pub mod texture;
pub mod video;

pub use error::{PipelineError, PipelineResult};
pub use pipeline::{run_job, spawn_job, JobHandle, ShaderJob};
pub use render::CancelToken;
