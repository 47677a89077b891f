//! GPU shader pipeline.

pub mod adapt;
mod gpu_context;
mod uniforms;
mod wgpu_pipeline;

pub use gpu_context::GpuContext;
pub use uniforms::{UniformBlock, UniformKind, UniformLayout, UniformSlot, UniformValue};
pub use wgpu_pipeline::WgpuPipeline;

use crate::frame::VideoFrame;
use anyhow::Result;

/// Handle to a texture uploaded once and kept for the lifetime of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(pub usize);

/// Trait for shader processing pipelines.
///
/// A pipeline owns one compiled fragment shader. Each frame the caller binds
/// channel textures and uniforms, then calls [`ShaderPipeline::render`].
pub trait ShaderPipeline {
    /// Size of the off-screen render target.
    fn resolution(&self) -> (u32, u32);

    /// Component count of a declared uniform, or `None` if the shader lacks it.
    fn uniform_components(&self, name: &str) -> Option<u32>;

    /// Sets a uniform. Returns `Ok(false)` when the shader does not declare `name`.
    fn set_uniform(&mut self, name: &str, values: &[f32]) -> Result<bool>;

    /// Uploads an image that stays resident until the pipeline is dropped.
    fn upload_texture(&mut self, image: &VideoFrame) -> Result<TextureId>;

    /// Binds a resident texture to `channel` for the next draw.
    fn bind_texture(&mut self, channel: usize, texture: TextureId) -> Result<()>;

    /// Uploads `frame` into the channel's per-frame texture and binds it.
    fn bind_frame(&mut self, channel: usize, frame: &VideoFrame) -> Result<()>;

    /// Unbinds every channel; unbound channels sample black.
    fn clear_channels(&mut self);

    /// Draws a full-screen quad and returns the image with top-left origin.
    fn render(&mut self) -> Result<VideoFrame>;
}
