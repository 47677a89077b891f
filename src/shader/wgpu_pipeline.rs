//! wgpu-based GPU shader pipeline.

use super::adapt::{self, texture_binding, AdaptedShader, UNIFORM_BINDING};
use super::{GpuContext, ShaderPipeline, TextureId, UniformBlock};
use crate::config::CHANNEL_COUNT;
use crate::frame::{PixelFormat, QuadVertex, VideoFrame};
use anyhow::{anyhow, Result};
use naga::front::glsl::{Frontend, Options};
use naga::valid::{Capabilities, ValidationFlags, Validator};
use naga::ShaderStage;
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{debug, error, info};
use wgpu::util::DeviceExt;

/// Full-screen quad vertex shader in WGSL.
///
/// Clip-space y is mirrored so framebuffer row 0 holds the bottom of the
/// image, matching the bottom-left origin desktop shaders are written for.
/// `v_text` runs 0..1 from bottom-left; readback flips rows back.
const VERTEX_SHADER: &str = r#"
struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) v_text: vec2<f32>,
}

@vertex
fn vs_main(@location(0) position: vec2<f32>) -> VertexOutput {
    var out: VertexOutput;
    out.clip_position = vec4<f32>(position.x, -position.y, 0.0, 1.0);
    out.v_text = position * 0.5 + vec2<f32>(0.5, 0.5);
    return out;
}
"#;

const OUTPUT_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelBinding {
    Empty,
    Stream,
    Resident(TextureId),
}

/// Per-channel texture rewritten every frame (video input, audio data).
struct StreamTexture {
    texture: wgpu::Texture,
    width: u32,
    height: u32,
}

/// GPU shader pipeline using wgpu.
pub struct WgpuPipeline {
    device: wgpu::Device,
    queue: wgpu::Queue,
    render_pipeline: wgpu::RenderPipeline,
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
    bind_group_layout: wgpu::BindGroupLayout,
    uniform_buffer: wgpu::Buffer,
    uniforms: UniformBlock,
    sampler: wgpu::Sampler,
    placeholder: wgpu::Texture,
    output_texture: wgpu::Texture,
    readback_buffer: wgpu::Buffer,
    padded_bytes_per_row: u32,
    output_width: u32,
    output_height: u32,
    channels: [ChannelBinding; CHANNEL_COUNT],
    stream_textures: [Option<StreamTexture>; CHANNEL_COUNT],
    resident_textures: Vec<wgpu::Texture>,
    declared_channels: [bool; CHANNEL_COUNT],
    frame_count: u64,
}

impl WgpuPipeline {
    /// Compiles `glsl` and allocates an off-screen target of `width` x `height`.
    pub fn new(width: u32, height: u32, glsl: &str) -> Result<Self> {
        let context = GpuContext::headless()?;
        Self::with_context(context, width, height, glsl)
    }

    pub fn with_context(context: GpuContext, width: u32, height: u32, glsl: &str) -> Result<Self> {
        let GpuContext { device, queue, .. } = context;
        // Errors outside a per-frame scope are logged; the default handler panics.
        device.on_uncaptured_error(Arc::new(|e: wgpu::Error| error!("Uncaptured GPU error: {}", e)));

        let adapted = adapt::adapt_glsl(glsl)?;
        let (fragment_wgsl, layout) = Self::glsl_to_wgsl(&adapted)?;
        info!(
            "Shader compiled ({} uniform(s): {})",
            layout.names().count(),
            layout.names().collect::<Vec<_>>().join(", ")
        );

        let vertex_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Vertex Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(VERTEX_SHADER)),
        });
        let fragment_module = validation_scope(&device, || {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("Fragment Shader"),
                source: wgpu::ShaderSource::Wgsl(Cow::Owned(fragment_wgsl)),
            })
        })
        .map_err(|e| anyhow!("Fragment shader rejected by the device: {:#}", e))?;

        let mut entries = vec![wgpu::BindGroupLayoutEntry {
            binding: UNIFORM_BINDING,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }];
        for channel in 0..CHANNEL_COUNT {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: texture_binding(channel),
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            });
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: texture_binding(channel) + 1,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                count: None,
            });
        }
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Channel Bind Group Layout"),
            entries: &entries,
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Render Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });

        let render_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Render Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &vertex_module,
                entry_point: Some("vs_main"),
                buffers: &[QuadVertex::layout()],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &fragment_module,
                entry_point: Some("main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: OUTPUT_FORMAT,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                polygon_mode: wgpu::PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview_mask: None,
            cache: None,
        });
        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Vertex Buffer"),
            contents: bytemuck::cast_slice(QuadVertex::VERTICES),
            usage: wgpu::BufferUsages::VERTEX,
        });

        let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Index Buffer"),
            contents: bytemuck::cast_slice(QuadVertex::INDICES),
            usage: wgpu::BufferUsages::INDEX,
        });

        // Repeat + linear matches the GL texture defaults the shaders were written against.
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Channel Sampler"),
            address_mode_u: wgpu::AddressMode::Repeat,
            address_mode_v: wgpu::AddressMode::Repeat,
            address_mode_w: wgpu::AddressMode::Repeat,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        let mut uniforms = UniformBlock::new(layout);
        for (name, values) in &adapted.defaults {
            uniforms.set(name, values)?;
        }
        let uniform_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Uniform Buffer"),
            contents: uniforms.bytes(),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        let placeholder = create_channel_texture(&device, "Placeholder Texture", 1, 1);
        write_rgba(&queue, &placeholder, 1, 1, &[0, 0, 0, 255]);

        let output_texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Output Texture"),
            size: wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: OUTPUT_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });

        let padded_bytes_per_row = padded_row_bytes(width);
        let readback_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Buffer"),
            size: (padded_bytes_per_row * height) as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        Ok(Self {
            device,
            queue,
            render_pipeline,
            vertex_buffer,
            index_buffer,
            bind_group_layout,
            uniform_buffer,
            uniforms,
            sampler,
            placeholder,
            output_texture,
            readback_buffer,
            padded_bytes_per_row,
            output_width: width,
            output_height: height,
            channels: [ChannelBinding::Empty; CHANNEL_COUNT],
            stream_textures: Default::default(),
            resident_textures: Vec::new(),
            declared_channels: adapted.channels,
            frame_count: 0,
        })
    }

    /// Converts the rewritten GLSL to WGSL and reflects its uniform block.
    fn glsl_to_wgsl(adapted: &AdaptedShader) -> Result<(String, super::UniformLayout)> {
        let mut frontend = Frontend::default();
        let options = Options::from(ShaderStage::Fragment);
        let module = frontend
            .parse(&options, &adapted.glsl)
            .map_err(|e| anyhow!("GLSL parse error: {:?}", e))?;

        let layout = adapt::reflect_uniforms(&module)?;

        let mut validator = Validator::new(ValidationFlags::all(), Capabilities::all());
        let info = validator.validate(&module).map_err(|e| anyhow!("Shader validation error: {:?}", e))?;
        let wgsl = naga::back::wgsl::write_string(&module, &info, naga::back::wgsl::WriterFlags::empty())
            .map_err(|e| anyhow!("WGSL generation error: {:?}", e))?;
        Ok((wgsl, layout))
    }

    /// Channels the shader declares a sampler for.
    pub fn declared_channels(&self) -> [bool; CHANNEL_COUNT] {
        self.declared_channels
    }

    /// Update or create the per-frame texture for a channel if its size changed.
    fn ensure_stream_texture(&mut self, channel: usize, width: u32, height: u32) -> &wgpu::Texture {
        let matches = matches!(&self.stream_textures[channel], Some(t) if t.width == width && t.height == height);
        if !matches {
            debug!("Creating stream texture for channel {} ({}x{})", channel, width, height);
            let texture = create_channel_texture(&self.device, &format!("Channel {} Stream Texture", channel), width, height);
            self.stream_textures[channel] = Some(StreamTexture { texture, width, height });
        }
        match &self.stream_textures[channel] {
            Some(stream) => &stream.texture,
            None => &self.placeholder,
        }
    }

    fn channel_view(&self, channel: usize) -> wgpu::TextureView {
        let texture = match self.channels[channel] {
            ChannelBinding::Empty => &self.placeholder,
            ChannelBinding::Stream => self.stream_textures[channel]
                .as_ref()
                .map(|s| &s.texture)
                .unwrap_or(&self.placeholder),
            ChannelBinding::Resident(id) => self.resident_textures.get(id.0).unwrap_or(&self.placeholder),
        };
        texture.create_view(&wgpu::TextureViewDescriptor::default())
    }

    /// Records the draw and the readback copy for the current bindings and submits them.
    fn submit_frame(&self) {
        self.queue.write_buffer(&self.uniform_buffer, 0, self.uniforms.bytes());

        let views: Vec<wgpu::TextureView> = (0..CHANNEL_COUNT).map(|c| self.channel_view(c)).collect();
        let mut entries = vec![wgpu::BindGroupEntry {
            binding: UNIFORM_BINDING,
            resource: self.uniform_buffer.as_entire_binding(),
        }];
        for (channel, view) in views.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: texture_binding(channel),
                resource: wgpu::BindingResource::TextureView(view),
            });
            entries.push(wgpu::BindGroupEntry {
                binding: texture_binding(channel) + 1,
                resource: wgpu::BindingResource::Sampler(&self.sampler),
            });
        }
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Channel Bind Group"),
            layout: &self.bind_group_layout,
            entries: &entries,
        });

        let output_view = self.output_texture.create_view(&wgpu::TextureViewDescriptor::default());
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Render Encoder") });
        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Render Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &output_view,
                    resolve_target: None,
                    ops: wgpu::Operations { load: wgpu::LoadOp::Clear(wgpu::Color::BLACK), store: wgpu::StoreOp::Store },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });

            render_pass.set_pipeline(&self.render_pipeline);
            render_pass.set_bind_group(0, &bind_group, &[]);
            render_pass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
            render_pass.set_index_buffer(self.index_buffer.slice(..), wgpu::IndexFormat::Uint16);
            render_pass.draw_indexed(0..6, 0, 0..1);
        }

        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo { texture: &self.output_texture, mip_level: 0, origin: wgpu::Origin3d::ZERO, aspect: wgpu::TextureAspect::All },
            wgpu::TexelCopyBufferInfo {
                buffer: &self.readback_buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(self.padded_bytes_per_row),
                    rows_per_image: Some(self.output_height),
                },
            },
            wgpu::Extent3d { width: self.output_width, height: self.output_height, depth_or_array_layers: 1 },
        );

        self.queue.submit(std::iter::once(encoder.finish()));
    }

    fn check_channel(channel: usize) -> Result<()> {
        if channel >= CHANNEL_COUNT {
            return Err(anyhow!("Channel {} out of range (0..{})", channel, CHANNEL_COUNT));
        }
        Ok(())
    }
}

impl ShaderPipeline for WgpuPipeline {
    fn resolution(&self) -> (u32, u32) {
        (self.output_width, self.output_height)
    }

    fn uniform_components(&self, name: &str) -> Option<u32> {
        self.uniforms.layout().get(name).map(|slot| slot.components)
    }

    fn set_uniform(&mut self, name: &str, values: &[f32]) -> Result<bool> {
        self.uniforms.set(name, values)
    }

    fn upload_texture(&mut self, image: &VideoFrame) -> Result<TextureId> {
        let rgba = image.to_rgba();
        let id = TextureId(self.resident_textures.len());
        let texture = create_channel_texture(&self.device, &format!("Resident Texture {}", id.0), rgba.width, rgba.height);
        write_rgba(&self.queue, &texture, rgba.width, rgba.height, &rgba.data);
        self.resident_textures.push(texture);
        Ok(id)
    }

    fn bind_texture(&mut self, channel: usize, texture: TextureId) -> Result<()> {
        Self::check_channel(channel)?;
        if texture.0 >= self.resident_textures.len() {
            return Err(anyhow!("Unknown texture id {}", texture.0));
        }
        self.channels[channel] = ChannelBinding::Resident(texture);
        Ok(())
    }

    fn bind_frame(&mut self, channel: usize, frame: &VideoFrame) -> Result<()> {
        Self::check_channel(channel)?;
        let rgba = frame.to_rgba();
        if rgba.data.len() != rgba.expected_len() {
            return Err(anyhow!("Frame buffer does not match {}x{}", rgba.width, rgba.height));
        }
        let texture = self.ensure_stream_texture(channel, rgba.width, rgba.height).clone();
        write_rgba(&self.queue, &texture, rgba.width, rgba.height, &rgba.data);
        self.channels[channel] = ChannelBinding::Stream;
        Ok(())
    }

    fn clear_channels(&mut self) {
        self.channels = [ChannelBinding::Empty; CHANNEL_COUNT];
    }

    fn render(&mut self) -> Result<VideoFrame> {
        let start = std::time::Instant::now();
        self.frame_count += 1;

        let frame = self.frame_count;
        validation_scope(&self.device, || self.submit_frame())
            .map_err(|e| anyhow!("GPU validation failed on frame {}: {:#}", frame, e))?;

        let buffer_slice = self.readback_buffer.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device
            .poll(wgpu::PollType::Wait { submission_index: None, timeout: None })
            .map_err(|e| anyhow!("GPU poll failed: {:?}", e))?;
        receiver.recv()??;

        let row_bytes = (self.output_width * 4) as usize;
        let mut output_data = Vec::with_capacity(row_bytes * self.output_height as usize);
        {
            let data = buffer_slice.get_mapped_range();
            for row in data.chunks(self.padded_bytes_per_row as usize).take(self.output_height as usize) {
                output_data.extend_from_slice(&row[..row_bytes]);
            }
        }
        self.readback_buffer.unmap();

        debug!("  [Perf] Frame {} draw + readback: {:?}", self.frame_count, start.elapsed());

        let rendered = VideoFrame::from_data(self.output_width, self.output_height, PixelFormat::Rgba, output_data);
        Ok(rendered.flip_vertical().to_rgb())
    }
}

/// Runs `f` inside a validation error scope and turns a captured error into `Err`.
fn validation_scope<T>(device: &wgpu::Device, f: impl FnOnce() -> T) -> Result<T> {
    let scope = device.push_error_scope(wgpu::ErrorFilter::Validation);
    let value = f();
    match pollster::block_on(scope.pop()) {
        Some(e) => Err(anyhow!("{}", e)),
        None => Ok(value),
    }
}

/// Row stride rounded up to wgpu's copy alignment.
fn padded_row_bytes(width: u32) -> u32 {
    let unpadded = width * 4;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    unpadded.div_ceil(align) * align
}

fn create_channel_texture(device: &wgpu::Device, label: &str, width: u32, height: u32) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Rgba8Unorm,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    })
}

fn write_rgba(queue: &wgpu::Queue, texture: &wgpu::Texture, width: u32, height: u32, data: &[u8]) {
    queue.write_texture(
        wgpu::TexelCopyTextureInfo { texture, mip_level: 0, origin: wgpu::Origin3d::ZERO, aspect: wgpu::TextureAspect::All },
        data,
        wgpu::TexelCopyBufferLayout { offset: 0, bytes_per_row: Some(width * 4), rows_per_image: Some(height) },
        wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readback_rows_are_aligned() {
        assert_eq!(padded_row_bytes(1280), 5120);
        assert_eq!(padded_row_bytes(1536), 6144);
        assert_eq!(padded_row_bytes(10), 256);
        assert_eq!(padded_row_bytes(100) % wgpu::COPY_BYTES_PER_ROW_ALIGNMENT, 0);
    }

    #[test]
    fn validation_errors_become_results() {
        // Needs a GPU adapter; nothing to check without one.
        let Ok(context) = GpuContext::headless() else { return };
        let device = context.device;

        let invalid = validation_scope(&device, || {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Invalid Buffer"),
                size: 16,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::STORAGE,
                mapped_at_creation: false,
            })
        });
        assert!(invalid.is_err());

        let valid = validation_scope(&device, || {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Valid Buffer"),
                size: 16,
                usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
                mapped_at_creation: false,
            })
        });
        assert!(valid.is_ok());
    }
}
