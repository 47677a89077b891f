//! Video frame types and pixel format conversions.

use anyhow::{anyhow, Result};
use bytemuck::{Pod, Zeroable};
use std::path::Path;

/// Supported pixel formats for video frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// RGB with 8 bits per channel (24 bits per pixel)
    Rgb,
    /// RGBA with 8 bits per channel (32 bits per pixel)
    Rgba,
}

impl PixelFormat {
    /// Returns the number of bytes per pixel.
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgb => 3,
            PixelFormat::Rgba => 4,
        }
    }
}

/// A video frame containing image data, rows stored top to bottom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Pixel format of the frame data
    pub format: PixelFormat,
    /// Raw pixel data
    pub data: Vec<u8>,
}

impl VideoFrame {
    /// Creates a new black frame with the given dimensions and format.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let size = (width as usize) * (height as usize) * format.bytes_per_pixel();
        Self {
            width,
            height,
            format,
            data: vec![0; size],
        }
    }

    /// Creates a video frame from existing data.
    pub fn from_data(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            format,
            data,
        }
    }

    /// Expected byte length for a frame of this size and format.
    pub fn expected_len(&self) -> usize {
        (self.width as usize) * (self.height as usize) * self.format.bytes_per_pixel()
    }

    /// Decodes an image file into an RGB frame.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let img = image::open(path)
            .map_err(|e| anyhow!("Failed to decode image {:?}: {}", path, e))?
            .to_rgb8();
        let (width, height) = img.dimensions();
        Ok(Self::from_data(width, height, PixelFormat::Rgb, img.into_raw()))
    }

    /// Encodes the frame to an image file; the format follows the extension.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let rgb = self.to_rgb();
        let img = image::RgbImage::from_raw(rgb.width, rgb.height, rgb.data)
            .ok_or_else(|| anyhow!("Frame buffer does not match {}x{}", self.width, self.height))?;
        img.save(path)
            .map_err(|e| anyhow!("Failed to write image {:?}: {}", path, e))?;
        Ok(())
    }

    /// Resizes to exactly `width` x `height`. Returns a clone if the size already matches.
    pub fn resize(&self, width: u32, height: u32) -> Result<VideoFrame> {
        if self.width == width && self.height == height {
            return Ok(self.clone());
        }

        let resize_start = std::time::Instant::now();
        let resized = match self.format {
            PixelFormat::Rgb => {
                let img = image::RgbImage::from_raw(self.width, self.height, self.data.clone())
                    .ok_or_else(|| anyhow!("Frame buffer does not match {}x{}", self.width, self.height))?;
                image::imageops::resize(&img, width, height, image::imageops::FilterType::Triangle).into_raw()
            }
            PixelFormat::Rgba => {
                let img = image::RgbaImage::from_raw(self.width, self.height, self.data.clone())
                    .ok_or_else(|| anyhow!("Frame buffer does not match {}x{}", self.width, self.height))?;
                image::imageops::resize(&img, width, height, image::imageops::FilterType::Triangle).into_raw()
            }
        };
        tracing::debug!("    [Perf] resize {}x{} -> {}x{}: {:?}", self.width, self.height, width, height, resize_start.elapsed());

        Ok(VideoFrame::from_data(width, height, self.format, resized))
    }

    /// Returns a copy with the row order reversed.
    pub fn flip_vertical(&self) -> VideoFrame {
        let stride = self.width as usize * self.format.bytes_per_pixel();
        let mut data = Vec::with_capacity(self.data.len());
        if stride > 0 {
            for row in self.data.chunks_exact(stride).rev() {
                data.extend_from_slice(row);
            }
        }
        VideoFrame::from_data(self.width, self.height, self.format, data)
    }

    /// Converts this frame to RGBA format.
    pub fn to_rgba(&self) -> VideoFrame {
        if self.format == PixelFormat::Rgba {
            return self.clone();
        }

        let pixel_count = (self.width as usize) * (self.height as usize);
        let mut rgba_data = vec![0u8; pixel_count * 4];

        // RGB -> RGBA: just add alpha=255, no color conversion needed
        for (dst, src) in rgba_data.chunks_exact_mut(4).zip(self.data.chunks_exact(3)) {
            dst[..3].copy_from_slice(src);
            dst[3] = 255;
        }

        VideoFrame::from_data(self.width, self.height, PixelFormat::Rgba, rgba_data)
    }

    /// Converts this frame to RGB format, dropping alpha.
    pub fn to_rgb(&self) -> VideoFrame {
        if self.format == PixelFormat::Rgb {
            return self.clone();
        }

        let pixel_count = (self.width as usize) * (self.height as usize);
        let mut rgb_data = Vec::with_capacity(pixel_count * 3);
        for px in self.data.chunks_exact(4) {
            rgb_data.extend_from_slice(&px[..3]);
        }

        VideoFrame::from_data(self.width, self.height, PixelFormat::Rgb, rgb_data)
    }
}

/// Vertex for rendering a full-screen quad.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct QuadVertex {
    pub position: [f32; 2],
}

impl QuadVertex {
    /// Vertices for a full-screen quad.
    pub const VERTICES: &'static [QuadVertex] = &[
        QuadVertex { position: [-1.0, -1.0] },
        QuadVertex { position: [1.0, -1.0] },
        QuadVertex { position: [1.0, 1.0] },
        QuadVertex { position: [-1.0, 1.0] },
    ];

    /// Indices for the quad (two triangles).
    pub const INDICES: &'static [u16] = &[0, 1, 2, 2, 3, 0];

    /// Returns the vertex buffer layout.
    pub fn layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<QuadVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &[wgpu::VertexAttribute {
                offset: 0,
                shader_location: 0,
                format: wgpu::VertexFormat::Float32x2,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb_to_rgba_conversion() {
        let rgb_data = vec![255, 0, 0, 0, 255, 0, 0, 0, 255, 255, 255, 255];
        let frame = VideoFrame::from_data(2, 2, PixelFormat::Rgb, rgb_data);
        let rgba_frame = frame.to_rgba();

        assert_eq!(rgba_frame.format, PixelFormat::Rgba);
        assert_eq!(rgba_frame.data.len(), 16);
        // Check first pixel (red)
        assert_eq!(&rgba_frame.data[0..4], &[255, 0, 0, 255]);
        // Check second pixel (green)
        assert_eq!(&rgba_frame.data[4..8], &[0, 255, 0, 255]);
    }

    #[test]
    fn test_rgba_to_rgb_drops_alpha() {
        let frame = VideoFrame::from_data(1, 2, PixelFormat::Rgba, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        let rgb = frame.to_rgb();
        assert_eq!(rgb.data, vec![1, 2, 3, 5, 6, 7]);
    }

    #[test]
    fn test_flip_vertical_reverses_rows() {
        let frame = VideoFrame::from_data(1, 3, PixelFormat::Rgb, vec![1, 1, 1, 2, 2, 2, 3, 3, 3]);
        let flipped = frame.flip_vertical();
        assert_eq!(flipped.data, vec![3, 3, 3, 2, 2, 2, 1, 1, 1]);
        assert_eq!(flipped.flip_vertical(), frame);
    }

    #[test]
    fn test_resize_to_target_size() {
        let frame = VideoFrame::new(12, 6, PixelFormat::Rgb);
        let resized = frame.resize(10, 5).unwrap();
        assert_eq!((resized.width, resized.height), (10, 5));
        assert_eq!(resized.data.len(), resized.expected_len());
    }

    #[test]
    fn test_png_round_trip_keeps_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame_00000.png");
        let frame = VideoFrame::from_data(2, 1, PixelFormat::Rgb, vec![10, 20, 30, 40, 50, 60]);
        frame.save(&path).unwrap();
        assert_eq!(VideoFrame::load(&path).unwrap(), frame);
    }
}
