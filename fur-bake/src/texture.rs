//! Texture buffers
//!
//! `FloatBuffer` holds the raw per-material bake values; `TextureBuffer` is
//! the 8-bit RGBA result handed back to the host.
//!
//! Both store rows bottom-up: row 0 is `v = 0`, matching UV space. PNG
//! export and import flip rows so images look upright in viewers.

use glam::{Vec2, Vec4};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use crate::error::Result;

/// RGBA8 texture
#[derive(Clone, Debug, PartialEq)]
pub struct TextureBuffer {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// RGBA pixel data (4 bytes per pixel, rows bottom-up)
    pub pixels: Vec<u8>,
}

impl TextureBuffer {
    /// Create a new texture buffer initialized to transparent black
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0u8; width as usize * height as usize * 4],
        }
    }

    /// Create a texture buffer filled with a solid color
    pub fn filled(width: u32, height: u32, color: [u8; 4]) -> Self {
        let mut buffer = Self::new(width, height);
        for chunk in buffer.pixels.chunks_exact_mut(4) {
            chunk.copy_from_slice(&color);
        }
        buffer
    }

    /// Build from image-ordered (top-down) RGBA8 rows, as decoders produce them.
    ///
    /// Returns `None` if `rgba` does not hold exactly `width * height` pixels.
    pub fn from_rgba8_top_down(width: u32, height: u32, rgba: &[u8]) -> Option<Self> {
        let row = width as usize * 4;
        if rgba.len() != row * height as usize {
            return None;
        }
        let mut pixels = Vec::with_capacity(rgba.len());
        for src in rgba.chunks_exact(row.max(1)).rev() {
            pixels.extend_from_slice(src);
        }
        Some(Self {
            width,
            height,
            pixels,
        })
    }

    /// Get pixel at (x, y)
    #[inline]
    pub fn get_pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let idx = (y as usize * self.width as usize + x as usize) * 4;
        [
            self.pixels[idx],
            self.pixels[idx + 1],
            self.pixels[idx + 2],
            self.pixels[idx + 3],
        ]
    }

    /// Set pixel at (x, y)
    #[inline]
    pub fn set_pixel(&mut self, x: u32, y: u32, color: [u8; 4]) {
        let idx = (y as usize * self.width as usize + x as usize) * 4;
        self.pixels[idx..idx + 4].copy_from_slice(&color);
    }

    /// Write the texture as an RGBA PNG (rows flipped to top-down).
    pub fn write_png(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let w = BufWriter::new(file);

        let mut encoder = png::Encoder::new(w, self.width, self.height);
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);
        encoder.set_compression(png::Compression::Default);

        let row = self.width as usize * 4;
        let mut top_down = Vec::with_capacity(self.pixels.len());
        for src in self.pixels.chunks_exact(row.max(1)).rev() {
            top_down.extend_from_slice(src);
        }

        let mut writer = encoder.write_header()?;
        writer.write_image_data(&top_down)?;
        Ok(())
    }
}

/// Float RGBA working buffer, one per baked material.
#[derive(Clone, Debug, PartialEq)]
pub struct FloatBuffer {
    pub width: u32,
    pub height: u32,
    pub texels: Vec<Vec4>,
}

impl FloatBuffer {
    pub fn filled(width: u32, height: u32, color: Vec4) -> Self {
        Self {
            width,
            height,
            texels: vec![color; width as usize * height as usize],
        }
    }

    #[inline]
    pub fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    /// Quantize to RGBA8.
    pub fn to_texture(&self) -> TextureBuffer {
        let mut tex = TextureBuffer::new(self.width, self.height);
        for (dst, src) in tex.pixels.chunks_exact_mut(4).zip(&self.texels) {
            let c = src.clamp(Vec4::ZERO, Vec4::ONE) * 255.0;
            dst.copy_from_slice(&[
                c.x.round() as u8,
                c.y.round() as u8,
                c.z.round() as u8,
                c.w.round() as u8,
            ]);
        }
        tex
    }
}

/// Bilinear, wrapping sampler over a decoded RGBA texture.
///
/// Values are in [0, 1]. Built once per bake from the host's 8-bit texture.
#[derive(Clone, Debug)]
pub struct Sampler {
    width: u32,
    height: u32,
    texels: Vec<Vec4>,
}

impl Sampler {
    pub fn from_texture(texture: &TextureBuffer) -> Self {
        let texels = texture
            .pixels
            .chunks_exact(4)
            .map(|p| Vec4::new(p[0] as f32, p[1] as f32, p[2] as f32, p[3] as f32) / 255.0)
            .collect();
        Self {
            width: texture.width,
            height: texture.height,
            texels,
        }
    }

    #[inline]
    fn fetch(&self, x: i64, y: i64) -> Vec4 {
        let x = x.rem_euclid(self.width as i64) as usize;
        let y = y.rem_euclid(self.height as i64) as usize;
        self.texels[y * self.width as usize + x]
    }

    /// Sample at `uv` with bilinear filtering and repeat addressing.
    ///
    /// Non-finite UVs return a flat normal texel.
    pub fn sample(&self, uv: Vec2) -> Vec4 {
        if self.texels.is_empty() || !uv.is_finite() {
            return Vec4::new(0.5, 0.5, 1.0, 1.0);
        }
        // Wrap before scaling so far-away UVs stay in range.
        let fx = uv.x.rem_euclid(1.0) * self.width as f32 - 0.5;
        let fy = uv.y.rem_euclid(1.0) * self.height as f32 - 0.5;
        let x0 = fx.floor();
        let y0 = fy.floor();
        let tx = fx - x0;
        let ty = fy - y0;
        let (x0, y0) = (x0 as i64, y0 as i64);

        let top = self.fetch(x0, y0).lerp(self.fetch(x0 + 1, y0), tx);
        let bottom = self.fetch(x0, y0 + 1).lerp(self.fetch(x0 + 1, y0 + 1), tx);
        top.lerp(bottom, ty)
    }
}
