//! Postprocessing of baked material buffers
//!
//! Masked blur on the float buffer, then quantization, edge dilation and
//! alpha-mask derivation on the 8-bit result.

use glam::Vec4;

use crate::config::OutputMode;
use crate::raster::MaterialBuffer;
use crate::texture::{FloatBuffer, TextureBuffer};

/// Alpha-mask binarization threshold.
pub const ALPHA_MASK_THRESHOLD: f32 = 0.4;

/// Without a validity mask, pixels brighter than this count as baked.
pub const DILATE_INTENSITY_THRESHOLD: u8 = 8;

/// Final textures of one material.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialTextures {
    /// Baked length mask
    pub length_mask: TextureBuffer,
    /// Binarized mask derived from `length_mask`
    pub alpha_mask: TextureBuffer,
}

/// Normalized 1D Gaussian kernel of size `2 * radius + 1`.
pub fn gaussian_kernel(radius: u32) -> Vec<f32> {
    let sigma = (radius as f32 * 0.5).max(0.5);
    let r = radius as i32;
    let mut kernel: Vec<f32> = (-r..=r)
        .map(|i| (-(i * i) as f32 / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f32 = kernel.iter().sum();
    for w in &mut kernel {
        *w /= sum;
    }
    kernel
}

/// Separable Gaussian blur restricted to rasterized texels.
///
/// Unrasterized texels are left untouched and never contribute to their
/// neighbors. Each output is renormalized by the weights actually used.
pub fn masked_blur(buffer: &mut FloatBuffer, rasterized: &[bool], radius: u32) {
    if radius == 0 {
        return;
    }
    let kernel = gaussian_kernel(radius);
    let horizontal = blur_pass(buffer, rasterized, &kernel, 1, 0);
    *buffer = blur_pass(&horizontal, rasterized, &kernel, 0, 1);
}

fn blur_pass(
    src: &FloatBuffer,
    rasterized: &[bool],
    kernel: &[f32],
    dx: i64,
    dy: i64,
) -> FloatBuffer {
    let (w, h) = (src.width as i64, src.height as i64);
    let r = (kernel.len() / 2) as i64;
    let mut dst = src.clone();

    for y in 0..h {
        for x in 0..w {
            let idx = (y * w + x) as usize;
            if !rasterized[idx] {
                continue;
            }
            let mut sum = Vec4::ZERO;
            let mut weight = 0.0f32;
            for (k, &kw) in kernel.iter().enumerate() {
                let o = k as i64 - r;
                let (nx, ny) = (x + o * dx, y + o * dy);
                if nx < 0 || ny < 0 || nx >= w || ny >= h {
                    continue;
                }
                let n = (ny * w + nx) as usize;
                if rasterized[n] {
                    sum += src.texels[n] * kw;
                    weight += kw;
                }
            }
            if weight > 0.0 {
                dst.texels[idx] = sum / weight;
            }
        }
    }
    dst
}

/// Grow valid pixels outward by `iterations` texels.
///
/// Each iteration fills every invalid pixel that touches a valid one
/// (8-connected) with the average of those neighbors. Without `validity`,
/// pixels whose brightest color channel exceeds
/// [`DILATE_INTENSITY_THRESHOLD`] are valid.
pub fn dilate(texture: &mut TextureBuffer, validity: Option<&[bool]>, iterations: u32) {
    if iterations == 0 {
        return;
    }
    let (w, h) = (texture.width as i64, texture.height as i64);
    let mut valid: Vec<bool> = match validity {
        Some(mask) => mask.to_vec(),
        None => texture
            .pixels
            .chunks_exact(4)
            .map(|p| p[0].max(p[1]).max(p[2]) > DILATE_INTENSITY_THRESHOLD)
            .collect(),
    };

    for _ in 0..iterations {
        let src = texture.pixels.clone();
        let mut grown = Vec::new();

        for y in 0..h {
            for x in 0..w {
                let idx = (y * w + x) as usize;
                if valid[idx] {
                    continue;
                }
                let mut sum = [0u32; 4];
                let mut count = 0u32;
                for oy in -1..=1 {
                    for ox in -1..=1 {
                        let (nx, ny) = (x + ox, y + oy);
                        if (ox == 0 && oy == 0) || nx < 0 || ny < 0 || nx >= w || ny >= h {
                            continue;
                        }
                        let n = (ny * w + nx) as usize;
                        if valid[n] {
                            for c in 0..4 {
                                sum[c] += src[n * 4 + c] as u32;
                            }
                            count += 1;
                        }
                    }
                }
                if count > 0 {
                    for c in 0..4 {
                        texture.pixels[idx * 4 + c] = ((sum[c] + count / 2) / count) as u8;
                    }
                    grown.push(idx);
                }
            }
        }

        if grown.is_empty() {
            break;
        }
        for idx in grown {
            valid[idx] = true;
        }
    }
}

/// Length value encoded in one length-mask pixel.
fn length_value(pixel: &[u8], mode: OutputMode) -> f32 {
    match mode {
        OutputMode::Opaque => pixel[0].max(pixel[1]).max(pixel[2]) as f32 / 255.0,
        OutputMode::Transparent => 1.0 - pixel[3] as f32 / 255.0,
    }
}

/// Binarize a length mask.
///
/// Both modes decode the same length value and keep fur where it reaches
/// the threshold. Opaque writes white (fur) or black; transparent writes
/// opaque black (fur) or fully transparent.
pub fn alpha_mask(length_mask: &TextureBuffer, mode: OutputMode) -> TextureBuffer {
    let mut out = TextureBuffer::new(length_mask.width, length_mask.height);
    let pixels = out.pixels.chunks_exact_mut(4);
    for (dst, p) in pixels.zip(length_mask.pixels.chunks_exact(4)) {
        let fur = length_value(p, mode) >= ALPHA_MASK_THRESHOLD;
        let color = match (mode, fur) {
            (OutputMode::Opaque, true) => [255, 255, 255, 255],
            (OutputMode::Opaque, false) => [0, 0, 0, 255],
            (OutputMode::Transparent, true) => [0, 0, 0, 255],
            (OutputMode::Transparent, false) => [0, 0, 0, 0],
        };
        dst.copy_from_slice(&color);
    }
    out
}

/// Run the whole postprocessing chain on one material buffer.
pub fn finish(
    material: &str,
    buffer: MaterialBuffer,
    blur_radius: u32,
    padding: u32,
) -> MaterialTextures {
    let mode = buffer.mode();
    let rasterized_count = buffer.rasterized_count();
    let (mut floats, rasterized) = buffer.into_parts();

    masked_blur(&mut floats, &rasterized, blur_radius);
    let mut length_mask = floats.to_texture();
    dilate(&mut length_mask, Some(rasterized.as_slice()), padding);
    let alpha_mask = alpha_mask(&length_mask, mode);

    tracing::info!(
        "Finished '{}': {}x{}, {} texels rasterized, blur {}, padding {}",
        material,
        length_mask.width,
        length_mask.height,
        rasterized_count,
        blur_radius,
        padding
    );

    MaterialTextures {
        length_mask,
        alpha_mask,
    }
}
