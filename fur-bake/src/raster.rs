//! Texel rasterizer and distance evaluator
//!
//! Each triangle is walked over its UV bounding box. Texel centers inside the
//! triangle get interpolated surface attributes, a masked occlusion distance
//! and a write into the material's buffer under an order-independent merge
//! rule.

use glam::{Vec2, Vec3, Vec4};

use crate::config::{OutputMode, SphereMask};
use crate::flatten::FlatMesh;
use crate::masks::{PreparedNormalMap, bone_contribution, sphere_mask};
use crate::occluder::Occluder;
use crate::texture::FloatBuffer;

/// Barycentric coordinates down to this are still inside.
pub const BARYCENTRIC_EPSILON: f32 = 1e-5;

/// A combined mask at or below this is fully masked, no ray is cast.
pub const MIN_MASK_EPSILON: f32 = 1e-4;

/// Shading normals less aligned than this with the geometric normal get a
/// second, less bent ray.
pub const LEAK_SAFETY_DOT: f32 = 0.99;

/// Transparent mode: values above this are written as transparent white.
pub const TRANSPARENT_WHITE_THRESHOLD: f32 = 0.85;

const GAMMA_EPSILON: f32 = 1e-4;

/// Output buffer of one material plus its rasterized set.
#[derive(Debug, Clone)]
pub struct MaterialBuffer {
    pub buffer: FloatBuffer,
    rasterized: Vec<bool>,
    rasterized_count: usize,
    mode: OutputMode,
}

impl MaterialBuffer {
    pub fn new(size: u32, mode: OutputMode) -> Self {
        let background = match mode {
            OutputMode::Opaque => Vec4::new(0.0, 0.0, 0.0, 1.0),
            OutputMode::Transparent => Vec4::new(1.0, 1.0, 1.0, 0.0),
        };
        Self {
            buffer: FloatBuffer::filled(size, size, background),
            rasterized: vec![false; size as usize * size as usize],
            rasterized_count: 0,
            mode,
        }
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    pub fn rasterized(&self) -> &[bool] {
        &self.rasterized
    }

    pub fn is_rasterized(&self, idx: usize) -> bool {
        self.rasterized[idx]
    }

    pub fn rasterized_count(&self) -> usize {
        self.rasterized_count
    }

    pub fn into_parts(self) -> (FloatBuffer, Vec<bool>) {
        (self.buffer, self.rasterized)
    }

    /// Merge `value` into texel `idx`; the darker / more opaque result wins.
    pub fn write(&mut self, idx: usize, value: f32) {
        let written = self.rasterized[idx];
        let current = self.buffer.texels[idx];
        let next = match self.mode {
            OutputMode::Opaque => {
                if written && value >= current.x {
                    None
                } else {
                    Some(Vec4::new(value, value, value, 1.0))
                }
            }
            OutputMode::Transparent => {
                if value > TRANSPARENT_WHITE_THRESHOLD {
                    // Anything already written is at least as opaque.
                    (!written).then_some(Vec4::new(1.0, 1.0, 1.0, 0.0))
                } else {
                    let alpha = 1.0 - value;
                    (!written || alpha > current.w).then_some(Vec4::new(0.0, 0.0, 0.0, alpha))
                }
            }
        };
        if let Some(texel) = next {
            self.buffer.texels[idx] = texel;
        }
        if !written {
            self.rasterized[idx] = true;
            self.rasterized_count += 1;
        }
    }
}

/// Interpolated surface state at one texel.
#[derive(Debug, Clone, Copy)]
pub struct TexelSample {
    pub position: Vec3,
    /// Interpolated geometric normal
    pub normal: Vec3,
    /// Normal after normal-map perturbation (equal to `normal` without a map)
    pub shading_normal: Vec3,
    /// Interpolated bone mask in [0, 1]
    pub bone_mask: f32,
}

/// Combines sphere, bone and occlusion signals into one value.
#[derive(Debug, Clone, Copy)]
pub struct DistanceEvaluator<'a> {
    pub spheres: &'a [SphereMask],
    pub occluder: Option<&'a Occluder>,
    pub max_distance: f32,
    pub ray_offset: f32,
    pub gamma: f32,
}

impl DistanceEvaluator<'_> {
    /// `min(sphere, bone)` before any ray is cast.
    pub fn min_mask(&self, sample: &TexelSample) -> f32 {
        sphere_mask(sample.position, self.spheres).min(bone_contribution(sample.bone_mask))
    }

    /// Hit distance along `dir`, clamped to `[0, max_distance]`.
    pub fn hit_distance(&self, occluder: &Occluder, position: Vec3, dir: Vec3) -> f32 {
        let origin = position - dir * self.ray_offset;
        occluder
            .raycast(origin, dir, self.max_distance + self.ray_offset)
            .map_or(self.max_distance, |t| {
                (t - self.ray_offset).clamp(0.0, self.max_distance)
            })
    }

    /// Final value before gamma: `min(minMask, hit / max_distance)`.
    pub fn distance_value(&self, sample: &TexelSample) -> f32 {
        let min_mask = self.min_mask(sample);
        if min_mask <= MIN_MASK_EPSILON {
            return 0.0;
        }
        let Some(occluder) = self.occluder else {
            return min_mask;
        };

        let mut hit = self.hit_distance(occluder, sample.position, sample.shading_normal);
        if sample.shading_normal.dot(sample.normal) < LEAK_SAFETY_DOT {
            let safety = (sample.shading_normal + sample.normal).normalize_or(sample.normal);
            hit = hit.min(self.hit_distance(occluder, sample.position, safety));
        }
        min_mask.min(hit / self.max_distance)
    }

    /// Full evaluation including gamma.
    pub fn evaluate(&self, sample: &TexelSample) -> f32 {
        apply_gamma(self.distance_value(sample), self.gamma)
    }
}

/// `clamp01(value) ^ gamma`, skipped when gamma is 1.
pub fn apply_gamma(value: f32, gamma: f32) -> f32 {
    let value = value.clamp(0.0, 1.0);
    if (gamma - 1.0).abs() < GAMMA_EPSILON {
        value
    } else {
        value.powf(gamma)
    }
}

/// Barycentric weights of `p` against a pixel-space triangle.
#[inline]
fn barycentric(p: Vec2, a: Vec2, b: Vec2, c: Vec2, inv_area: f32) -> Vec3 {
    let w0 = (c - b).perp_dot(p - b) * inv_area;
    let w1 = (a - c).perp_dot(p - c) * inv_area;
    Vec3::new(w0, w1, 1.0 - w0 - w1)
}

/// Rasterize one triangle of `mesh` into `target`.
///
/// Returns the number of texels written.
pub fn rasterize_triangle(
    mesh: &FlatMesh,
    tri: [usize; 3],
    normal_map: Option<&PreparedNormalMap>,
    evaluator: &DistanceEvaluator<'_>,
    target: &mut MaterialBuffer,
) -> usize {
    let width = target.buffer.width;
    let height = target.buffer.height;
    let size = Vec2::new(width as f32, height as f32);
    let [a, b, c] = tri.map(|i| mesh.uvs[i] * size);

    let area = (b - a).perp_dot(c - a);
    if !area.is_finite() || area.abs() < 1e-12 {
        return 0;
    }
    let inv_area = 1.0 / area;

    let min = a.min(b).min(c);
    let max = a.max(b).max(c);
    let x0 = (min.x.floor() as i64).max(0);
    let y0 = (min.y.floor() as i64).max(0);
    let x1 = (max.x.ceil() as i64).min(width as i64 - 1);
    let y1 = (max.y.ceil() as i64).min(height as i64 - 1);
    if x1 < x0 || y1 < y0 {
        return 0;
    }

    let normal_map = normal_map.filter(|m| m.is_active());
    let [p0, p1, p2] = tri.map(|i| mesh.positions[i]);
    let [n0, n1, n2] = tri.map(|i| mesh.normals[i]);
    let [t0, t1, t2] = tri.map(|i| mesh.tangents[i]);
    let [uv0, uv1, uv2] = tri.map(|i| mesh.uvs[i]);
    let [m0, m1, m2] = tri.map(|i| mesh.bone_mask[i]);

    let mut written = 0;
    for y in y0..=y1 {
        for x in x0..=x1 {
            let p = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
            let w = barycentric(p, a, b, c, inv_area);
            if w.min_element() < -BARYCENTRIC_EPSILON {
                continue;
            }

            let position = p0 * w.x + p1 * w.y + p2 * w.z;
            let normal = (n0 * w.x + n1 * w.y + n2 * w.z).normalize_or(n0);
            let shading_normal = match normal_map {
                Some(map) => {
                    let tangent = t0 * w.x + t1 * w.y + t2 * w.z;
                    let uv = uv0 * w.x + uv1 * w.y + uv2 * w.z;
                    map.perturb(normal, tangent, uv)
                }
                None => normal,
            };
            let sample = TexelSample {
                position,
                normal,
                shading_normal,
                bone_mask: m0 * w.x + m1 * w.y + m2 * w.z,
            };

            let value = evaluator.evaluate(&sample);
            target.write(target.buffer.index(x as u32, y as u32), value);
            written += 1;
        }
    }
    written
}
