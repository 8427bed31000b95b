//! Mask evaluators
//!
//! Stateless helpers feeding the distance evaluator: sphere attenuation,
//! bone-mask contribution and tangent-space normal-map perturbation.

use glam::{Vec2, Vec3, Vec4};

use crate::config::SphereMask;
use crate::flatten::{FlatMesh, MaterialId};
use crate::texture::{Sampler, TextureBuffer};

/// Normal-map strengths at or below this are ignored.
pub const NORMAL_STRENGTH_EPSILON: f32 = 1e-4;

/// Vertices sampled per material when detecting channel packing.
const PACKING_SAMPLES: usize = 16;

/// Radial falloff of one sphere at distance `d`.
///
/// Inside the inner core (`1 - gradient` of the radius) the value is
/// `1 - intensity`; across the gradient band it eases back up to 1.
pub fn sphere_falloff(d: f32, radius: f32, gradient: f32, intensity: f32) -> f32 {
    let floor = 1.0 - intensity.clamp(0.0, 1.0);
    if radius <= 0.0 {
        return 1.0;
    }
    let t = (d / radius).clamp(0.0, 1.0);
    let gradient = gradient.clamp(0.0, 1.0);
    let inner = 1.0 - gradient;
    if t <= inner || gradient <= f32::EPSILON {
        return if t < 1.0 { floor } else { 1.0 };
    }
    let s = (t - inner) / gradient;
    let s = s * s * (3.0 - 2.0 * s);
    floor + (1.0 - floor) * s
}

/// Minimum falloff over every sphere containing `pos`, 1 when none does.
pub fn sphere_mask(pos: Vec3, spheres: &[SphereMask]) -> f32 {
    let mut value = 1.0f32;
    for sphere in spheres {
        let radius = sphere.clamped_radius();
        if radius <= 0.0 {
            continue;
        }
        let center = Vec3::from(sphere.center);
        let mut eval = |c: Vec3| {
            let d = pos.distance(c);
            if d <= radius {
                value = value.min(sphere_falloff(d, radius, sphere.gradient, sphere.intensity));
            }
        };
        eval(center);
        if sphere.mirror_x {
            eval(Vec3::new(-center.x, center.y, center.z));
        }
    }
    value
}

/// Bone-mask contribution: higher means less masked.
#[inline]
pub fn bone_contribution(bone_mask: f32) -> f32 {
    1.0 - bone_mask.clamp(0.0, 1.0)
}

/// Normal map assigned to a material by the host.
#[derive(Debug, Clone)]
pub struct NormalMapEntry {
    pub material: String,
    pub texture: TextureBuffer,
    pub strength: f32,
}

/// Which channel carries the tangent-space X component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalPacking {
    /// X in red, Y in green
    RedGreen,
    /// X in alpha, Y in green (DXT5nm-style)
    AlphaGreen,
}

impl NormalPacking {
    /// Decode a sampled texel into a unit tangent-space normal.
    pub fn decode(self, texel: Vec4) -> Vec3 {
        let x = match self {
            NormalPacking::RedGreen => texel.x,
            NormalPacking::AlphaGreen => texel.w,
        } * 2.0
            - 1.0;
        let y = texel.y * 2.0 - 1.0;
        let z = (1.0 - x * x - y * y).max(0.0).sqrt();
        Vec3::new(x, y, z).normalize_or(Vec3::Z)
    }
}

/// Normal map ready for per-texel lookups.
#[derive(Debug, Clone)]
pub struct PreparedNormalMap {
    pub sampler: Sampler,
    pub strength: f32,
    pub packing: NormalPacking,
}

impl PreparedNormalMap {
    /// Decode `entry` and detect its channel packing against `material`'s vertices.
    pub fn prepare(entry: &NormalMapEntry, mesh: &FlatMesh, material: MaterialId) -> Self {
        let sampler = Sampler::from_texture(&entry.texture);
        let packing = detect_packing(&sampler, mesh, material);
        tracing::debug!(
            "Normal map for '{}': packing {:?}, strength {}",
            entry.material,
            packing,
            entry.strength
        );
        Self {
            sampler,
            strength: entry.strength,
            packing,
        }
    }

    pub fn is_active(&self) -> bool {
        self.strength > NORMAL_STRENGTH_EPSILON
    }

    /// Perturb `normal` with the map at `uv`.
    ///
    /// Falls back to `normal` when the basis is degenerate.
    pub fn perturb(&self, normal: Vec3, tangent: Vec4, uv: Vec2) -> Vec3 {
        let ts = self.packing.decode(self.sampler.sample(uv));
        let Some(world) = tangent_to_world(ts, normal, tangent) else {
            return normal;
        };
        let blended = normal.lerp(world, self.strength.clamp(0.0, 1.0));
        let out = blended.normalize_or(Vec3::ZERO);
        if out == Vec3::ZERO || !out.is_finite() {
            normal
        } else {
            out
        }
    }
}

/// Transform a tangent-space vector into world space using a Gram-Schmidt
/// orthogonalized TBN basis.
pub fn tangent_to_world(ts: Vec3, normal: Vec3, tangent: Vec4) -> Option<Vec3> {
    let t = tangent.truncate();
    let t = (t - normal * normal.dot(t)).normalize_or(Vec3::ZERO);
    if t == Vec3::ZERO {
        return None;
    }
    let sign = if tangent.w < 0.0 { -1.0 } else { 1.0 };
    let b = normal.cross(t) * sign;
    let world = (t * ts.x + b * ts.y + normal * ts.z).normalize_or(Vec3::ZERO);
    (world != Vec3::ZERO && world.is_finite()).then_some(world)
}

/// Pick the packing whose decoded normals best match the vertex normals.
///
/// Ties favor red/green.
pub fn detect_packing(sampler: &Sampler, mesh: &FlatMesh, material: MaterialId) -> NormalPacking {
    let vertices: Vec<usize> = mesh
        .vertex_materials
        .iter()
        .enumerate()
        .filter(|(_, m)| **m == Some(material))
        .map(|(i, _)| i)
        .collect();
    if vertices.is_empty() {
        return NormalPacking::RedGreen;
    }

    let step = (vertices.len() / PACKING_SAMPLES).max(1);
    let mut score_rg = 0.0f32;
    let mut score_ag = 0.0f32;
    for &v in vertices.iter().step_by(step).take(PACKING_SAMPLES) {
        let normal = mesh.normals[v];
        let tangent = mesh.tangents[v];
        let texel = sampler.sample(mesh.uvs[v]);
        for (packing, score) in [
            (NormalPacking::RedGreen, &mut score_rg),
            (NormalPacking::AlphaGreen, &mut score_ag),
        ] {
            if let Some(world) = tangent_to_world(packing.decode(texel), normal, tangent) {
                *score += world.dot(normal);
            }
        }
    }

    if score_ag > score_rg {
        NormalPacking::AlphaGreen
    } else {
        NormalPacking::RedGreen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BoneMasks;
    use crate::flatten::{MaterialTable, flatten};
    use crate::surface::Surface;
    use crate::surface::fixtures::quad;

    #[test]
    fn test_falloff_endpoints() {
        assert_eq!(sphere_falloff(0.0, 1.0, 1.0, 1.0), 0.0);
        assert!((sphere_falloff(1.0, 1.0, 1.0, 1.0) - 1.0).abs() < 1e-6);
        // Halfway through a full-radius gradient.
        assert!((sphere_falloff(0.5, 1.0, 1.0, 1.0) - 0.5).abs() < 1e-6);
        // Hard core with partial intensity.
        assert!((sphere_falloff(0.2, 1.0, 0.5, 0.6) - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_falloff_is_monotonic() {
        let mut last = -1.0;
        for i in 0..=20 {
            let v = sphere_falloff(i as f32 / 20.0, 1.0, 0.7, 1.0);
            assert!(v >= last, "falloff decreased at step {i}");
            last = v;
        }
    }

    #[test]
    fn test_sphere_mask_outside_is_one() {
        let spheres = vec![SphereMask::new([0.0, 0.0, 0.0], 1.0)];
        assert_eq!(sphere_mask(Vec3::new(2.0, 0.0, 0.0), &spheres), 1.0);
        assert_eq!(sphere_mask(Vec3::ZERO, &[]), 1.0);
    }

    #[test]
    fn test_sphere_mask_zero_radius_ignored() {
        let spheres = vec![SphereMask::new([0.0, 0.0, 0.0], 0.0)];
        assert_eq!(sphere_mask(Vec3::ZERO, &spheres), 1.0);
    }

    #[test]
    fn test_sphere_mask_mirror() {
        let mut sphere = SphereMask::new([1.0, 0.0, 0.0], 0.5);
        let mirrored_point = Vec3::new(-1.0, 0.0, 0.0);
        assert_eq!(sphere_mask(mirrored_point, std::slice::from_ref(&sphere)), 1.0);
        sphere.mirror_x = true;
        assert_eq!(sphere_mask(mirrored_point, &[sphere]), 0.0);
    }

    #[test]
    fn test_sphere_mask_takes_minimum() {
        let mut soft = SphereMask::new([0.0, 0.0, 0.0], 1.0);
        soft.intensity = 0.5;
        let hard = SphereMask::new([0.0, 0.0, 0.0], 1.0);
        assert_eq!(sphere_mask(Vec3::ZERO, &[soft, hard]), 0.0);
    }

    #[test]
    fn test_bone_contribution_inverts_and_clamps() {
        assert_eq!(bone_contribution(0.0), 1.0);
        assert_eq!(bone_contribution(0.25), 0.75);
        assert_eq!(bone_contribution(2.0), 0.0);
    }

    #[test]
    fn test_decode_flat_normal() {
        let flat = Vec4::new(0.5, 0.5, 1.0, 0.5);
        assert!(NormalPacking::RedGreen.decode(flat).abs_diff_eq(Vec3::Z, 1e-5));
        assert!(NormalPacking::AlphaGreen.decode(flat).abs_diff_eq(Vec3::Z, 1e-5));
    }

    #[test]
    fn test_tangent_to_world_orthogonalizes() {
        // Tangent not perpendicular to the normal.
        let world = tangent_to_world(
            Vec3::X,
            Vec3::Z,
            Vec4::new(1.0, 0.0, 1.0, 1.0),
        )
        .unwrap();
        assert!(world.abs_diff_eq(Vec3::X, 1e-5));

        let bitangent = tangent_to_world(Vec3::Y, Vec3::Z, Vec4::new(1.0, 0.0, 0.0, -1.0)).unwrap();
        assert!(bitangent.abs_diff_eq(-Vec3::Y, 1e-5));

        assert!(tangent_to_world(Vec3::X, Vec3::Z, Vec4::new(0.0, 0.0, 1.0, 1.0)).is_none());
    }

    fn quad_mesh() -> (FlatMesh, MaterialId) {
        let mut materials = MaterialTable::default();
        let flat = flatten(
            &[Surface::new("s", quad("Body"))],
            &BoneMasks::new(),
            &mut materials,
        );
        (flat, materials.id("Body").unwrap())
    }

    #[test]
    fn test_detect_packing_red_green() {
        let (flat, body) = quad_mesh();
        // Flat normal in RG, alpha fully opaque: AG would decode x = 1.
        let tex = TextureBuffer::filled(4, 4, [128, 128, 255, 255]);
        let sampler = Sampler::from_texture(&tex);
        assert_eq!(detect_packing(&sampler, &flat, body), NormalPacking::RedGreen);
    }

    #[test]
    fn test_detect_packing_alpha_green() {
        let (flat, body) = quad_mesh();
        // Red channel saturated, X stored in alpha.
        let tex = TextureBuffer::filled(4, 4, [255, 128, 0, 128]);
        let sampler = Sampler::from_texture(&tex);
        assert_eq!(detect_packing(&sampler, &flat, body), NormalPacking::AlphaGreen);
    }

    #[test]
    fn test_perturb_blends_by_strength() {
        let (flat, body) = quad_mesh();
        // Tangent-space normal tilted 45 degrees towards +X.
        let x = ((0.5f32.sqrt() * 0.5 + 0.5) * 255.0).round() as u8;
        let entry = NormalMapEntry {
            material: "Body".to_string(),
            texture: TextureBuffer::filled(4, 4, [x, 128, 218, 255]),
            strength: 0.0,
        };
        let mut map = PreparedNormalMap::prepare(&entry, &flat, body);
        assert!(!map.is_active());

        let tangent = Vec4::new(1.0, 0.0, 0.0, 1.0);
        map.strength = 1.0;
        let full = map.perturb(Vec3::Z, tangent, Vec2::splat(0.5));
        assert!(full.x > 0.6 && full.z > 0.6, "full strength: {full:?}");

        map.strength = 0.5;
        let half = map.perturb(Vec3::Z, tangent, Vec2::splat(0.5));
        assert!(half.x > 0.0 && half.x < full.x, "half strength: {half:?}");
    }

    #[test]
    fn test_perturb_degenerate_basis_falls_back() {
        let (flat, body) = quad_mesh();
        let entry = NormalMapEntry {
            material: "Body".to_string(),
            texture: TextureBuffer::filled(2, 2, [255, 128, 128, 255]),
            strength: 1.0,
        };
        let map = PreparedNormalMap::prepare(&entry, &flat, body);
        let n = map.perturb(Vec3::Z, Vec4::new(0.0, 0.0, 1.0, 1.0), Vec2::ZERO);
        assert_eq!(n, Vec3::Z);
    }
}
