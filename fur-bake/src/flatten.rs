//! Geometry flattening
//!
//! Merges every input surface into one set of world-space vertex columns
//! plus a list of submesh records pointing into them. Materials are interned
//! into a [`MaterialTable`] so the per-texel path works with integer ids.

use glam::{Mat3, Vec2, Vec3, Vec4};
use hashbrown::HashMap;

use crate::config::BoneMasks;
use crate::surface::{SkinBinding, Surface, SurfaceMesh};

/// Stable index of a material within one bake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaterialId(pub u32);

impl MaterialId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Material names interned in first-seen order.
#[derive(Debug, Clone, Default)]
pub struct MaterialTable {
    names: Vec<String>,
    lookup: HashMap<String, MaterialId>,
}

impl MaterialTable {
    pub fn intern(&mut self, name: &str) -> MaterialId {
        if let Some(&id) = self.lookup.get(name) {
            return id;
        }
        let id = MaterialId(self.names.len() as u32);
        self.names.push(name.to_string());
        self.lookup.insert(name.to_string(), id);
        id
    }

    pub fn id(&self, name: &str) -> Option<MaterialId> {
        self.lookup.get(name).copied()
    }

    pub fn name(&self, id: MaterialId) -> &str {
        &self.names[id.index()]
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (MaterialId, &str)> {
        self.names
            .iter()
            .enumerate()
            .map(|(i, n)| (MaterialId(i as u32), n.as_str()))
    }
}

/// Triangle list of one original submesh, re-based onto [`FlatMesh`].
#[derive(Debug, Clone)]
pub struct SubmeshRecord {
    pub indices: Vec<u32>,
    pub material: MaterialId,
    /// False when the source surface had no usable UVs
    pub has_uvs: bool,
}

impl SubmeshRecord {
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn triangle(&self, tri: usize) -> [usize; 3] {
        let i = tri * 3;
        [
            self.indices[i] as usize,
            self.indices[i + 1] as usize,
            self.indices[i + 2] as usize,
        ]
    }
}

/// World-space vertex columns shared by all submeshes.
#[derive(Debug, Clone, Default)]
pub struct FlatMesh {
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub uvs: Vec<Vec2>,
    pub tangents: Vec<Vec4>,
    /// Resolved bone mask per vertex, in [0, 1]
    pub bone_mask: Vec<f32>,
    /// Material of the last submesh referencing each vertex
    pub vertex_materials: Vec<Option<MaterialId>>,
    pub submeshes: Vec<SubmeshRecord>,
}

impl FlatMesh {
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.submeshes.iter().map(|s| s.triangle_count()).sum()
    }
}

/// Flatten `surfaces` into world space.
///
/// Surfaces without geometry and triangles with out-of-range indices are
/// skipped.
pub fn flatten(
    surfaces: &[Surface],
    bone_masks: &BoneMasks,
    materials: &mut MaterialTable,
) -> FlatMesh {
    let mut flat = FlatMesh::default();

    for surface in surfaces {
        let Some(mesh) = surface.geometry() else {
            tracing::debug!("Skipping surface '{}': no mesh", surface.name);
            continue;
        };
        append_surface(&mut flat, surface, mesh, bone_masks, materials);
    }

    tracing::debug!(
        "Flattened {} surfaces: {} vertices, {} triangles, {} materials",
        surfaces.len(),
        flat.vertex_count(),
        flat.triangle_count(),
        materials.len()
    );
    flat
}

fn append_surface(
    flat: &mut FlatMesh,
    surface: &Surface,
    mesh: &SurfaceMesh,
    bone_masks: &BoneMasks,
    materials: &mut MaterialTable,
) {
    let vertex_count = mesh.positions.len();
    let base = flat.positions.len() as u32;

    // Clean index lists first so attribute generation can trust them.
    let submesh_indices: Vec<Vec<u32>> = mesh
        .submeshes
        .iter()
        .enumerate()
        .map(|(submesh_idx, submesh)| {
            valid_triangles(&surface.name, submesh_idx, &submesh.indices, vertex_count)
        })
        .collect();
    let index_slices: Vec<&[u32]> = submesh_indices.iter().map(Vec::as_slice).collect();

    let has_uvs = mesh.uvs.len() == vertex_count;
    if !has_uvs && !mesh.uvs.is_empty() {
        tracing::warn!(
            "Surface '{}' has {} UVs for {} vertices, ignoring UVs",
            surface.name,
            mesh.uvs.len(),
            vertex_count
        );
    }

    let local_normals = if mesh.normals.len() == vertex_count {
        mesh.normals.clone()
    } else {
        if !mesh.normals.is_empty() {
            tracing::warn!(
                "Surface '{}' has {} normals for {} vertices, regenerating",
                surface.name,
                mesh.normals.len(),
                vertex_count
            );
        }
        smooth_normals(&mesh.positions, &index_slices)
    };

    let local_tangents = if mesh.tangents.len() == vertex_count {
        mesh.tangents.clone()
    } else if has_uvs {
        generate_tangents(&mesh.positions, &local_normals, &mesh.uvs, &index_slices)
    } else {
        vec![Vec4::new(1.0, 0.0, 0.0, 1.0); vertex_count]
    };

    // World transform. Normals use the inverse-transpose.
    let linear = Mat3::from_mat4(surface.transform);
    let det = linear.determinant();
    let normal_matrix = if det.abs() > f32::EPSILON {
        linear.inverse().transpose()
    } else {
        linear
    };
    let handedness = if det < 0.0 { -1.0 } else { 1.0 };

    flat.positions.extend(
        mesh.positions
            .iter()
            .map(|&p| surface.transform.transform_point3(p)),
    );
    flat.normals.extend(
        local_normals
            .iter()
            .map(|&n| (normal_matrix * n).normalize_or(Vec3::Z)),
    );
    flat.tangents.extend(local_tangents.iter().map(|t| {
        let dir = (linear * t.truncate()).normalize_or(Vec3::X);
        let sign = if t.w < 0.0 { -1.0 } else { 1.0 };
        dir.extend(sign * handedness)
    }));
    if has_uvs {
        flat.uvs.extend_from_slice(&mesh.uvs);
    } else {
        flat.uvs.extend(std::iter::repeat_n(Vec2::ZERO, vertex_count));
    }

    match &surface.skin {
        Some(skin) => {
            flat.bone_mask
                .extend(skin_bone_mask(surface, skin, vertex_count, bone_masks));
        }
        None => flat.bone_mask.extend(std::iter::repeat_n(0.0, vertex_count)),
    }
    flat.vertex_materials
        .extend(std::iter::repeat_n(None, vertex_count));

    for (submesh, indices) in mesh.submeshes.iter().zip(submesh_indices) {
        if indices.is_empty() {
            continue;
        }
        let material = materials.intern(&submesh.material);
        for &i in &indices {
            flat.vertex_materials[(base + i) as usize] = Some(material);
        }
        flat.submeshes.push(SubmeshRecord {
            indices: indices.iter().map(|&i| base + i).collect(),
            material,
            has_uvs,
        });
    }
}

/// Whole triangles of `indices` whose corners all exist.
fn valid_triangles(
    surface: &str,
    submesh: usize,
    indices: &[u32],
    vertex_count: usize,
) -> Vec<u32> {
    let trailing = indices.len() % 3;
    if trailing != 0 {
        tracing::debug!(
            "Surface '{}' submesh {}: dropping {} trailing indices",
            surface,
            submesh,
            trailing
        );
    }
    let mut kept = Vec::with_capacity(indices.len() - trailing);
    let mut dropped = 0;
    for tri in indices.chunks_exact(3) {
        if tri.iter().all(|&i| (i as usize) < vertex_count) {
            kept.extend_from_slice(tri);
        } else {
            dropped += 1;
        }
    }
    if dropped > 0 {
        tracing::warn!(
            "Surface '{}' submesh {}: skipping {} triangles with indices past {} vertices",
            surface,
            submesh,
            dropped,
            vertex_count
        );
    }
    kept
}

/// Effective mask value of a bone: the maximum over the bone itself and
/// every ancestor with an explicit entry, 0 when none has one.
pub fn resolve_bone_value(path: &str, bone_masks: &BoneMasks) -> f32 {
    let mut best: Option<f32> = None;
    let mut current = path;
    loop {
        if let Some(&value) = bone_masks.get(current) {
            best = Some(best.map_or(value, |b| b.max(value)));
        }
        match current.rfind('/') {
            Some(split) => current = &current[..split],
            None => break,
        }
    }
    best.unwrap_or(0.0).clamp(0.0, 1.0)
}

fn skin_bone_mask(
    surface: &Surface,
    skin: &SkinBinding,
    vertex_count: usize,
    bone_masks: &BoneMasks,
) -> Vec<f32> {
    if skin.joints.len() != vertex_count || skin.weights.len() != vertex_count {
        tracing::warn!(
            "Surface '{}' has partial skinning data, ignoring bone masks",
            surface.name
        );
        return vec![0.0; vertex_count];
    }

    let per_bone: Vec<f32> = skin
        .bone_paths
        .iter()
        .map(|path| resolve_bone_value(path, bone_masks))
        .collect();

    skin.joints
        .iter()
        .zip(&skin.weights)
        .map(|(joints, weights)| {
            let sum: f32 = joints
                .iter()
                .zip(weights)
                .map(|(&j, &w)| per_bone.get(j as usize).copied().unwrap_or(0.0) * w)
                .sum();
            sum.clamp(0.0, 1.0)
        })
        .collect()
}

/// Area-weighted vertex normals.
fn smooth_normals(positions: &[Vec3], submeshes: &[&[u32]]) -> Vec<Vec3> {
    let mut acc = vec![Vec3::ZERO; positions.len()];
    for indices in submeshes {
        for tri in indices.chunks_exact(3) {
            let [a, b, c] = [tri[0] as usize, tri[1] as usize, tri[2] as usize];
            let face = (positions[b] - positions[a]).cross(positions[c] - positions[a]);
            acc[a] += face;
            acc[b] += face;
            acc[c] += face;
        }
    }
    acc.into_iter().map(|n| n.normalize_or(Vec3::Z)).collect()
}

/// Per-vertex tangents from UV derivatives, Gram-Schmidt against the normal.
fn generate_tangents(
    positions: &[Vec3],
    normals: &[Vec3],
    uvs: &[Vec2],
    submeshes: &[&[u32]],
) -> Vec<Vec4> {
    let mut tan = vec![Vec3::ZERO; positions.len()];
    let mut bitan = vec![Vec3::ZERO; positions.len()];

    for indices in submeshes {
        for tri in indices.chunks_exact(3) {
            let [a, b, c] = [tri[0] as usize, tri[1] as usize, tri[2] as usize];
            let e1 = positions[b] - positions[a];
            let e2 = positions[c] - positions[a];
            let d1 = uvs[b] - uvs[a];
            let d2 = uvs[c] - uvs[a];

            let denom = d1.x * d2.y - d2.x * d1.y;
            if denom.abs() < 1e-12 {
                continue; // degenerate UV mapping
            }
            let r = 1.0 / denom;
            let t = (e1 * d2.y - e2 * d1.y) * r;
            let bt = (e2 * d1.x - e1 * d2.x) * r;
            for i in [a, b, c] {
                tan[i] += t;
                bitan[i] += bt;
            }
        }
    }

    normals
        .iter()
        .zip(tan.iter().zip(&bitan))
        .map(|(&n, (&t, &b))| {
            let ortho = (t - n * n.dot(t)).normalize_or(Vec3::ZERO);
            if ortho == Vec3::ZERO {
                return fallback_tangent(n);
            }
            let w = if n.cross(ortho).dot(b) < 0.0 { -1.0 } else { 1.0 };
            ortho.extend(w)
        })
        .collect()
}

fn fallback_tangent(n: Vec3) -> Vec4 {
    let up = if n.y.abs() < 0.99 { Vec3::Y } else { Vec3::X };
    up.cross(n).normalize_or(Vec3::X).extend(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::fixtures::quad;
    use crate::surface::Submesh;
    use glam::Mat4;

    #[test]
    fn test_flatten_rebases_indices() {
        let a = Surface::new("a", quad("Body"));
        let b = Surface::new("b", quad("Body"))
            .with_transform(Mat4::from_translation(Vec3::new(2.0, 0.0, 0.0)));
        let mut materials = MaterialTable::default();
        let flat = flatten(&[a, b], &BoneMasks::new(), &mut materials);

        assert_eq!(flat.vertex_count(), 8);
        assert_eq!(flat.submeshes.len(), 2);
        assert_eq!(flat.submeshes[1].indices, vec![4, 5, 6, 4, 6, 7]);
        assert_eq!(flat.positions[5], Vec3::new(3.0, 0.0, 0.0));
        assert_eq!(materials.len(), 1);
        assert_eq!(flat.submeshes[0].material, flat.submeshes[1].material);
    }

    #[test]
    fn test_flatten_skips_surfaces_without_mesh() {
        let missing = Surface {
            name: "camera".to_string(),
            transform: Mat4::IDENTITY,
            mesh: None,
            skin: None,
        };
        let mut materials = MaterialTable::default();
        let flat = flatten(
            &[missing, Surface::new("a", quad("Body"))],
            &BoneMasks::new(),
            &mut materials,
        );
        assert_eq!(flat.vertex_count(), 4);
    }

    #[test]
    fn test_flatten_skips_out_of_range_triangles() {
        let mut mesh = quad("Body");
        mesh.submeshes[0].indices = vec![0, 1, 9, 0, 2, 3, 7];
        let mut materials = MaterialTable::default();
        let flat = flatten(&[Surface::new("bad", mesh)], &BoneMasks::new(), &mut materials);
        assert_eq!(flat.triangle_count(), 1);
        assert_eq!(flat.submeshes[0].indices, vec![0, 2, 3]);

        let mut mesh = quad("Body");
        mesh.submeshes[0].indices = vec![4, 5, 6];
        let flat = flatten(&[Surface::new("bad", mesh)], &BoneMasks::new(), &mut materials);
        assert!(flat.submeshes.is_empty());
        assert_eq!(flat.vertex_count(), 4);
    }

    #[test]
    fn test_normals_use_inverse_transpose() {
        let mut mesh = quad("Body");
        mesh.normals = vec![Vec3::new(1.0, 1.0, 0.0).normalize(); 4];
        let surface =
            Surface::new("s", mesh).with_transform(Mat4::from_scale(Vec3::new(2.0, 1.0, 1.0)));
        let mut materials = MaterialTable::default();
        let flat = flatten(&[surface], &BoneMasks::new(), &mut materials);

        // Stretching X flattens the normal towards Y.
        let expected = Vec3::new(0.5, 1.0, 0.0).normalize();
        assert!(flat.normals[0].abs_diff_eq(expected, 1e-5));
    }

    #[test]
    fn test_mirrored_transform_flips_tangent_sign() {
        let surface = Surface::new("s", quad("Body"))
            .with_transform(Mat4::from_scale(Vec3::new(-1.0, 1.0, 1.0)));
        let mut materials = MaterialTable::default();
        let flat = flatten(&[surface], &BoneMasks::new(), &mut materials);
        assert_eq!(flat.tangents[0].w, -1.0);
        assert!(flat.tangents[0].truncate().abs_diff_eq(-Vec3::X, 1e-5));
    }

    #[test]
    fn test_missing_normals_and_tangents_are_generated() {
        let mut mesh = quad("Body");
        mesh.normals.clear();
        mesh.tangents.clear();
        let mut materials = MaterialTable::default();
        let flat = flatten(&[Surface::new("s", mesh)], &BoneMasks::new(), &mut materials);

        for n in &flat.normals {
            assert!(n.abs_diff_eq(Vec3::Z, 1e-5), "normal {n:?}");
        }
        for t in &flat.tangents {
            assert!(t.truncate().abs_diff_eq(Vec3::X, 1e-5), "tangent {t:?}");
            assert_eq!(t.w, 1.0);
        }
    }

    #[test]
    fn test_missing_uvs_mark_submesh() {
        let mut mesh = quad("Body");
        mesh.uvs.clear();
        let mut materials = MaterialTable::default();
        let flat = flatten(&[Surface::new("s", mesh)], &BoneMasks::new(), &mut materials);
        assert!(!flat.submeshes[0].has_uvs);
        assert_eq!(flat.uvs.len(), 4);
    }

    #[test]
    fn test_bone_value_inherits_max_from_ancestors() {
        let mut masks = BoneMasks::new();
        masks.insert("Armature/Hips".to_string(), 0.3);
        masks.insert("Armature/Hips/Spine/Chest".to_string(), 0.1);
        masks.insert("Armature".to_string(), 0.2);

        assert_eq!(resolve_bone_value("Armature/Hips/Spine", &masks), 0.3);
        assert_eq!(resolve_bone_value("Armature/Hips/Spine/Chest", &masks), 0.3);
        assert_eq!(resolve_bone_value("Armature/Tail", &masks), 0.2);
        assert_eq!(resolve_bone_value("Other/Root", &masks), 0.0);
    }

    #[test]
    fn test_skinned_vertex_mask_is_weighted_sum() {
        let mut masks = BoneMasks::new();
        masks.insert("Root/Head".to_string(), 1.0);
        masks.insert("Root/Tail".to_string(), 0.5);

        let skin = SkinBinding {
            bone_paths: vec![
                "Root".to_string(),
                "Root/Head".to_string(),
                "Root/Tail".to_string(),
            ],
            joints: vec![[1, 2, 0, 0], [1, 0, 0, 0], [0, 0, 0, 0], [2, 1, 0, 0]],
            weights: vec![
                [0.5, 0.5, 0.0, 0.0],
                [1.0, 0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0, 0.0],
                [1.0, 1.0, 0.0, 0.0],
            ],
        };
        let surface = Surface::new("s", quad("Body")).with_skin(skin);
        let mut materials = MaterialTable::default();
        let flat = flatten(&[surface], &masks, &mut materials);

        assert!((flat.bone_mask[0] - 0.75).abs() < 1e-6);
        assert_eq!(flat.bone_mask[1], 1.0);
        assert_eq!(flat.bone_mask[2], 0.0);
        // 0.5 + 1.0 clamps to 1.
        assert_eq!(flat.bone_mask[3], 1.0);
    }

    #[test]
    fn test_vertex_materials_follow_submeshes() {
        let mut mesh = quad("Body");
        mesh.submeshes = vec![
            Submesh::new("Body", vec![0, 1, 2]),
            Submesh::new("Paws", vec![0, 2, 3]),
        ];
        let mut materials = MaterialTable::default();
        let flat = flatten(&[Surface::new("s", mesh)], &BoneMasks::new(), &mut materials);
        let body = materials.id("Body").unwrap();
        let paws = materials.id("Paws").unwrap();
        assert_eq!(flat.vertex_materials[1], Some(body));
        assert_eq!(flat.vertex_materials[3], Some(paws));
        assert_eq!(materials.name(paws), "Paws");
    }
}
