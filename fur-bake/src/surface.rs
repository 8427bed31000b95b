//! Input surfaces handed to the baker by the host
//!
//! A surface is one renderable object: local-space vertex attributes, a
//! transform to world space, one index list per submesh and an optional skin.

use glam::{Mat4, Vec2, Vec3, Vec4};

/// One submesh: a triangle list and the material it renders with.
#[derive(Debug, Clone, Default)]
pub struct Submesh {
    /// Triangle indices into the surface's vertex arrays (length multiple of 3)
    pub indices: Vec<u32>,
    /// Material name, used to group output textures
    pub material: String,
}

impl Submesh {
    pub fn new(material: impl Into<String>, indices: Vec<u32>) -> Self {
        Self {
            indices,
            material: material.into(),
        }
    }
}

/// Local-space vertex data of a surface.
///
/// Optional attributes are empty when absent. Attributes whose length does
/// not match `positions` are treated as absent.
#[derive(Debug, Clone, Default)]
pub struct SurfaceMesh {
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub uvs: Vec<Vec2>,
    /// xyz = tangent direction, w = bitangent sign
    pub tangents: Vec<Vec4>,
    pub submeshes: Vec<Submesh>,
}

/// Up to four bone influences per vertex.
#[derive(Debug, Clone, Default)]
pub struct SkinBinding {
    /// Full hierarchy path of each joint, e.g. `Armature/Hips/Spine`
    pub bone_paths: Vec<String>,
    /// Joint indices into `bone_paths`, one entry per vertex
    pub joints: Vec<[u16; 4]>,
    pub weights: Vec<[f32; 4]>,
}

/// A surface to flatten or to use as an occluder.
#[derive(Debug, Clone)]
pub struct Surface {
    /// Scene path of the surface, used by UV-island seeds
    pub name: String,
    pub transform: Mat4,
    /// `None` when the host object has no mesh; such surfaces are skipped
    pub mesh: Option<SurfaceMesh>,
    pub skin: Option<SkinBinding>,
}

impl Surface {
    pub fn new(name: impl Into<String>, mesh: SurfaceMesh) -> Self {
        Self {
            name: name.into(),
            transform: Mat4::IDENTITY,
            mesh: Some(mesh),
            skin: None,
        }
    }

    pub fn with_transform(mut self, transform: Mat4) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_skin(mut self, skin: SkinBinding) -> Self {
        self.skin = Some(skin);
        self
    }

    /// Mesh data, if the surface has any geometry.
    pub fn geometry(&self) -> Option<&SurfaceMesh> {
        self.mesh
            .as_ref()
            .filter(|m| !m.positions.is_empty() && !m.submeshes.is_empty())
    }
}

/// Marks a UV island of a surface as additional occluder geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct IslandSeed {
    /// Name of the surface holding the island
    pub surface: String,
    pub submesh: usize,
    /// Any UV coordinate on (or near) the island
    pub uv: Vec2,
}
