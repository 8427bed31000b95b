//! glTF/GLB scene loading
//!
//! Every mesh node becomes one [`Surface`] named after its node path, with
//! one submesh per primitive. Skinned nodes carry their joint paths so bone
//! masks can be resolved by name.

use anyhow::{Context, Result};
use fur_bake::{SkinBinding, Submesh, Surface, SurfaceMesh};
use glam::{Mat4, Vec2, Vec3, Vec4};
use std::path::Path;

/// World transform and hierarchy path of a node.
#[derive(Debug, Clone)]
struct NodeInfo {
    path: String,
    world: Mat4,
}

/// Load all mesh nodes of a glTF/GLB file.
pub fn load_surfaces(input: &Path) -> Result<Vec<Surface>> {
    let (document, buffers, _images) =
        gltf::import(input).with_context(|| format!("Failed to load glTF: {:?}", input))?;

    let mut nodes: Vec<Option<NodeInfo>> = vec![None; document.nodes().count()];
    for scene in document.scenes() {
        for root in scene.nodes() {
            visit(&root, Mat4::IDENTITY, None, &mut nodes);
        }
    }

    let mut surfaces = Vec::new();
    for node in document.nodes() {
        let Some(mesh) = node.mesh() else {
            continue;
        };
        let Some(info) = &nodes[node.index()] else {
            tracing::debug!("Node {} is not part of any scene, skipping", node.index());
            continue;
        };

        let bone_paths: Option<Vec<String>> = node.skin().map(|skin| {
            skin.joints()
                .map(|joint| match &nodes[joint.index()] {
                    Some(j) => j.path.clone(),
                    None => node_name(&joint),
                })
                .collect()
        });

        let (surface_mesh, skin) = read_mesh(&mesh, &buffers, &info.path, bone_paths)?;
        tracing::info!(
            "Loaded '{}': {} vertices, {} submeshes{}",
            info.path,
            surface_mesh.positions.len(),
            surface_mesh.submeshes.len(),
            if skin.is_some() { ", skinned" } else { "" }
        );

        // Skinned vertices are already in skeleton space.
        let transform = if skin.is_some() { Mat4::IDENTITY } else { info.world };
        let mut surface = Surface::new(info.path.clone(), surface_mesh).with_transform(transform);
        if let Some(skin) = skin {
            surface = surface.with_skin(skin);
        }
        surfaces.push(surface);
    }

    if surfaces.is_empty() {
        tracing::warn!("No mesh nodes found in {:?}", input);
    }
    Ok(surfaces)
}

fn node_name(node: &gltf::Node) -> String {
    node.name()
        .map(str::to_string)
        .unwrap_or_else(|| format!("node{}", node.index()))
}

fn visit(
    node: &gltf::Node,
    parent: Mat4,
    parent_path: Option<&str>,
    nodes: &mut [Option<NodeInfo>],
) {
    if nodes[node.index()].is_some() {
        return;
    }
    let local = Mat4::from_cols_array_2d(&node.transform().matrix());
    let world = parent * local;
    let name = node_name(node);
    let path = match parent_path {
        Some(p) => format!("{p}/{name}"),
        None => name,
    };
    nodes[node.index()] = Some(NodeInfo {
        path: path.clone(),
        world,
    });
    for child in node.children() {
        visit(&child, world, Some(&path), nodes);
    }
}

/// Merge a mesh's primitives into one surface mesh.
///
/// Primitives without UVs get zero UVs (their triangles are degenerate in
/// texture space and never rasterize). Normals and tangents are kept only
/// when every primitive has them; otherwise the flattener regenerates them.
fn read_mesh(
    mesh: &gltf::Mesh,
    buffers: &[gltf::buffer::Data],
    path: &str,
    bone_paths: Option<Vec<String>>,
) -> Result<(SurfaceMesh, Option<SkinBinding>)> {
    let mut out = SurfaceMesh::default();
    let mut normals = Some(Vec::new());
    let mut tangents = Some(Vec::new());
    let mut joints = Vec::new();
    let mut weights = Vec::new();

    for (prim_idx, primitive) in mesh.primitives().enumerate() {
        if primitive.mode() != gltf::mesh::Mode::Triangles {
            tracing::warn!(
                "'{}' primitive {}: mode {:?} not supported, skipping",
                path,
                prim_idx,
                primitive.mode()
            );
            continue;
        }
        let reader = primitive.reader(|buffer| Some(&buffers[buffer.index()]));

        let positions: Vec<Vec3> = reader
            .read_positions()
            .with_context(|| format!("'{}' primitive {}: no positions", path, prim_idx))?
            .map(Vec3::from)
            .collect();
        let count = positions.len();
        let base = out.positions.len() as u32;

        match reader.read_tex_coords(0) {
            // glTF V runs down the image; baked rows run up.
            Some(uvs) => out.uvs.extend(uvs.into_f32().map(|[u, v]| Vec2::new(u, 1.0 - v))),
            None => {
                tracing::warn!("'{}' primitive {}: no UVs, it will not be baked", path, prim_idx);
                out.uvs.extend(std::iter::repeat_n(Vec2::ZERO, count));
            }
        }

        normals = match (normals, reader.read_normals()) {
            (Some(mut acc), Some(n)) => {
                acc.extend(n.map(Vec3::from));
                Some(acc)
            }
            _ => None,
        };
        tangents = match (tangents, reader.read_tangents()) {
            (Some(mut acc), Some(t)) => {
                acc.extend(t.map(Vec4::from));
                Some(acc)
            }
            _ => None,
        };

        match (reader.read_joints(0), reader.read_weights(0)) {
            (Some(j), Some(w)) => {
                joints.extend(j.into_u16());
                weights.extend(w.into_f32());
            }
            _ => {
                joints.extend(std::iter::repeat_n([0u16; 4], count));
                weights.extend(std::iter::repeat_n([0.0f32; 4], count));
            }
        }

        let indices: Vec<u32> = match reader.read_indices() {
            Some(indices) => indices.into_u32().map(|i| base + i).collect(),
            None => (base..base + count as u32).collect(),
        };

        let material = primitive
            .material()
            .name()
            .map(str::to_string)
            .or_else(|| primitive.material().index().map(|i| format!("material{i}")))
            .unwrap_or_else(|| "default".to_string());

        out.positions.extend(positions);
        out.submeshes.push(Submesh::new(material, indices));
    }

    // Every primitive must carry an attribute for it to be usable.
    let vertex_count = out.positions.len();
    out.normals = normals.filter(|n| n.len() == vertex_count).unwrap_or_default();
    out.tangents = tangents.filter(|t| t.len() == vertex_count).unwrap_or_default();

    let skin = bone_paths.map(|bone_paths| SkinBinding {
        bone_paths,
        joints,
        weights,
    });
    Ok((out, skin))
}
