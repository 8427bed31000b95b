//! Occluder mesh
//!
//! Whole occluder surfaces (clothing, accessories) and UV islands cut out of
//! other surfaces are merged into one world-space triangle soup with 32-bit
//! indices. A bounding volume hierarchy over it answers closest-hit ray
//! queries during baking.

use glam::{Vec2, Vec3};
use hashbrown::HashMap;
use std::collections::VecDeque;

use crate::surface::{IslandSeed, Surface, SurfaceMesh};

/// Triangles per BVH leaf.
const LEAF_SIZE: usize = 4;

/// Traversal stack capacity. Holds one pending sibling per level plus the current pair.
const MAX_STACK_DEPTH: usize = 128;

/// Quantization step used to weld vertices when finding UV-connected edges.
const WELD_EPSILON: f32 = 1e-5;

/// Combined collidable mesh, read-only during baking.
#[derive(Debug, Clone)]
pub struct Occluder {
    positions: Vec<Vec3>,
    indices: Vec<u32>,
    bvh: Bvh,
}

impl Occluder {
    /// Merge whole occluder surfaces and seeded UV islands.
    ///
    /// Seeds name a surface in `island_sources` first, then in `occluders`.
    /// Returns `None` when nothing was collected.
    pub fn build(
        occluders: &[Surface],
        seeds: &[IslandSeed],
        island_sources: &[Surface],
    ) -> Option<Self> {
        let mut positions: Vec<Vec3> = Vec::new();
        let mut indices: Vec<u32> = Vec::new();

        for surface in occluders {
            let Some(mesh) = surface.geometry() else {
                tracing::debug!("Skipping occluder '{}': no mesh", surface.name);
                continue;
            };
            let base = positions.len() as u32;
            positions.extend(
                mesh.positions
                    .iter()
                    .map(|&p| surface.transform.transform_point3(p)),
            );
            let mut dropped = 0;
            for submesh in &mesh.submeshes {
                for tri in submesh.indices.chunks_exact(3) {
                    if tri.iter().all(|&i| (i as usize) < mesh.positions.len()) {
                        indices.extend(tri.iter().map(|&i| base + i));
                    } else {
                        dropped += 1;
                    }
                }
            }
            if dropped > 0 {
                tracing::warn!(
                    "Occluder '{}': skipping {} triangles with indices past {} vertices",
                    surface.name,
                    dropped,
                    mesh.positions.len()
                );
            }
        }

        for seed in seeds {
            let Some(surface) = island_sources
                .iter()
                .chain(occluders)
                .find(|s| s.name == seed.surface)
            else {
                tracing::debug!("Island seed references unknown surface '{}'", seed.surface);
                continue;
            };
            let Some(mesh) = surface.geometry() else {
                continue;
            };
            let Some(island) = extract_uv_island(mesh, seed.submesh, seed.uv) else {
                tracing::debug!(
                    "No UV island at {:?} on '{}' submesh {}",
                    seed.uv,
                    seed.surface,
                    seed.submesh
                );
                continue;
            };
            // Patches keep only the vertices they use.
            let mut remap: HashMap<u32, u32> = HashMap::new();
            for tri in &island {
                for &i in tri {
                    let idx = *remap.entry(i).or_insert_with(|| {
                        let p = mesh.positions[i as usize];
                        positions.push(surface.transform.transform_point3(p));
                        positions.len() as u32 - 1
                    });
                    indices.push(idx);
                }
            }
            tracing::debug!(
                "Added UV island of {} triangles from '{}'",
                island.len(),
                seed.surface
            );
        }

        if indices.is_empty() {
            return None;
        }
        let bvh = Bvh::build(&positions, &indices);
        Some(Self {
            positions,
            indices,
            bvh,
        })
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    fn triangle(&self, tri: u32) -> [Vec3; 3] {
        let i = tri as usize * 3;
        [
            self.positions[self.indices[i] as usize],
            self.positions[self.indices[i + 1] as usize],
            self.positions[self.indices[i + 2] as usize],
        ]
    }

    /// Distance to the closest hit along `dir` within `max_dist`, either face.
    pub fn raycast(&self, origin: Vec3, dir: Vec3, max_dist: f32) -> Option<f32> {
        let inv_dir = dir.recip();
        let mut best = max_dist;
        let mut hit = false;
        // Median splits keep the depth near log2(triangles), far below the capacity.
        let mut stack = [0usize; MAX_STACK_DEPTH];
        let mut len = 1;

        while len > 0 {
            len -= 1;
            let node = &self.bvh.nodes[stack[len]];
            if !ray_aabb(origin, inv_dir, node.min, node.max, best) {
                continue;
            }
            match node.kind {
                NodeKind::Leaf { first, count } => {
                    for &tri in &self.bvh.order[first..first + count] {
                        let corners = self.triangle(tri);
                        if let Some(t) = ray_triangle_intersect(origin, dir, corners, best) {
                            best = t;
                            hit = true;
                        }
                    }
                }
                NodeKind::Inner { left, right } => {
                    stack[len] = left;
                    stack[len + 1] = right;
                    len += 2;
                }
            }
        }

        hit.then_some(best)
    }
}

#[derive(Debug, Clone)]
enum NodeKind {
    Leaf { first: usize, count: usize },
    Inner { left: usize, right: usize },
}

#[derive(Debug, Clone)]
struct BvhNode {
    min: Vec3,
    max: Vec3,
    kind: NodeKind,
}

/// Median-split bounding volume hierarchy over triangle ids.
#[derive(Debug, Clone)]
struct Bvh {
    nodes: Vec<BvhNode>,
    order: Vec<u32>,
}

impl Bvh {
    fn build(positions: &[Vec3], indices: &[u32]) -> Self {
        let tri_count = indices.len() / 3;
        let bounds: Vec<(Vec3, Vec3, Vec3)> = indices
            .chunks_exact(3)
            .map(|t| {
                let [a, b, c] = [
                    positions[t[0] as usize],
                    positions[t[1] as usize],
                    positions[t[2] as usize],
                ];
                let min = a.min(b).min(c);
                let max = a.max(b).max(c);
                (min, max, (min + max) * 0.5)
            })
            .collect();

        let mut bvh = Self {
            nodes: Vec::with_capacity(tri_count.max(1) * 2 / LEAF_SIZE + 1),
            order: (0..tri_count as u32).collect(),
        };
        bvh.build_node(&bounds, 0, tri_count);
        bvh
    }

    fn build_node(&mut self, bounds: &[(Vec3, Vec3, Vec3)], first: usize, count: usize) -> usize {
        let slice = &self.order[first..first + count];
        let mut min = Vec3::splat(f32::MAX);
        let mut max = Vec3::splat(f32::MIN);
        let mut cmin = Vec3::splat(f32::MAX);
        let mut cmax = Vec3::splat(f32::MIN);
        for &tri in slice {
            let (bmin, bmax, centroid) = bounds[tri as usize];
            min = min.min(bmin);
            max = max.max(bmax);
            cmin = cmin.min(centroid);
            cmax = cmax.max(centroid);
        }

        let node_idx = self.nodes.len();
        self.nodes.push(BvhNode {
            min,
            max,
            kind: NodeKind::Leaf { first, count },
        });

        let extent = cmax - cmin;
        if count <= LEAF_SIZE || extent.max_element() <= 0.0 {
            return node_idx;
        }

        let axis = if extent.x >= extent.y && extent.x >= extent.z {
            0
        } else if extent.y >= extent.z {
            1
        } else {
            2
        };
        let mid = count / 2;
        self.order[first..first + count].select_nth_unstable_by(mid, |&a, &b| {
            bounds[a as usize].2[axis].total_cmp(&bounds[b as usize].2[axis])
        });

        let left = self.build_node(bounds, first, mid);
        let right = self.build_node(bounds, first + mid, count - mid);
        self.nodes[node_idx].kind = NodeKind::Inner { left, right };
        node_idx
    }
}

fn ray_aabb(origin: Vec3, inv_dir: Vec3, min: Vec3, max: Vec3, max_dist: f32) -> bool {
    let mut tmin = 0.0f32;
    let mut tmax = max_dist;
    for axis in 0..3 {
        let lo = min[axis] - origin[axis];
        let hi = max[axis] - origin[axis];
        let inv = inv_dir[axis];
        if inv.is_infinite() {
            // Parallel to the slab: inside or never.
            if lo > 0.0 || hi < 0.0 {
                return false;
            }
            continue;
        }
        let (a, b) = (lo * inv, hi * inv);
        tmin = tmin.max(a.min(b));
        tmax = tmax.min(a.max(b));
    }
    tmin <= tmax
}

/// Möller–Trumbore ray-triangle intersection, both faces.
fn ray_triangle_intersect(origin: Vec3, dir: Vec3, tri: [Vec3; 3], max_dist: f32) -> Option<f32> {
    let edge1 = tri[1] - tri[0];
    let edge2 = tri[2] - tri[0];
    let h = dir.cross(edge2);
    let a = edge1.dot(h);

    if a.abs() < 1e-10 {
        return None;
    }

    let f = 1.0 / a;
    let s = origin - tri[0];
    let u = f * s.dot(h);
    if !(0.0..=1.0).contains(&u) {
        return None;
    }

    let q = s.cross(edge1);
    let v = f * dir.dot(q);
    if v < 0.0 || u + v > 1.0 {
        return None;
    }

    let t = f * edge2.dot(q);
    (t > 1e-6 && t < max_dist).then_some(t)
}

type WeldKey = [i64; 5];

fn weld_key(p: Vec3, uv: Vec2) -> WeldKey {
    let q = |v: f32| (v / WELD_EPSILON).round() as i64;
    [q(p.x), q(p.y), q(p.z), q(uv.x), q(uv.y)]
}

/// Triangles (as local index triples) of the UV island nearest `seed_uv`.
///
/// Two triangles are connected when they share an edge whose endpoints agree
/// in both position and UV, so UV seams split islands even where geometry is
/// continuous. Returns `None` without UVs or triangles.
pub fn extract_uv_island(
    mesh: &SurfaceMesh,
    submesh: usize,
    seed_uv: Vec2,
) -> Option<Vec<[u32; 3]>> {
    if mesh.uvs.len() != mesh.positions.len() {
        return None;
    }
    let vertex_count = mesh.positions.len() as u32;
    let triangles: Vec<[u32; 3]> = mesh
        .submeshes
        .get(submesh)?
        .indices
        .chunks_exact(3)
        .map(|t| [t[0], t[1], t[2]])
        .filter(|t| t.iter().all(|&i| i < vertex_count))
        .collect();
    if triangles.is_empty() {
        return None;
    }

    // Weld split vertices so hard-normal edges still connect.
    let mut welded: HashMap<WeldKey, u32> = HashMap::new();
    let canonical: Vec<u32> = (0..vertex_count)
        .map(|i| {
            let key = weld_key(mesh.positions[i as usize], mesh.uvs[i as usize]);
            *welded.entry(key).or_insert(i)
        })
        .collect();

    let mut edges: HashMap<(u32, u32), Vec<usize>> = HashMap::new();
    for (t, tri) in triangles.iter().enumerate() {
        for k in 0..3 {
            let a = canonical[tri[k] as usize];
            let b = canonical[tri[(k + 1) % 3] as usize];
            if a != b {
                edges.entry((a.min(b), a.max(b))).or_default().push(t);
            }
        }
    }

    let start = triangles
        .iter()
        .enumerate()
        .map(|(t, tri)| {
            let uv = tri.map(|i| mesh.uvs[i as usize]);
            (t, uv_distance_to_triangle(seed_uv, uv))
        })
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(t, _)| t)?;

    let mut visited = vec![false; triangles.len()];
    let mut queue = VecDeque::from([start]);
    visited[start] = true;
    let mut island = Vec::new();
    while let Some(t) = queue.pop_front() {
        let tri = triangles[t];
        island.push(tri);
        for k in 0..3 {
            let a = canonical[tri[k] as usize];
            let b = canonical[tri[(k + 1) % 3] as usize];
            let Some(neighbors) = edges.get(&(a.min(b), a.max(b))) else {
                continue;
            };
            for &n in neighbors {
                if !visited[n] {
                    visited[n] = true;
                    queue.push_back(n);
                }
            }
        }
    }
    Some(island)
}

/// Distance in UV space from `p` to a triangle, 0 when inside.
fn uv_distance_to_triangle(p: Vec2, tri: [Vec2; 3]) -> f32 {
    let [a, b, c] = tri;
    let area = (b - a).perp_dot(c - a);
    if area.abs() > f32::EPSILON {
        let w0 = (c - b).perp_dot(p - b) / area;
        let w1 = (a - c).perp_dot(p - c) / area;
        let w2 = 1.0 - w0 - w1;
        if w0 >= 0.0 && w1 >= 0.0 && w2 >= 0.0 {
            return 0.0;
        }
    }
    [(a, b), (b, c), (c, a)]
        .into_iter()
        .map(|(s, e)| {
            let seg = e - s;
            let len2 = seg.length_squared();
            let t = if len2 > 0.0 {
                ((p - s).dot(seg) / len2).clamp(0.0, 1.0)
            } else {
                0.0
            };
            p.distance(s + seg * t)
        })
        .fold(f32::MAX, f32::min)
}
