//! fur-bake.toml manifest parsing
//!
//! ```toml
//! output = "baked"
//!
//! [settings]
//! texture_size = 2048
//! max_distance = 0.04
//!
//! [[surfaces]]
//! path = "body.glb"
//!
//! [[occluders]]
//! path = "shirt.glb"
//!
//! [[island_seeds]]
//! surface = "Armature/Body"
//! submesh = 1
//! uv = [0.8, 0.2]
//!
//! [[spheres]]
//! center = [0.0, 1.6, 0.1]
//! radius = 0.15
//! mirror_x = true
//!
//! [bone_masks]
//! "Armature/Hips/Tail" = 1.0
//!
//! [[normal_maps]]
//! material = "Body"
//! path = "body_normal.png"
//! strength = 0.8
//! ```
//!
//! Relative paths resolve against the manifest's directory.

use anyhow::{Context, Result, bail};
use fur_bake::{
    BakeInput, BakeOutput, BakeSettings, BoneMasks, IslandSeed, NormalMapEntry, SphereMask,
    TextureBuffer,
};
use glam::Vec2;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::scene;

/// fur-bake.toml manifest structure
#[derive(Debug, Deserialize)]
pub struct BakeManifest {
    /// Output directory for baked PNGs (default: "baked")
    #[serde(default = "default_output")]
    pub output: PathBuf,
    #[serde(default)]
    pub settings: BakeSettings,
    #[serde(default)]
    pub surfaces: Vec<MeshSource>,
    #[serde(default)]
    pub occluders: Vec<MeshSource>,
    #[serde(default)]
    pub island_seeds: Vec<SeedEntry>,
    #[serde(default)]
    pub spheres: Vec<SphereMask>,
    #[serde(default)]
    pub bone_masks: BoneMasks,
    #[serde(default)]
    pub normal_maps: Vec<NormalMapSource>,
}

fn default_output() -> PathBuf {
    PathBuf::from("baked")
}

/// A glTF/GLB file
#[derive(Debug, Deserialize)]
pub struct MeshSource {
    pub path: PathBuf,
}

/// UV island to add to the occluder
#[derive(Debug, Deserialize)]
pub struct SeedEntry {
    /// Node path of the surface, e.g. "Armature/Body"
    pub surface: String,
    #[serde(default)]
    pub submesh: usize,
    pub uv: [f32; 2],
}

/// Normal map applied to a material
#[derive(Debug, Deserialize)]
pub struct NormalMapSource {
    pub material: String,
    pub path: PathBuf,
    /// Blend strength in [0, 1] (default: 1.0)
    #[serde(default = "default_strength")]
    pub strength: f32,
}

fn default_strength() -> f32 {
    1.0
}

impl BakeManifest {
    /// Load and parse a manifest, resolving its paths.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
        let mut manifest = Self::parse(&content)?;
        if let Some(dir) = path.parent() {
            manifest.resolve_paths(dir);
        }
        Ok(manifest)
    }

    /// Parse manifest content. Paths are left as written.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse fur-bake manifest")
    }

    /// Make relative paths relative to `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.output);
        for source in self.surfaces.iter_mut().chain(self.occluders.iter_mut()) {
            resolve(&mut source.path);
        }
        for map in &mut self.normal_maps {
            resolve(&mut map.path);
        }
    }

    /// Check settings and referenced files without loading them.
    pub fn validate(&self) -> Result<()> {
        self.settings.validate().context("Invalid [settings]")?;
        if self.surfaces.is_empty() {
            bail!("Manifest has no [[surfaces]] to bake");
        }
        for path in self
            .surfaces
            .iter()
            .chain(&self.occluders)
            .map(|s| &s.path)
            .chain(self.normal_maps.iter().map(|m| &m.path))
        {
            if !path.exists() {
                bail!("Referenced file not found: {}", path.display());
            }
        }
        for map in &self.normal_maps {
            if !(0.0..=1.0).contains(&map.strength) {
                tracing::warn!(
                    "Normal map strength {} for '{}' will be clamped to [0, 1]",
                    map.strength,
                    map.material
                );
            }
        }
        Ok(())
    }

    /// Load every referenced asset into a bake input.
    pub fn load_input(&self) -> Result<BakeInput> {
        let mut surfaces = Vec::new();
        for source in &self.surfaces {
            surfaces.extend(scene::load_surfaces(&source.path)?);
        }
        let mut occluders = Vec::new();
        for source in &self.occluders {
            occluders.extend(scene::load_surfaces(&source.path)?);
        }

        let normal_maps = self
            .normal_maps
            .iter()
            .map(|map| {
                Ok(NormalMapEntry {
                    material: map.material.clone(),
                    texture: load_texture(&map.path)?,
                    strength: map.strength,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let island_seeds = self
            .island_seeds
            .iter()
            .map(|seed| IslandSeed {
                surface: seed.surface.clone(),
                submesh: seed.submesh,
                uv: Vec2::from(seed.uv),
            })
            .collect();

        Ok(BakeInput {
            surfaces,
            occluders,
            island_seeds,
            spheres: self.spheres.clone(),
            bone_masks: self.bone_masks.clone(),
            normal_maps,
            settings: self.settings.clone(),
        })
    }
}

/// Decode an image file into a bottom-up RGBA texture.
pub fn load_texture(path: &Path) -> Result<TextureBuffer> {
    let img = image::open(path)
        .with_context(|| format!("Failed to load image: {:?}", path))?
        .into_rgba8();
    let (width, height) = img.dimensions();
    TextureBuffer::from_rgba8_top_down(width, height, img.as_raw())
        .with_context(|| format!("Unexpected pixel layout in {:?}", path))
}

/// File-system friendly version of a material name.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "material".to_string()
    } else {
        cleaned
    }
}

/// Unique file stems for `materials`, in order.
///
/// Names that sanitize to an already used stem get `_2`, `_3`, ... appended.
pub fn output_stems<'a>(materials: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut used = HashSet::new();
    let mut stems = Vec::new();
    for material in materials {
        let base = sanitize_file_name(material);
        let mut stem = base.clone();
        let mut n = 2;
        while !used.insert(stem.to_lowercase()) {
            stem = format!("{base}_{n}");
            n += 1;
        }
        if stem != base {
            tracing::warn!(
                "Material '{}' collides with another output name, writing as '{}'",
                material,
                stem
            );
        }
        stems.push(stem);
    }
    stems
}

/// Write `<material>_length.png` and `<material>_alpha.png` for every material.
pub fn write_outputs(output: &BakeOutput, dir: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;

    let stems = output_stems(output.keys().map(String::as_str));
    let mut written = Vec::new();
    for (textures, stem) in output.values().zip(stems) {
        let pair = [("length", &textures.length_mask), ("alpha", &textures.alpha_mask)];
        for (suffix, texture) in pair {
            let path = dir.join(format!("{stem}_{suffix}.png"));
            texture
                .write_png(&path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            written.push(path);
        }
    }
    Ok(written)
}
