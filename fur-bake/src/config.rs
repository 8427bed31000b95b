//! Bake configuration
//!
//! Settings, sphere masks and bone masks are plain serde types so a host can
//! embed them in its own manifest format (the CLI reads them from TOML).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{BakeError, Result};

/// Largest sphere radius the evaluator honors, in world units.
pub const MAX_SPHERE_RADIUS: f32 = 10.0;

/// Largest supported output texture edge.
pub const MAX_TEXTURE_SIZE: u32 = 8192;

/// Output sizes offered by hosts.
pub const TEXTURE_SIZE_PRESETS: [u32; 4] = [512, 1024, 2048, 4096];

/// How baked values are encoded in the length mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Grayscale `(v, v, v, 1)`, darker wins on overlap
    #[default]
    Opaque,
    /// Black with alpha `1 - v`, near-white values become transparent
    Transparent,
}

/// Global bake settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BakeSettings {
    /// Output texture edge in texels (default: 1024)
    #[serde(default = "default_texture_size")]
    pub texture_size: u32,
    /// Ray distance that maps to a full-length value (default: 0.05)
    #[serde(default = "default_max_distance")]
    pub max_distance: f32,
    /// Inward start offset for occlusion rays (default: 0.001)
    #[serde(default = "default_ray_offset")]
    pub ray_offset: f32,
    /// Exponent applied to the final value (default: 1.0)
    #[serde(default = "default_gamma")]
    pub gamma: f32,
    /// Gaussian blur radius in texels, 0 disables (default: 0)
    #[serde(default)]
    pub blur_radius: u32,
    /// Edge dilation in texels, 0 disables (default: 4)
    #[serde(default = "default_padding")]
    pub padding: u32,
    /// Length mask encoding (default: opaque)
    #[serde(default)]
    pub output_mode: OutputMode,
    /// Materials to bake; empty bakes every material (default: empty)
    #[serde(default)]
    pub materials: Vec<String>,
}

fn default_texture_size() -> u32 {
    1024
}
fn default_max_distance() -> f32 {
    0.05
}
fn default_ray_offset() -> f32 {
    0.001
}
fn default_gamma() -> f32 {
    1.0
}
fn default_padding() -> u32 {
    4
}

impl Default for BakeSettings {
    fn default() -> Self {
        Self {
            texture_size: default_texture_size(),
            max_distance: default_max_distance(),
            ray_offset: default_ray_offset(),
            gamma: default_gamma(),
            blur_radius: 0,
            padding: default_padding(),
            output_mode: OutputMode::default(),
            materials: Vec::new(),
        }
    }
}

impl BakeSettings {
    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let size = self.texture_size;
        if size == 0 || size > MAX_TEXTURE_SIZE || !size.is_power_of_two() {
            return Err(BakeError::InvalidSettings(format!(
                "texture_size {size} must be a power of two in 1..={MAX_TEXTURE_SIZE}"
            )));
        }
        if !self.max_distance.is_finite() || self.max_distance <= 0.0 {
            return Err(BakeError::InvalidSettings(format!(
                "max_distance {} must be positive",
                self.max_distance
            )));
        }
        if !self.ray_offset.is_finite() || self.ray_offset < 0.0 {
            return Err(BakeError::InvalidSettings(format!(
                "ray_offset {} must be non-negative",
                self.ray_offset
            )));
        }
        if !self.gamma.is_finite() || self.gamma <= 0.0 {
            return Err(BakeError::InvalidSettings(format!(
                "gamma {} must be positive",
                self.gamma
            )));
        }
        Ok(())
    }

    /// Triangles processed per tick.
    pub fn batch_size(&self) -> usize {
        let texels = self.texture_size as usize * self.texture_size as usize;
        (texels / 100).max(100)
    }

    /// Whether a material gets an output buffer.
    pub fn bakes_material(&self, name: &str) -> bool {
        self.materials.is_empty() || self.materials.iter().any(|m| m == name)
    }
}

/// User-authored spherical attenuation volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SphereMask {
    /// World-space center
    pub center: [f32; 3],
    /// Radius, clamped to [`MAX_SPHERE_RADIUS`]
    pub radius: f32,
    /// Fraction of the radius used for the soft edge, 0 = hard edge (default: 0.5)
    #[serde(default = "default_gradient")]
    pub gradient: f32,
    /// Masking strength at the core, 1 = fully masked (default: 1.0)
    #[serde(default = "default_intensity")]
    pub intensity: f32,
    /// Also apply the sphere mirrored across X = 0 (default: false)
    #[serde(default)]
    pub mirror_x: bool,
}

fn default_gradient() -> f32 {
    0.5
}
fn default_intensity() -> f32 {
    1.0
}

impl SphereMask {
    pub fn new(center: [f32; 3], radius: f32) -> Self {
        Self {
            center,
            radius,
            gradient: default_gradient(),
            intensity: default_intensity(),
            mirror_x: false,
        }
    }

    pub fn clamped_radius(&self) -> f32 {
        self.radius.clamp(0.0, MAX_SPHERE_RADIUS)
    }
}

/// Bone path (`/`-separated) to mask value in [0, 1].
pub type BoneMasks = BTreeMap<String, f32>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        assert!(BakeSettings::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_non_power_of_two_size() {
        let settings = BakeSettings {
            texture_size: 1000,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(BakeError::InvalidSettings(_))
        ));
    }

    #[test]
    fn test_rejects_non_positive_distance_and_gamma() {
        let settings = BakeSettings {
            max_distance: 0.0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        let settings = BakeSettings {
            gamma: f32::NAN,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_batch_size() {
        let mut settings = BakeSettings {
            texture_size: 4,
            ..Default::default()
        };
        assert_eq!(settings.batch_size(), 100);
        settings.texture_size = 1024;
        assert_eq!(settings.batch_size(), 1024 * 1024 / 100);
    }

    #[test]
    fn test_material_filter() {
        let mut settings = BakeSettings::default();
        assert!(settings.bakes_material("Body"));
        settings.materials = vec!["Body".to_string()];
        assert!(settings.bakes_material("Body"));
        assert!(!settings.bakes_material("Eyes"));
    }

    #[test]
    fn test_settings_from_toml_uses_defaults() {
        let settings: BakeSettings = toml::from_str(
            r#"
            texture_size = 2048
            output_mode = "transparent"
            "#,
        )
        .unwrap();
        assert_eq!(settings.texture_size, 2048);
        assert_eq!(settings.output_mode, OutputMode::Transparent);
        assert_eq!(settings.padding, 4);
        assert_eq!(settings.gamma, 1.0);
    }

    #[test]
    fn test_sphere_radius_clamped() {
        let sphere = SphereMask::new([0.0; 3], 100.0);
        assert_eq!(sphere.clamped_radius(), MAX_SPHERE_RADIUS);
        let sphere = SphereMask::new([0.0; 3], -1.0);
        assert_eq!(sphere.clamped_radius(), 0.0);
    }
}
