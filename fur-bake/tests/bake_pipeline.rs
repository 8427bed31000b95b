//! End-to-end bakes through `BakeSession`.

use fur_bake::*;
use glam::{Mat4, Vec2, Vec3, Vec4};

fn quad(material: &str) -> SurfaceMesh {
    SurfaceMesh {
        positions: vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
        ],
        normals: vec![Vec3::Z; 4],
        uvs: vec![
            Vec2::new(0.0, 0.0),
            Vec2::new(1.0, 0.0),
            Vec2::new(1.0, 1.0),
            Vec2::new(0.0, 1.0),
        ],
        tangents: vec![Vec4::new(1.0, 0.0, 0.0, 1.0); 4],
        submeshes: vec![Submesh::new(material, vec![0, 1, 2, 0, 2, 3])],
    }
}

/// Quad whose every vertex is fully weighted to `bone`.
fn skinned_quad(name: &str, bone: &str) -> Surface {
    Surface::new(name, quad("Body")).with_skin(SkinBinding {
        bone_paths: vec![bone.to_string()],
        joints: vec![[0; 4]; 4],
        weights: vec![[1.0, 0.0, 0.0, 0.0]; 4],
    })
}

fn settings(texture_size: u32) -> BakeSettings {
    BakeSettings {
        texture_size,
        padding: 0,
        ..Default::default()
    }
}

fn bake(input: BakeInput) -> BakeOutput {
    let mut session = BakeSession::new(input).unwrap();
    match session.run_to_end(&mut NoProgress) {
        TickStatus::Completed(output) => output,
        other => panic!("bake did not complete: {other:?}"),
    }
}

#[test]
fn test_unmasked_quad_bakes_uniform_white() {
    let output = bake(BakeInput {
        surfaces: vec![Surface::new("body", quad("Body"))],
        settings: settings(4),
        ..Default::default()
    });

    let body = &output["Body"];
    assert_eq!(body.length_mask.width, 4);
    assert!(
        body.length_mask.pixels.chunks_exact(4).all(|p| p == [255, 255, 255, 255]),
        "every texel should be rasterized white"
    );
    assert!(body.alpha_mask.pixels.chunks_exact(4).all(|p| p == [255, 255, 255, 255]));
}

#[test]
fn test_sphere_at_vertex_darkens_toward_it() {
    let mut sphere = SphereMask::new([0.0, 0.0, 0.0], 1.5);
    sphere.gradient = 1.0;
    sphere.intensity = 1.0;
    let output = bake(BakeInput {
        surfaces: vec![Surface::new("body", quad("Body"))],
        spheres: vec![sphere],
        settings: settings(4),
        ..Default::default()
    });

    let tex = &output["Body"].length_mask;
    let near = tex.get_pixel(0, 0)[0];
    let mid = tex.get_pixel(1, 1)[0];
    let far = tex.get_pixel(3, 3)[0];
    assert!(near < 20, "texel at the sphere center should be near 0, got {near}");
    assert!(near < mid && mid < far, "{near} < {mid} < {far}");
    // Texels equidistant from the center agree across the diagonal seam.
    let (a, b) = (tex.get_pixel(1, 0)[0], tex.get_pixel(0, 1)[0]);
    assert!(a.abs_diff(b) <= 1, "{a} vs {b}");
}

#[test]
fn test_transparent_darker_wins_across_surfaces() {
    let mut bone_masks = BoneMasks::new();
    bone_masks.insert("Root/Light".to_string(), 0.1);
    bone_masks.insert("Root/Dark".to_string(), 0.8);

    let bake_order = |surfaces: Vec<Surface>| {
        bake(BakeInput {
            surfaces,
            bone_masks: bone_masks.clone(),
            settings: BakeSettings {
                output_mode: OutputMode::Transparent,
                ..settings(4)
            },
            ..Default::default()
        })
    };
    let light_first = bake_order(vec![
        skinned_quad("light", "Root/Light"),
        skinned_quad("dark", "Root/Dark"),
    ]);
    let dark_first = bake_order(vec![
        skinned_quad("dark", "Root/Dark"),
        skinned_quad("light", "Root/Light"),
    ]);

    let tex = &light_first["Body"].length_mask;
    assert!(
        tex.pixels.chunks_exact(4).all(|p| p == [0, 0, 0, 204]),
        "value 0.2 should win as alpha 0.8"
    );
    assert_eq!(light_first, dark_first);

    // Value 0.2 is below the alpha threshold: no fur.
    let alpha = &light_first["Body"].alpha_mask;
    assert_eq!(alpha.get_pixel(2, 2), [0, 0, 0, 0]);
}

#[test]
fn test_transparent_light_only_stays_clear() {
    let mut bone_masks = BoneMasks::new();
    bone_masks.insert("Root".to_string(), 0.1);
    let output = bake(BakeInput {
        surfaces: vec![skinned_quad("light", "Root/Hand")],
        bone_masks,
        settings: BakeSettings {
            output_mode: OutputMode::Transparent,
            ..settings(4)
        },
        ..Default::default()
    });
    let body = &output["Body"];
    assert!(body.length_mask.pixels.chunks_exact(4).all(|p| p == [255, 255, 255, 0]));
    assert!(body.alpha_mask.pixels.chunks_exact(4).all(|p| p == [0, 0, 0, 255]));
}

#[test]
fn test_alpha_masks_agree_across_output_modes() {
    let mut sphere = SphereMask::new([0.0, 0.0, 0.0], 1.2);
    sphere.gradient = 1.0;
    let bake_mode = |output_mode| {
        bake(BakeInput {
            surfaces: vec![Surface::new("body", quad("Body"))],
            spheres: vec![sphere.clone()],
            settings: BakeSettings {
                output_mode,
                ..settings(8)
            },
            ..Default::default()
        })
    };
    let opaque = bake_mode(OutputMode::Opaque);
    let transparent = bake_mode(OutputMode::Transparent);

    let opaque = &opaque["Body"].alpha_mask;
    let transparent = &transparent["Body"].alpha_mask;
    let mut fur = 0;
    for y in 0..8 {
        for x in 0..8 {
            let has_fur = opaque.get_pixel(x, y) == [255, 255, 255, 255];
            let expected = if has_fur { [0, 0, 0, 255] } else { [0, 0, 0, 0] };
            assert_eq!(transparent.get_pixel(x, y), expected, "texel ({x}, {y})");
            fur += has_fur as u32;
        }
    }
    // Near the sphere center fur is cut, far texels keep it.
    assert!(fur > 0 && fur < 64, "{fur} fur texels");
    assert_eq!(opaque.get_pixel(7, 7), [255, 255, 255, 255]);
    assert_eq!(transparent.get_pixel(0, 0), [0, 0, 0, 0]);
}

#[test]
fn test_far_uv_with_normal_map_still_completes() {
    let mut mesh = quad("Body");
    mesh.uvs[3] = Vec2::new(1e30, 0.0);
    let output = bake(BakeInput {
        surfaces: vec![Surface::new("body", mesh)],
        normal_maps: vec![NormalMapEntry {
            material: "Body".to_string(),
            texture: TextureBuffer::filled(4, 4, [128, 128, 255, 255]),
            strength: 1.0,
        }],
        settings: settings(4),
        ..Default::default()
    });
    // The intact triangle (0, 1, 2) still bakes.
    assert_eq!(output["Body"].length_mask.get_pixel(3, 0), [255, 255, 255, 255]);
}

#[test]
fn test_cloth_occludes_covered_half() {
    let cloth = Surface::new("shirt", quad("Shirt")).with_transform(
        Mat4::from_translation(Vec3::new(-0.1, -0.1, 0.02))
            * Mat4::from_scale(Vec3::new(0.6, 1.2, 1.0)),
    );
    let output = bake(BakeInput {
        surfaces: vec![Surface::new("body", quad("Body"))],
        occluders: vec![cloth],
        settings: settings(4),
        ..Default::default()
    });

    let tex = &output["Body"].length_mask;
    for y in 0..4 {
        for x in 0..2 {
            let v = tex.get_pixel(x, y)[0];
            assert!((101..=103).contains(&v), "covered texel ({x}, {y}) = {v}");
        }
        for x in 2..4 {
            assert_eq!(tex.get_pixel(x, y)[0], 255, "open texel ({x}, {y})");
        }
    }
    assert!(!output.contains_key("Shirt"), "occluders are not baked");
}

#[test]
fn test_flat_normal_map_changes_nothing() {
    let flat = TextureBuffer::filled(8, 8, [128, 128, 255, 255]);
    let cloth = Surface::new("shirt", quad("Shirt"))
        .with_transform(Mat4::from_translation(Vec3::new(0.0, 0.0, 0.03)));
    let base = BakeInput {
        surfaces: vec![Surface::new("body", quad("Body"))],
        occluders: vec![cloth],
        settings: settings(8),
        ..Default::default()
    };
    let without = bake(base.clone());
    let with = bake(BakeInput {
        normal_maps: vec![NormalMapEntry {
            material: "Body".to_string(),
            texture: flat,
            strength: 1.0,
        }],
        ..base
    });
    assert_eq!(without, with);
}

#[test]
fn test_rerun_is_deterministic() {
    let mut sphere = SphereMask::new([0.5, 0.5, 0.0], 0.4);
    sphere.mirror_x = true;
    let input = BakeInput {
        surfaces: vec![Surface::new("body", quad("Body"))],
        occluders: vec![Surface::new("strap", quad("Strap")).with_transform(
            Mat4::from_translation(Vec3::new(0.3, 0.0, 0.01))
                * Mat4::from_scale(Vec3::new(0.2, 1.0, 1.0)),
        )],
        spheres: vec![sphere],
        settings: BakeSettings {
            blur_radius: 2,
            padding: 2,
            ..settings(32)
        },
        ..Default::default()
    };
    let mut session = BakeSession::new(input).unwrap();
    let first = session.run_to_end(&mut NoProgress);
    let second = session.run_to_end(&mut NoProgress);
    assert!(matches!(first, TickStatus::Completed(_)));
    assert_eq!(first, second);
}

#[test]
fn test_cancel_from_progress_sink_mid_bake() {
    // 150 quads, 300 triangles, 100 per tick.
    let surfaces: Vec<Surface> = (0..150)
        .map(|i| Surface::new(format!("patch{i}"), quad("Body")))
        .collect();
    let mut session = BakeSession::new(BakeInput {
        surfaces,
        settings: settings(16),
        ..Default::default()
    })
    .unwrap();
    let token = session.cancel_token();

    let mut seen = Vec::new();
    let mut sink = |p: f32, msg: &str| {
        seen.push(msg.to_string());
        if p > 0.3 {
            token.cancel();
        }
        ProgressAction::Continue
    };
    let status = session.run_to_end(&mut sink);

    assert_eq!(status, TickStatus::Cancelled);
    assert_eq!(seen, vec!["100/300".to_string(), "200/300".to_string()]);
    assert!(!session.has_resources());
    assert_eq!(session.state(), BakeState::Idle);
}

#[test]
fn test_outputs_write_as_png() {
    let output = bake(BakeInput {
        surfaces: vec![Surface::new("body", quad("Body"))],
        settings: settings(16),
        ..Default::default()
    });
    let dir = tempfile::tempdir().unwrap();
    for (material, textures) in &output {
        let length = dir.path().join(format!("{material}_length.png"));
        let alpha = dir.path().join(format!("{material}_alpha.png"));
        textures.length_mask.write_png(&length).unwrap();
        textures.alpha_mask.write_png(&alpha).unwrap();
        assert!(length.exists() && alpha.exists());
    }
}
