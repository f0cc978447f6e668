// SPDX-License-Identifier: CEPL-1.0
//! Geometry for the demo scene: a field of textured cubes, a row of glass
//! blocks, a floor grid and a crosshair overlay.

use tessera_core::Result;
use tessera_math::{InstanceData, OverlayVertex, TransparentVertex, Vertex, WireframeVertex};
use tessera_render_vk::{VkRenderer, UNTEXTURED_TEXTURE};

pub const CUBE: &str = "cube";
pub const GLASS: &str = "glass";
pub const GRID: &str = "grid";
pub const CROSSHAIR: &str = "crosshair";

/// Unit cube with its min corner at the origin, two triangles per face.
pub fn cube_vertices() -> Vec<Vertex> {
    // (outward normal, u axis, v axis, shade)
    let faces: [([f32; 3], [f32; 3], [f32; 3], f32); 6] = [
        ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], 0.9),
        ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0], 0.8),
        ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0], 0.9),
        ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0], 0.8),
        ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0], 1.0),
        ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0], 0.6),
    ];
    let mut out = Vec::with_capacity(36);
    for (normal, u, v, shade) in faces {
        let center = normal.map(|n| 0.5 + 0.5 * n);
        let corner = |su: f32, sv: f32| -> Vertex {
            let p = std::array::from_fn(|i| center[i] + 0.5 * (su * u[i] + sv * v[i]));
            Vertex::new(p, [shade; 3], [(su + 1.0) / 2.0, (1.0 - sv) / 2.0, 0.0])
        };
        let (a, b, c, d) = (corner(-1.0, -1.0), corner(1.0, -1.0), corner(1.0, 1.0), corner(-1.0, 1.0));
        out.extend_from_slice(&[a, b, c, a, c, d]);
    }
    out
}

/// The unit cube as a translucent shell with the given alpha.
pub fn glass_vertices(alpha: f32) -> Vec<TransparentVertex> {
    cube_vertices()
        .into_iter()
        .map(|v| {
            let [r, g, b] = v.color;
            TransparentVertex::new(v.position, [r * 0.6, g * 0.8, b, alpha], v.tex_coord)
        })
        .collect()
}

/// `n` x `n` cells of line-list segments on the y = 0 plane, centered on the origin.
pub fn grid_lines(n: u32, spacing: f32) -> Vec<WireframeVertex> {
    let half = n as f32 * spacing / 2.0;
    let mut out = Vec::with_capacity(((n + 1) * 4) as usize);
    for i in 0..=n {
        let t = -half + i as f32 * spacing;
        out.push(WireframeVertex { position: [t, 0.0, -half] });
        out.push(WireframeVertex { position: [t, 0.0, half] });
        out.push(WireframeVertex { position: [-half, 0.0, t] });
        out.push(WireframeVertex { position: [half, 0.0, t] });
    }
    out
}

/// Offsets of a `side` x `side` patch of cubes on the floor.
pub fn cube_field(side: i32) -> Vec<InstanceData> {
    let mut out = Vec::with_capacity((side * side) as usize);
    for x in -side / 2..side - side / 2 {
        for z in -side / 2..side - side / 2 {
            out.push(InstanceData::new(x as f32 * 2.0, 0.0, z as f32 * 2.0));
        }
    }
    out
}

/// Two thin quads crossing at the center of `bounds`.
pub fn crosshair(bounds: [f32; 3], tex_id: u32) -> Vec<OverlayVertex> {
    let (cx, cy) = (bounds[0] / 2.0, bounds[1] / 2.0);
    let (long, thin) = (1.5, 0.15);
    let quad = |w: f32, h: f32| {
        let v = |x: f32, y: f32| OverlayVertex {
            position: [cx + x, cy + y, 0.0],
            color: [1.0, 1.0, 1.0],
            tex_coord: [0.0, 0.0],
            tex_id,
        };
        [v(-w, -h), v(w, -h), v(w, h), v(-w, -h), v(w, h), v(-w, h)]
    };
    let mut out = quad(long, thin).to_vec();
    out.extend_from_slice(&quad(thin, long));
    out
}

pub fn populate(renderer: &mut VkRenderer, overlay_bounds: [f32; 3]) -> Result<()> {
    renderer.set_model(CUBE, &cube_vertices())?;
    renderer.add_instances_to_model(CUBE, "field", &cube_field(8))?;

    // no opaque core, so only the translucent layer draws
    renderer.set_model_with_transparency(GLASS, &[], &glass_vertices(0.35))?;
    let row: Vec<InstanceData> = (-2..=2).map(|x| InstanceData::new(x as f32 * 2.0, 2.0, -10.0)).collect();
    renderer.add_instances_to_model(GLASS, "row", &row)?;

    renderer.set_wireframe_model(GRID, &grid_lines(32, 1.0))?;
    renderer.add_instances_to_wireframe_model(GRID, "floor", &[InstanceData::new(0.0, 0.0, 0.0)])?;

    let [x, y, z] = overlay_bounds;
    renderer.set_overlay_bounds(x, y, z);
    let white = renderer.texture_id(UNTEXTURED_TEXTURE)?;
    renderer.set_overlay_vertices(CROSSHAIR, &crosshair(overlay_bounds, white))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cube_stays_inside_unit_box() {
        let v = cube_vertices();
        assert_eq!(v.len(), 36);
        for vert in &v {
            assert!(vert.position.iter().all(|&c| (0.0..=1.0).contains(&c)));
            assert!(vert.tex_coord[..2].iter().all(|&c| (0.0..=1.0).contains(&c)));
        }
        let top = v.iter().filter(|v| v.position[1] == 1.0).count();
        // the top face plus one edge from each of the four side faces
        assert_eq!(top, 6 + 4 * 3);
    }

    #[test]
    fn glass_follows_the_cube_with_constant_alpha() {
        let glass = glass_vertices(0.35);
        let cube = cube_vertices();
        assert_eq!(glass.len(), cube.len());
        assert!(glass.iter().zip(&cube).all(|(g, c)| g.position == c.position));
        assert!(glass.iter().all(|v| v.color[3] == 0.35));
    }

    #[test]
    fn grid_has_two_segments_per_line() {
        let g = grid_lines(4, 1.0);
        assert_eq!(g.len(), 5 * 4);
        assert_eq!(g[0].position, [-2.0, 0.0, -2.0]);
        assert_eq!(g[1].position, [-2.0, 0.0, 2.0]);
    }

    #[test]
    fn field_is_square() {
        let f = cube_field(3);
        assert_eq!(f.len(), 9);
        assert_eq!(f[0], InstanceData::new(-2.0, 0.0, -2.0));
        assert_eq!(f[8], InstanceData::new(2.0, 0.0, 2.0));
    }

    #[test]
    fn crosshair_is_centered_and_tagged() {
        let c = crosshair([100.0, 100.0, 100.0], 1);
        assert_eq!(c.len(), 12);
        assert!(c.iter().all(|v| v.tex_id == 1));
        let mean_x = c.iter().map(|v| v.position[0]).sum::<f32>() / c.len() as f32;
        assert!((mean_x - 50.0).abs() < 1e-4);
    }
}
