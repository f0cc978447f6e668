// SPDX-License-Identifier: CEPL-1.0
//! Vertex and uniform layouts as the shaders see them.
//!
//! Everything here is `#[repr(C)]` and `Pod` so it can be copied straight
//! into mapped GPU memory.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

/// Textured, colored vertex of an opaque model. `tex_coord.z` selects the
/// layer of the current texture array.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 3],
    pub tex_coord: [f32; 3],
}

impl Vertex {
    pub const fn new(position: [f32; 3], color: [f32; 3], tex_coord: [f32; 3]) -> Self {
        Self { position, color, tex_coord }
    }
}

/// Vertex of a model's translucent layer. Same as [`Vertex`] with an alpha
/// channel; drawn blended after every opaque model.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct TransparentVertex {
    pub position: [f32; 3],
    pub color: [f32; 4],
    pub tex_coord: [f32; 3],
}

impl TransparentVertex {
    pub const fn new(position: [f32; 3], color: [f32; 4], tex_coord: [f32; 3]) -> Self {
        Self { position, color, tex_coord }
    }
}

/// Per-instance offset added to every vertex of the base model.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct InstanceData {
    pub pos: [f32; 3],
}

impl InstanceData {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { pos: [x, y, z] }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct WireframeVertex {
    pub position: [f32; 3],
}

/// 2D overlay vertex. Position is in overlay-bounds units; `tex_id` indexes
/// the overlay texture table.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct OverlayVertex {
    pub position: [f32; 3],
    pub color: [f32; 3],
    pub tex_coord: [f32; 2],
    pub tex_id: u32,
}

/// Camera matrices plus a full-screen color tint. `tint.w` is padding.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct SceneUniform {
    pub model: [[f32; 4]; 4],
    pub view: [[f32; 4]; 4],
    pub projection: [[f32; 4]; 4],
    pub tint: [f32; 4],
}

impl SceneUniform {
    pub fn new(view: Mat4, projection: Mat4, tint: Vec3) -> Self {
        Self {
            model: Mat4::IDENTITY.to_cols_array_2d(),
            view: view.to_cols_array_2d(),
            projection: projection.to_cols_array_2d(),
            tint: tint.extend(1.0).to_array(),
        }
    }
}

impl Default for SceneUniform {
    fn default() -> Self {
        Self::new(Mat4::IDENTITY, Mat4::IDENTITY, Vec3::ONE)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct OverlayUniform {
    pub bounds: [f32; 4],
}

impl OverlayUniform {
    pub fn new(bounds: Vec3) -> Self {
        Self { bounds: bounds.extend(1.0).to_array() }
    }
}

impl Default for OverlayUniform {
    fn default() -> Self {
        Self::new(Vec3::splat(100.0))
    }
}
