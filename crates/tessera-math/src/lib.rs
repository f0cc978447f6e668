// SPDX-License-Identifier: CEPL-1.0
//! Math and GPU data layouts shared by the renderer crates.

mod camera;
mod vertex;

pub use camera::Camera;
pub use glam;
pub use vertex::{
    InstanceData, OverlayUniform, OverlayVertex, SceneUniform, TransparentVertex, Vertex, WireframeVertex,
};
