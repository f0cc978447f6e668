// SPDX-License-Identifier: CEPL-1.0
//! Backend-independent command plan for one presentable image.
//!
//! [`record_scene`] walks the scene in draw order and emits the commands a
//! backend has to encode. Opaque models come first, then their translucent
//! layers, then a depth clear, then wireframes, and overlays last.

use bytemuck::Pod;

use crate::buffer::{BufferAllocator, DynamicBuffer};
use crate::scene::{InstancedModel, ModelRegistry, Scene};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DrawCategory {
    Opaque,
    /// Blended, depth-tested against opaque geometry without writing depth.
    Transparent,
    Wireframe,
    Overlay,
}

/// Vertex binding of the base geometry.
pub const BASE_BINDING: u32 = 0;
/// Vertex binding of the per-instance data.
pub const INSTANCE_BINDING: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RenderCommand<H> {
    BeginRendering { clear_color: [f32; 4] },
    BindPipeline(DrawCategory),
    BindDescriptorSet(DrawCategory),
    BindVertexBuffer { binding: u32, buffer: H },
    Draw { vertex_count: u32, instance_count: u32 },
    ClearDepth,
    EndRendering,
}

pub fn record_scene<A: BufferAllocator>(scene: &Scene<A>) -> Vec<RenderCommand<A::Handle>> {
    let mut out = vec![RenderCommand::BeginRendering {
        clear_color: scene.clear_color(),
    }];

    bind_category(&mut out, DrawCategory::Opaque);
    instanced_draws(&mut out, &scene.models, InstancedModel::base);

    bind_category(&mut out, DrawCategory::Transparent);
    instanced_draws(&mut out, &scene.models, InstancedModel::transparent);

    out.push(RenderCommand::ClearDepth);

    bind_category(&mut out, DrawCategory::Wireframe);
    instanced_draws(&mut out, &scene.wireframes, InstancedModel::base);

    bind_category(&mut out, DrawCategory::Overlay);
    for (_, buffer) in scene.overlays.iter() {
        let Some(handle) = buffer.handle() else { continue };
        out.push(RenderCommand::BindVertexBuffer {
            binding: BASE_BINDING,
            buffer: handle,
        });
        out.push(RenderCommand::Draw {
            vertex_count: buffer.len() as u32,
            instance_count: 1,
        });
    }

    out.push(RenderCommand::EndRendering);
    out
}

fn bind_category<H>(out: &mut Vec<RenderCommand<H>>, category: DrawCategory) {
    out.push(RenderCommand::BindPipeline(category));
    out.push(RenderCommand::BindDescriptorSet(category));
}

/// One draw per non-empty instance set, against the geometry `layer` picks.
fn instanced_draws<V: Pod, T: Pod, A: BufferAllocator>(
    out: &mut Vec<RenderCommand<A::Handle>>,
    models: &ModelRegistry<V, A>,
    layer: fn(&InstancedModel<V, A>) -> &DynamicBuffer<T, A>,
) {
    for (_, model) in models.iter() {
        let geometry = layer(model);
        let Some(base) = geometry.handle() else { continue };
        let vertex_count = geometry.len() as u32;

        let mut bound = false;
        for (_, set) in model.instance_sets() {
            let Some(instances) = set.handle() else { continue };
            if !bound {
                out.push(RenderCommand::BindVertexBuffer {
                    binding: BASE_BINDING,
                    buffer: base,
                });
                bound = true;
            }
            out.push(RenderCommand::BindVertexBuffer {
                binding: INSTANCE_BINDING,
                buffer: instances,
            });
            out.push(RenderCommand::Draw {
                vertex_count,
                instance_count: set.len() as u32,
            });
        }
    }
}

/// Which scene generation each image's command buffer was recorded at.
#[derive(Debug, Default)]
pub struct CommandCache {
    recorded: Vec<Option<u64>>,
}

impl CommandCache {
    pub fn new(image_count: usize) -> Self {
        Self {
            recorded: vec![None; image_count],
        }
    }

    pub fn is_stale(&self, image: u32, generation: u64) -> bool {
        self.recorded.get(image as usize).copied().flatten() != Some(generation)
    }

    pub fn mark_recorded(&mut self, image: u32, generation: u64) {
        if let Some(slot) = self.recorded.get_mut(image as usize) {
            *slot = Some(generation);
        }
    }

    pub fn invalidate(&mut self) {
        self.recorded.iter_mut().for_each(|r| *r = None);
    }

    pub fn reset(&mut self, image_count: usize) {
        self.recorded = vec![None; image_count];
    }

    pub fn len(&self) -> usize {
        self.recorded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recorded.is_empty()
    }
}
