// SPDX-License-Identifier: CEPL-1.0
//! Descriptor set layouts and the per-image descriptor sets.
//!
//! Every swapchain image owns one scene set (camera uniform + current
//! texture array) and one overlay set (overlay uniform + the overlay
//! texture table). Sets are rewritten right before their image's command
//! buffer is re-recorded, while nothing in flight reads them.

use anyhow::{Context, Result};
use ash::vk;

pub const UNIFORM_BINDING: u32 = 0;
pub const SAMPLER_BINDING: u32 = 1;

pub struct SetLayouts {
    pub scene: vk::DescriptorSetLayout,
    pub overlay: vk::DescriptorSetLayout,
    /// Length of the overlay sampler array.
    pub overlay_capacity: u32,
}

unsafe fn set_layout(
    device: &ash::Device,
    uniform_stage: vk::ShaderStageFlags,
    sampler_count: u32,
) -> Result<vk::DescriptorSetLayout> {
    let bindings = [
        vk::DescriptorSetLayoutBinding {
            binding: UNIFORM_BINDING,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: 1,
            stage_flags: uniform_stage,
            ..Default::default()
        },
        vk::DescriptorSetLayoutBinding {
            binding: SAMPLER_BINDING,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: sampler_count,
            stage_flags: vk::ShaderStageFlags::FRAGMENT,
            ..Default::default()
        },
    ];
    let ci = vk::DescriptorSetLayoutCreateInfo {
        s_type: vk::StructureType::DESCRIPTOR_SET_LAYOUT_CREATE_INFO,
        binding_count: bindings.len() as u32,
        p_bindings: bindings.as_ptr(),
        ..Default::default()
    };
    Ok(device.create_descriptor_set_layout(&ci, None)?)
}

impl SetLayouts {
    pub unsafe fn new(device: &ash::Device, overlay_capacity: u32) -> Result<Self> {
        let scene = set_layout(device, vk::ShaderStageFlags::VERTEX, 1).context("scene set layout")?;
        let overlay = match set_layout(device, vk::ShaderStageFlags::VERTEX, overlay_capacity) {
            Ok(l) => l,
            Err(e) => {
                device.destroy_descriptor_set_layout(scene, None);
                return Err(e.context("overlay set layout"));
            }
        };
        Ok(Self {
            scene,
            overlay,
            overlay_capacity,
        })
    }

    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        device.destroy_descriptor_set_layout(self.scene, None);
        device.destroy_descriptor_set_layout(self.overlay, None);
        self.scene = vk::DescriptorSetLayout::null();
        self.overlay = vk::DescriptorSetLayout::null();
    }
}

/// Pool sizes for `image_count` scene sets plus as many overlay sets.
pub fn pool_sizes(image_count: u32, overlay_capacity: u32) -> [vk::DescriptorPoolSize; 2] {
    [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: image_count * 2,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: image_count * (1 + overlay_capacity),
        },
    ]
}

pub struct DescriptorSets {
    pool: vk::DescriptorPool,
    pub scene: Vec<vk::DescriptorSet>,
    pub overlay: Vec<vk::DescriptorSet>,
}

impl DescriptorSets {
    pub unsafe fn new(device: &ash::Device, layouts: &SetLayouts, image_count: usize) -> Result<Self> {
        let n = image_count as u32;
        let sizes = pool_sizes(n, layouts.overlay_capacity);
        let pool_ci = vk::DescriptorPoolCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
            max_sets: n * 2,
            pool_size_count: sizes.len() as u32,
            p_pool_sizes: sizes.as_ptr(),
            ..Default::default()
        };
        let pool = device.create_descriptor_pool(&pool_ci, None).context("create_descriptor_pool")?;

        let allocate = |layout: vk::DescriptorSetLayout| -> Result<Vec<vk::DescriptorSet>> {
            let set_layouts = vec![layout; image_count];
            let ai = vk::DescriptorSetAllocateInfo {
                s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
                descriptor_pool: pool,
                descriptor_set_count: n,
                p_set_layouts: set_layouts.as_ptr(),
                ..Default::default()
            };
            Ok(device.allocate_descriptor_sets(&ai)?)
        };
        let sets = allocate(layouts.scene).and_then(|scene| Ok((scene, allocate(layouts.overlay)?)));
        match sets {
            Ok((scene, overlay)) => Ok(Self { pool, scene, overlay }),
            Err(e) => {
                device.destroy_descriptor_pool(pool, None);
                Err(e.context("allocate_descriptor_sets"))
            }
        }
    }

    /// Frees the pool and with it every set.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        if self.pool != vk::DescriptorPool::null() {
            device.destroy_descriptor_pool(self.pool, None);
            self.pool = vk::DescriptorPool::null();
        }
        self.scene.clear();
        self.overlay.clear();
    }
}

/// What one image's sets point at.
pub struct ImageBindings<'a> {
    pub scene_uniform: vk::Buffer,
    pub overlay_uniform: vk::Buffer,
    pub array_view: vk::ImageView,
    /// One view per overlay table slot, `overlay_capacity` long.
    pub overlay_views: &'a [vk::ImageView],
    pub sampler: vk::Sampler,
}

fn image_info(sampler: vk::Sampler, view: vk::ImageView) -> vk::DescriptorImageInfo {
    vk::DescriptorImageInfo {
        sampler,
        image_view: view,
        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    }
}

pub unsafe fn write_image_sets(
    device: &ash::Device,
    scene_set: vk::DescriptorSet,
    overlay_set: vk::DescriptorSet,
    b: &ImageBindings<'_>,
) {
    let scene_ubo = vk::DescriptorBufferInfo {
        buffer: b.scene_uniform,
        offset: 0,
        range: vk::WHOLE_SIZE,
    };
    let overlay_ubo = vk::DescriptorBufferInfo {
        buffer: b.overlay_uniform,
        offset: 0,
        range: vk::WHOLE_SIZE,
    };
    let array = image_info(b.sampler, b.array_view);
    let table: Vec<vk::DescriptorImageInfo> = b
        .overlay_views
        .iter()
        .map(|&view| image_info(b.sampler, view))
        .collect();

    let writes = [
        vk::WriteDescriptorSet {
            s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
            dst_set: scene_set,
            dst_binding: UNIFORM_BINDING,
            descriptor_count: 1,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            p_buffer_info: &scene_ubo,
            ..Default::default()
        },
        vk::WriteDescriptorSet {
            s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
            dst_set: scene_set,
            dst_binding: SAMPLER_BINDING,
            descriptor_count: 1,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            p_image_info: &array,
            ..Default::default()
        },
        vk::WriteDescriptorSet {
            s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
            dst_set: overlay_set,
            dst_binding: UNIFORM_BINDING,
            descriptor_count: 1,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            p_buffer_info: &overlay_ubo,
            ..Default::default()
        },
        vk::WriteDescriptorSet {
            s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
            dst_set: overlay_set,
            dst_binding: SAMPLER_BINDING,
            descriptor_count: table.len() as u32,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            p_image_info: table.as_ptr(),
            ..Default::default()
        },
    ];
    device.update_descriptor_sets(&writes, &[]);
}
