// SPDX-License-Identifier: CEPL-1.0
//! Encodes a [`RenderCommand`] plan into a Vulkan command buffer.

use anyhow::{bail, Result};
use ash::vk;
use tessera_render::{DrawCategory, RenderCommand};

use crate::pipeline::Pipelines;
use crate::swapchain::{color_range, DepthTarget};

/// The image a command buffer draws into.
pub struct Target<'a> {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub depth: &'a DepthTarget,
    pub extent: vk::Extent2D,
}

/// Descriptor sets bound for each category.
pub struct Sets {
    pub scene: vk::DescriptorSet,
    pub overlay: vk::DescriptorSet,
}

/// Flipped so +Y points up in clip space.
pub fn viewport(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: extent.height as f32,
        width: extent.width as f32,
        height: -(extent.height as f32),
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

pub fn depth_aspects(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT | vk::Format::D16_UNORM_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::DEPTH,
    }
}

pub fn pipeline_for(p: &Pipelines, category: DrawCategory) -> (vk::Pipeline, vk::PipelineLayout) {
    match category {
        DrawCategory::Opaque => (p.opaque, p.scene_layout),
        DrawCategory::Transparent => (p.transparent, p.scene_layout),
        DrawCategory::Wireframe => (p.wireframe, p.scene_layout),
        DrawCategory::Overlay => (p.overlay, p.overlay_layout),
    }
}

fn set_for(sets: &Sets, category: DrawCategory) -> vk::DescriptorSet {
    match category {
        DrawCategory::Opaque | DrawCategory::Transparent | DrawCategory::Wireframe => sets.scene,
        DrawCategory::Overlay => sets.overlay,
    }
}

fn full_rect(extent: vk::Extent2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    }
}

unsafe fn barrier(device: &ash::Device, cmd: vk::CommandBuffer, barrier: vk::ImageMemoryBarrier2<'_>) {
    let dep = vk::DependencyInfo {
        s_type: vk::StructureType::DEPENDENCY_INFO,
        image_memory_barrier_count: 1,
        p_image_memory_barriers: &barrier,
        ..Default::default()
    };
    device.cmd_pipeline_barrier2(cmd, &dep);
}

unsafe fn transition_to_color(device: &ash::Device, cmd: vk::CommandBuffer, image: vk::Image) {
    barrier(
        device,
        cmd,
        vk::ImageMemoryBarrier2 {
            s_type: vk::StructureType::IMAGE_MEMORY_BARRIER_2,
            src_stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            src_access_mask: vk::AccessFlags2::empty(),
            dst_stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            dst_access_mask: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE | vk::AccessFlags2::COLOR_ATTACHMENT_READ,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            image,
            subresource_range: color_range(1),
            ..Default::default()
        },
    );
}

unsafe fn transition_depth(device: &ash::Device, cmd: vk::CommandBuffer, depth: &DepthTarget) {
    // the depth image is shared by every image; wait out earlier frames' depth writes
    let tests = vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS;
    barrier(
        device,
        cmd,
        vk::ImageMemoryBarrier2 {
            s_type: vk::StructureType::IMAGE_MEMORY_BARRIER_2,
            src_stage_mask: tests,
            src_access_mask: vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
            dst_stage_mask: tests,
            dst_access_mask: vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE
                | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            image: depth.image,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: depth_aspects(depth.format),
                ..color_range(1)
            },
            ..Default::default()
        },
    );
}

unsafe fn transition_to_present(device: &ash::Device, cmd: vk::CommandBuffer, image: vk::Image) {
    barrier(
        device,
        cmd,
        vk::ImageMemoryBarrier2 {
            s_type: vk::StructureType::IMAGE_MEMORY_BARRIER_2,
            src_stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            src_access_mask: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            dst_stage_mask: vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
            dst_access_mask: vk::AccessFlags2::empty(),
            old_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            image,
            subresource_range: color_range(1),
            ..Default::default()
        },
    );
}

unsafe fn begin_rendering(device: &ash::Device, cmd: vk::CommandBuffer, target: &Target<'_>, clear_color: [f32; 4]) {
    let color_att = vk::RenderingAttachmentInfo {
        s_type: vk::StructureType::RENDERING_ATTACHMENT_INFO,
        image_view: target.view,
        image_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        clear_value: vk::ClearValue {
            color: vk::ClearColorValue { float32: clear_color },
        },
        ..Default::default()
    };
    let depth_att = vk::RenderingAttachmentInfo {
        s_type: vk::StructureType::RENDERING_ATTACHMENT_INFO,
        image_view: target.depth.view,
        image_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::DONT_CARE,
        clear_value: vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
        },
        ..Default::default()
    };
    let rendering_info = vk::RenderingInfo {
        s_type: vk::StructureType::RENDERING_INFO,
        render_area: full_rect(target.extent),
        layer_count: 1,
        color_attachment_count: 1,
        p_color_attachments: &color_att,
        p_depth_attachment: &depth_att,
        ..Default::default()
    };
    device.cmd_begin_rendering(cmd, &rendering_info);

    let vp = viewport(target.extent);
    device.cmd_set_viewport(cmd, 0, std::slice::from_ref(&vp));
    let sc = full_rect(target.extent);
    device.cmd_set_scissor(cmd, 0, std::slice::from_ref(&sc));
}

/// Resets `cmd` and records `plan` into it.
pub unsafe fn encode(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    target: &Target<'_>,
    pipelines: &Pipelines,
    sets: &Sets,
    plan: &[RenderCommand<vk::Buffer>],
) -> Result<()> {
    device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
    let begin = vk::CommandBufferBeginInfo {
        s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
        ..Default::default()
    };
    device.begin_command_buffer(cmd, &begin)?;

    transition_to_color(device, cmd, target.image);
    transition_depth(device, cmd, target.depth);

    let mut layout = vk::PipelineLayout::null();
    for command in plan {
        match *command {
            RenderCommand::BeginRendering { clear_color } => begin_rendering(device, cmd, target, clear_color),
            RenderCommand::BindPipeline(category) => {
                let (pipeline, pipeline_layout) = pipeline_for(pipelines, category);
                if pipeline == vk::Pipeline::null() {
                    bail!("{category:?} pipeline is VK_NULL_HANDLE at record time");
                }
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
                layout = pipeline_layout;
            }
            RenderCommand::BindDescriptorSet(category) => {
                let set = set_for(sets, category);
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    layout,
                    0,
                    std::slice::from_ref(&set),
                    &[],
                );
            }
            RenderCommand::BindVertexBuffer { binding, buffer } => {
                device.cmd_bind_vertex_buffers(cmd, binding, std::slice::from_ref(&buffer), &[0]);
            }
            RenderCommand::Draw {
                vertex_count,
                instance_count,
            } => device.cmd_draw(cmd, vertex_count, instance_count, 0, 0),
            RenderCommand::ClearDepth => {
                let attachment = vk::ClearAttachment {
                    aspect_mask: vk::ImageAspectFlags::DEPTH,
                    color_attachment: 0,
                    clear_value: vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
                    },
                };
                let rect = vk::ClearRect {
                    rect: full_rect(target.extent),
                    base_array_layer: 0,
                    layer_count: 1,
                };
                device.cmd_clear_attachments(cmd, &[attachment], &[rect]);
            }
            RenderCommand::EndRendering => device.cmd_end_rendering(cmd),
        }
    }

    transition_to_present(device, cmd, target.image);
    device.end_command_buffer(cmd)?;
    Ok(())
}
