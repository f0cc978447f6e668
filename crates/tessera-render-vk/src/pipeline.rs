// SPDX-License-Identifier: CEPL-1.0
//! The four graphics pipelines: opaque instanced, translucent instanced,
//! wireframe and overlay.

use std::io::Cursor;
use std::mem::{offset_of, size_of};

use anyhow::{anyhow, Context, Result};
use ash::util::read_spv;
use ash::vk;
use tessera_math::{InstanceData, OverlayVertex, TransparentVertex, Vertex, WireframeVertex};
use tessera_render::recorder::{BASE_BINDING, INSTANCE_BINDING};
use tessera_render::WireframeTopology;
use tracing::debug;

const SCENE_VERT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/scene.vert.spv"));
const SCENE_FRAG: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/scene.frag.spv"));
const GLASS_VERT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/glass.vert.spv"));
const GLASS_FRAG: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/glass.frag.spv"));
const WIREFRAME_VERT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/wireframe.vert.spv"));
const WIREFRAME_FRAG: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/wireframe.frag.spv"));
const OVERLAY_VERT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/overlay.vert.spv"));
const OVERLAY_FRAG: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/overlay.frag.spv"));

fn binding(binding: u32, stride: usize, input_rate: vk::VertexInputRate) -> vk::VertexInputBindingDescription {
    vk::VertexInputBindingDescription {
        binding,
        stride: stride as u32,
        input_rate,
    }
}

fn attribute(location: u32, binding: u32, format: vk::Format, offset: usize) -> vk::VertexInputAttributeDescription {
    vk::VertexInputAttributeDescription {
        location,
        binding,
        format,
        offset: offset as u32,
    }
}

fn instance_binding() -> vk::VertexInputBindingDescription {
    binding(INSTANCE_BINDING, size_of::<InstanceData>(), vk::VertexInputRate::INSTANCE)
}

/// Vertex layout of the opaque pipeline.
pub fn scene_vertex_input() -> (Vec<vk::VertexInputBindingDescription>, Vec<vk::VertexInputAttributeDescription>) {
    let rgb = vk::Format::R32G32B32_SFLOAT;
    (
        vec![
            binding(BASE_BINDING, size_of::<Vertex>(), vk::VertexInputRate::VERTEX),
            instance_binding(),
        ],
        vec![
            attribute(0, BASE_BINDING, rgb, offset_of!(Vertex, position)),
            attribute(1, BASE_BINDING, rgb, offset_of!(Vertex, color)),
            attribute(2, BASE_BINDING, rgb, offset_of!(Vertex, tex_coord)),
            attribute(3, INSTANCE_BINDING, rgb, offset_of!(InstanceData, pos)),
        ],
    )
}

/// Vertex layout of the translucent pipeline. Same locations as the opaque
/// one with a four-component color.
pub fn transparent_vertex_input() -> (Vec<vk::VertexInputBindingDescription>, Vec<vk::VertexInputAttributeDescription>) {
    let rgb = vk::Format::R32G32B32_SFLOAT;
    (
        vec![
            binding(BASE_BINDING, size_of::<TransparentVertex>(), vk::VertexInputRate::VERTEX),
            instance_binding(),
        ],
        vec![
            attribute(0, BASE_BINDING, rgb, offset_of!(TransparentVertex, position)),
            attribute(1, BASE_BINDING, vk::Format::R32G32B32A32_SFLOAT, offset_of!(TransparentVertex, color)),
            attribute(2, BASE_BINDING, rgb, offset_of!(TransparentVertex, tex_coord)),
            attribute(3, INSTANCE_BINDING, rgb, offset_of!(InstanceData, pos)),
        ],
    )
}

pub fn wireframe_vertex_input() -> (Vec<vk::VertexInputBindingDescription>, Vec<vk::VertexInputAttributeDescription>) {
    let rgb = vk::Format::R32G32B32_SFLOAT;
    (
        vec![
            binding(BASE_BINDING, size_of::<WireframeVertex>(), vk::VertexInputRate::VERTEX),
            instance_binding(),
        ],
        vec![
            attribute(0, BASE_BINDING, rgb, offset_of!(WireframeVertex, position)),
            attribute(1, INSTANCE_BINDING, rgb, offset_of!(InstanceData, pos)),
        ],
    )
}

pub fn overlay_vertex_input() -> (Vec<vk::VertexInputBindingDescription>, Vec<vk::VertexInputAttributeDescription>) {
    (
        vec![binding(BASE_BINDING, size_of::<OverlayVertex>(), vk::VertexInputRate::VERTEX)],
        vec![
            attribute(0, BASE_BINDING, vk::Format::R32G32B32_SFLOAT, offset_of!(OverlayVertex, position)),
            attribute(1, BASE_BINDING, vk::Format::R32G32B32_SFLOAT, offset_of!(OverlayVertex, color)),
            attribute(2, BASE_BINDING, vk::Format::R32G32_SFLOAT, offset_of!(OverlayVertex, tex_coord)),
            attribute(3, BASE_BINDING, vk::Format::R32_UINT, offset_of!(OverlayVertex, tex_id)),
        ],
    )
}

pub fn topology_of(t: WireframeTopology) -> vk::PrimitiveTopology {
    match t {
        WireframeTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
        WireframeTopology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
    }
}

unsafe fn shader_module(device: &ash::Device, bytes: &[u8]) -> Result<vk::ShaderModule> {
    let code = read_spv(&mut Cursor::new(bytes))?;
    let ci = vk::ShaderModuleCreateInfo {
        s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
        p_code: code.as_ptr(),
        code_size: code.len() * 4,
        ..Default::default()
    };
    Ok(device.create_shader_module(&ci, None)?)
}

struct PipelineDesc<'a> {
    name: &'static str,
    vert: &'a [u8],
    frag: &'a [u8],
    vertex_input: (Vec<vk::VertexInputBindingDescription>, Vec<vk::VertexInputAttributeDescription>),
    topology: vk::PrimitiveTopology,
    depth: Depth,
    blend: bool,
    /// Value of specialization constant 0 in the fragment stage.
    frag_constant: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Depth {
    Off,
    TestAndWrite,
    /// Tested against what is already there, never written.
    TestOnly,
}

impl Depth {
    fn flags(self) -> (vk::Bool32, vk::Bool32) {
        match self {
            Depth::Off => (vk::FALSE, vk::FALSE),
            Depth::TestAndWrite => (vk::TRUE, vk::TRUE),
            Depth::TestOnly => (vk::TRUE, vk::FALSE),
        }
    }
}

#[derive(Clone, Copy)]
pub struct Targets {
    pub color_format: vk::Format,
    pub depth_format: vk::Format,
}

unsafe fn create_pipeline(
    device: &ash::Device,
    cache: vk::PipelineCache,
    targets: Targets,
    layout: vk::PipelineLayout,
    desc: &PipelineDesc<'_>,
) -> Result<vk::Pipeline> {
    // STRICT: color_attachment_formats MUST match current swapchain image format.
    let vs = shader_module(device, desc.vert).with_context(|| format!("{} vertex shader", desc.name))?;
    let fs = match shader_module(device, desc.frag) {
        Ok(fs) => fs,
        Err(e) => {
            device.destroy_shader_module(vs, None);
            return Err(e.context(format!("{} fragment shader", desc.name)));
        }
    };

    let constant_entry = vk::SpecializationMapEntry {
        constant_id: 0,
        offset: 0,
        size: size_of::<u32>(),
    };
    let constant_value = desc.frag_constant.unwrap_or_default();
    let specialization = vk::SpecializationInfo {
        map_entry_count: 1,
        p_map_entries: &constant_entry,
        data_size: size_of::<u32>(),
        p_data: (&constant_value as *const u32).cast(),
        ..Default::default()
    };

    let stages = [
        vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: vk::ShaderStageFlags::VERTEX,
            module: vs,
            p_name: c"main".as_ptr(),
            ..Default::default()
        },
        vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: vk::ShaderStageFlags::FRAGMENT,
            module: fs,
            p_name: c"main".as_ptr(),
            p_specialization_info: if desc.frag_constant.is_some() {
                &specialization
            } else {
                std::ptr::null()
            },
            ..Default::default()
        },
    ];

    let (vb, va) = &desc.vertex_input;
    let vertex_input = vk::PipelineVertexInputStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VERTEX_INPUT_STATE_CREATE_INFO,
        vertex_binding_description_count: vb.len() as u32,
        p_vertex_binding_descriptions: vb.as_ptr(),
        vertex_attribute_description_count: va.len() as u32,
        p_vertex_attribute_descriptions: va.as_ptr(),
        ..Default::default()
    };
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_INPUT_ASSEMBLY_STATE_CREATE_INFO,
        topology: desc.topology,
        ..Default::default()
    };
    let dyn_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_DYNAMIC_STATE_CREATE_INFO,
        dynamic_state_count: dyn_states.len() as u32,
        p_dynamic_states: dyn_states.as_ptr(),
        ..Default::default()
    };
    let viewport_state = vk::PipelineViewportStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VIEWPORT_STATE_CREATE_INFO,
        viewport_count: 1,
        scissor_count: 1,
        ..Default::default()
    };
    let raster = vk::PipelineRasterizationStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_RASTERIZATION_STATE_CREATE_INFO,
        polygon_mode: vk::PolygonMode::FILL,
        cull_mode: vk::CullModeFlags::NONE,
        front_face: vk::FrontFace::COUNTER_CLOCKWISE,
        line_width: 1.0,
        ..Default::default()
    };
    let multisample = vk::PipelineMultisampleStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_MULTISAMPLE_STATE_CREATE_INFO,
        rasterization_samples: vk::SampleCountFlags::TYPE_1,
        ..Default::default()
    };
    let (depth_test, depth_write) = desc.depth.flags();
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_DEPTH_STENCIL_STATE_CREATE_INFO,
        depth_test_enable: depth_test,
        depth_write_enable: depth_write,
        depth_compare_op: vk::CompareOp::LESS_OR_EQUAL,
        ..Default::default()
    };
    let color_blend_att = vk::PipelineColorBlendAttachmentState {
        color_write_mask: vk::ColorComponentFlags::RGBA,
        blend_enable: if desc.blend { vk::TRUE } else { vk::FALSE },
        src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
        dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        color_blend_op: vk::BlendOp::ADD,
        src_alpha_blend_factor: vk::BlendFactor::ONE,
        dst_alpha_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        alpha_blend_op: vk::BlendOp::ADD,
    };
    let color_blend = vk::PipelineColorBlendStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_COLOR_BLEND_STATE_CREATE_INFO,
        attachment_count: 1,
        p_attachments: &color_blend_att,
        ..Default::default()
    };

    // dynamic rendering: no render pass, attachment formats go here instead
    let rendering = vk::PipelineRenderingCreateInfo {
        s_type: vk::StructureType::PIPELINE_RENDERING_CREATE_INFO,
        color_attachment_count: 1,
        p_color_attachment_formats: &targets.color_format,
        depth_attachment_format: targets.depth_format,
        ..Default::default()
    };

    let pipeline_info = vk::GraphicsPipelineCreateInfo {
        s_type: vk::StructureType::GRAPHICS_PIPELINE_CREATE_INFO,
        p_next: (&rendering as *const _) as *const _,
        stage_count: stages.len() as u32,
        p_stages: stages.as_ptr(),
        p_vertex_input_state: &vertex_input,
        p_input_assembly_state: &input_assembly,
        p_viewport_state: &viewport_state,
        p_rasterization_state: &raster,
        p_multisample_state: &multisample,
        p_depth_stencil_state: &depth_stencil,
        p_color_blend_state: &color_blend,
        p_dynamic_state: &dynamic_state,
        layout,
        ..Default::default()
    };

    let created = device.create_graphics_pipelines(cache, std::slice::from_ref(&pipeline_info), None);
    device.destroy_shader_module(vs, None);
    device.destroy_shader_module(fs, None);
    match created {
        Ok(p) => p
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("create_graphics_pipelines returned nothing for {}", desc.name)),
        Err((_, err)) => Err(anyhow!("create_graphics_pipelines({}) failed: {:?}", desc.name, err)),
    }
}

unsafe fn pipeline_layout(device: &ash::Device, set_layout: vk::DescriptorSetLayout) -> Result<vk::PipelineLayout> {
    let layout_info = vk::PipelineLayoutCreateInfo {
        s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
        set_layout_count: 1,
        p_set_layouts: &set_layout,
        ..Default::default()
    };
    Ok(device.create_pipeline_layout(&layout_info, None)?)
}

/// Pipelines and their layouts. Rebuilt when the swapchain format, the
/// wireframe topology or the overlay texture capacity changes.
pub struct Pipelines {
    pub scene_layout: vk::PipelineLayout,
    pub overlay_layout: vk::PipelineLayout,
    pub opaque: vk::Pipeline,
    pub transparent: vk::Pipeline,
    pub wireframe: vk::Pipeline,
    pub overlay: vk::Pipeline,
}

impl Pipelines {
    pub unsafe fn new(
        device: &ash::Device,
        cache: vk::PipelineCache,
        targets: Targets,
        scene_set_layout: vk::DescriptorSetLayout,
        overlay_set_layout: vk::DescriptorSetLayout,
        topology: WireframeTopology,
        overlay_capacity: u32,
    ) -> Result<Self> {
        let mut p = Self {
            scene_layout: pipeline_layout(device, scene_set_layout)?,
            overlay_layout: vk::PipelineLayout::null(),
            opaque: vk::Pipeline::null(),
            transparent: vk::Pipeline::null(),
            wireframe: vk::Pipeline::null(),
            overlay: vk::Pipeline::null(),
        };
        if let Err(e) = p.build(device, cache, targets, overlay_set_layout, topology, overlay_capacity) {
            p.destroy(device);
            return Err(e);
        }
        debug!(?topology, overlay_capacity, "pipelines built");
        Ok(p)
    }

    unsafe fn build(
        &mut self,
        device: &ash::Device,
        cache: vk::PipelineCache,
        targets: Targets,
        overlay_set_layout: vk::DescriptorSetLayout,
        topology: WireframeTopology,
        overlay_capacity: u32,
    ) -> Result<()> {
        self.overlay_layout = pipeline_layout(device, overlay_set_layout)?;

        self.opaque = create_pipeline(
            device,
            cache,
            targets,
            self.scene_layout,
            &PipelineDesc {
                name: "opaque",
                vert: SCENE_VERT,
                frag: SCENE_FRAG,
                vertex_input: scene_vertex_input(),
                topology: vk::PrimitiveTopology::TRIANGLE_LIST,
                depth: Depth::TestAndWrite,
                blend: false,
                frag_constant: None,
            },
        )?;
        self.transparent = create_pipeline(
            device,
            cache,
            targets,
            self.scene_layout,
            &PipelineDesc {
                name: "transparent",
                vert: GLASS_VERT,
                frag: GLASS_FRAG,
                vertex_input: transparent_vertex_input(),
                topology: vk::PrimitiveTopology::TRIANGLE_LIST,
                depth: Depth::TestOnly,
                blend: true,
                frag_constant: None,
            },
        )?;
        self.wireframe = create_pipeline(
            device,
            cache,
            targets,
            self.scene_layout,
            &PipelineDesc {
                name: "wireframe",
                vert: WIREFRAME_VERT,
                frag: WIREFRAME_FRAG,
                vertex_input: wireframe_vertex_input(),
                topology: topology_of(topology),
                depth: Depth::TestAndWrite,
                blend: false,
                frag_constant: None,
            },
        )?;
        self.overlay = create_pipeline(
            device,
            cache,
            targets,
            self.overlay_layout,
            &PipelineDesc {
                name: "overlay",
                vert: OVERLAY_VERT,
                frag: OVERLAY_FRAG,
                vertex_input: overlay_vertex_input(),
                topology: vk::PrimitiveTopology::TRIANGLE_LIST,
                depth: Depth::Off,
                blend: true,
                frag_constant: Some(overlay_capacity),
            },
        )?;
        Ok(())
    }

    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for p in [
            &mut self.opaque,
            &mut self.transparent,
            &mut self.wireframe,
            &mut self.overlay,
        ] {
            if *p != vk::Pipeline::null() {
                device.destroy_pipeline(*p, None);
                *p = vk::Pipeline::null();
            }
        }
        for l in [&mut self.scene_layout, &mut self.overlay_layout] {
            if *l != vk::PipelineLayout::null() {
                device.destroy_pipeline_layout(*l, None);
                *l = vk::PipelineLayout::null();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scene_layout_matches_vertex_structs() {
        let (bindings, attrs) = scene_vertex_input();
        assert_eq!(bindings[0].stride, 36);
        assert_eq!(bindings[1].stride, 12);
        assert_eq!(bindings[1].input_rate, vk::VertexInputRate::INSTANCE);
        let offsets: Vec<u32> = attrs.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 12, 24, 0]);
        assert_eq!(attrs[3].binding, INSTANCE_BINDING);
    }

    #[test]
    fn translucent_layout_carries_alpha() {
        let (bindings, attrs) = transparent_vertex_input();
        assert_eq!(bindings[0].stride, 40);
        assert_eq!(attrs[1].format, vk::Format::R32G32B32A32_SFLOAT);
        let offsets: Vec<u32> = attrs.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 12, 28, 0]);
    }

    #[test]
    fn translucent_depth_is_tested_but_not_written() {
        assert_eq!(Depth::TestOnly.flags(), (vk::TRUE, vk::FALSE));
        assert_eq!(Depth::TestAndWrite.flags(), (vk::TRUE, vk::TRUE));
        assert_eq!(Depth::Off.flags(), (vk::FALSE, vk::FALSE));
    }

    #[test]
    fn overlay_tex_id_is_an_integer_attribute() {
        let (bindings, attrs) = overlay_vertex_input();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].stride as usize, size_of::<OverlayVertex>());
        let tex_id = attrs.iter().find(|a| a.location == 3).unwrap();
        assert_eq!(tex_id.format, vk::Format::R32_UINT);
        assert_eq!(tex_id.offset, 32);
    }

    #[test]
    fn wireframe_topology_maps_to_lines() {
        assert_eq!(topology_of(WireframeTopology::LineList), vk::PrimitiveTopology::LINE_LIST);
        assert_eq!(topology_of(WireframeTopology::LineStrip), vk::PrimitiveTopology::LINE_STRIP);
        let (_, attrs) = wireframe_vertex_input();
        assert_eq!(attrs.len(), 2);
    }

    #[test]
    fn embedded_spirv_is_well_formed() {
        for bytes in [
            SCENE_VERT,
            SCENE_FRAG,
            GLASS_VERT,
            GLASS_FRAG,
            WIREFRAME_VERT,
            WIREFRAME_FRAG,
            OVERLAY_VERT,
            OVERLAY_FRAG,
        ] {
            let words = read_spv(&mut Cursor::new(bytes)).unwrap();
            assert_eq!(words[0], 0x0723_0203);
        }
    }
}
