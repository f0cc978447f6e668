// SPDX-License-Identifier: CEPL-1.0
//! Texture decoding and upload to device-local images.

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use ash::vk;
use tessera_render::TextureInfo;
use tracing::debug;

use crate::context::VkContext;
use crate::memory::{create_buffer_and_memory, create_image_and_memory, GpuResource, ImageAllocation};
use crate::swapchain::color_range;

pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

/// Edge length of the procedural placeholder textures.
pub const PLACEHOLDER_SIZE: u32 = 16;

/// Tightly packed RGBA8 pixels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rgba {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Rgba {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let want = width as usize * height as usize * 4;
        if width == 0 || height == 0 {
            bail!("texture has zero size ({width}x{height})");
        }
        if pixels.len() != want {
            bail!("{}x{} texture needs {want} bytes, got {}", width, height, pixels.len());
        }
        Ok(Self { width, height, pixels })
    }

    pub fn info(&self) -> TextureInfo {
        TextureInfo {
            width: self.width,
            height: self.height,
        }
    }
}

pub fn decode_rgba(path: &Path) -> Result<Rgba> {
    let img = image::open(path)
        .with_context(|| format!("decode {}", path.display()))?
        .to_rgba8();
    let (width, height) = img.dimensions();
    Rgba::new(width, height, img.into_raw())
}

/// Magenta and black checkerboard, drawn wherever a texture is missing.
pub fn missing_texture(size: u32) -> Rgba {
    let cell = (size / 2).max(1);
    let mut pixels = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let on = ((x / cell) + (y / cell)) % 2 == 0;
            pixels.extend_from_slice(if on { &[255, 0, 255, 255] } else { &[0, 0, 0, 255] });
        }
    }
    Rgba {
        width: size,
        height: size,
        pixels,
    }
}

pub fn solid(size: u32, rgba: [u8; 4]) -> Rgba {
    Rgba {
        width: size,
        height: size,
        pixels: rgba.repeat((size * size) as usize),
    }
}

/// Concatenates same-sized layers for a texture array upload.
pub fn stack_layers(layers: &[Rgba]) -> Result<(TextureInfo, Vec<u8>)> {
    let first = layers.first().ok_or_else(|| anyhow!("texture array needs at least one layer"))?;
    let info = first.info();
    let mut bytes = Vec::with_capacity(first.pixels.len() * layers.len());
    for (i, layer) in layers.iter().enumerate() {
        if layer.info() != info {
            bail!(
                "layer {i} is {}x{}, expected {}x{}",
                layer.width,
                layer.height,
                info.width,
                info.height
            );
        }
        bytes.extend_from_slice(&layer.pixels);
    }
    Ok((info, bytes))
}

unsafe fn layout_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    layers: u32,
    (old_layout, new_layout): (vk::ImageLayout, vk::ImageLayout),
    (src_stage_mask, src_access_mask): (vk::PipelineStageFlags2, vk::AccessFlags2),
    (dst_stage_mask, dst_access_mask): (vk::PipelineStageFlags2, vk::AccessFlags2),
) {
    let barrier = vk::ImageMemoryBarrier2 {
        s_type: vk::StructureType::IMAGE_MEMORY_BARRIER_2,
        src_stage_mask,
        src_access_mask,
        dst_stage_mask,
        dst_access_mask,
        old_layout,
        new_layout,
        image,
        subresource_range: color_range(layers),
        ..Default::default()
    };
    let dep = vk::DependencyInfo {
        s_type: vk::StructureType::DEPENDENCY_INFO,
        image_memory_barrier_count: 1,
        p_image_memory_barriers: &barrier,
        ..Default::default()
    };
    device.cmd_pipeline_barrier2(cmd, &dep);
}

/// Uploads `layers` stacked images of `info` size into a sampled image.
/// `array` selects a 2D array view over a plain 2D one.
pub unsafe fn upload(
    ctx: &VkContext,
    info: TextureInfo,
    layers: u32,
    array: bool,
    pixels: &[u8],
) -> Result<GpuResource> {
    let size = pixels.len() as vk::DeviceSize;
    let (staging, staging_mem) = create_buffer_and_memory(
        &ctx.device,
        &ctx.memory_props,
        size,
        vk::BufferUsageFlags::TRANSFER_SRC,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )?;
    let result = upload_from_staging(ctx, info, layers, array, pixels, staging, staging_mem);
    ctx.device.destroy_buffer(staging, None);
    ctx.device.free_memory(staging_mem, None);
    result
}

unsafe fn upload_from_staging(
    ctx: &VkContext,
    info: TextureInfo,
    layers: u32,
    array: bool,
    pixels: &[u8],
    staging: vk::Buffer,
    staging_mem: vk::DeviceMemory,
) -> Result<GpuResource> {
    let device = &ctx.device;
    let ptr = device
        .map_memory(staging_mem, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
        .context("map staging")? as *mut u8;
    std::ptr::copy_nonoverlapping(pixels.as_ptr(), ptr, pixels.len());
    device.unmap_memory(staging_mem);

    let img_ci = vk::ImageCreateInfo {
        s_type: vk::StructureType::IMAGE_CREATE_INFO,
        image_type: vk::ImageType::TYPE_2D,
        format: TEXTURE_FORMAT,
        extent: vk::Extent3D {
            width: info.width,
            height: info.height,
            depth: 1,
        },
        mip_levels: 1,
        array_layers: layers,
        samples: vk::SampleCountFlags::TYPE_1,
        tiling: vk::ImageTiling::OPTIMAL,
        usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
        sharing_mode: vk::SharingMode::EXCLUSIVE,
        ..Default::default()
    };
    let (image, memory) = create_image_and_memory(device, &ctx.memory_props, &img_ci)?;

    let copied = ctx.one_time_submit(|device, cmd| {
        layout_barrier(
            device,
            cmd,
            image,
            layers,
            (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            (vk::PipelineStageFlags2::TOP_OF_PIPE, vk::AccessFlags2::empty()),
            (vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_WRITE),
        );
        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: layers,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: img_ci.extent,
        };
        device.cmd_copy_buffer_to_image(
            cmd,
            staging,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            std::slice::from_ref(&region),
        );
        layout_barrier(
            device,
            cmd,
            image,
            layers,
            (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
            (vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_WRITE),
            (vk::PipelineStageFlags2::FRAGMENT_SHADER, vk::AccessFlags2::SHADER_SAMPLED_READ),
        );
    });
    let view = copied.and_then(|()| {
        let view_ci = vk::ImageViewCreateInfo {
            s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
            image,
            view_type: if array {
                vk::ImageViewType::TYPE_2D_ARRAY
            } else {
                vk::ImageViewType::TYPE_2D
            },
            format: TEXTURE_FORMAT,
            subresource_range: color_range(layers),
            ..Default::default()
        };
        Ok(device.create_image_view(&view_ci, None)?)
    });
    match view {
        Ok(view) => {
            debug!(width = info.width, height = info.height, layers, "texture uploaded");
            Ok(GpuResource::Image(ImageAllocation { image, memory, view }))
        }
        Err(e) => {
            device.destroy_image(image, None);
            device.free_memory(memory, None);
            Err(e)
        }
    }
}

pub unsafe fn upload_texture(ctx: &VkContext, rgba: &Rgba) -> Result<GpuResource> {
    upload(ctx, rgba.info(), 1, false, &rgba.pixels)
}

pub unsafe fn upload_array(ctx: &VkContext, layers: &[Rgba]) -> Result<(TextureInfo, GpuResource)> {
    let (info, bytes) = stack_layers(layers)?;
    Ok((info, upload(ctx, info, layers.len() as u32, true, &bytes)?))
}

pub unsafe fn create_sampler(device: &ash::Device) -> Result<vk::Sampler> {
    let ci = vk::SamplerCreateInfo {
        s_type: vk::StructureType::SAMPLER_CREATE_INFO,
        mag_filter: vk::Filter::NEAREST,
        min_filter: vk::Filter::NEAREST,
        mipmap_mode: vk::SamplerMipmapMode::NEAREST,
        address_mode_u: vk::SamplerAddressMode::REPEAT,
        address_mode_v: vk::SamplerAddressMode::REPEAT,
        address_mode_w: vk::SamplerAddressMode::REPEAT,
        max_lod: 0.0,
        border_color: vk::BorderColor::INT_OPAQUE_BLACK,
        ..Default::default()
    };
    Ok(device.create_sampler(&ci, None)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkerboard_alternates_cells() {
        let t = missing_texture(4);
        assert_eq!(t.pixels.len(), 64);
        let px = |x: usize, y: usize| &t.pixels[(y * 4 + x) * 4..(y * 4 + x) * 4 + 4];
        assert_eq!(px(0, 0), &[255, 0, 255, 255]);
        assert_eq!(px(2, 0), &[0, 0, 0, 255]);
        assert_eq!(px(2, 2), &[255, 0, 255, 255]);
    }

    #[test]
    fn rgba_rejects_wrong_length() {
        assert!(Rgba::new(2, 2, vec![0; 16]).is_ok());
        assert!(Rgba::new(2, 2, vec![0; 15]).is_err());
        assert!(Rgba::new(0, 2, vec![]).is_err());
    }

    #[test]
    fn layers_must_share_dimensions() {
        let a = solid(2, [255; 4]);
        let b = solid(2, [0, 0, 0, 255]);
        let (info, bytes) = stack_layers(&[a.clone(), b]).unwrap();
        assert_eq!(info, TextureInfo { width: 2, height: 2 });
        assert_eq!(bytes.len(), 32);
        assert_eq!(&bytes[..4], &[255; 4]);

        let err = stack_layers(&[a, solid(4, [0; 4])]).unwrap_err();
        assert!(err.to_string().contains("layer 1"));
        assert!(stack_layers(&[]).is_err());
    }

    #[test]
    fn decode_reports_missing_files() {
        let err = decode_rgba(Path::new("/definitely/not/here.png")).unwrap_err();
        assert!(format!("{err:#}").contains("not/here.png"));
    }
}
