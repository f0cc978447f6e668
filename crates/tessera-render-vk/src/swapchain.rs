// SPDX-License-Identifier: CEPL-1.0
//! Swapchain, its image views and the depth target sized to it.

use anyhow::Result;
use ash::khr::{surface, swapchain};
use ash::vk;
use tessera_render::RenderSize;
use tracing::info;

use crate::memory::create_image_and_memory;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VkVsyncMode {
    /// Target monitor refresh rate.
    Fifo,
    /// Latest-frame-wins; falls back to FIFO.
    #[default]
    Mailbox,
}

#[derive(Clone, Copy, Debug)]
pub struct SwapchainConfig {
    pub hint: RenderSize,
    pub vsync: bool,
    pub vsync_mode: VkVsyncMode,
}

pub struct SwapchainBundle {
    pub swapchain: vk::SwapchainKHR,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
}

impl SwapchainBundle {
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Destroys the views and the swapchain itself.
    pub unsafe fn destroy(&mut self, device: &ash::Device, loader: &swapchain::Device) {
        for &iv in &self.image_views {
            device.destroy_image_view(iv, None);
        }
        self.image_views.clear();
        self.images.clear();
        if self.swapchain != vk::SwapchainKHR::null() {
            loader.destroy_swapchain(self.swapchain, None);
            self.swapchain = vk::SwapchainKHR::null();
        }
    }
}

// Info only
fn fmt_name(f: vk::Format) -> &'static str {
    match f {
        vk::Format::B8G8R8A8_UNORM => "B8G8R8A8_UNORM",
        vk::Format::B8G8R8A8_SRGB => "B8G8R8A8_SRGB",
        vk::Format::R8G8B8A8_SRGB => "R8G8B8A8_SRGB",
        vk::Format::R8G8B8A8_UNORM => "R8G8B8A8_UNORM",
        _ => "OTHER",
    }
}
fn pm_name(m: vk::PresentModeKHR) -> &'static str {
    match m {
        vk::PresentModeKHR::FIFO => "FIFO",
        vk::PresentModeKHR::MAILBOX => "MAILBOX",
        vk::PresentModeKHR::IMMEDIATE => "IMMEDIATE",
        vk::PresentModeKHR::FIFO_RELAXED => "FIFO_RELAXED",
        _ => "OTHER",
    }
}

pub fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool, mode: VkVsyncMode) -> vk::PresentModeKHR {
    let preference: &[vk::PresentModeKHR] = if !vsync {
        &[vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX]
    } else {
        match mode {
            VkVsyncMode::Mailbox => &[vk::PresentModeKHR::MAILBOX],
            VkVsyncMode::Fifo => &[],
        }
    };
    // FIFO is always available
    preference
        .iter()
        .copied()
        .find(|m| modes.contains(m))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

pub fn extent_from_caps(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: want
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: want
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// One more than the minimum, capped by the maximum (0 means no maximum).
pub fn image_count_for(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    if caps.max_image_count == 0 {
        caps.min_image_count + 1
    } else {
        (caps.min_image_count + 1).min(caps.max_image_count)
    }
}

pub fn pick_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<(vk::SurfaceFormatKHR, &'static str)> {
    let find = |format: vk::Format| {
        formats
            .iter()
            .copied()
            .find(|f| f.format == format && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
    };
    find(vk::Format::B8G8R8A8_SRGB)
        .map(|f| (f, "sdr_bgra8_srgb"))
        .or_else(|| find(vk::Format::R8G8B8A8_SRGB).map(|f| (f, "sdr_rgba8_srgb")))
        .or_else(|| find(vk::Format::B8G8R8A8_UNORM).map(|f| (f, "sdr_bgra8_unorm")))
        .or_else(|| formats.first().map(|f| (*f, "driver_default")))
}

pub unsafe fn create_swapchain_bundle(
    device: &ash::Device,
    surf_i: &surface::Instance,
    swap_d: &swapchain::Device,
    phys: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    old_swapchain: vk::SwapchainKHR,
    cfg: SwapchainConfig,
) -> Result<SwapchainBundle> {
    let caps = surf_i.get_physical_device_surface_capabilities(phys, surface)?;
    let formats = surf_i.get_physical_device_surface_formats(phys, surface)?;
    let modes = surf_i.get_physical_device_surface_present_modes(phys, surface)?;

    let (surf_format, pick_reason) =
        pick_surface_format(&formats).ok_or_else(|| anyhow::anyhow!("surface reports no formats"))?;
    let present_mode = choose_present_mode(&modes, cfg.vsync, cfg.vsync_mode);
    let extent = extent_from_caps(&caps, cfg.hint);
    let min_count = image_count_for(&caps);

    info!(
        "swapchain reason: {}, format: {}, present_mode: {}, vsync={}, mode={:?}, extent: {}x{}, images(min={} → picked={})",
        pick_reason,
        fmt_name(surf_format.format),
        pm_name(present_mode),
        cfg.vsync,
        cfg.vsync_mode,
        extent.width,
        extent.height,
        caps.min_image_count,
        min_count
    );

    let pre_transform = if caps
        .supported_transforms
        .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
    {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
        caps.current_transform
    };

    let swap_info = vk::SwapchainCreateInfoKHR {
        s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
        surface,
        min_image_count: min_count,
        image_format: surf_format.format,
        image_color_space: surf_format.color_space,
        image_extent: extent,
        image_array_layers: 1,
        image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
        image_sharing_mode: vk::SharingMode::EXCLUSIVE,
        pre_transform,
        composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
        present_mode,
        clipped: vk::TRUE,
        old_swapchain,
        ..Default::default()
    };

    let new_swapchain = swap_d.create_swapchain(&swap_info, None)?;
    let images = swap_d.get_swapchain_images(new_swapchain)?;

    let mut views = Vec::with_capacity(images.len());
    for &img in &images {
        let iv_info = vk::ImageViewCreateInfo {
            s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
            image: img,
            view_type: vk::ImageViewType::TYPE_2D,
            format: surf_format.format,
            subresource_range: color_range(1),
            ..Default::default()
        };
        views.push(device.create_image_view(&iv_info, None)?);
    }

    Ok(SwapchainBundle {
        swapchain: new_swapchain,
        format: surf_format.format,
        extent,
        images,
        image_views: views,
    })
}

pub fn color_range(layers: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: layers,
    }
}

pub fn depth_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::DEPTH,
        ..color_range(1)
    }
}

pub unsafe fn pick_depth_format(instance: &ash::Instance, phys: vk::PhysicalDevice) -> vk::Format {
    // Prefer 32f → 24+S8 → 16
    let candidates = [
        vk::Format::D32_SFLOAT,
        vk::Format::D24_UNORM_S8_UINT,
        vk::Format::D32_SFLOAT_S8_UINT,
        vk::Format::D16_UNORM,
    ];
    for &fmt in &candidates {
        let props = instance.get_physical_device_format_properties(phys, fmt);
        if props
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        {
            return fmt;
        }
    }
    vk::Format::D32_SFLOAT
}

pub struct DepthTarget {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub format: vk::Format,
}

impl DepthTarget {
    pub unsafe fn new(
        device: &ash::Device,
        props: &vk::PhysicalDeviceMemoryProperties,
        extent: vk::Extent2D,
        format: vk::Format,
    ) -> Result<Self> {
        let img_ci = vk::ImageCreateInfo {
            s_type: vk::StructureType::IMAGE_CREATE_INFO,
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let (image, memory) = create_image_and_memory(device, props, &img_ci)?;

        let view_ci = vk::ImageViewCreateInfo {
            s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
            image,
            view_type: vk::ImageViewType::TYPE_2D,
            format,
            subresource_range: depth_range(),
            ..Default::default()
        };
        let view = device.create_image_view(&view_ci, None)?;
        Ok(Self {
            image,
            memory,
            view,
            format,
        })
    }

    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_image_view(self.view, None);
        device.destroy_image(self.image, None);
        device.free_memory(self.memory, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [vk::PresentModeKHR; 3] = [
        vk::PresentModeKHR::FIFO,
        vk::PresentModeKHR::MAILBOX,
        vk::PresentModeKHR::IMMEDIATE,
    ];

    #[test]
    fn vsync_off_prefers_immediate() {
        assert_eq!(choose_present_mode(&ALL, false, VkVsyncMode::Fifo), vk::PresentModeKHR::IMMEDIATE);
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO], false, VkVsyncMode::Mailbox),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn mailbox_falls_back_to_fifo() {
        assert_eq!(choose_present_mode(&ALL, true, VkVsyncMode::Mailbox), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO], true, VkVsyncMode::Mailbox),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(choose_present_mode(&ALL, true, VkVsyncMode::Fifo), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn fixed_extent_wins_over_hint() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: 800, height: 600 },
            ..Default::default()
        };
        let e = extent_from_caps(&caps, RenderSize { width: 10, height: 10 });
        assert_eq!((e.width, e.height), (800, 600));
    }

    #[test]
    fn free_extent_is_clamped() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D { width: 64, height: 64 },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 2048,
            },
            ..Default::default()
        };
        let e = extent_from_caps(&caps, RenderSize { width: 8000, height: 10 });
        assert_eq!((e.width, e.height), (4096, 64));
    }

    #[test]
    fn image_count_respects_maximum() {
        let mut caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(image_count_for(&caps), 3);
        caps.max_image_count = 2;
        assert_eq!(image_count_for(&caps), 2);
    }

    #[test]
    fn srgb_formats_are_preferred() {
        let f = |format| vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let formats = [f(vk::Format::B8G8R8A8_UNORM), f(vk::Format::R8G8B8A8_SRGB)];
        assert_eq!(pick_surface_format(&formats).unwrap().0.format, vk::Format::R8G8B8A8_SRGB);
        assert_eq!(
            pick_surface_format(&[f(vk::Format::A2B10G10R10_UNORM_PACK32)]).unwrap().1,
            "driver_default"
        );
        assert!(pick_surface_format(&[]).is_none());
    }
}
