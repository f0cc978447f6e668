// SPDX-License-Identifier: CEPL-1.0
//! GPU state behind [`VkRenderer`](crate::VkRenderer) and its side of the
//! frame protocol.

use anyhow::{anyhow, Context};
use ash::vk;
use tessera_core::{EngineError, Result};
use tessera_math::glam::Vec3;
use tessera_math::{Camera, OverlayUniform, SceneUniform};
use tessera_render::rebuild::ORDER;
use tessera_render::texture::{TextureAdded, INITIAL_OVERLAY_CAPACITY};
use tessera_render::{
    record_scene, AcquiredImage, DynamicBuffer, FrameBackend, GpuContext, LifetimeTracker, Rebuild, RenderSize,
    Scene, SlotId, TextureRegistry, WireframeTopology,
};
use tracing::{debug, info};

use crate::context::VkContext;
use crate::descriptors::{write_image_sets, DescriptorSets, ImageBindings, SetLayouts};
use crate::frame::FrameSlots;
use crate::memory::{GpuResource, VkAllocator};
use crate::pipeline::{Pipelines, Targets};
use crate::record::{encode, Sets, Target};
use crate::swapchain::{create_swapchain_bundle, pick_depth_format, DepthTarget, SwapchainBundle, SwapchainConfig};
use crate::texture::{create_sampler, missing_texture, solid, upload_array, upload_texture, Rgba, PLACEHOLDER_SIZE};
use crate::VkOptions;

pub const MISSING_TEXTURE: &str = "missing";
pub const UNTEXTURED_TEXTURE: &str = "untextured";
pub const DEFAULT_TEXTURE_ARRAY: &str = "default";

pub struct Gpu {
    pub ctx: VkContext,
    pub allocator: VkAllocator,
    tracker: LifetimeTracker<GpuResource>,

    swapchain: SwapchainBundle,
    depth: DepthTarget,
    depth_format: vk::Format,
    frames: FrameSlots,
    frames_in_flight: usize,
    cmd_bufs: Vec<vk::CommandBuffer>,

    scene_uniforms: Vec<DynamicBuffer<SceneUniform, VkAllocator>>,
    overlay_uniforms: Vec<DynamicBuffer<OverlayUniform, VkAllocator>>,
    layouts: SetLayouts,
    sets: DescriptorSets,
    pipelines: Pipelines,
    sampler: vk::Sampler,
    // bound into every descriptor slot that has no texture
    placeholder: Option<GpuResource>,

    pub scene: Scene<VkAllocator>,
    pub textures: TextureRegistry<GpuResource>,
    pub camera: Camera,
    pub tint: Vec3,
    pub overlay_bounds: Vec3,
    pub config: SwapchainConfig,
    pub topology: WireframeTopology,
    /// The surface has zero area; nothing can be presented.
    pub minimized: bool,
}

impl Gpu {
    pub unsafe fn new(
        ctx: VkContext,
        tracker: LifetimeTracker<GpuResource>,
        size: RenderSize,
        options: &VkOptions,
    ) -> anyhow::Result<Self> {
        let device = &ctx.device;
        let config = SwapchainConfig {
            hint: size,
            vsync: options.vsync,
            vsync_mode: options.vsync_mode,
        };
        let depth_format = pick_depth_format(&ctx.instance, ctx.phys);
        let swapchain = create_swapchain_bundle(
            device,
            &ctx.surface_loader,
            &ctx.swapchain_loader,
            ctx.phys,
            ctx.surface,
            vk::SwapchainKHR::null(),
            config,
        )
        .context("create swapchain")?;
        let depth = DepthTarget::new(device, &ctx.memory_props, swapchain.extent, depth_format)?;
        let frames_in_flight = options.frames_in_flight();
        let frames = FrameSlots::new(device, frames_in_flight)?;
        let sampler = create_sampler(device)?;
        let placeholder = upload_texture(&ctx, &missing_texture(PLACEHOLDER_SIZE)).context("placeholder texture")?;

        let layouts = SetLayouts::new(device, INITIAL_OVERLAY_CAPACITY as u32)?;
        let pipelines = Pipelines::new(
            device,
            ctx.pipeline_cache,
            Targets {
                color_format: swapchain.format,
                depth_format,
            },
            layouts.scene,
            layouts.overlay,
            options.wireframe_topology,
            layouts.overlay_capacity,
        )?;
        let sets = DescriptorSets::new(device, &layouts, swapchain.image_count())?;
        let cmd_bufs = ctx.allocate_command_buffers(swapchain.image_count())?;
        let allocator = VkAllocator::new(device.clone(), ctx.memory_props);

        let mut gpu = Self {
            ctx,
            allocator,
            tracker,
            swapchain,
            depth,
            depth_format,
            frames,
            frames_in_flight,
            cmd_bufs,
            scene_uniforms: Vec::new(),
            overlay_uniforms: Vec::new(),
            layouts,
            sets,
            pipelines,
            sampler,
            placeholder: Some(placeholder),
            scene: Scene::new(),
            textures: TextureRegistry::new(),
            camera: Camera::default(),
            tint: Vec3::ONE,
            overlay_bounds: Vec3::splat(100.0),
            config,
            topology: options.wireframe_topology,
            minimized: false,
        };
        gpu.scene.set_clear_color(options.clear_color);
        gpu.resize_uniforms()?;

        let missing = missing_texture(PLACEHOLDER_SIZE);
        gpu.add_texture(&[], MISSING_TEXTURE, &missing)?;
        gpu.add_texture(&[], UNTEXTURED_TEXTURE, &solid(PLACEHOLDER_SIZE, [255; 4]))?;
        gpu.add_texture_array(
            &[],
            DEFAULT_TEXTURE_ARRAY,
            &[(MISSING_TEXTURE.to_owned(), missing.clone()), (MISSING_TEXTURE.to_owned(), missing)],
        )?;
        Ok(gpu)
    }

    pub fn image_count(&self) -> usize {
        self.swapchain.image_count()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    /// Uploads and registers an overlay texture. The caller rebuilds
    /// pipelines when the table grew.
    pub unsafe fn add_texture(&mut self, in_flight: &[SlotId], id: &str, rgba: &Rgba) -> anyhow::Result<TextureAdded> {
        let resource = upload_texture(&self.ctx, rgba)?;
        let added = self.textures.add(&self.tracker, in_flight, id, resource, rgba.info());
        info!(id, index = added.index, width = rgba.width, height = rgba.height, "texture loaded");
        Ok(added)
    }

    pub unsafe fn add_texture_array(
        &mut self,
        in_flight: &[SlotId],
        id: &str,
        layers: &[(String, Rgba)],
    ) -> anyhow::Result<()> {
        let images: Vec<Rgba> = layers.iter().map(|(_, rgba)| rgba.clone()).collect();
        let names: Vec<String> = layers.iter().map(|(name, _)| name.clone()).collect();
        let (info, resource) = upload_array(&self.ctx, &images)?;
        self.textures.add_array(&self.tracker, in_flight, id, &names, resource, info);
        info!(id, layers = names.len(), width = info.width, height = info.height, "texture array loaded");
        Ok(())
    }

    /// Matches the per-image uniform buffers to the image count.
    fn resize_uniforms(&mut self) -> Result<()> {
        let n = self.swapchain.image_count();
        let mut ctx = GpuContext::new(&mut self.allocator, &self.tracker, &[]);
        for mut b in self.scene_uniforms.drain(n.min(self.scene_uniforms.len())..) {
            b.destroy(&ctx);
        }
        for mut b in self.overlay_uniforms.drain(n.min(self.overlay_uniforms.len())..) {
            b.destroy(&ctx);
        }
        while self.scene_uniforms.len() < n {
            let mut b = DynamicBuffer::uniform();
            b.set_data(&mut ctx, &[SceneUniform::default()])?;
            self.scene_uniforms.push(b);
        }
        while self.overlay_uniforms.len() < n {
            let mut b = DynamicBuffer::uniform();
            b.set_data(&mut ctx, &[OverlayUniform::new(self.overlay_bounds)])?;
            self.overlay_uniforms.push(b);
        }
        Ok(())
    }

    /// Drains the device and rebuilds `request` plus everything downstream.
    pub unsafe fn rebuild(&mut self, request: Rebuild) -> Result<()> {
        self.ctx.device.device_wait_idle().context("device_wait_idle")?;
        let mut pending = request.cascade();
        for stage in ORDER {
            if pending.contains(stage) {
                pending |= self.rebuild_stage(stage)?.cascade();
            }
        }
        debug!(?request, stages = ?pending, "rebuilt");
        Ok(())
    }

    /// Returns stages that turned out to be invalidated as well.
    unsafe fn rebuild_stage(&mut self, stage: Rebuild) -> Result<Rebuild> {
        let device = &self.ctx.device;
        if stage == Rebuild::SWAPCHAIN {
            let fresh = create_swapchain_bundle(
                device,
                &self.ctx.surface_loader,
                &self.ctx.swapchain_loader,
                self.ctx.phys,
                self.ctx.surface,
                self.swapchain.swapchain,
                self.config,
            )?;
            let mut old = std::mem::replace(&mut self.swapchain, fresh);
            old.destroy(device, &self.ctx.swapchain_loader);
            if old.format != self.swapchain.format {
                return Ok(Rebuild::PIPELINES);
            }
        } else if stage == Rebuild::DEPTH {
            let fresh = DepthTarget::new(device, &self.ctx.memory_props, self.swapchain.extent, self.depth_format)?;
            std::mem::replace(&mut self.depth, fresh).destroy(device);
        } else if stage == Rebuild::SYNC {
            let fresh = FrameSlots::new(device, self.frames_in_flight)?;
            std::mem::replace(&mut self.frames, fresh).destroy(device);
        } else if stage == Rebuild::UNIFORMS {
            self.resize_uniforms()?;
        } else if stage == Rebuild::PIPELINES {
            let layouts = SetLayouts::new(device, self.textures.capacity() as u32)?;
            let targets = Targets {
                color_format: self.swapchain.format,
                depth_format: self.depth_format,
            };
            let pipelines = match Pipelines::new(
                device,
                self.ctx.pipeline_cache,
                targets,
                layouts.scene,
                layouts.overlay,
                self.topology,
                layouts.overlay_capacity,
            ) {
                Ok(p) => p,
                Err(e) => {
                    let mut layouts = layouts;
                    layouts.destroy(device);
                    return Err(EngineError::init(e));
                }
            };
            std::mem::replace(&mut self.pipelines, pipelines).destroy(device);
            std::mem::replace(&mut self.layouts, layouts).destroy(device);
        } else if stage == Rebuild::DESCRIPTORS {
            let fresh = DescriptorSets::new(device, &self.layouts, self.swapchain.image_count())?;
            std::mem::replace(&mut self.sets, fresh).destroy(device);
        } else if stage == Rebuild::COMMANDS {
            let fresh = self.ctx.allocate_command_buffers(self.swapchain.image_count())?;
            let old = std::mem::replace(&mut self.cmd_bufs, fresh);
            if !old.is_empty() {
                device.free_command_buffers(self.ctx.cmd_pool, &old);
            }
            self.scene.invalidate();
        }
        Ok(Rebuild::empty())
    }

    /// Releases every GPU object. The device must be idle and every frame
    /// slot retired.
    pub unsafe fn destroy(&mut self) {
        let mut ctx = GpuContext::new(&mut self.allocator, &self.tracker, &[]);
        self.scene.destroy(&mut ctx);
        for b in self.scene_uniforms.iter_mut() {
            b.destroy(&ctx);
        }
        for b in self.overlay_uniforms.iter_mut() {
            b.destroy(&ctx);
        }
        self.textures.clear(&self.tracker, &[]);
        let released = self.tracker.release_all();
        debug!(released, "tracker drained");

        let device = &self.ctx.device;
        if let Some(p) = self.placeholder.take() {
            p.destroy(device);
        }
        self.pipelines.destroy(device);
        self.sets.destroy(device);
        self.layouts.destroy(device);
        device.destroy_sampler(self.sampler, None);
        if !self.cmd_bufs.is_empty() {
            device.free_command_buffers(self.ctx.cmd_pool, &self.cmd_bufs);
            self.cmd_bufs.clear();
        }
        self.frames.destroy(device);
        self.depth.destroy(device);
        self.swapchain.destroy(device, &self.ctx.swapchain_loader);
        self.ctx.destroy();
    }

    fn missing_view(&self) -> Result<vk::ImageView> {
        self.placeholder
            .as_ref()
            .and_then(GpuResource::view)
            .ok_or_else(|| anyhow!("placeholder texture is gone").into())
    }

    fn stale(result: vk::Result, what: &str) -> EngineError {
        match result {
            vk::Result::ERROR_OUT_OF_DATE_KHR => EngineError::SwapchainStale,
            e => anyhow!("{what}: {e:?}").into(),
        }
    }
}

impl FrameBackend for Gpu {
    fn wait_for_slot(&mut self, slot: SlotId) -> Result<()> {
        unsafe { self.frames.wait(&self.ctx.device, slot)? };
        Ok(())
    }

    fn acquire_next_image(&mut self, slot: SlotId) -> Result<AcquiredImage> {
        let sync = self.frames.get(slot);
        let acquired = unsafe {
            self.ctx.swapchain_loader.acquire_next_image(
                self.swapchain.swapchain,
                u64::MAX,
                sync.image_available,
                vk::Fence::null(),
            )
        };
        match acquired {
            Ok((index, suboptimal)) => Ok(AcquiredImage { index, suboptimal }),
            Err(e) => Err(Self::stale(e, "acquire_next_image")),
        }
    }

    fn update_uniforms(&mut self, image: u32) -> Result<()> {
        let extent = self.swapchain.extent;
        let aspect = RenderSize {
            width: extent.width,
            height: extent.height,
        }
        .aspect();
        let scene = SceneUniform::new(self.camera.view(), self.camera.projection(aspect), self.tint);
        let overlay = OverlayUniform::new(self.overlay_bounds);

        let i = image as usize;
        let mut ctx = GpuContext::new(&mut self.allocator, &self.tracker, &[]);
        let (Some(s), Some(o)) = (self.scene_uniforms.get_mut(i), self.overlay_uniforms.get_mut(i)) else {
            return Err(anyhow!("no uniform buffers for image {image}").into());
        };
        s.set_data(&mut ctx, &[scene])?;
        o.set_data(&mut ctx, &[overlay])?;
        Ok(())
    }

    fn scene_generation(&self) -> u64 {
        self.scene.generation() + self.textures.generation()
    }

    fn record(&mut self, image: u32) -> Result<()> {
        let i = image as usize;
        let missing = self.missing_view()?;
        let array_view = self.textures.current_array().and_then(GpuResource::view).unwrap_or(missing);
        let mut overlay_views: Vec<vk::ImageView> = self
            .textures
            .overlay_table()
            .into_iter()
            .map(|t| t.and_then(GpuResource::view).unwrap_or(missing))
            .collect();
        overlay_views.resize(self.layouts.overlay_capacity as usize, missing);

        let handles = (
            self.scene_uniforms.get(i).and_then(|b| b.handle()),
            self.overlay_uniforms.get(i).and_then(|b| b.handle()),
            self.sets.scene.get(i),
            self.sets.overlay.get(i),
            self.cmd_bufs.get(i),
        );
        let (Some(scene_uniform), Some(overlay_uniform), Some(&scene_set), Some(&overlay_set), Some(&cmd)) = handles
        else {
            return Err(anyhow!("image {image} has no per-image resources").into());
        };

        let device = &self.ctx.device;
        let plan = record_scene(&self.scene);
        unsafe {
            write_image_sets(
                device,
                scene_set,
                overlay_set,
                &ImageBindings {
                    scene_uniform,
                    overlay_uniform,
                    array_view,
                    overlay_views: &overlay_views,
                    sampler: self.sampler,
                },
            );
            let target = Target {
                image: self.swapchain.images[i],
                view: self.swapchain.image_views[i],
                depth: &self.depth,
                extent: self.swapchain.extent,
            };
            let sets = Sets {
                scene: scene_set,
                overlay: overlay_set,
            };
            encode(device, cmd, &target, &self.pipelines, &sets, &plan)
                .with_context(|| format!("record image {image}"))?;
        }
        Ok(())
    }

    fn submit(&mut self, slot: SlotId, image: u32) -> Result<()> {
        let sync = self.frames.get(slot);
        let cmd = self.cmd_bufs[image as usize];
        let wait_stage = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        let submit = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: 1,
            p_wait_semaphores: &sync.image_available,
            p_wait_dst_stage_mask: &wait_stage,
            command_buffer_count: 1,
            p_command_buffers: &cmd,
            signal_semaphore_count: 1,
            p_signal_semaphores: &sync.render_finished,
            ..Default::default()
        };
        unsafe {
            let device = &self.ctx.device;
            device
                .reset_fences(std::slice::from_ref(&sync.in_flight))
                .context("reset_fences")?;
            device
                .queue_submit(self.ctx.queue, std::slice::from_ref(&submit), sync.in_flight)
                .context("queue_submit")?;
        }
        Ok(())
    }

    fn present(&mut self, slot: SlotId, image: u32) -> Result<bool> {
        let sync = self.frames.get(slot);
        let present = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &sync.render_finished,
            swapchain_count: 1,
            p_swapchains: &self.swapchain.swapchain,
            p_image_indices: &image,
            ..Default::default()
        };
        match unsafe { self.ctx.swapchain_loader.queue_present(self.ctx.queue, &present) } {
            Ok(suboptimal) => Ok(suboptimal),
            Err(e) => Err(Self::stale(e, "queue_present")),
        }
    }

    fn wait_idle(&mut self) -> Result<()> {
        unsafe { self.ctx.device.device_wait_idle() }.context("device_wait_idle")?;
        Ok(())
    }

    fn recreate_swapchain(&mut self) -> Result<usize> {
        unsafe {
            self.ctx.device.device_wait_idle().context("device_wait_idle")?;
            let caps = self
                .ctx
                .surface_loader
                .get_physical_device_surface_capabilities(self.ctx.phys, self.ctx.surface)
                .context("surface capabilities")?;
            if caps.current_extent.width == 0 || caps.current_extent.height == 0 {
                debug!("surface has zero area, keeping the old swapchain");
                self.minimized = true;
                return Ok(self.swapchain.image_count());
            }
            self.minimized = false;
            self.rebuild(Rebuild::SWAPCHAIN)?;
        }
        Ok(self.swapchain.image_count())
    }
}
