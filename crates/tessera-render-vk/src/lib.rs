// SPDX-License-Identifier: CEPL-1.0
//! Vulkan 1.3 backend: dynamic rendering, instanced models with optional
//! translucent layers, wireframes and a textured overlay, all driven by [`tessera_render::FrameDriver`].

mod backend;
mod context;
mod descriptors;
mod frame;
mod memory;
mod pipeline;
mod record;
mod swapchain;
mod texture;

use std::path::Path;
use std::sync::Arc;

use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tessera_core::{EngineError, Result};
use tessera_math::glam::Vec3;
use tessera_math::{Camera, InstanceData, OverlayVertex, TransparentVertex, Vertex, WireframeVertex};
use tessera_render::{
    FrameDriver, FrameStatus, GpuContext, LifetimeTracker, Rebuild, RenderSize, Renderer, ResizeFlag, Scene,
    TextureInfo, WireframeTopology,
};
use tracing::{error, info, warn};

use backend::Gpu;
use context::VkContext;
use memory::{GpuResource, VkAllocator};

pub use backend::{DEFAULT_TEXTURE_ARRAY, MISSING_TEXTURE, UNTEXTURED_TEXTURE};
pub use swapchain::VkVsyncMode;
pub use texture::{decode_rgba, Rgba};

#[derive(Clone, Debug)]
pub struct VkOptions {
    /// Clamped to 2..=3.
    pub frames_in_flight: usize,
    pub vsync: bool,
    pub vsync_mode: VkVsyncMode,
    pub wireframe_topology: WireframeTopology,
    pub clear_color: [f32; 4],
}

impl Default for VkOptions {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            vsync: true,
            vsync_mode: VkVsyncMode::default(),
            wireframe_topology: WireframeTopology::default(),
            clear_color: [0.02, 0.02, 0.04, 1.0],
        }
    }
}

impl VkOptions {
    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight.clamp(2, 3)
    }
}

pub struct VkRenderer {
    driver: FrameDriver,
    gpu: Gpu,
    tracker: LifetimeTracker<GpuResource>,
}

impl VkRenderer {
    pub fn with_options(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        options: VkOptions,
    ) -> Result<Self> {
        unsafe {
            let ctx = VkContext::new(window, display).map_err(EngineError::init)?;
            let device = ctx.device.clone();
            let tracker = LifetimeTracker::new(move |resource: GpuResource| resource.destroy(&device));
            let gpu = Gpu::new(ctx, tracker.clone(), size, &options).map_err(EngineError::init)?;
            let driver = FrameDriver::new(options.frames_in_flight(), gpu.image_count());
            let extent = gpu.extent();
            info!(
                width = extent.width,
                height = extent.height,
                images = gpu.image_count(),
                frames_in_flight = driver.frames_in_flight(),
                "vulkan renderer ready"
            );
            Ok(Self { driver, gpu, tracker })
        }
    }

    /// Runs `f` against the scene with the current in-flight set.
    fn with_scene<T>(&mut self, f: impl FnOnce(&mut Scene<VkAllocator>, &mut GpuContext<'_, VkAllocator>) -> T) -> T {
        let in_flight = self.driver.in_flight();
        let gpu = &mut self.gpu;
        let mut ctx = GpuContext::new(&mut gpu.allocator, &self.tracker, &in_flight);
        f(&mut gpu.scene, &mut ctx)
    }

    // --- models ---------------------------------------------------------------

    pub fn set_model(&mut self, id: &str, vertices: &[Vertex]) -> Result<()> {
        self.with_scene(|scene, ctx| scene.models.set_model(ctx, id, vertices))
    }

    /// Sets both the opaque geometry and the translucent layer drawn with the
    /// same instance sets. An empty `transparent` slice drops the layer.
    pub fn set_model_with_transparency(
        &mut self,
        id: &str,
        opaque: &[Vertex],
        transparent: &[TransparentVertex],
    ) -> Result<()> {
        self.with_scene(|scene, ctx| scene.models.set_layered_model(ctx, id, opaque, transparent))
    }

    /// Removes the model together with its translucent layer.
    pub fn remove_model(&mut self, id: &str) -> Result<()> {
        self.with_scene(|scene, ctx| scene.models.remove_model(ctx, id))
    }

    /// Creates or replaces instance set `set` of `model`.
    pub fn add_instances_to_model(&mut self, model: &str, set: &str, instances: &[InstanceData]) -> Result<()> {
        self.with_scene(|scene, ctx| scene.models.set_instances(ctx, model, set, instances))?;
        Ok(())
    }

    pub fn remove_instances_from_model(&mut self, model: &str, set: &str) -> Result<()> {
        self.with_scene(|scene, ctx| scene.models.remove_instances(ctx, model, set))
    }

    /// Returns whether the set existed.
    pub fn remove_instances_from_model_safe(&mut self, model: &str, set: &str) -> bool {
        self.with_scene(|scene, ctx| scene.models.remove_instances_safe(ctx, model, set))
    }

    pub fn has_model(&self, id: &str) -> bool {
        self.gpu.scene.models.has_model(id)
    }

    pub fn has_instance_in_model(&self, model: &str, set: &str) -> Result<bool> {
        self.gpu.scene.models.has_instance_set(model, set)
    }

    // --- wireframes -------------------------------------------------------------

    pub fn set_wireframe_model(&mut self, id: &str, vertices: &[WireframeVertex]) -> Result<()> {
        self.with_scene(|scene, ctx| scene.wireframes.set_model(ctx, id, vertices))
    }

    pub fn remove_wireframe_model(&mut self, id: &str) -> Result<()> {
        self.with_scene(|scene, ctx| scene.wireframes.remove_model(ctx, id))
    }

    pub fn add_instances_to_wireframe_model(
        &mut self,
        model: &str,
        set: &str,
        instances: &[InstanceData],
    ) -> Result<()> {
        self.with_scene(|scene, ctx| scene.wireframes.set_instances(ctx, model, set, instances))?;
        Ok(())
    }

    pub fn remove_instances_from_wireframe_model(&mut self, model: &str, set: &str) -> Result<()> {
        self.with_scene(|scene, ctx| scene.wireframes.remove_instances(ctx, model, set))
    }

    pub fn has_wireframe_model(&self, id: &str) -> bool {
        self.gpu.scene.wireframes.has_model(id)
    }

    pub fn has_instance_in_wireframe_model(&self, model: &str, set: &str) -> Result<bool> {
        self.gpu.scene.wireframes.has_instance_set(model, set)
    }

    pub fn set_wireframe_topology(&mut self, topology: WireframeTopology) -> Result<()> {
        if self.gpu.topology == topology {
            return Ok(());
        }
        self.gpu.topology = topology;
        self.rebuild_pipelines()
    }

    // --- overlay and bulk -------------------------------------------------------

    pub fn set_overlay_vertices(&mut self, id: &str, vertices: &[OverlayVertex]) -> Result<()> {
        self.with_scene(|scene, ctx| scene.overlays.set(ctx, id, vertices))
    }

    /// Unknown ids are ignored.
    pub fn remove_overlay_vertices(&mut self, id: &str) -> bool {
        self.with_scene(|scene, ctx| scene.overlays.remove(ctx, id))
    }

    pub fn clear_all_overlays(&mut self) {
        self.with_scene(|scene, ctx| scene.overlays.clear(ctx))
    }

    /// Removes every instance set of every model, opaque and wireframe.
    pub fn clear_all_instances(&mut self) {
        self.with_scene(|scene, ctx| scene.clear_all_instances(ctx))
    }

    /// Overlay coordinates in `0..bounds` map to the whole screen.
    pub fn set_overlay_bounds(&mut self, x: f32, y: f32, z: f32) {
        self.gpu.overlay_bounds = Vec3::new(x, y, z);
    }

    // --- textures ---------------------------------------------------------------

    /// Loads an overlay texture from disk. Returns the id overlay vertices
    /// use to sample it.
    pub fn add_texture(&mut self, id: &str, path: impl AsRef<Path>) -> Result<u32> {
        let rgba = decode_rgba(path.as_ref()).map_err(|e| EngineError::resource_load(id, e))?;
        self.install_texture(id, &rgba)
    }

    pub fn add_texture_rgba(&mut self, id: &str, width: u32, height: u32, pixels: Vec<u8>) -> Result<u32> {
        let rgba = Rgba::new(width, height, pixels).map_err(|e| EngineError::resource_load(id, e))?;
        self.install_texture(id, &rgba)
    }

    fn install_texture(&mut self, id: &str, rgba: &Rgba) -> Result<u32> {
        let in_flight = self.driver.in_flight();
        let added = unsafe { self.gpu.add_texture(&in_flight, id, rgba)? };
        if added.grew {
            info!(capacity = self.gpu.textures.capacity(), "overlay texture table grew");
            self.rebuild_pipelines()?;
        }
        Ok(added.index)
    }

    /// The texture id becomes free and samples the missing texture until reused.
    pub fn remove_texture(&mut self, id: &str) -> Result<()> {
        let in_flight = self.driver.in_flight();
        self.gpu.textures.remove(&self.tracker, &in_flight, id)
    }

    pub fn texture_id(&self, id: &str) -> Result<u32> {
        self.gpu.textures.index_of(id)
    }

    pub fn texture_dimensions(&self, id: &str) -> Result<TextureInfo> {
        self.gpu.textures.info(id)
    }

    /// Loads every file in `paths` as one layer. Layers are named by their path.
    pub fn load_texture_array<P: AsRef<Path>>(&mut self, id: &str, paths: &[P]) -> Result<()> {
        let layers = paths
            .iter()
            .map(|p| {
                let p = p.as_ref();
                decode_rgba(p).map(|rgba| (p.display().to_string(), rgba))
            })
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(|e| EngineError::resource_load(id, e))?;
        self.load_texture_array_rgba(id, &layers)
    }

    /// All layers must share one size.
    pub fn load_texture_array_rgba(&mut self, id: &str, layers: &[(String, Rgba)]) -> Result<()> {
        if let Some((_, first)) = layers.first() {
            if let Some((name, _)) = layers.iter().find(|(_, l)| l.info() != first.info()) {
                return Err(EngineError::resource_load(
                    id,
                    anyhow::anyhow!("layer `{name}` differs in size from the first layer"),
                ));
            }
        } else {
            return Err(EngineError::resource_load(id, anyhow::anyhow!("no layers")));
        }
        let in_flight = self.driver.in_flight();
        unsafe { self.gpu.add_texture_array(&in_flight, id, layers)? };
        Ok(())
    }

    pub fn texture_array_id(&self, array: &str, layer: &str) -> Result<u32> {
        self.gpu.textures.array_layer(array, layer)
    }

    pub fn texture_array_dimensions(&self, id: &str) -> Result<TextureInfo> {
        self.gpu.textures.array_info(id)
    }

    /// Selects the array the opaque pipeline samples.
    pub fn set_current_texture_array(&mut self, id: &str) -> Result<()> {
        self.gpu.textures.set_current_array(id)
    }

    pub fn current_texture_array(&self) -> Option<&str> {
        self.gpu.textures.current_array_name()
    }

    // --- camera and uniforms ----------------------------------------------------

    pub fn camera(&self) -> &Camera {
        &self.gpu.camera
    }

    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.gpu.camera
    }

    pub fn set_camera_near(&mut self, near: f32) {
        self.gpu.camera.near = near;
    }

    pub fn set_camera_far(&mut self, far: f32) {
        self.gpu.camera.far = far;
    }

    /// Multiplied into every opaque and wireframe fragment.
    pub fn set_screen_tint(&mut self, r: f32, g: f32, b: f32) {
        self.gpu.tint = Vec3::new(r, g, b);
    }

    pub fn clear_color(&self) -> [f32; 4] {
        self.gpu.scene.clear_color()
    }

    // --- presentation -----------------------------------------------------------

    pub fn set_vsync_mode(&mut self, mode: VkVsyncMode) -> Result<()> {
        if self.gpu.config.vsync_mode == mode {
            return Ok(());
        }
        self.gpu.config.vsync_mode = mode;
        self.driver.recreate_swapchain(&mut self.gpu, &self.tracker)
    }

    fn rebuild_pipelines(&mut self) -> Result<()> {
        self.driver.drain(&mut self.gpu, &self.tracker)?;
        unsafe { self.gpu.rebuild(Rebuild::PIPELINES) }
    }

    // --- frame ------------------------------------------------------------------

    /// Re-records every image now instead of lazily before its next submit.
    pub fn record_command_buffers(&mut self) -> Result<()> {
        self.driver.record_all(&mut self.gpu, &self.tracker)
    }

    pub fn render_frame(&mut self) -> Result<FrameStatus> {
        if self.gpu.minimized {
            if !self.driver.resize_flag().take() {
                return Ok(FrameStatus::Skipped);
            }
            self.driver.recreate_swapchain(&mut self.gpu, &self.tracker)?;
            if self.gpu.minimized {
                return Ok(FrameStatus::Skipped);
            }
        }
        self.driver.render_frame(&mut self.gpu, &self.tracker)
    }

    /// Raise from any thread to rebuild the swapchain after the next present.
    pub fn resize_flag(&self) -> Arc<ResizeFlag> {
        self.driver.resize_flag()
    }

    pub fn frames_in_flight(&self) -> usize {
        self.driver.frames_in_flight()
    }

    pub fn frames_presented(&self) -> u64 {
        self.driver.frames_presented()
    }

    pub fn size(&self) -> RenderSize {
        let extent = self.gpu.extent();
        RenderSize {
            width: extent.width,
            height: extent.height,
        }
    }

    /// Resources retired but still referenced by frames in flight.
    pub fn pending_destructions(&self) -> usize {
        self.tracker.pending_count()
    }
}

impl Renderer for VkRenderer {
    fn new(window: &dyn HasWindowHandle, display: &dyn HasDisplayHandle, size: RenderSize) -> Result<Self> {
        Self::with_options(window, display, size, VkOptions::default())
    }

    fn resize(&mut self, size: RenderSize) -> Result<()> {
        self.gpu.config.hint = size;
        if size.is_zero() {
            self.gpu.minimized = true;
        } else {
            self.driver.resize_flag().raise();
        }
        Ok(())
    }

    fn render(&mut self) -> Result<()> {
        self.render_frame()?;
        Ok(())
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.gpu.scene.set_clear_color(rgba);
    }

    fn set_vsync(&mut self, on: bool) {
        if self.gpu.config.vsync == on {
            return;
        }
        self.gpu.config.vsync = on;
        if let Err(e) = self.driver.recreate_swapchain(&mut self.gpu, &self.tracker) {
            warn!("swapchain rebuild after vsync change failed: {e:#}");
        }
    }
}

impl Drop for VkRenderer {
    fn drop(&mut self) {
        if let Err(e) = self.driver.drain(&mut self.gpu, &self.tracker) {
            error!("device drain before teardown failed: {e:#}");
        }
        unsafe { self.gpu.destroy() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_in_flight_is_clamped() {
        let mut o = VkOptions::default();
        assert_eq!(o.frames_in_flight(), 2);
        o.frames_in_flight = 1;
        assert_eq!(o.frames_in_flight(), 2);
        o.frames_in_flight = 8;
        assert_eq!(o.frames_in_flight(), 3);
    }

    #[test]
    fn defaults_prefer_vsync_and_line_lists() {
        let o = VkOptions::default();
        assert!(o.vsync);
        assert_eq!(o.vsync_mode, VkVsyncMode::Mailbox);
        assert_eq!(o.wireframe_topology, WireframeTopology::LineList);
    }
}
