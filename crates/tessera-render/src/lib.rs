// SPDX-License-Identifier: CEPL-1.0
//! Backend-independent frame lifecycle and resource bookkeeping.

use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tessera_core::Result;

pub mod buffer;
pub mod driver;
pub mod lifetime;
pub mod rebuild;
pub mod recorder;
pub mod scene;
pub mod sync;
pub mod texture;

#[cfg(test)]
mod testing;

pub use buffer::{BufferAllocator, BufferUpdate, BufferUsage, DynamicBuffer, GpuContext};
pub use driver::{AcquiredImage, FrameBackend, FrameDriver, FrameStatus, ResizeFlag};
pub use lifetime::{LifetimeTracker, Releaser, TrackedResource};
pub use rebuild::Rebuild;
pub use recorder::{record_scene, CommandCache, DrawCategory, RenderCommand};
pub use scene::{InstancedModel, ModelRegistry, OverlayRegistry, Scene};
pub use sync::{FrameSynchronizer, SlotId, SlotState};
pub use texture::{TextureInfo, TextureRegistry};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub fn is_zero(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn aspect(&self) -> f32 {
        if self.height == 0 {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }
}

/// Topology of the wireframe pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WireframeTopology {
    #[default]
    LineList,
    LineStrip,
}

pub trait Renderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
    ) -> Result<Self>
    where
        Self: Sized;

    fn resize(&mut self, size: RenderSize) -> Result<()>;
    fn render(&mut self) -> Result<()>;
    fn set_clear_color(&mut self, rgba: [f32; 4]);
    fn set_vsync(&mut self, _on: bool) {}
}
