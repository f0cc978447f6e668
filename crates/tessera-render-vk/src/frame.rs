// SPDX-License-Identifier: CEPL-1.0
//! Per-slot semaphores and fences backing the frame synchronizer.

use anyhow::{Context, Result};
use ash::vk;
use tessera_render::SlotId;

pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
}

pub struct FrameSlots {
    slots: Vec<FrameSync>,
}

impl FrameSlots {
    /// Fences start signaled so the first wait on every slot returns at once.
    pub unsafe fn new(device: &ash::Device, count: usize) -> Result<Self> {
        let sem_ci = vk::SemaphoreCreateInfo::default();
        let fence_ci = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: vk::FenceCreateFlags::SIGNALED,
            ..Default::default()
        };
        let mut slots = Self {
            slots: Vec::with_capacity(count),
        };
        for _ in 0..count {
            let created = (|| -> Result<FrameSync> {
                Ok(FrameSync {
                    image_available: device.create_semaphore(&sem_ci, None)?,
                    render_finished: device.create_semaphore(&sem_ci, None)?,
                    in_flight: device.create_fence(&fence_ci, None)?,
                })
            })();
            match created {
                Ok(sync) => slots.slots.push(sync),
                Err(e) => {
                    slots.destroy(device);
                    return Err(e).context("create frame sync objects");
                }
            }
        }
        Ok(slots)
    }

    pub fn get(&self, slot: SlotId) -> &FrameSync {
        &self.slots[slot.index()]
    }

    pub unsafe fn wait(&self, device: &ash::Device, slot: SlotId) -> Result<()> {
        device
            .wait_for_fences(&[self.get(slot).in_flight], true, u64::MAX)
            .with_context(|| format!("wait_for_fences({slot:?})"))
    }

    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for f in self.slots.drain(..) {
            device.destroy_fence(f.in_flight, None);
            device.destroy_semaphore(f.render_finished, None);
            device.destroy_semaphore(f.image_available, None);
        }
    }
}
