// SPDX-License-Identifier: CEPL-1.0
//! Device memory: buffers, images and the resource type handed to the
//! lifetime tracker.

use anyhow::{anyhow, Context, Result};
use ash::vk;
use ash::vk::Handle;
use tessera_render::{BufferAllocator, BufferUsage, TrackedResource};
use tracing::trace;

/// Persistent host mapping of a buffer's memory.
#[derive(Clone, Copy, Debug)]
pub struct MappedPtr(*mut u8);

// Only dereferenced by the render thread; other threads merely move it
// through the tracker until release.
unsafe impl Send for MappedPtr {}

#[derive(Debug)]
pub struct BufferAllocation {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    mapped: MappedPtr,
    pub size: vk::DeviceSize,
}

#[derive(Debug)]
pub struct ImageAllocation {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
}

/// Every GPU object whose destruction goes through the lifetime tracker.
#[derive(Debug)]
pub enum GpuResource {
    Buffer(BufferAllocation),
    Image(ImageAllocation),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKey {
    Buffer(u64),
    Image(u64),
}

impl TrackedResource for GpuResource {
    type Key = ResourceKey;

    fn key(&self) -> ResourceKey {
        match self {
            GpuResource::Buffer(b) => ResourceKey::Buffer(b.buffer.as_raw()),
            GpuResource::Image(i) => ResourceKey::Image(i.image.as_raw()),
        }
    }
}

impl GpuResource {
    pub fn view(&self) -> Option<vk::ImageView> {
        match self {
            GpuResource::Image(i) => Some(i.view),
            GpuResource::Buffer(_) => None,
        }
    }

    /// # Safety
    /// No pending GPU work may reference the resource.
    pub unsafe fn destroy(self, device: &ash::Device) {
        trace!(key = ?self.key(), "destroying gpu resource");
        match self {
            GpuResource::Buffer(b) => {
                device.unmap_memory(b.memory);
                device.destroy_buffer(b.buffer, None);
                device.free_memory(b.memory, None);
            }
            GpuResource::Image(i) => {
                device.destroy_image_view(i.view, None);
                device.destroy_image(i.image, None);
                device.free_memory(i.memory, None);
            }
        }
    }
}

pub fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    req: vk::MemoryPropertyFlags,
) -> Result<u32> {
    (0..props.memory_type_count)
        .find(|&i| {
            (type_bits & (1 << i)) != 0
                && props.memory_types[i as usize].property_flags.contains(req)
        })
        .ok_or_else(|| anyhow!("no memory type with {req:?} in mask {type_bits:#x}"))
}

pub unsafe fn create_buffer_and_memory(
    device: &ash::Device,
    props: &vk::PhysicalDeviceMemoryProperties,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    flags: vk::MemoryPropertyFlags,
) -> Result<(vk::Buffer, vk::DeviceMemory)> {
    let bci = vk::BufferCreateInfo {
        s_type: vk::StructureType::BUFFER_CREATE_INFO,
        size,
        usage,
        sharing_mode: vk::SharingMode::EXCLUSIVE,
        ..Default::default()
    };
    let buf = device.create_buffer(&bci, None)?;
    let req = device.get_buffer_memory_requirements(buf);
    let mem_type = match find_memory_type(props, req.memory_type_bits, flags) {
        Ok(t) => t,
        Err(e) => {
            device.destroy_buffer(buf, None);
            return Err(e);
        }
    };
    let mai = vk::MemoryAllocateInfo {
        s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
        allocation_size: req.size,
        memory_type_index: mem_type,
        ..Default::default()
    };
    let mem = match device.allocate_memory(&mai, None) {
        Ok(mem) => mem,
        Err(e) => {
            device.destroy_buffer(buf, None);
            return Err(anyhow::Error::from(e).context("allocate_memory(buffer)"));
        }
    };
    if let Err(e) = device.bind_buffer_memory(buf, mem, 0) {
        device.destroy_buffer(buf, None);
        device.free_memory(mem, None);
        return Err(anyhow::Error::from(e).context("bind_buffer_memory"));
    }
    Ok((buf, mem))
}

pub unsafe fn create_image_and_memory(
    device: &ash::Device,
    props: &vk::PhysicalDeviceMemoryProperties,
    info: &vk::ImageCreateInfo<'_>,
) -> Result<(vk::Image, vk::DeviceMemory)> {
    let image = device.create_image(info, None)?;
    let req = device.get_image_memory_requirements(image);
    let mem_type = match find_memory_type(props, req.memory_type_bits, vk::MemoryPropertyFlags::DEVICE_LOCAL) {
        Ok(t) => t,
        Err(e) => {
            device.destroy_image(image, None);
            return Err(e);
        }
    };
    let alloc = vk::MemoryAllocateInfo {
        s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
        allocation_size: req.size,
        memory_type_index: mem_type,
        ..Default::default()
    };
    let memory = match device.allocate_memory(&alloc, None) {
        Ok(memory) => memory,
        Err(e) => {
            device.destroy_image(image, None);
            return Err(anyhow::Error::from(e).context("allocate_memory(image)"));
        }
    };
    if let Err(e) = device.bind_image_memory(image, memory, 0) {
        device.destroy_image(image, None);
        device.free_memory(memory, None);
        return Err(anyhow::Error::from(e).context("bind_image_memory"));
    }
    Ok((image, memory))
}

/// Host-visible, coherent, persistently mapped buffers.
pub struct VkAllocator {
    device: ash::Device,
    props: vk::PhysicalDeviceMemoryProperties,
}

impl VkAllocator {
    pub fn new(device: ash::Device, props: vk::PhysicalDeviceMemoryProperties) -> Self {
        Self { device, props }
    }

    fn usage_flags(usage: BufferUsage) -> vk::BufferUsageFlags {
        match usage {
            BufferUsage::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
            BufferUsage::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
        }
    }
}

impl BufferAllocator for VkAllocator {
    type Allocation = GpuResource;
    type Handle = vk::Buffer;

    fn allocate(&mut self, usage: BufferUsage, contents: &[u8]) -> tessera_core::Result<GpuResource> {
        let size = contents.len() as vk::DeviceSize;
        let (buffer, memory) = unsafe {
            create_buffer_and_memory(
                &self.device,
                &self.props,
                size,
                Self::usage_flags(usage),
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )?
        };
        let mapped = unsafe { self.device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()) };
        let ptr = match mapped {
            Ok(ptr) => ptr as *mut u8,
            Err(e) => {
                unsafe {
                    self.device.destroy_buffer(buffer, None);
                    self.device.free_memory(memory, None);
                }
                return Err(anyhow::Error::from(e).context("map_memory").into());
            }
        };
        unsafe { std::ptr::copy_nonoverlapping(contents.as_ptr(), ptr, contents.len()) };
        trace!(?buffer, size, ?usage, "allocated buffer");
        Ok(GpuResource::Buffer(BufferAllocation {
            buffer,
            memory,
            mapped: MappedPtr(ptr),
            size,
        }))
    }

    fn write(&mut self, allocation: &GpuResource, contents: &[u8]) -> tessera_core::Result<()> {
        let GpuResource::Buffer(b) = allocation else {
            return Err(anyhow!("write to a non-buffer resource").into());
        };
        if contents.len() as vk::DeviceSize != b.size {
            return Err(anyhow!("write of {} bytes into a {} byte buffer", contents.len(), b.size).into());
        }
        unsafe { std::ptr::copy_nonoverlapping(contents.as_ptr(), b.mapped.0, contents.len()) };
        Ok(())
    }

    fn wait_idle(&mut self) -> tessera_core::Result<()> {
        unsafe { self.device.device_wait_idle() }.context("device_wait_idle")?;
        Ok(())
    }

    fn handle(allocation: &GpuResource) -> vk::Buffer {
        match allocation {
            GpuResource::Buffer(b) => b.buffer,
            GpuResource::Image(_) => vk::Buffer::null(),
        }
    }
}
