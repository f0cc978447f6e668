// SPDX-License-Identifier: CEPL-1.0
//! Instance, surface, device and queue. Everything here lives for the whole
//! renderer and is torn down last.

use std::ffi::{c_char, CStr};
use std::{fs, path::PathBuf};

use anyhow::{anyhow, Context, Result};
use ash::ext::debug_utils as ext_debug;
use ash::khr::{surface, swapchain};
use ash::{vk, Entry, Instance};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle};
use tracing::{debug, error, info, trace, warn};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

pub struct VkContext {
    pub entry: Entry,
    pub instance: Instance,
    debug: Option<(ext_debug::Instance, vk::DebugUtilsMessengerEXT)>,
    pub surface_loader: surface::Instance,
    pub surface: vk::SurfaceKHR,

    pub phys: vk::PhysicalDevice,
    pub props: vk::PhysicalDeviceProperties,
    pub memory_props: vk::PhysicalDeviceMemoryProperties,
    pub device: ash::Device,
    pub queue_family: u32,
    pub queue: vk::Queue,

    pub swapchain_loader: swapchain::Device,
    pub cmd_pool: vk::CommandPool,
    pub pipeline_cache: vk::PipelineCache,
    cache_path: PathBuf,
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut std::os::raw::c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let msg = CStr::from_ptr((*data).p_message).to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "vulkan", ?types, "{msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "vulkan", ?types, "{msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        debug!(target: "vulkan", ?types, "{msg}");
    } else {
        trace!(target: "vulkan", ?types, "{msg}");
    }
    vk::FALSE
}

fn has_name(names: &[[c_char; vk::MAX_EXTENSION_NAME_SIZE]], want: &CStr) -> bool {
    names
        .iter()
        .any(|n| unsafe { CStr::from_ptr(n.as_ptr()) } == want)
}

unsafe fn create_instance(entry: &Entry, display_raw: RawDisplayHandle) -> Result<(Instance, bool)> {
    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: c"tessera".as_ptr(),
        application_version: 0,
        p_engine_name: c"tessera".as_ptr(),
        engine_version: 0,
        api_version: vk::API_VERSION_1_3,
        ..Default::default()
    };

    let mut exts = ash_window::enumerate_required_extensions(display_raw)
        .context("enumerate_required_extensions")?
        .to_vec();

    let mut layers: Vec<*const c_char> = Vec::new();
    let mut with_debug = false;
    if cfg!(debug_assertions) {
        let inst_exts: Vec<_> = entry
            .enumerate_instance_extension_properties(None)
            .context("enumerate_instance_extension_properties")?
            .iter()
            .map(|e| e.extension_name)
            .collect();
        if has_name(&inst_exts, ext_debug::NAME) {
            exts.push(ext_debug::NAME.as_ptr());
            with_debug = true;
        }

        let inst_layers: Vec<_> = entry
            .enumerate_instance_layer_properties()
            .unwrap_or_default()
            .iter()
            .map(|l| l.layer_name)
            .collect();
        if has_name(&inst_layers, VALIDATION_LAYER) {
            layers.push(VALIDATION_LAYER.as_ptr());
        } else {
            warn!("validation layer not installed; running without it");
        }
    }

    let create_info = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        p_application_info: &app_info,
        enabled_extension_count: exts.len() as u32,
        pp_enabled_extension_names: exts.as_ptr(),
        enabled_layer_count: layers.len() as u32,
        pp_enabled_layer_names: layers.as_ptr(),
        ..Default::default()
    };

    Ok((entry.create_instance(&create_info, None)?, with_debug))
}

unsafe fn create_debug_messenger(
    entry: &Entry,
    instance: &Instance,
) -> Result<(ext_debug::Instance, vk::DebugUtilsMessengerEXT)> {
    let loader = ext_debug::Instance::new(entry, instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT {
        s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
            | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    };
    let messenger = loader.create_debug_utils_messenger(&ci, None)?;
    Ok((loader, messenger))
}

/// Ranks a device for selection; `None` when it cannot run the renderer.
pub fn device_score(props: &vk::PhysicalDeviceProperties) -> Option<u32> {
    let api = props.api_version;
    if vk::api_version_major(api) == 1 && vk::api_version_minor(api) < 3 {
        return None;
    }
    Some(match props.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 3,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 2,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 1,
        _ => 0,
    })
}

unsafe fn pick_device_and_queue(
    instance: &Instance,
    surf_i: &surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, u32)> {
    let mut best: Option<(u32, vk::PhysicalDevice, u32)> = None;
    for phys in instance.enumerate_physical_devices()? {
        let props = instance.get_physical_device_properties(phys);
        let Some(score) = device_score(&props) else {
            debug!(name = ?CStr::from_ptr(props.device_name.as_ptr()), "skipping device without Vulkan 1.3");
            continue;
        };

        let qprops = instance.get_physical_device_queue_family_properties(phys);
        let family = qprops.iter().enumerate().find_map(|(i, q)| {
            let present = surf_i
                .get_physical_device_surface_support(phys, i as u32, surface)
                .unwrap_or(false);
            (q.queue_flags.contains(vk::QueueFlags::GRAPHICS) && present).then_some(i as u32)
        });

        if let Some(family) = family {
            if best.map_or(true, |(s, _, _)| score > s) {
                best = Some((score, phys, family));
            }
        }
    }
    best.map(|(_, phys, family)| (phys, family))
        .ok_or_else(|| anyhow!("no Vulkan 1.3 device with a graphics+present queue"))
}

unsafe fn create_device(
    instance: &Instance,
    phys: vk::PhysicalDevice,
    queue_family: u32,
) -> Result<(ash::Device, vk::Queue)> {
    // STRICT ORDER (feature pNext chain): feats13 -> feats12 -> feats2.
    let priorities = [1.0_f32];
    let qinfo = vk::DeviceQueueCreateInfo {
        s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
        queue_family_index: queue_family,
        queue_count: 1,
        p_queue_priorities: priorities.as_ptr(),
        ..Default::default()
    };

    let device_exts: [*const c_char; 1] = [swapchain::NAME.as_ptr()];

    let mut feats13 = vk::PhysicalDeviceVulkan13Features {
        s_type: vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_3_FEATURES,
        synchronization2: vk::TRUE,
        dynamic_rendering: vk::TRUE,
        ..Default::default()
    };
    let mut feats12 = vk::PhysicalDeviceVulkan12Features {
        s_type: vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_2_FEATURES,
        shader_sampled_image_array_non_uniform_indexing: vk::TRUE,
        ..Default::default()
    };
    feats12.p_next = (&mut feats13) as *mut _ as *mut _;
    let mut feats2 = vk::PhysicalDeviceFeatures2 {
        s_type: vk::StructureType::PHYSICAL_DEVICE_FEATURES_2,
        ..Default::default()
    };
    feats2.p_next = (&mut feats12) as *mut _ as *mut _;

    let dinfo = vk::DeviceCreateInfo {
        s_type: vk::StructureType::DEVICE_CREATE_INFO,
        p_next: (&mut feats2) as *mut _ as *const _,
        queue_create_info_count: 1,
        p_queue_create_infos: &qinfo,
        enabled_extension_count: device_exts.len() as u32,
        pp_enabled_extension_names: device_exts.as_ptr(),
        ..Default::default()
    };

    let device = instance
        .create_device(phys, &dinfo, None)
        .context("create_device")?;
    let queue = device.get_device_queue(queue_family, 0);
    Ok((device, queue))
}

fn hex_bytes(b: &[u8]) -> String {
    let mut s = String::with_capacity(b.len() * 2);
    for x in b {
        use std::fmt::Write as _;
        let _ = write!(&mut s, "{:02x}", x);
    }
    s
}

/// Cache file name; changes with device, driver and cache UUID.
pub fn pipeline_cache_path(props: &vk::PhysicalDeviceProperties) -> PathBuf {
    let uuid = hex_bytes(&props.pipeline_cache_uuid);
    PathBuf::from(format!(
        "vk_pipeline_cache_{:04x}_{:04x}_{:08x}_{}.bin",
        props.vendor_id, props.device_id, props.driver_version, uuid
    ))
}

unsafe fn create_or_load_pipeline_cache(device: &ash::Device, path: &PathBuf) -> Result<vk::PipelineCache> {
    let data = fs::read(path).ok();
    let (p_initial_data, initial_size) = match &data {
        Some(bytes) => {
            info!(path = %path.display(), bytes = bytes.len(), "loaded pipeline cache");
            (bytes.as_ptr() as *const std::ffi::c_void, bytes.len())
        }
        None => (std::ptr::null(), 0),
    };

    let ci = vk::PipelineCacheCreateInfo {
        s_type: vk::StructureType::PIPELINE_CACHE_CREATE_INFO,
        initial_data_size: initial_size,
        p_initial_data,
        ..Default::default()
    };
    match device.create_pipeline_cache(&ci, None) {
        Ok(cache) => Ok(cache),
        // stale or foreign blob: start empty
        Err(e) if initial_size > 0 => {
            warn!(?e, "pipeline cache rejected; starting empty");
            let empty = vk::PipelineCacheCreateInfo {
                s_type: vk::StructureType::PIPELINE_CACHE_CREATE_INFO,
                ..Default::default()
            };
            Ok(device.create_pipeline_cache(&empty, None)?)
        }
        Err(e) => Err(e.into()),
    }
}

unsafe fn save_pipeline_cache(device: &ash::Device, cache: vk::PipelineCache, path: &PathBuf) -> Result<()> {
    // some drivers fail here if the cache is empty or the device is lost
    if let Ok(bytes) = device.get_pipeline_cache_data(cache) {
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        fs::write(path, &bytes).with_context(|| format!("write {}", path.display()))?;
        debug!(path = %path.display(), bytes = bytes.len(), "saved pipeline cache");
    }
    Ok(())
}

impl VkContext {
    pub unsafe fn new(window: &dyn HasWindowHandle, display: &dyn HasDisplayHandle) -> Result<Self> {
        // STRICT ORDER:
        // 1) Create VkInstance (platform WSI + debug ext)
        // 2) Create VkSurfaceKHR FROM THIS INSTANCE
        // 3) Query physical devices/queues AGAINST THIS SURFACE
        // 4) Create VkDevice for the selected phys
        let dh = display.display_handle().map_err(|e| anyhow!("{e}"))?.as_raw();
        let wh = window.window_handle().map_err(|e| anyhow!("{e}"))?.as_raw();

        let entry = Entry::linked();
        let (instance, with_debug) = create_instance(&entry, dh).context("create_instance")?;

        let debug = if with_debug {
            Some(create_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let surface_loader = surface::Instance::new(&entry, &instance);
        let surface = ash_window::create_surface(&entry, &instance, dh, wh, None)
            .context("ash_window::create_surface")?;

        let (phys, queue_family) = pick_device_and_queue(&instance, &surface_loader, surface)?;
        let props = instance.get_physical_device_properties(phys);
        let memory_props = instance.get_physical_device_memory_properties(phys);
        info!(
            device = ?CStr::from_ptr(props.device_name.as_ptr()),
            api = %format!(
                "{}.{}.{}",
                vk::api_version_major(props.api_version),
                vk::api_version_minor(props.api_version),
                vk::api_version_patch(props.api_version)
            ),
            queue_family,
            "selected physical device"
        );

        let (device, queue) = create_device(&instance, phys, queue_family)?;
        let swapchain_loader = swapchain::Device::new(&instance, &device);

        let pool_info = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            queue_family_index: queue_family,
            flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            ..Default::default()
        };
        let cmd_pool = device.create_command_pool(&pool_info, None)?;

        let cache_path = pipeline_cache_path(&props);
        let pipeline_cache = create_or_load_pipeline_cache(&device, &cache_path)?;

        Ok(Self {
            entry,
            instance,
            debug,
            surface_loader,
            surface,
            phys,
            props,
            memory_props,
            device,
            queue_family,
            queue,
            swapchain_loader,
            cmd_pool,
            pipeline_cache,
            cache_path,
        })
    }

    pub unsafe fn allocate_command_buffers(&self, count: usize) -> Result<Vec<vk::CommandBuffer>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let alloc_info = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: self.cmd_pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: count as u32,
            ..Default::default()
        };
        Ok(self.device.allocate_command_buffers(&alloc_info)?)
    }

    /// Records `f` into a throwaway command buffer, submits it and waits for
    /// the queue to drain.
    pub unsafe fn one_time_submit(&self, f: impl FnOnce(&ash::Device, vk::CommandBuffer)) -> Result<()> {
        let cmd = self
            .allocate_command_buffers(1)?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no command buffer allocated"))?;
        let bi = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        let result = (|| -> Result<()> {
            self.device.begin_command_buffer(cmd, &bi)?;
            f(&self.device, cmd);
            self.device.end_command_buffer(cmd)?;
            let si = vk::SubmitInfo {
                s_type: vk::StructureType::SUBMIT_INFO,
                command_buffer_count: 1,
                p_command_buffers: &cmd,
                ..Default::default()
            };
            self.device
                .queue_submit(self.queue, std::slice::from_ref(&si), vk::Fence::null())
                .context("queue_submit(one-time)")?;
            self.device.queue_wait_idle(self.queue)?;
            Ok(())
        })();
        self.device.free_command_buffers(self.cmd_pool, std::slice::from_ref(&cmd));
        result
    }

    /// Persists the pipeline cache, then destroys the device, surface and
    /// instance. The device must be idle and every child object gone.
    pub unsafe fn destroy(&mut self) {
        if let Err(e) = save_pipeline_cache(&self.device, self.pipeline_cache, &self.cache_path) {
            warn!("pipeline cache not saved: {e:#}");
        }
        self.device.destroy_pipeline_cache(self.pipeline_cache, None);
        self.device.destroy_command_pool(self.cmd_pool, None);
        self.device.destroy_device(None);
        self.surface_loader.destroy_surface(self.surface, None);
        if let Some((loader, messenger)) = self.debug.take() {
            loader.destroy_debug_utils_messenger(messenger, None);
        }
        self.instance.destroy_instance(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(api: u32, ty: vk::PhysicalDeviceType) -> vk::PhysicalDeviceProperties {
        vk::PhysicalDeviceProperties {
            api_version: api,
            device_type: ty,
            ..Default::default()
        }
    }

    #[test]
    fn devices_below_1_3_are_rejected() {
        assert_eq!(device_score(&props(vk::API_VERSION_1_2, vk::PhysicalDeviceType::DISCRETE_GPU)), None);
        assert!(device_score(&props(vk::API_VERSION_1_3, vk::PhysicalDeviceType::CPU)).is_some());
    }

    #[test]
    fn discrete_beats_integrated() {
        let discrete = device_score(&props(vk::API_VERSION_1_3, vk::PhysicalDeviceType::DISCRETE_GPU));
        let integrated = device_score(&props(vk::API_VERSION_1_3, vk::PhysicalDeviceType::INTEGRATED_GPU));
        assert!(discrete > integrated);
    }

    #[test]
    fn cache_path_encodes_device_identity() {
        let mut p = props(vk::API_VERSION_1_3, vk::PhysicalDeviceType::DISCRETE_GPU);
        p.vendor_id = 0x10de;
        p.device_id = 0x2684;
        p.pipeline_cache_uuid = [0xab; vk::UUID_SIZE];
        let path = pipeline_cache_path(&p);
        let name = path.to_string_lossy();
        assert!(name.starts_with("vk_pipeline_cache_10de_2684_"));
        assert!(name.ends_with(&format!("{}.bin", "ab".repeat(16))));
    }
}
