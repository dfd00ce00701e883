// Vulkan device - core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Physical device selection (prefer discrete GPU, honor settings override)
// - Logical device + queue creation from the queue manager's family plan

use anyhow::{Context, Result};
use ash::extensions::ext::DebugUtils;
use ash::{vk, Entry};
use raw_window_handle::RawDisplayHandle;
use std::ffi::{CStr, CString};

use crate::config::GfxSettings;
use crate::queue::QueuePlan;

/// Required Vulkan 1.0 device features
fn required_device_features() -> vk::PhysicalDeviceFeatures {
    vk::PhysicalDeviceFeatures {
        sampler_anisotropy: vk::TRUE,
        ..Default::default()
    }
}

/// Selected physical device plus everything cached off it
pub struct GpuInfo {
    pub handle: vk::PhysicalDevice,
    pub props: vk::PhysicalDeviceProperties,
    pub memory_props: vk::PhysicalDeviceMemoryProperties,
    pub queue_families: Vec<vk::QueueFamilyProperties>,
    pub is_integrated: bool,
}

impl GpuInfo {
    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.props.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}

/// Vulkan device wrapper with automatic cleanup.
///
/// Shared (via Arc) between the main thread and the submission thread; all
/// contained loaders are internally synchronized by the driver.
pub struct DeviceContext {
    // Order matters for drop: device before instance
    pub device: ash::Device,
    pub push_descriptor: ash::extensions::khr::PushDescriptor,
    pub gpu: GpuInfo,
    pub instance: ash::Instance,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    _entry: Entry,
}

impl DeviceContext {
    /// Wait for the device to go idle (shutdown / swapchain recreation)
    pub fn wait_idle(&self) {
        let _ = unsafe { self.device.device_wait_idle() };
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device");
        self.wait_idle();
        unsafe {
            self.device.destroy_device(None);
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

pub fn create_instance(
    entry: &Entry,
    settings: &GfxSettings,
    display_handle: RawDisplayHandle,
) -> Result<ash::Instance> {
    let app_name = CString::new(settings.graphics.app_name.as_str())?;
    let engine_name = CString::new("gfx-backend")?;

    let app_info = vk::ApplicationInfo::builder()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(&engine_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let mut extensions = ash_window::enumerate_required_extensions(display_handle)
        .context("No surface extensions for this display")?
        .to_vec();
    if settings.debug.validation_layers {
        extensions.push(DebugUtils::name().as_ptr());
    }

    let layer_names = if settings.debug.validation_layers {
        vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
    } else {
        vec![]
    };

    let create_info = vk::InstanceCreateInfo::builder()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layer_names);

    let instance = unsafe { entry.create_instance(&create_info, None) }
        .context("Failed to create Vulkan instance")?;

    Ok(instance)
}

pub fn create_debug_messenger(
    entry: &Entry,
    instance: &ash::Instance,
) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
    let debug_utils = DebugUtils::new(entry, instance);

    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));

    let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;

    Ok((debug_utils, messenger))
}

/// Pick the physical device: score discrete > integrated > other, require the
/// base feature set, and let the settings override the pick by name substring.
pub fn pick_physical_device(instance: &ash::Instance, preferred: &str) -> Result<GpuInfo> {
    let devices = unsafe { instance.enumerate_physical_devices() }?;

    if devices.is_empty() {
        anyhow::bail!("No Vulkan-capable GPU found");
    }

    let mut best: Option<GpuInfo> = None;
    let mut best_score = 0i32;

    for device in devices {
        let props = unsafe { instance.get_physical_device_properties(device) };
        let features = unsafe { instance.get_physical_device_features(device) };

        if features.sampler_anisotropy != vk::TRUE {
            continue;
        }

        let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy();

        let mut score = match props.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            _ => 1,
        };
        if !preferred.is_empty() && name.to_lowercase().contains(&preferred.to_lowercase()) {
            score += 10_000;
        }

        if score > best_score {
            best_score = score;
            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };
            let memory_props = unsafe { instance.get_physical_device_memory_properties(device) };
            best = Some(GpuInfo {
                handle: device,
                props,
                memory_props,
                queue_families,
                is_integrated: props.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU,
            });
        }
    }

    let gpu = best.ok_or_else(|| anyhow::anyhow!("No suitable GPU found"))?;

    log::info!("Selected GPU: {}", gpu.name());
    log::info!(
        "API Version: {}.{}.{}",
        vk::api_version_major(gpu.props.api_version),
        vk::api_version_minor(gpu.props.api_version),
        vk::api_version_patch(gpu.props.api_version)
    );

    Ok(gpu)
}

/// Create the logical device with one queue per planned (family, index) pair
pub fn create_logical_device(
    instance: &ash::Instance,
    gpu: &GpuInfo,
    plans: &[QueuePlan],
) -> Result<ash::Device> {
    // Group queue counts per family; queue priorities are all 1.0
    let mut family_counts: Vec<(u32, u32)> = Vec::new();
    for plan in plans {
        match family_counts.iter_mut().find(|(f, _)| *f == plan.family_index) {
            Some((_, count)) => *count = (*count).max(plan.queue_index + 1),
            None => family_counts.push((plan.family_index, plan.queue_index + 1)),
        }
    }

    let priorities = [1.0f32; 8];
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = family_counts
        .iter()
        .map(|&(family, count)| {
            vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(family)
                .queue_priorities(&priorities[..count as usize])
                .build()
        })
        .collect();

    let extensions = [
        ash::extensions::khr::Swapchain::name().as_ptr(),
        ash::extensions::khr::PushDescriptor::name().as_ptr(),
    ];

    // Synchronization2 drives every barrier in the backend; dynamic rendering
    // replaces render-pass/framebuffer objects entirely.
    let mut features13 = vk::PhysicalDeviceVulkan13Features::builder()
        .synchronization2(true)
        .dynamic_rendering(true);

    let features = required_device_features();
    let create_info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extensions)
        .enabled_features(&features)
        .push_next(&mut features13);

    let device = unsafe { instance.create_device(gpu.handle, &create_info, None) }
        .context("Failed to create logical device")?;

    Ok(device)
}

/// Assemble the shared device context after instance/device creation
pub fn make_context(
    entry: Entry,
    instance: ash::Instance,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    gpu: GpuInfo,
    device: ash::Device,
) -> DeviceContext {
    let push_descriptor = ash::extensions::khr::PushDescriptor::new(&instance, &device);
    DeviceContext {
        device,
        push_descriptor,
        gpu,
        instance,
        debug_utils,
        _entry: entry,
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
