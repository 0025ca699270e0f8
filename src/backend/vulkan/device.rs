// Vulkan device - instance, surface, GPU and queues
//
// Responsibilities:
// - Instance creation with the configured layers and surface extensions
// - Debug messenger routed to the renderer's log callback
// - Physical device selection (prefer discrete GPU, must present to the surface)
// - Logical device with graphics + present queues
// - Memory allocator setup

use anyhow::{bail, Context, Result};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{c_void, CStr, CString};

use crate::config::{PlatformHandle, RendererSettings};
use crate::logging::Messenger;

/// Instance-level objects plus the logical device.
///
/// Drop order is handled by `VulkanBackend`, which owns every child object.
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    pub entry: Entry,

    pub surface: vk::SurfaceKHR,
    pub surface_loader: ash::extensions::khr::Surface,

    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,
    pub present_queue: vk::Queue,
    pub present_queue_family: u32,

    pub properties: vk::PhysicalDeviceProperties,

    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    // Target of the debug messenger's user-data pointer; must outlive it
    _messenger: Box<Messenger>,
}

impl VulkanDevice {
    pub fn new(app_name: &str, settings: &RendererSettings, messenger: Messenger) -> Result<Self> {
        log::info!("Creating Vulkan device: {}", app_name);

        let handle = settings
            .handle
            .context("The Vulkan backend needs a platform handle to present to")?;

        let entry = unsafe { Entry::load() }.context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let instance = Self::create_instance(&entry, app_name, settings, &handle)?;

        let messenger = Box::new(messenger);
        let debug_utils = if settings.validation {
            Some(Self::setup_debug_messenger(&entry, &instance, &messenger)?)
        } else {
            None
        };

        let surface_loader = ash::extensions::khr::Surface::new(&entry, &instance);
        let surface = unsafe { create_surface(&entry, &instance, &handle) }.context("Failed to create surface")?;

        let (physical_device, graphics_queue_family, present_queue_family) =
            Self::pick_physical_device(&instance, &surface_loader, surface)?;

        let (device, graphics_queue, present_queue) = Self::create_logical_device(
            &instance,
            physical_device,
            graphics_queue_family,
            present_queue_family,
            &settings.vulkan.device_layers,
        )?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        Ok(Self {
            device,
            physical_device,
            instance,
            entry,
            surface,
            surface_loader,
            graphics_queue,
            graphics_queue_family,
            present_queue,
            present_queue_family,
            properties,
            debug_utils,
            _messenger: messenger,
        })
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        settings: &RendererSettings,
        handle: &PlatformHandle,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("tiny-renderer")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        let mut extensions = vec![ash::extensions::khr::Surface::name().as_ptr()];
        extensions.push(surface_extension(handle)?.as_ptr());
        if settings.validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }

        let layers: Vec<CString> = if settings.validation {
            settings
                .vulkan
                .instance_layers
                .iter()
                .map(|name| CString::new(name.as_str()))
                .collect::<Result<_, _>>()?
        } else {
            Vec::new()
        };
        let layer_names: Vec<_> = layers.iter().map(|l| l.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance =
            unsafe { entry.create_instance(&create_info, None) }.context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
        messenger: &Messenger,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback))
            .user_data(messenger as *const Messenger as *mut c_void);

        let handle = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, handle))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &ash::extensions::khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<(vk::PhysicalDevice, u32, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            bail!("No Vulkan-capable GPU found");
        }

        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            if props.api_version < vk::API_VERSION_1_2 {
                continue;
            }

            let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };

            let graphics_family = queue_families
                .iter()
                .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE))
                .map(|i| i as u32);
            let Some(graphics_family) = graphics_family else { continue };

            let supports_present = |family: u32| unsafe {
                surface_loader
                    .get_physical_device_surface_support(device, family, surface)
                    .unwrap_or(false)
            };
            // Same family when possible: no ownership transfers for swapchain images
            let present_family = if supports_present(graphics_family) {
                Some(graphics_family)
            } else {
                (0..queue_families.len() as u32).find(|&family| supports_present(family))
            };
            let Some(present_family) = present_family else { continue };

            let score = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                _ => 1,
            };

            if score > best_score {
                best_score = score;
                best_device = Some((device, graphics_family, present_family));
            }
        }

        best_device.context("No GPU can render and present to this surface")
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        graphics_queue_family: u32,
        present_queue_family: u32,
        device_layers: &[String],
    ) -> Result<(ash::Device, vk::Queue, vk::Queue)> {
        let queue_priorities = [1.0];
        let mut families = vec![graphics_queue_family];
        if present_queue_family != graphics_queue_family {
            families.push(present_queue_family);
        }
        let queue_create_infos: Vec<_> = families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions = [ash::extensions::khr::Swapchain::name().as_ptr()];

        let layers: Vec<CString> = device_layers
            .iter()
            .map(|name| CString::new(name.as_str()))
            .collect::<Result<_, _>>()?;
        let layer_names: Vec<_> = layers.iter().map(|l| l.as_ptr()).collect();

        let available = unsafe { instance.get_physical_device_features(physical_device) };
        let features = vk::PhysicalDeviceFeatures::builder()
            .sampler_anisotropy(available.sampler_anisotropy == vk::TRUE)
            .tessellation_shader(available.tessellation_shader == vk::TRUE)
            .geometry_shader(available.geometry_shader == vk::TRUE)
            .fill_mode_non_solid(available.fill_mode_non_solid == vk::TRUE);
        let mut vulkan12 = vk::PhysicalDeviceVulkan12Features::builder().timeline_semaphore(true);

        #[allow(deprecated)]
        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names)
            .enabled_features(&features)
            .push_next(&mut vulkan12);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };
        let present_queue = unsafe { device.get_device_queue(present_queue_family, 0) };

        Ok((device, graphics_queue, present_queue))
    }

    pub fn create_allocator(&self) -> Result<Allocator> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: self.instance.clone(),
            device: self.device.clone(),
            physical_device: self.physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create GPU memory allocator")?;

        Ok(allocator)
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("vkDeviceWaitIdle failed")?;
        Ok(())
    }

    /// Destroy the device, surface and instance. Every child object must be gone.
    pub unsafe fn destroy(&mut self) {
        log::info!("Destroying Vulkan device...");
        self.device.destroy_device(None);
        self.surface_loader.destroy_surface(self.surface, None);
        if let Some((debug_utils, messenger)) = self.debug_utils.take() {
            debug_utils.destroy_debug_utils_messenger(messenger, None);
        }
        self.instance.destroy_instance(None);
    }
}

fn surface_extension(handle: &PlatformHandle) -> Result<&'static CStr> {
    Ok(match handle.window {
        RawWindowHandle::Xlib(_) => ash::extensions::khr::XlibSurface::name(),
        RawWindowHandle::Xcb(_) => ash::extensions::khr::XcbSurface::name(),
        RawWindowHandle::Wayland(_) => ash::extensions::khr::WaylandSurface::name(),
        RawWindowHandle::Win32(_) => ash::extensions::khr::Win32Surface::name(),
        other => bail!("Unsupported window handle {:?}", other),
    })
}

unsafe fn create_surface(entry: &Entry, instance: &ash::Instance, handle: &PlatformHandle) -> Result<vk::SurfaceKHR> {
    let surface = match (handle.display, handle.window) {
        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(window)) => {
            let dpy = display.display.context("Xlib display pointer is null")?;
            let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                .dpy(dpy.as_ptr() as *mut vk::Display)
                .window(window.window);
            ash::extensions::khr::XlibSurface::new(entry, instance).create_xlib_surface(&create_info, None)?
        }
        (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(window)) => {
            let connection = display.connection.context("Xcb connection pointer is null")?;
            let create_info = vk::XcbSurfaceCreateInfoKHR::builder()
                .connection(connection.as_ptr() as *mut vk::xcb_connection_t)
                .window(window.window.get());
            ash::extensions::khr::XcbSurface::new(entry, instance).create_xcb_surface(&create_info, None)?
        }
        (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(window)) => {
            let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                .display(display.display.as_ptr() as *mut vk::wl_display)
                .surface(window.surface.as_ptr() as *mut vk::wl_surface);
            ash::extensions::khr::WaylandSurface::new(entry, instance).create_wayland_surface(&create_info, None)?
        }
        (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(window)) => {
            let hinstance = window.hinstance.map(|h| h.get()).unwrap_or(0) as *const c_void;
            let hwnd = window.hwnd.get() as *const c_void;
            let create_info = vk::Win32SurfaceCreateInfoKHR::builder().hinstance(hinstance).hwnd(hwnd);
            ash::extensions::khr::Win32Surface::new(entry, instance).create_win32_surface(&create_info, None)?
        }
        (display, window) => bail!("Unsupported platform handle pair {:?} / {:?}", display, window),
    };
    Ok(surface)
}

// Validation output goes through the renderer's log callback
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    p_user_data: *mut c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || p_user_data.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message).to_string_lossy();
    let messenger = &*(p_user_data as *const Messenger);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => messenger.error("vulkan", &message),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => messenger.warn("vulkan", &message),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => messenger.info("vulkan", &message),
        _ => messenger.debug("vulkan", &message),
    }

    vk::FALSE
}
