// Swapchain - window presentation
//
// The image count, color format and present mode come from the renderer
// settings; the driver may still hand back more images than requested, and
// every image it returns becomes a frame slot.

use anyhow::{bail, Context, Result};
use ash::vk;

use super::conv;
use super::device::VulkanDevice;
use crate::config::{PresentMode, SwapchainSettings};
use crate::format::Format;

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub loader: ash::extensions::khr::Swapchain,
    pub images: Vec<vk::Image>,
    pub format: Format,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    pub fn new(device: &VulkanDevice, settings: &SwapchainSettings, width: u32, height: u32) -> Result<Self> {
        log::info!("Creating swapchain: {}x{}", width, height);

        let surface_caps = unsafe {
            device
                .surface_loader
                .get_physical_device_surface_capabilities(device.physical_device, device.surface)
        }?;
        let formats = unsafe {
            device
                .surface_loader
                .get_physical_device_surface_formats(device.physical_device, device.surface)
        }?;
        let present_modes = unsafe {
            device
                .surface_loader
                .get_physical_device_surface_present_modes(device.physical_device, device.surface)
        }?;

        let wanted = conv::format(settings.color_format);
        let surface_format = formats
            .iter()
            .find(|f| f.format == wanted)
            .with_context(|| format!("Surface does not support {}", settings.color_format))?;

        let present_mode = present_mode(settings.present_mode);
        let present_mode = if present_modes.contains(&present_mode) {
            present_mode
        } else {
            log::warn!("Present mode {:?} unsupported, falling back to FIFO", settings.present_mode);
            vk::PresentModeKHR::FIFO
        };
        log::info!("Present mode: {:?}", present_mode);

        let extent = if surface_caps.current_extent.width != u32::MAX {
            surface_caps.current_extent
        } else {
            vk::Extent2D {
                width: width.clamp(surface_caps.min_image_extent.width, surface_caps.max_image_extent.width),
                height: height.clamp(surface_caps.min_image_extent.height, surface_caps.max_image_extent.height),
            }
        };

        let mut image_count = settings.image_count.max(surface_caps.min_image_count);
        if surface_caps.max_image_count > 0 && image_count > surface_caps.max_image_count {
            image_count = surface_caps.max_image_count;
        }

        let (sharing_mode, families) = if device.graphics_queue_family == device.present_queue_family {
            (vk::SharingMode::EXCLUSIVE, vec![])
        } else {
            (
                vk::SharingMode::CONCURRENT,
                vec![device.graphics_queue_family, device.present_queue_family],
            )
        };

        let loader = ash::extensions::khr::Swapchain::new(&device.instance, &device.device);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(device.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&families)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let swapchain =
            unsafe { loader.create_swapchain(&create_info, None) }.context("Failed to create swapchain")?;

        let images = unsafe { loader.get_swapchain_images(swapchain) }?;
        if images.len() as u32 != settings.image_count {
            log::warn!(
                "Requested {} swapchain images, driver created {}",
                settings.image_count,
                images.len()
            );
        }
        log::info!("Created swapchain with {} images", images.len());

        Ok(Self {
            swapchain,
            loader,
            images,
            format: settings.color_format,
            extent,
        })
    }

    pub fn acquire_next_image(&self, semaphore: vk::Semaphore, fence: vk::Fence) -> Result<u32> {
        let result = unsafe { self.loader.acquire_next_image(self.swapchain, u64::MAX, semaphore, fence) };

        match result {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    log::debug!("Swapchain suboptimal");
                }
                Ok(index)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => bail!("Swapchain out of date"),
            Err(e) => Err(e).context("vkAcquireNextImageKHR failed"),
        }
    }

    pub fn present(&self, queue: vk::Queue, image_index: u32, wait_semaphores: &[vk::Semaphore]) -> Result<()> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.loader.queue_present(queue, &present_info) } {
            Ok(_suboptimal) => Ok(()),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => bail!("Swapchain out of date"),
            Err(e) => Err(e).context("vkQueuePresentKHR failed"),
        }
    }

    pub unsafe fn destroy(&mut self) {
        self.loader.destroy_swapchain(self.swapchain, None);
    }
}

fn present_mode(mode: PresentMode) -> vk::PresentModeKHR {
    match mode {
        PresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
        PresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentMode::Fifo => vk::PresentModeKHR::FIFO,
        PresentMode::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
    }
}
