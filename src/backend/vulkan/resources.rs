// Buffers, images and samplers
//
// Memory comes from gpu-allocator; host-visible allocations stay mapped for
// their whole lifetime and the mapping is handed to the neutral layer.

use anyhow::{bail, Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::{conv, BufferEntry, TextureEntry, VulkanBackend};
use crate::backend::{BufferAllocation, BufferKey, SamplerKey, TextureAllocation, TextureKey};
use crate::format::Format;
use crate::resource::{BufferDesc, SamplerDesc, TextureDesc};
use crate::types::{BufferUsage, TextureType};

impl VulkanBackend {
    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation> {
        let mut allocator = self.allocator.lock();
        let allocator = allocator.as_mut().context("Allocator already destroyed")?;
        allocator
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .with_context(|| format!("Failed to allocate memory for {}", name))
    }

    fn free(&self, allocation: Allocation) {
        if let Some(allocator) = self.allocator.lock().as_mut() {
            if let Err(e) = allocator.free(allocation) {
                log::error!("Failed to free GPU memory: {}", e);
            }
        }
    }

    pub(super) fn create_buffer_impl(&self, desc: &BufferDesc) -> Result<BufferAllocation> {
        let device = &self.device.device;

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(desc.size)
            .usage(conv::buffer_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.create_buffer(&buffer_info, None) }.context("Failed to create buffer")?;

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let allocation = match self.allocate("buffer", requirements, conv::memory_location(desc.location), true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe { device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) } {
            unsafe { device.destroy_buffer(buffer, None) };
            self.free(allocation);
            return Err(e).context("Failed to bind buffer memory");
        }

        let texel_usage = BufferUsage::UNIFORM_TEXEL_SRV | BufferUsage::STORAGE_TEXEL_UAV;
        let texel_view = if desc.usage.intersects(texel_usage) && desc.format != Format::Undefined {
            let stride = desc.format.stride() as u64;
            let view_info = vk::BufferViewCreateInfo::builder()
                .buffer(buffer)
                .format(conv::format(desc.format))
                .offset(desc.first_element * stride)
                .range(if desc.element_count > 0 {
                    desc.element_count * stride
                } else {
                    vk::WHOLE_SIZE
                });
            Some(unsafe { device.create_buffer_view(&view_info, None) }.context("Failed to create texel buffer view")?)
        } else {
            None
        };

        let mapped = allocation.mapped_ptr().map(|ptr| ptr.cast::<u8>());
        let key = self.registry.lock().buffers.insert(BufferEntry {
            buffer,
            allocation: Some(allocation),
            texel_view,
        });
        log::debug!("Created buffer {:?}: {} bytes, {:?}", key, desc.size, desc.usage);
        Ok(BufferAllocation { key, mapped })
    }

    pub(super) fn destroy_buffer_impl(&self, key: BufferKey) {
        let Some(entry) = self.registry.lock().buffers.remove(key) else { return };
        unsafe {
            if let Some(view) = entry.texel_view {
                self.device.device.destroy_buffer_view(view, None);
            }
            self.device.device.destroy_buffer(entry.buffer, None);
        }
        if let Some(allocation) = entry.allocation {
            self.free(allocation);
        }
    }

    pub(super) fn create_texture_impl(&self, desc: &TextureDesc) -> Result<TextureAllocation> {
        let device = &self.device.device;
        let (image_type, view_type) = conv::image_type(desc.texture_type);
        let (height, depth) = match desc.texture_type {
            TextureType::Tex1D => (1, 1),
            TextureType::Tex2D => (desc.height, 1),
            TextureType::Tex3D => (desc.height, desc.depth),
        };
        let tiling = if desc.host_visible {
            vk::ImageTiling::LINEAR
        } else {
            vk::ImageTiling::OPTIMAL
        };

        let image_info = vk::ImageCreateInfo::builder()
            .image_type(image_type)
            .format(conv::format(desc.format))
            .extent(vk::Extent3D {
                width: desc.width,
                height,
                depth,
            })
            .mip_levels(desc.mip_levels.max(1))
            .array_layers(1)
            .samples(conv::sample_count(desc.sample_count))
            .tiling(tiling)
            .usage(conv::texture_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(if desc.host_visible {
                vk::ImageLayout::PREINITIALIZED
            } else {
                vk::ImageLayout::UNDEFINED
            });
        let image = unsafe { device.create_image(&image_info, None) }.context("Failed to create image")?;

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let location = if desc.host_visible {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        };
        let allocation = match self.allocate("texture", requirements, location, desc.host_visible) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e);
            }
        };
        if let Err(e) = unsafe { device.bind_image_memory(image, allocation.memory(), allocation.offset()) } {
            unsafe { device.destroy_image(image, None) };
            self.free(allocation);
            return Err(e).context("Failed to bind image memory");
        }

        let view = match self.create_view(image, view_type, desc.format, desc.mip_levels.max(1)) {
            Ok(view) => view,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                self.free(allocation);
                return Err(e);
            }
        };

        let mapped = allocation.mapped_ptr().map(|ptr| ptr.cast::<u8>());
        let key = self.registry.lock().textures.insert(TextureEntry {
            image,
            view,
            allocation: Some(allocation),
            format: desc.format,
            swapchain: false,
        });
        log::debug!(
            "Created texture {:?}: {}x{}x{} {}",
            key,
            desc.width,
            height,
            depth,
            desc.format
        );
        Ok(TextureAllocation { key, mapped })
    }

    fn create_view(
        &self,
        image: vk::Image,
        view_type: vk::ImageViewType,
        format: Format,
        mip_levels: u32,
    ) -> Result<vk::ImageView> {
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(view_type)
            .format(conv::format(format))
            .components(vk::ComponentMapping::default())
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: conv::aspect_mask(format),
                base_mip_level: 0,
                level_count: mip_levels,
                base_array_layer: 0,
                layer_count: 1,
            });
        unsafe { self.device.device.create_image_view(&view_info, None) }.context("Failed to create image view")
    }

    pub(super) fn destroy_texture_impl(&self, key: TextureKey) {
        let mut registry = self.registry.lock();
        if registry.textures.get(key).is_some_and(|t| t.swapchain) {
            return;
        }
        let Some(entry) = registry.textures.remove(key) else { return };
        drop(registry);
        unsafe {
            self.device.device.destroy_image_view(entry.view, None);
            self.device.device.destroy_image(entry.image, None);
        }
        if let Some(allocation) = entry.allocation {
            self.free(allocation);
        }
    }

    /// Wrap the swapchain's images so render targets can reference them
    pub(super) fn register_swapchain_images(&self) -> Result<Vec<TextureKey>> {
        let format = self.swapchain.format;
        let mut keys = Vec::with_capacity(self.swapchain.images.len());
        for &image in &self.swapchain.images {
            let view = self.create_view(image, vk::ImageViewType::TYPE_2D, format, 1)?;
            keys.push(self.registry.lock().textures.insert(TextureEntry {
                image,
                view,
                allocation: None,
                format,
                swapchain: true,
            }));
        }
        Ok(keys)
    }

    pub(super) fn create_sampler_impl(&self, desc: &SamplerDesc) -> Result<SamplerKey> {
        if desc.max_anisotropy < 0.0 {
            bail!("Negative max anisotropy {}", desc.max_anisotropy);
        }
        let max_anisotropy = desc
            .max_anisotropy
            .min(self.device.properties.limits.max_sampler_anisotropy);
        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(conv::filter(desc.mag_filter))
            .min_filter(conv::filter(desc.min_filter))
            .mipmap_mode(conv::mipmap_mode(desc.mipmap_mode))
            .address_mode_u(conv::address_mode(desc.address_u))
            .address_mode_v(conv::address_mode(desc.address_v))
            .address_mode_w(conv::address_mode(desc.address_w))
            .mip_lod_bias(desc.mip_lod_bias)
            .anisotropy_enable(max_anisotropy > 0.0)
            .max_anisotropy(max_anisotropy.max(1.0))
            .compare_enable(false)
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE)
            .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK);
        let sampler =
            unsafe { self.device.device.create_sampler(&sampler_info, None) }.context("Failed to create sampler")?;
        Ok(self.registry.lock().samplers.insert(sampler))
    }
}
