// Vulkan backend
//
// Layout:
//   device.rs     instance, surface, physical/logical device
//   swapchain.rs  VkSwapchainKHR + acquire/present
//   resources.rs  buffers, images, samplers (gpu-allocator)
//   pipeline.rs   shaders, descriptor sets, render passes, pipelines
//   command.rs    Command -> vkCmd* translation
//   conv.rs       neutral -> vk enums
//
// Every native object lives in one registry behind a mutex. Submission
// serials come from one timeline semaphore per queue kind.

mod command;
pub mod conv;
mod device;
mod pipeline;
mod resources;
mod swapchain;

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, Allocator};
use parking_lot::Mutex;
use slotmap::SlotMap;
use std::any::Any;
use std::ffi::CString;

use super::{
    BufferAllocation, BufferKey, CmdKey, CmdPoolKey, Command, DescriptorSetKey, DescriptorWrite, FenceKey,
    GraphicsBackend, GraphicsPipelineDesc, PipelineKey, RenderPassKey, RenderTargetAttachments, RenderTargetKey,
    SamplerKey, SemaphoreKey, ShaderKey, SubmitInfo, SwapchainImages, TextureAllocation, TextureKey,
};
use super::BackendLimits;
use crate::config::{BackendKind, RendererSettings};
use crate::descriptor::DescriptorBinding;
use crate::format::Format;
use crate::logging::Messenger;
use crate::render_target::RenderPassDesc;
use crate::resource::{BufferDesc, SamplerDesc, TextureDesc};
use crate::shader::ShaderProgramDesc;
use crate::types::QueueKind;

use device::VulkanDevice;
use swapchain::Swapchain;

struct BufferEntry {
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    texel_view: Option<vk::BufferView>,
}

struct TextureEntry {
    image: vk::Image,
    view: vk::ImageView,
    allocation: Option<Allocation>,
    format: Format,
    /// Owned by the swapchain; only the view is ours
    swapchain: bool,
}

struct ShaderStage {
    stage: vk::ShaderStageFlags,
    module: vk::ShaderModule,
    entry_point: CString,
}

struct DescriptorSetEntry {
    layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    set: vk::DescriptorSet,
    bindings: Vec<DescriptorBinding>,
}

struct RenderPassEntry {
    render_pass: vk::RenderPass,
    desc: RenderPassDesc,
}

struct RenderTargetEntry {
    framebuffer: vk::Framebuffer,
    extent: vk::Extent2D,
}

struct PipelineEntry {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    bind_point: vk::PipelineBindPoint,
}

struct CmdPoolEntry {
    pool: vk::CommandPool,
    cmds: Vec<CmdKey>,
}

/// Render pass currently open on a command buffer
struct OpenPass {
    extent: vk::Extent2D,
    color_formats: Vec<Format>,
    depth_stencil_format: Format,
}

struct CmdEntry {
    cmd: vk::CommandBuffer,
    pass: Option<OpenPass>,
}

#[derive(Default)]
struct Registry {
    buffers: SlotMap<BufferKey, BufferEntry>,
    textures: SlotMap<TextureKey, TextureEntry>,
    samplers: SlotMap<SamplerKey, vk::Sampler>,
    shaders: SlotMap<ShaderKey, Vec<ShaderStage>>,
    descriptor_sets: SlotMap<DescriptorSetKey, DescriptorSetEntry>,
    render_passes: SlotMap<RenderPassKey, RenderPassEntry>,
    render_targets: SlotMap<RenderTargetKey, RenderTargetEntry>,
    pipelines: SlotMap<PipelineKey, PipelineEntry>,
    cmd_pools: SlotMap<CmdPoolKey, CmdPoolEntry>,
    cmds: SlotMap<CmdKey, CmdEntry>,
    fences: SlotMap<FenceKey, vk::Fence>,
    semaphores: SlotMap<SemaphoreKey, vk::Semaphore>,
}

/// One timeline semaphore per queue kind; its value is the completed serial
struct Timeline {
    queue: vk::Queue,
    family: u32,
    semaphore: vk::Semaphore,
    last_submitted: u64,
}

pub struct VulkanBackend {
    registry: Mutex<Registry>,
    timelines: Mutex<[Timeline; 2]>,
    swapchain: Swapchain,
    swapchain_images: Vec<TextureKey>,
    allocator: Mutex<Option<Allocator>>,
    limits: BackendLimits,
    messenger: Messenger,
    device: VulkanDevice,
}

fn queue_index(queue: QueueKind) -> usize {
    match queue {
        QueueKind::Graphics => 0,
        QueueKind::Present => 1,
    }
}

impl VulkanBackend {
    pub fn new(app_name: &str, settings: &RendererSettings, messenger: Messenger) -> Result<Self> {
        let device = VulkanDevice::new(app_name, settings, messenger.clone())?;
        let allocator = device.create_allocator()?;
        let swapchain = Swapchain::new(&device, &settings.swapchain, settings.width, settings.height)?;

        let timelines = [
            Self::create_timeline(&device, device.graphics_queue, device.graphics_queue_family)?,
            Self::create_timeline(&device, device.present_queue, device.present_queue_family)?,
        ];

        let vk_limits = &device.properties.limits;
        let limits = BackendLimits {
            uniform_buffer_alignment: vk_limits.min_uniform_buffer_offset_alignment.max(1),
            texture_row_pitch_alignment: 1,
            max_color_attachments: vk_limits.max_color_attachments.min(8),
        };

        let mut backend = Self {
            registry: Mutex::new(Registry::default()),
            timelines: Mutex::new(timelines),
            swapchain,
            swapchain_images: Vec::new(),
            allocator: Mutex::new(Some(allocator)),
            limits,
            messenger,
            device,
        };
        backend.swapchain_images = backend.register_swapchain_images()?;
        Ok(backend)
    }

    fn create_timeline(device: &VulkanDevice, queue: vk::Queue, family: u32) -> Result<Timeline> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let create_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);
        let semaphore = unsafe { device.device.create_semaphore(&create_info, None) }
            .context("Failed to create timeline semaphore")?;
        Ok(Timeline {
            queue,
            family,
            semaphore,
            last_submitted: 0,
        })
    }

    fn queue_family(&self, queue: QueueKind) -> u32 {
        self.timelines.lock()[queue_index(queue)].family
    }

    fn report(&self, message: &str) {
        self.messenger.error("vulkan", message);
    }
}

impl GraphicsBackend for VulkanBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Vulkan
    }

    fn limits(&self) -> BackendLimits {
        self.limits
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn swapchain_images(&self) -> SwapchainImages {
        SwapchainImages {
            images: self.swapchain_images.clone(),
            format: self.swapchain.format,
            width: self.swapchain.extent.width,
            height: self.swapchain.extent.height,
        }
    }

    fn acquire_next_image(&self, signal: Option<SemaphoreKey>, fence: Option<FenceKey>) -> Result<u32> {
        let (semaphore, fence) = {
            let registry = self.registry.lock();
            let semaphore = match signal {
                Some(key) => *registry.semaphores.get(key).context("Unknown acquire semaphore")?,
                None => vk::Semaphore::null(),
            };
            let fence = match fence {
                Some(key) => *registry.fences.get(key).context("Unknown acquire fence")?,
                None => vk::Fence::null(),
            };
            (semaphore, fence)
        };
        self.swapchain.acquire_next_image(semaphore, fence)
    }

    fn queue_present(&self, queue: QueueKind, image_index: u32, wait: &[SemaphoreKey]) -> Result<()> {
        let semaphores = {
            let registry = self.registry.lock();
            wait.iter()
                .map(|&key| registry.semaphores.get(key).copied().context("Unknown present semaphore"))
                .collect::<Result<Vec<_>>>()?
        };
        let timelines = self.timelines.lock();
        self.swapchain
            .present(timelines[queue_index(queue)].queue, image_index, &semaphores)
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferAllocation> {
        self.create_buffer_impl(desc)
    }

    fn destroy_buffer(&self, key: BufferKey) {
        self.destroy_buffer_impl(key)
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureAllocation> {
        self.create_texture_impl(desc)
    }

    fn destroy_texture(&self, key: TextureKey) {
        self.destroy_texture_impl(key)
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<SamplerKey> {
        self.create_sampler_impl(desc)
    }

    fn destroy_sampler(&self, key: SamplerKey) {
        if let Some(sampler) = self.registry.lock().samplers.remove(key) {
            unsafe { self.device.device.destroy_sampler(sampler, None) };
        }
    }

    fn create_shader_program(&self, desc: &ShaderProgramDesc) -> Result<ShaderKey> {
        self.create_shader_program_impl(desc)
    }

    fn destroy_shader_program(&self, key: ShaderKey) {
        if let Some(stages) = self.registry.lock().shaders.remove(key) {
            for stage in stages {
                unsafe { self.device.device.destroy_shader_module(stage.module, None) };
            }
        }
    }

    fn create_descriptor_set(&self, bindings: &[DescriptorBinding]) -> Result<DescriptorSetKey> {
        self.create_descriptor_set_impl(bindings)
    }

    fn destroy_descriptor_set(&self, key: DescriptorSetKey) {
        if let Some(entry) = self.registry.lock().descriptor_sets.remove(key) {
            unsafe {
                // destroying the pool frees the set
                self.device.device.destroy_descriptor_pool(entry.pool, None);
                self.device.device.destroy_descriptor_set_layout(entry.layout, None);
            }
        }
    }

    fn update_descriptor_set(&self, key: DescriptorSetKey, writes: &[DescriptorWrite]) -> Result<()> {
        self.update_descriptor_set_impl(key, writes)
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> Result<RenderPassKey> {
        self.create_render_pass_impl(desc)
    }

    fn destroy_render_pass(&self, key: RenderPassKey) {
        if let Some(entry) = self.registry.lock().render_passes.remove(key) {
            unsafe { self.device.device.destroy_render_pass(entry.render_pass, None) };
        }
    }

    fn create_render_target(
        &self,
        render_pass: RenderPassKey,
        attachments: &RenderTargetAttachments,
    ) -> Result<RenderTargetKey> {
        self.create_render_target_impl(render_pass, attachments)
    }

    fn destroy_render_target(&self, key: RenderTargetKey) {
        if let Some(entry) = self.registry.lock().render_targets.remove(key) {
            unsafe { self.device.device.destroy_framebuffer(entry.framebuffer, None) };
        }
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc<'_>) -> Result<PipelineKey> {
        self.create_graphics_pipeline_impl(desc)
    }

    fn create_compute_pipeline(&self, shader: ShaderKey, descriptor_set: Option<DescriptorSetKey>) -> Result<PipelineKey> {
        self.create_compute_pipeline_impl(shader, descriptor_set)
    }

    fn destroy_pipeline(&self, key: PipelineKey) {
        if let Some(entry) = self.registry.lock().pipelines.remove(key) {
            unsafe {
                self.device.device.destroy_pipeline(entry.pipeline, None);
                self.device.device.destroy_pipeline_layout(entry.layout, None);
            }
        }
    }

    fn create_cmd_pool(&self, queue: QueueKind) -> Result<CmdPoolKey> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(self.queue_family(queue))
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe { self.device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;
        Ok(self.registry.lock().cmd_pools.insert(CmdPoolEntry { pool, cmds: Vec::new() }))
    }

    fn destroy_cmd_pool(&self, key: CmdPoolKey) {
        let mut registry = self.registry.lock();
        if let Some(entry) = registry.cmd_pools.remove(key) {
            for cmd in entry.cmds {
                registry.cmds.remove(cmd);
            }
            unsafe { self.device.device.destroy_command_pool(entry.pool, None) };
        }
    }

    fn allocate_cmd(&self, pool: CmdPoolKey) -> Result<CmdKey> {
        let mut registry = self.registry.lock();
        let vk_pool = registry.cmd_pools.get(pool).context("Unknown command pool")?.pool;
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(vk_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffer")?[0];
        let key = registry.cmds.insert(CmdEntry { cmd, pass: None });
        if let Some(entry) = registry.cmd_pools.get_mut(pool) {
            entry.cmds.push(key);
        }
        Ok(key)
    }

    fn free_cmd(&self, pool: CmdPoolKey, key: CmdKey) {
        let mut registry = self.registry.lock();
        let Some(entry) = registry.cmds.remove(key) else { return };
        if let Some(pool_entry) = registry.cmd_pools.get_mut(pool) {
            pool_entry.cmds.retain(|&k| k != key);
            unsafe { self.device.device.free_command_buffers(pool_entry.pool, &[entry.cmd]) };
        }
    }

    fn begin_cmd(&self, key: CmdKey) -> Result<()> {
        let mut registry = self.registry.lock();
        let entry = registry.cmds.get_mut(key).context("Unknown command buffer")?;
        entry.pass = None;
        let begin_info = vk::CommandBufferBeginInfo::builder();
        unsafe {
            self.device
                .device
                .reset_command_buffer(entry.cmd, vk::CommandBufferResetFlags::empty())
                .context("Failed to reset command buffer")?;
            self.device
                .device
                .begin_command_buffer(entry.cmd, &begin_info)
                .context("Failed to begin command buffer")?;
        }
        Ok(())
    }

    fn end_cmd(&self, key: CmdKey) -> Result<()> {
        let registry = self.registry.lock();
        let entry = registry.cmds.get(key).context("Unknown command buffer")?;
        unsafe { self.device.device.end_command_buffer(entry.cmd) }.context("Failed to end command buffer")?;
        Ok(())
    }

    fn record(&self, key: CmdKey, command: &Command) {
        let mut registry = self.registry.lock();
        self.record_impl(&mut registry, key, command);
    }

    fn create_fence(&self, signaled: bool) -> Result<FenceKey> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence_info = vk::FenceCreateInfo::builder().flags(flags);
        let fence = unsafe { self.device.device.create_fence(&fence_info, None) }.context("Failed to create fence")?;
        Ok(self.registry.lock().fences.insert(fence))
    }

    fn destroy_fence(&self, key: FenceKey) {
        if let Some(fence) = self.registry.lock().fences.remove(key) {
            unsafe { self.device.device.destroy_fence(fence, None) };
        }
    }

    fn wait_for_fences(&self, fences: &[FenceKey]) -> Result<()> {
        let fences = self.lookup_fences(fences)?;
        unsafe { self.device.device.wait_for_fences(&fences, true, u64::MAX) }.context("vkWaitForFences failed")?;
        Ok(())
    }

    fn reset_fences(&self, fences: &[FenceKey]) -> Result<()> {
        let fences = self.lookup_fences(fences)?;
        unsafe { self.device.device.reset_fences(&fences) }.context("vkResetFences failed")?;
        Ok(())
    }

    fn fence_signaled(&self, key: FenceKey) -> Result<bool> {
        let fence = *self.registry.lock().fences.get(key).context("Unknown fence")?;
        unsafe { self.device.device.get_fence_status(fence) }.context("vkGetFenceStatus failed")
    }

    fn create_semaphore(&self) -> Result<SemaphoreKey> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let semaphore = unsafe { self.device.device.create_semaphore(&semaphore_info, None) }
            .context("Failed to create semaphore")?;
        Ok(self.registry.lock().semaphores.insert(semaphore))
    }

    fn destroy_semaphore(&self, key: SemaphoreKey) {
        if let Some(semaphore) = self.registry.lock().semaphores.remove(key) {
            unsafe { self.device.device.destroy_semaphore(semaphore, None) };
        }
    }

    fn queue_submit(&self, queue: QueueKind, submit: &SubmitInfo<'_>) -> Result<u64> {
        let (cmds, waits, mut signals, fence) = {
            let registry = self.registry.lock();
            let cmds = submit
                .cmds
                .iter()
                .map(|&k| registry.cmds.get(k).map(|c| c.cmd).context("Unknown command buffer"))
                .collect::<Result<Vec<_>>>()?;
            let waits = submit
                .wait_semaphores
                .iter()
                .map(|&k| registry.semaphores.get(k).copied().context("Unknown wait semaphore"))
                .collect::<Result<Vec<_>>>()?;
            let signals = submit
                .signal_semaphores
                .iter()
                .map(|&k| registry.semaphores.get(k).copied().context("Unknown signal semaphore"))
                .collect::<Result<Vec<_>>>()?;
            let fence = match submit.fence {
                Some(k) => *registry.fences.get(k).context("Unknown submit fence")?,
                None => vk::Fence::null(),
            };
            (cmds, waits, signals, fence)
        };

        let mut timelines = self.timelines.lock();
        let timeline = &mut timelines[queue_index(queue)];
        let serial = timeline.last_submitted + 1;

        signals.push(timeline.semaphore);
        let mut signal_values = vec![0u64; signals.len()];
        signal_values[signals.len() - 1] = serial;
        let wait_values = vec![0u64; waits.len()];
        let wait_stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; waits.len()];

        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::builder()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&waits)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&cmds)
            .signal_semaphores(&signals)
            .push_next(&mut timeline_info)
            .build();

        unsafe { self.device.device.queue_submit(timeline.queue, &[submit_info], fence) }
            .context("vkQueueSubmit failed")?;
        timeline.last_submitted = serial;
        Ok(serial)
    }

    fn completed_serial(&self, queue: QueueKind) -> u64 {
        let semaphore = self.timelines.lock()[queue_index(queue)].semaphore;
        unsafe { self.device.device.get_semaphore_counter_value(semaphore) }.unwrap_or_else(|e| {
            log::error!("vkGetSemaphoreCounterValue failed: {}", e);
            0
        })
    }

    fn queue_wait_idle(&self, queue: QueueKind) -> Result<()> {
        let timelines = self.timelines.lock();
        unsafe { self.device.device.queue_wait_idle(timelines[queue_index(queue)].queue) }
            .context("vkQueueWaitIdle failed")?;
        Ok(())
    }

    fn device_wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }
}

impl VulkanBackend {
    fn lookup_fences(&self, keys: &[FenceKey]) -> Result<Vec<vk::Fence>> {
        let registry = self.registry.lock();
        keys.iter()
            .map(|&key| registry.fences.get(key).copied().context("Unknown fence"))
            .collect()
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan backend...");
        let _ = self.device.wait_idle();

        let registry = std::mem::take(&mut *self.registry.lock());
        let mut allocator = self.allocator.lock().take();
        let device = &self.device.device;

        unsafe {
            for (_, entry) in registry.pipelines {
                device.destroy_pipeline(entry.pipeline, None);
                device.destroy_pipeline_layout(entry.layout, None);
            }
            for (_, entry) in registry.render_targets {
                device.destroy_framebuffer(entry.framebuffer, None);
            }
            for (_, entry) in registry.render_passes {
                device.destroy_render_pass(entry.render_pass, None);
            }
            for (_, entry) in registry.descriptor_sets {
                device.destroy_descriptor_pool(entry.pool, None);
                device.destroy_descriptor_set_layout(entry.layout, None);
            }
            for (_, stages) in registry.shaders {
                for stage in stages {
                    device.destroy_shader_module(stage.module, None);
                }
            }
            for (_, sampler) in registry.samplers {
                device.destroy_sampler(sampler, None);
            }
            for (_, entry) in registry.cmd_pools {
                device.destroy_command_pool(entry.pool, None);
            }
            for (_, fence) in registry.fences {
                device.destroy_fence(fence, None);
            }
            for (_, semaphore) in registry.semaphores {
                device.destroy_semaphore(semaphore, None);
            }
            for (_, entry) in registry.textures {
                device.destroy_image_view(entry.view, None);
                if !entry.swapchain {
                    device.destroy_image(entry.image, None);
                }
                if let (Some(allocation), Some(allocator)) = (entry.allocation, allocator.as_mut()) {
                    let _ = allocator.free(allocation);
                }
            }
            for (_, entry) in registry.buffers {
                if let Some(view) = entry.texel_view {
                    device.destroy_buffer_view(view, None);
                }
                device.destroy_buffer(entry.buffer, None);
                if let (Some(allocation), Some(allocator)) = (entry.allocation, allocator.as_mut()) {
                    let _ = allocator.free(allocation);
                }
            }
            for timeline in self.timelines.lock().iter() {
                device.destroy_semaphore(timeline.semaphore, None);
            }

            // the allocator must go before the device it allocates from
            drop(allocator);
            self.swapchain.destroy();
            self.device.destroy();
        }
    }
}
