// Direct3D12 backend
//
// Layout:
//   device.rs           factory, adapter, device, queue, info queue
//   swapchain.rs        DXGI flip-model swapchain
//   descriptor_heap.rs  staging and shader-visible descriptor heaps
//   resources.rs        committed buffers and textures, views, samplers
//   pipeline.rs         shaders, descriptor sets, root signatures, PSOs
//   command.rs          Command -> ID3D12GraphicsCommandList translation
//   conv.rs             neutral -> D3D12/DXGI enums
//
// Fences, semaphores and submission serials are all ID3D12Fence values.
// Graphics and present both submit to the single direct queue.

mod command;
pub mod conv;
mod descriptor_heap;
mod device;
mod pipeline;
mod resources;
mod swapchain;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use slotmap::SlotMap;
use std::any::Any;
use windows::core::ComInterface;
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::Graphics::Direct3D::D3D_PRIMITIVE_TOPOLOGY;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::System::Threading::{CreateEventA, WaitForSingleObject, INFINITE};

use super::{
    BackendLimits, BufferAllocation, BufferKey, CmdKey, CmdPoolKey, Command, DescriptorSetKey, DescriptorWrite,
    FenceKey, GraphicsBackend, GraphicsPipelineDesc, PipelineKey, RenderPassKey, RenderTargetAttachments,
    RenderTargetKey, SamplerKey, SemaphoreKey, ShaderKey, SubmitInfo, SwapchainImages, TextureAllocation, TextureKey,
};
use crate::config::{BackendKind, RendererSettings};
use crate::descriptor::DescriptorBinding;
use crate::format::Format;
use crate::logging::Messenger;
use crate::render_target::RenderPassDesc;
use crate::resource::{BufferDesc, SamplerDesc, TextureDesc};
use crate::shader::ShaderProgramDesc;
use crate::types::{QueueKind, ShaderStages};

use descriptor_heap::Heaps;
use device::D3D12Device;
use swapchain::Swapchain;

/// Staging views of one resource
#[derive(Default, Clone, Copy)]
struct Views {
    cbv: Option<D3D12_CPU_DESCRIPTOR_HANDLE>,
    srv: Option<D3D12_CPU_DESCRIPTOR_HANDLE>,
    uav: Option<D3D12_CPU_DESCRIPTOR_HANDLE>,
    rtv: Option<D3D12_CPU_DESCRIPTOR_HANDLE>,
    dsv: Option<D3D12_CPU_DESCRIPTOR_HANDLE>,
}

struct BufferEntry {
    resource: ID3D12Resource,
    /// Upload and readback buffers stay in their heap's state
    pinned_state: bool,
    views: Views,
}

struct TextureEntry {
    resource: ID3D12Resource,
    format: Format,
    views: Views,
    swapchain: bool,
}

struct ShaderStage {
    stage: ShaderStages,
    bytecode: Vec<u8>,
}

/// Contiguous range of a shader-visible heap
#[derive(Clone, Copy)]
struct HeapRange {
    offset: u32,
    count: u32,
}

struct DescriptorSetEntry {
    bindings: Vec<DescriptorBinding>,
    /// Per binding: offset into the view or sampler table
    table_offsets: Vec<u32>,
    view_ranges: Vec<D3D12_DESCRIPTOR_RANGE>,
    sampler_ranges: Vec<D3D12_DESCRIPTOR_RANGE>,
    views: Option<HeapRange>,
    samplers: Option<HeapRange>,
}

struct RenderTargetEntry {
    width: u32,
    height: u32,
    colors: Vec<TextureKey>,
    resolves: Vec<TextureKey>,
    depth_stencil: Option<TextureKey>,
}

struct PipelineEntry {
    pipeline: ID3D12PipelineState,
    root_signature: ID3D12RootSignature,
    compute: bool,
    topology: D3D_PRIMITIVE_TOPOLOGY,
    view_table: Option<u32>,
    sampler_table: Option<u32>,
}

struct CmdPoolEntry {
    cmds: Vec<CmdKey>,
}

/// Render pass currently open on a command list
struct OpenPass {
    rtvs: Vec<D3D12_CPU_DESCRIPTOR_HANDLE>,
    dsv: Option<(D3D12_CPU_DESCRIPTOR_HANDLE, Format)>,
    colors: Vec<ID3D12Resource>,
    resolves: Vec<(ID3D12Resource, Format)>,
}

struct CmdEntry {
    allocator: ID3D12CommandAllocator,
    list: ID3D12GraphicsCommandList,
    pass: Option<OpenPass>,
}

/// Host fence: signaled once the native fence reaches `target`
struct FenceEntry {
    fence: ID3D12Fence,
    target: u64,
}

/// Binary semaphore emulated with a monotonically increasing fence value
struct SemaphoreEntry {
    fence: ID3D12Fence,
    value: u64,
}

#[derive(Default)]
struct Registry {
    buffers: SlotMap<BufferKey, BufferEntry>,
    textures: SlotMap<TextureKey, TextureEntry>,
    samplers: SlotMap<SamplerKey, D3D12_CPU_DESCRIPTOR_HANDLE>,
    shaders: SlotMap<ShaderKey, Vec<ShaderStage>>,
    descriptor_sets: SlotMap<DescriptorSetKey, DescriptorSetEntry>,
    render_passes: SlotMap<RenderPassKey, RenderPassDesc>,
    render_targets: SlotMap<RenderTargetKey, RenderTargetEntry>,
    pipelines: SlotMap<PipelineKey, PipelineEntry>,
    cmd_pools: SlotMap<CmdPoolKey, CmdPoolEntry>,
    cmds: SlotMap<CmdKey, CmdEntry>,
    fences: SlotMap<FenceKey, FenceEntry>,
    semaphores: SlotMap<SemaphoreKey, SemaphoreEntry>,
}

struct Timeline {
    fence: ID3D12Fence,
    last_submitted: u64,
}

pub struct D3D12Backend {
    registry: Mutex<Registry>,
    heaps: Mutex<Heaps>,
    /// Serials per queue kind, then one fence for idle waits
    timelines: Mutex<[Timeline; 3]>,
    wait_event: Mutex<HANDLE>,
    swapchain: Swapchain,
    swapchain_images: Vec<TextureKey>,
    limits: BackendLimits,
    debug_shaders: bool,
    messenger: Messenger,
    device: D3D12Device,
}

const IDLE: usize = 2;

fn queue_index(queue: QueueKind) -> usize {
    match queue {
        QueueKind::Graphics => 0,
        QueueKind::Present => 1,
    }
}

impl D3D12Backend {
    pub fn new(_app_name: &str, settings: &RendererSettings, messenger: Messenger) -> Result<Self> {
        let handle = settings
            .handle
            .as_ref()
            .context("The D3D12 backend needs a platform window handle")?;
        let device = D3D12Device::new(settings)?;
        let swapchain = Swapchain::new(&device, handle, &settings.swapchain, settings.width, settings.height)?;
        let heaps = Heaps::new(&device.device)?;

        let timelines = [
            Self::create_timeline(&device.device)?,
            Self::create_timeline(&device.device)?,
            Self::create_timeline(&device.device)?,
        ];
        let wait_event = unsafe { CreateEventA(None, false, false, None) }.context("CreateEvent failed")?;

        let limits = BackendLimits {
            uniform_buffer_alignment: D3D12_CONSTANT_BUFFER_DATA_PLACEMENT_ALIGNMENT as u64,
            texture_row_pitch_alignment: D3D12_TEXTURE_DATA_PITCH_ALIGNMENT as u64,
            max_color_attachments: D3D12_SIMULTANEOUS_RENDER_TARGET_COUNT,
        };

        let mut backend = Self {
            registry: Mutex::new(Registry::default()),
            heaps: Mutex::new(heaps),
            timelines: Mutex::new(timelines),
            wait_event: Mutex::new(wait_event),
            swapchain,
            swapchain_images: Vec::new(),
            limits,
            debug_shaders: settings.validation,
            messenger,
            device,
        };
        backend.swapchain_images = backend.register_swapchain_images()?;
        log::info!("D3D12 backend ready on {}", backend.device.adapter_name);
        Ok(backend)
    }

    fn create_timeline(device: &ID3D12Device) -> Result<Timeline> {
        let fence: ID3D12Fence =
            unsafe { device.CreateFence(0, D3D12_FENCE_FLAG_NONE) }.context("Failed to create fence")?;
        Ok(Timeline {
            fence,
            last_submitted: 0,
        })
    }

    fn report(&self, message: &str) {
        self.messenger.error("d3d12", message);
    }

    /// Block until `fence` reaches `value`
    fn wait_fence_value(&self, fence: &ID3D12Fence, value: u64) -> Result<()> {
        if unsafe { fence.GetCompletedValue() } >= value {
            return Ok(());
        }
        let event = self.wait_event.lock();
        unsafe {
            fence
                .SetEventOnCompletion(value, *event)
                .context("SetEventOnCompletion failed")?;
            WaitForSingleObject(*event, INFINITE);
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let (fence, value) = {
            let mut timelines = self.timelines.lock();
            let idle = &mut timelines[IDLE];
            idle.last_submitted += 1;
            unsafe { self.device.queue.Signal(&idle.fence, idle.last_submitted) }.context("Queue signal failed")?;
            (idle.fence.clone(), idle.last_submitted)
        };
        self.wait_fence_value(&fence, value)
    }
}

impl GraphicsBackend for D3D12Backend {
    fn kind(&self) -> BackendKind {
        BackendKind::D3d12
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
            width: self.swapchain.width,
            height: self.swapchain.height,
        }
    }

    fn acquire_next_image(&self, signal: Option<SemaphoreKey>, fence: Option<FenceKey>) -> Result<u32> {
        let index = self.swapchain.current_image();
        // the image is usable right away, so signal from the host
        let mut registry = self.registry.lock();
        if let Some(key) = signal {
            let semaphore = registry.semaphores.get_mut(key).context("Unknown acquire semaphore")?;
            semaphore.value += 1;
            unsafe { semaphore.fence.Signal(semaphore.value) }.context("Semaphore signal failed")?;
        }
        if let Some(key) = fence {
            let fence = registry.fences.get(key).context("Unknown acquire fence")?;
            unsafe { fence.fence.Signal(fence.target) }.context("Fence signal failed")?;
        }
        Ok(index)
    }

    fn queue_present(&self, _queue: QueueKind, image_index: u32, wait: &[SemaphoreKey]) -> Result<()> {
        {
            let registry = self.registry.lock();
            for &key in wait {
                let semaphore = registry.semaphores.get(key).context("Unknown present semaphore")?;
                unsafe { self.device.queue.Wait(&semaphore.fence, semaphore.value) }.context("Queue wait failed")?;
            }
        }
        let current = self.swapchain.current_image();
        if current != image_index {
            self.report(&format!(
                "Presenting image {} but the swapchain's back buffer is {}",
                image_index, current
            ));
        }
        let result = self.swapchain.present();
        self.device.drain_messages(&self.messenger);
        result
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
        if let Some(handle) = self.registry.lock().samplers.remove(key) {
            self.heaps.lock().samplers.free(handle);
        }
    }

    fn create_shader_program(&self, desc: &ShaderProgramDesc) -> Result<ShaderKey> {
        self.create_shader_program_impl(desc)
    }

    fn destroy_shader_program(&self, key: ShaderKey) {
        self.registry.lock().shaders.remove(key);
    }

    fn create_descriptor_set(&self, bindings: &[DescriptorBinding]) -> Result<DescriptorSetKey> {
        self.create_descriptor_set_impl(bindings)
    }

    fn destroy_descriptor_set(&self, key: DescriptorSetKey) {
        let Some(entry) = self.registry.lock().descriptor_sets.remove(key) else { return };
        let mut heaps = self.heaps.lock();
        if let Some(range) = entry.views {
            heaps.shader_views.free(range.offset, range.count);
        }
        if let Some(range) = entry.samplers {
            heaps.shader_samplers.free(range.offset, range.count);
        }
    }

    fn update_descriptor_set(&self, key: DescriptorSetKey, writes: &[DescriptorWrite]) -> Result<()> {
        self.update_descriptor_set_impl(key, writes)
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> Result<RenderPassKey> {
        // D3D12 has no render pass object; the description is kept for the PSOs
        Ok(self.registry.lock().render_passes.insert(desc.clone()))
    }

    fn destroy_render_pass(&self, key: RenderPassKey) {
        self.registry.lock().render_passes.remove(key);
    }

    fn create_render_target(
        &self,
        render_pass: RenderPassKey,
        attachments: &RenderTargetAttachments,
    ) -> Result<RenderTargetKey> {
        self.create_render_target_impl(render_pass, attachments)
    }

    fn destroy_render_target(&self, key: RenderTargetKey) {
        self.registry.lock().render_targets.remove(key);
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc<'_>) -> Result<PipelineKey> {
        self.create_graphics_pipeline_impl(desc)
    }

    fn create_compute_pipeline(&self, shader: ShaderKey, descriptor_set: Option<DescriptorSetKey>) -> Result<PipelineKey> {
        self.create_compute_pipeline_impl(shader, descriptor_set)
    }

    fn destroy_pipeline(&self, key: PipelineKey) {
        self.registry.lock().pipelines.remove(key);
    }

    fn create_cmd_pool(&self, _queue: QueueKind) -> Result<CmdPoolKey> {
        Ok(self.registry.lock().cmd_pools.insert(CmdPoolEntry { cmds: Vec::new() }))
    }

    fn destroy_cmd_pool(&self, key: CmdPoolKey) {
        let mut registry = self.registry.lock();
        if let Some(entry) = registry.cmd_pools.remove(key) {
            for cmd in entry.cmds {
                registry.cmds.remove(cmd);
            }
        }
    }

    fn allocate_cmd(&self, pool: CmdPoolKey) -> Result<CmdKey> {
        let device = &self.device.device;
        let allocator: ID3D12CommandAllocator = unsafe { device.CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_DIRECT) }
            .context("Failed to create command allocator")?;
        let list: ID3D12GraphicsCommandList =
            unsafe { device.CreateCommandList(0, D3D12_COMMAND_LIST_TYPE_DIRECT, &allocator, None) }
                .context("Failed to create command list")?;
        // lists are created open; begin_cmd resets them
        unsafe { list.Close() }.context("Failed to close new command list")?;

        let mut registry = self.registry.lock();
        if !registry.cmd_pools.contains_key(pool) {
            bail!("Unknown command pool");
        }
        let key = registry.cmds.insert(CmdEntry {
            allocator,
            list,
            pass: None,
        });
        if let Some(entry) = registry.cmd_pools.get_mut(pool) {
            entry.cmds.push(key);
        }
        Ok(key)
    }

    fn free_cmd(&self, pool: CmdPoolKey, key: CmdKey) {
        let mut registry = self.registry.lock();
        registry.cmds.remove(key);
        if let Some(pool_entry) = registry.cmd_pools.get_mut(pool) {
            pool_entry.cmds.retain(|&k| k != key);
        }
    }

    fn begin_cmd(&self, key: CmdKey) -> Result<()> {
        let mut registry = self.registry.lock();
        let entry = registry.cmds.get_mut(key).context("Unknown command buffer")?;
        entry.pass = None;
        unsafe {
            entry.allocator.Reset().context("Failed to reset command allocator")?;
            entry
                .list
                .Reset(&entry.allocator, None)
                .context("Failed to reset command list")?;
        }
        Ok(())
    }

    fn end_cmd(&self, key: CmdKey) -> Result<()> {
        let registry = self.registry.lock();
        let entry = registry.cmds.get(key).context("Unknown command buffer")?;
        unsafe { entry.list.Close() }.context("Failed to close command list")?;
        Ok(())
    }

    fn record(&self, key: CmdKey, command: &Command) {
        let mut registry = self.registry.lock();
        self.record_impl(&mut registry, key, command);
    }

    fn create_fence(&self, signaled: bool) -> Result<FenceKey> {
        let fence: ID3D12Fence = unsafe { self.device.device.CreateFence(0, D3D12_FENCE_FLAG_NONE) }
            .context("Failed to create fence")?;
        let target = if signaled { 0 } else { 1 };
        Ok(self.registry.lock().fences.insert(FenceEntry { fence, target }))
    }

    fn destroy_fence(&self, key: FenceKey) {
        self.registry.lock().fences.remove(key);
    }

    fn wait_for_fences(&self, fences: &[FenceKey]) -> Result<()> {
        let waits = {
            let registry = self.registry.lock();
            fences
                .iter()
                .map(|&key| {
                    let entry = registry.fences.get(key).context("Unknown fence")?;
                    Ok((entry.fence.clone(), entry.target))
                })
                .collect::<Result<Vec<_>>>()?
        };
        for (fence, target) in waits {
            self.wait_fence_value(&fence, target)?;
        }
        Ok(())
    }

    fn reset_fences(&self, fences: &[FenceKey]) -> Result<()> {
        let mut registry = self.registry.lock();
        for &key in fences {
            let entry = registry.fences.get_mut(key).context("Unknown fence")?;
            let completed = unsafe { entry.fence.GetCompletedValue() };
            entry.target = entry.target.max(completed) + 1;
        }
        Ok(())
    }

    fn fence_signaled(&self, key: FenceKey) -> Result<bool> {
        let registry = self.registry.lock();
        let entry = registry.fences.get(key).context("Unknown fence")?;
        Ok(unsafe { entry.fence.GetCompletedValue() } >= entry.target)
    }

    fn create_semaphore(&self) -> Result<SemaphoreKey> {
        let fence: ID3D12Fence = unsafe { self.device.device.CreateFence(0, D3D12_FENCE_FLAG_NONE) }
            .context("Failed to create semaphore fence")?;
        Ok(self.registry.lock().semaphores.insert(SemaphoreEntry { fence, value: 0 }))
    }

    fn destroy_semaphore(&self, key: SemaphoreKey) {
        self.registry.lock().semaphores.remove(key);
    }

    fn queue_submit(&self, queue: QueueKind, submit: &SubmitInfo<'_>) -> Result<u64> {
        let mut registry = self.registry.lock();
        let lists = submit
            .cmds
            .iter()
            .map(|&k| {
                let entry = registry.cmds.get(k).context("Unknown command buffer")?;
                Ok(Some(entry.list.cast::<ID3D12CommandList>()?))
            })
            .collect::<Result<Vec<_>>>()?;

        let native = &self.device.queue;
        for &key in submit.wait_semaphores {
            let semaphore = registry.semaphores.get(key).context("Unknown wait semaphore")?;
            unsafe { native.Wait(&semaphore.fence, semaphore.value) }.context("Queue wait failed")?;
        }

        unsafe { native.ExecuteCommandLists(&lists) };

        for &key in submit.signal_semaphores {
            let semaphore = registry.semaphores.get_mut(key).context("Unknown signal semaphore")?;
            semaphore.value += 1;
            unsafe { native.Signal(&semaphore.fence, semaphore.value) }.context("Queue signal failed")?;
        }
        if let Some(key) = submit.fence {
            let fence = registry.fences.get(key).context("Unknown submit fence")?;
            unsafe { native.Signal(&fence.fence, fence.target) }.context("Queue signal failed")?;
        }
        drop(registry);

        let mut timelines = self.timelines.lock();
        let timeline = &mut timelines[queue_index(queue)];
        let serial = timeline.last_submitted + 1;
        unsafe { native.Signal(&timeline.fence, serial) }.context("Queue signal failed")?;
        timeline.last_submitted = serial;
        drop(timelines);

        self.device.drain_messages(&self.messenger);
        Ok(serial)
    }

    fn completed_serial(&self, queue: QueueKind) -> u64 {
        let timelines = self.timelines.lock();
        unsafe { timelines[queue_index(queue)].fence.GetCompletedValue() }
    }

    fn queue_wait_idle(&self, _queue: QueueKind) -> Result<()> {
        self.flush()
    }

    fn device_wait_idle(&self) -> Result<()> {
        self.flush()
    }
}

impl Drop for D3D12Backend {
    fn drop(&mut self) {
        log::info!("Destroying D3D12 backend...");
        if let Err(e) = self.flush() {
            log::error!("Failed to drain the queue: {:#}", e);
        }
        self.device.drain_messages(&self.messenger);
        // COM objects release themselves; only the event is a raw handle
        unsafe {
            let _ = CloseHandle(*self.wait_event.lock());
        }
    }
}
