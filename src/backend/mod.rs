// Backend module - the seam between the neutral layer and a native API
//
// Design: one object-safe trait, `GraphicsBackend`, implemented once per
// native API plus a CPU-side headless implementation. Native objects live in
// slotmap arenas inside the backend; the neutral layer only ever holds keys.
// All methods take `&self` and the backends use interior mutability, so a
// single `Arc<Device>` can be shared by every child handle.

use anyhow::Result;
use slotmap::new_key_type;
use std::any::Any;
use std::ptr::NonNull;

use crate::config::{BackendKind, RendererSettings};
use crate::descriptor::{DescriptorBinding, DescriptorType};
use crate::format::Format;
use crate::logging::Messenger;
use crate::pipeline::{PipelineSettings, VertexLayout};
use crate::render_target::RenderPassDesc;
use crate::resource::{BufferDesc, SamplerDesc, TextureDesc};
use crate::shader::ShaderProgramDesc;
use crate::types::{ClearValue, IndexType, QueueKind, ResourceState, ScissorRect, Viewport};

pub mod headless;
#[cfg(feature = "vulkan")]
pub mod vulkan;
#[cfg(all(windows, feature = "d3d12"))]
pub mod d3d12;

new_key_type! {
    pub struct BufferKey;
    pub struct TextureKey;
    pub struct SamplerKey;
    pub struct ShaderKey;
    pub struct DescriptorSetKey;
    pub struct PipelineKey;
    pub struct RenderPassKey;
    pub struct RenderTargetKey;
    pub struct CmdPoolKey;
    pub struct CmdKey;
    pub struct FenceKey;
    pub struct SemaphoreKey;
}

/// Device limits the neutral layer needs for sizing decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendLimits {
    /// Uniform buffers are rounded up to this size
    pub uniform_buffer_alignment: u64,
    /// Row pitch alignment for buffer <-> texture copies
    pub texture_row_pitch_alignment: u64,
    pub max_color_attachments: u32,
}

impl Default for BackendLimits {
    fn default() -> Self {
        Self {
            uniform_buffer_alignment: 256,
            texture_row_pitch_alignment: 1,
            max_color_attachments: 8,
        }
    }
}

/// A buffer as created by the backend
#[derive(Debug, Clone, Copy)]
pub struct BufferAllocation {
    pub key: BufferKey,
    /// Persistent mapping for host-visible memory, valid until the buffer is destroyed
    pub mapped: Option<NonNull<u8>>,
}

/// A texture as created by the backend
#[derive(Debug, Clone, Copy)]
pub struct TextureAllocation {
    pub key: TextureKey,
    pub mapped: Option<NonNull<u8>>,
}

/// The images owned by the backend's swapchain
#[derive(Debug, Clone)]
pub struct SwapchainImages {
    pub images: Vec<TextureKey>,
    pub format: Format,
    pub width: u32,
    pub height: u32,
}

/// Concrete resources written into one descriptor slot
#[derive(Debug, Clone, PartialEq)]
pub enum BoundResources {
    Buffers(Vec<BufferKey>),
    Textures(Vec<TextureKey>),
    Samplers(Vec<SamplerKey>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub ty: DescriptorType,
    pub resources: BoundResources,
}

/// Attachments of one render target, in render pass order
#[derive(Debug, Clone)]
pub struct RenderTargetAttachments {
    pub width: u32,
    pub height: u32,
    pub colors: Vec<TextureKey>,
    pub resolves: Vec<TextureKey>,
    pub depth_stencil: Option<TextureKey>,
}

pub struct GraphicsPipelineDesc<'a> {
    pub shader: ShaderKey,
    pub vertex_layout: &'a VertexLayout,
    pub descriptor_set: Option<DescriptorSetKey>,
    pub render_pass: RenderPassKey,
    pub settings: &'a PipelineSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBufferBinding {
    pub buffer: BufferKey,
    pub offset: u64,
    pub size: u64,
    pub stride: u32,
}

/// Buffer <-> 2D texture copy region; the buffer side is `row_pitch` bytes per row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferTextureCopy {
    pub buffer_offset: u64,
    pub row_pitch: u32,
    pub mip_level: u32,
    pub width: u32,
    pub height: u32,
}

/// One recorded operation, translated 1:1 to a native call
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    BeginRender {
        target: RenderTargetKey,
        render_pass: RenderPassKey,
    },
    EndRender,
    SetViewport(Viewport),
    SetScissor(ScissorRect),
    ClearColorAttachment {
        index: u32,
        value: ClearValue,
    },
    ClearDepthStencilAttachment {
        value: ClearValue,
    },
    BindPipeline(PipelineKey),
    BindDescriptorSets {
        pipeline: PipelineKey,
        set: DescriptorSetKey,
    },
    BindVertexBuffers(Vec<VertexBufferBinding>),
    BindIndexBuffer {
        buffer: BufferKey,
        index_type: IndexType,
        offset: u64,
        size: u64,
    },
    Draw {
        vertex_count: u32,
        first_vertex: u32,
    },
    DrawIndexed {
        index_count: u32,
        first_index: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    BufferTransition {
        buffer: BufferKey,
        old: ResourceState,
        new: ResourceState,
    },
    TextureTransition {
        texture: TextureKey,
        old: ResourceState,
        new: ResourceState,
    },
    CopyBufferToBuffer {
        src: BufferKey,
        src_offset: u64,
        dst: BufferKey,
        dst_offset: u64,
        size: u64,
    },
    CopyBufferToTexture2d {
        src: BufferKey,
        dst: TextureKey,
        region: BufferTextureCopy,
    },
    CopyTextureToBuffer {
        src: TextureKey,
        dst: BufferKey,
        region: BufferTextureCopy,
    },
}

/// One call to `queue_submit`
#[derive(Debug, Clone, Default)]
pub struct SubmitInfo<'a> {
    pub cmds: &'a [CmdKey],
    pub wait_semaphores: &'a [SemaphoreKey],
    pub signal_semaphores: &'a [SemaphoreKey],
    pub fence: Option<FenceKey>,
}

/// Everything a native API must provide.
///
/// Creation, submission and host waits are fallible. Recording is not:
/// a command that references an object the backend no longer knows is
/// reported through the messenger and dropped.
pub trait GraphicsBackend {
    fn kind(&self) -> BackendKind;
    fn limits(&self) -> BackendLimits;
    fn as_any(&self) -> &dyn Any;

    // Swapchain
    fn swapchain_images(&self) -> SwapchainImages;
    fn acquire_next_image(&self, signal: Option<SemaphoreKey>, fence: Option<FenceKey>) -> Result<u32>;
    fn queue_present(&self, queue: QueueKind, image_index: u32, wait: &[SemaphoreKey]) -> Result<()>;

    // Resources
    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferAllocation>;
    fn destroy_buffer(&self, key: BufferKey);
    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureAllocation>;
    fn destroy_texture(&self, key: TextureKey);
    fn create_sampler(&self, desc: &SamplerDesc) -> Result<SamplerKey>;
    fn destroy_sampler(&self, key: SamplerKey);

    // Binding objects
    fn create_shader_program(&self, desc: &ShaderProgramDesc) -> Result<ShaderKey>;
    fn destroy_shader_program(&self, key: ShaderKey);
    fn create_descriptor_set(&self, bindings: &[DescriptorBinding]) -> Result<DescriptorSetKey>;
    fn destroy_descriptor_set(&self, key: DescriptorSetKey);
    fn update_descriptor_set(&self, key: DescriptorSetKey, writes: &[DescriptorWrite]) -> Result<()>;
    fn create_render_pass(&self, desc: &RenderPassDesc) -> Result<RenderPassKey>;
    fn destroy_render_pass(&self, key: RenderPassKey);
    fn create_render_target(
        &self,
        render_pass: RenderPassKey,
        attachments: &RenderTargetAttachments,
    ) -> Result<RenderTargetKey>;
    fn destroy_render_target(&self, key: RenderTargetKey);
    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc<'_>) -> Result<PipelineKey>;
    fn create_compute_pipeline(&self, shader: ShaderKey, descriptor_set: Option<DescriptorSetKey>) -> Result<PipelineKey>;
    fn destroy_pipeline(&self, key: PipelineKey);

    // Recording
    fn create_cmd_pool(&self, queue: QueueKind) -> Result<CmdPoolKey>;
    /// Also frees every command buffer allocated from the pool
    fn destroy_cmd_pool(&self, key: CmdPoolKey);
    fn allocate_cmd(&self, pool: CmdPoolKey) -> Result<CmdKey>;
    fn free_cmd(&self, pool: CmdPoolKey, key: CmdKey);
    fn begin_cmd(&self, key: CmdKey) -> Result<()>;
    fn end_cmd(&self, key: CmdKey) -> Result<()>;
    fn record(&self, key: CmdKey, command: &Command);

    // Synchronization
    fn create_fence(&self, signaled: bool) -> Result<FenceKey>;
    fn destroy_fence(&self, key: FenceKey);
    fn wait_for_fences(&self, fences: &[FenceKey]) -> Result<()>;
    fn reset_fences(&self, fences: &[FenceKey]) -> Result<()>;
    fn fence_signaled(&self, key: FenceKey) -> Result<bool>;
    fn create_semaphore(&self) -> Result<SemaphoreKey>;
    fn destroy_semaphore(&self, key: SemaphoreKey);

    // Submission
    /// Returns the submission serial; it completes once `completed_serial` reaches it
    fn queue_submit(&self, queue: QueueKind, submit: &SubmitInfo<'_>) -> Result<u64>;
    fn completed_serial(&self, queue: QueueKind) -> u64;
    fn queue_wait_idle(&self, queue: QueueKind) -> Result<()>;
    fn device_wait_idle(&self) -> Result<()>;
}

/// Create the backend selected by `settings.backend`
pub fn create(app_name: &str, settings: &RendererSettings, messenger: Messenger) -> Result<Box<dyn GraphicsBackend>> {
    match settings.backend {
        BackendKind::Headless => Ok(Box::new(headless::HeadlessBackend::new(app_name, settings, messenger)?)),
        BackendKind::Vulkan => create_vulkan(app_name, settings, messenger),
        BackendKind::D3d12 => create_d3d12(app_name, settings, messenger),
    }
}

#[cfg(feature = "vulkan")]
fn create_vulkan(app_name: &str, settings: &RendererSettings, messenger: Messenger) -> Result<Box<dyn GraphicsBackend>> {
    Ok(Box::new(vulkan::VulkanBackend::new(app_name, settings, messenger)?))
}

#[cfg(not(feature = "vulkan"))]
fn create_vulkan(_: &str, _: &RendererSettings, _: Messenger) -> Result<Box<dyn GraphicsBackend>> {
    anyhow::bail!("Vulkan backend requested but the `vulkan` feature is disabled")
}

#[cfg(all(windows, feature = "d3d12"))]
fn create_d3d12(app_name: &str, settings: &RendererSettings, messenger: Messenger) -> Result<Box<dyn GraphicsBackend>> {
    Ok(Box::new(d3d12::D3D12Backend::new(app_name, settings, messenger)?))
}

#[cfg(not(all(windows, feature = "d3d12")))]
fn create_d3d12(_: &str, _: &RendererSettings, _: Messenger) -> Result<Box<dyn GraphicsBackend>> {
    anyhow::bail!("D3D12 backend requested but it is only available on Windows with the `d3d12` feature")
}
