// Flat API
//
// One free function per operation, with the renderer or command buffer passed
// explicitly. Each one forwards to the object API; the objects themselves
// stay usable directly.

use anyhow::{bail, Context, Result};

use crate::command::{CommandBuffer, CommandPool};
use crate::config::RendererSettings;
use crate::descriptor::{DescriptorBinding, DescriptorSet, DescriptorUpdate};
use crate::format::Format;
use crate::pipeline::{Pipeline, PipelineSettings, VertexLayout};
use crate::render_target::{RenderPass, RenderPassDesc, RenderTarget, RenderTargetDesc};
use crate::renderer::Renderer;
use crate::resource::{Buffer, BufferDesc, Sampler, SamplerDesc, Texture, TextureDesc};
use crate::shader::{ShaderProgram, ShaderProgramDesc};
use crate::sync::{Fence, Semaphore};
use crate::types::{
    BufferUsage, ClearValue, IndexType, MemoryLocation, QueueKind, ResourceState, ScissorRect,
    TextureType, TextureUsage, Viewport,
};
use crate::util;

pub use crate::backend::BufferTextureCopy;

// -----------------------------------------------------------------------------
// Lifecycle
// -----------------------------------------------------------------------------

pub fn create_renderer(app_name: &str, settings: RendererSettings) -> Result<Renderer> {
    Renderer::new(app_name, settings)
}

/// Wait for the GPU, then release the renderer. Objects still holding the
/// device keep it alive until they are dropped.
pub fn destroy_renderer(renderer: Renderer) -> Result<()> {
    renderer.wait_idle()?;
    drop(renderer);
    Ok(())
}

// -----------------------------------------------------------------------------
// Buffers
// -----------------------------------------------------------------------------

fn location(host_visible: bool) -> MemoryLocation {
    if host_visible {
        MemoryLocation::CpuToGpu
    } else {
        MemoryLocation::GpuOnly
    }
}

pub fn create_buffer(renderer: &Renderer, usage: BufferUsage, size: u64, host_visible: bool) -> Result<Buffer> {
    Buffer::new(renderer.device(), BufferDesc::new(usage, size, location(host_visible)))
}

pub fn create_buffer_with_desc(renderer: &Renderer, desc: BufferDesc) -> Result<Buffer> {
    Buffer::new(renderer.device(), desc)
}

pub fn create_index_buffer(renderer: &Renderer, size: u64, host_visible: bool, index_type: IndexType) -> Result<Buffer> {
    let buffer = Buffer::new(
        renderer.device(),
        BufferDesc::new(
            BufferUsage::INDEX | BufferUsage::TRANSFER_DST,
            size,
            location(host_visible),
        ),
    )?;
    Ok(buffer.with_index_type(index_type))
}

pub fn create_uniform_buffer(renderer: &Renderer, size: u64, host_visible: bool) -> Result<Buffer> {
    Buffer::new(
        renderer.device(),
        BufferDesc::new(
            BufferUsage::UNIFORM_CBV | BufferUsage::TRANSFER_DST,
            size,
            location(host_visible),
        ),
    )
}

pub fn create_vertex_buffer(renderer: &Renderer, size: u64, host_visible: bool, vertex_stride: u32) -> Result<Buffer> {
    if vertex_stride == 0 {
        bail!("Vertex stride must be non-zero");
    }
    let buffer = Buffer::new(
        renderer.device(),
        BufferDesc::new(
            BufferUsage::VERTEX | BufferUsage::TRANSFER_DST,
            size,
            location(host_visible),
        ),
    )?;
    Ok(buffer.with_vertex_stride(vertex_stride))
}

/// Read-only structured (or raw) buffer
pub fn create_structured_buffer(
    renderer: &Renderer,
    size: u64,
    first_element: u64,
    element_count: u64,
    struct_stride: u32,
    raw: bool,
    host_visible: bool,
) -> Result<Buffer> {
    Buffer::new(
        renderer.device(),
        BufferDesc {
            first_element,
            element_count,
            struct_stride,
            raw,
            ..BufferDesc::new(
                BufferUsage::STORAGE_SRV | BufferUsage::TRANSFER_DST,
                size,
                location(host_visible),
            )
        },
    )
}

/// Read-write structured buffer, optionally with a 4-byte append/consume counter
#[allow(clippy::too_many_arguments)]
pub fn create_rw_structured_buffer(
    renderer: &Renderer,
    size: u64,
    first_element: u64,
    element_count: u64,
    struct_stride: u32,
    raw: bool,
    with_counter: bool,
    host_visible: bool,
) -> Result<Buffer> {
    let buffer = Buffer::new(
        renderer.device(),
        BufferDesc {
            first_element,
            element_count,
            struct_stride,
            raw,
            ..BufferDesc::new(
                BufferUsage::STORAGE_SRV | BufferUsage::STORAGE_UAV | BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
                size,
                location(host_visible),
            )
        },
    )?;
    if !with_counter {
        return Ok(buffer);
    }
    let counter = Buffer::new(
        renderer.device(),
        BufferDesc::new(
            BufferUsage::STORAGE_UAV | BufferUsage::TRANSFER_DST,
            4,
            location(host_visible),
        ),
    )
    .context("Failed to create counter buffer")?;
    Ok(buffer.with_counter(counter))
}

pub fn destroy_buffer(buffer: Buffer) {
    drop(buffer);
}

// -----------------------------------------------------------------------------
// Textures and samplers
// -----------------------------------------------------------------------------

/// Create a texture and move it from `Undefined` to `initial_state`
pub fn create_texture(renderer: &Renderer, desc: TextureDesc, initial_state: ResourceState) -> Result<Texture> {
    let texture = Texture::new(renderer.device(), desc)?;
    if initial_state != ResourceState::Undefined {
        util::transition_image(renderer, &texture, ResourceState::Undefined, initial_state)
            .context("Failed to transition texture to its initial state")?;
    }
    Ok(texture)
}

#[allow(clippy::too_many_arguments)]
pub fn create_texture_1d(
    renderer: &Renderer,
    width: u32,
    format: Format,
    mip_levels: u32,
    usage: TextureUsage,
    host_visible: bool,
    initial_state: ResourceState,
) -> Result<Texture> {
    create_texture(
        renderer,
        TextureDesc {
            texture_type: TextureType::Tex1D,
            mip_levels,
            host_visible,
            ..TextureDesc::new_2d(width, 1, format, usage)
        },
        initial_state,
    )
}

#[allow(clippy::too_many_arguments)]
pub fn create_texture_2d(
    renderer: &Renderer,
    width: u32,
    height: u32,
    sample_count: u32,
    format: Format,
    mip_levels: u32,
    clear_value: Option<ClearValue>,
    usage: TextureUsage,
    host_visible: bool,
    initial_state: ResourceState,
) -> Result<Texture> {
    let base = TextureDesc::new_2d(width, height, format, usage);
    create_texture(
        renderer,
        TextureDesc {
            sample_count,
            mip_levels,
            clear_value: clear_value.unwrap_or(base.clear_value),
            host_visible,
            ..base
        },
        initial_state,
    )
}

#[allow(clippy::too_many_arguments)]
pub fn create_texture_3d(
    renderer: &Renderer,
    width: u32,
    height: u32,
    depth: u32,
    format: Format,
    mip_levels: u32,
    usage: TextureUsage,
    host_visible: bool,
    initial_state: ResourceState,
) -> Result<Texture> {
    create_texture(
        renderer,
        TextureDesc {
            texture_type: TextureType::Tex3D,
            depth,
            mip_levels,
            host_visible,
            ..TextureDesc::new_2d(width, height, format, usage)
        },
        initial_state,
    )
}

pub fn destroy_texture(texture: Texture) {
    drop(texture);
}

pub fn create_sampler(renderer: &Renderer, desc: SamplerDesc) -> Result<Sampler> {
    Sampler::new(renderer.device(), desc)
}

pub fn destroy_sampler(sampler: Sampler) {
    drop(sampler);
}

// -----------------------------------------------------------------------------
// Binding objects
// -----------------------------------------------------------------------------

pub fn create_shader_program(renderer: &Renderer, desc: &ShaderProgramDesc) -> Result<ShaderProgram> {
    ShaderProgram::new(renderer.device(), desc)
}

pub fn create_descriptor_set(renderer: &Renderer, bindings: &[DescriptorBinding]) -> Result<DescriptorSet> {
    DescriptorSet::new(renderer.device(), bindings)
}

pub fn update_descriptor_set(set: &mut DescriptorSet, updates: &[DescriptorUpdate<'_>]) -> Result<()> {
    set.update(updates)
}

pub fn create_pipeline(
    renderer: &Renderer,
    shader: &ShaderProgram,
    vertex_layout: &VertexLayout,
    descriptor_set: Option<&DescriptorSet>,
    render_target: &RenderTarget,
    settings: &PipelineSettings,
) -> Result<Pipeline> {
    Pipeline::new_graphics(renderer.device(), shader, vertex_layout, descriptor_set, render_target, settings)
}

pub fn create_compute_pipeline(
    renderer: &Renderer,
    shader: &ShaderProgram,
    descriptor_set: Option<&DescriptorSet>,
) -> Result<Pipeline> {
    Pipeline::new_compute(renderer.device(), shader, descriptor_set)
}

pub fn create_render_pass(renderer: &Renderer, desc: RenderPassDesc) -> Result<RenderPass> {
    RenderPass::new(renderer.device(), desc)
}

/// Create a render target and move its attachments into their attachment
/// states: color outputs to `ColorAttachment`, depth to
/// `DepthStencilAttachment`
pub fn create_render_target(renderer: &Renderer, desc: &RenderTargetDesc) -> Result<RenderTarget> {
    let target = RenderTarget::new(renderer.device(), desc)?;
    let pool = renderer.util_pool();
    util::submit_one_shot(pool, renderer.graphics_queue(), |cmd| {
        for texture in target.color_attachments().iter().chain(target.resolve_attachments()) {
            cmd.image_transition(texture, ResourceState::Undefined, ResourceState::ColorAttachment);
        }
        cmd.depth_stencil_transition(&target, ResourceState::Undefined, ResourceState::DepthStencilAttachment);
    })
    .context("Failed to transition render target attachments")?;
    Ok(target)
}

// -----------------------------------------------------------------------------
// Command objects
// -----------------------------------------------------------------------------

pub fn create_cmd_pool(renderer: &Renderer, queue: QueueKind) -> Result<CommandPool> {
    CommandPool::new(renderer.device(), queue)
}

pub fn create_cmd(pool: &CommandPool) -> Result<CommandBuffer> {
    pool.allocate()
}

pub fn create_cmd_n(pool: &CommandPool, count: usize) -> Result<Vec<CommandBuffer>> {
    pool.allocate_n(count)
}

pub fn create_fence(renderer: &Renderer, signaled: bool) -> Result<Fence> {
    Fence::new(renderer.device(), signaled)
}

pub fn create_semaphore(renderer: &Renderer) -> Result<Semaphore> {
    Semaphore::new(renderer.device())
}

// -----------------------------------------------------------------------------
// Recording
// -----------------------------------------------------------------------------

pub fn begin_cmd(cmd: &mut CommandBuffer) -> Result<()> {
    cmd.begin()
}

pub fn end_cmd(cmd: &mut CommandBuffer) -> Result<()> {
    cmd.end()
}

pub fn reset_cmd(cmd: &mut CommandBuffer) {
    cmd.reset()
}

pub fn cmd_begin_render(cmd: &mut CommandBuffer, target: &RenderTarget) {
    cmd.begin_render(target)
}

pub fn cmd_end_render(cmd: &mut CommandBuffer) {
    cmd.end_render()
}

pub fn cmd_set_viewport(cmd: &mut CommandBuffer, x: f32, y: f32, width: f32, height: f32, min_depth: f32, max_depth: f32) {
    cmd.set_viewport(Viewport {
        x,
        y,
        width,
        height,
        min_depth,
        max_depth,
    })
}

pub fn cmd_set_scissor(cmd: &mut CommandBuffer, x: i32, y: i32, width: u32, height: u32) {
    cmd.set_scissor(ScissorRect { x, y, width, height })
}

pub fn cmd_clear_color_attachment(cmd: &mut CommandBuffer, index: u32, value: ClearValue) {
    cmd.clear_color_attachment(index, value)
}

pub fn cmd_clear_depth_stencil_attachment(cmd: &mut CommandBuffer, value: ClearValue) {
    cmd.clear_depth_stencil_attachment(value)
}

pub fn cmd_bind_pipeline(cmd: &mut CommandBuffer, pipeline: &Pipeline) {
    cmd.bind_pipeline(pipeline)
}

pub fn cmd_bind_descriptor_sets(cmd: &mut CommandBuffer, pipeline: &Pipeline, set: &DescriptorSet) {
    cmd.bind_descriptor_sets(pipeline, set)
}

pub fn cmd_bind_vertex_buffers(cmd: &mut CommandBuffer, buffers: &[&Buffer]) {
    cmd.bind_vertex_buffers(buffers)
}

pub fn cmd_bind_index_buffer(cmd: &mut CommandBuffer, buffer: &Buffer) {
    cmd.bind_index_buffer(buffer)
}

pub fn cmd_draw(cmd: &mut CommandBuffer, vertex_count: u32, first_vertex: u32) {
    cmd.draw(vertex_count, first_vertex)
}

pub fn cmd_draw_indexed(cmd: &mut CommandBuffer, index_count: u32, first_index: u32) {
    cmd.draw_indexed(index_count, first_index)
}

pub fn cmd_dispatch(cmd: &mut CommandBuffer, x: u32, y: u32, z: u32) {
    cmd.dispatch(x, y, z)
}

pub fn cmd_buffer_transition(cmd: &mut CommandBuffer, buffer: &Buffer, old: ResourceState, new: ResourceState) {
    cmd.buffer_transition(buffer, old, new)
}

pub fn cmd_image_transition(cmd: &mut CommandBuffer, texture: &Texture, old: ResourceState, new: ResourceState) {
    cmd.image_transition(texture, old, new)
}

pub fn cmd_render_target_transition(
    cmd: &mut CommandBuffer,
    target: &RenderTarget,
    old: ResourceState,
    new: ResourceState,
) {
    cmd.render_target_transition(target, old, new)
}

pub fn cmd_depth_stencil_transition(
    cmd: &mut CommandBuffer,
    target: &RenderTarget,
    old: ResourceState,
    new: ResourceState,
) {
    cmd.depth_stencil_transition(target, old, new)
}

pub fn cmd_copy_buffer_to_buffer(
    cmd: &mut CommandBuffer,
    src: &Buffer,
    src_offset: u64,
    dst: &Buffer,
    dst_offset: u64,
    size: u64,
) {
    cmd.copy_buffer_to_buffer(src, src_offset, dst, dst_offset, size)
}

pub fn cmd_copy_buffer_to_texture2d(cmd: &mut CommandBuffer, src: &Buffer, dst: &Texture, region: BufferTextureCopy) {
    cmd.copy_buffer_to_texture2d(src, dst, region)
}

pub fn cmd_copy_texture_to_buffer(cmd: &mut CommandBuffer, src: &Texture, dst: &Buffer, region: BufferTextureCopy) {
    cmd.copy_texture_to_buffer(src, dst, region)
}

// -----------------------------------------------------------------------------
// Submission
// -----------------------------------------------------------------------------

pub fn acquire_next_image(renderer: &Renderer) -> Result<u32> {
    renderer.acquire_next_image()
}

pub fn queue_submit(
    renderer: &Renderer,
    cmds: &mut [&mut CommandBuffer],
    wait: &[&Semaphore],
    signal: &[&Semaphore],
) -> Result<u64> {
    renderer.queue_submit(cmds, wait, signal)
}

pub fn queue_present(renderer: &Renderer, wait: &[&Semaphore]) -> Result<()> {
    renderer.queue_present(wait)
}

pub fn queue_wait_idle(renderer: &Renderer) -> Result<()> {
    renderer.graphics_queue().wait_idle()?;
    renderer.present_queue().wait_idle()
}

// -----------------------------------------------------------------------------
// Utilities
// -----------------------------------------------------------------------------

pub fn util_update_buffer(renderer: &Renderer, buffer: &Buffer, data: &[u8]) -> Result<()> {
    util::update_buffer(renderer, buffer, data)
}

pub fn util_update_texture_uint8(
    renderer: &Renderer,
    texture: &Texture,
    src_width: u32,
    src_height: u32,
    src_row_stride: u32,
    src_data: &[u8],
    src_channel_count: u32,
) -> Result<()> {
    util::update_texture_uint8(
        renderer,
        texture,
        src_width,
        src_height,
        src_row_stride,
        src_data,
        src_channel_count,
    )
}

pub fn util_transition_buffer(renderer: &Renderer, buffer: &Buffer, old: ResourceState, new: ResourceState) -> Result<()> {
    util::transition_buffer(renderer, buffer, old, new)
}

pub fn util_transition_image(renderer: &Renderer, texture: &Texture, old: ResourceState, new: ResourceState) -> Result<()> {
    util::transition_image(renderer, texture, old, new)
}

pub fn util_read_buffer(renderer: &Renderer, buffer: &Buffer) -> Result<Vec<u8>> {
    util::read_buffer(renderer, buffer)
}

pub fn util_read_texture(renderer: &Renderer, texture: &Texture) -> Result<Vec<u8>> {
    util::read_texture(renderer, texture)
}

pub fn util_format_stride(format: Format) -> u32 {
    util::format_stride(format)
}

pub fn util_format_channel_count(format: Format) -> u32 {
    util::format_channel_count(format)
}
