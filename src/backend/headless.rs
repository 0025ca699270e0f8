// Headless backend - a CPU reference implementation of the backend contract
//
// Resources live in host memory. Submissions are queued and only executed
// when the host synchronizes (fence wait, queue/device wait idle, present of
// an image whose semaphore they signal) or when more than
// `max_pending_submissions` are queued. This keeps completion observably
// deferred, the way a real GPU's is.
//
// Execution does what a driver plus its validation layer would: copies and
// clears are carried out byte for byte, texture transitions are checked
// against the state the image is actually in, attachments must be in their
// attachment states when a pass begins, swapchain images must be in Present
// when presented, and binary semaphores / fences are checked for
// double-signal and wait-without-signal. Findings go to the messenger under
// the "headless" component. Draws and dispatches are not rasterized; they are
// appended to a draw log that tests can inspect.

use anyhow::{bail, Context, Result};
use half::f16;
use parking_lot::Mutex;
use slotmap::SlotMap;
use std::alloc::{self, Layout};
use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::ptr::NonNull;

use super::{
    BackendLimits, BoundResources, BufferAllocation, BufferKey, BufferTextureCopy, CmdKey, CmdPoolKey, Command,
    DescriptorSetKey, DescriptorWrite, FenceKey, GraphicsBackend, GraphicsPipelineDesc, PipelineKey, RenderPassKey,
    RenderTargetAttachments, RenderTargetKey, SamplerKey, SemaphoreKey, ShaderKey, SubmitInfo, SwapchainImages,
    TextureAllocation, TextureKey,
};
use crate::config::{BackendKind, RendererSettings};
use crate::descriptor::DescriptorBinding;
use crate::format::{ChannelKind, Format};
use crate::logging::Messenger;
use crate::render_target::RenderPassDesc;
use crate::resource::{BufferDesc, SamplerDesc, TextureDesc};
use crate::shader::ShaderProgramDesc;
use crate::types::{QueueKind, ResourceState, ScissorRect, ShaderStages, TextureUsage, Viewport};

const COMPONENT: &str = "headless";

/// Zeroed host allocation with a stable address
struct HostMemory {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl HostMemory {
    fn new(size: u64) -> Result<Self> {
        let layout = Layout::from_size_align(size.max(1) as usize, 256).context("Invalid allocation size")?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).context("Host allocation failed")?;
        Ok(Self { ptr, layout })
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: the allocation is `layout.size()` initialized bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees no other slice exists.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

struct BufferEntry {
    memory: HostMemory,
    size: u64,
    state: ResourceState,
}

struct TextureEntry {
    memory: HostMemory,
    desc: TextureDesc,
    state: ResourceState,
    swapchain: bool,
}

struct DescriptorSetEntry {
    bindings: Vec<DescriptorBinding>,
    writes: HashMap<u32, BoundResources>,
}

struct RenderTargetEntry {
    render_pass: RenderPassKey,
    attachments: RenderTargetAttachments,
}

struct PipelineEntry {
    compute: bool,
    render_pass: Option<RenderPassDesc>,
    vertex_bindings: usize,
    hash: u64,
}

struct CmdEntry {
    pool: CmdPoolKey,
    recording: bool,
    commands: Vec<Command>,
}

struct PoolEntry {
    queue: QueueKind,
    cmds: Vec<CmdKey>,
}

#[derive(Default)]
struct FenceEntry {
    signaled: bool,
    /// Attached to a submission that has not executed yet
    pending: bool,
}

#[derive(Default)]
struct SemaphoreEntry {
    signaled: bool,
    pending_signal: bool,
}

struct Submission {
    queue: QueueKind,
    serial: u64,
    commands: Vec<Vec<Command>>,
    signal_semaphores: Vec<SemaphoreKey>,
    fence: Option<FenceKey>,
}

/// What a draw or dispatch was
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawKind {
    Draw { vertex_count: u32, first_vertex: u32 },
    DrawIndexed { index_count: u32, first_index: u32 },
    Dispatch { x: u32, y: u32, z: u32 },
}

/// One executed draw or dispatch together with the state bound at the time
#[derive(Debug, Clone, PartialEq)]
pub struct DrawRecord {
    pub kind: DrawKind,
    pub pipeline: PipelineKey,
    /// Equal for pipelines built from identical inputs
    pub pipeline_hash: u64,
    pub render_target: Option<RenderTargetKey>,
    pub viewport: Option<Viewport>,
    pub scissor: Option<ScissorRect>,
    pub vertex_buffers: Vec<BufferKey>,
    pub index_buffer: Option<BufferKey>,
    pub descriptor_set: Option<DescriptorSetKey>,
}

impl DrawRecord {
    /// The record with object identities removed, for comparing the output of
    /// two independently built but identical setups
    pub fn without_keys(&self) -> (DrawKind, u64, Option<Viewport>, Option<ScissorRect>, usize) {
        (
            self.kind,
            self.pipeline_hash,
            self.viewport,
            self.scissor,
            self.vertex_buffers.len(),
        )
    }
}

/// Bound state while executing one command buffer
#[derive(Default)]
struct ExecState {
    target: Option<RenderTargetKey>,
    pipeline: Option<PipelineKey>,
    viewport: Option<Viewport>,
    scissor: Option<ScissorRect>,
    vertex_buffers: Vec<BufferKey>,
    index_buffer: Option<BufferKey>,
    descriptor_set: Option<DescriptorSetKey>,
}

struct State {
    buffers: SlotMap<BufferKey, BufferEntry>,
    textures: SlotMap<TextureKey, TextureEntry>,
    samplers: SlotMap<SamplerKey, SamplerDesc>,
    shaders: SlotMap<ShaderKey, (ShaderStages, u64)>,
    descriptor_sets: SlotMap<DescriptorSetKey, DescriptorSetEntry>,
    render_passes: SlotMap<RenderPassKey, RenderPassDesc>,
    render_targets: SlotMap<RenderTargetKey, RenderTargetEntry>,
    pipelines: SlotMap<PipelineKey, PipelineEntry>,
    pools: SlotMap<CmdPoolKey, PoolEntry>,
    cmds: SlotMap<CmdKey, CmdEntry>,
    fences: SlotMap<FenceKey, FenceEntry>,
    semaphores: SlotMap<SemaphoreKey, SemaphoreEntry>,

    swapchain: Vec<TextureKey>,
    next_image: u32,
    acquired: Option<u32>,
    presented: Vec<u32>,

    pending: VecDeque<Submission>,
    next_serial: HashMap<QueueKind, u64>,
    completed_serial: HashMap<QueueKind, u64>,
    submissions: u64,
    draw_log: Vec<DrawRecord>,
}

pub struct HeadlessBackend {
    state: Mutex<State>,
    messenger: Messenger,
    swapchain_format: Format,
    width: u32,
    height: u32,
    max_pending_submissions: usize,
}

impl HeadlessBackend {
    pub fn new(app_name: &str, settings: &RendererSettings, messenger: Messenger) -> Result<Self> {
        log::info!("Creating headless device for '{}'", app_name);

        let mut state = State {
            buffers: SlotMap::with_key(),
            textures: SlotMap::with_key(),
            samplers: SlotMap::with_key(),
            shaders: SlotMap::with_key(),
            descriptor_sets: SlotMap::with_key(),
            render_passes: SlotMap::with_key(),
            render_targets: SlotMap::with_key(),
            pipelines: SlotMap::with_key(),
            pools: SlotMap::with_key(),
            cmds: SlotMap::with_key(),
            fences: SlotMap::with_key(),
            semaphores: SlotMap::with_key(),
            swapchain: Vec::new(),
            next_image: 0,
            acquired: None,
            presented: Vec::new(),
            pending: VecDeque::new(),
            next_serial: HashMap::new(),
            completed_serial: HashMap::new(),
            submissions: 0,
            draw_log: Vec::new(),
        };

        let format = settings.swapchain.color_format;
        for _ in 0..settings.swapchain.image_count {
            let desc = TextureDesc::new_2d(
                settings.width,
                settings.height,
                format,
                TextureUsage::COLOR_ATTACHMENT
                    | TextureUsage::RESOLVE_DST
                    | TextureUsage::TRANSFER_SRC
                    | TextureUsage::TRANSFER_DST
                    | TextureUsage::PRESENT,
            );
            let memory = HostMemory::new(desc.total_size())?;
            let key = state.textures.insert(TextureEntry {
                memory,
                desc,
                state: ResourceState::Undefined,
                swapchain: true,
            });
            state.swapchain.push(key);
        }

        Ok(Self {
            state: Mutex::new(state),
            messenger,
            swapchain_format: format,
            width: settings.width,
            height: settings.height,
            max_pending_submissions: settings.headless.max_pending_submissions,
        })
    }

    /// Draws and dispatches executed so far
    pub fn draw_log(&self) -> Vec<DrawRecord> {
        self.state.lock().draw_log.clone()
    }

    pub fn take_draw_log(&self) -> Vec<DrawRecord> {
        std::mem::take(&mut self.state.lock().draw_log)
    }

    /// Submissions accepted but not yet executed
    pub fn pending_submissions(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn submission_count(&self) -> u64 {
        self.state.lock().submissions
    }

    /// Swapchain image indices in the order they were presented
    pub fn presented_images(&self) -> Vec<u32> {
        self.state.lock().presented.clone()
    }

    /// The state the emulated driver has the texture in, as of the last
    /// executed submission
    pub fn texture_state(&self, key: TextureKey) -> Option<ResourceState> {
        self.state.lock().textures.get(key).map(|t| t.state)
    }

    pub fn buffer_state(&self, key: BufferKey) -> Option<ResourceState> {
        self.state.lock().buffers.get(key).map(|b| b.state)
    }

    /// Contents of a texture's mip 0, tightly packed
    pub fn texture_data(&self, key: TextureKey) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let texture = state.textures.get(key)?;
        Some(texture.memory.bytes()[..texture.desc.mip_size(0) as usize].to_vec())
    }

    fn report(&self, message: &str) {
        self.messenger.error(COMPONENT, message);
    }

    /// Execute pending submissions front to back until `done` says stop
    /// (inclusive of the submission it matched)
    fn retire_until<F>(&self, state: &mut State, mut done: F)
    where
        F: FnMut(&Submission) -> bool,
    {
        while let Some(submission) = state.pending.pop_front() {
            let last = done(&submission);
            self.execute(state, submission);
            if last {
                break;
            }
        }
    }

    fn retire_all(&self, state: &mut State) {
        self.retire_until(state, |_| false);
    }

    fn execute(&self, state: &mut State, submission: Submission) {
        for commands in &submission.commands {
            let mut exec = ExecState::default();
            for command in commands {
                self.execute_command(state, &mut exec, command);
            }
            if exec.target.is_some() {
                self.report("command buffer ended with a render pass still open");
            }
        }

        for key in &submission.signal_semaphores {
            if let Some(semaphore) = state.semaphores.get_mut(*key) {
                semaphore.signaled = true;
                semaphore.pending_signal = false;
            }
        }
        if let Some(fence) = submission.fence.and_then(|key| state.fences.get_mut(key)) {
            fence.signaled = true;
            fence.pending = false;
        }
        state.completed_serial.insert(submission.queue, submission.serial);
    }

    fn execute_command(&self, state: &mut State, exec: &mut ExecState, command: &Command) {
        match command {
            Command::BeginRender { target, render_pass } => self.begin_render(state, exec, *target, *render_pass),
            Command::EndRender => {
                if let Some(target) = exec.target.take() {
                    self.resolve(state, target);
                }
            }
            Command::SetViewport(viewport) => exec.viewport = Some(*viewport),
            Command::SetScissor(scissor) => exec.scissor = Some(*scissor),
            Command::ClearColorAttachment { index, value } => {
                let attachment = exec
                    .target
                    .and_then(|t| state.render_targets.get(t))
                    .and_then(|t| t.attachments.colors.get(*index as usize).copied());
                match attachment {
                    Some(key) => fill_texture(state, key, |format| encode_color(format, value.color())),
                    None => self.report(&format!("clear of color attachment {} that does not exist", index)),
                }
            }
            Command::ClearDepthStencilAttachment { value } => {
                let attachment = exec
                    .target
                    .and_then(|t| state.render_targets.get(t))
                    .and_then(|t| t.attachments.depth_stencil);
                match attachment {
                    Some(key) => {
                        let (depth, stencil) = value.depth_stencil();
                        fill_texture(state, key, |format| encode_depth_stencil(format, depth, stencil))
                    }
                    None => self.report("depth-stencil clear on a render target without a depth attachment"),
                }
            }
            Command::BindPipeline(pipeline) => exec.pipeline = Some(*pipeline),
            Command::BindDescriptorSets { set, .. } => exec.descriptor_set = Some(*set),
            Command::BindVertexBuffers(bindings) => {
                exec.vertex_buffers = bindings.iter().map(|b| b.buffer).collect();
            }
            Command::BindIndexBuffer { buffer, .. } => exec.index_buffer = Some(*buffer),
            Command::Draw {
                vertex_count,
                first_vertex,
            } => self.draw(
                state,
                exec,
                DrawKind::Draw {
                    vertex_count: *vertex_count,
                    first_vertex: *first_vertex,
                },
            ),
            Command::DrawIndexed {
                index_count,
                first_index,
            } => self.draw(
                state,
                exec,
                DrawKind::DrawIndexed {
                    index_count: *index_count,
                    first_index: *first_index,
                },
            ),
            Command::Dispatch { x, y, z } => self.draw(state, exec, DrawKind::Dispatch { x: *x, y: *y, z: *z }),
            Command::BufferTransition { buffer, old, new } => {
                let Some(entry) = state.buffers.get_mut(*buffer) else {
                    self.report(&format!("transition of destroyed buffer {:?}", buffer));
                    return;
                };
                if *old != entry.state {
                    self.report(&format!(
                        "buffer {:?} transitioned from {:?} but it is in {:?}",
                        buffer, old, entry.state
                    ));
                }
                entry.state = *new;
            }
            Command::TextureTransition { texture, old, new } => {
                let Some(entry) = state.textures.get_mut(*texture) else {
                    self.report(&format!("transition of destroyed texture {:?}", texture));
                    return;
                };
                if *old != entry.state {
                    self.report(&format!(
                        "texture {:?} transitioned from {:?} but it is in {:?}",
                        texture, old, entry.state
                    ));
                }
                entry.state = *new;
            }
            Command::CopyBufferToBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => self.copy_buffer(state, *src, *src_offset, *dst, *dst_offset, *size),
            Command::CopyBufferToTexture2d { src, dst, region } => self.copy_buffer_to_texture(state, *src, *dst, region),
            Command::CopyTextureToBuffer { src, dst, region } => self.copy_texture_to_buffer(state, *src, *dst, region),
        }
    }

    fn begin_render(&self, state: &State, exec: &mut ExecState, target: RenderTargetKey, render_pass: RenderPassKey) {
        if exec.target.is_some() {
            self.report("render pass begun inside another render pass");
        }
        let Some(entry) = state.render_targets.get(target) else {
            self.report(&format!("begin_render with unknown render target {:?}", target));
            return;
        };
        let compatible = match (state.render_passes.get(render_pass), state.render_passes.get(entry.render_pass)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        };
        if !compatible {
            self.report(&format!("render pass {:?} is not compatible with render target {:?}", render_pass, target));
        }

        let color_like = entry.attachments.colors.iter().chain(&entry.attachments.resolves);
        for key in color_like {
            self.check_texture(state, *key, ResourceState::ColorAttachment, "begin_render");
        }
        if let Some(key) = entry.attachments.depth_stencil {
            self.check_texture(state, key, ResourceState::DepthStencilAttachment, "begin_render");
        }
        exec.target = Some(target);
    }

    /// Multisampled attachments are stored as a single sample, so resolving
    /// is a plain copy
    fn resolve(&self, state: &mut State, target: RenderTargetKey) {
        let Some(entry) = state.render_targets.get(target) else { return };
        let pairs: Vec<_> = entry
            .attachments
            .colors
            .iter()
            .copied()
            .zip(entry.attachments.resolves.iter().copied())
            .collect();
        for (src, dst) in pairs {
            let Some(data) = state.textures.get(src).map(|t| t.memory.bytes()[..t.desc.mip_size(0) as usize].to_vec())
            else {
                continue;
            };
            if let Some(texture) = state.textures.get_mut(dst) {
                let len = data.len().min(texture.desc.mip_size(0) as usize);
                texture.memory.bytes_mut()[..len].copy_from_slice(&data[..len]);
            }
        }
    }

    fn draw(&self, state: &mut State, exec: &ExecState, kind: DrawKind) {
        let dispatch = matches!(kind, DrawKind::Dispatch { .. });
        let Some(pipeline_key) = exec.pipeline else {
            self.report("draw or dispatch without a bound pipeline");
            return;
        };
        let Some(pipeline) = state.pipelines.get(pipeline_key) else {
            self.report(&format!("draw with destroyed pipeline {:?}", pipeline_key));
            return;
        };

        if pipeline.compute != dispatch {
            self.report("pipeline kind does not match the draw or dispatch");
        }
        if !dispatch {
            let pass = exec
                .target
                .and_then(|t| state.render_targets.get(t))
                .and_then(|t| state.render_passes.get(t.render_pass));
            if pass != pipeline.render_pass.as_ref() {
                self.report("pipeline was built for a different render pass than the one being drawn into");
            }
            if exec.vertex_buffers.len() < pipeline.vertex_bindings {
                self.report(&format!(
                    "pipeline reads {} vertex buffer bindings but {} are bound",
                    pipeline.vertex_bindings,
                    exec.vertex_buffers.len()
                ));
            }
        }

        if let Some(set) = exec.descriptor_set.and_then(|k| state.descriptor_sets.get(k)) {
            if let Some(binding) = set.bindings.iter().find(|b| !set.writes.contains_key(&b.binding)) {
                self.report(&format!("descriptor binding {} was never written", binding.binding));
            }
        }

        let record = DrawRecord {
            kind,
            pipeline: pipeline_key,
            pipeline_hash: pipeline.hash,
            render_target: exec.target,
            viewport: exec.viewport,
            scissor: exec.scissor,
            vertex_buffers: exec.vertex_buffers.clone(),
            index_buffer: exec.index_buffer,
            descriptor_set: exec.descriptor_set,
        };
        state.draw_log.push(record);
    }

    fn check_texture(&self, state: &State, key: TextureKey, expected: ResourceState, operation: &str) {
        match state.textures.get(key) {
            Some(texture) if texture.state == expected => {}
            Some(texture) if texture.state == ResourceState::General && expected != ResourceState::Present => {}
            Some(texture) => self.report(&format!(
                "{}: texture {:?} is in {:?}, expected {:?}",
                operation, key, texture.state, expected
            )),
            None => self.report(&format!("{}: unknown texture {:?}", operation, key)),
        }
    }

    fn copy_buffer(&self, state: &mut State, src: BufferKey, src_offset: u64, dst: BufferKey, dst_offset: u64, size: u64) {
        let data = match state.buffers.get(src) {
            Some(b) if src_offset + size <= b.size => {
                b.memory.bytes()[src_offset as usize..(src_offset + size) as usize].to_vec()
            }
            _ => {
                self.report("copy_buffer_to_buffer: source out of range or destroyed");
                return;
            }
        };
        match state.buffers.get_mut(dst) {
            Some(b) if dst_offset + size <= b.size => {
                b.memory.bytes_mut()[dst_offset as usize..(dst_offset + size) as usize].copy_from_slice(&data);
            }
            _ => self.report("copy_buffer_to_buffer: destination out of range or destroyed"),
        }
    }

    fn copy_buffer_to_texture(&self, state: &mut State, src: BufferKey, dst: TextureKey, region: &BufferTextureCopy) {
        self.check_texture(state, dst, ResourceState::TransferDst, "copy_buffer_to_texture2d");
        let Some(layout) = state.textures.get(dst).and_then(|t| texel_region(&t.desc, region)) else {
            self.report("copy_buffer_to_texture2d: region outside the texture");
            return;
        };
        let needed = region.buffer_offset + region.row_pitch as u64 * (region.height as u64 - 1) + layout.row_bytes as u64;
        let data = match state.buffers.get(src) {
            Some(b) if needed <= b.size => b.memory.bytes()[..b.size as usize].to_vec(),
            _ => {
                self.report("copy_buffer_to_texture2d: source buffer too small or destroyed");
                return;
            }
        };
        let Some(texture) = state.textures.get_mut(dst) else { return };
        let dst_bytes = texture.memory.bytes_mut();
        for row in 0..region.height as usize {
            let src_start = region.buffer_offset as usize + row * region.row_pitch as usize;
            let dst_start = layout.offset + row * layout.pitch;
            dst_bytes[dst_start..dst_start + layout.row_bytes]
                .copy_from_slice(&data[src_start..src_start + layout.row_bytes]);
        }
    }

    fn copy_texture_to_buffer(&self, state: &mut State, src: TextureKey, dst: BufferKey, region: &BufferTextureCopy) {
        self.check_texture(state, src, ResourceState::TransferSrc, "copy_texture_to_buffer");
        let Some((layout, data)) = state
            .textures
            .get(src)
            .and_then(|t| texel_region(&t.desc, region).map(|l| (l, t.memory.bytes().to_vec())))
        else {
            self.report("copy_texture_to_buffer: region outside the texture");
            return;
        };
        let needed = region.buffer_offset + region.row_pitch as u64 * (region.height as u64 - 1) + layout.row_bytes as u64;
        match state.buffers.get_mut(dst) {
            Some(b) if needed <= b.size => {
                let dst_bytes = b.memory.bytes_mut();
                for row in 0..region.height as usize {
                    let src_start = layout.offset + row * layout.pitch;
                    let dst_start = region.buffer_offset as usize + row * region.row_pitch as usize;
                    dst_bytes[dst_start..dst_start + layout.row_bytes]
                        .copy_from_slice(&data[src_start..src_start + layout.row_bytes]);
                }
            }
            _ => self.report("copy_texture_to_buffer: destination buffer too small or destroyed"),
        }
    }

    fn wait_semaphores(&self, state: &mut State, keys: &[SemaphoreKey], operation: &str) {
        for key in keys {
            match state.semaphores.get_mut(*key) {
                Some(s) if s.signaled || s.pending_signal => {
                    s.signaled = false;
                    s.pending_signal = false;
                }
                Some(_) => self.report(&format!(
                    "{} waits on semaphore {:?} which has no signal pending",
                    operation, key
                )),
                None => self.report(&format!("{} waits on unknown semaphore {:?}", operation, key)),
            }
        }
    }
}

struct TexelRegion {
    offset: usize,
    pitch: usize,
    row_bytes: usize,
}

fn texel_region(desc: &TextureDesc, region: &BufferTextureCopy) -> Option<TexelRegion> {
    if region.mip_level >= desc.mip_levels || region.height == 0 {
        return None;
    }
    let (width, height, _) = desc.mip_extent(region.mip_level);
    if region.width > width || region.height > height {
        return None;
    }
    let stride = desc.format.stride() as usize;
    let row_bytes = region.width as usize * stride;
    if (region.row_pitch as usize) < row_bytes {
        return None;
    }
    Some(TexelRegion {
        offset: desc.mip_offset(region.mip_level) as usize,
        pitch: width as usize * stride,
        row_bytes,
    })
}

/// Fill mip 0 of a texture with one encoded texel
fn fill_texture<F>(state: &mut State, key: TextureKey, encode: F)
where
    F: FnOnce(Format) -> Vec<u8>,
{
    let Some(texture) = state.textures.get_mut(key) else { return };
    let texel = encode(texture.desc.format);
    if texel.is_empty() {
        return;
    }
    let len = texture.desc.mip_size(0) as usize;
    for chunk in texture.memory.bytes_mut()[..len].chunks_exact_mut(texel.len()) {
        chunk.copy_from_slice(&texel);
    }
}

/// Encode an RGBA clear color in a color format's memory layout
pub fn encode_color(format: Format, rgba: [f32; 4]) -> Vec<u8> {
    let channels = format.channel_count() as usize;
    let mut values = rgba;
    if format.is_bgra() {
        values.swap(0, 2);
    }
    let mut out = Vec::with_capacity(format.stride() as usize);
    for &v in &values[..channels.min(4)] {
        match format.channel_kind() {
            Some(ChannelKind::Unorm8) => out.push((v.clamp(0.0, 1.0) * 255.0).round() as u8),
            Some(ChannelKind::Unorm16) => {
                out.extend_from_slice(&((v.clamp(0.0, 1.0) * 65535.0).round() as u16).to_le_bytes())
            }
            Some(ChannelKind::Float16) => out.extend_from_slice(&f16::from_f32(v).to_le_bytes()),
            Some(ChannelKind::Uint32) => out.extend_from_slice(&(v.max(0.0) as u32).to_le_bytes()),
            Some(ChannelKind::Float32) => out.extend_from_slice(&v.to_le_bytes()),
            None => return Vec::new(),
        }
    }
    out
}

/// Encode a depth/stencil clear value in a depth format's memory layout
pub fn encode_depth_stencil(format: Format, depth: f32, stencil: u32) -> Vec<u8> {
    let depth = depth.clamp(0.0, 1.0);
    let unorm16 = (depth * 65535.0).round() as u16;
    let unorm24 = (depth * 16_777_215.0).round() as u32;
    match format {
        Format::D16Unorm => unorm16.to_le_bytes().to_vec(),
        Format::X8D24UnormPack32 => unorm24.to_le_bytes().to_vec(),
        Format::D32Float => depth.to_le_bytes().to_vec(),
        Format::S8Uint => vec![stencil as u8],
        Format::D16UnormS8Uint => {
            let mut out = unorm16.to_le_bytes().to_vec();
            out.push(stencil as u8);
            out
        }
        Format::D24UnormS8Uint => (unorm24 | (stencil & 0xff) << 24).to_le_bytes().to_vec(),
        Format::D32FloatS8Uint => {
            let mut out = depth.to_le_bytes().to_vec();
            out.extend_from_slice(&[stencil as u8, 0, 0, 0]);
            out
        }
        _ => Vec::new(),
    }
}

fn hash_of<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

impl GraphicsBackend for HeadlessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Headless
    }

    fn limits(&self) -> BackendLimits {
        BackendLimits::default()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn swapchain_images(&self) -> SwapchainImages {
        SwapchainImages {
            images: self.state.lock().swapchain.clone(),
            format: self.swapchain_format,
            width: self.width,
            height: self.height,
        }
    }

    fn acquire_next_image(&self, signal: Option<SemaphoreKey>, fence: Option<FenceKey>) -> Result<u32> {
        let mut state = self.state.lock();
        if state.swapchain.is_empty() {
            bail!("Swapchain has no images");
        }

        if let Some(key) = signal {
            match state.semaphores.get_mut(key) {
                Some(s) if s.signaled || s.pending_signal => {
                    self.report(&format!("acquire signals semaphore {:?} which is already signaled", key))
                }
                Some(s) => s.signaled = true,
                None => bail!("Unknown semaphore {:?}", key),
            }
        }
        if let Some(key) = fence {
            match state.fences.get_mut(key) {
                Some(f) if f.signaled || f.pending => {
                    self.report(&format!("acquire signals fence {:?} which is already signaled or in use", key))
                }
                Some(f) => f.signaled = true,
                None => bail!("Unknown fence {:?}", key),
            }
        }

        let index = state.next_image;
        state.next_image = (index + 1) % state.swapchain.len() as u32;
        state.acquired = Some(index);
        Ok(index)
    }

    fn queue_present(&self, _queue: QueueKind, image_index: u32, wait: &[SemaphoreKey]) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        // Run everything that signals what we wait on, so the image state is final
        if let Some(last) = state
            .pending
            .iter()
            .rposition(|s| s.signal_semaphores.iter().any(|k| wait.contains(k)))
        {
            let mut remaining = last + 1;
            self.retire_until(state, |_| {
                remaining -= 1;
                remaining == 0
            });
        }
        self.wait_semaphores(state, wait, "present");

        if state.acquired != Some(image_index) {
            self.report(&format!("present of image {} which was not acquired", image_index));
        }
        let Some(&image) = state.swapchain.get(image_index as usize) else {
            bail!("Swapchain image index {} out of range", image_index);
        };
        self.check_texture(state, image, ResourceState::Present, "present");

        state.acquired = None;
        state.presented.push(image_index);
        Ok(())
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferAllocation> {
        let memory = HostMemory::new(desc.size)?;
        let mapped = desc.location.is_host_visible().then_some(memory.ptr);
        let key = self.state.lock().buffers.insert(BufferEntry {
            memory,
            size: desc.size,
            state: ResourceState::Undefined,
        });
        Ok(BufferAllocation { key, mapped })
    }

    fn destroy_buffer(&self, key: BufferKey) {
        self.state.lock().buffers.remove(key);
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureAllocation> {
        let memory = HostMemory::new(desc.total_size())?;
        let mapped = desc.host_visible.then_some(memory.ptr);
        let key = self.state.lock().textures.insert(TextureEntry {
            memory,
            desc: desc.clone(),
            state: ResourceState::Undefined,
            swapchain: false,
        });
        Ok(TextureAllocation { key, mapped })
    }

    fn destroy_texture(&self, key: TextureKey) {
        let mut state = self.state.lock();
        if state.textures.get(key).is_some_and(|t| !t.swapchain) {
            state.textures.remove(key);
        }
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<SamplerKey> {
        Ok(self.state.lock().samplers.insert(*desc))
    }

    fn destroy_sampler(&self, key: SamplerKey) {
        self.state.lock().samplers.remove(key);
    }

    fn create_shader_program(&self, desc: &ShaderProgramDesc) -> Result<ShaderKey> {
        Ok(self.state.lock().shaders.insert((desc.stages(), hash_of(desc))))
    }

    fn destroy_shader_program(&self, key: ShaderKey) {
        self.state.lock().shaders.remove(key);
    }

    fn create_descriptor_set(&self, bindings: &[DescriptorBinding]) -> Result<DescriptorSetKey> {
        Ok(self.state.lock().descriptor_sets.insert(DescriptorSetEntry {
            bindings: bindings.to_vec(),
            writes: HashMap::new(),
        }))
    }

    fn destroy_descriptor_set(&self, key: DescriptorSetKey) {
        self.state.lock().descriptor_sets.remove(key);
    }

    fn update_descriptor_set(&self, key: DescriptorSetKey, writes: &[DescriptorWrite]) -> Result<()> {
        let mut state = self.state.lock();
        let set = state.descriptor_sets.get_mut(key).context("Unknown descriptor set")?;
        for write in writes {
            if !set.bindings.iter().any(|b| b.binding == write.binding && b.ty == write.ty) {
                bail!("Descriptor set has no {:?} binding at slot {}", write.ty, write.binding);
            }
            set.writes.insert(write.binding, write.resources.clone());
        }
        Ok(())
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> Result<RenderPassKey> {
        Ok(self.state.lock().render_passes.insert(desc.clone()))
    }

    fn destroy_render_pass(&self, key: RenderPassKey) {
        self.state.lock().render_passes.remove(key);
    }

    fn create_render_target(
        &self,
        render_pass: RenderPassKey,
        attachments: &RenderTargetAttachments,
    ) -> Result<RenderTargetKey> {
        let mut state = self.state.lock();
        let pass = state.render_passes.get(render_pass).context("Unknown render pass")?;
        if attachments.colors.len() != pass.color_formats.len() {
            bail!(
                "Render pass has {} color attachments, target has {}",
                pass.color_formats.len(),
                attachments.colors.len()
            );
        }
        for (key, format) in attachments.colors.iter().zip(&pass.color_formats) {
            let texture = state.textures.get(*key).context("Unknown color attachment")?;
            if texture.desc.format != *format {
                bail!("Color attachment is {}, render pass expects {}", texture.desc.format, format);
            }
            if texture.desc.width != attachments.width || texture.desc.height != attachments.height {
                bail!("Color attachment size does not match the render target");
            }
        }
        if pass.resolve && attachments.resolves.len() != attachments.colors.len() {
            bail!("Multisampled render pass needs one resolve target per color attachment");
        }
        match (attachments.depth_stencil, pass.has_depth_stencil()) {
            (Some(key), true) => {
                let texture = state.textures.get(key).context("Unknown depth-stencil attachment")?;
                if texture.desc.format != pass.depth_stencil_format {
                    bail!(
                        "Depth attachment is {}, render pass expects {}",
                        texture.desc.format,
                        pass.depth_stencil_format
                    );
                }
            }
            (None, false) => {}
            _ => bail!("Depth-stencil attachment does not match the render pass"),
        }

        Ok(state.render_targets.insert(RenderTargetEntry {
            render_pass,
            attachments: attachments.clone(),
        }))
    }

    fn destroy_render_target(&self, key: RenderTargetKey) {
        self.state.lock().render_targets.remove(key);
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc<'_>) -> Result<PipelineKey> {
        let mut state = self.state.lock();
        let &(stages, shader_hash) = state.shaders.get(desc.shader).context("Unknown shader program")?;
        if stages.contains(ShaderStages::COMP) {
            bail!("Graphics pipeline from a compute shader program");
        }
        let render_pass = state.render_passes.get(desc.render_pass).context("Unknown render pass")?.clone();
        let bindings = desc
            .descriptor_set
            .and_then(|k| state.descriptor_sets.get(k))
            .map(|s| s.bindings.clone())
            .unwrap_or_default();
        let hash = hash_of(&(shader_hash, desc.vertex_layout, desc.settings, &render_pass, &bindings));

        Ok(state.pipelines.insert(PipelineEntry {
            compute: false,
            vertex_bindings: desc.vertex_layout.bindings().len(),
            render_pass: Some(render_pass),
            hash,
        }))
    }

    fn create_compute_pipeline(&self, shader: ShaderKey, descriptor_set: Option<DescriptorSetKey>) -> Result<PipelineKey> {
        let mut state = self.state.lock();
        let &(stages, shader_hash) = state.shaders.get(shader).context("Unknown shader program")?;
        if !stages.contains(ShaderStages::COMP) {
            bail!("Compute pipeline from a graphics shader program");
        }
        let bindings = descriptor_set
            .and_then(|k| state.descriptor_sets.get(k))
            .map(|s| s.bindings.clone())
            .unwrap_or_default();
        Ok(state.pipelines.insert(PipelineEntry {
            compute: true,
            render_pass: None,
            vertex_bindings: 0,
            hash: hash_of(&(shader_hash, &bindings)),
        }))
    }

    fn destroy_pipeline(&self, key: PipelineKey) {
        self.state.lock().pipelines.remove(key);
    }

    fn create_cmd_pool(&self, queue: QueueKind) -> Result<CmdPoolKey> {
        Ok(self.state.lock().pools.insert(PoolEntry { queue, cmds: Vec::new() }))
    }

    fn destroy_cmd_pool(&self, key: CmdPoolKey) {
        let mut state = self.state.lock();
        if let Some(pool) = state.pools.remove(key) {
            for cmd in pool.cmds {
                state.cmds.remove(cmd);
            }
        }
    }

    fn allocate_cmd(&self, pool: CmdPoolKey) -> Result<CmdKey> {
        let mut state = self.state.lock();
        if !state.pools.contains_key(pool) {
            bail!("Unknown command pool");
        }
        let key = state.cmds.insert(CmdEntry {
            pool,
            recording: false,
            commands: Vec::new(),
        });
        if let Some(entry) = state.pools.get_mut(pool) {
            entry.cmds.push(key);
        }
        Ok(key)
    }

    fn free_cmd(&self, pool: CmdPoolKey, key: CmdKey) {
        let mut state = self.state.lock();
        state.cmds.remove(key);
        if let Some(entry) = state.pools.get_mut(pool) {
            entry.cmds.retain(|k| *k != key);
        }
    }

    fn begin_cmd(&self, key: CmdKey) -> Result<()> {
        let mut state = self.state.lock();
        let cmd = state.cmds.get_mut(key).context("Unknown command buffer")?;
        cmd.commands.clear();
        cmd.recording = true;
        Ok(())
    }

    fn end_cmd(&self, key: CmdKey) -> Result<()> {
        let mut state = self.state.lock();
        let cmd = state.cmds.get_mut(key).context("Unknown command buffer")?;
        if !cmd.recording {
            bail!("Command buffer is not recording");
        }
        cmd.recording = false;
        Ok(())
    }

    fn record(&self, key: CmdKey, command: &Command) {
        let mut state = self.state.lock();
        match state.cmds.get_mut(key) {
            Some(cmd) if cmd.recording => cmd.commands.push(command.clone()),
            Some(_) => self.report("command recorded into a command buffer that is not recording"),
            None => self.report(&format!("command recorded into unknown command buffer {:?}", key)),
        }
    }

    fn create_fence(&self, signaled: bool) -> Result<FenceKey> {
        Ok(self.state.lock().fences.insert(FenceEntry {
            signaled,
            pending: false,
        }))
    }

    fn destroy_fence(&self, key: FenceKey) {
        self.state.lock().fences.remove(key);
    }

    fn wait_for_fences(&self, fences: &[FenceKey]) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        for &key in fences {
            let entry = state.fences.get(key).context("Unknown fence")?;
            if entry.signaled {
                continue;
            }
            if !entry.pending {
                bail!("Waiting on fence {:?} which is unsignaled and not submitted; this would never return", key);
            }
            self.retire_until(state, |s| s.fence == Some(key));
        }
        Ok(())
    }

    fn reset_fences(&self, fences: &[FenceKey]) -> Result<()> {
        let mut state = self.state.lock();
        for &key in fences {
            let entry = state.fences.get_mut(key).context("Unknown fence")?;
            if entry.pending {
                self.report(&format!("reset of fence {:?} while its submission is in flight", key));
            }
            entry.signaled = false;
        }
        Ok(())
    }

    fn fence_signaled(&self, key: FenceKey) -> Result<bool> {
        let state = self.state.lock();
        Ok(state.fences.get(key).context("Unknown fence")?.signaled)
    }

    fn create_semaphore(&self) -> Result<SemaphoreKey> {
        Ok(self.state.lock().semaphores.insert(SemaphoreEntry::default()))
    }

    fn destroy_semaphore(&self, key: SemaphoreKey) {
        self.state.lock().semaphores.remove(key);
    }

    fn queue_submit(&self, queue: QueueKind, submit: &SubmitInfo<'_>) -> Result<u64> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let mut commands = Vec::with_capacity(submit.cmds.len());
        for &key in submit.cmds {
            let cmd = state.cmds.get(key).context("Unknown command buffer")?;
            if cmd.recording {
                bail!("Submitted command buffer {:?} is still recording", key);
            }
            if state.pools.get(cmd.pool).map(|p| p.queue) != Some(queue) {
                self.report(&format!("command buffer {:?} submitted to a queue its pool was not created for", key));
            }
            commands.push(cmd.commands.clone());
        }

        self.wait_semaphores(state, submit.wait_semaphores, "queue_submit");
        for &key in submit.signal_semaphores {
            match state.semaphores.get_mut(key) {
                Some(s) if s.signaled || s.pending_signal => {
                    self.report(&format!("queue_submit signals semaphore {:?} which is already signaled", key))
                }
                Some(s) => s.pending_signal = true,
                None => bail!("Unknown semaphore {:?}", key),
            }
        }
        if let Some(key) = submit.fence {
            let fence = state.fences.get_mut(key).context("Unknown fence")?;
            if fence.signaled || fence.pending {
                self.report(&format!("queue_submit with fence {:?} which is already signaled or in use", key));
            }
            fence.signaled = false;
            fence.pending = true;
        }

        let serial = state.next_serial.entry(queue).or_insert(0);
        *serial += 1;
        let serial = *serial;

        state.pending.push_back(Submission {
            queue,
            serial,
            commands,
            signal_semaphores: submit.signal_semaphores.to_vec(),
            fence: submit.fence,
        });
        state.submissions += 1;

        if self.max_pending_submissions > 0 {
            while state.pending.len() > self.max_pending_submissions {
                self.retire_until(state, |_| true);
            }
        }
        Ok(serial)
    }

    fn completed_serial(&self, queue: QueueKind) -> u64 {
        self.state.lock().completed_serial.get(&queue).copied().unwrap_or(0)
    }

    fn queue_wait_idle(&self, queue: QueueKind) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(last) = state.pending.iter().rposition(|s| s.queue == queue) {
            let mut remaining = last + 1;
            self.retire_until(state, |_| {
                remaining -= 1;
                remaining == 0
            });
        }
        Ok(())
    }

    fn device_wait_idle(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.retire_all(&mut state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_encoding_follows_format_layout() {
        assert_eq!(encode_color(Format::R8G8B8A8Unorm, [1.0, 0.0, 0.5, 1.0]), vec![255, 0, 128, 255]);
        assert_eq!(encode_color(Format::B8G8R8A8Unorm, [1.0, 0.0, 0.0, 1.0]), vec![0, 0, 255, 255]);
        assert_eq!(encode_color(Format::R32Float, [0.25, 9.0, 9.0, 9.0]), 0.25f32.to_le_bytes().to_vec());

        let half = encode_color(Format::R16G16Float, [1.0, -2.0, 0.0, 0.0]);
        assert_eq!(half.len(), 4);
        assert_eq!(f16::from_le_bytes([half[0], half[1]]).to_f32(), 1.0);
        assert_eq!(f16::from_le_bytes([half[2], half[3]]).to_f32(), -2.0);
    }

    #[test]
    fn depth_encoding_packs_stencil() {
        assert_eq!(encode_depth_stencil(Format::D16Unorm, 1.0, 0), vec![0xff, 0xff]);
        assert_eq!(encode_depth_stencil(Format::D24UnormS8Uint, 1.0, 3), vec![0xff, 0xff, 0xff, 3]);
        assert_eq!(encode_depth_stencil(Format::D32FloatS8Uint, 0.0, 7).len(), 8);
        assert!(encode_depth_stencil(Format::R8Unorm, 1.0, 0).is_empty());
    }

    #[test]
    fn texel_region_rejects_out_of_bounds() {
        let desc = TextureDesc {
            mip_levels: 2,
            ..TextureDesc::new_2d(8, 8, Format::R8G8B8A8Unorm, TextureUsage::TRANSFER_DST)
        };
        let region = BufferTextureCopy {
            buffer_offset: 0,
            row_pitch: 16,
            mip_level: 1,
            width: 4,
            height: 4,
        };
        let layout = texel_region(&desc, &region).expect("mip 1 is 4x4");
        assert_eq!(layout.offset, 256);
        assert_eq!(layout.pitch, 16);

        assert!(texel_region(&desc, &BufferTextureCopy { width: 5, ..region }).is_none());
        assert!(texel_region(&desc, &BufferTextureCopy { mip_level: 2, ..region }).is_none());
        assert!(texel_region(&desc, &BufferTextureCopy { row_pitch: 8, ..region }).is_none());
    }
}
