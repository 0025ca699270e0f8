// Command pools and command buffers
//
// A command buffer is a linear recording translated 1:1 into native calls.
// Its lifecycle:
//
//   Initial --begin--> Recording --end--> Executable --submit--> Pending
//      ^                                      ^                     |
//      |                                      +---- GPU completes --+
//      +---- reset ---- Invalid <---- begin while still pending ----+
//
// Recording outside `Recording` is a programming error and panics, as does
// an unmatched begin_render / end_render.

use anyhow::{bail, Context, Result};
use std::sync::Arc;

use crate::backend::{
    BufferTextureCopy, CmdKey, CmdPoolKey, Command, PipelineKey, VertexBufferBinding,
};
use crate::descriptor::DescriptorSet;
use crate::device::Device;
use crate::pipeline::Pipeline;
use crate::render_target::RenderTarget;
use crate::resource::{Buffer, Texture};
use crate::types::{Access, ClearValue, QueueKind, ResourceState, ScissorRect, Viewport};
use crate::validation::{check_buffer_state, check_texture_state, ResourceId, TrackedOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    Initial,
    Recording,
    Executable,
    Pending,
    Invalid,
}

struct PoolInner {
    device: Arc<Device>,
    key: CmdPoolKey,
    queue: QueueKind,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.device.backend().destroy_cmd_pool(self.key);
    }
}

/// Allocates command buffers for one queue. Buffers keep their pool alive.
#[derive(Clone)]
pub struct CommandPool {
    inner: Arc<PoolInner>,
}

impl CommandPool {
    pub fn new(device: &Arc<Device>, queue: QueueKind) -> Result<Self> {
        let key = device
            .backend()
            .create_cmd_pool(queue)
            .context("Failed to create command pool")?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                device: device.clone(),
                key,
                queue,
            }),
        })
    }

    pub fn key(&self) -> CmdPoolKey {
        self.inner.key
    }

    pub fn queue(&self) -> QueueKind {
        self.inner.queue
    }

    pub fn allocate(&self) -> Result<CommandBuffer> {
        let key = self
            .inner
            .device
            .backend()
            .allocate_cmd(self.inner.key)
            .context("Failed to allocate command buffer")?;
        Ok(CommandBuffer {
            pool: self.inner.clone(),
            key,
            state: CommandBufferState::Initial,
            submission: None,
            in_render: None,
            bound_pipeline: None,
            vertex_buffers: Vec::new(),
            index_buffer: None,
            set_uses: Vec::new(),
            tracked: Vec::new(),
        })
    }

    pub fn allocate_n(&self, count: usize) -> Result<Vec<CommandBuffer>> {
        (0..count).map(|_| self.allocate()).collect()
    }
}

pub struct CommandBuffer {
    pool: Arc<PoolInner>,
    key: CmdKey,
    state: CommandBufferState,
    submission: Option<u64>,
    /// Extent of the open render pass
    in_render: Option<(u32, u32)>,
    bound_pipeline: Option<(PipelineKey, bool)>,
    vertex_buffers: Vec<ResourceId>,
    index_buffer: Option<ResourceId>,
    set_uses: Vec<(ResourceId, Access)>,
    tracked: Vec<TrackedOp>,
}

impl CommandBuffer {
    pub fn key(&self) -> CmdKey {
        self.key
    }

    pub fn queue(&self) -> QueueKind {
        self.pool.queue
    }

    /// Serial of the last submission, if any
    pub fn submission_serial(&self) -> Option<u64> {
        self.submission
    }

    pub fn state(&self) -> CommandBufferState {
        match (self.state, self.submission) {
            (CommandBufferState::Pending, Some(serial))
                if self.device().backend().completed_serial(self.pool.queue) >= serial =>
            {
                CommandBufferState::Executable
            }
            (state, _) => state,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.state == CommandBufferState::Recording
    }

    pub fn in_render_pass(&self) -> bool {
        self.in_render.is_some()
    }

    fn device(&self) -> &Arc<Device> {
        &self.pool.device
    }

    /// Start recording. Fails, after reporting on the `command` component,
    /// when the buffer is still pending (which also invalidates it) or invalid.
    pub fn begin(&mut self) -> Result<()> {
        match self.state() {
            CommandBufferState::Initial | CommandBufferState::Executable => {}
            CommandBufferState::Recording => panic!("begin_cmd: command buffer is already recording"),
            CommandBufferState::Pending => {
                self.state = CommandBufferState::Invalid;
                let message = "begin_cmd on a command buffer whose submission has not completed";
                self.device().messenger().error("command", message);
                bail!(message);
            }
            CommandBufferState::Invalid => {
                let message = "begin_cmd on an invalid command buffer; reset it first";
                self.device().messenger().error("command", message);
                bail!(message);
            }
        }

        self.device()
            .backend()
            .begin_cmd(self.key)
            .context("Failed to begin command buffer")?;

        self.state = CommandBufferState::Recording;
        self.in_render = None;
        self.bound_pipeline = None;
        self.vertex_buffers.clear();
        self.index_buffer = None;
        self.set_uses.clear();
        self.tracked.clear();
        Ok(())
    }

    pub fn end(&mut self) -> Result<()> {
        self.assert_recording("end_cmd");
        assert!(self.in_render.is_none(), "end_cmd: render pass still open");
        self.device()
            .backend()
            .end_cmd(self.key)
            .context("Failed to end command buffer")?;
        self.state = CommandBufferState::Executable;
        Ok(())
    }

    /// Return to `Initial`; the next `begin` re-records from scratch.
    ///
    /// A buffer whose last submission has not completed is not reset: it is
    /// marked `Invalid` and the error is reported on the `command` component.
    pub fn reset(&mut self) {
        if self.in_flight() {
            self.state = CommandBufferState::Invalid;
            self.device()
                .messenger()
                .error("command", "reset of a command buffer whose submission has not completed");
            return;
        }
        self.state = CommandBufferState::Initial;
        self.tracked.clear();
    }

    fn in_flight(&self) -> bool {
        self.submission
            .is_some_and(|serial| self.device().backend().completed_serial(self.pool.queue) < serial)
    }

    pub(crate) fn mark_submitted(&mut self, serial: u64) {
        self.state = CommandBufferState::Pending;
        self.submission = Some(serial);
    }

    pub(crate) fn tracked_ops(&self) -> &[TrackedOp] {
        &self.tracked
    }

    fn assert_recording(&self, op: &str) {
        assert!(
            self.state == CommandBufferState::Recording,
            "{}: command buffer is not recording (state {:?})",
            op,
            self.state
        );
    }

    fn assert_in_render(&self, op: &str) {
        self.assert_recording(op);
        assert!(self.in_render.is_some(), "{}: requires an open render pass", op);
    }

    fn assert_outside_render(&self, op: &str) {
        self.assert_recording(op);
        assert!(self.in_render.is_none(), "{}: not allowed inside a render pass", op);
    }

    fn record(&self, command: Command) {
        self.device().backend().record(self.key, &command);
    }

    fn track_use(&mut self, resource: ResourceId, access: Access, operation: &'static str) {
        if self.device().validation_enabled() {
            self.tracked.push(TrackedOp::Use {
                resource,
                access,
                operation,
            });
        }
    }

    fn track_transition(&mut self, resource: ResourceId, old: ResourceState, new: ResourceState) {
        if self.device().validation_enabled() {
            self.tracked.push(TrackedOp::Transition { resource, old, new });
        }
    }

    pub fn begin_render(&mut self, target: &RenderTarget) {
        self.assert_recording("begin_render");
        assert!(self.in_render.is_none(), "begin_render: render pass already open");

        for texture in target.color_attachments().iter().chain(target.resolve_attachments()) {
            self.track_use(texture.id(), Access::ColorWrite, "begin_render");
        }
        if let Some(depth) = target.depth_stencil_attachment() {
            self.track_use(depth.id(), Access::DepthStencilWrite, "begin_render");
        }

        self.record(Command::BeginRender {
            target: target.key(),
            render_pass: target.render_pass().key(),
        });
        self.in_render = Some((target.width(), target.height()));
    }

    pub fn end_render(&mut self) {
        self.assert_recording("end_render");
        assert!(self.in_render.is_some(), "end_render: no render pass is open");
        self.record(Command::EndRender);
        self.in_render = None;
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.assert_recording("set_viewport");
        self.record(Command::SetViewport(viewport));
    }

    pub fn set_scissor(&mut self, scissor: ScissorRect) {
        self.assert_recording("set_scissor");
        self.record(Command::SetScissor(scissor));
    }

    /// Viewport and scissor covering the open render pass
    pub fn set_full_viewport(&mut self) {
        let (width, height) = self.in_render.unwrap_or_else(|| panic!("set_full_viewport: requires an open render pass"));
        self.set_viewport(Viewport::full(width, height));
        self.set_scissor(ScissorRect::full(width, height));
    }

    pub fn clear_color_attachment(&mut self, index: u32, value: ClearValue) {
        self.assert_in_render("clear_color_attachment");
        self.record(Command::ClearColorAttachment { index, value });
    }

    pub fn clear_depth_stencil_attachment(&mut self, value: ClearValue) {
        self.assert_in_render("clear_depth_stencil_attachment");
        self.record(Command::ClearDepthStencilAttachment { value });
    }

    pub fn bind_pipeline(&mut self, pipeline: &Pipeline) {
        self.assert_recording("bind_pipeline");
        self.bound_pipeline = Some((pipeline.key(), pipeline.is_compute()));
        self.record(Command::BindPipeline(pipeline.key()));
    }

    pub fn bind_descriptor_sets(&mut self, pipeline: &Pipeline, set: &DescriptorSet) {
        self.assert_recording("bind_descriptor_sets");
        if self.device().validation_enabled() {
            set.check_layout(pipeline.descriptor_bindings());
            set.check_complete();
        }
        self.set_uses = set.resource_uses().collect();
        self.record(Command::BindDescriptorSets {
            pipeline: pipeline.key(),
            set: set.key(),
        });
    }

    pub fn bind_vertex_buffers(&mut self, buffers: &[&Buffer]) {
        self.assert_recording("bind_vertex_buffers");
        self.vertex_buffers = buffers.iter().map(|b| b.id()).collect();
        let bindings = buffers
            .iter()
            .map(|b| VertexBufferBinding {
                buffer: b.key(),
                offset: 0,
                size: b.size(),
                stride: b.vertex_stride(),
            })
            .collect();
        self.record(Command::BindVertexBuffers(bindings));
    }

    pub fn bind_index_buffer(&mut self, buffer: &Buffer) {
        self.assert_recording("bind_index_buffer");
        self.index_buffer = Some(buffer.id());
        self.record(Command::BindIndexBuffer {
            buffer: buffer.key(),
            index_type: buffer.index_type(),
            offset: 0,
            size: buffer.size(),
        });
    }

    fn track_bound_set(&mut self, operation: &'static str) {
        let uses = std::mem::take(&mut self.set_uses);
        for &(resource, access) in &uses {
            self.track_use(resource, access, operation);
        }
        self.set_uses = uses;
    }

    pub fn draw(&mut self, vertex_count: u32, first_vertex: u32) {
        self.assert_in_render("draw");
        assert!(
            matches!(self.bound_pipeline, Some((_, false))),
            "draw: no graphics pipeline bound"
        );
        for resource in self.vertex_buffers.clone() {
            self.track_use(resource, Access::VertexInput, "draw");
        }
        self.track_bound_set("draw");
        self.record(Command::Draw {
            vertex_count,
            first_vertex,
        });
    }

    pub fn draw_indexed(&mut self, index_count: u32, first_index: u32) {
        self.assert_in_render("draw_indexed");
        assert!(
            matches!(self.bound_pipeline, Some((_, false))),
            "draw_indexed: no graphics pipeline bound"
        );
        let index = self.index_buffer.unwrap_or_else(|| panic!("draw_indexed: no index buffer bound"));
        self.track_use(index, Access::IndexInput, "draw_indexed");
        for resource in self.vertex_buffers.clone() {
            self.track_use(resource, Access::VertexInput, "draw_indexed");
        }
        self.track_bound_set("draw_indexed");
        self.record(Command::DrawIndexed {
            index_count,
            first_index,
        });
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.assert_outside_render("dispatch");
        assert!(
            matches!(self.bound_pipeline, Some((_, true))),
            "dispatch: no compute pipeline bound"
        );
        self.track_bound_set("dispatch");
        self.record(Command::Dispatch { x, y, z });
    }

    /// Record a barrier moving `buffer` from `old` (asserted, not checked) to `new`
    pub fn buffer_transition(&mut self, buffer: &Buffer, old: ResourceState, new: ResourceState) {
        self.assert_outside_render("buffer_transition");
        if let Some(violation) = check_buffer_state(buffer.key(), buffer.usage(), new) {
            self.device().report(violation);
        }
        self.track_transition(buffer.id(), old, new);
        self.record(Command::BufferTransition {
            buffer: buffer.key(),
            old,
            new,
        });
        buffer.set_state(new);
    }

    /// Record a barrier moving `texture` from `old` (asserted, not checked) to `new`
    pub fn image_transition(&mut self, texture: &Texture, old: ResourceState, new: ResourceState) {
        self.assert_outside_render("image_transition");
        if let Some(violation) = check_texture_state(texture.key(), texture.usage(), new) {
            self.device().report(violation);
        }
        self.track_transition(texture.id(), old, new);
        self.record(Command::TextureTransition {
            texture: texture.key(),
            old,
            new,
        });
        texture.set_state(new);
    }

    /// Transition the images a render target finally writes (the swapchain
    /// image for swapchain targets)
    pub fn render_target_transition(&mut self, target: &RenderTarget, old: ResourceState, new: ResourceState) {
        for texture in target.output_attachments() {
            self.image_transition(texture, old, new);
        }
    }

    pub fn depth_stencil_transition(&mut self, target: &RenderTarget, old: ResourceState, new: ResourceState) {
        if let Some(depth) = target.depth_stencil_attachment() {
            self.image_transition(depth, old, new);
        }
    }

    pub fn copy_buffer_to_buffer(&mut self, src: &Buffer, src_offset: u64, dst: &Buffer, dst_offset: u64, size: u64) {
        self.assert_outside_render("copy_buffer_to_buffer");
        let in_bounds = |offset: u64, buffer: &Buffer| offset.checked_add(size).is_some_and(|end| end <= buffer.size());
        assert!(
            in_bounds(src_offset, src) && in_bounds(dst_offset, dst),
            "copy_buffer_to_buffer: region out of bounds"
        );
        self.track_use(src.id(), Access::CopySrc, "copy_buffer_to_buffer");
        self.track_use(dst.id(), Access::CopyDst, "copy_buffer_to_buffer");
        self.record(Command::CopyBufferToBuffer {
            src: src.key(),
            src_offset,
            dst: dst.key(),
            dst_offset,
            size,
        });
    }

    pub fn copy_buffer_to_texture2d(&mut self, src: &Buffer, dst: &Texture, region: BufferTextureCopy) {
        self.assert_outside_render("copy_buffer_to_texture2d");
        self.track_use(src.id(), Access::CopySrc, "copy_buffer_to_texture2d");
        self.track_use(dst.id(), Access::CopyDst, "copy_buffer_to_texture2d");
        self.record(Command::CopyBufferToTexture2d {
            src: src.key(),
            dst: dst.key(),
            region,
        });
    }

    pub fn copy_texture_to_buffer(&mut self, src: &Texture, dst: &Buffer, region: BufferTextureCopy) {
        self.assert_outside_render("copy_texture_to_buffer");
        self.track_use(src.id(), Access::CopySrc, "copy_texture_to_buffer");
        self.track_use(dst.id(), Access::CopyDst, "copy_texture_to_buffer");
        self.record(Command::CopyTextureToBuffer {
            src: src.key(),
            dst: dst.key(),
            region,
        });
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        if self.in_flight() {
            if let Err(e) = self.device().backend().queue_wait_idle(self.pool.queue) {
                log::warn!("Queue wait before freeing a pending command buffer failed: {:?}", e);
            }
        }
        self.pool.device.backend().free_cmd(self.pool.key, self.key);
    }
}
