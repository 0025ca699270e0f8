// Renderer - device, queues, swapchain render targets and frame pacing
//
// The frame loop cycles through `image_count` slots. Slot k owns one set of
// synchronization objects (see `FrameSync`) and is reused every
// `image_count` frames:
//
//   acquire_next_image  wait slot fence, acquire, signal acquisition sem+fence
//   queue_submit        wait acquisition sem, signal render-complete sem+fence
//   queue_present       wait render-complete sem, frame_count += 1
//
// Waiting on the slot's render-complete fence at acquire time guarantees the
// slot's objects (and any per-slot command buffers) are idle before reuse.

use anyhow::{bail, Context, Result};
use std::cell::Cell;
use std::sync::Arc;

use crate::backend::headless::HeadlessBackend;
use crate::command::{CommandBuffer, CommandPool};
use crate::config::RendererSettings;
use crate::device::Device;
use crate::format::Format;
use crate::queue::Queue;
use crate::render_target::{RenderPass, RenderPassDesc, RenderTarget};
use crate::resource::{Texture, TextureDesc};
use crate::sync::{FrameSync, Semaphore};
use crate::types::{QueueKind, ResourceState, TextureUsage};
use crate::util::submit_one_shot;
use crate::validation::Violation;

pub struct Renderer {
    settings: RendererSettings,
    swapchain_render_targets: Vec<RenderTarget>,
    frame_sync: Vec<FrameSync>,
    util_pool: CommandPool,
    graphics_queue: Queue,
    present_queue: Queue,
    frame_count: Cell<u64>,
    swapchain_image_index: Cell<u32>,
    device: Arc<Device>,
}

impl Renderer {
    pub fn new(app_name: &str, settings: RendererSettings) -> Result<Self> {
        log::info!("Initializing renderer '{}' ({:?})...", app_name, settings.backend);

        if settings.width == 0 || settings.height == 0 {
            bail!("Renderer size must be non-zero, got {}x{}", settings.width, settings.height);
        }
        if settings.swapchain.image_count == 0 {
            bail!("Swapchain image count must be at least 1");
        }
        if settings.swapchain.color_format == Format::Undefined {
            bail!("Swapchain color format must not be undefined");
        }

        let device = Device::new(app_name, &settings)?;
        let graphics_queue = Queue::new(&device, QueueKind::Graphics);
        let present_queue = Queue::new(&device, QueueKind::Present);
        let util_pool = CommandPool::new(&device, QueueKind::Graphics)?;

        let swapchain_render_targets = create_swapchain_render_targets(&device, &settings)?;
        log::info!(
            "Swapchain: {} images, {}x{}, {}",
            swapchain_render_targets.len(),
            swapchain_render_targets[0].width(),
            swapchain_render_targets[0].height(),
            settings.swapchain.color_format
        );

        // Put every swapchain attachment into the state the frame loop expects
        submit_one_shot(&util_pool, &graphics_queue, |cmd| {
            for target in &swapchain_render_targets {
                cmd.render_target_transition(target, ResourceState::Undefined, ResourceState::Present);
                if target.sample_count() > 1 {
                    for color in target.color_attachments() {
                        cmd.image_transition(color, ResourceState::Undefined, ResourceState::ColorAttachment);
                    }
                }
                cmd.depth_stencil_transition(
                    target,
                    ResourceState::Undefined,
                    ResourceState::DepthStencilAttachment,
                );
            }
        })
        .context("Failed to transition swapchain images")?;

        let frame_sync = (0..swapchain_render_targets.len())
            .map(|_| FrameSync::new(&device))
            .collect::<Result<Vec<_>>>()
            .context("Failed to create frame synchronization objects")?;

        log::info!("Renderer initialized");

        Ok(Self {
            settings,
            swapchain_render_targets,
            frame_sync,
            util_pool,
            graphics_queue,
            present_queue,
            frame_count: Cell::new(0),
            swapchain_image_index: Cell::new(0),
            device,
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn settings(&self) -> &RendererSettings {
        &self.settings
    }

    pub fn graphics_queue(&self) -> &Queue {
        &self.graphics_queue
    }

    pub fn present_queue(&self) -> &Queue {
        &self.present_queue
    }

    pub(crate) fn util_pool(&self) -> &CommandPool {
        &self.util_pool
    }

    /// Number of swapchain images, and with it the number of frame slots
    pub fn image_count(&self) -> u32 {
        self.swapchain_render_targets.len() as u32
    }

    /// Frames presented so far
    pub fn frame_count(&self) -> u64 {
        self.frame_count.get()
    }

    /// Slot of the frame in flight: `frame_count % image_count`
    pub fn frame_index(&self) -> u32 {
        (self.frame_count.get() % self.image_count() as u64) as u32
    }

    /// Image returned by the last `acquire_next_image`
    pub fn swapchain_image_index(&self) -> u32 {
        self.swapchain_image_index.get()
    }

    pub fn swapchain_render_targets(&self) -> &[RenderTarget] {
        &self.swapchain_render_targets
    }

    pub fn swapchain_render_target(&self, index: u32) -> &RenderTarget {
        &self.swapchain_render_targets[index as usize]
    }

    /// Render target of the most recently acquired image
    pub fn current_render_target(&self) -> &RenderTarget {
        self.swapchain_render_target(self.swapchain_image_index.get())
    }

    pub fn frame_sync(&self, slot: u32) -> &FrameSync {
        &self.frame_sync[slot as usize]
    }

    /// Synchronization objects of the frame in flight
    pub fn current_frame_sync(&self) -> &FrameSync {
        self.frame_sync(self.frame_index())
    }

    /// Acquire the next swapchain image for the current slot.
    ///
    /// Blocks until the slot's previous frame has finished executing and the
    /// image is available. The slot's acquisition semaphore is signaled for
    /// the frame's submission to wait on.
    pub fn acquire_next_image(&self) -> Result<u32> {
        let sync = self.current_frame_sync();

        sync.render_complete_fence
            .wait()
            .context("Failed to wait for the previous frame in this slot")?;

        let index = self
            .device
            .backend()
            .acquire_next_image(
                Some(sync.image_acquired_semaphore.key()),
                Some(sync.image_acquired_fence.key()),
            )
            .context("Failed to acquire swapchain image")?;

        sync.image_acquired_fence
            .wait_and_reset()
            .context("Failed to wait for image acquisition")?;
        sync.render_fence_armed.set(false);

        if index >= self.image_count() {
            bail!("Backend returned swapchain image {} of {}", index, self.image_count());
        }
        self.swapchain_image_index.set(index);
        Ok(index)
    }

    /// Submit to the graphics queue.
    ///
    /// When `signal` contains the current slot's render-complete semaphore,
    /// the slot's render-complete fence is attached so the next acquire of
    /// this slot can wait for the frame.
    pub fn queue_submit(
        &self,
        cmds: &mut [&mut CommandBuffer],
        wait: &[&Semaphore],
        signal: &[&Semaphore],
    ) -> Result<u64> {
        let sync = self.current_frame_sync();
        let signals_frame = signal
            .iter()
            .any(|s| s.key() == sync.render_complete_semaphore.key());

        let fence = if signals_frame && !sync.render_fence_armed.get() {
            sync.render_complete_fence.reset()?;
            Some(&sync.render_complete_fence)
        } else {
            None
        };

        let serial = self.graphics_queue.submit(cmds, wait, signal, fence)?;
        if fence.is_some() {
            sync.render_fence_armed.set(true);
        }
        Ok(serial)
    }

    /// Present the acquired image once `wait` has been signaled, then advance
    /// to the next frame slot
    pub fn queue_present(&self, wait: &[&Semaphore]) -> Result<()> {
        let index = self.swapchain_image_index.get();
        let target = self.swapchain_render_target(index);
        if let Some(image) = target.output_attachments().first() {
            self.device.check_present(image.key(), index);
        }

        let wait_keys: Vec<_> = wait.iter().map(|s| s.key()).collect();
        self.device
            .backend()
            .queue_present(self.present_queue.kind(), index, &wait_keys)
            .context("Failed to present swapchain image")?;

        self.frame_count.set(self.frame_count.get() + 1);
        Ok(())
    }

    /// Acquire an image, begin `cmd` and move the image into
    /// `ColorAttachment`. Returns the target to render into.
    pub fn begin_frame(&self, cmd: &mut CommandBuffer) -> Result<&RenderTarget> {
        self.acquire_next_image()?;
        cmd.begin()?;
        let target = self.current_render_target();
        cmd.render_target_transition(target, ResourceState::Present, ResourceState::ColorAttachment);
        Ok(target)
    }

    /// Move the image back to `Present`, end and submit `cmd`, then present
    pub fn end_frame(&self, cmd: &mut CommandBuffer) -> Result<()> {
        let target = self.current_render_target();
        cmd.render_target_transition(target, ResourceState::ColorAttachment, ResourceState::Present);
        cmd.end()?;

        let sync = self.current_frame_sync();
        self.queue_submit(
            &mut [cmd],
            &[&sync.image_acquired_semaphore],
            &[&sync.render_complete_semaphore],
        )?;
        self.queue_present(&[&sync.render_complete_semaphore])
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }

    /// Violations found by the shadow state model so far
    pub fn violations(&self) -> Vec<Violation> {
        self.device.violations()
    }

    pub fn take_violations(&self) -> Vec<Violation> {
        self.device.take_violations()
    }

    /// The headless backend, when that is what the renderer runs on
    pub fn headless(&self) -> Option<&HeadlessBackend> {
        self.device.backend().as_any().downcast_ref::<HeadlessBackend>()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Destroying renderer after {} frames...", self.frame_count.get());
        if let Err(e) = self.device.wait_idle() {
            log::warn!("Wait idle failed during renderer teardown: {:?}", e);
        }
    }
}

/// One render target per swapchain image. With MSAA the swapchain image is
/// the resolve target of a per-image multisampled color attachment.
fn create_swapchain_render_targets(device: &Arc<Device>, settings: &RendererSettings) -> Result<Vec<RenderTarget>> {
    let swapchain = &settings.swapchain;
    let images = device.backend().swapchain_images();
    if images.images.is_empty() {
        bail!("Backend created a swapchain without images");
    }
    let multisampled = swapchain.sample_count > 1;

    let mut targets = Vec::with_capacity(images.images.len());
    for &key in &images.images {
        let image = Texture::external(
            device,
            key,
            TextureDesc {
                clear_value: swapchain.color_clear_value,
                ..TextureDesc::new_2d(
                    images.width,
                    images.height,
                    images.format,
                    TextureUsage::COLOR_ATTACHMENT
                        | TextureUsage::RESOLVE_DST
                        | TextureUsage::TRANSFER_SRC
                        | TextureUsage::TRANSFER_DST
                        | TextureUsage::PRESENT,
                )
            },
            ResourceState::Undefined,
        );

        let (colors, resolves) = if multisampled {
            let msaa = Texture::new(
                device,
                TextureDesc {
                    sample_count: swapchain.sample_count,
                    clear_value: swapchain.color_clear_value,
                    ..TextureDesc::new_2d(
                        images.width,
                        images.height,
                        images.format,
                        TextureUsage::COLOR_ATTACHMENT | TextureUsage::RESOLVE_SRC,
                    )
                },
            )
            .context("Failed to create multisampled swapchain color attachment")?;
            (vec![msaa], vec![image])
        } else {
            (vec![image], Vec::new())
        };

        let depth_stencil = if swapchain.depth_stencil_format != Format::Undefined {
            Some(
                Texture::new(
                    device,
                    TextureDesc {
                        sample_count: swapchain.sample_count,
                        clear_value: swapchain.depth_stencil_clear_value,
                        ..TextureDesc::new_2d(
                            images.width,
                            images.height,
                            swapchain.depth_stencil_format,
                            TextureUsage::DEPTH_STENCIL_ATTACHMENT,
                        )
                    },
                )
                .context("Failed to create swapchain depth-stencil attachment")?,
            )
        } else {
            None
        };

        let pass = RenderPass::new(
            device,
            RenderPassDesc {
                color_formats: vec![images.format],
                depth_stencil_format: swapchain.depth_stencil_format,
                sample_count: swapchain.sample_count,
                resolve: multisampled,
            },
        )?;

        targets.push(RenderTarget::from_parts(
            device,
            pass,
            images.width,
            images.height,
            colors,
            resolves,
            depth_stencil,
        )?);
    }
    Ok(targets)
}
