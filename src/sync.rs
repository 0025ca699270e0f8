// Synchronization primitives
//
// Fences are host-observable completion signals; semaphores order work
// between queue operations on the GPU. Both are binary and are recycled
// once per swapchain cycle by the frame loop.

use anyhow::{Context, Result};
use std::cell::Cell;
use std::sync::Arc;

use crate::backend::{FenceKey, SemaphoreKey};
use crate::device::Device;

pub struct Fence {
    device: Arc<Device>,
    key: FenceKey,
}

impl Fence {
    pub fn new(device: &Arc<Device>, signaled: bool) -> Result<Self> {
        let key = device
            .backend()
            .create_fence(signaled)
            .context("Failed to create fence")?;
        Ok(Self {
            device: device.clone(),
            key,
        })
    }

    pub fn key(&self) -> FenceKey {
        self.key
    }

    /// Block until signaled
    pub fn wait(&self) -> Result<()> {
        self.device
            .backend()
            .wait_for_fences(&[self.key])
            .context("Failed to wait for fence")
    }

    pub fn reset(&self) -> Result<()> {
        self.device
            .backend()
            .reset_fences(&[self.key])
            .context("Failed to reset fence")
    }

    /// Wait, then return the fence to the unsignaled state
    pub fn wait_and_reset(&self) -> Result<()> {
        self.wait()?;
        self.reset()
    }

    pub fn is_signaled(&self) -> Result<bool> {
        self.device.backend().fence_signaled(self.key)
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.device.backend().destroy_fence(self.key);
    }
}

pub struct Semaphore {
    device: Arc<Device>,
    key: SemaphoreKey,
}

impl Semaphore {
    pub fn new(device: &Arc<Device>) -> Result<Self> {
        let key = device
            .backend()
            .create_semaphore()
            .context("Failed to create semaphore")?;
        Ok(Self {
            device: device.clone(),
            key,
        })
    }

    pub fn key(&self) -> SemaphoreKey {
        self.key
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.device.backend().destroy_semaphore(self.key);
    }
}

/// Frame synchronization - one per swapchain image
pub struct FrameSync {
    /// Signaled by acquire; the host waits on and resets it
    pub image_acquired_fence: Fence,
    /// Signaled by acquire; the frame's submission waits on it
    pub image_acquired_semaphore: Semaphore,
    /// Signaled by the frame's submission; present waits on it
    pub render_complete_semaphore: Semaphore,
    /// Signaled by the frame's submission; checked before the slot is reused
    pub render_complete_fence: Fence,
    /// Whether this slot's render-complete fence has been attached to a
    /// submission since the slot was last acquired
    pub(crate) render_fence_armed: Cell<bool>,
}

impl FrameSync {
    pub fn new(device: &Arc<Device>) -> Result<Self> {
        Ok(Self {
            image_acquired_fence: Fence::new(device, false)?,
            image_acquired_semaphore: Semaphore::new(device)?,
            render_complete_semaphore: Semaphore::new(device)?,
            // starts signaled, the slot has no prior frame to wait for
            render_complete_fence: Fence::new(device, true)?,
            render_fence_armed: Cell::new(false),
        })
    }
}
