// Queues
//
// Submission order on one queue is execution order. Ordering between queues
// is whatever the caller's semaphore graph says; nothing is implied.

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::backend::SubmitInfo;
use crate::command::{CommandBuffer, CommandBufferState};
use crate::device::Device;
use crate::sync::{Fence, Semaphore};
use crate::types::QueueKind;

pub struct Queue {
    device: Arc<Device>,
    kind: QueueKind,
}

impl Queue {
    pub(crate) fn new(device: &Arc<Device>, kind: QueueKind) -> Self {
        Self {
            device: device.clone(),
            kind,
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Submit fully recorded command buffers.
    ///
    /// Waits on `wait` before executing, signals `signal` and `fence` when done.
    /// Returns the submission serial.
    pub fn submit(
        &self,
        cmds: &mut [&mut CommandBuffer],
        wait: &[&Semaphore],
        signal: &[&Semaphore],
        fence: Option<&Fence>,
    ) -> Result<u64> {
        for cmd in cmds.iter() {
            assert!(
                cmd.state() == CommandBufferState::Executable,
                "queue_submit: command buffer is not executable (state {:?})",
                cmd.state()
            );
        }

        let keys: Vec<_> = cmds.iter().map(|c| c.key()).collect();
        let wait_keys: Vec<_> = wait.iter().map(|s| s.key()).collect();
        let signal_keys: Vec<_> = signal.iter().map(|s| s.key()).collect();

        let serial = self
            .device
            .backend()
            .queue_submit(
                self.kind,
                &SubmitInfo {
                    cmds: &keys,
                    wait_semaphores: &wait_keys,
                    signal_semaphores: &signal_keys,
                    fence: fence.map(Fence::key),
                },
            )
            .context("Failed to submit to queue")?;

        for cmd in cmds.iter_mut() {
            self.device.replay(cmd.tracked_ops());
            cmd.mark_submitted(serial);
        }
        Ok(serial)
    }

    /// Block until everything submitted to this queue has executed
    pub fn wait_idle(&self) -> Result<()> {
        self.device
            .backend()
            .queue_wait_idle(self.kind)
            .context("Failed to wait for queue idle")
    }

    pub fn completed_serial(&self) -> u64 {
        self.device.backend().completed_serial(self.kind)
    }
}
