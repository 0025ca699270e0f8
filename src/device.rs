// Device - the shared context behind every handle
//
// Responsibilities:
// - Own the selected backend (and with it the native device)
// - Route diagnostics through the client's log callback
// - Hold the optional shadow state model
//
// Every child object keeps an `Arc<Device>`, so the native device is only
// torn down after the last resource referencing it has been destroyed.

use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::backend::{self, BackendLimits, GraphicsBackend};
use crate::config::{BackendKind, RendererSettings};
use crate::logging::Messenger;
use crate::validation::{ResourceId, StateTracker, TrackedOp, Violation};
use crate::types::ResourceState;

pub struct Device {
    backend: Box<dyn GraphicsBackend>,
    messenger: Messenger,
    tracker: Option<Mutex<StateTracker>>,
    limits: BackendLimits,
}

impl Device {
    pub fn new(app_name: &str, settings: &RendererSettings) -> Result<Arc<Self>> {
        let messenger = Messenger::new(settings.log_fn.clone().unwrap_or_default());
        let backend = backend::create(app_name, settings, messenger.clone())?;
        let limits = backend.limits();

        log::info!("Created {:?} device for '{}'", backend.kind(), app_name);
        if settings.validation {
            log::info!("Shadow state validation enabled");
        }

        Ok(Arc::new(Self {
            backend,
            messenger,
            tracker: settings.validation.then(|| Mutex::new(StateTracker::new())),
            limits,
        }))
    }

    pub fn backend(&self) -> &dyn GraphicsBackend {
        self.backend.as_ref()
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn messenger(&self) -> &Messenger {
        &self.messenger
    }

    pub fn limits(&self) -> BackendLimits {
        self.limits
    }

    pub fn validation_enabled(&self) -> bool {
        self.tracker.is_some()
    }

    pub(crate) fn report(&self, violation: Violation) {
        self.messenger.error("validation", &violation.to_string());
        if let Some(tracker) = &self.tracker {
            tracker.lock().push(violation);
        }
    }

    pub(crate) fn track_resource(&self, resource: ResourceId, state: ResourceState) {
        if let Some(tracker) = &self.tracker {
            tracker.lock().register(resource, state);
        }
    }

    pub(crate) fn forget_resource(&self, resource: ResourceId) {
        if let Some(tracker) = &self.tracker {
            tracker.lock().forget(resource);
        }
    }

    /// Replay recorded ops in submission order
    pub(crate) fn replay(&self, ops: &[TrackedOp]) {
        let Some(tracker) = &self.tracker else { return };
        let found: Vec<Violation> = {
            let mut tracker = tracker.lock();
            ops.iter().filter_map(|op| tracker.apply(op)).collect()
        };
        for violation in found {
            self.messenger.error("validation", &violation.to_string());
        }
    }

    pub(crate) fn check_present(&self, image: backend::TextureKey, image_index: u32) {
        let Some(tracker) = &self.tracker else { return };
        let found = tracker.lock().check_present(image, image_index);
        if let Some(violation) = found {
            self.messenger.error("validation", &violation.to_string());
        }
    }

    /// Last state the shadow model saw for a resource
    pub fn tracked_state(&self, resource: ResourceId) -> Option<ResourceState> {
        self.tracker.as_ref().and_then(|t| t.lock().state(resource))
    }

    pub fn violations(&self) -> Vec<Violation> {
        self.tracker
            .as_ref()
            .map(|t| t.lock().violations().to_vec())
            .unwrap_or_default()
    }

    pub fn take_violations(&self) -> Vec<Violation> {
        self.tracker
            .as_ref()
            .map(|t| t.lock().take_violations())
            .unwrap_or_default()
    }

    /// Block until the GPU is idle
    pub fn wait_idle(&self) -> Result<()> {
        self.backend.device_wait_idle()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        log::info!("Destroying {:?} device...", self.backend.kind());
        if let Err(e) = self.backend.device_wait_idle() {
            log::warn!("Device wait idle failed during teardown: {:?}", e);
        }
    }
}
