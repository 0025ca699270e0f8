// DXGI factory, adapter, device and the direct queue

use anyhow::{bail, Context, Result};
use std::ffi::CStr;
use windows::core::ComInterface;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::*;

use super::conv;
use crate::config::RendererSettings;
use crate::logging::Messenger;

pub struct D3D12Device {
    pub factory: IDXGIFactory4,
    pub device: ID3D12Device,
    /// Graphics and present share this queue; DXGI presents from the queue
    /// the swapchain was created with
    pub queue: ID3D12CommandQueue,
    info_queue: Option<ID3D12InfoQueue>,
    pub adapter_name: String,
}

impl D3D12Device {
    pub fn new(settings: &RendererSettings) -> Result<Self> {
        log::info!("Initializing D3D12 device...");

        if settings.validation {
            let mut debug: Option<ID3D12Debug> = None;
            match unsafe { D3D12GetDebugInterface(&mut debug) } {
                Ok(()) => {
                    if let Some(debug) = debug {
                        unsafe { debug.EnableDebugLayer() };
                        log::info!("D3D12 debug layer enabled");
                    }
                }
                Err(e) => log::warn!("D3D12 debug layer unavailable: {}", e),
            }
        }

        let factory_flags = if settings.validation {
            DXGI_CREATE_FACTORY_DEBUG
        } else {
            Default::default()
        };
        let factory: IDXGIFactory4 =
            unsafe { CreateDXGIFactory2(factory_flags) }.context("Failed to create DXGI factory")?;

        let feature_level = conv::feature_level(settings.d3d12.feature_level);
        let (adapter, adapter_name) = pick_adapter(&factory, feature_level)?;
        log::info!("Selected adapter: {}", adapter_name);

        let mut device: Option<ID3D12Device> = None;
        unsafe { D3D12CreateDevice(&adapter, feature_level, &mut device) }.context("D3D12CreateDevice failed")?;
        let device = device.context("D3D12CreateDevice returned no device")?;

        let queue: ID3D12CommandQueue = unsafe {
            device.CreateCommandQueue(&D3D12_COMMAND_QUEUE_DESC {
                Type: D3D12_COMMAND_LIST_TYPE_DIRECT,
                ..Default::default()
            })
        }
        .context("Failed to create command queue")?;

        let info_queue = if settings.validation {
            device.cast::<ID3D12InfoQueue>().ok()
        } else {
            None
        };

        Ok(Self {
            factory,
            device,
            queue,
            info_queue,
            adapter_name,
        })
    }

    /// Forward everything the debug layer has queued to the messenger
    pub fn drain_messages(&self, messenger: &Messenger) {
        let Some(info_queue) = &self.info_queue else { return };
        unsafe {
            let count = info_queue.GetNumStoredMessages();
            for i in 0..count {
                let mut len = 0usize;
                if info_queue.GetMessage(i, None, &mut len).is_err() || len == 0 {
                    continue;
                }
                // D3D12_MESSAGE is followed by its description in the same allocation
                let mut storage = vec![0u64; len.div_ceil(8)];
                let message = storage.as_mut_ptr().cast::<D3D12_MESSAGE>();
                if info_queue.GetMessage(i, Some(message), &mut len).is_err() {
                    continue;
                }
                let text = CStr::from_ptr((*message).pDescription.cast())
                    .to_string_lossy()
                    .into_owned();
                match (*message).Severity {
                    D3D12_MESSAGE_SEVERITY_CORRUPTION | D3D12_MESSAGE_SEVERITY_ERROR => messenger.error("d3d12", &text),
                    D3D12_MESSAGE_SEVERITY_WARNING => messenger.warn("d3d12", &text),
                    D3D12_MESSAGE_SEVERITY_INFO => messenger.info("d3d12", &text),
                    _ => messenger.debug("d3d12", &text),
                }
            }
            info_queue.ClearStoredMessages();
        }
    }
}

fn pick_adapter(
    factory: &IDXGIFactory4,
    feature_level: windows::Win32::Graphics::Direct3D::D3D_FEATURE_LEVEL,
) -> Result<(IDXGIAdapter1, String)> {
    let mut fallback = None;
    for i in 0.. {
        let adapter = match unsafe { factory.EnumAdapters1(i) } {
            Ok(adapter) => adapter,
            Err(_) => break,
        };
        let desc = unsafe { adapter.GetDesc1() }?;
        let name_len = desc.Description.iter().position(|&c| c == 0).unwrap_or(desc.Description.len());
        let name = String::from_utf16_lossy(&desc.Description[..name_len]);

        let supported = unsafe {
            D3D12CreateDevice(&adapter, feature_level, std::ptr::null_mut::<Option<ID3D12Device>>())
        }
        .is_ok();
        if !supported {
            log::debug!("Adapter {} lacks the requested feature level", name);
            continue;
        }

        if desc.Flags & DXGI_ADAPTER_FLAG_SOFTWARE.0 as u32 != 0 {
            fallback.get_or_insert((adapter, name));
            continue;
        }
        return Ok((adapter, name));
    }
    match fallback {
        Some(found) => {
            log::warn!("No hardware adapter found, using {}", found.1);
            Ok(found)
        }
        None => bail!("No adapter supports the requested feature level"),
    }
}
