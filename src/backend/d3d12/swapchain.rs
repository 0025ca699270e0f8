// DXGI flip-model swapchain
//
// DXGI has no acquire step: the next image is whatever the swapchain reports
// as its current back buffer.

use anyhow::{bail, Context, Result};
use windows::core::ComInterface;
use windows::Win32::Foundation::HWND;
use windows::Win32::Graphics::Direct3D12::ID3D12Resource;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::*;

use super::conv;
use super::device::D3D12Device;
use crate::config::{PlatformHandle, PresentMode, SwapchainSettings};
use crate::format::Format;

pub struct Swapchain {
    swapchain: IDXGISwapChain3,
    pub buffers: Vec<ID3D12Resource>,
    pub format: Format,
    pub width: u32,
    pub height: u32,
    sync_interval: u32,
}

impl Swapchain {
    pub fn new(
        device: &D3D12Device,
        handle: &PlatformHandle,
        settings: &SwapchainSettings,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        log::info!("Creating swapchain: {}x{}", width, height);

        let hwnd = match handle.window {
            raw_window_handle::RawWindowHandle::Win32(h) => HWND(h.hwnd.get()),
            other => bail!("D3D12 needs a Win32 window handle, got {:?}", other),
        };

        let format = conv::format(settings.color_format);
        if !matches!(
            format,
            DXGI_FORMAT_B8G8R8A8_UNORM | DXGI_FORMAT_R8G8B8A8_UNORM | DXGI_FORMAT_R16G16B16A16_FLOAT
        ) {
            bail!("Swapchain format {} is not a flip-model format", settings.color_format);
        }

        let desc = DXGI_SWAP_CHAIN_DESC1 {
            Width: width,
            Height: height,
            Format: format,
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
            BufferCount: settings.image_count.clamp(2, 16),
            SwapEffect: DXGI_SWAP_EFFECT_FLIP_DISCARD,
            ..Default::default()
        };
        let swapchain: IDXGISwapChain3 = unsafe {
            device
                .factory
                .CreateSwapChainForHwnd(&device.queue, hwnd, &desc, None, None)
        }
        .context("Failed to create swapchain")?
        .cast()?;
        unsafe { device.factory.MakeWindowAssociation(hwnd, DXGI_MWA_NO_ALT_ENTER) }?;

        if desc.BufferCount != settings.image_count {
            log::warn!(
                "Requested {} swapchain images, created {}",
                settings.image_count,
                desc.BufferCount
            );
        }
        let buffers = (0..desc.BufferCount)
            .map(|i| unsafe { swapchain.GetBuffer::<ID3D12Resource>(i) }.context("Failed to get swapchain buffer"))
            .collect::<Result<Vec<_>>>()?;
        log::info!("Created swapchain with {} images", buffers.len());

        let sync_interval = match settings.present_mode {
            PresentMode::Fifo | PresentMode::FifoRelaxed => 1,
            PresentMode::Immediate | PresentMode::Mailbox => 0,
        };

        Ok(Self {
            swapchain,
            buffers,
            format: settings.color_format,
            width,
            height,
            sync_interval,
        })
    }

    pub fn current_image(&self) -> u32 {
        unsafe { self.swapchain.GetCurrentBackBufferIndex() }
    }

    pub fn present(&self) -> Result<()> {
        unsafe { self.swapchain.Present(self.sync_interval, Default::default()) }
            .ok()
            .context("IDXGISwapChain::Present failed")
    }
}
