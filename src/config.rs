// =============================================================================
// CONFIGURATION - Renderer settings and config.toml loading
// =============================================================================
//
// `RendererSettings` is everything the core recognizes at renderer creation.
// `Config` wraps it together with the demo's window/debug sections and is
// loaded from renderer.toml, falling back to defaults if the file is missing.

use anyhow::{Context, Result};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use serde::Deserialize;
use std::path::Path;

use crate::format::Format;
use crate::logging::LogCallback;
use crate::types::ClearValue;

/// Which implementation of `GraphicsBackend` to create
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Vulkan,
    D3d12,
    Headless,
}

impl Default for BackendKind {
    fn default() -> Self {
        if cfg!(all(windows, feature = "d3d12")) {
            BackendKind::D3d12
        } else if cfg!(feature = "vulkan") {
            BackendKind::Vulkan
        } else {
            BackendKind::Headless
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentMode {
    Immediate,
    Mailbox,
    #[default]
    Fifo,
    FifoRelaxed,
}

/// Native window the swapchain presents to.
///
/// X11 (Xlib/Xcb) and Wayland for Vulkan on Linux, Win32 HINSTANCE + HWND on
/// Windows.
#[derive(Debug, Clone, Copy)]
pub struct PlatformHandle {
    pub display: RawDisplayHandle,
    pub window: RawWindowHandle,
}

impl PlatformHandle {
    pub fn from_window<W: HasWindowHandle + HasDisplayHandle>(window: &W) -> Result<Self> {
        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();
        let display_handle = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        Ok(Self {
            display: display_handle,
            window: window_handle,
        })
    }
}

/// Swapchain settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SwapchainSettings {
    pub image_count: u32,
    pub sample_count: u32,
    pub color_format: Format,
    pub depth_stencil_format: Format,
    pub color_clear_value: ClearValue,
    pub depth_stencil_clear_value: ClearValue,
    pub present_mode: PresentMode,
}

impl Default for SwapchainSettings {
    fn default() -> Self {
        Self {
            image_count: 2,
            sample_count: 1,
            color_format: Format::B8G8R8A8Unorm,
            depth_stencil_format: Format::Undefined,
            color_clear_value: ClearValue::BLACK,
            depth_stencil_clear_value: ClearValue::DEPTH_ONE,
            present_mode: PresentMode::Fifo,
        }
    }
}

/// Vulkan-only settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VulkanSettings {
    pub instance_layers: Vec<String>,
    pub device_layers: Vec<String>,
}

impl Default for VulkanSettings {
    fn default() -> Self {
        Self {
            instance_layers: vec!["VK_LAYER_KHRONOS_validation".to_string()],
            device_layers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum FeatureLevel {
    #[serde(rename = "11_0")]
    Level11_0,
    #[serde(rename = "11_1")]
    Level11_1,
    #[default]
    #[serde(rename = "12_0")]
    Level12_0,
    #[serde(rename = "12_1")]
    Level12_1,
}

/// Direct3D12-only settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct D3D12Settings {
    pub feature_level: FeatureLevel,
}

/// Headless-only settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeadlessSettings {
    /// Submissions the emulated GPU may hold before it is forced to retire
    /// the oldest one. 0 means work only retires at host sync points.
    pub max_pending_submissions: usize,
}

impl Default for HeadlessSettings {
    fn default() -> Self {
        Self {
            max_pending_submissions: 0,
        }
    }
}

/// Everything recognized at renderer creation
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RendererSettings {
    pub backend: BackendKind,
    pub width: u32,
    pub height: u32,
    pub swapchain: SwapchainSettings,
    /// Enables the shadow state model and backend validation layers
    pub validation: bool,
    pub vulkan: VulkanSettings,
    pub d3d12: D3D12Settings,
    pub headless: HeadlessSettings,
    #[serde(skip)]
    pub handle: Option<PlatformHandle>,
    #[serde(skip)]
    pub log_fn: Option<LogCallback>,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            width: 1280,
            height: 720,
            swapchain: SwapchainSettings::default(),
            validation: cfg!(debug_assertions),
            vulkan: VulkanSettings::default(),
            d3d12: D3D12Settings::default(),
            headless: HeadlessSettings::default(),
            handle: None,
            log_fn: None,
        }
    }
}

impl RendererSettings {
    /// Headless settings with the given size and swapchain length
    pub fn headless(width: u32, height: u32, image_count: u32) -> Self {
        Self {
            backend: BackendKind::Headless,
            width,
            height,
            swapchain: SwapchainSettings {
                image_count,
                ..SwapchainSettings::default()
            },
            validation: true,
            ..Self::default()
        }
    }
}

/// Window settings (demo)
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "tiny-renderer".to_string(),
            fullscreen: false,
        }
    }
}

/// Debug settings (demo)
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
    /// Frames rendered by a windowless run before exiting
    pub headless_frames: u32,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_to_file: false,
            log_file: "tiny_renderer.log".to_string(),
            show_fps: true,
            headless_frames: 4,
        }
    }
}

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub renderer: RendererSettings,
    pub debug: DebugConfig,
}

impl Config {
    /// Load configuration from renderer.toml, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("renderer.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load renderer.toml: {}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.renderer.width, 1280);
        assert_eq!(config.renderer.swapchain.image_count, 2);
        assert_eq!(config.renderer.swapchain.color_format, Format::B8G8R8A8Unorm);
        assert!(config.renderer.handle.is_none());
    }

    #[test]
    fn parses_renderer_section() {
        let config = Config::parse(
            r#"
            [renderer]
            backend = "headless"
            width = 640
            height = 480
            validation = true

            [renderer.swapchain]
            image_count = 3
            sample_count = 4
            color_format = "r8g8b8a8_unorm"
            depth_stencil_format = "d32_float"
            color_clear_value = [0.1, 0.2, 0.3, 1.0]
            depth_stencil_clear_value = { depth = 1.0, stencil = 0 }
            present_mode = "mailbox"

            [renderer.d3d12]
            feature_level = "11_0"

            [renderer.headless]
            max_pending_submissions = 2
            "#,
        )
        .unwrap();

        let r = &config.renderer;
        assert_eq!(r.backend, BackendKind::Headless);
        assert_eq!((r.width, r.height), (640, 480));
        assert_eq!(r.swapchain.image_count, 3);
        assert_eq!(r.swapchain.sample_count, 4);
        assert_eq!(r.swapchain.depth_stencil_format, Format::D32Float);
        assert_eq!(r.swapchain.color_clear_value, ClearValue::Color([0.1, 0.2, 0.3, 1.0]));
        assert_eq!(
            r.swapchain.depth_stencil_clear_value,
            ClearValue::DepthStencil { depth: 1.0, stencil: 0 }
        );
        assert_eq!(r.swapchain.present_mode, PresentMode::Mailbox);
        assert_eq!(r.d3d12.feature_level, FeatureLevel::Level11_0);
        assert_eq!(r.headless.max_pending_submissions, 2);
    }

    #[test]
    fn rejects_unknown_format() {
        let result = Config::parse(
            r#"
            [renderer.swapchain]
            color_format = "r9g9_unorm"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load_from_path("definitely/not/here/renderer.toml").unwrap();
        assert_eq!(config.window.title, "tiny-renderer");
    }
}
