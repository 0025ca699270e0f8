// tiny-renderer
//
// A thin rendering abstraction with one set of semantics over Vulkan and
// Direct3D12, plus a headless CPU backend that implements the same contracts
// for testing. The object API lives in the modules below; `api` exposes the
// same operations as flat functions.

pub mod api;
pub mod backend;
pub mod command;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod format;
pub mod logging;
pub mod pipeline;
pub mod queue;
pub mod render_target;
pub mod renderer;
pub mod resource;
pub mod shader;
pub mod sync;
pub mod types;
pub mod util;
pub mod validation;

pub use backend::BufferTextureCopy;
pub use command::{CommandBuffer, CommandBufferState, CommandPool};
pub use config::{BackendKind, Config, PlatformHandle, PresentMode, RendererSettings, SwapchainSettings};
pub use descriptor::{DescriptorBinding, DescriptorSet, DescriptorType, DescriptorUpdate};
pub use device::Device;
pub use format::Format;
pub use logging::{LogCallback, LogLevel};
pub use pipeline::{Pipeline, PipelineSettings, VertexLayout, VertexSemantic};
pub use queue::Queue;
pub use render_target::{RenderPass, RenderPassDesc, RenderTarget, RenderTargetDesc};
pub use renderer::Renderer;
pub use resource::{Buffer, BufferDesc, Sampler, SamplerDesc, Texture, TextureDesc};
pub use shader::{ShaderCode, ShaderProgram, ShaderProgramDesc, ShaderStageDesc};
pub use sync::{Fence, FrameSync, Semaphore};
pub use types::*;
pub use validation::{ResourceId, Violation};
