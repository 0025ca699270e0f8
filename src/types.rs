// Shared enums and flag sets used across the neutral layer and every backend

use bitflags::bitflags;
use serde::Deserialize;

bitflags! {
    /// How a buffer may be bound; fixed at creation
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const INDEX = 1 << 2;
        const VERTEX = 1 << 3;
        const UNIFORM_CBV = 1 << 4;
        const STORAGE_SRV = 1 << 5;
        const STORAGE_UAV = 1 << 6;
        const UNIFORM_TEXEL_SRV = 1 << 7;
        const STORAGE_TEXEL_UAV = 1 << 8;
        const INDIRECT = 1 << 9;
    }
}

bitflags! {
    /// How a texture may be bound; fixed at creation
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TextureUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const SAMPLED_IMAGE = 1 << 2;
        const STORAGE_IMAGE = 1 << 3;
        const COLOR_ATTACHMENT = 1 << 4;
        const DEPTH_STENCIL_ATTACHMENT = 1 << 5;
        const RESOLVE_SRC = 1 << 6;
        const RESOLVE_DST = 1 << 7;
        const PRESENT = 1 << 8;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ShaderStages: u32 {
        const VERT = 1 << 0;
        const TESC = 1 << 1;
        const TESE = 1 << 2;
        const GEOM = 1 << 3;
        const FRAG = 1 << 4;
        const COMP = 1 << 5;

        const ALL_GRAPHICS = Self::VERT.bits()
            | Self::TESC.bits()
            | Self::TESE.bits()
            | Self::GEOM.bits()
            | Self::FRAG.bits();
    }
}

/// What a resource is being used as right now.
///
/// Every GPU access requires a specific state and moving between states needs
/// an explicit transition command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResourceState {
    #[default]
    Undefined,
    General,
    TransferSrc,
    TransferDst,
    VertexBuffer,
    IndexBuffer,
    UniformBuffer,
    IndirectArgument,
    StorageBufferSrv,
    StorageBufferUav,
    SampledImage,
    StorageImage,
    ColorAttachment,
    DepthStencilAttachment,
    DepthStencilRead,
    ResolveSrc,
    ResolveDst,
    Present,
}

/// A single kind of GPU access, used to check a resource's state at the point
/// of use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    VertexInput,
    IndexInput,
    UniformRead,
    ShaderRead,
    ShaderWrite,
    SampledRead,
    StorageImage,
    ColorWrite,
    DepthStencilWrite,
    CopySrc,
    CopyDst,
    ResolveSrc,
    ResolveDst,
    Present,
}

impl ResourceState {
    /// States a buffer may legally be in
    pub fn is_buffer_state(self) -> bool {
        matches!(
            self,
            ResourceState::Undefined
                | ResourceState::General
                | ResourceState::TransferSrc
                | ResourceState::TransferDst
                | ResourceState::VertexBuffer
                | ResourceState::IndexBuffer
                | ResourceState::UniformBuffer
                | ResourceState::IndirectArgument
                | ResourceState::StorageBufferSrv
                | ResourceState::StorageBufferUav
        )
    }

    /// States a texture may legally be in
    pub fn is_texture_state(self) -> bool {
        matches!(
            self,
            ResourceState::Undefined
                | ResourceState::General
                | ResourceState::TransferSrc
                | ResourceState::TransferDst
                | ResourceState::SampledImage
                | ResourceState::StorageImage
                | ResourceState::ColorAttachment
                | ResourceState::DepthStencilAttachment
                | ResourceState::DepthStencilRead
                | ResourceState::ResolveSrc
                | ResourceState::ResolveDst
                | ResourceState::Present
        )
    }

    /// Whether a resource in this state may be accessed this way.
    ///
    /// `General` permits any shader or copy access, never attachment output
    /// or presentation.
    pub fn allows(self, access: Access) -> bool {
        use ResourceState as S;
        match (self, access) {
            (S::General, Access::ColorWrite | Access::DepthStencilWrite | Access::Present) => false,
            (S::General, _) => true,
            (S::VertexBuffer, Access::VertexInput) => true,
            (S::IndexBuffer, Access::IndexInput) => true,
            (S::UniformBuffer, Access::UniformRead) => true,
            // a UAV buffer is also readable through its UAV
            (S::StorageBufferSrv, Access::ShaderRead) => true,
            (S::StorageBufferUav, Access::ShaderRead | Access::ShaderWrite) => true,
            (S::SampledImage, Access::SampledRead) => true,
            (S::DepthStencilRead, Access::SampledRead) => true,
            (S::StorageImage, Access::StorageImage) => true,
            (S::ColorAttachment, Access::ColorWrite) => true,
            (S::DepthStencilAttachment, Access::DepthStencilWrite) => true,
            (S::TransferSrc, Access::CopySrc) => true,
            (S::TransferDst, Access::CopyDst) => true,
            (S::ResolveSrc, Access::ResolveSrc) => true,
            (S::ResolveDst, Access::ResolveDst) => true,
            (S::Present, Access::Present) => true,
            _ => false,
        }
    }

    /// Buffer usage flag required before a buffer may enter this state
    pub fn required_buffer_usage(self) -> BufferUsage {
        match self {
            ResourceState::TransferSrc => BufferUsage::TRANSFER_SRC,
            ResourceState::TransferDst => BufferUsage::TRANSFER_DST,
            ResourceState::VertexBuffer => BufferUsage::VERTEX,
            ResourceState::IndexBuffer => BufferUsage::INDEX,
            ResourceState::UniformBuffer => BufferUsage::UNIFORM_CBV,
            ResourceState::IndirectArgument => BufferUsage::INDIRECT,
            ResourceState::StorageBufferSrv => BufferUsage::STORAGE_SRV,
            ResourceState::StorageBufferUav => BufferUsage::STORAGE_UAV,
            _ => BufferUsage::empty(),
        }
    }

    /// Texture usage flag required before a texture may enter this state
    pub fn required_texture_usage(self) -> TextureUsage {
        match self {
            ResourceState::TransferSrc => TextureUsage::TRANSFER_SRC,
            ResourceState::TransferDst => TextureUsage::TRANSFER_DST,
            ResourceState::SampledImage | ResourceState::DepthStencilRead => TextureUsage::SAMPLED_IMAGE,
            ResourceState::StorageImage => TextureUsage::STORAGE_IMAGE,
            ResourceState::ColorAttachment => TextureUsage::COLOR_ATTACHMENT,
            ResourceState::DepthStencilAttachment => TextureUsage::DEPTH_STENCIL_ATTACHMENT,
            ResourceState::ResolveSrc => TextureUsage::RESOLVE_SRC,
            ResourceState::ResolveDst => TextureUsage::RESOLVE_DST,
            ResourceState::Present => TextureUsage::PRESENT,
            _ => TextureUsage::empty(),
        }
    }
}

/// Where a resource's backing memory lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemoryLocation {
    /// Device-local, not host accessible
    #[default]
    GpuOnly,
    /// Host-visible upload memory, persistently mapped
    CpuToGpu,
    /// Host-visible readback memory, persistently mapped
    GpuToCpu,
}

impl MemoryLocation {
    pub fn is_host_visible(self) -> bool {
        self != MemoryLocation::GpuOnly
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IndexType {
    #[default]
    Uint16,
    Uint32,
}

impl IndexType {
    pub fn size(self) -> u32 {
        match self {
            IndexType::Uint16 => 2,
            IndexType::Uint32 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureType {
    Tex1D,
    #[default]
    Tex2D,
    Tex3D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueueKind {
    #[default]
    Graphics,
    Present,
}

/// Clear value of one attachment
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

impl ClearValue {
    pub const BLACK: ClearValue = ClearValue::Color([0.0, 0.0, 0.0, 0.0]);
    pub const DEPTH_ONE: ClearValue = ClearValue::DepthStencil { depth: 1.0, stencil: 0 };

    pub fn color(self) -> [f32; 4] {
        match self {
            ClearValue::Color(rgba) => rgba,
            ClearValue::DepthStencil { .. } => [0.0; 4],
        }
    }

    pub fn depth_stencil(self) -> (f32, u32) {
        match self {
            ClearValue::DepthStencil { depth, stencil } => (depth, stencil),
            ClearValue::Color(_) => (1.0, 0),
        }
    }
}

impl Default for ClearValue {
    fn default() -> Self {
        ClearValue::BLACK
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScissorRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl ScissorRect {
    pub fn full(width: u32, height: u32) -> Self {
        Self { x: 0, y: 0, width, height }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
    PatchList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    #[default]
    None,
    Back,
    Front,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FrontFace {
    #[default]
    CounterClockwise,
    Clockwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendMode {
    #[default]
    Opaque,
    Alpha,
    Additive,
}

/// Vulkan-only; D3D12 always uses an upper-left domain origin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TessellationDomainOrigin {
    #[default]
    UpperLeft,
    LowerLeft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Filter {
    Nearest,
    #[default]
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressMode {
    #[default]
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
}

/// Round `value` up to a multiple of `alignment` (a power of two or any non-zero value)
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn general_allows_shader_but_not_attachment_access() {
        assert!(ResourceState::General.allows(Access::ShaderWrite));
        assert!(ResourceState::General.allows(Access::CopyDst));
        assert!(!ResourceState::General.allows(Access::ColorWrite));
        assert!(!ResourceState::General.allows(Access::Present));
    }

    #[test]
    fn copies_require_transfer_states() {
        assert!(ResourceState::TransferSrc.allows(Access::CopySrc));
        assert!(!ResourceState::TransferSrc.allows(Access::CopyDst));
        assert!(ResourceState::TransferDst.allows(Access::CopyDst));
        assert!(!ResourceState::SampledImage.allows(Access::CopySrc));
    }

    #[test]
    fn buffer_and_texture_state_sets() {
        assert!(ResourceState::StorageBufferUav.is_buffer_state());
        assert!(!ResourceState::StorageBufferUav.is_texture_state());
        assert!(ResourceState::Present.is_texture_state());
        assert!(!ResourceState::Present.is_buffer_state());
        assert!(ResourceState::TransferDst.is_buffer_state() && ResourceState::TransferDst.is_texture_state());
    }

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
        assert_eq!(align_up(13, 0), 13);
        assert_eq!(align_up(10, 12), 12);
    }
}
