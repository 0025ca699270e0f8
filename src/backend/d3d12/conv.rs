// Neutral -> Direct3D12 / DXGI translation tables

use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;

use crate::format::Format;
use crate::types::{AddressMode, BlendMode, CullMode, Filter, PrimitiveTopology, ResourceState};

/// DXGI format of a resource; `DXGI_FORMAT_UNKNOWN` when D3D12 has no equivalent
pub fn format(format: Format) -> DXGI_FORMAT {
    use Format::*;
    match format {
        Undefined => DXGI_FORMAT_UNKNOWN,
        R8Unorm => DXGI_FORMAT_R8_UNORM,
        R16Unorm => DXGI_FORMAT_R16_UNORM,
        R16Float => DXGI_FORMAT_R16_FLOAT,
        R32Uint => DXGI_FORMAT_R32_UINT,
        R32Float => DXGI_FORMAT_R32_FLOAT,
        R8G8Unorm => DXGI_FORMAT_R8G8_UNORM,
        R16G16Unorm => DXGI_FORMAT_R16G16_UNORM,
        R16G16Float => DXGI_FORMAT_R16G16_FLOAT,
        R32G32Uint => DXGI_FORMAT_R32G32_UINT,
        R32G32Float => DXGI_FORMAT_R32G32_FLOAT,
        R32G32B32Uint => DXGI_FORMAT_R32G32B32_UINT,
        R32G32B32Float => DXGI_FORMAT_R32G32B32_FLOAT,
        B8G8R8A8Unorm => DXGI_FORMAT_B8G8R8A8_UNORM,
        R8G8B8A8Unorm => DXGI_FORMAT_R8G8B8A8_UNORM,
        R16G16B16A16Unorm => DXGI_FORMAT_R16G16B16A16_UNORM,
        R16G16B16A16Float => DXGI_FORMAT_R16G16B16A16_FLOAT,
        R32G32B32A32Uint => DXGI_FORMAT_R32G32B32A32_UINT,
        R32G32B32A32Float => DXGI_FORMAT_R32G32B32A32_FLOAT,
        D16Unorm => DXGI_FORMAT_D16_UNORM,
        D32Float => DXGI_FORMAT_D32_FLOAT,
        D24UnormS8Uint => DXGI_FORMAT_D24_UNORM_S8_UINT,
        D32FloatS8Uint => DXGI_FORMAT_D32_FLOAT_S8X24_UINT,
        R8G8B8Unorm | R16G16B16Unorm | R16G16B16Float | X8D24UnormPack32 | S8Uint | D16UnormS8Uint => {
            DXGI_FORMAT_UNKNOWN
        }
    }
}

/// Formats for a depth texture that is also sampled: (resource, DSV, SRV)
pub fn depth_formats(format: Format) -> (DXGI_FORMAT, DXGI_FORMAT, DXGI_FORMAT) {
    match format {
        Format::D16Unorm => (DXGI_FORMAT_R16_TYPELESS, DXGI_FORMAT_D16_UNORM, DXGI_FORMAT_R16_UNORM),
        Format::D32Float => (DXGI_FORMAT_R32_TYPELESS, DXGI_FORMAT_D32_FLOAT, DXGI_FORMAT_R32_FLOAT),
        Format::D24UnormS8Uint => (
            DXGI_FORMAT_R24G8_TYPELESS,
            DXGI_FORMAT_D24_UNORM_S8_UINT,
            DXGI_FORMAT_R24_UNORM_X8_TYPELESS,
        ),
        Format::D32FloatS8Uint => (
            DXGI_FORMAT_R32G8X24_TYPELESS,
            DXGI_FORMAT_D32_FLOAT_S8X24_UINT,
            DXGI_FORMAT_R32_FLOAT_X8X24_TYPELESS,
        ),
        other => {
            let f = self::format(other);
            (f, f, f)
        }
    }
}

pub fn resource_state(state: ResourceState) -> D3D12_RESOURCE_STATES {
    match state {
        ResourceState::Undefined | ResourceState::General => D3D12_RESOURCE_STATE_COMMON,
        ResourceState::TransferSrc => D3D12_RESOURCE_STATE_COPY_SOURCE,
        ResourceState::TransferDst => D3D12_RESOURCE_STATE_COPY_DEST,
        ResourceState::VertexBuffer | ResourceState::UniformBuffer => {
            D3D12_RESOURCE_STATE_VERTEX_AND_CONSTANT_BUFFER
        }
        ResourceState::IndexBuffer => D3D12_RESOURCE_STATE_INDEX_BUFFER,
        ResourceState::IndirectArgument => D3D12_RESOURCE_STATE_INDIRECT_ARGUMENT,
        ResourceState::StorageBufferSrv | ResourceState::SampledImage => {
            D3D12_RESOURCE_STATE(
                D3D12_RESOURCE_STATE_PIXEL_SHADER_RESOURCE.0 | D3D12_RESOURCE_STATE_NON_PIXEL_SHADER_RESOURCE.0,
            )
        }
        ResourceState::StorageBufferUav | ResourceState::StorageImage => D3D12_RESOURCE_STATE_UNORDERED_ACCESS,
        ResourceState::ColorAttachment => D3D12_RESOURCE_STATE_RENDER_TARGET,
        ResourceState::DepthStencilAttachment => D3D12_RESOURCE_STATE_DEPTH_WRITE,
        ResourceState::DepthStencilRead => D3D12_RESOURCE_STATE(
            D3D12_RESOURCE_STATE_DEPTH_READ.0 | D3D12_RESOURCE_STATE_PIXEL_SHADER_RESOURCE.0,
        ),
        ResourceState::ResolveSrc => D3D12_RESOURCE_STATE_RESOLVE_SOURCE,
        ResourceState::ResolveDst => D3D12_RESOURCE_STATE_RESOLVE_DEST,
        ResourceState::Present => D3D12_RESOURCE_STATE_PRESENT,
    }
}

pub fn topology_type(topology: PrimitiveTopology) -> D3D12_PRIMITIVE_TOPOLOGY_TYPE {
    match topology {
        PrimitiveTopology::PointList => D3D12_PRIMITIVE_TOPOLOGY_TYPE_POINT,
        PrimitiveTopology::LineList | PrimitiveTopology::LineStrip => D3D12_PRIMITIVE_TOPOLOGY_TYPE_LINE,
        PrimitiveTopology::TriangleList | PrimitiveTopology::TriangleStrip => D3D12_PRIMITIVE_TOPOLOGY_TYPE_TRIANGLE,
        PrimitiveTopology::PatchList => D3D12_PRIMITIVE_TOPOLOGY_TYPE_PATCH,
    }
}

pub fn topology(topology: PrimitiveTopology, patch_size: u32) -> D3D_PRIMITIVE_TOPOLOGY {
    match topology {
        PrimitiveTopology::PointList => D3D_PRIMITIVE_TOPOLOGY_POINTLIST,
        PrimitiveTopology::LineList => D3D_PRIMITIVE_TOPOLOGY_LINELIST,
        PrimitiveTopology::LineStrip => D3D_PRIMITIVE_TOPOLOGY_LINESTRIP,
        PrimitiveTopology::TriangleList => D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST,
        PrimitiveTopology::TriangleStrip => D3D_PRIMITIVE_TOPOLOGY_TRIANGLESTRIP,
        // the patch-list topologies are contiguous, 1..=32 control points
        PrimitiveTopology::PatchList => {
            D3D_PRIMITIVE_TOPOLOGY(D3D_PRIMITIVE_TOPOLOGY_1_CONTROL_POINT_PATCHLIST.0 + patch_size.clamp(1, 32) as i32 - 1)
        }
    }
}

pub fn cull_mode(mode: CullMode) -> D3D12_CULL_MODE {
    match mode {
        CullMode::None => D3D12_CULL_MODE_NONE,
        CullMode::Back => D3D12_CULL_MODE_BACK,
        CullMode::Front => D3D12_CULL_MODE_FRONT,
        // no native front-and-back; nothing reaches the rasterizer either way
        CullMode::Both => D3D12_CULL_MODE_NONE,
    }
}

pub fn blend(mode: BlendMode) -> D3D12_RENDER_TARGET_BLEND_DESC {
    let (enable, src, dst, src_alpha, dst_alpha) = match mode {
        BlendMode::Opaque => (false, D3D12_BLEND_ONE, D3D12_BLEND_ZERO, D3D12_BLEND_ONE, D3D12_BLEND_ZERO),
        BlendMode::Alpha => (
            true,
            D3D12_BLEND_SRC_ALPHA,
            D3D12_BLEND_INV_SRC_ALPHA,
            D3D12_BLEND_ONE,
            D3D12_BLEND_INV_SRC_ALPHA,
        ),
        BlendMode::Additive => (true, D3D12_BLEND_ONE, D3D12_BLEND_ONE, D3D12_BLEND_ONE, D3D12_BLEND_ONE),
    };
    D3D12_RENDER_TARGET_BLEND_DESC {
        BlendEnable: enable.into(),
        LogicOpEnable: false.into(),
        SrcBlend: src,
        DestBlend: dst,
        BlendOp: D3D12_BLEND_OP_ADD,
        SrcBlendAlpha: src_alpha,
        DestBlendAlpha: dst_alpha,
        BlendOpAlpha: D3D12_BLEND_OP_ADD,
        LogicOp: D3D12_LOGIC_OP_NOOP,
        RenderTargetWriteMask: D3D12_COLOR_WRITE_ENABLE_ALL.0 as u8,
    }
}

pub fn filter(min: Filter, mag: Filter, mip: Filter, anisotropic: bool) -> D3D12_FILTER {
    if anisotropic {
        return D3D12_FILTER_ANISOTROPIC;
    }
    let bit = |f: Filter, shift: i32| if f == Filter::Linear { 1 << shift } else { 0 };
    D3D12_FILTER(bit(min, 4) | bit(mag, 2) | bit(mip, 0))
}

pub fn address_mode(mode: AddressMode) -> D3D12_TEXTURE_ADDRESS_MODE {
    match mode {
        AddressMode::Repeat => D3D12_TEXTURE_ADDRESS_MODE_WRAP,
        AddressMode::MirroredRepeat => D3D12_TEXTURE_ADDRESS_MODE_MIRROR,
        AddressMode::ClampToEdge => D3D12_TEXTURE_ADDRESS_MODE_CLAMP,
        AddressMode::ClampToBorder => D3D12_TEXTURE_ADDRESS_MODE_BORDER,
    }
}

pub fn feature_level(level: crate::config::FeatureLevel) -> D3D_FEATURE_LEVEL {
    use crate::config::FeatureLevel;
    match level {
        FeatureLevel::Level11_0 => D3D_FEATURE_LEVEL_11_0,
        FeatureLevel::Level11_1 => D3D_FEATURE_LEVEL_11_1,
        FeatureLevel::Level12_0 => D3D_FEATURE_LEVEL_12_0,
        FeatureLevel::Level12_1 => D3D_FEATURE_LEVEL_12_1,
    }
}

/// Null-terminated HLSL semantic name
pub fn semantic_name(name: &str) -> &'static [u8] {
    match name {
        "POSITION" => b"POSITION\0",
        "NORMAL" => b"NORMAL\0",
        "COLOR" => b"COLOR\0",
        "TANGENT" => b"TANGENT\0",
        _ => b"TEXCOORD\0",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_filters_are_zero() {
        assert_eq!(
            filter(Filter::Nearest, Filter::Nearest, Filter::Nearest, false),
            D3D12_FILTER_MIN_MAG_MIP_POINT
        );
        assert_eq!(
            filter(Filter::Linear, Filter::Linear, Filter::Linear, false),
            D3D12_FILTER_MIN_MAG_MIP_LINEAR
        );
    }

    #[test]
    fn patch_topology_counts_control_points() {
        assert_eq!(
            topology(PrimitiveTopology::PatchList, 3),
            D3D_PRIMITIVE_TOPOLOGY_3_CONTROL_POINT_PATCHLIST
        );
    }
}
