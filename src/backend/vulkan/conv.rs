// Neutral -> Vulkan translation tables

use ash::vk;

use crate::descriptor::DescriptorType;
use crate::format::Format;
use crate::types::{
    AddressMode, BlendMode, BufferUsage, CullMode, Filter, FrontFace, IndexType, PrimitiveTopology, ResourceState,
    ShaderStages, TessellationDomainOrigin, TextureType, TextureUsage,
};

pub fn format(format: Format) -> vk::Format {
    use Format::*;
    match format {
        Undefined => vk::Format::UNDEFINED,
        R8Unorm => vk::Format::R8_UNORM,
        R16Unorm => vk::Format::R16_UNORM,
        R16Float => vk::Format::R16_SFLOAT,
        R32Uint => vk::Format::R32_UINT,
        R32Float => vk::Format::R32_SFLOAT,
        R8G8Unorm => vk::Format::R8G8_UNORM,
        R16G16Unorm => vk::Format::R16G16_UNORM,
        R16G16Float => vk::Format::R16G16_SFLOAT,
        R32G32Uint => vk::Format::R32G32_UINT,
        R32G32Float => vk::Format::R32G32_SFLOAT,
        R8G8B8Unorm => vk::Format::R8G8B8_UNORM,
        R16G16B16Unorm => vk::Format::R16G16B16_UNORM,
        R16G16B16Float => vk::Format::R16G16B16_SFLOAT,
        R32G32B32Uint => vk::Format::R32G32B32_UINT,
        R32G32B32Float => vk::Format::R32G32B32_SFLOAT,
        B8G8R8A8Unorm => vk::Format::B8G8R8A8_UNORM,
        R8G8B8A8Unorm => vk::Format::R8G8B8A8_UNORM,
        R16G16B16A16Unorm => vk::Format::R16G16B16A16_UNORM,
        R16G16B16A16Float => vk::Format::R16G16B16A16_SFLOAT,
        R32G32B32A32Uint => vk::Format::R32G32B32A32_UINT,
        R32G32B32A32Float => vk::Format::R32G32B32A32_SFLOAT,
        D16Unorm => vk::Format::D16_UNORM,
        X8D24UnormPack32 => vk::Format::X8_D24_UNORM_PACK32,
        D32Float => vk::Format::D32_SFLOAT,
        S8Uint => vk::Format::S8_UINT,
        D16UnormS8Uint => vk::Format::D16_UNORM_S8_UINT,
        D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
        D32FloatS8Uint => vk::Format::D32_SFLOAT_S8_UINT,
    }
}

/// Inverse of `format`; `None` for native formats the neutral table lacks
pub fn format_from_vk(vk_format: vk::Format) -> Option<Format> {
    Format::ALL.iter().copied().find(|&f| format(f) == vk_format)
}

pub fn aspect_mask(format: Format) -> vk::ImageAspectFlags {
    let mut aspect = vk::ImageAspectFlags::empty();
    if format.is_depth() {
        aspect |= vk::ImageAspectFlags::DEPTH;
    }
    if format.has_stencil() {
        aspect |= vk::ImageAspectFlags::STENCIL;
    }
    if aspect.is_empty() {
        vk::ImageAspectFlags::COLOR
    } else {
        aspect
    }
}

pub fn sample_count(count: u32) -> vk::SampleCountFlags {
    match count {
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        16 => vk::SampleCountFlags::TYPE_16,
        32 => vk::SampleCountFlags::TYPE_32,
        64 => vk::SampleCountFlags::TYPE_64,
        _ => vk::SampleCountFlags::TYPE_1,
    }
}

pub fn buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let table = [
        (BufferUsage::TRANSFER_SRC, vk::BufferUsageFlags::TRANSFER_SRC),
        (BufferUsage::TRANSFER_DST, vk::BufferUsageFlags::TRANSFER_DST),
        (BufferUsage::INDEX, vk::BufferUsageFlags::INDEX_BUFFER),
        (BufferUsage::VERTEX, vk::BufferUsageFlags::VERTEX_BUFFER),
        (BufferUsage::UNIFORM_CBV, vk::BufferUsageFlags::UNIFORM_BUFFER),
        (BufferUsage::STORAGE_SRV, vk::BufferUsageFlags::STORAGE_BUFFER),
        (BufferUsage::STORAGE_UAV, vk::BufferUsageFlags::STORAGE_BUFFER),
        (BufferUsage::UNIFORM_TEXEL_SRV, vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER),
        (BufferUsage::STORAGE_TEXEL_UAV, vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER),
        (BufferUsage::INDIRECT, vk::BufferUsageFlags::INDIRECT_BUFFER),
    ];
    table
        .iter()
        .filter(|(flag, _)| usage.contains(*flag))
        .fold(vk::BufferUsageFlags::empty(), |acc, (_, vk_flag)| acc | *vk_flag)
}

pub fn texture_usage(usage: TextureUsage) -> vk::ImageUsageFlags {
    let table = [
        (TextureUsage::TRANSFER_SRC, vk::ImageUsageFlags::TRANSFER_SRC),
        (TextureUsage::TRANSFER_DST, vk::ImageUsageFlags::TRANSFER_DST),
        (TextureUsage::SAMPLED_IMAGE, vk::ImageUsageFlags::SAMPLED),
        (TextureUsage::STORAGE_IMAGE, vk::ImageUsageFlags::STORAGE),
        (TextureUsage::COLOR_ATTACHMENT, vk::ImageUsageFlags::COLOR_ATTACHMENT),
        (TextureUsage::DEPTH_STENCIL_ATTACHMENT, vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT),
        // resolves happen inside the render pass, as attachments
        (TextureUsage::RESOLVE_SRC, vk::ImageUsageFlags::COLOR_ATTACHMENT),
        (TextureUsage::RESOLVE_DST, vk::ImageUsageFlags::COLOR_ATTACHMENT),
    ];
    table
        .iter()
        .filter(|(flag, _)| usage.contains(*flag))
        .fold(vk::ImageUsageFlags::empty(), |acc, (_, vk_flag)| acc | *vk_flag)
}

pub fn image_type(ty: TextureType) -> (vk::ImageType, vk::ImageViewType) {
    match ty {
        TextureType::Tex1D => (vk::ImageType::TYPE_1D, vk::ImageViewType::TYPE_1D),
        TextureType::Tex2D => (vk::ImageType::TYPE_2D, vk::ImageViewType::TYPE_2D),
        TextureType::Tex3D => (vk::ImageType::TYPE_3D, vk::ImageViewType::TYPE_3D),
    }
}

pub fn image_layout(state: ResourceState) -> vk::ImageLayout {
    match state {
        ResourceState::Undefined => vk::ImageLayout::UNDEFINED,
        ResourceState::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        ResourceState::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ResourceState::SampledImage => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ResourceState::ColorAttachment | ResourceState::ResolveSrc | ResourceState::ResolveDst => {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        }
        ResourceState::DepthStencilAttachment => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ResourceState::DepthStencilRead => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        ResourceState::Present => vk::ImageLayout::PRESENT_SRC_KHR,
        _ => vk::ImageLayout::GENERAL,
    }
}

/// Access mask and pipeline stages touching a resource in `state`
pub fn access_and_stage(state: ResourceState) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    use vk::AccessFlags as A;
    use vk::PipelineStageFlags as P;
    let shaders = P::VERTEX_SHADER | P::FRAGMENT_SHADER | P::COMPUTE_SHADER;
    match state {
        ResourceState::Undefined => (A::empty(), P::TOP_OF_PIPE),
        ResourceState::General => (A::MEMORY_READ | A::MEMORY_WRITE, P::ALL_COMMANDS),
        ResourceState::TransferSrc => (A::TRANSFER_READ, P::TRANSFER),
        ResourceState::TransferDst => (A::TRANSFER_WRITE, P::TRANSFER),
        ResourceState::VertexBuffer => (A::VERTEX_ATTRIBUTE_READ, P::VERTEX_INPUT),
        ResourceState::IndexBuffer => (A::INDEX_READ, P::VERTEX_INPUT),
        ResourceState::UniformBuffer => (A::UNIFORM_READ, shaders),
        ResourceState::IndirectArgument => (A::INDIRECT_COMMAND_READ, P::DRAW_INDIRECT),
        ResourceState::StorageBufferSrv | ResourceState::SampledImage => (A::SHADER_READ, shaders),
        ResourceState::StorageBufferUav | ResourceState::StorageImage => (A::SHADER_READ | A::SHADER_WRITE, shaders),
        ResourceState::ColorAttachment | ResourceState::ResolveSrc | ResourceState::ResolveDst => (
            A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
            P::COLOR_ATTACHMENT_OUTPUT,
        ),
        ResourceState::DepthStencilAttachment => (
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
            P::EARLY_FRAGMENT_TESTS | P::LATE_FRAGMENT_TESTS,
        ),
        ResourceState::DepthStencilRead => (
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::SHADER_READ,
            P::EARLY_FRAGMENT_TESTS | P::FRAGMENT_SHADER,
        ),
        ResourceState::Present => (A::empty(), P::BOTTOM_OF_PIPE),
    }
}

pub fn shader_stages(stages: ShaderStages) -> vk::ShaderStageFlags {
    let table = [
        (ShaderStages::VERT, vk::ShaderStageFlags::VERTEX),
        (ShaderStages::TESC, vk::ShaderStageFlags::TESSELLATION_CONTROL),
        (ShaderStages::TESE, vk::ShaderStageFlags::TESSELLATION_EVALUATION),
        (ShaderStages::GEOM, vk::ShaderStageFlags::GEOMETRY),
        (ShaderStages::FRAG, vk::ShaderStageFlags::FRAGMENT),
        (ShaderStages::COMP, vk::ShaderStageFlags::COMPUTE),
    ];
    table
        .iter()
        .filter(|(flag, _)| stages.contains(*flag))
        .fold(vk::ShaderStageFlags::empty(), |acc, (_, vk_flag)| acc | *vk_flag)
}

pub fn descriptor_type(ty: DescriptorType) -> vk::DescriptorType {
    match ty {
        DescriptorType::Sampler => vk::DescriptorType::SAMPLER,
        DescriptorType::UniformBufferCbv => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorType::StorageBufferSrv | DescriptorType::StorageBufferUav => vk::DescriptorType::STORAGE_BUFFER,
        DescriptorType::UniformTexelBufferSrv => vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
        DescriptorType::StorageTexelBufferUav => vk::DescriptorType::STORAGE_TEXEL_BUFFER,
        DescriptorType::TextureSrv => vk::DescriptorType::SAMPLED_IMAGE,
        DescriptorType::TextureUav => vk::DescriptorType::STORAGE_IMAGE,
    }
}

pub fn topology(topology: PrimitiveTopology) -> vk::PrimitiveTopology {
    match topology {
        PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
        PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
        PrimitiveTopology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
        PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
        PrimitiveTopology::PatchList => vk::PrimitiveTopology::PATCH_LIST,
    }
}

pub fn cull_mode(mode: CullMode) -> vk::CullModeFlags {
    match mode {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Back => vk::CullModeFlags::BACK,
        CullMode::Front => vk::CullModeFlags::FRONT,
        CullMode::Both => vk::CullModeFlags::FRONT_AND_BACK,
    }
}

pub fn front_face(face: FrontFace) -> vk::FrontFace {
    match face {
        FrontFace::CounterClockwise => vk::FrontFace::COUNTER_CLOCKWISE,
        FrontFace::Clockwise => vk::FrontFace::CLOCKWISE,
    }
}

pub fn domain_origin(origin: TessellationDomainOrigin) -> vk::TessellationDomainOrigin {
    match origin {
        TessellationDomainOrigin::UpperLeft => vk::TessellationDomainOrigin::UPPER_LEFT,
        TessellationDomainOrigin::LowerLeft => vk::TessellationDomainOrigin::LOWER_LEFT,
    }
}

pub fn blend_attachment(mode: BlendMode) -> vk::PipelineColorBlendAttachmentState {
    let base = vk::PipelineColorBlendAttachmentState::builder().color_write_mask(vk::ColorComponentFlags::RGBA);
    match mode {
        BlendMode::Opaque => base.blend_enable(false).build(),
        BlendMode::Alpha => base
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD)
            .build(),
        BlendMode::Additive => base
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::ONE)
            .dst_color_blend_factor(vk::BlendFactor::ONE)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE)
            .alpha_blend_op(vk::BlendOp::ADD)
            .build(),
    }
}

pub fn index_type(ty: IndexType) -> vk::IndexType {
    match ty {
        IndexType::Uint16 => vk::IndexType::UINT16,
        IndexType::Uint32 => vk::IndexType::UINT32,
    }
}

pub fn filter(filter: Filter) -> vk::Filter {
    match filter {
        Filter::Nearest => vk::Filter::NEAREST,
        Filter::Linear => vk::Filter::LINEAR,
    }
}

pub fn mipmap_mode(filter: Filter) -> vk::SamplerMipmapMode {
    match filter {
        Filter::Nearest => vk::SamplerMipmapMode::NEAREST,
        Filter::Linear => vk::SamplerMipmapMode::LINEAR,
    }
}

pub fn address_mode(mode: AddressMode) -> vk::SamplerAddressMode {
    match mode {
        AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
        AddressMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        AddressMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
    }
}

pub fn memory_location(location: crate::types::MemoryLocation) -> gpu_allocator::MemoryLocation {
    match location {
        crate::types::MemoryLocation::GpuOnly => gpu_allocator::MemoryLocation::GpuOnly,
        crate::types::MemoryLocation::CpuToGpu => gpu_allocator::MemoryLocation::CpuToGpu,
        crate::types::MemoryLocation::GpuToCpu => gpu_allocator::MemoryLocation::GpuToCpu,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_format_round_trips() {
        for f in Format::ALL {
            assert_eq!(format_from_vk(format(f)), Some(f), "{}", f);
        }
    }

    #[test]
    fn depth_formats_get_depth_aspects() {
        assert_eq!(aspect_mask(Format::R8G8B8A8Unorm), vk::ImageAspectFlags::COLOR);
        assert_eq!(aspect_mask(Format::D32Float), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            aspect_mask(Format::D24UnormS8Uint),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(aspect_mask(Format::S8Uint), vk::ImageAspectFlags::STENCIL);
    }

    #[test]
    fn storage_states_share_general_layout() {
        assert_eq!(image_layout(ResourceState::StorageImage), vk::ImageLayout::GENERAL);
        assert_eq!(image_layout(ResourceState::General), vk::ImageLayout::GENERAL);
        assert_eq!(image_layout(ResourceState::Present), vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn both_storage_buffer_usages_map_to_storage_buffer() {
        assert_eq!(buffer_usage(BufferUsage::STORAGE_SRV), vk::BufferUsageFlags::STORAGE_BUFFER);
        assert_eq!(
            buffer_usage(BufferUsage::STORAGE_UAV | BufferUsage::TRANSFER_DST),
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
        );
    }
}
