// Buffer and texture data paths on the headless backend

mod common;

use common::headless_renderer;
use tiny_renderer::api;
use tiny_renderer::{
    AddressMode, BufferUsage, DescriptorBinding, DescriptorType, DescriptorUpdate, Filter, Format, QueueKind,
    ResourceState, SamplerDesc, ShaderStages, TextureType, TextureUsage,
};

#[test]
fn host_visible_buffer_round_trips() {
    let (renderer, log) = headless_renderer(16, 16, 2);
    let buffer = api::create_buffer(&renderer, BufferUsage::STORAGE_SRV, 64, true).unwrap();
    assert!(buffer.is_host_visible());

    let data: Vec<u8> = (0..64).collect();
    api::util_update_buffer(&renderer, &buffer, &data).unwrap();
    assert_eq!(api::util_read_buffer(&renderer, &buffer).unwrap(), data);
    assert!(log.errors().is_empty(), "{:?}", log.errors());
}

#[test]
fn device_local_buffer_is_staged_both_ways() {
    let (renderer, log) = headless_renderer(16, 16, 2);
    let buffer = api::create_buffer(
        &renderer,
        BufferUsage::VERTEX | BufferUsage::TRANSFER_DST | BufferUsage::TRANSFER_SRC,
        32,
        false,
    )
    .unwrap();
    assert!(buffer.mapped_ptr().is_none());

    let data: Vec<u8> = (100..132).collect();
    api::util_update_buffer(&renderer, &buffer, &data).unwrap();
    assert_eq!(buffer.state(), ResourceState::TransferDst);
    assert_eq!(api::util_read_buffer(&renderer, &buffer).unwrap(), data);
    // returned to the state it was in before the readback
    assert_eq!(buffer.state(), ResourceState::TransferDst);

    assert!(renderer.violations().is_empty(), "{:?}", renderer.violations());
    assert!(log.errors().is_empty(), "{:?}", log.errors());
}

#[test]
fn copy_buffer_to_buffer_moves_the_requested_range() {
    let (renderer, log) = headless_renderer(16, 16, 2);
    let src = api::create_buffer(&renderer, BufferUsage::TRANSFER_SRC, 16, true).unwrap();
    let dst = api::create_buffer(&renderer, BufferUsage::TRANSFER_DST | BufferUsage::TRANSFER_SRC, 16, false).unwrap();
    let bytes: Vec<u8> = (1..=16).collect();
    src.write(0, &bytes).unwrap();

    let pool = api::create_cmd_pool(&renderer, QueueKind::Graphics).unwrap();
    let mut cmd = api::create_cmd(&pool).unwrap();
    api::begin_cmd(&mut cmd).unwrap();
    api::cmd_buffer_transition(&mut cmd, &src, ResourceState::Undefined, ResourceState::TransferSrc);
    api::cmd_buffer_transition(&mut cmd, &dst, ResourceState::Undefined, ResourceState::TransferDst);
    api::cmd_copy_buffer_to_buffer(&mut cmd, &src, 4, &dst, 8, 8);
    api::end_cmd(&mut cmd).unwrap();
    api::queue_submit(&renderer, &mut [&mut cmd], &[], &[]).unwrap();
    api::queue_wait_idle(&renderer).unwrap();

    let out = api::util_read_buffer(&renderer, &dst).unwrap();
    assert_eq!(&out[8..16], &bytes[4..12]);
    assert!(out[..8].iter().all(|&b| b == 0));
    assert!(renderer.violations().is_empty(), "{:?}", renderer.violations());
    assert!(log.errors().is_empty(), "{:?}", log.errors());
}

#[test]
fn uniform_buffers_are_padded_to_the_device_alignment() {
    let (renderer, _log) = headless_renderer(16, 16, 2);
    let buffer = api::create_uniform_buffer(&renderer, 10, true).unwrap();
    let alignment = renderer.device().limits().uniform_buffer_alignment;
    assert_eq!(buffer.size() % alignment, 0);
    assert!(buffer.size() >= 10);
}

#[test]
fn rgb_pixels_upload_into_rgba_texture_with_opaque_alpha() {
    let (renderer, log) = headless_renderer(16, 16, 2);
    let texture = api::create_texture_2d(
        &renderer,
        2,
        2,
        1,
        Format::R8G8B8A8Unorm,
        1,
        None,
        TextureUsage::SAMPLED_IMAGE | TextureUsage::TRANSFER_DST | TextureUsage::TRANSFER_SRC,
        false,
        ResourceState::Undefined,
    )
    .unwrap();

    // rows are 6 bytes of pixels plus 2 bytes of padding
    let pixels = [
        1, 2, 3, 4, 5, 6, 0, 0, //
        7, 8, 9, 10, 11, 12, 0, 0,
    ];
    api::util_update_texture_uint8(&renderer, &texture, 2, 2, 8, &pixels, 3).unwrap();
    assert_eq!(texture.state(), ResourceState::SampledImage);

    let out = api::util_read_texture(&renderer, &texture).unwrap();
    assert_eq!(out, vec![1, 2, 3, 255, 4, 5, 6, 255, 7, 8, 9, 255, 10, 11, 12, 255]);
    assert_eq!(texture.state(), ResourceState::SampledImage);

    assert!(renderer.violations().is_empty(), "{:?}", renderer.violations());
    assert!(log.errors().is_empty(), "{:?}", log.errors());
}

#[test]
fn bgra_textures_store_swizzled_texels() {
    let (renderer, _log) = headless_renderer(16, 16, 2);
    let texture = api::create_texture_2d(
        &renderer,
        1,
        1,
        1,
        Format::B8G8R8A8Unorm,
        1,
        None,
        TextureUsage::TRANSFER_DST | TextureUsage::TRANSFER_SRC,
        false,
        ResourceState::Undefined,
    )
    .unwrap();

    api::util_update_texture_uint8(&renderer, &texture, 1, 1, 4, &[10, 20, 30, 40], 4).unwrap();
    assert_eq!(texture.state(), ResourceState::TransferDst);
    assert_eq!(api::util_read_texture(&renderer, &texture).unwrap(), vec![30, 20, 10, 40]);
}

#[test]
fn texture_upload_rejects_mismatched_sources() {
    let (renderer, _log) = headless_renderer(16, 16, 2);
    let texture = api::create_texture_2d(
        &renderer,
        4,
        4,
        1,
        Format::R8G8B8A8Unorm,
        1,
        None,
        TextureUsage::SAMPLED_IMAGE | TextureUsage::TRANSFER_DST,
        false,
        ResourceState::Undefined,
    )
    .unwrap();

    assert!(api::util_update_texture_uint8(&renderer, &texture, 2, 2, 8, &[0; 16], 4).is_err());
    assert!(api::util_update_texture_uint8(&renderer, &texture, 4, 4, 16, &[0; 8], 4).is_err());
    assert!(api::util_update_texture_uint8(&renderer, &texture, 4, 4, 16, &[0; 64], 5).is_err());

    let float_texture = api::create_texture_2d(
        &renderer,
        4,
        4,
        1,
        Format::R32Float,
        1,
        None,
        TextureUsage::TRANSFER_DST,
        false,
        ResourceState::Undefined,
    )
    .unwrap();
    assert!(api::util_update_texture_uint8(&renderer, &float_texture, 4, 4, 4, &[0; 16], 1).is_err());
}

#[test]
fn format_helpers_report_strides_and_channels() {
    assert_eq!(api::util_format_stride(Format::R8G8B8A8Unorm), 4);
    assert_eq!(api::util_format_stride(Format::R32G32B32Float), 12);
    assert_eq!(api::util_format_channel_count(Format::R16G16Float), 2);
}

#[test]
fn one_and_three_dimensional_textures_take_their_initial_state() {
    let (renderer, log) = headless_renderer(16, 16, 2);
    let line = api::create_texture_1d(
        &renderer,
        32,
        Format::R8G8B8A8Unorm,
        1,
        TextureUsage::SAMPLED_IMAGE,
        false,
        ResourceState::SampledImage,
    )
    .unwrap();
    assert_eq!(line.desc().texture_type, TextureType::Tex1D);
    assert_eq!((line.width(), line.height()), (32, 1));
    assert_eq!(line.state(), ResourceState::SampledImage);

    let volume = api::create_texture_3d(
        &renderer,
        8,
        8,
        4,
        Format::R8G8B8A8Unorm,
        2,
        TextureUsage::SAMPLED_IMAGE | TextureUsage::STORAGE_IMAGE,
        false,
        ResourceState::StorageImage,
    )
    .unwrap();
    assert_eq!(volume.desc().texture_type, TextureType::Tex3D);
    assert_eq!(volume.desc().depth, 4);
    assert_eq!(volume.desc().mip_levels, 2);
    assert_eq!(
        renderer.headless().unwrap().texture_state(volume.key()),
        Some(ResourceState::StorageImage)
    );
    assert!(renderer.violations().is_empty(), "{:?}", renderer.violations());
    assert!(log.errors().is_empty(), "{:?}", log.errors());
}

#[test]
fn samplers_and_textures_fill_their_slots() {
    let (renderer, _log) = headless_renderer(16, 16, 2);
    let sampler = api::create_sampler(
        &renderer,
        SamplerDesc {
            mag_filter: Filter::Nearest,
            address_u: AddressMode::ClampToEdge,
            ..SamplerDesc::default()
        },
    )
    .unwrap();
    assert_eq!(sampler.desc().mag_filter, Filter::Nearest);

    let texture = api::create_texture_2d(
        &renderer,
        4,
        4,
        1,
        Format::R8G8B8A8Unorm,
        1,
        None,
        TextureUsage::SAMPLED_IMAGE,
        false,
        ResourceState::SampledImage,
    )
    .unwrap();
    let mut set = api::create_descriptor_set(
        &renderer,
        &[
            DescriptorBinding::new(DescriptorType::TextureSrv, 0, ShaderStages::FRAG),
            DescriptorBinding::new(DescriptorType::Sampler, 1, ShaderStages::FRAG),
        ],
    )
    .unwrap();

    // a sampler in a texture slot is rejected
    assert!(api::update_descriptor_set(&mut set, &[DescriptorUpdate::samplers(0, &[&sampler])]).is_err());
    api::update_descriptor_set(
        &mut set,
        &[DescriptorUpdate::textures(0, &[&texture]), DescriptorUpdate::samplers(1, &[&sampler])],
    )
    .unwrap();
    assert!(set.unwritten_bindings().is_empty());
}

#[test]
fn read_write_structured_buffer_carries_a_counter() {
    let (renderer, _log) = headless_renderer(16, 16, 2);
    let plain = api::create_rw_structured_buffer(&renderer, 1024, 0, 64, 16, false, false, false).unwrap();
    assert!(plain.counter_buffer().is_none());

    let counted = api::create_rw_structured_buffer(&renderer, 1024, 0, 64, 16, false, true, false).unwrap();
    assert!(counted.usage().contains(BufferUsage::STORAGE_SRV | BufferUsage::STORAGE_UAV));
    assert_eq!(counted.desc().element_count, 64);
    assert_eq!(counted.desc().struct_stride, 16);
    let counter = counted.counter_buffer().unwrap();
    assert_eq!(counter.size(), 4);
    assert!(counter.usage().contains(BufferUsage::STORAGE_UAV));
}
